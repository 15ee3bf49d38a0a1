//! One-deep frame handoff between a sensor producer and a worker thread.
//!
//! The producer side never blocks for long: the depth producer gives up
//! after a short timeout and drops the frame so sensor I/O can't stall on a
//! slow consumer. The consumer runs its callback with the buffer held, and
//! the server copies outbound frames from the same buffer under the same
//! exclusion.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

use bytes::Bytes;

struct BufferState {
    data: Vec<u8>,
    timestamp: u32,
    full: bool,
    frames: u64,
    busy_count: u64,
    closed: bool,
}

pub struct FrameBuffer {
    state: Mutex<BufferState>,
    full_cv: Condvar,
    empty_cv: Condvar,
}

impl FrameBuffer {
    pub fn new(size: usize) -> Self {
        Self {
            state: Mutex::new(BufferState {
                data: vec![0u8; size],
                timestamp: 0,
                full: false,
                frames: 0,
                busy_count: 0,
                closed: false,
            }),
            full_cv: Condvar::new(),
            empty_cv: Condvar::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BufferState> {
        self.state.lock().expect("frame buffer lock poisoned")
    }

    /// Copies a frame in for the consumer. With a timeout, an occupied
    /// buffer is given that long to drain and the frame is dropped (counted
    /// as busy) if it doesn't; without one, the producer blocks until the
    /// consumer is done. Returns false if the frame was dropped or the
    /// buffer is closed.
    pub fn produce(&self, frame: &[u8], timestamp: u32, timeout: Option<Duration>) -> bool {
        let mut state = self.lock();

        if state.full && !state.closed {
            match timeout {
                Some(t) => {
                    let (guard, _res) = self
                        .empty_cv
                        .wait_timeout(state, t)
                        .expect("frame buffer lock poisoned");
                    state = guard;
                    if state.full {
                        state.busy_count += 1;
                        return false;
                    }
                }
                None => {
                    while state.full && !state.closed {
                        state = self
                            .empty_cv
                            .wait(state)
                            .expect("frame buffer lock poisoned");
                    }
                }
            }
        }

        if state.closed {
            return false;
        }

        let n = frame.len().min(state.data.len());
        state.data[..n].copy_from_slice(&frame[..n]);
        state.timestamp = timestamp;
        state.frames += 1;
        state.full = true;

        self.full_cv.notify_one();
        true
    }

    /// Waits for a full buffer and runs `f` on it with the buffer held.
    /// Returns false once the buffer has been closed and drained.
    pub fn consume<F: FnOnce(&[u8], u32)>(&self, f: F) -> bool {
        let mut state = self.lock();
        while !state.full {
            if state.closed {
                return false;
            }
            state = self
                .full_cv
                .wait(state)
                .expect("frame buffer lock poisoned");
        }

        f(&state.data, state.timestamp);
        state.full = false;

        self.empty_cv.notify_one();
        true
    }

    /// Copies out the most recent frame contents, whatever their age.
    pub fn snapshot(&self) -> Bytes {
        let state = self.lock();
        Bytes::copy_from_slice(&state.data)
    }

    /// Total frames accepted from the producer.
    pub fn frames(&self) -> u64 {
        self.lock().frames
    }

    /// Frames the producer dropped because the consumer was still busy.
    pub fn busy_count(&self) -> u64 {
        self.lock().busy_count
    }

    /// Unblocks all waiters; subsequent produce/consume calls fail.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        self.full_cv.notify_all();
        self.empty_cv.notify_all();
    }
}
