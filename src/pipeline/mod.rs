//! Sensor pipeline: frame producers, worker threads, LED and tilt state.
//!
//! Frames arrive from the driver on plain channels. Producer threads copy
//! them into one-deep [`FrameBuffer`]s (dropping depth frames when the
//! worker is still busy), and one worker per stream runs the registered
//! frame hook; the occupancy engine, watchdog kick, and server wakeup are
//! all wired in at the orchestrator boundary. The main thread keeps calling
//! [`Pipeline::do_events`] to pump driver events and apply pending LED,
//! tilt, and video-stream changes.

pub mod buffer;
pub mod driver;

pub use buffer::FrameBuffer;
pub use driver::{Led, SensorDriver, SensorStreams};

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::{DEPTH_SIZE, VIDEO_SIZE};

/// How long the LED shows "depth recently pulled" after a client grabs one.
const DEPTH_LED_HOLD: Duration = Duration::from_secs(2);
/// How long the LED shows "video recently pulled"; dominates the depth hold.
const VIDEO_LED_HOLD: Duration = Duration::from_secs(3);

/// Tilt limits in degrees from horizontal.
pub const TILT_MIN: i32 = -15;
pub const TILT_MAX: i32 = 15;

struct LedState {
    end_depth: Instant,
    end_video: Instant,
    color: Led,
}

/// Control state shared between the pipeline, the server, and persistence.
/// Constructed before the pipeline itself so persistence can restore the
/// tilt early.
pub struct PipelineState {
    tilt: AtomicI32,
    video_requested: AtomicBool,
    stop: AtomicBool,
    led: Mutex<LedState>,
}

impl PipelineState {
    pub fn new() -> Arc<Self> {
        let now = Instant::now();
        Arc::new(Self {
            tilt: AtomicI32::new(0),
            video_requested: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            led: Mutex::new(LedState { end_depth: now, end_video: now, color: Led::Green }),
        })
    }

    /// Currently requested motor tilt in degrees. The motor's actual
    /// position may differ.
    pub fn tilt(&self) -> i32 {
        self.tilt.load(Ordering::Relaxed)
    }

    /// Requests a motor tilt, clamped to the supported range.
    pub fn set_tilt(&self, degrees: i32) {
        self.tilt.store(degrees.clamp(TILT_MIN, TILT_MAX), Ordering::Relaxed);
    }

    /// Asks for color capture; stays set until a frame is delivered, so
    /// back-to-back requests keep the stream up without gaps.
    pub fn request_video(&self) {
        self.video_requested.store(true, Ordering::Relaxed);
    }

    pub fn video_requested(&self) -> bool {
        self.video_requested.load(Ordering::Relaxed)
    }

    fn video_delivered(&self) {
        self.video_requested.store(false, Ordering::Relaxed);
    }

    /// Extends the "depth recently pulled" LED deadline.
    pub fn mark_depth_pull(&self) {
        let mut led = self.led.lock().expect("led lock poisoned");
        led.end_depth = Instant::now() + DEPTH_LED_HOLD;
    }

    /// Extends the "video recently pulled" LED deadline.
    pub fn mark_video_pull(&self) {
        let mut led = self.led.lock().expect("led lock poisoned");
        led.end_video = Instant::now() + VIDEO_LED_HOLD;
    }

    /// Recomputes the LED color from the pull deadlines.
    fn update_led(&self) {
        let mut led = self.led.lock().expect("led lock poisoned");
        let now = Instant::now();
        led.color = if now < led.end_video {
            Led::Red
        } else if now < led.end_depth {
            Led::Yellow
        } else {
            Led::Green
        };
    }

    pub fn led_color(&self) -> Led {
        self.led.lock().expect("led lock poisoned").color
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }
}

/// Callback invoked with each processed frame while the buffer is held.
pub type FrameHook = Box<dyn Fn(&[u8], u32) + Send + 'static>;

pub struct Pipeline {
    pub state: Arc<PipelineState>,
    pub depth: Arc<FrameBuffer>,
    pub video: Arc<FrameBuffer>,
    driver: Box<dyn SensorDriver>,
    last_led: Led,
    last_tilt: i32,
    video_started: bool,
    threads: Vec<JoinHandle<()>>,
}

impl Pipeline {
    /// Spawns producer and worker threads over an opened driver. The frame
    /// buffers are shared with the server, which copies outbound frames from
    /// them. `depth_hook` and `video_hook` run on the worker threads with
    /// the frame buffer held, so keep them brief and mind lock ordering.
    pub fn start(
        mut driver: Box<dyn SensorDriver>,
        streams: SensorStreams,
        state: Arc<PipelineState>,
        depth: Arc<FrameBuffer>,
        video: Arc<FrameBuffer>,
        depth_hook: FrameHook,
        video_hook: FrameHook,
    ) -> Result<Pipeline> {
        let mut threads = Vec::new();

        let last_tilt = state.tilt();
        driver
            .set_tilt(last_tilt)
            .map_err(|e| Error::Sensor(format!("initial tilt: {e}")))?;

        // Depth producer: copy in with a short grace period, drop when busy.
        {
            let buf = depth.clone();
            let st = state.clone();
            let rx = streams.depth;
            threads.push(std::thread::Builder::new().name("depth_producer".into()).spawn(
                move || {
                    while !st.stopped() {
                        match rx.recv_timeout(Duration::from_millis(100)) {
                            Ok(frame) => {
                                buf.produce(
                                    &frame.data,
                                    frame.timestamp,
                                    Some(Duration::from_millis(1)),
                                );
                            }
                            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
                            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
                        }
                    }
                },
            )?);
        }

        // Video producer: untimed handoff; clears the request flag so the
        // event loop can stop the stream once the last request is answered.
        {
            let buf = video.clone();
            let st = state.clone();
            let rx = streams.video;
            threads.push(std::thread::Builder::new().name("video_producer".into()).spawn(
                move || {
                    while !st.stopped() {
                        match rx.recv_timeout(Duration::from_millis(100)) {
                            Ok(frame) => {
                                buf.produce(&frame.data, frame.timestamp, None);
                                st.video_delivered();
                            }
                            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
                            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
                        }
                    }
                },
            )?);
        }

        // Depth worker: single point of entry into the occupancy engine.
        {
            let buf = depth.clone();
            let st = state.clone();
            threads.push(std::thread::Builder::new().name("depth_worker".into()).spawn(
                move || {
                    tracing::info!("Depth thread started.");
                    let mut frames = 0u64;
                    while buf.consume(|data, ts| {
                        frames += 1;
                        if frames == 1 {
                            tracing::info!("Received first depth frame.");
                        }
                        depth_hook(data, ts);
                    }) {
                        st.update_led();
                        if st.stopped() {
                            break;
                        }
                    }
                    tracing::info!("Depth thread exiting.");
                },
            )?);
        }

        // Video worker.
        {
            let buf = video.clone();
            let st = state.clone();
            threads.push(std::thread::Builder::new().name("video_worker".into()).spawn(
                move || {
                    tracing::info!("Video thread started.");
                    let mut frames = 0u64;
                    while buf.consume(|data, ts| {
                        frames += 1;
                        if frames == 1 {
                            tracing::info!("Received first video frame.");
                        }
                        video_hook(data, ts);
                    }) {
                        if st.stopped() {
                            break;
                        }
                    }
                    tracing::info!("Video thread exiting.");
                },
            )?);
        }

        Ok(Pipeline {
            state,
            depth,
            video,
            driver,
            last_led: Led::Green,
            last_tilt,
            video_started: false,
            threads,
        })
    }

    /// Runs one iteration of driver event processing, then applies pending
    /// LED, tilt, and video-stream changes. A driver poll failure is fatal
    /// by policy; control-surface failures are logged and retried next tick.
    pub fn do_events(&mut self) -> Result<()> {
        self.driver.poll()?;

        let led = self.state.led_color();
        if led != self.last_led {
            match self.driver.set_led(led) {
                Ok(()) => self.last_led = led,
                Err(e) => tracing::warn!("Error setting LED: {e}"),
            }
        }

        let tilt = self.state.tilt();
        if tilt != self.last_tilt {
            match self.driver.set_tilt(tilt) {
                Ok(()) => self.last_tilt = tilt,
                Err(e) => tracing::warn!("Error setting tilt: {e}"),
            }
        }

        let requested = self.state.video_requested();
        if requested && !self.video_started {
            match self.driver.set_video_streaming(true) {
                Ok(()) => self.video_started = true,
                Err(e) => tracing::error!("Error starting video processing: {e}"),
            }
        } else if self.video_started && !requested {
            match self.driver.set_video_streaming(false) {
                Ok(()) => self.video_started = false,
                Err(e) => tracing::error!("Error stopping video processing: {e}"),
            }
        }

        Ok(())
    }

    /// Stops workers and the driver, then joins all pipeline threads.
    pub fn stop(&mut self) {
        self.state.stop.store(true, Ordering::Relaxed);
        let _ = self.driver.set_led(Led::Off);
        self.driver.shutdown();
        self.depth.close();
        self.video.close();
        for t in self.threads.drain(..) {
            let _ = t.join();
        }
        let busy = self.depth.busy_count();
        if busy > 0 {
            tracing::info!(
                "Dropped {} depth frame(s) while the worker was busy.",
                busy
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Frame rate tracking
// ---------------------------------------------------------------------------

struct FpsWindow {
    frames: i32,
    last: Instant,
    next: Instant,
}

/// Integer frame-rate counter recomputed over ~200 ms windows.
pub struct FpsCounter {
    window: Mutex<FpsWindow>,
    fps: AtomicI32,
}

impl FpsCounter {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            window: Mutex::new(FpsWindow {
                frames: 0,
                last: now,
                next: now + Duration::from_millis(500),
            }),
            fps: AtomicI32::new(0),
        }
    }

    /// Counts one processed frame and refreshes the published rate when the
    /// window has elapsed. 100x scaling keeps the math integral.
    pub fn tick(&self) {
        let mut w = self.window.lock().expect("fps lock poisoned");
        w.frames += 1;
        let now = Instant::now();
        if now > w.next {
            let centis = (now - w.last).as_millis() as i32 / 10;
            if centis > 0 {
                self.fps.store(w.frames * 100 / centis, Ordering::Relaxed);
            }
            w.last = now;
            w.next = now + Duration::from_millis(200);
            w.frames = 0;
        }
    }

    pub fn fps(&self) -> i32 {
        self.fps.load(Ordering::Relaxed)
    }
}

impl Default for FpsCounter {
    fn default() -> Self {
        Self::new()
    }
}
