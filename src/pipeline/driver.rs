//! Sensor driver seam.
//!
//! The daemon never talks to camera hardware directly; it drives a
//! [`SensorDriver`] for control (event pump, LED, tilt, video gating) and
//! receives frames over plain channels. A userspace depth-camera driver
//! (e.g. a `freedepth`-style streamer handing out depth/video receivers)
//! plugs in behind this trait at the orchestrator boundary. The built-in
//! synthetic backend keeps the daemon and its tests runnable without
//! hardware: it produces out-of-range depth and flat gray video at camera
//! rate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::{DEPTH_SIZE, VIDEO_SIZE};

/// Motor LED colors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Led {
    Green,
    Yellow,
    Red,
    Off,
}

/// One frame as delivered by the sensor.
pub struct SensorFrame {
    pub data: Vec<u8>,
    /// Sensor timestamp, driver-defined units.
    pub timestamp: u32,
}

/// Frame delivery channels handed out once at open time.
pub struct SensorStreams {
    pub depth: Receiver<SensorFrame>,
    pub video: Receiver<SensorFrame>,
}

/// Control surface of an open sensor. Frame delivery is out-of-band through
/// [`SensorStreams`].
pub trait SensorDriver: Send {
    /// Runs one iteration of driver event processing. May block briefly.
    fn poll(&mut self) -> Result<()>;

    /// Starts or stops the color stream.
    fn set_video_streaming(&mut self, on: bool) -> Result<()>;

    /// Applies an LED color. Drivers without an LED ignore this.
    fn set_led(&mut self, led: Led) -> Result<()>;

    /// Tilts the camera, in degrees from horizontal. Drivers without a
    /// motor ignore this.
    fn set_tilt(&mut self, degrees: i32) -> Result<()>;

    /// Asks the driver to stop delivering frames and release the device.
    fn shutdown(&mut self);
}

// ---------------------------------------------------------------------------
// Synthetic sensor
// ---------------------------------------------------------------------------

/// Frame period of the synthetic sensor (~30 fps).
const SYNTH_FRAME_PERIOD: Duration = Duration::from_millis(33);

struct SynthShared {
    stop: AtomicBool,
    video_on: AtomicBool,
}

pub struct SynthDriver {
    shared: Arc<SynthShared>,
    generator: Option<JoinHandle<()>>,
    led: Led,
    tilt: i32,
}

/// Opens the synthetic sensor backend.
pub fn open_synth(device: usize) -> Result<(Box<dyn SensorDriver>, SensorStreams)> {
    if device != 0 {
        return Err(Error::Sensor(format!(
            "synthetic sensor device {device} does not exist (there is 1 total)"
        )));
    }

    let shared = Arc::new(SynthShared {
        stop: AtomicBool::new(false),
        video_on: AtomicBool::new(false),
    });

    let (depth_tx, depth_rx) = sync_channel::<SensorFrame>(2);
    let (video_tx, video_rx) = sync_channel::<SensorFrame>(2);

    let gen_shared = shared.clone();
    let generator = std::thread::Builder::new()
        .name("synth_sensor".into())
        .spawn(move || {
            let started = Instant::now();
            let mut next = Instant::now();
            while !gen_shared.stop.load(Ordering::Relaxed) {
                next += SYNTH_FRAME_PERIOD;
                let ts = started.elapsed().as_millis() as u32;

                // All samples out of range: 11 bits of ones throughout.
                let depth = SensorFrame { data: vec![0xff; DEPTH_SIZE], timestamp: ts };
                match depth_tx.try_send(depth) {
                    Ok(()) | Err(TrySendError::Full(_)) => {}
                    Err(TrySendError::Disconnected(_)) => break,
                }

                if gen_shared.video_on.load(Ordering::Relaxed) {
                    let video = SensorFrame { data: vec![0x80; VIDEO_SIZE], timestamp: ts };
                    match video_tx.try_send(video) {
                        Ok(()) | Err(TrySendError::Full(_)) => {}
                        Err(TrySendError::Disconnected(_)) => break,
                    }
                }

                let now = Instant::now();
                if next > now {
                    std::thread::sleep(next - now);
                } else {
                    next = now;
                }
            }
        })?;

    let driver = SynthDriver { shared, generator: Some(generator), led: Led::Green, tilt: 0 };
    let streams = SensorStreams { depth: depth_rx, video: video_rx };
    Ok((Box::new(driver), streams))
}

impl SensorDriver for SynthDriver {
    fn poll(&mut self) -> Result<()> {
        // No device events to pump; pace the caller's loop instead.
        std::thread::sleep(Duration::from_millis(10));
        Ok(())
    }

    fn set_video_streaming(&mut self, on: bool) -> Result<()> {
        self.shared.video_on.store(on, Ordering::Relaxed);
        Ok(())
    }

    fn set_led(&mut self, led: Led) -> Result<()> {
        self.led = led;
        Ok(())
    }

    fn set_tilt(&mut self, degrees: i32) -> Result<()> {
        self.tilt = degrees;
        Ok(())
    }

    fn shutdown(&mut self) {
        self.shared.stop.store(true, Ordering::Relaxed);
        if let Some(t) = self.generator.take() {
            let _ = t.join();
        }
    }
}

impl Drop for SynthDriver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synth_delivers_depth_frames() {
        let (mut driver, streams) = open_synth(0).unwrap();
        let frame = streams.depth.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(frame.data.len(), DEPTH_SIZE);
        assert!(frame.data.iter().all(|&b| b == 0xff));
        driver.shutdown();
    }

    #[test]
    fn test_synth_video_gated() {
        let (mut driver, streams) = open_synth(0).unwrap();
        // Video off: nothing arrives.
        assert!(streams.video.recv_timeout(Duration::from_millis(150)).is_err());
        driver.set_video_streaming(true).unwrap();
        let frame = streams.video.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(frame.data.len(), VIDEO_SIZE);
        driver.shutdown();
    }

    #[test]
    fn test_synth_rejects_missing_device() {
        assert!(open_synth(3).is_err());
    }
}
