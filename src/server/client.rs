//! Per-connection client state.
//!
//! Each client owns an unbounded outbound queue drained by its writer task.
//! Command acknowledgements are enqueued by the client's own reader task,
//! broadcasts by whichever task originated them; per-client ordering of
//! acknowledgements is preserved because they share one producer. A
//! `Shutdown` entry queued after pending data half-closes the socket only
//! once everything before it has been written.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::zone::Zone;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Subscription flags and shutdown bookkeeping.
#[derive(Default)]
pub(crate) struct Subs {
    /// Subscribed to global zone updates.
    pub global: bool,
    /// Subscribed to raw depth data.
    pub depth: bool,
    /// One-shot zone brightness pending.
    pub bright: bool,
    /// One-shot raw video frame pending.
    pub video: bool,
    /// Depth frames remaining before auto-unsubscribe (<= 0 means forever).
    pub depth_limit: i32,
    pub shutdown_requested: bool,
}

pub(crate) enum Outbound {
    Data(Bytes),
    /// Half-close the socket after draining everything queued before this.
    Shutdown,
}

pub(crate) struct Client {
    pub id: u64,
    /// Rendered remote address (dotted quad for IPv4-mapped peers).
    pub addr: String,
    pub port: u16,
    pub subs: Mutex<Subs>,
    out: mpsc::UnboundedSender<Outbound>,
}

impl Client {
    pub fn new(addr: String, port: u16) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (out, rx) = mpsc::unbounded_channel();
        let client = Client {
            id: NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed),
            addr,
            port,
            subs: Mutex::new(Subs::default()),
            out,
        };
        (client, rx)
    }

    pub fn subs(&self) -> std::sync::MutexGuard<'_, Subs> {
        self.subs.lock().expect("client subs lock poisoned")
    }

    /// Queues text for transmission. Errors (writer gone) are ignored; the
    /// reader task notices the dead socket and unlinks the client.
    pub fn send_str(&self, s: impl Into<String>) {
        let _ = self.out.send(Outbound::Data(Bytes::from(s.into().into_bytes())));
    }

    /// Queues a binary blob for transmission.
    pub fn send_bytes(&self, b: Bytes) {
        let _ = self.out.send(Outbound::Data(b));
    }

    /// Queues a shutdown after the write buffer drains.
    pub fn request_shutdown(&self) {
        self.subs().shutdown_requested = true;
        let _ = self.out.send(Outbound::Shutdown);
    }
}

/// Sends information about the given zone as a single line of key-value
/// pairs. A full line carries every attribute; the short form (used for
/// periodic updates of structurally unchanged zones) starts at `occupied=`.
/// The reported occupied value folds in the zone's negate flag.
pub(crate) fn format_zone_info(zone: &Zone, full: bool) -> String {
    use std::fmt::Write;

    let mut line = String::new();
    if full {
        let _ = write!(
            line,
            "xmin={} ymin={} zmin={} xmax={} ymax={} zmax={} ",
            zone.xmin, zone.ymin, zone.zmin, zone.xmax, zone.ymax, zone.zmax
        );
        let _ = write!(
            line,
            "px_xmin={} px_ymin={} px_zmin={} px_xmax={} px_ymax={} px_zmax={} ",
            zone.px_xmin, zone.px_ymin, zone.px_zmin, zone.px_xmax, zone.px_ymax, zone.px_zmax
        );
        let _ = write!(
            line,
            "negate={} param={} on_level={} off_level={} on_delay={} off_delay={} ",
            zone.negate as u8,
            zone.param.name(),
            zone.rising_threshold,
            zone.falling_threshold,
            zone.rising_delay,
            zone.falling_delay
        );
    }

    // sa= is an approximation of area that is accurate to 3-4 digits
    let _ = write!(
        line,
        "occupied={} pop={} maxpop={} xc={} yc={} zc={} sa={} name=\"{}\"\n",
        (zone.occupied ^ zone.negate) as u8,
        zone.pop,
        zone.maxpop,
        zone.xc(),
        zone.yc(),
        zone.zc(),
        zone.sa(),
        zone.name
    );

    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_zone_info_shapes() {
        crate::lut::init();
        let mut z = Zone::new("Desk");
        z.xmin = -10;
        z.xmax = 10;
        z.ymin = -10;
        z.ymax = 10;
        z.zmin = 500;
        z.zmax = 700;
        z.recalc_screen_from_world();
        z.update_maxpop();

        let full = format_zone_info(&z, true);
        assert!(full.starts_with("xmin=-10 ymin=-10 zmin=500 "));
        assert!(full.contains("param=pop on_level="));
        assert!(full.ends_with("name=\"Desk\"\n"));

        let short = format_zone_info(&z, false);
        assert!(short.starts_with("occupied=0 pop=0 maxpop="));
        assert!(!short.contains("xmin="));
    }

    #[test]
    fn test_format_zone_info_negate() {
        crate::lut::init();
        let mut z = Zone::new("N");
        z.negate = true;
        z.occupied = true;
        let line = format_zone_info(&z, false);
        // occupied XOR negate: a negated occupied zone reads as 0.
        assert!(line.starts_with("occupied=0 "));
        z.occupied = false;
        let line = format_zone_info(&z, false);
        assert!(line.starts_with("occupied=1 "));
    }
}
