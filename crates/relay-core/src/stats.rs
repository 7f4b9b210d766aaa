//! Per-entity traffic counters.
//!
//! Listeners, connections and upstream agents each keep a [`NetStat`] and
//! periodically log a one-line summary when traffic flowed recently. The
//! counters are plain atomics so the hot path never takes a lock.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Milliseconds elapsed since the first call in this process.
///
/// A process-relative clock keeps all idle arithmetic monotonic and cheap to
/// store in an atomic.
pub fn now_ms() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_millis() as u64
}

/// Send/receive counters with last-activity timestamps.
#[derive(Debug, Default)]
pub struct NetStat {
    sent_packets: AtomicU64,
    sent_bytes: AtomicU64,
    sent_ms: AtomicU64,
    recv_packets: AtomicU64,
    recv_bytes: AtomicU64,
    recv_ms: AtomicU64,
}

impl NetStat {
    pub fn new() -> Self {
        let now = now_ms();
        let stat = NetStat::default();
        stat.sent_ms.store(now, Ordering::Relaxed);
        stat.recv_ms.store(now, Ordering::Relaxed);
        stat
    }

    pub fn update_sent(&self, bytes: usize) {
        self.sent_packets.fetch_add(1, Ordering::Relaxed);
        self.sent_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.sent_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub fn update_recv(&self, bytes: usize) {
        self.recv_packets.fetch_add(1, Ordering::Relaxed);
        self.recv_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.recv_ms.store(now_ms(), Ordering::Relaxed);
    }

    /// True when neither direction saw traffic within `timeout`.
    pub fn idle(&self, timeout: Duration) -> bool {
        let now = now_ms();
        let timeout = timeout.as_millis() as u64;
        now >= self.sent_ms.load(Ordering::Relaxed) + timeout
            && now >= self.recv_ms.load(Ordering::Relaxed) + timeout
    }
}

impl fmt::Display for NetStat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sent:{}/{} recv:{}/{}",
            self.sent_packets.load(Ordering::Relaxed),
            self.sent_bytes.load(Ordering::Relaxed),
            self.recv_packets.load(Ordering::Relaxed),
            self.recv_bytes.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stat = NetStat::new();
        stat.update_sent(100);
        stat.update_sent(50);
        stat.update_recv(7);
        assert_eq!(stat.to_string(), "sent:2/150 recv:1/7");
    }

    #[test]
    fn fresh_stat_is_not_idle() {
        let stat = NetStat::new();
        assert!(!stat.idle(Duration::from_secs(5)));
        assert!(stat.idle(Duration::ZERO));
    }

    #[test]
    fn one_live_direction_defeats_idle() {
        let stat = NetStat::new();
        std::thread::sleep(Duration::from_millis(30));
        assert!(stat.idle(Duration::from_millis(10)));
        stat.update_recv(1);
        assert!(!stat.idle(Duration::from_millis(10)));
    }
}
