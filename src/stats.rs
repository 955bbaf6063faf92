//! Shared counters: reassembly statistics and named histograms.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

/// Aggregate reassembly statistics, updated concurrently by workers,
/// connections and the drain pool.
#[derive(Debug, Default)]
pub struct ReassemblyStats {
    pub missed_bytes: AtomicU64,
    pub packets: AtomicU64,
    pub reassembled_bytes: AtomicU64,
    pub total_tcp_bytes: AtomicU64,
    pub reassembled_chunks: AtomicU64,
    pub rejected_fsm: AtomicU64,
    pub rejected_options: AtomicU64,
    pub rejected_conn_fsm: AtomicU64,
    pub out_of_order_packets: AtomicU64,
    pub out_of_order_bytes: AtomicU64,
    pub biggest_chunk_packets: AtomicU64,
    pub biggest_chunk_bytes: AtomicU64,
    pub overlap_packets: AtomicU64,
    pub overlap_bytes: AtomicU64,
    pub saved_tcp_connections: AtomicU64,
    pub saved_udp_connections: AtomicU64,
    pub decoded_conversations: AtomicU64,
    pub dropped_after_close: AtomicU64,
}

impl ReassemblyStats {
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn max(counter: &AtomicU64, n: u64) {
        counter.fetch_max(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            missed_bytes: load(&self.missed_bytes),
            packets: load(&self.packets),
            reassembled_bytes: load(&self.reassembled_bytes),
            total_tcp_bytes: load(&self.total_tcp_bytes),
            reassembled_chunks: load(&self.reassembled_chunks),
            rejected_fsm: load(&self.rejected_fsm),
            rejected_options: load(&self.rejected_options),
            rejected_conn_fsm: load(&self.rejected_conn_fsm),
            out_of_order_packets: load(&self.out_of_order_packets),
            out_of_order_bytes: load(&self.out_of_order_bytes),
            biggest_chunk_packets: load(&self.biggest_chunk_packets),
            biggest_chunk_bytes: load(&self.biggest_chunk_bytes),
            overlap_packets: load(&self.overlap_packets),
            overlap_bytes: load(&self.overlap_bytes),
            saved_tcp_connections: load(&self.saved_tcp_connections),
            saved_udp_connections: load(&self.saved_udp_connections),
            decoded_conversations: load(&self.decoded_conversations),
            dropped_after_close: load(&self.dropped_after_close),
        }
    }
}

/// Point-in-time copy of [`ReassemblyStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub missed_bytes: u64,
    pub packets: u64,
    pub reassembled_bytes: u64,
    pub total_tcp_bytes: u64,
    pub reassembled_chunks: u64,
    pub rejected_fsm: u64,
    pub rejected_options: u64,
    pub rejected_conn_fsm: u64,
    pub out_of_order_packets: u64,
    pub out_of_order_bytes: u64,
    pub biggest_chunk_packets: u64,
    pub biggest_chunk_bytes: u64,
    pub overlap_packets: u64,
    pub overlap_bytes: u64,
    pub saved_tcp_connections: u64,
    pub saved_udp_connections: u64,
    pub decoded_conversations: u64,
    pub dropped_after_close: u64,
}

impl StatsSnapshot {
    fn rows(&self) -> [(&'static str, u64); 18] {
        [
            ("missed bytes", self.missed_bytes),
            ("total packets", self.packets),
            ("rejected FSM", self.rejected_fsm),
            ("rejected options", self.rejected_options),
            ("reassembled bytes", self.reassembled_bytes),
            ("total TCP bytes", self.total_tcp_bytes),
            ("connections rejected FSM", self.rejected_conn_fsm),
            ("reassembled chunks", self.reassembled_chunks),
            ("out-of-order packets", self.out_of_order_packets),
            ("out-of-order bytes", self.out_of_order_bytes),
            ("biggest chunk packets", self.biggest_chunk_packets),
            ("biggest chunk bytes", self.biggest_chunk_bytes),
            ("overlap packets", self.overlap_packets),
            ("overlap bytes", self.overlap_bytes),
            ("saved TCP conversations", self.saved_tcp_connections),
            ("saved UDP conversations", self.saved_udp_connections),
            ("decoded conversations", self.decoded_conversations),
            ("dropped after close", self.dropped_after_close),
        ]
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:<28} {:>14}", "Reassembly", "Count")?;
        writeln!(f, "{:-<43}", "")?;
        for (name, value) in self.rows() {
            writeln!(f, "{name:<28} {value:>14}")?;
        }
        Ok(())
    }
}

/// Named counters guarded by a mutex (protocol histogram, error map).
#[derive(Debug, Default)]
pub struct CounterMap {
    inner: Mutex<HashMap<String, u64>>,
}

impl CounterMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, name: &str) {
        self.add(name, 1);
    }

    pub fn add(&self, name: &str, n: u64) {
        let mut map = self.inner.lock();
        match map.get_mut(name) {
            Some(count) => *count += n,
            None => {
                map.insert(name.to_string(), n);
            }
        }
    }

    pub fn get(&self, name: &str) -> u64 {
        self.inner.lock().get(name).copied().unwrap_or(0)
    }

    /// Entries sorted by descending count, then name.
    pub fn snapshot(&self) -> Vec<(String, u64)> {
        let mut entries: Vec<_> = self
            .inner
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_counter_map_concurrent() {
        let map = Arc::new(CounterMap::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let map = Arc::clone(&map);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        map.increment("TCP");
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(map.get("TCP"), 4000);
        assert_eq!(map.get("UDP"), 0);
    }

    #[test]
    fn test_snapshot_sorted_by_count() {
        let map = CounterMap::new();
        map.add("UDP", 2);
        map.add("TCP", 5);
        map.add("ARP", 2);
        let snap = map.snapshot();
        assert_eq!(snap[0], ("TCP".to_string(), 5));
        assert_eq!(snap[1].0, "ARP");
        assert_eq!(snap[2].0, "UDP");
    }

    #[test]
    fn test_stats_max_and_snapshot() {
        let stats = ReassemblyStats::default();
        ReassemblyStats::max(&stats.biggest_chunk_bytes, 10);
        ReassemblyStats::max(&stats.biggest_chunk_bytes, 4);
        ReassemblyStats::add(&stats.missed_bytes, 7);
        let snap = stats.snapshot();
        assert_eq!(snap.biggest_chunk_bytes, 10);
        assert_eq!(snap.missed_bytes, 7);
        assert!(snap.to_string().contains("missed bytes"));
    }
}
