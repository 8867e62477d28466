//! Analyzer: extracts per-packet features and updates per-flow aggregates.
//!
//! Owned entirely by the single task that calls [`Analyzer::analyze`] - no
//! locking is needed on the flow table because nothing else ever touches it.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::types::{Feature, FlowKey, Packet, Protocol, TcpFlags};

/// Avoids divide-by-zero on a flow's first packet, where `last_ts == first_ts`.
const DURATION_EPSILON_SECS: f32 = 1e-4;

struct FlowEntry {
    first_ts: Instant,
    last_ts: Instant,
    packet_count: u32,
    byte_count: u64,
    syn_count: u32,
    ack_count: u32,
    fin_count: u32,
    rst_count: u32,
    last_flags: TcpFlags,
    saw_syn_fin: bool,
    dst_ports_seen: HashMap<u16, u32>,
    sizes_sum: f64,
    sizes_sum_sq: f64,
}

impl FlowEntry {
    fn new(packet: &Packet) -> Self {
        let mut entry = Self {
            first_ts: Instant::now(),
            last_ts: Instant::now(),
            packet_count: 0,
            byte_count: 0,
            syn_count: 0,
            ack_count: 0,
            fin_count: 0,
            rst_count: 0,
            last_flags: TcpFlags::default(),
            saw_syn_fin: false,
            dst_ports_seen: HashMap::new(),
            sizes_sum: 0.0,
            sizes_sum_sq: 0.0,
        };
        entry.record(packet);
        entry
    }

    fn record(&mut self, packet: &Packet) {
        self.last_ts = Instant::now();
        self.packet_count += 1;
        self.byte_count += packet.size as u64;
        self.last_flags = packet.flags;
        if packet.protocol == Protocol::Tcp {
            if packet.flags.syn() {
                self.syn_count += 1;
            }
            if packet.flags.ack() {
                self.ack_count += 1;
            }
            if packet.flags.fin() {
                self.fin_count += 1;
            }
            if packet.flags.rst() {
                self.rst_count += 1;
            }
            if packet.flags.is_syn_fin() {
                self.saw_syn_fin = true;
            }
        }
        if let Some(port) = packet.dst_port {
            *self.dst_ports_seen.entry(port).or_insert(0) += 1;
        }
        let size = packet.size as f64;
        self.sizes_sum += size;
        self.sizes_sum_sq += size * size;
    }

    fn port_entropy(&self) -> f32 {
        if self.dst_ports_seen.len() <= 1 {
            return 0.0;
        }
        let total: u32 = self.dst_ports_seen.values().sum();
        if total == 0 {
            return 0.0;
        }
        -self
            .dst_ports_seen
            .values()
            .filter(|&&c| c > 0)
            .map(|&c| {
                let p = c as f32 / total as f32;
                p * p.log2()
            })
            .sum::<f32>()
    }

    fn size_variance(&self) -> f32 {
        let n = self.packet_count as f64;
        if n <= 1.0 {
            return 0.0;
        }
        let mean = self.sizes_sum / n;
        ((self.sizes_sum_sq / n) - mean * mean).max(0.0) as f32
    }

    fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        now.duration_since(self.last_ts) > timeout
    }
}

/// Extracts features per packet and maintains the flow table that backs
/// those features.
pub struct Analyzer {
    flows: HashMap<FlowKey, FlowEntry>,
    flow_idle_timeout: Duration,
    last_sweep: Instant,
}

impl Analyzer {
    pub fn new(flow_idle_timeout: Duration) -> Self {
        Self {
            flows: HashMap::new(),
            flow_idle_timeout,
            last_sweep: Instant::now(),
        }
    }

    /// Returns `None` for L4 protocols other than TCP/UDP - the core
    /// ignores everything else for feature purposes, though capture still
    /// classifies it for stats.
    pub fn analyze(&mut self, packet: &Packet) -> Option<Feature> {
        if !matches!(packet.protocol, Protocol::Tcp | Protocol::Udp) {
            return None;
        }

        self.maybe_sweep_idle_flows();

        let key = FlowKey {
            src_ip: packet.src_ip,
            dst_ip: packet.dst_ip,
            src_port: packet.src_port.unwrap_or(0),
            dst_port: packet.dst_port.unwrap_or(0),
            protocol: packet.protocol,
        };

        let entry = self
            .flows
            .entry(key.clone())
            .and_modify(|e| e.record(packet))
            .or_insert_with(|| FlowEntry::new(packet));

        let duration_secs = entry
            .last_ts
            .duration_since(entry.first_ts)
            .as_secs_f32()
            .max(DURATION_EPSILON_SECS);

        Some(Feature {
            flow_key_display: key.to_string(),
            src_ip: key.src_ip,
            dst_ip: key.dst_ip,
            src_port: key.src_port,
            dst_port: key.dst_port,
            protocol: key.protocol,
            duration_secs,
            packet_count: entry.packet_count,
            byte_count: entry.byte_count,
            packets_per_second: entry.packet_count as f32 / duration_secs,
            bytes_per_second: entry.byte_count as f32 / duration_secs,
            avg_packet_size: entry.byte_count as f32 / entry.packet_count as f32,
            port_entropy: entry.port_entropy(),
            packet_size_variance: entry.size_variance(),
            syn_count: entry.syn_count,
            ack_count: entry.ack_count,
            fin_count: entry.fin_count,
            rst_count: entry.rst_count,
            last_flags: entry.last_flags,
            saw_syn_fin: entry.saw_syn_fin,
        })
    }

    pub fn active_flow_count(&self) -> usize {
        self.flows.len()
    }

    /// Sweeps idle flows at most once per quarter of the idle timeout,
    /// since this runs inline on the hot path rather than on its own timer.
    fn maybe_sweep_idle_flows(&mut self) {
        let now = Instant::now();
        if now.duration_since(self.last_sweep) < self.flow_idle_timeout / 4 {
            return;
        }
        self.last_sweep = now;
        let timeout = self.flow_idle_timeout;
        let before = self.flows.len();
        self.flows.retain(|_, entry| !entry.is_idle(now, timeout));
        let evicted = before - self.flows.len();
        if evicted > 0 {
            debug!(evicted, remaining = self.flows.len(), "evicted idle flows");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn tcp_packet(src_port: u16, dst_port: u16, flags: u8) -> Packet {
        Packet {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            src_ip: "10.0.0.5".parse().unwrap(),
            dst_ip: "10.0.0.1".parse().unwrap(),
            src_port: Some(src_port),
            dst_port: Some(dst_port),
            protocol: Protocol::Tcp,
            size: 64,
            flags: TcpFlags::from_bits(flags),
        }
    }

    #[test]
    fn non_tcp_udp_protocol_yields_no_feature() {
        let mut analyzer = Analyzer::new(Duration::from_secs(60));
        let packet = Packet {
            protocol: Protocol::Other(1),
            ..tcp_packet(1, 2, TcpFlags::SYN)
        };
        assert!(analyzer.analyze(&packet).is_none());
    }

    #[test]
    fn first_packet_of_a_flow_never_divides_by_zero() {
        let mut analyzer = Analyzer::new(Duration::from_secs(60));
        let feature = analyzer.analyze(&tcp_packet(1000, 80, TcpFlags::SYN)).unwrap();
        assert!(feature.duration_secs >= DURATION_EPSILON_SECS);
        assert!(feature.packets_per_second.is_finite());
    }

    #[test]
    fn packet_count_is_monotonic_for_a_flow() {
        let mut analyzer = Analyzer::new(Duration::from_secs(60));
        let a = analyzer.analyze(&tcp_packet(1000, 80, TcpFlags::SYN)).unwrap();
        let b = analyzer
            .analyze(&tcp_packet(1000, 80, TcpFlags::SYN | TcpFlags::ACK))
            .unwrap();
        assert!(b.packet_count >= a.packet_count);
    }

    #[test]
    fn distinct_flows_are_tracked_independently() {
        let mut analyzer = Analyzer::new(Duration::from_secs(60));
        analyzer.analyze(&tcp_packet(1000, 80, TcpFlags::SYN));
        analyzer.analyze(&tcp_packet(1001, 443, TcpFlags::SYN));
        assert_eq!(analyzer.active_flow_count(), 2);
    }
}
