//! Core data types shared across the capture -> analyze -> detect -> enrich -> emit pipeline

use std::collections::HashMap;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Transport-layer protocol of a captured packet.
///
/// Collapses everything that isn't TCP/UDP into `Other` - the analyzer only
/// builds flow features for TCP and UDP traffic, but capture still needs to
/// classify what it saw for stats and protocol distribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    Tcp,
    Udp,
    Other(u8),
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
            Protocol::Other(n) => write!(f, "Protocol({})", n),
        }
    }
}

/// TCP control bits relevant to detection, stored as a bitfield rather than
/// `Vec<String>` so flows can copy and compare flag state cheaply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpFlags(u8);

impl TcpFlags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
    pub const URG: u8 = 0x20;

    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn syn(&self) -> bool {
        self.0 & Self::SYN != 0
    }

    pub fn ack(&self) -> bool {
        self.0 & Self::ACK != 0
    }

    pub fn fin(&self) -> bool {
        self.0 & Self::FIN != 0
    }

    pub fn rst(&self) -> bool {
        self.0 & Self::RST != 0
    }

    pub fn psh(&self) -> bool {
        self.0 & Self::PSH != 0
    }

    pub fn urg(&self) -> bool {
        self.0 & Self::URG != 0
    }

    /// A "pure SYN" segment: SYN set, ACK clear. The thing a port scan and
    /// the opening half of a handshake have in common.
    pub fn is_pure_syn(&self) -> bool {
        self.syn() && !self.ack()
    }

    /// SYN and FIN both set - never legitimate, a classic scanner fingerprint.
    pub fn is_syn_fin(&self) -> bool {
        self.syn() && self.fin()
    }
}

impl std::fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = String::new();
        if self.syn() {
            s.push('S');
        }
        if self.ack() {
            s.push('A');
        }
        if self.fin() {
            s.push('F');
        }
        if self.rst() {
            s.push('R');
        }
        if self.psh() {
            s.push('P');
        }
        if self.urg() {
            s.push('U');
        }
        if s.is_empty() {
            s.push('-');
        }
        write!(f, "{}", s)
    }
}

/// A captured packet, already lifted out of the wire/pcap representation.
#[derive(Debug, Clone)]
pub struct Packet {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
    pub protocol: Protocol,
    pub size: usize,
    pub flags: TcpFlags,
}

/// Key identifying a bidirectional-ignorant flow (5-tuple, directional).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: Protocol,
}

impl std::fmt::Display for FlowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}-{}:{}/{}",
            self.src_ip, self.src_port, self.dst_ip, self.dst_port, self.protocol
        )
    }
}

/// Feature record computed by the analyzer for a single flow, the input to
/// the detector's rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feature {
    pub flow_key_display: String,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: Protocol,
    pub duration_secs: f32,
    pub packet_count: u32,
    pub byte_count: u64,
    pub packets_per_second: f32,
    pub bytes_per_second: f32,
    pub avg_packet_size: f32,
    pub port_entropy: f32,
    pub packet_size_variance: f32,
    pub syn_count: u32,
    pub ack_count: u32,
    pub fin_count: u32,
    pub rst_count: u32,
    pub last_flags: TcpFlags,
    pub saw_syn_fin: bool,
}

/// Severity of a raised alert, derived from confidence as a monotonic step
/// function (see [`Severity::from_confidence`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// >0.8 critical, >0.6 high, >0.4 medium, else low - the exact
    /// thresholds used throughout the original alerting/DB layer.
    pub fn from_confidence(confidence: f32) -> Self {
        if confidence > 0.8 {
            Severity::Critical
        } else if confidence > 0.6 {
            Severity::High
        } else if confidence > 0.4 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// Kind of threat a rule or scorer identified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThreatType {
    PortScan,
    SynFlood,
    Ddos,
    Anomalous,
    Suspicious,
}

impl std::fmt::Display for ThreatType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ThreatType::PortScan => write!(f, "Port Scan"),
            ThreatType::SynFlood => write!(f, "SYN Flood"),
            ThreatType::Ddos => write!(f, "DDoS Attack"),
            ThreatType::Anomalous => write!(f, "Anomalous Behavior"),
            ThreatType::Suspicious => write!(f, "Suspicious Activity"),
        }
    }
}

/// Reputation/geo enrichment attached to an alert, when enrichment succeeds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Enrichment {
    pub abuse_score: Option<u8>,
    /// `abuse_score >= confidence_threshold`, computed by the reputation
    /// provider (which holds the configured threshold) rather than the
    /// emitter - never set without `abuse_score` also being set.
    pub is_known_threat: Option<bool>,
    pub total_reports: Option<u32>,
    pub threat_categories: Vec<String>,
    pub country: Option<String>,
    pub city: Option<String>,
    pub isp: Option<String>,
}

/// A raised alert, ready for the emitter's sinks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub rule: String,
    pub threat_type: ThreatType,
    pub confidence: f32,
    pub severity: Severity,
    pub source_ip: IpAddr,
    pub target_ip: Option<IpAddr>,
    pub affected_ports: Vec<u16>,
    pub description: String,
    pub enrichment: Enrichment,
}

/// Per-sink failure counters from the emitter's fan-out, surfaced alongside
/// the rest of `SystemStats` for operators.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AlertSinkFailures {
    pub log: u64,
    pub store: u64,
    pub push: u64,
    pub notifiers: u64,
}

/// Running counters surfaced to operators, updated by the pipeline's tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemStats {
    pub start_time: DateTime<Utc>,
    pub packets_processed: u64,
    pub bytes_processed: u64,
    pub packets_dropped: u64,
    pub threats_detected: u64,
    pub processing_rate: f32,
    pub memory_usage: u64,
    pub cpu_usage: f32,
    pub active_flows: u32,
    pub alert_counts: HashMap<Severity, u32>,
    pub protocol_distribution: HashMap<Protocol, u64>,
    pub top_talkers: Vec<(IpAddr, u64)>,
    pub alert_sink_failures: AlertSinkFailures,
    #[serde(skip, default = "std::time::Instant::now")]
    last_rate_calculation: std::time::Instant,
    #[serde(skip, default)]
    last_packet_count: u64,
}

impl SystemStats {
    pub fn new() -> Self {
        Self {
            start_time: Utc::now(),
            packets_processed: 0,
            bytes_processed: 0,
            packets_dropped: 0,
            threats_detected: 0,
            processing_rate: 0.0,
            memory_usage: 0,
            cpu_usage: 0.0,
            active_flows: 0,
            alert_counts: HashMap::new(),
            protocol_distribution: HashMap::new(),
            top_talkers: Vec::new(),
            alert_sink_failures: AlertSinkFailures::default(),
            last_rate_calculation: std::time::Instant::now(),
            last_packet_count: 0,
        }
    }

    pub fn update_packet_stats(&mut self, packet_size: u64, protocol: Protocol) {
        self.packets_processed += 1;
        self.bytes_processed += packet_size;
        *self.protocol_distribution.entry(protocol).or_insert(0) += 1;

        let now = std::time::Instant::now();
        let elapsed = now.duration_since(self.last_rate_calculation).as_secs_f32();
        if elapsed >= 1.0 {
            let packets_delta = self.packets_processed - self.last_packet_count;
            self.processing_rate = packets_delta as f32 / elapsed;
            self.last_rate_calculation = now;
            self.last_packet_count = self.packets_processed;
        }
    }

    pub fn record_dropped(&mut self, count: u64) {
        self.packets_dropped += count;
    }

    pub fn increment_threat_count(&mut self, severity: Severity) {
        self.threats_detected += 1;
        *self.alert_counts.entry(severity).or_insert(0) += 1;
    }
}

impl Default for SystemStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tcp_flags_display_order_is_safrpu() {
        let flags = TcpFlags::from_bits(TcpFlags::SYN | TcpFlags::RST | TcpFlags::URG);
        assert_eq!(flags.to_string(), "SRU");
    }

    #[test]
    fn tcp_flags_no_bits_set_displays_dash() {
        assert_eq!(TcpFlags::default().to_string(), "-");
    }

    #[test]
    fn pure_syn_excludes_syn_ack() {
        let syn = TcpFlags::from_bits(TcpFlags::SYN);
        let syn_ack = TcpFlags::from_bits(TcpFlags::SYN | TcpFlags::ACK);
        assert!(syn.is_pure_syn());
        assert!(!syn_ack.is_pure_syn());
    }

    #[test]
    fn syn_fin_combo_detected() {
        let combo = TcpFlags::from_bits(TcpFlags::SYN | TcpFlags::FIN);
        assert!(combo.is_syn_fin());
    }

    #[test]
    fn severity_from_confidence_matches_thresholds() {
        assert_eq!(Severity::from_confidence(0.9), Severity::Critical);
        assert_eq!(Severity::from_confidence(0.8), Severity::High);
        assert_eq!(Severity::from_confidence(0.65), Severity::High);
        assert_eq!(Severity::from_confidence(0.5), Severity::Medium);
        assert_eq!(Severity::from_confidence(0.1), Severity::Low);
    }
}
