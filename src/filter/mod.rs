//! Multi-stage packet classification.
//!
//! A chain holds named filters; applying a packet runs the enabled ones
//! in descending priority until the first one rejects. Filters classify
//! over the metadata decoded on the RX path, except the payload filter
//! which searches the raw L4 payload. A misbehaving custom predicate is
//! treated as a rejection for that packet, never as a pipeline failure.

mod matchers;

pub use matchers::{Ipv4Cidr, PortRange};

use crate::decode;
use crate::packet::Packet;
use crate::{Error, Result};
use regex::Regex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::warn;

/// Payload filters search only this prefix of the L4 payload.
const PAYLOAD_SEARCH_WINDOW: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterType {
    /// Keyword match (`tcp`, `udp`, `icmp`) over the transport protocol.
    Bpf,
    /// Exact protocol match, or `ip` for any IPv4.
    Protocol,
    /// Single address or CIDR; matches source or destination.
    IpRange,
    /// Single port or `lo-hi` range; matches either port.
    PortRange,
    /// Regular expression over the start of the L4 payload.
    Payload,
    /// User predicate over the whole packet.
    Custom,
}

/// User predicate for `FilterType::Custom`.
pub type CustomPredicate = Arc<dyn Fn(&Packet) -> bool + Send + Sync>;

#[derive(Debug, Clone)]
pub struct FilterConfig {
    pub filter_type: FilterType,
    pub expression: String,
    pub enabled: bool,
    /// Higher priority runs first.
    pub priority: i32,
    pub description: String,
    pub parameters: HashMap<String, String>,
}

impl FilterConfig {
    pub fn new(filter_type: FilterType, expression: &str, priority: i32) -> Self {
        Self {
            filter_type,
            expression: expression.to_string(),
            enabled: true,
            priority,
            description: String::new(),
            parameters: HashMap::new(),
        }
    }
}

/// Per-filter counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct FilterCounters {
    pub packets_processed: u64,
    pub packets_passed: u64,
    pub packets_dropped: u64,
    pub processing_micros: u64,
}

/// Aggregate chain statistics plus the per-filter breakdown.
#[derive(Debug, Clone, Default)]
pub struct FilterStats {
    pub packets_processed: u64,
    pub packets_passed: u64,
    pub packets_dropped: u64,
    pub total_processing_micros: u64,
    pub per_filter: HashMap<String, FilterCounters>,
}

/// Verdict for one packet.
#[derive(Debug, Clone)]
pub struct FilterResult {
    pub passed: bool,
    /// Rejecting filter, or the last filter that ran on a pass.
    pub filter_name: String,
    pub reason: String,
    pub processing_micros: u64,
}

enum CompiledMatcher {
    Bpf,
    Protocol,
    IpRange(Ipv4Cidr),
    PortRange(PortRange),
    Payload(Box<Regex>),
    Custom,
    /// Empty expression: matches everything.
    PassAll,
}

struct FilterEntry {
    config: FilterConfig,
    matcher: CompiledMatcher,
    custom: Option<CustomPredicate>,
    counters: FilterCounters,
}

/// Named filter chain with priority-ordered evaluation.
#[derive(Default)]
pub struct FilterChain {
    filters: Mutex<HashMap<String, FilterEntry>>,
    stats: Mutex<FilterStats>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a filter. The expression is compiled here so a bad one
    /// fails at registration instead of silently failing packets.
    pub fn add_filter(&self, name: &str, config: FilterConfig) -> Result<()> {
        let mut filters = self.filters.lock().unwrap();
        if filters.contains_key(name) {
            return Err(Error::InvalidArgument(format!("filter already exists: {name}")));
        }
        let matcher = compile(&config)?;
        filters.insert(
            name.to_string(),
            FilterEntry {
                config,
                matcher,
                custom: None,
                counters: FilterCounters::default(),
            },
        );
        Ok(())
    }

    pub fn remove_filter(&self, name: &str) -> Result<()> {
        let mut filters = self.filters.lock().unwrap();
        if filters.remove(name).is_none() {
            return Err(Error::InvalidArgument(format!("filter not found: {name}")));
        }
        self.stats.lock().unwrap().per_filter.remove(name);
        Ok(())
    }

    pub fn set_filter_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let mut filters = self.filters.lock().unwrap();
        match filters.get_mut(name) {
            Some(entry) => {
                entry.config.enabled = enabled;
                Ok(())
            }
            None => Err(Error::InvalidArgument(format!("filter not found: {name}"))),
        }
    }

    /// Binds the predicate of a registered custom filter.
    pub fn set_custom_filter(&self, name: &str, predicate: CustomPredicate) -> Result<()> {
        let mut filters = self.filters.lock().unwrap();
        match filters.get_mut(name) {
            Some(entry) => {
                entry.custom = Some(predicate);
                Ok(())
            }
            None => Err(Error::InvalidArgument(format!("filter not found: {name}"))),
        }
    }

    /// Names of enabled filters, in evaluation order.
    pub fn active_filters(&self) -> Vec<String> {
        let filters = self.filters.lock().unwrap();
        let mut active: Vec<(&String, i32)> = filters
            .iter()
            .filter(|(_, e)| e.config.enabled)
            .map(|(name, e)| (name, e.config.priority))
            .collect();
        active.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        active.into_iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.filters.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs the enabled filters over one packet; the first rejection
    /// short-circuits.
    pub fn apply(&self, packet: &Packet) -> FilterResult {
        let started = Instant::now();
        let mut filters = self.filters.lock().unwrap();

        let mut order: Vec<String> = filters
            .iter()
            .filter(|(_, e)| e.config.enabled)
            .map(|(name, _)| name.clone())
            .collect();
        order.sort_by(|a, b| {
            let pa = filters[a].config.priority;
            let pb = filters[b].config.priority;
            pb.cmp(&pa).then_with(|| a.cmp(b))
        });

        let mut result = FilterResult {
            passed: true,
            filter_name: String::new(),
            reason: if order.is_empty() {
                "no filters enabled".to_string()
            } else {
                "packet passed all filters".to_string()
            },
            processing_micros: 0,
        };

        for name in order {
            let entry = filters.get_mut(&name).expect("name from this map");
            let filter_started = Instant::now();
            let verdict = evaluate(packet, entry);
            let micros = filter_started.elapsed().as_micros() as u64;

            entry.counters.packets_processed += 1;
            entry.counters.processing_micros += micros;
            if verdict {
                entry.counters.packets_passed += 1;
                result.filter_name = name;
            } else {
                entry.counters.packets_dropped += 1;
                result.passed = false;
                result.reason = format!("filter {name} rejected packet");
                result.filter_name = name;
                break;
            }
        }
        drop(filters);

        result.processing_micros = started.elapsed().as_micros() as u64;

        let mut stats = self.stats.lock().unwrap();
        stats.packets_processed += 1;
        if result.passed {
            stats.packets_passed += 1;
        } else {
            stats.packets_dropped += 1;
        }
        stats.total_processing_micros += result.processing_micros;

        result
    }

    /// Applies the chain to a batch.
    pub fn apply_all(&self, packets: &[Packet]) -> Vec<FilterResult> {
        packets.iter().map(|packet| self.apply(packet)).collect()
    }

    /// Aggregate statistics with the per-filter breakdown folded in.
    pub fn stats(&self) -> FilterStats {
        let mut stats = self.stats.lock().unwrap().clone();
        let filters = self.filters.lock().unwrap();
        for (name, entry) in filters.iter() {
            stats.per_filter.insert(name.clone(), entry.counters);
        }
        stats
    }

    pub fn reset_stats(&self) {
        *self.stats.lock().unwrap() = FilterStats::default();
        for entry in self.filters.lock().unwrap().values_mut() {
            entry.counters = FilterCounters::default();
        }
    }
}

fn compile(config: &FilterConfig) -> Result<CompiledMatcher> {
    if config.expression.is_empty() && config.filter_type != FilterType::Custom {
        return Ok(CompiledMatcher::PassAll);
    }
    Ok(match config.filter_type {
        FilterType::Bpf => CompiledMatcher::Bpf,
        FilterType::Protocol => CompiledMatcher::Protocol,
        FilterType::IpRange => CompiledMatcher::IpRange(
            Ipv4Cidr::parse(&config.expression).ok_or_else(|| {
                Error::InvalidArgument(format!("bad ip range {:?}", config.expression))
            })?,
        ),
        FilterType::PortRange => CompiledMatcher::PortRange(
            PortRange::parse(&config.expression).ok_or_else(|| {
                Error::InvalidArgument(format!("bad port range {:?}", config.expression))
            })?,
        ),
        FilterType::Payload => CompiledMatcher::Payload(Box::new(
            Regex::new(&config.expression).map_err(|e| {
                Error::InvalidArgument(format!("bad payload pattern: {e}"))
            })?,
        )),
        FilterType::Custom => CompiledMatcher::Custom,
    })
}

fn evaluate(packet: &Packet, entry: &FilterEntry) -> bool {
    let meta = packet.metadata();
    match &entry.matcher {
        CompiledMatcher::PassAll => true,
        CompiledMatcher::Bpf => {
            let expr = &entry.config.expression;
            (expr.contains("tcp") && packet.is_tcp())
                || (expr.contains("udp") && packet.is_udp())
                || (expr.contains("icmp") && packet.is_icmp())
        }
        CompiledMatcher::Protocol => match entry.config.expression.as_str() {
            "tcp" => packet.is_tcp(),
            "udp" => packet.is_udp(),
            "icmp" => packet.is_icmp(),
            "ip" => packet.is_ipv4() && meta.protocol != 0,
            _ => false,
        },
        CompiledMatcher::IpRange(cidr) => {
            let matches = |ip: &IpAddr| match ip {
                IpAddr::V4(v4) => cidr.contains(*v4),
                IpAddr::V6(_) => false,
            };
            matches(&meta.source_ip) || matches(&meta.destination_ip)
        }
        CompiledMatcher::PortRange(range) => {
            (packet.is_tcp() || packet.is_udp())
                && (range.contains(meta.source_port) || range.contains(meta.destination_port))
        }
        CompiledMatcher::Payload(pattern) => {
            let Some(offset) = decode::l4_payload_offset(packet.data()) else {
                return false;
            };
            let payload = &packet.data()[offset..];
            let window = &payload[..payload.len().min(PAYLOAD_SEARCH_WINDOW)];
            pattern.is_match(&String::from_utf8_lossy(window))
        }
        CompiledMatcher::Custom => match &entry.custom {
            Some(predicate) => {
                let outcome = catch_unwind(AssertUnwindSafe(|| predicate(packet)));
                match outcome {
                    Ok(verdict) => verdict,
                    Err(_) => {
                        warn!("custom filter panicked; treating as reject");
                        false
                    }
                }
            }
            // A custom filter without a bound predicate passes.
            None => true,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tcp_packet(dst_ip: [u8; 4], dst_port: u16) -> Packet {
        frame(6, dst_ip, 80, dst_port, &[])
    }

    fn udp_packet(dst_ip: [u8; 4], dst_port: u16) -> Packet {
        frame(17, dst_ip, 5353, dst_port, &[])
    }

    fn frame(proto: u8, dst_ip: [u8; 4], src_port: u16, dst_port: u16, payload: &[u8]) -> Packet {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&[0u8; 12]);
        bytes.extend_from_slice(&[0x08, 0x00]);
        let total = 20 + if proto == 17 { 8 } else { 20 } + payload.len();
        bytes.extend_from_slice(&[0x45, 0x00]);
        bytes.extend_from_slice(&(total as u16).to_be_bytes());
        bytes.extend_from_slice(&[0x00, 0x01, 0x00, 0x00, 0x40, proto, 0x00, 0x00]);
        bytes.extend_from_slice(&[10, 0, 0, 99]);
        bytes.extend_from_slice(&dst_ip);
        bytes.extend_from_slice(&src_port.to_be_bytes());
        bytes.extend_from_slice(&dst_port.to_be_bytes());
        if proto == 17 {
            bytes.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);
        } else {
            bytes.extend_from_slice(&[0, 0, 0, 1, 0, 0, 0, 0, 0x50, 0, 0, 0, 0, 0, 0, 0]);
        }
        bytes.extend_from_slice(payload);
        Packet::from_bytes(&bytes, "test0")
    }

    #[test]
    fn test_empty_chain_passes_without_counters() {
        let chain = FilterChain::new();
        let result = chain.apply(&tcp_packet([10, 0, 0, 5], 443));
        assert!(result.passed);
        assert_eq!(result.filter_name, "");
        assert!(chain.stats().per_filter.is_empty());
        assert_eq!(chain.stats().packets_processed, 1);
    }

    #[test]
    fn test_priority_short_circuit() {
        let chain = FilterChain::new();
        chain
            .add_filter("tcp_only", FilterConfig::new(FilterType::Protocol, "tcp", 10))
            .unwrap();
        chain
            .add_filter(
                "local_net",
                FilterConfig::new(FilterType::IpRange, "10.0.0.0/24", 5),
            )
            .unwrap();

        // UDP packet to the local net: the higher-priority protocol
        // filter rejects first.
        let result = chain.apply(&udp_packet([10, 0, 0, 5], 53));
        assert!(!result.passed);
        assert_eq!(result.filter_name, "tcp_only");

        // TCP to a remote address: passes tcp_only, rejected by range.
        let result = chain.apply(&tcp_packet([8, 8, 8, 8], 443));
        assert!(!result.passed);
        assert_eq!(result.filter_name, "local_net");

        // TCP into the local net: passes the whole chain.
        let result = chain.apply(&tcp_packet([10, 0, 0, 5], 443));
        assert!(result.passed);

        let stats = chain.stats();
        assert_eq!(stats.packets_processed, 3);
        assert_eq!(stats.packets_dropped, 2);
        assert_eq!(stats.per_filter["tcp_only"].packets_processed, 3);
        assert_eq!(stats.per_filter["local_net"].packets_processed, 2);
    }

    #[test]
    fn test_disabled_filter_is_skipped() {
        let chain = FilterChain::new();
        chain
            .add_filter("tcp_only", FilterConfig::new(FilterType::Protocol, "tcp", 10))
            .unwrap();
        chain.set_filter_enabled("tcp_only", false).unwrap();

        assert!(chain.apply(&udp_packet([10, 0, 0, 5], 53)).passed);
        assert!(chain.active_filters().is_empty());

        chain.set_filter_enabled("tcp_only", true).unwrap();
        assert_eq!(chain.active_filters(), vec!["tcp_only".to_string()]);
    }

    #[test]
    fn test_bpf_keyword_filter() {
        let chain = FilterChain::new();
        chain
            .add_filter("bpf", FilterConfig::new(FilterType::Bpf, "tcp or udp", 0))
            .unwrap();
        assert!(chain.apply(&tcp_packet([1, 1, 1, 1], 80)).passed);
        assert!(chain.apply(&udp_packet([1, 1, 1, 1], 53)).passed);
        let icmp = frame(1, [1, 1, 1, 1], 0, 0, &[]);
        assert!(!chain.apply(&icmp).passed);
    }

    #[test]
    fn test_port_range_filter() {
        let chain = FilterChain::new();
        chain
            .add_filter(
                "high_ports",
                FilterConfig::new(FilterType::PortRange, "1024-65535", 0),
            )
            .unwrap();
        assert!(chain.apply(&tcp_packet([1, 1, 1, 1], 8080)).passed);
        // Source port 80 and destination 81: both below the range.
        assert!(!chain.apply(&tcp_packet([1, 1, 1, 1], 81)).passed);
    }

    #[test]
    fn test_payload_regex_filter() {
        let chain = FilterChain::new();
        chain
            .add_filter(
                "http_get",
                FilterConfig::new(FilterType::Payload, r"GET /\w+", 0),
            )
            .unwrap();
        let hit = frame(6, [1, 1, 1, 1], 80, 8080, b"GET /index HTTP/1.1\r\n");
        let miss = frame(6, [1, 1, 1, 1], 80, 8080, b"POST /index HTTP/1.1\r\n");
        assert!(chain.apply(&hit).passed);
        assert!(!chain.apply(&miss).passed);
    }

    #[test]
    fn test_bad_expressions_rejected_at_registration() {
        let chain = FilterChain::new();
        assert!(chain
            .add_filter("bad", FilterConfig::new(FilterType::IpRange, "10.0.0.0/40", 0))
            .is_err());
        assert!(chain
            .add_filter("bad", FilterConfig::new(FilterType::Payload, "(unclosed", 0))
            .is_err());
        assert!(chain
            .add_filter("dup", FilterConfig::new(FilterType::Protocol, "tcp", 0))
            .is_ok());
        assert!(chain
            .add_filter("dup", FilterConfig::new(FilterType::Protocol, "udp", 0))
            .is_err());
    }

    #[test]
    fn test_custom_filter_and_panic_isolation() {
        let chain = FilterChain::new();
        chain
            .add_filter("custom", FilterConfig::new(FilterType::Custom, "", 0))
            .unwrap();
        // Unbound predicate passes.
        assert!(chain.apply(&tcp_packet([1, 1, 1, 1], 80)).passed);

        chain
            .set_custom_filter("custom", Arc::new(|p| p.metadata().destination_port == 80))
            .unwrap();
        assert!(chain.apply(&tcp_packet([1, 1, 1, 1], 80)).passed);
        assert!(!chain.apply(&tcp_packet([1, 1, 1, 1], 81)).passed);

        chain
            .set_custom_filter("custom", Arc::new(|_| panic!("boom")))
            .unwrap();
        let result = chain.apply(&tcp_packet([1, 1, 1, 1], 80));
        assert!(!result.passed, "panicking predicate must reject, not crash");
    }

    #[test]
    fn test_remove_filter_restores_chain() {
        let chain = FilterChain::new();
        chain
            .add_filter("tcp_only", FilterConfig::new(FilterType::Protocol, "tcp", 0))
            .unwrap();
        chain.remove_filter("tcp_only").unwrap();
        assert!(chain.is_empty());
        assert!(chain.apply(&udp_packet([1, 1, 1, 1], 53)).passed);
        assert!(chain.remove_filter("tcp_only").is_err());
    }
}
