//! Fixed-length feature vectors for one session bin.
//!
//! Layout, for a configured `max_port`:
//!
//! | index               | meaning                                          |
//! |---------------------|--------------------------------------------------|
//! | 0                   | incoming sessions                                |
//! | 1                   | outgoing sessions                                |
//! | 2                   | incoming / outgoing (outgoing floored at 1)      |
//! | 3                   | distinct other private addresses                 |
//! | 4                   | distinct source (initiator) ports                |
//! | 5                   | distinct destination (responder) ports           |
//! | `6 + 9*port + m`    | aspect `m` of [FEATURE_ASPECTS] for `port`       |
//!
//! Ports run from 0 through `max_port` inclusive. A flow is filed under its responder port.
//! Per-port aspects are normalised by their total across the bin.
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use super::containers::{CaptureSource, Flow, SessionBin, Transport};
use super::source::{is_private, resolve_source};
use crate::config::{AddressType, PipelineConfig};

pub const FEATURE_HEADER: &[&str] = &[
    "incoming_sessions",
    "outgoing_sessions",
    "in_out_ratio",
    "other_private_addresses",
    "source_ports",
    "destination_ports",
];

pub const FEATURE_ASPECTS: &[&str] = &[
    "sessions_from",
    "sessions_to",
    "packets_sent",
    "packets_received",
    "bytes_sent",
    "bytes_received",
    "tcp",
    "udp",
    "icmp",
];

pub fn feature_len(max_port: u16) -> usize {
    FEATURE_HEADER.len() + FEATURE_ASPECTS.len() * (max_port as usize + 1)
}

/// Offset of the block belonging to `port`.
pub fn port_offset(port: u16) -> usize {
    FEATURE_HEADER.len() + FEATURE_ASPECTS.len() * port as usize
}

/// Raw per-port counters, before normalisation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct PortStats {
    pub sessions_from: u64,
    pub sessions_to: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub tcp: u64,
    pub udp: u64,
    pub icmp: u64,
}

impl PortStats {
    fn add(&mut self, other: &PortStats) {
        self.sessions_from += other.sessions_from;
        self.sessions_to += other.sessions_to;
        self.packets_sent += other.packets_sent;
        self.packets_received += other.packets_received;
        self.bytes_sent += other.bytes_sent;
        self.bytes_received += other.bytes_received;
        self.tcp += other.tcp;
        self.udp += other.udp;
        self.icmp += other.icmp;
    }

    fn as_array(&self) -> [u64; 9] {
        [
            self.sessions_from,
            self.sessions_to,
            self.packets_sent,
            self.packets_received,
            self.bytes_sent,
            self.bytes_received,
            self.tcp,
            self.udp,
            self.icmp,
        ]
    }

    /// Divisor for each aspect; zero totals count as one.
    fn divisors(&self) -> [f64; 9] {
        let sessions = self.sessions_from + self.sessions_to;
        let mut out = self.as_array();
        out[6] = sessions;
        out[7] = sessions;
        out[8] = sessions;
        out.map(|v| v.max(1) as f64)
    }
}

/// Everything counted over one bin for one capture source.
#[derive(Clone, Debug, Default)]
pub struct Tally {
    pub ports: BTreeMap<u16, PortStats>,
    pub totals: PortStats,
    pub source_ports: BTreeSet<u16>,
    pub destination_ports: BTreeSet<u16>,
    pub other_ips: BTreeSet<IpAddr>,
    /// Sessions with at least one public endpoint, per direction.
    pub external_incoming: u64,
    pub external_outgoing: u64,
}

impl Tally {
    pub fn incoming(&self) -> u64 {
        self.totals.sessions_to
    }

    pub fn outgoing(&self) -> u64 {
        self.totals.sessions_from
    }

    pub fn sessions(&self) -> u64 {
        self.incoming() + self.outgoing()
    }

    fn record(&mut self, flow: &Flow, outgoing: bool, max_port: u16) {
        let key = flow.key;
        let (local, remote) = if outgoing { (key.first, key.second) } else { (key.second, key.first) };

        let mut stats = PortStats::default();
        if outgoing {
            stats.sessions_from = 1;
        } else {
            stats.sessions_to = 1;
        }
        for packet in &flow.packets {
            if packet.source == local {
                stats.packets_sent += 1;
                stats.bytes_sent += packet.length as u64;
            } else {
                stats.packets_received += 1;
                stats.bytes_received += packet.length as u64;
            }
        }
        match flow.transport() {
            Transport::Tcp => stats.tcp = 1,
            Transport::Udp => stats.udp = 1,
            Transport::Icmp => stats.icmp = 1,
            Transport::Other => {}
        }

        self.totals.add(&stats);
        if key.second.port <= max_port {
            self.ports.entry(key.second.port).or_default().add(&stats);
        }
        self.source_ports.insert(key.first.port);
        self.destination_ports.insert(key.second.port);
        if remote.address != local.address && is_private(&remote.address) {
            self.other_ips.insert(remote.address);
        }
        if !(is_private(&key.first.address) && is_private(&key.second.address)) {
            if outgoing {
                self.external_outgoing += 1;
            } else {
                self.external_incoming += 1;
            }
        }
    }

    fn vector(&self, max_port: u16) -> Vec<f64> {
        let mut vector = vec![0.0; feature_len(max_port)];
        vector[0] = self.incoming() as f64;
        vector[1] = self.outgoing() as f64;
        vector[2] = self.incoming() as f64 / self.outgoing().max(1) as f64;
        vector[3] = self.other_ips.len() as f64;
        vector[4] = self.source_ports.len() as f64;
        vector[5] = self.destination_ports.len() as f64;

        let divisors = self.totals.divisors();
        for (&port, stats) in &self.ports {
            let offset = port_offset(port);
            for (m, value) in stats.as_array().iter().enumerate() {
                vector[offset + m] = *value as f64 / divisors[m];
            }
        }

        vector
    }
}

/// Counts the flows of `bin` that involve `source`, without normalising.
pub fn tally(bin: &SessionBin, source: &CaptureSource, kind: AddressType, max_port: u16) -> Tally {
    let mut tally = Tally::default();

    for flow in bin.flows() {
        let (first_mac, second_mac) = flow.macs();
        if source.matches(flow.key.first.address, first_mac, kind) {
            tally.record(flow, true, max_port);
        } else if source.matches(flow.key.second.address, second_mac, kind) {
            tally.record(flow, false, max_port);
        }
    }

    tally
}

#[derive(Clone, Debug, Serialize)]
pub struct Features {
    pub vector: Vec<f64>,
    pub source: CaptureSource,
    /// Private addresses the source talked to, sorted.
    pub other_ips: Vec<IpAddr>,
    pub sessions: u64,
    pub external_incoming: u64,
    pub external_outgoing: u64,
}

impl Features {
    /// True when no flow in the bin involved the capture source.
    pub fn is_empty(&self) -> bool {
        self.sessions == 0
    }
}

/// Featurizes one bin. The source is resolved from the bin itself when not given.
pub fn extract_features(bin: &SessionBin, source: Option<&CaptureSource>, config: &PipelineConfig) -> Features {
    let source = match source {
        Some(source) => *source,
        None => resolve_source(std::slice::from_ref(bin), config.include_all_sessions),
    };

    let tally = tally(bin, &source, config.address_type, config.max_port);
    if tally.sessions() == 0 {
        log::debug!("No sessions involving {source} in bin of {} flows", bin.len());
    }

    Features {
        vector: tally.vector(config.max_port),
        source,
        other_ips: tally.other_ips.iter().copied().collect(),
        sessions: tally.sessions(),
        external_incoming: tally.external_incoming,
        external_outgoing: tally.external_outgoing,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyser::sessions::sessionize;
    use crate::analyser::testutil::{mac_for, packet, tcp};

    fn config(max_port: u16, address_type: AddressType) -> PipelineConfig {
        PipelineConfig { max_port, address_type, ..Default::default() }
    }

    fn host(ip: &str) -> CaptureSource {
        let ip: IpAddr = ip.parse().unwrap();
        CaptureSource { ip, mac: mac_for(ip) }
    }

    fn sample_bin() -> SessionBin {
        let packets = vec![
            // outgoing web
            tcp(0.0, "10.0.0.1:5000", "93.184.216.34:80"),
            packet(0.1, "93.184.216.34:80", "10.0.0.1:5000", 6, 1500),
            // outgoing dns
            packet(1.0, "10.0.0.1:5001", "10.0.0.53:53", 17, 80),
            packet(1.1, "10.0.0.53:53", "10.0.0.1:5001", 17, 120),
            // incoming ssh
            tcp(2.0, "10.0.0.7:40000", "10.0.0.1:22"),
            // unrelated
            tcp(3.0, "10.0.0.8:1", "10.0.0.9:80"),
            // outgoing above max_port
            tcp(4.0, "10.0.0.1:5002", "10.0.0.9:8080"),
        ];
        sessionize(packets, None, 0.0).unwrap().remove(0)
    }

    #[test]
    fn header_fields() {
        let features = extract_features(&sample_bin(), Some(&host("10.0.0.1")), &config(1024, AddressType::Mac));
        let v = &features.vector;

        assert_eq!(v.len(), feature_len(1024));
        assert_eq!(v[0], 1.0);
        assert_eq!(v[1], 3.0);
        assert!((v[2] - 1.0 / 3.0).abs() < 1e-12);
        assert_eq!(v[3], 3.0); // .53, .7, .9
        assert_eq!(v[4], 4.0); // 5000, 5001, 40000, 5002
        assert_eq!(v[5], 4.0); // 80, 53, 22, 8080
        assert_eq!(features.sessions, 4);
    }

    #[test]
    fn external_sessions_need_a_public_endpoint() {
        let features = extract_features(&sample_bin(), Some(&host("10.0.0.1")), &config(1024, AddressType::Mac));
        assert_eq!(features.external_outgoing, 1); // 93.184.216.34 only
        assert_eq!(features.external_incoming, 0);

        let packets = vec![
            tcp(0.0, "8.8.8.8:1234", "10.0.0.1:443"),
            tcp(1.0, "10.0.0.7:1234", "10.0.0.1:443"),
            tcp(2.0, "10.0.0.1:4000", "10.0.0.9:53"),
        ];
        let bin = sessionize(packets, None, 0.0).unwrap().remove(0);
        let features = extract_features(&bin, Some(&host("10.0.0.1")), &config(1024, AddressType::Ip));
        assert_eq!(features.external_incoming, 1);
        assert_eq!(features.external_outgoing, 0);
    }

    #[test]
    fn port_blocks_are_normalised() {
        let features = extract_features(&sample_bin(), Some(&host("10.0.0.1")), &config(1024, AddressType::Ip));
        let v = &features.vector;

        let http = port_offset(80);
        assert!((v[http] - 1.0 / 3.0).abs() < 1e-12); // 1 of 3 outgoing
        assert_eq!(v[http + 1], 0.0);
        assert!((v[http + 2] - 1.0 / 3.0).abs() < 1e-12); // 1 of 3 sent packets
        assert!((v[http + 5] - 1500.0 / 1680.0).abs() < 1e-12); // bytes received
        assert!((v[http + 6] - 0.25).abs() < 1e-12); // tcp share of 4 sessions

        let ssh = port_offset(22);
        assert_eq!(v[ssh + 1], 1.0); // the only incoming session
        assert!((v[ssh + 3] - 1.0 / 3.0).abs() < 1e-12);

        let dns = port_offset(53);
        assert!((v[dns + 7] - 0.25).abs() < 1e-12);

        // nothing for the unrelated flow's port 1 or the untracked 8080
        assert!(v[port_offset(1)..port_offset(2)].iter().all(|x| *x == 0.0));
    }

    #[test]
    fn other_ips_are_sorted_and_private() {
        let features = extract_features(&sample_bin(), Some(&host("10.0.0.1")), &config(100, AddressType::Mac));
        let expected: Vec<IpAddr> = ["10.0.0.53", "10.0.0.7", "10.0.0.9"].iter().map(|s| s.parse().unwrap()).collect();
        let mut sorted = expected.clone();
        sorted.sort();
        assert_eq!(features.other_ips, sorted);
    }

    #[test]
    fn port_sessions_never_exceed_flow_count() {
        let bin = sample_bin();
        for source in ["10.0.0.1", "10.0.0.9", "10.0.0.7"] {
            let tally = tally(&bin, &host(source), AddressType::Mac, 65535);
            for stats in tally.ports.values() {
                assert!((stats.sessions_from + stats.sessions_to) as usize <= bin.len());
            }
            assert!(tally.sessions() as usize <= bin.len());
        }
    }

    #[test]
    fn resolves_source_when_missing() {
        let features = extract_features(&sample_bin(), None, &config(1024, AddressType::Mac));
        assert_eq!(features.source, host("10.0.0.1"));
    }

    #[test]
    fn empty_bin_gives_zero_vector() {
        let features = extract_features(&SessionBin::new(None), None, &config(10, AddressType::Mac));
        assert!(features.is_empty());
        assert!(features.source.is_unknown());
        assert_eq!(features.vector, vec![0.0; feature_len(10)]);
        assert!(features.vector.iter().all(|x| x.is_finite()));
    }
}
