//! Works out which participant a capture belongs to.
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use super::containers::{CaptureSource, MacAddr, SessionBin};

/// RFC1918 and link-local IPv4, unique-local and link-local IPv6.
pub fn is_private(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_private_v4(v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => is_private_v4(&v4),
            None => is_private_v6(v6),
        },
    }
}

fn is_private_v4(ip: &Ipv4Addr) -> bool {
    ip.is_private() || ip.is_link_local()
}

fn is_private_v6(ip: &Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80
}

/// Majority vote over `ip-mac` pairs seen on either side of every flow.
///
/// Unless `include_all` is set only private participants are counted. Ties go to the pair
/// that sorts first. Returns [CaptureSource::unknown] when nothing was counted.
pub fn resolve_source(bins: &[SessionBin], include_all: bool) -> CaptureSource {
    let mut counts: BTreeMap<String, (usize, CaptureSource)> = BTreeMap::new();

    for bin in bins {
        for flow in bin.flows() {
            let (first_mac, second_mac) = flow.macs();
            let sides: [(IpAddr, MacAddr); 2] = [
                (flow.key.first.address, first_mac),
                (flow.key.second.address, second_mac),
            ];

            for (ip, mac) in sides {
                if !include_all && !is_private(&ip) {
                    continue;
                }
                let candidate = CaptureSource { ip, mac };
                counts
                    .entry(candidate.to_string())
                    .or_insert((0, candidate))
                    .0 += 1;
            }
        }
    }

    let mut best: Option<(usize, CaptureSource)> = None;
    for (count, candidate) in counts.into_values() {
        if best.map_or(true, |(top, _)| count > top) {
            best = Some((count, candidate));
        }
    }

    match best {
        Some((count, source)) => {
            log::info!("Resolved capture source {source} ({count} occurrences)");
            source
        }
        None => {
            log::warn!("No private participants found, capture source unknown");
            CaptureSource::unknown()
        }
    }
}
