//! Packet builders shared by the unit tests.
use chrono::{DateTime, Utc};
use std::net::{IpAddr, SocketAddr};

use super::containers::{Endpoint, MacAddr, PacketRecord};

pub const EPOCH: i64 = 1_700_000_000;

/// Capture clock: `secs` after a fixed epoch.
pub fn at(secs: f64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(EPOCH * 1_000_000 + (secs * 1e6) as i64).unwrap()
}

/// Stable locally administered MAC derived from the address.
pub fn mac_for(ip: IpAddr) -> MacAddr {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, c, d] = v4.octets();
            MacAddr([0x02, 0x00, a, b, c, d])
        }
        IpAddr::V6(v6) => {
            let o = v6.octets();
            MacAddr([0x02, 0x66, o[12], o[13], o[14], o[15]])
        }
    }
}

/// `src`/`dst` are socket address literals, e.g. `10.0.0.1:1000`.
pub fn packet(secs: f64, src: &str, dst: &str, protocol: u8, length: u32) -> PacketRecord {
    let src: SocketAddr = src.parse().unwrap();
    let dst: SocketAddr = dst.parse().unwrap();
    PacketRecord {
        timestamp: at(secs),
        source: Endpoint::new(src.ip(), src.port()),
        destination: Endpoint::new(dst.ip(), dst.port()),
        source_mac: mac_for(src.ip()),
        destination_mac: mac_for(dst.ip()),
        protocol,
        length,
        payload: Vec::new(),
    }
}

pub fn tcp(secs: f64, src: &str, dst: &str) -> PacketRecord {
    packet(secs, src, dst, 6, 60)
}
