use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

use crate::config::AddressType;

pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;
pub const IPPROTO_ICMPV6: u8 = 58;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Udp,
    Icmp,
    Other,
}

impl From<u8> for Transport {
    fn from(protocol: u8) -> Self {
        match protocol {
            IPPROTO_TCP => Transport::Tcp,
            IPPROTO_UDP => Transport::Udp,
            IPPROTO_ICMP | IPPROTO_ICMPV6 => Transport::Icmp,
            _ => Transport::Other,
        }
    }
}

/// One side of a flow. Displays as `<address>:<port>`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    pub address: IpAddr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(address: IpAddr, port: u16) -> Self {
        Self { address, port }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

impl Serialize for Endpoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Link-layer address. The all-zero value stands in for "not seen".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const ZERO: MacAddr = MacAddr([0; 6]);

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl FromStr for MacAddr {
    type Err = hex::FromHexError;

    /// Accepts `aa:bb:cc:dd:ee:ff`, `aa-bb-...` or bare hex.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits: String = s.chars().filter(|c| *c != ':' && *c != '-').collect();
        let mut bytes = [0u8; 6];
        hex::decode_to_slice(digits, &mut bytes)?;
        Ok(MacAddr(bytes))
    }
}

impl Serialize for MacAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// A single dissected packet. Never modified after parsing.
#[derive(Clone, Debug, PartialEq)]
pub struct PacketRecord {
    pub timestamp: DateTime<Utc>,
    pub source: Endpoint,
    pub destination: Endpoint,
    pub source_mac: MacAddr,
    pub destination_mac: MacAddr,
    /// IP protocol number (IPv6 next header), 0 when unknown.
    pub protocol: u8,
    /// Frame length on the wire.
    pub length: u32,
    pub payload: Vec<u8>,
}

impl PacketRecord {
    pub fn key(&self) -> SessionKey {
        SessionKey::new(self.source, self.destination)
    }
}

/// Endpoint pair identifying a flow, oriented by the first packet seen.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SessionKey {
    pub first: Endpoint,
    pub second: Endpoint,
}

impl SessionKey {
    pub fn new(first: Endpoint, second: Endpoint) -> Self {
        Self { first, second }
    }

    pub fn reversed(&self) -> Self {
        Self { first: self.second, second: self.first }
    }

    /// Orientation-independent form, identical for `(A,B)` and `(B,A)`.
    pub fn unordered(&self) -> Self {
        if self.first <= self.second {
            *self
        } else {
            self.reversed()
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} <-> {}", self.first, self.second)
    }
}

/// All packets of one flow inside one bin, in arrival order.
#[derive(Clone, Debug)]
pub struct Flow {
    pub key: SessionKey,
    pub packets: Vec<PacketRecord>,
}

impl Flow {
    fn first(&self) -> Option<&PacketRecord> {
        self.packets.first()
    }

    /// MAC pair of the first packet, in key orientation.
    pub fn macs(&self) -> (MacAddr, MacAddr) {
        self.first()
            .map(|p| (p.source_mac, p.destination_mac))
            .unwrap_or((MacAddr::ZERO, MacAddr::ZERO))
    }

    pub fn protocol(&self) -> u8 {
        self.first().map(|p| p.protocol).unwrap_or(0)
    }

    pub fn transport(&self) -> Transport {
        Transport::from(self.protocol())
    }

    pub fn timestamps(&self) -> impl Iterator<Item = DateTime<Utc>> + '_ {
        self.packets.iter().map(|p| p.timestamp)
    }
}

/// Flows observed within one time window, keyed in insertion order.
#[derive(Clone, Debug, Default)]
pub struct SessionBin {
    pub start: Option<DateTime<Utc>>,
    flows: Vec<Flow>,
    index: HashMap<SessionKey, usize>,
}

impl SessionBin {
    pub fn new(start: Option<DateTime<Utc>>) -> Self {
        Self { start, ..Default::default() }
    }

    /// Key under which `packet` belongs in this bin: whichever orientation
    /// is already present, else the packet's own.
    pub fn canonical_key(&self, packet: &PacketRecord) -> SessionKey {
        let key = packet.key();
        if self.index.contains_key(&key) {
            return key;
        }
        let reversed = key.reversed();
        if self.index.contains_key(&reversed) {
            return reversed;
        }
        key
    }

    pub fn push(&mut self, key: SessionKey, packet: PacketRecord) {
        match self.index.get(&key) {
            Some(&i) => self.flows[i].packets.push(packet),
            None => {
                self.index.insert(key, self.flows.len());
                self.flows.push(Flow { key, packets: vec![packet] });
            }
        }
    }

    pub fn get(&self, key: &SessionKey) -> Option<&Flow> {
        self.index.get(key).map(|&i| &self.flows[i])
    }

    pub fn flows(&self) -> &[Flow] {
        &self.flows
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn packet_count(&self) -> usize {
        self.flows.iter().map(|f| f.packets.len()).sum()
    }
}

/// The participant a capture is profiled for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct CaptureSource {
    pub ip: IpAddr,
    pub mac: MacAddr,
}

impl CaptureSource {
    /// Sentinel returned when nothing could be resolved.
    pub fn unknown() -> Self {
        Self { ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED), mac: MacAddr::ZERO }
    }

    pub fn is_unknown(&self) -> bool {
        self.ip.is_unspecified() && self.mac.is_zero()
    }

    /// Source in the configured address type. A source without a MAC is named by its IP.
    pub fn address(&self, kind: AddressType) -> String {
        match kind {
            AddressType::Mac if self.mac.is_zero() && !self.ip.is_unspecified() => self.ip.to_string(),
            AddressType::Mac => self.mac.to_string(),
            AddressType::Ip => self.ip.to_string(),
        }
    }

    /// True when a flow endpoint is this source.
    ///
    /// MAC mode compares MACs when both sides have one and falls back to the IP otherwise,
    /// so captures without a link layer (cooked or raw IP) still match.
    pub fn matches(&self, ip: IpAddr, mac: MacAddr, kind: AddressType) -> bool {
        match kind {
            AddressType::Mac if !self.mac.is_zero() && !mac.is_zero() => self.mac == mac,
            AddressType::Mac | AddressType::Ip => !self.ip.is_unspecified() && self.ip == ip,
        }
    }
}

impl fmt::Display for CaptureSource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}-{}", self.ip, self.mac)
    }
}

/// Running fused vector kept per capture source by the caller.
#[derive(Clone, Debug, PartialEq, Serialize, serde::Deserialize)]
pub struct RunningRepresentation {
    /// Unix seconds of the last accepted observation.
    pub timestamp: f64,
    pub vector: Vec<f64>,
}
