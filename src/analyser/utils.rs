//! Packet loading: drives tshark through rtshark and flattens its PDML into [PacketRecord]s.
use chrono::{DateTime, Utc};
use rtshark::{Packet, RTShark};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use super::containers::{Endpoint, MacAddr, PacketRecord};
use crate::error::{Error, Result};

/// Only frames carrying an IP layer are worth dissecting.
pub const DEFAULT_DISPLAY_FILTER: &str = "ip || ipv6";

/// Anything that can turn a capture file into an ordered packet sequence.
pub trait CapturePacketSource: Send + Sync {
    fn packets(&self, path: &Path) -> Result<Vec<PacketRecord>>;
}

/// Field access over a dissected packet, so conversion can be tested without tshark.
pub trait PacketFields {
    fn field(&self, layer: &str, name: &str) -> Option<&str>;
    fn timestamp_micros(&self) -> Option<i64>;
}

impl PacketFields for Packet {
    fn field(&self, layer: &str, name: &str) -> Option<&str> {
        self.layer_name(layer)
            .and_then(|l| l.metadata(name))
            .map(|m| m.value())
    }

    fn timestamp_micros(&self) -> Option<i64> {
        Packet::timestamp_micros(self)
    }
}

/// Builds a [PacketRecord] out of a dissected packet.
///
/// Returns None when the timestamp or the IP layer is missing. Everything else degrades:
/// ports and protocol default to 0, MACs to all-zero, payload to empty.
pub fn packet_record(packet: &impl PacketFields) -> Option<PacketRecord> {
    let timestamp = packet
        .timestamp_micros()
        .and_then(DateTime::<Utc>::from_timestamp_micros)?;

    let (ip_layer, proto_field) = if packet.field("ip", "ip.src").is_some() {
        ("ip", "ip.proto")
    } else if packet.field("ipv6", "ipv6.src").is_some() {
        ("ipv6", "ipv6.nxt")
    } else {
        return None;
    };

    let src: IpAddr = packet.field(ip_layer, &format!("{ip_layer}.src"))?.parse().ok()?;
    let dst: IpAddr = packet.field(ip_layer, &format!("{ip_layer}.dst"))?.parse().ok()?;
    let protocol = parse_or_default(packet.field(ip_layer, proto_field), "protocol");

    let (src_port, dst_port) = ["tcp", "udp"]
        .iter()
        .find(|layer| packet.field(layer, &format!("{layer}.srcport")).is_some())
        .map(|layer| {
            (
                parse_or_default(packet.field(layer, &format!("{layer}.srcport")), "source port"),
                parse_or_default(packet.field(layer, &format!("{layer}.dstport")), "destination port"),
            )
        })
        .unwrap_or((0, 0));

    Some(PacketRecord {
        timestamp,
        source: Endpoint::new(src, src_port),
        destination: Endpoint::new(dst, dst_port),
        source_mac: mac_or_zero(packet.field("eth", "eth.src")),
        destination_mac: mac_or_zero(packet.field("eth", "eth.dst")),
        protocol,
        length: parse_or_default(packet.field("frame", "frame.len"), "frame length"),
        payload: payload(packet),
    })
}

fn parse_or_default<T: std::str::FromStr + Default>(value: Option<&str>, what: &str) -> T {
    match value {
        Some(v) => v.trim().parse().unwrap_or_else(|_| {
            log::debug!("Unparseable {what} '{v}', using default");
            T::default()
        }),
        None => T::default(),
    }
}

fn mac_or_zero(value: Option<&str>) -> MacAddr {
    value.and_then(|v| v.parse().ok()).unwrap_or(MacAddr::ZERO)
}

/// Transport payload; tshark shows it as colon separated hex.
fn payload(packet: &impl PacketFields) -> Vec<u8> {
    let shown = packet
        .field("tcp", "tcp.payload")
        .or_else(|| packet.field("udp", "udp.payload"))
        .or_else(|| packet.field("data", "data.data"));

    match shown {
        Some(shown) => {
            let digits: String = shown.chars().filter(|c| *c != ':').collect();
            hex::decode(digits).unwrap_or_default()
        }
        None => Vec::new(),
    }
}

/// Subprocess-backed source: one tshark per capture, killed on timeout.
#[derive(Clone, Debug)]
pub struct TsharkSource {
    pub display_filter: String,
    pub timeout: Duration,
}

impl TsharkSource {
    pub fn new(timeout: Duration) -> Self {
        Self { display_filter: DEFAULT_DISPLAY_FILTER.to_string(), timeout }
    }
}

impl CapturePacketSource for TsharkSource {
    fn packets(&self, path: &Path) -> Result<Vec<PacketRecord>> {
        // tshark happily starts on a missing file and prints nothing
        std::fs::metadata(path)?;

        let filepath = path.to_string_lossy().into_owned();
        let filter = self.display_filter.clone();
        let cancelled = Arc::new(AtomicBool::new(false));
        let reader_cancelled = Arc::clone(&cancelled);
        let dissector = Arc::new(DissectorPid::default());
        let reader_dissector = Arc::clone(&dissector);
        let (tx, rx) = mpsc::channel();

        let reader = thread::spawn(move || {
            let _ = tx.send(read_capture(&filepath, &filter, &reader_cancelled, &reader_dissector));
        });

        match rx.recv_timeout(self.timeout) {
            Ok(result) => {
                let _ = reader.join();
                result
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                cancelled.store(true, Ordering::Relaxed);
                // unblocks a reader stuck on a silent tshark; it reaps the process on EOF
                if dissector.terminate() {
                    log::warn!("Killed tshark on {} after {:?}", path.display(), self.timeout);
                }
                Err(Error::Timeout(self.timeout))
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                Err(Error::Dissector("tshark reader thread exited unexpectedly".into()))
            }
        }
    }
}

/// Pid of the tshark a reader is blocked on, 0 when none is running.
#[derive(Debug, Default)]
struct DissectorPid(AtomicU32);

impl DissectorPid {
    fn set(&self, pid: Option<u32>) {
        self.0.store(pid.unwrap_or(0), Ordering::SeqCst);
    }

    fn clear(&self) {
        self.0.store(0, Ordering::SeqCst);
    }

    /// Kills the running process, if any. Returns true when a signal was delivered.
    fn terminate(&self) -> bool {
        match self.0.swap(0, Ordering::SeqCst) {
            0 => false,
            pid => kill_process(pid),
        }
    }
}

#[cfg(unix)]
fn kill_process(pid: u32) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) => true,
        Err(e) => {
            log::warn!("Could not kill tshark (pid {pid}): {e}");
            false
        }
    }
}

#[cfg(not(unix))]
fn kill_process(_pid: u32) -> bool {
    false
}

fn read_capture(
    filepath: &str,
    filter: &str,
    cancelled: &AtomicBool,
    dissector: &DissectorPid,
) -> Result<Vec<PacketRecord>> {
    let builder = rtshark::RTSharkBuilder::builder()
        .input_path(filepath)
        .display_filter(filter);

    let mut rtshark = builder
        .spawn()
        .map_err(|e| Error::Dissector(format!("error spawning tshark: {e}")))?;
    dissector.set(rtshark.pid());
    log::info!("Reading from {}", filepath);

    let result = collect_packets(&mut rtshark, cancelled);
    // cleared before reaping so the pid is never signalled after reuse
    dissector.clear();
    rtshark.kill();

    result
}

/// Iterates through rtshark packets in emission order, skipping unusable ones.
fn collect_packets(rtshark: &mut RTShark, cancelled: &AtomicBool) -> Result<Vec<PacketRecord>> {
    let mut packets = Vec::new();
    let mut skipped = 0usize;

    loop {
        if cancelled.load(Ordering::Relaxed) {
            return Err(Error::Dissector("read cancelled".into()));
        }
        match rtshark.read() {
            Ok(Some(packet)) => match packet_record(&packet) {
                Some(record) => packets.push(record),
                None => skipped += 1,
            },
            Ok(None) => break,
            Err(e) => return Err(Error::Dissector(format!("error parsing tshark output: {e}"))),
        }
    }

    if skipped > 0 {
        log::debug!("Skipped {skipped} packets without timestamp or IP layer");
    }
    Ok(packets)
}

/// In-memory source keyed by path, for tests and replays.
#[derive(Clone, Debug, Default)]
pub struct FixtureSource {
    captures: HashMap<PathBuf, Vec<PacketRecord>>,
}

impl FixtureSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capture(mut self, path: impl Into<PathBuf>, packets: Vec<PacketRecord>) -> Self {
        self.captures.insert(path.into(), packets);
        self
    }
}

impl CapturePacketSource for FixtureSource {
    fn packets(&self, path: &Path) -> Result<Vec<PacketRecord>> {
        self.captures
            .get(path)
            .cloned()
            .ok_or_else(|| Error::Dissector(format!("no fixture for {}", path.display())))
    }
}

/// Outcome of reading one capture, as seen by the pipeline.
#[derive(Debug)]
pub enum PacketRead {
    Packets(Vec<PacketRecord>),
    /// The dissector could not produce output; treated as zero packets.
    Unavailable(String),
}

impl PacketRead {
    pub fn into_packets(self) -> Vec<PacketRecord> {
        match self {
            PacketRead::Packets(packets) => packets,
            PacketRead::Unavailable(_) => Vec::new(),
        }
    }
}

/// Loads a capture, turning dissector failures into an empty read plus a log line.
pub fn read_packets(source: &dyn CapturePacketSource, path: &Path) -> PacketRead {
    log::info!("Loading capture file {}", path.display());

    match source.packets(path) {
        Ok(packets) => {
            log::info!("Read {} packets from {}", packets.len(), path.display());
            PacketRead::Packets(packets)
        }
        Err(Error::Timeout(limit)) => {
            log::warn!("Dissector timed out after {limit:?} on {}", path.display());
            PacketRead::Unavailable(format!("timed out after {limit:?}"))
        }
        Err(e) => {
            log::error!("Could not dissect {}: {e}", path.display());
            PacketRead::Unavailable(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyser::testutil::packet;

    #[derive(Default)]
    struct Fields {
        values: HashMap<(&'static str, &'static str), &'static str>,
        micros: Option<i64>,
    }

    impl Fields {
        fn with(mut self, layer: &'static str, name: &'static str, value: &'static str) -> Self {
            self.values.insert((layer, name), value);
            self
        }
    }

    impl PacketFields for Fields {
        fn field(&self, layer: &str, name: &str) -> Option<&str> {
            self.values
                .iter()
                .find(|((l, n), _)| *l == layer && *n == name)
                .map(|(_, v)| *v)
        }

        fn timestamp_micros(&self) -> Option<i64> {
            self.micros
        }
    }

    fn tcp_fields() -> Fields {
        Fields { micros: Some(1_700_000_000_000_000), ..Default::default() }
            .with("eth", "eth.src", "02:00:0a:00:00:01")
            .with("eth", "eth.dst", "02:00:0a:00:00:02")
            .with("ip", "ip.src", "10.0.0.1")
            .with("ip", "ip.dst", "10.0.0.2")
            .with("ip", "ip.proto", "6")
            .with("tcp", "tcp.srcport", "51000")
            .with("tcp", "tcp.dstport", "22")
            .with("tcp", "tcp.payload", "de:ad:be:ef")
            .with("frame", "frame.len", "70")
    }

    #[test]
    fn converts_tcp_packet() {
        let record = packet_record(&tcp_fields()).unwrap();
        assert_eq!(record.source.to_string(), "10.0.0.1:51000");
        assert_eq!(record.destination.to_string(), "10.0.0.2:22");
        assert_eq!(record.source_mac.to_string(), "02:00:0a:00:00:01");
        assert_eq!(record.protocol, 6);
        assert_eq!(record.length, 70);
        assert_eq!(record.payload, vec![0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn converts_icmpv6_without_ports_or_ethernet() {
        let fields = Fields { micros: Some(5), ..Default::default() }
            .with("ipv6", "ipv6.src", "fe80::1")
            .with("ipv6", "ipv6.dst", "ff02::1")
            .with("ipv6", "ipv6.nxt", "58");
        let record = packet_record(&fields).unwrap();
        assert_eq!(record.source.port, 0);
        assert_eq!(record.protocol, 58);
        assert!(record.source_mac.is_zero());
        assert!(record.payload.is_empty());
    }

    #[test]
    fn skips_packets_without_ip_or_timestamp() {
        let no_ip = Fields { micros: Some(1), ..Default::default() }.with("arp", "arp.opcode", "1");
        assert!(packet_record(&no_ip).is_none());

        let mut no_time = tcp_fields();
        no_time.micros = None;
        assert!(packet_record(&no_time).is_none());
    }

    #[test]
    fn bad_fields_fall_back_to_neutral_values() {
        let fields = tcp_fields()
            .with("tcp", "tcp.srcport", "http")
            .with("ip", "ip.proto", "tcp")
            .with("frame", "frame.len", "?");
        let record = packet_record(&fields).unwrap();
        assert_eq!(record.source.port, 0);
        assert_eq!(record.destination.port, 22);
        assert_eq!(record.protocol, 0);
        assert_eq!(record.length, 0);
    }

    #[test]
    fn fixture_source_distinguishes_missing_capture() {
        let source = FixtureSource::new().with_capture("a.pcap", vec![packet(0.0, "10.0.0.1:1", "10.0.0.2:2", 6, 60)]);

        match read_packets(&source, Path::new("a.pcap")) {
            PacketRead::Packets(p) => assert_eq!(p.len(), 1),
            other => panic!("expected packets, got {other:?}"),
        }
        assert!(matches!(read_packets(&source, Path::new("b.pcap")), PacketRead::Unavailable(_)));
    }

    #[test]
    fn tshark_source_reports_missing_file() {
        let source = TsharkSource::new(Duration::from_secs(1));
        let err = source.packets(Path::new("/nonexistent/capture.pcap")).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[cfg(unix)]
    #[test]
    fn stalled_dissector_is_killed() {
        use std::os::unix::process::ExitStatusExt;

        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let dissector = DissectorPid::default();
        dissector.set(Some(child.id()));

        assert!(dissector.terminate());
        let status = child.wait().unwrap();
        assert_eq!(status.signal(), Some(9));
        // already killed, nothing left to signal
        assert!(!dissector.terminate());
    }

    #[test]
    fn idle_dissector_has_nothing_to_kill() {
        let dissector = DissectorPid::default();
        assert!(!dissector.terminate());
        dissector.set(None);
        assert!(!dissector.terminate());
    }
}
