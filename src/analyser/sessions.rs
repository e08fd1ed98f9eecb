//! Groups packets into bidirectional flows and cuts the capture into time bins.
use chrono::{DateTime, Utc};
use std::collections::HashMap;

use super::containers::{PacketRecord, SessionBin, SessionKey};
use crate::error::{Error, Result};

fn seconds_between(later: DateTime<Utc>, earlier: DateTime<Utc>) -> f64 {
    (later - earlier).num_microseconds().unwrap_or(i64::MAX) as f64 / 1e6
}

/// Splits `packets` into session bins.
///
/// With `duration` set a new bin starts whenever a packet lands more than `duration` seconds
/// after the current bin's start; an empty capture then yields no bins. Without it the
/// whole capture is one bin, empty or not.
///
/// Flows are remembered capture-wide by the time they were first observed. Only flows first
/// observed at least `threshold_time` seconds after the capture's first packet are kept;
/// anything that started during the warm-up window is dropped for good, even if it shows up
/// again in a later bin.
pub fn sessionize<I>(packets: I, duration: Option<f64>, threshold_time: f64) -> Result<Vec<SessionBin>>
where
    I: IntoIterator<Item = PacketRecord>,
{
    if let Some(d) = duration {
        if !d.is_finite() || d <= 0.0 {
            return Err(Error::InvalidConfig(format!("duration must be positive, got {d}")));
        }
    }
    if !threshold_time.is_finite() || threshold_time < 0.0 {
        return Err(Error::InvalidConfig(format!("threshold_time must be non-negative, got {threshold_time}")));
    }

    let mut bins = Vec::new();
    let mut current: Option<SessionBin> = None;
    let mut capture_start: Option<DateTime<Utc>> = None;
    // unordered key -> accepted?
    let mut verdicts: HashMap<SessionKey, bool> = HashMap::new();
    let mut suppressed = 0usize;

    for packet in packets {
        let start = *capture_start.get_or_insert(packet.timestamp);

        let bin = match current.take() {
            Some(bin) => match (duration, bin.start) {
                (Some(d), Some(bin_start)) if seconds_between(packet.timestamp, bin_start) > d => {
                    bins.push(bin);
                    SessionBin::new(Some(packet.timestamp))
                }
                _ => bin,
            },
            None => SessionBin::new(Some(packet.timestamp)),
        };
        let bin = current.insert(bin);

        let key = bin.canonical_key(&packet);
        let accepted = *verdicts
            .entry(key.unordered())
            .or_insert_with(|| seconds_between(packet.timestamp, start) >= threshold_time);

        if accepted {
            bin.push(key, packet);
        } else {
            suppressed += 1;
        }
    }

    match current {
        Some(bin) => bins.push(bin),
        None if duration.is_none() => bins.push(SessionBin::new(None)),
        None => {}
    }

    if suppressed > 0 {
        log::debug!("Suppressed {suppressed} packets of flows that began inside the warm-up window");
    }
    log::info!("Built {} session bins over {} flows", bins.len(), verdicts.len());

    Ok(bins)
}
