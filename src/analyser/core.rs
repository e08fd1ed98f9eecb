//! Per-capture pipeline and the worker pool that runs it over many files.
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::Serialize;
use std::path::{Path, PathBuf};

use super::containers::{CaptureSource, RunningRepresentation, SessionBin};
use super::features::{extract_features, Features};
use super::fusion::fuse;
use super::sessions::sessionize;
use super::source::resolve_source;
use super::store::{RepresentationStore, RepresentationUpdater};
use super::utils::{read_packets, CapturePacketSource, PacketRead};
use crate::config::PipelineConfig;
use crate::error::Result;

#[derive(Clone, Debug, Serialize)]
pub struct BinReport {
    pub start: Option<DateTime<Utc>>,
    pub flows: usize,
    pub packets: usize,
    pub features: Features,
}

impl BinReport {
    /// Bin start in unix seconds, the clock used for fusion.
    pub fn timestamp(&self) -> Option<f64> {
        self.start.map(|s| s.timestamp_micros() as f64 / 1e6)
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct CaptureReport {
    pub file: PathBuf,
    pub valid: bool,
    pub packets: usize,
    pub source: Option<CaptureSource>,
    /// Source rendered in the configured address type.
    pub source_address: Option<String>,
    pub bins: Vec<BinReport>,
    pub representation: Option<RunningRepresentation>,
    pub error: Option<String>,
}

impl CaptureReport {
    fn invalid(file: &Path, packets: usize, error: String) -> Self {
        Self {
            file: file.to_path_buf(),
            valid: false,
            packets,
            source: None,
            source_address: None,
            bins: Vec::new(),
            representation: None,
            error: Some(error),
        }
    }
}

/// Bins with sessions, as fusion inputs in time order.
fn observations(bins: &[BinReport]) -> (Vec<Vec<f64>>, Vec<f64>) {
    bins.iter()
        .filter(|r| !r.features.is_empty())
        .filter_map(|r| r.timestamp().map(|t| (r.features.vector.clone(), t)))
        .unzip()
}

/// Runs one capture through every stage.
///
/// Only configuration problems are returned as errors; anything wrong with the capture
/// itself ends up as `valid: false` in the report.
pub fn analyse(path: &Path, config: &PipelineConfig, source: &dyn CapturePacketSource) -> Result<CaptureReport> {
    config.validate()?;
    Ok(analyse_validated(path, config, source))
}

fn analyse_validated(path: &Path, config: &PipelineConfig, source: &dyn CapturePacketSource) -> CaptureReport {
    log::info!("Starting analysis of {}", path.display());

    let packets = match read_packets(source, path) {
        PacketRead::Packets(packets) => packets,
        PacketRead::Unavailable(reason) => return CaptureReport::invalid(path, 0, reason),
    };
    let packet_count = packets.len();
    if packet_count == 0 {
        return CaptureReport::invalid(path, 0, "no packets".into());
    }

    let bins = match sessionize(packets, config.duration, config.threshold_time) {
        Ok(bins) => bins,
        Err(e) => return CaptureReport::invalid(path, packet_count, e.to_string()),
    };
    if bins.iter().all(SessionBin::is_empty) {
        log::warn!("No sessions past the warm-up window in {}", path.display());
        return CaptureReport::invalid(path, packet_count, "no sessions".into());
    }

    // resolved once for the whole capture and handed to every bin
    let capture_source = resolve_source(&bins, config.include_all_sessions);
    if capture_source.is_unknown() {
        return CaptureReport::invalid(path, packet_count, "capture source could not be resolved".into());
    }

    let reports: Vec<BinReport> = bins
        .iter()
        .map(|bin| BinReport {
            start: bin.start,
            flows: bin.len(),
            packets: bin.packet_count(),
            features: extract_features(bin, Some(&capture_source), config),
        })
        .collect();

    let (vectors, timestamps) = observations(&reports);

    let representation = match fuse(&vectors, &timestamps, None, config.time_constant) {
        Ok(representation) => representation,
        Err(e) => return CaptureReport::invalid(path, packet_count, e.to_string()),
    };

    let valid = representation.is_some();
    log::info!(
        "Finished {}: {} bins, {} with sessions for {}",
        path.display(),
        reports.len(),
        vectors.len(),
        capture_source
    );

    CaptureReport {
        file: path.to_path_buf(),
        valid,
        packets: packet_count,
        source: Some(capture_source),
        source_address: Some(capture_source.address(config.address_type)),
        bins: reports,
        representation,
        error: (!valid).then(|| "no sessions involving the capture source".to_string()),
    }
}

/// Analyses every capture on a pool of `config.workers` threads.
///
/// Captures share nothing while being processed. Reports come back in input order.
pub fn analyse_captures(
    paths: &[PathBuf],
    config: &PipelineConfig,
    source: &dyn CapturePacketSource,
) -> Result<Vec<CaptureReport>> {
    config.validate()?;
    if paths.is_empty() {
        return Ok(Vec::new());
    }

    let workers = config.workers.min(paths.len());
    log::info!("Analysing {} captures on {} workers", paths.len(), workers);

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|i| format!("capture-worker-{i}"))
        .build()?;

    Ok(pool.install(|| {
        paths
            .par_iter()
            .map(|path| analyse_validated(path, config, source))
            .collect()
    }))
}

/// Fuses a valid report's bins into the running state stored for its capture source.
///
/// Invalid reports leave the store alone and give `None`.
pub fn update_running<S: RepresentationStore>(
    updater: &RepresentationUpdater<S>,
    report: &CaptureReport,
) -> Result<Option<RunningRepresentation>> {
    let Some(source) = report.source_address.as_deref().filter(|_| report.valid) else {
        return Ok(None);
    };

    let (vectors, timestamps) = observations(&report.bins);
    let other_ips: Vec<_> = report
        .bins
        .iter()
        .flat_map(|b| b.features.other_ips.iter().copied())
        .collect();

    updater.update(source, &vectors, &timestamps, &other_ips)
}
