use clap::{ArgAction, Parser};
use netsession::analyser::core::{analyse_captures, update_running, CaptureReport};
use netsession::analyser::store::{MemoryStore, RepresentationUpdater};
use netsession::analyser::utils::TsharkSource;
use netsession::config::{AddressType, PipelineConfig, DEFAULT_MAX_PORT, DEFAULT_THRESHOLD_TIME, DEFAULT_TIME_CONSTANT};
use netsession::ui::output;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

/// netsession rebuilds flow sessions from packet captures and turns them into feature vectors
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// pcap/pcapng files to analyze
    #[arg(short = 'f', long = "file", required = true, num_args = 1.., value_parser)]
    files: Vec<PathBuf>,

    /// Seconds per session bin, whole capture in one bin if omitted
    #[arg(short, long, value_parser)]
    duration: Option<f64>,

    /// Warm-up window in seconds, flows first seen inside it are ignored
    #[arg(short, long, default_value_t = DEFAULT_THRESHOLD_TIME, value_parser)]
    threshold: f64,

    /// Highest port tracked in the feature vector
    #[arg(short = 'p', long, default_value_t = DEFAULT_MAX_PORT, value_parser)]
    max_port: u16,

    /// EMA time constant in seconds
    #[arg(short = 'c', long, default_value_t = DEFAULT_TIME_CONSTANT, value_parser)]
    time_constant: f64,

    /// Identify the capture source by mac or ip
    #[arg(short, long, default_value = "mac", value_parser = parse_address_type)]
    address_type: AddressType,

    /// Count public participants when resolving the capture source
    #[arg(long, action = ArgAction::SetTrue)]
    all_sessions: bool,

    /// Number of captures processed in parallel
    #[arg(short, long, default_value_t = 4, value_parser)]
    workers: usize,

    /// Seconds before a tshark run is killed
    #[arg(long, default_value_t = 300, value_parser)]
    timeout: u64,

    /// JSON file holding running representations, fused into and saved back after the run
    #[arg(short = 's', long, value_parser)]
    state: Option<PathBuf>,

    /// Directory to write per-capture JSON reports
    #[arg(short = 'o', long, value_parser)]
    output_dir: Option<PathBuf>,

    /// Display output as formatted JSON
    #[arg(short = 'j', long, action = ArgAction::SetTrue)]
    json: bool,
}

fn parse_address_type(s: &str) -> Result<AddressType, String> {
    s.parse().map_err(|e: netsession::Error| e.to_string())
}

/// Fuses every valid report into the stored running state, in input order.
fn carry_running_state(path: &Path, reports: &[CaptureReport], time_constant: f64) -> netsession::Result<()> {
    let updater = RepresentationUpdater::new(MemoryStore::load(path)?, time_constant);
    for report in reports {
        if let Some(state) = update_running(&updater, report)? {
            log::info!(
                "Running state for {} now at t={}",
                report.source_address.as_deref().unwrap_or("-"),
                state.timestamp
            );
        }
    }
    updater.store().save(path)
}

fn main() -> ExitCode {
    if let Err(e) = simple_logger::init_with_env() {
        eprintln!("Could not initialise logging: {e}");
    }

    let args = Args::parse();

    let config = PipelineConfig {
        duration: args.duration,
        threshold_time: args.threshold,
        max_port: args.max_port,
        time_constant: args.time_constant,
        address_type: args.address_type,
        include_all_sessions: args.all_sessions,
        workers: args.workers,
        dissector_timeout_secs: args.timeout,
    };

    if let Some(out_dir) = args.output_dir.as_deref() {
        log::info!("Output directory {}", out_dir.display());
        if let Err(e) = fs::create_dir_all(out_dir) {
            log::error!("Cannot create {}: {e}", out_dir.display());
            return ExitCode::FAILURE;
        }
    } else {
        log::warn!("No output directory specified.");
    }

    let source = TsharkSource::new(config.dissector_timeout());
    let reports = match analyse_captures(&args.files, &config, &source) {
        Ok(reports) => reports,
        Err(e) => {
            log::error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    if let Some(state_path) = args.state.as_deref() {
        if let Err(e) = carry_running_state(state_path, &reports, config.time_constant) {
            log::error!("Could not update running state in {}: {e}", state_path.display());
        }
    }

    // ---- Output ----
    if args.json {
        match output::data_as_json(&reports) {
            Ok(json) => println!("{json}"),
            Err(e) => log::error!("Could not serialise reports: {e}"),
        }
    } else {
        output::print_results(&reports);
    }

    if let Some(out_dir) = args.output_dir.as_deref() {
        for report in &reports {
            if let Err(e) = output::report_to_file(report, out_dir) {
                log::error!("Could not write report for {}: {e}", report.file.display());
            }
        }
    }

    if reports.iter().any(|r| r.valid) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
