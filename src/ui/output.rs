use crate::analyser::core::CaptureReport;
use crate::error::Result;
use ansi_term::Colour;
use std::fs;
use std::path::Path;

pub fn print_results(reports: &[CaptureReport]) {
    println!("\n\u{250F}\u{2501}\u{2501}\u{2501}\u{2501} Results");
    for report in reports {
        print_report(report);
    }
}

pub fn print_report(report: &CaptureReport) {
    println!("\u{2503}");
    println!("\u{2503} Capture {}", Colour::Red.paint(report.file.display().to_string()));

    if !report.valid {
        let reason = report.error.as_deref().unwrap_or("unknown error");
        println!("\u{2503} Invalid          : {}", Colour::Fixed(208).paint(reason));
        println!("\u{2503} Packets          : {}", report.packets);
        return;
    }

    let source = report.source_address.as_deref().unwrap_or("-");
    println!("\u{2503} Capture source   : {}", Colour::Fixed(226).paint(source));
    println!("\u{2503} Packets          : {}", report.packets);
    println!("\u{2503} Bins             : {}", report.bins.len());

    for (i, bin) in report.bins.iter().enumerate() {
        let start = bin.start.map(|s| s.to_rfc3339()).unwrap_or_else(|| "-".into());
        println!(
            "\u{2503}   [{i:>3}] {start}  flows {:>5}  in {:>4}  out {:>4}",
            bin.flows, bin.features.vector[0], bin.features.vector[1]
        );
    }

    if let Some(representation) = &report.representation {
        let nonzero = representation.vector.iter().filter(|v| **v != 0.0).count();
        println!(
            "\u{2503} Representation   : {} dims, {} non-zero, t={}",
            representation.vector.len(),
            Colour::Fixed(226).paint(nonzero.to_string()),
            representation.timestamp
        );
    }
    println!("\u{2503} ");
}

pub fn data_as_json(reports: &[CaptureReport]) -> Result<String> {
    Ok(serde_json::to_string_pretty(reports)?)
}

/// Writes one report as `<dir>/<capture stem>.json`.
pub fn report_to_file(report: &CaptureReport, dir: &Path) -> Result<()> {
    let stem = report
        .file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "capture".into());
    let path = dir.join(format!("{stem}.json"));

    fs::write(&path, serde_json::to_string_pretty(report)?)?;
    log::info!("Wrote {}", path.display());
    Ok(())
}
