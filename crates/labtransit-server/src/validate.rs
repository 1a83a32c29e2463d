//! `labtransit validate-config`: offline check of a config directory.

use std::path::Path;

use labtransit_core::{MicroscopeKind, TransportConfig};

/// What `validate-config` found.
#[derive(Debug)]
pub struct ConfigReport {
    pub valid: bool,
    pub physical_microscopes: usize,
    pub virtual_microscopes: usize,
    pub specimens: usize,
    pub bench_slots: usize,
    pub occupied_slots: usize,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

pub fn validate(config_dir: &Path) -> ConfigReport {
    let mut report = ConfigReport {
        valid: false,
        physical_microscopes: 0,
        virtual_microscopes: 0,
        specimens: 0,
        bench_slots: 0,
        occupied_slots: 0,
        warnings: Vec::new(),
        errors: Vec::new(),
    };

    let config = match TransportConfig::load(config_dir) {
        Ok(config) => config,
        Err(e) => {
            report.errors.push(format!("Cannot load config: {}", e));
            return report;
        }
    };

    if !config.config_path.exists() {
        report
            .warnings
            .push(format!("{} not found, defaults apply", config.config_path.display()));
    }

    for microscope in &config.microscopes {
        match microscope.kind {
            MicroscopeKind::Physical => report.physical_microscopes += 1,
            MicroscopeKind::Virtual => report.virtual_microscopes += 1,
        }
    }
    report.specimens = config.virtual_specimens.len();
    report.bench_slots = config.bench_slots.len();
    report.occupied_slots = config.bench_slots.iter().filter(|s| s.is_occupied()).count();

    if report.physical_microscopes == 0 {
        report
            .warnings
            .push("No physical microscopes configured".into());
    }
    if report.virtual_microscopes > 0 && report.specimens == 0 {
        report
            .warnings
            .push("Virtual microscopes configured without specimens".into());
    }

    match config.validate() {
        Ok(()) => report.valid = true,
        Err(e) => report.errors.push(e.to_string()),
    }
    report
}

pub fn print_report(report: &ConfigReport) {
    println!("=== LabTransit Config Report ===");
    println!();
    println!("Config valid:         {}", if report.valid { "YES" } else { "NO" });
    println!("Physical microscopes: {}", report.physical_microscopes);
    println!("Virtual microscopes:  {}", report.virtual_microscopes);
    println!("Virtual specimens:    {}", report.specimens);
    println!(
        "Bench slots:          {} ({} occupied)",
        report.bench_slots, report.occupied_slots
    );

    if !report.warnings.is_empty() {
        println!();
        println!("Warnings:");
        for w in &report.warnings {
            println!("  - {}", w);
        }
    }
    if !report.errors.is_empty() {
        println!();
        println!("Errors:");
        for e in &report.errors {
            println!("  - {}", e);
        }
    }
}
