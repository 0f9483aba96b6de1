mod app;
mod output;

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use destring::{pipeline, Module};
use log::info;
use serde::Serialize;

use crate::{
    app::Cli,
    output::{preview, print_output, Align, TabWriter},
};

#[derive(Debug, Serialize)]
struct RunReport {
    input: String,
    output: Option<String>,
    decoder_type: Option<String>,
    payload_size: usize,
    accessors_recovered: usize,
    accessors_skipped: usize,
    table_records_recovered: usize,
    table_records_skipped: usize,
    methods_patched: usize,
    calls_replaced: usize,
    residual_calls: usize,
    written: bool,
}

#[derive(Debug, Serialize)]
struct ScanReport {
    input: String,
    decoder_type: Option<String>,
    payload_field: Option<String>,
    payload_size: usize,
    strings: Vec<ScanString>,
}

#[derive(Debug, Serialize)]
struct ScanString {
    accessor: String,
    literal: String,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Show pipeline info+ on stderr unless --json; --verbose enables debug;
    // RUST_LOG overrides.
    if !cli.json {
        let level = if cli.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        };
        env_logger::Builder::new()
            .filter_module("destring", level)
            .parse_default_env()
            .target(env_logger::Target::Stderr)
            .format_timestamp(None)
            .format_module_path(false)
            .format_target(false)
            .init();
    }

    let module = Module::load(&cli.input)
        .with_context(|| format!("failed to load assembly: {}", cli.input.display()))?;

    if cli.scan {
        return run_scan(&module, &cli);
    }
    run_deobfuscate(&module, &cli)
}

fn run_deobfuscate(module: &Module, cli: &Cli) -> anyhow::Result<()> {
    let outcome = pipeline::run(module)
        .with_context(|| format!("deobfuscation failed: {}", cli.input.display()))?;

    let mut written = false;
    if let Some(out) = cli.output.as_deref() {
        if cli.dry_run {
            info!("dry run: skipping write to {}", out.display());
        } else {
            if !cli.no_backup {
                let backup = backup_path(&cli.input);
                std::fs::copy(&cli.input, &backup)
                    .with_context(|| format!("failed to write backup: {}", backup.display()))?;
            }
            module
                .write_patched(&outcome.patches, out)
                .with_context(|| format!("failed to write output: {}", out.display()))?;
            written = true;
        }
    }

    let report = &outcome.report;
    let run = RunReport {
        input: display_name(&cli.input),
        output: cli.output.as_deref().map(display_name),
        decoder_type: report.decoder_type.clone(),
        payload_size: report.payload_size,
        accessors_recovered: report.accessors_recovered,
        accessors_skipped: report.accessors_skipped,
        table_records_recovered: report.table_records_recovered,
        table_records_skipped: report.table_records_skipped,
        methods_patched: report.methods_patched,
        calls_replaced: report.calls_replaced,
        residual_calls: report.residual_calls,
        written,
    };

    print_output(&run, cli, display_run)
}

fn run_scan(module: &Module, cli: &Cli) -> anyhow::Result<()> {
    use destring::{accessors::analyze_accessors, locator::locate_decoder, payload};

    let binding = locate_decoder(module)
        .with_context(|| format!("scan failed: {}", cli.input.display()))?;

    let report = match binding {
        Some(binding) => {
            let mut data = payload::extract_payload(module, &binding)?;
            payload::decrypt_in_place(&mut data);
            let analysis = analyze_accessors(module, &binding, &data);

            let mut strings: Vec<ScanString> = analysis
                .map
                .iter()
                .map(|(accessor, literal)| ScanString {
                    accessor: accessor.to_string(),
                    literal: literal.to_string(),
                })
                .collect();
            strings.sort_by(|a, b| a.accessor.cmp(&b.accessor));

            ScanReport {
                input: display_name(&cli.input),
                decoder_type: Some(binding.type_fullname.clone()),
                payload_field: Some(binding.payload_field.clone()),
                payload_size: binding.payload_size,
                strings,
            }
        }
        None => ScanReport {
            input: display_name(&cli.input),
            decoder_type: None,
            payload_field: None,
            payload_size: 0,
            strings: Vec::new(),
        },
    };

    print_output(&report, cli, display_scan)
}

fn display_run(run: &RunReport) {
    match &run.decoder_type {
        Some(decoder) => {
            eprintln!("Deobfuscation complete: {}", run.input);
            eprintln!("  Decoder type: {decoder}");
            eprintln!("  Payload:      {} bytes", run.payload_size);
            if run.table_records_recovered > 0 || run.table_records_skipped > 0 {
                eprintln!(
                    "  Strings:      {} recovered from lookup table, {} record(s) skipped",
                    run.table_records_recovered, run.table_records_skipped
                );
            } else {
                eprintln!(
                    "  Strings:      {} recovered, {} accessor(s) skipped",
                    run.accessors_recovered, run.accessors_skipped
                );
            }
            eprintln!(
                "  Call sites:   {} replaced across {} method(s)",
                run.calls_replaced, run.methods_patched
            );
            if run.residual_calls > 0 {
                eprintln!(
                    "  Warning:      {} decoder call(s) left in place",
                    run.residual_calls
                );
            }
        }
        None => {
            eprintln!(
                "No string decoder detected in {}; module left unchanged",
                run.input
            );
        }
    }

    match (&run.output, run.written) {
        (Some(output), true) => eprintln!("  Written to:   {output}"),
        (Some(output), false) => eprintln!("  Dry run:      {output} not written"),
        (None, _) => {}
    }
}

fn display_scan(report: &ScanReport) {
    let Some(decoder) = &report.decoder_type else {
        println!("{}: no string decoder detected", report.input);
        return;
    };

    println!("Decoder type: {decoder}");
    if let Some(field) = &report.payload_field {
        println!("Payload:      field `{field}`, {} bytes", report.payload_size);
    }
    println!();

    let mut tw = TabWriter::new(vec![
        ("Accessor", Align::Left),
        ("Len", Align::Right),
        ("String", Align::Left),
    ]);
    for entry in &report.strings {
        tw.row(vec![
            entry.accessor.clone(),
            entry.literal.chars().count().to_string(),
            preview(&entry.literal),
        ]);
    }
    tw.print();
    println!("\n{} string(s) recovered.", report.strings.len());
}

fn backup_path(input: &Path) -> PathBuf {
    let mut name = input.as_os_str().to_os_string();
    name.push(".backup");
    PathBuf::from(name)
}

fn display_name(path: &Path) -> String {
    path.display().to_string()
}
