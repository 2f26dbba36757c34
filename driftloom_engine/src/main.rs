// Driftloom CLI: headless transport driver.
//
// Builds a sequencer, fills some loops, then plays the transport for a number
// of measures with evolution enabled, printing each tick and the final
// matrix. Optionally writes the final state as JSON.
//
// Usage:
//   cargo run -p driftloom_engine -- [--measures N] [--seed N] [--loops N]
//     [--scale NAME] [--mode MODE] [--interval N] [--bpm N]
//     [--config config.json] [--export state.json]
//
// Modes: classic, momentum, call-response, tension-release

use driftloom_engine::config::EngineConfig;
use driftloom_engine::engine::Sequencer;
use driftloom_engine::evolution::EvolutionMode;
use driftloom_engine::matrix::{LoopId, MAX_LOOPS};
use driftloom_engine::scale::ScaleBook;
use std::path::Path;
use std::process::ExitCode;

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();

    let measures: u64 = parse_flag(&args, "--measures").unwrap_or(16);
    let seed: u64 = parse_flag(&args, "--seed").unwrap_or(1);
    let loops: usize = parse_flag::<usize>(&args, "--loops").unwrap_or(4).clamp(1, MAX_LOOPS);
    let bpm: u64 = parse_flag::<u64>(&args, "--bpm").unwrap_or(120).max(1);
    let interval: Option<u64> = parse_flag(&args, "--interval");
    let scale: Option<String> = parse_flag(&args, "--scale");
    let mode_name: Option<String> = parse_flag(&args, "--mode");
    let config_path: Option<String> = parse_flag(&args, "--config");
    let export_path: Option<String> = parse_flag(&args, "--export");

    let mut config = match &config_path {
        Some(path) => match EngineConfig::load(Path::new(path)) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Failed to load config {path}: {e}");
                return ExitCode::FAILURE;
            }
        },
        None => EngineConfig::default(),
    };
    if let Some(name) = &mode_name {
        match EvolutionMode::from_label(name) {
            Some(mode) => config.evolution.mode = mode,
            None => {
                eprintln!("Unknown mode '{name}', expected one of: {}", mode_labels());
                return ExitCode::FAILURE;
            }
        }
    }
    if let Some(name) = &scale {
        let book = ScaleBook::builtin();
        if !book.contains(name) {
            let names: Vec<&str> = book.names().collect();
            eprintln!("Unknown scale '{name}', expected one of: {}", names.join(", "));
            return ExitCode::FAILURE;
        }
        config.default_scale = name.clone();
    }

    println!("=== Driftloom ===");
    println!("Seed: {seed}");
    println!("Loops: {loops}");
    println!("Measures: {measures} at {bpm} BPM");
    println!("Scale: {}", config.default_scale);
    println!("Evolution: {}", config.evolution.mode.label());
    println!();

    match run(config, seed, loops, measures, bpm, interval, export_path.as_deref()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(
    config: EngineConfig,
    seed: u64,
    loops: usize,
    measures: u64,
    bpm: u64,
    interval: Option<u64>,
    export_path: Option<&str>,
) -> driftloom_engine::Result<()> {
    let steps_per_measure = config.steps_per_measure;
    let mut seq = Sequencer::new(config, seed)?;
    for i in 0..loops {
        seq.add_loop(LoopId(i))?;
    }
    if let Some(m) = interval {
        seq.set_evolve_interval(m);
    }

    println!("[1/3] Initial loops");
    print!("{}", seq.summary());
    println!();

    // Four steps per beat.
    let step_ms = 60_000 / (bpm * 4);
    seq.set_evolution_enabled(true);

    println!("[2/3] Playing");
    for step in 0..measures * steps_per_measure {
        if let Some(report) = seq.on_step(step, step * step_ms)? {
            let labels: Vec<&str> = report.intents.iter().map(|i| i.label()).collect();
            let scale = report
                .scale_change
                .as_deref()
                .map(|s| format!(" scale -> {s};"))
                .unwrap_or_default();
            println!(
                "  measure {:>3}:{scale} {} loops [{}] energy {:.2} -> {:.2}",
                report.measure,
                report.touched.len(),
                labels.join(", "),
                report.balance.before,
                report.balance.after
            );
        }
    }
    println!();

    println!("[3/3] Final loops ({} ticks applied)", seq.ticks_applied());
    print!("{}", seq.summary());

    if let Some(path) = export_path {
        std::fs::write(path, seq.to_json()?)?;
        println!();
        println!("State written to {path}");
    }
    Ok(())
}

fn mode_labels() -> String {
    EvolutionMode::ALL
        .iter()
        .map(|m| m.label())
        .collect::<Vec<_>>()
        .join(", ")
}

fn parse_flag<T: std::str::FromStr>(args: &[String], flag: &str) -> Option<T> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|v| v.parse().ok())
}
