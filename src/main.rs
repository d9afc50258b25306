// src/main.rs
//! `circulation`: run a circulation measurement on the simulated card, inspect
//! a pulse file, or print the effective acquisition configuration.
use std::path::{Path, PathBuf};
use std::sync::mpsc::channel;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{debug, info, warn};
use nsor_circulation::drivers::{
    render_pulse_png, render_spectrum_png, render_trace_png, PlotStyle, PulseCompiler,
    SimulatedCard, SpectrumResult, TailPolicy,
};
use nsor_circulation::{AcquisitionController, AcquisitionEvent, LiveSpectra, Parameters, TraceRecorder};

#[derive(Parser)]
#[command(name = "circulation")]
#[command(version)]
#[command(about = "Pulse compiler and averaged acquisition for NSOR circulation measurements")]
struct Cli {
    /// Parameter file (flat JSON object)
    #[arg(short, long, global = true, default_value = "parameter.txt")]
    params: PathBuf,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile the pulse, acquire every iteration and save the averaged traces
    Run {
        /// Let the simulated card take as long as the pulse really lasts
        #[arg(long)]
        simulate_realtime: bool,

        /// Noise seed of the simulated card
        #[arg(long, default_value_t = 0)]
        seed: u64,

        /// Write trace and spectrum plots into this directory
        #[arg(long)]
        png: Option<PathBuf>,
    },

    /// Compile a pulse file and show what it produces
    Pulse {
        file: PathBuf,

        /// Sample rate in Hz
        #[arg(long, default_value_t = 1_000_000)]
        rate: u64,

        /// zero or hold
        #[arg(long, default_value = "zero")]
        tail: TailPolicy,

        /// Render the waveform to this PNG file
        #[arg(long)]
        png: Option<PathBuf>,
    },

    /// Print the effective acquisition configuration
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = match (cli.quiet, cli.verbose) {
        (true, _) => "warn",
        (false, 0) => "info",
        (false, 1) => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match cli.command {
        Commands::Run {
            simulate_realtime,
            seed,
            png,
        } => run(&cli.params, simulate_realtime, seed, png.as_deref()),
        Commands::Pulse {
            file,
            rate,
            tail,
            png,
        } => show_pulse(&file, rate, tail, png.as_deref()),
        Commands::Config => {
            let params = Parameters::load(&cli.params)
                .with_context(|| format!("reading {}", cli.params.display()))?;
            let config = params.acquisition_config()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn run(params_path: &Path, realtime: bool, seed: u64, png_dir: Option<&Path>) -> Result<()> {
    let params = Parameters::load(params_path)
        .with_context(|| format!("reading {}", params_path.display()))?;
    let config = params.acquisition_config()?;
    let pulse_path = params.pulse_path()?;
    let pulse = PulseCompiler::new(config.sample_rate_hz)?
        .with_tail(config.pulse_tail)
        .compile_file(&pulse_path, config.iteration_count)
        .with_context(|| format!("compiling {}", pulse_path.display()))?;
    if let Some(dir) = png_dir {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }

    let device = config
        .output_channels
        .first()
        .and_then(|ch| ch.trim_start_matches('/').split('/').next())
        .unwrap_or("Dev1")
        .to_string();
    let card = SimulatedCard::new(device).with_seed(seed).realtime(realtime);
    let mut controller = AcquisitionController::new(card.output_task(), card.input_task());
    controller.configure(&config, &pulse)?;

    let stop = controller.stop_signal();
    ctrlc::set_handler(move || {
        warn!("interrupt received, stopping after the current cycle");
        stop.request();
    })
    .context("installing the Ctrl-C handler")?;

    let recorder = params.output_file().map(TraceRecorder::new);
    let (tx, rx) = channel();
    controller.start(tx.clone())?;

    let mut live = LiveSpectra::new(config.spectrum_channels.clone());
    // newest (iteration, averages) seen so far, with its spectra
    let mut latest: Option<(usize, usize)> = None;
    let mut spectra: Vec<SpectrumResult> = Vec::new();
    for event in rx.iter() {
        if let Some(recorder) = &recorder {
            if let Err(err) = recorder.handle(&event) {
                warn!("could not save trace: {err}");
            }
        }
        match event {
            AcquisitionEvent::TraceUpdated(trace) => {
                info!(
                    "iteration {}/{}: average {}/{}",
                    trace.iteration + 1,
                    config.iteration_count,
                    trace.averages,
                    config.average_count
                );
                live.update(&trace, &tx);
            }
            AcquisitionEvent::IterationComplete(trace) => {
                live.complete(&trace, &tx);
                if let Some(dir) = png_dir {
                    let file = dir.join(format!("trace_iter{}.png", trace.iteration + 1));
                    save_png(&file, render_trace_png(&trace, PlotStyle::default()))?;
                }
            }
            AcquisitionEvent::SpectrumReady {
                iteration,
                averages,
                spectrum,
            } => keep_latest(&mut latest, &mut spectra, iteration, averages, spectrum),
            AcquisitionEvent::RunFinished(_) | AcquisitionEvent::RunFailed(_) => break,
        }
    }

    live.wait();
    for event in rx.try_iter() {
        if let AcquisitionEvent::SpectrumReady {
            iteration,
            averages,
            spectrum,
        } = event
        {
            keep_latest(&mut latest, &mut spectra, iteration, averages, spectrum);
        }
    }
    for spectrum in &spectra {
        log_spectrum(latest.map_or(0, |(iteration, _)| iteration), spectrum);
    }
    if let (Some(dir), false) = (png_dir, spectra.is_empty()) {
        save_png(&dir.join("spectrum.png"), render_spectrum_png(&spectra, PlotStyle::default()))?;
    }

    let outcome = controller.wait();
    controller.close()?;
    let summary = outcome.context("acquisition failed")?;
    info!(
        "{} of {} iteration(s) done, {} cycle(s){}",
        summary.iterations_completed,
        config.iteration_count,
        summary.cycles_completed,
        if summary.cancelled { ", cancelled" } else { "" }
    );
    Ok(())
}

fn show_pulse(file: &Path, rate: u64, tail: TailPolicy, png: Option<&Path>) -> Result<()> {
    let pulse = PulseCompiler::new(rate)?
        .with_tail(tail)
        .compile_file(file, 1)
        .with_context(|| format!("compiling {}", file.display()))?;
    for (idx, label) in pulse.channel_labels().iter().enumerate() {
        let row = pulse.waveform.channel(idx);
        let active = row.iter().filter(|v| **v != 0.0).count();
        let (lo, hi) = row
            .iter()
            .fold((0.0f64, 0.0f64), |(lo, hi), v| (lo.min(*v), hi.max(*v)));
        info!("{label}: {active} non-zero sample(s), range {lo} .. {hi} V");
    }
    println!(
        "{} channel(s), {} samples at {} Hz ({} ns)",
        pulse.waveform.channel_count(),
        pulse.sample_count(),
        pulse.sample_rate_hz(),
        pulse.duration_ns
    );
    if let Some(path) = png {
        save_png(path, render_pulse_png(&pulse, PlotStyle::default()))?;
    }
    Ok(())
}

/// Keep only the spectra of the newest average; older batches may still
/// arrive after a newer one.
fn keep_latest(
    latest: &mut Option<(usize, usize)>,
    spectra: &mut Vec<SpectrumResult>,
    iteration: usize,
    averages: usize,
    spectrum: SpectrumResult,
) {
    let key = (iteration, averages);
    debug!("spectrum of {} at iteration {} average {averages}", spectrum.channel, iteration + 1);
    match *latest {
        Some(current) if key < current => return,
        Some(current) if key == current => {
            spectra.retain(|s| s.channel != spectrum.channel);
        }
        _ => {
            *latest = Some(key);
            spectra.clear();
        }
    }
    spectra.push(spectrum);
}

fn log_spectrum(iteration: usize, spectrum: &SpectrumResult) {
    match spectrum.peak_frequency_hz() {
        Some(peak) => info!(
            "iteration {} {}: peak at {peak:.1} Hz ({} bins)",
            iteration + 1,
            spectrum.channel,
            spectrum.len()
        ),
        None => info!("iteration {} {}: {} bins", iteration + 1, spectrum.channel, spectrum.len()),
    }
}

fn save_png(path: &Path, png: Result<Vec<u8>, nsor_circulation::drivers::AcquisitionError>) -> Result<()> {
    let bytes = png.with_context(|| format!("rendering {}", path.display()))?;
    std::fs::write(path, bytes).with_context(|| format!("writing {}", path.display()))?;
    info!("wrote {}", path.display());
    Ok(())
}
