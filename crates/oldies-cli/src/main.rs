//! # OldiesRules CLI
//!
//! Command-line interface for the precise-timing NEST core.

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use oldies_core::{TimeGrid, TimeSeries};
use oldies_nest::{cv_isi, mean_firing_rate, DelayRegistry, Network, NetworkConfig, NodeId, SpikeData};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "oldies")]
#[command(author = "Yatrogenesis")]
#[command(version = "0.1.0")]
#[command(about = "Precise spike timing simulator", long_about = None)]
struct Cli {
    /// More log output (-v info, -vv debug, -vvv trace); RUST_LOG overrides
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a network described in JSON
    Simulate {
        /// Network description
        config: PathBuf,
        /// Override the simulation time (ms)
        #[arg(short, long)]
        time: Option<f64>,
        /// Override the number of threads
        #[arg(short = 'j', long)]
        threads: Option<usize>,
        /// Write spikes and membrane traces as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Split delays into whole steps and an offset correction
    Decompose {
        /// Simulation resolution (ms)
        #[arg(short, long, default_value_t = 0.1)]
        resolution: f64,
        /// Delays (ms)
        #[arg(required = true)]
        delays: Vec<f64>,
    },

    /// List threshold crossing strategies
    Strategies,
}

#[derive(Serialize)]
struct Recording<'a> {
    spikes: &'a SpikeData,
    membrane: BTreeMap<NodeId, &'a TimeSeries>,
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn simulate(
    config_path: PathBuf,
    time: Option<f64>,
    threads: Option<usize>,
    output: Option<PathBuf>,
) -> anyhow::Result<()> {
    let mut config = NetworkConfig::from_file(&config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;
    if let Some(n) = threads {
        config.kernel.num_threads = n;
    }
    let duration = time.unwrap_or(config.simulation_time);

    println!("{} {}", "Loading network:".green().bold(), config_path.display());
    let mut net = Network::from_config(&config).context("Failed to build network")?;
    let neurons: Vec<NodeId> = (1..=net.n_nodes()).filter(|&id| net.neuron(id).is_ok()).collect();
    info!(config = %config_path.display(), nodes = net.n_nodes(), duration, "network built");
    println!(
        "  {} nodes ({} neurons), {} connections, h = {} ms, {} thread(s)",
        net.n_nodes(),
        neurons.len(),
        net.connections().len(),
        net.grid().resolution(),
        config.kernel.num_threads
    );

    let bar = ProgressBar::new(net.grid().ms_to_steps(duration).max(0) as u64);
    bar.set_style(
        ProgressStyle::with_template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} steps")?
            .progress_chars("#>-"),
    );
    net.simulate_with_progress(duration, |done, _| bar.set_position(done as u64))
        .context("Simulation aborted")?;
    bar.finish_and_clear();

    let data = net.spike_data();
    println!(
        "{} {} ms, min delay {} ms, max delay {} ms",
        "Simulated".green().bold(),
        duration,
        net.delays().min_delay(),
        net.delays().max_delay()
    );
    println!(
        "  {} spikes, mean rate {:.2} Hz",
        data.n_events().to_string().cyan(),
        mean_firing_rate(data, neurons.len(), duration)
    );
    let trains: BTreeMap<NodeId, Vec<f64>> = data.spike_trains().into_iter().collect();
    for (id, train) in &trains {
        println!(
            "  node {:>4}: {:>5} spikes, CV(ISI) {:.3}, first at {}",
            id,
            train.len(),
            cv_isi(train),
            train.first().map_or("-".to_string(), |t| format!("{t:.6} ms"))
        );
    }

    if let Some(path) = output {
        let mut membrane = BTreeMap::new();
        for &id in &config.record_membrane {
            if let Some(trace) = net.membrane_trace(id)? {
                membrane.insert(id, trace);
            }
        }
        let json = serde_json::to_string_pretty(&Recording { spikes: data, membrane })?;
        std::fs::write(&path, json).with_context(|| format!("Failed to write {}", path.display()))?;
        println!("{} {}", "Recording written to".green().bold(), path.display());
    }
    Ok(())
}

fn decompose(resolution: f64, delays: &[f64]) -> anyhow::Result<()> {
    let grid = TimeGrid::new(resolution)?;
    let mut registry = DelayRegistry::new(grid);
    println!("{} h = {} ms", "Delay decomposition,".green().bold(), resolution);
    for &delay in delays {
        match registry.decompose(delay) {
            Ok(d) => println!(
                "  {:>10} ms -> {} steps - {:.6} ms",
                delay,
                d.integer_steps.to_string().cyan(),
                d.offset_correction
            ),
            Err(e) => println!("  {:>10} ms -> {}", delay, e.to_string().red()),
        }
    }
    println!(
        "  min delay {} ms, max delay {} ms",
        registry.min_delay(),
        registry.max_delay()
    );
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Simulate {
            config,
            time,
            threads,
            output,
        } => simulate(config, time, threads, output)?,

        Commands::Decompose { resolution, delays } => decompose(resolution, &delays)?,

        Commands::Strategies => {
            println!("{}", "Threshold crossing strategies:".green().bold());
            println!();
            println!(
                "  {} - polynomial fit through the step ends, order 0-3",
                r#"{"mode":"interpolation","order":3}"#.cyan()
            );
            println!("  {} - exact bisection on the propagated state", r#"{"mode":"bisection"}"#.cyan());
            println!(
                "  {} - closed-form region tests, catches excursions inside a step",
                r#"{"mode":"state_space"}"#.cyan()
            );
            println!();
            println!("  state_space needs tau_syn_ex == tau_syn_in != tau_m");
        }
    }

    Ok(())
}
