mod acquisition;
mod config;
mod simulation;

use anyhow::{Context, Result};
use clap::Parser;
use config::{SampleError, SimulationConfig};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusBuilder;
use multidet_array::{
    DetectorArray, TargetOrientation,
    calibration::CalibrationDefinition,
    event::{self, ArrayEvent},
};
use multidet_common::{
    RunNumber, init_tracer,
    metrics::{
        failures::{self, FailureKind},
        names::{DETECTION_OUTCOMES, EVENTS_PROCESSED, FAILURES, PARTICLES_SIMULATED},
    },
    tracer::TracerOptions,
};
use rand::{SeedableRng, rngs::StdRng};
use rayon::prelude::*;
use simulation::Simulator;
use std::{
    fs::File,
    io::{BufWriter, Write},
    net::SocketAddr,
    path::PathBuf,
};
use tracing::{debug, info};

/// Number of events simulated in parallel before being written out.
const EVENTS_PER_BATCH: u64 = 4096;

#[derive(Debug, Parser)]
#[clap(author, version, about)]
struct Cli {
    /// Simulation configuration: array, particle sources and number of events
    #[clap(long)]
    config: PathBuf,

    /// File receiving one JSON event per line, standard output if absent
    #[clap(long)]
    output: Option<PathBuf>,

    /// Calibration files, needed to produce raw parameters in physical mode
    #[clap(long)]
    calibration: Vec<PathBuf>,

    /// Run number selecting the calibrations
    #[clap(long, env, default_value_t = 0)]
    run: RunNumber,

    /// If set, metrics are served on this address
    #[clap(long, env)]
    observability_address: Option<SocketAddr>,
}

fn main() -> Result<()> {
    let _tracer = init_tracer!(TracerOptions::default());

    let args = Cli::parse();

    if let Some(address) = args.observability_address {
        PrometheusBuilder::new()
            .with_http_listener(address)
            .install()
            .context("Prometheus metrics exporter should be setup")?;
    }
    multidet_common::metrics::component_info_metric("detection-simulator");
    describe_metrics();

    let config = SimulationConfig::from_file(&args.config)
        .with_context(|| format!("Loading {}", args.config.display()))?;
    let mut array = DetectorArray::from_config(&config.array)?;
    // Simulated particles are reaction products leaving the target
    array.set_target_orientation(TargetOrientation::Outgoing);
    for path in &args.calibration {
        let definition = CalibrationDefinition::from_file(path)
            .with_context(|| format!("Loading {}", path.display()))?;
        let calibrators = definition.apply(&mut array, args.run);
        debug!("{}: {calibrators} calibrators", path.display());
    }
    info!(
        "Array {}: {} detectors, {} trajectories, {} telescopes, {} groups",
        array.name(),
        array.detectors().len(),
        array.trajectories().len(),
        array.telescopes().len(),
        array.groups().len()
    );

    let mut writer: BufWriter<Box<dyn Write>> = BufWriter::new(match &args.output {
        Some(path) => Box::new(
            File::create(path).with_context(|| format!("Creating {}", path.display()))?,
        ),
        None => Box::new(std::io::stdout().lock()),
    });

    let simulator = Simulator::new(
        &array,
        config.mode,
        config.track_neutrons,
        &config.resolution,
    );
    let mut first = 0;
    while first < config.events {
        let last = config.events.min(first + EVENTS_PER_BATCH);
        let events = (first..last)
            .into_par_iter()
            .map(|event_number| run_event(&simulator, &config, event_number))
            .collect::<Result<Vec<_>, _>>()?;
        for array_event in &events {
            if let Err(e) = event::write_line(&mut writer, array_event) {
                counter!(
                    FAILURES,
                    &[failures::get_label(FailureKind::FileWriteFailed)]
                )
                .increment(1);
                return Err(e.into());
            }
            counter!(EVENTS_PROCESSED).increment(1);
        }
        first = last;
    }
    writer.flush()?;
    info!("{} events simulated", config.events);
    Ok(())
}

/// Each event draws from its own generator so results do not depend on scheduling.
fn run_event(
    simulator: &Simulator<'_>,
    config: &SimulationConfig,
    event_number: u64,
) -> Result<ArrayEvent, SampleError> {
    let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(event_number));
    let mut ions = Vec::new();
    for source in &config.sources {
        ions.extend(source.emit(&mut rng)?);
    }
    Ok(simulator.simulate_event(event_number, ions, &mut rng))
}

fn describe_metrics() {
    metrics::describe_counter!(
        EVENTS_PROCESSED,
        metrics::Unit::Count,
        "Number of events simulated"
    );
    metrics::describe_counter!(
        PARTICLES_SIMULATED,
        metrics::Unit::Count,
        "Number of particles propagated through the array"
    );
    metrics::describe_counter!(
        DETECTION_OUTCOMES,
        metrics::Unit::Count,
        "Number of simulated particles by detection outcome"
    );
    metrics::describe_counter!(
        FAILURES,
        metrics::Unit::Count,
        "Number of failures encountered"
    );
}
