mod calibration;
mod identification;
mod measurement;
mod particle;
mod reconstruction;
mod status;

use anyhow::{Context, Result};
use clap::Parser;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusBuilder;
use multidet_array::{
    DetectorArray, TargetOrientation,
    calibration::CalibrationDefinition,
    event::{self, ArrayEvent, EventError},
};
use multidet_common::{
    RunNumber, init_tracer,
    metrics::{
        failures::{self, FailureKind},
        names::{
            COHERENCY_PASSES, EVENTS_PROCESSED, FAILURES, IDENTIFICATION_CODES,
            PARTICLES_RECONSTRUCTED,
        },
    },
    tracer::TracerOptions,
};
use rayon::prelude::*;
use reconstruction::Reconstructor;
use std::{
    fs::File,
    io::{BufReader, BufWriter, Write},
    net::SocketAddr,
    path::PathBuf,
};
use tracing::{debug, info, warn};

/// Number of events reconstructed in parallel before being written out.
const EVENTS_PER_BATCH: usize = 4096;

#[derive(Debug, Parser)]
#[clap(author, version, about)]
struct Cli {
    /// Description of the array: detectors, telescopes and target
    #[clap(long)]
    array: PathBuf,

    /// Events to reconstruct, one JSON event per line
    #[clap(long)]
    input: PathBuf,

    /// File receiving one JSON reconstructed event per line, standard output if absent
    #[clap(long)]
    output: Option<PathBuf>,

    /// Calibration files, needed to reconstruct events of raw parameters
    #[clap(long)]
    calibration: Vec<PathBuf>,

    /// Run number selecting the calibrations
    #[clap(long, env, default_value_t = 0)]
    run: RunNumber,

    /// Whether the particles are leaving the target (outgoing) or entering it (incoming)
    #[clap(long, env)]
    target_orientation: Option<TargetOrientation>,

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
    multidet_common::metrics::component_info_metric("event-reconstructor");
    describe_metrics();

    let mut array = DetectorArray::from_file(&args.array)
        .with_context(|| format!("Loading {}", args.array.display()))?;
    for path in &args.calibration {
        let definition = CalibrationDefinition::from_file(path)
            .with_context(|| format!("Loading {}", path.display()))?;
        let calibrators = definition.apply(&mut array, args.run);
        debug!("{}: {calibrators} calibrators", path.display());
    }
    if let Some(orientation) = args.target_orientation {
        array.set_target_orientation(orientation);
    }
    if array
        .target()
        .is_some_and(|target| target.orientation().is_none())
    {
        warn!("Target orientation unset, particles will not be calibrated");
    }
    info!(
        "Array {}: {} detectors, {} telescopes, {} groups",
        array.name(),
        array.detectors().len(),
        array.telescopes().len(),
        array.groups().len()
    );

    let reader = BufReader::new(
        File::open(&args.input).with_context(|| format!("Opening {}", args.input.display()))?,
    );
    let mut writer: BufWriter<Box<dyn Write>> = BufWriter::new(match &args.output {
        Some(path) => Box::new(
            File::create(path).with_context(|| format!("Creating {}", path.display()))?,
        ),
        None => Box::new(std::io::stdout().lock()),
    });

    let reconstructor = Reconstructor::new(&array);
    let mut lines = event::read_lines::<_, ArrayEvent>(reader).peekable();
    let mut processed = 0;
    while lines.peek().is_some() {
        let batch = read_batch(&mut lines)?;
        let reconstructed: Vec<_> = batch
            .par_iter()
            .map(|array_event| reconstructor.reconstruct_event(array_event))
            .collect();
        for event in &reconstructed {
            if let Err(e) = event::write_line(&mut writer, event) {
                counter!(
                    FAILURES,
                    &[failures::get_label(FailureKind::FileWriteFailed)]
                )
                .increment(1);
                return Err(e.into());
            }
            counter!(EVENTS_PROCESSED).increment(1);
        }
        processed += reconstructed.len();
    }
    writer.flush()?;
    info!("{processed} events reconstructed");
    Ok(())
}

/// Reads up to a batch of events. Malformed lines are reported and skipped, read
/// failures end the run.
fn read_batch<I>(lines: &mut I) -> Result<Vec<ArrayEvent>, EventError>
where
    I: Iterator<Item = Result<ArrayEvent, EventError>>,
{
    let mut batch = Vec::with_capacity(EVENTS_PER_BATCH);
    for line in lines.by_ref() {
        match line {
            Ok(array_event) => batch.push(array_event),
            Err(e @ EventError::Malformed { .. }) => {
                warn!("{e}");
                counter!(
                    FAILURES,
                    &[failures::get_label(FailureKind::MalformedEvent)]
                )
                .increment(1);
            }
            Err(e) => return Err(e),
        }
        if batch.len() == EVENTS_PER_BATCH {
            break;
        }
    }
    Ok(batch)
}

fn describe_metrics() {
    metrics::describe_counter!(
        EVENTS_PROCESSED,
        metrics::Unit::Count,
        "Number of events reconstructed"
    );
    metrics::describe_counter!(
        PARTICLES_RECONSTRUCTED,
        metrics::Unit::Count,
        "Number of particles seeded in fired detectors"
    );
    metrics::describe_counter!(
        IDENTIFICATION_CODES,
        metrics::Unit::Count,
        "Number of reconstructed particles by identification code"
    );
    metrics::describe_counter!(
        COHERENCY_PASSES,
        metrics::Unit::Count,
        "Number of passes needed to resolve particles sharing detectors"
    );
    metrics::describe_counter!(
        FAILURES,
        metrics::Unit::Count,
        "Number of failures encountered"
    );
}

#[cfg(test)]
pub(crate) mod tests {
    use multidet_array::{
        ArrayBuilder, Detector, DetectorArray, DetectorGeometry,
        material::{Absorber, MaterialTable},
    };
    use multidet_common::{ChargeNumber, Energy, MassNumber};

    fn silicon(name: &str, phi: (f64, f64)) -> Detector {
        let table = MaterialTable::standard();
        Detector::new(
            name,
            "SI",
            vec![Absorber::from_micrometres(table.lookup("Si").unwrap(), 300.0)],
            0,
            DetectorGeometry::new((10.0, 20.0), phi, 20.0),
        )
        .unwrap()
    }

    fn build(unsegmented: Option<&str>, silicon_csi: bool) -> DetectorArray {
        let table = MaterialTable::standard();
        let chamber = Detector::new(
            "CI_01",
            "CI",
            vec![Absorber::gas(table.lookup("C4H10").unwrap(), 5.0, 50.0, 20.0)],
            0,
            DetectorGeometry::new((10.0, 20.0), (0.0, 60.0), 10.0),
        )
        .unwrap();
        let csi = Detector::new(
            "CSI_01",
            "CSI",
            vec![Absorber::from_micrometres(table.lookup("CsI").unwrap(), 100_000.0)],
            0,
            DetectorGeometry::new((10.0, 20.0), (0.0, 30.0), 25.0),
        )
        .unwrap();
        let mut builder = ArrayBuilder::new("RING").detector(chamber);
        for silicon in [silicon("SI_01", (0.0, 30.0)), silicon("SI_02", (30.0, 60.0))] {
            let segmented = unsegmented != Some(silicon.name());
            builder = builder.detector(silicon.with_segmented(segmented));
        }
        builder = builder.detector(csi);
        if silicon_csi {
            builder = builder.telescope("RING.SI-CSI", "delta-e-e").unwrap();
        }
        builder
            .telescope("RING.CI-SI", "delta-e-e-z-only")
            .unwrap()
            .scan_steps(4)
            .build()
            .unwrap()
    }

    /// An ionisation chamber in front of two silicons, the first backed by a CsI.
    pub(crate) fn ring() -> DetectorArray {
        build(None, true)
    }

    /// Same ring, without an identification method for the silicon-CsI pairs.
    pub(crate) fn ring_without_silicon_csi() -> DetectorArray {
        build(None, false)
    }

    pub(crate) fn ring_with_unsegmented(detector: &str) -> DetectorArray {
        build(Some(detector), true)
    }

    /// Energies lost in the active layers of `detectors`, crossed nearest first.
    pub(crate) fn stopping_losses(
        array: &DetectorArray,
        detectors: &[&str],
        z: ChargeNumber,
        a: MassNumber,
        energy: Energy,
    ) -> Vec<Energy> {
        let mut energy = energy;
        detectors
            .iter()
            .map(|name| {
                let losses = array
                    .detector_by_name(name)
                    .unwrap()
                    .layer_losses(z, a, energy);
                energy = losses.residual;
                losses.active()
            })
            .collect()
    }
}
