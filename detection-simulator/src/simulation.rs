use crate::acquisition::Acquisition;
use metrics::counter;
use multidet_array::{
    DetectorArray, DetectorId, Ion,
    detector::LayerLosses,
    event::{ArrayEvent, Detection, DetectorRecord, SimulatedParticle, SimulationMode, UndetectedReason},
};
use multidet_common::{
    ChargeNumber, Energy, EventNumber, MAX_SUPPORTED_Z, MassNumber,
    metrics::{
        detection_outcome,
        failures::{self, FailureKind},
        names::{DETECTION_OUTCOMES, FAILURES, PARTICLES_SIMULATED},
    },
};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, instrument, trace};

/// Energy deposited in each detector during one event.
///
/// Contributions of the particle being simulated stay provisional until its fate is
/// known, so that an incoherent particle leaves no trace.
#[derive(Debug, Default)]
pub(crate) struct EnergyLedger {
    committed: BTreeMap<DetectorId, Energy>,
    provisional: Vec<(DetectorId, Energy)>,
    /// Species of the first particle committed in each detector.
    first_contributor: HashMap<DetectorId, (ChargeNumber, MassNumber)>,
}

impl EnergyLedger {
    pub(crate) fn add_provisional(&mut self, detector: DetectorId, energy: Energy) {
        self.provisional.push((detector, energy));
    }

    pub(crate) fn commit(&mut self, z: ChargeNumber, a: MassNumber) {
        for (detector, energy) in self.provisional.drain(..) {
            *self.committed.entry(detector).or_default() += energy;
            self.first_contributor.entry(detector).or_insert((z, a));
        }
    }

    pub(crate) fn rollback(&mut self) {
        self.provisional.clear();
    }

    pub(crate) fn committed(&self) -> &BTreeMap<DetectorId, Energy> {
        &self.committed
    }

    pub(crate) fn first_contributor(&self, detector: DetectorId) -> Option<(ChargeNumber, MassNumber)> {
        self.first_contributor.get(&detector).copied()
    }
}

/// Propagates particles through a detector array and classifies their fate.
pub(crate) struct Simulator<'a> {
    array: &'a DetectorArray,
    mode: SimulationMode,
    track_neutrons: bool,
    resolution: &'a BTreeMap<String, f64>,
    acquisition: Acquisition,
}

impl<'a> Simulator<'a> {
    pub(crate) fn new(
        array: &'a DetectorArray,
        mode: SimulationMode,
        track_neutrons: bool,
        resolution: &'a BTreeMap<String, f64>,
    ) -> Self {
        Self {
            array,
            mode,
            track_neutrons,
            resolution,
            acquisition: Acquisition::default(),
        }
    }

    fn undetected(ion: Ion, reason: UndetectedReason) -> SimulatedParticle {
        SimulatedParticle::new(ion, Detection::Undetected(reason))
    }

    fn name(&self, detector: DetectorId) -> String {
        self.array
            .detector(detector)
            .map(|detector| detector.name().to_owned())
            .unwrap_or_else(|| detector.to_string())
    }

    /// Simulates the detection of one particle, recording its energy losses in `ledger`.
    /// The target is crossed first, the species checks then apply to what leaves it.
    pub(crate) fn detect(&self, emitted: Ion, ledger: &mut EnergyLedger) -> SimulatedParticle {
        let mut ion = emitted;
        let mut target_loss = 0.0;
        if let Some(target) = self.array.target() {
            match target.energy_loss(&ion) {
                Ok(loss) => target_loss = ion.lose_energy(loss),
                Err(e) => debug!("No target correction: {e}"),
            }
            if ion.is_stopped() {
                let mut particle = Self::undetected(emitted, UndetectedReason::StoppedInTarget);
                particle.target_loss = target_loss;
                return particle;
            }
        }

        let undetected = |reason| {
            let mut particle = Self::undetected(emitted, reason);
            particle.target_loss = target_loss;
            particle
        };
        if emitted.z > MAX_SUPPORTED_Z {
            return undetected(UndetectedReason::Superheavy);
        }
        if emitted.is_neutral() && !self.track_neutrons {
            return undetected(UndetectedReason::Neutron);
        }
        if emitted.energy <= 0.0 {
            return undetected(UndetectedReason::NoEnergy);
        }

        let crossed = self.array.crossed_detectors(ion.theta, ion.phi);
        let mut particle = self.propagate(emitted, ion, &crossed, ledger);
        particle.target_loss = target_loss;
        particle
    }

    fn propagate(
        &self,
        emitted: Ion,
        mut ion: Ion,
        crossed: &[DetectorId],
        ledger: &mut EnergyLedger,
    ) -> SimulatedParticle {
        let Some(first) = crossed.first().and_then(|id| self.array.detector(*id)) else {
            let reason = if ion.is_neutral() {
                UndetectedReason::Neutron
            } else {
                UndetectedReason::NoHit
            };
            return Self::undetected(emitted, reason);
        };
        if ion.is_neutral() {
            let mut particle = Self::undetected(emitted, UndetectedReason::Neutron);
            particle.energy_losses = crossed.iter().map(|id| (self.name(*id), 0.0)).collect();
            particle.residual_energy = ion.energy;
            return particle;
        }
        if first.geometry().in_dead_zone(ion.theta, ion.phi) {
            return Self::undetected(emitted, UndetectedReason::DeadZone);
        }

        let mut traversed: Vec<(DetectorId, LayerLosses)> = Vec::with_capacity(crossed.len());
        for id in crossed {
            let Some(detector) = self.array.detector(*id) else {
                continue;
            };
            let losses = detector.layer_losses(ion.z, ion.a, ion.energy);
            ion.lose_energy(losses.total());
            ledger.add_provisional(*id, losses.active());
            let punched_through = losses.punched_through();
            traversed.push((*id, losses));
            if !punched_through {
                break;
            }
        }

        let mut particle = SimulatedParticle::new(
            emitted,
            Detection::Detected {
                incomplete: false,
                punch_through: false,
            },
        );
        particle.energy_losses = traversed
            .iter()
            .map(|(id, losses)| (self.name(*id), losses.active()))
            .collect();
        particle.residual_energy = ion.energy;

        let chain: Vec<DetectorId> = traversed.iter().rev().map(|(id, _)| *id).collect();
        if !self.array.is_trajectory_tail(&chain) {
            trace!("Crossed chain {chain:?} is not a trajectory");
            ledger.rollback();
            particle.detection = Detection::Undetected(UndetectedReason::GeometryIncoherency);
            counter!(
                FAILURES,
                &[failures::get_label(FailureKind::GeometryIncoherency)]
            )
            .increment(1);
            return particle;
        }

        // The particle is seen up to the last detector with a deposit above threshold
        let seen = traversed.iter().rposition(|(id, losses)| {
            self.array
                .detector(*id)
                .is_some_and(|detector| losses.active() > detector.threshold().max(0.0))
        });
        let Some(seen) = seen else {
            ledger.rollback();
            particle.detection = Detection::Undetected(UndetectedReason::Threshold);
            return particle;
        };
        let seen_chain: Vec<DetectorId> = traversed
            .get(..=seen)
            .into_iter()
            .flatten()
            .rev()
            .map(|(id, _)| *id)
            .collect();
        let telescope = self
            .array
            .identifying_telescope(&seen_chain)
            .and_then(|id| self.array.telescope(id));
        particle.stopping_detector = seen_chain.first().map(|id| self.name(*id));
        particle.telescope = telescope.map(|telescope| telescope.name().to_owned());
        particle.detection = Detection::Detected {
            incomplete: !telescope.is_some_and(|telescope| telescope.is_ready()),
            punch_through: ion.energy > 0.0,
        };
        ledger.commit(ion.z, ion.a);
        particle
    }

    fn smear<R: Rng>(&self, detector: DetectorId, energy: Energy, rng: &mut R) -> Energy {
        let sigma = self
            .array
            .detector(detector)
            .and_then(|detector| self.resolution.get(detector.type_label()))
            .copied()
            .unwrap_or_default();
        if sigma <= 0.0 {
            return energy;
        }
        match Normal::new(energy, sigma * energy) {
            Ok(normal) => normal.sample(rng).max(0.0),
            Err(_) => energy,
        }
    }

    /// Simulates the detection of all particles emitted in one event.
    #[instrument(skip_all, fields(event = event_number))]
    pub(crate) fn simulate_event<R: Rng>(
        &self,
        event_number: EventNumber,
        ions: Vec<Ion>,
        rng: &mut R,
    ) -> ArrayEvent {
        let mut ledger = EnergyLedger::default();
        let particles: Vec<SimulatedParticle> = ions
            .into_iter()
            .map(|ion| {
                let particle = self.detect(ion, &mut ledger);
                counter!(PARTICLES_SIMULATED).increment(1);
                counter!(
                    DETECTION_OUTCOMES,
                    &[detection_outcome::get_label(particle.detection.label())]
                )
                .increment(1);
                particle
            })
            .collect();

        let detectors = ledger
            .committed()
            .iter()
            .filter_map(|(id, energy)| {
                let detector = self.array.detector(*id)?;
                let energy = self.smear(*id, *energy, rng);
                if energy <= detector.threshold().max(0.0) {
                    return None;
                }
                let mut record = DetectorRecord {
                    detector: detector.name().to_owned(),
                    energy_loss: Some(energy),
                    ..Default::default()
                };
                if self.mode == SimulationMode::Physical {
                    // Detectors without raw parameters stay unfired
                    let (z, a) = ledger.first_contributor(*id)?;
                    record.signals = self.acquisition.synthesise(detector, energy, z, a)?;
                }
                Some(record)
            })
            .collect();

        ArrayEvent {
            event_number,
            mode: self.mode,
            detectors,
            particles,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use multidet_array::{
        ArrayBuilder, Detector, DetectorGeometry, StoppingFunctions, Target, TargetOrientation,
        calibration::{CalibrationFunction, Calibrator},
        material::{Absorber, MaterialTable},
    };
    use rand::{SeedableRng, rngs::StdRng};

    fn layer(material: &str, thickness_um: f64) -> Absorber {
        Absorber::from_micrometres(MaterialTable::standard().lookup(material).unwrap(), thickness_um)
    }

    fn detector(name: &str, type_label: &str, layers: Vec<Absorber>, active: usize, phi: (f64, f64), distance: f64) -> Detector {
        Detector::new(
            name,
            type_label,
            layers,
            active,
            DetectorGeometry::new((10.0, 20.0), phi, distance),
        )
        .unwrap()
    }

    /// Two silicon-CsI telescopes side by side; the second CsI is narrower than its
    /// silicon, leaving directions that cross a silicon with nothing behind it.
    fn wall() -> DetectorArray {
        ArrayBuilder::new("WALL")
            .detector(detector("SI_01", "SI", vec![layer("Si", 300.0)], 0, (0.0, 30.0), 20.0))
            .detector(
                detector("CSI_01", "CSI", vec![layer("Myl", 20.0), layer("CsI", 100_000.0)], 1, (0.0, 30.0), 25.0)
                    .with_threshold(0.5),
            )
            .detector(
                detector("SI_02", "SI", vec![layer("Si", 300.0)], 0, (30.0, 60.0), 20.0),
            )
            .detector(detector("CSI_02", "CSI", vec![layer("CsI", 100_000.0)], 0, (40.0, 60.0), 25.0))
            .telescope("WALL.SI-CSI", "delta-e-e")
            .unwrap()
            .scan_steps(4)
            .build()
            .unwrap()
    }

    fn simulator(array: &DetectorArray) -> Simulator<'_> {
        static NO_SMEARING: BTreeMap<String, f64> = BTreeMap::new();
        Simulator::new(array, SimulationMode::Filter, false, &NO_SMEARING)
    }

    fn reason(particle: &SimulatedParticle) -> Option<UndetectedReason> {
        match particle.detection {
            Detection::Undetected(reason) => Some(reason),
            Detection::Detected { .. } => None,
        }
    }

    #[test]
    fn species_checks_come_first() {
        let array = wall();
        let simulator = simulator(&array);
        let mut ledger = EnergyLedger::default();
        let superheavy = simulator.detect(Ion::new(110, 280, 1000.0, 15.0, 15.0), &mut ledger);
        assert_eq!(reason(&superheavy), Some(UndetectedReason::Superheavy));
        let neutron = simulator.detect(Ion::new(0, 1, 10.0, 15.0, 15.0), &mut ledger);
        assert_eq!(reason(&neutron), Some(UndetectedReason::Neutron));
        let at_rest = simulator.detect(Ion::new(2, 4, 0.0, 15.0, 15.0), &mut ledger);
        assert_eq!(reason(&at_rest), Some(UndetectedReason::NoEnergy));
        let missed = simulator.detect(Ion::new(2, 4, 50.0, 80.0, 15.0), &mut ledger);
        assert_eq!(reason(&missed), Some(UndetectedReason::NoHit));
        assert!(ledger.committed().is_empty());
    }

    #[test]
    fn target_comes_before_the_species_checks() {
        let array = ArrayBuilder::new("FRAME")
            .detector(Detector::new(
                "SI_01",
                "SI",
                vec![layer("Si", 300.0)],
                0,
                DetectorGeometry::new((10.0, 20.0), (0.0, 30.0), 20.0),
            )
            .unwrap())
            .target(
                Target::new(Absorber::from_area_density(
                    MaterialTable::standard().lookup("Au").unwrap(),
                    5.0,
                ))
                .with_orientation(TargetOrientation::Outgoing),
            )
            .build()
            .unwrap();
        let simulator = simulator(&array);
        let mut ledger = EnergyLedger::default();
        let at_rest = simulator.detect(Ion::new(2, 4, 0.0, 15.0, 15.0), &mut ledger);
        assert_eq!(reason(&at_rest), Some(UndetectedReason::StoppedInTarget));
        let neutron = simulator.detect(Ion::new(0, 1, 10.0, 15.0, 15.0), &mut ledger);
        assert_eq!(reason(&neutron), Some(UndetectedReason::Neutron));
        assert_eq!(neutron.target_loss, 0.0);
        let superheavy = simulator.detect(Ion::new(110, 280, 5000.0, 15.0, 15.0), &mut ledger);
        assert_eq!(reason(&superheavy), Some(UndetectedReason::Superheavy));
        assert!(superheavy.target_loss > 0.0);
        assert!(ledger.committed().is_empty());
    }

    #[test]
    fn tracked_neutrons_cross_detectors() {
        let array = wall();
        let resolution = BTreeMap::new();
        let simulator = Simulator::new(&array, SimulationMode::Filter, true, &resolution);
        let mut ledger = EnergyLedger::default();
        let neutron = simulator.detect(Ion::new(0, 1, 10.0, 15.0, 15.0), &mut ledger);
        assert_eq!(reason(&neutron), Some(UndetectedReason::Neutron));
        assert_eq!(neutron.energy_losses.len(), 2);
        let missed = simulator.detect(Ion::new(0, 1, 10.0, 80.0, 15.0), &mut ledger);
        assert_eq!(reason(&missed), Some(UndetectedReason::Neutron));
    }

    #[test]
    fn alpha_stopping_in_csi_is_detected() {
        let array = wall();
        let simulator = simulator(&array);
        let mut ledger = EnergyLedger::default();
        let alpha = Ion::new(2, 4, 120.0, 15.0, 15.0);
        let particle = simulator.detect(alpha, &mut ledger);

        assert_eq!(
            particle.detection,
            Detection::Detected {
                incomplete: false,
                punch_through: false
            }
        );
        assert_eq!(particle.stopping_detector.as_deref(), Some("CSI_01"));
        assert_eq!(particle.telescope.as_deref(), Some("ID_SI_01_CSI_01"));
        let si = array.detector_by_name("SI_01").unwrap();
        assert_approx_eq!(
            particle.energy_losses["SI_01"],
            si.delta_e(2, 4, 120.0),
            1e-9
        );
        // The window in front of the CsI takes its share
        let deposited: Energy = particle.energy_losses.values().sum();
        assert!(deposited < 120.0);
        assert_eq!(ledger.committed().len(), 2);
    }

    #[test]
    fn stopping_in_front_silicon_is_incomplete() {
        let array = wall();
        let simulator = simulator(&array);
        let mut ledger = EnergyLedger::default();
        // A 10 MeV alpha stops in 300 µm of silicon
        let particle = simulator.detect(Ion::new(2, 4, 10.0, 15.0, 15.0), &mut ledger);
        assert_eq!(
            particle.detection,
            Detection::Detected {
                incomplete: true,
                punch_through: false
            }
        );
        assert_eq!(particle.stopping_detector.as_deref(), Some("SI_01"));
    }

    #[test]
    fn stopping_in_an_inactive_window_is_below_threshold() {
        let array = ArrayBuilder::new("WINDOW")
            .detector(detector(
                "CSI_01",
                "CSI",
                vec![layer("Myl", 500.0), layer("CsI", 100_000.0)],
                1,
                (0.0, 30.0),
                25.0,
            ))
            .build()
            .unwrap();
        let simulator = simulator(&array);
        let mut ledger = EnergyLedger::default();
        let particle = simulator.detect(Ion::new(2, 4, 2.0, 15.0, 15.0), &mut ledger);
        assert_eq!(reason(&particle), Some(UndetectedReason::Threshold));
        assert!(ledger.committed().is_empty());
    }

    #[test]
    fn incoherent_chain_is_rolled_back() {
        let array = wall();
        let simulator = simulator(&array);
        let mut ledger = EnergyLedger::default();
        let first = simulator.detect(Ion::new(2, 4, 120.0, 15.0, 15.0), &mut ledger);
        assert!(first.detection.is_detected());
        let committed = ledger.committed().clone();

        let crossing = array.crossed_detectors(15.0, 35.0);
        assert_eq!(crossing.len(), 1);
        // Nothing behind SI_02 at phi 35, leaving it alone is the tail of a trajectory
        let escaping = simulator.detect(Ion::new(2, 4, 120.0, 15.0, 35.0), &mut ledger);
        assert!(escaping.detection.is_detected());
        assert_eq!(escaping.detection.label(), "PUNCH THROUGH");

        // A chain made up by hand is not
        let mut ledger = EnergyLedger::default();
        let fake = [
            array.detector_id("SI_02").unwrap(),
            array.detector_id("CSI_01").unwrap(),
        ];
        let particle = simulator.propagate(
            Ion::new(2, 4, 120.0, 15.0, 15.0),
            Ion::new(2, 4, 120.0, 15.0, 15.0),
            &fake,
            &mut ledger,
        );
        assert_eq!(reason(&particle), Some(UndetectedReason::GeometryIncoherency));
        assert!(ledger.committed().is_empty());
        assert!(!committed.is_empty());
    }

    #[test]
    fn dead_border_and_target() {
        let array = ArrayBuilder::new("FRAME")
            .detector(Detector::new(
                "SI_01",
                "SI",
                vec![layer("Si", 300.0)],
                0,
                DetectorGeometry::new((10.0, 20.0), (0.0, 30.0), 20.0).with_dead_border(1.0),
            )
            .unwrap())
            .target(
                Target::new(Absorber::from_area_density(
                    MaterialTable::standard().lookup("Au").unwrap(),
                    5.0,
                ))
                .with_orientation(TargetOrientation::Outgoing),
            )
            .build()
            .unwrap();
        let simulator = simulator(&array);
        let mut ledger = EnergyLedger::default();
        let framed = simulator.detect(Ion::new(2, 4, 50.0, 10.5, 15.0), &mut ledger);
        assert_eq!(reason(&framed), Some(UndetectedReason::DeadZone));
        let slow = simulator.detect(Ion::new(6, 12, 0.05, 15.0, 15.0), &mut ledger);
        assert_eq!(reason(&slow), Some(UndetectedReason::StoppedInTarget));
        let alpha = simulator.detect(Ion::new(2, 4, 50.0, 15.0, 15.0), &mut ledger);
        assert!(alpha.target_loss > 0.0);
        assert!(alpha.detection.is_detected());
    }

    #[test]
    fn pileup_sums_in_the_ledger() {
        let array = wall();
        let simulator = simulator(&array);
        let mut rng = StdRng::seed_from_u64(3);
        let ions = vec![
            Ion::new(2, 4, 120.0, 15.0, 10.0),
            Ion::new(1, 1, 60.0, 16.0, 20.0),
            Ion::new(2, 4, 120.0, 80.0, 20.0),
        ];
        let event = simulator.simulate_event(5, ions, &mut rng);
        assert_eq!(event.event_number, 5);
        assert_eq!(event.particles.len(), 3);
        let si = event.record("SI_01").unwrap().energy_loss.unwrap();
        let sum = event.particles[0].energy_losses["SI_01"] + event.particles[1].energy_losses["SI_01"];
        assert_approx_eq!(si, sum, 1e-9);
        assert!(event.record("SI_02").is_none());
    }

    #[test]
    fn physical_mode_synthesises_raw_signals() {
        let mut array = wall();
        let si = array.detector_id("SI_01").unwrap();
        array
            .add_calibrator(
                si,
                Calibrator::new("PG", "Energy", CalibrationFunction::Polynomial(1), vec![0.0, 0.05])
                    .with_domain(0.0, 16384.0),
            )
            .unwrap();
        let resolution = BTreeMap::new();
        let simulator = Simulator::new(&array, SimulationMode::Physical, false, &resolution);
        let mut rng = StdRng::seed_from_u64(3);
        let event = simulator.simulate_event(1, vec![Ion::new(2, 4, 120.0, 15.0, 10.0)], &mut rng);
        let record = event.record("SI_01").unwrap();
        let energy = event.particles[0].energy_losses["SI_01"];
        assert_approx_eq!(record.signals["PG"], energy / 0.05, 1e-6);
        // No calibration for the CsI
        assert!(event.record("CSI_01").is_none());
    }
}
