//! Reconstruction of the particles of an event, group by group, and resolution of the
//! ambiguities left by detectors crossed by several particles.
use crate::{
    calibration::{self, CalibrationError},
    identification::{self, IdCode, IdentificationResult},
    measurement::Measurements,
    particle::{ReconstructedEvent, ReconstructedParticle},
    status::AnalysisStatus,
};
use metrics::counter;
use multidet_array::{DetectorArray, DetectorId, event::ArrayEvent, topology::Group};
use multidet_common::{
    ChargeNumber, Energy, MassNumber,
    metrics::{
        failures::{self, FailureKind},
        identification_code,
        names::{COHERENCY_PASSES, FAILURES, IDENTIFICATION_CODES, PARTICLES_RECONSTRUCTED},
    },
};
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, instrument, warn};

/// How the energy of a shared detector is attributed to a particle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Attribution {
    /// What is left once calibrated particles are accounted for.
    Remaining,
    /// An equal part of what is left among the particles still uncertain.
    Share,
}

/// Reconstruction of the particles of one group in one event.
struct GroupReconstruction<'a> {
    array: &'a DetectorArray,
    measurements: &'a Measurements,
    particles: Vec<ReconstructedParticle>,
    /// Particles crossing each fired detector, in seeding order.
    claimants: BTreeMap<DetectorId, Vec<usize>>,
}

impl<'a> GroupReconstruction<'a> {
    fn new(array: &'a DetectorArray, measurements: &'a Measurements) -> Self {
        Self {
            array,
            measurements,
            particles: Vec::new(),
            claimants: BTreeMap::new(),
        }
    }

    fn particle(&self, index: usize) -> Option<&ReconstructedParticle> {
        self.particles.get(index)
    }

    fn detector_name(&self, detector: DetectorId) -> &str {
        self.array
            .detector(detector)
            .map(|detector| detector.name())
            .unwrap_or_default()
    }

    /// The reconstruction trajectory of `detector` crossing the most fired detectors.
    fn back_trajectory(&self, detector: DetectorId) -> Vec<DetectorId> {
        let fired = |nodes: &[DetectorId]| {
            nodes
                .iter()
                .filter(|id| self.measurements.is_fired(**id))
                .count()
        };
        let mut best: Option<&[DetectorId]> = None;
        for trajectory in self.array.reconstruction_trajectories(detector) {
            if best.is_none_or(|best| fired(trajectory.nodes()) > fired(best)) {
                best = Some(trajectory.nodes());
            }
        }
        best.map(<[DetectorId]>::to_vec)
            .unwrap_or_else(|| vec![detector])
    }

    /// Seeds one particle in each fired detector not crossed by a particle seeded
    /// further from the target.
    fn seed(&mut self, group: &Group) {
        let mut fired: Vec<DetectorId> = group
            .detectors()
            .iter()
            .copied()
            .filter(|id| self.measurements.is_fired(*id))
            .collect();
        fired.sort_by(|a, b| {
            let distance = |id: &DetectorId| {
                self.array
                    .detector(*id)
                    .map(|detector| detector.geometry().distance_cm)
                    .unwrap_or_default()
            };
            distance(b)
                .total_cmp(&distance(a))
                .then_with(|| self.detector_name(*a).cmp(self.detector_name(*b)))
        });

        let mut claimed = HashSet::new();
        for detector in fired {
            if claimed.contains(&detector) {
                continue;
            }
            let chain = self.back_trajectory(detector);
            let index = self.particles.len();
            for id in &chain {
                claimed.insert(*id);
                if self.measurements.is_fired(*id) {
                    self.claimants.entry(*id).or_default().push(index);
                }
            }
            debug!(
                "Particle {index} seeded in {}",
                self.detector_name(detector)
            );
            self.particles.push(ReconstructedParticle::new(
                self.array,
                index,
                chain,
                AnalysisStatus::Ok,
            ));
        }
    }

    fn is_shared(&self, detector: DetectorId) -> bool {
        self.claimants
            .get(&detector)
            .is_some_and(|claimants| claimants.len() > 1)
    }

    /// Other particles crossing `detector`.
    fn others(&self, index: usize, detector: DetectorId) -> impl Iterator<Item = &ReconstructedParticle> {
        self.claimants
            .get(&detector)
            .into_iter()
            .flatten()
            .filter(move |other| **other != index)
            .filter_map(move |other| self.particle(*other))
    }

    /// Detectors whose energies identify a particle stopped at the head of `chain`.
    fn identifying_detectors(&self, chain: &[DetectorId]) -> Vec<DetectorId> {
        self.array
            .identifying_telescope(chain)
            .and_then(|id| self.array.telescope(id))
            .map(|telescope| telescope.detectors().to_vec())
            .unwrap_or_else(|| chain.get(..1).unwrap_or_default().to_vec())
    }

    fn assign_initial_status(&mut self) {
        let statuses: Vec<AnalysisStatus> = self
            .particles
            .iter()
            .map(|particle| {
                if particle.chain().len() == 1 {
                    AnalysisStatus::StopFirstStage
                } else if self
                    .identifying_detectors(particle.chain())
                    .iter()
                    .any(|id| self.is_shared(*id))
                {
                    // Provisional, settled by the coherency analysis
                    AnalysisStatus::OkAfterShare
                } else {
                    AnalysisStatus::Ok
                }
            })
            .collect();
        for (particle, status) in self.particles.iter_mut().zip(statuses) {
            particle.set_status(status);
        }
    }

    /// Energy of `detector` attributed to particle `index` under the hypothesis `(z, a)`.
    fn attributed_energy(
        &self,
        index: usize,
        detector: DetectorId,
        z: ChargeNumber,
        a: MassNumber,
        attribution: Attribution,
    ) -> Option<Energy> {
        let measured = self.measurements.energy(detector, z, a)?;
        let name = self.detector_name(detector);
        let calibrated: Energy = self
            .others(index, detector)
            .filter_map(|other| other.calibration()?.energy_in(name))
            .sum();
        let remaining = (measured - calibrated).max(0.0);
        if attribution == Attribution::Remaining {
            return Some(remaining);
        }
        let sharers: Vec<usize> = self
            .claimants
            .get(&detector)
            .into_iter()
            .flatten()
            .copied()
            .filter(|sharer| {
                *sharer == index || self.particle(*sharer).is_some_and(ReconstructedParticle::is_pending)
            })
            .collect();
        if sharers.len() <= 1 {
            return Some(remaining);
        }
        let share = remaining / sharers.len() as f64;
        // The rounding residue goes to the first particle seeded
        if sharers.first() == Some(&index) {
            Some(remaining - share * (sharers.len() - 1) as f64)
        } else {
            Some(share)
        }
    }

    fn identify(&self, index: usize, attribution: Attribution) -> Option<Vec<IdentificationResult>> {
        let particle = self.particle(index)?;
        let energy = |detector: DetectorId, z: ChargeNumber, a: MassNumber| {
            self.attributed_energy(index, detector, z, a, attribution)
        };
        Some(identification::identify(
            self.array,
            particle.chain(),
            particle.status(),
            &energy,
        ))
    }

    fn calibrate(&mut self, index: usize) {
        let Some(particle) = self.particle(index) else {
            return;
        };
        if !particle.is_identified() || particle.is_calibrated() {
            return;
        }
        let energy = |detector: DetectorId, z: ChargeNumber, a: MassNumber| {
            self.attributed_energy(index, detector, z, a, Attribution::Remaining)
        };
        let calibration =
            calibration::calibrate(self.array, particle, &energy, &|id| self.is_shared(id));
        let Some(particle) = self.particles.get_mut(index) else {
            return;
        };
        let failure = match particle.set_calibration(calibration) {
            Ok(()) => return,
            Err(CalibrationError::OrientationUnset) => {
                debug!("Particle {index} not calibrated, target orientation unset");
                return;
            }
            Err(e @ CalibrationError::NoEnergy(_)) => {
                debug!("Particle {index} not calibrated: {e}");
                FailureKind::CalibrationUnavailable
            }
            Err(e) => {
                debug!("Particle {index} not calibrated: {e}");
                FailureKind::InversionFailed
            }
        };
        counter!(FAILURES, &[failures::get_label(failure)]).increment(1);
    }

    fn identify_and_calibrate(&mut self, index: usize, attribution: Attribution) {
        if let Some(attempts) = self.identify(index, attribution) {
            if let Some(particle) = self.particles.get_mut(index) {
                for identification in attempts {
                    particle.record_identification(identification);
                }
            }
            self.calibrate(index);
        }
    }

    /// Identifies the particles whose detectors belong to them alone.
    fn identify_independent(&mut self) {
        for index in 0..self.particles.len() {
            let unambiguous = self.particle(index).is_some_and(|particle| {
                matches!(
                    particle.status(),
                    AnalysisStatus::Ok | AnalysisStatus::StopFirstStage
                )
            });
            if unambiguous {
                self.identify_and_calibrate(index, Attribution::Remaining);
            }
        }
    }

    /// Fired detectors of particle `index` explained by no other uncertain particle.
    fn independent_detectors(&self, index: usize) -> usize {
        let Some(particle) = self.particle(index) else {
            return 0;
        };
        particle
            .chain()
            .iter()
            .filter(|id| self.measurements.is_fired(**id))
            .filter(|id| {
                self.array
                    .detector(**id)
                    .is_some_and(|detector| detector.is_segmented())
            })
            .filter(|id| {
                self.others(index, **id)
                    .all(ReconstructedParticle::is_hopeless)
            })
            .count()
    }

    /// Whether `detector` is crossed by another particle still uncertain.
    fn shared_with_pending(&self, index: usize, detector: DetectorId) -> bool {
        self.others(index, detector)
            .any(ReconstructedParticle::is_pending)
    }

    /// Whether the contribution of every other particle crossing the detectors of
    /// particle `index` is known.
    fn contributions_known(&self, index: usize) -> bool {
        self.particle(index).is_some_and(|particle| {
            particle.chain().iter().all(|id| {
                self.others(index, *id)
                    .all(|other| other.is_hopeless() || other.is_calibrated())
            })
        })
    }

    /// Re-evaluates the uncertain particles until a pass changes nothing. Returns the
    /// number of passes.
    fn resolve(&mut self) -> usize {
        let limit = self.particles.len() + 1;
        let mut passes = 0;
        while passes < limit {
            passes += 1;
            let mut changes = 0;
            for index in 0..self.particles.len() {
                if !self.particle(index).is_some_and(ReconstructedParticle::is_pending) {
                    continue;
                }
                let independent = self.independent_detectors(index);
                let remaining = match self.particles.get_mut(index) {
                    Some(particle) => particle.update_independent(independent),
                    None => continue,
                };
                if remaining == 0 {
                    debug!("Particle {index} is a ghost");
                    if let Some(particle) = self.particles.get_mut(index) {
                        particle.set_status(AnalysisStatus::PileupGhost);
                        particle.record_identification(IdentificationResult::failed(
                            None,
                            IdCode::Hopeless,
                        ));
                    }
                    changes += 1;
                } else if self.contributions_known(index) {
                    let subtracted = self.particle(index).is_some_and(|particle| {
                        particle
                            .chain()
                            .iter()
                            .any(|id| self.others(index, *id).any(ReconstructedParticle::is_calibrated))
                    });
                    if let Some(particle) = self.particles.get_mut(index) {
                        particle.set_status(if subtracted {
                            AnalysisStatus::OkAfterSubtraction
                        } else {
                            AnalysisStatus::Ok
                        });
                    }
                    self.identify_and_calibrate(index, Attribution::Remaining);
                    changes += 1;
                }
            }
            if changes == 0 {
                break;
            }
        }
        passes
    }

    /// Identifies the particles left uncertain on equal shares of their shared detectors.
    fn share(&mut self) {
        let pending: Vec<usize> = (0..self.particles.len())
            .filter(|index| self.particle(*index).is_some_and(ReconstructedParticle::is_pending))
            .collect();
        let results: Vec<(usize, AnalysisStatus, Option<Vec<IdentificationResult>>)> = pending
            .iter()
            .map(|index| {
                let delta_e_shared = self.particle(*index).is_some_and(|particle| {
                    self.identifying_detectors(particle.chain())
                        .iter()
                        .any(|id| self.shared_with_pending(*index, *id))
                });
                let status = if delta_e_shared {
                    AnalysisStatus::PileupDeltaE
                } else {
                    AnalysisStatus::OkAfterShare
                };
                (*index, status, self.identify(*index, Attribution::Share))
            })
            .collect();
        for (index, status, identification) in results {
            let Some(particle) = self.particles.get_mut(index) else {
                continue;
            };
            particle.set_status(status);
            let mut attempts = identification.unwrap_or_default();
            if let Some(last) = attempts.last_mut().filter(|last| last.z.is_some()) {
                last.code = IdCode::Pileup;
            }
            for attempt in attempts {
                particle.record_identification(attempt);
            }
        }
    }
}

/// Turns the fired detectors of events into identified, calibrated particles.
pub(crate) struct Reconstructor<'a> {
    array: &'a DetectorArray,
}

impl<'a> Reconstructor<'a> {
    pub(crate) fn new(array: &'a DetectorArray) -> Self {
        Self { array }
    }

    /// Reconstructs the particles of one group. Returns them with the number of
    /// coherency passes needed.
    #[instrument(skip_all, fields(group = %group.id()))]
    fn reconstruct_group(
        &self,
        group: &Group,
        measurements: &Measurements,
    ) -> (Vec<ReconstructedParticle>, usize) {
        let mut reconstruction = GroupReconstruction::new(self.array, measurements);
        reconstruction.seed(group);
        reconstruction.assign_initial_status();
        reconstruction.identify_independent();
        let passes = reconstruction.resolve();
        reconstruction.share();
        debug!(
            "{} particles after {passes} coherency passes",
            reconstruction.particles.len()
        );
        (reconstruction.particles, passes)
    }

    #[instrument(skip_all, fields(event = event.event_number))]
    pub(crate) fn reconstruct_event(&self, event: &ArrayEvent) -> ReconstructedEvent {
        let (measurements, errors) = Measurements::from_event(self.array, event);
        for error in errors {
            warn!("Event {}: {error}", event.event_number);
            counter!(
                FAILURES,
                &[failures::get_label(FailureKind::MalformedEvent)]
            )
            .increment(1);
        }

        let fired = measurements.fired();
        let mut particles = Vec::new();
        for group in self.array.groups() {
            if !group.detectors().iter().any(|id| fired.contains(id)) {
                continue;
            }
            let (group_particles, passes) = self.reconstruct_group(group, &measurements);
            counter!(COHERENCY_PASSES).increment(passes as u64);
            particles.extend(group_particles);
        }

        for particle in &particles {
            debug!(
                "Particle stopped in {}: status {} ({})",
                particle.stopping_detector(),
                particle.status(),
                particle.status().code()
            );
            counter!(PARTICLES_RECONSTRUCTED).increment(1);
            if let Some(code) = particle.code() {
                counter!(
                    IDENTIFICATION_CODES,
                    &[identification_code::get_label(code.into())]
                )
                .increment(1);
            }
        }
        ReconstructedEvent {
            event_number: event.event_number,
            particles,
        }
    }
}
