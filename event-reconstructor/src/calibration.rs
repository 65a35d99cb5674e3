use crate::{identification::EnergyFn, particle::ReconstructedParticle};
use multidet_array::{
    Branch, DetectorArray, DetectorId, StoppingFunctions, material::InversionError,
    target::TargetError,
};
use multidet_common::Energy;
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub(crate) enum CalibrationError {
    #[error("Particle is not identified")]
    NotIdentified,
    #[error("Target orientation must be set before calibrating")]
    OrientationUnset,
    #[error("No energy measured in {0}")]
    NoEnergy(String),
    #[error("{detector}: {source}")]
    Inversion {
        detector: String,
        source: InversionError,
    },
    #[error("Target correction: {0}")]
    Target(#[from] TargetError),
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct DetectorEnergy {
    pub(crate) energy: Energy,
    /// Calculated from the energy of the detectors behind rather than measured.
    pub(crate) computed: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct Calibration {
    /// Energy lost in the active layer of each detector of the chain.
    pub(crate) energies: BTreeMap<String, DetectorEnergy>,
    /// Incident energy at the front of the chain.
    pub(crate) incident_energy: Energy,
    pub(crate) target_loss: Energy,
    /// Energy at the interaction point.
    pub(crate) energy: Energy,
}

impl Calibration {
    pub(crate) fn energy_in(&self, detector: &str) -> Option<Energy> {
        self.energies.get(detector).map(|energy| energy.energy)
    }
}

/// Computes the energies of an identified particle from the energy of its stopping
/// detector, working toward the target.
///
/// Energies of detectors for which `shared` holds are calculated rather than measured.
pub(crate) fn calibrate(
    array: &DetectorArray,
    particle: &ReconstructedParticle,
    energy: &EnergyFn<'_>,
    shared: &dyn Fn(DetectorId) -> bool,
) -> Result<Calibration, CalibrationError> {
    let (z, a) = particle
        .identification()
        .filter(|identification| identification.is_successful())
        .and_then(|identification| identification.species())
        .ok_or(CalibrationError::NotIdentified)?;
    let target = array.target();
    if target.is_some_and(|target| target.orientation().is_none()) {
        return Err(CalibrationError::OrientationUnset);
    }

    let mut energies = BTreeMap::new();
    let mut incident_energy = 0.0;
    for (index, id) in particle.chain().iter().enumerate() {
        let Some(detector) = array.detector(*id) else {
            continue;
        };
        let name = detector.name().to_owned();
        let inversion = |source| CalibrationError::Inversion {
            detector: name.clone(),
            source,
        };
        let measured = energy(*id, z, a);
        if index == 0 {
            let stopped = measured.ok_or_else(|| CalibrationError::NoEnergy(name.clone()))?;
            incident_energy = detector
                .solve_incident_energy(z, a, stopped, Branch::Stopping)
                .map_err(inversion)?;
            energies.insert(
                name,
                DetectorEnergy {
                    energy: stopped,
                    computed: false,
                },
            );
        } else {
            incident_energy = detector
                .solve_incident_energy_from_e_res(z, a, incident_energy)
                .map_err(inversion)?;
            let detector_energy = match measured {
                Some(measured) if !shared(*id) => DetectorEnergy {
                    energy: measured,
                    computed: false,
                },
                _ => DetectorEnergy {
                    energy: detector.delta_e(z, a, incident_energy),
                    computed: true,
                },
            };
            energies.insert(name, detector_energy);
        }
    }

    let energy = match target {
        Some(target) => {
            target.incident_energy_from_e_res(z, a, incident_energy, particle.theta())?
        }
        None => incident_energy,
    };
    Ok(Calibration {
        energies,
        incident_energy,
        target_loss: energy - incident_energy,
        energy,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        identification::{IdCode, IdentificationResult},
        status::AnalysisStatus,
        tests::{ring, stopping_losses},
    };
    use assert_approx_eq::assert_approx_eq;
    use multidet_common::{ChargeNumber, MassNumber};
    use multidet_array::{
        Target, TargetOrientation,
        material::{Absorber, MaterialTable},
    };

    fn identified_alpha(array: &DetectorArray) -> ReconstructedParticle {
        let chain = ["CSI_01", "SI_01", "CI_01"]
            .map(|name| array.detector_id(name).unwrap())
            .to_vec();
        let mut particle = ReconstructedParticle::new(array, 0, chain, AnalysisStatus::Ok);
        particle.record_identification(IdentificationResult {
            z: Some(2),
            a: Some(4),
            ..IdentificationResult::failed(None, IdCode::Ok)
        });
        particle
    }

    #[test]
    fn energies_are_recovered() {
        let array = ring();
        let losses = stopping_losses(&array, &["CI_01", "SI_01", "CSI_01"], 2, 4, 120.0);
        let ids = ["CI_01", "SI_01", "CSI_01"].map(|name| array.detector_id(name).unwrap());
        let closure_losses = losses.clone();
        let energy = move |id: DetectorId, _: ChargeNumber, _: MassNumber| {
            ids.iter()
                .position(|detector| *detector == id)
                .map(|index| closure_losses[index])
        };
        let particle = identified_alpha(&array);
        let ci = ids[0];

        let calibration = calibrate(&array, &particle, &energy, &|id| id == ci).unwrap();
        assert_approx_eq!(calibration.energy, 120.0, 1e-6);
        assert_eq!(calibration.target_loss, 0.0);
        let chamber = calibration.energies["CI_01"];
        assert!(chamber.computed);
        assert_approx_eq!(chamber.energy, losses[0], 1e-6);
        assert!(!calibration.energies["SI_01"].computed);
    }

    #[test]
    fn target_needs_an_orientation() {
        let mut array = ring();
        let losses = stopping_losses(&array, &["CI_01", "SI_01", "CSI_01"], 2, 4, 120.0);
        let ids = ["CI_01", "SI_01", "CSI_01"].map(|name| array.detector_id(name).unwrap());
        let energy = move |id: DetectorId, _: ChargeNumber, _: MassNumber| {
            ids.iter()
                .position(|detector| *detector == id)
                .map(|index| losses[index])
        };
        array.set_target(Target::new(Absorber::from_area_density(
            MaterialTable::standard().lookup("Au").unwrap(),
            2.0,
        )));
        let particle = identified_alpha(&array);
        assert_eq!(
            calibrate(&array, &particle, &energy, &|_| false),
            Err(CalibrationError::OrientationUnset)
        );

        array.set_target_orientation(TargetOrientation::Outgoing);
        let calibration = calibrate(&array, &particle, &energy, &|_| false).unwrap();
        assert!(calibration.target_loss > 0.0);
        assert_approx_eq!(
            calibration.energy - calibration.target_loss,
            calibration.incident_energy,
            1e-9
        );
    }

    #[test]
    fn unidentified_particles_are_not_calibrated() {
        let array = ring();
        let chain = vec![array.detector_id("SI_02").unwrap()];
        let mut particle = ReconstructedParticle::new(&array, 0, chain, AnalysisStatus::Ok);
        assert_eq!(
            calibrate(&array, &particle, &|_, _, _| Some(5.0), &|_| false),
            Err(CalibrationError::NotIdentified)
        );
        particle.record_identification(IdentificationResult::failed(None, IdCode::NotReady));
        assert_eq!(
            calibrate(&array, &particle, &|_, _, _| Some(5.0), &|_| false),
            Err(CalibrationError::NotIdentified)
        );
    }
}
