//! Identification of the species of reconstructed particles.
use crate::status::AnalysisStatus;
use multidet_array::{
    Branch, Detector, DetectorArray, DetectorId, StoppingFunctions,
    topology::{IdentificationMethod, Telescope},
};
use multidet_common::{ChargeNumber, Energy, MAX_SUPPORTED_Z, MassNumber, most_probable_mass};
use serde::Serialize;
use tracing::trace;

/// Largest relative deviation between measured and predicted ΔE accepted as a match.
pub(crate) const DELTA_E_TOLERANCE: f64 = 0.05;

/// Measured energy of a detector under a `(Z, A)` hypothesis.
pub(crate) type EnergyFn<'a> = dyn Fn(DetectorId, ChargeNumber, MassNumber) -> Option<Energy> + 'a;

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, strum::Display, strum::IntoStaticStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "snake_case")]
pub(crate) enum IdCode {
    Ok,
    /// Only a lower bound of Z is known.
    ZMinimum,
    Pileup,
    OutOfRange,
    NotReady,
    NoTelescope,
    Hopeless,
}

/// Outcome of one identification attempt.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct IdentificationResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) telescope: Option<String>,
    pub(crate) code: IdCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) z: Option<ChargeNumber>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) a: Option<MassNumber>,
    pub(crate) mass_identified: bool,
    /// Relative deviation of the measured ΔE from the prediction.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) quality: Option<f64>,
}

impl IdentificationResult {
    pub(crate) fn failed(telescope: Option<&Telescope>, code: IdCode) -> Self {
        Self {
            telescope: telescope.map(|telescope| telescope.name().to_owned()),
            code,
            z: None,
            a: None,
            mass_identified: false,
            quality: None,
        }
    }

    /// Whether the species is known well enough to calibrate.
    pub(crate) fn is_successful(&self) -> bool {
        matches!(self.code, IdCode::Ok | IdCode::ZMinimum) && self.z.is_some()
    }

    /// The `(Z, A)` hypothesis, A being the most probable mass when it was not measured.
    pub(crate) fn species(&self) -> Option<(ChargeNumber, MassNumber)> {
        let z = self.z?;
        Some((z, self.a.unwrap_or_else(|| most_probable_mass(z))))
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct Hypothesis {
    pub(crate) z: ChargeNumber,
    pub(crate) a: MassNumber,
    pub(crate) quality: f64,
}

fn masses(z: ChargeNumber, mass_identification: bool) -> impl Iterator<Item = MassNumber> {
    let most_probable = most_probable_mass(z);
    let (lowest, highest) = if mass_identification {
        (
            z.max(most_probable.saturating_sub(z / 2 + 1)).max(1),
            most_probable + z / 2 + 2,
        )
    } else {
        (most_probable, most_probable)
    };
    lowest..=highest
}

/// Scans Z (and A when `mass_identification`) for the hypothesis whose predicted ΔE in
/// `front` best matches the measurement, given the energy left in `back`.
///
/// `back_branch` is [Branch::Stopping] when the particle stopped in `back` and
/// [Branch::Transmission] when it went through.
pub(crate) fn delta_e_e(
    (front_id, front): (DetectorId, &Detector),
    (back_id, back): (DetectorId, &Detector),
    back_branch: Branch,
    mass_identification: bool,
    energy: &EnergyFn<'_>,
) -> Option<Hypothesis> {
    let mut best: Option<Hypothesis> = None;
    for z in 1..=MAX_SUPPORTED_Z {
        let mut lowest_prediction = f64::INFINITY;
        let mut measured_delta_e = None;
        for a in masses(z, mass_identification) {
            let (Some(delta_e), Some(e_back)) = (energy(front_id, z, a), energy(back_id, z, a))
            else {
                continue;
            };
            if delta_e <= 0.0 || e_back <= 0.0 {
                continue;
            }
            measured_delta_e = Some(delta_e);
            let Ok(e_inc_back) = back.solve_incident_energy(z, a, e_back, back_branch) else {
                continue;
            };
            let Ok(e_inc_front) = front.solve_incident_energy_from_e_res(z, a, e_inc_back) else {
                continue;
            };
            let predicted = front.delta_e(z, a, e_inc_front);
            lowest_prediction = lowest_prediction.min(predicted);
            let quality = (delta_e - predicted).abs() / delta_e;
            trace!("Z={z} A={a}: ΔE {delta_e} predicted {predicted}");
            if best.is_none_or(|best| quality < best.quality) {
                best = Some(Hypothesis { z, a, quality });
            }
        }
        // Predictions only grow with Z from here on
        if best.is_some() && measured_delta_e.is_some_and(|de| lowest_prediction > 2.0 * de) {
            break;
        }
    }
    best
}

/// Smallest Z able to deposit the measured energy in `detector`.
pub(crate) fn z_minimum(
    id: DetectorId,
    detector: &Detector,
    energy: &EnergyFn<'_>,
) -> Option<ChargeNumber> {
    (1..=MAX_SUPPORTED_Z).find(|z| {
        let a = most_probable_mass(*z);
        energy(id, *z, a).is_some_and(|e| e > 0.0 && detector.max_delta_e(*z, a) >= e)
    })
}

fn z_minimum_result(
    id: DetectorId,
    detector: &Detector,
    telescope: Option<&Telescope>,
    energy: &EnergyFn<'_>,
) -> IdentificationResult {
    match z_minimum(id, detector, energy) {
        Some(z) => IdentificationResult {
            z: Some(z),
            ..IdentificationResult::failed(telescope, IdCode::ZMinimum)
        },
        None => IdentificationResult::failed(telescope, IdCode::OutOfRange),
    }
}

/// Attempts an identification with `telescope`, whose back member is `back` in a chain
/// stopping in `stop_id`.
fn identify_with(
    array: &DetectorArray,
    telescope: &Telescope,
    (back_id, back): (DetectorId, &Detector),
    stop_id: DetectorId,
    energy: &EnergyFn<'_>,
) -> IdentificationResult {
    if !telescope.is_ready() {
        return IdentificationResult::failed(Some(telescope), IdCode::NotReady);
    }
    match telescope.method() {
        IdentificationMethod::DeltaEE { mass_id } => {
            let members = telescope
                .front()
                .zip(telescope.back())
                .filter(|_| telescope.size() == 2)
                .and_then(|(front, back)| {
                    Some((
                        (front, array.detector(front)?),
                        (back, array.detector(back)?),
                    ))
                });
            let Some((front, back)) = members else {
                return IdentificationResult::failed(Some(telescope), IdCode::NotReady);
            };
            let back_branch = if back.0 == stop_id {
                Branch::Stopping
            } else {
                Branch::Transmission
            };
            match delta_e_e(front, back, back_branch, mass_id, energy) {
                Some(hypothesis) => IdentificationResult {
                    telescope: Some(telescope.name().to_owned()),
                    code: if hypothesis.quality < DELTA_E_TOLERANCE {
                        IdCode::Ok
                    } else {
                        IdCode::OutOfRange
                    },
                    z: Some(hypothesis.z),
                    a: Some(hypothesis.a),
                    mass_identified: mass_id,
                    quality: Some(hypothesis.quality),
                },
                None => IdentificationResult::failed(Some(telescope), IdCode::OutOfRange),
            }
        }
        IdentificationMethod::ZMinimum => {
            z_minimum_result(back_id, back, Some(telescope), energy)
        }
        IdentificationMethod::NotIdentifying => {
            IdentificationResult::failed(Some(telescope), IdCode::NotReady)
        }
    }
}

/// Identifies a particle stopped in the first detector of `chain`, which runs from the
/// stopping detector toward the target.
///
/// Telescopes are tried from the stopping detector outward until one succeeds. Returns
/// every attempt in order, the last one deciding.
pub(crate) fn identify(
    array: &DetectorArray,
    chain: &[DetectorId],
    status: AnalysisStatus,
    energy: &EnergyFn<'_>,
) -> Vec<IdentificationResult> {
    let Some((stop_id, stop)) = chain
        .first()
        .and_then(|id| array.detector(*id).map(|detector| (*id, detector)))
    else {
        return vec![IdentificationResult::failed(None, IdCode::NoTelescope)];
    };
    if status == AnalysisStatus::StopFirstStage {
        let telescope = array
            .identifying_telescope(chain)
            .and_then(|id| array.telescope(id));
        return vec![z_minimum_result(stop_id, stop, telescope, energy)];
    }

    let mut tried = Vec::new();
    let mut attempts = Vec::new();
    for start in 0..chain.len() {
        let Some(tail) = chain.get(start..) else {
            break;
        };
        let Some(id) = array.identifying_telescope(tail) else {
            continue;
        };
        if tried.contains(&id) {
            continue;
        }
        tried.push(id);
        let (Some(telescope), Some(back)) = (
            array.telescope(id),
            tail.first()
                .and_then(|back| array.detector(*back).map(|detector| (*back, detector))),
        ) else {
            continue;
        };
        let result = identify_with(array, telescope, back, stop_id, energy);
        trace!("{}: {}", telescope.name(), result.code);
        let identified = result.is_successful();
        attempts.push(result);
        if identified {
            break;
        }
    }
    if attempts.is_empty() {
        attempts.push(IdentificationResult::failed(None, IdCode::NoTelescope));
    }
    attempts
}
