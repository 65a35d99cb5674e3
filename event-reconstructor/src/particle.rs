use crate::{
    calibration::{Calibration, CalibrationError},
    identification::{IdCode, IdentificationResult},
    status::AnalysisStatus,
};
use multidet_array::{DetectorArray, DetectorId, GroupId};
use multidet_common::EventNumber;
use serde::Serialize;

/// A particle reconstructed from the detectors it fired.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct ReconstructedParticle {
    /// Position in the seeding order of its group.
    seed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    group: Option<GroupId>,
    stopping_detector: String,
    /// Names of the detectors crossed, stopping detector first.
    detectors: Vec<String>,
    #[serde(skip)]
    chain: Vec<DetectorId>,
    /// Direction of the centre of the stopping detector, in degrees.
    theta: f64,
    phi: f64,
    status: AnalysisStatus,
    identifications: Vec<IdentificationResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    calibration: Option<Calibration>,
    /// Detectors of the chain not shared with any uncertain particle. Never increases.
    #[serde(skip)]
    independent: usize,
}

impl ReconstructedParticle {
    pub(crate) fn new(
        array: &DetectorArray,
        seed: usize,
        chain: Vec<DetectorId>,
        status: AnalysisStatus,
    ) -> Self {
        let detectors: Vec<String> = chain
            .iter()
            .filter_map(|id| array.detector(*id))
            .map(|detector| detector.name().to_owned())
            .collect();
        let stopping = chain.first().and_then(|id| array.detector(*id));
        let (theta, phi) = stopping
            .map(|detector| detector.geometry().centre())
            .unwrap_or_default();
        Self {
            seed,
            group: stopping.and_then(|detector| detector.group()),
            stopping_detector: detectors.first().cloned().unwrap_or_default(),
            independent: chain.len(),
            detectors,
            chain,
            theta,
            phi,
            status,
            identifications: Vec::new(),
            calibration: None,
        }
    }

    pub(crate) fn stopping_detector(&self) -> &str {
        &self.stopping_detector
    }

    pub(crate) fn chain(&self) -> &[DetectorId] {
        &self.chain
    }

    pub(crate) fn theta(&self) -> f64 {
        self.theta
    }

    pub(crate) fn status(&self) -> AnalysisStatus {
        self.status
    }

    pub(crate) fn set_status(&mut self, status: AnalysisStatus) {
        self.status = status;
    }

    #[cfg(test)]
    pub(crate) fn identifications(&self) -> &[IdentificationResult] {
        &self.identifications
    }

    /// The latest identification attempt.
    pub(crate) fn identification(&self) -> Option<&IdentificationResult> {
        self.identifications.last()
    }

    pub(crate) fn code(&self) -> Option<IdCode> {
        self.identification().map(|identification| identification.code)
    }

    pub(crate) fn record_identification(&mut self, identification: IdentificationResult) {
        self.identifications.push(identification);
    }

    pub(crate) fn is_identified(&self) -> bool {
        self.identification()
            .is_some_and(IdentificationResult::is_successful)
    }

    /// No identification attempted yet.
    pub(crate) fn is_pending(&self) -> bool {
        self.identifications.is_empty()
    }

    pub(crate) fn is_hopeless(&self) -> bool {
        self.code() == Some(IdCode::Hopeless)
    }

    pub(crate) fn calibration(&self) -> Option<&Calibration> {
        self.calibration.as_ref()
    }

    pub(crate) fn is_calibrated(&self) -> bool {
        self.calibration.is_some()
    }

    /// Stores the calibration, unless the particle already has one.
    pub(crate) fn set_calibration(
        &mut self,
        calibration: Result<Calibration, CalibrationError>,
    ) -> Result<(), CalibrationError> {
        if self.calibration.is_none() {
            self.calibration = Some(calibration?);
        }
        Ok(())
    }

    /// Lowers the independent-detector counter to `count` if it is smaller.
    pub(crate) fn update_independent(&mut self, count: usize) -> usize {
        self.independent = self.independent.min(count);
        self.independent
    }
}

/// The particles reconstructed in one event.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct ReconstructedEvent {
    pub(crate) event_number: EventNumber,
    pub(crate) particles: Vec<ReconstructedParticle>,
}
