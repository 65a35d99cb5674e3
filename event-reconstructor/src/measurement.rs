use multidet_array::{
    DetectorArray, DetectorId, SignalValues,
    event::{ArrayEvent, SimulationMode},
    signal::ExtraParams,
};
use multidet_common::{ChargeNumber, Energy, MassNumber};
use std::collections::HashMap;
use thiserror::Error;

/// Calibrated signal holding the energy lost in a detector.
const ENERGY_SIGNAL: &str = "Energy";

#[derive(Debug, Error, PartialEq)]
pub(crate) enum MeasurementError {
    #[error("Unknown detector {0}")]
    UnknownDetector(String),
    #[error("{detector}: {source}")]
    Signal {
        detector: String,
        source: multidet_array::signal::SignalError,
    },
}

/// What the detectors of one event measured.
#[derive(Clone, Debug)]
pub(crate) enum Measurements {
    Energies(HashMap<DetectorId, Energy>),
    Signals(SignalValues),
}

impl Measurements {
    /// Reads the records of `event`. Records of unknown detectors are reported and skipped.
    pub(crate) fn from_event(
        array: &DetectorArray,
        event: &ArrayEvent,
    ) -> (Self, Vec<MeasurementError>) {
        let mut errors = Vec::new();
        let records = event.detectors.iter().filter_map(|record| {
            let id = array.detector_id(&record.detector);
            if id.is_none() {
                errors.push(MeasurementError::UnknownDetector(record.detector.clone()));
            }
            id.map(|id| (id, record))
        });
        let measurements = match event.mode {
            SimulationMode::Filter => Self::Energies(
                records
                    .filter_map(|(id, record)| Some((id, record.energy_loss?)))
                    .filter(|(_, energy)| *energy > 0.0)
                    .collect(),
            ),
            SimulationMode::Physical => {
                let mut values = array.signal_values();
                let mut signal_errors = Vec::new();
                for (id, record) in records {
                    let Some(registry) = values.get_mut(id) else {
                        continue;
                    };
                    for (name, value) in &record.signals {
                        if let Err(source) = registry.set_raw(name, *value) {
                            signal_errors.push(MeasurementError::Signal {
                                detector: record.detector.clone(),
                                source,
                            });
                        }
                    }
                }
                errors.extend(signal_errors);
                Self::Signals(values)
            }
        };
        (measurements, errors)
    }

    pub(crate) fn is_fired(&self, detector: DetectorId) -> bool {
        match self {
            Self::Energies(energies) => energies.contains_key(&detector),
            Self::Signals(values) => values.get(detector).is_some_and(|registry| registry.is_fired()),
        }
    }

    pub(crate) fn fired(&self) -> Vec<DetectorId> {
        let mut fired: Vec<DetectorId> = match self {
            Self::Energies(energies) => energies.keys().copied().collect(),
            Self::Signals(values) => values.fired_detectors().collect(),
        };
        fired.sort();
        fired
    }

    /// Energy lost in `detector` by an ion `(z, a)`, zero when it did not fire.
    pub(crate) fn energy(
        &self,
        detector: DetectorId,
        z: ChargeNumber,
        a: MassNumber,
    ) -> Option<Energy> {
        if !self.is_fired(detector) {
            return Some(0.0);
        }
        match self {
            Self::Energies(energies) => energies.get(&detector).copied(),
            Self::Signals(values) => values
                .get(detector)?
                .value(ENERGY_SIGNAL, &ExtraParams::for_ion(z, a)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::ring;
    use multidet_array::{
        calibration::{CalibrationFunction, Calibrator},
        event::DetectorRecord,
    };
    use std::collections::BTreeMap;

    fn record(detector: &str, energy_loss: Option<Energy>, signals: &[(&str, f64)]) -> DetectorRecord {
        DetectorRecord {
            detector: detector.to_owned(),
            energy_loss,
            signals: signals
                .iter()
                .map(|(name, value)| (name.to_string(), *value))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    #[test]
    fn filter_mode_energies() {
        let array = ring();
        let event = ArrayEvent {
            event_number: 1,
            mode: SimulationMode::Filter,
            detectors: vec![
                record("SI_01", Some(12.0), &[]),
                record("SI_77", Some(3.0), &[]),
                record("CI_01", Some(0.0), &[]),
            ],
            particles: Vec::new(),
        };
        let (measurements, errors) = Measurements::from_event(&array, &event);
        assert_eq!(
            errors,
            vec![MeasurementError::UnknownDetector("SI_77".to_owned())]
        );
        let si = array.detector_id("SI_01").unwrap();
        let ci = array.detector_id("CI_01").unwrap();
        assert_eq!(measurements.fired(), vec![si]);
        assert_eq!(measurements.energy(si, 2, 4), Some(12.0));
        assert_eq!(measurements.energy(ci, 2, 4), Some(0.0));
    }

    #[test]
    fn physical_mode_reads_calibrated_signals() {
        let mut array = ring();
        let si = array.detector_id("SI_01").unwrap();
        array
            .add_calibrator(
                si,
                Calibrator::new("PG", "Energy", CalibrationFunction::Polynomial(1), vec![0.0, 0.05]),
            )
            .unwrap();
        let csi = array.detector_id("CSI_01").unwrap();
        array
            .signals_mut(csi)
            .unwrap()
            .add_raw_signal("QL");
        let event = ArrayEvent {
            event_number: 1,
            mode: SimulationMode::Physical,
            detectors: vec![
                record("SI_01", None, &[("PG", 200.0)]),
                record("CSI_01", None, &[("QL", 80.0), ("QF", 10.0)]),
            ],
            particles: Vec::new(),
        };
        let (measurements, errors) = Measurements::from_event(&array, &event);
        assert_eq!(errors.len(), 1);
        assert_eq!(measurements.fired(), vec![si, csi]);
        assert_eq!(measurements.energy(si, 2, 4), Some(10.0));
        // Fired but not calibrated
        assert_eq!(measurements.energy(csi, 2, 4), None);
    }
}
