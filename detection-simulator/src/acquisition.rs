use metrics::counter;
use multidet_array::{Detector, signal::ExtraParams};
use multidet_common::{
    ChargeNumber, Energy, MassNumber,
    metrics::{
        failures::{self, FailureKind},
        names::FAILURES,
    },
};
use std::{
    collections::{BTreeMap, HashSet},
    sync::Mutex,
};
use tracing::warn;

/// Name of the calibrated signal the raw parameters are derived from.
pub(crate) const ENERGY_SIGNAL: &str = "Energy";

/// Turns simulated energy losses into raw acquisition parameters by inverting the
/// calibrations of each detector.
#[derive(Debug, Default)]
pub(crate) struct Acquisition {
    /// Detectors already reported as lacking an invertible calibration.
    reported: Mutex<HashSet<String>>,
}

impl Acquisition {
    fn report_once(&self, detector: &str, reason: &str) {
        counter!(
            FAILURES,
            &[failures::get_label(FailureKind::CalibrationUnavailable)]
        )
        .increment(1);
        let first_time = self
            .reported
            .lock()
            .map(|mut reported| reported.insert(detector.to_owned()))
            .unwrap_or(false);
        if first_time {
            warn!("{detector}: no raw parameters in physical mode, {reason}");
        }
    }

    /// Raw parameter values of `detector` for a deposit of `energy` by an ion `(z, a)`.
    pub(crate) fn synthesise(
        &self,
        detector: &Detector,
        energy: Energy,
        z: ChargeNumber,
        a: MassNumber,
    ) -> Option<BTreeMap<String, f64>> {
        let signals = detector.signals();
        let Some(raw) = signals.raw_source(ENERGY_SIGNAL) else {
            self.report_once(detector.name(), "energy is not calibrated");
            return None;
        };
        match signals.try_inverse_value(ENERGY_SIGNAL, energy, raw, &ExtraParams::for_ion(z, a)) {
            Ok(value) => Some(BTreeMap::from([(raw.to_owned(), value)])),
            Err(e) => {
                self.report_once(detector.name(), &e.to_string());
                None
            }
        }
    }
}
