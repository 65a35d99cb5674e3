use multidet_common::{ChargeNumber, MassNumber};
use std::collections::BTreeMap;

/// Named extra parameters passed down a calibration chain, e.g. the `Z` and `A`
/// hypotheses of an identification.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExtraParams(BTreeMap<String, f64>);

impl ExtraParams {
    pub fn with(mut self, name: &str, value: f64) -> Self {
        self.0.insert(name.to_owned(), value);
        self
    }

    pub fn for_ion(z: ChargeNumber, a: MassNumber) -> Self {
        Self::default().with("Z", z as f64).with("A", a as f64)
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.0.get(name).copied()
    }

    pub fn z(&self) -> Option<ChargeNumber> {
        self.get("Z")
            .filter(|z| *z >= 0.0)
            .map(|z| z.round() as ChargeNumber)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
