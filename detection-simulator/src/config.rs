use multidet_array::{ArrayConfig, Ion, event::SimulationMode};
use multidet_common::{ChargeNumber, MassNumber, most_probable_mass};
use rand::Rng;
use rand_distr::{Distribution, Normal, NormalError};
use serde::Deserialize;
use std::{collections::BTreeMap, fs, ops::RangeInclusive, path::Path};
use thiserror::Error;

#[derive(Debug, Error)]
pub(crate) enum ConfigError {
    #[error("Cannot read simulation configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid simulation configuration: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub(crate) enum SampleError {
    #[error("Invalid Normal Distribution: {0}")]
    NormalDistribution(#[from] NormalError),
    #[error("Empty interval {0} to {1}")]
    EmptyInterval(f64, f64),
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "kebab-case", tag = "random-type")]
pub(crate) enum FloatRandomDistribution {
    Constant { value: f64 },
    Uniform { min: f64, max: f64 },
    Normal { mean: f64, sd: f64 },
}

impl FloatRandomDistribution {
    pub(crate) fn sample<R: Rng>(&self, rng: &mut R) -> Result<f64, SampleError> {
        match self {
            Self::Constant { value } => Ok(*value),
            Self::Uniform { min, max } => {
                if min > max {
                    return Err(SampleError::EmptyInterval(*min, *max));
                }
                Ok(rng.random_range(*min..=*max))
            }
            Self::Normal { mean, sd } => Ok(Normal::new(*mean, *sd)?.sample(rng)),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct Interval<T>
where
    T: Clone,
{
    pub(crate) min: T,
    pub(crate) max: T,
}

impl<T: PartialOrd + Copy> Interval<T> {
    pub(crate) fn range_inclusive(&self) -> RangeInclusive<T> {
        self.min..=self.max
    }
}

fn default_multiplicity() -> u32 {
    1
}

/// Particles of one species emitted in every event.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct ParticleSource {
    pub(crate) z: ChargeNumber,
    /// Defaults to the most probable mass of `z`.
    pub(crate) a: Option<MassNumber>,
    /// Kinetic energy per nucleon, MeV/u.
    pub(crate) energy_per_nucleon: FloatRandomDistribution,
    /// Polar angle in degrees, emitted isotropically within the interval.
    pub(crate) theta: Interval<f64>,
    #[serde(default = "full_azimuth")]
    pub(crate) phi: Interval<f64>,
    #[serde(default = "default_multiplicity")]
    pub(crate) multiplicity: u32,
}

fn full_azimuth() -> Interval<f64> {
    Interval {
        min: 0.0,
        max: 360.0,
    }
}

impl ParticleSource {
    pub(crate) fn mass(&self) -> MassNumber {
        self.a.unwrap_or_else(|| most_probable_mass(self.z))
    }

    pub(crate) fn emit<R: Rng>(&self, rng: &mut R) -> Result<Vec<Ion>, SampleError> {
        let a = self.mass();
        (0..self.multiplicity)
            .map(|_| {
                let energy = self.energy_per_nucleon.sample(rng)?.max(0.0) * a as f64;
                let cos_theta = {
                    let range = self.theta.range_inclusive();
                    let (upper, lower) = (
                        range.start().to_radians().cos(),
                        range.end().to_radians().cos(),
                    );
                    if lower > upper {
                        return Err(SampleError::EmptyInterval(*range.start(), *range.end()));
                    }
                    rng.random_range(lower..=upper)
                };
                let phi = {
                    let range = self.phi.range_inclusive();
                    if range.start() > range.end() {
                        return Err(SampleError::EmptyInterval(*range.start(), *range.end()));
                    }
                    rng.random_range(range)
                };
                Ok(Ion::new(
                    self.z,
                    a,
                    energy,
                    cos_theta.acos().to_degrees(),
                    phi,
                ))
            })
            .collect()
    }
}

/// Complete description of a simulation run.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct SimulationConfig {
    pub(crate) array: ArrayConfig,
    pub(crate) sources: Vec<ParticleSource>,
    pub(crate) events: u64,
    #[serde(default)]
    pub(crate) seed: u64,
    #[serde(default)]
    pub(crate) mode: SimulationMode,
    #[serde(default)]
    pub(crate) track_neutrons: bool,
    /// Relative energy resolution (σ/E) per detector type.
    #[serde(default)]
    pub(crate) resolution: BTreeMap<String, f64>,
}

impl SimulationConfig {
    pub(crate) fn from_file(path: &Path) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{SeedableRng, rngs::StdRng};

    #[test]
    fn sources_emit_within_bounds() {
        let source: ParticleSource = serde_json::from_str(
            r#"{
                "z": 6,
                "energy-per-nucleon": { "random-type": "uniform", "min": 10.0, "max": 20.0 },
                "theta": { "min": 10.0, "max": 20.0 },
                "multiplicity": 50
            }"#,
        )
        .unwrap();
        assert_eq!(source.mass(), 12);
        let mut rng = StdRng::seed_from_u64(1);
        let ions = source.emit(&mut rng).unwrap();
        assert_eq!(ions.len(), 50);
        for ion in ions {
            assert!((120.0..=240.0).contains(&ion.energy));
            assert!((10.0 - 1e-9..=20.0 + 1e-9).contains(&ion.theta));
            assert!((0.0..=360.0).contains(&ion.phi));
        }
    }

    #[test]
    fn seeded_emission_is_reproducible() {
        let source = ParticleSource {
            z: 2,
            a: Some(4),
            energy_per_nucleon: FloatRandomDistribution::Normal { mean: 30.0, sd: 2.0 },
            theta: Interval { min: 5.0, max: 40.0 },
            phi: full_azimuth(),
            multiplicity: 3,
        };
        let first = source.emit(&mut StdRng::seed_from_u64(42)).unwrap();
        let second = source.emit(&mut StdRng::seed_from_u64(42)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn invalid_distributions() {
        let mut rng = StdRng::seed_from_u64(0);
        assert!(
            FloatRandomDistribution::Normal { mean: 1.0, sd: -1.0 }
                .sample(&mut rng)
                .is_err()
        );
        assert!(
            FloatRandomDistribution::Uniform { min: 2.0, max: 1.0 }
                .sample(&mut rng)
                .is_err()
        );
    }

    #[test]
    fn parse_configuration() {
        let config: SimulationConfig = serde_json::from_str(
            r#"{
                "array": {
                    "name": "WALL",
                    "detectors": [
                        { "name": "SI_A", "type": "SI",
                          "layers": [ { "material": "Si", "thickness-um": 300, "active": true } ],
                          "geometry": { "theta-min": 5, "theta-max": 10, "phi-min": 0, "phi-max": 360, "distance-cm": 30 } }
                    ]
                },
                "sources": [ { "z": 2, "a": 4,
                               "energy-per-nucleon": { "random-type": "constant", "value": 30.0 },
                               "theta": { "min": 5, "max": 10 } } ],
                "events": 10,
                "mode": "physical",
                "resolution": { "SI": 0.01 }
            }"#,
        )
        .unwrap();
        assert_eq!(config.mode, SimulationMode::Physical);
        assert!(!config.track_neutrons);
        assert_eq!(config.resolution.get("SI"), Some(&0.01));
    }
}
