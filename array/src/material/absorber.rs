use super::{
    MaterialProperties, MaterialTable,
    stopping::{InversionError, StoppingFunctions, energy_limit},
};
use crate::numeric::RootFinder;
use multidet_common::{ChargeNumber, Energy, MassNumber};
use serde::Deserialize;
use thiserror::Error;

const DEFAULT_GAS_TEMPERATURE: f64 = 19.0;

#[derive(Debug, Error, PartialEq)]
pub enum AbsorberError {
    #[error("Unknown material '{0}'")]
    UnknownMaterial(String),
    #[error("Layer of '{0}' has no thickness")]
    MissingThickness(String),
    #[error("Gas layer of '{0}' needs a pressure")]
    MissingPressure(String),
    #[error("Layer of '{0}' has a non-positive thickness")]
    NonPositiveThickness(String),
}

/// Description of one absorber layer as found in an array configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LayerConfig {
    pub material: String,
    pub thickness_um: Option<f64>,
    pub thickness_cm: Option<f64>,
    /// mg/cm²
    pub area_density: Option<f64>,
    pub pressure_mbar: Option<f64>,
    pub temperature_celsius: Option<f64>,
    #[serde(default)]
    pub active: bool,
}

/// A slab of one material.
#[derive(Clone, Debug, PartialEq)]
pub struct Absorber {
    material: MaterialProperties,
    /// mg/cm²
    area_density: f64,
    pressure_mbar: Option<f64>,
    temperature_celsius: Option<f64>,
}

impl Absorber {
    pub fn from_area_density(material: &MaterialProperties, area_density: f64) -> Self {
        Self {
            material: material.clone(),
            area_density,
            pressure_mbar: None,
            temperature_celsius: None,
        }
    }

    pub fn from_micrometres(material: &MaterialProperties, thickness_um: f64) -> Self {
        // 1 µm of material of density 1 g/cm³ is 0.1 mg/cm²
        Self::from_area_density(material, thickness_um * material.density / 10.0)
    }

    pub fn gas(
        material: &MaterialProperties,
        thickness_cm: f64,
        pressure_mbar: f64,
        temperature_celsius: f64,
    ) -> Self {
        let density = material.gas_density(pressure_mbar, temperature_celsius);
        Self {
            material: material.clone(),
            area_density: thickness_cm * density * 1000.0,
            pressure_mbar: Some(pressure_mbar),
            temperature_celsius: Some(temperature_celsius),
        }
    }

    pub fn from_config(config: &LayerConfig, table: &MaterialTable) -> Result<Self, AbsorberError> {
        let material = table
            .lookup(&config.material)
            .ok_or_else(|| AbsorberError::UnknownMaterial(config.material.clone()))?;

        let absorber = if material.gaseous {
            let pressure = config
                .pressure_mbar
                .ok_or_else(|| AbsorberError::MissingPressure(config.material.clone()))?;
            let temperature = config
                .temperature_celsius
                .unwrap_or(DEFAULT_GAS_TEMPERATURE);
            match (config.thickness_cm, config.thickness_um, config.area_density) {
                (Some(cm), _, _) => Self::gas(material, cm, pressure, temperature),
                (None, Some(um), _) => Self::gas(material, um * 1e-4, pressure, temperature),
                (None, None, Some(area_density)) => Self {
                    material: material.clone(),
                    area_density,
                    pressure_mbar: Some(pressure),
                    temperature_celsius: Some(temperature),
                },
                (None, None, None) => {
                    return Err(AbsorberError::MissingThickness(config.material.clone()));
                }
            }
        } else {
            match (config.area_density, config.thickness_um, config.thickness_cm) {
                (Some(area_density), _, _) => Self::from_area_density(material, area_density),
                (None, Some(um), _) => Self::from_micrometres(material, um),
                (None, None, Some(cm)) => Self::from_micrometres(material, cm * 1e4),
                (None, None, None) => {
                    return Err(AbsorberError::MissingThickness(config.material.clone()));
                }
            }
        };

        if absorber.area_density <= 0.0 {
            return Err(AbsorberError::NonPositiveThickness(config.material.clone()));
        }
        Ok(absorber)
    }

    pub fn material(&self) -> &MaterialProperties {
        &self.material
    }

    pub fn area_density(&self) -> f64 {
        self.area_density
    }

    pub fn pressure_mbar(&self) -> Option<f64> {
        self.pressure_mbar
    }

    /// g/cm³
    pub fn density(&self) -> f64 {
        match (self.pressure_mbar, self.temperature_celsius) {
            (Some(pressure), Some(temperature)) => {
                self.material.gas_density(pressure, temperature)
            }
            _ => self.material.density,
        }
    }

    pub fn thickness_um(&self) -> f64 {
        self.area_density / self.density() * 10.0
    }

    /// Range in mg/cm².
    pub fn mass_range(&self, z: ChargeNumber, a: MassNumber, e: Energy) -> f64 {
        if z == 0 || e <= 0.0 {
            return if z == 0 { f64::INFINITY } else { 0.0 };
        }
        let a = a.max(1) as f64;
        let z = z as f64;
        let eps = e / a;
        let MaterialProperties { k, b, c, .. } = self.material;
        (a / (z * z)) * k * eps.powf(b) * (1.0 + c * z.powf(2.0 / 3.0) / (1.0 + eps))
    }

    /// Linear range in µm.
    pub fn range(&self, z: ChargeNumber, a: MassNumber, e: Energy) -> f64 {
        self.mass_range(z, a, e) / self.density() * 10.0
    }

    /// Kinetic energy of an ion whose range is `mass_range` mg/cm².
    fn energy_of_mass_range(
        &self,
        z: ChargeNumber,
        a: MassNumber,
        mass_range: f64,
    ) -> Result<Energy, InversionError> {
        if mass_range <= 0.0 {
            return Ok(0.0);
        }
        let mut upper = energy_limit(a);
        // The law is monotonic so the bracket can be widened beyond the validity range
        while self.mass_range(z, a, upper) < mass_range {
            upper *= 2.0;
            if !upper.is_finite() {
                return Err(InversionError::ResidualOutOfRange(mass_range));
            }
        }
        Ok(RootFinder::default().invert_increasing(
            |e| self.mass_range(z, a, e),
            mass_range,
            0.0,
            upper,
        )?)
    }
}

impl StoppingFunctions for Absorber {
    fn delta_e(&self, z: ChargeNumber, a: MassNumber, e_inc: Energy) -> Energy {
        (e_inc - self.e_res(z, a, e_inc)).max(0.0)
    }

    fn e_res(&self, z: ChargeNumber, a: MassNumber, e_inc: Energy) -> Energy {
        if z == 0 {
            return e_inc.max(0.0);
        }
        let remaining = self.mass_range(z, a, e_inc) - self.area_density;
        if remaining <= 0.0 {
            return 0.0;
        }
        self.energy_of_mass_range(z, a, remaining)
            .unwrap_or(0.0)
            .clamp(0.0, e_inc)
    }

    fn e_inc_of_max_delta_e(&self, z: ChargeNumber, a: MassNumber) -> Energy {
        self.punch_through_energy(z, a)
    }

    fn punch_through_energy(&self, z: ChargeNumber, a: MassNumber) -> Energy {
        if z == 0 {
            return 0.0;
        }
        self.energy_of_mass_range(z, a, self.area_density)
            .unwrap_or_else(|_| energy_limit(a))
    }

    fn solve_incident_energy_from_e_res(
        &self,
        z: ChargeNumber,
        a: MassNumber,
        e_res: Energy,
    ) -> Result<Energy, InversionError> {
        if z == 0 {
            return Ok(e_res);
        }
        if e_res <= 0.0 {
            return Ok(self.punch_through_energy(z, a));
        }
        self.energy_of_mass_range(z, a, self.mass_range(z, a, e_res) + self.area_density)
    }
}
