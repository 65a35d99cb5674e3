use std::{
    collections::{HashMap, HashSet},
    sync::{Mutex, OnceLock},
};
use tracing::warn;

/// Universal gas constant in mbar.cm³/(mol.K).
const GAS_CONSTANT: f64 = 83_144.626;
const ZERO_CELSIUS: f64 = 273.15;

/// Parameters of the mass-range law of one substance.
///
/// `R(Z,A,E) = (A/Z²) · k · ε^b · (1 + c · Z^(2/3) / (1 + ε))` in mg/cm², with ε = E/A
/// in MeV per nucleon. The correction term lengthens the range of slow, partially
/// stripped ions.
#[derive(Clone, Debug, PartialEq)]
pub struct MaterialProperties {
    pub name: &'static str,
    pub k: f64,
    pub b: f64,
    pub c: f64,
    /// Solid/liquid density in g/cm³, or the density at 1013.25 mbar and 0°C for gases.
    pub density: f64,
    /// Molar mass in g/mol, used for gases.
    pub molar_mass: f64,
    pub gaseous: bool,
}

impl MaterialProperties {
    /// Gas density (g/cm³) at the given pressure and temperature.
    pub fn gas_density(&self, pressure_mbar: f64, temperature_celsius: f64) -> f64 {
        pressure_mbar * self.molar_mass / (GAS_CONSTANT * (temperature_celsius + ZERO_CELSIUS))
    }
}

macro_rules! material {
    ($name:literal, $k:expr, $b:expr, $c:expr, $density:expr, $molar_mass:expr, $gaseous:expr) => {
        MaterialProperties {
            name: $name,
            k: $k,
            b: $b,
            c: $c,
            density: $density,
            molar_mass: $molar_mass,
            gaseous: $gaseous,
        }
    };
}

/// Lookup of material properties by type name (case-insensitive).
pub struct MaterialTable {
    materials: HashMap<String, MaterialProperties>,
    reported_unknown: Mutex<HashSet<String>>,
}

impl MaterialTable {
    fn new(materials: Vec<MaterialProperties>) -> Self {
        Self {
            materials: materials
                .into_iter()
                .map(|material| (material.name.to_lowercase(), material))
                .collect(),
            reported_unknown: Default::default(),
        }
    }

    /// The table of built-in materials.
    pub fn standard() -> &'static MaterialTable {
        static TABLE: OnceLock<MaterialTable> = OnceLock::new();
        TABLE.get_or_init(|| {
            MaterialTable::new(vec![
                material!("Si", 3.02, 1.75, 0.08, 2.33, 28.09, false),
                material!("CsI", 5.35, 1.73, 0.10, 4.51, 259.81, false),
                material!("Ge", 4.65, 1.74, 0.09, 5.32, 72.63, false),
                material!("Myl", 2.35, 1.77, 0.06, 1.395, 192.17, false),
                material!("NE102", 2.15, 1.77, 0.06, 1.032, 13.0, false),
                material!("C", 2.60, 1.76, 0.07, 2.265, 12.011, false),
                material!("Al", 3.30, 1.75, 0.08, 2.699, 26.98, false),
                material!("Ni", 4.45, 1.73, 0.09, 8.902, 58.69, false),
                material!("Sn", 5.60, 1.72, 0.10, 7.31, 118.71, false),
                material!("Au", 6.85, 1.70, 0.11, 19.32, 196.97, false),
                material!("C4F10", 2.62, 1.76, 0.07, 0.01062, 238.03, true),
                material!("CF4", 2.55, 1.76, 0.07, 0.00393, 88.0, true),
                material!("C4H10", 2.20, 1.77, 0.06, 0.00259, 58.12, true),
            ])
        })
    }

    /// Returns the named material; an unknown name is reported once and yields `None`.
    pub fn lookup(&self, name: &str) -> Option<&MaterialProperties> {
        let material = self.materials.get(&name.to_lowercase());
        if material.is_none() {
            if let Ok(mut reported) = self.reported_unknown.lock() {
                if reported.insert(name.to_owned()) {
                    warn!("Unknown material type '{name}'");
                }
            }
        }
        material
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.materials.values().map(|material| material.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn case_insensitive_lookup() {
        let table = MaterialTable::standard();
        assert_eq!(table.lookup("si").map(|m| m.name), Some("Si"));
        assert_eq!(table.lookup("CSI").map(|m| m.name), Some("CsI"));
        assert!(table.lookup("unobtainium").is_none());
        assert!(table.lookup("unobtainium").is_none());
    }

    #[test]
    fn ideal_gas_density() {
        let c4f10 = MaterialTable::standard().lookup("C4F10").unwrap();
        // Normal conditions reproduce the tabulated density
        assert_approx_eq!(c4f10.gas_density(1013.25, 0.0), c4f10.density, 1e-4);
        // Density scales linearly with pressure
        assert_approx_eq!(
            c4f10.gas_density(50.0, 19.0) / c4f10.gas_density(25.0, 19.0),
            2.0,
            1e-12
        );
    }
}
