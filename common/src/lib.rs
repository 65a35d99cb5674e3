pub mod metrics;
pub mod range;
pub mod tracer;

pub use range::{NumericRange, RangeParseError};

/// Atomic number of an ion.
pub type ChargeNumber = u32;
/// Mass number of an ion.
pub type MassNumber = u32;
/// Kinetic energies and energy losses, in MeV.
pub type Energy = f64;
pub type RunNumber = u32;
pub type EventNumber = u64;

/// Heaviest ion species the stopping model is parametrised for.
pub const MAX_SUPPORTED_Z: ChargeNumber = 100;

/// Below this kinetic energy (MeV) an ion is considered stopped.
pub const STOPPED_ENERGY_FLOOR: Energy = 1.0e-3;

/// Most probable mass number for a given atomic number, following the
/// evaporation-attractor line. Used whenever a mass hypothesis is needed
/// but no mass measurement is available.
pub fn most_probable_mass(z: ChargeNumber) -> MassNumber {
    match z {
        0 | 1 => 1,
        2 => 4,
        _ => {
            let z = z as f64;
            (1.867 * z + 0.016 * z * z - 1.07e-4 * z * z * z).round() as MassNumber
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn light_ion_masses() {
        assert_eq!(most_probable_mass(1), 1);
        assert_eq!(most_probable_mass(2), 4);
        assert_eq!(most_probable_mass(6), 12);
        assert_eq!(most_probable_mass(20), 43);
    }
}
