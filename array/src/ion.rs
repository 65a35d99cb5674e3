use multidet_common::{ChargeNumber, Energy, MassNumber, STOPPED_ENERGY_FLOOR};
use serde::{Deserialize, Serialize};

/// Species and kinematics of an ion travelling through the array.
/// Angles are laboratory polar and azimuthal angles in degrees.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Ion {
    pub z: ChargeNumber,
    pub a: MassNumber,
    pub energy: Energy,
    pub theta: f64,
    pub phi: f64,
}

impl Ion {
    pub fn new(z: ChargeNumber, a: MassNumber, energy: Energy, theta: f64, phi: f64) -> Self {
        Self {
            z,
            a,
            energy,
            theta,
            phi,
        }
    }

    pub fn is_neutral(&self) -> bool {
        self.z == 0
    }

    pub fn is_stopped(&self) -> bool {
        self.energy < STOPPED_ENERGY_FLOOR
    }

    pub fn energy_per_nucleon(&self) -> Energy {
        self.energy / self.a.max(1) as f64
    }

    /// Removes up to `delta_e` from the kinetic energy, returns the energy actually lost.
    pub fn lose_energy(&mut self, delta_e: Energy) -> Energy {
        let lost = delta_e.clamp(0.0, self.energy);
        self.energy -= lost;
        lost
    }
}
