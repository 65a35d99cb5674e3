use crate::numeric::{RootFindError, RootFinder};
use multidet_common::{ChargeNumber, Energy, MassNumber};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Highest energy per nucleon the range law is used for.
pub const MAX_ENERGY_PER_NUCLEON: f64 = 500.0;

/// Which monotonic part of the ΔE(E) curve an inversion is restricted to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "kebab-case")]
pub enum Branch {
    /// The ion stops inside the absorber, ΔE rises with E.
    Stopping,
    /// The ion punches through, ΔE falls with E.
    Transmission,
}

#[derive(Debug, Error, Clone, Copy, PartialEq)]
pub enum InversionError {
    #[error("Energy loss {delta_e} MeV exceeds the maximum {max} MeV reached at {e_of_max} MeV")]
    AboveMaximum {
        delta_e: Energy,
        max: Energy,
        e_of_max: Energy,
    },
    #[error("Residual energy {0} MeV cannot be reached below the model energy limit")]
    ResidualOutOfRange(Energy),
    #[error("Neutral particles lose no energy")]
    Neutral,
    #[error("Root finding failed: {0}")]
    RootFind(#[from] RootFindError),
}

pub fn energy_limit(a: MassNumber) -> Energy {
    MAX_ENERGY_PER_NUCLEON * a.max(1) as f64
}

/// Forward and inverse energy-loss calculations for a slab or a stack of slabs.
///
/// Implementors supply the forward functions; all inverses are performed numerically on
/// the implementor's own forward functions, never layer by layer.
pub trait StoppingFunctions {
    /// Energy lost in the instrumented part of the slab(s).
    fn delta_e(&self, z: ChargeNumber, a: MassNumber, e_inc: Energy) -> Energy;

    /// Energy remaining after the slab(s).
    fn e_res(&self, z: ChargeNumber, a: MassNumber, e_inc: Energy) -> Energy;

    /// Incident energy at which `delta_e` is maximal.
    fn e_inc_of_max_delta_e(&self, z: ChargeNumber, a: MassNumber) -> Energy;

    /// Lowest incident energy leaving a non-zero residual energy.
    fn punch_through_energy(&self, z: ChargeNumber, a: MassNumber) -> Energy;

    /// Lowest incident energy giving a non-zero `delta_e`.
    fn threshold_energy(&self, _z: ChargeNumber, _a: MassNumber) -> Energy {
        0.0
    }

    fn max_delta_e(&self, z: ChargeNumber, a: MassNumber) -> Energy {
        self.delta_e(z, a, self.e_inc_of_max_delta_e(z, a))
    }

    fn total_delta_e(&self, z: ChargeNumber, a: MassNumber, e_inc: Energy) -> Energy {
        e_inc - self.e_res(z, a, e_inc)
    }

    /// Incident energy giving the energy loss `delta_e` on the given branch.
    fn solve_incident_energy(
        &self,
        z: ChargeNumber,
        a: MassNumber,
        delta_e: Energy,
        branch: Branch,
    ) -> Result<Energy, InversionError> {
        if z == 0 {
            return Err(InversionError::Neutral);
        }
        if delta_e <= 0.0 {
            return Ok(0.0);
        }
        let e_of_max = self.e_inc_of_max_delta_e(z, a);
        let max = self.delta_e(z, a, e_of_max);
        if delta_e > max {
            return Err(InversionError::AboveMaximum {
                delta_e,
                max,
                e_of_max,
            });
        }
        let finder = RootFinder::default();
        let energy = match branch {
            Branch::Stopping => finder.invert_increasing(
                |e| self.delta_e(z, a, e),
                delta_e,
                self.threshold_energy(z, a),
                e_of_max,
            )?,
            Branch::Transmission => {
                let limit = energy_limit(a).max(e_of_max);
                if self.delta_e(z, a, limit) > delta_e {
                    debug!("Energy loss {delta_e} MeV below model range, clamping to {limit} MeV");
                    limit
                } else {
                    finder.brent(|e| self.delta_e(z, a, e) - delta_e, e_of_max, limit)?
                }
            }
        };
        Ok(energy)
    }

    /// As [Self::solve_incident_energy] but returns the negated energy of the maximum
    /// when `delta_e` exceeds the maximum, and -1 on any other failure.
    fn incident_energy(
        &self,
        z: ChargeNumber,
        a: MassNumber,
        delta_e: Energy,
        branch: Branch,
    ) -> Energy {
        match self.solve_incident_energy(z, a, delta_e, branch) {
            Ok(energy) => energy,
            Err(InversionError::AboveMaximum { e_of_max, .. }) => -e_of_max,
            Err(e) => {
                debug!("{e}");
                -1.0
            }
        }
    }

    /// Incident energy leaving the residual energy `e_res`.
    fn solve_incident_energy_from_e_res(
        &self,
        z: ChargeNumber,
        a: MassNumber,
        e_res: Energy,
    ) -> Result<Energy, InversionError> {
        if z == 0 {
            return Ok(e_res);
        }
        let punch_through = self.punch_through_energy(z, a);
        if e_res <= 0.0 {
            return Ok(punch_through);
        }
        let limit = energy_limit(a).max(e_res * 2.0);
        if self.e_res(z, a, limit) < e_res {
            return Err(InversionError::ResidualOutOfRange(e_res));
        }
        Ok(RootFinder::default().invert_increasing(
            |e| self.e_res(z, a, e),
            e_res,
            punch_through,
            limit,
        )?)
    }

    fn incident_energy_from_e_res(&self, z: ChargeNumber, a: MassNumber, e_res: Energy) -> Energy {
        self.solve_incident_energy_from_e_res(z, a, e_res)
            .unwrap_or_else(|e| {
                debug!("{e}");
                -1.0
            })
    }
}
