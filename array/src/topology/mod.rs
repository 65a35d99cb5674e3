//! Structures derived from the geometry of the array: trajectories, telescopes and groups.
mod group;
mod telescope;
mod trajectory;

pub use group::Group;
pub(crate) use group::build_groups;
pub use telescope::{
    GENERIC_KIND, IdentificationMethod, RegistryError, Telescope, TelescopeConfig,
    TelescopeFactory, TelescopeRegistry, candidate_keys, telescope_name,
};
pub(crate) use telescope::generic;
pub use trajectory::{ReconstructionTrajectory, Trajectory};
pub(crate) use trajectory::trajectories_from_chains;
