//! Typed indices into the arenas owned by [crate::DetectorArray].
use serde::{Deserialize, Serialize};
use std::fmt::Display;

macro_rules! arena_id {
    ($name:ident, $prefix:literal) => {
        #[derive(
            Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub(crate) usize);

        impl $name {
            pub fn index(self) -> usize {
                self.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}{}", $prefix, self.0)
            }
        }
    };
}

arena_id!(DetectorId, "D");
arena_id!(TrajectoryId, "T");
arena_id!(TelescopeId, "ID");
arena_id!(GroupId, "G");
