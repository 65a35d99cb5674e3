//! Energy loss and range of ions in matter.
mod absorber;
mod stopping;
mod table;

pub use absorber::{Absorber, AbsorberError, LayerConfig};
pub use stopping::{Branch, InversionError, MAX_ENERGY_PER_NUCLEON, StoppingFunctions, energy_limit};
pub use table::{MaterialProperties, MaterialTable};
