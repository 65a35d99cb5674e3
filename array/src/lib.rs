//! Model of a multi-detector array: energy loss in absorbers, detectors and their
//! signals, calibrations and the topology derived from the geometry of the array.
pub mod array;
pub mod calibration;
pub mod detector;
pub mod event;
mod ids;
pub mod ion;
pub mod material;
pub mod numeric;
pub mod signal;
pub mod target;
pub mod topology;

pub use array::{ArrayBuilder, ArrayConfig, ArrayError, DetectorArray, SignalValues};
pub use detector::{Detector, DetectorGeometry};
pub use ids::{DetectorId, GroupId, TelescopeId, TrajectoryId};
pub use ion::Ion;
pub use material::{Branch, StoppingFunctions};
pub use target::{Target, TargetOrientation};
