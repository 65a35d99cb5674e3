//! Calibrators and the text files defining them.
mod calibrator;
mod file;

pub use calibrator::{CalibrationFunction, CalibrationFunctionError, Calibrator};
pub use file::{CalibrationDefinition, CalibrationFileError};
