use super::{CalibrationFunction, CalibrationFunctionError, Calibrator};
use crate::array::DetectorArray;
use multidet_common::{NumericRange, RangeParseError, RunNumber};
use std::{collections::HashSet, fs, path::Path, str::FromStr};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum CalibrationFileError {
    #[error("Cannot read calibration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Line {line}: expected 'key: value'")]
    MissingSeparator { line: usize },
    #[error("Line {line}: invalid parameter '{value}'")]
    InvalidParameter { line: usize, value: String },
    #[error("Line {line}: invalid option '{option}'")]
    InvalidOption { line: usize, option: String },
    #[error("Line {line}: {source}")]
    Function {
        line: usize,
        source: CalibrationFunctionError,
    },
    #[error("Line {line}: {source}")]
    Range { line: usize, source: RangeParseError },
    #[error("Missing required key '{0}'")]
    MissingKey(&'static str),
}

/// One calibration definition: the signals it relates, its function and the
/// per-detector parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct CalibrationDefinition {
    signal_in: String,
    signal_out: String,
    calibration_type: String,
    function: CalibrationFunction,
    domain: Option<(f64, f64)>,
    inverse: bool,
    z_range: Option<NumericRange>,
    run_list: NumericRange,
    parameters: Vec<(String, Vec<f64>)>,
}

#[derive(Default)]
struct CalibrationOptions {
    function: Option<CalibrationFunction>,
    min: Option<f64>,
    max: Option<f64>,
    inverse: bool,
}

fn parse_options(value: &str, line: usize) -> Result<CalibrationOptions, CalibrationFileError> {
    let mut options = CalibrationOptions::default();
    for option in value.split(',').map(str::trim).filter(|o| !o.is_empty()) {
        let invalid = || CalibrationFileError::InvalidOption {
            line,
            option: option.to_owned(),
        };
        let (key, value) = option.split_once('=').ok_or_else(invalid)?;
        match key.trim() {
            "func" => {
                options.function = Some(
                    value
                        .parse()
                        .map_err(|source| CalibrationFileError::Function { line, source })?,
                )
            }
            "min" => options.min = Some(value.trim().parse().map_err(|_| invalid())?),
            "max" => options.max = Some(value.trim().parse().map_err(|_| invalid())?),
            "inverse" => options.inverse = value.trim().parse().map_err(|_| invalid())?,
            _ => return Err(invalid()),
        }
    }
    Ok(options)
}

fn parse_parameters(value: &str, line: usize) -> Result<Vec<f64>, CalibrationFileError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| {
            p.parse().map_err(|_| CalibrationFileError::InvalidParameter {
                line,
                value: p.to_owned(),
            })
        })
        .collect()
}

impl FromStr for CalibrationDefinition {
    type Err = CalibrationFileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut signal_in = None;
        let mut signal_out = None;
        let mut calibration_type = None;
        let mut options = CalibrationOptions::default();
        let mut z_range = None;
        let mut run_list = NumericRange::All;
        let mut parameters = Vec::new();

        for (index, text) in s.lines().enumerate() {
            let line = index + 1;
            let text = text.trim();
            if text.is_empty() || text.starts_with('#') {
                continue;
            }
            let (key, value) = text
                .split_once(':')
                .ok_or(CalibrationFileError::MissingSeparator { line })?;
            let value = value.trim();
            let range = |value: &str| {
                value
                    .parse::<NumericRange>()
                    .map_err(|source| CalibrationFileError::Range { line, source })
            };
            match key.trim() {
                "SignalIn" => signal_in = Some(value.to_owned()),
                "SignalOut" => signal_out = Some(value.to_owned()),
                "CalibType" => calibration_type = Some(value.to_owned()),
                "CalibOptions" => options = parse_options(value, line)?,
                "ZRange" => z_range = Some(range(value)?),
                "RunList" => run_list = range(value)?,
                detector => parameters.push((detector.to_owned(), parse_parameters(value, line)?)),
            }
        }

        let calibration_type = calibration_type.ok_or(CalibrationFileError::MissingKey("CalibType"))?;
        let function = match options.function {
            Some(function) => function,
            // Without an explicit function the type names it, falling back to a straight line
            None => calibration_type
                .parse()
                .unwrap_or(CalibrationFunction::Polynomial(1)),
        };
        let domain = match (options.min, options.max) {
            (None, None) => None,
            (min, max) => Some((min.unwrap_or(0.0), max.unwrap_or(1.0e5))),
        };
        Ok(Self {
            signal_in: signal_in.ok_or(CalibrationFileError::MissingKey("SignalIn"))?,
            signal_out: signal_out.ok_or(CalibrationFileError::MissingKey("SignalOut"))?,
            calibration_type,
            function,
            domain,
            inverse: options.inverse,
            z_range,
            run_list,
            parameters,
        })
    }
}

impl CalibrationDefinition {
    pub fn from_file(path: &Path) -> Result<Self, CalibrationFileError> {
        fs::read_to_string(path)?.parse()
    }

    pub fn signal_in(&self) -> &str {
        &self.signal_in
    }

    pub fn signal_out(&self) -> &str {
        &self.signal_out
    }

    pub fn run_list(&self) -> &NumericRange {
        &self.run_list
    }

    pub fn applies_to_run(&self, run: RunNumber) -> bool {
        self.run_list.contains(run as i64)
    }

    /// Detector names listed in the definition, in file order.
    pub fn detectors(&self) -> impl Iterator<Item = &str> {
        self.parameters.iter().map(|(name, _)| name.as_str())
    }

    /// The calibrator for one listed detector.
    pub fn calibrator(&self, detector: &str) -> Option<Calibrator> {
        let (_, parameters) = self.parameters.iter().find(|(name, _)| name == detector)?;
        let mut calibrator = Calibrator::new(
            &self.signal_in,
            &self.signal_out,
            self.function.clone(),
            parameters.clone(),
        )
        .with_type(&self.calibration_type)
        .with_inverse(self.inverse);
        if let Some((min, max)) = self.domain {
            calibrator = calibrator.with_domain(min, max);
        }
        if let Some(z_range) = &self.z_range {
            calibrator = calibrator.with_z_range(z_range.clone());
        }
        Some(calibrator)
    }

    /// Installs the calibrators of this definition on the array if `run` is in its run list.
    /// Returns the number of calibrators added.
    pub fn apply(&self, array: &mut DetectorArray, run: RunNumber) -> usize {
        if !self.applies_to_run(run) {
            debug!(
                "Calibration {} not valid for run {run}",
                self.calibration_type
            );
            return 0;
        }
        let mut unknown = HashSet::new();
        let mut added = 0;
        for detector in self.detectors() {
            let Some(id) = array.detector_id(detector) else {
                if unknown.insert(detector) {
                    warn!("Calibration {}: unknown detector {detector}", self.calibration_type);
                }
                continue;
            };
            let Some(calibrator) = self.calibrator(detector) else {
                continue;
            };
            match array.add_calibrator(id, calibrator) {
                Ok(()) => added += 1,
                Err(e) => warn!("Calibration {} of {detector}: {e}", self.calibration_type),
            }
        }
        added
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::ExtraParams;
    use assert_approx_eq::assert_approx_eq;

    const SILICON: &str = "
# Silicon channel-energy
SignalIn: PG
SignalOut: Energy
CalibType: channel-energy
CalibOptions: func=pol1,min=0,max=16384
RunList: 100-200, 250

SI_0101: 0.1, 0.02
SI_0102: -0.3,0.021
";

    #[test]
    fn parse_definition() {
        let definition: CalibrationDefinition = SILICON.parse().unwrap();
        assert_eq!(definition.signal_in(), "PG");
        assert_eq!(definition.signal_out(), "Energy");
        assert_eq!(
            definition.detectors().collect::<Vec<_>>(),
            vec!["SI_0101", "SI_0102"]
        );
        assert!(definition.applies_to_run(150));
        assert!(definition.applies_to_run(250));
        assert!(!definition.applies_to_run(220));

        let calibrator = definition.calibrator("SI_0102").unwrap();
        assert_eq!(calibrator.calibration_type(), "channel-energy");
        assert_eq!(calibrator.parameters(), &[-0.3, 0.021]);
        assert_approx_eq!(
            calibrator.compute(1000.0, &ExtraParams::default()).unwrap(),
            20.7,
            1e-12
        );
        assert_eq!(definition.calibrator("SI_0103"), None);
    }

    #[test]
    fn run_list_defaults_to_all_runs() {
        let definition: CalibrationDefinition =
            "SignalIn: QL1\nSignalOut: Energy\nCalibType: pol2\nCI_01: 1,2,3".parse().unwrap();
        assert!(definition.applies_to_run(1));
        assert!(definition.applies_to_run(99999));
        assert_eq!(
            definition.calibrator("CI_01").unwrap().function(),
            &CalibrationFunction::Polynomial(2)
        );
    }

    #[test]
    fn z_range_is_carried() {
        let definition: CalibrationDefinition = "SignalIn: TotLight\nSignalOut: Energy\nCalibType: light-energy\nCalibOptions: func=light-energy-csi\nZRange: 3-10\nCSI_0101: 1.1, 0.25"
            .parse()
            .unwrap();
        let calibrator = definition.calibrator("CSI_0101").unwrap();
        assert!(calibrator.applies_to_z(Some(6)));
        assert!(!calibrator.applies_to_z(Some(2)));
        assert_eq!(calibrator.function(), &CalibrationFunction::LightEnergyCsI);
    }

    #[test]
    fn errors_carry_line_numbers() {
        assert!(matches!(
            "SignalIn: PG\nSignalOut Energy".parse::<CalibrationDefinition>(),
            Err(CalibrationFileError::MissingSeparator { line: 2 })
        ));
        assert!(matches!(
            "SignalIn: PG\nSignalOut: Energy\nCalibType: pol1\nSI_01: 1.0, abc".parse::<CalibrationDefinition>(),
            Err(CalibrationFileError::InvalidParameter { line: 4, .. })
        ));
        assert!(matches!(
            "SignalIn: PG\nSignalOut: Energy\nCalibType: pol1\nCalibOptions: func=spline".parse::<CalibrationDefinition>(),
            Err(CalibrationFileError::Function { line: 4, .. })
        ));
        assert!(matches!(
            "SignalIn: PG\nSignalOut: Energy\nCalibType: pol1\nRunList: 20-10".parse::<CalibrationDefinition>(),
            Err(CalibrationFileError::Range { line: 4, .. })
        ));
        assert!(matches!(
            "SignalIn: PG\nCalibType: pol1".parse::<CalibrationDefinition>(),
            Err(CalibrationFileError::MissingKey("SignalOut"))
        ));
    }
}
