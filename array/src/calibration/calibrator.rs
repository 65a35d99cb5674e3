use crate::{
    numeric::RootFinder,
    signal::{Expression, ExpressionError, ExtraParams},
};
use multidet_common::NumericRange;
use std::{fmt::Display, str::FromStr};
use thiserror::Error;

const DEFAULT_DOMAIN: (f64, f64) = (0.0, 1.0e5);

#[derive(Debug, Error, PartialEq)]
pub enum CalibrationFunctionError {
    #[error("Unknown calibration function '{0}'")]
    Unknown(String),
    #[error("Polynomial degree must be between 0 and 9, got '{0}'")]
    PolynomialDegree(String),
    #[error("Invalid formula: {0}")]
    Formula(#[from] ExpressionError),
}

/// Shape of a calibration; the parameters are held by the [Calibrator].
#[derive(Clone, Debug, PartialEq)]
pub enum CalibrationFunction {
    /// `p0 + p1·x + p2·x² + ...`
    Polynomial(usize),
    /// `p0·x^p1`
    Power,
    /// CsI light output of an ion of energy `x`:
    /// `p0·(x − p1·A·Z²·ln(1 + x/(p1·A·Z²)))`. Requires the `Z` and `A` parameters.
    LightEnergyCsI,
    /// Any formula in `x`, the parameters `p0..pn` and the extra parameters.
    Formula(Expression),
}

impl CalibrationFunction {
    /// Whether the parameters naturally describe the output→input direction.
    fn is_naturally_inverse(&self) -> bool {
        matches!(self, Self::LightEnergyCsI)
    }

    fn evaluate(&self, x: f64, parameters: &[f64], extra: &ExtraParams) -> Option<f64> {
        let parameter = |i: usize| parameters.get(i).copied().unwrap_or_default();
        match self {
            Self::Polynomial(degree) => Some(
                (0..=*degree)
                    .rev()
                    .fold(0.0, |acc, i| acc * x + parameter(i)),
            ),
            Self::Power => Some(parameter(0) * x.powf(parameter(1))),
            Self::LightEnergyCsI => {
                let z = extra.get("Z")?;
                let a = extra.get("A")?;
                let scale = parameter(1) * a * z * z;
                if scale <= 0.0 {
                    return Some(parameter(0) * x);
                }
                Some(parameter(0) * (x - scale * (1.0 + x / scale).ln()))
            }
            Self::Formula(expression) => expression.evaluate(&|name: &str| match name {
                "x" => Some(x),
                name => name
                    .strip_prefix('p')
                    .and_then(|index| index.parse::<usize>().ok())
                    .map(parameter)
                    .or_else(|| extra.get(name)),
            }),
        }
    }
}

impl FromStr for CalibrationFunction {
    type Err = CalibrationFunctionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(formula) = s.strip_prefix("formula:") {
            return Ok(Self::Formula(formula.parse()?));
        }
        match s.to_lowercase().as_str() {
            "linear" => Ok(Self::Polynomial(1)),
            "power" => Ok(Self::Power),
            "light-energy-csi" | "lightenergycsi" => Ok(Self::LightEnergyCsI),
            name => match name.strip_prefix("pol") {
                Some(degree) => degree
                    .parse::<usize>()
                    .ok()
                    .filter(|degree| *degree <= 9)
                    .map(Self::Polynomial)
                    .ok_or_else(|| CalibrationFunctionError::PolynomialDegree(s.to_owned())),
                None => Err(CalibrationFunctionError::Unknown(s.to_owned())),
            },
        }
    }
}

impl Display for CalibrationFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Polynomial(degree) => write!(f, "pol{degree}"),
            Self::Power => write!(f, "power"),
            Self::LightEnergyCsI => write!(f, "light-energy-csi"),
            Self::Formula(expression) => write!(f, "formula:{expression}"),
        }
    }
}

/// Maps the value of an input signal to the value of an output signal.
#[derive(Clone, Debug, PartialEq)]
pub struct Calibrator {
    calibration_type: String,
    input: String,
    output: String,
    function: CalibrationFunction,
    parameters: Vec<f64>,
    domain: (f64, f64),
    inverse: bool,
    z_range: Option<NumericRange>,
}

impl Calibrator {
    pub fn new(input: &str, output: &str, function: CalibrationFunction, parameters: Vec<f64>) -> Self {
        let inverse = function.is_naturally_inverse();
        Self {
            calibration_type: format!("{input}->{output}"),
            input: input.to_owned(),
            output: output.to_owned(),
            function,
            parameters,
            domain: DEFAULT_DOMAIN,
            inverse,
            z_range: None,
        }
    }

    pub fn with_type(mut self, calibration_type: &str) -> Self {
        self.calibration_type = calibration_type.to_owned();
        self
    }

    /// Bounds of the variable searched when a numeric inversion is needed.
    pub fn with_domain(mut self, min: f64, max: f64) -> Self {
        self.domain = (min, max);
        self
    }

    /// Declares that the parameters describe the output→input direction.
    pub fn with_inverse(mut self, inverse: bool) -> Self {
        self.inverse = inverse || self.function.is_naturally_inverse();
        self
    }

    pub fn with_z_range(mut self, z_range: NumericRange) -> Self {
        self.z_range = Some(z_range);
        self
    }

    pub fn calibration_type(&self) -> &str {
        &self.calibration_type
    }

    pub fn input(&self) -> &str {
        &self.input
    }

    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn parameters(&self) -> &[f64] {
        &self.parameters
    }

    pub fn function(&self) -> &CalibrationFunction {
        &self.function
    }

    pub fn z_range(&self) -> Option<&NumericRange> {
        self.z_range.as_ref()
    }

    pub fn applies_to_z(&self, z: Option<u32>) -> bool {
        match (&self.z_range, z) {
            (None, _) => true,
            (Some(range), Some(z)) => range.contains(z as i64),
            (Some(_), None) => false,
        }
    }

    fn direct(&self, x: f64, extra: &ExtraParams) -> Option<f64> {
        self.function
            .evaluate(x, &self.parameters, extra)
            .filter(|value| value.is_finite())
    }

    fn solve(&self, target: f64, extra: &ExtraParams) -> Option<f64> {
        let (min, max) = self.domain;
        // Evaluate once to fail early on missing extra parameters
        self.direct(min, extra)?;
        RootFinder::default()
            .brent(
                |u| self.direct(u, extra).unwrap_or(f64::NAN) - target,
                min,
                max,
            )
            .ok()
    }

    /// Output value for the input value `x`.
    pub fn compute(&self, x: f64, extra: &ExtraParams) -> Option<f64> {
        if self.inverse {
            self.solve(x, extra)
        } else {
            self.direct(x, extra)
        }
    }

    /// Input value giving the output value `y`.
    pub fn invert(&self, y: f64, extra: &ExtraParams) -> Option<f64> {
        if self.inverse {
            self.direct(y, extra)
        } else {
            self.solve(y, extra)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn parse_functions() {
        assert_eq!("pol2".parse(), Ok(CalibrationFunction::Polynomial(2)));
        assert_eq!("linear".parse(), Ok(CalibrationFunction::Polynomial(1)));
        assert_eq!(
            "LightEnergyCsI".parse(),
            Ok(CalibrationFunction::LightEnergyCsI)
        );
        assert_eq!(
            "pol12".parse::<CalibrationFunction>(),
            Err(CalibrationFunctionError::PolynomialDegree("pol12".to_owned()))
        );
        assert_eq!(
            "spline".parse::<CalibrationFunction>(),
            Err(CalibrationFunctionError::Unknown("spline".to_owned()))
        );
        let formula: CalibrationFunction = "formula:p0*exp(p1*x)".parse().unwrap();
        assert_eq!(formula.to_string(), "formula:p0*exp(p1*x)");
    }

    #[test]
    fn polynomial_forward_and_inverse() {
        let calibrator = Calibrator::new(
            "ADC",
            "Energy",
            CalibrationFunction::Polynomial(2),
            vec![0.5, 0.01, 1e-6],
        )
        .with_domain(0.0, 4096.0);
        let extra = ExtraParams::default();
        let energy = calibrator.compute(1000.0, &extra).unwrap();
        assert_approx_eq!(energy, 0.5 + 10.0 + 1.0, 1e-12);
        assert_approx_eq!(calibrator.invert(energy, &extra).unwrap(), 1000.0, 1e-8);
        // Outside the inversion domain
        assert_eq!(calibrator.invert(1e6, &extra), None);
    }

    #[test]
    fn inverse_declared_parameters() {
        // Parameters describe Energy -> ADC
        let calibrator = Calibrator::new("ADC", "Energy", CalibrationFunction::Polynomial(1), vec![10.0, 20.0])
            .with_domain(0.0, 1000.0)
            .with_inverse(true);
        let extra = ExtraParams::default();
        assert_approx_eq!(calibrator.compute(210.0, &extra).unwrap(), 10.0, 1e-9);
        assert_approx_eq!(calibrator.invert(10.0, &extra).unwrap(), 210.0, 1e-12);
    }

    #[test]
    fn csi_light_needs_ion_parameters() {
        let calibrator = Calibrator::new(
            "TotLight",
            "Energy",
            CalibrationFunction::LightEnergyCsI,
            vec![1.2, 0.3],
        )
        .with_domain(0.0, 2000.0);
        assert_eq!(calibrator.compute(100.0, &ExtraParams::default()), None);

        let alpha = ExtraParams::for_ion(2, 4);
        let light = calibrator.invert(120.0, &alpha).unwrap();
        assert!(light < 1.2 * 120.0);
        assert_approx_eq!(calibrator.compute(light, &alpha).unwrap(), 120.0, 1e-8);

        // Heavier ions produce less light for the same energy
        let carbon = ExtraParams::for_ion(6, 12);
        assert!(calibrator.invert(120.0, &carbon).unwrap() < light);
    }

    #[test]
    fn formula_uses_extra_parameters() {
        let calibrator = Calibrator::new(
            "ADC",
            "Energy",
            "formula:p0 + p1*x*Z".parse().unwrap(),
            vec![1.0, 0.5],
        );
        let extra = ExtraParams::default().with("Z", 2.0);
        assert_approx_eq!(calibrator.compute(10.0, &extra).unwrap(), 11.0, 1e-12);
    }

    #[test]
    fn z_range_selection() {
        let calibrator = Calibrator::new("ADC", "Energy", CalibrationFunction::Polynomial(1), vec![0.0, 1.0])
            .with_z_range("1-2".parse().unwrap());
        assert!(calibrator.applies_to_z(Some(2)));
        assert!(!calibrator.applies_to_z(Some(3)));
        assert!(!calibrator.applies_to_z(None));
    }
}
