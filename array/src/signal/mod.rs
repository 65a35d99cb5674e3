//! Named scalar quantities of a detector and the calibration graph relating them.
mod expression;
mod params;

use crate::calibration::Calibrator;
pub use expression::{Expression, ExpressionError};
pub use params::ExtraParams;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum SignalError {
    #[error("Unknown signal '{0}'")]
    Unknown(String),
    #[error("Signal '{0}' is not a raw signal")]
    NotRaw(String),
    #[error("Signal '{0}' is not calibrated for the given parameters")]
    NotCalibrated(String),
    #[error("Signal '{0}' cannot be inverted")]
    NotInvertible(String),
    #[error("Signal '{target}' is not an input of '{output}'")]
    TargetNotReached { output: String, target: String },
    #[error("Calibrating '{input}' into '{output}' would create a cycle")]
    CyclicDependency { input: String, output: String },
    #[error("Formula of signal '{0}' references unknown signal '{1}'")]
    UnknownReference(String, String),
    #[error("{0}")]
    Expression(#[from] ExpressionError),
}

#[derive(Clone, Debug, PartialEq)]
pub enum SignalKind {
    /// Read out directly; set once per event.
    Raw { value: f64, fired: bool },
    /// Formula over sibling signals.
    Expression(Expression),
    /// Derived from one input signal.
    Calibrated(Calibrator),
    /// Derived by the calibrator whose Z range contains the `Z` extra parameter.
    ZDependent(Vec<Calibrator>),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Signal {
    name: String,
    kind: SignalKind,
}

impl Signal {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &SignalKind {
        &self.kind
    }

    pub fn is_raw(&self) -> bool {
        matches!(self.kind, SignalKind::Raw { .. })
    }

    /// Only raw signals can be fired.
    pub fn is_fired(&self) -> bool {
        matches!(self.kind, SignalKind::Raw { fired: true, .. })
    }

    /// Names of the signals this one is computed from.
    fn inputs(&self) -> Vec<&str> {
        match &self.kind {
            SignalKind::Raw { .. } => Vec::new(),
            SignalKind::Expression(expression) => expression.variables(),
            SignalKind::Calibrated(calibrator) => vec![calibrator.input()],
            SignalKind::ZDependent(calibrators) => {
                calibrators.iter().map(Calibrator::input).collect()
            }
        }
    }
}

/// The signals of one detector, keyed by name.
///
/// The array keeps one registry per detector as a template; every event works on its own
/// clone so raw values are never shared between events.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SignalRegistry {
    signals: HashMap<String, Signal>,
}

impl SignalRegistry {
    pub fn get(&self, name: &str) -> Option<&Signal> {
        self.signals.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.signals.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.signals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.signals.keys().map(String::as_str)
    }

    pub fn raw_names(&self) -> impl Iterator<Item = &str> {
        self.signals
            .values()
            .filter(|signal| signal.is_raw())
            .map(Signal::name)
    }

    /// Adds a raw signal unless a signal of that name already exists.
    pub fn add_raw_signal(&mut self, name: &str) {
        self.signals
            .entry(name.to_owned())
            .or_insert_with(|| Signal {
                name: name.to_owned(),
                kind: SignalKind::Raw {
                    value: 0.0,
                    fired: false,
                },
            });
    }

    /// Adds a formula over existing signals, replacing any signal of the same name.
    pub fn add_expression_signal(&mut self, name: &str, formula: &str) -> Result<(), SignalError> {
        let expression: Expression = formula.parse()?;
        for variable in expression.variables() {
            if !self.contains(variable) || variable == name {
                return Err(SignalError::UnknownReference(
                    name.to_owned(),
                    variable.to_owned(),
                ));
            }
        }
        self.signals.insert(
            name.to_owned(),
            Signal {
                name: name.to_owned(),
                kind: SignalKind::Expression(expression),
            },
        );
        Ok(())
    }

    fn depends_on(&self, name: &str, target: &str) -> bool {
        let mut worklist = vec![name];
        let mut visited = Vec::new();
        while let Some(current) = worklist.pop() {
            if current == target {
                return true;
            }
            if visited.contains(&current) {
                continue;
            }
            visited.push(current);
            if let Some(signal) = self.signals.get(current) {
                worklist.extend(signal.inputs());
            }
        }
        false
    }

    /// Installs a calibrator: the input signal is created as a raw signal if missing,
    /// the output signal is replaced. A calibrator restricted to a Z range is merged
    /// into the Z-dependent output signal of the same name.
    pub fn add_calibrator(&mut self, calibrator: Calibrator) -> Result<(), SignalError> {
        let input = calibrator.input().to_owned();
        let output = calibrator.output().to_owned();
        if input == output || self.depends_on(&input, &output) {
            return Err(SignalError::CyclicDependency { input, output });
        }
        self.add_raw_signal(&input);

        let kind = if calibrator.z_range().is_some() {
            match self.signals.remove(&output).map(|signal| signal.kind) {
                Some(SignalKind::ZDependent(mut calibrators)) => {
                    calibrators.retain(|existing| existing.z_range() != calibrator.z_range());
                    calibrators.push(calibrator);
                    SignalKind::ZDependent(calibrators)
                }
                _ => SignalKind::ZDependent(vec![calibrator]),
            }
        } else {
            SignalKind::Calibrated(calibrator)
        };
        self.signals.insert(
            output.clone(),
            Signal {
                name: output,
                kind,
            },
        );
        Ok(())
    }

    /// Sets the value of a raw signal; it is fired when the value is positive.
    pub fn set_raw(&mut self, name: &str, new_value: f64) -> Result<(), SignalError> {
        match self.signals.get_mut(name).map(|signal| &mut signal.kind) {
            Some(SignalKind::Raw { value, fired }) => {
                *value = new_value;
                *fired = new_value > 0.0;
                Ok(())
            }
            Some(_) => Err(SignalError::NotRaw(name.to_owned())),
            None => Err(SignalError::Unknown(name.to_owned())),
        }
    }

    /// Resets all raw signals for a new event.
    pub fn clear(&mut self) {
        for signal in self.signals.values_mut() {
            if let SignalKind::Raw { value, fired } = &mut signal.kind {
                *value = 0.0;
                *fired = false;
            }
        }
    }

    /// Any raw signal fired.
    pub fn is_fired(&self) -> bool {
        self.signals.values().any(Signal::is_fired)
    }

    fn select<'a>(
        name: &str,
        calibrators: &'a [Calibrator],
        params: &ExtraParams,
    ) -> Result<&'a Calibrator, SignalError> {
        let z = params.z().ok_or_else(|| SignalError::NotCalibrated(name.to_owned()))?;
        calibrators
            .iter()
            .find(|calibrator| calibrator.applies_to_z(Some(z)))
            .ok_or_else(|| SignalError::NotCalibrated(name.to_owned()))
    }

    pub fn try_value(&self, name: &str, params: &ExtraParams) -> Result<f64, SignalError> {
        let signal = self
            .signals
            .get(name)
            .ok_or_else(|| SignalError::Unknown(name.to_owned()))?;
        match &signal.kind {
            SignalKind::Raw { value, .. } => Ok(*value),
            SignalKind::Expression(expression) => expression
                .evaluate(&|variable: &str| {
                    self.try_value(variable, params)
                        .ok()
                        .or_else(|| params.get(variable))
                })
                .ok_or_else(|| SignalError::NotCalibrated(name.to_owned())),
            SignalKind::Calibrated(calibrator) => {
                let input = self.try_value(calibrator.input(), params)?;
                calibrator
                    .compute(input, params)
                    .ok_or_else(|| SignalError::NotCalibrated(name.to_owned()))
            }
            SignalKind::ZDependent(calibrators) => {
                let calibrator = Self::select(name, calibrators, params)?;
                let input = self.try_value(calibrator.input(), params)?;
                calibrator
                    .compute(input, params)
                    .ok_or_else(|| SignalError::NotCalibrated(name.to_owned()))
            }
        }
    }

    /// Value of a signal, `None` when it is unknown or not calibrated.
    pub fn value(&self, name: &str, params: &ExtraParams) -> Option<f64> {
        self.try_value(name, params).ok()
    }

    /// Walks back from `output` to `target_input`, inverting each calibrator on the way.
    pub fn try_inverse_value(
        &self,
        output: &str,
        value: f64,
        target_input: &str,
        params: &ExtraParams,
    ) -> Result<f64, SignalError> {
        if output == target_input {
            return Ok(value);
        }
        let signal = self
            .signals
            .get(output)
            .ok_or_else(|| SignalError::Unknown(output.to_owned()))?;
        let calibrator = match &signal.kind {
            SignalKind::Calibrated(calibrator) => calibrator,
            SignalKind::ZDependent(calibrators) => Self::select(output, calibrators, params)?,
            SignalKind::Expression(_) => return Err(SignalError::NotInvertible(output.to_owned())),
            SignalKind::Raw { .. } => {
                return Err(SignalError::TargetNotReached {
                    output: output.to_owned(),
                    target: target_input.to_owned(),
                });
            }
        };
        let input_value = calibrator
            .invert(value, params)
            .ok_or_else(|| SignalError::NotInvertible(output.to_owned()))?;
        self.try_inverse_value(calibrator.input(), input_value, target_input, params)
            .map_err(|e| match e {
                SignalError::TargetNotReached { target, .. } => SignalError::TargetNotReached {
                    output: output.to_owned(),
                    target,
                },
                e => e,
            })
    }

    pub fn inverse_value(
        &self,
        output: &str,
        value: f64,
        target_input: &str,
        params: &ExtraParams,
    ) -> Option<f64> {
        self.try_inverse_value(output, value, target_input, params)
            .ok()
    }

    /// The raw signal at the root of the calibration chain of `output`, following the
    /// first calibrator of Z-dependent signals.
    pub fn raw_source(&self, output: &str) -> Option<&str> {
        let mut current = self.signals.get(output)?;
        loop {
            let input = match &current.kind {
                SignalKind::Raw { .. } => return Some(current.name()),
                SignalKind::Expression(_) => return None,
                SignalKind::Calibrated(calibrator) => calibrator.input(),
                SignalKind::ZDependent(calibrators) => calibrators.first()?.input(),
            };
            current = self.signals.get(input)?;
        }
    }
}
