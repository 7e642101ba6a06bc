//! Declarative measurement parameters.
//!
//! Each procedure declares the parameters it understands up front: name,
//! unit, whether it is required, an optional enumerated value set and an
//! optional default. Values from the test plan are bound once before `run`;
//! [`Parameters::validate`] rejects missing required parameters and
//! unrecognized enum values before any instrument is touched.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{AppResult, MeasureError};

/// Typed parameter value bound from a test plan.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ParameterValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    /// List of strings (matrix channel sets, analysis function names).
    List(Vec<String>),
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterValue::Bool(b) => write!(f, "{b}"),
            ParameterValue::Int(i) => write!(f, "{i}"),
            ParameterValue::Float(v) => write!(f, "{v}"),
            ParameterValue::String(s) => write!(f, "{s}"),
            ParameterValue::List(items) => write!(f, "{}", items.join(", ")),
        }
    }
}

impl ParameterValue {
    /// Numeric view; integers widen to float.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParameterValue::Float(v) => Some(*v),
            ParameterValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParameterValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParameterValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParameterValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            ParameterValue::List(items) => Some(items),
            _ => None,
        }
    }
}

impl From<bool> for ParameterValue {
    fn from(value: bool) -> Self {
        ParameterValue::Bool(value)
    }
}

impl From<i64> for ParameterValue {
    fn from(value: i64) -> Self {
        ParameterValue::Int(value)
    }
}

impl From<f64> for ParameterValue {
    fn from(value: f64) -> Self {
        ParameterValue::Float(value)
    }
}

impl From<&str> for ParameterValue {
    fn from(value: &str) -> Self {
        ParameterValue::String(value.to_string())
    }
}

impl From<String> for ParameterValue {
    fn from(value: String) -> Self {
        ParameterValue::String(value)
    }
}

impl From<Vec<String>> for ParameterValue {
    fn from(value: Vec<String>) -> Self {
        ParameterValue::List(value)
    }
}

/// Declaration of one parameter: unit, requiredness, allowed values, default.
#[derive(Clone, Debug)]
pub struct ParameterSpec {
    name: String,
    unit: Option<String>,
    required: bool,
    choices: Option<Vec<String>>,
    default: Option<ParameterValue>,
}

impl ParameterSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            unit: None,
            required: false,
            choices: None,
            default: None,
        }
    }

    /// Physical unit the bound value is expected in (e.g. "V", "s").
    pub fn unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    /// Mark the parameter as required; validation fails when it is unbound.
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Restrict string values to an enumerated set.
    pub fn choices(mut self, choices: &[&str]) -> Self {
        self.choices = Some(choices.iter().map(|s| s.to_string()).collect());
        self
    }

    /// Default used when the test plan leaves the parameter unbound.
    pub fn default(mut self, value: impl Into<ParameterValue>) -> Self {
        self.default = Some(value.into());
        self
    }
}

/// Registry of declared parameters and their bound values.
#[derive(Clone, Debug, Default)]
pub struct Parameters {
    specs: BTreeMap<String, ParameterSpec>,
    values: BTreeMap<String, ParameterValue>,
}

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a parameter. Later declarations replace earlier ones of the
    /// same name (procedures override shared capability defaults this way).
    pub fn declare(&mut self, spec: ParameterSpec) {
        self.specs.insert(spec.name.clone(), spec);
    }

    /// Bind a value from the test plan. Unknown names are rejected so typos
    /// surface before the run instead of silently using a default.
    pub fn bind(&mut self, name: &str, value: impl Into<ParameterValue>) -> AppResult<()> {
        if !self.specs.contains_key(name) {
            return Err(MeasureError::InvalidParameter(format!(
                "unknown parameter '{name}'"
            )));
        }
        self.values.insert(name.to_string(), value.into());
        Ok(())
    }

    /// Check required parameters and enumerated values. Runs before
    /// `Initializing`; nothing reaches hardware when this fails.
    pub fn validate(&self) -> AppResult<()> {
        for (name, spec) in &self.specs {
            let value = self.values.get(name).or(spec.default.as_ref());
            let Some(value) = value else {
                if spec.required {
                    return Err(MeasureError::MissingParameter(name.clone()));
                }
                continue;
            };
            if let Some(choices) = &spec.choices {
                let text = value.to_string();
                if !choices.iter().any(|c| c == &text) {
                    return Err(MeasureError::InvalidParameter(format!(
                        "'{name}' must be one of [{}], got '{text}'",
                        choices.join(", ")
                    )));
                }
            }
        }
        Ok(())
    }

    /// Declared unit of a parameter, if any.
    pub fn unit(&self, name: &str) -> Option<&str> {
        self.specs.get(name).and_then(|s| s.unit.as_deref())
    }

    fn lookup(&self, name: &str) -> AppResult<&ParameterValue> {
        self.values
            .get(name)
            .or_else(|| self.specs.get(name).and_then(|s| s.default.as_ref()))
            .ok_or_else(|| MeasureError::MissingParameter(name.to_string()))
    }

    pub fn get_f64(&self, name: &str) -> AppResult<f64> {
        self.lookup(name)?.as_f64().ok_or_else(|| {
            MeasureError::InvalidParameter(format!("'{name}' is not a number"))
        })
    }

    pub fn get_i64(&self, name: &str) -> AppResult<i64> {
        self.lookup(name)?.as_i64().ok_or_else(|| {
            MeasureError::InvalidParameter(format!("'{name}' is not an integer"))
        })
    }

    pub fn get_bool(&self, name: &str) -> AppResult<bool> {
        self.lookup(name)?.as_bool().ok_or_else(|| {
            MeasureError::InvalidParameter(format!("'{name}' is not a boolean"))
        })
    }

    pub fn get_str(&self, name: &str) -> AppResult<&str> {
        self.lookup(name)?.as_str().ok_or_else(|| {
            MeasureError::InvalidParameter(format!("'{name}' is not a string"))
        })
    }

    pub fn get_list(&self, name: &str) -> AppResult<&[String]> {
        self.lookup(name)?.as_list().ok_or_else(|| {
            MeasureError::InvalidParameter(format!("'{name}' is not a list"))
        })
    }

    /// Duration view of a float-of-seconds parameter.
    pub fn get_duration_secs(&self, name: &str) -> AppResult<std::time::Duration> {
        let secs = self.get_f64(name)?;
        if secs < 0.0 || !secs.is_finite() {
            return Err(MeasureError::InvalidParameter(format!(
                "'{name}' must be a non-negative duration, got {secs}"
            )));
        }
        Ok(std::time::Duration::from_secs_f64(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn declared() -> Parameters {
        let mut params = Parameters::new();
        params.declare(ParameterSpec::new("voltage_start").unit("V").required());
        params.declare(
            ParameterSpec::new("sense_mode")
                .choices(&["local", "remote"])
                .default("local"),
        );
        params.declare(ParameterSpec::new("filter_count").default(10i64));
        params
    }

    #[test]
    fn test_missing_required_parameter() {
        let params = declared();
        match params.validate() {
            Err(MeasureError::MissingParameter(name)) => assert_eq!(name, "voltage_start"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_name_rejected_on_bind() {
        let mut params = declared();
        assert!(matches!(
            params.bind("voltage_stat", 1.0),
            Err(MeasureError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_enum_value_checked() {
        let mut params = declared();
        params.bind("voltage_start", -100.0).unwrap();
        params.bind("sense_mode", "differential").unwrap();
        assert!(matches!(
            params.validate(),
            Err(MeasureError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_defaults_apply() {
        let mut params = declared();
        params.bind("voltage_start", -100.0).unwrap();
        params.validate().unwrap();
        assert_eq!(params.get_str("sense_mode").unwrap(), "local");
        assert_eq!(params.get_i64("filter_count").unwrap(), 10);
        assert_eq!(params.get_f64("voltage_start").unwrap(), -100.0);
        assert_eq!(params.unit("voltage_start"), Some("V"));
    }

    #[test]
    fn test_duration_parameter() {
        let mut params = Parameters::new();
        params.declare(ParameterSpec::new("waiting_time").unit("s").default(0.5));
        assert_eq!(
            params.get_duration_secs("waiting_time").unwrap(),
            std::time::Duration::from_millis(500)
        );
    }
}
