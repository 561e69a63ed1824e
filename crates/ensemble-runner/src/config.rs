//! Typed view of the ensemble specification file.
//!
//! The YAML is read into a generic [`serde_yaml::Value`] first so that the
//! mapping order of files, groups and parameter names is kept, then walked
//! and validated eagerly into [`EnsembleSpec`].

use crate::error::ConfigError;
use serde::Serialize;
use serde_yaml::Value;
use std::fmt;
use std::fs;
use std::path::Path;

/// File, group and name of the compound turning-angle axis.
pub const TURNING_ANGLE_AXIS: (&str, &str, &str) =
    ("ice/cice_in.nml", "dynamics_nml", "turning_angle");

/// A single parameter value from the specification.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Scalar {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
}

impl Scalar {
    fn from_yaml(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(Scalar::Bool(*b)),
            Value::Number(n) => n
                .as_i64()
                .map(Scalar::Int)
                .or_else(|| n.as_f64().map(Scalar::Float)),
            Value::String(s) => Some(Scalar::Str(s.clone())),
            _ => None,
        }
    }

    /// Numeric view used for trigonometric conversion and numeric comparison.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Int(i) => Some(*i as f64),
            Scalar::Float(f) => Some(*f),
            _ => None,
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Int(i) => write!(f, "{}", i),
            Scalar::Float(x) => f.write_str(&format_real(*x)),
            Scalar::Bool(true) => f.write_str("True"),
            Scalar::Bool(false) => f.write_str("False"),
            Scalar::Str(s) => f.write_str(s),
        }
    }
}

/// Shortest round-trip rendering of a float that always reads back as a real:
/// `30.0`, `0.5`, `1e-05`, `1e+16`.
///
/// Directory names produced by earlier runs of the tool use this form, so it
/// must stay stable for the existence check to find them.
pub fn format_real(x: f64) -> String {
    if x.is_nan() {
        return "nan".to_string();
    }
    if x.is_infinite() {
        return if x > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    let exp = if x == 0.0 {
        0
    } else {
        x.abs().log10().floor() as i32
    };
    if (-4..16).contains(&exp) {
        let s = format!("{}", x);
        if s.contains('.') {
            s
        } else {
            format!("{}.0", s)
        }
    } else {
        let s = format!("{:e}", x);
        match s.split_once('e') {
            Some((mantissa, e)) => {
                let (sign, digits) = match e.strip_prefix('-') {
                    Some(d) => ('-', d),
                    None => ('+', e),
                };
                format!("{}e{}{:0>2}", mantissa, sign, digits)
            }
            None => s,
        }
    }
}

/// Where variants take their initial state from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(into = "String")]
pub enum StartFrom {
    /// No restart linkage.
    Rest,
    /// Zero-padded archive cycle index, e.g. `003`.
    Cycle(String),
}

impl StartFrom {
    /// Lower-case, trim and zero-pad to three characters; `rest` is the sentinel.
    pub fn normalize(raw: &str) -> Self {
        let token = raw.trim().to_lowercase();
        if token == "rest" {
            return StartFrom::Rest;
        }
        StartFrom::Cycle(format!("{:0>3}", token))
    }

    pub fn as_str(&self) -> &str {
        match self {
            StartFrom::Rest => "rest",
            StartFrom::Cycle(c) => c,
        }
    }

    pub fn is_rest(&self) -> bool {
        matches!(self, StartFrom::Rest)
    }
}

impl From<StartFrom> for String {
    fn from(value: StartFrom) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for StartFrom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One swept parameter: a namelist entry and the values to try.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParameterAxis {
    pub file: String,
    pub group: String,
    pub name: String,
    pub values: Vec<Scalar>,
}

impl ParameterAxis {
    /// True for the axis that maps one angle in degrees onto `cosw`/`sinw`.
    pub fn is_turning_angle(&self) -> bool {
        let (file, group, name) = TURNING_ANGLE_AXIS;
        self.file == file && self.group == group && self.name == name
    }

    /// `file -> group -> name`, as used in log lines and metadata.
    pub fn field_path(&self) -> String {
        [self.file.as_str(), self.group.as_str(), self.name.as_str()].join(" -> ")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EnsembleSpec {
    pub template: String,
    pub start_from: StartFrom,
    pub n_runs: u64,
    pub axes: Vec<ParameterAxis>,
}

impl EnsembleSpec {
    /// Every (axis, value) pair in specification order.
    pub fn planned(&self) -> impl Iterator<Item = (&ParameterAxis, &Scalar)> {
        self.axes
            .iter()
            .flat_map(|axis| axis.values.iter().map(move |v| (axis, v)))
    }
}

pub fn load_spec(path: &Path) -> Result<EnsembleSpec, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_spec(&raw)
}

pub fn parse_spec(raw: &str) -> Result<EnsembleSpec, ConfigError> {
    let root: Value = serde_yaml::from_str(raw)?;
    let root = root.as_mapping().ok_or_else(|| ConfigError::InvalidValue {
        key: "<root>".to_string(),
        reason: "expected a mapping".to_string(),
    })?;

    let template = match root.get("template") {
        Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        Some(_) => {
            return Err(invalid("template", "expected a non-empty path string"));
        }
        None => return Err(ConfigError::MissingKey("template")),
    };

    let start_from = match root.get("startfrom") {
        Some(Value::String(s)) => StartFrom::normalize(s),
        Some(Value::Number(n)) if n.is_u64() => StartFrom::normalize(&n.to_string()),
        Some(_) => {
            return Err(invalid(
                "startfrom",
                "expected 'rest' or a non-negative cycle index",
            ));
        }
        None => return Err(ConfigError::MissingKey("startfrom")),
    };

    let n_runs = match root.get("nruns") {
        None | Some(Value::Null) => 0,
        Some(Value::Number(n)) => n
            .as_u64()
            .ok_or_else(|| invalid("nruns", "expected a non-negative integer"))?,
        Some(_) => return Err(invalid("nruns", "expected a non-negative integer")),
    };

    let namelists = match root.get("namelists") {
        Some(Value::Mapping(m)) => m,
        Some(_) => return Err(invalid("namelists", "expected a mapping of files")),
        None => return Err(ConfigError::MissingKey("namelists")),
    };

    let mut axes = Vec::new();
    for (file, groups) in namelists {
        let file = key_string(file, "namelists")?;
        let groups = groups
            .as_mapping()
            .ok_or_else(|| invalid(&file, "expected a mapping of namelist groups"))?;
        for (group, names) in groups {
            let group = key_string(group, &file)?;
            let at = format!("{} -> {}", file, group);
            let names = names
                .as_mapping()
                .ok_or_else(|| invalid(&at, "expected a mapping of parameter names"))?;
            for (name, values) in names {
                let name = key_string(name, &at)?;
                let at = format!("{} -> {}", at, name);
                let values = values
                    .as_sequence()
                    .ok_or_else(|| invalid(&at, "expected a sequence of values"))?
                    .iter()
                    .map(|v| {
                        Scalar::from_yaml(v)
                            .ok_or_else(|| invalid(&at, "values must be scalars"))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                let axis = ParameterAxis {
                    file: file.clone(),
                    group: group.clone(),
                    name,
                    values,
                };
                if axis.is_turning_angle() {
                    if let Some(bad) = axis.values.iter().find(|v| v.as_f64().is_none()) {
                        return Err(invalid(
                            &at,
                            &format!("turning angle '{}' is not numeric", bad),
                        ));
                    }
                }
                axes.push(axis);
            }
        }
    }

    Ok(EnsembleSpec {
        template,
        start_from,
        n_runs,
        axes,
    })
}

fn key_string(key: &Value, at: &str) -> Result<String, ConfigError> {
    match key {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(invalid(at, "mapping keys must be strings")),
    }
}

fn invalid(key: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}
