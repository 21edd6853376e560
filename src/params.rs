//! Parameter registry.
//!
//! Options arrive as a loosely typed map ([`Options`]) whose values may be
//! integers, floats or strings. [`process`] turns such a map into the
//! engine-native form: enum names become their integer codes and numbers are
//! coerced to the declared type. [`IndexParams`] is the typed view used by
//! the rest of the crate.

use std::collections::BTreeMap;

use annkit_engine::{Algorithm, BuildParams, CentersInit, LogLevel};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A single option value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Str(String),
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<i32> for ParamValue {
    fn from(v: i32) -> Self {
        ParamValue::Int(v as i64)
    }
}

impl From<usize> for ParamValue {
    fn from(v: usize) -> Self {
        ParamValue::Int(v as i64)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<f32> for ParamValue {
    fn from(v: f32) -> Self {
        ParamValue::Float(v as f64)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Str(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Str(v)
    }
}

impl std::fmt::Display for ParamValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParamValue::Int(v) => write!(f, "{}", v),
            ParamValue::Float(v) => write!(f, "{}", v),
            ParamValue::Str(v) => write!(f, "'{}'", v),
        }
    }
}

/// Option name to value.
pub type Options = BTreeMap<String, ParamValue>;

/// Builds an [`Options`] map from `(name, value)` pairs.
pub fn options<'a, I, V>(pairs: I) -> Options
where
    I: IntoIterator<Item = (&'a str, V)>,
    V: Into<ParamValue>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.into()))
        .collect()
}

type Table = &'static [(&'static str, i64)];

const ALGORITHMS: Table = &[
    ("linear", 0),
    ("kdtree", 1),
    ("kmeans", 2),
    ("composite", 3),
    ("autotuned", 255),
    ("default", 1),
];

const CENTERS_INIT: Table = &[("random", 0), ("gonzales", 1), ("kmeanspp", 2), ("default", 0)];

const LOG_LEVELS: Table = &[
    ("none", 0),
    ("fatal", 1),
    ("error", 2),
    ("warning", 3),
    ("info", 4),
    ("debug", 5),
    ("default", 3),
];

#[derive(Debug, Clone, Copy)]
enum Kind {
    Int,
    Float,
    Enum(Table),
}

#[derive(Debug, Clone, Copy)]
enum DefaultValue {
    Int(i64),
    Float(f64),
    Name(&'static str),
}

struct OptionSpec {
    name: &'static str,
    kind: Kind,
    default: DefaultValue,
}

/// Recognized options, in the order [`defaults`] reports them.
const OPTIONS: &[OptionSpec] = &[
    OptionSpec {
        name: "log_level",
        kind: Kind::Enum(LOG_LEVELS),
        default: DefaultValue::Name("warning"),
    },
    OptionSpec {
        name: "random_seed",
        kind: Kind::Int,
        default: DefaultValue::Int(-1),
    },
    OptionSpec {
        name: "algorithm",
        kind: Kind::Enum(ALGORITHMS),
        default: DefaultValue::Name("kdtree"),
    },
    OptionSpec {
        name: "checks",
        kind: Kind::Int,
        default: DefaultValue::Int(32),
    },
    OptionSpec {
        name: "cb_index",
        kind: Kind::Float,
        default: DefaultValue::Float(0.5),
    },
    OptionSpec {
        name: "trees",
        kind: Kind::Int,
        default: DefaultValue::Int(1),
    },
    OptionSpec {
        name: "branching",
        kind: Kind::Int,
        default: DefaultValue::Int(32),
    },
    OptionSpec {
        name: "iterations",
        kind: Kind::Int,
        default: DefaultValue::Int(5),
    },
    OptionSpec {
        name: "centers_init",
        kind: Kind::Enum(CENTERS_INIT),
        default: DefaultValue::Name("random"),
    },
    OptionSpec {
        name: "target_precision",
        kind: Kind::Float,
        default: DefaultValue::Float(-1.0),
    },
    OptionSpec {
        name: "build_weight",
        kind: Kind::Float,
        default: DefaultValue::Float(0.01),
    },
    OptionSpec {
        name: "memory_weight",
        kind: Kind::Float,
        default: DefaultValue::Float(0.0),
    },
    OptionSpec {
        name: "sample_fraction",
        kind: Kind::Float,
        default: DefaultValue::Float(0.1),
    },
];

fn spec(name: &str) -> Result<&'static OptionSpec> {
    OPTIONS
        .iter()
        .find(|s| s.name == name)
        .ok_or_else(|| Error::Configuration(format!("unknown option '{}'", name)))
}

fn valid_names(table: Table) -> String {
    let mut names: Vec<&str> = table.iter().map(|(n, _)| *n).collect();
    names.sort_unstable();
    names.join(", ")
}

fn resolve(option: &str, table: Table, value: &str) -> Result<i64> {
    let wanted = value.to_ascii_lowercase();
    table
        .iter()
        .find(|(n, _)| *n == wanted)
        .map(|(_, code)| *code)
        .ok_or_else(|| {
            Error::Configuration(format!(
                "invalid value '{}' for option '{}'; valid values: {}",
                value,
                option,
                valid_names(table)
            ))
        })
}

/// Canonical name of a code, skipping the `default` alias.
fn canonical(table: Table, code: i64) -> Option<&'static str> {
    table
        .iter()
        .find(|(n, c)| *c == code && *n != "default")
        .map(|(n, _)| *n)
}

fn coerce_int(option: &str, value: &ParamValue) -> Result<i64> {
    let err = || {
        Error::Configuration(format!(
            "option '{}' expects an integer, got {}",
            option, value
        ))
    };
    match value {
        ParamValue::Int(v) => Ok(*v),
        ParamValue::Float(v) if v.is_finite() => Ok(v.trunc() as i64),
        ParamValue::Float(_) => Err(err()),
        ParamValue::Str(s) => {
            let s = s.trim();
            if let Ok(v) = s.parse::<i64>() {
                return Ok(v);
            }
            match s.parse::<f64>() {
                Ok(f) if f.is_finite() => Ok(f.trunc() as i64),
                _ => Err(err()),
            }
        }
    }
}

fn coerce_float(option: &str, value: &ParamValue) -> Result<f64> {
    match value {
        ParamValue::Int(v) => Ok(*v as f64),
        ParamValue::Float(v) => Ok(*v),
        ParamValue::Str(s) => s.trim().parse::<f64>().map_err(|_| {
            Error::Configuration(format!("option '{}' expects a number, got {}", option, value))
        }),
    }
}

fn default_value(spec: &OptionSpec) -> ParamValue {
    match spec.default {
        DefaultValue::Int(v) => ParamValue::Int(v),
        DefaultValue::Float(v) => ParamValue::Float(v),
        DefaultValue::Name(n) => ParamValue::Str(n.to_string()),
    }
}

/// Every recognized option with its default, in declaration order.
pub fn defaults() -> Vec<(&'static str, ParamValue)> {
    OPTIONS.iter().map(|s| (s.name, default_value(s))).collect()
}

fn process_one(spec: &OptionSpec, value: &ParamValue) -> Result<ParamValue> {
    match spec.kind {
        Kind::Int => coerce_int(spec.name, value).map(ParamValue::Int),
        Kind::Float => coerce_float(spec.name, value).map(ParamValue::Float),
        Kind::Enum(table) => match value {
            ParamValue::Str(s) => resolve(spec.name, table, s).map(ParamValue::Int),
            ParamValue::Int(code) => Ok(ParamValue::Int(*code)),
            ParamValue::Float(f) if f.fract() == 0.0 && f.is_finite() => {
                Ok(ParamValue::Int(*f as i64))
            }
            ParamValue::Float(_) => Err(Error::Configuration(format!(
                "invalid value {} for option '{}'; valid values: {}",
                value,
                spec.name,
                valid_names(table)
            ))),
        },
    }
}

/// Normalizes `options` into engine-native form.
///
/// Enum names resolve case-insensitively to their codes, numeric values are
/// coerced to the declared type, and integer codes for enum options pass
/// through unchanged.
///
/// # Errors
///
/// [`Error::Configuration`] naming the offending key for unknown options,
/// or listing the valid names for unresolvable enum values.
pub fn process(options: &Options) -> Result<Options> {
    options
        .iter()
        .map(|(name, value)| {
            let spec = spec(name)?;
            Ok((name.clone(), process_one(spec, value)?))
        })
        .collect()
}

/// Maps enum codes in a processed map back to their canonical names.
pub fn translate_back(processed: &Options) -> Options {
    processed
        .iter()
        .map(|(name, value)| {
            let translated = match (spec(name).map(|s| s.kind), value) {
                (Ok(Kind::Enum(table)), ParamValue::Int(code)) => canonical(table, *code)
                    .map(|n| ParamValue::Str(n.to_string()))
                    .unwrap_or_else(|| value.clone()),
                _ => value.clone(),
            };
            (name.clone(), translated)
        })
        .collect()
}

/// Parses a JSON object into [`Options`].
pub fn options_from_json(value: &serde_json::Value) -> Result<Options> {
    let object = value
        .as_object()
        .ok_or_else(|| Error::Configuration("options must be a JSON object".into()))?;
    object
        .iter()
        .map(|(name, v)| {
            let value = match v {
                serde_json::Value::Number(n) => match n.as_i64() {
                    Some(i) => ParamValue::Int(i),
                    None => ParamValue::Float(n.as_f64().unwrap_or(f64::NAN)),
                },
                serde_json::Value::String(s) => ParamValue::Str(s.clone()),
                other => {
                    return Err(Error::Configuration(format!(
                        "option '{}' has unsupported value {}",
                        name, other
                    )))
                }
            };
            Ok((name.clone(), value))
        })
        .collect()
}

/// Typed index and search parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexParams {
    /// Engine progress verbosity (default: warning)
    pub log_level: LogLevel,
    /// Seed for randomized steps, -1 draws from the shared generator
    pub random_seed: i64,
    /// Index structure (default: kd-forest)
    pub algorithm: Algorithm,
    /// Search effort, -1 for exact search (default: 32)
    pub checks: i32,
    /// Cluster-boundary index for k-means trees (default: 0.5)
    pub cb_index: f32,
    /// Randomized kd-trees (default: 1)
    pub trees: usize,
    /// Children per k-means node (default: 32)
    pub branching: usize,
    /// k-means iterations, negative = until convergence (default: 5)
    pub iterations: i32,
    /// k-means seeding (default: random)
    pub centers_init: CentersInit,
    /// Recall target that triggers autotuning when positive (default: -1)
    pub target_precision: f32,
    /// Build time weight while autotuning (default: 0.01)
    pub build_weight: f32,
    /// Memory weight while autotuning (default: 0)
    pub memory_weight: f32,
    /// Dataset fraction sampled while autotuning (default: 0.1)
    pub sample_fraction: f32,
}

impl Default for IndexParams {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Warning,
            random_seed: -1,
            algorithm: Algorithm::KdTree,
            checks: 32,
            cb_index: 0.5,
            trees: 1,
            branching: 32,
            iterations: 5,
            centers_init: CentersInit::Random,
            target_precision: -1.0,
            build_weight: 0.01,
            memory_weight: 0.0,
            sample_fraction: 0.1,
        }
    }
}

fn non_negative(option: &str, v: i64) -> Result<usize> {
    usize::try_from(v).map_err(|_| {
        Error::Configuration(format!("option '{}' must be non-negative, got {}", option, v))
    })
}

fn to_i32(option: &str, v: i64) -> Result<i32> {
    i32::try_from(v)
        .map_err(|_| Error::Configuration(format!("option '{}' is out of range: {}", option, v)))
}

fn unknown_code(option: &str, table: Table, code: i64) -> Error {
    Error::Configuration(format!(
        "invalid code {} for option '{}'; valid values: {}",
        code,
        option,
        valid_names(table)
    ))
}

impl IndexParams {
    /// Defaults overridden by `options`.
    pub fn from_options(options: &Options) -> Result<Self> {
        Self::default().merged(options)
    }

    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        Self::from_options(&options_from_json(value)?)
    }

    /// A copy of `self` with `overrides` applied. `self` is left untouched
    /// when any override is invalid.
    pub fn merged(&self, overrides: &Options) -> Result<Self> {
        let processed = process(overrides)?;
        let mut params = self.clone();
        for (name, value) in &processed {
            params.apply(name, value)?;
        }
        Ok(params)
    }

    fn apply(&mut self, name: &str, value: &ParamValue) -> Result<()> {
        let int = || coerce_int(name, value);
        let float = || coerce_float(name, value).map(|f| f as f32);
        match name {
            "log_level" => {
                let code = int()?;
                self.log_level =
                    LogLevel::from_code(code).ok_or_else(|| unknown_code(name, LOG_LEVELS, code))?;
            }
            "random_seed" => self.random_seed = int()?,
            "algorithm" => {
                let code = int()?;
                self.algorithm =
                    Algorithm::from_code(code).ok_or_else(|| unknown_code(name, ALGORITHMS, code))?;
            }
            "checks" => self.checks = to_i32(name, int()?)?,
            "cb_index" => self.cb_index = float()?,
            "trees" => self.trees = non_negative(name, int()?)?,
            "branching" => self.branching = non_negative(name, int()?)?,
            "iterations" => self.iterations = to_i32(name, int()?)?,
            "centers_init" => {
                let code = int()?;
                self.centers_init = CentersInit::from_code(code)
                    .ok_or_else(|| unknown_code(name, CENTERS_INIT, code))?;
            }
            "target_precision" => self.target_precision = float()?,
            "build_weight" => self.build_weight = float()?,
            "memory_weight" => self.memory_weight = float()?,
            "sample_fraction" => self.sample_fraction = float()?,
            other => return Err(Error::Configuration(format!("unknown option '{}'", other))),
        }
        Ok(())
    }

    /// Engine-native option map.
    pub fn to_options(&self) -> Options {
        options([
            ("log_level", ParamValue::Int(self.log_level.code())),
            ("random_seed", ParamValue::Int(self.random_seed)),
            ("algorithm", ParamValue::Int(self.algorithm.code())),
            ("checks", ParamValue::Int(self.checks as i64)),
            ("cb_index", ParamValue::Float(self.cb_index as f64)),
            ("trees", ParamValue::from(self.trees)),
            ("branching", ParamValue::from(self.branching)),
            ("iterations", ParamValue::Int(self.iterations as i64)),
            ("centers_init", ParamValue::Int(self.centers_init.code())),
            ("target_precision", ParamValue::Float(self.target_precision as f64)),
            ("build_weight", ParamValue::Float(self.build_weight as f64)),
            ("memory_weight", ParamValue::Float(self.memory_weight as f64)),
            ("sample_fraction", ParamValue::Float(self.sample_fraction as f64)),
        ])
    }

    /// Explicit seed, if one was configured.
    pub fn explicit_seed(&self) -> Option<u64> {
        u64::try_from(self.random_seed).ok()
    }

    /// Engine parameters with `seed` as the resolved random seed.
    pub fn to_build_params(&self, seed: u64) -> BuildParams {
        BuildParams {
            algorithm: self.algorithm,
            checks: self.checks,
            cb_index: self.cb_index,
            trees: self.trees,
            branching: self.branching,
            iterations: self.iterations,
            centers_init: self.centers_init,
            target_precision: self.target_precision,
            build_weight: self.build_weight,
            memory_weight: self.memory_weight,
            sample_fraction: self.sample_fraction,
            log_level: self.log_level,
            random_seed: seed,
        }
    }

    /// Typed parameters mirroring what an engine actually used.
    pub fn from_build_params(build: &BuildParams) -> Self {
        Self {
            log_level: build.log_level,
            random_seed: i64::try_from(build.random_seed).unwrap_or(-1),
            algorithm: build.algorithm,
            checks: build.checks,
            cb_index: build.cb_index,
            trees: build.trees,
            branching: build.branching,
            iterations: build.iterations,
            centers_init: build.centers_init,
            target_precision: build.target_precision,
            build_weight: build.build_weight,
            memory_weight: build.memory_weight,
            sample_fraction: build.sample_fraction,
        }
    }
}
