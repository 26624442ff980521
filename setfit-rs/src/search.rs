//! Hyperparameter search.
//!
//! A [`SearchBackend`] proposes [`Trial`]s and keeps the best objective; the
//! trainer supplies a [`TrialRunner`] that turns one trial into a full
//! train-and-evaluate cycle. Backends are looked up by name in a
//! [`SearchBackendRegistry`], so adding one needs no change to the loop.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use rand::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SetFitError};
use crate::metrics::Metrics;
use crate::model::SeededRng;

/// A hyperparameter value before it is coerced to a field type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    /// Boolean.
    Bool(bool),
    /// Integer.
    Int(i64),
    /// Float.
    Float(f64),
    /// String.
    Str(String),
}

/// Hyperparameter name to value.
pub type HyperParams = BTreeMap<String, ParamValue>;

impl ParamValue {
    fn coercion_error(&self, name: &str, ty: &str) -> SetFitError {
        SetFitError::Config(format!(
            "cannot use {self} as {ty} for hyperparameter '{name}'"
        ))
    }

    /// Coerce to a float.
    ///
    /// # Errors
    ///
    /// Returns [`SetFitError::Config`] for unparsable strings.
    pub fn to_f64(&self, name: &str) -> Result<f64> {
        match self {
            ParamValue::Float(f) => Ok(*f),
            #[allow(clippy::cast_precision_loss)]
            ParamValue::Int(i) => Ok(*i as f64),
            ParamValue::Bool(b) => Ok(f64::from(u8::from(*b))),
            ParamValue::Str(s) => s
                .trim()
                .parse()
                .map_err(|_| self.coercion_error(name, "a float")),
        }
    }

    /// Coerce to an integer; floats are truncated toward zero.
    ///
    /// # Errors
    ///
    /// Returns [`SetFitError::Config`] for non-finite floats and unparsable
    /// strings.
    pub fn to_i64(&self, name: &str) -> Result<i64> {
        match self {
            ParamValue::Int(i) => Ok(*i),
            #[allow(clippy::cast_possible_truncation)]
            ParamValue::Float(f) if f.is_finite() => Ok(f.trunc() as i64),
            ParamValue::Float(_) => Err(self.coercion_error(name, "an integer")),
            ParamValue::Bool(b) => Ok(i64::from(*b)),
            ParamValue::Str(s) => s
                .trim()
                .parse()
                .map_err(|_| self.coercion_error(name, "an integer")),
        }
    }

    /// Coerce to a non-negative size.
    ///
    /// # Errors
    ///
    /// Returns [`SetFitError::Config`] for negative values.
    pub fn to_usize(&self, name: &str) -> Result<usize> {
        usize::try_from(self.to_i64(name)?).map_err(|_| self.coercion_error(name, "a size"))
    }

    /// Coerce to an unsigned 64-bit integer.
    ///
    /// # Errors
    ///
    /// Returns [`SetFitError::Config`] for negative values.
    pub fn to_u64(&self, name: &str) -> Result<u64> {
        u64::try_from(self.to_i64(name)?).map_err(|_| self.coercion_error(name, "an unsigned integer"))
    }

    /// Coerce to a boolean.
    ///
    /// # Errors
    ///
    /// Returns [`SetFitError::Config`] for strings other than
    /// `true`/`false`/`1`/`0`/`yes`/`no`.
    pub fn to_bool(&self, name: &str) -> Result<bool> {
        match self {
            ParamValue::Bool(b) => Ok(*b),
            ParamValue::Int(i) => Ok(*i != 0),
            ParamValue::Float(f) => Ok(*f != 0.0),
            ParamValue::Str(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Ok(true),
                "false" | "0" | "no" => Ok(false),
                _ => Err(self.coercion_error(name, "a boolean")),
            },
        }
    }

    /// Textual form; strings are returned as-is.
    ///
    /// # Errors
    ///
    /// Never fails; returns `Result` for symmetry with the other coercions.
    pub fn to_text(&self, _name: &str) -> Result<String> {
        Ok(match self {
            ParamValue::Str(s) => s.clone(),
            other => other.to_string(),
        })
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(b) => write!(f, "{b}"),
            ParamValue::Int(i) => write!(f, "{i}"),
            ParamValue::Float(x) => write!(f, "{x}"),
            ParamValue::Str(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<bool> for ParamValue {
    fn from(b: bool) -> Self {
        ParamValue::Bool(b)
    }
}

impl From<i64> for ParamValue {
    fn from(i: i64) -> Self {
        ParamValue::Int(i)
    }
}

impl From<f64> for ParamValue {
    fn from(x: f64) -> Self {
        ParamValue::Float(x)
    }
}

impl From<&str> for ParamValue {
    fn from(s: &str) -> Self {
        ParamValue::Str(s.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(s: String) -> Self {
        ParamValue::Str(s)
    }
}

/// One point of the search, with its own seeded generator for suggestions.
#[derive(Debug, Clone)]
pub struct Trial {
    number: usize,
    params: HyperParams,
    rng: SeededRng,
}

impl Trial {
    /// Create trial `number` whose suggestions are drawn from `seed`.
    #[must_use]
    pub fn new(number: usize, seed: u64) -> Self {
        Self {
            number,
            params: HyperParams::new(),
            rng: SeededRng::seed_from_u64(seed),
        }
    }

    /// Trial number, 0-based.
    #[must_use]
    pub fn number(&self) -> usize {
        self.number
    }

    /// Values suggested so far.
    #[must_use]
    pub fn params(&self) -> &HyperParams {
        &self.params
    }

    /// Draw a float in `[low, high]`, log-uniformly when `log` is set.
    ///
    /// # Errors
    ///
    /// Returns [`SetFitError::Config`] when the bounds are not finite, when
    /// `low > high`, or when `log` is set and `low` is not positive.
    pub fn suggest_float(&mut self, name: &str, low: f64, high: f64, log: bool) -> Result<f64> {
        if !(low.is_finite() && high.is_finite()) || low > high {
            return Err(SetFitError::Config(format!(
                "{name}: invalid float range [{low}, {high}]"
            )));
        }
        if log && low <= 0.0 {
            return Err(SetFitError::Config(format!(
                "{name}: log-uniform range needs low > 0, got {low}"
            )));
        }
        let value = if log {
            self.rng
                .random_range(low.ln()..=high.ln())
                .exp()
                .clamp(low, high)
        } else {
            self.rng.random_range(low..=high)
        };
        self.params.insert(name.to_string(), ParamValue::Float(value));
        Ok(value)
    }

    /// Draw an integer in `[low, high]`.
    ///
    /// # Errors
    ///
    /// Returns [`SetFitError::Config`] when `low > high`.
    pub fn suggest_int(&mut self, name: &str, low: i64, high: i64) -> Result<i64> {
        if low > high {
            return Err(SetFitError::Config(format!(
                "{name}: invalid int range [{low}, {high}]"
            )));
        }
        let value = self.rng.random_range(low..=high);
        self.params.insert(name.to_string(), ParamValue::Int(value));
        Ok(value)
    }

    /// Pick one of `choices` uniformly.
    ///
    /// # Errors
    ///
    /// Returns [`SetFitError::Config`] when `choices` is empty.
    pub fn suggest_categorical<T>(&mut self, name: &str, choices: &[T]) -> Result<T>
    where
        T: Clone + Into<ParamValue>,
    {
        let value = choices
            .choose(&mut self.rng)
            .cloned()
            .ok_or_else(|| SetFitError::Config(format!("{name}: no choices to pick from")))?;
        self.params.insert(name.to_string(), value.clone().into());
        Ok(value)
    }
}

/// Produces the parameters of one trial.
pub type HpSpace = Box<dyn Fn(&mut Trial) -> Result<HyperParams>>;

/// Reduces evaluation metrics to the objective being optimized.
pub type ComputeObjective = Box<dyn Fn(&Metrics) -> f64>;

/// Names a trial run.
pub type HpName = Box<dyn Fn(&Trial) -> String>;

/// Backend-specific options such as `seed` and `timeout` (seconds).
pub type BackendOptions = BTreeMap<String, ParamValue>;

/// Default search space.
///
/// | name | range |
/// |---|---|
/// | `learning_rate` | log-uniform `[1e-6, 1e-4]` |
/// | `num_epochs` | int `[1, 5]` |
/// | `num_iterations` | one of 5, 10, 20 |
/// | `seed` | int `[1, 40]` |
/// | `batch_size` | one of 4, 8, 16, 32, 64 |
///
/// # Errors
///
/// Never fails for these fixed ranges; the `Result` matches [`HpSpace`].
pub fn default_hp_space(trial: &mut Trial) -> Result<HyperParams> {
    let learning_rate = trial.suggest_float("learning_rate", 1e-6, 1e-4, true)?;
    let num_epochs = trial.suggest_int("num_epochs", 1, 5)?;
    let num_iterations = trial.suggest_categorical("num_iterations", &[5i64, 10, 20])?;
    let seed = trial.suggest_int("seed", 1, 40)?;
    let batch_size = trial.suggest_categorical("batch_size", &[4i64, 8, 16, 32, 64])?;

    Ok(HyperParams::from([
        ("learning_rate".to_string(), ParamValue::Float(learning_rate)),
        ("num_epochs".to_string(), ParamValue::Int(num_epochs)),
        ("num_iterations".to_string(), ParamValue::Int(num_iterations)),
        ("seed".to_string(), ParamValue::Int(seed)),
        ("batch_size".to_string(), ParamValue::Int(batch_size)),
    ]))
}

/// Sum of all metrics except `eval_loss`, `epoch` and speed metrics; the
/// eval loss itself when nothing else is left.
#[must_use]
pub fn default_compute_objective(metrics: &Metrics) -> f64 {
    let is_speed = |name: &str| {
        name.ends_with("_runtime")
            || name.ends_with("_per_second")
            || name.ends_with("_compilation_time")
    };
    let rest: Vec<f64> = metrics
        .iter()
        .filter(|(name, _)| *name != "eval_loss" && *name != "epoch" && !is_speed(name))
        .map(|(_, value)| *value)
        .collect();

    if rest.is_empty() {
        metrics.get("eval_loss").copied().unwrap_or(0.0)
    } else {
        rest.iter().sum()
    }
}

/// Whether the objective is minimized or maximized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Lower is better.
    Minimize,
    /// Higher is better.
    #[default]
    Maximize,
}

impl Direction {
    /// Whether `candidate` beats `incumbent`.
    #[must_use]
    pub fn is_better(self, candidate: f64, incumbent: f64) -> bool {
        match self {
            Direction::Minimize => candidate < incumbent,
            Direction::Maximize => candidate > incumbent,
        }
    }
}

impl FromStr for Direction {
    type Err = SetFitError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "minimize" => Ok(Direction::Minimize),
            "maximize" => Ok(Direction::Maximize),
            _ => Err(SetFitError::Config(format!(
                "direction must be minimize or maximize, got '{s}'"
            ))),
        }
    }
}

/// Best trial of a search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestRun {
    /// Run identifier: the trial's `hp_name`, or its number.
    pub run_id: String,
    /// Objective value.
    pub objective: f64,
    /// Parameters suggested for that trial.
    pub hyperparameters: HyperParams,
}

/// Runs one trial end to end.
pub trait TrialRunner {
    /// Train and evaluate with the parameters of `trial`; return the objective.
    ///
    /// # Errors
    ///
    /// Any training or evaluation error; it aborts the search.
    fn run_trial(&mut self, trial: &mut Trial) -> Result<f64>;

    /// Identifier of a trial run.
    fn run_name(&self, trial: &Trial) -> String {
        trial.number().to_string()
    }
}

/// Search settings handed to a backend.
#[derive(Debug, Clone, Copy)]
pub struct SearchSettings<'a> {
    /// Trials to run.
    pub n_trials: usize,
    /// Optimization direction.
    pub direction: Direction,
    /// Backend options.
    pub options: &'a BackendOptions,
}

/// A strategy for proposing trials.
pub trait SearchBackend {
    /// Registry name.
    fn name(&self) -> &str;

    /// Run the search.
    ///
    /// # Errors
    ///
    /// Returns trial errors, invalid options, or [`SetFitError::Config`] when
    /// no trial completed.
    fn run(&self, runner: &mut dyn TrialRunner, settings: &SearchSettings<'_>) -> Result<BestRun>;
}

/// Independent trials with suggestions drawn from a seeded generator.
///
/// Options: `seed` (default 0) and `timeout` in seconds; once the timeout
/// has elapsed no new trial starts.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomSearchBackend;

impl SearchBackend for RandomSearchBackend {
    fn name(&self) -> &str {
        "random"
    }

    fn run(&self, runner: &mut dyn TrialRunner, settings: &SearchSettings<'_>) -> Result<BestRun> {
        let mut seed = 0;
        let mut timeout = None;
        for (key, value) in settings.options {
            match key.as_str() {
                "seed" => seed = value.to_u64(key)?,
                "timeout" => {
                    let secs = value.to_f64(key)?;
                    timeout = Some(Duration::try_from_secs_f64(secs).map_err(|e| {
                        SetFitError::Config(format!("invalid timeout {secs}: {e}"))
                    })?);
                }
                other => tracing::warn!("Ignoring unknown option '{other}' for the random backend"),
            }
        }

        let started = Instant::now();
        let mut seeds = SeededRng::seed_from_u64(seed);
        let mut best: Option<BestRun> = None;

        for number in 0..settings.n_trials {
            if timeout.is_some_and(|limit| started.elapsed() >= limit) {
                tracing::info!("Search timeout reached after {number} trials");
                break;
            }

            let mut trial = Trial::new(number, seeds.next_u64());
            let objective = runner.run_trial(&mut trial)?;
            let run_id = runner.run_name(&trial);
            tracing::info!("Trial {run_id} finished with objective {objective}");

            if best
                .as_ref()
                .map_or(true, |b| settings.direction.is_better(objective, b.objective))
            {
                best = Some(BestRun {
                    run_id,
                    objective,
                    hyperparameters: trial.params().clone(),
                });
            }
        }

        best.ok_or_else(|| SetFitError::Config("hyperparameter search ran no trials".into()))
    }
}

/// Name of the backend used when none is requested.
pub const DEFAULT_BACKEND: &str = "random";

/// Search backends by name.
pub struct SearchBackendRegistry {
    backends: BTreeMap<String, Box<dyn SearchBackend>>,
}

impl SearchBackendRegistry {
    /// Registry without any backend.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            backends: BTreeMap::new(),
        }
    }

    /// Add a backend under its name, returning the one it replaces.
    pub fn register(&mut self, backend: Box<dyn SearchBackend>) -> Option<Box<dyn SearchBackend>> {
        self.backends.insert(backend.name().to_string(), backend)
    }

    /// Look up a backend.
    ///
    /// # Errors
    ///
    /// Returns [`SetFitError::Config`] for unknown names.
    pub fn get(&self, name: &str) -> Result<&dyn SearchBackend> {
        self.backends.get(name).map(|backend| &**backend).ok_or_else(|| {
            SetFitError::Config(format!(
                "unknown hyperparameter search backend '{name}', expected one of: {}",
                self.names().join(", ")
            ))
        })
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.backends.keys().map(String::as_str).collect()
    }
}

impl Default for SearchBackendRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(Box::new(RandomSearchBackend));
        registry
    }
}

impl fmt::Debug for SearchBackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// Options of [`crate::SetFitTrainer::hyperparameter_search`].
pub struct SearchOptions {
    /// Parameter space; [`default_hp_space`] when `None`.
    pub hp_space: Option<HpSpace>,
    /// Objective; [`default_compute_objective`] when `None`.
    pub compute_objective: Option<ComputeObjective>,
    /// Trials to run.
    pub n_trials: usize,
    /// Optimization direction.
    pub direction: Direction,
    /// Backend name; [`DEFAULT_BACKEND`] when `None`.
    pub backend: Option<String>,
    /// Trial naming.
    pub hp_name: Option<HpName>,
    /// Backend options.
    pub backend_options: BackendOptions,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            hp_space: None,
            compute_objective: None,
            n_trials: 10,
            direction: Direction::Maximize,
            backend: None,
            hp_name: None,
            backend_options: BackendOptions::new(),
        }
    }
}
