//! Training orchestration.
//!
//! [`SetFitTrainer`] turns a small labeled dataset into contrastive training
//! data, fits the embedding body, fits the classification head, and scores
//! the result. It also drives hyperparameter search by re-instantiating the
//! model for every trial.

use std::sync::Arc;

use rand::SeedableRng;

use crate::config::{SetFitConfig, TrainingArguments};
use crate::dataset::{prepare_split, Dataset, DatasetSource};
use crate::error::{Result, SetFitError};
use crate::evaluation::{Metric, ValidationLossEvaluator};
use crate::history::{History, Phase, ProgressRecorder};
use crate::loss::{select_strategy, LossStrategy, StrategyConfig};
use crate::metrics::{MetricKwargs, Metrics};
use crate::model::{
    BodyFitParams, BodyObjective, BoxedModel, HeadFitArgs, Label, ModelInit, ModelPart,
    PushOptions, SeededRng, SetFitModel,
};
use crate::scheduler::warmup_steps;
use crate::search::{
    default_compute_objective, default_hp_space, BestRun, ComputeObjective, HpName, HpSpace,
    HyperParams, SearchBackend, SearchBackendRegistry, SearchOptions, SearchSettings, Trial,
    TrialRunner, DEFAULT_BACKEND,
};

/// Where a `train` call currently is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TrainerState {
    /// Not training.
    #[default]
    Idle,
    /// Checking and mapping dataset columns.
    ColumnValidating,
    /// Contrastive body fit.
    BodyTraining,
    /// Head fit.
    HeadTraining,
}

/// Phases a `train` call runs, fixed when the call starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainingPlan {
    /// Contrastive body fit followed by a head fit.
    BodyThenHead,
    /// Contrastive body fit only.
    BodyOnly,
    /// Head fit only.
    HeadOnly,
}

impl TrainingPlan {
    /// Non-differentiable heads always run both phases; a differentiable head
    /// trains the body while frozen and the head once unfrozen.
    #[must_use]
    pub fn new(differentiable_head: bool, frozen: bool) -> Self {
        match (differentiable_head, frozen) {
            (false, _) => TrainingPlan::BodyThenHead,
            (true, true) => TrainingPlan::BodyOnly,
            (true, false) => TrainingPlan::HeadOnly,
        }
    }

    /// Whether the body phase runs.
    #[must_use]
    pub fn trains_body(self) -> bool {
        matches!(self, TrainingPlan::BodyThenHead | TrainingPlan::BodyOnly)
    }

    /// Whether the head phase runs.
    #[must_use]
    pub fn trains_head(self) -> bool {
        matches!(self, TrainingPlan::BodyThenHead | TrainingPlan::HeadOnly)
    }
}

/// Per-call replacements for training arguments. Not persisted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainOverrides {
    /// Epochs for both phases.
    pub num_epochs: Option<usize>,
    /// Batch size for both phases.
    pub batch_size: Option<usize>,
    /// Body and head learning rate.
    pub learning_rate: Option<f64>,
    /// Body learning rate during the head fit.
    pub body_learning_rate: Option<f64>,
    /// L2 weight of a differentiable head.
    pub l2_weight: Option<f64>,
    /// Maximum token length for the head.
    pub max_length: Option<usize>,
}

/// Hyperparameters applied at the start of a `train` call.
#[derive(Debug)]
pub enum TrialInput<'a> {
    /// A live trial; parameters are drawn from the default search space.
    Trial(&'a mut Trial),
    /// An explicit parameter mapping.
    Params(HyperParams),
}

impl TrialInput<'_> {
    fn into_params(self) -> Result<HyperParams> {
        match self {
            TrialInput::Trial(trial) => default_hp_space(trial),
            TrialInput::Params(params) => Ok(params),
        }
    }
}

/// Options of [`SetFitTrainer::train`].
#[derive(Debug)]
pub struct TrainOptions<'a> {
    /// Argument overrides for this call.
    pub overrides: TrainOverrides,
    /// Hyperparameters applied before training.
    pub trial: Option<TrialInput<'a>>,
    /// Show progress bars.
    pub show_progress_bar: bool,
    /// Report every `log_steps` body steps; `0` reports once per epoch.
    pub log_steps: usize,
}

impl Default for TrainOptions<'_> {
    fn default() -> Self {
        Self {
            overrides: TrainOverrides::default(),
            trial: None,
            show_progress_bar: true,
            log_steps: 0,
        }
    }
}

/// Outcome of [`SetFitTrainer::apply_hyperparameters`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppliedParams {
    /// Names set on the training arguments.
    pub applied: Vec<String>,
    /// Names with no matching training argument.
    pub ignored: Vec<String>,
}

/// Few-shot contrastive trainer.
///
/// # Example
///
/// ```no_run
/// use setfit_rs::{SetFitConfig, SetFitTrainer, TrainOptions};
/// use setfit_rs::model::BoxedModel;
///
/// # fn load_model() -> BoxedModel { unimplemented!() }
/// # fn main() -> setfit_rs::Result<()> {
/// let config = SetFitConfig::from_file("setfit.yaml")?;
/// let mut trainer = SetFitTrainer::builder()
///     .config(&config)?
///     .model(load_model())
///     .build()?;
///
/// trainer.train(TrainOptions::default())?;
/// let metrics = trainer.evaluate(None)?;
/// println!("{metrics:?}");
/// # Ok(())
/// # }
/// ```
pub struct SetFitTrainer {
    model: BoxedModel,
    model_init: Option<ModelInit>,
    train_dataset: Option<DatasetSource>,
    eval_dataset: Option<DatasetSource>,
    metric: Metric,
    metric_kwargs: MetricKwargs,
    args: TrainingArguments,
    frozen: bool,
    state: TrainerState,
    recorder: ProgressRecorder,
    backends: SearchBackendRegistry,
}

impl SetFitTrainer {
    /// Start building a trainer.
    #[must_use]
    pub fn builder() -> SetFitTrainerBuilder {
        SetFitTrainerBuilder::default()
    }

    /// The current model.
    #[must_use]
    pub fn model(&self) -> &dyn SetFitModel {
        self.model.as_ref()
    }

    /// The current model, mutably.
    pub fn model_mut(&mut self) -> &mut dyn SetFitModel {
        self.model.as_mut()
    }

    /// Training arguments, including any applied hyperparameters.
    #[must_use]
    pub fn args(&self) -> &TrainingArguments {
        &self.args
    }

    /// Whether a `model_init` factory is still attached.
    #[must_use]
    pub fn has_model_init(&self) -> bool {
        self.model_init.is_some()
    }

    /// Current state; `Idle` outside `train`.
    #[must_use]
    pub fn state(&self) -> TrainerState {
        self.state
    }

    /// Plan the next `train` call would follow.
    #[must_use]
    pub fn training_plan(&self) -> TrainingPlan {
        TrainingPlan::new(self.model.has_differentiable_head(), self.frozen)
    }

    /// Body-phase history.
    #[must_use]
    pub fn embedding_history(&self) -> &History {
        self.recorder.body()
    }

    /// Head-phase history.
    #[must_use]
    pub fn classifier_history(&self) -> &History {
        self.recorder.head()
    }

    /// Both histories.
    #[must_use]
    pub fn history(&self) -> &ProgressRecorder {
        &self.recorder
    }

    /// Make a search backend available to [`SetFitTrainer::hyperparameter_search`].
    pub fn register_search_backend(&mut self, backend: Box<dyn SearchBackend>) {
        tracing::debug!("Registering search backend '{}'", backend.name());
        self.backends.register(backend);
    }

    /// Freeze the differentiable head; the next `train` fits the body only.
    ///
    /// # Errors
    ///
    /// Returns [`SetFitError::Capability`] when the head is not differentiable.
    pub fn freeze(&mut self) -> Result<()> {
        self.require_differentiable_head()?;
        self.frozen = true;
        self.model.freeze(ModelPart::Head);
        Ok(())
    }

    /// Unfreeze the differentiable head; the next `train` fits the head only.
    /// The body is frozen when `keep_body_frozen` is set and unfrozen otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`SetFitError::Capability`] when the head is not differentiable.
    pub fn unfreeze(&mut self, keep_body_frozen: bool) -> Result<()> {
        self.require_differentiable_head()?;
        self.frozen = false;
        self.model.unfreeze(ModelPart::Head);
        if keep_body_frozen {
            self.model.freeze(ModelPart::Body);
        } else {
            self.model.unfreeze(ModelPart::Body);
        }
        Ok(())
    }

    fn require_differentiable_head(&self) -> Result<()> {
        if self.model.has_differentiable_head() {
            Ok(())
        } else {
            Err(SetFitError::Capability(
                "freezing requires a model with a differentiable head".into(),
            ))
        }
    }

    /// Set the named hyperparameters on the training arguments, then rebuild
    /// the model through `model_init` when one is attached. With
    /// `final_model`, the factory is dropped once the model is built.
    ///
    /// Unknown names are returned in [`AppliedParams::ignored`]; a warning is
    /// logged for them unless `model_init` receives the parameters itself.
    ///
    /// # Errors
    ///
    /// Returns [`SetFitError::Config`] when a value cannot be coerced (no
    /// argument is changed in that case) and [`SetFitError::ModelInit`] when
    /// the factory builds nothing.
    pub fn apply_hyperparameters(
        &mut self,
        params: &HyperParams,
        final_model: bool,
    ) -> Result<AppliedParams> {
        let outcome = self.set_arguments(params)?;
        let mut rng = SeededRng::seed_from_u64(self.args.seed);
        self.rebuild_model(params, &mut rng)?;
        if final_model {
            self.model_init = None;
        }
        Ok(outcome)
    }

    fn set_arguments(&mut self, params: &HyperParams) -> Result<AppliedParams> {
        let mut args = self.args.clone();
        let mut outcome = AppliedParams::default();
        let init_takes_params = self.model_init.as_ref().map(ModelInit::takes_params);

        for (name, value) in params {
            if args.set_hyperparameter(name, value)? {
                outcome.applied.push(name.clone());
                continue;
            }
            match init_takes_params {
                Some(true) => {}
                Some(false) => tracing::warn!(
                    "Trying to set {name:?} in the hyperparameter search but there is no corresponding field in `TrainingArguments`, and `model_init` does not take any parameters."
                ),
                None => tracing::warn!(
                    "Trying to set {name:?} in the hyperparameter search but there is no corresponding field in `TrainingArguments`, and no `model_init` is configured to receive it."
                ),
            }
            outcome.ignored.push(name.clone());
        }

        self.args = args;
        Ok(outcome)
    }

    fn rebuild_model(&mut self, params: &HyperParams, rng: &mut SeededRng) -> Result<()> {
        if let Some(init) = &self.model_init {
            self.model = init.build(Some(params), rng)?;
        }
        Ok(())
    }

    /// Run the training plan.
    ///
    /// The random generator is seeded from `seed` once trial parameters are
    /// applied, so reruns with the same arguments reproduce the same pairs and
    /// batches. The trainer is back in [`TrainerState::Idle`] when this
    /// returns, whether or not training succeeded.
    ///
    /// # Errors
    ///
    /// - [`SetFitError::Config`] without a train dataset or with a zero batch
    ///   size override
    /// - [`SetFitError::Schema`] when the datasets do not yield `text` and
    ///   `label`
    /// - [`SetFitError::ModelInit`] when a trial rebuild fails
    /// - collaborator errors from the body or head fit
    pub fn train(&mut self, options: TrainOptions<'_>) -> Result<()> {
        let result = self.run_training(options);
        self.set_state(TrainerState::Idle);
        result
    }

    fn set_state(&mut self, state: TrainerState) {
        if self.state != state {
            tracing::debug!("Trainer state: {:?} -> {state:?}", self.state);
            self.state = state;
        }
    }

    fn run_training(&mut self, options: TrainOptions<'_>) -> Result<()> {
        let TrainOptions {
            overrides,
            trial,
            show_progress_bar,
            log_steps,
        } = options;

        let params = trial.map(TrialInput::into_params).transpose()?;
        if let Some(params) = &params {
            tracing::info!("Trial: {params:?}");
            self.set_arguments(params)?;
        }
        let mut rng = SeededRng::seed_from_u64(self.args.seed);
        if let Some(params) = &params {
            self.rebuild_model(params, &mut rng)?;
        }

        let Some(train_source) = self.train_dataset.as_ref() else {
            return Err(SetFitError::Config(
                "Training requires a `train_dataset` given to the `SetFitTrainer` builder.".into(),
            ));
        };

        self.state = TrainerState::ColumnValidating;
        let mapping = self.args.column_mapping.as_ref();
        if mapping.is_some() {
            tracing::info!("Applying column mapping to training dataset");
        }
        let (x_train, y_train) = prepare_split(train_source, mapping)?;
        let eval = match &self.eval_dataset {
            Some(source) => Some(prepare_split(source, mapping)?),
            None => None,
        };
        let eval_split = eval.as_ref().map(|(x, y)| (x.as_slice(), y.as_slice()));

        let loss_kind = self.args.loss_or_default();
        let num_epochs = overrides.num_epochs.unwrap_or(self.args.num_epochs);
        let batch_size = overrides.batch_size.unwrap_or(self.args.batch_size);
        if batch_size == 0 {
            return Err(SetFitError::Config("batch_size must be > 0".into()));
        }
        let learning_rate = overrides.learning_rate.unwrap_or(self.args.learning_rate);
        let body_learning_rate = overrides.body_learning_rate.or(self.args.body_learning_rate);
        let l2_weight = overrides.l2_weight.or(self.args.l2_weight);
        let max_length = overrides.max_length.or(self.args.max_length);

        let plan = self.training_plan();
        tracing::debug!("Training plan: {plan:?}");

        if plan.trains_body() {
            self.set_state(TrainerState::BodyTraining);

            let mut strategy = StrategyConfig::from_args(&self.args, loss_kind, batch_size);
            strategy.multi_label = self.model.multi_target_strategy().is_some();
            strategy.show_progress_bar = show_progress_bar;
            let LossStrategy {
                mut train_loader,
                test_loader,
                loss,
            } = select_strategy(
                &strategy,
                (x_train.as_slice(), y_train.as_slice()),
                eval_split,
                &mut rng,
            )?;

            let mut evaluator = test_loader
                .map(|loader| ValidationLossEvaluator::new(loader, Arc::clone(&loss)));
            if evaluator.as_ref().is_some_and(|e| e.num_batches() == 0) {
                tracing::warn!(
                    "Evaluation dataset yields no {} batches; skipping validation loss",
                    loss.name()
                );
                evaluator = None;
            }

            let total_steps = train_loader.num_batches() * num_epochs;
            tracing::info!("***** Running training *****");
            tracing::info!("  Num examples = {}", train_loader.num_examples());
            tracing::info!("  Num epochs = {num_epochs}");
            tracing::info!("  Total optimization steps = {total_steps}");
            tracing::info!("  Total train batch size = {}", train_loader.batch_size());

            let params = BodyFitParams {
                epochs: num_epochs,
                learning_rate,
                warmup_steps: warmup_steps(total_steps, self.args.warmup_proportion),
                use_amp: self.args.use_amp,
                show_progress_bar,
                log_steps,
            };
            let objective = BodyObjective {
                loader: &mut train_loader,
                loss: loss.as_ref(),
                evaluator: evaluator.as_mut(),
            };
            let mut listener = self.recorder.listener(Phase::Body);
            self.model.body_mut().fit(objective, &params, &mut listener)?;
        }

        if plan.trains_head() {
            self.set_state(TrainerState::HeadTraining);

            let args = HeadFitArgs {
                x_train: &x_train,
                y_train: &y_train,
                eval: eval_split,
                num_epochs,
                batch_size,
                learning_rate,
                body_learning_rate,
                l2_weight,
                max_length,
                show_progress_bar,
            };
            let mut listener = self.recorder.listener(Phase::Head);
            self.model.fit(&args, &mut listener)?;
        }

        Ok(())
    }

    /// Score the model on `dataset`, or on the eval dataset when `None`.
    ///
    /// # Errors
    ///
    /// - [`SetFitError::Config`] when no dataset is available or the metric
    ///   is unknown
    /// - [`SetFitError::Schema`] when the dataset does not yield `text` and
    ///   `label`
    /// - collaborator errors from `predict`
    pub fn evaluate(&self, dataset: Option<&DatasetSource>) -> Result<Metrics> {
        let source = dataset.or(self.eval_dataset.as_ref()).ok_or_else(|| {
            SetFitError::Config("Evaluation requires a dataset or an `eval_dataset`.".into())
        })?;

        let mapping = self.args.column_mapping.as_ref();
        if mapping.is_some() {
            tracing::info!("Applying column mapping to evaluation dataset");
        }
        let (x_test, y_test) = prepare_split(source, mapping)?;

        tracing::info!("***** Running evaluation *****");
        let y_pred: Vec<Label> = self.model.predict(&x_test)?.into_host()?;
        let multilabel = self.model.multi_target_strategy().is_some();
        self.metric
            .compute(&y_pred, &y_test, multilabel, &self.metric_kwargs)
    }

    /// Search hyperparameters with the requested backend.
    ///
    /// Every trial applies its parameters, rebuilds the model through
    /// `model_init`, trains and evaluates; the metrics are reduced to the
    /// objective by `compute_objective`.
    ///
    /// # Errors
    ///
    /// Returns [`SetFitError::Config`] without a `model_init` or for an
    /// unknown backend, and any error of a trial.
    pub fn hyperparameter_search(&mut self, options: SearchOptions) -> Result<BestRun> {
        if self.model_init.is_none() {
            return Err(SetFitError::Config(
                "To use hyperparameter search, you need to pass your model through a model_init function.".into(),
            ));
        }

        let registry = std::mem::take(&mut self.backends);
        let name = options.backend.clone().unwrap_or_else(|| DEFAULT_BACKEND.into());
        let result = registry
            .get(&name)
            .and_then(|backend| self.run_search(backend, options));
        self.backends = registry;
        result
    }

    fn run_search(&mut self, backend: &dyn SearchBackend, options: SearchOptions) -> Result<BestRun> {
        let SearchOptions {
            hp_space,
            compute_objective,
            n_trials,
            direction,
            backend: _,
            hp_name,
            backend_options,
        } = options;

        tracing::info!(
            "Hyperparameter search: backend '{}', {n_trials} trials, {direction:?}",
            backend.name()
        );
        let settings = SearchSettings {
            n_trials,
            direction,
            options: &backend_options,
        };
        let mut runner = SearchRunner {
            trainer: self,
            hp_space: hp_space.unwrap_or_else(|| Box::new(default_hp_space)),
            compute_objective: compute_objective.unwrap_or_else(|| Box::new(default_compute_objective)),
            hp_name,
        };
        let best = backend.run(&mut runner, &settings)?;
        tracing::info!(
            "Best run {} with objective {}",
            best.run_id,
            best.objective
        );
        Ok(best)
    }

    /// Upload the model; returns the commit URL.
    ///
    /// # Errors
    ///
    /// Returns [`SetFitError::Config`] when `repo_id` is not of the form
    /// `owner/name`, without touching the model.
    pub fn push_to_hub(&self, repo_id: &str, options: &PushOptions) -> Result<String> {
        if !repo_id.contains('/') {
            return Err(SetFitError::Config(format!(
                "`repo_id` must be a full repository ID, including organisation, e.g. \"tomaarsen/setfit_sst2\", got {repo_id:?}"
            )));
        }
        self.model.push_to_hub(repo_id, options)
    }
}

impl std::fmt::Debug for SetFitTrainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SetFitTrainer")
            .field("args", &self.args)
            .field("metric", &self.metric)
            .field("model_init", &self.model_init)
            .field("frozen", &self.frozen)
            .field("state", &self.state)
            .field("backends", &self.backends)
            .finish_non_exhaustive()
    }
}

/// Trains and evaluates one trial on behalf of a search backend.
struct SearchRunner<'t> {
    trainer: &'t mut SetFitTrainer,
    hp_space: HpSpace,
    compute_objective: ComputeObjective,
    hp_name: Option<HpName>,
}

impl TrialRunner for SearchRunner<'_> {
    fn run_trial(&mut self, trial: &mut Trial) -> Result<f64> {
        let params = (self.hp_space)(trial)?;
        self.trainer.train(TrainOptions {
            trial: Some(TrialInput::Params(params)),
            show_progress_bar: false,
            ..TrainOptions::default()
        })?;
        let metrics = self.trainer.evaluate(None)?;
        Ok((self.compute_objective)(&metrics))
    }

    fn run_name(&self, trial: &Trial) -> String {
        self.hp_name
            .as_ref()
            .map_or_else(|| trial.number().to_string(), |name| name(trial))
    }
}

/// Builder for [`SetFitTrainer`].
#[derive(Default)]
pub struct SetFitTrainerBuilder {
    model: Option<BoxedModel>,
    model_init: Option<ModelInit>,
    train_dataset: Option<DatasetSource>,
    eval_dataset: Option<DatasetSource>,
    metric: Metric,
    metric_kwargs: MetricKwargs,
    args: TrainingArguments,
}

impl SetFitTrainerBuilder {
    /// Train this model.
    #[must_use]
    pub fn model(mut self, model: BoxedModel) -> Self {
        self.model = Some(model);
        self
    }

    /// Build the model with this factory.
    #[must_use]
    pub fn model_init(mut self, init: ModelInit) -> Self {
        self.model_init = Some(init);
        self
    }

    /// Training data.
    #[must_use]
    pub fn train_dataset(mut self, dataset: impl Into<DatasetSource>) -> Self {
        self.train_dataset = Some(dataset.into());
        self
    }

    /// Evaluation data.
    #[must_use]
    pub fn eval_dataset(mut self, dataset: impl Into<DatasetSource>) -> Self {
        self.eval_dataset = Some(dataset.into());
        self
    }

    /// Metric used by `evaluate`.
    #[must_use]
    pub fn metric(mut self, metric: impl Into<Metric>) -> Self {
        self.metric = metric.into();
        self
    }

    /// Keyword arguments for named metrics.
    #[must_use]
    pub fn metric_kwargs(mut self, kwargs: MetricKwargs) -> Self {
        self.metric_kwargs = kwargs;
        self
    }

    /// Training arguments.
    #[must_use]
    pub fn args(mut self, args: TrainingArguments) -> Self {
        self.args = args;
        self
    }

    /// Take datasets, metric and arguments from a configuration file.
    ///
    /// # Errors
    ///
    /// Returns validation errors of `config` and dataset loading errors.
    pub fn config(mut self, config: &SetFitConfig) -> Result<Self> {
        config.validate()?;
        if let Some(path) = &config.train_dataset {
            self.train_dataset = Some(Dataset::from_jsonl(path)?.into());
        }
        if let Some(path) = &config.eval_dataset {
            self.eval_dataset = Some(Dataset::from_jsonl(path)?.into());
        }
        self.metric = Metric::Named(config.metric.clone());
        self.metric_kwargs.clone_from(&config.metric_kwargs);
        self.args = config.training.clone();
        Ok(self)
    }

    /// Validate and build.
    ///
    /// With only `model_init`, the model is built here from a generator
    /// seeded with `seed`.
    ///
    /// # Errors
    ///
    /// Returns [`SetFitError::Config`] unless exactly one of `model` and
    /// `model_init` is set or when the arguments are invalid, and
    /// [`SetFitError::ModelInit`] when the factory builds nothing.
    pub fn build(self) -> Result<SetFitTrainer> {
        self.args.validate()?;

        let model = match (self.model, &self.model_init) {
            (Some(model), None) => model,
            (None, Some(init)) => {
                let mut rng = SeededRng::seed_from_u64(self.args.seed);
                init.build(None, &mut rng)?
            }
            (None, None) => {
                return Err(SetFitError::Config(
                    "`SetFitTrainer` requires either a `model` or `model_init` argument".into(),
                ))
            }
            (Some(_), Some(_)) => {
                return Err(SetFitError::Config(
                    "`SetFitTrainer` requires either a `model` or `model_init` argument, but not both".into(),
                ))
            }
        };

        Ok(SetFitTrainer {
            model,
            model_init: self.model_init,
            train_dataset: self.train_dataset,
            eval_dataset: self.eval_dataset,
            metric: self.metric,
            metric_kwargs: self.metric_kwargs,
            args: self.args,
            frozen: true,
            state: TrainerState::Idle,
            recorder: ProgressRecorder::new(),
            backends: SearchBackendRegistry::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LossKind;
    use crate::dataset::DatasetDict;
    use crate::error::SchemaError;
    use crate::mocks::MockModel;
    use crate::search::{Direction, ParamValue};
    use serde_json::json;
    use std::cell::Cell;
    use std::rc::Rc;
    use std::sync::{Arc, Mutex};
    use tracing_subscriber::fmt::MakeWriter;

    /// Log sink shared with a test-local subscriber.
    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for CapturedLogs {
        type Writer = Self;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    /// Run `f` with warnings and above written to a buffer.
    fn capture_logs<T>(f: impl FnOnce() -> T) -> (T, String) {
        let logs = CapturedLogs::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(logs.clone())
            .with_max_level(tracing::Level::WARN)
            .with_ansi(false)
            .finish();
        let out = tracing::subscriber::with_default(subscriber, f);
        let text = String::from_utf8_lossy(&logs.0.lock().unwrap()).into_owned();
        (out, text)
    }

    const POSITIVE: [&str; 10] = [
        "a wonderful uplifting film",
        "great acting and a great story",
        "i loved every minute",
        "brilliant and moving",
        "a joyful wonderful ride",
        "superb direction great cast",
        "loved the soundtrack",
        "an uplifting brilliant debut",
        "great fun for everyone",
        "wonderful from start to finish",
    ];

    const NEGATIVE: [&str; 10] = [
        "a dull boring mess",
        "terrible acting and a weak plot",
        "i hated every minute",
        "boring and lifeless",
        "a tedious awful slog",
        "weak direction terrible cast",
        "hated the soundtrack",
        "an awful boring sequel",
        "dull for everyone",
        "terrible from start to finish",
    ];

    fn sentiment_dataset() -> Dataset {
        let mut texts = Vec::new();
        let mut labels = Vec::new();
        for (pos, neg) in POSITIVE.iter().zip(NEGATIVE) {
            texts.push((*pos).to_string());
            labels.push(Label::Single(1));
            texts.push(neg.to_string());
            labels.push(Label::Single(0));
        }
        Dataset::from_texts_and_labels(texts, labels)
    }

    fn quick_args() -> TrainingArguments {
        TrainingArguments {
            num_iterations: 2,
            batch_size: 8,
            ..TrainingArguments::default()
        }
    }

    fn trainer_with(model: MockModel) -> SetFitTrainer {
        SetFitTrainer::builder()
            .model(Box::new(model))
            .train_dataset(sentiment_dataset())
            .eval_dataset(sentiment_dataset())
            .args(quick_args())
            .build()
            .unwrap()
    }

    fn quiet() -> TrainOptions<'static> {
        TrainOptions {
            show_progress_bar: false,
            ..TrainOptions::default()
        }
    }

    #[test]
    fn test_builder_requires_exactly_one_model_source() {
        assert!(matches!(
            SetFitTrainer::builder().build(),
            Err(SetFitError::Config(_))
        ));

        let both = SetFitTrainer::builder()
            .model(Box::new(MockModel::default()))
            .model_init(ModelInit::plain(|_| Some(Box::new(MockModel::default()) as BoxedModel)))
            .build();
        assert!(matches!(both, Err(SetFitError::Config(_))));
    }

    #[test]
    fn test_builder_rejects_invalid_warmup() {
        let result = SetFitTrainer::builder()
            .model(Box::new(MockModel::default()))
            .args(TrainingArguments {
                warmup_proportion: 1.5,
                ..TrainingArguments::default()
            })
            .build();
        assert!(matches!(result, Err(SetFitError::Config(_))));
    }

    #[test]
    fn test_builder_model_init_returning_none() {
        let result = SetFitTrainer::builder()
            .model_init(ModelInit::plain(|_| None))
            .build();
        assert!(matches!(result, Err(SetFitError::ModelInit(_))));
    }

    #[test]
    fn test_training_plan() {
        assert_eq!(TrainingPlan::new(false, true), TrainingPlan::BodyThenHead);
        assert_eq!(TrainingPlan::new(false, false), TrainingPlan::BodyThenHead);
        assert_eq!(TrainingPlan::new(true, true), TrainingPlan::BodyOnly);
        assert_eq!(TrainingPlan::new(true, false), TrainingPlan::HeadOnly);
        assert!(TrainingPlan::BodyThenHead.trains_body());
        assert!(TrainingPlan::BodyThenHead.trains_head());
        assert!(!TrainingPlan::BodyOnly.trains_head());
        assert!(!TrainingPlan::HeadOnly.trains_body());
    }

    #[test]
    fn test_end_to_end_defaults() {
        let mut trainer = trainer_with(MockModel::default());
        trainer.train(quiet()).unwrap();

        let metrics = trainer.evaluate(None).unwrap();
        assert!(metrics.contains_key("accuracy"));
        assert!(!trainer.embedding_history().train().is_empty());
        assert!(!trainer.embedding_history().test().is_empty());
        assert!(!trainer.classifier_history().train().is_empty());
        assert_eq!(trainer.state(), TrainerState::Idle);
    }

    #[test]
    fn test_histories_accumulate_across_train_calls() {
        let mut trainer = trainer_with(MockModel::default());
        trainer.train(quiet()).unwrap();
        let body = trainer.embedding_history().train().to_vec();
        let head = trainer.classifier_history().train().to_vec();

        trainer.train(quiet()).unwrap();
        trainer.evaluate(None).unwrap();

        assert_eq!(trainer.embedding_history().train().len(), body.len() * 2);
        assert_eq!(&trainer.embedding_history().train()[..body.len()], body.as_slice());
        assert_eq!(&trainer.classifier_history().train()[..head.len()], head.as_slice());
    }

    #[test]
    fn test_missing_train_dataset() {
        let mut trainer = SetFitTrainer::builder()
            .model(Box::new(MockModel::default()))
            .build()
            .unwrap();
        assert!(matches!(trainer.train(quiet()), Err(SetFitError::Config(_))));
        assert!(trainer.embedding_history().is_empty());
        assert_eq!(trainer.state(), TrainerState::Idle);
    }

    #[test]
    fn test_missing_columns_without_mapping() {
        let dataset = Dataset::from_columns([
            ("sentence", vec![json!("good"), json!("bad")]),
            ("polarity", vec![json!(1), json!(0)]),
        ])
        .unwrap();
        let mut trainer = SetFitTrainer::builder()
            .model(Box::new(MockModel::default()))
            .train_dataset(dataset.clone())
            .build()
            .unwrap();
        assert!(matches!(
            trainer.train(quiet()),
            Err(SetFitError::Schema(SchemaError::MissingColumns { .. }))
        ));

        let mut args = quick_args();
        args.column_mapping = Some(
            [("sentence", "text"), ("polarity", "label")]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        let mut trainer = SetFitTrainer::builder()
            .model(Box::new(MockModel::default()))
            .train_dataset(dataset)
            .args(args)
            .build()
            .unwrap();
        trainer.train(quiet()).unwrap();
    }

    #[test]
    fn test_multi_split_dataset_is_rejected() {
        let dict = DatasetDict::new().with_split("train", sentiment_dataset());
        let mut trainer = SetFitTrainer::builder()
            .model(Box::new(MockModel::default()))
            .train_dataset(dict)
            .build()
            .unwrap();
        match trainer.train(quiet()) {
            Err(SetFitError::Schema(SchemaError::MultiSplit { splits })) => {
                assert_eq!(splits, vec!["train".to_string()]);
            }
            other => panic!("expected MultiSplit, got {other:?}"),
        }
    }

    #[test]
    fn test_without_eval_dataset() {
        let mut trainer = SetFitTrainer::builder()
            .model(Box::new(MockModel::default()))
            .train_dataset(sentiment_dataset())
            .args(quick_args())
            .build()
            .unwrap();
        trainer.train(quiet()).unwrap();

        assert!(!trainer.embedding_history().train().is_empty());
        assert!(trainer.embedding_history().test().is_empty());
        assert!(trainer.classifier_history().test().is_empty());
        assert!(matches!(trainer.evaluate(None), Err(SetFitError::Config(_))));
        assert!(trainer
            .evaluate(Some(&sentiment_dataset().into()))
            .unwrap()
            .contains_key("accuracy"));
    }

    #[test]
    fn test_label_grouped_loss() {
        let mut trainer = SetFitTrainer::builder()
            .model(Box::new(MockModel::default()))
            .train_dataset(sentiment_dataset())
            .eval_dataset(sentiment_dataset())
            .args(TrainingArguments {
                loss: Some(LossKind::BatchHardTriplet),
                ..quick_args()
            })
            .build()
            .unwrap();
        trainer.train(quiet()).unwrap();
        assert!(!trainer.embedding_history().train().is_empty());
    }

    #[test]
    fn test_unset_loss_defaults_and_persists() {
        let mut trainer = SetFitTrainer::builder()
            .model(Box::new(MockModel::default()))
            .train_dataset(sentiment_dataset())
            .args(TrainingArguments {
                loss: None,
                ..quick_args()
            })
            .build()
            .unwrap();
        trainer.train(quiet()).unwrap();
        assert_eq!(trainer.args().loss, Some(LossKind::CosineSimilarity));
    }

    #[test]
    fn test_freeze_requires_differentiable_head() {
        let mut trainer = trainer_with(MockModel::default());
        assert!(matches!(trainer.freeze(), Err(SetFitError::Capability(_))));
        assert!(matches!(trainer.unfreeze(false), Err(SetFitError::Capability(_))));
    }

    #[test]
    fn test_differentiable_head_phases() {
        let mut trainer = trainer_with(MockModel::default().differentiable());
        assert_eq!(trainer.training_plan(), TrainingPlan::BodyOnly);

        trainer.freeze().unwrap();
        assert!(trainer.model().is_frozen(ModelPart::Head));
        trainer.train(quiet()).unwrap();
        assert!(!trainer.embedding_history().is_empty());
        assert!(trainer.classifier_history().is_empty());

        trainer.unfreeze(true).unwrap();
        assert!(!trainer.model().is_frozen(ModelPart::Head));
        assert!(trainer.model().is_frozen(ModelPart::Body));
        assert_eq!(trainer.training_plan(), TrainingPlan::HeadOnly);

        let body_entries = trainer.embedding_history().train().len();
        trainer.train(quiet()).unwrap();
        assert_eq!(trainer.embedding_history().train().len(), body_entries);
        assert!(!trainer.classifier_history().is_empty());

        trainer.unfreeze(false).unwrap();
        assert!(!trainer.model().is_frozen(ModelPart::Body));
    }

    #[test]
    fn test_overrides_are_not_persisted() {
        let mut trainer = trainer_with(MockModel::default());
        trainer
            .train(TrainOptions {
                overrides: TrainOverrides {
                    num_epochs: Some(2),
                    batch_size: Some(4),
                    ..TrainOverrides::default()
                },
                ..quiet()
            })
            .unwrap();
        assert_eq!(trainer.args().num_epochs, 1);
        assert_eq!(trainer.args().batch_size, 8);
        assert_eq!(trainer.embedding_history().test().len(), 2);
    }

    #[test]
    fn test_zero_batch_size_override() {
        let mut trainer = trainer_with(MockModel::default());
        let result = trainer.train(TrainOptions {
            overrides: TrainOverrides {
                batch_size: Some(0),
                ..TrainOverrides::default()
            },
            ..quiet()
        });
        assert!(matches!(result, Err(SetFitError::Config(_))));
        assert_eq!(trainer.state(), TrainerState::Idle);
    }

    #[test]
    fn test_same_seed_reproduces_history() {
        let mut a = trainer_with(MockModel::default());
        let mut b = trainer_with(MockModel::default());
        a.train(quiet()).unwrap();
        b.train(quiet()).unwrap();
        assert_eq!(a.history(), b.history());
    }

    #[test]
    fn test_apply_hyperparameters_coerces_strings() {
        let mut trainer = SetFitTrainer::builder()
            .model_init(ModelInit::plain(|_| Some(Box::new(MockModel::default()) as BoxedModel)))
            .build()
            .unwrap();
        let params = HyperParams::from([
            ("learning_rate".to_string(), ParamValue::from("0.01")),
            ("dropout".to_string(), ParamValue::Float(0.1)),
        ]);

        let (outcome, logs) = capture_logs(|| trainer.apply_hyperparameters(&params, false));
        let outcome = outcome.unwrap();
        assert_eq!(trainer.args().learning_rate, 0.01);
        assert_eq!(outcome.applied, vec!["learning_rate".to_string()]);
        assert_eq!(outcome.ignored, vec!["dropout".to_string()]);
        assert!(trainer.has_model_init());

        assert!(logs.contains("WARN"), "{logs}");
        assert!(logs.contains("\"dropout\""), "{logs}");
        assert!(logs.contains("`model_init` does not take any parameters"), "{logs}");
        assert!(!logs.contains("learning_rate"), "{logs}");
    }

    #[test]
    fn test_unknown_hyperparameter_without_model_init_warns() {
        let mut trainer = trainer_with(MockModel::default());
        let params = HyperParams::from([("dropout".to_string(), ParamValue::Float(0.1))]);

        let options = TrainOptions {
            trial: Some(TrialInput::Params(params)),
            ..quiet()
        };
        let (outcome, logs) = capture_logs(|| trainer.train(options));
        outcome.unwrap();
        assert!(logs.contains("\"dropout\""), "{logs}");
        assert!(logs.contains("no `model_init` is configured"), "{logs}");
        assert!(!logs.contains("does not take any parameters"), "{logs}");
    }

    #[test]
    fn test_apply_hyperparameters_is_atomic_on_bad_value() {
        let mut trainer = trainer_with(MockModel::default());
        let params = HyperParams::from([
            ("batch_size".to_string(), ParamValue::Int(4)),
            ("num_epochs".to_string(), ParamValue::from("many")),
        ]);
        assert!(trainer.apply_hyperparameters(&params, false).is_err());
        assert_eq!(trainer.args().batch_size, 8);
    }

    #[test]
    fn test_apply_hyperparameters_final_model() {
        let built = Rc::new(Cell::new(0));
        let counter = Rc::clone(&built);
        let mut trainer = SetFitTrainer::builder()
            .model_init(ModelInit::with_params(move |params, _| {
                counter.set(counter.get() + 1);
                let differentiable = params
                    .and_then(|p| p.get("differentiable"))
                    .is_some_and(|v| v.to_bool("differentiable").unwrap_or(false));
                let model = MockModel::default();
                Some(Box::new(if differentiable { model.differentiable() } else { model }) as BoxedModel)
            }))
            .build()
            .unwrap();
        assert_eq!(built.get(), 1);

        let params = HyperParams::from([("differentiable".to_string(), ParamValue::Bool(true))]);
        let (outcome, logs) = capture_logs(|| trainer.apply_hyperparameters(&params, true));
        let outcome = outcome.unwrap();
        assert_eq!(outcome.ignored, vec!["differentiable".to_string()]);
        // A parameter-taking model_init receives unknown names silently.
        assert!(!logs.contains("differentiable"), "{logs}");
        assert_eq!(built.get(), 2);
        assert!(trainer.model().has_differentiable_head());
        assert!(!trainer.has_model_init());
    }

    #[test]
    fn test_train_with_explicit_params() {
        let mut trainer = trainer_with(MockModel::default());
        trainer
            .train(TrainOptions {
                trial: Some(TrialInput::Params(HyperParams::from([(
                    "num_epochs".to_string(),
                    ParamValue::Int(2),
                )]))),
                ..quiet()
            })
            .unwrap();
        assert_eq!(trainer.args().num_epochs, 2);
        assert_eq!(trainer.embedding_history().test().len(), 2);
    }

    #[test]
    fn test_hyperparameter_search_requires_model_init() {
        let mut trainer = trainer_with(MockModel::default());
        assert!(matches!(
            trainer.hyperparameter_search(SearchOptions::default()),
            Err(SetFitError::Config(_))
        ));
    }

    fn searchable_trainer() -> SetFitTrainer {
        SetFitTrainer::builder()
            .model_init(ModelInit::plain(|_| Some(Box::new(MockModel::default()) as BoxedModel)))
            .train_dataset(sentiment_dataset())
            .eval_dataset(sentiment_dataset())
            .args(quick_args())
            .build()
            .unwrap()
    }

    fn small_space(trial: &mut Trial) -> Result<HyperParams> {
        Ok(HyperParams::from([
            (
                "num_iterations".to_string(),
                ParamValue::Int(trial.suggest_int("num_iterations", 1, 2)?),
            ),
            (
                "learning_rate".to_string(),
                ParamValue::Float(trial.suggest_float("learning_rate", 1e-5, 1e-3, true)?),
            ),
        ]))
    }

    #[test]
    fn test_hyperparameter_search_unknown_backend() {
        let mut trainer = searchable_trainer();
        let result = trainer.hyperparameter_search(SearchOptions {
            backend: Some("optuna".into()),
            ..SearchOptions::default()
        });
        assert!(matches!(result, Err(SetFitError::Config(_))));
        assert!(trainer.embedding_history().is_empty());
    }

    #[test]
    fn test_hyperparameter_search_reports_invalid_space() {
        let mut trainer = searchable_trainer();
        let result = trainer.hyperparameter_search(SearchOptions {
            hp_space: Some(Box::new(|trial: &mut Trial| -> Result<HyperParams> {
                let lr = trial.suggest_float("learning_rate", 0.0, 1e-3, true)?;
                Ok(HyperParams::from([(
                    "learning_rate".to_string(),
                    ParamValue::Float(lr),
                )]))
            })),
            n_trials: 2,
            ..SearchOptions::default()
        });
        assert!(matches!(result, Err(SetFitError::Config(msg)) if msg.contains("learning_rate")));
        assert!(trainer.embedding_history().is_empty());
        assert_eq!(trainer.state(), TrainerState::Idle);
    }

    #[test]
    fn test_hyperparameter_search_runs_trials() {
        let mut trainer = searchable_trainer();
        let best = trainer
            .hyperparameter_search(SearchOptions {
                hp_space: Some(Box::new(small_space)),
                n_trials: 2,
                direction: Direction::Maximize,
                hp_name: Some(Box::new(|trial: &Trial| format!("trial-{}", trial.number()))),
                ..SearchOptions::default()
            })
            .unwrap();

        assert!(best.run_id.starts_with("trial-"));
        assert!((0.0..=1.0).contains(&best.objective));
        assert!(best.hyperparameters.contains_key("learning_rate"));
        assert_eq!(trainer.embedding_history().test().len(), 2);
    }

    #[test]
    fn test_hyperparameter_search_custom_objective() {
        let mut trainer = searchable_trainer();
        let best = trainer
            .hyperparameter_search(SearchOptions {
                hp_space: Some(Box::new(small_space)),
                compute_objective: Some(Box::new(|_: &Metrics| 7.0)),
                n_trials: 1,
                ..SearchOptions::default()
            })
            .unwrap();
        assert_eq!(best.objective, 7.0);
        assert_eq!(best.run_id, "0");
    }

    #[test]
    fn test_push_to_hub_validates_repo_id() {
        let trainer = trainer_with(MockModel::default());
        assert!(matches!(
            trainer.push_to_hub("not-a-valid-id", &PushOptions::default()),
            Err(SetFitError::Config(_))
        ));
        let url = trainer
            .push_to_hub("owner/setfit-model", &PushOptions::default())
            .unwrap();
        assert!(url.contains("owner/setfit-model"));
    }

    #[test]
    fn test_callable_metric_receives_host_labels() {
        let mut trainer = SetFitTrainer::builder()
            .model(Box::new(MockModel::default()))
            .train_dataset(sentiment_dataset())
            .eval_dataset(sentiment_dataset())
            .metric(Metric::callable(|preds, refs| {
                Metrics::from([("count".to_string(), (preds.len() + refs.len()) as f64)])
            }))
            .args(quick_args())
            .build()
            .unwrap();
        trainer.train(quiet()).unwrap();
        assert_eq!(trainer.evaluate(None).unwrap()["count"], 40.0);
    }
}
