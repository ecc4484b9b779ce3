//! Distillation training orchestrator

use super::accumulate::GradientAccumulator;
use super::loss::{LossComposer, STUDENT_ACCURACY, TEACHER_ACCURACY};
use super::metrics::EpochMetrics;
use super::validate::{ValidationModels, ValidationReport, ValidationRound, ValidationRunner};
use super::variants::VariantExpander;
use crate::attack::{AttackGenerator, AttackTargets, VariantGenerator};
use crate::config::DistillConfig;
use crate::data::{flatten_images, Batch, DataSource, Split};
use crate::io::{save_model, RoleRequirements, RunMode, SaveConfig};
use crate::optim::{Optimizer, ScheduleController};
use crate::{Error, Model, Result};
use chrono::Local;
use ndarray::Array2;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Why the epoch loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The configured number of epochs ran
    EpochLimit,
    /// The learning-rate schedule returned no further rate
    ScheduleExhausted,
    /// The cancellation handle was set
    Cancelled,
}

/// Metrics of one finished epoch
#[derive(Debug, Clone, PartialEq)]
pub struct EpochSummary {
    pub epoch: usize,
    pub lr: f32,
    /// Epoch means, ordered like [`TrainResult::metric_names`]
    pub metrics: Vec<f32>,
    /// Validation accuracy vector, on validation epochs
    pub validation: Option<Vec<f32>>,
}

/// Result of a training run
#[derive(Debug, Clone)]
pub struct TrainResult {
    pub metric_names: Vec<String>,
    pub history: Vec<EpochSummary>,
    pub stop: StopReason,
    /// Clean validation accuracy of the best round
    pub best_accuracy: Option<f32>,
    pub elapsed_secs: f64,
}

impl TrainResult {
    pub fn epochs_run(&self) -> usize {
        self.history.len()
    }

    /// Mean training accuracy of the student per epoch
    pub fn student_accuracy(&self) -> Vec<f32> {
        self.history
            .iter()
            .map(|e| e.metrics[STUDENT_ACCURACY])
            .collect()
    }
}

/// Result of [`DistillTrainer::start`]
#[derive(Debug, Clone)]
pub enum RunOutcome {
    Trained(TrainResult),
    Tested(Vec<ValidationReport>),
}

/// Per-epoch wall-clock totals in seconds
#[derive(Debug, Clone, Copy, Default)]
struct EpochTiming {
    total: f64,
    generation: f64,
    run: f64,
}

/// Drives epochs, batches, validation, scheduling and checkpointing
///
/// # Example
///
/// ```no_run
/// use destilar::config::{DistillConfig, DistillSpec};
/// use destilar::data::InMemoryDataSource;
/// use destilar::io::RunMode;
/// use destilar::model::LinearClassifier;
/// use destilar::optim::SGD;
/// use destilar::train::DistillTrainer;
///
/// let config = DistillConfig::new(DistillSpec::default())?;
/// let student = LinearClassifier::new("stu", 784, 10);
/// let teacher = LinearClassifier::new("tea", 784, 10);
/// let mut source = InMemoryDataSource::from_safetensors("mnist.safetensors")?;
///
/// let mut trainer = DistillTrainer::new(config, Box::new(student), Box::new(SGD::new(0.1, 0.9)))?
///     .with_teacher(Box::new(teacher));
/// trainer.start(RunMode::Train, &mut source)?;
/// # Ok::<(), destilar::Error>(())
/// ```
pub struct DistillTrainer {
    config: DistillConfig,
    student: Box<dyn Model>,
    teacher: Option<Box<dyn Model>>,
    additional: Vec<Box<dyn Model>>,
    optimizer: Box<dyn Optimizer>,
    lr_schedule: Box<dyn ScheduleController>,
    threshold_schedule: Option<Box<dyn ScheduleController>>,
    train_attacks: Box<dyn AttackGenerator>,
    test_attacks: Option<Box<dyn AttackGenerator>>,
    composer: LossComposer,
    accumulator: GradientAccumulator,
    validator: ValidationRunner,
    metrics: EpochMetrics,
    save_config: SaveConfig,
    cancel: Arc<AtomicBool>,
}

impl DistillTrainer {
    /// Build a trainer whose schedules and attack generators follow `config`
    pub fn new(
        config: DistillConfig,
        student: Box<dyn Model>,
        optimizer: Box<dyn Optimizer>,
    ) -> Result<Self> {
        let spec = config.spec();
        let composer = LossComposer::new(&spec.distill)?;
        let lr_schedule = spec.training.lr_schedule.build(spec.optimizer.lr);
        let threshold_schedule = match &spec.training.threshold_schedule {
            Some(schedule) => {
                let initial = schedule.initial.ok_or_else(|| {
                    Error::ConfigError("threshold_schedule needs an initial value".to_string())
                })?;
                Some(Box::new(schedule.build(initial)) as Box<dyn ScheduleController>)
            }
            None => None,
        };

        let range = spec.data.pixel_range;
        let seed = spec.training.seed;
        let train_attacks = if spec.attacks.train.is_empty() {
            VariantGenerator::clean()
        } else {
            VariantGenerator::new(spec.attacks.train.clone())
        }
        .with_merge(spec.attacks.train_merge)
        .with_pixel_range(range)
        .with_seed(seed);
        let test_attacks = (!spec.attacks.test.is_empty()).then(|| {
            Box::new(
                VariantGenerator::new(spec.attacks.test.clone())
                    .with_pixel_range(range)
                    .with_seed(seed.wrapping_add(1)),
            ) as Box<dyn AttackGenerator>
        });

        Ok(Self {
            metrics: EpochMetrics::new(composer.metric_names()),
            accumulator: GradientAccumulator::new(spec.training.accumulation),
            validator: ValidationRunner::new(spec.data.batch_size, range).with_seed(seed),
            lr_schedule: Box::new(lr_schedule),
            threshold_schedule,
            train_attacks: Box::new(train_attacks),
            test_attacks,
            composer,
            student,
            teacher: None,
            additional: Vec::new(),
            optimizer,
            save_config: SaveConfig::default(),
            cancel: Arc::new(AtomicBool::new(false)),
            config,
        })
    }

    pub fn with_teacher(mut self, mut teacher: Box<dyn Model>) -> Self {
        teacher.set_training(false);
        self.teacher = Some(teacher);
        self
    }

    /// Register an extra model, addressable by its namescope as an attack target
    pub fn with_additional(mut self, mut model: Box<dyn Model>) -> Self {
        model.set_training(false);
        self.additional.push(model);
        self
    }

    pub fn with_train_attacks(mut self, generator: Box<dyn AttackGenerator>) -> Self {
        self.train_attacks = generator;
        self
    }

    pub fn with_test_attacks(mut self, generator: Box<dyn AttackGenerator>) -> Self {
        self.test_attacks = Some(generator);
        self
    }

    pub fn with_lr_schedule(mut self, schedule: Box<dyn ScheduleController>) -> Self {
        self.lr_schedule = schedule;
        self
    }

    pub fn with_save_config(mut self, save_config: SaveConfig) -> Self {
        self.save_config = save_config;
        self
    }

    /// Flag checked at every epoch boundary; setting it ends training gracefully
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn config(&self) -> &DistillConfig {
        &self.config
    }

    pub fn student(&self) -> &dyn Model {
        self.student.as_ref()
    }

    pub fn teacher(&self) -> Option<&dyn Model> {
        self.teacher.as_deref()
    }

    /// Additional model registered under `namescope`
    pub fn additional(&self, namescope: &str) -> Option<&dyn Model> {
        self.additional
            .iter()
            .find(|m| m.namescope() == namescope)
            .map(|m| m.as_ref())
    }

    /// Restore every role from its configured checkpoints
    pub fn load_checkpoints(&mut self, mode: RunMode) -> Result<()> {
        let spec = self.config.spec();
        let teacher_namescope = self
            .teacher
            .as_ref()
            .map_or(spec.model.teacher.namescope.as_str(), |t| t.namescope())
            .to_string();
        let plan = spec.checkpoints.resolve(RoleRequirements {
            mode,
            distilling: self.config.distilling(),
            self_distill: spec.distill.self_distill,
            use_denoiser: spec.model.use_denoiser,
            teacher_namescope: &teacher_namescope,
        })?;

        match (&plan.teacher, self.teacher.as_deref_mut()) {
            (Some(restore), Some(teacher)) => {
                let report = restore.apply(teacher)?;
                info!(
                    "Restored {} teacher parameters ({} excluded)",
                    report.restored.len(),
                    report.excluded.len()
                );
            }
            (Some(_), None) => debug!("Teacher checkpoint given but no teacher model; skipped"),
            _ => {}
        }

        let report = plan.student.apply(self.student.as_mut())?;
        info!(
            "Restored {} student parameters from {} source(s) ({} excluded)",
            report.restored.len(),
            plan.student.sources.len(),
            report.excluded.len()
        );

        for (name, restore) in &plan.additional {
            let model = self
                .additional
                .iter_mut()
                .find(|m| m.namescope() == name.as_str())
                .ok_or_else(|| {
                    Error::ConfigError(format!("no additional model with namescope '{name}'"))
                })?;
            let report = restore.apply(model.as_mut())?;
            info!("Restored {} parameters of {name}", report.restored.len());
        }
        Ok(())
    }

    /// Load checkpoints, then train or test
    ///
    /// The data source is started before and stopped after the run.
    pub fn start(&mut self, mode: RunMode, source: &mut dyn DataSource) -> Result<RunOutcome> {
        source.start()?;
        let outcome = self.run(mode, source);
        source.stop();
        outcome
    }

    fn run(&mut self, mode: RunMode, source: &mut dyn DataSource) -> Result<RunOutcome> {
        self.load_checkpoints(mode)?;
        match mode {
            RunMode::Train => {
                if !self.config.training().no_init_test {
                    self.validate(source, ValidationRound::adversarial("loaded_teacher_copy"))?;
                }
                Ok(RunOutcome::Trained(self.train(source)?))
            }
            RunMode::Test => Ok(RunOutcome::Tested(self.test_only(source)?)),
        }
    }

    /// Adversarial round plus one salt-and-pepper round per configured rate
    pub fn test_only(&mut self, source: &mut dyn DataSource) -> Result<Vec<ValidationReport>> {
        let mut reports = vec![self.validate(source, ValidationRound::adversarial("test"))?];
        for rate in self.config.spec().test.saltpepper_rates() {
            let name = format!("saltpepper_{rate}");
            reports.push(self.validate(source, ValidationRound::clean(&name).with_saltpepper(rate))?);
        }
        Ok(reports)
    }

    /// One pass over the validation split with the student in inference mode
    pub fn validate(
        &mut self,
        source: &mut dyn DataSource,
        round: ValidationRound<'_>,
    ) -> Result<ValidationReport> {
        self.student.set_training(false);
        let models = ValidationModels {
            student: self.student.as_ref(),
            teacher: self.teacher.as_deref(),
            targets: attack_targets(
                self.student.as_ref(),
                self.teacher.as_deref(),
                &self.additional,
            ),
        };
        let attacks: Option<&mut dyn AttackGenerator> = match self.test_attacks.as_mut() {
            Some(generator) => Some(generator.as_mut()),
            None => None,
        };
        let report = self.validator.run(round, source, &models, attacks);
        self.student.set_training(true);
        report
    }

    /// Epoch loop; the data source must already be started
    pub fn train(&mut self, source: &mut dyn DataSource) -> Result<TrainResult> {
        if self.config.needs_teacher() && self.teacher.is_none() {
            return Err(Error::ConfigError(
                "distillation without self_distill needs a teacher model".to_string(),
            ));
        }
        let training = self.config.training().clone();
        let available = source.num_examples(Split::Train);
        if available == 0 {
            return Err(Error::DataSource("training split is empty".to_string()));
        }
        let batch_size = self.config.spec().data.batch_size.min(available);
        let steps = available / batch_size;

        let started = Instant::now();
        let mut history = Vec::with_capacity(training.epochs);
        let mut stop = StopReason::EpochLimit;
        let mut best_accuracy = None;

        self.student.set_training(true);
        for epoch in 1..=training.epochs {
            if self.cancel.load(Ordering::Relaxed) {
                info!("Training cancelled before epoch {epoch}");
                stop = StopReason::Cancelled;
                break;
            }
            self.train_attacks.new_epoch();
            let Some(lr) = self.lr_schedule.current() else {
                info!("End training as val acc not decay");
                stop = StopReason::ScheduleExhausted;
                break;
            };
            debug!("Lr: {lr}");
            if let Some(threshold) = self.threshold_schedule.as_ref().and_then(|s| s.current()) {
                self.student.set_threshold(threshold);
            }

            let timing = self.train_epoch(source, epoch, lr, batch_size, steps)?;
            source.epoch_end(Split::Train);
            self.log_epoch(epoch, steps, timing);

            let mut validation = None;
            if epoch % training.test_frequency == 0 {
                let accuracies = self
                    .validate(source, ValidationRound::adversarial("normal_adv"))?
                    .accuracies();
                let feedback = self.lr_schedule.observe(&accuracies);
                self.observe_threshold(&accuracies);
                if feedback.is_best {
                    best_accuracy = accuracies.first().copied();
                    self.save_checkpoint("best", epoch)?;
                }
                validation = Some(accuracies);
            }
            if epoch % training.save_every == 0 {
                self.save_checkpoint(&epoch.to_string(), epoch)?;
            }

            history.push(EpochSummary {
                epoch,
                lr,
                metrics: self.metrics.mean(),
                validation,
            });
        }

        Ok(TrainResult {
            metric_names: self.metrics.names().to_vec(),
            history,
            stop,
            best_accuracy,
            elapsed_secs: started.elapsed().as_secs_f64(),
        })
    }

    fn train_epoch(
        &mut self,
        source: &mut dyn DataSource,
        epoch: usize,
        lr: f32,
        batch_size: usize,
        steps: usize,
    ) -> Result<EpochTiming> {
        let print_every = self.config.training().print_every;
        self.metrics.reset();
        let mut timing = EpochTiming::default();

        for step in 1..=steps {
            let step_start = Instant::now();
            let batch = source.next_batch(Split::Train, batch_size)?;

            let gen_start = Instant::now();
            self.train_attacks.new_batch();
            let generated = {
                let targets = attack_targets(
                    self.student.as_ref(),
                    self.teacher.as_deref(),
                    &self.additional,
                );
                self.train_attacks.generate_for_model(
                    &targets,
                    self.student.namescope(),
                    &batch.augmented,
                    &batch.labels,
                    &batch.seeds,
                )?
            };
            let variants = VariantExpander.expand(&batch.labels, generated)?;
            timing.generation += gen_start.elapsed().as_secs_f64();

            let run_start = Instant::now();
            let teacher_logits = self.teacher_logits(&batch)?;
            let composer = &self.composer;
            let reports = self.accumulator.apply(
                self.student.as_mut(),
                self.optimizer.as_mut(),
                lr,
                &variants,
                |model, variant| composer.compose(model, variant, teacher_logits.as_ref()),
            )?;
            for report in &reports {
                self.metrics.record(&report.metrics)?;
            }
            timing.run += run_start.elapsed().as_secs_f64();
            timing.total += step_start.elapsed().as_secs_f64();

            if step % print_every == 0 {
                let means = self.metrics.mean();
                debug!(
                    "Epoch {epoch} step {step}/{steps}: {} variant(s); student accuracy: {:.2} %; teacher accuracy: {:.2} %",
                    variants.len(),
                    means[STUDENT_ACCURACY] * 100.0,
                    means[TEACHER_ACCURACY] * 100.0
                );
            }
        }
        Ok(timing)
    }

    /// Soft-target source logits for one batch, when distilling
    fn teacher_logits(&self, batch: &Batch) -> Result<Option<Array2<f32>>> {
        if !self.composer.distilling() {
            return Ok(None);
        }
        let loss = self.config.loss();
        let images = if loss.use_augmented {
            &batch.augmented
        } else {
            &batch.clean
        };
        let model: &dyn Model = if loss.self_distill {
            self.student.as_ref()
        } else {
            self.teacher.as_deref().ok_or_else(|| {
                Error::ConfigError("distillation needs a teacher model".to_string())
            })?
        };
        Ok(Some(model.forward(&flatten_images(images))?.logits))
    }

    fn observe_threshold(&mut self, accuracies: &[f32]) {
        let Some(schedule) = self.threshold_schedule.as_mut() else {
            return;
        };
        if schedule.current().is_none() {
            return;
        }
        schedule.observe(accuracies);
        match schedule.current() {
            Some(threshold) => debug!("Threshold: {threshold}"),
            None => info!("Threshold schedule finished; threshold frozen"),
        }
    }

    fn log_epoch(&self, epoch: usize, steps: usize, timing: EpochTiming) {
        let per_batch = |secs: f64| secs / steps.max(1) as f64;
        info!(
            "{}: Epoch {}; (average) loss: {:.3}; (average) student accuracy: {:.2} %; (average) teacher accuracy: {:.2} %. {:.3} sec/batch; gen time: {:.3} sec/batch; run time: {:.3} sec/batch; {}",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            epoch,
            self.metrics.get("loss").unwrap_or_default(),
            self.metrics.get("acc").unwrap_or_default() * 100.0,
            self.metrics.get("tea_acc").unwrap_or_default() * 100.0,
            per_batch(timing.total),
            per_batch(timing.generation),
            per_batch(timing.run),
            self.metrics.describe(&["acc", "tea_acc", "loss"])
        );
    }

    fn save_checkpoint(&self, name: &str, epoch: usize) -> Result<()> {
        let Some(dir) = &self.config.training().train_dir else {
            return Ok(());
        };
        let path = save_model(
            self.student.as_ref(),
            dir.join(name),
            Some(epoch),
            &self.save_config,
        )?;
        info!("Saved checkpoint to {}", path.display());
        Ok(())
    }
}

/// Every model an attack may target, keyed by namescope
fn attack_targets<'a>(
    student: &'a dyn Model,
    teacher: Option<&'a dyn Model>,
    additional: &'a [Box<dyn Model>],
) -> AttackTargets<'a> {
    let mut targets = AttackTargets::new().with(student.namescope(), student);
    if let Some(teacher) = teacher {
        targets = targets.with(teacher.namescope(), teacher);
    }
    for model in additional {
        targets = targets.with(model.namescope(), model.as_ref());
    }
    targets
}
