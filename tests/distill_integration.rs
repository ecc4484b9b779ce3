//! End-to-end distillation runs on a tiny linearly separable problem
//!
//! Run with: cargo test --test distill_integration

use destilar::attack::{AttackKind, AttackSpec, GeneratedVariants};
use destilar::config::{
    build_trainer, AccumulationMode, DistillConfig, DistillSpec, LossSpec, Rates, ScheduleSpec,
};
use destilar::data::{one_hot, InMemoryDataSource, PixelRange};
use destilar::io::{save_model, CheckpointSpec, RunMode, SaveConfig};
use destilar::model::LinearClassifier;
use destilar::optim::SGD;
use destilar::train::{
    DistillTrainer, GradientAccumulator, LossComposer, RunOutcome, StopReason, VariantExpander,
    STUDENT_ACCURACY, TEACHER_ACCURACY,
};
use destilar::{Model, Param};
use ndarray::{array, Array4};
use std::path::Path;
use tempfile::TempDir;

const RANGE: PixelRange = PixelRange { min: 0.0, max: 1.0 };

/// Class 0 is bright, class 1 is dark
fn toy_source(n: usize) -> InMemoryDataSource {
    let images = Array4::from_shape_fn((n, 1, 2, 1), |(i, _, w, _)| {
        let base = if i % 2 == 0 { 0.8 } else { 0.2 };
        base + 0.01 * (i % 5) as f32 + 0.05 * w as f32
    });
    let classes: Vec<usize> = (0..n).map(|i| i % 2).collect();
    let labels = one_hot(&classes, 2).unwrap();
    InMemoryDataSource::new(images.clone(), labels.clone(), images, labels)
        .unwrap()
        .with_pixel_range(RANGE)
        .with_seed(17)
}

/// Confident, correct teacher saved under namescope `tea`
fn save_teacher(dir: &Path) {
    let mut teacher = LinearClassifier::new("tea", 2, 2);
    teacher.params_mut()[0].assign(&[5.0, 5.0, -5.0, -5.0]).unwrap();
    teacher.params_mut()[1].assign(&[-5.0, 5.0]).unwrap();
    save_model(&teacher, dir, None, &SaveConfig::default()).unwrap();
}

fn save_student(dir: &Path) {
    let student = LinearClassifier::new("stu", 2, 2);
    save_model(&student, dir, None, &SaveConfig::default()).unwrap();
}

fn base_spec(teacher_dir: &Path, student_dir: &Path) -> DistillSpec {
    let mut spec = DistillSpec::default();
    spec.data.batch_size = 4;
    spec.data.pixel_range = RANGE;
    spec.optimizer.lr = 0.5;
    spec.distill = LossSpec {
        alpha: 0.5,
        theta: 0.5,
        temperature: 1.0,
        ..LossSpec::default()
    };
    spec.training.epochs = 8;
    spec.checkpoints.teacher = CheckpointSpec::at(teacher_dir).with_namescope("tea");
    spec.checkpoints.student = CheckpointSpec::at(student_dir);
    spec
}

fn checkpoints() -> (TempDir, TempDir) {
    let teacher = TempDir::new().unwrap();
    let student = TempDir::new().unwrap();
    save_teacher(teacher.path());
    save_student(student.path());
    (teacher, student)
}

#[test]
fn distillation_reaches_teacher_accuracy() {
    let (teacher_dir, student_dir) = checkpoints();
    let spec = base_spec(teacher_dir.path(), student_dir.path());
    let mut trainer = build_trainer(DistillConfig::new(spec).unwrap(), 2, 2).unwrap();
    let mut source = toy_source(16);

    let RunOutcome::Trained(result) = trainer.start(RunMode::Train, &mut source).unwrap() else {
        panic!("expected a training result");
    };

    assert_eq!(result.stop, StopReason::EpochLimit);
    assert_eq!(result.epochs_run(), 8);

    let accuracy = result.student_accuracy();
    assert!(accuracy.last().unwrap() >= accuracy.first().unwrap());
    assert_eq!(*accuracy.last().unwrap(), 1.0);
    assert!(result
        .history
        .iter()
        .all(|e| e.metrics[TEACHER_ACCURACY] == 1.0));

    let last = result.history.last().unwrap();
    assert_eq!(last.validation.as_ref().unwrap()[0], 1.0);
    assert_eq!(result.best_accuracy, Some(1.0));
}

#[test]
fn accumulated_variants_match_single_variant_step() {
    // zero-mean columns keep the running statistics at zero
    let labels = array![[1.0, 0.0], [0.0, 1.0]];
    let images = Array4::from_shape_vec((2, 1, 2, 1), vec![1.0, -1.0, -1.0, 1.0]).unwrap();
    let composer = LossComposer::new(&LossSpec {
        alpha: 0.0,
        theta: 1.0,
        ..LossSpec::default()
    })
    .unwrap();

    let run = |copies: usize, mode: AccumulationMode| -> Vec<Param> {
        let mut generated = GeneratedVariants::new();
        for i in 0..copies {
            generated.push(format!("copy{i}"), images.clone());
        }
        let variants = VariantExpander.expand(&labels, generated).unwrap();
        let mut model = LinearClassifier::new("stu", 2, 2).with_seed(4, 0.2);
        let mut optimizer = SGD::new(0.3, 0.0);
        GradientAccumulator::new(mode)
            .apply(&mut model, &mut optimizer, 0.3, &variants, |m, v| {
                composer.compose(m, v, None)
            })
            .unwrap();
        model.params().to_vec()
    };

    let accumulated = run(3, AccumulationMode::Accumulate);
    let single = run(1, AccumulationMode::Direct);
    for (a, b) in accumulated.iter().zip(&single) {
        for (x, y) in a.data().iter().zip(b.data().iter()) {
            assert!((x - y).abs() < 1e-5, "{}: {x} vs {y}", a.name());
        }
    }
}

#[test]
fn plateaued_schedule_stops_training_early() {
    let (teacher_dir, student_dir) = checkpoints();
    let mut spec = base_spec(teacher_dir.path(), student_dir.path());
    spec.training.epochs = 100;
    spec.training.no_init_test = true;
    spec.training.lr_schedule = ScheduleSpec {
        patience: Some(1),
        decay_factor: 0.5,
        max_decays: 1,
        ..ScheduleSpec::default()
    };
    let mut trainer = build_trainer(DistillConfig::new(spec).unwrap(), 2, 2).unwrap();
    let mut source = toy_source(16);

    let RunOutcome::Trained(result) = trainer.start(RunMode::Train, &mut source).unwrap() else {
        panic!("expected a training result");
    };
    assert_eq!(result.stop, StopReason::ScheduleExhausted);
    assert!(result.epochs_run() < 100);

    let rates: Vec<f32> = result.history.iter().map(|e| e.lr).collect();
    assert_eq!(rates[0], 0.5);
    assert!(rates.iter().any(|&lr| lr == 0.25));
}

#[test]
fn adversarial_training_with_fgsm_variants() {
    let (teacher_dir, student_dir) = checkpoints();
    let mut spec = base_spec(teacher_dir.path(), student_dir.path());
    spec.training.epochs = 3;
    spec.training.accumulation = AccumulationMode::Accumulate;
    spec.attacks.train = vec![
        AttackSpec::new("clean", AttackKind::Clean),
        AttackSpec::new("fgsm", AttackKind::Fgsm { epsilon: 0.05 }),
    ];
    spec.attacks.test = vec![AttackSpec::new("fgsm", AttackKind::Fgsm { epsilon: 0.05 })];

    let mut trainer = build_trainer(DistillConfig::new(spec).unwrap(), 2, 2).unwrap();
    let mut source = toy_source(16);
    let RunOutcome::Trained(result) = trainer.start(RunMode::Train, &mut source).unwrap() else {
        panic!("expected a training result");
    };

    assert_eq!(result.epochs_run(), 3);
    // clean accuracy plus one entry per test attack
    let validation = result.history[0].validation.as_ref().unwrap();
    assert_eq!(validation.len(), 2);
    assert!(result
        .history
        .iter()
        .all(|e| (0.0..=1.0).contains(&e.metrics[STUDENT_ACCURACY])));
}

#[test]
fn test_mode_reports_saltpepper_rounds() {
    let (teacher_dir, student_dir) = checkpoints();
    let mut spec = base_spec(teacher_dir.path(), student_dir.path());
    spec.test.saltpepper = Some(Rates::Many(vec![0.0, 0.5]));

    let mut trainer = build_trainer(DistillConfig::new(spec).unwrap(), 2, 2).unwrap();
    let mut source = toy_source(8);
    let RunOutcome::Tested(reports) = trainer.start(RunMode::Test, &mut source).unwrap() else {
        panic!("expected test reports");
    };

    assert_eq!(reports.len(), 3);
    assert_eq!(reports[0].name, "test");
    // teacher restored from its checkpoint classifies clean data perfectly
    assert_eq!(reports[0].teacher_accuracy, 1.0);
    assert_eq!(reports[1].teacher_accuracy, 1.0);
}

#[test]
fn self_distillation_trains_without_teacher_checkpoint() {
    let student_dir = TempDir::new().unwrap();
    save_student(student_dir.path());

    let mut spec = DistillSpec::default();
    spec.data.batch_size = 4;
    spec.data.pixel_range = RANGE;
    spec.distill.alpha = 0.5;
    spec.distill.self_distill = true;
    spec.training.epochs = 2;
    spec.checkpoints.student = CheckpointSpec::at(student_dir.path());

    let config = DistillConfig::new(spec).unwrap();
    assert!(!config.needs_teacher());
    let mut trainer = DistillTrainer::new(
        config,
        Box::new(LinearClassifier::new("stu", 2, 2)),
        Box::new(SGD::new(0.1, 0.9)),
    )
    .unwrap();
    let mut source = toy_source(8);
    let outcome = trainer.start(RunMode::Train, &mut source).unwrap();
    assert!(matches!(outcome, RunOutcome::Trained(r) if r.epochs_run() == 2));
}
