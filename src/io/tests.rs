//! Restore tests across files, namescopes and roles

use super::*;
use crate::model::LinearClassifier;
use crate::Model;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Three-parameter model (weight, bias, moving mean) filled with `value`
fn filled(scope: &str, value: f32) -> LinearClassifier {
    let mut model = LinearClassifier::new(scope, 2, 2);
    for param in model.params_mut() {
        param.data_mut().fill(value);
    }
    model
}

fn saved(dir: &Path, name: &str, model: &LinearClassifier) -> PathBuf {
    save_model(model, dir.join(name), None, &SaveConfig::default()).unwrap()
}

fn changed(before: &LinearClassifier, after: &LinearClassifier) -> usize {
    before
        .params()
        .iter()
        .zip(after.params())
        .filter(|(a, b)| a.data() != b.data())
        .count()
}

#[test]
fn test_exclusion_leaves_matching_params_unchanged() {
    let dir = TempDir::new().unwrap();
    let path = saved(dir.path(), "src", &filled("stu", 1.0));

    let mut model = filled("stu", 0.0);
    assert_eq!(model.params().len(), 3);
    let before = model.clone();

    let loader = CheckpointLoader::new().with_exclude("moving_mean$").unwrap();
    let report = loader
        .restore(
            &mut model,
            &[CheckpointSource {
                path,
                namescope: None,
            }],
        )
        .unwrap();

    assert_eq!(changed(&before, &model), 2);
    assert_eq!(report.restored.len(), 2);
    assert_eq!(report.excluded, vec!["stu/input_norm/moving_mean".to_string()]);
    assert!(model.params()[2].data().iter().all(|&v| v == 0.0));
}

#[test]
fn test_namescope_remap_reads_teacher_tensors() {
    let dir = TempDir::new().unwrap();
    let path = saved(dir.path(), "teacher", &filled("tea", 3.0));

    let mut student = filled("stu", 0.0);
    CheckpointLoader::new()
        .restore(
            &mut student,
            &[CheckpointSource {
                path,
                namescope: Some("tea".to_string()),
            }],
        )
        .unwrap();
    assert!(student.params().iter().all(|p| p.data().iter().all(|&v| v == 3.0)));
}

#[test]
fn test_missing_tensor_is_an_error() {
    let dir = TempDir::new().unwrap();
    let path = saved(dir.path(), "teacher", &filled("tea", 3.0));
    let mut student = filled("stu", 0.0);
    let result = CheckpointLoader::new().restore(
        &mut student,
        &[CheckpointSource {
            path,
            namescope: None,
        }],
    );
    assert!(matches!(result, Err(crate::Error::MissingCheckpoint(_))));
}

#[test]
fn test_shape_mismatch_is_an_error() {
    let source = Checkpoint::from_model(&LinearClassifier::new("stu", 3, 2), None);
    let mut model = LinearClassifier::new("stu", 2, 2);
    let result = CheckpointLoader::new().restore_from(&mut model, &[(source, None)]);
    assert!(matches!(result, Err(crate::Error::ShapeMismatch { .. })));
}

#[test]
fn test_later_source_wins() {
    let first = Checkpoint::from_model(&filled("den", 1.0), None);
    let second = Checkpoint::from_model(&filled("stu", 2.0), None);
    let mut model = filled("stu", 0.0);
    CheckpointLoader::new()
        .restore_from(&mut model, &[(first, Some("den".to_string())), (second, None)])
        .unwrap();
    assert!(model.params().iter().all(|p| p.data()[0] == 2.0));
}

#[test]
fn test_invalid_exclude_pattern() {
    assert!(CheckpointLoader::new().with_exclude("(unclosed").is_err());
}

#[test]
fn test_remap() {
    assert_eq!(remap("stu/dense/w", "stu", Some("tea")), "tea/dense/w");
    assert_eq!(remap("stu/dense/w", "stu", Some("")), "dense/w");
    assert_eq!(remap("stu/dense/w", "stu", None), "stu/dense/w");
    assert_eq!(remap("other/w", "stu", Some("tea")), "other/w");
    assert_eq!(remap("student/w", "stu", Some("tea")), "student/w");
}

fn requirements(mode: RunMode, distilling: bool) -> RoleRequirements<'static> {
    RoleRequirements {
        mode,
        distilling,
        self_distill: false,
        use_denoiser: false,
        teacher_namescope: "tea",
    }
}

#[test]
fn test_teacher_required_when_distilling() {
    let roles = CheckpointRoles {
        student: CheckpointSpec::at("stu.safetensors"),
        ..CheckpointRoles::default()
    };
    assert!(roles.resolve(requirements(RunMode::Train, true)).is_err());

    let mut self_distill = requirements(RunMode::Train, true);
    self_distill.self_distill = true;
    assert!(roles.resolve(self_distill).is_ok());
}

#[test]
fn test_student_falls_back_to_teacher_checkpoint() {
    let roles = CheckpointRoles {
        teacher: CheckpointSpec::at("tea.safetensors"),
        ..CheckpointRoles::default()
    };
    let plan = roles.resolve(requirements(RunMode::Train, true)).unwrap();
    assert_eq!(
        plan.student.sources,
        vec![CheckpointSource {
            path: PathBuf::from("tea.safetensors"),
            namescope: Some("tea".to_string()),
        }]
    );

    let roles = CheckpointRoles {
        teacher: CheckpointSpec::at("tea.safetensors").with_namescope("resnet"),
        ..CheckpointRoles::default()
    };
    let plan = roles.resolve(requirements(RunMode::Train, true)).unwrap();
    assert_eq!(plan.student.sources[0].namescope.as_deref(), Some("resnet"));
}

#[test]
fn test_student_required_without_distillation() {
    let roles = CheckpointRoles::default();
    assert!(matches!(
        roles.resolve(requirements(RunMode::Train, false)),
        Err(crate::Error::MissingCheckpoint(_))
    ));
}

#[test]
fn test_test_mode_needs_teacher_or_student() {
    assert!(CheckpointRoles::default()
        .resolve(requirements(RunMode::Test, false))
        .is_err());
    let roles = CheckpointRoles {
        student: CheckpointSpec::at("stu.safetensors"),
        ..CheckpointRoles::default()
    };
    let plan = roles.resolve(requirements(RunMode::Test, true)).unwrap();
    assert!(plan.teacher.is_none());
}

#[test]
fn test_denoiser_restores_two_sources() {
    let roles = CheckpointRoles {
        teacher: CheckpointSpec::at("tea.safetensors"),
        denoiser: CheckpointSpec::at("den.safetensors").with_namescope("den"),
        ..CheckpointRoles::default()
    };
    let mut req = requirements(RunMode::Train, true);
    req.use_denoiser = true;
    let plan = roles.resolve(req).unwrap();
    assert_eq!(plan.student.sources.len(), 2);
    assert_eq!(plan.student.sources[0].path, PathBuf::from("den.safetensors"));

    let roles = CheckpointRoles {
        teacher: CheckpointSpec::at("tea.safetensors"),
        ..CheckpointRoles::default()
    };
    assert!(roles.resolve(req).is_err());
}

#[test]
fn test_additional_models_need_paths() {
    let roles = CheckpointRoles {
        teacher: CheckpointSpec::at("tea.safetensors"),
        additional: vec![NamedCheckpointSpec {
            name: "surrogate".to_string(),
            spec: CheckpointSpec::default(),
        }],
        ..CheckpointRoles::default()
    };
    assert!(roles.resolve(requirements(RunMode::Train, true)).is_err());
}

#[test]
fn test_roles_parse_from_yaml() {
    let yaml = r#"
teacher:
  path: runs/teacher
  namescope: tea
student:
  exclude: "logits"
additional:
  - name: surrogate
    path: runs/surrogate
"#;
    let roles: CheckpointRoles = serde_yaml::from_str(yaml).unwrap();
    assert_eq!(roles.teacher.namescope.as_deref(), Some("tea"));
    assert_eq!(roles.student.exclude.as_deref(), Some("logits"));
    assert_eq!(roles.additional[0].spec.path, Some(PathBuf::from("runs/surrogate")));
}
