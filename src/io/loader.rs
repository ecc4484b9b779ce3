//! Namescope-aware checkpoint restoring
//!
//! A model parameter named `{model_scope}/{rest}` is looked up in a source
//! checkpoint as `{source_scope}/{rest}`. Parameters whose model-side name
//! matches the exclusion pattern are left untouched.

use super::checkpoint::Checkpoint;
use super::load::load_checkpoint;
use crate::{Error, Model, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Where one model role is restored from
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointSpec {
    /// Checkpoint file or directory
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Namescope the tensors were saved under, when it differs from the model's
    #[serde(default)]
    pub namescope: Option<String>,

    /// Regex over model parameter names to skip
    #[serde(default)]
    pub exclude: Option<String>,
}

impl CheckpointSpec {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::default()
        }
    }

    pub fn with_namescope(mut self, namescope: impl Into<String>) -> Self {
        self.namescope = Some(namescope.into());
        self
    }

    pub fn with_exclude(mut self, pattern: impl Into<String>) -> Self {
        self.exclude = Some(pattern.into());
        self
    }
}

/// A resolved checkpoint source
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointSource {
    pub path: PathBuf,
    pub namescope: Option<String>,
}

/// Which parameters a restore touched
#[derive(Debug, Clone, Default)]
pub struct RestoreReport {
    pub restored: Vec<String>,
    pub excluded: Vec<String>,
}

/// Restores model parameters from one or more checkpoints
#[derive(Debug, Clone, Default)]
pub struct CheckpointLoader {
    exclude: Option<Regex>,
}

impl CheckpointLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Skip model parameters whose names match `pattern`
    pub fn with_exclude(mut self, pattern: &str) -> Result<Self> {
        let regex = Regex::new(pattern)
            .map_err(|e| Error::ConfigError(format!("invalid exclude pattern '{pattern}': {e}")))?;
        self.exclude = Some(regex);
        Ok(self)
    }

    /// Build a loader from an optional pattern
    pub fn excluding(pattern: Option<&str>) -> Result<Self> {
        match pattern {
            Some(p) => Self::new().with_exclude(p),
            None => Ok(Self::new()),
        }
    }

    /// Restore from checkpoint files
    pub fn restore(
        &self,
        model: &mut dyn Model,
        sources: &[CheckpointSource],
    ) -> Result<RestoreReport> {
        let checkpoints = sources
            .iter()
            .map(|s| Ok((load_checkpoint(&s.path)?, s.namescope.clone())))
            .collect::<Result<Vec<_>>>()?;
        let report = self.restore_from(model, &checkpoints)?;
        for source in sources {
            tracing::info!(
                model = model.namescope(),
                path = %source.path.display(),
                namescope = source.namescope.as_deref().unwrap_or(model.namescope()),
                "restored checkpoint"
            );
        }
        Ok(report)
    }

    /// Restore from checkpoints already in memory
    ///
    /// Each entry pairs a checkpoint with the namescope its tensors were saved
    /// under (`None` keeps the model's own namescope). When several sources
    /// hold the same tensor the later one wins. Every non-excluded parameter
    /// must be found in at least one source.
    pub fn restore_from(
        &self,
        model: &mut dyn Model,
        checkpoints: &[(Checkpoint, Option<String>)],
    ) -> Result<RestoreReport> {
        let scope = model.namescope().to_string();
        let mut report = RestoreReport::default();

        for param in model.params_mut() {
            let name = param.name().to_string();
            if self.exclude.as_ref().is_some_and(|re| re.is_match(&name)) {
                report.excluded.push(name);
                continue;
            }

            let found = checkpoints.iter().rev().find_map(|(ckpt, src_scope)| {
                let key = remap(&name, &scope, src_scope.as_deref());
                ckpt.get(&key).map(|t| (key, t))
            });
            let Some((key, tensor)) = found else {
                return Err(Error::MissingCheckpoint(format!(
                    "parameter {name} not found in any checkpoint source"
                )));
            };
            if tensor.shape != param.shape() {
                return Err(Error::ShapeMismatch {
                    expected: param.shape().to_vec(),
                    got: tensor.shape.clone(),
                });
            }
            param.assign(&tensor.data)?;
            tracing::debug!(param = %name, from = %key, "restored parameter");
            report.restored.push(name);
        }
        Ok(report)
    }
}

/// Translate a model parameter name into the name stored under `source_scope`
pub fn remap(name: &str, model_scope: &str, source_scope: Option<&str>) -> String {
    let Some(source_scope) = source_scope else {
        return name.to_string();
    };
    match name
        .strip_prefix(model_scope)
        .and_then(|rest| rest.strip_prefix('/'))
    {
        Some(rest) if source_scope.is_empty() => rest.to_string(),
        Some(rest) => format!("{source_scope}/{rest}"),
        None => name.to_string(),
    }
}

/// Run mode for role resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Train,
    Test,
}

/// Checkpoint specs for every model role
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRoles {
    #[serde(default)]
    pub teacher: CheckpointSpec,
    #[serde(default)]
    pub student: CheckpointSpec,
    #[serde(default)]
    pub denoiser: CheckpointSpec,
    #[serde(default)]
    pub additional: Vec<NamedCheckpointSpec>,
}

/// Checkpoint spec for an additional named model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedCheckpointSpec {
    pub name: String,
    #[serde(flatten)]
    pub spec: CheckpointSpec,
}

/// Inputs to role resolution that come from the rest of the configuration
#[derive(Debug, Clone, Copy)]
pub struct RoleRequirements<'a> {
    pub mode: RunMode,
    /// Distillation weight is non-zero
    pub distilling: bool,
    pub self_distill: bool,
    pub use_denoiser: bool,
    /// The teacher model's own namescope
    pub teacher_namescope: &'a str,
}

/// Resolved sources for one role
#[derive(Debug, Clone, PartialEq)]
pub struct RoleRestore {
    pub sources: Vec<CheckpointSource>,
    pub exclude: Option<String>,
}

/// Resolved restore plan for a run
#[derive(Debug, Clone, PartialEq)]
pub struct RestorePlan {
    pub teacher: Option<RoleRestore>,
    pub student: RoleRestore,
    pub additional: Vec<(String, RoleRestore)>,
}

impl CheckpointRoles {
    /// Resolve role sources, failing when a mandatory role has none
    ///
    /// The teacher is mandatory when distilling without self-distillation;
    /// in test mode at least one of teacher and student must be given. A
    /// missing student source falls back to the teacher checkpoint, read
    /// under the teacher's load namescope or else the teacher's namescope.
    pub fn resolve(&self, req: RoleRequirements<'_>) -> Result<RestorePlan> {
        match req.mode {
            RunMode::Test if self.teacher.path.is_none() && self.student.path.is_none() => {
                return Err(Error::MissingCheckpoint(
                    "must supply a teacher or student checkpoint when testing".to_string(),
                ));
            }
            RunMode::Train if req.distilling && !req.self_distill && self.teacher.path.is_none() => {
                return Err(Error::MissingCheckpoint(
                    "must supply a teacher checkpoint for distillation training".to_string(),
                ));
            }
            _ => {}
        }

        let teacher = self.teacher.path.as_ref().map(|path| RoleRestore {
            sources: vec![CheckpointSource {
                path: path.clone(),
                namescope: self.teacher.namescope.clone(),
            }],
            exclude: self.teacher.exclude.clone(),
        });

        let student_source = match (&self.student.path, &self.teacher.path) {
            (Some(path), _) => CheckpointSource {
                path: path.clone(),
                namescope: self.student.namescope.clone(),
            },
            (None, Some(path)) => CheckpointSource {
                path: path.clone(),
                namescope: Some(
                    self.teacher
                        .namescope
                        .clone()
                        .unwrap_or_else(|| req.teacher_namescope.to_string()),
                ),
            },
            (None, None) => {
                return Err(Error::MissingCheckpoint(
                    "must supply a student checkpoint when not distilling from a teacher"
                        .to_string(),
                ));
            }
        };

        let mut student_sources = Vec::with_capacity(2);
        if req.use_denoiser {
            let path = self.denoiser.path.clone().ok_or_else(|| {
                Error::MissingCheckpoint("use_denoiser is set but no denoiser checkpoint".to_string())
            })?;
            student_sources.push(CheckpointSource {
                path,
                namescope: self.denoiser.namescope.clone(),
            });
        }
        student_sources.push(student_source);

        let additional = self
            .additional
            .iter()
            .map(|named| {
                let path = named.spec.path.clone().ok_or_else(|| {
                    Error::MissingCheckpoint(format!(
                        "additional model '{}' has no checkpoint path",
                        named.name
                    ))
                })?;
                Ok((
                    named.name.clone(),
                    RoleRestore {
                        sources: vec![CheckpointSource {
                            path,
                            namescope: named.spec.namescope.clone(),
                        }],
                        exclude: named.spec.exclude.clone(),
                    },
                ))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(RestorePlan {
            teacher,
            student: RoleRestore {
                sources: student_sources,
                exclude: self.student.exclude.clone(),
            },
            additional,
        })
    }
}

impl RoleRestore {
    /// Restore `model` from this role's sources
    pub fn apply(&self, model: &mut dyn Model) -> Result<RestoreReport> {
        CheckpointLoader::excluding(self.exclude.as_deref())?.restore(model, &self.sources)
    }
}
