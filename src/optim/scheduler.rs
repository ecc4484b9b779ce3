//! Feedback-driven schedule controllers
//!
//! A schedule controller yields the next value of a scheduled scalar (the
//! learning rate, or a secondary threshold) and is fed the validation
//! accuracy vector once per validation round. When it returns `None` the
//! schedule is exhausted.

use serde::{Deserialize, Serialize};

/// How a validation accuracy vector is reduced to one score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reduce {
    /// Mean over clean and per-attack accuracy
    #[default]
    Mean,
    /// Clean accuracy only
    First,
    /// Worst-case accuracy over clean and every attack
    Min,
}

impl Reduce {
    pub fn apply(&self, values: &[f32]) -> Option<f32> {
        if values.is_empty() {
            return None;
        }
        Some(match self {
            Reduce::Mean => values.iter().sum::<f32>() / values.len() as f32,
            Reduce::First => values[0],
            Reduce::Min => values.iter().copied().fold(f32::INFINITY, f32::min),
        })
    }
}

/// Result of feeding one validation round to a controller
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduleFeedback {
    /// This round is the best seen so far
    pub is_best: bool,
    /// Value to use next, `None` once the schedule is exhausted
    pub value: Option<f32>,
}

/// Schedule controller contract
pub trait ScheduleController {
    /// Current value, or `None` when the schedule has stopped
    fn current(&self) -> Option<f32>;

    /// Feed one validation round's accuracy vector
    fn observe(&mut self, accuracies: &[f32]) -> ScheduleFeedback;
}

/// Reduce-on-plateau schedule with a bounded number of decays
///
/// After `patience` rounds without improving on the best score by more than
/// `min_delta`, the value is multiplied by `decay_factor`. Once `max_decays`
/// decays have happened, the next plateau stops the schedule. Without a
/// patience the value stays constant and never stops.
#[derive(Debug, Clone)]
pub struct PlateauSchedule {
    value: f32,
    decay_factor: f32,
    patience: Option<usize>,
    max_decays: usize,
    min_delta: f32,
    reduce: Reduce,
    best: Option<f32>,
    stale_rounds: usize,
    decays: usize,
    stopped: bool,
}

impl PlateauSchedule {
    /// Constant schedule at `initial`
    pub fn new(initial: f32) -> Self {
        Self {
            value: initial,
            decay_factor: 1.0,
            patience: None,
            max_decays: 0,
            min_delta: 0.0,
            reduce: Reduce::Mean,
            best: None,
            stale_rounds: 0,
            decays: 0,
            stopped: false,
        }
    }

    /// Decay by `factor` after `patience` stale rounds
    pub fn with_decay(mut self, factor: f32, patience: usize) -> Self {
        self.decay_factor = factor;
        self.patience = Some(patience.max(1));
        self
    }

    pub fn with_max_decays(mut self, max_decays: usize) -> Self {
        self.max_decays = max_decays;
        self
    }

    pub fn with_min_delta(mut self, min_delta: f32) -> Self {
        self.min_delta = min_delta;
        self
    }

    pub fn with_reduce(mut self, reduce: Reduce) -> Self {
        self.reduce = reduce;
        self
    }

    pub fn best(&self) -> Option<f32> {
        self.best
    }

    pub fn decays(&self) -> usize {
        self.decays
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }
}

impl ScheduleController for PlateauSchedule {
    fn current(&self) -> Option<f32> {
        (!self.stopped).then_some(self.value)
    }

    fn observe(&mut self, accuracies: &[f32]) -> ScheduleFeedback {
        let Some(score) = self.reduce.apply(accuracies) else {
            return ScheduleFeedback {
                is_best: false,
                value: self.current(),
            };
        };

        let improved = match self.best {
            None => true,
            Some(best) => score > best + self.min_delta,
        };
        if improved {
            self.best = Some(score);
            self.stale_rounds = 0;
        } else {
            self.stale_rounds += 1;
        }

        if let Some(patience) = self.patience {
            if !self.stopped && self.stale_rounds >= patience {
                if self.decays < self.max_decays {
                    self.decays += 1;
                    self.value *= self.decay_factor;
                    self.stale_rounds = 0;
                    tracing::info!(
                        decay = self.decays,
                        value = self.value,
                        "validation accuracy plateaued, decaying schedule"
                    );
                } else {
                    self.stopped = true;
                    tracing::info!("validation accuracy plateaued, schedule exhausted");
                }
            }
        }

        ScheduleFeedback {
            is_best: improved,
            value: self.current(),
        }
    }
}
