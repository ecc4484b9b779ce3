//! Running per-epoch metric accumulation

use crate::{Error, Result};
use std::fmt::Write;

/// Running mean of per-variant metric vectors, reset every epoch
#[derive(Clone, Debug)]
pub struct EpochMetrics {
    names: Vec<String>,
    sums: Vec<f64>,
    count: usize,
}

impl EpochMetrics {
    pub fn new(names: Vec<String>) -> Self {
        let sums = vec![0.0; names.len()];
        Self {
            names,
            sums,
            count: 0,
        }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Number of vectors recorded since the last reset
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn record(&mut self, values: &[f32]) -> Result<()> {
        if values.len() != self.names.len() {
            return Err(Error::ShapeMismatch {
                expected: vec![self.names.len()],
                got: vec![values.len()],
            });
        }
        for (sum, &value) in self.sums.iter_mut().zip(values) {
            *sum += f64::from(value);
        }
        self.count += 1;
        Ok(())
    }

    /// Mean of every metric; zeros before anything is recorded
    pub fn mean(&self) -> Vec<f32> {
        let count = self.count.max(1) as f64;
        self.sums.iter().map(|&s| (s / count) as f32).collect()
    }

    pub fn get(&self, name: &str) -> Option<f32> {
        let index = self.names.iter().position(|n| n == name)?;
        Some(self.mean()[index])
    }

    pub fn reset(&mut self) {
        self.sums.iter_mut().for_each(|s| *s = 0.0);
        self.count = 0;
    }

    /// `name: value` pairs for every metric not named in `skip`
    pub fn describe(&self, skip: &[&str]) -> String {
        let mut out = String::new();
        for (name, value) in self.names.iter().zip(self.mean()) {
            if skip.contains(&name.as_str()) {
                continue;
            }
            if !out.is_empty() {
                out.push_str("; ");
            }
            let _ = write!(out, "{name}: {value:.3}");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics() -> EpochMetrics {
        EpochMetrics::new(vec!["acc".into(), "tea_acc".into(), "loss".into()])
    }

    #[test]
    fn test_mean_of_recorded_vectors() {
        let mut m = metrics();
        m.record(&[1.0, 0.5, 2.0]).unwrap();
        m.record(&[0.0, 0.5, 4.0]).unwrap();
        assert_eq!(m.count(), 2);
        assert_eq!(m.mean(), vec![0.5, 0.5, 3.0]);
        assert_eq!(m.get("loss"), Some(3.0));
        assert_eq!(m.get("missing"), None);
    }

    #[test]
    fn test_reset_clears_state() {
        let mut m = metrics();
        m.record(&[1.0, 1.0, 1.0]).unwrap();
        m.reset();
        assert_eq!(m.count(), 0);
        assert_eq!(m.mean(), vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let mut m = metrics();
        assert!(m.record(&[1.0]).is_err());
    }

    #[test]
    fn test_describe_skips_named() {
        let mut m = metrics();
        m.record(&[1.0, 0.5, 0.25]).unwrap();
        assert_eq!(m.describe(&["acc", "tea_acc"]), "loss: 0.250");
        assert_eq!(m.describe(&["acc"]), "tea_acc: 0.500; loss: 0.250");
    }
}
