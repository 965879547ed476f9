//! Descriptive statistics and hypothesis tests over per-cluster samples.

pub mod dist;
pub mod hypothesis;

use serde::Serialize;

/// Observations of one group (condition), e.g. cell densities of every sample.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub name: String,
    pub values: Vec<f64>,
}

impl Sample {
    pub fn new(name: impl Into<String>, values: Vec<f64>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }

    pub fn n(&self) -> usize {
        self.values.len()
    }

    pub fn mean(&self) -> f64 {
        mean(&self.values)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupSummary {
    pub name: String,
    pub n: usize,
    pub mean: f64,
    pub sd: f64,
    pub sem: f64,
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample variance (ddof = 1); NaN for fewer than two values.
pub fn variance(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return f64::NAN;
    }
    let m = mean(values);
    values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64
}

pub fn summarize(sample: &Sample) -> GroupSummary {
    let n = sample.n();
    let sd = variance(&sample.values).sqrt();
    GroupSummary {
        name: sample.name.clone(),
        n,
        mean: sample.mean(),
        sd,
        sem: sd / (n as f64).sqrt(),
    }
}
