// SPDX-License-Identifier: PMPL-1.0-or-later

//! Baseline learning and anomaly scoring.

mod anomaly;
mod baseline;

pub use anomaly::{
    severity_for, Analysis, Analyzer, AnalyzerConfig, AnalyzerStats, Observation,
};
pub use baseline::{BaselineDiff, BaselineEntry, BaselineStore, Phase, RunningStats, Sample};
