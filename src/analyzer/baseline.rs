// SPDX-License-Identifier: PMPL-1.0-or-later

//! Per-target behavioural baselines.
//!
//! A target moves Unlearned -> Learning -> Baselined. Learning samples feed
//! running statistics; once `sample_count` samples have arrived the entry is
//! frozen and only [`BaselineStore::rebaseline`] starts it over.

use crate::cache::majority;
use crate::config::duration_str;
use chrono::{DateTime, Utc};
use log::info;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Welford's online mean and variance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
}

impl RunningStats {
    pub fn push(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Sample variance; zero below two samples.
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            return 0.0;
        }
        self.m2 / (self.count - 1) as f64
    }

    pub fn stddev(&self) -> f64 {
        self.variance().sqrt()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum Phase {
    Unlearned,
    Learning { samples: usize },
    Baselined,
}

/// One observed response, reduced to what the baseline tracks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub status: u16,
    /// Exact content hash.
    pub content_hash: String,
    /// SimHash of the (normalised) body.
    pub structural_hash: u64,
    pub length: usize,
    pub response_time: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineEntry {
    pub target: String,
    /// Most frequent status among the learning samples.
    pub status: u16,
    pub content_hash: String,
    /// False when learning samples disagreed on the exact hash; content
    /// mismatches are then not reported.
    pub content_stable: bool,
    /// Bitwise majority of the learning samples' SimHashes.
    pub structural_hash: u64,
    pub length_mean: f64,
    pub length_stddev: f64,
    #[serde(with = "duration_str")]
    pub response_time_mean: Duration,
    #[serde(with = "duration_str")]
    pub response_time_stddev: Duration,
    pub samples: usize,
    pub captured_at: DateTime<Utc>,
}

/// Result of comparing one response against its target's baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineDiff {
    pub baseline_status: u16,
    pub status_changed: bool,
    pub content_changed: bool,
    pub length_delta: i64,
    pub length_changed: bool,
    /// Response time over the baseline mean.
    pub time_skew: f64,
    pub timing_anomaly: bool,
}

impl BaselineDiff {
    pub fn has_changes(&self) -> bool {
        self.status_changed || self.content_changed || self.length_changed || self.timing_anomaly
    }
}

impl BaselineEntry {
    /// `timing_threshold` is the tolerated relative deviation from the mean
    /// response time; lengths may move by `length_tolerance` of the mean or
    /// three standard deviations, whichever is larger.
    pub fn compare(
        &self,
        sample: &Sample,
        timing_threshold: f64,
        length_tolerance: f64,
    ) -> BaselineDiff {
        let length_delta = sample.length as i64 - self.length_mean.round() as i64;
        let allowed = (length_tolerance * self.length_mean).max(3.0 * self.length_stddev);
        let length_changed = (length_delta.unsigned_abs() as f64) > allowed;

        let mean = self.response_time_mean.as_secs_f64();
        let observed = sample.response_time.as_secs_f64();
        let (time_skew, timing_anomaly) = if mean > 0.0 {
            (observed / mean, (observed - mean).abs() > timing_threshold * mean)
        } else {
            (1.0, false)
        };

        BaselineDiff {
            baseline_status: self.status,
            status_changed: sample.status != self.status,
            content_changed: self.content_stable && sample.content_hash != self.content_hash,
            length_delta,
            length_changed,
            time_skew,
            timing_anomaly,
        }
    }
}

#[derive(Debug, Default)]
struct Learner {
    statuses: HashMap<u16, usize>,
    first_hash: Option<String>,
    hashes_agree: bool,
    structural: Vec<u64>,
    length: RunningStats,
    time: RunningStats,
}

impl Learner {
    fn push(&mut self, sample: &Sample) {
        *self.statuses.entry(sample.status).or_default() += 1;
        match &self.first_hash {
            None => {
                self.first_hash = Some(sample.content_hash.clone());
                self.hashes_agree = true;
            }
            Some(first) => self.hashes_agree &= *first == sample.content_hash,
        }
        self.structural.push(sample.structural_hash);
        self.length.push(sample.length as f64);
        self.time.push(sample.response_time.as_secs_f64());
    }

    fn freeze(&self, target: &str) -> BaselineEntry {
        // Ties go to the lowest status code so the result is deterministic.
        let status = self
            .statuses
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
            .map(|(status, _)| *status)
            .unwrap_or_default();
        BaselineEntry {
            target: target.to_string(),
            status,
            content_hash: self.first_hash.clone().unwrap_or_default(),
            content_stable: self.hashes_agree,
            structural_hash: majority(&self.structural),
            length_mean: self.length.mean(),
            length_stddev: self.length.stddev(),
            response_time_mean: Duration::from_secs_f64(self.time.mean().max(0.0)),
            response_time_stddev: Duration::from_secs_f64(self.time.stddev().max(0.0)),
            samples: self.structural.len(),
            captured_at: Utc::now(),
        }
    }
}

#[derive(Debug)]
enum TargetState {
    Learning(Learner),
    Baselined(BaselineEntry),
}

pub struct BaselineStore {
    sample_count: usize,
    timing_threshold: f64,
    length_tolerance: f64,
    targets: RwLock<HashMap<String, TargetState>>,
}

impl BaselineStore {
    pub fn new(sample_count: usize, timing_threshold: f64, length_tolerance: f64) -> Self {
        Self {
            sample_count: sample_count.max(1),
            timing_threshold,
            length_tolerance,
            targets: RwLock::new(HashMap::new()),
        }
    }

    pub fn sample_count(&self) -> usize {
        self.sample_count
    }

    /// Feeds a learning sample. Returns how many samples the target has
    /// after this one, or `None` if it is already baselined (the sample is
    /// ignored).
    pub fn observe(&self, target: &str, sample: &Sample) -> Option<usize> {
        let mut targets = self.targets.write();
        let state = targets
            .entry(target.to_string())
            .or_insert_with(|| TargetState::Learning(Learner::default()));
        let TargetState::Learning(learner) = &mut *state else {
            return None;
        };
        learner.push(sample);
        let samples = learner.structural.len();
        if samples >= self.sample_count {
            let entry = learner.freeze(target);
            info!(
                "baseline captured for {}: status {}, ~{:.0} bytes, {:?}",
                target, entry.status, entry.length_mean, entry.response_time_mean
            );
            *state = TargetState::Baselined(entry);
        }
        Some(samples)
    }

    pub fn phase(&self, target: &str) -> Phase {
        match self.targets.read().get(target) {
            None => Phase::Unlearned,
            Some(TargetState::Learning(learner)) => Phase::Learning {
                samples: learner.structural.len(),
            },
            Some(TargetState::Baselined(_)) => Phase::Baselined,
        }
    }

    pub fn baseline(&self, target: &str) -> Option<BaselineEntry> {
        match self.targets.read().get(target) {
            Some(TargetState::Baselined(entry)) => Some(entry.clone()),
            _ => None,
        }
    }

    /// `None` until the target is baselined.
    pub fn compare(&self, target: &str, sample: &Sample) -> Option<BaselineDiff> {
        let targets = self.targets.read();
        match targets.get(target) {
            Some(TargetState::Baselined(entry)) => {
                Some(entry.compare(sample, self.timing_threshold, self.length_tolerance))
            }
            _ => None,
        }
    }

    /// Forgets the target so the next samples learn it afresh.
    pub fn rebaseline(&self, target: &str) -> bool {
        let removed = self.targets.write().remove(target).is_some();
        if removed {
            info!("baseline for {} discarded, relearning", target);
        }
        removed
    }

    pub fn targets(&self) -> Vec<String> {
        let mut targets: Vec<String> = self.targets.read().keys().cloned().collect();
        targets.sort();
        targets
    }

    pub fn baselined_count(&self) -> usize {
        self.targets
            .read()
            .values()
            .filter(|state| matches!(state, TargetState::Baselined(_)))
            .count()
    }
}
