// SPDX-License-Identifier: PMPL-1.0-or-later

//! Scores responses against their target's baseline.

use super::baseline::{BaselineDiff, BaselineEntry, BaselineStore, Phase, Sample};
use crate::cache::{
    hamming_distance, ContentFingerprint, ExactDedup, LshIndex, MemoryCache, MinHasher,
    Normalizer, SimHasher, SimilarityConfig, SimilarityIndex,
};
use crate::error::{EngineError, EngineResult};
use crate::sync::AtomicCounter;
use crate::throttle::Throttle;
use crate::types::{AnomalyResult, Severity, TaskId};
use chrono::Utc;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Learning samples per target before its baseline freezes.
    pub sample_count: usize,
    /// Relative response-time deviation that counts as a timing anomaly.
    pub timing_threshold: f64,
    /// Relative length change tolerated before flagging.
    pub length_tolerance: f64,
    /// Findings at or above this severity are clustered.
    pub cluster_severity: Severity,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            sample_count: 5,
            timing_threshold: 0.5,
            length_tolerance: 0.1,
            cluster_severity: Severity::Medium,
        }
    }
}

impl AnalyzerConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if self.sample_count == 0 {
            return Err(EngineError::invalid("analyzer sample_count must be > 0"));
        }
        if !(self.timing_threshold.is_finite() && self.timing_threshold > 0.0) {
            return Err(EngineError::invalid("analyzer timing_threshold must be > 0"));
        }
        if !(self.length_tolerance.is_finite() && self.length_tolerance >= 0.0) {
            return Err(EngineError::invalid("analyzer length_tolerance must be >= 0"));
        }
        Ok(())
    }
}

/// A completed response as the analyzer sees it.
#[derive(Debug, Clone)]
pub struct Observation {
    pub request_id: TaskId,
    pub target: String,
    pub status: u16,
    pub body: Vec<u8>,
    pub response_time: Duration,
}

impl Observation {
    pub fn new(
        request_id: TaskId,
        target: impl Into<String>,
        status: u16,
        body: impl Into<Vec<u8>>,
        response_time: Duration,
    ) -> Self {
        Self {
            request_id,
            target: target.into(),
            status,
            body: body.into(),
            response_time,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Analysis {
    /// Consumed as a learning sample; `samples` so far for the target.
    Learning { samples: usize },
    /// Byte-identical to a body already scored for this target and status.
    Duplicate { fingerprint: ContentFingerprint },
    Scored(AnomalyResult),
}

impl Analysis {
    pub fn anomaly(&self) -> Option<&AnomalyResult> {
        match self {
            Analysis::Scored(result) => Some(result),
            _ => None,
        }
    }

    pub fn into_anomaly(self) -> Option<AnomalyResult> {
        match self {
            Analysis::Scored(result) => Some(result),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalyzerStats {
    pub analysed: u64,
    pub learning: u64,
    pub duplicates: u64,
    pub scored: u64,
    pub info: u64,
    pub low: u64,
    pub medium: u64,
    pub high: u64,
    pub critical: u64,
    /// Findings linked to an earlier near-duplicate.
    pub clustered: u64,
    pub targets: usize,
    pub baselined_targets: usize,
}

#[derive(Default)]
struct Counters {
    analysed: AtomicCounter,
    learning: AtomicCounter,
    duplicates: AtomicCounter,
    scored: AtomicCounter,
    by_severity: [AtomicCounter; 5],
    clustered: AtomicCounter,
}

/// Structural distance bands: 0-5 info, 6-15 low, 16-30 medium, 31+ high.
/// A 5xx is at least high, and critical when the body also diverged past
/// 30 bits; a non-5xx status change is at least medium; a timing anomaly
/// or length change is at least low.
pub fn severity_for(distance: u32, crashed: bool, diff: &BaselineDiff) -> Severity {
    let mut severity = match distance {
        0..=5 => Severity::Info,
        6..=15 => Severity::Low,
        16..=30 => Severity::Medium,
        _ => Severity::High,
    };
    if crashed {
        severity = severity.max(Severity::High);
        if distance > 30 {
            severity = Severity::Critical;
        }
    } else if diff.status_changed {
        severity = severity.max(Severity::Medium);
    }
    if diff.timing_anomaly || diff.length_changed {
        severity = severity.max(Severity::Low);
    }
    severity
}

fn first_difference(a: &[u8], b: &[u8]) -> Option<usize> {
    match a.iter().zip(b).position(|(x, y)| x != y) {
        Some(offset) => Some(offset),
        None if a.len() != b.len() => Some(a.len().min(b.len())),
        None => None,
    }
}

const INDEX_WARN_INTERVAL: Duration = Duration::from_secs(10);

fn baseline_key(target: &str) -> String {
    format!("baseline:{}", target)
}

pub struct Analyzer {
    config: AnalyzerConfig,
    jaccard_threshold: f64,
    normalizer: Option<Normalizer>,
    simhasher: SimHasher,
    minhasher: MinHasher,
    baselines: BaselineStore,
    dedup: ExactDedup<(String, u16, ContentFingerprint)>,
    findings: SimilarityIndex,
    clusters: LshIndex<TaskId>,
    cache: Arc<MemoryCache>,
    index_warnings: Throttle,
    counters: Counters,
}

impl Analyzer {
    pub fn new(
        config: AnalyzerConfig,
        similarity: &SimilarityConfig,
        cache: Arc<MemoryCache>,
    ) -> EngineResult<Self> {
        config.validate()?;
        similarity.validate()?;
        let minhasher = MinHasher::new(similarity.minhash_permutations, similarity.shingle_size)?;
        let clusters = LshIndex::for_hasher(&minhasher, similarity.lsh_bands, similarity.max_items)?;
        let normalizer = if similarity.normalize {
            Some(Normalizer::builtin()?)
        } else {
            None
        };
        Ok(Self {
            baselines: BaselineStore::new(
                config.sample_count,
                config.timing_threshold,
                config.length_tolerance,
            ),
            jaccard_threshold: similarity.jaccard_threshold,
            simhasher: SimHasher::new(similarity.shingle_size)?,
            dedup: ExactDedup::new(similarity.dedup_capacity)?,
            findings: SimilarityIndex::from_config(similarity)?,
            normalizer,
            minhasher,
            clusters,
            cache,
            config,
            index_warnings: Throttle::new(INDEX_WARN_INTERVAL),
            counters: Counters::default(),
        })
    }

    pub fn baselines(&self) -> &BaselineStore {
        &self.baselines
    }

    pub fn phase(&self, target: &str) -> Phase {
        self.baselines.phase(target)
    }

    pub fn baseline(&self, target: &str) -> Option<BaselineEntry> {
        self.baselines.baseline(target)
    }

    /// Discards the target's baseline, its cached reference body and the
    /// bodies already scored against it.
    pub fn rebaseline(&self, target: &str) -> bool {
        self.cache.remove(&baseline_key(target));
        let forgotten = self.dedup.retain(|(scored_on, _, _)| scored_on != target);
        debug!("rebaseline {}: {} scored bodies forgotten", target, forgotten);
        self.baselines.rebaseline(target)
    }

    fn normalized<'a>(&self, body: &'a [u8]) -> Cow<'a, [u8]> {
        match &self.normalizer {
            Some(normalizer) => normalizer.normalize(body),
            None => Cow::Borrowed(body),
        }
    }

    pub fn analyze(&self, observation: &Observation) -> Analysis {
        self.counters.analysed.inc();
        let normalized = self.normalized(&observation.body);
        let fingerprint = ContentFingerprint::generate(&observation.body);
        let sample = Sample {
            status: observation.status,
            content_hash: fingerprint.hash.clone(),
            structural_hash: self.simhasher.hash(&normalized),
            length: observation.body.len(),
            response_time: observation.response_time,
        };

        if let Some(samples) = self.baselines.observe(&observation.target, &sample) {
            self.counters.learning.inc();
            if samples == 1 {
                self.cache
                    .set(baseline_key(&observation.target), observation.body.clone());
            }
            return Analysis::Learning { samples };
        }

        let key = (observation.target.clone(), observation.status, fingerprint);
        if !self.dedup.check_and_insert(key.clone()) {
            self.counters.duplicates.inc();
            return Analysis::Duplicate { fingerprint: key.2 };
        }

        let Some(baseline) = self.baselines.baseline(&observation.target) else {
            // Rebaselined between the two calls; start learning again.
            let samples = self
                .baselines
                .observe(&observation.target, &sample)
                .unwrap_or(0);
            self.counters.learning.inc();
            return Analysis::Learning { samples };
        };

        let result = self.score(observation, &sample, &baseline, &normalized);
        self.counters.scored.inc();
        self.counters.by_severity[result.severity as usize].inc();
        Analysis::Scored(result)
    }

    fn score(
        &self,
        observation: &Observation,
        sample: &Sample,
        baseline: &BaselineEntry,
        normalized: &[u8],
    ) -> AnomalyResult {
        let diff = baseline.compare(
            sample,
            self.config.timing_threshold,
            self.config.length_tolerance,
        );
        let distance = hamming_distance(sample.structural_hash, baseline.structural_hash);
        let crashed = (500..600).contains(&observation.status);
        let severity = severity_for(distance, crashed, &diff);
        let evidence = self.evidence(observation, &diff, distance, baseline);

        let similar_to = if severity >= self.config.cluster_severity {
            self.cluster(observation.request_id, sample.structural_hash, normalized)
        } else {
            None
        };
        if similar_to.is_some() {
            self.counters.clustered.inc();
        }
        if severity >= Severity::High {
            debug!(
                "{} finding on {} (request {}): {}",
                severity.label(),
                observation.target,
                observation.request_id,
                evidence
            );
        }

        AnomalyResult {
            request_id: observation.request_id,
            target: observation.target.clone(),
            status: observation.status,
            structural_distance: distance,
            time_skew: diff.time_skew,
            length_delta: diff.length_delta,
            crashed,
            status_changed: diff.status_changed,
            timing_anomaly: diff.timing_anomaly,
            evidence,
            severity,
            similar_to,
            detected_at: Utc::now(),
        }
    }

    fn evidence(
        &self,
        observation: &Observation,
        diff: &BaselineDiff,
        distance: u32,
        baseline: &BaselineEntry,
    ) -> String {
        let mut parts = Vec::new();
        if diff.status_changed {
            parts.push(format!(
                "status {} -> {}",
                diff.baseline_status, observation.status
            ));
        }
        if distance > 0 {
            parts.push(format!("structural distance {}/64", distance));
        }
        if diff.length_changed {
            parts.push(format!(
                "length {:+} bytes (baseline ~{:.0})",
                diff.length_delta, baseline.length_mean
            ));
        }
        if diff.timing_anomaly {
            parts.push(format!("response time {:.2}x baseline", diff.time_skew));
        }
        if diff.content_changed {
            parts.push("content differs from baseline".to_string());
        }
        if let Some(reference) = self.cache.get(&baseline_key(&observation.target)) {
            if let Some(offset) = first_difference(&reference, &observation.body) {
                parts.push(format!("first difference at byte {}", offset));
            }
        }
        if parts.is_empty() {
            return "matches baseline".to_string();
        }
        parts.join("; ")
    }

    /// Links a finding to an earlier near-duplicate: SimHash buckets first,
    /// then MinHash/LSH for bodies the SimHash threshold misses.
    fn cluster(&self, id: TaskId, structural: u64, normalized: &[u8]) -> Option<TaskId> {
        let near = self
            .findings
            .find_similar(structural, self.findings.threshold())
            .into_iter()
            .map(|(item, _)| item.id)
            .find(|other| *other != id);
        let signature = self.minhasher.signature(normalized);
        let similar = near.or_else(|| {
            self.clusters
                .query(&signature, self.jaccard_threshold)
                .ok()
                .and_then(|hits| {
                    hits.into_iter()
                        .map(|(other, _)| other)
                        .find(|other| *other != id)
                })
        });
        self.findings.insert(id, structural);
        if let Err(err) = self.clusters.insert(id, signature) {
            if self.index_warnings.allow() {
                warn!("finding {} not indexed for clustering: {}", id, err);
            }
        }
        similar
    }

    pub fn stats(&self) -> AnalyzerStats {
        let c = &self.counters;
        AnalyzerStats {
            analysed: c.analysed.get(),
            learning: c.learning.get(),
            duplicates: c.duplicates.get(),
            scored: c.scored.get(),
            info: c.by_severity[Severity::Info as usize].get(),
            low: c.by_severity[Severity::Low as usize].get(),
            medium: c.by_severity[Severity::Medium as usize].get(),
            high: c.by_severity[Severity::High as usize].get(),
            critical: c.by_severity[Severity::Critical as usize].get(),
            clustered: c.clustered.get(),
            targets: self.baselines.targets().len(),
            baselined_targets: self.baselines.baselined_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCacheConfig;

    fn analyzer() -> Analyzer {
        let cache = Arc::new(MemoryCache::new(MemoryCacheConfig::default()).unwrap());
        Analyzer::new(AnalyzerConfig::default(), &SimilarityConfig::default(), cache).unwrap()
    }

    fn page(title: &str) -> Vec<u8> {
        format!(
            "<html><head><title>{}</title></head><body><ul>{}</ul></body></html>",
            title,
            "<li>product listing row</li>".repeat(20)
        )
        .into_bytes()
    }

    fn learn(analyzer: &Analyzer, target: &str) {
        for id in 0..5 {
            let obs = Observation::new(id, target, 200, page("Shop"), Duration::from_millis(20));
            assert!(matches!(analyzer.analyze(&obs), Analysis::Learning { .. }));
        }
    }

    #[test]
    fn learns_then_scores() {
        let analyzer = analyzer();
        learn(&analyzer, "/shop");
        assert_eq!(analyzer.phase("/shop"), Phase::Baselined);

        let same = Observation::new(10, "/shop", 200, page("Shop"), Duration::from_millis(20));
        let result = analyzer.analyze(&same).into_anomaly().expect("scored");
        assert_eq!(result.severity, Severity::Info);
        assert_eq!(result.structural_distance, 0);
        assert_eq!(result.evidence, "matches baseline");
    }

    #[test]
    fn server_error_is_high_or_worse() {
        let analyzer = analyzer();
        learn(&analyzer, "/shop");
        let crash = Observation::new(
            11,
            "/shop",
            500,
            b"Traceback (most recent call last): KeyError 'id'".to_vec(),
            Duration::from_millis(20),
        );
        let result = analyzer.analyze(&crash).into_anomaly().expect("scored");
        assert!(result.crashed);
        assert!(result.status_changed);
        assert!(result.severity >= Severity::High);
        assert!(result.evidence.contains("status 200 -> 500"));
        assert!(result.evidence.contains("first difference at byte"));
    }

    #[test]
    fn repeated_body_is_duplicate() {
        let analyzer = analyzer();
        learn(&analyzer, "/shop");
        let obs = Observation::new(20, "/shop", 200, page("Other"), Duration::from_millis(20));
        assert!(analyzer.analyze(&obs).anomaly().is_some());
        let again = Observation { request_id: 21, ..obs };
        assert!(matches!(analyzer.analyze(&again), Analysis::Duplicate { .. }));
        assert_eq!(analyzer.stats().duplicates, 1);
    }

    #[test]
    fn similar_findings_cluster() {
        let analyzer = analyzer();
        learn(&analyzer, "/shop");
        let first = Observation::new(
            30,
            "/shop",
            500,
            b"Fatal error: Uncaught PDOException in /var/www/shop.php:41".to_vec(),
            Duration::from_millis(20),
        );
        let second = Observation::new(
            31,
            "/shop",
            500,
            b"Fatal error: Uncaught PDOException in /var/www/shop.php:42".to_vec(),
            Duration::from_millis(20),
        );
        let a = analyzer.analyze(&first).into_anomaly().unwrap();
        let b = analyzer.analyze(&second).into_anomaly().unwrap();
        assert_eq!(a.similar_to, None);
        assert_eq!(b.similar_to, Some(30));
        assert_eq!(analyzer.stats().clustered, 1);
    }

    #[test]
    fn rebaseline_relearns() {
        let analyzer = analyzer();
        learn(&analyzer, "/a");
        assert!(analyzer.rebaseline("/a"));
        let obs = Observation::new(40, "/a", 200, page("Shop"), Duration::from_millis(20));
        assert!(matches!(
            analyzer.analyze(&obs),
            Analysis::Learning { samples: 1 }
        ));
    }

    #[test]
    fn severity_bands() {
        let quiet = BaselineDiff {
            baseline_status: 200,
            status_changed: false,
            content_changed: false,
            length_delta: 0,
            length_changed: false,
            time_skew: 1.0,
            timing_anomaly: false,
        };
        assert_eq!(severity_for(5, false, &quiet), Severity::Info);
        assert_eq!(severity_for(6, false, &quiet), Severity::Low);
        assert_eq!(severity_for(16, false, &quiet), Severity::Medium);
        assert_eq!(severity_for(31, false, &quiet), Severity::High);
        assert_eq!(severity_for(0, true, &quiet), Severity::High);
        assert_eq!(severity_for(40, true, &quiet), Severity::Critical);
        let moved = BaselineDiff {
            status_changed: true,
            ..quiet.clone()
        };
        assert_eq!(severity_for(0, false, &moved), Severity::Medium);
        let slow = BaselineDiff {
            timing_anomaly: true,
            ..quiet
        };
        assert_eq!(severity_for(0, false, &slow), Severity::Low);
    }

    #[test]
    fn first_difference_offsets() {
        assert_eq!(first_difference(b"abc", b"abc"), None);
        assert_eq!(first_difference(b"abc", b"abd"), Some(2));
        assert_eq!(first_difference(b"abc", b"abcdef"), Some(3));
    }
}
