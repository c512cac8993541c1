use std::sync::LazyLock;

use regex::Regex;

use crate::models::RunProgress;

static GENERATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bgeneration\s+(\d+)").unwrap());

static COVERAGE_PCT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"coveragePercentage\s+([\d.]+)").unwrap());

static COVERAGE_LABEL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Coverage:\s*([\d.]+)%").unwrap());

static QD_SCORE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"QD [Ss]core:\s*(-?[\d.]+)").unwrap());

static COMPLETED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"%\s*completed:?\s*([\d.]+)").unwrap());

/// One parsed increment to a run's progress vector.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressDelta {
    pub generation: Option<u64>,
    pub coverage: Option<f64>,
    pub qd_score: Option<f64>,
    pub completion_percent: Option<f64>,
}

impl ProgressDelta {
    pub fn is_empty(&self) -> bool {
        self.generation.is_none()
            && self.coverage.is_none()
            && self.qd_score.is_none()
            && self.completion_percent.is_none()
    }
}

/// Extract progress signals from one log line of the compute process.
/// All patterns live here so the well-known log formats stay in one table.
pub fn parse(line: &str) -> Option<ProgressDelta> {
    let mut delta = ProgressDelta::default();

    if let Some(caps) = GENERATION_RE.captures(line) {
        delta.generation = caps[1].parse().ok();
    }
    if let Some(caps) = COVERAGE_PCT_RE.captures(line) {
        delta.coverage = caps[1].parse::<f64>().ok().map(|v| v / 100.0);
    } else if let Some(caps) = COVERAGE_LABEL_RE.captures(line) {
        delta.coverage = caps[1].parse::<f64>().ok().map(|v| v / 100.0);
    }
    if let Some(caps) = QD_SCORE_RE.captures(line) {
        delta.qd_score = caps[1].parse().ok();
    }
    if let Some(caps) = COMPLETED_RE.captures(line) {
        delta.completion_percent = caps[1].parse().ok();
    }

    if delta.is_empty() {
        None
    } else {
        Some(delta)
    }
}

/// Fold a delta into a progress vector. Generation is strictly monotonic;
/// a parsed value older than the current one is discarded.
pub fn apply(progress: &mut RunProgress, delta: &ProgressDelta) -> bool {
    let mut changed = false;
    if let Some(generation) = delta.generation {
        if progress.generation.map_or(true, |g| generation > g) {
            progress.generation = Some(generation);
            changed = true;
        }
    }
    if let Some(coverage) = delta.coverage {
        if progress.coverage != Some(coverage) {
            progress.coverage = Some(coverage);
            changed = true;
        }
    }
    if let Some(qd_score) = delta.qd_score {
        if progress.qd_score != Some(qd_score) {
            progress.qd_score = Some(qd_score);
            changed = true;
        }
    }
    if let Some(pct) = delta.completion_percent {
        if progress.completion_percent != Some(pct) {
            progress.completion_percent = Some(pct);
            changed = true;
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_generation() {
        let delta = parse("starting generation 42 with 32 genomes").unwrap();
        assert_eq!(delta.generation, Some(42));
    }

    #[test]
    fn parse_coverage_variants() {
        let delta = parse("coveragePercentage 12.5").unwrap();
        assert_eq!(delta.coverage, Some(0.125));

        let delta = parse("Coverage: 80%").unwrap();
        assert_eq!(delta.coverage, Some(0.8));
    }

    #[test]
    fn parse_qd_score() {
        let delta = parse("QD Score: 1234.5").unwrap();
        assert_eq!(delta.qd_score, Some(1234.5));
        let delta = parse("QD score: -3.25").unwrap();
        assert_eq!(delta.qd_score, Some(-3.25));
    }

    #[test]
    fn parse_completion_percent() {
        let delta = parse("% completed: 37.5").unwrap();
        assert_eq!(delta.completion_percent, Some(37.5));
    }

    #[test]
    fn unrelated_lines_yield_nothing() {
        assert!(parse("connecting to ws://127.0.0.1:50051").is_none());
        assert!(parse("").is_none());
    }

    #[test]
    fn generation_is_strictly_monotonic() {
        let mut progress = RunProgress::default();
        apply(&mut progress, &parse("generation 10").unwrap());
        assert_eq!(progress.generation, Some(10));

        // A stale or repeated value never rolls the counter back.
        let changed = apply(&mut progress, &parse("generation 7").unwrap());
        assert!(!changed);
        assert_eq!(progress.generation, Some(10));

        apply(&mut progress, &parse("generation 11").unwrap());
        assert_eq!(progress.generation, Some(11));
    }

    #[test]
    fn combined_line_updates_all_fields() {
        let mut progress = RunProgress::default();
        let delta = parse("generation 5, Coverage: 12%, QD Score: 99.5").unwrap();
        apply(&mut progress, &delta);
        assert_eq!(progress.generation, Some(5));
        assert_eq!(progress.coverage, Some(0.12));
        assert_eq!(progress.qd_score, Some(99.5));
    }
}
