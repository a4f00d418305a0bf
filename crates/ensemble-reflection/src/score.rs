//! Scorecard produced by one reflection pass

use serde::{Deserialize, Serialize};

pub const WEIGHT_COMPLETENESS: f64 = 0.35;
pub const WEIGHT_CORRECTNESS: f64 = 0.45;
pub const WEIGHT_QUALITY: f64 = 0.20;
pub const MAX_LISTED: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityLevel {
    Excellent,
    Good,
    Acceptable,
    Poor,
    Failed,
}

impl QualityLevel {
    pub fn from_score(score: f64) -> Self {
        if score >= 90.0 {
            QualityLevel::Excellent
        } else if score >= 70.0 {
            QualityLevel::Good
        } else if score >= 50.0 {
            QualityLevel::Acceptable
        } else if score >= 30.0 {
            QualityLevel::Poor
        } else {
            QualityLevel::Failed
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReflectionScore {
    pub completeness: f64,
    pub correctness: f64,
    pub quality: f64,
    pub overall: f64,
    pub quality_level: QualityLevel,
    pub issues: Vec<String>,
    pub improvements: Vec<String>,
    pub should_retry: bool,
    #[serde(default)]
    pub retry_suggestion: Option<String>,
    #[serde(default)]
    pub thinking: Option<String>,
}

impl ReflectionScore {
    /// Assemble a score from raw component values, clipping each to
    /// [0, 100] and deriving the weighted overall and its quality band.
    pub fn from_components(
        completeness: f64,
        correctness: f64,
        quality: f64,
        issues: Vec<String>,
        improvements: Vec<String>,
        retry_suggestion: Option<String>,
    ) -> Self {
        let completeness = completeness.clamp(0.0, 100.0);
        let correctness = correctness.clamp(0.0, 100.0);
        let quality = quality.clamp(0.0, 100.0);
        let overall = completeness * WEIGHT_COMPLETENESS
            + correctness * WEIGHT_CORRECTNESS
            + quality * WEIGHT_QUALITY;

        let mut issues = issues;
        issues.truncate(MAX_LISTED);
        let mut improvements = improvements;
        improvements.truncate(MAX_LISTED);

        Self {
            completeness,
            correctness,
            quality,
            overall,
            quality_level: QualityLevel::from_score(overall),
            issues,
            improvements,
            should_retry: false,
            retry_suggestion,
            thinking: None,
        }
    }

    /// The score used when reflection is disabled.
    pub fn perfect() -> Self {
        Self {
            completeness: 100.0,
            correctness: 100.0,
            quality: 100.0,
            overall: 100.0,
            quality_level: QualityLevel::Excellent,
            issues: Vec::new(),
            improvements: Vec::new(),
            should_retry: false,
            retry_suggestion: None,
            thinking: None,
        }
    }

    /// The score used when reflection itself failed: acceptable, never
    /// retried.
    pub fn degraded(reason: impl Into<String>) -> Self {
        let mut score = Self::from_components(
            50.0,
            50.0,
            50.0,
            vec![format!("reflection failed: {}", reason.into())],
            Vec::new(),
            None,
        );
        score.should_retry = false;
        score
    }

    /// Retry only below the threshold and only when there is something
    /// actionable to fix.
    pub fn resolve_retry(&mut self, min_quality_threshold: f64) {
        self.should_retry = self.overall < min_quality_threshold && !self.issues.is_empty();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_bands_match_thresholds() {
        assert_eq!(QualityLevel::from_score(95.0), QualityLevel::Excellent);
        assert_eq!(QualityLevel::from_score(90.0), QualityLevel::Excellent);
        assert_eq!(QualityLevel::from_score(89.9), QualityLevel::Good);
        assert_eq!(QualityLevel::from_score(70.0), QualityLevel::Good);
        assert_eq!(QualityLevel::from_score(69.9), QualityLevel::Acceptable);
        assert_eq!(QualityLevel::from_score(50.0), QualityLevel::Acceptable);
        assert_eq!(QualityLevel::from_score(30.0), QualityLevel::Poor);
        assert_eq!(QualityLevel::from_score(29.9), QualityLevel::Failed);
    }

    #[test]
    fn overall_uses_fixed_weights() {
        let score = ReflectionScore::from_components(80.0, 60.0, 100.0, vec![], vec![], None);
        let expected = 80.0 * 0.35 + 60.0 * 0.45 + 100.0 * 0.20;
        assert!((score.overall - expected).abs() < 1e-9);
    }

    #[test]
    fn components_are_clipped() {
        let score = ReflectionScore::from_components(150.0, -20.0, 50.0, vec![], vec![], None);
        assert_eq!(score.completeness, 100.0);
        assert_eq!(score.correctness, 0.0);
        assert!(score.overall >= 0.0 && score.overall <= 100.0);
    }

    #[test]
    fn issue_lists_are_bounded() {
        let many: Vec<String> = (0..25).map(|i| format!("issue {i}")).collect();
        let score = ReflectionScore::from_components(50.0, 50.0, 50.0, many.clone(), many, None);
        assert_eq!(score.issues.len(), 10);
        assert_eq!(score.improvements.len(), 10);
    }

    #[test]
    fn retry_requires_issues() {
        let mut without_issues =
            ReflectionScore::from_components(10.0, 10.0, 10.0, vec![], vec![], None);
        without_issues.resolve_retry(60.0);
        assert!(!without_issues.should_retry);

        let mut with_issues = ReflectionScore::from_components(
            10.0,
            10.0,
            10.0,
            vec!["broken".into()],
            vec![],
            None,
        );
        with_issues.resolve_retry(60.0);
        assert!(with_issues.should_retry);

        let mut good = ReflectionScore::from_components(
            90.0,
            90.0,
            90.0,
            vec!["nitpick".into()],
            vec![],
            None,
        );
        good.resolve_retry(60.0);
        assert!(!good.should_retry);
    }
}
