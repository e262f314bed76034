//! Rule-based six-axis profile scoring.
//!
//! Each axis is a weighted blend of activity metrics normalized against a
//! reference scale, clamped to `0..=100`. Weights and scales are heuristics.

use serde::{Deserialize, Serialize};

use crate::clients::ProfileFeatures;

/// Six-axis radar chart, each axis in `0..=100`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RadarScores {
    pub collaboration: u32,
    pub communication: u32,
    pub technical: u32,
    pub documentation: u32,
    pub reliability: u32,
    pub preference: u32,
}

fn clamp(value: f64) -> u32 {
    value.round_ties_even().clamp(0.0, 100.0) as u32
}

/// Activity relative to `scale`, as a 0-100 score.
fn score_activity(value: u64, scale: u64) -> f64 {
    f64::from(clamp(value as f64 / scale.max(1) as f64 * 100.0))
}

/// Score a feature bag.
///
/// `preference` blends the other five axes before the inactivity penalty is
/// applied to `reliability`: more than 90 days idle costs 20%, more than 30
/// days costs 10%.
pub fn calculate_scores(f: &ProfileFeatures) -> RadarScores {
    let collaboration = clamp(
        score_activity(f.pr_reviews_submitted, 50) * 0.5
            + score_activity(f.pull_requests_opened, 50) * 0.3
            + score_activity(f.issue_comments_written, 100) * 0.2,
    );

    let communication = clamp(
        score_activity(f.issue_comments_written, 120) * 0.6
            + score_activity(f.pull_requests_opened, 60) * 0.2
            + score_activity(f.pr_reviews_submitted, 60) * 0.2,
    );

    let technical = clamp(
        score_activity(f.language_diversity, 6) * 0.5
            + score_activity(f.repo_count, 30) * 0.3
            + score_activity(f.commit_events, 40) * 0.2,
    );

    let documentation = clamp(f.readme_coverage as f64);

    let mut reliability =
        clamp(f.merge_rate as f64 * 0.7 + score_activity(f.commit_events, 40) * 0.3);

    let preference = clamp(
        f64::from(collaboration) * 0.25
            + f64::from(communication) * 0.2
            + f64::from(technical) * 0.2
            + f64::from(documentation) * 0.15
            + f64::from(reliability) * 0.2,
    );

    match f.recent_activity_days {
        Some(days) if days > 90 => reliability = clamp(f64::from(reliability) * 0.8),
        Some(days) if days > 30 => reliability = clamp(f64::from(reliability) * 0.9),
        _ => {}
    }

    RadarScores {
        collaboration,
        communication,
        technical,
        documentation,
        reliability,
        preference,
    }
}
