use log::debug;

use crate::config::ValidatorConfig;
use crate::model::{MatchResult, MatchStatus};

/// Applies acceptance thresholds to a raw match. Rejected results keep the nearest
/// segment so a reviewer can reconcile them, but no longer count as matched.
#[derive(Debug, Clone)]
pub struct MatchValidator {
    config: ValidatorConfig,
}

impl MatchValidator {
    pub fn new(config: ValidatorConfig) -> Self {
        Self { config }
    }

    pub fn validate(&self, mut result: MatchResult) -> MatchResult {
        if !result.is_matched {
            return result;
        }

        if let Some(reason) = self.rejection_reason(&result) {
            debug!(
                "Rejecting match of observation {} to segment {:?}: {}",
                result.observation_id, result.segment_id, reason
            );
            result.status = MatchStatus::Rejected;
            result.is_matched = false;
            result.needs_review = true;
        }
        result
    }

    fn rejection_reason(&self, result: &MatchResult) -> Option<String> {
        let distance = result.distance_to_segment.unwrap_or(f64::INFINITY);
        if distance > self.config.max_distance {
            return Some(format!(
                "distance {:.1}m exceeds {:.1}m",
                distance, self.config.max_distance
            ));
        }
        match result.heading_diff {
            Some(diff) if diff > self.config.max_heading_diff => Some(format!(
                "heading off by {:.1} degrees, limit {:.1}",
                diff, self.config.max_heading_diff
            )),
            _ => None,
        }
    }
}
