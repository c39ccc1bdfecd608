use log::{debug, trace, warn};
use ordered_float::OrderedFloat;
use rayon::prelude::*;

use crate::config::MapMatcherConfig;
use crate::model::{DefectObservation, MatchResult, MatchStatus};
use crate::road_index::{Candidate, RoadNetworkIndex};

/// Costs closer than this are the same cost; GPS carries no information at this scale
const COST_RESOLUTION: f64 = 1e-6;

/// A candidate with its matching cost. Lower is better.
#[derive(Clone, Debug)]
pub struct ScoredCandidate {
    pub candidate: Candidate,
    pub cost: f64,
}

impl ScoredCandidate {
    fn sort_key(&self) -> (OrderedFloat<f64>, i64) {
        (OrderedFloat(self.cost), self.candidate.segment.id)
    }
}

/// Selects the road segment an observation belongs to. Pure with respect to the
/// index snapshot it is handed.
#[derive(Debug, Clone)]
pub struct MapMatcher {
    config: MapMatcherConfig,
}

impl MapMatcher {
    pub fn new(config: MapMatcherConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MapMatcherConfig {
        &self.config
    }

    /// Weighted cost on a 0-1 scale. The heading term drops out when the
    /// observation has no heading.
    pub fn cost(&self, candidate: &Candidate) -> f64 {
        let radius = self.config.search_radius.max(f64::EPSILON);
        let distance_term = (candidate.distance / radius).clamp(0.0, 1.0);
        let raw = match candidate.heading_diff {
            Some(diff) => {
                self.config.distance_weight * distance_term
                    + self.config.heading_weight * (diff / 180.0).clamp(0.0, 1.0)
            }
            None => self.config.distance_weight * distance_term,
        };
        (raw / COST_RESOLUTION).round() * COST_RESOLUTION
    }

    /// Candidates scored and sorted: lowest cost first, lowest segment id on ties.
    pub fn rank(&self, candidates: Vec<Candidate>) -> Vec<ScoredCandidate> {
        let mut scored: Vec<ScoredCandidate> = candidates
            .into_iter()
            .map(|candidate| ScoredCandidate {
                cost: self.cost(&candidate),
                candidate,
            })
            .collect();
        scored.sort_by_key(|s| s.sort_key());
        scored
    }

    pub fn match_observation(
        &self,
        index: &RoadNetworkIndex,
        observation: &DefectObservation,
    ) -> MatchResult {
        let Some(point) = observation.valid_location() else {
            warn!(
                "Observation {} has no usable GPS fix, storing for review",
                observation.id
            );
            return MatchResult::unmatched(observation.id, MatchStatus::InvalidLocation);
        };
        let heading = observation.valid_heading();

        let mut candidates = index.find_candidates(point, heading, self.config.search_radius);
        candidates.truncate(self.config.max_candidates.max(1));

        let ranked = self.rank(candidates);
        let Some(best) = ranked.first() else {
            debug!(
                "No segment within {:.1}m of observation {}",
                self.config.search_radius, observation.id
            );
            return MatchResult::unmatched(observation.id, MatchStatus::NoCandidate);
        };

        // Gap to the runner-up; a lone candidate is unambiguous
        let gap = ranked.get(1).map(|second| second.cost - best.cost);
        let ambiguous = gap.is_some_and(|g| g < self.config.ambiguity_margin);

        trace!(
            "Observation {}: best segment {} cost {:.4} gap {:?}",
            observation.id, best.candidate.segment.id, best.cost, gap
        );

        MatchResult {
            observation_id: observation.id,
            segment_id: Some(best.candidate.segment.id),
            status: if ambiguous {
                MatchStatus::Ambiguous
            } else {
                MatchStatus::Matched
            },
            matched_point: Some(best.candidate.point_on_segment),
            distance_to_segment: Some(best.candidate.distance),
            heading_diff: best.candidate.heading_diff,
            confidence: self.confidence(&best.candidate, if ambiguous { gap } else { None }),
            is_matched: true,
            needs_review: ambiguous,
        }
    }

    /// Matches a batch in parallel. Output order follows input order.
    pub fn match_batch(
        &self,
        index: &RoadNetworkIndex,
        observations: &[DefectObservation],
    ) -> Vec<MatchResult> {
        observations
            .par_iter()
            .map(|observation| self.match_observation(index, observation))
            .collect()
    }

    /// Confidence in [0, 1]: falls off quadratically with distance, with the cosine
    /// of the heading difference, and is halved for a zero-gap ambiguous match.
    fn confidence(&self, candidate: &Candidate, ambiguity_gap: Option<f64>) -> f64 {
        let radius = self.config.search_radius.max(f64::EPSILON);
        let distance_factor = 1.0 - (candidate.distance / radius).powi(2);
        let heading_factor = candidate
            .heading_diff
            .map(|diff| diff.to_radians().cos().max(0.0))
            .unwrap_or(1.0);
        let ambiguity_factor = match ambiguity_gap {
            Some(gap) if self.config.ambiguity_margin > 0.0 => {
                0.5 + 0.5 * (gap / self.config.ambiguity_margin).clamp(0.0, 1.0)
            }
            _ => 1.0,
        };
        (distance_factor * heading_factor * ambiguity_factor).clamp(0.0, 1.0)
    }
}
