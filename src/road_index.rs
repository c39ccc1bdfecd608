use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use chrono::{DateTime, Utc};
use geo::{Point, Rect};
use log::{debug, info};
use rstar::{AABB, RTree, RTreeObject};

use crate::error::{EngineError, Result};
use crate::geometry::{heading_difference, project_onto_line, radius_to_degrees};
use crate::model::{RoadSegment, SegmentId};

// Wrapper for RoadSegment to make it compatible with RTree
struct IndexedSegment {
    segment: Arc<RoadSegment>,
    bbox: Rect<f64>,
}

impl RTreeObject for IndexedSegment {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_corners(
            [self.bbox.min().x, self.bbox.min().y],
            [self.bbox.max().x, self.bbox.max().y],
        )
    }
}

/// A segment near a query point
#[derive(Clone, Debug)]
pub struct Candidate {
    pub segment: Arc<RoadSegment>,
    pub point_on_segment: Point<f64>,
    /// Perpendicular distance in meters
    pub distance: f64,
    /// Only known when the observation carries a heading
    pub heading_diff: Option<f64>,
}

/// Immutable spatial index over one version of the road network.
pub struct RoadNetworkIndex {
    tree: RTree<IndexedSegment>,
    segments: HashMap<SegmentId, Arc<RoadSegment>>,
    loaded_at: DateTime<Utc>,
}

impl RoadNetworkIndex {
    pub fn build(segments: Vec<RoadSegment>) -> Result<Self> {
        let start = Instant::now();
        let mut by_id = HashMap::with_capacity(segments.len());
        let mut indexed = Vec::with_capacity(segments.len());

        for segment in segments {
            let bbox = validate_segment(&segment)?;
            let segment = Arc::new(segment);
            if by_id.insert(segment.id, segment.clone()).is_some() {
                return Err(EngineError::InvalidSegment(
                    segment.id,
                    "duplicate segment id".to_string(),
                ));
            }
            indexed.push(IndexedSegment { segment, bbox });
        }

        let tree = RTree::bulk_load(indexed);
        info!(
            "Built road network index with {} segments in {:?}",
            by_id.len(),
            start.elapsed()
        );

        Ok(Self {
            tree,
            segments: by_id,
            loaded_at: Utc::now(),
        })
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    pub fn segment(&self, id: SegmentId) -> Option<&Arc<RoadSegment>> {
        self.segments.get(&id)
    }

    pub fn segment_ids(&self) -> impl Iterator<Item = SegmentId> + '_ {
        self.segments.keys().copied()
    }

    /// Segments within `radius` meters of `point`, nearest first. Equal distances are
    /// ordered by segment id so the result is reproducible.
    pub fn find_candidates(
        &self,
        point: Point<f64>,
        heading: Option<f64>,
        radius: f64,
    ) -> Vec<Candidate> {
        let (dlon, dlat) = radius_to_degrees(radius, point.y());
        let envelope = AABB::from_corners(
            [point.x() - dlon, point.y() - dlat],
            [point.x() + dlon, point.y() + dlat],
        );

        let mut candidates: Vec<Candidate> = self
            .tree
            .locate_in_envelope_intersecting(&envelope)
            .filter_map(|indexed| {
                let segment = &indexed.segment;
                let hit = project_onto_line(point, &segment.geometry)?;
                if hit.distance > radius {
                    return None;
                }
                Some(Candidate {
                    segment: segment.clone(),
                    point_on_segment: hit.point_on_line,
                    distance: hit.distance,
                    heading_diff: heading
                        .map(|h| heading_difference(h, hit.bearing, segment.is_oneway)),
                })
            })
            .collect();

        candidates.sort_by(|a, b| {
            a.distance
                .total_cmp(&b.distance)
                .then(a.segment.id.cmp(&b.segment.id))
        });

        debug!(
            "Found {} candidates within {:.1}m of ({:.6}, {:.6})",
            candidates.len(),
            radius,
            point.y(),
            point.x()
        );
        candidates
    }
}

fn validate_segment(segment: &RoadSegment) -> Result<Rect<f64>> {
    if segment.geometry.0.len() < 2 {
        return Err(EngineError::InvalidSegment(
            segment.id,
            "geometry needs at least two points".to_string(),
        ));
    }
    if segment
        .geometry
        .coords()
        .any(|c| !c.x.is_finite() || !c.y.is_finite())
    {
        return Err(EngineError::InvalidSegment(
            segment.id,
            "geometry has non-finite coordinates".to_string(),
        ));
    }
    if let Some(importance) = segment.traffic_importance {
        if !(1..=10).contains(&importance) {
            return Err(EngineError::InvalidSegment(
                segment.id,
                format!("traffic importance {importance} outside 1-10"),
            ));
        }
    }
    segment.bounding_box().ok_or_else(|| {
        EngineError::InvalidSegment(segment.id, "geometry has no extent".to_string())
    })
}

/// Holds the current index snapshot. Reloading swaps the whole structure; queries
/// that already hold the previous `Arc` finish against it.
#[derive(Default)]
pub struct NetworkHandle {
    current: RwLock<Option<Arc<RoadNetworkIndex>>>,
}

impl NetworkHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Result<Arc<RoadNetworkIndex>> {
        let guard = self.current.read().unwrap_or_else(|e| e.into_inner());
        guard.clone().ok_or(EngineError::IndexUnavailable)
    }

    pub fn is_loaded(&self) -> bool {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Builds a new index and swaps it in, returning the previous one.
    pub fn load(&self, segments: Vec<RoadSegment>) -> Result<Option<Arc<RoadNetworkIndex>>> {
        let index = Arc::new(RoadNetworkIndex::build(segments)?);
        Ok(self.swap(index))
    }

    pub fn swap(&self, index: Arc<RoadNetworkIndex>) -> Option<Arc<RoadNetworkIndex>> {
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        guard.replace(index)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use geo::{Coord, LineString};

    use super::*;
    use crate::geometry::LocalProjection;

    pub const ORIGIN: (f64, f64) = (4.35, 50.85);

    pub fn projection() -> LocalProjection {
        LocalProjection::new(Point::new(ORIGIN.0, ORIGIN.1))
    }

    /// Point `(x, y)` meters east/north of the test origin
    pub fn at(x: f64, y: f64) -> Point<f64> {
        projection().unproject(Coord { x, y })
    }

    /// Straight segment between two local metric coordinates
    pub fn segment(id: SegmentId, from: (f64, f64), to: (f64, f64)) -> RoadSegment {
        let geometry = LineString::from(vec![at(from.0, from.1).0, at(to.0, to.1).0]);
        RoadSegment {
            id,
            name: None,
            road_type: "residential".to_string(),
            length_meters: 0.0,
            geometry,
            traffic_importance: Some(5),
            is_oneway: false,
            accessibility_score: None,
            last_maintenance_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn snapshot_before_load_is_unavailable() {
        let handle = NetworkHandle::new();
        assert!(matches!(
            handle.snapshot(),
            Err(EngineError::IndexUnavailable)
        ));
    }

    #[test]
    fn candidates_are_ordered_by_distance_then_id() {
        let index = RoadNetworkIndex::build(vec![
            segment(7, (-50.0, 4.0), (50.0, 4.0)),
            segment(3, (-50.0, -4.0), (50.0, -4.0)),
            segment(9, (-50.0, 20.0), (50.0, 20.0)),
            segment(11, (-50.0, 200.0), (50.0, 200.0)),
        ])
        .unwrap();

        let found = index.find_candidates(at(0.0, 0.0), None, 25.0);
        let ids: Vec<_> = found.iter().map(|c| c.segment.id).collect();
        assert_eq!(ids, vec![3, 7, 9]);
        assert!((found[0].distance - 4.0).abs() < 0.01);
        assert!(found[0].heading_diff.is_none());
    }

    #[test]
    fn heading_difference_is_reported_when_known() {
        let index = RoadNetworkIndex::build(vec![segment(1, (-50.0, 0.0), (50.0, 0.0))]).unwrap();
        let found = index.find_candidates(at(0.0, 3.0), Some(100.0), 25.0);
        assert_eq!(found.len(), 1);
        assert!((found[0].heading_diff.unwrap() - 10.0).abs() < 0.01);
    }

    #[test]
    fn reload_keeps_old_snapshot_alive() {
        let handle = NetworkHandle::new();
        handle.load(vec![segment(1, (0.0, 0.0), (100.0, 0.0))]).unwrap();
        let old = handle.snapshot().unwrap();

        handle
            .load(vec![
                segment(1, (0.0, 0.0), (100.0, 0.0)),
                segment(2, (0.0, 50.0), (100.0, 50.0)),
            ])
            .unwrap();

        assert_eq!(old.len(), 1);
        assert_eq!(handle.snapshot().unwrap().len(), 2);
    }

    #[test]
    fn rejects_degenerate_and_duplicate_segments() {
        let mut short = segment(1, (0.0, 0.0), (10.0, 0.0));
        short.geometry.0.truncate(1);
        assert!(RoadNetworkIndex::build(vec![short]).is_err());

        let dup = vec![
            segment(1, (0.0, 0.0), (10.0, 0.0)),
            segment(1, (0.0, 5.0), (10.0, 5.0)),
        ];
        assert!(matches!(
            RoadNetworkIndex::build(dup),
            Err(EngineError::InvalidSegment(1, _))
        ));
    }
}
