use geo::{Closest, ClosestPoint, Coord, Distance, Euclidean, Line, LineString, Point};

/// Mean earth radius in meters
pub const EARTH_RADIUS_M: f64 = 6_371_008.8;

const METERS_PER_DEGREE: f64 = EARTH_RADIUS_M * std::f64::consts::PI / 180.0;

/// Equirectangular projection around a reference point. Accurate to well under a
/// meter over the few hundred meters a match query covers.
#[derive(Debug, Clone, Copy)]
pub struct LocalProjection {
    origin: Point<f64>,
    cos_lat: f64,
}

impl LocalProjection {
    pub fn new(origin: Point<f64>) -> Self {
        Self {
            origin,
            cos_lat: origin.y().to_radians().cos(),
        }
    }

    pub fn project(&self, c: Coord<f64>) -> Coord<f64> {
        Coord {
            x: (c.x - self.origin.x()) * self.cos_lat * METERS_PER_DEGREE,
            y: (c.y - self.origin.y()) * METERS_PER_DEGREE,
        }
    }

    pub fn unproject(&self, c: Coord<f64>) -> Point<f64> {
        Point::new(
            self.origin.x() + c.x / (self.cos_lat * METERS_PER_DEGREE),
            self.origin.y() + c.y / METERS_PER_DEGREE,
        )
    }
}

/// Converts a metric radius into a (lon, lat) degree half-extent at `latitude`.
pub fn radius_to_degrees(radius_m: f64, latitude: f64) -> (f64, f64) {
    let dlat = radius_m / METERS_PER_DEGREE;
    let cos_lat = latitude.to_radians().cos().abs().max(1e-6);
    (dlat / cos_lat, dlat)
}

/// Closest point of a polyline to `point`.
#[derive(Debug, Clone, Copy)]
pub struct Projection {
    pub point_on_line: Point<f64>,
    /// Perpendicular (or end-point) distance in meters
    pub distance: f64,
    /// Compass bearing of the sub-line the projection falls on, degrees in [0, 360)
    pub bearing: f64,
}

pub fn project_onto_line(point: Point<f64>, line: &LineString<f64>) -> Option<Projection> {
    let proj = LocalProjection::new(point);
    let origin = Point::new(0.0, 0.0);
    let mut best: Option<(f64, Coord<f64>, f64)> = None;

    for sub in line.lines() {
        let local = Line::new(proj.project(sub.start), proj.project(sub.end));
        let closest = match local.closest_point(&origin) {
            Closest::SinglePoint(p) | Closest::Intersection(p) => p,
            Closest::Indeterminate => continue,
        };
        let distance = Euclidean.distance(origin, closest);
        let bearing = calculate_heading(local.start, local.end);
        if best.is_none_or(|(d, _, _)| distance < d) {
            best = Some((distance, closest.0, bearing));
        }
    }

    best.map(|(distance, c, bearing)| Projection {
        point_on_line: proj.unproject(c),
        distance,
        bearing,
    })
}

/// Compass bearing from `from` to `to` in projected meters, degrees in [0, 360).
pub fn calculate_heading(from: Coord<f64>, to: Coord<f64>) -> f64 {
    let dx = to.x - from.x;
    let dy = to.y - from.y;
    dx.atan2(dy).to_degrees().rem_euclid(360.0)
}

/// Smallest absolute difference between two headings, in [0, 180].
pub fn angle_difference(a: f64, b: f64) -> f64 {
    let diff = (a - b).rem_euclid(360.0);
    diff.min(360.0 - diff)
}

/// Heading difference against a road. Two-way roads accept either direction of
/// travel, which folds the difference into [0, 90].
pub fn heading_difference(observed: f64, road_bearing: f64, is_oneway: bool) -> f64 {
    let diff = angle_difference(observed, road_bearing);
    if is_oneway { diff } else { diff.min(180.0 - diff) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn projection_round_trips_near_origin() {
        let proj = LocalProjection::new(Point::new(4.35, 50.85));
        let local = Coord { x: 120.0, y: -35.0 };
        let back = proj.project(proj.unproject(local).0);
        assert!((back.x - local.x).abs() < 1e-6);
        assert!((back.y - local.y).abs() < 1e-6);
    }

    #[test]
    fn perpendicular_distance_to_straight_road() {
        let proj = LocalProjection::new(Point::new(4.35, 50.85));
        let line = LineString::from(vec![
            proj.unproject(Coord { x: -50.0, y: 0.0 }).0,
            proj.unproject(Coord { x: 50.0, y: 0.0 }).0,
        ]);
        let point = proj.unproject(Coord { x: 10.0, y: 5.0 });

        let hit = project_onto_line(point, &line).unwrap();
        assert!((hit.distance - 5.0).abs() < 0.01, "distance {}", hit.distance);
        assert!((hit.bearing - 90.0).abs() < 0.01, "bearing {}", hit.bearing);
    }

    #[test]
    fn distance_beyond_end_point_is_to_the_end() {
        let proj = LocalProjection::new(Point::new(0.0, 0.0));
        let line = LineString::from(vec![
            proj.unproject(Coord { x: 0.0, y: 0.0 }).0,
            proj.unproject(Coord { x: 0.0, y: 100.0 }).0,
        ]);
        let point = proj.unproject(Coord { x: 0.0, y: 110.0 });
        let hit = project_onto_line(point, &line).unwrap();
        assert!((hit.distance - 10.0).abs() < 0.01);
    }

    #[test]
    fn heading_folds_for_two_way_roads() {
        assert_eq!(angle_difference(350.0, 10.0), 20.0);
        assert_eq!(heading_difference(270.0, 90.0, false), 0.0);
        assert_eq!(heading_difference(270.0, 90.0, true), 180.0);
        assert_eq!(heading_difference(100.0, 0.0, false), 80.0);
    }
}
