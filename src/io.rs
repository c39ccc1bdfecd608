use chrono::{DateTime, TimeZone, Utc};
use prost_types::Timestamp;

/// JSON file formats accepted by the command line tools.
pub mod feeds {
    use std::path::Path;

    use anyhow::{Context, Result};
    use chrono::{DateTime, Utc};
    use geo::{LineString, Point};
    use serde::{Deserialize, Serialize};
    use uuid::Uuid;

    use crate::model::{DefectObservation, RoadSegment};

    #[derive(Debug, Serialize, Deserialize, Clone)]
    pub struct SegmentRecord {
        pub id: i64,

        #[serde(default)]
        pub name: Option<String>,

        #[serde(rename = "roadType", default = "default_road_type")]
        pub road_type: String,

        /// `[lon, lat]` pairs
        pub coordinates: Vec<[f64; 2]>,

        #[serde(rename = "lengthMeters", default)]
        pub length_meters: Option<f64>,

        #[serde(rename = "trafficImportance", default)]
        pub traffic_importance: Option<u8>,

        #[serde(rename = "isOneway", default)]
        pub is_oneway: bool,

        #[serde(rename = "accessibilityScore", default)]
        pub accessibility_score: Option<f64>,

        #[serde(rename = "lastMaintenanceAt", default)]
        pub last_maintenance_at: Option<DateTime<Utc>>,
    }

    fn default_road_type() -> String {
        "unclassified".to_string()
    }

    impl From<SegmentRecord> for RoadSegment {
        fn from(val: SegmentRecord) -> Self {
            RoadSegment {
                id: val.id,
                name: val.name,
                road_type: val.road_type,
                geometry: LineString::from(
                    val.coordinates
                        .into_iter()
                        .map(|[lon, lat]| (lon, lat))
                        .collect::<Vec<_>>(),
                ),
                // Zero falls back to the geometric length
                length_meters: val.length_meters.unwrap_or(0.0),
                traffic_importance: val.traffic_importance,
                is_oneway: val.is_oneway,
                accessibility_score: val.accessibility_score,
                last_maintenance_at: val.last_maintenance_at,
            }
        }
    }

    /// Feeds are replayed after failures, so each record names its observation.
    #[derive(Debug, Serialize, Deserialize, Clone)]
    pub struct ObservationRecord {
        pub id: Uuid,

        pub latitude: Option<f64>,

        pub longitude: Option<f64>,

        #[serde(default)]
        pub heading: Option<f64>,

        #[serde(rename = "defectType")]
        pub defect_type: String,

        #[serde(rename = "severityScore")]
        pub severity_score: f64,

        #[serde(rename = "observedAt")]
        pub observed_at: DateTime<Utc>,
    }

    impl From<ObservationRecord> for DefectObservation {
        fn from(val: ObservationRecord) -> Self {
            DefectObservation {
                id: val.id,
                location: val
                    .longitude
                    .zip(val.latitude)
                    .map(|(lon, lat)| Point::new(lon, lat)),
                heading: val.heading,
                defect_type: val.defect_type,
                severity_score: val.severity_score,
                observed_at: val.observed_at,
            }
        }
    }

    pub fn read_segments(path: impl AsRef<Path>) -> Result<Vec<RoadSegment>> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .with_context(|| format!("reading road network {}", path.display()))?;
        let records: Vec<SegmentRecord> = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing road network {}", path.display()))?;
        Ok(records.into_iter().map(Into::into).collect())
    }

    pub fn read_observations(path: impl AsRef<Path>) -> Result<Vec<DefectObservation>> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .with_context(|| format!("reading observations {}", path.display()))?;
        let records: Vec<ObservationRecord> = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing observations {}", path.display()))?;
        Ok(records.into_iter().map(Into::into).collect())
    }

}

pub fn chrono_to_prost(dt: &DateTime<Utc>) -> Timestamp {
    Timestamp {
        seconds: dt.timestamp(),
        nanos: dt.timestamp_subsec_nanos() as i32,
    }
}

pub fn prost_to_chrono(ts: &Timestamp) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(ts.seconds, u32::try_from(ts.nanos).ok()?)
        .single()
}
