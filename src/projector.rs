//! ==============================================================================
//! projector.rs - sensor collection -> map features, map clicks -> camera moves
//! ==============================================================================
//!
//! purpose:
//!     the map surface clusters points itself (zoom/pixel based). this module
//!     only feeds it: a geojson FeatureCollection rebuilt on every collection
//!     change, plus the fixed cluster source options.
//!
//! ```text
//!     it also resolves the two interactions the map reports back:
//!     - cluster click  -> ease to the expansion zoom the ENGINE computed
//!     - point click    -> select the sensor + ease to it at street zoom
//! ```
//!
//! relationships:
//!     - reads: sync.rs snapshots
//!     - writes: sync.rs selection (point click only)
//!
//! ==============================================================================

use serde::{Deserialize, Serialize};

use crate::domain::{SensorCollection, SensorId, SensorRecord, SensorStatus};
use crate::geo::GeoPoint;
use crate::sync::Synchronizer;

/// above this zoom the surface stops clustering
pub const CLUSTER_MAX_ZOOM: u8 = 14;
/// cluster radius in screen pixels
pub const CLUSTER_RADIUS_PX: u16 = 50;
/// zoom used when focusing a single sensor
pub const POINT_FOCUS_ZOOM: f64 = 15.0;

// ==============================================================================
// geojson
// ==============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub struct FeatureCollection {
    pub features: Vec<Feature>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub struct Feature {
    pub geometry: Point,
    pub properties: FeatureProperties,
}

/// `coordinates` is [longitude, latitude]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub struct Point {
    pub coordinates: [f64; 2],
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureProperties {
    pub id: SensorId,
    pub status: SensorStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub smoke: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub humidity: Option<f64>,
}

/// clustering parameters handed to the map source with the data
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSourceOptions {
    pub cluster: bool,
    pub cluster_max_zoom: u8,
    pub cluster_radius: u16,
}

impl Default for ClusterSourceOptions {
    fn default() -> Self {
        Self {
            cluster: true,
            cluster_max_zoom: CLUSTER_MAX_ZOOM,
            cluster_radius: CLUSTER_RADIUS_PX,
        }
    }
}

// ==============================================================================
// projection
// ==============================================================================

fn feature(sensor: &SensorRecord) -> Option<Feature> {
    let position = sensor.position()?;
    Some(Feature {
        geometry: Point {
            coordinates: [position.lon, position.lat],
        },
        properties: FeatureProperties {
            id: sensor.id.clone(),
            status: sensor.status,
            name: sensor.name.clone(),
            temperature: sensor.temperature,
            smoke: sensor.smoke,
            humidity: sensor.humidity,
        },
    })
}

/// one point feature per positioned sensor, in collection order
pub fn project(collection: &SensorCollection) -> FeatureCollection {
    project_records(collection.records())
}

/// same as `project` for an already filtered selection of records
pub fn project_records<'a>(records: impl IntoIterator<Item = &'a SensorRecord>) -> FeatureCollection {
    FeatureCollection {
        features: records.into_iter().filter_map(feature).collect(),
    }
}

// ==============================================================================
// interaction
// ==============================================================================

/// what the map surface reports when something is clicked
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MapInteraction {
    /// `expansion_zoom` comes from the engine's own cluster index
    ClusterClick { center: GeoPoint, expansion_zoom: f64 },
    PointClick { id: SensorId, center: GeoPoint },
}

/// "ease the camera to here"
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CameraInstruction {
    pub center: GeoPoint,
    pub zoom: f64,
}

/// resolve a click. point clicks also move the synchronizer's selection.
pub fn resolve_interaction(sync: &mut Synchronizer, interaction: MapInteraction) -> CameraInstruction {
    match interaction {
        MapInteraction::ClusterClick {
            center,
            expansion_zoom,
        } => CameraInstruction {
            center,
            zoom: expansion_zoom,
        },
        MapInteraction::PointClick { id, center } => {
            tracing::debug!(%id, "map point selected");
            sync.set_selection(Some(id));
            CameraInstruction {
                center,
                zoom: POINT_FOCUS_ZOOM,
            }
        }
    }
}
