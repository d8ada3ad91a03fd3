//! ==============================================================================
//! proximity.rs - greedy proximity grouping for list views
//! ==============================================================================
//!
//! purpose:
//!     partitions sensors into spatial groups for the summary/list views.
//!     this is NOT the map clustering (the map engine does its own, see
//!     projector.rs).
//!
//! algorithm:
//!     single pass, input order. each sensor is compared against the FIRST
//!     member of every open group (in creation order) and joins the first one
//!     within the threshold; otherwise it opens a new group.
//!
//! ```text
//!     membership is order-sensitive and not transitive: two sensors can share
//!     a group while being farther apart than the threshold, and a sensor near
//!     a group's centroid can still be left out if it is far from the group's
//!     first member. downstream views rely on exactly this behaviour.
//! ```
//!
//! cost: O(n * g), fine for tens to a few hundred sensors.
//!
//! ==============================================================================

use serde::Serialize;

use crate::domain::SensorRecord;
use crate::geo::{distance_km, GeoPoint};

/// grouping distance used by the sensors page
pub const DEFAULT_THRESHOLD_KM: f64 = 10.0;

/// a derived group: centroid plus members in input order
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorGroup {
    pub center: GeoPoint,
    pub sensors: Vec<SensorRecord>,
}

impl SensorGroup {
    pub fn len(&self) -> usize {
        self.sensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sensors.is_empty()
    }
}

/// group sensors whose distance to a group's first member is within
/// `threshold_km`.
///
/// sensors without both coordinates cannot be placed and are skipped.
pub fn group_by_proximity<'a, I>(sensors: I, threshold_km: f64) -> Vec<SensorGroup>
where
    I: IntoIterator<Item = &'a SensorRecord>,
{
    // (reference point, members)
    let mut open: Vec<(GeoPoint, Vec<&SensorRecord>)> = Vec::new();

    for sensor in sensors {
        let Some(point) = sensor.position() else {
            continue;
        };

        match open
            .iter_mut()
            .find(|(reference, _)| distance_km(point, *reference) <= threshold_km)
        {
            Some((_, members)) => members.push(sensor),
            None => open.push((point, vec![sensor])),
        }
    }

    open.into_iter()
        .map(|(_, members)| SensorGroup {
            center: centroid(&members),
            sensors: members.into_iter().cloned().collect(),
        })
        .collect()
}

/// arithmetic mean of member coordinates. members are never empty here and
/// always carry a position.
#[allow(clippy::cast_precision_loss)]
fn centroid(members: &[&SensorRecord]) -> GeoPoint {
    let (lat_sum, lon_sum) = members
        .iter()
        .filter_map(|s| s.position())
        .fold((0.0, 0.0), |(lat, lon), p| (lat + p.lat, lon + p.lon));
    let n = members.len() as f64;
    GeoPoint::new(lat_sum / n, lon_sum / n)
}
