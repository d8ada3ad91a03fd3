//! list and map filter criteria shared by the dashboard views.

use serde::de::{IntoDeserializer, value::StrDeserializer};
use serde::{Deserialize, Deserializer};

use crate::domain::{lenient_f64, SensorRecord, SensorStatus};

/// every criterion is optional; an empty filter keeps everything.
///
/// a measurement bound only rejects sensors that report the measurement;
/// a sensor with no smoke reading is not filtered out by `smoke_min`.
///
/// query strings from the dashboard form send `status=all` and blank bounds
/// (`tempMin=`); both read as "no criterion".
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorFilter {
    #[serde(default, deserialize_with = "any_status")]
    pub status: Option<SensorStatus>,
    /// case-insensitive substring of the id
    pub search: Option<String>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub temp_min: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub temp_max: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub smoke_min: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub smoke_max: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub humidity_min: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub humidity_max: Option<f64>,
}

impl SensorFilter {
    pub fn matches(&self, sensor: &SensorRecord) -> bool {
        if let Some(status) = self.status {
            if sensor.status != status {
                return false;
            }
        }

        if let Some(search) = self.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            let id = sensor.id.to_string().to_lowercase();
            if !id.contains(&search.to_lowercase()) {
                return false;
            }
        }

        within(sensor.temperature, self.temp_min, self.temp_max)
            && within(sensor.smoke, self.smoke_min, self.smoke_max)
            && within(sensor.humidity, self.humidity_min, self.humidity_max)
    }

    pub fn apply<'a>(&self, sensors: impl IntoIterator<Item = &'a SensorRecord>) -> Vec<&'a SensorRecord> {
        sensors.into_iter().filter(|s| self.matches(s)).collect()
    }
}

/// `all` or blank means any status
fn any_status<'de, D>(deserializer: D) -> Result<Option<SensorStatus>, D::Error>
where
    D: Deserializer<'de>,
{
    let Some(raw) = Option::<String>::deserialize(deserializer)? else {
        return Ok(None);
    };
    let raw = raw.trim().to_ascii_lowercase();
    if raw.is_empty() || raw == "all" {
        return Ok(None);
    }
    let de: StrDeserializer<'_, D::Error> = raw.as_str().into_deserializer();
    SensorStatus::deserialize(de).map(Some)
}

fn within(value: Option<f64>, min: Option<f64>, max: Option<f64>) -> bool {
    let Some(v) = value else {
        return true;
    };
    min.map_or(true, |m| v >= m) && max.map_or(true, |m| v <= m)
}
