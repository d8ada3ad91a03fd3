//! ==============================================================================
//! loader.rs - rest client and snapshot loader
//! ==============================================================================
//!
//! purpose:
//!     talks to the sensor backend over request/response calls.
//!     `GET /sensors` is the snapshot the synchronizer starts from; the other
//!     crud calls serve the admin view and share the same record shape.
//!
//! relationships:
//!     - used by: hub.rs (snapshot load on start, reconnect and manual reload)
//!     - implements: SnapshotSource (the seam tests replace)
//!
//! retries:
//!     none. a failed load is returned as FetchFailure and the caller decides.
//!
//! ==============================================================================

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, Url};

use crate::domain::{SensorCollection, SensorId, SensorRecord};
use crate::error::FetchFailure;

/// where the synchronizer gets its full snapshot from
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn load_all(&self) -> Result<SensorCollection, FetchFailure>;
}

/// reqwest-backed client for the sensor rest api
#[derive(Debug, Clone)]
pub struct SensorApi {
    client: Client,
    base_url: Url,
}

impl SensorApi {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, FetchFailure> {
        let raw = base_url.into();
        let base_url = Url::parse(raw.trim_end_matches('/'))
            .map_err(|e| FetchFailure::InvalidUrl(format!("{raw}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(FetchFailure::InvalidUrl(raw));
        }
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &str {
        self.base_url.as_str().trim_end_matches('/')
    }

    /// base url plus path segments, each percent-encoded on its own
    fn endpoint(&self, segments: &[&str]) -> Result<Url, FetchFailure> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| FetchFailure::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn sensor_url(&self, id: &SensorId) -> Result<Url, FetchFailure> {
        self.endpoint(&["sensors", &id.to_string()])
    }

    pub async fn fetch_sensors(&self) -> Result<Vec<SensorRecord>, FetchFailure> {
        let resp = self.client.get(self.endpoint(&["sensors"])?).send().await?;
        Ok(check(resp).await?.json().await?)
    }

    pub async fn fetch_sensor(&self, id: &SensorId) -> Result<SensorRecord, FetchFailure> {
        let resp = self.client.get(self.sensor_url(id)?).send().await?;
        Ok(check(resp).await?.json().await?)
    }

    pub async fn create_sensor(&self, record: &SensorRecord) -> Result<SensorRecord, FetchFailure> {
        let resp = self
            .client
            .post(self.endpoint(&["sensors"])?)
            .json(record)
            .send()
            .await?;
        Ok(check(resp).await?.json().await?)
    }

    pub async fn update_sensor(
        &self,
        id: &SensorId,
        record: &SensorRecord,
    ) -> Result<SensorRecord, FetchFailure> {
        let resp = self
            .client
            .put(self.sensor_url(id)?)
            .json(record)
            .send()
            .await?;
        Ok(check(resp).await?.json().await?)
    }

    pub async fn delete_sensor(&self, id: &SensorId) -> Result<(), FetchFailure> {
        let resp = self.client.delete(self.sensor_url(id)?).send().await?;
        check(resp).await?;
        Ok(())
    }
}

#[async_trait]
impl SnapshotSource for SensorApi {
    async fn load_all(&self) -> Result<SensorCollection, FetchFailure> {
        let records = self.fetch_sensors().await?;
        tracing::debug!(count = records.len(), base_url = %self.base_url, "snapshot fetched");
        Ok(SensorCollection::from(records))
    }
}

/// turn non-success statuses into FetchFailure::Status
async fn check(resp: Response) -> Result<Response, FetchFailure> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(FetchFailure::Status {
        status: status.as_u16(),
        body,
    })
}
