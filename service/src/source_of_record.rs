//! HTTP client for the authoritative inventory system.
//!
//! ```text
//! GET {base}/positions/{locationId}/{itemId}   ->   200 { "onHandQty": 45 }
//!                                               ->   404 (key not tracked)
//! ```

use futures::stream::{self, StreamExt, TryStreamExt};
use inventory_sync_core::position::PositionKey;
use inventory_sync_core::reconciliation::{SourceOfRecord, SourceOfRecordError};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

const CONCURRENT_REQUESTS: usize = 8;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OnHandResponse {
    on_hand_qty: u64,
}

/// [`SourceOfRecord`] over the HTTP API above.
///
/// Any failure other than a 404 fails the whole query, so a cycle never
/// compares against a partial picture.
#[derive(Debug, Clone)]
pub struct HttpSourceOfRecord {
    client: reqwest::Client,
    base: Url,
    timeout: Duration,
}

impl HttpSourceOfRecord {
    /// Create a client for `base_url` with a per-request `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`SourceOfRecordError::InvalidResponse`] if the URL cannot be
    /// used as a base, or [`SourceOfRecordError::Unreachable`] if the HTTP
    /// client cannot be built.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, SourceOfRecordError> {
        let base = Url::parse(base_url)
            .ok()
            .filter(|url| !url.cannot_be_a_base())
            .ok_or_else(|| {
                SourceOfRecordError::InvalidResponse(format!("unusable base URL {base_url:?}"))
            })?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SourceOfRecordError::Unreachable(e.to_string()))?;
        Ok(Self {
            client,
            base,
            timeout,
        })
    }

    fn url_for(&self, key: &PositionKey) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(["positions", key.location_id.as_str(), key.item_id.as_str()]);
        }
        url
    }

    fn classify(&self, error: &reqwest::Error) -> SourceOfRecordError {
        if error.is_timeout() {
            SourceOfRecordError::Timeout(self.timeout)
        } else if error.is_decode() {
            SourceOfRecordError::InvalidResponse(error.to_string())
        } else {
            SourceOfRecordError::Unreachable(error.to_string())
        }
    }

    async fn fetch(&self, key: &PositionKey) -> Result<Option<u64>, SourceOfRecordError> {
        let response = self
            .client
            .get(self.url_for(key))
            .send()
            .await
            .map_err(|e| self.classify(&e))?;

        match response.status() {
            StatusCode::NOT_FOUND => {
                tracing::debug!(key = %key, "Source of record does not track position");
                Ok(None)
            },
            status if status.is_success() => {
                let body: OnHandResponse = response.json().await.map_err(|e| self.classify(&e))?;
                Ok(Some(body.on_hand_qty))
            },
            status if status.is_server_error() => Err(SourceOfRecordError::Unreachable(format!(
                "{key}: HTTP {status}"
            ))),
            status => Err(SourceOfRecordError::InvalidResponse(format!(
                "{key}: HTTP {status}"
            ))),
        }
    }
}

impl SourceOfRecord for HttpSourceOfRecord {
    fn on_hand<'a>(
        &'a self,
        keys: &'a [PositionKey],
    ) -> Pin<Box<dyn Future<Output = Result<HashMap<PositionKey, u64>, SourceOfRecordError>> + Send + 'a>>
    {
        Box::pin(async move {
            stream::iter(keys)
                .map(|key| async move { self.fetch(key).await.map(|qty| (key, qty)) })
                .buffer_unordered(CONCURRENT_REQUESTS)
                .try_filter_map(|(key, qty)| async move { Ok(qty.map(|q| (key.clone(), q))) })
                .try_collect()
                .await
        })
    }
}
