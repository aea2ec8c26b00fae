//! Upstream client tying together URLs, credentials and the transport.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::value::RawValue;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::chunked::BatchClient;
use crate::credentials::KeyRotator;
use crate::errors::UpstreamError;
use crate::models::Payloads;
use crate::request::{EndpointConfig, FetchMode, RequestBuilder};
use crate::transport::{RetryTransport, UpstreamRequest};

/// Field used to key array responses.
const ID_FIELD: &str = "id";

/// Fetches chunks from one endpoint, rotating credentials on failure.
pub struct UpstreamClient {
    name: String,
    builder: RequestBuilder,
    rotator: Arc<KeyRotator>,
    transport: Arc<RetryTransport>,
}

impl UpstreamClient {
    pub fn new(
        name: impl Into<String>,
        endpoint: &EndpointConfig,
        rotator: Arc<KeyRotator>,
        transport: Arc<RetryTransport>,
    ) -> Result<Self, UpstreamError> {
        Ok(Self {
            name: name.into(),
            builder: RequestBuilder::new(endpoint)?,
            rotator,
            transport,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl BatchClient for UpstreamClient {
    fn mode(&self) -> FetchMode {
        self.builder.mode()
    }

    async fn fetch_chunk(
        &self,
        cancel: &CancellationToken,
        ids: &[String],
    ) -> Result<Payloads, UpstreamError> {
        if ids.is_empty() {
            return Ok(Payloads::new());
        }

        let keys = self
            .rotator
            .available_keys(self.builder.requests_fine_interval());
        let label = format!("{} ({} ids)", self.name, ids.len());
        let builder = &self.builder;
        let transport = &self.transport;

        let response = self
            .rotator
            .try_with_keys(cancel, &keys, |credential| {
                let label = label.clone();
                async move {
                    let url = builder.build_url(ids, Some(&credential))?;
                    let request =
                        UpstreamRequest::new(url, format!("{} via {}", label, credential));
                    transport.execute(cancel, &request).await
                }
            })
            .await?;

        if response.attempts > 1 {
            info!(
                "{} succeeded after {} attempts in {:?}",
                label, response.attempts, response.elapsed
            );
        } else {
            debug!("{} fetched in {:?}", label, response.elapsed);
        }

        split_payloads(self.mode(), ids, response.body)
    }
}

/// Split a response body into per-identifier payloads.
///
/// Single mode keeps the whole body under the one requested id. Batch mode
/// accepts a JSON object keyed by id, or a JSON array whose elements carry
/// an `"id"` field. Payload bytes are kept exactly as the upstream sent them.
pub fn split_payloads(
    mode: FetchMode,
    ids: &[String],
    body: Bytes,
) -> Result<Payloads, UpstreamError> {
    let mut payloads = match mode {
        FetchMode::Single => {
            let mut payloads = Payloads::with_capacity(1);
            if let Some(id) = ids.first() {
                payloads.insert(id.clone(), body);
            }
            return Ok(payloads);
        }
        FetchMode::Batch => split_batch(&body)?,
    };

    let missing: Vec<&String> = ids.iter().filter(|id| !payloads.contains_key(*id)).collect();
    if !missing.is_empty() {
        debug!(
            "{} of {} requested ids missing from response",
            missing.len(),
            ids.len()
        );
    }

    // Only requested ids are kept
    payloads.retain(|id, _| ids.contains(id));
    Ok(payloads)
}

fn split_batch(body: &Bytes) -> Result<Payloads, UpstreamError> {
    let text = std::str::from_utf8(body)
        .map_err(|e| UpstreamError::InvalidResponse(format!("body is not UTF-8: {}", e)))?;
    let trimmed = text.trim_start();

    if trimmed.starts_with('{') {
        let object: HashMap<String, Box<RawValue>> = serde_json::from_str(text)
            .map_err(|e| UpstreamError::InvalidResponse(format!("expected a JSON object: {}", e)))?;
        return Ok(object
            .into_iter()
            .map(|(id, raw)| (id, Bytes::copy_from_slice(raw.get().as_bytes())))
            .collect());
    }

    if trimmed.starts_with('[') {
        let elements: Vec<Box<RawValue>> = serde_json::from_str(text)
            .map_err(|e| UpstreamError::InvalidResponse(format!("expected a JSON array: {}", e)))?;
        let mut payloads = Payloads::with_capacity(elements.len());
        for raw in elements {
            let id = serde_json::from_str::<HashMap<String, serde_json::Value>>(raw.get())
                .ok()
                .and_then(|fields| fields.get(ID_FIELD).and_then(|v| v.as_str().map(String::from)));
            match id {
                Some(id) => {
                    payloads.insert(id, Bytes::copy_from_slice(raw.get().as_bytes()));
                }
                None => debug!("Dropping array element without a string \"{}\" field", ID_FIELD),
            }
        }
        return Ok(payloads);
    }

    Err(UpstreamError::InvalidResponse(
        "expected a JSON object or array".to_string(),
    ))
}
