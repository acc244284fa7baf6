use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Response, StatusCode};
use serde_json::Value;
use url::Url;

use crate::backend::{MetricSink, SearchBackend};
use crate::error::{Error, Result};
use crate::metrics::MetricRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpOptions {
    pub timeout: Duration,
    /// When false, TLS certificates are not verified (self-hosted clusters).
    pub verify_certs: bool,
    /// Idle connections kept per host; match the engine's concurrency.
    pub max_connections: usize,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            verify_certs: true,
            max_connections: 8,
        }
    }
}

/// Search backend and metric sink speaking the Elasticsearch/OpenSearch REST API.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    base: Url,
}

impl HttpBackend {
    pub fn new(url: &str, options: HttpOptions) -> Result<Self> {
        let base =
            Url::parse(url).map_err(|e| Error::Config(format!("invalid backend url '{url}': {e}")))?;
        if base.cannot_be_a_base() {
            return Err(Error::Config(format!("backend url '{url}' cannot be a base")));
        }
        if !options.verify_certs {
            log::warn!("TLS certificate verification is disabled for {base}");
        }
        let client = Client::builder()
            .timeout(options.timeout)
            .danger_accept_invalid_certs(!options.verify_certs)
            .pool_max_idle_per_host(options.max_connections.max(1))
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, base })
    }

    /// Base URL with `segments` appended as path segments.
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| Error::Config(format!("backend url '{}' cannot be a base", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

/// Pass successful responses through; classify the rest.
async fn check_status(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Err(Error::BackendUnavailable(format!("{status}: {body}")))
    } else {
        Err(Error::BackendRejected {
            status: status.as_u16(),
            message: body,
        })
    }
}

/// Newline-delimited `_bulk` body: an index action line followed by the document.
pub fn bulk_body(index: &str, records: &[MetricRecord]) -> Result<String> {
    let mut body = String::new();
    for record in records {
        let action = serde_json::json!({ "index": { "_index": index, "_id": record.uuid } });
        let doc = serde_json::to_string(record)
            .map_err(|e| Error::SinkWrite(format!("cannot serialize {}: {e}", record.uuid)))?;
        body.push_str(&action.to_string());
        body.push('\n');
        body.push_str(&doc);
        body.push('\n');
    }
    Ok(body)
}

/// First item-level failure reported by a `_bulk` response, if any.
fn bulk_failure(response: &Value) -> Option<String> {
    if !response.get("errors").and_then(Value::as_bool).unwrap_or(false) {
        return None;
    }
    let reason = response
        .get("items")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|item| item.get("index").and_then(|i| i.get("error")))
        .map(|error| error.to_string())
        .next();
    Some(reason.unwrap_or_else(|| "bulk request reported errors".to_string()))
}

impl SearchBackend for HttpBackend {
    async fn search(&self, index: &str, query: &Value) -> Result<Value> {
        let url = self.endpoint(&[index, "_search"])?;
        log::debug!("POST {url}");
        let resp = self.client.post(url).json(query).send().await?;
        let resp = check_status(resp).await?;
        Ok(resp.json::<Value>().await?)
    }
}

impl MetricSink for HttpBackend {
    async fn write_batch(&self, index: &str, records: &[MetricRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let url = self.endpoint(&["_bulk"])?;
        let body = bulk_body(index, records)?;
        log::debug!("POST {url} ({} records)", records.len());
        let resp = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/x-ndjson")
            .body(body)
            .send()
            .await
            .map_err(|e| Error::SinkWrite(e.to_string()))?;
        let resp = check_status(resp)
            .await
            .map_err(|e| Error::SinkWrite(e.to_string()))?;
        let summary: Value = resp
            .json()
            .await
            .map_err(|e| Error::SinkWrite(e.to_string()))?;
        match bulk_failure(&summary) {
            Some(reason) => Err(Error::SinkWrite(reason)),
            None => Ok(()),
        }
    }
}
