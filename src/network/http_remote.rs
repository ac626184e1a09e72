use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{header, Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use super::frame::{parse_change, FrameDecoder};
use super::{NetworkError, RemoteStore, Subscription};
use crate::model::SyncRecord;

const SUBSCRIPTION_BUFFER: usize = 256;

/// Record shape on the wire. Dirty state is local-only and never sent.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    last_modified_ms: u64,
    #[serde(default)]
    is_deleted: bool,
    #[serde(default)]
    data: Value,
}

impl WireRecord {
    fn from_record(record: &SyncRecord) -> Self {
        Self {
            id: Some(record.id.clone()),
            last_modified_ms: record.last_modified_ms,
            is_deleted: record.is_deleted,
            data: record.data.clone(),
        }
    }

    fn into_record(self, key: &str) -> SyncRecord {
        SyncRecord {
            id: self.id.unwrap_or_else(|| key.to_string()),
            last_modified_ms: self.last_modified_ms,
            is_dirty: false,
            is_deleted: self.is_deleted,
            data: self.data,
        }
    }
}

/// REST + event-stream backend.
///
/// Layout: `GET {base}/{collection}.json` returns an object keyed by record
/// id (or `null` when absent), `PUT {base}/{collection}/{id}.json` writes one
/// record, the same collection URL with `Accept: text/event-stream` streams
/// changes, and `POST {base}/outbox/{topic}.json` delivers outbox payloads.
#[derive(Clone)]
pub struct HttpRemoteStore {
    client: Client,
    base_url: String,
    auth_token: Option<String>,
    timeout: Duration,
}

impl HttpRemoteStore {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, NetworkError> {
        // No client-wide timeout: it would also cut long-lived change streams.
        let client = Client::builder().connect_timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_token: None,
            timeout,
        })
    }

    pub fn with_auth_token(mut self, token: String) -> Self {
        self.auth_token = Some(token);
        self
    }

    fn collection_url(&self, collection: &str) -> String {
        format!("{}/{}.json", self.base_url, collection)
    }

    fn record_url(&self, collection: &str, id: &str) -> String {
        format!("{}/{}/{}.json", self.base_url, collection, id)
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.auth_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn expect_success(resp: Response) -> Result<Response, NetworkError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(NetworkError::StatusError {
            status: status.as_u16(),
            body,
        })
    }
}

/// Decode a collection body, skipping records that fail to parse.
pub(crate) fn decode_collection(collection: &str, body: &str) -> Result<Vec<SyncRecord>, NetworkError> {
    let trimmed = body.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(Vec::new());
    }

    let entries: Vec<(String, Value)> = match serde_json::from_str(trimmed)? {
        Value::Object(map) => map.into_iter().collect(),
        Value::Array(items) => items
            .into_iter()
            .enumerate()
            .map(|(i, v)| (i.to_string(), v))
            .collect(),
        other => {
            return Err(NetworkError::SerializationError(format!(
                "collection '{collection}' is not an object: {other}"
            )))
        }
    };

    let mut records = Vec::with_capacity(entries.len());
    for (key, value) in entries {
        if value.is_null() {
            continue;
        }
        match serde_json::from_value::<WireRecord>(value) {
            Ok(wire) => records.push(wire.into_record(&key)),
            Err(e) => log::warn!("Skipping malformed record '{key}' in '{collection}': {e}"),
        }
    }
    Ok(records)
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn fetch(&self, collection: &str) -> Result<Vec<SyncRecord>, NetworkError> {
        let resp = self
            .authorize(self.client.get(self.collection_url(collection)))
            .timeout(self.timeout)
            .send()
            .await?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let body = Self::expect_success(resp).await?.text().await?;
        decode_collection(collection, &body)
    }

    async fn put(&self, collection: &str, record: &SyncRecord) -> Result<(), NetworkError> {
        let resp = self
            .authorize(self.client.put(self.record_url(collection, &record.id)))
            .timeout(self.timeout)
            .json(&WireRecord::from_record(record))
            .send()
            .await?;
        Self::expect_success(resp).await?;
        Ok(())
    }

    async fn subscribe(&self, collection: &str) -> Result<Subscription, NetworkError> {
        let resp = self
            .authorize(self.client.get(self.collection_url(collection)))
            .header(header::ACCEPT, "text/event-stream")
            .send()
            .await?;
        let resp = Self::expect_success(resp).await?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
        let collection = collection.to_string();

        tokio::spawn(async move {
            let mut stream = resp.bytes_stream();
            let mut decoder = FrameDecoder::new();

            loop {
                tokio::select! {
                    _ = &mut cancel_rx => {
                        log::debug!("Change stream for '{collection}' cancelled");
                        return;
                    }
                    chunk = stream.next() => match chunk {
                        Some(Ok(bytes)) => {
                            for frame in decoder.push(&bytes) {
                                match parse_change(&collection, &frame) {
                                    Ok(Some(event)) => {
                                        if tx.send(event).await.is_err() {
                                            return;
                                        }
                                    }
                                    Ok(None) => {}
                                    Err(NetworkError::StreamClosed(reason)) => {
                                        log::warn!("Change stream for '{collection}' closed by server: {reason}");
                                        return;
                                    }
                                    Err(e) => {
                                        log::warn!("Skipping malformed frame on '{collection}': {e}");
                                    }
                                }
                            }
                        }
                        Some(Err(e)) => {
                            log::warn!("Change stream for '{collection}' failed: {e}");
                            return;
                        }
                        None => {
                            log::info!("Change stream for '{collection}' ended");
                            return;
                        }
                    }
                }
            }
        });

        Ok(Subscription::new(rx).with_cancel(cancel_tx))
    }

    async fn send(&self, topic: &str, payload: &[u8]) -> Result<(), NetworkError> {
        let content_type = if serde_json::from_slice::<Value>(payload).is_ok() {
            "application/json"
        } else {
            "application/octet-stream"
        };
        let resp = self
            .authorize(
                self.client
                    .post(format!("{}/outbox/{}.json", self.base_url, topic)),
            )
            .timeout(self.timeout)
            .header(header::CONTENT_TYPE, content_type)
            .body(payload.to_vec())
            .send()
            .await?;
        Self::expect_success(resp).await?;
        Ok(())
    }

    async fn probe(&self) -> bool {
        let url = format!("{}/.json?shallow=true", self.base_url);
        match self
            .authorize(self.client.get(url))
            .timeout(self.timeout)
            .send()
            .await
        {
            Ok(resp) => !resp.status().is_server_error(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_and_empty_bodies_are_empty_collections() {
        assert!(decode_collection("c", "null").unwrap().is_empty());
        assert!(decode_collection("c", "  ").unwrap().is_empty());
    }

    #[test]
    fn malformed_records_are_skipped_not_fatal() {
        let body = r#"{
            "a": {"last_modified_ms": 5, "data": {"name": "A"}},
            "b": {"data": "missing timestamp"},
            "c": {"id": "c", "last_modified_ms": 9, "is_deleted": true}
        }"#;
        let mut records = decode_collection("companies", body).unwrap();
        records.sort_by(|x, y| x.id.cmp(&y.id));

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, "a");
        assert_eq!(records[0].data["name"], "A");
        assert!(!records[0].is_dirty);
        assert!(records[1].is_deleted);
    }

    #[test]
    fn array_bodies_skip_holes() {
        let body = r#"[null, {"last_modified_ms": 1}]"#;
        let records = decode_collection("c", body).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "1");
    }

    #[test]
    fn scalar_body_is_a_serialization_error() {
        assert!(matches!(
            decode_collection("c", "42"),
            Err(NetworkError::SerializationError(_))
        ));
    }

    #[test]
    fn urls_are_built_from_trimmed_base() {
        let remote = HttpRemoteStore::new("http://localhost:9000/", Duration::from_secs(1)).unwrap();
        assert_eq!(remote.collection_url("companies"), "http://localhost:9000/companies.json");
        assert_eq!(
            remote.record_url("companies", "c1"),
            "http://localhost:9000/companies/c1.json"
        );
    }
}
