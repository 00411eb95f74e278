//! Signaling over the FILE.io file-sharing service.
//!
//! FILE.io is not a pairing service, so the two peers coordinate through
//! plain file uploads acting as a shared mailbox. Every entry is named
//! `${session}_${kind}_${instance}.json` where `kind` is one of `ping`,
//! `sdp` or `candidate`, and `instance` tells one peer's postings apart
//! from the other's. Entry bodies are JSON blobs of the form
//! `{"type": <kind>, "payload": <base64 bytes>}` (payload omitted for
//! pings). Entries are uploaded with a 10 minute TTL, a single-download
//! cap and auto-delete, so the mailbox cleans itself up even if a peer
//! crashes before its own cleanup runs.
//!
//! The service rate-limits aggressively. All outbound requests from one
//! process are funneled through a single gate that enforces a minimum
//! spacing between requests and backs off on 429 responses.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use log::{debug, error, info};
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::{interval, sleep};
use tokio_util::sync::CancellationToken;

use crate::{FILE_IO_URL, POLL_INTERVAL, RATE_LIMIT_BACKOFF, REQUEST_SPACING};

const MULTIPART_BOUNDARY: &str = "---011000010111000001101001";

const KIND_PING: &str = "ping";
const KIND_SDP: &str = "sdp";
const KIND_CANDIDATE: &str = "candidate";

#[derive(Debug, Error)]
pub enum SignalError {
    /// No peer has announced itself in this session yet. The caller becomes
    /// the answerer and waits for an offer.
    #[error("no signaling candidate found")]
    NoCandidatesFound,
    #[error("{0} is empty")]
    EmptyConfig(&'static str),
    #[error("response status: {0}")]
    Status(StatusCode),
    #[error("request cannot be retried")]
    UnrepeatableRequest,
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// A remote posting picked up by the poll loop, in mailbox order.
#[derive(Debug)]
pub enum SignalEvent {
    Sdp(Vec<u8>),
    Candidate(Vec<u8>),
}

#[derive(Clone, Debug)]
pub struct MailboxConfig {
    pub api_key: String,
    pub session_id: String,
    pub instance_id: String,
}

pub struct Mailbox {
    cfg: MailboxConfig,
    client: reqwest::Client,
    request_gate: RequestGate,
}

#[derive(Debug, Deserialize)]
struct Files {
    #[serde(default)]
    nodes: Vec<FileNode>,
}

#[derive(Debug, Deserialize)]
struct FileNode {
    key: String,
    name: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(rename = "type")]
    kind: String,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        serialize_with = "payload_encode",
        deserialize_with = "payload_decode"
    )]
    payload: Option<Vec<u8>>,
}

fn payload_encode<S: Serializer>(payload: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
    match payload {
        Some(bytes) => s.serialize_str(&BASE64.encode(bytes)),
        None => s.serialize_none(),
    }
}

fn payload_decode<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
    let encoded: Option<String> = Option::deserialize(d)?;

    match encoded {
        Some(encoded) => BASE64
            .decode(encoded.as_bytes())
            .map(Some)
            .map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}

impl Mailbox {
    pub fn new(cfg: MailboxConfig) -> Result<Self, SignalError> {
        if cfg.api_key.is_empty() {
            return Err(SignalError::EmptyConfig("API key"));
        }
        if cfg.session_id.is_empty() {
            return Err(SignalError::EmptyConfig("session ID"));
        }
        if cfg.instance_id.is_empty() {
            return Err(SignalError::EmptyConfig("instance ID"));
        }

        Ok(Self {
            cfg,
            client: reqwest::Client::new(),
            request_gate: RequestGate::new(),
        })
    }

    /// Role election. Looks for a ping from the other peer: if none exists,
    /// posts our own ping and reports [`SignalError::NoCandidatesFound`]
    /// (become the answerer); otherwise consumes all pings and returns `Ok`
    /// (become the offerer and send an offer immediately).
    pub async fn ping(&self) -> Result<(), SignalError> {
        let pattern = format!("{}_{}", self.cfg.session_id, KIND_PING);
        let files = self.find(&pattern).await?;

        if files.nodes.is_empty() {
            self.upload(
                &self.entry_name(KIND_PING),
                &Content { kind: KIND_PING.into(), payload: None },
            )
            .await?;

            return Err(SignalError::NoCandidatesFound);
        }

        for node in files.nodes {
            if let Err(e) = self.delete(&node.key).await {
                error!("delete ping {}: {}", node.name, e);
            }
        }

        Ok(())
    }

    pub async fn send_sdp(&self, payload: Vec<u8>) -> Result<(), SignalError> {
        self.upload(
            &self.entry_name(KIND_SDP),
            &Content { kind: KIND_SDP.into(), payload: Some(payload) },
        )
        .await
    }

    pub async fn send_candidate(&self, payload: Vec<u8>) -> Result<(), SignalError> {
        self.upload(
            &self.entry_name(KIND_CANDIDATE),
            &Content { kind: KIND_CANDIDATE.into(), payload: Some(payload) },
        )
        .await
    }

    /// Polls the mailbox until cancellation, forwarding remote postings to
    /// `events` in creation order. Poll and download failures are logged and
    /// the loop keeps going. Cleanup runs exactly once, after the loop exits.
    pub async fn listen(&self, cancel: CancellationToken, events: mpsc::Sender<SignalEvent>) {
        let mut ticker = interval(POLL_INTERVAL);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sniff(&events).await {
                        error!("poll mailbox: {}", e);
                    }
                }
            }
        }

        self.clean_up().await;
    }

    async fn sniff(&self, events: &mpsc::Sender<SignalEvent>) -> Result<(), SignalError> {
        let files = self.find(&self.cfg.session_id).await?;

        for node in files.nodes {
            // Skip our own postings
            if node.name.contains(&self.cfg.instance_id) {
                continue;
            }

            let content = match self.download(&node.key).await {
                Ok(Some(content)) => content,
                Ok(None) => continue,
                Err(e) => {
                    error!("download {}: {}", node.name, e);
                    continue;
                }
            };

            let event = match content.kind.as_str() {
                KIND_SDP => SignalEvent::Sdp(content.payload.unwrap_or_default()),
                KIND_CANDIDATE => SignalEvent::Candidate(content.payload.unwrap_or_default()),
                _ => continue,
            };

            if events.send(event).await.is_err() {
                // Receiver is gone; the connection is shutting down.
                return Ok(());
            }
        }

        Ok(())
    }

    async fn clean_up(&self) {
        info!("cleaning up unused signaling files...");

        let files = match self.find(&self.cfg.session_id).await {
            Ok(files) => files,
            Err(e) => {
                error!("list session files: {}", e);
                return;
            }
        };

        for node in files.nodes {
            if let Err(e) = self.delete(&node.key).await {
                error!("delete {}: {}", node.name, e);
            }
        }
    }

    fn entry_name(&self, kind: &str) -> String {
        format!("{}_{}_{}.json", self.cfg.session_id, kind, self.cfg.instance_id)
    }

    async fn find(&self, pattern: &str) -> Result<Files, SignalError> {
        let url = format!("{}/?search={}&sort=created:asc", FILE_IO_URL, pattern);
        let resp = self
            .request(self.client.get(url).header(ACCEPT, "application/json"))
            .await?;

        if resp.status() != StatusCode::OK {
            return Err(SignalError::Status(resp.status()));
        }

        Ok(resp.json().await?)
    }

    /// Downloads one entry. `None` means the entry vanished between the
    /// search and the download (the service auto-deletes aggressively);
    /// that is tolerated but logged, since it can also mask a genuine
    /// mailbox inconsistency.
    async fn download(&self, key: &str) -> Result<Option<Content>, SignalError> {
        let url = format!("{}/{}", FILE_IO_URL, key);
        let resp = self.request(self.client.get(url).header(ACCEPT, "*/*")).await?;

        match resp.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => {
                debug!("entry {} already gone", key);
                return Ok(None);
            }
            status => return Err(SignalError::Status(status)),
        }

        let body = resp.bytes().await?;

        Ok(Some(serde_json::from_slice(&body)?))
    }

    /// Deletes one entry. A `403` means it was already consumed and removed
    /// by the service, which is fine.
    async fn delete(&self, key: &str) -> Result<(), SignalError> {
        let url = format!("{}/{}", FILE_IO_URL, key);
        let resp = self
            .request(self.client.delete(url).header(ACCEPT, "application/json"))
            .await?;

        match resp.status() {
            StatusCode::OK | StatusCode::FORBIDDEN => Ok(()),
            status => Err(SignalError::Status(status)),
        }
    }

    async fn upload(&self, name: &str, content: &Content) -> Result<(), SignalError> {
        let blob = serde_json::to_string(content)?;
        let body = multipart_body(name, &blob);

        let resp = self
            .request(
                self.client
                    .post(format!("{}/", FILE_IO_URL))
                    .header(ACCEPT, "application/json")
                    .header(
                        CONTENT_TYPE,
                        format!("multipart/form-data; boundary={}", MULTIPART_BOUNDARY),
                    )
                    .body(body),
            )
            .await?;

        if resp.status() != StatusCode::OK {
            return Err(SignalError::Status(resp.status()));
        }

        Ok(())
    }

    /// Sends one request through the process-wide gate. The gate stays held
    /// across the 429 backoff, so a throttled instance does not burn its
    /// retries racing itself.
    async fn request(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response, SignalError> {
        let builder = builder.header(AUTHORIZATION, self.cfg.api_key.as_str());
        let gate = self.request_gate.acquire().await;

        let resp = loop {
            // All bodies in this module are buffered, so cloning never fails.
            let attempt = builder.try_clone().ok_or(SignalError::UnrepeatableRequest)?;
            let resp = attempt.send().await?;

            if resp.status() == StatusCode::TOO_MANY_REQUESTS {
                info!("too many requests, retrying...");
                sleep(RATE_LIMIT_BACKOFF).await;
                continue;
            }

            break resp;
        };

        RequestGate::release_after(gate, REQUEST_SPACING);

        Ok(resp)
    }
}

/// Serialises outbound requests and enforces a minimum spacing between them:
/// the guard taken for a request is released by a background task only after
/// the spacing delay, so the next waiter cannot fire too early. Waiters are
/// queued by the underlying mutex.
struct RequestGate {
    inner: Arc<Mutex<()>>,
}

impl RequestGate {
    fn new() -> Self {
        Self { inner: Arc::new(Mutex::new(())) }
    }

    async fn acquire(&self) -> OwnedMutexGuard<()> {
        Arc::clone(&self.inner).lock_owned().await
    }

    fn release_after(guard: OwnedMutexGuard<()>, delay: std::time::Duration) {
        tokio::spawn(async move {
            sleep(delay).await;
            drop(guard);
        });
    }
}

fn multipart_body(name: &str, blob: &str) -> String {
    let b = MULTIPART_BOUNDARY;
    let mut body = String::new();

    body.push_str(&format!(
        "--{b}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{name}\"\r\n\
         Content-Type: application/octet-stream\r\n\r\n{blob}\r\n"
    ));

    for (field, value) in [("expires", "10m"), ("maxDownloads", "1"), ("autoDelete", "true")] {
        body.push_str(&format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"{field}\"\r\n\r\n{value}\r\n"
        ));
    }

    body.push_str(&format!("--{b}--\r\n"));

    body
}
