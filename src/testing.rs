//! Shared fixtures for unit tests: a scripted session client, a local HTTP
//! receiver that records what it is sent, and scratch directories.

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::Router;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::media::MediaError;
use crate::session::{MediaPayload, SessionClient};

pub fn scratch_dir(label: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("wa-relay-{}-{}", label, uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// Session client that serves one canned attachment, or none.
pub struct FakeSession {
    media: Option<MediaPayload>,
}

impl FakeSession {
    pub fn with_media(data: &[u8], mimetype: &str, filename: Option<&str>) -> Self {
        Self {
            media: Some(MediaPayload {
                data: data.to_vec(),
                mimetype: mimetype.to_string(),
                filename: filename.map(str::to_string),
            }),
        }
    }

    pub fn without_media() -> Self {
        Self { media: None }
    }
}

#[async_trait]
impl SessionClient for FakeSession {
    async fn download_media(&self, message_id: &str) -> Result<MediaPayload, MediaError> {
        self.media.clone().ok_or_else(|| MediaError::Unavailable {
            message_id: message_id.to_string(),
            reason: "no media in fake session".to_string(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ReceivedRequest {
    pub path: String,
    pub authorization: Option<String>,
    pub content_type: Option<String>,
    pub body: serde_json::Value,
}

#[derive(Clone)]
struct ReceiverState {
    statuses: Arc<Vec<u16>>,
    requests: Arc<Mutex<Vec<ReceivedRequest>>>,
}

/// Local HTTP endpoint answering with the scripted statuses in order; the
/// last status repeats once the script runs out.
pub struct Receiver {
    pub base_url: String,
    requests: Arc<Mutex<Vec<ReceivedRequest>>>,
}

impl Receiver {
    pub async fn spawn(statuses: &[u16]) -> Self {
        let state = ReceiverState {
            statuses: Arc::new(statuses.to_vec()),
            requests: Arc::new(Mutex::new(Vec::new())),
        };
        let requests = state.requests.clone();

        let app = Router::new().fallback(record).with_state(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{}", addr),
            requests,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub fn requests(&self) -> Vec<ReceivedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

async fn record(
    State(state): State<ReceiverState>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let header_str = |name: header::HeaderName| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    let mut requests = state.requests.lock().unwrap();
    requests.push(ReceivedRequest {
        path: uri.path().to_string(),
        authorization: header_str(header::AUTHORIZATION),
        content_type: header_str(header::CONTENT_TYPE),
        body: serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null),
    });

    let index = (requests.len() - 1).min(state.statuses.len().saturating_sub(1));
    let code = state.statuses.get(index).copied().unwrap_or(200);
    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

/// A URL on a port nothing listens on.
pub fn unreachable_url() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    format!("http://127.0.0.1:{}", port)
}

/// A URL whose listener accepts connections and never answers.
pub async fn silent_url() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    format!("http://{}", addr)
}
