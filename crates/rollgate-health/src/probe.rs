//! Individual health probes.
//!
//! A probe checks one category and reports `Pass`, `Fail` (checked and
//! the service said no), or `Error` (the check itself could not run).
//! Probes do not time themselves out; the verifier bounds them.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use rollgate_core::{CategoryOutcome, HealthCategory};

/// One category check against a deployed service.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    fn category(&self) -> HealthCategory;

    async fn check(&self) -> CategoryOutcome;
}

/// Reasons a probe could not be carried out.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("invalid probe url {0}")]
    InvalidUrl(String),

    #[error("connect to {address} failed: {reason}")]
    Connect { address: String, reason: String },

    #[error("http handshake failed: {0}")]
    Handshake(String),

    #[error("request failed: {0}")]
    Request(String),
}

/// HTTP GET probe: 2xx passes, any other status fails.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    category: HealthCategory,
    url: String,
}

impl HttpProbe {
    pub fn new(category: HealthCategory, url: &str) -> Self {
        Self {
            category,
            url: url.to_string(),
        }
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    fn category(&self) -> HealthCategory {
        self.category
    }

    async fn check(&self) -> CategoryOutcome {
        match http_get_status(&self.url).await {
            Ok(status) if status.is_success() => CategoryOutcome::Pass,
            Ok(status) => {
                debug!(url = %self.url, %status, "http probe non-2xx");
                CategoryOutcome::Fail(format!("HTTP {status}"))
            }
            Err(e) => {
                debug!(url = %self.url, error = %e, "http probe could not run");
                CategoryOutcome::Error(e.to_string())
            }
        }
    }
}

/// Perform a plain HTTP/1.1 GET and return the response status.
pub async fn http_get_status(url: &str) -> Result<http::StatusCode, ProbeError> {
    let uri: http::Uri = url
        .parse()
        .map_err(|_| ProbeError::InvalidUrl(url.to_string()))?;
    if uri.scheme_str() != Some("http") {
        return Err(ProbeError::InvalidUrl(url.to_string()));
    }
    let host = uri
        .host()
        .ok_or_else(|| ProbeError::InvalidUrl(url.to_string()))?;
    let address = format!("{host}:{}", uri.port_u16().unwrap_or(80));
    let path = uri
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/")
        .to_string();

    let stream = tokio::net::TcpStream::connect(&address)
        .await
        .map_err(|e| ProbeError::Connect {
            address: address.clone(),
            reason: e.to_string(),
        })?;

    let io = hyper_util::rt::TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| ProbeError::Handshake(e.to_string()))?;

    // Drive the connection in the background.
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let req = http::Request::builder()
        .method("GET")
        .uri(path)
        .header("host", host)
        .header("user-agent", "rollgate-health/0.1")
        .body(http_body_util::Empty::<bytes::Bytes>::new())
        .map_err(|e| ProbeError::Request(e.to_string()))?;

    let resp = sender
        .send_request(req)
        .await
        .map_err(|e| ProbeError::Request(e.to_string()))?;
    Ok(resp.status())
}

/// WebSocket round trip: connect, ping, and wait for the pong.
#[derive(Debug, Clone)]
pub struct ChannelProbe {
    url: String,
}

impl ChannelProbe {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
        }
    }
}

#[async_trait]
impl HealthProbe for ChannelProbe {
    fn category(&self) -> HealthCategory {
        HealthCategory::Channel
    }

    async fn check(&self) -> CategoryOutcome {
        let (mut ws, _) = match tokio_tungstenite::connect_async(self.url.as_str()).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(url = %self.url, error = %e, "channel probe connect failed");
                return CategoryOutcome::Error(format!("connect failed: {e}"));
            }
        };

        let payload = b"rollgate".to_vec();
        if let Err(e) = ws.send(Message::Ping(payload.clone())).await {
            return CategoryOutcome::Error(format!("ping failed: {e}"));
        }

        let outcome = loop {
            match ws.next().await {
                Some(Ok(Message::Pong(data))) if data == payload => break CategoryOutcome::Pass,
                Some(Ok(Message::Close(frame))) => {
                    break CategoryOutcome::Fail(format!("channel closed: {frame:?}"));
                }
                // Unsolicited frames are tolerated while waiting for the pong.
                Some(Ok(_)) => continue,
                Some(Err(e)) => break CategoryOutcome::Fail(format!("channel error: {e}")),
                None => break CategoryOutcome::Fail("channel ended before pong".to_string()),
            }
        };

        let _ = ws.close(None).await;
        outcome
    }
}
