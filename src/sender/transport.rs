use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, warn};
use reqwest::{Client, StatusCode};
use serde::Serialize;

use crate::error::DeliveryError;
use crate::models::{Reading, StreamKind};

const ACCEPTED: [StatusCode; 3] = [StatusCode::OK, StatusCode::CREATED, StatusCode::ACCEPTED];

/// A channel that can take a whole batch of wire records.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &str;

    /// Cheap readiness check consulted before each attempt.
    async fn is_available(&self) -> bool {
        true
    }

    async fn deliver(&self, stream: StreamKind, records: &[Reading]) -> Result<(), DeliveryError>;
}

#[derive(Serialize)]
struct Batch<'a> {
    records: &'a [Reading],
}

#[derive(Debug, Clone)]
enum Target {
    Fixed(String),
    /// `{base}/{event name}`
    PerEvent(String),
}

/// Posts `{"records": [...]}` as JSON and accepts 200, 201 or 202.
pub struct HttpTransport {
    client: Client,
    target: Target,
    headers: Vec<(String, String)>,
    name: String,
}

impl HttpTransport {
    /// Every stream goes to the same URL (webhook style).
    pub fn webhook(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let url = url.into();
        Self::build(Target::Fixed(url.clone()), url, timeout)
    }

    /// Each stream goes to `base/<event name>`.
    pub fn per_event(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let base = base_url.into().trim_end_matches('/').to_string();
        Self::build(Target::PerEvent(base.clone()), base, timeout)
    }

    fn build(target: Target, name: String, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            target,
            headers: Vec::new(),
            name,
        })
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    fn url_for(&self, stream: StreamKind) -> String {
        match &self.target {
            Target::Fixed(url) => url.clone(),
            Target::PerEvent(base) => format!("{base}/{}", stream.event_name()),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, stream: StreamKind, records: &[Reading]) -> Result<(), DeliveryError> {
        let url = self.url_for(stream);
        let mut request = self.client.post(&url).json(&Batch { records });
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().await.map_err(|source| {
            if source.is_connect() {
                DeliveryError::Unavailable {
                    endpoint: url.clone(),
                }
            } else {
                DeliveryError::Http {
                    endpoint: url.clone(),
                    source,
                }
            }
        })?;

        let status = response.status();
        if ACCEPTED.contains(&status) {
            debug!("{url} accepted {} {} records", records.len(), stream.as_str());
            Ok(())
        } else {
            Err(DeliveryError::Rejected {
                endpoint: url,
                status: status.as_u16(),
            })
        }
    }
}

/// Primary channel first, then each fallback in order, until one accepts.
#[derive(Clone, Default)]
pub struct DeliveryChain {
    channels: Vec<Arc<dyn Transport>>,
}

impl DeliveryChain {
    pub fn new(primary: Option<Arc<dyn Transport>>, fallbacks: Vec<Arc<dyn Transport>>) -> Self {
        Self {
            channels: primary.into_iter().chain(fallbacks).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Deliver the batch as a whole. Returns the name of the channel that took it.
    pub async fn deliver(
        &self,
        stream: StreamKind,
        records: &[Reading],
    ) -> Result<String, DeliveryError> {
        let mut attempts = 0;
        for channel in &self.channels {
            if !channel.is_available().await {
                debug!("{} unavailable, trying next channel", channel.name());
                continue;
            }
            attempts += 1;
            match channel.deliver(stream, records).await {
                Ok(()) => return Ok(channel.name().to_string()),
                Err(err) => warn!("{} batch delivery failed: {err}", stream.as_str()),
            }
        }
        Err(DeliveryError::Exhausted { attempts })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FootData, FootSide};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    struct FakeTransport {
        name: &'static str,
        available: bool,
        accept: bool,
        calls: AtomicUsize,
    }

    impl FakeTransport {
        fn new(name: &'static str, available: bool, accept: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                available,
                accept,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        fn name(&self) -> &str {
            self.name
        }

        async fn is_available(&self) -> bool {
            self.available
        }

        async fn deliver(&self, _: StreamKind, _: &[Reading]) -> Result<(), DeliveryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.accept {
                Ok(())
            } else {
                Err(DeliveryError::Rejected {
                    endpoint: self.name.to_string(),
                    status: 503,
                })
            }
        }
    }

    fn sample() -> Vec<Reading> {
        vec![Reading::foot(
            "2024-05-01T10:00:00Z",
            "LEFT_FOOT",
            FootData {
                foot: FootSide::Left,
                max: 1.0,
                avg: 0.5,
                active_count: 2,
                values: vec![0.5; 18],
            },
        )]
    }

    /// Reply to a single request with `status_line`, returning what was received.
    async fn one_shot_server(status_line: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/hook", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = [0_u8; 8192];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                received.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&received).into_owned();
                if let Some(end) = text.find("\r\n\r\n") {
                    let length = text[..end]
                        .lines()
                        .filter_map(|line| line.split_once(':'))
                        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
                        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                        .unwrap_or(0);
                    if received.len() >= end + 4 + length {
                        break;
                    }
                }
            }
            let response =
                format!("HTTP/1.1 {status_line}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
            socket.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&received).into_owned()
        });
        (url, handle)
    }

    #[tokio::test]
    async fn webhook_posts_records_envelope() {
        let (url, server) = one_shot_server("202 Accepted").await;
        let transport = HttpTransport::webhook(url, Duration::from_secs(5))
            .unwrap()
            .with_header("X-Device-Key", "edge-1");

        transport.deliver(StreamKind::Foot, &sample()).await.unwrap();

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /hook"));
        assert!(request.to_ascii_lowercase().contains("x-device-key: edge-1"));
        let body = &request[request.find("\r\n\r\n").unwrap() + 4..];
        let json: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(json["records"][0]["device"], "LEFT_FOOT");
        assert_eq!(json["records"][0]["data"]["values"].as_array().unwrap().len(), 18);
    }

    #[tokio::test]
    async fn non_accepted_status_is_rejection() {
        let (url, _server) = one_shot_server("500 Internal Server Error").await;
        let transport = HttpTransport::webhook(url, Duration::from_secs(5)).unwrap();
        let err = transport.deliver(StreamKind::Foot, &sample()).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Rejected { status: 500, .. }));
    }

    #[tokio::test]
    async fn per_event_routes_by_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}/sensor/", listener.local_addr().unwrap());
        drop(listener);
        let transport = HttpTransport::per_event(base.clone(), Duration::from_secs(1)).unwrap();
        assert!(transport
            .url_for(StreamKind::Inertial)
            .ends_with("/sensor/accelerometer_data"));
        assert!(matches!(
            transport.deliver(StreamKind::Foot, &sample()).await,
            Err(DeliveryError::Unavailable { .. })
        ));
    }

    #[tokio::test]
    async fn chain_falls_back_in_order() {
        let primary = FakeTransport::new("primary", true, false);
        let offline = FakeTransport::new("offline", false, true);
        let webhook = FakeTransport::new("webhook", true, true);
        let spare = FakeTransport::new("spare", true, true);
        let chain = DeliveryChain::new(
            Some(primary.clone() as Arc<dyn Transport>),
            vec![
                offline.clone() as Arc<dyn Transport>,
                webhook.clone() as Arc<dyn Transport>,
                spare.clone() as Arc<dyn Transport>,
            ],
        );

        let channel = chain.deliver(StreamKind::Foot, &sample()).await.unwrap();
        assert_eq!(channel, "webhook");
        assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
        assert_eq!(offline.calls.load(Ordering::SeqCst), 0);
        assert_eq!(spare.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn chain_reports_exhaustion() {
        let chain = DeliveryChain::new(
            Some(FakeTransport::new("primary", true, false) as Arc<dyn Transport>),
            vec![FakeTransport::new("webhook", true, false) as Arc<dyn Transport>],
        );
        assert!(matches!(
            chain.deliver(StreamKind::Foot, &sample()).await,
            Err(DeliveryError::Exhausted { attempts: 2 })
        ));
        assert!(matches!(
            DeliveryChain::default().deliver(StreamKind::Foot, &sample()).await,
            Err(DeliveryError::Exhausted { attempts: 0 })
        ));
    }
}
