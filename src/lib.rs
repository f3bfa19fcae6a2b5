pub mod buffer;
pub mod config;
pub mod db;
pub mod error;
pub mod index;
pub mod metrics;
pub mod models;
pub mod sender;
pub mod service;
mod utils;
pub mod windowing;

use std::sync::Arc;

use anyhow::{Context, Result};
use log::{info, warn};

pub use buffer::ReadingBuffer;
pub use config::AppConfig;
pub use index::{open_index, VectorIndex};
pub use models::{Reading, SessionHandle, StreamKind};
pub use sender::{ReliableSender, SenderController};
pub use service::SensorService;
pub use windowing::{WindowAssembler, WindowConfig};

use metrics::SenderMetrics;
use sender::{DeliveryChain, HttpTransport, Transport};

/// Header carrying the device key on primary-channel requests.
const DEVICE_KEY_HEADER: &str = "X-Device-Key";

/// Delivery channels for `stream`: the primary server first, then its webhooks.
pub fn delivery_chain(config: &AppConfig, stream: StreamKind) -> Result<DeliveryChain> {
    let timeout = config.sender.request_timeout();

    let primary = match config.primary.active_url() {
        Some(url) => {
            let transport = HttpTransport::per_event(url, timeout)?
                .with_header(DEVICE_KEY_HEADER, config.primary.device_key.clone());
            Some(Arc::new(transport) as Arc<dyn Transport>)
        }
        None => None,
    };

    let fallbacks = config
        .fallbacks
        .urls(stream)
        .iter()
        .map(|url| {
            HttpTransport::webhook(url.clone(), timeout)
                .map(|transport| Arc::new(transport) as Arc<dyn Transport>)
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(DeliveryChain::new(primary, fallbacks))
}

/// Edge agent: one sender per stream until Ctrl-C.
pub async fn run() -> Result<()> {
    // RUST_LOG wins; otherwise info.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("gaitlink edge agent starting up...");

    let config = AppConfig::load()?;
    let mut controller = SenderController::new();

    for stream in StreamKind::ALL {
        let path = config.buffer.path(stream);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let buffer = ReadingBuffer::open(path, stream)?;
        let chain = delivery_chain(&config, stream)?;
        if chain.is_empty() {
            warn!(
                "No delivery channel configured for {}; records will accumulate",
                stream.as_str()
            );
        }

        let sender = ReliableSender::new(
            buffer,
            chain,
            config.sender.to_sender_config(),
            SenderMetrics::new(),
        )?;
        controller.start(sender)?;
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");

    controller.stop_all().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_has_primary_then_stream_webhooks() {
        let mut config = AppConfig::default();
        config.primary.server_url = Some("http://hub:4100".into());
        config.fallbacks.foot_urls = vec!["http://a/hook".into(), "http://b/hook".into()];

        assert_eq!(delivery_chain(&config, StreamKind::Foot).unwrap().len(), 3);
        assert_eq!(delivery_chain(&config, StreamKind::Inertial).unwrap().len(), 1);

        config.primary.enabled = false;
        assert!(delivery_chain(&config, StreamKind::Inertial)
            .unwrap()
            .is_empty());
    }
}
