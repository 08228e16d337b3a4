use log::error;
use std::sync::Arc;

use super::core::{Collector, Desc, MetricSink};
use super::registry::CollectorDeps;
use crate::error::{ExporterError, Result};
use crate::helix::HelixApi;

pub(super) const NAME: &str = "channel_viewers_total";

/// Current viewer count of the live channels
pub struct ChannelViewersCollector {
    client: Arc<dyn HelixApi>,
    channels: Vec<String>,
    viewers: Arc<Desc>,
}

impl ChannelViewersCollector {
    pub fn new(client: Arc<dyn HelixApi>, channels: Vec<String>) -> Self {
        Self {
            client,
            channels,
            viewers: Desc::gauge(
                "",
                NAME,
                "Is the total number of viewers on an online twitch channel.",
                &["username", "game"],
            ),
        }
    }
}

pub(super) async fn build(deps: CollectorDeps) -> Result<Arc<dyn Collector>> {
    Ok(Arc::new(ChannelViewersCollector::new(deps.client, deps.channels)))
}

#[async_trait::async_trait]
impl Collector for ChannelViewersCollector {
    async fn update(&self, sink: &MetricSink) -> Result<()> {
        if self.channels.is_empty() {
            return Err(ExporterError::NoData);
        }

        let streams = self
            .client
            .get_streams(&self.channels)
            .await?
            .into_data("get streams")
            .map_err(|e| {
                error!("Could not get streams: {}", e);
                e
            })?;

        // offline channels are simply absent
        for stream in &streams {
            sink.emit(
                &self.viewers,
                stream.viewer_count as f64,
                &[&stream.user_login, &stream.game_name],
            );
        }
        Ok(())
    }
}
