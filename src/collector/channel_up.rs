use log::error;
use std::sync::Arc;

use super::core::{Collector, Desc, MetricSink};
use super::registry::CollectorDeps;
use crate::error::{ExporterError, Result};
use crate::helix::HelixApi;

pub(super) const NAME: &str = "channel_up";

/// Reports whether each configured channel is live
pub struct ChannelUpCollector {
    client: Arc<dyn HelixApi>,
    channels: Vec<String>,
    channel_up: Arc<Desc>,
}

impl ChannelUpCollector {
    pub fn new(client: Arc<dyn HelixApi>, channels: Vec<String>) -> Self {
        Self {
            client,
            channels,
            channel_up: Desc::gauge("", NAME, "Is the channel live.", &["username", "game"]),
        }
    }
}

pub(super) async fn build(deps: CollectorDeps) -> Result<Arc<dyn Collector>> {
    Ok(Arc::new(ChannelUpCollector::new(deps.client, deps.channels)))
}

#[async_trait::async_trait]
impl Collector for ChannelUpCollector {
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

        for channel in &self.channels {
            let live = streams
                .iter()
                .find(|s| s.user_login.eq_ignore_ascii_case(channel));
            match live {
                Some(stream) => sink.emit(&self.channel_up, 1.0, &[channel, &stream.game_name]),
                None => sink.emit(&self.channel_up, 0.0, &[channel, ""]),
            }
        }
        Ok(())
    }
}
