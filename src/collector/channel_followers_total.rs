use log::error;
use std::sync::Arc;

use super::core::{Collector, Desc, MetricSink};
use super::registry::CollectorDeps;
use crate::cache::LookupCache;
use crate::error::{ExporterError, Result};
use crate::helix::{HelixApi, get_users_by_username};

pub(super) const NAME: &str = "channel_followers_total";

pub struct ChannelFollowersCollector {
    client: Arc<dyn HelixApi>,
    cache: LookupCache,
    channels: Vec<String>,
    followers: Arc<Desc>,
}

impl ChannelFollowersCollector {
    pub fn new(client: Arc<dyn HelixApi>, cache: LookupCache, channels: Vec<String>) -> Self {
        Self {
            client,
            cache,
            channels,
            followers: Desc::gauge(
                "",
                NAME,
                "The number of followers of a channel.",
                &["username"],
            ),
        }
    }
}

pub(super) async fn build(deps: CollectorDeps) -> Result<Arc<dyn Collector>> {
    Ok(Arc::new(ChannelFollowersCollector::new(
        deps.client,
        deps.cache,
        deps.channels,
    )))
}

#[async_trait::async_trait]
impl Collector for ChannelFollowersCollector {
    async fn update(&self, sink: &MetricSink) -> Result<()> {
        if self.channels.is_empty() {
            return Err(ExporterError::NoData);
        }

        let users = get_users_by_username(self.client.as_ref(), &self.cache, &self.channels).await?;

        for user in &users {
            let total = self
                .client
                .get_channel_followers(&user.id)
                .await?
                .into_data("get channel followers")
                .map_err(|e| {
                    error!(
                        "Failed to collect follower stats for {}: {}",
                        user.display_name, e
                    );
                    e
                })?;
            sink.emit(&self.followers, total as f64, &[&user.display_name]);
        }
        Ok(())
    }
}
