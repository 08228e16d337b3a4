use log::{error, warn};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::core::{Collector, Desc, MetricSink};
use super::registry::CollectorDeps;
use crate::cache::LookupCache;
use crate::error::{ExporterError, Result};
use crate::helix::{HelixApi, get_users_by_username};

pub(super) const NAME: &str = "channel_subscribers_total";

const MAX_SUBSCRIPTION_PAGES: usize = 1000;

/// Paid subscribers per channel, split by tier and whether the sub was gifted
pub struct ChannelSubscribersCollector {
    client: Arc<dyn HelixApi>,
    cache: LookupCache,
    channels: Vec<String>,
    subscribers: Arc<Desc>,
}

impl ChannelSubscribersCollector {
    pub fn new(client: Arc<dyn HelixApi>, cache: LookupCache, channels: Vec<String>) -> Self {
        Self {
            client,
            cache,
            channels,
            subscribers: Desc::gauge(
                "",
                NAME,
                "The number of subscriber of a channel.",
                &["username", "tier", "gifted"],
            ),
        }
    }

    /// Count subscriptions by (tier, gifted) across every page
    async fn count(&self, broadcaster_id: &str) -> Result<BTreeMap<(String, bool), u64>> {
        let mut counts = BTreeMap::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_SUBSCRIPTION_PAGES {
            let page = self
                .client
                .get_subscriptions(broadcaster_id, cursor.as_deref())
                .await?
                .into_data("get subscriptions")?;

            for sub in &page.items {
                *counts.entry((sub.tier.clone(), sub.is_gift)).or_insert(0) += 1;
            }

            match page.next_cursor() {
                Some(next) => cursor = Some(next.to_string()),
                None => return Ok(counts),
            }
        }

        warn!(
            "Stopped paging subscriptions of {} after {} pages",
            broadcaster_id, MAX_SUBSCRIPTION_PAGES
        );
        Ok(counts)
    }
}

pub(super) async fn build(deps: CollectorDeps) -> Result<Arc<dyn Collector>> {
    Ok(Arc::new(ChannelSubscribersCollector::new(
        deps.client,
        deps.cache,
        deps.channels,
    )))
}

#[async_trait::async_trait]
impl Collector for ChannelSubscribersCollector {
    async fn update(&self, sink: &MetricSink) -> Result<()> {
        if self.channels.is_empty() {
            return Err(ExporterError::NoData);
        }

        let users = get_users_by_username(self.client.as_ref(), &self.cache, &self.channels).await?;

        for user in &users {
            let counts = self.count(&user.id).await.map_err(|e| {
                error!(
                    "Failed to collect subscriber stats for {}: {}",
                    user.display_name, e
                );
                e
            })?;

            for ((tier, gifted), total) in counts {
                let gifted = if gifted { "true" } else { "false" };
                sink.emit(
                    &self.subscribers,
                    total as f64,
                    &[&user.display_name, &tier, gifted],
                );
            }
        }
        Ok(())
    }
}
