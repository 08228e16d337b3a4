use log::{debug, error, info};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use super::core::{Collector, Desc, MetricSink};
use super::registry::CollectorDeps;
use crate::error::{ExporterError, Result};
use crate::eventsub::{CHANNEL_CHAT_MESSAGE, ChannelChatMessageEvent, EventSubManager, HandlerId};
use crate::helix::get_users_by_username;

pub(super) const NAME: &str = "channel_chat_messages_total";

/// Message counts keyed by (channel login, chatter login)
#[derive(Debug, Default)]
struct MessageCounter {
    counts: Mutex<BTreeMap<(String, String), u64>>,
}

impl MessageCounter {
    fn add(&self, channel: &str, chatter: &str) -> Result<u64> {
        let mut counts = self
            .counts
            .lock()
            .map_err(|_| ExporterError::Other("Lock poisoned".to_string()))?;
        let count = counts
            .entry((channel.to_string(), chatter.to_string()))
            .or_insert(0);
        *count += 1;
        Ok(*count)
    }

    fn snapshot(&self) -> Result<Vec<((String, String), u64)>> {
        let counts = self
            .counts
            .lock()
            .map_err(|_| ExporterError::Other("Lock poisoned".to_string()))?;
        Ok(counts.iter().map(|(k, v)| (k.clone(), *v)).collect())
    }
}

/// Counts chat messages delivered through event subscriptions
///
/// Label cardinality grows with every distinct chatter, so this is best kept
/// to a small set of channels.
pub struct ChannelChatMessagesCollector {
    channels: Vec<String>,
    counter: Arc<MessageCounter>,
    manager: Arc<EventSubManager>,
    handler: HandlerId,
    messages: Arc<Desc>,
}

impl ChannelChatMessagesCollector {
    /// Register the message callback and subscribe for every resolvable channel
    ///
    /// Subscription failures are logged; the collector still reports whatever
    /// the remaining subscriptions deliver.
    pub async fn new(deps: CollectorDeps) -> Result<Self> {
        let manager = Arc::clone(deps.eventsub()?);
        let users = get_users_by_username(deps.client.as_ref(), &deps.cache, &deps.channels).await?;

        let counter = Arc::new(MessageCounter::default());
        let handler = {
            let counter = Arc::clone(&counter);
            manager.on(CHANNEL_CHAT_MESSAGE, move |raw| {
                let event: ChannelChatMessageEvent = serde_json::from_value(raw.clone())?;
                let count = counter.add(&event.broadcaster_user_login, &event.chatter_user_login)?;
                debug!(
                    "Chat message in {} from {} (count {})",
                    event.broadcaster_user_login, event.chatter_user_login, count
                );
                Ok(())
            })?
        };

        for user in &users {
            if let Err(e) = manager.subscribe(CHANNEL_CHAT_MESSAGE, &user.id).await {
                error!(
                    "Failed to subscribe to chat messages of {}: {}",
                    user.login, e
                );
            }
        }
        info!("Listening for chat messages on {} channels", users.len());

        Ok(Self {
            channels: deps.channels,
            counter,
            manager,
            handler,
            messages: Desc::counter(
                "",
                NAME,
                "The number of chat messages sent in a channel.",
                &["username", "chatter_username"],
            ),
        })
    }
}

pub(super) async fn build(deps: CollectorDeps) -> Result<Arc<dyn Collector>> {
    Ok(Arc::new(ChannelChatMessagesCollector::new(deps).await?))
}

impl Drop for ChannelChatMessagesCollector {
    fn drop(&mut self) {
        self.manager.off(self.handler);
    }
}

#[async_trait::async_trait]
impl Collector for ChannelChatMessagesCollector {
    async fn update(&self, sink: &MetricSink) -> Result<()> {
        if self.channels.is_empty() {
            return Err(ExporterError::NoData);
        }

        for ((channel, chatter), count) in self.counter.snapshot()? {
            sink.emit(&self.messages, count as f64, &[&channel, &chatter]);
        }
        Ok(())
    }
}
