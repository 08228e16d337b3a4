mod channel_chat_messages_total;
mod channel_clips_total;
mod channel_followers_total;
mod channel_subscribers_total;
mod channel_up;
mod channel_viewers_total;
mod core;
mod registry;

// Re-export public items
pub use channel_chat_messages_total::ChannelChatMessagesCollector;
pub use channel_clips_total::{ChannelClipsCollector, ClipWindow, MAX_CLIP_PAGES};
pub use channel_followers_total::ChannelFollowersCollector;
pub use channel_subscribers_total::ChannelSubscribersCollector;
pub use channel_up::ChannelUpCollector;
pub use channel_viewers_total::ChannelViewersCollector;
pub use self::core::{Collector, Desc, MetricSink, NAMESPACE, Sample, ValueType, build_fq_name, drain};
pub use registry::{
    CollectorDeps, CollectorFactory, CollectorFuture, CollectorRegistry, Enablement, StagedCollectors,
};

use crate::error::Result;

/// Register every built-in collector with its default enablement
pub(crate) fn register_builtin(registry: &mut CollectorRegistry) -> Result<()> {
    registry.register(channel_up::NAME, true, channel_up::build)?;
    registry.register(channel_viewers_total::NAME, true, channel_viewers_total::build)?;
    registry.register(channel_followers_total::NAME, true, channel_followers_total::build)?;
    // the subscriptions endpoint needs a broadcaster user token
    registry.register(
        channel_subscribers_total::NAME,
        false,
        channel_subscribers_total::build,
    )?;
    registry.register(channel_clips_total::NAME, true, channel_clips_total::build_all_time)?;
    registry.register(channel_clips_total::NAME_24H, true, channel_clips_total::build_last_day)?;
    // needs a publicly reachable webhook endpoint
    registry.register(
        channel_chat_messages_total::NAME,
        false,
        channel_chat_messages_total::build,
    )?;
    Ok(())
}
