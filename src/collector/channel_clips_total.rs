use chrono::{DateTime, Duration, NaiveTime, Utc};
use log::{debug, error, warn};
use std::sync::Arc;

use super::core::{Collector, Desc, MetricSink};
use super::registry::CollectorDeps;
use crate::cache::LookupCache;
use crate::error::{ExporterError, Result};
use crate::helix::{ClipQuery, HelixApi, get_users_by_username};

pub(super) const NAME: &str = "channel_clips_total";
pub(super) const NAME_24H: &str = "channel_clips_24h_total";

const CLIPS_PER_PAGE: u32 = 100;

/// Upper bound on pages walked for one channel in one scrape
pub const MAX_CLIP_PAGES: usize = 1000;

/// Which clips to count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClipWindow {
    AllTime,
    /// Clips created since the start of the previous UTC day
    LastDay,
}

impl ClipWindow {
    /// Lower bound passed to the listing, if any
    pub fn started_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            ClipWindow::AllTime => None,
            // a bounded window keeps the listing under the provider's page limit
            ClipWindow::LastDay => Some((now - Duration::hours(24)).date_naive().and_time(NaiveTime::MIN).and_utc()),
        }
    }
}

/// Counts clips per channel by walking the paginated listing
pub struct ChannelClipsCollector {
    client: Arc<dyn HelixApi>,
    cache: LookupCache,
    channels: Vec<String>,
    window: ClipWindow,
    clips: Arc<Desc>,
}

impl ChannelClipsCollector {
    pub fn new(client: Arc<dyn HelixApi>, cache: LookupCache, channels: Vec<String>, window: ClipWindow) -> Self {
        let clips = match window {
            ClipWindow::AllTime => Desc::gauge(
                "",
                NAME,
                "Total number of clips for a channel.",
                &["username"],
            ),
            ClipWindow::LastDay => Desc::gauge(
                "",
                NAME_24H,
                "Total number of clips created within the last 24h for a channel.",
                &["username"],
            ),
        };

        Self {
            client,
            cache,
            channels,
            window,
            clips,
        }
    }

    /// Sum clip counts across pages until the cursor runs out
    async fn count(&self, broadcaster_id: &str) -> Result<u64> {
        let mut query = ClipQuery {
            broadcaster_id: broadcaster_id.to_string(),
            first: CLIPS_PER_PAGE,
            after: None,
            started_at: self.window.started_at(Utc::now()),
        };
        let mut count = 0u64;

        for page_no in 0..MAX_CLIP_PAGES {
            let page = self
                .client
                .get_clips(&query)
                .await?
                .into_data("get clips")?;
            count += page.items.len() as u64;

            match page.next_cursor() {
                Some(next) => query.after = Some(next.to_string()),
                None => {
                    debug!(
                        "Counted {} clips for {} over {} pages",
                        count,
                        broadcaster_id,
                        page_no + 1
                    );
                    return Ok(count);
                }
            }
        }

        warn!(
            "Stopped paging clips of {} after {} pages",
            broadcaster_id, MAX_CLIP_PAGES
        );
        Ok(count)
    }
}

pub(super) async fn build_all_time(deps: CollectorDeps) -> Result<Arc<dyn Collector>> {
    Ok(Arc::new(ChannelClipsCollector::new(
        deps.client,
        deps.cache,
        deps.channels,
        ClipWindow::AllTime,
    )))
}

pub(super) async fn build_last_day(deps: CollectorDeps) -> Result<Arc<dyn Collector>> {
    Ok(Arc::new(ChannelClipsCollector::new(
        deps.client,
        deps.cache,
        deps.channels,
        ClipWindow::LastDay,
    )))
}

#[async_trait::async_trait]
impl Collector for ChannelClipsCollector {
    async fn update(&self, sink: &MetricSink) -> Result<()> {
        if self.channels.is_empty() {
            return Err(ExporterError::NoData);
        }

        let users = get_users_by_username(self.client.as_ref(), &self.cache, &self.channels).await?;

        // one failing channel should not hide the others
        for user in &users {
            match self.count(&user.id).await {
                Ok(count) => sink.emit(&self.clips, count as f64, &[&user.display_name]),
                Err(e) => error!("Could not get clips count for {}: {}", user.display_name, e),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn last_day_starts_at_previous_midnight() {
        let now = Utc.with_ymd_and_hms(2024, 3, 15, 9, 30, 0).unwrap();
        assert_eq!(ClipWindow::AllTime.started_at(now), None);
        assert_eq!(
            ClipWindow::LastDay.started_at(now),
            Some(Utc.with_ymd_and_hms(2024, 3, 14, 0, 0, 0).unwrap())
        );
    }
}
