//! Boundary to the Twitch Helix API
//!
//! Collectors and the event subscription manager only see the [`HelixApi`]
//! trait; [`HelixClient`] is the reqwest-backed implementation.

mod client;
mod users;

pub use client::{Credentials, HelixClient};
pub use users::get_users_by_username;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ExporterError, Result};

/// A response from the platform, successful or not
///
/// Non-success statuses are data here, not errors, so callers can surface the
/// provider's message text. Transport failures never produce a value.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse<T> {
    pub status: u16,
    pub error_message: String,
    pub data: T,
}

impl<T> ApiResponse<T> {
    /// A 200 response carrying `data`
    pub fn ok(data: T) -> Self {
        Self {
            status: 200,
            error_message: String::new(),
            data,
        }
    }

    /// A 202 response carrying `data`
    pub fn accepted(data: T) -> Self {
        Self {
            status: 202,
            error_message: String::new(),
            data,
        }
    }

    /// An error response with the provider's message
    pub fn error(status: u16, message: impl Into<String>) -> Self
    where
        T: Default,
    {
        Self {
            status,
            error_message: message.into(),
            data: T::default(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, 200 | 202)
    }

    /// Return the payload, or an upstream error naming `context`
    pub fn into_data(self, context: &str) -> Result<T> {
        if self.is_success() {
            Ok(self.data)
        } else {
            Err(ExporterError::upstream(context, self.status, self.error_message))
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ApiResponse<U> {
        ApiResponse {
            status: self.status,
            error_message: self.error_message,
            data: f(self.data),
        }
    }
}

/// One page of a cursor-paginated listing
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Opaque cursor for the next page; `None` or empty on the last page
    pub cursor: Option<String>,
}

impl<T> Default for Page<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            cursor: None,
        }
    }
}

impl<T> Page<T> {
    /// The cursor to continue with, if there is another page
    pub fn next_cursor(&self) -> Option<&str> {
        self.cursor.as_deref().filter(|c| !c.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub login: String,
    pub display_name: String,
    #[serde(default)]
    pub broadcaster_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Stream {
    pub id: String,
    pub user_id: String,
    pub user_login: String,
    pub user_name: String,
    #[serde(default)]
    pub game_id: String,
    #[serde(default)]
    pub game_name: String,
    #[serde(default)]
    pub viewer_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Clip {
    pub id: String,
    pub broadcaster_id: String,
    #[serde(default)]
    pub created_at: String,
}

/// A paid channel subscription (not an EventSub subscription)
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChannelSubscription {
    pub user_id: String,
    #[serde(default)]
    pub user_login: String,
    pub tier: String,
    #[serde(default)]
    pub is_gift: bool,
}

/// Status of an EventSub subscription on the provider side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SubscriptionStatus {
    Enabled,
    /// Created, waiting for the webhook challenge to be answered
    Pending,
    Other(String),
}

impl SubscriptionStatus {
    /// Whether a subscription in this state already covers its event
    pub fn is_active(&self) -> bool {
        matches!(self, SubscriptionStatus::Enabled | SubscriptionStatus::Pending)
    }
}

impl From<String> for SubscriptionStatus {
    fn from(value: String) -> Self {
        match value.as_str() {
            "enabled" => SubscriptionStatus::Enabled,
            "webhook_callback_verification_pending" => SubscriptionStatus::Pending,
            _ => SubscriptionStatus::Other(value),
        }
    }
}

impl From<SubscriptionStatus> for String {
    fn from(value: SubscriptionStatus) -> Self {
        match value {
            SubscriptionStatus::Enabled => "enabled".to_string(),
            SubscriptionStatus::Pending => "webhook_callback_verification_pending".to_string(),
            SubscriptionStatus::Other(s) => s,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SubscriptionCondition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broadcaster_user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// An EventSub subscription as listed by the provider
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EventSubSubscription {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub version: String,
    pub status: SubscriptionStatus,
    #[serde(default)]
    pub condition: SubscriptionCondition,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WebhookTransportSpec {
    pub method: String,
    pub callback: String,
    pub secret: String,
}

/// Body of a subscription creation request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreateSubscription {
    #[serde(rename = "type")]
    pub event_type: String,
    pub version: String,
    pub condition: SubscriptionCondition,
    pub transport: WebhookTransportSpec,
}

/// Parameters of a clip listing request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipQuery {
    pub broadcaster_id: String,
    pub first: u32,
    pub after: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
}

/// Operations the exporter needs from the platform
#[async_trait::async_trait]
pub trait HelixApi: Send + Sync + 'static {
    /// Look users up by login name
    async fn get_users(&self, logins: &[String]) -> Result<ApiResponse<Vec<User>>>;

    /// Live streams for the given logins; offline channels are absent
    async fn get_streams(&self, logins: &[String]) -> Result<ApiResponse<Vec<Stream>>>;

    /// Total follower count of a channel
    async fn get_channel_followers(&self, broadcaster_id: &str) -> Result<ApiResponse<u64>>;

    /// One page of clips
    async fn get_clips(&self, query: &ClipQuery) -> Result<ApiResponse<Page<Clip>>>;

    /// One page of paid channel subscriptions
    async fn get_subscriptions(
        &self,
        broadcaster_id: &str,
        after: Option<&str>,
    ) -> Result<ApiResponse<Page<ChannelSubscription>>>;

    /// EventSub subscriptions involving `user_id`
    async fn list_eventsub_subscriptions(
        &self,
        user_id: &str,
    ) -> Result<ApiResponse<Vec<EventSubSubscription>>>;

    /// Create an EventSub subscription; the provider answers 202 on success
    async fn create_eventsub_subscription(
        &self,
        request: &CreateSubscription,
    ) -> Result<ApiResponse<Vec<EventSubSubscription>>>;
}
