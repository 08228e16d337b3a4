//! EventSub webhook subscriptions
//!
//! The manager keeps the provider's subscription set in line with what this
//! process wants to observe, and routes verified webhook deliveries to the
//! callbacks registered for their event type.
//!
//! No subscription state is kept locally: every [`EventSubManager::subscribe`]
//! call asks the provider what already exists.

mod events;
mod transport;

pub use events::{Badge, CHANNEL_CHAT_MESSAGE, ChannelChatMessageEvent, ChatMessage};
pub use transport::{
    Delivery, HmacTransport, MESSAGE_ID, MESSAGE_SIGNATURE, MESSAGE_TIMESTAMP, MESSAGE_TYPE,
    VerifyError, WebhookRequest, WebhookTransport, sign,
};

use log::{debug, error, info, warn};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::error::{ExporterError, Result};
use crate::helix::{CreateSubscription, HelixApi, SubscriptionCondition, WebhookTransportSpec};

/// Callback invoked with the raw event body of each matching delivery
pub type EventCallback = Arc<dyn Fn(&Value) -> Result<()> + Send + Sync>;

/// Identifies one registered callback so it can be removed again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Result of a [`EventSubManager::subscribe`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    /// An enabled or pending subscription already existed
    AlreadyActive,
    Created,
}

/// Answer to a webhook delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookResponse {
    pub status: u16,
    pub body: String,
}

impl WebhookResponse {
    fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }
}

/// Return the manager, or `NotConfigured` when event subscriptions are disabled
pub fn require(manager: Option<&Arc<EventSubManager>>) -> Result<&Arc<EventSubManager>> {
    manager.ok_or_else(|| {
        warn!("eventsub client not set");
        ExporterError::NotConfigured
    })
}

pub struct EventSubManager {
    client: Arc<dyn HelixApi>,
    transport: Arc<dyn WebhookTransport>,
    webhook_url: String,
    webhook_secret: String,
    handlers: RwLock<HashMap<String, Vec<(HandlerId, EventCallback)>>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for EventSubManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSubManager")
            .field("webhook_url", &self.webhook_url)
            .finish_non_exhaustive()
    }
}

impl EventSubManager {
    /// Create a manager verifying deliveries with the provider's HMAC scheme
    pub fn new(
        client: Arc<dyn HelixApi>,
        webhook_url: impl Into<String>,
        webhook_secret: impl Into<String>,
    ) -> Self {
        let webhook_secret = webhook_secret.into();
        let transport = Arc::new(HmacTransport::new(webhook_secret.clone()));
        Self::with_transport(client, transport, webhook_url, webhook_secret)
    }

    pub fn with_transport(
        client: Arc<dyn HelixApi>,
        transport: Arc<dyn WebhookTransport>,
        webhook_url: impl Into<String>,
        webhook_secret: impl Into<String>,
    ) -> Self {
        Self {
            client,
            transport,
            webhook_url: webhook_url.into(),
            webhook_secret: webhook_secret.into(),
            handlers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a callback for `event_type`
    ///
    /// Every callback registered for a type runs on each delivery of that type.
    pub fn on<F>(&self, event_type: &str, callback: F) -> Result<HandlerId>
    where
        F: Fn(&Value) -> Result<()> + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut handlers = self
            .handlers
            .write()
            .map_err(|_| ExporterError::Other("Lock poisoned".to_string()))?;
        handlers
            .entry(event_type.to_string())
            .or_default()
            .push((id, Arc::new(callback)));
        debug!("Registered handler {:?} for {}", id, event_type);
        Ok(id)
    }

    /// Remove a previously registered callback
    pub fn off(&self, id: HandlerId) -> bool {
        let Ok(mut handlers) = self.handlers.write() else {
            return false;
        };
        let mut removed = false;
        for callbacks in handlers.values_mut() {
            let before = callbacks.len();
            callbacks.retain(|(handler_id, _)| *handler_id != id);
            removed |= callbacks.len() != before;
        }
        handlers.retain(|_, callbacks| !callbacks.is_empty());
        removed
    }

    /// Number of callbacks registered for `event_type`
    pub fn handler_count(&self, event_type: &str) -> usize {
        self.handlers
            .read()
            .map(|h| h.get(event_type).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    /// Ensure a subscription for `event_type` on `broadcaster_id` exists
    ///
    /// A subscription that is enabled or awaiting callback verification counts
    /// as existing. Errors are returned to the caller and not retried.
    pub async fn subscribe(&self, event_type: &str, broadcaster_id: &str) -> Result<SubscribeOutcome> {
        info!(
            "Subscribing to event {} for broadcaster {}",
            event_type, broadcaster_id
        );

        // the listing cannot filter by user and type at once
        let existing = self
            .client
            .list_eventsub_subscriptions(broadcaster_id)
            .await?
            .into_data("list eventsub subscriptions")?;

        if existing
            .iter()
            .any(|s| s.event_type == event_type && s.status.is_active())
        {
            info!(
                "Subscription to {} for broadcaster {} already exists",
                event_type, broadcaster_id
            );
            return Ok(SubscribeOutcome::AlreadyActive);
        }

        let request = CreateSubscription {
            event_type: event_type.to_string(),
            version: "1".to_string(),
            condition: SubscriptionCondition {
                broadcaster_user_id: Some(broadcaster_id.to_string()),
                user_id: Some(broadcaster_id.to_string()),
            },
            transport: WebhookTransportSpec {
                method: "webhook".to_string(),
                callback: self.webhook_url.clone(),
                secret: self.webhook_secret.clone(),
            },
        };

        let resp = self.client.create_eventsub_subscription(&request).await?;
        if resp.status != 202 {
            error!(
                "Failed to create subscription to {} for broadcaster {}: {} {}",
                event_type, broadcaster_id, resp.status, resp.error_message
            );
            return Err(ExporterError::upstream(
                "create eventsub subscription",
                resp.status,
                resp.error_message,
            ));
        }

        info!(
            "Subscription to {} for broadcaster {} created (id {})",
            event_type,
            broadcaster_id,
            resp.data.first().map_or("unknown", |s| s.id.as_str())
        );
        Ok(SubscribeOutcome::Created)
    }

    /// Run every callback registered for `event_type`, returning how many ran
    ///
    /// A failing callback is logged and does not stop the others.
    pub fn dispatch(&self, event_type: &str, event: &Value) -> usize {
        let callbacks: Vec<(HandlerId, EventCallback)> = match self.handlers.read() {
            Ok(handlers) => handlers.get(event_type).cloned().unwrap_or_default(),
            Err(_) => {
                error!("Handler table poisoned, dropping {} event", event_type);
                return 0;
            }
        };

        if callbacks.is_empty() {
            debug!("No handlers for {} event", event_type);
        }

        for (id, callback) in &callbacks {
            if let Err(e) = callback(event) {
                error!("Handler {:?} failed for {} event: {}", id, event_type, e);
            }
        }
        callbacks.len()
    }

    /// Verify an inbound delivery and route it
    pub fn handle(&self, request: &WebhookRequest) -> WebhookResponse {
        debug!("Received eventsub delivery ({} bytes)", request.body().len());

        match self.transport.verify(request) {
            Ok(Delivery::Notification { event_type, event }) => {
                let handled = self.dispatch(&event_type, &event);
                debug!("{} event handled by {} callbacks", event_type, handled);
                WebhookResponse::new(204, "")
            }
            Ok(Delivery::Verification { challenge }) => {
                info!("Answering eventsub callback verification");
                WebhookResponse::new(200, challenge)
            }
            Ok(Delivery::Revocation { event_type, reason }) => {
                warn!("Subscription to {} revoked: {}", event_type, reason);
                WebhookResponse::new(204, "")
            }
            Err(e) => {
                warn!("Rejected eventsub delivery: {}", e);
                WebhookResponse::new(e.status(), e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::helix::{
        ApiResponse, ChannelSubscription, Clip, ClipQuery, EventSubSubscription, Page, Stream,
        SubscriptionStatus, User,
    };
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    /// Provider double that remembers created subscriptions
    #[derive(Default)]
    struct FakeProvider {
        subscriptions: Mutex<Vec<EventSubSubscription>>,
        creates: AtomicUsize,
        create_status: Option<u16>,
    }

    #[async_trait::async_trait]
    impl HelixApi for FakeProvider {
        async fn get_users(&self, _logins: &[String]) -> Result<ApiResponse<Vec<User>>> {
            Ok(ApiResponse::ok(Vec::new()))
        }

        async fn get_streams(&self, _logins: &[String]) -> Result<ApiResponse<Vec<Stream>>> {
            Ok(ApiResponse::ok(Vec::new()))
        }

        async fn get_channel_followers(&self, _id: &str) -> Result<ApiResponse<u64>> {
            Ok(ApiResponse::ok(0))
        }

        async fn get_clips(&self, _query: &ClipQuery) -> Result<ApiResponse<Page<Clip>>> {
            Ok(ApiResponse::ok(Page::default()))
        }

        async fn get_subscriptions(
            &self,
            _id: &str,
            _after: Option<&str>,
        ) -> Result<ApiResponse<Page<ChannelSubscription>>> {
            Ok(ApiResponse::ok(Page::default()))
        }

        async fn list_eventsub_subscriptions(
            &self,
            user_id: &str,
        ) -> Result<ApiResponse<Vec<EventSubSubscription>>> {
            let subs = self.subscriptions.lock().unwrap();
            Ok(ApiResponse::ok(
                subs.iter()
                    .filter(|s| s.condition.user_id.as_deref() == Some(user_id))
                    .cloned()
                    .collect(),
            ))
        }

        async fn create_eventsub_subscription(
            &self,
            request: &CreateSubscription,
        ) -> Result<ApiResponse<Vec<EventSubSubscription>>> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            if let Some(status) = self.create_status {
                return Ok(ApiResponse::error(status, "subscription limit reached"));
            }
            let created = EventSubSubscription {
                id: format!("sub-{}", self.creates.load(Ordering::SeqCst)),
                event_type: request.event_type.clone(),
                version: request.version.clone(),
                status: SubscriptionStatus::Pending,
                condition: request.condition.clone(),
            };
            self.subscriptions.lock().unwrap().push(created.clone());
            Ok(ApiResponse::accepted(vec![created]))
        }
    }

    fn manager(provider: Arc<FakeProvider>) -> EventSubManager {
        EventSubManager::new(provider, "https://example.com/eventsub", "s3cret")
    }

    #[tokio::test]
    async fn subscribe_twice_creates_once() {
        let provider = Arc::new(FakeProvider::default());
        let manager = manager(provider.clone());

        let first = manager.subscribe(CHANNEL_CHAT_MESSAGE, "42").await.unwrap();
        let second = manager.subscribe(CHANNEL_CHAT_MESSAGE, "42").await.unwrap();

        assert_eq!(first, SubscribeOutcome::Created);
        assert_eq!(second, SubscribeOutcome::AlreadyActive);
        assert_eq!(provider.creates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn revoked_subscription_is_recreated() {
        let provider = Arc::new(FakeProvider::default());
        provider.subscriptions.lock().unwrap().push(EventSubSubscription {
            id: "old".to_string(),
            event_type: CHANNEL_CHAT_MESSAGE.to_string(),
            version: "1".to_string(),
            status: SubscriptionStatus::Other("authorization_revoked".to_string()),
            condition: SubscriptionCondition {
                broadcaster_user_id: Some("42".to_string()),
                user_id: Some("42".to_string()),
            },
        });
        let manager = manager(provider.clone());

        let outcome = manager.subscribe(CHANNEL_CHAT_MESSAGE, "42").await.unwrap();
        assert_eq!(outcome, SubscribeOutcome::Created);
    }

    #[tokio::test]
    async fn rejected_creation_surfaces_provider_message() {
        let provider = Arc::new(FakeProvider {
            create_status: Some(409),
            ..Default::default()
        });
        let err = manager(provider)
            .subscribe(CHANNEL_CHAT_MESSAGE, "42")
            .await
            .unwrap_err();
        match err {
            ExporterError::Upstream { status, message, .. } => {
                assert_eq!(status, 409);
                assert_eq!(message, "subscription limit reached");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn dispatch_fans_out_and_isolates_failures() {
        let manager = manager(Arc::new(FakeProvider::default()));
        let hits = Arc::new(AtomicUsize::new(0));

        let h = Arc::clone(&hits);
        manager
            .on("channel.follow", move |_| {
                h.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        manager
            .on("channel.follow", |event| {
                let _: ChannelChatMessageEvent = serde_json::from_value(event.clone())?;
                Ok(())
            })
            .unwrap();
        let h = Arc::clone(&hits);
        manager
            .on("channel.follow", move |_| {
                h.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        let ran = manager.dispatch("channel.follow", &serde_json::json!({"unexpected": true}));
        assert_eq!(ran, 3);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(manager.dispatch("channel.raid", &Value::Null), 0);
    }

    #[test]
    fn off_removes_only_that_handler() {
        let manager = manager(Arc::new(FakeProvider::default()));
        let a = manager.on("x", |_| Ok(())).unwrap();
        let _b = manager.on("x", |_| Ok(())).unwrap();

        assert!(manager.off(a));
        assert!(!manager.off(a));
        assert_eq!(manager.handler_count("x"), 1);
    }

    #[test]
    fn handle_routes_signed_notification() {
        let manager = manager(Arc::new(FakeProvider::default()));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        manager
            .on(CHANNEL_CHAT_MESSAGE, move |event| {
                let event: ChannelChatMessageEvent = serde_json::from_value(event.clone())?;
                s.lock().unwrap().push(event.chatter_user_login);
                Ok(())
            })
            .unwrap();

        let body = serde_json::json!({
            "subscription": {"type": CHANNEL_CHAT_MESSAGE, "status": "enabled"},
            "event": {
                "broadcaster_user_id": "42",
                "broadcaster_user_login": "alice",
                "chatter_user_id": "7",
                "chatter_user_login": "bob"
            }
        })
        .to_string();
        let ts = chrono::Utc::now().to_rfc3339();
        let request = WebhookRequest::new(
            [
                (MESSAGE_ID, "m1".to_string()),
                (MESSAGE_TIMESTAMP, ts.clone()),
                (MESSAGE_SIGNATURE, sign("s3cret", "m1", &ts, body.as_bytes()).unwrap()),
                (MESSAGE_TYPE, "notification".to_string()),
            ],
            body.clone(),
        );

        let resp = manager.handle(&request);
        assert_eq!(resp.status, 204);
        assert_eq!(*seen.lock().unwrap(), vec!["bob".to_string()]);

        let forged = WebhookRequest::new(
            [
                (MESSAGE_ID, "m2".to_string()),
                (MESSAGE_TIMESTAMP, ts.clone()),
                (MESSAGE_SIGNATURE, sign("wrong", "m2", &ts, body.as_bytes()).unwrap()),
                (MESSAGE_TYPE, "notification".to_string()),
            ],
            body,
        );
        assert_eq!(manager.handle(&forged).status, 403);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn require_reports_not_configured() {
        let err = require(None).unwrap_err();
        assert!(matches!(err, ExporterError::NotConfigured));
    }
}
