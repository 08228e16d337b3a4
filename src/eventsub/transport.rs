use bytes::Bytes;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use std::collections::HashMap;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const MESSAGE_ID: &str = "twitch-eventsub-message-id";
pub const MESSAGE_TIMESTAMP: &str = "twitch-eventsub-message-timestamp";
pub const MESSAGE_SIGNATURE: &str = "twitch-eventsub-message-signature";
pub const MESSAGE_TYPE: &str = "twitch-eventsub-message-type";

/// Deliveries older than this are treated as replays
pub const MAX_MESSAGE_AGE_MINUTES: i64 = 10;

/// An inbound webhook request, independent of the HTTP server in use
#[derive(Debug, Clone, Default)]
pub struct WebhookRequest {
    headers: HashMap<String, String>,
    body: Bytes,
}

impl WebhookRequest {
    /// Header names are matched case-insensitively
    pub fn new<I, K, V>(headers: I, body: impl Into<Bytes>) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        Self {
            headers: headers
                .into_iter()
                .map(|(k, v)| (k.as_ref().to_ascii_lowercase(), v.into()))
                .collect(),
            body: body.into(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }
}

/// A verified delivery
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Notification { event_type: String, event: Value },
    /// The provider is confirming we own the callback URL
    Verification { challenge: String },
    Revocation { event_type: String, reason: String },
}

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("missing header {0}")]
    MissingHeader(&'static str),

    #[error("signature mismatch")]
    BadSignature,

    #[error("stale message from {0}")]
    Stale(String),

    #[error("malformed delivery: {0}")]
    Malformed(String),
}

impl VerifyError {
    /// HTTP status to answer with
    pub fn status(&self) -> u16 {
        match self {
            VerifyError::Malformed(_) => 400,
            _ => 403,
        }
    }
}

/// Authenticates and decodes webhook deliveries
pub trait WebhookTransport: Send + Sync + 'static {
    fn verify(&self, request: &WebhookRequest) -> Result<Delivery, VerifyError>;
}

#[derive(Debug, Deserialize)]
struct EnvelopeSubscription {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    status: String,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    subscription: EnvelopeSubscription,
    #[serde(default)]
    event: Option<Value>,
    #[serde(default)]
    challenge: Option<String>,
}

/// Compute the `sha256=` signature header value for a delivery
pub fn sign(secret: &str, message_id: &str, timestamp: &str, body: &[u8]) -> Result<String, VerifyError> {
    let digest = mac(secret, message_id, timestamp, body)?.finalize().into_bytes();
    Ok(format!("sha256={}", hex::encode(digest)))
}

fn mac(secret: &str, message_id: &str, timestamp: &str, body: &[u8]) -> Result<HmacSha256, VerifyError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| VerifyError::Malformed(format!("invalid webhook secret: {}", e)))?;
    mac.update(message_id.as_bytes());
    mac.update(timestamp.as_bytes());
    mac.update(body);
    Ok(mac)
}

/// The provider's HMAC-SHA256 signing scheme
#[derive(Debug, Clone)]
pub struct HmacTransport {
    secret: String,
    max_age: chrono::Duration,
}

impl HmacTransport {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            max_age: chrono::Duration::minutes(MAX_MESSAGE_AGE_MINUTES),
        }
    }

    fn required<'a>(request: &'a WebhookRequest, name: &'static str) -> Result<&'a str, VerifyError> {
        request.header(name).ok_or(VerifyError::MissingHeader(name))
    }
}

impl WebhookTransport for HmacTransport {
    fn verify(&self, request: &WebhookRequest) -> Result<Delivery, VerifyError> {
        let message_id = Self::required(request, MESSAGE_ID)?;
        let timestamp = Self::required(request, MESSAGE_TIMESTAMP)?;
        let signature = Self::required(request, MESSAGE_SIGNATURE)?;
        let message_type = Self::required(request, MESSAGE_TYPE)?;

        let expected = signature
            .strip_prefix("sha256=")
            .and_then(|hex_sig| hex::decode(hex_sig).ok())
            .ok_or(VerifyError::BadSignature)?;
        mac(&self.secret, message_id, timestamp, request.body())?
            .verify_slice(&expected)
            .map_err(|_| VerifyError::BadSignature)?;

        let sent_at = DateTime::parse_from_rfc3339(timestamp)
            .map_err(|e| VerifyError::Malformed(format!("bad timestamp '{}': {}", timestamp, e)))?;
        // replays can be dated either side of now
        if Utc::now().signed_duration_since(sent_at).abs() > self.max_age {
            return Err(VerifyError::Stale(timestamp.to_string()));
        }

        let envelope: Envelope = serde_json::from_slice(request.body())
            .map_err(|e| VerifyError::Malformed(e.to_string()))?;

        match message_type {
            "notification" => {
                let event = envelope
                    .event
                    .ok_or_else(|| VerifyError::Malformed("notification without event".to_string()))?;
                Ok(Delivery::Notification {
                    event_type: envelope.subscription.event_type,
                    event,
                })
            }
            "webhook_callback_verification" => {
                let challenge = envelope.challenge.ok_or_else(|| {
                    VerifyError::Malformed("verification without challenge".to_string())
                })?;
                Ok(Delivery::Verification { challenge })
            }
            "revocation" => Ok(Delivery::Revocation {
                event_type: envelope.subscription.event_type,
                reason: envelope.subscription.status,
            }),
            other => Err(VerifyError::Malformed(format!("unknown message type '{}'", other))),
        }
    }
}
