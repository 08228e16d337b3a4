use chrono::SecondsFormat;
use log::{debug, info, warn};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::sync::RwLock;

use super::{
    ApiResponse, ChannelSubscription, Clip, ClipQuery, CreateSubscription, EventSubSubscription,
    HelixApi, Page, Stream, User,
};
use crate::error::{ExporterError, Result};

const HELIX_URL: &str = "https://api.twitch.tv/helix";
const TOKEN_URL: &str = "https://id.twitch.tv/oauth2/token";

/// Credentials used to talk to Helix
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: Option<String>,
    /// User access token; an app token is requested when absent
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Pagination {
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Envelope<T> {
    data: T,
    #[serde(default)]
    pagination: Pagination,
    #[serde(default)]
    total: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

#[derive(Debug)]
struct Tokens {
    access: String,
    refresh: Option<String>,
}

/// reqwest-backed [`HelixApi`] implementation
#[derive(Debug)]
pub struct HelixClient {
    http: reqwest::Client,
    helix_url: String,
    token_url: String,
    client_id: String,
    client_secret: Option<String>,
    tokens: RwLock<Tokens>,
}

impl HelixClient {
    /// Build a client, requesting an app access token if no user token is configured
    pub async fn connect(credentials: Credentials) -> Result<Self> {
        Self::connect_with_urls(credentials, HELIX_URL, TOKEN_URL).await
    }

    /// Build a client that always uses an app access token
    pub async fn connect_app(credentials: Credentials) -> Result<Self> {
        let credentials = Credentials {
            access_token: None,
            refresh_token: None,
            ..credentials
        };
        Self::connect(credentials).await
    }

    /// Build a client against alternative endpoints
    pub async fn connect_with_urls(
        credentials: Credentials,
        helix_url: impl Into<String>,
        token_url: impl Into<String>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("twitch-exporter/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ExporterError::transport("build http client", e))?;

        let client = Self {
            http,
            helix_url: helix_url.into(),
            token_url: token_url.into(),
            client_id: credentials.client_id,
            client_secret: credentials.client_secret,
            tokens: RwLock::new(Tokens {
                access: credentials.access_token.clone().unwrap_or_default(),
                refresh: credentials.refresh_token,
            }),
        };

        if credentials.access_token.is_none() {
            client.request_app_token().await?;
        }

        Ok(client)
    }

    async fn request_app_token(&self) -> Result<()> {
        let secret = self.client_secret.as_deref().ok_or_else(|| {
            ExporterError::Config("client secret is required for an app access token".to_string())
        })?;

        let params = [
            ("client_id", self.client_id.as_str()),
            ("client_secret", secret),
            ("grant_type", "client_credentials"),
        ];
        let token = self.token_request(&params, "request app access token").await?;
        info!("Obtained app access token");

        self.tokens.write().await.access = token.access_token;
        Ok(())
    }

    /// Exchange the refresh token for a new access token
    ///
    /// Returns `false` when refreshing is not possible with the configured credentials.
    async fn refresh_user_token(&self) -> Result<bool> {
        let Some(secret) = self.client_secret.as_deref() else {
            return Ok(false);
        };
        let Some(refresh) = self.tokens.read().await.refresh.clone() else {
            return Ok(false);
        };

        let params = [
            ("client_id", self.client_id.as_str()),
            ("client_secret", secret),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh.as_str()),
        ];
        let token = self.token_request(&params, "refresh user access token").await?;
        info!("Refreshed user access token");

        let mut tokens = self.tokens.write().await;
        tokens.access = token.access_token;
        if token.refresh_token.is_some() {
            tokens.refresh = token.refresh_token;
        }
        Ok(true)
    }

    async fn token_request(&self, params: &[(&str, &str)], context: &str) -> Result<TokenResponse> {
        let resp = self
            .http
            .post(&self.token_url)
            .form(params)
            .send()
            .await
            .map_err(|e| ExporterError::transport(context, e))?;

        let status = resp.status();
        let body = resp
            .bytes()
            .await
            .map_err(|e| ExporterError::transport(context, e))?;

        if !status.is_success() {
            return Err(ExporterError::upstream(
                context,
                status.as_u16(),
                error_message(&body, status),
            ));
        }

        Ok(serde_json::from_slice(&body)?)
    }

    async fn send<B>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&B>,
    ) -> Result<(StatusCode, bytes::Bytes)>
    where
        B: serde::Serialize + ?Sized,
    {
        let url = format!("{}/{}", self.helix_url, path);
        let token = self.tokens.read().await.access.clone();

        let mut req = self
            .http
            .request(method, &url)
            .header("Client-Id", &self.client_id)
            .bearer_auth(token)
            .query(query);
        if let Some(body) = body {
            req = req.json(body);
        }

        let resp = req.send().await.map_err(|e| ExporterError::transport(path, e))?;
        let status = resp.status();
        let bytes = resp.bytes().await.map_err(|e| ExporterError::transport(path, e))?;
        Ok((status, bytes))
    }

    /// Issue a request, refreshing the token once on 401
    async fn request<T, B>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&B>,
    ) -> Result<ApiResponse<Envelope<T>>>
    where
        T: DeserializeOwned + Default,
        B: serde::Serialize + ?Sized,
    {
        let (mut status, mut bytes) = self.send(method.clone(), path, query, body).await?;

        if status == StatusCode::UNAUTHORIZED {
            match self.refresh_user_token().await {
                Ok(true) => {
                    (status, bytes) = self.send(method, path, query, body).await?;
                }
                Ok(false) => {}
                Err(e) => warn!("Token refresh failed: {}", e),
            }
        }

        debug!("Helix {} -> {}", path, status);

        if !status.is_success() {
            return Ok(ApiResponse::error(status.as_u16(), error_message(&bytes, status)));
        }

        let envelope: Envelope<T> = serde_json::from_slice(&bytes)?;
        Ok(ApiResponse {
            status: status.as_u16(),
            error_message: String::new(),
            data: envelope,
        })
    }

    async fn get<T>(&self, path: &str, query: &[(&str, String)]) -> Result<ApiResponse<Envelope<T>>>
    where
        T: DeserializeOwned + Default,
    {
        self.request::<T, ()>(Method::GET, path, query, None).await
    }
}

fn error_message(body: &[u8], status: StatusCode) -> String {
    serde_json::from_slice::<ErrorBody>(body)
        .ok()
        .map(|b| b.message)
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("unknown error").to_string())
}

fn logins_query(key: &'static str, logins: &[String]) -> Vec<(&'static str, String)> {
    logins.iter().map(|l| (key, l.clone())).collect()
}

#[async_trait::async_trait]
impl HelixApi for HelixClient {
    async fn get_users(&self, logins: &[String]) -> Result<ApiResponse<Vec<User>>> {
        let query = logins_query("login", logins);
        Ok(self.get::<Vec<User>>("users", &query).await?.map(|e| e.data))
    }

    async fn get_streams(&self, logins: &[String]) -> Result<ApiResponse<Vec<Stream>>> {
        let mut query = logins_query("user_login", logins);
        query.push(("first", logins.len().clamp(1, 100).to_string()));
        Ok(self.get::<Vec<Stream>>("streams", &query).await?.map(|e| e.data))
    }

    async fn get_channel_followers(&self, broadcaster_id: &str) -> Result<ApiResponse<u64>> {
        let query = [("broadcaster_id", broadcaster_id.to_string())];
        let resp = self
            .get::<Vec<serde_json::Value>>("channels/followers", &query)
            .await?;
        Ok(resp.map(|e| e.total.unwrap_or_default()))
    }

    async fn get_clips(&self, clip_query: &ClipQuery) -> Result<ApiResponse<Page<Clip>>> {
        let mut query = vec![
            ("broadcaster_id", clip_query.broadcaster_id.clone()),
            ("first", clip_query.first.to_string()),
        ];
        if let Some(after) = &clip_query.after {
            query.push(("after", after.clone()));
        }
        if let Some(started_at) = clip_query.started_at {
            query.push((
                "started_at",
                started_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            ));
        }

        Ok(self.get::<Vec<Clip>>("clips", &query).await?.map(|e| Page {
            items: e.data,
            cursor: e.pagination.cursor,
        }))
    }

    async fn get_subscriptions(
        &self,
        broadcaster_id: &str,
        after: Option<&str>,
    ) -> Result<ApiResponse<Page<ChannelSubscription>>> {
        let mut query = vec![
            ("broadcaster_id", broadcaster_id.to_string()),
            ("first", "100".to_string()),
        ];
        if let Some(after) = after {
            query.push(("after", after.to_string()));
        }

        Ok(self
            .get::<Vec<ChannelSubscription>>("subscriptions", &query)
            .await?
            .map(|e| Page {
                items: e.data,
                cursor: e.pagination.cursor,
            }))
    }

    async fn list_eventsub_subscriptions(
        &self,
        user_id: &str,
    ) -> Result<ApiResponse<Vec<EventSubSubscription>>> {
        let query = [("user_id", user_id.to_string())];
        Ok(self
            .get::<Vec<EventSubSubscription>>("eventsub/subscriptions", &query)
            .await?
            .map(|e| e.data))
    }

    async fn create_eventsub_subscription(
        &self,
        request: &CreateSubscription,
    ) -> Result<ApiResponse<Vec<EventSubSubscription>>> {
        Ok(self
            .request::<Vec<EventSubSubscription>, _>(
                Method::POST,
                "eventsub/subscriptions",
                &[],
                Some(request),
            )
            .await?
            .map(|e| e.data))
    }
}
