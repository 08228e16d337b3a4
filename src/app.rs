//! Wiring of configuration, platform clients, collectors and the exporter
//!
//! [`App`] is what the HTTP surface and the signal handler talk to. It owns
//! the single collector registry and the swappable exporter.

use log::{error, info, warn};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;

use crate::cache::LookupCache;
use crate::collector::{CollectorDeps, CollectorRegistry, MetricSink, StagedCollectors, drain};
use crate::config::{ExporterConfig, SafeConfig};
use crate::error::Result;
use crate::eventsub::{EventSubManager, WebhookRequest, WebhookResponse};
use crate::exporter::{Exporter, ExporterHandle};
use crate::exposition;
use crate::helix::{HelixApi, HelixClient};

pub struct App {
    config: SafeConfig,
    registry: CollectorRegistry,
    deps: RwLock<CollectorDeps>,
    exporter: ExporterHandle,
    reload_lock: Mutex<()>,
}

impl App {
    /// Connect to the platform and build the initial collector set
    ///
    /// Client construction failures are returned as-is; nothing can run
    /// without a working client.
    pub async fn start(config: SafeConfig) -> Result<Self> {
        let current = config.current();
        let credentials = current.twitch.credentials();

        let client: Arc<dyn HelixApi> = Arc::new(HelixClient::connect(credentials.clone()).await?);

        let eventsub = if current.eventsub.enabled {
            // webhook subscriptions are only accepted with an app token
            let app_client: Arc<dyn HelixApi> = Arc::new(HelixClient::connect_app(credentials).await?);
            Some(Arc::new(EventSubManager::new(
                app_client,
                current.eventsub.webhook_url.clone(),
                current.eventsub.webhook_secret.clone(),
            )))
        } else {
            None
        };

        Self::with_clients(config, client, eventsub).await
    }

    /// Build around already constructed clients
    pub async fn with_clients(
        config: SafeConfig,
        client: Arc<dyn HelixApi>,
        eventsub: Option<Arc<EventSubManager>>,
    ) -> Result<Self> {
        let current = config.current();
        warn_if_idle(&current);

        let registry = CollectorRegistry::with_defaults()?;
        registry
            .configure(
                &current.collectors.toggles,
                current.collectors.disable_defaults,
            )
            .await?;

        let mut deps = CollectorDeps::new(
            client,
            LookupCache::in_memory(current.cache.ttl()),
            current.twitch.channels.clone(),
        );
        if let Some(manager) = eventsub {
            deps = deps.with_eventsub(manager);
        }

        let exporter = Exporter::build(&registry, &deps, &[]).await?;

        Ok(Self {
            config,
            registry,
            deps: RwLock::new(deps),
            exporter: ExporterHandle::new(exporter),
            reload_lock: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &SafeConfig {
        &self.config
    }

    pub fn registry(&self) -> &CollectorRegistry {
        &self.registry
    }

    /// The collector set scrapes currently use
    pub fn exporter(&self) -> Arc<Exporter> {
        self.exporter.current()
    }

    fn deps(&self) -> CollectorDeps {
        self.deps
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn eventsub(&self) -> Option<Arc<EventSubManager>> {
        self.deps().eventsub
    }

    /// Run one scrape and render it
    ///
    /// An empty `filters` uses the current collector set. Otherwise the named
    /// collectors are resolved for this request only; an unknown or disabled
    /// name is a `Config` error.
    pub async fn scrape(&self, filters: &[String]) -> Result<String> {
        let exporter = if filters.is_empty() {
            self.exporter.current()
        } else {
            let collectors = self.registry.resolve_active(filters, &self.deps()).await?;
            Arc::new(Exporter::new(collectors))
        };

        let (sink, mut rx) = MetricSink::channel();
        exporter
            .collect_with_deadline(&sink, self.config.current().scrape.deadline())
            .await;
        drop(sink);

        let mut samples = drain(&mut rx);
        samples.extend(self.config.samples());
        exposition::render(&samples)
    }

    /// Re-read configuration and swap in a freshly resolved collector set
    ///
    /// The new configuration, enablement, channels and collectors are all
    /// prepared first and applied together only once every collector has been
    /// built. On any failure the previous state keeps serving and the reload
    /// gauge reports 0. Scrapes already running keep the set they started
    /// with. Credentials, event subscription settings and the cache TTL only
    /// change on restart.
    pub async fn reload(&self) -> Result<()> {
        let _guard = self.reload_lock.lock().await;

        let config = self.config.stage()?;
        let (deps, staged) = match self.stage(&config).await {
            Ok(prepared) => prepared,
            Err(e) => {
                self.config.record_failure();
                error!("Reload failed, keeping the previous collectors: {}", e);
                return Err(e);
            }
        };

        warn_if_idle(&config);
        let collectors = self.registry.commit(staged).await;
        *self.deps.write().unwrap_or_else(|e| e.into_inner()) = deps;
        self.exporter.replace(Exporter::new(collectors));
        self.config.commit(config);

        info!(
            "Reload complete, active collectors: {}",
            self.exporter.current().names().join(", ")
        );
        Ok(())
    }

    async fn stage(&self, config: &ExporterConfig) -> Result<(CollectorDeps, StagedCollectors)> {
        let plan = self.registry.plan(
            &config.collectors.toggles,
            config.collectors.disable_defaults,
        )?;
        let mut deps = self.deps();
        deps.channels = config.twitch.channels.clone();
        let staged = self.registry.stage(plan, &deps).await?;
        Ok((deps, staged))
    }

    /// Hand a webhook delivery to the event subscription manager
    pub fn handle_webhook(&self, request: &WebhookRequest) -> WebhookResponse {
        match self.eventsub() {
            Some(manager) => manager.handle(request),
            None => WebhookResponse {
                status: 404,
                body: "event subscriptions are not enabled".to_string(),
            },
        }
    }
}

fn warn_if_idle(config: &ExporterConfig) {
    if config.twitch.channels.is_empty() {
        warn!("No channels defined in params or config");
    }
}
