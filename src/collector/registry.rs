use log::{debug, error, info};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::core::Collector;
use crate::cache::LookupCache;
use crate::error::{ExporterError, Result};
use crate::eventsub::{self, EventSubManager};
use crate::helix::HelixApi;

/// Everything a collector factory may use while constructing its collector
#[derive(Clone)]
pub struct CollectorDeps {
    pub client: Arc<dyn HelixApi>,
    pub cache: LookupCache,
    /// Present only when event subscriptions are enabled
    pub eventsub: Option<Arc<EventSubManager>>,
    pub channels: Vec<String>,
}

impl std::fmt::Debug for CollectorDeps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectorDeps")
            .field("channels", &self.channels)
            .field("eventsub", &self.eventsub.is_some())
            .finish_non_exhaustive()
    }
}

impl CollectorDeps {
    pub fn new(client: Arc<dyn HelixApi>, cache: LookupCache, channels: Vec<String>) -> Self {
        Self {
            client,
            cache,
            eventsub: None,
            channels,
        }
    }

    pub fn with_eventsub(mut self, manager: Arc<EventSubManager>) -> Self {
        self.eventsub = Some(manager);
        self
    }

    /// The event subscription manager, or `NotConfigured`
    pub fn eventsub(&self) -> Result<&Arc<EventSubManager>> {
        eventsub::require(self.eventsub.as_ref())
    }

    /// Inputs that change what a factory would build
    fn construction_key(&self) -> String {
        format!(
            "{}|eventsub={}",
            self.channels.join(","),
            self.eventsub.is_some()
        )
    }
}

pub type CollectorFuture = Pin<Box<dyn Future<Output = Result<Arc<dyn Collector>>> + Send>>;

/// Builds a collector from its dependencies
pub type CollectorFactory = Arc<dyn Fn(CollectorDeps) -> CollectorFuture + Send + Sync>;

struct Registration {
    default_enabled: bool,
    factory: CollectorFactory,
}

#[derive(Default)]
struct RegistryState {
    enabled: BTreeMap<String, bool>,
    /// Names whose enablement was chosen explicitly by configuration
    forced: BTreeSet<String>,
    constructed: HashMap<String, Arc<dyn Collector>>,
    construction_key: Option<String>,
}

/// Catalogue of collector names, their default enablement and factories
///
/// Registration happens once at start-up through `&mut self`; everything after
/// that goes through the internal mutex, which is only taken while resolving
/// configuration and never during a scrape.
pub struct CollectorRegistry {
    registrations: BTreeMap<String, Registration>,
    state: Mutex<RegistryState>,
}

impl Default for CollectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CollectorRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            registrations: BTreeMap::new(),
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// A registry holding every built-in collector
    pub fn with_defaults() -> Result<Self> {
        let mut registry = Self::new();
        super::register_builtin(&mut registry)?;
        Ok(registry)
    }

    /// Register a collector factory under `name`
    ///
    /// Registering the same name twice is a configuration error.
    pub fn register<F, Fut>(&mut self, name: &str, default_enabled: bool, factory: F) -> Result<()>
    where
        F: Fn(CollectorDeps) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arc<dyn Collector>>> + Send + 'static,
    {
        if self.registrations.contains_key(name) {
            error!("Collector {} registered twice", name);
            return Err(ExporterError::Config(format!(
                "collector '{}' is already registered",
                name
            )));
        }

        let factory: CollectorFactory = Arc::new(move |deps| Box::pin(factory(deps)));
        self.registrations.insert(
            name.to_string(),
            Registration {
                default_enabled,
                factory,
            },
        );
        self.state
            .get_mut()
            .enabled
            .insert(name.to_string(), default_enabled);
        debug!(
            "Registered collector {} (default: {})",
            name,
            if default_enabled { "enabled" } else { "disabled" }
        );
        Ok(())
    }

    /// Registered names in sorted order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.registrations.keys().map(String::as_str)
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.registrations.contains_key(name)
    }

    pub fn default_enabled(&self, name: &str) -> Option<bool> {
        self.registrations.get(name).map(|r| r.default_enabled)
    }

    fn ensure_registered(&self, name: &str) -> Result<()> {
        if self.is_registered(name) {
            Ok(())
        } else {
            Err(ExporterError::Config(format!("unknown collector: {}", name)))
        }
    }

    /// Explicitly enable or disable a collector
    ///
    /// The choice is remembered as forced and survives [`disable_all_defaults`].
    ///
    /// [`disable_all_defaults`]: CollectorRegistry::disable_all_defaults
    pub async fn set_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        self.ensure_registered(name)?;
        let mut state = self.state.lock().await;
        state.enabled.insert(name.to_string(), enabled);
        state.forced.insert(name.to_string());
        Ok(())
    }

    /// Disable every collector whose enablement was not set explicitly
    pub async fn disable_all_defaults(&self) {
        let mut state = self.state.lock().await;
        let RegistryState {
            enabled, forced, ..
        } = &mut *state;
        for (name, on) in enabled.iter_mut() {
            if !forced.contains(name) {
                *on = false;
            }
        }
    }

    /// Compute enablement for `toggles` without applying it
    ///
    /// Every collector starts from its default, explicit toggles are applied
    /// and marked forced, then `disable_defaults` switches off the rest.
    pub fn plan(&self, toggles: &BTreeMap<String, bool>, disable_defaults: bool) -> Result<Enablement> {
        for name in toggles.keys() {
            self.ensure_registered(name)?;
        }

        let mut plan = Enablement::default();
        for (name, registration) in &self.registrations {
            let forced = toggles.get(name).copied();
            let on = match forced {
                Some(on) => on,
                None => registration.default_enabled && !disable_defaults,
            };
            plan.enabled.insert(name.clone(), on);
            if forced.is_some() {
                plan.forced.insert(name.clone());
            }
        }
        Ok(plan)
    }

    /// Reset enablement to the defaults, then apply explicit toggles
    pub async fn configure(&self, toggles: &BTreeMap<String, bool>, disable_defaults: bool) -> Result<()> {
        let plan = self.plan(toggles, disable_defaults)?;
        let mut state = self.state.lock().await;
        state.enabled = plan.enabled;
        state.forced = plan.forced;
        Ok(())
    }

    pub async fn is_enabled(&self, name: &str) -> bool {
        let state = self.state.lock().await;
        state.enabled.get(name).copied().unwrap_or(false)
    }

    /// Names of the currently enabled collectors, sorted
    pub async fn enabled_names(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .enabled
            .iter()
            .filter(|(_, on)| **on)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Collectors for `wanted`, reusing instances built for the same `key`
    ///
    /// The registry lock is only held while reading the cache; factories run
    /// without it.
    async fn construct(
        &self,
        wanted: Vec<String>,
        deps: &CollectorDeps,
        key: &str,
    ) -> Result<BTreeMap<String, Arc<dyn Collector>>> {
        let mut active = BTreeMap::new();
        let mut missing = Vec::new();
        {
            let state = self.state.lock().await;
            let reusable = state.construction_key.as_deref() == Some(key);
            for name in wanted {
                match state.constructed.get(&name).filter(|_| reusable) {
                    Some(collector) => {
                        active.insert(name, Arc::clone(collector));
                    }
                    None => missing.push(name),
                }
            }
        }

        for name in missing {
            let registration = self
                .registrations
                .get(&name)
                .ok_or_else(|| ExporterError::Config(format!("unknown collector: {}", name)))?;
            let collector = (registration.factory)(deps.clone()).await.map_err(|e| {
                error!("Failed to construct collector {}: {}", name, e);
                e
            })?;
            active.insert(name, collector);
        }
        Ok(active)
    }

    /// Resolve the collectors to run, constructing each at most once per generation
    ///
    /// A non-empty `filters` must only name registered, enabled collectors and
    /// restricts the result to them; an empty one selects every enabled
    /// collector. Instances are reused until `deps` changes what a factory
    /// would build.
    pub async fn resolve_active(
        &self,
        filters: &[String],
        deps: &CollectorDeps,
    ) -> Result<BTreeMap<String, Arc<dyn Collector>>> {
        let wanted: Vec<String> = {
            let state = self.state.lock().await;

            let mut selected = BTreeSet::new();
            for filter in filters {
                match state.enabled.get(filter) {
                    None => {
                        return Err(ExporterError::Config(format!("missing collector: {}", filter)));
                    }
                    Some(false) => {
                        return Err(ExporterError::Config(format!("disabled collector: {}", filter)));
                    }
                    Some(true) => {
                        selected.insert(filter.as_str());
                    }
                }
            }

            state
                .enabled
                .iter()
                .filter(|(name, on)| **on && (selected.is_empty() || selected.contains(name.as_str())))
                .map(|(name, _)| name.clone())
                .collect()
        };

        let key = deps.construction_key();
        let mut active = self.construct(wanted, deps, &key).await?;

        let mut state = self.state.lock().await;
        if state.construction_key.as_deref() != Some(key.as_str()) {
            if !state.constructed.is_empty() {
                info!("Collector dependencies changed, rebuilding collectors");
            }
            state.constructed.clear();
            state.construction_key = Some(key);
        }
        // a concurrent resolution may have cached an instance first
        for (name, collector) in active.iter_mut() {
            let cached = state
                .constructed
                .entry(name.clone())
                .or_insert_with(|| Arc::clone(collector));
            *collector = Arc::clone(cached);
        }
        Ok(active)
    }

    /// Build the full enabled set for `plan` and `deps` without applying either
    ///
    /// Nothing in the registry changes until [`commit`]; dropping the result
    /// instead discards the collectors it built.
    ///
    /// [`commit`]: CollectorRegistry::commit
    pub async fn stage(&self, plan: Enablement, deps: &CollectorDeps) -> Result<StagedCollectors> {
        let key = deps.construction_key();
        let collectors = self.construct(plan.enabled_names(), deps, &key).await?;
        Ok(StagedCollectors {
            plan,
            key,
            collectors,
        })
    }

    /// Apply a staged enablement and its collectors, returning the collectors
    pub async fn commit(&self, staged: StagedCollectors) -> BTreeMap<String, Arc<dyn Collector>> {
        let StagedCollectors {
            plan,
            key,
            collectors,
        } = staged;

        let mut state = self.state.lock().await;
        state.enabled = plan.enabled;
        state.forced = plan.forced;
        state.construction_key = Some(key);
        state.constructed = collectors
            .iter()
            .map(|(name, collector)| (name.clone(), Arc::clone(collector)))
            .collect();
        collectors
    }
}

/// Collector enablement computed from configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Enablement {
    enabled: BTreeMap<String, bool>,
    forced: BTreeSet<String>,
}

impl Enablement {
    pub fn is_enabled(&self, name: &str) -> bool {
        self.enabled.get(name).copied().unwrap_or(false)
    }

    /// Enabled names, sorted
    pub fn enabled_names(&self) -> Vec<String> {
        self.enabled
            .iter()
            .filter(|(_, on)| **on)
            .map(|(name, _)| name.clone())
            .collect()
    }
}

/// Collectors built for a reload that has not been applied yet
pub struct StagedCollectors {
    plan: Enablement,
    key: String,
    collectors: BTreeMap<String, Arc<dyn Collector>>,
}

impl StagedCollectors {
    /// Names of the staged collectors, sorted
    pub fn names(&self) -> Vec<&str> {
        self.collectors.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::MetricSink;
    use crate::helix::{
        ApiResponse, ChannelSubscription, Clip, ClipQuery, CreateSubscription,
        EventSubSubscription, Page, Stream, User,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct NullApi;

    #[async_trait::async_trait]
    impl HelixApi for NullApi {
        async fn get_users(&self, _: &[String]) -> Result<ApiResponse<Vec<User>>> {
            Ok(ApiResponse::ok(Vec::new()))
        }
        async fn get_streams(&self, _: &[String]) -> Result<ApiResponse<Vec<Stream>>> {
            Ok(ApiResponse::ok(Vec::new()))
        }
        async fn get_channel_followers(&self, _: &str) -> Result<ApiResponse<u64>> {
            Ok(ApiResponse::ok(0))
        }
        async fn get_clips(&self, _: &ClipQuery) -> Result<ApiResponse<Page<Clip>>> {
            Ok(ApiResponse::ok(Page::default()))
        }
        async fn get_subscriptions(
            &self,
            _: &str,
            _: Option<&str>,
        ) -> Result<ApiResponse<Page<ChannelSubscription>>> {
            Ok(ApiResponse::ok(Page::default()))
        }
        async fn list_eventsub_subscriptions(
            &self,
            _: &str,
        ) -> Result<ApiResponse<Vec<EventSubSubscription>>> {
            Ok(ApiResponse::ok(Vec::new()))
        }
        async fn create_eventsub_subscription(
            &self,
            _: &CreateSubscription,
        ) -> Result<ApiResponse<Vec<EventSubSubscription>>> {
            Ok(ApiResponse::accepted(Vec::new()))
        }
    }

    struct Idle;

    #[async_trait::async_trait]
    impl Collector for Idle {
        async fn update(&self, _sink: &MetricSink) -> Result<()> {
            Ok(())
        }
    }

    fn deps(channels: &[&str]) -> CollectorDeps {
        CollectorDeps::new(
            Arc::new(NullApi),
            LookupCache::in_memory(crate::cache::DEFAULT_TTL),
            channels.iter().map(|c| c.to_string()).collect(),
        )
    }

    fn counting_registry(names: &[(&str, bool)], builds: Arc<AtomicUsize>) -> CollectorRegistry {
        let mut registry = CollectorRegistry::new();
        for (name, default_enabled) in names {
            let builds = Arc::clone(&builds);
            registry
                .register(name, *default_enabled, move |_deps| {
                    let builds = Arc::clone(&builds);
                    async move {
                        builds.fetch_add(1, Ordering::SeqCst);
                        Ok(Arc::new(Idle) as Arc<dyn Collector>)
                    }
                })
                .unwrap();
        }
        registry
    }

    fn keys(active: &BTreeMap<String, Arc<dyn Collector>>) -> Vec<&str> {
        active.keys().map(String::as_str).collect()
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = counting_registry(&[("a", true)], Arc::default());
        let err = registry
            .register("a", false, |_deps| async { Ok(Arc::new(Idle) as Arc<dyn Collector>) })
            .unwrap_err();
        assert!(matches!(err, ExporterError::Config(_)));
        assert_eq!(registry.default_enabled("a"), Some(true));
    }

    #[tokio::test]
    async fn resolve_matches_enablement_for_every_combination() {
        let names = ["a", "b", "c", "d"];
        let registry = counting_registry(
            &names.iter().map(|n| (*n, true)).collect::<Vec<_>>(),
            Arc::default(),
        );
        let deps = deps(&["alice"]);

        for mask in 0u8..16 {
            let mut toggles = BTreeMap::new();
            for (bit, name) in names.iter().enumerate() {
                toggles.insert(name.to_string(), mask & (1 << bit) != 0);
            }
            registry.configure(&toggles, false).await.unwrap();

            let active = registry.resolve_active(&[], &deps).await.unwrap();
            let expected: Vec<&str> = names
                .iter()
                .enumerate()
                .filter(|(bit, _)| mask & (1 << bit) != 0)
                .map(|(_, n)| *n)
                .collect();
            assert_eq!(keys(&active), expected, "mask {:04b}", mask);
        }
    }

    #[tokio::test]
    async fn unknown_or_disabled_filter_is_a_config_error() {
        let registry = counting_registry(&[("a", true), ("b", false)], Arc::default());
        let deps = deps(&["alice"]);

        let err = registry
            .resolve_active(&["nope".to_string()], &deps)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ExporterError::Config(ref m) if m.contains("missing collector")));

        let err = registry
            .resolve_active(&["b".to_string()], &deps)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ExporterError::Config(ref m) if m.contains("disabled collector")));

        let active = registry.resolve_active(&["a".to_string()], &deps).await.unwrap();
        assert_eq!(keys(&active), vec!["a"]);
    }

    #[tokio::test]
    async fn disable_defaults_keeps_forced_choices() {
        let registry = counting_registry(&[("a", true), ("b", true), ("c", false)], Arc::default());
        registry.set_enabled("b", true).await.unwrap();
        registry.disable_all_defaults().await;

        assert_eq!(registry.enabled_names().await, vec!["b".to_string()]);

        let mut toggles = BTreeMap::new();
        toggles.insert("c".to_string(), true);
        registry.configure(&toggles, true).await.unwrap();
        assert_eq!(registry.enabled_names().await, vec!["c".to_string()]);

        assert!(registry.set_enabled("zzz", true).await.is_err());
    }

    #[tokio::test]
    async fn collectors_are_constructed_once_per_generation() {
        let builds = Arc::new(AtomicUsize::new(0));
        let registry = counting_registry(&[("a", true), ("b", true)], Arc::clone(&builds));

        let first = deps(&["alice"]);
        let one = registry.resolve_active(&[], &first).await.unwrap();
        let two = registry.resolve_active(&["a".to_string()], &first).await.unwrap();
        assert_eq!(builds.load(Ordering::SeqCst), 2);
        assert!(Arc::ptr_eq(&one["a"], &two["a"]));

        let changed = deps(&["alice", "bob"]);
        registry.resolve_active(&[], &changed).await.unwrap();
        assert_eq!(builds.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn factory_failure_is_propagated() {
        let mut registry = CollectorRegistry::new();
        registry
            .register("needs_eventsub", true, |deps: CollectorDeps| async move {
                deps.eventsub()?;
                Ok(Arc::new(Idle) as Arc<dyn Collector>)
            })
            .unwrap();

        let err = registry.resolve_active(&[], &deps(&[])).await.err().unwrap();
        assert!(matches!(err, ExporterError::NotConfigured));
    }

    #[tokio::test]
    async fn construction_does_not_hold_the_registry() {
        let gate = Arc::new(tokio::sync::Notify::new());
        let mut registry = CollectorRegistry::new();
        {
            let gate = Arc::clone(&gate);
            registry
                .register("slow", true, move |_deps| {
                    let gate = Arc::clone(&gate);
                    async move {
                        gate.notified().await;
                        Ok(Arc::new(Idle) as Arc<dyn Collector>)
                    }
                })
                .unwrap();
        }
        let deps = deps(&["alice"]);

        let meanwhile = async {
            let names = registry.enabled_names().await;
            gate.notify_one();
            names
        };
        let (active, names) = tokio::time::timeout(
            Duration::from_secs(5),
            async { tokio::join!(registry.resolve_active(&[], &deps), meanwhile) },
        )
        .await
        .unwrap();

        assert_eq!(keys(&active.unwrap()), vec!["slow"]);
        assert_eq!(names, vec!["slow".to_string()]);
    }

    #[tokio::test]
    async fn failed_stage_leaves_registry_untouched() {
        let builds = Arc::new(AtomicUsize::new(0));
        let mut registry = counting_registry(&[("a", true), ("b", true)], Arc::clone(&builds));
        registry
            .register("picky", false, |deps: CollectorDeps| async move {
                if deps.channels.len() > 1 {
                    return Err(ExporterError::upstream("get users", 503, "down"));
                }
                Ok(Arc::new(Idle) as Arc<dyn Collector>)
            })
            .unwrap();

        let current = deps(&["alice"]);
        let before = registry.resolve_active(&[], &current).await.unwrap();
        assert_eq!(builds.load(Ordering::SeqCst), 2);

        let mut toggles = BTreeMap::new();
        toggles.insert("a".to_string(), false);
        toggles.insert("picky".to_string(), true);
        let plan = registry.plan(&toggles, false).unwrap();
        assert!(!plan.is_enabled("a"));
        assert!(registry.is_enabled("a").await);

        let err = registry
            .stage(plan.clone(), &deps(&["alice", "bob"]))
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("503"));
        // "b" was rebuilt for the new channels before "picky" failed
        assert_eq!(builds.load(Ordering::SeqCst), 3);

        // old enablement and instances still resolve
        assert_eq!(registry.enabled_names().await, vec!["a", "b"]);
        let after = registry.resolve_active(&["a".to_string()], &current).await.unwrap();
        assert!(Arc::ptr_eq(&before["a"], &after["a"]));

        let staged = registry.stage(plan, &current).await.unwrap();
        assert_eq!(staged.names(), vec!["b", "picky"]);
        assert_eq!(registry.enabled_names().await, vec!["a", "b"]);

        let committed = registry.commit(staged).await;
        assert!(Arc::ptr_eq(&before["b"], &committed["b"]));
        assert_eq!(registry.enabled_names().await, vec!["b", "picky"]);
        assert!(registry.resolve_active(&["a".to_string()], &current).await.is_err());
        assert_eq!(builds.load(Ordering::SeqCst), 3);
    }
}
