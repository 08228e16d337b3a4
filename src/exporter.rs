//! Scrape orchestration
//!
//! An [`Exporter`] owns the collectors of one configuration generation and
//! runs all of them concurrently on every scrape. [`ExporterHandle`] lets a
//! reload swap the whole set while scrapes that already started keep the set
//! they captured.

use log::{debug, error, info, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, LazyLock, RwLock};
use std::time::{Duration, Instant};
use tokio::task::JoinSet;

use crate::collector::{Collector, CollectorDeps, CollectorRegistry, Desc, MetricSink};
use crate::error::{ExporterError, Result};

static SCRAPE_DURATION: LazyLock<Arc<Desc>> = LazyLock::new(|| {
    Desc::gauge(
        "scrape",
        "collector_duration_seconds",
        "twitch_exporter: Duration of a collector scrape.",
        &["collector"],
    )
});

static SCRAPE_SUCCESS: LazyLock<Arc<Desc>> = LazyLock::new(|| {
    Desc::gauge(
        "scrape",
        "collector_success",
        "twitch_exporter: Whether a collector succeeded.",
        &["collector"],
    )
});

/// How one collector finished within one scrape
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    /// Ran fine but had nothing to report
    NoData,
    Failed(String),
    /// Abandoned at the scrape deadline
    TimedOut,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Succeeded)
    }
}

/// Per-collector result of a scrape
#[derive(Debug, Clone)]
pub struct CollectorReport {
    pub name: String,
    pub outcome: Outcome,
    pub duration: Duration,
}

/// The resolved collector set of one configuration generation
pub struct Exporter {
    collectors: BTreeMap<String, Arc<dyn Collector>>,
}

impl std::fmt::Debug for Exporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exporter")
            .field("collectors", &self.collectors.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Exporter {
    pub fn new(collectors: BTreeMap<String, Arc<dyn Collector>>) -> Self {
        Self { collectors }
    }

    /// Resolve the active collectors from `registry`
    pub async fn build(registry: &CollectorRegistry, deps: &CollectorDeps, filters: &[String]) -> Result<Self> {
        let collectors = registry.resolve_active(filters, deps).await?;
        for name in collectors.keys() {
            info!("Enabled collector {}", name);
        }
        Ok(Self::new(collectors))
    }

    /// Names of the active collectors, sorted
    pub fn names(&self) -> Vec<&str> {
        self.collectors.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.collectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collectors.is_empty()
    }

    /// Run every collector once, waiting for all of them
    pub async fn collect(&self, sink: &MetricSink) -> Vec<CollectorReport> {
        self.collect_with_deadline(sink, None).await
    }

    /// Run every collector once, abandoning any still running after `deadline`
    ///
    /// Each collector runs in its own task. Duration and success gauges are
    /// emitted here after each task finishes, whatever its outcome, so a
    /// failed or abandoned collector still shows up with success 0. Dropping
    /// the returned future aborts every collector task still in flight.
    pub async fn collect_with_deadline(&self, sink: &MetricSink, deadline: Option<Duration>) -> Vec<CollectorReport> {
        let started = Instant::now();

        // dropping the set aborts every task still running
        let mut tasks = JoinSet::new();
        for (name, collector) in &self.collectors {
            let name = name.clone();
            let collector = Arc::clone(collector);
            let sink = sink.clone();
            tasks.spawn(async move {
                let begin = Instant::now();
                let result = match deadline {
                    Some(limit) => tokio::time::timeout(limit, collector.update(&sink))
                        .await
                        .unwrap_or(Err(ExporterError::Timeout(limit))),
                    None => collector.update(&sink).await,
                };
                (name, result, begin.elapsed())
            });
        }

        let mut pending: BTreeSet<String> = self.collectors.keys().cloned().collect();
        let mut finished = Vec::with_capacity(pending.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((name, result, duration)) => {
                    pending.remove(&name);
                    let outcome = match result {
                        Ok(()) => (Outcome::Succeeded, duration),
                        Err(ExporterError::NoData) => (Outcome::NoData, duration),
                        Err(ExporterError::Timeout(limit)) => (Outcome::TimedOut, limit),
                        Err(e) => (Outcome::Failed(e.to_string()), duration),
                    };
                    finished.push((name, outcome));
                }
                Err(e) => error!("Collector task failed: {}", e),
            }
        }
        // a panicked task never reports its name
        for name in pending {
            finished.push((
                name,
                (Outcome::Failed("collector task failed".to_string()), started.elapsed()),
            ));
        }

        let mut reports = Vec::with_capacity(finished.len());
        for (name, (outcome, duration)) in finished {
            match &outcome {
                Outcome::Succeeded => debug!(
                    "Collector {} succeeded in {:.3}s",
                    name,
                    duration.as_secs_f64()
                ),
                Outcome::NoData => warn!(
                    "Collector {} returned no data in {:.3}s",
                    name,
                    duration.as_secs_f64()
                ),
                Outcome::TimedOut => error!(
                    "Collector {} did not finish within {:.3}s",
                    name,
                    duration.as_secs_f64()
                ),
                Outcome::Failed(reason) => error!(
                    "Collector {} failed after {:.3}s: {}",
                    name,
                    duration.as_secs_f64(),
                    reason
                ),
            }

            let success = if outcome.is_success() { 1.0 } else { 0.0 };
            sink.emit(&SCRAPE_DURATION, duration.as_secs_f64(), &[&name]);
            sink.emit(&SCRAPE_SUCCESS, success, &[&name]);

            reports.push(CollectorReport {
                name,
                outcome,
                duration,
            });
        }

        debug!(
            "Scrape of {} collectors took {:.3}s",
            reports.len(),
            started.elapsed().as_secs_f64()
        );
        reports
    }
}

/// Shared, swappable reference to the current [`Exporter`]
#[derive(Debug)]
pub struct ExporterHandle {
    current: RwLock<Arc<Exporter>>,
}

impl ExporterHandle {
    pub fn new(exporter: Exporter) -> Self {
        Self {
            current: RwLock::new(Arc::new(exporter)),
        }
    }

    /// The exporter scrapes should use right now
    pub fn current(&self) -> Arc<Exporter> {
        let guard = self.current.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    /// Install `exporter`, returning the one it replaces
    pub fn replace(&self, exporter: Exporter) -> Arc<Exporter> {
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *guard, Arc::new(exporter))
    }
}
