//! Core collector traits and types
use crate::error::Result;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Namespace prepended to every exported metric
pub const NAMESPACE: &str = "twitch";

/// How a sample should be exposed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Gauge,
    Counter,
}

/// Join non-empty name parts with underscores
pub fn build_fq_name(namespace: &str, subsystem: &str, name: &str) -> String {
    [namespace, subsystem, name]
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("_")
}

/// Static description of a metric family
#[derive(Debug, Clone, PartialEq)]
pub struct Desc {
    /// Fully qualified metric name
    pub fq_name: String,
    /// Help text shown in the exposition
    pub help: String,
    /// Names of the variable labels, in the order values are supplied
    pub label_names: Vec<String>,
    /// Gauge or counter
    pub value_type: ValueType,
}

impl Desc {
    /// Create a new descriptor under the exporter namespace
    pub fn new(
        subsystem: &str,
        name: &str,
        help: impl Into<String>,
        label_names: &[&str],
        value_type: ValueType,
    ) -> Arc<Self> {
        Arc::new(Self {
            fq_name: build_fq_name(NAMESPACE, subsystem, name),
            help: help.into(),
            label_names: label_names.iter().map(|l| l.to_string()).collect(),
            value_type,
        })
    }

    /// Create a gauge descriptor
    pub fn gauge(subsystem: &str, name: &str, help: impl Into<String>, label_names: &[&str]) -> Arc<Self> {
        Self::new(subsystem, name, help, label_names, ValueType::Gauge)
    }

    /// Create a counter descriptor
    pub fn counter(subsystem: &str, name: &str, help: impl Into<String>, label_names: &[&str]) -> Arc<Self> {
        Self::new(subsystem, name, help, label_names, ValueType::Counter)
    }
}

/// A single point-in-time metric value
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub desc: Arc<Desc>,
    pub value: f64,
    pub label_values: Vec<String>,
}

impl Sample {
    /// Create a sample for `desc`; label values are positional
    pub fn new(desc: &Arc<Desc>, value: f64, label_values: &[&str]) -> Self {
        Self {
            desc: Arc::clone(desc),
            value,
            label_values: label_values.iter().map(|v| v.to_string()).collect(),
        }
    }

    /// Look up the value of a label by name
    pub fn label(&self, name: &str) -> Option<&str> {
        self.desc
            .label_names
            .iter()
            .position(|l| l == name)
            .and_then(|idx| self.label_values.get(idx))
            .map(String::as_str)
    }
}

/// Output channel shared by every collector task of one scrape
///
/// Cloning is cheap; all clones feed the same receiver.
#[derive(Debug, Clone)]
pub struct MetricSink {
    tx: mpsc::UnboundedSender<Sample>,
}

impl MetricSink {
    /// Create a sink and the receiver that drains it
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Sample>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Emit a sample
    pub fn send(&self, sample: Sample) {
        if self.tx.send(sample).is_err() {
            log::trace!("Metric receiver dropped, discarding sample");
        }
    }

    /// Emit a value for `desc`
    pub fn emit(&self, desc: &Arc<Desc>, value: f64, label_values: &[&str]) {
        self.send(Sample::new(desc, value, label_values));
    }
}

/// Drain every sample currently buffered in `rx`
pub fn drain(rx: &mut mpsc::UnboundedReceiver<Sample>) -> Vec<Sample> {
    let mut samples = Vec::new();
    while let Ok(sample) = rx.try_recv() {
        samples.push(sample);
    }
    samples
}

/// A unit of work producing the samples of one scrape
///
/// Instances are built once per configuration generation and reused across
/// scrapes, so `update` must not rely on being called only once.
#[async_trait::async_trait]
pub trait Collector: Send + Sync + 'static {
    /// Query upstream and emit samples into `sink`
    async fn update(&self, sink: &MetricSink) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fq_name_skips_empty_parts() {
        assert_eq!(build_fq_name("twitch", "", "channel_up"), "twitch_channel_up");
        assert_eq!(
            build_fq_name("twitch", "scrape", "collector_success"),
            "twitch_scrape_collector_success"
        );
    }

    #[test]
    fn sample_label_lookup() {
        let desc = Desc::gauge("", "channel_up", "Is the channel live.", &["username", "game"]);
        let sample = Sample::new(&desc, 1.0, &["alice", "Just Chatting"]);
        assert_eq!(sample.label("username"), Some("alice"));
        assert_eq!(sample.label("game"), Some("Just Chatting"));
        assert_eq!(sample.label("missing"), None);
    }

    #[tokio::test]
    async fn sink_clones_feed_one_receiver() {
        let (sink, mut rx) = MetricSink::channel();
        let desc = Desc::gauge("", "x", "x", &[]);
        let other = sink.clone();
        sink.emit(&desc, 1.0, &[]);
        other.emit(&desc, 2.0, &[]);
        drop(sink);
        drop(other);

        let values: Vec<f64> = drain(&mut rx).into_iter().map(|s| s.value).collect();
        assert_eq!(values, vec![1.0, 2.0]);
    }
}
