//! Prometheus text exposition of collected samples

use log::warn;
use prometheus::{CounterVec, Encoder, GaugeVec, Opts, Registry, TextEncoder};
use std::collections::BTreeMap;

use crate::collector::{Sample, ValueType};
use crate::error::{ExporterError, Result};

/// Content type of the text exposition format
pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

enum Family {
    Gauge(GaugeVec),
    Counter(CounterVec),
}

/// Render one scrape's samples in the text exposition format
///
/// Samples are grouped by metric name; the first sample of a name decides its
/// help text and labels. Samples that do not fit their family are skipped.
pub fn render(samples: &[Sample]) -> Result<String> {
    let registry = Registry::new();
    let mut families: BTreeMap<&str, Family> = BTreeMap::new();

    for sample in samples {
        let desc = &sample.desc;
        if !families.contains_key(desc.fq_name.as_str()) {
            let opts = Opts::new(desc.fq_name.clone(), desc.help.clone());
            let labels: Vec<&str> = desc.label_names.iter().map(String::as_str).collect();
            let family = match desc.value_type {
                ValueType::Gauge => {
                    let vec = GaugeVec::new(opts, &labels)?;
                    registry.register(Box::new(vec.clone()))?;
                    Family::Gauge(vec)
                }
                ValueType::Counter => {
                    let vec = CounterVec::new(opts, &labels)?;
                    registry.register(Box::new(vec.clone()))?;
                    Family::Counter(vec)
                }
            };
            families.insert(desc.fq_name.as_str(), family);
        }

        let values: Vec<&str> = sample.label_values.iter().map(String::as_str).collect();
        let applied = match families.get(desc.fq_name.as_str()) {
            Some(Family::Gauge(vec)) => vec
                .get_metric_with_label_values(&values)
                .map(|g| g.set(sample.value)),
            Some(Family::Counter(vec)) if sample.value >= 0.0 => vec
                .get_metric_with_label_values(&values)
                .map(|c| c.inc_by(sample.value)),
            Some(Family::Counter(_)) => {
                warn!("Skipping negative counter sample for {}", desc.fq_name);
                Ok(())
            }
            None => Ok(()),
        };
        if let Err(e) = applied {
            warn!("Skipping sample for {}: {}", desc.fq_name, e);
        }
    }

    let mut buffer = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| ExporterError::Other(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::Desc;

    #[test]
    fn renders_gauges_and_counters() {
        let up = Desc::gauge("", "channel_up", "Is the channel live.", &["username", "game"]);
        let messages = Desc::counter(
            "",
            "channel_chat_messages_total",
            "The number of chat messages sent in a channel.",
            &["username", "chatter_username"],
        );

        let text = render(&[
            Sample::new(&up, 1.0, &["alice", "Just Chatting"]),
            Sample::new(&up, 0.0, &["bob", ""]),
            Sample::new(&messages, 3.0, &["alice", "carol"]),
        ])
        .unwrap();

        assert!(text.contains("# TYPE twitch_channel_up gauge"));
        assert!(text.contains(r#"twitch_channel_up{game="Just Chatting",username="alice"} 1"#));
        assert!(text.contains(r#"twitch_channel_up{game="",username="bob"} 0"#));
        assert!(text.contains("# TYPE twitch_channel_chat_messages_total counter"));
        assert!(text.contains(
            r#"twitch_channel_chat_messages_total{chatter_username="carol",username="alice"} 3"#
        ));
    }

    #[test]
    fn mismatched_labels_are_skipped() {
        let desc = Desc::gauge("", "channel_up", "Is the channel live.", &["username", "game"]);
        let text = render(&[Sample::new(&desc, 1.0, &["alice"])]).unwrap();
        assert!(!text.contains("alice"));
    }
}
