//! Prometheus collector exposing the latest analytics snapshots.
//!
//! Every scrape reads the snapshot store only; it never triggers an API call.
//! Alongside the analytics gauges it reports how long the read took and
//! whether it completed without an internal fault.

use prometheus::core::{Collector, Desc};
use prometheus::proto::{Gauge, LabelPair, Metric, MetricFamily, MetricType};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error};

use crate::metrics::{MetricRegistry, NAMESPACE};
use crate::storage::SnapshotStore;

/// Label value identifying this collector in the health metrics
pub const COLLECTOR_NAME: &str = "analytics";

const HEALTH_LABEL: &str = "collector";

/// Scrape-side view of the snapshot store
pub struct AnalyticsExporter {
    registry: Arc<MetricRegistry>,
    store: Arc<SnapshotStore>,
    /// One descriptor per distinct exposed name, in registry order
    descs: Vec<Desc>,
    duration_desc: Desc,
    success_desc: Desc,
}

impl AnalyticsExporter {
    pub fn new(registry: Arc<MetricRegistry>, store: Arc<SnapshotStore>) -> prometheus::Result<Self> {
        let mut descs: Vec<Desc> = Vec::new();
        for definition in registry.definitions() {
            if descs.iter().any(|desc| desc.fq_name == definition.exposed_name) {
                continue;
            }
            descs.push(Desc::new(
                definition.exposed_name.clone(),
                definition.description.clone(),
                definition.label_names.clone(),
                HashMap::new(),
            )?);
        }

        let duration_desc = Desc::new(
            format!("{}_scrape_collector_duration_seconds", NAMESPACE),
            "azion_exporter: Duration of a collector scrape.".to_string(),
            vec![HEALTH_LABEL.to_string()],
            HashMap::new(),
        )?;
        let success_desc = Desc::new(
            format!("{}_scrape_collector_success", NAMESPACE),
            "azion_exporter: Whether a collector succeeded.".to_string(),
            vec![HEALTH_LABEL.to_string()],
            HashMap::new(),
        )?;

        Ok(AnalyticsExporter {
            registry,
            store,
            descs,
            duration_desc,
            success_desc,
        })
    }
}

impl Collector for AnalyticsExporter {
    fn desc(&self) -> Vec<&Desc> {
        self.descs
            .iter()
            .chain([&self.duration_desc, &self.success_desc])
            .collect()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let begin = Instant::now();

        let (snapshots, faults) = self.store.read_all();
        for fault in &faults {
            error!("Failed to read snapshot: {}", fault);
        }
        let success = faults.is_empty();

        let mut families: Vec<MetricFamily> = self
            .descs
            .iter()
            .map(|desc| gauge_family(&desc.fq_name, &desc.help))
            .collect();

        for definition in self.registry.definitions() {
            // Unreadable snapshots are left out and reported through the success gauge
            let Some(snapshot) = snapshots.get(&definition.identifier) else {
                continue;
            };

            let labels: Vec<(&str, &str)> = definition
                .label_names
                .iter()
                .map(String::as_str)
                .zip(definition.label_values.iter().map(String::as_str))
                .collect();

            if let Some(family) = families
                .iter_mut()
                .find(|family| family.get_name() == definition.exposed_name)
            {
                family.mut_metric().push(gauge_metric(&labels, snapshot.value));
            }
        }

        let duration = begin.elapsed().as_secs_f64();
        let unpolled = snapshots.values().filter(|s| !s.is_populated()).count();
        let stale = snapshots.values().filter(|s| s.last_error.is_some()).count();
        debug!(
            "Read {} snapshot(s) in {:.6}s, {} not yet polled, {} stale (success: {})",
            snapshots.len(),
            duration,
            unpolled,
            stale,
            success
        );

        families.retain(|family| !family.get_metric().is_empty());

        let health = [(HEALTH_LABEL, COLLECTOR_NAME)];
        for (desc, value) in [
            (&self.duration_desc, duration),
            (&self.success_desc, if success { 1.0 } else { 0.0 }),
        ] {
            let mut family = gauge_family(&desc.fq_name, &desc.help);
            family.mut_metric().push(gauge_metric(&health, value));
            families.push(family);
        }

        families
    }
}

fn gauge_family(name: &str, help: &str) -> MetricFamily {
    let mut family = MetricFamily::default();
    family.set_name(name.to_string());
    family.set_help(help.to_string());
    family.set_field_type(MetricType::GAUGE);
    family
}

fn gauge_metric(labels: &[(&str, &str)], value: f64) -> Metric {
    let mut metric = Metric::default();
    for (name, label_value) in labels {
        let mut pair = LabelPair::default();
        pair.set_name(name.to_string());
        pair.set_value(label_value.to_string());
        metric.mut_label().push(pair);
    }

    let mut gauge = Gauge::default();
    gauge.set_value(value);
    metric.set_gauge(gauge);
    metric
}
