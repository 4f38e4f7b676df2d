//! Component H: reconcile-duration and condition-status gauges with
//! refined label sets, spec.md §4.H.

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use prometheus::{histogram_opts, opts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Registry};
use tokio::time::Instant;

use crate::util::errors::Error;

#[derive(Clone)]
pub struct Metrics {
    pub reconciliations: IntCounter,
    pub failures: IntCounterVec,
    pub reconcile_duration: HistogramVec,
    pub status_condition: IntGaugeVec,
    allowed_labels: HashSet<String>,
    tracked_conditions: std::sync::Arc<Mutex<HashSet<(String, String, String)>>>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new(HashSet::new())
    }
}

impl Metrics {
    pub fn new(allowed_labels: HashSet<String>) -> Self {
        let reconcile_duration = HistogramVec::new(
            histogram_opts!(
                "controller_reconcile_duration_seconds",
                "The duration of reconcile to complete in seconds",
            )
            .buckets(vec![0.01, 0.1, 0.25, 0.5, 1., 5., 15., 60.]),
            &["instance"],
        )
        .unwrap();
        let failures = IntCounterVec::new(
            opts!("controller_reconciliation_errors_total", "reconciliation errors"),
            &["namespace", "name", "error"],
        )
        .unwrap();
        let reconciliations = IntCounter::new("reconciliations_total", "reconciliations").unwrap();
        let status_condition = IntGaugeVec::new(
            opts!("controller_status_condition", "status condition polarity, 1 if set"),
            &["namespace", "name", "condition", "status"],
        )
        .unwrap();
        Metrics {
            reconciliations,
            failures,
            reconcile_duration,
            status_condition,
            allowed_labels,
            tracked_conditions: std::sync::Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn register(self, registry: &Registry) -> Result<Self, prometheus::Error> {
        registry.register(Box::new(self.reconcile_duration.clone()))?;
        registry.register(Box::new(self.failures.clone()))?;
        registry.register(Box::new(self.reconciliations.clone()))?;
        registry.register(Box::new(self.status_condition.clone()))?;
        Ok(self)
    }

    pub fn reconcile_failure(&self, namespace: &str, name: &str, e: &Error) {
        self.failures.with_label_values(&[namespace, name, e.metric_label().as_str()]).inc();
    }

    pub fn count_and_measure(&self, controller: &str) -> ReconcileMeasurer {
        self.reconciliations.inc();
        ReconcileMeasurer {
            start: Instant::now(),
            metric: self.reconcile_duration.clone(),
            instance: controller.to_string(),
        }
    }

    /// Sets `condition`'s polarity for `(namespace, name)`: the observed
    /// status goes to 1, the opposite polarity to 0, so a reader never sees
    /// a stale `True` lingering after a flip to `False` (spec.md §4.H).
    pub fn set_condition(&self, namespace: &str, name: &str, condition_type: &str, is_true: bool) {
        let (true_value, false_value) = if is_true { (1, 0) } else { (0, 1) };
        self.status_condition
            .with_label_values(&[namespace, name, condition_type, "True"])
            .set(true_value);
        self.status_condition
            .with_label_values(&[namespace, name, condition_type, "False"])
            .set(false_value);
        self.tracked_conditions
            .lock()
            .unwrap()
            .insert((namespace.to_string(), name.to_string(), condition_type.to_string()));
    }

    /// Removes every tracked condition series for a deleted resource,
    /// matched by `(namespace, name)` alone since the set of condition
    /// types seen for it may vary over its lifetime.
    pub fn remove_resource(&self, namespace: &str, name: &str) {
        let mut tracked = self.tracked_conditions.lock().unwrap();
        tracked.retain(|(ns, n, condition)| {
            if ns == namespace && n == name {
                let _ = self.status_condition.remove_label_values(&[ns, n, condition, "True"]);
                let _ = self.status_condition.remove_label_values(&[ns, n, condition, "False"]);
                false
            } else {
                true
            }
        });
    }

    /// Sanitizes and filters caller-supplied label keys against the
    /// fixed-at-startup allow-list (spec.md §4.H label refinement).
    pub fn refine_labels(&self, raw: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        raw.iter()
            .map(|(k, v)| (sanitize_label_key(k), v.clone()))
            .filter(|(k, _)| self.allowed_labels.contains(k))
            .collect()
    }
}

fn sanitize_label_key(key: &str) -> String {
    key.chars().map(|c| if c.is_alphanumeric() || c == '_' { c } else { '_' }).collect()
}

/// Relies on `Drop` to calculate duration and register the observation.
pub struct ReconcileMeasurer {
    start: Instant,
    metric: HistogramVec,
    instance: String,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_millis() as f64 / 1000.0;
        self.metric.with_label_values(&[self.instance.as_str()]).observe(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_and_filters_allowed_labels() {
        let mut allowed = HashSet::new();
        allowed.insert("team".to_string());
        let metrics = Metrics::new(allowed);

        let mut raw = BTreeMap::new();
        raw.insert("team".to_string(), "payments".to_string());
        raw.insert("app.kubernetes.io/name".to_string(), "foo".to_string());

        let refined = metrics.refine_labels(&raw);
        assert_eq!(refined.get("team"), Some(&"payments".to_string()));
        assert!(!refined.contains_key("app_kubernetes_io/name"));
    }
}
