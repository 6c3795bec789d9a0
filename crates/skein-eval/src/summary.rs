//! Summary aggregation of scorer outputs.
//!
//! Numbers aggregate to `{"mean"}`, booleans to `{"mean", "true_count"}`
//! and objects recurse per key. Anything else is left out.

use serde_json::{Map, Value, json};

/// Aggregate a column of same-shaped values.
///
/// Returns `None` when the values are empty, of mixed kinds, or of a kind
/// that has no aggregate.
pub fn auto_summarize(values: &[&Value]) -> Option<Value> {
    if values.is_empty() {
        return None;
    }

    if values.iter().all(|v| v.is_boolean()) {
        let true_count = values.iter().filter(|v| v.as_bool() == Some(true)).count();
        return Some(json!({
            "mean": true_count as f64 / values.len() as f64,
            "true_count": true_count,
        }));
    }

    if values.iter().all(|v| v.is_number()) {
        let sum: f64 = values.iter().filter_map(|v| v.as_f64()).sum();
        return Some(json!({ "mean": sum / values.len() as f64 }));
    }

    if values.iter().all(|v| v.is_object()) {
        let mut keys: Vec<&String> = Vec::new();
        for value in values {
            if let Some(map) = value.as_object() {
                for key in map.keys() {
                    if !keys.contains(&key) {
                        keys.push(key);
                    }
                }
            }
        }

        let mut summary = Map::new();
        for key in keys {
            let column: Vec<&Value> = values.iter().filter_map(|v| v.get(key.as_str())).collect();
            if let Some(entry) = auto_summarize(&column) {
                summary.insert(key.clone(), entry);
            }
        }
        return (!summary.is_empty()).then_some(Value::Object(summary));
    }

    None
}

/// Accumulates per-row outcomes into the evaluation summary.
#[derive(Debug, Default)]
pub struct SummaryBuilder {
    scorers: Vec<ScorerColumn>,
    model_latencies: Vec<f64>,
    model_errors: usize,
}

#[derive(Debug)]
struct ScorerColumn {
    name: String,
    values: Vec<Value>,
    errors: usize,
}

impl SummaryBuilder {
    pub fn new<S: Into<String>>(scorer_names: impl IntoIterator<Item = S>) -> Self {
        Self {
            scorers: scorer_names
                .into_iter()
                .map(|name| ScorerColumn {
                    name: name.into(),
                    values: Vec::new(),
                    errors: 0,
                })
                .collect(),
            ..Default::default()
        }
    }

    pub fn record_model(&mut self, latency_secs: f64, succeeded: bool) {
        self.model_latencies.push(latency_secs);
        if !succeeded {
            self.model_errors += 1;
        }
    }

    pub fn record_score(&mut self, scorer: &str, value: Value) {
        if let Some(column) = self.column(scorer) {
            column.values.push(value);
        }
    }

    pub fn record_score_error(&mut self, scorer: &str) {
        if let Some(column) = self.column(scorer) {
            column.errors += 1;
        }
    }

    fn column(&mut self, scorer: &str) -> Option<&mut ScorerColumn> {
        self.scorers.iter_mut().find(|c| c.name == scorer)
    }

    pub fn build(self) -> Value {
        let mut summary = Map::new();

        for column in self.scorers {
            let values: Vec<&Value> = column.values.iter().collect();
            let mut entry = match auto_summarize(&values) {
                Some(Value::Object(map)) => map,
                Some(other) => {
                    let mut map = Map::new();
                    map.insert("value".to_string(), other);
                    map
                }
                None => Map::new(),
            };
            entry.insert("error_count".to_string(), json!(column.errors));
            summary.insert(column.name, Value::Object(entry));
        }

        let latency_mean = if self.model_latencies.is_empty() {
            0.0
        } else {
            self.model_latencies.iter().sum::<f64>() / self.model_latencies.len() as f64
        };
        summary.insert("model_latency".to_string(), json!({ "mean": latency_mean }));
        summary.insert("error_count".to_string(), json!(self.model_errors));

        Value::Object(summary)
    }
}
