//! Evaluation harness.
//!
//! Runs a model op over every dataset row, then every scorer op over the
//! model's output. All invocations are recorded as children of one
//! evaluation root call whose output is the summary.

use std::collections::HashMap;
use std::future::Future;
use std::time::Instant;

use futures::future::join_all;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::{Value, json};
use skein_client::Op;
use skein_trace::{Attributes, Call, CallId, Scope};

use crate::dataset::Dataset;
use crate::summary::SummaryBuilder;

/// Op name of the evaluation root call.
pub const EVALUATE_OP: &str = "Evaluation.evaluate";

const DEFAULT_MAX_CONCURRENCY: usize = 8;

/// A model: one dataset row (after column mapping) in, one output out.
pub type ModelOp = Op<Attributes, Value, anyhow::Error>;

/// A scorer: `(model_output, row)` in, a score out.
pub type ScorerOp = Op<(Value, Attributes), Value, anyhow::Error>;

/// Wrap a model callable. The row's columns become the call's inputs.
pub fn model<F, Fut>(name: impl Into<String>, f: F) -> ModelOp
where
    F: Fn(Attributes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Op::builder(name).single_object().build(f)
}

/// Wrap a scorer callable. Inputs are recorded as `output` and `row`.
pub fn scorer<F, Fut>(name: impl Into<String>, f: F) -> ScorerOp
where
    F: Fn(Value, Attributes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Op::builder(name)
        .parameter_names(["output", "row"])
        .build(move |(output, row): (Value, Attributes)| f(output, row))
}

/// One scorer's outcome for one row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreResult {
    pub scorer: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of one dataset row.
#[derive(Debug, Clone, Serialize)]
pub struct RowResult {
    pub index: usize,
    pub row: Attributes,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Model wall time in seconds.
    pub model_latency: f64,
    pub scores: Vec<ScoreResult>,
}

impl RowResult {
    pub fn score(&self, scorer: &str) -> Option<&ScoreResult> {
        self.scores.iter().find(|s| s.scorer == scorer)
    }
}

/// Per-row results in dataset order, plus the aggregate summary.
#[derive(Debug, Clone, Serialize)]
pub struct EvaluationResults {
    /// Id of the evaluation root call.
    pub call_id: CallId,
    pub rows: Vec<RowResult>,
    pub summary: Value,
}

/// A dataset and the scorers to judge a model by.
#[derive(Debug, Clone)]
pub struct Evaluation {
    dataset: Dataset,
    scorers: Vec<ScorerOp>,
    column_mapping: HashMap<String, String>,
    max_concurrency: usize,
}

impl Evaluation {
    pub fn new(dataset: Dataset, scorers: impl IntoIterator<Item = ScorerOp>) -> Self {
        Self {
            dataset,
            scorers: scorers.into_iter().collect(),
            column_mapping: HashMap::new(),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
        }
    }

    /// Rename dataset columns (keys) to model parameter names (values)
    /// before the model sees a row. Scorers always see the original row.
    pub fn with_column_mapping<K, V>(mut self, mapping: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.column_mapping = mapping
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self
    }

    /// Maximum number of rows in flight at once. Zero is treated as one.
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    pub fn scorers(&self) -> &[ScorerOp] {
        &self.scorers
    }

    fn map_row(&self, row: &Attributes) -> Attributes {
        row.iter()
            .map(|(column, value)| {
                let name = self.column_mapping.get(column).unwrap_or(column);
                (name.clone(), value.clone())
            })
            .collect()
    }

    /// Run `model` over every row and score the outputs.
    ///
    /// Model and scorer failures never abort the evaluation; they are
    /// recorded in the row results and counted in the summary.
    pub async fn evaluate(&self, model: &ModelOp) -> EvaluationResults {
        let scope = Scope::current();

        let mut attributes = scope.attributes().clone();
        attributes.insert("dataset_id".to_string(), json!(self.dataset.id));
        attributes.insert("row_count".to_string(), json!(self.dataset.len()));

        let mut inputs = Attributes::new();
        inputs.insert("model".to_string(), json!(model.id()));
        inputs.insert("dataset".to_string(), json!(self.dataset.id));
        inputs.insert(
            "scorers".to_string(),
            json!(self.scorers.iter().map(|s| s.id()).collect::<Vec<_>>()),
        );

        // Row count and dataset id belong to the root only, so children
        // inherit the caller's attributes rather than these.
        let root = Call::builder(EVALUATE_OP)
            .parent(scope.call().cloned())
            .attributes(attributes)
            .inputs(inputs)
            .sink(scope.sink().cloned())
            .start();

        tracing::info!(
            call_id = %root.id(),
            dataset = %self.dataset.id,
            rows = self.dataset.len(),
            scorers = self.scorers.len(),
            max_concurrency = self.max_concurrency,
            "Evaluation started"
        );
        let started = Instant::now();

        let rows: Vec<RowResult> = scope
            .with_call(root.clone())
            .run(
                stream::iter(self.dataset.rows.iter().enumerate())
                    .map(|(index, row)| self.evaluate_row(model, index, row))
                    .buffered(self.max_concurrency)
                    .collect(),
            )
            .await;

        let mut builder = SummaryBuilder::new(self.scorers.iter().map(|s| s.id().to_string()));
        for row in &rows {
            builder.record_model(row.model_latency, row.error.is_none());
            for score in &row.scores {
                match &score.value {
                    Some(value) => builder.record_score(&score.scorer, value.clone()),
                    None => builder.record_score_error(&score.scorer),
                }
            }
        }
        let summary = builder.build();

        if let Err(e) = root.finish(summary.clone()) {
            tracing::warn!(call_id = %root.id(), error = %e, "Evaluation call already finalized");
        }

        tracing::info!(
            call_id = %root.id(),
            dataset = %self.dataset.id,
            duration_ms = started.elapsed().as_millis() as u64,
            "Evaluation finished"
        );

        EvaluationResults {
            call_id: root.id().clone(),
            rows,
            summary,
        }
    }

    async fn evaluate_row(&self, model: &ModelOp, index: usize, row: &Attributes) -> RowResult {
        let started = Instant::now();
        let result = model.call(self.map_row(row)).await;
        let model_latency = started.elapsed().as_secs_f64();

        match result {
            Ok(output) => {
                let scores = join_all(self.scorers.iter().map(|scorer| {
                    let input = (output.clone(), row.clone());
                    async move {
                        match scorer.call(input).await {
                            Ok(value) => ScoreResult {
                                scorer: scorer.id().to_string(),
                                value: Some(value),
                                error: None,
                            },
                            Err(e) => {
                                tracing::debug!(row = index, scorer = %scorer.id(), error = %e, "Scorer failed");
                                ScoreResult {
                                    scorer: scorer.id().to_string(),
                                    value: None,
                                    error: Some(e.to_string()),
                                }
                            }
                        }
                    }
                }))
                .await;

                RowResult {
                    index,
                    row: row.clone(),
                    output: Some(output),
                    error: None,
                    model_latency,
                    scores,
                }
            }
            Err(e) => {
                tracing::warn!(row = index, model = %model.id(), error = %e, "Model failed, skipping scorers");
                let scores = self
                    .scorers
                    .iter()
                    .map(|scorer| ScoreResult {
                        scorer: scorer.id().to_string(),
                        value: None,
                        error: Some("skipped: model failed".to_string()),
                    })
                    .collect();

                RowResult {
                    index,
                    row: row.clone(),
                    output: None,
                    error: Some(e.to_string()),
                    model_latency,
                    scores,
                }
            }
        }
    }
}
