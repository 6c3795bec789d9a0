//! skein-eval: datasets and the evaluation harness
//!
//! Runs a model op over every row of a dataset and scores each output with
//! scorer ops. Every model and scorer invocation is a recorded call nested
//! under one evaluation root call, so an evaluation shows up as a single
//! tree in the call log.
//!
//! # Usage
//!
//! ```ignore
//! use skein_eval::{Dataset, Evaluation, model, scorer};
//!
//! let dataset = Dataset::from_jsonl(Path::new("questions.jsonl"))?;
//! let answer = model("answer", |row| async move { Ok(row["question"].clone()) });
//! let exact = scorer("exact", |output, row| async move {
//!     Ok(serde_json::json!(output == row["expected"]))
//! });
//!
//! let results = client
//!     .scope(Evaluation::new(dataset, vec![exact]).evaluate(&answer))
//!     .await;
//! println!("{}", results.summary);
//! ```

pub mod dataset;
pub mod error;
pub mod evaluation;
pub mod summary;

pub use dataset::Dataset;
pub use error::{EvalError, Result};
pub use evaluation::{
    EVALUATE_OP, Evaluation, EvaluationResults, ModelOp, RowResult, ScoreResult, ScorerOp, model,
    scorer,
};
pub use summary::{SummaryBuilder, auto_summarize};
