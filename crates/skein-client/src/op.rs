//! Op wrapper.
//!
//! An [`Op`] wraps one async callable so that every invocation is recorded
//! as a [`Call`]: the call is created `pending` under the current call of the
//! invoking scope, the callable runs in a child scope whose current call is
//! the new call, and the outcome settles the call as `finished` or `error`.
//! The callable's result is handed back unchanged.
//!
//! Ops are built at construction time and passed around by value; a
//! component that wants instrumented methods exposes `Op` fields whose
//! closures capture the component's state.

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, LazyLock, Mutex};

use futures::future::{BoxFuture, FutureExt, join_all};
use serde::Serialize;
use serde_json::{Value, json};
use skein_trace::{Attributes, Call, CallStatus, Exception, Scope};

use crate::client::Client;

type OpFn<I, O, E> = dyn Fn(I) -> BoxFuture<'static, Result<O, E>> + Send + Sync;

/// Maps a serialized output to summary entries for its call.
pub type SummarizeFn = dyn Fn(&Value) -> Attributes + Send + Sync;

/// Callable types declared per base name, in registration order.
static OP_NAMES: LazyLock<Mutex<HashMap<String, Vec<TypeId>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Op id for `name` declared by the callable type `declaration`.
///
/// Building the same declaration again (one op per component instance)
/// yields the same id; a distinct callable reusing the name gets the next
/// `name:N` suffix.
fn register_op_id(name: &str, declaration: TypeId) -> String {
    let mut names = OP_NAMES.lock().unwrap_or_else(|e| e.into_inner());
    let declared = names.entry(name.to_string()).or_default();
    let index = match declared.iter().position(|d| *d == declaration) {
        Some(index) => index,
        None => {
            declared.push(declaration);
            declared.len() - 1
        }
    };
    if index == 0 {
        name.to_string()
    } else {
        format!("{}:{}", name, index)
    }
}

/// Op name derived from the callable's type, e.g. `predict` for a closure
/// defined inside `fn predict`.
fn default_name<F>() -> String {
    let full = std::any::type_name::<F>();
    let mut path = full.split('<').next().unwrap_or(full);
    while let Some(stripped) = path.strip_suffix("::{{closure}}") {
        path = stripped;
    }
    path.rsplit("::").next().unwrap_or(path).to_string()
}

// ─────────────────────────────────────────────────────────────────────────────
// Parameter policy
// ─────────────────────────────────────────────────────────────────────────────

/// How a call's serialized input is turned into named `inputs`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamPolicy {
    /// Positional parameter names. A tuple input is zipped against them;
    /// positions without a name fall back to `arg0`, `arg1`, ...
    Named(Vec<String>),
    /// The input is one object whose fields are the inputs.
    SingleObject,
}

impl Default for ParamPolicy {
    fn default() -> Self {
        ParamPolicy::Named(Vec::new())
    }
}

fn positional(index: usize) -> String {
    format!("arg{}", index)
}

impl ParamPolicy {
    pub fn named<S: Into<String>>(names: impl IntoIterator<Item = S>) -> Self {
        ParamPolicy::Named(names.into_iter().map(Into::into).collect())
    }

    /// Resolve a serialized input into named inputs.
    pub fn resolve(&self, input: Value) -> Attributes {
        match self {
            ParamPolicy::SingleObject => match input {
                Value::Object(map) => map,
                Value::Array(mut items) if items.len() == 1 && items[0].is_object() => {
                    match items.remove(0) {
                        Value::Object(map) => map,
                        other => Self::by_position(&[], Value::Array(vec![other])),
                    }
                }
                other => Self::by_position(&[], other),
            },
            ParamPolicy::Named(names) => Self::by_position(names, input),
        }
    }

    fn by_position(names: &[String], input: Value) -> Attributes {
        let mut inputs = Attributes::new();
        match (names.len(), input) {
            (_, Value::Null) if names.is_empty() => {}
            (1, value) => {
                inputs.insert(names[0].clone(), value);
            }
            (_, Value::Array(items)) => {
                for (i, item) in items.into_iter().enumerate() {
                    let key = names.get(i).cloned().unwrap_or_else(|| positional(i));
                    inputs.insert(key, item);
                }
            }
            (0, value) => {
                inputs.insert(positional(0), value);
            }
            (_, value) => {
                inputs.insert(names[0].clone(), value);
            }
        }
        inputs
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Options
// ─────────────────────────────────────────────────────────────────────────────

/// Options for wrapping a callable.
#[derive(Clone, Default)]
pub struct OpOptions {
    name: Option<String>,
    description: Option<String>,
    params: ParamPolicy,
    summarize: Option<Arc<SummarizeFn>>,
    client: Option<Client>,
}

impl OpOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn params(mut self, params: ParamPolicy) -> Self {
        self.params = params;
        self
    }

    /// Declare positional parameter names.
    pub fn parameter_names<S: Into<String>>(self, names: impl IntoIterator<Item = S>) -> Self {
        self.params(ParamPolicy::named(names))
    }

    /// Treat the input as a single object whose fields are the inputs.
    pub fn single_object(self) -> Self {
        self.params(ParamPolicy::SingleObject)
    }

    /// Derive summary entries from the serialized output.
    pub fn summarize(mut self, f: impl Fn(&Value) -> Attributes + Send + Sync + 'static) -> Self {
        self.summarize = Some(Arc::new(f));
        self
    }

    /// Deliver this op's calls through `client` instead of the scope's sink.
    pub fn client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    /// Wrap an async callable.
    pub fn build<I, O, E, F, Fut>(self, f: F) -> Op<I, O, E>
    where
        I: 'static,
        O: 'static,
        E: 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, E>> + Send + 'static,
    {
        f.into_op(self)
    }

    /// Wrap a synchronous callable.
    pub fn build_sync<I, O, E, F>(self, f: F) -> Op<I, O, E>
    where
        F: Fn(I) -> Result<O, E> + Send + Sync + 'static,
        I: 'static,
        O: Send + 'static,
        E: Send + 'static,
    {
        let options = self.with_default_name::<F>();
        Op::from_boxed(
            options,
            TypeId::of::<F>(),
            Box::new(move |input| futures::future::ready(f(input)).boxed()),
        )
    }

    fn with_default_name<F>(mut self) -> Self {
        if self.name.is_none() {
            self.name = Some(default_name::<F>());
        }
        self
    }
}

impl fmt::Debug for OpOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpOptions")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("params", &self.params)
            .field("summarize", &self.summarize.is_some())
            .field("client", &self.client)
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Op
// ─────────────────────────────────────────────────────────────────────────────

/// An instrumented callable.
///
/// Clones share identity: they are the same op.
pub struct Op<I, O, E> {
    inner: Arc<OpInner<I, O, E>>,
}

struct OpInner<I, O, E> {
    id: String,
    description: Option<String>,
    params: ParamPolicy,
    summarize: Option<Arc<SummarizeFn>>,
    client: Option<Client>,
    func: Box<OpFn<I, O, E>>,
}

impl<I, O, E> Clone for Op<I, O, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<I, O, E> fmt::Debug for Op<I, O, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Op")
            .field("id", &self.inner.id)
            .field("params", &self.inner.params)
            .finish()
    }
}

impl Op<(), (), ()> {
    /// Start building an op named `name`.
    pub fn builder(name: impl Into<String>) -> OpOptions {
        OpOptions::new().name(name)
    }
}

impl<I, O, E> Op<I, O, E> {
    fn from_boxed(options: OpOptions, declaration: TypeId, func: Box<OpFn<I, O, E>>) -> Self {
        let name = options.name.unwrap_or_else(|| "op".to_string());
        Self {
            inner: Arc::new(OpInner {
                id: register_op_id(&name, declaration),
                description: options.description,
                params: options.params,
                summarize: options.summarize,
                client: options.client,
                func,
            }),
        }
    }

    /// Stable identity, used as the `op_name` of every call.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn description(&self) -> Option<&str> {
        self.inner.description.as_deref()
    }

    pub fn params(&self) -> &ParamPolicy {
        &self.inner.params
    }

    /// Whether both values are the same op.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<I, O, E> Op<I, O, E>
where
    I: Serialize + Send + 'static,
    O: Serialize + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    /// Invoke the op, recording one call.
    pub async fn call(&self, input: I) -> Result<O, E> {
        self.call_with_call(input).await.0
    }

    /// Invoke the op and also return the recorded call.
    pub async fn call_with_call(&self, input: I) -> (Result<O, E>, Call) {
        let scope = Scope::current();
        let inputs = self.inner.params.resolve(self.serialize_input(&input));
        let sink = match &self.inner.client {
            Some(client) => Some(client.sink()),
            None => scope.sink().cloned(),
        };

        let call = Call::builder(self.inner.id.clone())
            .parent(scope.call().cloned())
            .attributes(scope.attributes().clone())
            .inputs(inputs)
            .sink(sink.clone())
            .start();

        let mut child = scope.with_call(call.clone());
        if let Some(sink) = sink {
            child = child.with_sink(sink);
        }

        // The callable is invoked inside the child scope so that code it runs
        // before its first await already sees the new call.
        let guard = CancelGuard::new(call.clone());
        let func = &self.inner.func;
        let result = child.run(async move { func(input).await }).await;

        guard.disarm();
        self.settle(&call, &result);
        (result, call)
    }

    fn serialize_input(&self, input: &I) -> Value {
        serde_json::to_value(input).unwrap_or_else(|e| {
            tracing::warn!(op = %self.inner.id, error = %e, "Failed to serialize op input");
            Value::String(format!("<unserializable: {}>", e))
        })
    }

    fn settle(&self, call: &Call, result: &Result<O, E>) {
        let settled = match result {
            Ok(output) => {
                let value = serde_json::to_value(output).unwrap_or_else(|e| {
                    tracing::warn!(call_id = %call.id(), error = %e, "Failed to serialize op output");
                    Value::String(format!("<unserializable: {}>", e))
                });
                if let Some(summarize) = &self.inner.summarize {
                    let entries = summarize(&value);
                    if let Err(e) = call.merge_summary(entries) {
                        tracing::warn!(call_id = %call.id(), error = %e, "Summary not recorded");
                    }
                }
                call.finish(value)
            }
            Err(e) => call.fail(Exception::from_error(e)),
        };

        if let Err(e) = settled {
            tracing::warn!(call_id = %call.id(), error = %e, "Call was already finalized");
        }
    }

    /// Run `n` independent invocations concurrently and collect every
    /// outcome. A failing trial does not stop the others.
    pub async fn trials(&self, n: usize, input: I) -> Trials<O, E>
    where
        I: Clone,
    {
        let runs = (0..n).map(|_| self.call_with_call(input.clone()));
        let trials: Vec<Trial<O, E>> = join_all(runs)
            .await
            .into_iter()
            .map(|(result, call)| Trial { result, call })
            .collect();
        let trials = Trials { trials };

        if let Some(parent) = skein_trace::current_call() {
            let key = format!("trials:{}", self.inner.id);
            let entry = json!({
                "count": trials.len(),
                "success_count": trials.successes().len(),
                "error_count": trials.failures().len(),
            });
            if let Err(e) = parent.add_summary(key, entry) {
                tracing::debug!(call_id = %parent.id(), error = %e, "Trial summary not recorded");
            }
        }

        trials
    }
}

/// Fails a call whose invocation future is dropped before it settles, so a
/// timed-out or aborted invocation is not left pending.
struct CancelGuard {
    call: Option<Call>,
}

impl CancelGuard {
    fn new(call: Call) -> Self {
        Self { call: Some(call) }
    }

    fn disarm(mut self) {
        self.call = None;
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        let Some(call) = self.call.take() else {
            return;
        };
        if call.status() != CallStatus::Pending {
            return;
        }
        tracing::debug!(call_id = %call.id(), "Op invocation dropped before completion");
        let exception = Exception::new("Cancelled", "invocation dropped before completion");
        if let Err(e) = call.fail(exception) {
            tracing::warn!(call_id = %call.id(), error = %e, "Call was already finalized");
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Trials
// ─────────────────────────────────────────────────────────────────────────────

/// One trial: its outcome and the call that recorded it.
#[derive(Debug)]
pub struct Trial<O, E> {
    pub result: Result<O, E>,
    pub call: Call,
}

/// Outcomes of [`Op::trials`], in issue order.
#[derive(Debug)]
pub struct Trials<O, E> {
    trials: Vec<Trial<O, E>>,
}

impl<O, E> Trials<O, E> {
    pub fn len(&self) -> usize {
        self.trials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trials.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Trial<O, E>> {
        self.trials.iter()
    }

    pub fn successes(&self) -> Vec<&O> {
        self.trials
            .iter()
            .filter_map(|t| t.result.as_ref().ok())
            .collect()
    }

    pub fn failures(&self) -> Vec<&E> {
        self.trials
            .iter()
            .filter_map(|t| t.result.as_ref().err())
            .collect()
    }

    /// Fraction of trials that succeeded; zero when there were none.
    pub fn success_rate(&self) -> f64 {
        if self.trials.is_empty() {
            return 0.0;
        }
        self.successes().len() as f64 / self.trials.len() as f64
    }

    pub fn calls(&self) -> Vec<&Call> {
        self.trials.iter().map(|t| &t.call).collect()
    }

    pub fn into_results(self) -> Vec<Result<O, E>> {
        self.trials.into_iter().map(|t| t.result).collect()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Wrapping
// ─────────────────────────────────────────────────────────────────────────────

/// Something that can become an [`Op`].
///
/// Implemented for async callables and for `Op` itself, so wrapping an op
/// again returns it unchanged.
pub trait IntoOp<I, O, E> {
    fn into_op(self, options: OpOptions) -> Op<I, O, E>;
}

impl<I, O, E> IntoOp<I, O, E> for Op<I, O, E> {
    fn into_op(self, _options: OpOptions) -> Op<I, O, E> {
        self
    }
}

impl<I, O, E, F, Fut> IntoOp<I, O, E> for F
where
    I: 'static,
    O: 'static,
    E: 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O, E>> + Send + 'static,
{
    fn into_op(self, options: OpOptions) -> Op<I, O, E> {
        let options = options.with_default_name::<F>();
        let f = self;
        Op::from_boxed(options, TypeId::of::<F>(), Box::new(move |input| f(input).boxed()))
    }
}

/// Wrap a callable with default options.
pub fn op<I, O, E>(f: impl IntoOp<I, O, E>) -> Op<I, O, E> {
    f.into_op(OpOptions::default())
}

/// Wrap a callable with `options`. An existing op is returned unchanged.
pub fn op_with<I, O, E>(f: impl IntoOp<I, O, E>, options: OpOptions) -> Op<I, O, E> {
    f.into_op(options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::CollectingSink;
    use skein_trace::{CallStatus, current_call, run_in_scope, with_attributes};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[derive(Debug, thiserror::Error)]
    #[error("model exploded: {0}")]
    struct ModelError(String);

    fn attrs(pairs: &[(&str, Value)]) -> Attributes {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_resolve_named_tuple() {
        let policy = ParamPolicy::named(["question", "context"]);
        let inputs = policy.resolve(json!(["why?", "because", 3]));
        assert_eq!(inputs["question"], json!("why?"));
        assert_eq!(inputs["context"], json!("because"));
        assert_eq!(inputs["arg2"], json!(3));
    }

    #[test]
    fn test_resolve_single_name_takes_whole_value() {
        let policy = ParamPolicy::named(["pair"]);
        let inputs = policy.resolve(json!([1, 2]));
        assert_eq!(inputs["pair"], json!([1, 2]));
    }

    #[test]
    fn test_resolve_without_names() {
        let policy = ParamPolicy::default();
        assert_eq!(policy.resolve(json!("x"))["arg0"], json!("x"));
        assert_eq!(policy.resolve(json!([1, 2]))["arg1"], json!(2));
        assert!(policy.resolve(Value::Null).is_empty());
    }

    #[test]
    fn test_resolve_single_object() {
        let policy = ParamPolicy::SingleObject;
        let inputs = policy.resolve(json!({"prompt": "hi", "temperature": 0.1}));
        assert_eq!(inputs["prompt"], json!("hi"));

        let wrapped = policy.resolve(json!([{"prompt": "hi"}]));
        assert_eq!(wrapped["prompt"], json!("hi"));

        let scalar = policy.resolve(json!(5));
        assert_eq!(scalar["arg0"], json!(5));
    }

    #[test]
    fn test_op_ids_are_disambiguated() {
        let a = Op::builder("test_op_ids_dup").build_sync(|x: i32| Ok::<_, ModelError>(x));
        let b = Op::builder("test_op_ids_dup").build_sync(|x: i32| Ok::<_, ModelError>(x));
        let c = Op::builder("test_op_ids_dup").build_sync(|x: i32| Ok::<_, ModelError>(x));
        assert_eq!(a.id(), "test_op_ids_dup");
        assert_eq!(b.id(), "test_op_ids_dup:1");
        assert_eq!(c.id(), "test_op_ids_dup:2");
    }

    #[test]
    fn test_same_declaration_keeps_its_id() {
        struct Greeter {
            greet: Op<String, String, ModelError>,
        }

        impl Greeter {
            fn new(greeting: &str) -> Self {
                let greeting = greeting.to_string();
                Self {
                    greet: Op::builder("test_greeter_greet").build_sync(move |name: String| {
                        Ok::<_, ModelError>(format!("{} {}", greeting, name))
                    }),
                }
            }
        }

        let hello = Greeter::new("hello");
        let hi = Greeter::new("hi");
        let other = Op::builder("test_greeter_greet").build_sync(|name: String| Ok::<_, ModelError>(name));

        assert_eq!(hello.greet.id(), "test_greeter_greet");
        assert_eq!(hi.greet.id(), "test_greeter_greet");
        assert!(!hello.greet.ptr_eq(&hi.greet));
        assert_eq!(other.id(), "test_greeter_greet:1");
    }

    #[tokio::test]
    async fn test_dropped_invocation_fails_call() {
        let slow = Op::builder("slow").build(|_: ()| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, ModelError>(())
        });

        let sink = CollectingSink::new();
        let scope = Scope::root().with_sink(sink.clone());
        let timed_out = scope
            .run(tokio::time::timeout(Duration::from_millis(20), slow.call(())))
            .await;
        assert!(timed_out.is_err());

        let records = skein_trace::records_from_ops(&sink.ops());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, CallStatus::Error);
        assert!(records[0].ended_at.is_some());
        let exception = records[0].exception.as_ref().unwrap();
        assert_eq!(exception.kind, "Cancelled");
    }

    #[tokio::test]
    async fn test_completed_invocation_is_not_cancelled() {
        let quick = op(|x: i64| async move { Ok::<_, ModelError>(x) });
        let (result, call) = quick.call_with_call(3).await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(call.status(), CallStatus::Finished);
    }

    #[test]
    fn test_default_name_from_enclosing_fn() {
        fn make_double() -> Op<i64, i64, ModelError> {
            op(|x: i64| async move { Ok(x * 2) })
        }
        assert!(make_double().id().starts_with("make_double"));
    }

    #[test]
    fn test_rewrap_is_idempotent() {
        let inner = op(|x: i64| async move { Ok::<_, ModelError>(x + 1) });
        let outer = op(inner.clone());
        let with_options = op_with(outer.clone(), OpOptions::new().name("ignored"));
        assert!(inner.ptr_eq(&outer));
        assert!(inner.ptr_eq(&with_options));
    }

    #[tokio::test]
    async fn test_success_records_output_and_inputs() {
        let add = Op::builder("add")
            .parameter_names(["a", "b"])
            .build(|(a, b): (i64, i64)| async move { Ok::<_, ModelError>(a + b) });

        let (result, call) = add.call_with_call((2, 3)).await;
        assert_eq!(result.unwrap(), 5);

        let record = call.snapshot();
        assert_eq!(record.status, CallStatus::Finished);
        assert_eq!(record.inputs["a"], json!(2));
        assert_eq!(record.inputs["b"], json!(3));
        assert_eq!(record.output, Some(json!(5)));
        assert!(record.parent_id.is_none());
    }

    #[tokio::test]
    async fn test_failure_is_returned_unchanged() {
        let predict = Op::builder("predict")
            .build(|prompt: String| async move { Err::<String, _>(ModelError(prompt)) });

        let (result, call) = predict.call_with_call("boom".to_string()).await;
        let err = result.unwrap_err();
        assert_eq!(err.0, "boom");

        let record = call.snapshot();
        assert_eq!(record.status, CallStatus::Error);
        assert!(record.output.is_none());
        let exception = record.exception.unwrap();
        assert_eq!(exception.message, "model exploded: boom");
        assert!(exception.kind.ends_with("ModelError"));
    }

    #[tokio::test]
    async fn test_nested_ops_link_parent() {
        let child = Op::builder("child").build(|x: i64| async move {
            let current = current_call().map(|c| c.op_name().to_string());
            Ok::<_, ModelError>((x, current))
        });
        let parent = {
            let child = child.clone();
            Op::builder("parent").build(move |x: i64| {
                let child = child.clone();
                async move {
                    let (_, call) = child.call_with_call(x).await;
                    Ok::<_, ModelError>(call.snapshot())
                }
            })
        };

        let (result, parent_call) = parent.call_with_call(1).await;
        let child_record = result.unwrap();
        let parent_record = parent_call.snapshot();

        assert_eq!(child_record.parent_id.as_ref(), Some(parent_call.id()));
        assert_eq!(child_record.trace_id, parent_record.trace_id);
        assert_eq!(child_record.output, Some(json!([1, child.id()])));
        assert!(parent_record.ended_at.unwrap() >= child_record.ended_at.unwrap());
    }

    #[tokio::test]
    async fn test_attributes_are_frozen_snapshot() {
        let probe = op(|_: ()| async move { Ok::<_, ModelError>(()) });

        let (_, inside) = with_attributes(attrs(&[("env", json!("prod"))]), probe.call_with_call(()))
            .await;
        let (_, outside) = probe.call_with_call(()).await;

        assert_eq!(inside.snapshot().attributes["env"], json!("prod"));
        assert!(outside.snapshot().attributes.is_empty());
    }

    #[tokio::test]
    async fn test_summarize_hook() {
        let count = Op::builder("count_words")
            .summarize(|output| attrs(&[("words", output.clone())]))
            .build_sync(|text: String| Ok::<_, ModelError>(text.split_whitespace().count()));

        let (_, call) = count.call_with_call("a b c".to_string()).await;
        assert_eq!(call.snapshot().summary["words"], json!(3));
    }

    #[tokio::test]
    async fn test_trials_collect_successes_and_failures() {
        let attempts = Arc::new(AtomicU32::new(0));
        let flaky = {
            let attempts = Arc::clone(&attempts);
            Op::builder("flaky").build(move |base: u32| {
                let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n == 2 {
                        Err(ModelError("second trial".to_string()))
                    } else {
                        Ok(base + n)
                    }
                }
            })
        };

        let parent = Call::builder("runner").start();
        let trials = run_in_scope(Some(parent.clone()), None, flaky.trials(3, 10)).await;

        assert_eq!(trials.len(), 3);
        assert_eq!(trials.successes().len(), 2);
        assert_eq!(trials.failures().len(), 1);
        assert!((trials.success_rate() - 2.0 / 3.0).abs() < 1e-9);
        for call in trials.calls() {
            assert_eq!(call.parent_id(), Some(parent.id()));
        }
        let errors = trials
            .calls()
            .iter()
            .filter(|c| c.status() == CallStatus::Error)
            .count();
        assert_eq!(errors, 1);

        let key = format!("trials:{}", flaky.id());
        assert_eq!(parent.snapshot().summary[&key]["error_count"], json!(1));
    }

    /// A component exposing pre-wrapped methods that capture its state.
    struct Greeter {
        greet: Op<String, String, ModelError>,
    }

    impl Greeter {
        fn new(greeting: &str) -> Self {
            let greeting = Arc::new(greeting.to_string());
            Self {
                greet: Op::builder("Greeter.greet").build(move |name: String| {
                    let greeting = Arc::clone(&greeting);
                    async move { Ok(format!("{}, {}!", greeting, name)) }
                }),
            }
        }
    }

    #[tokio::test]
    async fn test_bound_component_ops_keep_state() {
        let hello = Greeter::new("Hello");
        let hi = Greeter::new("Hi");

        assert_eq!(hello.greet.call("Ada".into()).await.unwrap(), "Hello, Ada!");
        assert_eq!(hi.greet.call("Ada".into()).await.unwrap(), "Hi, Ada!");
        assert_ne!(hello.greet.id(), hi.greet.id());
    }
}
