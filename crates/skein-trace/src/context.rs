//! Task-local context carrier.
//!
//! The current call, the active attributes and the delivery sink are a
//! property of the logical execution path, not of a thread. A [`Scope`] is
//! installed with tokio task-local storage for every poll of the future it
//! wraps, so sibling futures interleaved in one task each observe their own
//! scope, and the previous scope is back in place as soon as a poll returns
//! (including when the future completes with an error).
//!
//! Task-locals do not cross `tokio::spawn`. Use [`spawn`] or
//! [`ScopeFutureExt::in_current_scope`] to carry the scope into a new task.

use std::future::Future;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::task::futures::TaskLocalFuture;

use crate::call::{Call, SharedSink};
use crate::types::Attributes;

tokio::task_local! {
    static CURRENT_SCOPE: Scope;
}

/// The ambient context visible to code running inside it.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    call: Option<Call>,
    attributes: Arc<Attributes>,
    sink: Option<SharedSink>,
}

impl Scope {
    /// The empty scope: no call, no attributes, no sink.
    pub fn root() -> Self {
        Self::default()
    }

    /// Capture the scope active on the current execution path.
    pub fn current() -> Self {
        CURRENT_SCOPE.try_with(Clone::clone).unwrap_or_default()
    }

    pub fn call(&self) -> Option<&Call> {
        self.call.as_ref()
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    /// The sink calls created in this scope report to.
    ///
    /// Falls back to the current call's sink so that children of a call
    /// report wherever their parent does.
    pub fn sink(&self) -> Option<&SharedSink> {
        self.sink
            .as_ref()
            .or_else(|| self.call.as_ref().and_then(Call::sink))
    }

    /// Derive a scope whose current call is `call`.
    pub fn with_call(&self, call: Call) -> Self {
        Self {
            call: Some(call),
            ..self.clone()
        }
    }

    /// Derive a scope with `attributes` merged over the inherited ones.
    pub fn with_attributes(&self, attributes: Attributes) -> Self {
        if attributes.is_empty() {
            return self.clone();
        }
        let mut merged = (*self.attributes).clone();
        merged.extend(attributes);
        Self {
            attributes: Arc::new(merged),
            ..self.clone()
        }
    }

    /// Derive a scope that reports new calls to `sink`.
    pub fn with_sink(&self, sink: SharedSink) -> Self {
        Self {
            sink: Some(sink),
            ..self.clone()
        }
    }

    /// Run `fut` with this scope installed.
    pub fn run<F: Future>(self, fut: F) -> TaskLocalFuture<Scope, F> {
        CURRENT_SCOPE.scope(self, fut)
    }

    /// Run a synchronous closure with this scope installed.
    pub fn run_sync<R>(self, f: impl FnOnce() -> R) -> R {
        CURRENT_SCOPE.sync_scope(self, f)
    }
}

/// The nearest enclosing call on this execution path.
pub fn current_call() -> Option<Call> {
    CURRENT_SCOPE.try_with(|s| s.call.clone()).ok().flatten()
}

/// A snapshot of the attributes active on this execution path.
pub fn current_attributes() -> Attributes {
    CURRENT_SCOPE
        .try_with(|s| (*s.attributes).clone())
        .unwrap_or_default()
}

/// Run `fut` with `call` and/or `attributes` layered over the scope active
/// at the point of this call.
pub fn run_in_scope<F: Future>(
    call: Option<Call>,
    attributes: Option<Attributes>,
    fut: F,
) -> TaskLocalFuture<Scope, F> {
    let mut scope = Scope::current();
    if let Some(call) = call {
        scope = scope.with_call(call);
    }
    if let Some(attributes) = attributes {
        scope = scope.with_attributes(attributes);
    }
    scope.run(fut)
}

/// Synchronous counterpart of [`run_in_scope`].
pub fn run_in_scope_sync<R>(
    call: Option<Call>,
    attributes: Option<Attributes>,
    f: impl FnOnce() -> R,
) -> R {
    let mut scope = Scope::current();
    if let Some(call) = call {
        scope = scope.with_call(call);
    }
    if let Some(attributes) = attributes {
        scope = scope.with_attributes(attributes);
    }
    scope.run_sync(f)
}

/// Run `fut` with `attributes` merged over the ambient attributes.
pub fn with_attributes<F: Future>(attributes: Attributes, fut: F) -> TaskLocalFuture<Scope, F> {
    run_in_scope(None, Some(attributes), fut)
}

/// Spawn a task that inherits the scope of the caller.
pub fn spawn<F>(fut: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(Scope::current().run(fut))
}

/// Attach a scope to a future before handing it to another task or executor.
pub trait ScopeFutureExt: Future + Sized {
    fn in_scope(self, scope: Scope) -> TaskLocalFuture<Scope, Self> {
        scope.run(self)
    }

    fn in_current_scope(self) -> TaskLocalFuture<Scope, Self> {
        Scope::current().run(self)
    }
}

impl<F: Future> ScopeFutureExt for F {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn attrs(pairs: &[(&str, serde_json::Value)]) -> Attributes {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_root_scope_is_empty() {
        assert!(current_call().is_none());
        assert!(current_attributes().is_empty());
        assert!(Scope::current().sink().is_none());
    }

    #[tokio::test]
    async fn test_scope_restored_after_exit() {
        let call = Call::builder("outer").start();
        let seen = run_in_scope(Some(call.clone()), None, async {
            current_call().map(|c| c.id().clone())
        })
        .await;

        assert_eq!(seen.as_ref(), Some(call.id()));
        assert!(current_call().is_none());
    }

    #[tokio::test]
    async fn test_scope_restored_after_error() {
        let result: Result<(), &str> = with_attributes(attrs(&[("env", json!("prod"))]), async {
            Err("failed")
        })
        .await;

        assert!(result.is_err());
        assert!(current_attributes().is_empty());
    }

    #[tokio::test]
    async fn test_attributes_merge_child_over_parent() {
        let outer = attrs(&[("env", json!("prod")), ("team", json!("core"))]);
        let inner = attrs(&[("env", json!("staging"))]);

        let (inside, after_inner) = with_attributes(outer, async {
            let inside = with_attributes(inner, async { current_attributes() }).await;
            (inside, current_attributes())
        })
        .await;

        assert_eq!(inside["env"], json!("staging"));
        assert_eq!(inside["team"], json!("core"));
        assert_eq!(after_inner["env"], json!("prod"));
        assert!(current_attributes().is_empty());
    }

    #[tokio::test]
    async fn test_interleaved_siblings_do_not_leak() {
        let a = Call::builder("a").start();
        let b = Call::builder("b").start();

        let branch = |call: Call, delay: u64| {
            run_in_scope(Some(call.clone()), None, async move {
                let mut seen = Vec::new();
                for _ in 0..3 {
                    seen.push(current_call().unwrap().id().clone());
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                seen.into_iter().all(|id| &id == call.id())
            })
        };

        let (ok_a, ok_b) = tokio::join!(branch(a, 3), branch(b, 1));
        assert!(ok_a);
        assert!(ok_b);
    }

    #[tokio::test]
    async fn test_spawn_carries_scope() {
        let call = Call::builder("parent").start();
        let handle = run_in_scope(Some(call.clone()), None, async {
            spawn(async { current_call().map(|c| c.id().clone()) })
        })
        .await;

        assert_eq!(handle.await.unwrap().as_ref(), Some(call.id()));
    }

    #[tokio::test]
    async fn test_plain_tokio_spawn_does_not_inherit() {
        let call = Call::builder("parent").start();
        let handle = run_in_scope(Some(call), None, async {
            tokio::spawn(async { current_call().is_some() })
        })
        .await;

        assert!(!handle.await.unwrap());
    }

    #[test]
    fn test_sync_scope() {
        let call = Call::builder("sync").start();
        let name = run_in_scope_sync(Some(call), None, || {
            current_call().map(|c| c.op_name().to_string())
        });
        assert_eq!(name.as_deref(), Some("sync"));
        assert!(current_call().is_none());
    }
}
