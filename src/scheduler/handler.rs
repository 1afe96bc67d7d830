//! Job handlers.
//!
//! A job names its handler by string. Every process that executes jobs
//! registers the handlers it knows in a [`HandlerRegistry`]; producers only
//! need the name.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::info;

use crate::error::JobError;

/// Executes jobs of one kind.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Performs the job with its positional arguments.
    async fn perform(&self, args: &[Value]) -> anyhow::Result<()>;
}

/// Adapter turning an async closure into a [`Handler`].
pub struct FnHandler<F> {
    f: F,
}

/// Wraps an async closure taking the job arguments.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn perform(&self, args: &[Value]) -> anyhow::Result<()> {
        (self.f)(args.to_vec()).await
    }
}

/// Reads argument `index` as `T`.
pub fn arg<T: DeserializeOwned>(args: &[Value], index: usize) -> Result<T, JobError> {
    let value = args
        .get(index)
        .ok_or_else(|| JobError::Access(format!("argument {} is missing", index)))?;
    serde_json::from_value(value.clone())
        .map_err(|e| JobError::Access(format!("argument {}: {}", index, e)))
}

/// Name to handler mapping.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<BTreeMap<String, Arc<dyn Handler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the handler for `name`.
    pub fn register<H>(&self, name: impl Into<String>, handler: H)
    where
        H: Handler + 'static,
    {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.into(), Arc::new(handler));
    }

    /// Resolves a handler by name.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Handler>, JobError> {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
            .ok_or_else(|| JobError::HandlerNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(name)
    }

    /// Registered handler names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }
}

/// Logs its arguments.
#[derive(Debug, Default)]
pub struct EchoHandler;

#[async_trait]
impl Handler for EchoHandler {
    async fn perform(&self, args: &[Value]) -> anyhow::Result<()> {
        let shown = Value::Array(args.to_vec());
        info!(args = %shown, "echo");
        Ok(())
    }
}

/// Sleeps for `args[0]` seconds (fractional allowed).
#[derive(Debug, Default)]
pub struct SleepHandler;

#[async_trait]
impl Handler for SleepHandler {
    async fn perform(&self, args: &[Value]) -> anyhow::Result<()> {
        let secs: f64 = arg(args, 0)?;
        let duration = Duration::try_from_secs_f64(secs)?;
        tokio::time::sleep(duration).await;
        Ok(())
    }
}

/// Registers the handlers shipped with the binary.
pub fn register_builtin(registry: &HandlerRegistry) {
    registry.register("echo", EchoHandler);
    registry.register("sleep", SleepHandler);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_registry_resolves_handlers() {
        let registry = HandlerRegistry::new();
        register_builtin(&registry);

        assert!(registry.contains("echo"));
        assert_eq!(registry.names(), vec!["echo", "sleep"]);
        registry
            .get("echo")
            .unwrap()
            .perform(&[json!("hi")])
            .await
            .unwrap();
        assert!(matches!(
            registry.get("missing"),
            Err(JobError::HandlerNotFound(name)) if name == "missing"
        ));
    }

    #[tokio::test]
    async fn test_echo_accepts_any_arguments() {
        EchoHandler.perform(&[]).await.unwrap();
        EchoHandler
            .perform(&[json!("a"), json!({"n": 1}), json!(null)])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_handler_fn() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let registry = HandlerRegistry::new();
        registry.register(
            "count",
            handler_fn(move |args| {
                let counter = Arc::clone(&counter);
                async move {
                    let step: usize = arg(&args, 0)?;
                    counter.fetch_add(step, Ordering::SeqCst);
                    Ok::<(), anyhow::Error>(())
                }
            }),
        );

        let handler = registry.get("count").unwrap();
        handler.perform(&[json!(2)]).await.unwrap();
        handler.perform(&[json!(3)]).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert!(handler.perform(&[]).await.is_err());
    }

    #[test]
    fn test_arg_access() {
        let args = vec![json!("mail"), json!(3)];
        let name: String = arg(&args, 0).unwrap();
        assert_eq!(name, "mail");
        assert!(matches!(arg::<u32>(&args, 0), Err(JobError::Access(_))));
        assert!(matches!(arg::<u32>(&args, 5), Err(JobError::Access(_))));
    }

    #[tokio::test]
    async fn test_sleep_handler_rejects_bad_duration() {
        assert!(SleepHandler.perform(&[json!(-1.0)]).await.is_err());
        assert!(SleepHandler.perform(&[json!(0.01)]).await.is_ok());
    }
}
