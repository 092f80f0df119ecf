//! Provider adapter interface
//!
//! A provider owns one resource type and performs the actual create, update,
//! delete and read calls. The engine never inspects properties itself; the
//! provider decides which property changes force a replacement.
//!
//! # Example
//!
//! ```ignore
//! use orchestrator::{CreateRequest, Properties, ProviderError, Provisioned, ResourceProvider};
//!
//! struct Bucket;
//!
//! impl ResourceProvider for Bucket {
//!     fn resource_type(&self) -> &str {
//!         "Storage::Bucket"
//!     }
//!
//!     fn replacement_properties(&self) -> &[&str] {
//!         &["region"]
//!     }
//!
//!     fn create(&self, request: &CreateRequest) -> Result<Provisioned, ProviderError> {
//!         // use request.idempotency_token so a retried create returns the same bucket
//!         todo!()
//!     }
//!
//!     // update, delete, read ...
//! }
//! ```

use crate::error::ProviderError;
use crate::properties::Properties;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, mpsc};
use std::thread;
use std::time::{Duration, Instant};

/// Everything a provider needs to create a resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateRequest {
    pub logical_id: String,
    pub resource_type: String,
    pub properties: Properties,
    /// Repeated creates with the same token must return the same resource
    pub idempotency_token: String,
}

/// A resource as reported by its provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provisioned {
    pub physical_id: String,
    pub outputs: Properties,
}

/// Adapter for one native resource type
pub trait ResourceProvider: Send + Sync {
    /// The type tag this provider handles (e.g. `Local::File`)
    fn resource_type(&self) -> &str;

    /// Properties whose change cannot be applied in place
    fn replacement_properties(&self) -> &[&str] {
        &[]
    }

    /// Whether moving from `old` to `new` needs a new physical resource
    ///
    /// Default implementation compares the replacement properties.
    fn requires_replacement(&self, old: &Properties, new: &Properties) -> bool {
        self.replacement_properties()
            .iter()
            .any(|key| old.get(*key) != new.get(*key))
    }

    fn create(&self, request: &CreateRequest) -> Result<Provisioned, ProviderError>;

    /// Update in place, returning the new outputs
    fn update(&self, physical_id: &str, old: &Properties, new: &Properties) -> Result<Properties, ProviderError>;

    fn delete(&self, physical_id: &str) -> Result<(), ProviderError>;

    /// Current properties, or `None` if the resource no longer exists
    fn read(&self, physical_id: &str) -> Result<Option<Properties>, ProviderError>;

    /// Look up a resource created with `token`, used after a crash
    fn find_by_token(&self, _token: &str) -> Result<Option<Provisioned>, ProviderError> {
        Ok(None)
    }
}

/// Native providers keyed by resource type
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn ResourceProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider, replacing any previous one for the same type
    pub fn register(&mut self, provider: Arc<dyn ResourceProvider>) {
        let resource_type = provider.resource_type().to_string();
        log::debug!("registered provider for {resource_type}");
        self.providers.insert(resource_type, provider);
    }

    #[must_use]
    pub fn with(mut self, provider: Arc<dyn ResourceProvider>) -> Self {
        self.register(provider);
        self
    }

    pub fn get(&self, resource_type: &str) -> Option<Arc<dyn ResourceProvider>> {
        self.providers.get(resource_type).cloned()
    }

    pub fn contains(&self, resource_type: &str) -> bool {
        self.providers.contains_key(resource_type)
    }

    /// Registered type tags, sorted
    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.providers.keys().cloned().collect();
        types.sort();
        types
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("types", &self.types())
            .finish()
    }
}

/// Run a blocking provider call with an upper bound on its duration.
///
/// The call runs on its own thread; if it does not finish in time the
/// thread is left to complete in the background and `Timeout` is returned.
pub(crate) fn call_with_timeout<T, F>(timeout: Duration, call: F) -> Result<T, ProviderError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ProviderError> + Send + 'static,
{
    let rx = spawn_call(call)?;
    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => Err(ProviderError::Timeout(timeout)),
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(panicked()),
    }
}

/// Like [`call_with_timeout`], but a call that times out is handed to
/// `stragglers` so it can be waited for later.
pub(crate) fn call_tracked<T, F>(timeout: Duration, stragglers: &Stragglers, call: F) -> Result<T, ProviderError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ProviderError> + Send + 'static,
{
    let rx = spawn_call(call)?;
    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => {
            stragglers.track(move |deadline| {
                let left = deadline.saturating_duration_since(Instant::now());
                !matches!(rx.recv_timeout(left), Err(mpsc::RecvTimeoutError::Timeout))
            });
            Err(ProviderError::Timeout(timeout))
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(panicked()),
    }
}

fn spawn_call<T, F>(call: F) -> Result<mpsc::Receiver<Result<T, ProviderError>>, ProviderError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ProviderError> + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name("provider-call".to_string())
        .spawn(move || {
            let _ = tx.send(call());
        })
        .map_err(|e| ProviderError::Transient(format!("failed to spawn provider call: {e}")))?;
    Ok(rx)
}

fn panicked() -> ProviderError {
    ProviderError::Rejected("provider call panicked".to_string())
}

type Wait = Box<dyn FnOnce(Instant) -> bool + Send>;

/// Provider calls that outlived their timeout and may still take effect
#[derive(Default)]
pub(crate) struct Stragglers {
    waiting: Mutex<Vec<Wait>>,
}

impl Stragglers {
    fn track(&self, wait: impl FnOnce(Instant) -> bool + Send + 'static) {
        self.lock().push(Box::new(wait));
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Wait>> {
        self.waiting.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait for every tracked call to finish, at most `grace` in total.
    /// Returns how many are still running.
    pub fn settle(&self, grace: Duration) -> usize {
        let waiting = std::mem::take(&mut *self.lock());
        if waiting.is_empty() {
            return 0;
        }
        log::info!("waiting up to {}s for {} timed-out provider call(s)", grace.as_secs(), waiting.len());
        let deadline = Instant::now() + grace;
        waiting.into_iter().map(|wait| wait(deadline)).filter(|done| !done).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedProvider;
    use serde_json::json;

    #[test]
    fn test_default_requires_replacement() {
        let provider = ScriptedProvider::new("Test::Thing").replacing(&["region"]);
        let old: Properties = [("region".to_string(), json!("eu")), ("size".to_string(), json!(1))]
            .into_iter()
            .collect();
        let mut new = old.clone();
        new.insert("size".into(), json!(2));
        assert!(!provider.requires_replacement(&old, &new));

        new.insert("region".into(), json!("us"));
        assert!(provider.requires_replacement(&old, &new));
    }

    #[test]
    fn test_registry_lookup() {
        let registry = ProviderRegistry::new()
            .with(Arc::new(ScriptedProvider::new("Test::B")))
            .with(Arc::new(ScriptedProvider::new("Test::A")));
        assert!(registry.contains("Test::A"));
        assert!(registry.get("Test::Missing").is_none());
        assert_eq!(registry.types(), vec!["Test::A", "Test::B"]);
    }

    #[test]
    fn test_call_with_timeout_returns_value() {
        let result = call_with_timeout(Duration::from_secs(5), || Ok(42));
        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn test_call_with_timeout_times_out() {
        let result: Result<(), _> = call_with_timeout(Duration::from_millis(20), || {
            thread::sleep(Duration::from_millis(500));
            Ok(())
        });
        assert_eq!(result.unwrap_err(), ProviderError::Timeout(Duration::from_millis(20)));
    }

    #[test]
    fn test_tracked_call_can_be_waited_for_after_timeout() {
        let stragglers = Stragglers::default();
        let (done_tx, done_rx) = mpsc::channel();
        let result: Result<(), _> = call_tracked(Duration::from_millis(20), &stragglers, move || {
            thread::sleep(Duration::from_millis(150));
            let _ = done_tx.send(());
            Ok(())
        });
        assert_eq!(result.unwrap_err(), ProviderError::Timeout(Duration::from_millis(20)));

        assert_eq!(stragglers.settle(Duration::from_secs(5)), 0);
        assert!(done_rx.try_recv().is_ok());
        // Nothing left to wait for
        assert_eq!(stragglers.settle(Duration::from_secs(5)), 0);
    }

    #[test]
    fn test_settle_gives_up_after_grace() {
        let stragglers = Stragglers::default();
        let _: Result<(), _> = call_tracked(Duration::from_millis(10), &stragglers, || {
            thread::sleep(Duration::from_millis(500));
            Ok(())
        });
        assert_eq!(stragglers.settle(Duration::from_millis(20)), 1);
    }
}
