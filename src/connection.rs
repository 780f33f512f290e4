//! Connection string resolution for the log sink.
//!
//! The sink address is owned by an external collaborator and may change between calls
//! (rotated credentials, failover). The pipeline therefore asks a [`ConnectionSource`]
//! for the current string on every provisioning and persistence attempt instead of
//! caching it. Blank strings count as unresolved.

use std::future::Future;
use std::sync::Arc;

/// Supplies the current sink connection string
pub trait ConnectionSource: Send + Sync + 'static {
    /// Current connection string, or `None` if no sink is available right now
    fn connection_string(&self) -> impl Future<Output = Option<String>> + Send;
}

impl<T: ConnectionSource> ConnectionSource for Arc<T> {
    fn connection_string(&self) -> impl Future<Output = Option<String>> + Send {
        self.as_ref().connection_string()
    }
}

/// Resolve a source and discard blank results
pub async fn resolve<C: ConnectionSource>(source: &C) -> Option<String> {
    source
        .connection_string()
        .await
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Re-reads an environment variable on every call
#[derive(Debug, Clone)]
pub struct EnvConnectionSource {
    variable: String,
}

impl EnvConnectionSource {
    pub fn new(variable: impl Into<String>) -> Self {
        Self {
            variable: variable.into(),
        }
    }
}

impl ConnectionSource for EnvConnectionSource {
    async fn connection_string(&self) -> Option<String> {
        std::env::var(&self.variable).ok()
    }
}

/// A fixed connection string
#[derive(Debug, Clone)]
pub struct StaticConnectionSource(Option<String>);

impl StaticConnectionSource {
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self(Some(connection_string.into()))
    }

    /// A source that never resolves
    pub fn unresolved() -> Self {
        Self(None)
    }
}

impl ConnectionSource for StaticConnectionSource {
    async fn connection_string(&self) -> Option<String> {
        self.0.clone()
    }
}

/// Delegates to a closure, called once per resolution
pub struct FnConnectionSource<F> {
    factory: F,
}

impl<F> FnConnectionSource<F>
where
    F: Fn() -> Option<String> + Send + Sync + 'static,
{
    pub fn new(factory: F) -> Self {
        Self { factory }
    }
}

impl<F> ConnectionSource for FnConnectionSource<F>
where
    F: Fn() -> Option<String> + Send + Sync + 'static,
{
    async fn connection_string(&self) -> Option<String> {
        (self.factory)()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_blank_strings_are_unresolved() {
        assert_eq!(resolve(&StaticConnectionSource::new("   ")).await, None);
        assert_eq!(resolve(&StaticConnectionSource::unresolved()).await, None);
        assert_eq!(
            resolve(&StaticConnectionSource::new(" sqlite::memory: ")).await,
            Some("sqlite::memory:".to_string())
        );
    }

    #[tokio::test]
    async fn test_fn_source_is_called_on_every_resolution() {
        let current = Arc::new(Mutex::new("sqlite://first.db".to_string()));
        let shared = current.clone();
        let source = FnConnectionSource::new(move || Some(shared.lock().unwrap().clone()));

        assert_eq!(resolve(&source).await.as_deref(), Some("sqlite://first.db"));
        *current.lock().unwrap() = "sqlite://rotated.db".to_string();
        assert_eq!(resolve(&source).await.as_deref(), Some("sqlite://rotated.db"));
    }

    #[tokio::test]
    async fn test_env_source_reads_current_value() {
        let source = EnvConnectionSource::new("LOGVAULT_TEST_CONNECTION_SOURCE");
        unsafe {
            std::env::remove_var("LOGVAULT_TEST_CONNECTION_SOURCE");
        }
        assert_eq!(resolve(&source).await, None);

        unsafe {
            std::env::set_var("LOGVAULT_TEST_CONNECTION_SOURCE", "sqlite://env.db");
        }
        assert_eq!(resolve(&source).await.as_deref(), Some("sqlite://env.db"));

        unsafe {
            std::env::remove_var("LOGVAULT_TEST_CONNECTION_SOURCE");
        }
    }
}
