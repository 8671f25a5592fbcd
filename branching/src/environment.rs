//! Publication of connection strings through environment variables.
//!
//! Code under test usually reads its database URL from the environment. The publisher sets the
//! configured variable to the branch connection string and restores the previous value, or
//! removes the variable, when the session ends.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

/// Key-value store holding environment variables.
pub trait EnvStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    fn set(&self, key: &str, value: &str);

    fn remove(&self, key: &str);
}

/// [`EnvStore`] backed by the process environment.
///
/// Mutating the process environment is only sound while no other thread reads or writes it.
/// Test harnesses publish before spawning tests and restore after joining them.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvStore for ProcessEnv {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }

    fn set(&self, key: &str, value: &str) {
        unsafe {
            std::env::set_var(key, value);
        }
    }

    fn remove(&self, key: &str) {
        unsafe {
            std::env::remove_var(key);
        }
    }
}

/// [`EnvStore`] kept in memory, isolated from the process environment.
#[derive(Debug, Default)]
pub struct MemoryEnv {
    vars: Mutex<HashMap<String, String>>,
}

impl MemoryEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_var(self, key: &str, value: &str) -> Self {
        self.set(key, value);
        self
    }
}

impl EnvStore for MemoryEnv {
    fn get(&self, key: &str) -> Option<String> {
        self.vars
            .lock()
            .ok()
            .and_then(|vars| vars.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) {
        if let Ok(mut vars) = self.vars.lock() {
            vars.insert(key.to_string(), value.to_string());
        }
    }

    fn remove(&self, key: &str) {
        if let Ok(mut vars) = self.vars.lock() {
            vars.remove(key);
        }
    }
}

/// Value of the variable before the first publication.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Captured {
    NotPublished,
    Original(Option<String>),
}

/// Sets one environment variable and restores its prior value.
///
/// The prior value is captured on the first [`EnvironmentPublisher::set`] only, so publishing
/// several times still restores the value the process started with.
pub struct EnvironmentPublisher {
    store: Arc<dyn EnvStore>,
    key: String,
    captured: Mutex<Captured>,
}

impl EnvironmentPublisher {
    pub fn new(store: Arc<dyn EnvStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
            captured: Mutex::new(Captured::NotPublished),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns the value currently held by the variable.
    pub fn current(&self) -> Option<String> {
        self.store.get(&self.key)
    }

    /// Returns `true` between a publication and the next restore.
    pub fn is_published(&self) -> bool {
        self.captured
            .lock()
            .map(|captured| *captured != Captured::NotPublished)
            .unwrap_or(false)
    }

    /// Sets the variable to `value`.
    pub fn set(&self, value: &str) {
        if let Ok(mut captured) = self.captured.lock() {
            if *captured == Captured::NotPublished {
                *captured = Captured::Original(self.store.get(&self.key));
            }
        }

        self.store.set(&self.key, value);
        debug!(key = %self.key, "published connection string");
    }

    /// Restores the value the variable had before the first publication.
    ///
    /// Does nothing when nothing was published or the variable was already restored.
    pub fn restore(&self) {
        let captured = match self.captured.lock() {
            Ok(mut captured) => std::mem::replace(&mut *captured, Captured::NotPublished),
            Err(_) => return,
        };

        match captured {
            Captured::NotPublished => {}
            Captured::Original(Some(original)) => {
                self.store.set(&self.key, &original);
                debug!(key = %self.key, "restored environment variable");
            }
            Captured::Original(None) => {
                self.store.remove(&self.key);
                debug!(key = %self.key, "removed environment variable");
            }
        }
    }

    /// Publishes `value` until the returned guard is dropped.
    pub fn publish(&self, value: &str) -> PublishGuard<'_> {
        self.set(value);
        PublishGuard { publisher: self }
    }
}

/// Restores the published variable when dropped.
#[must_use = "the variable is restored as soon as the guard is dropped"]
pub struct PublishGuard<'a> {
    publisher: &'a EnvironmentPublisher,
}

impl Drop for PublishGuard<'_> {
    fn drop(&mut self) {
        self.publisher.restore();
    }
}
