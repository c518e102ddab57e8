use super::poisoned;
use shelfmark_core::{ConfigRepository, EngagementError, Result};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Mock configuration rows.
#[derive(Debug, Clone, Default)]
pub struct MockConfigRepository {
    rows: Arc<Mutex<HashMap<String, String>>>,
    failing: Arc<AtomicBool>,
}

impl MockConfigRepository {
    /// Create an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a repository holding `rows`.
    #[must_use]
    pub fn with_rows<I, K, V>(rows: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let repo = Self::new();
        if let Ok(mut guard) = repo.rows.lock() {
            guard.extend(rows.into_iter().map(|(k, v)| (k.into(), v.into())));
        }
        repo
    }

    /// Make every call fail with a database error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(EngagementError::Database("injected failure".to_string()));
        }
        Ok(())
    }
}

impl ConfigRepository for MockConfigRepository {
    fn load_all(&self) -> impl Future<Output = Result<HashMap<String, String>>> + Send {
        let result = self
            .check()
            .and_then(|()| self.rows.lock().map(|rows| rows.clone()).map_err(poisoned));
        async move { result }
    }

    fn get(&self, key: &str) -> impl Future<Output = Result<Option<String>>> + Send {
        let result = self.check().and_then(|()| {
            self.rows
                .lock()
                .map(|rows| rows.get(key).cloned())
                .map_err(poisoned)
        });
        async move { result }
    }

    fn upsert(&self, key: &str, value: &str) -> impl Future<Output = Result<()>> + Send {
        let result = self.check().and_then(|()| {
            self.rows
                .lock()
                .map(|mut rows| {
                    rows.insert(key.to_string(), value.to_string());
                })
                .map_err(poisoned)
        });
        async move { result }
    }
}
