//! Effect runner: lifecycle-bound fan-out over the active providers
//!
//! Constructed per workflow run from the registered factories. `track`
//! dispatches to every provider, `save_changes` flushes all providers in
//! parallel, and `dispose` attempts every provider even when earlier
//! disposals fail, collecting the failures.

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Mutex;
use tracing::warn;

use super::{EffectError, EffectProvider, EffectProviderFactory, Tracked};

/// Fan-out over the providers active for one workflow run
pub struct EffectRunner {
    providers: Mutex<Vec<Box<dyn EffectProvider>>>,
}

impl EffectRunner {
    /// Instantiate one provider per registered factory.
    pub fn from_factories(
        factories: &[Arc<dyn EffectProviderFactory>],
    ) -> Result<Self, EffectError> {
        let providers = factories
            .iter()
            .map(|factory| factory.create())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            providers: Mutex::new(providers),
        })
    }

    /// Runner with no providers attached.
    pub fn empty() -> Self {
        Self {
            providers: Mutex::new(Vec::new()),
        }
    }

    /// Register a model with every active provider.
    pub async fn track(&self, model: Tracked) {
        let mut providers = self.providers.lock().await;
        for provider in providers.iter_mut() {
            provider.track(model.clone());
        }
    }

    /// Flush all providers: sequential `prepare` phase, then parallel
    /// `save_changes`.
    pub async fn save_changes(&self) -> Result<(), EffectError> {
        let mut providers = self.providers.lock().await;

        for provider in providers.iter_mut() {
            provider.prepare()?;
        }

        let results = join_all(providers.iter_mut().map(|p| p.save_changes())).await;
        let failures: Vec<String> = results
            .into_iter()
            .filter_map(|r| r.err().map(|e| e.to_string()))
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(EffectError::Provider(failures.join("; ")))
        }
    }

    /// Dispose every provider; one provider's failure never prevents the
    /// disposal of the others.
    pub async fn dispose(&self) -> Result<(), EffectError> {
        let mut providers = self.providers.lock().await;
        let mut failures = Vec::new();

        for provider in providers.iter_mut() {
            if let Err(e) = provider.dispose().await {
                warn!(provider = provider.name(), error = %e, "effect provider failed to dispose");
                failures.push(format!("{}: {e}", provider.name()));
            }
        }
        providers.clear();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(EffectError::PartialDispose(failures))
        }
    }

    /// Number of active providers.
    pub async fn provider_count(&self) -> usize {
        self.providers.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProvider {
        tracked: Arc<AtomicUsize>,
        saved: Arc<AtomicUsize>,
        disposed: Arc<AtomicUsize>,
        fail_dispose: bool,
    }

    #[async_trait]
    impl EffectProvider for CountingProvider {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn track(&mut self, _model: Tracked) {
            self.tracked.fetch_add(1, Ordering::SeqCst);
        }

        async fn save_changes(&mut self) -> Result<(), EffectError> {
            self.saved.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn dispose(&mut self) -> Result<(), EffectError> {
            self.disposed.fetch_add(1, Ordering::SeqCst);
            if self.fail_dispose {
                Err(EffectError::Provider("dispose boom".into()))
            } else {
                Ok(())
            }
        }
    }

    fn runner_with(providers: Vec<Box<dyn EffectProvider>>) -> EffectRunner {
        EffectRunner {
            providers: Mutex::new(providers),
        }
    }

    fn metadata_model() -> Tracked {
        Tracked::Metadata(crate::model::MetadataHandle::new(
            crate::model::Metadata::new("W"),
        ))
    }

    #[tokio::test]
    async fn track_fans_out_to_every_provider() {
        let tracked = Arc::new(AtomicUsize::new(0));
        let providers: Vec<Box<dyn EffectProvider>> = (0..3)
            .map(|_| {
                Box::new(CountingProvider {
                    tracked: tracked.clone(),
                    saved: Arc::new(AtomicUsize::new(0)),
                    disposed: Arc::new(AtomicUsize::new(0)),
                    fail_dispose: false,
                }) as Box<dyn EffectProvider>
            })
            .collect();

        let runner = runner_with(providers);
        runner.track(metadata_model()).await;
        assert_eq!(tracked.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn dispose_attempts_every_provider_despite_failures() {
        let disposed = Arc::new(AtomicUsize::new(0));
        let providers: Vec<Box<dyn EffectProvider>> = (0..3)
            .map(|i| {
                Box::new(CountingProvider {
                    tracked: Arc::new(AtomicUsize::new(0)),
                    saved: Arc::new(AtomicUsize::new(0)),
                    disposed: disposed.clone(),
                    fail_dispose: i == 0,
                }) as Box<dyn EffectProvider>
            })
            .collect();

        let runner = runner_with(providers);
        let err = runner.dispose().await.unwrap_err();

        assert_eq!(disposed.load(Ordering::SeqCst), 3);
        assert!(matches!(err, EffectError::PartialDispose(failures) if failures.len() == 1));
    }

    #[tokio::test]
    async fn save_changes_flushes_all_providers() {
        let saved = Arc::new(AtomicUsize::new(0));
        let providers: Vec<Box<dyn EffectProvider>> = (0..2)
            .map(|_| {
                Box::new(CountingProvider {
                    tracked: Arc::new(AtomicUsize::new(0)),
                    saved: saved.clone(),
                    disposed: Arc::new(AtomicUsize::new(0)),
                    fail_dispose: false,
                }) as Box<dyn EffectProvider>
            })
            .collect();

        let runner = runner_with(providers);
        runner.save_changes().await.unwrap();
        assert_eq!(saved.load(Ordering::SeqCst), 2);
    }
}
