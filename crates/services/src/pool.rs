//! Experiment instance pool: builds, caches and tracks running instances.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use turk_core::model::{ExperimentId, HitWorkerGroup, SetId};

use crate::config::PoolConfig;
use crate::error::ExperimentFactoryError;

/// Builds experiment instances of one fixed size.
pub trait ExperimentFactory: Send + Sync + 'static {
    type Instance: Send + Sync + 'static;

    /// Participants per instance.
    fn experiment_size(&self) -> usize;

    /// Construct an idle instance, ready to be bound to a group.
    ///
    /// # Errors
    ///
    /// Returns `ExperimentFactoryError` if the instance cannot be built.
    fn create(&self) -> Result<Self::Instance, ExperimentFactoryError>;

    /// Attach a group's clients to an idle instance.
    ///
    /// # Errors
    ///
    /// Returns `ExperimentFactoryError` if the instance refuses the group.
    fn bind(
        &self,
        instance: &mut Self::Instance,
        host: &HostHandle,
        group: &HitWorkerGroup,
        experiment_id: ExperimentId,
    ) -> Result<(), ExperimentFactoryError>;

    /// Release an instance's resources. No-op by default.
    fn teardown(&self, _instance: &Self::Instance) {}
}

/// Identifies the server an instance reports back to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostHandle {
    name: String,
    set_id: SetId,
}

impl HostHandle {
    #[must_use]
    pub fn new(name: impl Into<String>, set_id: SetId) -> Self {
        Self {
            name: name.into(),
            set_id,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn set_id(&self) -> &SetId {
        &self.set_id
    }
}

/// A running instance bound to one group.
#[derive(Debug)]
pub struct BoundExperiment<I> {
    pub id: ExperimentId,
    pub instance: Arc<I>,
    pub group: HitWorkerGroup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PoolStats {
    pub created: usize,
    pub cache_hits: usize,
    pub cache_misses: usize,
    pub failures: usize,
    pub running: usize,
    pub cached: usize,
}

/// Owns every instance from construction to teardown.
///
/// Idle instances are cached up to `max_cached` so that binding a freshly
/// formed group is usually a cache hit. `run` tops the cache up to
/// `low_watermark`.
pub struct ExperimentInstancePool<F: ExperimentFactory> {
    factory: F,
    config: PoolConfig,
    cache: Mutex<VecDeque<F::Instance>>,
    running: Mutex<HashMap<ExperimentId, Arc<F::Instance>>>,
    created: AtomicUsize,
    cache_hits: AtomicUsize,
    cache_misses: AtomicUsize,
    failures: AtomicUsize,
    closed: AtomicBool,
}

impl<F: ExperimentFactory> ExperimentInstancePool<F> {
    #[must_use]
    pub fn new(factory: F, config: PoolConfig) -> Self {
        Self {
            factory,
            config,
            cache: Mutex::new(VecDeque::new()),
            running: Mutex::new(HashMap::new()),
            created: AtomicUsize::new(0),
            cache_hits: AtomicUsize::new(0),
            cache_misses: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn experiment_size(&self) -> usize {
        self.factory.experiment_size()
    }

    #[must_use]
    pub fn factory(&self) -> &F {
        &self.factory
    }

    fn build(&self) -> Result<F::Instance, ExperimentFactoryError> {
        match self.factory.create() {
            Ok(instance) => {
                self.created.fetch_add(1, Ordering::Relaxed);
                Ok(instance)
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Bind `group` to a cached or freshly built instance.
    ///
    /// # Errors
    ///
    /// Returns `SizeMismatch` if the group does not fit, `ShutDown` after
    /// `shutdown`, or the factory's error if building or binding fails.
    pub fn get_new_experiment(
        &self,
        host: &HostHandle,
        group: &HitWorkerGroup,
    ) -> Result<BoundExperiment<F::Instance>, ExperimentFactoryError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ExperimentFactoryError::ShutDown);
        }
        let expected = self.experiment_size();
        if group.group_size() != expected {
            self.failures.fetch_add(1, Ordering::Relaxed);
            return Err(ExperimentFactoryError::SizeMismatch {
                expected,
                actual: group.group_size(),
            });
        }

        let cached = self.cache.lock().pop_front();
        let mut instance = if let Some(instance) = cached {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            instance
        } else {
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
            self.build()?
        };

        let id = ExperimentId::generate();
        if let Err(e) = self.factory.bind(&mut instance, host, group, id) {
            self.failures.fetch_add(1, Ordering::Relaxed);
            self.factory.teardown(&instance);
            return Err(e);
        }

        let instance = Arc::new(instance);
        {
            let mut running = self.running.lock();
            if self.closed.load(Ordering::Acquire) {
                drop(running);
                self.factory.teardown(&instance);
                return Err(ExperimentFactoryError::ShutDown);
            }
            running.insert(id, Arc::clone(&instance));
        }
        tracing::debug!(experiment_id = %id, sequence = group.sequence(), "bound experiment");
        Ok(BoundExperiment {
            id,
            instance,
            group: group.clone(),
        })
    }

    /// Pre-warm the cache up to the low watermark. Returns how many
    /// instances were cached.
    ///
    /// An instance finished after `shutdown` is torn down instead of cached.
    pub fn run(&self) -> usize {
        let target = self.config.low_watermark.min(self.config.max_cached);
        let mut built = 0;
        while !self.closed.load(Ordering::Acquire) && self.cache.lock().len() < target {
            match self.build() {
                Ok(instance) => {
                    let mut cache = self.cache.lock();
                    if self.closed.load(Ordering::Acquire) {
                        drop(cache);
                        self.factory.teardown(&instance);
                        tracing::debug!("pool closed during pre-warm; instance discarded");
                        break;
                    }
                    cache.push_back(instance);
                    built += 1;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "pre-warm failed");
                    break;
                }
            }
        }
        built
    }

    /// Run `run` every `prewarm_interval` until `shutdown` flips to `true`.
    pub fn spawn_prewarm(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.prewarm_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let pool = Arc::clone(&self);
                        match tokio::task::spawn_blocking(move || pool.run()).await {
                            Ok(built) if built > 0 => tracing::debug!(built, "pre-warmed experiments"),
                            Ok(_) => {}
                            Err(e) => tracing::warn!(error = %e, "pre-warm task failed"),
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Tear down a finished experiment. Returns `false` if it is not running.
    pub fn finish(&self, id: ExperimentId) -> bool {
        let Some(instance) = self.running.lock().remove(&id) else {
            return false;
        };
        self.factory.teardown(&instance);
        tracing::debug!(experiment_id = %id, "experiment finished");
        true
    }

    #[must_use]
    pub fn is_running(&self, id: ExperimentId) -> bool {
        self.running.lock().contains_key(&id)
    }

    #[must_use]
    pub fn running_count(&self) -> usize {
        self.running.lock().len()
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            created: self.created.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            running: self.running_count(),
            cached: self.cache.lock().len(),
        }
    }

    /// Tear down every cached and running instance and reset counters.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        let cached: Vec<F::Instance> = self.cache.lock().drain(..).collect();
        for instance in &cached {
            self.factory.teardown(instance);
        }
        let running: Vec<Arc<F::Instance>> =
            self.running.lock().drain().map(|(_, i)| i).collect();
        for instance in &running {
            self.factory.teardown(instance);
        }
        self.created.store(0, Ordering::Relaxed);
        self.cache_hits.store(0, Ordering::Relaxed);
        self.cache_misses.store(0, Ordering::Relaxed);
        self.failures.store(0, Ordering::Relaxed);
        tracing::info!(
            cached = cached.len(),
            running = running.len(),
            "experiment pool shut down"
        );
    }
}
