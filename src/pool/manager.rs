//! Pool of model handles, one per configured GPU device.
//!
//! The pool hands out [`HandleLease`]s. A lease marks its handle busy for the
//! life of one batch and gives it back on drop, so a worker that times out,
//! is aborted or panics still returns its device.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::error::{DeviceLoadError, PipelineError};
use crate::metrics::MetricsCollector;
use crate::pipeline::config::GpuDevices;

use super::handle::{LoadState, ModelHandle, ModelLoader};

/// Errors raised when leasing a handle.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    /// The pool was unloaded or never had a ready handle.
    #[error("Model pool is closed")]
    Closed,

    /// A handle came off the free list while still marked busy.
    #[error("Handle on device {0} is already busy")]
    HandleInUse(String),
}

/// Outcome of [`ModelPool::load_all`].
#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    /// Devices whose handle reached `ready`, in configured order.
    pub ready: Vec<String>,
    /// Devices excluded from the run.
    pub failed: Vec<DeviceLoadError>,
}

impl LoadReport {
    pub fn is_degraded(&self) -> bool {
        !self.failed.is_empty()
    }
}

/// Owns one [`ModelHandle`] per configured device.
pub struct ModelPool {
    loader: Arc<dyn ModelLoader>,
    handles: Vec<Arc<ModelHandle>>,
    /// Indices of ready handles not currently leased.
    free: Mutex<VecDeque<usize>>,
    /// One permit per entry in `free`.
    available: Arc<Semaphore>,
    ready: AtomicUsize,
    busy: AtomicUsize,
    peak_busy: AtomicUsize,
    metrics: MetricsCollector,
}

impl ModelPool {
    /// Creates an empty pool; call [`load_all`](Self::load_all) before leasing.
    pub fn new(loader: Arc<dyn ModelLoader>) -> Self {
        Self {
            loader,
            handles: Vec::new(),
            free: Mutex::new(VecDeque::new()),
            available: Arc::new(Semaphore::new(0)),
            ready: AtomicUsize::new(0),
            busy: AtomicUsize::new(0),
            peak_busy: AtomicUsize::new(0),
            metrics: MetricsCollector::new(),
        }
    }

    /// Loads `model_name` once per device, concurrently.
    ///
    /// Devices that fail are marked `error` and excluded. Fails only when no
    /// device could be loaded.
    pub async fn load_all(
        &mut self,
        model_name: &str,
        devices: &GpuDevices,
    ) -> Result<LoadReport, PipelineError> {
        if devices.is_empty() {
            return Err(PipelineError::NoDevices);
        }
        if !self.handles.is_empty() {
            return Err(PipelineError::Internal(
                "model pool is already loaded".to_string(),
            ));
        }

        self.handles = devices
            .iter()
            .enumerate()
            .map(|(position, device)| Arc::new(ModelHandle::new(device, position, model_name)))
            .collect();

        info!(
            model = %model_name,
            devices = %devices,
            "Loading model on {} device(s)",
            self.handles.len()
        );

        let loads = self.handles.iter().map(|handle| {
            let loader = Arc::clone(&self.loader);
            let handle = Arc::clone(handle);
            async move {
                handle.mark_loading();
                let result = loader
                    .load(model_name, handle.device(), handle.position())
                    .await;
                (handle, result)
            }
        });

        let mut report = LoadReport::default();
        let mut ready_indices = Vec::new();
        for (index, (handle, result)) in join_all(loads).await.into_iter().enumerate() {
            match result {
                Ok(generator) => {
                    handle.mark_ready(generator);
                    self.metrics.record_device_load(handle.device(), true);
                    debug!(device = %handle.device(), "Model handle ready");
                    report.ready.push(handle.device().to_string());
                    ready_indices.push(index);
                }
                Err(e) => {
                    warn!(device = %handle.device(), error = %e, "Device failed to load, excluding it");
                    self.metrics.record_device_load(handle.device(), false);
                    handle.mark_error(e.clone());
                    report.failed.push(e);
                }
            }
        }

        if ready_indices.is_empty() {
            return Err(PipelineError::AllDevicesFailed(report.failed));
        }

        let ready = ready_indices.len();
        self.lock_free().extend(ready_indices);
        self.ready.store(ready, Ordering::SeqCst);
        self.available.add_permits(ready);

        if report.is_degraded() {
            warn!(
                ready = ready,
                failed = report.failed.len(),
                "Running in degraded mode"
            );
        }
        Ok(report)
    }

    /// Waits for a free ready handle and leases it.
    pub async fn acquire(self: &Arc<Self>) -> Result<HandleLease, PoolError> {
        let permit = Arc::clone(&self.available)
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;

        let index = self.lock_free().pop_front().ok_or(PoolError::Closed)?;
        let handle = Arc::clone(&self.handles[index]);
        if !handle.try_mark_busy() {
            self.lock_free().push_back(index);
            return Err(PoolError::HandleInUse(handle.device().to_string()));
        }

        let busy = self.busy.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_busy.fetch_max(busy, Ordering::SeqCst);
        self.metrics.set_busy_handles(busy);

        Ok(HandleLease {
            pool: Arc::clone(self),
            index,
            handle,
            _permit: permit,
        })
    }

    /// Returns a leased handle to the pool.
    pub fn release(&self, lease: HandleLease) {
        drop(lease);
    }

    /// Waits for every lease to come back, then unloads all ready handles.
    ///
    /// Later calls are no-ops.
    pub async fn unload_all(&self) {
        let ready = self.ready.swap(0, Ordering::SeqCst);
        if ready == 0 {
            return;
        }

        // Draining every permit means no lease is outstanding.
        match self.available.acquire_many(ready as u32).await {
            Ok(permits) => permits.forget(),
            Err(_) => return,
        }
        self.available.close();
        self.lock_free().clear();

        for handle in &self.handles {
            if handle.state() == LoadState::Ready {
                self.loader.unload(handle.device()).await;
                handle.mark_unloaded();
                debug!(device = %handle.device(), "Model handle unloaded");
            }
        }
        info!("Model pool unloaded");
    }

    pub fn handles(&self) -> &[Arc<ModelHandle>] {
        &self.handles
    }

    pub fn ready_count(&self) -> usize {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn busy_count(&self) -> usize {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn peak_busy(&self) -> usize {
        self.peak_busy.load(Ordering::SeqCst)
    }

    fn lock_free(&self) -> std::sync::MutexGuard<'_, VecDeque<usize>> {
        self.free.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn give_back(&self, index: usize) {
        self.handles[index].clear_busy();
        self.lock_free().push_back(index);
        let busy = self.busy.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        self.metrics.set_busy_handles(busy);
    }
}

/// Exclusive use of one handle for one batch.
pub struct HandleLease {
    pool: Arc<ModelPool>,
    index: usize,
    handle: Arc<ModelHandle>,
    _permit: OwnedSemaphorePermit,
}

impl HandleLease {
    pub fn handle(&self) -> &ModelHandle {
        &self.handle
    }

    pub fn device(&self) -> &str {
        self.handle.device()
    }
}

impl std::fmt::Debug for HandleLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleLease")
            .field("device", &self.handle.device())
            .finish()
    }
}

impl Drop for HandleLease {
    fn drop(&mut self) {
        // The index goes back before the permit is released.
        self.pool.give_back(self.index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GenerationError;
    use crate::pool::handle::{GeneratedPair, QaGenerator};
    use crate::scheduler::Batch;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct NoopGenerator;

    #[async_trait]
    impl QaGenerator for NoopGenerator {
        async fn generate(&self, _batch: &Batch) -> Result<Vec<GeneratedPair>, GenerationError> {
            Ok(Vec::new())
        }
    }

    /// Fails every device listed in `broken`.
    struct TestLoader {
        broken: Vec<&'static str>,
        unloads: AtomicUsize,
    }

    impl TestLoader {
        fn new(broken: Vec<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                broken,
                unloads: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ModelLoader for TestLoader {
        async fn load(
            &self,
            _model_name: &str,
            device: &str,
            _position: usize,
        ) -> Result<Arc<dyn QaGenerator>, DeviceLoadError> {
            if self.broken.contains(&device) {
                return Err(DeviceLoadError::LoadFailed {
                    device: device.to_string(),
                    reason: "out of memory".to_string(),
                });
            }
            Ok(Arc::new(NoopGenerator))
        }

        async fn unload(&self, _device: &str) {
            self.unloads.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn devices(s: &str) -> GpuDevices {
        GpuDevices::parse(s).expect("devices")
    }

    #[tokio::test]
    async fn test_load_all_ready() {
        let mut pool = ModelPool::new(TestLoader::new(vec![]));
        let report = pool.load_all("m", &devices("0,1")).await.expect("loaded");

        assert_eq!(report.ready, vec!["0", "1"]);
        assert!(!report.is_degraded());
        assert_eq!(pool.ready_count(), 2);
        assert!(pool.handles().iter().all(|h| h.state() == LoadState::Ready));
    }

    #[tokio::test]
    async fn test_degraded_mode_excludes_failed_device() {
        let mut pool = ModelPool::new(TestLoader::new(vec!["1"]));
        let report = pool.load_all("m", &devices("0,1,2")).await.expect("loaded");

        assert_eq!(report.ready, vec!["0", "2"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].device(), "1");
        assert_eq!(pool.handles()[1].state(), LoadState::Error);

        let pool = Arc::new(pool);
        let a = pool.acquire().await.expect("lease");
        let b = pool.acquire().await.expect("lease");
        assert_ne!(a.device(), "1");
        assert_ne!(b.device(), "1");
    }

    #[tokio::test]
    async fn test_all_devices_failing_is_fatal() {
        let mut pool = ModelPool::new(TestLoader::new(vec!["0", "1"]));
        let err = pool.load_all("m", &devices("0,1")).await.unwrap_err();
        match err {
            PipelineError::AllDevicesFailed(errors) => assert_eq!(errors.len(), 2),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_lease_is_exclusive_and_released_on_drop() {
        let mut pool = ModelPool::new(TestLoader::new(vec![]));
        pool.load_all("m", &devices("0")).await.expect("loaded");
        let pool = Arc::new(pool);

        let lease = pool.acquire().await.expect("lease");
        assert!(lease.handle().is_busy());
        assert_eq!(pool.busy_count(), 1);

        // Second acquire waits while the only handle is leased
        let waiting = tokio::time::timeout(Duration::from_millis(50), pool.acquire()).await;
        assert!(waiting.is_err());

        pool.release(lease);
        assert_eq!(pool.busy_count(), 0);

        let again = pool.acquire().await.expect("lease after release");
        assert_eq!(again.device(), "0");
        assert_eq!(pool.peak_busy(), 1);
    }

    #[tokio::test]
    async fn test_lease_released_when_task_panics() {
        let mut pool = ModelPool::new(TestLoader::new(vec![]));
        pool.load_all("m", &devices("0")).await.expect("loaded");
        let pool = Arc::new(pool);

        let lease = pool.acquire().await.expect("lease");
        let task = tokio::spawn(async move {
            let _lease = lease;
            panic!("worker crashed");
        });
        assert!(task.await.is_err());

        assert_eq!(pool.busy_count(), 0);
        let lease = tokio::time::timeout(Duration::from_secs(1), pool.acquire())
            .await
            .expect("not starved")
            .expect("lease");
        assert!(!lease.device().is_empty());
    }

    #[tokio::test]
    async fn test_unload_all_closes_pool() {
        let loader = TestLoader::new(vec!["1"]);
        let mut pool = ModelPool::new(loader.clone());
        pool.load_all("m", &devices("0,1")).await.expect("loaded");
        let pool = Arc::new(pool);

        pool.unload_all().await;
        pool.unload_all().await;

        assert_eq!(loader.unloads.load(Ordering::SeqCst), 1);
        assert_eq!(pool.handles()[0].state(), LoadState::Unloaded);
        assert_eq!(pool.acquire().await.unwrap_err(), PoolError::Closed);
    }

    #[tokio::test]
    async fn test_double_load_rejected() {
        let mut pool = ModelPool::new(TestLoader::new(vec![]));
        pool.load_all("m", &devices("0")).await.expect("loaded");
        assert!(matches!(
            pool.load_all("m", &devices("0")).await,
            Err(PipelineError::Internal(_))
        ));
    }
}
