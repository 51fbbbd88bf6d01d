
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::error::{Error, Result};

const DEFAULT_MIN_RETRY_DELAY: Duration = Duration::from_millis(1000);
const MAX_RETRY_DELAY_FACTOR: u32 = 6;

/// Gate the load loop blocks on between iterations.
///
/// Open while preparing (so track formats can be learned), closed on the
/// transition into prepared, reopened by `playback()` and by
/// cancellation/release.
pub struct LoadCondition {
    open: AtomicBool,
    notify: Notify,
}

impl LoadCondition {
    pub fn new(open: bool) -> Self {
        LoadCondition {
            open: AtomicBool::new(open),
            notify: Notify::new(),
        }
    }

    pub fn open(&self) {
        self.open.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Waits until the condition is open.
    pub async fn block(&self) {
        loop {
            let notified = self.notify.notified();
            if self.open.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }
    }
}

/// Whether a failed load should run again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    Retry,
    DontRetry,
}

/// One unit of loading work, run on the loader's worker.
#[async_trait]
pub trait Loadable: Send + Sync {
    /// Runs one open/load/close cycle. Must observe
    /// [`cancel_load`](Loadable::cancel_load) between reads.
    async fn load(&self) -> Result<()>;

    /// Level-triggered cancellation; `load` returns at the next check.
    fn cancel_load(&self);

    fn is_load_canceled(&self) -> bool;
}

/// Receives the outcome of a load.
#[async_trait]
pub trait LoaderCallback: Send + Sync {
    async fn on_load_completed(&self, loadable: Arc<dyn Loadable>);

    /// `released` tells a cancellation that tears the loader down apart
    /// from one that may be followed by a retry on another transport.
    async fn on_load_canceled(&self, loadable: Arc<dyn Loadable>, released: bool);

    async fn on_load_error(
        &self,
        loadable: Arc<dyn Loadable>,
        error: Error,
        retry_count: u32,
    ) -> RetryAction;
}

struct Shared {
    /// Live worker count; loads can briefly overlap during a hand-over.
    active: AtomicUsize,
    released: AtomicBool,
    fatal_error: std::sync::Mutex<Option<Error>>,
}

struct CurrentLoad {
    loadable: Arc<dyn Loadable>,
    handle: JoinHandle<()>,
}

/// Single-flight scheduler for a [`Loadable`] with bounded retry.
pub struct Loader {
    name: String,
    min_retry_delay: Duration,
    shared: Arc<Shared>,
    current: Mutex<Option<CurrentLoad>>,
}

impl Loader {
    pub fn new(name: impl Into<String>) -> Self {
        Loader {
            name: name.into(),
            min_retry_delay: DEFAULT_MIN_RETRY_DELAY,
            shared: Arc::new(Shared {
                active: AtomicUsize::new(0),
                released: AtomicBool::new(false),
                fatal_error: std::sync::Mutex::new(None),
            }),
            current: Mutex::new(None),
        }
    }

    pub fn with_min_retry_delay(mut self, min_retry_delay: Duration) -> Self {
        self.min_retry_delay = min_retry_delay;
        self
    }

    /// Starts `loadable` on the worker. The previous loadable, if any, is
    /// canceled first; its terminal callback still fires.
    pub async fn start_loading(
        &self,
        loadable: Arc<dyn Loadable>,
        callback: Arc<dyn LoaderCallback>,
    ) -> Result<()> {
        if self.shared.released.load(Ordering::SeqCst) {
            return Err(Error::Released);
        }
        let mut current = self.current.lock().await;
        if let Some(previous) = current.take() {
            if !previous.loadable.is_load_canceled() {
                log::warn!("loader {}: replacing a live loadable", self.name);
                previous.loadable.cancel_load();
            }
        }

        self.shared.active.fetch_add(1, Ordering::SeqCst);
        let shared = self.shared.clone();
        let min_retry_delay = self.min_retry_delay;
        let name = self.name.clone();
        let task_loadable = loadable.clone();
        let handle = tokio::spawn(async move {
            let mut retry_count = 0u32;
            loop {
                if task_loadable.is_load_canceled() {
                    let released = shared.released.load(Ordering::SeqCst);
                    callback.on_load_canceled(task_loadable.clone(), released).await;
                    break;
                }
                let result = task_loadable.load().await;
                if task_loadable.is_load_canceled() {
                    let released = shared.released.load(Ordering::SeqCst);
                    callback.on_load_canceled(task_loadable.clone(), released).await;
                    break;
                }
                match result {
                    Ok(()) => {
                        callback.on_load_completed(task_loadable.clone()).await;
                        break;
                    }
                    Err(error) => {
                        retry_count += 1;
                        log::debug!("loader {}: load error ({}): {}", name, retry_count, error);
                        let action = callback
                            .on_load_error(task_loadable.clone(), error.clone(), retry_count)
                            .await;
                        match action {
                            RetryAction::DontRetry => {
                                *shared.fatal_error.lock().unwrap() = Some(error);
                                break;
                            }
                            RetryAction::Retry => {
                                let factor = retry_count.min(MAX_RETRY_DELAY_FACTOR);
                                sleep(min_retry_delay * factor).await;
                            }
                        }
                    }
                }
            }
            shared.active.fetch_sub(1, Ordering::SeqCst);
        });

        *current = Some(CurrentLoad { loadable, handle });
        Ok(())
    }

    pub fn is_loading(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst) > 0
    }

    /// Cancels the live loadable, if any. The worker observes the flag at
    /// its next check and reports `on_load_canceled`.
    pub async fn cancel_loading(&self) {
        let current = self.current.lock().await;
        if let Some(current) = &*current {
            current.loadable.cancel_load();
        }
    }

    /// Re-raises the error a dead worker ended with.
    pub fn maybe_throw_error(&self) -> Result<()> {
        match &*self.shared.fatal_error.lock().unwrap() {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    /// Cancels the live loadable, waits for the worker to stop, then fires
    /// `on_released`. Idempotent.
    pub async fn release(&self, on_released: Option<Box<dyn FnOnce() + Send>>) {
        self.shared.released.store(true, Ordering::SeqCst);
        let current = {
            let mut current = self.current.lock().await;
            current.take()
        };
        if let Some(current) = current {
            current.loadable.cancel_load();
            if let Err(e) = current.handle.await {
                if !e.is_cancelled() {
                    log::warn!("loader {}: worker ended abnormally: {}", self.name, e);
                }
            }
        }
        if let Some(on_released) = on_released {
            on_released();
        }
    }
}
