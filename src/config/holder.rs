//! Atomic hot-swap holder with debounced file-watch reload, §4.B.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use notify_debouncer_mini::{new_debouncer, notify::RecursiveMode, DebouncedEventKind};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::error::Result;

use super::loader::{self, LoadSources};
use super::schema::{CrawlerConfig, Environment};

type Subscriber = Box<dyn Fn(&Arc<CrawlerConfig>) + Send + Sync>;

/// Holds the live configuration behind an [`ArcSwap`] so reads never
/// contend with a concurrent reload. Swaps serialize through an internal
/// mutex; subscribers run outside that mutex so a slow one can't stall a
/// concurrent swap.
pub struct ConfigHolder {
    live: ArcSwap<CrawlerConfig>,
    swap_lock: Mutex<()>,
    subscribers: Mutex<Vec<Subscriber>>,
    sources: LoadSources,
    environment: Environment,
    // Kept alive for the life of the holder; dropping it stops the watch.
    _watcher: Mutex<Option<notify_debouncer_mini::Debouncer<notify_debouncer_mini::notify::RecommendedWatcher>>>,
}

static HOLDER: OnceCell<Arc<ConfigHolder>> = OnceCell::new();

impl ConfigHolder {
    fn new(initial: CrawlerConfig, sources: LoadSources, environment: Environment) -> Self {
        Self {
            live: ArcSwap::from_pointee(initial),
            swap_lock: Mutex::new(()),
            subscribers: Mutex::new(Vec::new()),
            sources,
            environment,
            _watcher: Mutex::new(None),
        }
    }

    /// Load the configuration and install it as the process-wide singleton.
    /// Subsequent calls return the already-installed holder unchanged.
    pub fn install(sources: LoadSources, environment: Environment) -> Result<Arc<ConfigHolder>> {
        let config = loader::load(&sources, environment)?;
        let holder = Arc::new(ConfigHolder::new(config, sources, environment));
        Ok(HOLDER.get_or_init(|| holder).clone())
    }

    pub fn get() -> Option<Arc<ConfigHolder>> {
        HOLDER.get().cloned()
    }

    pub fn current(&self) -> Arc<CrawlerConfig> {
        self.live.load_full()
    }

    pub fn subscribe(&self, callback: impl Fn(&Arc<CrawlerConfig>) + Send + Sync + 'static) {
        self.subscribers.lock().push(Box::new(callback));
    }

    /// Re-run the loader and, on success, swap the live value and notify
    /// subscribers. On failure the previous value remains in force.
    pub fn reload(&self) -> Result<()> {
        let reloaded = loader::load(&self.sources, self.environment)?;
        let new_value = Arc::new(reloaded);
        {
            let _guard = self.swap_lock.lock();
            self.live.store(new_value.clone());
        }
        self.notify_subscribers(&new_value);
        Ok(())
    }

    /// Apply a runtime overlay (forbidden in prod; §4.B).
    pub fn apply_overlay(&self, overlay: &serde_json::Value) -> Result<()> {
        let current = self.current();
        let updated = loader::apply_runtime_overlay(&current, overlay)?;
        let new_value = Arc::new(updated);
        {
            let _guard = self.swap_lock.lock();
            self.live.store(new_value.clone());
        }
        self.notify_subscribers(&new_value);
        Ok(())
    }

    fn notify_subscribers(&self, new_value: &Arc<CrawlerConfig>) {
        let subscribers = self.subscribers.lock();
        for subscriber in subscribers.iter() {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                subscriber(new_value);
            }));
            if let Err(panic) = result {
                tracing::error!(?panic, "configuration subscriber panicked; isolated");
            }
        }
    }

    /// Begin watching the source files for changes, reloading (debounced by
    /// `debounce`, default 2s) whenever one is modified.
    pub fn watch(self: &Arc<Self>, debounce: Duration) -> Result<()> {
        let watched: Vec<PathBuf> = [self.sources.base.clone(), self.sources.environment_specific.clone()]
            .into_iter()
            .flatten()
            .chain(self.sources.site_files.iter().cloned())
            .filter(|path| path.exists())
            .collect();

        let holder = Arc::clone(self);
        let mut debouncer = new_debouncer(debounce, move |result| match result {
            Ok(events) => {
                let meaningful = events
                    .iter()
                    .any(|event| event.kind == DebouncedEventKind::Any);
                if meaningful {
                    if let Err(err) = holder.reload() {
                        tracing::error!(%err, "configuration hot-reload failed, keeping previous value");
                    } else {
                        tracing::info!("configuration hot-reloaded");
                    }
                }
            }
            Err(err) => tracing::error!(?err, "configuration watcher error"),
        })
        .map_err(|e| {
            crate::error::RepositoryError::Configuration(crate::error::ConfigErrorKind::Load(format!(
                "failed to start config watcher: {e}"
            )))
        })?;

        for path in &watched {
            let _ = debouncer.watcher().watch(path, RecursiveMode::NonRecursive);
        }

        *self._watcher.lock() = Some(debouncer);
        Ok(())
    }
}
