//! Periodic registry refresh.
//!
//! One background task reloads the registry every `refresh_interval`,
//! preferring the URL source over the file source.  A failed cycle is
//! logged and leaves the installed generation untouched; the loop only ends
//! when its cancellation token fires.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::parser::{RegistryParser, RegistrySource};
use super::store::{CacheStore, Generation};
use super::RegistryError;
use crate::config::RegistryConfig;
use crate::metrics::{MetricsRegistry, RefreshOutcome};

pub struct Refresher {
    store: CacheStore,
    parser: Arc<dyn RegistryParser>,
    source_file: Option<PathBuf>,
    source_url: Option<String>,
    interval: Duration,
    verbose: u8,
    metrics: MetricsRegistry,
}

impl Refresher {
    pub fn new(
        store: CacheStore,
        parser: Arc<dyn RegistryParser>,
        config: &RegistryConfig,
        metrics: MetricsRegistry,
    ) -> Self {
        Self {
            store,
            parser,
            source_file: config.source_file.clone(),
            source_url: config.source_url.clone().filter(|url| !url.trim().is_empty()),
            interval: config.refresh_interval(),
            verbose: config.verbose,
            metrics,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Source used by periodic cycles: the URL when configured, else the file.
    pub fn source(&self) -> Option<RegistrySource> {
        self.source_url
            .clone()
            .map(RegistrySource::Url)
            .or_else(|| self.source_file.clone().map(RegistrySource::File))
    }

    /// Synchronous bootstrap from the file source, before the loop starts.
    ///
    /// Returns `Ok(None)` when no file is configured.
    pub async fn initial_load(&self) -> Result<Option<u64>, RegistryError> {
        let Some(path) = self.source_file.clone() else {
            return Ok(None);
        };
        self.refresh_from(RegistrySource::File(path)).await.map(Some)
    }

    /// One refresh attempt against [`Refresher::source`].
    pub async fn refresh_once(&self) -> Result<u64, RegistryError> {
        let source = self.source().ok_or(RegistryError::NoSource)?;
        self.refresh_from(source).await
    }

    #[instrument(skip(self), fields(mode = %self.store.key_mode()))]
    async fn refresh_from(&self, source: RegistrySource) -> Result<u64, RegistryError> {
        let outcome = self.parser.load(&source, self.store.key_mode()).await;
        let metrics = &self.metrics.metrics;
        match outcome {
            Ok(snapshot) => {
                info!(%source, records = snapshot.len(), "obtained registry records");
                let version = self.store.rebuild(snapshot, Some(source.to_string()));
                let generation = self.store.generation();
                metrics.record_refresh(RefreshOutcome::Success);
                metrics.set_registry_size(&generation);
                self.log_records(&generation);
                Ok(version)
            }
            Err(e) => {
                metrics.record_refresh(RefreshOutcome::Failure);
                Err(e)
            }
        }
    }

    /// Run until `cancel` fires.  The first cycle starts immediately.
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            interval_secs = self.interval.as_secs(),
            source = ?self.source().map(|s| s.to_string()),
            mode = %self.store.key_mode(),
            "registry refresh loop started"
        );

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                result = self.refresh_once() => match result {
                    Ok(version) => debug!(version, "registry refresh succeeded"),
                    Err(RegistryError::NoSource) => {
                        self.metrics.metrics.record_refresh(RefreshOutcome::Skipped);
                        warn!("unable to refresh registry: no file or URL configured");
                    }
                    Err(e) => error!(
                        error = %e,
                        version = self.store.version(),
                        "registry refresh failed, keeping previous records"
                    ),
                },
            }

            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(self.interval) => {}
            }
        }

        info!("registry refresh loop stopped");
    }

    fn log_records(&self, generation: &Generation) {
        let key = self.store.key_mode();
        let limit = match self.verbose {
            0 => return,
            1 => 1,
            _ => usize::MAX,
        };
        for (token, record) in generation.index.iter().take(limit) {
            info!(%key, %token, ?record, "registry record");
        }
    }
}
