// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Exact send volume from the asynchronous contact-activity export.
//!
//! The export runs as a detached task: create, poll until ready, fetch the CSV,
//! aggregate, cache and persist. The remote job is deleted afterwards from an
//! independent task, so cleanup happens even if the owner was cancelled or the
//! export task itself was aborted.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    ResolverStats, StrategyContext, VolumeConfig, VolumeResolution, VolumeSource, VolumeStrategy,
};
use crate::backoff::BackoffState;
use crate::cache::{CacheStore, Clock, InFlightRegistry};
use crate::errors::UpstreamError;
use crate::identifier::IdentifierCodec;
use crate::model::{DateWindow, ExportId, ExportStatus};
use crate::store::{load_exact_volume, save_exact_volume, BlobStore};
use crate::upstream::{with_deadline, SendingApi};

const SEGMENT_COLUMN: &str = "segment_name";

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error("export cancelled by its owner")]
    Cancelled,
    #[error("export not ready after {0:?}")]
    TimedOut(Duration),
    #[error("malformed export csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("export csv has no '{0}' column")]
    MissingColumn(&'static str),
}

/// First strategy of the chain: exact figures from cache, from durable
/// storage, or not yet (in which case an export is started in the background).
#[derive(Clone)]
pub struct ExactExporter {
    sending: Arc<dyn SendingApi>,
    codec: Arc<IdentifierCodec>,
    store: Option<Arc<dyn BlobStore>>,
    config: VolumeConfig,
    cache: Arc<CacheStore<String, VolumeResolution>>,
    /// Windows whose last export failed, keyed like `cache`.
    cooldown: Arc<CacheStore<String, ()>>,
    registry: Arc<InFlightRegistry<String>>,
    stats: Arc<ResolverStats>,
    cancel: CancellationToken,
}

impl ExactExporter {
    pub(super) fn new(
        sending: Arc<dyn SendingApi>,
        codec: Arc<IdentifierCodec>,
        store: Option<Arc<dyn BlobStore>>,
        config: VolumeConfig,
        clock: Arc<dyn Clock>,
        stats: Arc<ResolverStats>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            sending,
            codec,
            store,
            cache: Arc::new(CacheStore::new(config.exact_ttl, Arc::clone(&clock))),
            cooldown: Arc::new(CacheStore::new(config.export_retry_cooldown, clock)),
            config,
            registry: Arc::new(InFlightRegistry::new()),
            stats,
            cancel,
        }
    }

    pub fn in_flight(&self, window: &DateWindow) -> bool {
        self.registry.contains(&window.cache_key())
    }

    pub fn cooling_down(&self, window: &DateWindow) -> bool {
        self.cooldown.get(&window.cache_key()).is_some()
    }

    pub(super) fn purge_expired(&self) -> usize {
        self.cache.purge_expired() + self.cooldown.purge_expired()
    }

    pub(super) fn cached_entries(&self) -> usize {
        self.cache.len() + self.cooldown.len()
    }

    async fn load_persisted(&self, window: &DateWindow) -> Option<VolumeResolution> {
        let store = self.store.as_ref()?;
        match load_exact_volume(store.as_ref(), window, self.config.persisted_max_age).await {
            Ok(Some(resolution)) if !resolution.is_empty() => {
                info!("restored exact volume for {window} from durable storage");
                self.cache.insert(window.cache_key(), resolution.clone());
                Some(resolution)
            }
            Ok(_) => None,
            Err(err) => {
                warn!("failed to read persisted volume for {window}: {err}");
                None
            }
        }
    }

    /// Starts an export for `window` unless one is already running.
    pub fn launch(&self, window: DateWindow) -> Option<JoinHandle<()>> {
        let guard = self.registry.try_register(window.cache_key())?;
        self.stats.exports_launched.fetch_add(1, Ordering::Relaxed);
        info!("launching contact-activity export for {window}");

        let job = self.clone();
        Some(tokio::spawn(async move {
            // Dropping the guard clears the registry entry however this task ends.
            let _guard = guard;
            match job.run(window).await {
                Ok(resolution) => {
                    job.stats.exports_completed.fetch_add(1, Ordering::Relaxed);
                    job.publish(window, resolution).await;
                }
                Err(ExportError::Cancelled) => {
                    job.stats.exports_failed.fetch_add(1, Ordering::Relaxed);
                    info!("contact-activity export for {window} cancelled");
                }
                Err(err) => {
                    job.stats.exports_failed.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "contact-activity export for {window} failed: {err}; not retrying for {:?}",
                        job.config.export_retry_cooldown
                    );
                    job.cooldown.insert(window.cache_key(), ());
                }
            }
        }))
    }

    async fn publish(&self, window: DateWindow, resolution: VolumeResolution) {
        if resolution.is_empty() {
            // An empty export is more likely throttling than a true zero.
            warn!("export for {window} returned no sends; not caching");
            return;
        }
        info!(
            "exact volume for {window}: {} sends across {} partners",
            resolution.total_sent,
            resolution.by_partner.len()
        );
        self.cache.insert(window.cache_key(), resolution.clone());
        if let Some(store) = &self.store {
            if let Err(err) = save_exact_volume(store.as_ref(), &window, &resolution).await {
                warn!("failed to persist exact volume for {window}: {err}");
            }
        }
    }

    async fn run(&self, window: DateWindow) -> Result<VolumeResolution, ExportError> {
        let timeout = self.config.request_timeout;
        let id = with_deadline(timeout, self.sending.create_activity_export(&window)).await?;
        debug!("export {id} created for {window}");
        let _cleanup = RemoteCleanup {
            sending: Arc::clone(&self.sending),
            id: Some(id.clone()),
            timeout,
        };

        self.wait_until_ready(&id).await?;
        let body = with_deadline(timeout, self.sending.fetch_export(&id)).await?;
        aggregate_export_csv(&self.codec, window, &body)
    }

    /// Polls export status. Cancellation is only observed between polls.
    async fn wait_until_ready(&self, id: &ExportId) -> Result<(), ExportError> {
        let deadline = Instant::now() + self.config.export_max_wait;
        let mut rate_limit = BackoffState::new(self.config.rate_limit_backoff);
        loop {
            if self.cancel.is_cancelled() {
                return Err(ExportError::Cancelled);
            }
            if Instant::now() >= deadline {
                return Err(ExportError::TimedOut(self.config.export_max_wait));
            }

            let delay = match with_deadline(
                self.config.request_timeout,
                self.sending.export_status(id),
            )
            .await
            {
                Ok(ExportStatus::Ready) => return Ok(()),
                Ok(ExportStatus::Failed) => {
                    return Err(UpstreamError::ExportFailed(id.to_string()).into())
                }
                Ok(ExportStatus::Pending) => {
                    rate_limit.register_success();
                    self.config.export_poll_interval
                }
                Err(err) if err.is_rate_limit() => {
                    let delay = rate_limit.register_error();
                    warn!("export {id} status rate limited, backing off {delay:?}");
                    delay
                }
                Err(err) if err.is_transient() => {
                    debug!("export {id} status check failed transiently: {err}");
                    self.config.export_poll_interval
                }
                Err(err) => return Err(err.into()),
            };
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl VolumeStrategy for ExactExporter {
    fn source(&self) -> VolumeSource {
        VolumeSource::ExactExport
    }

    async fn resolve(&self, ctx: &mut StrategyContext<'_>) -> Option<VolumeResolution> {
        if let Some(hit) = self.cache.get(&ctx.window.cache_key()) {
            self.stats.exact_hits.fetch_add(1, Ordering::Relaxed);
            return Some(hit);
        }
        if self.in_flight(&ctx.window) {
            debug!("export for {} still running", ctx.window);
            return None;
        }
        if let Some(persisted) = self.load_persisted(&ctx.window).await {
            self.stats.exact_hits.fetch_add(1, Ordering::Relaxed);
            return Some(persisted);
        }
        if self.cooling_down(&ctx.window) {
            debug!("export for {} failed recently; not relaunching yet", ctx.window);
            return None;
        }
        self.launch(ctx.window);
        None
    }
}

/// Deletes the remote export when dropped, on a task of its own.
struct RemoteCleanup {
    sending: Arc<dyn SendingApi>,
    id: Option<ExportId>,
    timeout: Duration,
}

impl Drop for RemoteCleanup {
    fn drop(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("no runtime available to delete export {id}");
            return;
        };
        let sending = Arc::clone(&self.sending);
        let timeout = self.timeout;
        runtime.spawn(async move {
            match with_deadline(timeout, sending.delete_export(&id)).await {
                Ok(()) => debug!("deleted export {id}"),
                Err(err) => warn!("failed to delete export {id}: {err}"),
            }
        });
    }
}

/// Counts one send per CSV row, grouped by the partner named in `segment_name`.
/// Rows whose segment names no partner are credited to the default partner.
pub fn aggregate_export_csv(
    codec: &IdentifierCodec,
    window: DateWindow,
    body: &str,
) -> Result<VolumeResolution, ExportError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(body.as_bytes());
    let segment_index = reader
        .headers()?
        .iter()
        .position(|h| h.eq_ignore_ascii_case(SEGMENT_COLUMN))
        .ok_or(ExportError::MissingColumn(SEGMENT_COLUMN))?;

    let default_prefix = codec.default_partner().prefix;
    let mut by_partner: BTreeMap<String, u64> = BTreeMap::new();
    let mut total = 0u64;
    for record in reader.records() {
        let record = record?;
        total += 1;
        let prefix = record
            .get(segment_index)
            .and_then(|segment| codec.partner_for_segment(segment))
            .map(|partner| partner.prefix)
            .unwrap_or_else(|| default_prefix.clone());
        *by_partner.entry(prefix).or_default() += 1;
    }

    Ok(VolumeResolution {
        window,
        source: VolumeSource::ExactExport,
        total_sent: total,
        by_partner,
    })
}
