// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Send-volume resolution.
//!
//! Answers "how many emails were sent on behalf of each partner in a window"
//! from the most trustworthy source available right now:
//!
//! ```text
//!   exact export (detached, 5-30 min) ──miss──> cached estimate
//!                                                   │ miss
//!                                                   v
//!   segment aggregation ──> list total ──> click-share estimate
//! ```
//!
//! Only the export yields exact figures. Everything else is tagged with the
//! [`VolumeSource`] it came from so estimates are never mistaken for exact data.

mod export;
mod strategy;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::backoff::BackoffConfig;
use crate::cache::{CacheStore, Clock};
use crate::identifier::IdentifierCodec;
use crate::model::{DateWindow, PartnerClickRow};
use crate::store::BlobStore;
use crate::upstream::SendingApi;

pub use export::{aggregate_export_csv, ExportError, ExactExporter};
pub use strategy::{
    ClickShareEstimate, ListAggregation, SegmentAggregation, StrategyContext, VolumeStrategy,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VolumeSource {
    ExactExport,
    SegmentAggregate,
    ListAggregate,
    /// Partner share of clicks (or conversions) applied to a known total.
    ClickShareEstimate,
}

impl VolumeSource {
    pub fn is_exact(self) -> bool {
        matches!(self, VolumeSource::ExactExport)
    }

    pub fn label(self) -> &'static str {
        match self {
            VolumeSource::ExactExport => "exact",
            VolumeSource::SegmentAggregate => "segment",
            VolumeSource::ListAggregate => "list",
            VolumeSource::ClickShareEstimate => "estimated",
        }
    }
}

impl fmt::Display for VolumeSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Send volume for a window, keyed by partner prefix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeResolution {
    pub window: DateWindow,
    pub source: VolumeSource,
    pub total_sent: u64,
    /// Empty for list-level results, which only carry a total.
    pub by_partner: BTreeMap<String, u64>,
}

impl VolumeResolution {
    pub fn is_exact(&self) -> bool {
        self.source.is_exact()
    }

    pub fn has_partner_breakdown(&self) -> bool {
        !self.by_partner.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.total_sent == 0 && self.by_partner.values().all(|v| *v == 0)
    }

    pub fn sent_for(&self, partner_prefix: &str) -> Option<u64> {
        self.by_partner.get(partner_prefix).copied()
    }
}

/// Click and conversion counts per partner prefix; the basis of click-share estimates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartnerActivity {
    pub clicks: BTreeMap<String, u64>,
    pub conversions: BTreeMap<String, u64>,
}

impl PartnerActivity {
    /// Groups the per-partner clicks report by resolved partner prefix.
    /// Email-hash and unparseable sub2 values are skipped.
    pub fn from_rows(codec: &IdentifierCodec, rows: &[PartnerClickRow]) -> Self {
        let mut activity = PartnerActivity::default();
        for row in rows {
            let Some(prefix) = codec
                .parse_sub2(&row.sub2)
                .and_then(|parsed| parsed.partner)
                .map(|partner| partner.prefix)
            else {
                continue;
            };
            *activity.clicks.entry(prefix.clone()).or_default() += row.clicks;
            *activity.conversions.entry(prefix).or_default() += row.conversions;
        }
        activity
    }
}

#[derive(Debug, Clone)]
pub struct VolumeConfig {
    pub exact_ttl: Duration,
    pub estimated_ttl: Duration,
    pub request_timeout: Duration,
    pub export_poll_interval: Duration,
    pub export_max_wait: Duration,
    /// Quiet period after a failed export before the window is tried again.
    pub export_retry_cooldown: Duration,
    pub persisted_max_age: Duration,
    pub min_segment_partners: usize,
    pub rate_limit_backoff: BackoffConfig,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            exact_ttl: Duration::from_secs(24 * 60 * 60),
            estimated_ttl: Duration::from_secs(30 * 60),
            request_timeout: Duration::from_secs(30),
            export_poll_interval: Duration::from_secs(30),
            export_max_wait: Duration::from_secs(45 * 60),
            export_retry_cooldown: Duration::from_secs(60 * 60),
            persisted_max_age: Duration::from_secs(24 * 60 * 60),
            min_segment_partners: 2,
            rate_limit_backoff: BackoffConfig::export_rate_limit(),
        }
    }
}

#[derive(Debug, Default)]
pub struct ResolverStats {
    pub(crate) exports_launched: AtomicU64,
    pub(crate) exports_completed: AtomicU64,
    pub(crate) exports_failed: AtomicU64,
    pub(crate) exact_hits: AtomicU64,
    pub(crate) estimate_hits: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResolverStatsSnapshot {
    pub exports_launched: u64,
    pub exports_completed: u64,
    pub exports_failed: u64,
    pub exact_hits: u64,
    pub estimate_hits: u64,
}

impl ResolverStats {
    fn snapshot(&self) -> ResolverStatsSnapshot {
        ResolverStatsSnapshot {
            exports_launched: self.exports_launched.load(Ordering::Relaxed),
            exports_completed: self.exports_completed.load(Ordering::Relaxed),
            exports_failed: self.exports_failed.load(Ordering::Relaxed),
            exact_hits: self.exact_hits.load(Ordering::Relaxed),
            estimate_hits: self.estimate_hits.load(Ordering::Relaxed),
        }
    }
}

/// Resolves send volume per window without ever waiting on the exact export.
pub struct VolumeResolver {
    exporter: ExactExporter,
    estimated: CacheStore<String, VolumeResolution>,
    fallbacks: Vec<Box<dyn VolumeStrategy>>,
    stats: Arc<ResolverStats>,
}

impl fmt::Debug for VolumeResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VolumeResolver")
            .field("fallbacks", &self.fallbacks.len())
            .field("estimated_entries", &self.estimated.len())
            .finish()
    }
}

impl VolumeResolver {
    /// `cancel` is the owner's shutdown token; detached exports observe it at poll boundaries.
    pub fn new(
        sending: Arc<dyn SendingApi>,
        codec: Arc<IdentifierCodec>,
        store: Option<Arc<dyn BlobStore>>,
        config: VolumeConfig,
        clock: Arc<dyn Clock>,
        cancel: CancellationToken,
    ) -> Self {
        let stats = Arc::new(ResolverStats::default());
        let exporter = ExactExporter::new(
            Arc::clone(&sending),
            Arc::clone(&codec),
            store,
            config.clone(),
            Arc::clone(&clock),
            Arc::clone(&stats),
            cancel,
        );
        let fallbacks: Vec<Box<dyn VolumeStrategy>> = vec![
            Box::new(SegmentAggregation::new(
                Arc::clone(&sending),
                Arc::clone(&codec),
                config.request_timeout,
                config.min_segment_partners,
            )),
            Box::new(ListAggregation::new(sending, config.request_timeout)),
            Box::new(ClickShareEstimate),
        ];
        Self {
            exporter,
            estimated: CacheStore::new(config.estimated_ttl, clock),
            fallbacks,
            stats,
        }
    }

    /// Best available volume for `window`.
    ///
    /// The first call for a cold window launches the exact export in the
    /// background and answers from the fallback chain; once the export lands,
    /// later calls get the exact figures.
    pub async fn resolve(
        &self,
        window: DateWindow,
        activity: &PartnerActivity,
    ) -> Option<VolumeResolution> {
        let mut ctx = StrategyContext::new(window, activity);
        if let Some(exact) = self.exporter.resolve(&mut ctx).await {
            return Some(exact);
        }

        let key = window.cache_key();
        if let Some(hit) = self.estimated.get(&key) {
            self.stats.estimate_hits.fetch_add(1, Ordering::Relaxed);
            return Some(hit);
        }

        let resolved = run_chain(&self.fallbacks, &mut ctx).await?;
        if !resolved.is_empty() {
            self.estimated.insert(key, resolved.clone());
        }
        Some(resolved)
    }

    pub fn export_in_flight(&self, window: &DateWindow) -> bool {
        self.exporter.in_flight(window)
    }

    /// Drops expired exact, estimated and cooldown entries.
    pub fn purge_expired(&self) -> usize {
        self.exporter.purge_expired() + self.estimated.purge_expired()
    }

    /// Entries currently held across the volume caches.
    pub fn cached_entries(&self) -> usize {
        self.exporter.cached_entries() + self.estimated.len()
    }

    pub fn stats(&self) -> ResolverStatsSnapshot {
        self.stats.snapshot()
    }
}

/// Runs strategies in order and accepts the first result with a per-partner
/// breakdown. Total-only results feed later strategies through the context and
/// are returned only when nothing better turns up.
pub async fn run_chain(
    strategies: &[Box<dyn VolumeStrategy>],
    ctx: &mut StrategyContext<'_>,
) -> Option<VolumeResolution> {
    let mut total_only: Option<VolumeResolution> = None;
    for strategy in strategies {
        match strategy.resolve(ctx).await {
            Some(resolution) if resolution.is_empty() => {
                debug!("{} volume for {} was empty", strategy.source(), ctx.window);
            }
            Some(resolution) if resolution.has_partner_breakdown() => {
                debug!("volume for {} resolved from {}", ctx.window, strategy.source());
                return Some(resolution);
            }
            Some(resolution) => {
                ctx.known_total.get_or_insert(resolution.total_sent);
                total_only.get_or_insert(resolution);
            }
            None => debug!("{} volume unavailable for {}", strategy.source(), ctx.window),
        }
    }
    total_only
}
