// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Periodic collection and the published attribution snapshot.
//!
//! The collector owns the report caches, the volume resolver and the property
//! resolver. Raw records are kept between cycles so a report that fails to
//! refresh keeps its previous value; every rebuild recomputes all views and
//! swaps them in as one `Arc`.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use tokio::sync::Mutex as TokioMutex;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::attribution::{
    AttributionEngine, AttributionInput, AttributionSnapshot, CampaignRevenue,
    DataPartnerPerformance, EspRevenuePerformance, MonthlySummary, OfferPerformance,
    PropertyPerformance, PropertyResolver, ReconciliationReport,
};
use crate::backoff::BackoffConfig;
use crate::cache::{CacheStore, Clock, SystemClock};
use crate::config::AttributionConfig;
use crate::constants::{CONVERSION_PAGE_SIZE, MAX_CONVERSION_PAGES};
use crate::errors::{AttributionError, UpstreamError};
use crate::identifier::{IdentifierCodec, IdentifierTables};
use crate::model::{
    CampaignMeta, CampaignReportRow, Click, Conversion, DateWindow, OfferPartnerRow, OfferTotal,
    PartnerClickRow,
};
use crate::store::{BlobStore, FsBlobStore};
use crate::upstream::{call_with_retry, SendingApi, TrackingApi};
use crate::volume::{PartnerActivity, ResolverStatsSnapshot, VolumeResolution, VolumeResolver};

const CLICKS: &str = "clicks";
const CONVERSIONS: &str = "conversions";
const CAMPAIGN_REPORT: &str = "campaign_report";
const OFFER_PARTNER: &str = "offer_partner";
const PARTNER_CLICKS: &str = "partner_clicks";
const OFFER_TOTALS: &str = "offer_totals";
const CAMPAIGNS: &str = "campaigns";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchKind {
    /// Whole lookback window, every report.
    Full,
    /// Today's clicks and conversions only.
    Incremental,
    /// Sending-platform campaign metadata only.
    Campaigns,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorState {
    Idle,
    Fetching(FetchKind),
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    Fresh,
    /// The fetch failed; the value from an earlier cycle is still in use.
    RetainedPrevious,
    /// The fetch failed and there was nothing to fall back on.
    Failed,
}

/// Per-report outcome of one fetch cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchSummary {
    pub kind: FetchKind,
    pub window: DateWindow,
    pub reports: BTreeMap<&'static str, ReportOutcome>,
}

impl FetchSummary {
    fn new(kind: FetchKind, window: DateWindow) -> Self {
        Self {
            kind,
            window,
            reports: BTreeMap::new(),
        }
    }

    pub fn outcome(&self, report: &str) -> Option<ReportOutcome> {
        self.reports.get(report).copied()
    }

    pub fn all_fresh(&self) -> bool {
        self.reports.values().all(|o| *o == ReportOutcome::Fresh)
    }
}

/// Raw records kept between cycles.
#[derive(Debug, Clone, Default)]
struct RawData {
    window: Option<DateWindow>,
    clicks: Vec<Click>,
    conversions: Vec<Conversion>,
    campaign_report: Vec<CampaignReportRow>,
    offer_partner: Vec<OfferPartnerRow>,
    partner_clicks: Vec<PartnerClickRow>,
    offer_totals: Vec<OfferTotal>,
    campaigns: Vec<CampaignMeta>,
    /// Reports fetched successfully at least once.
    loaded: BTreeSet<&'static str>,
}

/// TTL caches for the windowed report shapes. Volume is cached by the resolver.
struct ReportCaches {
    partner_clicks: CacheStore<String, Vec<PartnerClickRow>>,
    offer_partner: CacheStore<String, Vec<OfferPartnerRow>>,
    conversions: CacheStore<String, Vec<Conversion>>,
}

impl ReportCaches {
    fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            partner_clicks: CacheStore::new(ttl, Arc::clone(&clock)),
            offer_partner: CacheStore::new(ttl, Arc::clone(&clock)),
            conversions: CacheStore::new(ttl, clock),
        }
    }

    fn purge_expired(&self) -> usize {
        self.partner_clicks.purge_expired()
            + self.offer_partner.purge_expired()
            + self.conversions.purge_expired()
    }

    fn len(&self) -> usize {
        self.partner_clicks.len() + self.offer_partner.len() + self.conversions.len()
    }
}

/// Enforces a minimum gap between consecutive upstream calls.
struct Pacer {
    spacing: Duration,
    last: Option<Instant>,
}

impl Pacer {
    fn new(spacing: Duration) -> Self {
        Self {
            spacing,
            last: None,
        }
    }

    async fn wait(&mut self) {
        if let Some(last) = self.last {
            tokio::time::sleep_until(last + self.spacing).await;
        }
        self.last = Some(Instant::now());
    }
}

pub struct Collector {
    config: AttributionConfig,
    tracking: Arc<dyn TrackingApi>,
    sending: Arc<dyn SendingApi>,
    codec: Arc<IdentifierCodec>,
    engine: AttributionEngine,
    caches: ReportCaches,
    volume: VolumeResolver,
    properties: PropertyResolver,
    raw: RwLock<Arc<RawData>>,
    snapshot: RwLock<Arc<AttributionSnapshot>>,
    state: RwLock<CollectorState>,
    last_fetch: RwLock<Option<FetchSummary>>,
    cycle: TokioMutex<()>,
    cancel: CancellationToken,
}

impl Collector {
    /// Builds a collector from configuration: lookup tables from `tables_path`
    /// and a filesystem blob store under `blob_dir` when those are set.
    pub fn new(
        config: AttributionConfig,
        tracking: Arc<dyn TrackingApi>,
        sending: Arc<dyn SendingApi>,
    ) -> Result<Self, AttributionError> {
        config.validate()?;
        let tables = match &config.tables_path {
            Some(path) => IdentifierTables::from_json_file(path)?,
            None => IdentifierTables::default(),
        };
        let store = config
            .blob_dir
            .as_ref()
            .map(|dir| Arc::new(FsBlobStore::new(dir)) as Arc<dyn BlobStore>);
        Ok(Self::with_parts(
            config,
            tracking,
            sending,
            Arc::new(IdentifierCodec::new(tables)),
            store,
            Arc::new(SystemClock),
        ))
    }

    pub fn with_parts(
        config: AttributionConfig,
        tracking: Arc<dyn TrackingApi>,
        sending: Arc<dyn SendingApi>,
        codec: Arc<IdentifierCodec>,
        store: Option<Arc<dyn BlobStore>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let volume = VolumeResolver::new(
            Arc::clone(&sending),
            Arc::clone(&codec),
            store,
            config.volume(),
            Arc::clone(&clock),
            cancel.clone(),
        );
        let properties = PropertyResolver::new(
            Arc::clone(&sending),
            Arc::clone(&codec),
            config.property_lookup(),
            Arc::clone(&clock),
        );
        Self {
            caches: ReportCaches::new(config.report_ttl, clock),
            engine: AttributionEngine::new(Arc::clone(&codec)),
            config,
            tracking,
            sending,
            codec,
            volume,
            properties,
            raw: RwLock::new(Arc::new(RawData::default())),
            snapshot: RwLock::new(Arc::new(AttributionSnapshot::default())),
            state: RwLock::new(CollectorState::Idle),
            last_fetch: RwLock::new(None),
            cycle: TokioMutex::new(()),
            cancel,
        }
    }

    /// Drives the refresh tickers until `cancel` fires or [`Collector::stop`] is called.
    ///
    /// The first full fetch runs immediately.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), AttributionError> {
        if self.state() == CollectorState::Stopped {
            return Err(AttributionError::Stopped);
        }
        info!("Starting attribution collector");

        let mut full = interval(self.config.full_fetch_interval);
        let mut tracking = delayed_interval(self.config.tracking_refresh_interval);
        let mut sending = delayed_interval(self.config.sending_refresh_interval);
        let mut attribution = delayed_interval(self.config.attribution_refresh_interval);
        for ticker in [&mut full, &mut tracking, &mut sending, &mut attribution] {
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.cancel.cancelled() => break,
                _ = full.tick() => {
                    if self.full_fetch(today()).await.is_ok() {
                        self.rebuild().await;
                    }
                }
                _ = tracking.tick() => {
                    if let Err(e) = self.incremental_fetch(today()).await {
                        debug!("Skipping incremental fetch: {e}");
                    }
                }
                _ = sending.tick() => {
                    if let Err(e) = self.refresh_campaigns(today()).await {
                        debug!("Skipping campaign refresh: {e}");
                    }
                }
                _ = attribution.tick() => {
                    self.rebuild().await;
                }
            }
        }

        self.stop();
        info!("Attribution collector stopped");
        Ok(())
    }

    /// Stops the collector. Running exports notice at their next poll.
    pub fn stop(&self) {
        self.cancel.cancel();
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = CollectorState::Stopped;
    }

    /// Pulls every report for the lookback window ending `today`.
    pub async fn full_fetch(&self, today: NaiveDate) -> Result<FetchSummary, AttributionError> {
        let _cycle = self.cycle.lock().await;
        self.begin(FetchKind::Full)?;

        let window = DateWindow::lookback(today, self.config.lookback_days);
        info!("Full fetch for {window}");
        let mut summary = FetchSummary::new(FetchKind::Full, window);
        let mut pacer = Pacer::new(self.config.call_spacing);
        let loaded = self.raw_data().loaded.clone();
        let tracking = &self.tracking;
        let sending = &self.sending;

        let clicks = self
            .fetch_report(CLICKS, &loaded, &mut summary, &mut pacer, || tracking.clicks(&window))
            .await;
        let conversions = {
            let fetched = self
                .caches
                .conversions
                .get_or_fetch(&window.cache_key(), Vec::is_empty, || {
                    self.fetch_conversions(window, &mut pacer)
                })
                .await;
            record(CONVERSIONS, fetched, &loaded, &mut summary)
        };
        let campaign_report = self
            .fetch_report(CAMPAIGN_REPORT, &loaded, &mut summary, &mut pacer, || {
                tracking.campaign_report(&window)
            })
            .await;
        let offer_partner = self
            .fetch_cached(
                OFFER_PARTNER,
                &self.caches.offer_partner,
                window,
                &loaded,
                &mut summary,
                &mut pacer,
                || tracking.offer_partner_report(&window),
            )
            .await;
        let partner_clicks = self
            .fetch_cached(
                PARTNER_CLICKS,
                &self.caches.partner_clicks,
                window,
                &loaded,
                &mut summary,
                &mut pacer,
                || tracking.partner_clicks(&window),
            )
            .await;
        let offer_totals = self
            .fetch_report(OFFER_TOTALS, &loaded, &mut summary, &mut pacer, || {
                tracking.offer_totals(&window)
            })
            .await;
        let campaigns = self
            .fetch_report(CAMPAIGNS, &loaded, &mut summary, &mut pacer, || {
                sending.campaigns(&window)
            })
            .await;

        self.update_raw(|raw| {
            raw.window = Some(window);
            replace(&mut raw.clicks, clicks, CLICKS, &mut raw.loaded);
            replace(&mut raw.conversions, conversions, CONVERSIONS, &mut raw.loaded);
            replace(&mut raw.campaign_report, campaign_report, CAMPAIGN_REPORT, &mut raw.loaded);
            replace(&mut raw.offer_partner, offer_partner, OFFER_PARTNER, &mut raw.loaded);
            replace(&mut raw.partner_clicks, partner_clicks, PARTNER_CLICKS, &mut raw.loaded);
            replace(&mut raw.offer_totals, offer_totals, OFFER_TOTALS, &mut raw.loaded);
            replace(&mut raw.campaigns, campaigns, CAMPAIGNS, &mut raw.loaded);
        });

        self.finish(&summary);
        Ok(summary)
    }

    /// Re-pulls today's clicks and conversions, replacing any same-day records.
    pub async fn incremental_fetch(
        &self,
        today: NaiveDate,
    ) -> Result<FetchSummary, AttributionError> {
        let _cycle = self.cycle.lock().await;
        self.begin(FetchKind::Incremental)?;

        let day = DateWindow::single_day(today);
        debug!("Incremental fetch for {day}");
        let mut summary = FetchSummary::new(FetchKind::Incremental, day);
        let mut pacer = Pacer::new(self.config.call_spacing);
        let loaded = self.raw_data().loaded.clone();
        let tracking = &self.tracking;

        let clicks = self
            .fetch_report(CLICKS, &loaded, &mut summary, &mut pacer, || tracking.clicks(&day))
            .await;
        let fetched = self.fetch_conversions(day, &mut pacer).await;
        let conversions = record(CONVERSIONS, fetched, &loaded, &mut summary);

        let window = DateWindow::lookback(today, self.config.lookback_days);
        if conversions.is_some() {
            // A cached full-window page set predates these rows.
            self.caches.conversions.invalidate(&window.cache_key());
        }
        self.update_raw(|raw| {
            if let Some(fresh) = clicks {
                raw.clicks.retain(|c| c.date != today && window.contains(c.date));
                raw.clicks.extend(fresh);
                raw.loaded.insert(CLICKS);
            }
            if let Some(fresh) = conversions {
                raw.conversions
                    .retain(|c| c.date != today && window.contains(c.date));
                raw.conversions.extend(fresh);
                raw.loaded.insert(CONVERSIONS);
            }
        });

        self.finish(&summary);
        Ok(summary)
    }

    /// Refreshes sending-platform campaign metadata for the lookback window.
    pub async fn refresh_campaigns(
        &self,
        today: NaiveDate,
    ) -> Result<FetchSummary, AttributionError> {
        let _cycle = self.cycle.lock().await;
        self.begin(FetchKind::Campaigns)?;

        let window = DateWindow::lookback(today, self.config.lookback_days);
        let mut summary = FetchSummary::new(FetchKind::Campaigns, window);
        let mut pacer = Pacer::new(self.config.call_spacing);
        let loaded = self.raw_data().loaded.clone();
        let sending = &self.sending;

        let campaigns = self
            .fetch_report(CAMPAIGNS, &loaded, &mut summary, &mut pacer, || {
                sending.campaigns(&window)
            })
            .await;
        self.update_raw(|raw| {
            replace(&mut raw.campaigns, campaigns, CAMPAIGNS, &mut raw.loaded);
        });

        self.finish(&summary);
        Ok(summary)
    }

    /// Recomputes every view from the retained raw data and publishes it.
    ///
    /// Campaigns without a recognised property get a bounded round of
    /// secondary lookups; when any resolve, the views are built once more.
    pub async fn rebuild(&self) -> Arc<AttributionSnapshot> {
        let purged = self.caches.purge_expired() + self.volume.purge_expired();
        if purged > 0 {
            debug!("Purged {purged} expired cache entries");
        }

        let raw = self.raw_data();
        let volume = match raw.window {
            Some(window) => {
                let activity = PartnerActivity::from_rows(&self.codec, &raw.partner_clicks);
                self.volume.resolve(window, &activity).await
            }
            None => None,
        };

        let mut snapshot = self.build(&raw, volume.as_ref());
        if !snapshot.pending_property_lookups.is_empty() {
            let lookups = self
                .properties
                .resolve_batch(&snapshot.pending_property_lookups)
                .await;
            if lookups.resolved > 0 {
                snapshot = self.build(&raw, volume.as_ref());
            }
        }

        let pruned = self
            .properties
            .prune(|mailing_id| snapshot.campaigns.contains_key(mailing_id));
        if pruned > 0 {
            debug!("Pruned {pruned} property lookups outside the current window");
        }

        let snapshot = Arc::new(snapshot);
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = Arc::clone(&snapshot);
        info!(
            "Published attribution for {} campaigns ({} volume)",
            snapshot.campaigns.len(),
            snapshot
                .volume
                .as_ref()
                .map_or("no", |v| v.source.label())
        );
        snapshot
    }

    fn build(&self, raw: &RawData, volume: Option<&VolumeResolution>) -> AttributionSnapshot {
        let resolved = self.properties.resolved();
        self.engine.build(&AttributionInput {
            clicks: &raw.clicks,
            conversions: &raw.conversions,
            campaign_report: &raw.campaign_report,
            offer_partner: &raw.offer_partner,
            offer_totals: &raw.offer_totals,
            campaigns: &raw.campaigns,
            resolved_properties: &resolved,
            volume,
        })
    }

    pub fn snapshot(&self) -> Arc<AttributionSnapshot> {
        Arc::clone(&self.snapshot.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn campaigns(&self) -> Vec<CampaignRevenue> {
        self.snapshot().campaigns.values().cloned().collect()
    }

    pub fn campaign(&self, mailing_id: &str) -> Option<CampaignRevenue> {
        self.snapshot().campaigns.get(mailing_id).cloned()
    }

    pub fn properties(&self) -> Vec<PropertyPerformance> {
        self.snapshot().properties.values().cloned().collect()
    }

    pub fn offers(&self) -> Vec<OfferPerformance> {
        self.snapshot().offers.values().cloned().collect()
    }

    pub fn esps(&self) -> Vec<EspRevenuePerformance> {
        self.snapshot().esps.values().cloned().collect()
    }

    pub fn data_partners(&self) -> Vec<DataPartnerPerformance> {
        self.snapshot().data_partners.values().cloned().collect()
    }

    pub fn monthly_summaries(&self) -> Vec<MonthlySummary> {
        self.snapshot().monthly.clone()
    }

    pub fn esp_reconciliation(&self) -> ReconciliationReport {
        self.snapshot().esp_reconciliation.clone()
    }

    pub fn partner_reconciliation(&self) -> ReconciliationReport {
        self.snapshot().partner_reconciliation.clone()
    }

    pub fn volume(&self) -> Option<VolumeResolution> {
        self.snapshot().volume.clone()
    }

    pub fn volume_stats(&self) -> ResolverStatsSnapshot {
        self.volume.stats()
    }

    pub fn export_in_flight(&self, window: &DateWindow) -> bool {
        self.volume.export_in_flight(window)
    }

    /// Entries held across the report, volume and property-lookup caches.
    pub fn cached_entries(&self) -> usize {
        self.caches.len() + self.volume.cached_entries() + self.properties.cached_entries()
    }

    pub fn state(&self) -> CollectorState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn last_fetch(&self) -> Option<FetchSummary> {
        self.last_fetch
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn begin(&self, kind: FetchKind) -> Result<(), AttributionError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if *state == CollectorState::Stopped {
            return Err(AttributionError::Stopped);
        }
        *state = CollectorState::Fetching(kind);
        Ok(())
    }

    fn finish(&self, summary: &FetchSummary) {
        {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            if *state != CollectorState::Stopped {
                *state = CollectorState::Idle;
            }
        }
        if !summary.all_fresh() {
            warn!(
                "{:?} fetch for {} incomplete: {:?}",
                summary.kind, summary.window, summary.reports
            );
        }
        *self.last_fetch.write().unwrap_or_else(PoisonError::into_inner) = Some(summary.clone());
    }

    fn raw_data(&self) -> Arc<RawData> {
        Arc::clone(&self.raw.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn update_raw(&self, apply: impl FnOnce(&mut RawData)) {
        let mut raw = self.raw.write().unwrap_or_else(PoisonError::into_inner);
        apply(Arc::make_mut(&mut raw));
    }

    async fn fetch_report<T, F, Fut>(
        &self,
        name: &'static str,
        loaded: &BTreeSet<&'static str>,
        summary: &mut FetchSummary,
        pacer: &mut Pacer,
        call: F,
    ) -> Option<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
    {
        pacer.wait().await;
        let result = call_with_retry(
            name,
            self.config.request_timeout,
            BackoffConfig::report_retry(),
            call,
        )
        .await;
        record(name, result, loaded, summary)
    }

    #[allow(clippy::too_many_arguments)]
    async fn fetch_cached<T, F, Fut>(
        &self,
        name: &'static str,
        cache: &CacheStore<String, Vec<T>>,
        window: DateWindow,
        loaded: &BTreeSet<&'static str>,
        summary: &mut FetchSummary,
        pacer: &mut Pacer,
        call: F,
    ) -> Option<Vec<T>>
    where
        T: Clone,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Vec<T>, UpstreamError>>,
    {
        let timeout = self.config.request_timeout;
        let result = cache
            .get_or_fetch(&window.cache_key(), Vec::is_empty, || async move {
                pacer.wait().await;
                call_with_retry(name, timeout, BackoffConfig::report_retry(), call).await
            })
            .await;
        record(name, result, loaded, summary)
    }

    /// Walks the paginated conversion report.
    async fn fetch_conversions(
        &self,
        window: DateWindow,
        pacer: &mut Pacer,
    ) -> Result<Vec<Conversion>, UpstreamError> {
        let mut conversions = Vec::new();
        let mut page = 1;
        for _ in 0..MAX_CONVERSION_PAGES {
            pacer.wait().await;
            let result = call_with_retry(
                CONVERSIONS,
                self.config.request_timeout,
                BackoffConfig::report_retry(),
                || self.tracking.conversions_page(&window, page, CONVERSION_PAGE_SIZE),
            )
            .await?;
            conversions.extend(result.conversions);
            match result.next_page {
                Some(next) if next > page => page = next,
                _ => return Ok(conversions),
            }
        }
        warn!("Conversion report for {window} truncated at {MAX_CONVERSION_PAGES} pages");
        Ok(conversions)
    }
}

/// Records the outcome of one report fetch, logging failures.
fn record<T>(
    name: &'static str,
    result: Result<T, UpstreamError>,
    loaded: &BTreeSet<&'static str>,
    summary: &mut FetchSummary,
) -> Option<T> {
    match result {
        Ok(value) => {
            summary.reports.insert(name, ReportOutcome::Fresh);
            Some(value)
        }
        Err(e) => {
            error!("Failed to fetch {name} for {}: {e}", summary.window);
            let outcome = if loaded.contains(name) {
                warn!("Keeping previous {name} data");
                ReportOutcome::RetainedPrevious
            } else {
                ReportOutcome::Failed
            };
            summary.reports.insert(name, outcome);
            None
        }
    }
}

fn replace<T>(
    slot: &mut Vec<T>,
    fresh: Option<Vec<T>>,
    name: &'static str,
    loaded: &mut BTreeSet<&'static str>,
) {
    if let Some(fresh) = fresh {
        *slot = fresh;
        loaded.insert(name);
    }
}

fn delayed_interval(period: Duration) -> tokio::time::Interval {
    interval_at(Instant::now() + period, period)
}

fn today() -> NaiveDate {
    Utc::now().date_naive()
}
