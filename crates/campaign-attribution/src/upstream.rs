// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Seams to the two upstream platforms.
//!
//! The authenticated REST clients live outside this crate; they implement these
//! traits and map HTTP failures through [`UpstreamError::from_status`].

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::backoff::{BackoffConfig, BackoffState};
use crate::errors::UpstreamError;
use crate::model::{
    CampaignMeta, CampaignReportRow, Click, ConversionPage, DateWindow, ExportId, ExportStatus,
    ListVolume, OfferPartnerRow, OfferTotal, PartnerClickRow, SegmentVolume,
};

/// Affiliate tracking network: clicks, conversions and revenue.
#[async_trait]
pub trait TrackingApi: Send + Sync {
    async fn clicks(&self, window: &DateWindow) -> Result<Vec<Click>, UpstreamError>;

    /// One page of conversions; pages are numbered from 1.
    async fn conversions_page(
        &self,
        window: &DateWindow,
        page: u32,
        page_size: u32,
    ) -> Result<ConversionPage, UpstreamError>;

    async fn campaign_report(
        &self,
        window: &DateWindow,
    ) -> Result<Vec<CampaignReportRow>, UpstreamError>;

    async fn offer_partner_report(
        &self,
        window: &DateWindow,
    ) -> Result<Vec<OfferPartnerRow>, UpstreamError>;

    async fn partner_clicks(
        &self,
        window: &DateWindow,
    ) -> Result<Vec<PartnerClickRow>, UpstreamError>;

    async fn offer_totals(&self, window: &DateWindow) -> Result<Vec<OfferTotal>, UpstreamError>;
}

/// Email sending platform: campaign metadata, volumes and the contact-activity export.
#[async_trait]
pub trait SendingApi: Send + Sync {
    async fn campaigns(&self, window: &DateWindow) -> Result<Vec<CampaignMeta>, UpstreamError>;

    async fn campaign(&self, mailing_id: &str) -> Result<Option<CampaignMeta>, UpstreamError>;

    async fn segment_volumes(
        &self,
        window: &DateWindow,
    ) -> Result<Vec<SegmentVolume>, UpstreamError>;

    async fn list_volumes(&self, window: &DateWindow) -> Result<Vec<ListVolume>, UpstreamError>;

    async fn create_activity_export(&self, window: &DateWindow)
        -> Result<ExportId, UpstreamError>;

    async fn export_status(&self, id: &ExportId) -> Result<ExportStatus, UpstreamError>;

    /// CSV body of a finished export.
    async fn fetch_export(&self, id: &ExportId) -> Result<String, UpstreamError>;

    async fn delete_export(&self, id: &ExportId) -> Result<(), UpstreamError>;
}

/// Bounds an upstream call by `deadline`.
pub async fn with_deadline<T, Fut>(deadline: Duration, call: Fut) -> Result<T, UpstreamError>
where
    Fut: Future<Output = Result<T, UpstreamError>>,
{
    match tokio::time::timeout(deadline, call).await {
        Ok(result) => result,
        Err(_) => Err(UpstreamError::Timeout(deadline)),
    }
}

/// Runs `call` under `deadline`, retrying once after a backoff delay when the
/// first failure is transient. Client errors are returned immediately.
pub async fn call_with_retry<T, F, Fut>(
    name: &str,
    deadline: Duration,
    backoff: BackoffConfig,
    mut call: F,
) -> Result<T, UpstreamError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, UpstreamError>>,
{
    let mut state = BackoffState::new(backoff);
    match with_deadline(deadline, call()).await {
        Ok(value) => Ok(value),
        Err(err) if err.is_transient() => {
            let delay = match &err {
                UpstreamError::RateLimited {
                    retry_after: Some(after),
                } => (*after).max(state.register_error()),
                _ => state.register_error(),
            };
            warn!("{name}: transient failure ({err}), retrying in {delay:?}");
            tokio::time::sleep(delay).await;
            with_deadline(deadline, call()).await
        }
        Err(err) => Err(err),
    }
}
