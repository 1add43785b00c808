// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-process fakes of the tracking network and the sending platform

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use campaign_attribution::errors::UpstreamError;
use campaign_attribution::model::{
    CampaignMeta, CampaignReportRow, Click, Conversion, ConversionPage, DateWindow, ExportId,
    ExportStatus, ListVolume, OfferPartnerRow, OfferTotal, PartnerClickRow, SegmentVolume,
};
use campaign_attribution::upstream::{SendingApi, TrackingApi};

/// Call counting plus scripted failures, keyed by method name.
#[derive(Default)]
pub struct Script {
    calls: Mutex<HashMap<&'static str, usize>>,
    failures: Mutex<HashMap<&'static str, VecDeque<UpstreamError>>>,
}

impl Script {
    pub fn fail_next(&self, call: &'static str, error: UpstreamError) {
        self.failures
            .lock()
            .unwrap()
            .entry(call)
            .or_default()
            .push_back(error);
    }

    pub fn calls(&self, call: &'static str) -> usize {
        self.calls.lock().unwrap().get(call).copied().unwrap_or_default()
    }

    fn enter(&self, call: &'static str) -> Result<(), UpstreamError> {
        *self.calls.lock().unwrap().entry(call).or_default() += 1;
        match self.failures.lock().unwrap().get_mut(call).and_then(VecDeque::pop_front) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[derive(Default)]
pub struct FakeTracking {
    pub script: Script,
    pub clicks: Mutex<Vec<Click>>,
    pub conversions: Mutex<Vec<Conversion>>,
    pub campaign_report: Mutex<Vec<CampaignReportRow>>,
    pub offer_partner: Mutex<Vec<OfferPartnerRow>>,
    pub partner_clicks: Mutex<Vec<PartnerClickRow>>,
    pub offer_totals: Mutex<Vec<OfferTotal>>,
}

#[async_trait::async_trait]
impl TrackingApi for FakeTracking {
    async fn clicks(&self, window: &DateWindow) -> Result<Vec<Click>, UpstreamError> {
        self.script.enter("clicks")?;
        let clicks = self.clicks.lock().unwrap();
        Ok(clicks.iter().filter(|c| window.contains(c.date)).cloned().collect())
    }

    async fn conversions_page(
        &self,
        window: &DateWindow,
        page: u32,
        page_size: u32,
    ) -> Result<ConversionPage, UpstreamError> {
        self.script.enter("conversions")?;
        let all: Vec<Conversion> = self
            .conversions
            .lock()
            .unwrap()
            .iter()
            .filter(|c| window.contains(c.date))
            .cloned()
            .collect();
        let start = ((page - 1) * page_size) as usize;
        let end = (start + page_size as usize).min(all.len());
        Ok(ConversionPage {
            conversions: all.get(start..end).map(<[Conversion]>::to_vec).unwrap_or_default(),
            next_page: (end < all.len()).then_some(page + 1),
        })
    }

    async fn campaign_report(
        &self,
        _window: &DateWindow,
    ) -> Result<Vec<CampaignReportRow>, UpstreamError> {
        self.script.enter("campaign_report")?;
        Ok(self.campaign_report.lock().unwrap().clone())
    }

    async fn offer_partner_report(
        &self,
        _window: &DateWindow,
    ) -> Result<Vec<OfferPartnerRow>, UpstreamError> {
        self.script.enter("offer_partner")?;
        Ok(self.offer_partner.lock().unwrap().clone())
    }

    async fn partner_clicks(
        &self,
        _window: &DateWindow,
    ) -> Result<Vec<PartnerClickRow>, UpstreamError> {
        self.script.enter("partner_clicks")?;
        Ok(self.partner_clicks.lock().unwrap().clone())
    }

    async fn offer_totals(&self, _window: &DateWindow) -> Result<Vec<OfferTotal>, UpstreamError> {
        self.script.enter("offer_totals")?;
        Ok(self.offer_totals.lock().unwrap().clone())
    }
}

#[derive(Default)]
pub struct FakeSending {
    pub script: Script,
    pub campaigns: Mutex<Vec<CampaignMeta>>,
    /// Answers to single-campaign lookups.
    pub lookups: Mutex<Vec<CampaignMeta>>,
    pub segments: Mutex<Vec<SegmentVolume>>,
    pub lists: Mutex<Vec<ListVolume>>,
    pub export_csv: Mutex<String>,
    /// Status polls answered `Pending` before the export is `Ready`.
    pub pending_polls: AtomicUsize,
    /// Once the pending polls run out, report `Failed` instead of `Ready`.
    pub export_fails: AtomicBool,
    pub deleted: Mutex<Vec<ExportId>>,
}

#[async_trait::async_trait]
impl SendingApi for FakeSending {
    async fn campaigns(&self, _window: &DateWindow) -> Result<Vec<CampaignMeta>, UpstreamError> {
        self.script.enter("campaigns")?;
        Ok(self.campaigns.lock().unwrap().clone())
    }

    async fn campaign(&self, mailing_id: &str) -> Result<Option<CampaignMeta>, UpstreamError> {
        self.script.enter("campaign")?;
        let lookups = self.lookups.lock().unwrap();
        Ok(lookups.iter().find(|c| c.mailing_id == mailing_id).cloned())
    }

    async fn segment_volumes(
        &self,
        _window: &DateWindow,
    ) -> Result<Vec<SegmentVolume>, UpstreamError> {
        self.script.enter("segment_volumes")?;
        Ok(self.segments.lock().unwrap().clone())
    }

    async fn list_volumes(&self, _window: &DateWindow) -> Result<Vec<ListVolume>, UpstreamError> {
        self.script.enter("list_volumes")?;
        Ok(self.lists.lock().unwrap().clone())
    }

    async fn create_activity_export(
        &self,
        window: &DateWindow,
    ) -> Result<ExportId, UpstreamError> {
        self.script.enter("create_export")?;
        Ok(ExportId(format!("export-{}", window.cache_key())))
    }

    async fn export_status(&self, _id: &ExportId) -> Result<ExportStatus, UpstreamError> {
        self.script.enter("export_status")?;
        let remaining = self.pending_polls.load(Ordering::SeqCst);
        if remaining > 0 {
            self.pending_polls.store(remaining - 1, Ordering::SeqCst);
            return Ok(ExportStatus::Pending);
        }
        if self.export_fails.load(Ordering::SeqCst) {
            return Ok(ExportStatus::Failed);
        }
        Ok(ExportStatus::Ready)
    }

    async fn fetch_export(&self, _id: &ExportId) -> Result<String, UpstreamError> {
        self.script.enter("fetch_export")?;
        Ok(self.export_csv.lock().unwrap().clone())
    }

    async fn delete_export(&self, id: &ExportId) -> Result<(), UpstreamError> {
        self.script.enter("delete_export")?;
        self.deleted.lock().unwrap().push(id.clone());
        Ok(())
    }
}
