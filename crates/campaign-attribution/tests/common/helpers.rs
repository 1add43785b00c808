// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helper functions and fixtures for integration tests

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use campaign_attribution::cache::{Clock, ManualClock};
use campaign_attribution::model::{
    CampaignMeta, Click, Conversion, OfferPartnerRow, OfferTotal, PartnerClickRow, SegmentVolume,
};
use campaign_attribution::store::BlobStore;
use campaign_attribution::{
    AttributionConfig, Collector, IdentifierCodec, IdentifierTables, SendingApi, TrackingApi,
};
use chrono::NaiveDate;

use super::mocks::{FakeSending, FakeTracking};

pub const TAG_A: &str = "TDIH_407_3926_01262026_11111";
pub const TAG_B: &str = "TDIH_407_3926_01262026_22222";

pub fn day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 1, 26).unwrap()
}

pub fn codec() -> Arc<IdentifierCodec> {
    Arc::new(IdentifierCodec::new(IdentifierTables {
        partners: BTreeMap::from([
            ("P1".to_string(), "Partner One".to_string()),
            ("P2".to_string(), "Partner Two".to_string()),
        ]),
        ..Default::default()
    }))
}

/// Defaults with pacing disabled so tests do not sit on the call spacing.
pub fn test_config() -> AttributionConfig {
    AttributionConfig {
        call_spacing: Duration::ZERO,
        ..Default::default()
    }
}

pub fn click(sub1: &str, sub2: &str, date: NaiveDate) -> Click {
    Click {
        offer_id: "407".into(),
        sub1: sub1.into(),
        sub2: sub2.into(),
        date,
    }
}

pub fn conversion(id: &str, sub1: &str, sub2: &str, revenue: f64, date: NaiveDate) -> Conversion {
    Conversion {
        conversion_id: id.into(),
        offer_id: "407".into(),
        offer_name: "Mortgage Leads".into(),
        sub1: sub1.into(),
        sub2: sub2.into(),
        data_set: None,
        date,
        payout: revenue / 2.0,
        revenue,
    }
}

pub fn meta(mailing_id: &str, esp: &str, sent: u64) -> CampaignMeta {
    CampaignMeta {
        mailing_id: mailing_id.into(),
        name: format!("TDIH_407_Mortgage_01262026_{mailing_id}"),
        esp: esp.into(),
        list_id: None,
        sent,
        delivered: sent,
    }
}

fn cpm_row(sub2: &str, clicks: u64) -> OfferPartnerRow {
    OfferPartnerRow {
        offer_id: "900".into(),
        offer_name: "Daily CPM".into(),
        sub2: sub2.into(),
        clicks,
        conversions: 0,
        revenue: 0.0,
    }
}

fn total(offer_id: &str, offer_name: &str, conversions: u64, revenue: f64) -> OfferTotal {
    OfferTotal {
        offer_id: offer_id.into(),
        offer_name: offer_name.into(),
        clicks: 0,
        conversions,
        payout: revenue / 2.0,
        revenue,
    }
}

/// Two campaigns on one property, two partners, one CPA and one CPM offer.
/// Tracked revenue is 160 against an authoritative 600.
pub fn seed(tracking: &FakeTracking, sending: &FakeSending) {
    let today = day();
    *tracking.clicks.lock().unwrap() = vec![
        click(TAG_A, "P1_x", today),
        click(TAG_A, "P1_x", today),
        click(TAG_B, "P2_y", today),
    ];
    *tracking.conversions.lock().unwrap() = vec![
        conversion("c1", TAG_A, "P1_x", 100.0, today),
        conversion("c2", TAG_B, "P2_y", 60.0, today),
    ];
    *tracking.offer_partner.lock().unwrap() = vec![cpm_row("P1_x", 30), cpm_row("P2_y", 10)];
    *tracking.partner_clicks.lock().unwrap() = vec![
        PartnerClickRow {
            sub2: "P1_x".into(),
            clicks: 32,
            conversions: 1,
        },
        PartnerClickRow {
            sub2: "P2_y".into(),
            clicks: 11,
            conversions: 1,
        },
    ];
    *tracking.offer_totals.lock().unwrap() = vec![
        total("407", "Mortgage Leads", 2, 200.0),
        total("900", "Daily CPM", 0, 400.0),
    ];
    *sending.campaigns.lock().unwrap() =
        vec![meta("11111", "Sendly", 3_000), meta("22222", "Mailgrid", 1_000)];
    *sending.segments.lock().unwrap() = vec![
        SegmentVolume {
            segment_name: "P1_Openers".into(),
            sent: 3_000,
        },
        SegmentVolume {
            segment_name: "P2_Clickers".into(),
            sent: 1_000,
        },
    ];
    *sending.export_csv.lock().unwrap() =
        "email,segment_name\na@x.com,P1_Openers\nb@x.com,P1_Openers\nc@x.com,P2_Clickers\n"
            .to_string();
}

/// A collector over seeded fakes, with a manual clock for report TTLs.
pub struct Harness {
    pub tracking: Arc<FakeTracking>,
    pub sending: Arc<FakeSending>,
    pub clock: Arc<ManualClock>,
    pub collector: Collector,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_store(test_config(), None)
    }

    pub fn with_store(config: AttributionConfig, store: Option<Arc<dyn BlobStore>>) -> Self {
        let tracking = Arc::new(FakeTracking::default());
        let sending = Arc::new(FakeSending::default());
        seed(&tracking, &sending);
        let clock = Arc::new(ManualClock::new());
        let collector = Collector::with_parts(
            config,
            Arc::clone(&tracking) as Arc<dyn TrackingApi>,
            Arc::clone(&sending) as Arc<dyn SendingApi>,
            codec(),
            store,
            Arc::clone(&clock) as Arc<dyn Clock>,
        );
        Self {
            tracking,
            sending,
            clock,
            collector,
        }
    }
}

pub fn assert_close(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() <= 0.01,
        "{actual} is not within a cent of {expected}"
    );
}
