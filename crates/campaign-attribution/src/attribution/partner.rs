// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Data-partner revenue: CPA from conversions, CPM from click share.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::Serialize;
use tracing::warn;

use super::offer::PricingModel;
use crate::identifier::{IdentifierCodec, Partner};
use crate::model::{Conversion, OfferPartnerRow, OfferTotal};
use crate::volume::VolumeSource;

/// Data-set key used when a conversion carries no data-set code at all.
pub const NO_DATA_SET: &str = "(none)";

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PartnerTally {
    pub clicks: u64,
    pub conversions: u64,
    pub payout: f64,
    pub revenue: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataPartnerPerformance {
    pub prefix: String,
    pub name: String,
    pub clicks: u64,
    pub conversions: u64,
    pub payout: f64,
    pub cpa_revenue: f64,
    pub cpm_revenue: f64,
    pub reconciliation_adjustment: f64,
    /// CPA + CPM + reconciliation adjustment.
    pub revenue: f64,
    pub sent: Option<u64>,
    pub volume_source: Option<VolumeSource>,
    /// Revenue per thousand sends, when volume is known.
    pub rpm: Option<f64>,
    pub daily: BTreeMap<NaiveDate, PartnerTally>,
    pub by_offer: BTreeMap<String, PartnerTally>,
    pub by_data_set: BTreeMap<String, PartnerTally>,
}

impl DataPartnerPerformance {
    pub(crate) fn new(partner: &Partner) -> Self {
        Self {
            prefix: partner.prefix.clone(),
            name: partner.name.clone(),
            clicks: 0,
            conversions: 0,
            payout: 0.0,
            cpa_revenue: 0.0,
            cpm_revenue: 0.0,
            reconciliation_adjustment: 0.0,
            revenue: 0.0,
            sent: None,
            volume_source: None,
            rpm: None,
            daily: BTreeMap::new(),
            by_offer: BTreeMap::new(),
            by_data_set: BTreeMap::new(),
        }
    }

    pub(crate) fn attributed_revenue(&self) -> f64 {
        self.cpa_revenue + self.cpm_revenue
    }
}

/// Outcome of CPM attribution across all CPM offers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CpmOutcome {
    pub attributed: f64,
    /// Revenue of CPM offers not matched to any partner click.
    pub unattributed: f64,
    pub warnings: Vec<String>,
}

pub(crate) struct PartnerViews {
    pub partners: BTreeMap<String, DataPartnerPerformance>,
    pub excluded_email_hash_revenue: f64,
    pub cpm: CpmOutcome,
}

pub(crate) fn build_partner_views(
    codec: &IdentifierCodec,
    conversions: &[Conversion],
    cross_tab: &[OfferPartnerRow],
    totals: &[OfferTotal],
) -> PartnerViews {
    let cpm_offers: BTreeMap<&str, &OfferTotal> = totals
        .iter()
        .filter(|t| PricingModel::from_offer_name(&t.offer_name) == PricingModel::Cpm)
        .map(|t| (t.offer_id.as_str(), t))
        .collect();

    let mut partners: BTreeMap<String, DataPartnerPerformance> = BTreeMap::new();
    let mut excluded_email_hash_revenue = 0.0;

    for row in cross_tab {
        let Some(partner) = codec.parse_sub2(&row.sub2).and_then(|p| p.partner) else {
            continue;
        };
        let entry = partners
            .entry(partner.prefix.clone())
            .or_insert_with(|| DataPartnerPerformance::new(&partner));
        entry.clicks += row.clicks;
        entry.by_offer.entry(row.offer_id.clone()).or_default().clicks += row.clicks;
    }

    for conversion in conversions {
        if cpm_offers.contains_key(conversion.offer_id.as_str())
            || PricingModel::from_offer_name(&conversion.offer_name) == PricingModel::Cpm
        {
            continue;
        }
        let Some((partner, data_set)) = conversion_partner(codec, conversion) else {
            excluded_email_hash_revenue += conversion.revenue;
            continue;
        };
        let entry = partners
            .entry(partner.prefix.clone())
            .or_insert_with(|| DataPartnerPerformance::new(&partner));
        entry.conversions += 1;
        entry.payout += conversion.payout;
        entry.cpa_revenue += conversion.revenue;
        for tally in [
            entry.daily.entry(conversion.date).or_default(),
            entry.by_offer.entry(conversion.offer_id.clone()).or_default(),
            entry.by_data_set.entry(data_set).or_default(),
        ] {
            tally.conversions += 1;
            tally.payout += conversion.payout;
            tally.revenue += conversion.revenue;
        }
    }

    let cpm = attribute_cpm(codec, &cpm_offers, cross_tab, &mut partners);
    for partner in partners.values_mut() {
        partner.revenue = partner.attributed_revenue();
    }

    PartnerViews {
        partners,
        excluded_email_hash_revenue,
        cpm,
    }
}

/// Partner and data-set key credited with a conversion. `None` for email hashes.
///
/// A nil sub2 falls back to the data set carried forward from the click, and
/// then to the default internal partner.
fn conversion_partner(
    codec: &IdentifierCodec,
    conversion: &Conversion,
) -> Option<(Partner, String)> {
    let parsed = codec.parse_sub2(&conversion.sub2).or_else(|| {
        conversion
            .data_set
            .as_deref()
            .and_then(|data_set| codec.parse_sub2(data_set))
    });
    match parsed {
        Some(parsed) => {
            let partner = parsed.partner?;
            Some((partner, parsed.data_set_code))
        }
        None => Some((codec.default_partner(), NO_DATA_SET.to_string())),
    }
}

/// Splits each CPM offer's revenue by the partners' share of its clicks.
fn attribute_cpm(
    codec: &IdentifierCodec,
    cpm_offers: &BTreeMap<&str, &OfferTotal>,
    cross_tab: &[OfferPartnerRow],
    partners: &mut BTreeMap<String, DataPartnerPerformance>,
) -> CpmOutcome {
    let mut outcome = CpmOutcome::default();
    for (offer_id, offer) in cpm_offers {
        if offer.revenue == 0.0 {
            continue;
        }
        let rows: Vec<&OfferPartnerRow> =
            cross_tab.iter().filter(|r| r.offer_id == *offer_id).collect();
        let total_clicks: u64 = rows.iter().map(|r| r.clicks).sum();
        if total_clicks == 0 {
            let warning = format!(
                "CPM offer {offer_id} ({}) has revenue {:.2} but no observed clicks",
                offer.offer_name, offer.revenue
            );
            warn!("{warning}");
            outcome.warnings.push(warning);
            outcome.unattributed += offer.revenue;
            continue;
        }

        let mut credited = 0.0;
        for row in rows {
            let Some(partner) = codec.parse_sub2(&row.sub2).and_then(|p| p.partner) else {
                continue;
            };
            let share = offer.revenue * row.clicks as f64 / total_clicks as f64;
            let entry = partners
                .entry(partner.prefix.clone())
                .or_insert_with(|| DataPartnerPerformance::new(&partner));
            entry.cpm_revenue += share;
            entry.by_offer.entry(offer_id.to_string()).or_default().revenue += share;
            credited += share;
        }
        outcome.attributed += credited;
        outcome.unattributed += offer.revenue - credited;
    }
    outcome
}
