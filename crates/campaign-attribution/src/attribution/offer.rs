// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;

use serde::Serialize;

use super::ratio;
use crate::constants::CPM_MARKER;
use crate::model::{Conversion, OfferTotal};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PricingModel {
    /// Paid per conversion event.
    Cpa,
    /// Paid per thousand impressions; no conversion events exist.
    Cpm,
}

impl PricingModel {
    pub fn from_offer_name(name: &str) -> Self {
        if name.to_ascii_uppercase().contains(CPM_MARKER) {
            PricingModel::Cpm
        } else {
            PricingModel::Cpa
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OfferPerformance {
    pub offer_id: String,
    pub offer_name: String,
    pub pricing: PricingModel,
    pub clicks: u64,
    pub conversions: u64,
    pub payout: f64,
    /// Authoritative revenue when the offer report has the offer, else conversion revenue.
    pub revenue: f64,
    pub conversion_revenue: f64,
    pub has_authoritative_total: bool,
    pub conversion_rate: f64,
    pub epc: f64,
}

pub(crate) fn build_offers(
    totals: &[OfferTotal],
    conversions: &[Conversion],
) -> BTreeMap<String, OfferPerformance> {
    let mut offers: BTreeMap<String, OfferPerformance> = BTreeMap::new();
    for total in totals {
        let offer = offers
            .entry(total.offer_id.clone())
            .or_insert_with(|| OfferPerformance::empty(&total.offer_id, &total.offer_name));
        offer.has_authoritative_total = true;
        offer.clicks += total.clicks;
        offer.conversions += total.conversions;
        offer.payout += total.payout;
        offer.revenue += total.revenue;
    }

    for conversion in conversions {
        let offer = offers
            .entry(conversion.offer_id.clone())
            .or_insert_with(|| {
                OfferPerformance::empty(&conversion.offer_id, &conversion.offer_name)
            });
        offer.conversion_revenue += conversion.revenue;
        if !offer.has_authoritative_total {
            offer.conversions += 1;
            offer.payout += conversion.payout;
            offer.revenue += conversion.revenue;
        }
    }

    for offer in offers.values_mut() {
        offer.conversion_rate = ratio(offer.conversions as f64, offer.clicks);
        offer.epc = ratio(offer.revenue, offer.clicks);
    }
    offers
}

impl OfferPerformance {
    fn empty(offer_id: &str, offer_name: &str) -> Self {
        Self {
            offer_id: offer_id.to_string(),
            offer_name: offer_name.to_string(),
            pricing: PricingModel::from_offer_name(offer_name),
            clicks: 0,
            conversions: 0,
            payout: 0.0,
            revenue: 0.0,
            conversion_revenue: 0.0,
            has_authoritative_total: false,
            conversion_rate: 0.0,
            epc: 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_pricing_model() {
        assert_eq!(PricingModel::from_offer_name("Solar CPM Jan"), PricingModel::Cpm);
        assert_eq!(PricingModel::from_offer_name("newsletter cpm"), PricingModel::Cpm);
        assert_eq!(PricingModel::from_offer_name("Mortgage Leads"), PricingModel::Cpa);
    }

    #[test]
    fn test_offers_prefer_authoritative_totals() {
        let totals = vec![OfferTotal {
            offer_id: "407".into(),
            offer_name: "Mortgage Leads".into(),
            clicks: 10,
            conversions: 2,
            payout: 100.0,
            revenue: 500.0,
        }];
        let conversion = |offer_id: &str, revenue: f64| Conversion {
            conversion_id: format!("c-{offer_id}-{revenue}"),
            offer_id: offer_id.into(),
            offer_name: "Other".into(),
            sub1: String::new(),
            sub2: String::new(),
            data_set: None,
            date: NaiveDate::from_ymd_opt(2026, 1, 5).unwrap(),
            payout: 10.0,
            revenue,
        };
        let offers = build_offers(&totals, &[conversion("407", 225.0), conversion("512", 40.0)]);

        let known = &offers["407"];
        assert!(known.has_authoritative_total);
        assert_eq!(known.revenue, 500.0);
        assert_eq!(known.conversion_revenue, 225.0);
        assert_eq!(known.conversions, 2);
        assert_eq!(known.epc, 50.0);

        let orphan = &offers["512"];
        assert!(!orphan.has_authoritative_total);
        assert_eq!(orphan.revenue, 40.0);
        assert_eq!(orphan.conversions, 1);
        assert_eq!(orphan.epc, 0.0);
    }
}
