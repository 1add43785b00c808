// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Campaign, property and ESP views keyed off the sub1 tag.

use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;
use serde::Serialize;

use super::{ratio, PropertyKey, UnattributedReason};
use crate::constants::UNATTRIBUTED;
use crate::identifier::{IdentifierCodec, PropertyRef};
use crate::model::{CampaignMeta, CampaignReportRow, Click, Conversion};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CampaignRevenue {
    pub mailing_id: String,
    pub property: PropertyKey,
    pub property_name: Option<String>,
    pub offer_id: Option<String>,
    pub date: Option<NaiveDate>,
    pub campaign_name: Option<String>,
    pub esp: String,
    pub sent: Option<u64>,
    pub clicks: u64,
    pub conversions: u64,
    pub revenue: f64,
    pub payout: f64,
    pub conversion_rate: f64,
    pub epc: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PropertyPerformance {
    pub key: PropertyKey,
    pub name: String,
    pub campaigns: usize,
    pub clicks: u64,
    pub conversions: u64,
    pub revenue: f64,
    pub payout: f64,
    pub conversion_rate: f64,
    pub epc: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EspRevenuePerformance {
    pub esp: String,
    pub campaigns: usize,
    pub sent: u64,
    pub clicks: u64,
    pub conversions: u64,
    /// Revenue seen on tagged conversions before gap closing.
    pub reconstructed_revenue: f64,
    pub revenue: f64,
    pub reconciliation_adjustment: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct TagTally {
    clicks: u64,
    conversions: u64,
    revenue: f64,
    payout: f64,
}

impl TagTally {
    fn add(&mut self, other: &TagTally) {
        self.clicks += other.clicks;
        self.conversions += other.conversions;
        self.revenue += other.revenue;
        self.payout += other.payout;
    }
}

/// Where one sub1 tag lands.
#[derive(Debug, Clone, PartialEq)]
struct Classified {
    property: PropertyKey,
    property_name: Option<String>,
    mailing_id: Option<String>,
    offer_id: Option<String>,
    date: Option<NaiveDate>,
    needs_lookup: bool,
}

pub(crate) struct CampaignViews {
    pub campaigns: BTreeMap<String, CampaignRevenue>,
    pub properties: BTreeMap<PropertyKey, PropertyPerformance>,
    pub esps: BTreeMap<String, EspRevenuePerformance>,
    pub pending_lookups: Vec<String>,
}

pub(crate) fn build_campaign_views(
    codec: &IdentifierCodec,
    clicks: &[Click],
    conversions: &[Conversion],
    report: &[CampaignReportRow],
    meta: &BTreeMap<String, CampaignMeta>,
    resolved: &BTreeMap<String, PropertyRef>,
) -> CampaignViews {
    let tags = tally_by_tag(clicks, conversions, report);

    let mut campaigns: BTreeMap<String, CampaignRevenue> = BTreeMap::new();
    let mut properties: BTreeMap<PropertyKey, (PropertyPerformance, BTreeSet<String>)> =
        BTreeMap::new();
    let mut esps: BTreeMap<String, EspRevenuePerformance> = BTreeMap::new();
    let mut pending: BTreeSet<String> = BTreeSet::new();

    for (tag, tally) in &tags {
        let classified = classify(codec, tag, meta, resolved);
        if classified.needs_lookup {
            if let Some(mailing_id) = &classified.mailing_id {
                pending.insert(mailing_id.clone());
            }
        }

        let (property, mailing_ids) = properties
            .entry(classified.property.clone())
            .or_insert_with(|| {
                let name = match &classified.property {
                    PropertyKey::Known(code) => {
                        classified.property_name.clone().unwrap_or_else(|| code.clone())
                    }
                    PropertyKey::Unattributed(reason) => reason.label().to_string(),
                };
                (PropertyPerformance::empty(classified.property.clone(), name), BTreeSet::new())
            });
        property.clicks += tally.clicks;
        property.conversions += tally.conversions;
        property.revenue += tally.revenue;
        property.payout += tally.payout;

        let campaign_meta = classified.mailing_id.as_ref().and_then(|id| meta.get(id));
        let esp_name = campaign_meta
            .map(|m| m.esp.clone())
            .filter(|esp| !esp.trim().is_empty())
            .unwrap_or_else(|| UNATTRIBUTED.to_string());
        let esp = esps
            .entry(esp_name.clone())
            .or_insert_with(|| EspRevenuePerformance::empty(&esp_name));
        esp.clicks += tally.clicks;
        esp.conversions += tally.conversions;
        esp.reconstructed_revenue += tally.revenue;

        let Some(mailing_id) = classified.mailing_id.clone() else {
            continue;
        };
        mailing_ids.insert(mailing_id.clone());
        let campaign = campaigns.entry(mailing_id.clone()).or_insert_with(|| {
            esp.campaigns += 1;
            esp.sent += campaign_meta.map(|m| m.sent).unwrap_or_default();
            CampaignRevenue {
                mailing_id,
                property: classified.property.clone(),
                property_name: classified.property_name.clone(),
                offer_id: classified.offer_id.clone(),
                date: classified.date,
                campaign_name: campaign_meta.map(|m| m.name.clone()),
                esp: esp_name.clone(),
                sent: campaign_meta.map(|m| m.sent),
                clicks: 0,
                conversions: 0,
                revenue: 0.0,
                payout: 0.0,
                conversion_rate: 0.0,
                epc: 0.0,
            }
        });
        campaign.clicks += tally.clicks;
        campaign.conversions += tally.conversions;
        campaign.revenue += tally.revenue;
        campaign.payout += tally.payout;
    }

    for campaign in campaigns.values_mut() {
        campaign.conversion_rate = ratio(campaign.conversions as f64, campaign.clicks);
        campaign.epc = ratio(campaign.revenue, campaign.clicks);
    }
    for esp in esps.values_mut() {
        esp.revenue = esp.reconstructed_revenue;
    }

    CampaignViews {
        campaigns,
        properties: properties
            .into_iter()
            .map(|(key, (mut property, mailing_ids))| {
                property.campaigns = mailing_ids.len();
                property.conversion_rate = ratio(property.conversions as f64, property.clicks);
                property.epc = ratio(property.revenue, property.clicks);
                (key, property)
            })
            .collect(),
        esps,
        pending_lookups: pending.into_iter().collect(),
    }
}

/// Raw clicks and conversions per trimmed sub1 tag. Report rows only fill in
/// tags absent from the raw records, so nothing is counted twice.
fn tally_by_tag(
    clicks: &[Click],
    conversions: &[Conversion],
    report: &[CampaignReportRow],
) -> BTreeMap<String, TagTally> {
    let mut tags: BTreeMap<String, TagTally> = BTreeMap::new();
    for click in clicks {
        tags.entry(click.sub1.trim().to_string()).or_default().clicks += 1;
    }
    for conversion in conversions {
        let tally = tags.entry(conversion.sub1.trim().to_string()).or_default();
        tally.conversions += 1;
        tally.revenue += conversion.revenue;
        tally.payout += conversion.payout;
    }

    let raw: BTreeSet<String> = tags.keys().cloned().collect();
    for row in report {
        let tag = row.sub1.trim();
        if raw.contains(tag) {
            continue;
        }
        tags.entry(tag.to_string()).or_default().add(&TagTally {
            clicks: row.clicks,
            conversions: row.conversions,
            revenue: row.revenue,
            payout: 0.0,
        });
    }
    tags
}

/// Known properties win outright. Otherwise the campaign needs a mailing id to
/// be looked up, first in already resolved lookups and then in the campaign
/// name of the sending-platform metadata.
fn classify(
    codec: &IdentifierCodec,
    tag: &str,
    meta: &BTreeMap<String, CampaignMeta>,
    resolved: &BTreeMap<String, PropertyRef>,
) -> Classified {
    let unattributed = |reason| Classified {
        property: PropertyKey::Unattributed(reason),
        property_name: None,
        mailing_id: None,
        offer_id: None,
        date: None,
        needs_lookup: false,
    };
    if tag.is_empty() {
        return unattributed(UnattributedReason::EmptyTag);
    }
    let Ok(parsed) = codec.parse_sub1(tag) else {
        return unattributed(UnattributedReason::ParseFailure);
    };

    let mut classified = Classified {
        property: PropertyKey::Unattributed(UnattributedReason::MissingMailingId),
        property_name: None,
        mailing_id: parsed.mailing_id.clone(),
        offer_id: parsed.offer_id.clone(),
        date: parsed.date,
        needs_lookup: false,
    };
    let property = match (&parsed.property, &parsed.mailing_id) {
        (PropertyRef::Known { .. }, _) => Some(parsed.property.clone()),
        (_, None) => return classified,
        (_, Some(mailing_id)) => resolved.get(mailing_id).cloned().or_else(|| {
            meta.get(mailing_id)
                .and_then(|m| codec.parse_campaign_name(&m.name).property)
        }),
    };

    match property {
        Some(PropertyRef::Known { code, name }) => {
            classified.property = PropertyKey::Known(code);
            classified.property_name = Some(name);
        }
        _ => {
            classified.property = PropertyKey::Unattributed(UnattributedReason::UnknownProperty);
            classified.needs_lookup = true;
        }
    }
    classified
}

impl PropertyPerformance {
    fn empty(key: PropertyKey, name: String) -> Self {
        Self {
            key,
            name,
            campaigns: 0,
            clicks: 0,
            conversions: 0,
            revenue: 0.0,
            payout: 0.0,
            conversion_rate: 0.0,
            epc: 0.0,
        }
    }
}

impl EspRevenuePerformance {
    fn empty(esp: &str) -> Self {
        Self {
            esp: esp.to_string(),
            campaigns: 0,
            sent: 0,
            clicks: 0,
            conversions: 0,
            reconstructed_revenue: 0.0,
            revenue: 0.0,
            reconciliation_adjustment: 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::IdentifierTables;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 1, 26).unwrap()
    }

    fn click(sub1: &str) -> Click {
        Click {
            offer_id: "407".into(),
            sub1: sub1.into(),
            sub2: String::new(),
            date: day(),
        }
    }

    fn conversion(sub1: &str, revenue: f64) -> Conversion {
        Conversion {
            conversion_id: format!("{sub1}-{revenue}"),
            offer_id: "407".into(),
            offer_name: "Mortgage Leads".into(),
            sub1: sub1.into(),
            sub2: String::new(),
            data_set: None,
            date: day(),
            payout: 0.0,
            revenue,
        }
    }

    fn views(
        clicks: &[Click],
        conversions: &[Conversion],
        report: &[CampaignReportRow],
        meta: &BTreeMap<String, CampaignMeta>,
    ) -> CampaignViews {
        build_campaign_views(
            &IdentifierCodec::new(IdentifierTables::default()),
            clicks,
            conversions,
            report,
            meta,
            &BTreeMap::new(),
        )
    }

    #[test]
    fn test_campaign_rates() {
        let tag = "TDIH_407_3926_01262026_A";
        let views = views(
            &[click(tag), click(tag)],
            &[conversion(tag, 225.0)],
            &[],
            &BTreeMap::new(),
        );
        let campaign = &views.campaigns["A"];
        assert_eq!(campaign.clicks, 2);
        assert_eq!(campaign.conversions, 1);
        assert_eq!(campaign.revenue, 225.0);
        assert_eq!(campaign.conversion_rate, 0.5);
        assert_eq!(campaign.epc, 112.5);
        assert_eq!(campaign.property, PropertyKey::Known("TDIH".into()));
        assert_eq!(campaign.esp, UNATTRIBUTED);

        let property = &views.properties[&PropertyKey::Known("TDIH".into())];
        assert_eq!(property.name, "This Day In History");
        assert_eq!(property.campaigns, 1);
    }

    #[test]
    fn test_unattributed_reasons_stay_separate() {
        let views = views(
            &[
                click(""),
                click("single"),
                click("TDIH_407_12"),
                click("ZZZ_407_01262026_77777"),
            ],
            &[],
            &[],
            &BTreeMap::new(),
        );
        for reason in [
            UnattributedReason::EmptyTag,
            UnattributedReason::ParseFailure,
            UnattributedReason::UnknownProperty,
        ] {
            assert_eq!(views.properties[&PropertyKey::Unattributed(reason)].clicks, 1);
        }
        // Known property without a mailing id still counts for the property.
        assert_eq!(views.properties[&PropertyKey::Known("TDIH".into())].clicks, 1);
        assert_eq!(views.pending_lookups, vec!["77777".to_string()]);
    }

    #[test]
    fn test_report_only_fills_missing_tags() {
        let tag = "TDIH_407_01262026_11111";
        let report = vec![
            CampaignReportRow { sub1: tag.into(), clicks: 50, conversions: 5, revenue: 500.0 },
            CampaignReportRow {
                sub1: "TDIH_407_01262026_22222".into(),
                clicks: 4,
                conversions: 1,
                revenue: 30.0,
            },
        ];
        let views = views(&[click(tag)], &[], &report, &BTreeMap::new());
        assert_eq!(views.campaigns["11111"].clicks, 1);
        assert_eq!(views.campaigns["11111"].revenue, 0.0);
        assert_eq!(views.campaigns["22222"].clicks, 4);
        assert_eq!(views.campaigns["22222"].revenue, 30.0);
    }

    #[test]
    fn test_unknown_property_resolved_from_campaign_name() {
        let meta = BTreeMap::from([(
            "77777".to_string(),
            CampaignMeta {
                mailing_id: "77777".into(),
                name: "TDIH_407_Mortgage_01262026_Openers".into(),
                esp: "Sendly".into(),
                list_id: None,
                sent: 1_000,
                delivered: 990,
            },
        )]);
        let tag = "407_3926_01262026_77777";
        let views = views(&[click(tag)], &[conversion(tag, 10.0)], &[], &meta);
        let campaign = &views.campaigns["77777"];
        assert_eq!(campaign.property, PropertyKey::Known("TDIH".into()));
        assert_eq!(campaign.esp, "Sendly");
        assert_eq!(campaign.sent, Some(1_000));
        assert!(views.pending_lookups.is_empty());
        assert_eq!(views.esps["Sendly"].sent, 1_000);
        assert_eq!(views.esps["Sendly"].reconstructed_revenue, 10.0);
    }
}
