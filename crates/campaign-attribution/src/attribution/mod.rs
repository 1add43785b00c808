// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Revenue attribution.
//!
//! [`AttributionEngine::build`] is a pure function of its inputs: every view is
//! recomputed from the raw slices each cycle and returned as one
//! [`AttributionSnapshot`] for the collector to swap in.

mod campaign;
mod offer;
mod partner;
mod reconcile;
mod resolve;
mod summary;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::constants::UNATTRIBUTED;
use crate::identifier::{IdentifierCodec, Partner, PropertyRef};
use crate::model::{
    CampaignMeta, CampaignReportRow, Click, Conversion, OfferPartnerRow, OfferTotal,
};
use crate::volume::VolumeResolution;

pub use campaign::{CampaignRevenue, EspRevenuePerformance, PropertyPerformance};
pub use offer::{OfferPerformance, PricingModel};
pub use partner::{CpmOutcome, DataPartnerPerformance, PartnerTally, NO_DATA_SET};
pub use reconcile::{reconcile, ReconciliationMethod, ReconciliationReport};
pub use resolve::{LookupSummary, PropertyLookupConfig, PropertyResolver};
pub use summary::MonthlySummary;

/// Why revenue could not be tied to a known property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum UnattributedReason {
    EmptyTag,
    ParseFailure,
    MissingMailingId,
    UnknownProperty,
}

impl UnattributedReason {
    pub fn label(self) -> &'static str {
        match self {
            UnattributedReason::EmptyTag => "No Tag",
            UnattributedReason::ParseFailure => "Unparseable Tag",
            UnattributedReason::MissingMailingId => "Missing Mailing ID",
            UnattributedReason::UnknownProperty => "Unknown Property",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum PropertyKey {
    Known(String),
    Unattributed(UnattributedReason),
}

impl PropertyKey {
    pub fn is_known(&self) -> bool {
        matches!(self, PropertyKey::Known(_))
    }
}

impl fmt::Display for PropertyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyKey::Known(code) => f.write_str(code),
            PropertyKey::Unattributed(reason) => write!(f, "{UNATTRIBUTED}: {}", reason.label()),
        }
    }
}

/// Everything one build consumes.
#[derive(Debug, Clone, Copy)]
pub struct AttributionInput<'a> {
    pub clicks: &'a [Click],
    pub conversions: &'a [Conversion],
    pub campaign_report: &'a [CampaignReportRow],
    pub offer_partner: &'a [OfferPartnerRow],
    pub offer_totals: &'a [OfferTotal],
    pub campaigns: &'a [CampaignMeta],
    /// Properties recovered by secondary lookup, keyed by mailing id.
    pub resolved_properties: &'a BTreeMap<String, PropertyRef>,
    pub volume: Option<&'a VolumeResolution>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttributionSnapshot {
    pub campaigns: BTreeMap<String, CampaignRevenue>,
    pub properties: BTreeMap<PropertyKey, PropertyPerformance>,
    pub offers: BTreeMap<String, OfferPerformance>,
    pub esps: BTreeMap<String, EspRevenuePerformance>,
    pub data_partners: BTreeMap<String, DataPartnerPerformance>,
    pub monthly: Vec<MonthlySummary>,
    pub esp_reconciliation: ReconciliationReport,
    pub partner_reconciliation: ReconciliationReport,
    pub excluded_email_hash_revenue: f64,
    /// Mailing ids still waiting on a property lookup.
    pub pending_property_lookups: Vec<String>,
    pub volume: Option<VolumeResolution>,
}

#[derive(Debug, Clone)]
pub struct AttributionEngine {
    codec: Arc<IdentifierCodec>,
}

impl AttributionEngine {
    pub fn new(codec: Arc<IdentifierCodec>) -> Self {
        Self { codec }
    }

    pub fn build(&self, input: &AttributionInput<'_>) -> AttributionSnapshot {
        let meta: BTreeMap<String, CampaignMeta> = input
            .campaigns
            .iter()
            .map(|m| (m.mailing_id.clone(), m.clone()))
            .collect();

        let campaign::CampaignViews {
            campaigns,
            properties,
            mut esps,
            pending_lookups,
        } = campaign::build_campaign_views(
            &self.codec,
            input.clicks,
            input.conversions,
            input.campaign_report,
            &meta,
            input.resolved_properties,
        );
        let partner::PartnerViews {
            partners: mut data_partners,
            excluded_email_hash_revenue,
            cpm,
        } = partner::build_partner_views(
            &self.codec,
            input.conversions,
            input.offer_partner,
            input.offer_totals,
        );
        let offers = offer::build_offers(input.offer_totals, input.conversions);

        let authoritative = (!input.offer_totals.is_empty())
            .then(|| input.offer_totals.iter().map(|t| t.revenue).sum::<f64>());
        let esp_reconciliation = self.reconcile_esps(authoritative, &mut esps, &cpm);
        let partner_reconciliation =
            self.reconcile_partners(authoritative, &mut data_partners, input.volume, &cpm);

        debug!(
            "built attribution: {} campaigns, {} properties, {} partners, {} esps",
            campaigns.len(),
            properties.len(),
            data_partners.len(),
            esps.len()
        );
        AttributionSnapshot {
            campaigns,
            properties,
            offers,
            esps,
            data_partners,
            monthly: summary::monthly_summaries(input.conversions),
            esp_reconciliation,
            partner_reconciliation,
            excluded_email_hash_revenue,
            pending_property_lookups: pending_lookups,
            volume: input.volume.cloned(),
        }
    }

    fn reconcile_esps(
        &self,
        authoritative: Option<f64>,
        esps: &mut BTreeMap<String, EspRevenuePerformance>,
        cpm: &CpmOutcome,
    ) -> ReconciliationReport {
        let Some(authoritative) = authoritative else {
            return unreconciled(esps.values().map(|e| e.reconstructed_revenue).sum(), cpm);
        };
        let mut revenue: BTreeMap<String, f64> = esps
            .iter()
            .map(|(name, esp)| (name.clone(), esp.reconstructed_revenue))
            .collect();
        let volume: BTreeMap<String, u64> = esps
            .iter()
            .map(|(name, esp)| (name.clone(), esp.sent))
            .collect();
        let mut report = reconcile(authoritative, &mut revenue, Some(&volume));

        for (name, value) in revenue {
            let esp = esps.entry(name.clone()).or_insert_with(|| EspRevenuePerformance {
                esp: name,
                campaigns: 0,
                sent: 0,
                clicks: 0,
                conversions: 0,
                reconstructed_revenue: 0.0,
                revenue: 0.0,
                reconciliation_adjustment: 0.0,
            });
            esp.revenue = value;
            esp.reconciliation_adjustment = value - esp.reconstructed_revenue;
        }
        report.unattributed_cpm = cpm.unattributed;
        report.warnings.extend(cpm.warnings.iter().cloned());
        report
    }

    fn reconcile_partners(
        &self,
        authoritative: Option<f64>,
        partners: &mut BTreeMap<String, DataPartnerPerformance>,
        volume: Option<&VolumeResolution>,
        cpm: &CpmOutcome,
    ) -> ReconciliationReport {
        if let Some(volume) = volume {
            for partner in partners.values_mut() {
                partner.sent = volume.sent_for(&partner.prefix);
                partner.volume_source = partner.sent.map(|_| volume.source);
            }
        }
        let Some(authoritative) = authoritative else {
            return unreconciled(partners.values().map(|p| p.attributed_revenue()).sum(), cpm);
        };

        let mut revenue: BTreeMap<String, f64> = partners
            .iter()
            .map(|(prefix, partner)| (prefix.clone(), partner.attributed_revenue()))
            .collect();
        let by_partner = volume
            .filter(|v| v.has_partner_breakdown())
            .map(|v| &v.by_partner);
        let mut report = reconcile(authoritative, &mut revenue, by_partner);

        for (prefix, value) in revenue {
            let partner = partners.entry(prefix.clone()).or_insert_with(|| {
                let mut created = DataPartnerPerformance::new(&self.partner_named(&prefix));
                if let Some(volume) = volume {
                    created.sent = volume.sent_for(&prefix);
                    created.volume_source = created.sent.map(|_| volume.source);
                }
                created
            });
            partner.reconciliation_adjustment = value - partner.attributed_revenue();
            partner.revenue = value;
        }
        for partner in partners.values_mut() {
            partner.rpm = partner
                .sent
                .filter(|sent| *sent > 0)
                .map(|sent| partner.revenue / sent as f64 * 1_000.0);
        }

        report.unattributed_cpm = cpm.unattributed;
        report.warnings.extend(cpm.warnings.iter().cloned());
        report
    }

    fn partner_named(&self, prefix: &str) -> Partner {
        let tables = self.codec.tables();
        let name = if prefix == tables.default_partner_prefix {
            tables.default_partner_name.clone()
        } else {
            tables
                .partners
                .get(prefix)
                .cloned()
                .unwrap_or_else(|| prefix.to_string())
        };
        Partner {
            prefix: prefix.to_string(),
            name,
        }
    }
}

fn unreconciled(reconstructed: f64, cpm: &CpmOutcome) -> ReconciliationReport {
    let mut warnings = vec!["no authoritative offer totals; gap not closed".to_string()];
    warnings.extend(cpm.warnings.iter().cloned());
    ReconciliationReport {
        authoritative_total: reconstructed,
        reconstructed_total: reconstructed,
        gap: 0.0,
        method: ReconciliationMethod::None,
        unattributed_cpm: cpm.unattributed,
        warnings,
    }
}

/// `numerator / denominator`, or 0 when there is nothing to divide by.
pub(crate) fn ratio(numerator: f64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator / denominator as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::RECONCILIATION_TOLERANCE;
    use crate::identifier::IdentifierTables;
    use crate::volume::VolumeSource;
    use chrono::NaiveDate;

    fn engine() -> AttributionEngine {
        AttributionEngine::new(Arc::new(IdentifierCodec::new(IdentifierTables {
            partners: BTreeMap::from([
                ("P1".to_string(), "Partner One".to_string()),
                ("P2".to_string(), "Partner Two".to_string()),
            ]),
            ..Default::default()
        })))
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 1, 26).unwrap()
    }

    struct Fixture {
        clicks: Vec<Click>,
        conversions: Vec<Conversion>,
        cross_tab: Vec<OfferPartnerRow>,
        totals: Vec<OfferTotal>,
        campaigns: Vec<CampaignMeta>,
        resolved: BTreeMap<String, PropertyRef>,
    }

    impl Fixture {
        fn new() -> Self {
            let tag_a = "TDIH_407_3926_01262026_11111";
            let tag_b = "TDIH_407_3926_01262026_22222";
            let click = |sub1: &str, sub2: &str| Click {
                offer_id: "407".into(),
                sub1: sub1.into(),
                sub2: sub2.into(),
                date: day(),
            };
            let conversion = |id: &str, sub1: &str, sub2: &str, revenue: f64| Conversion {
                conversion_id: id.into(),
                offer_id: "407".into(),
                offer_name: "Mortgage Leads".into(),
                sub1: sub1.into(),
                sub2: sub2.into(),
                data_set: None,
                date: day(),
                payout: revenue / 2.0,
                revenue,
            };
            let meta = |mailing_id: &str, esp: &str, sent: u64| CampaignMeta {
                mailing_id: mailing_id.into(),
                name: format!("TDIH_407_Mortgage_01262026_{mailing_id}"),
                esp: esp.into(),
                list_id: None,
                sent,
                delivered: sent,
            };
            Self {
                clicks: vec![click(tag_a, "P1_x"), click(tag_a, "P1_x"), click(tag_b, "P2_y")],
                conversions: vec![
                    conversion("c1", tag_a, "P1_x", 100.0),
                    conversion("c2", tag_b, "P2_y", 60.0),
                ],
                cross_tab: vec![
                    OfferPartnerRow {
                        offer_id: "900".into(),
                        offer_name: "Daily CPM".into(),
                        sub2: "P1_x".into(),
                        clicks: 30,
                        conversions: 0,
                        revenue: 0.0,
                    },
                    OfferPartnerRow {
                        offer_id: "900".into(),
                        offer_name: "Daily CPM".into(),
                        sub2: "P2_y".into(),
                        clicks: 10,
                        conversions: 0,
                        revenue: 0.0,
                    },
                ],
                totals: vec![
                    OfferTotal {
                        offer_id: "407".into(),
                        offer_name: "Mortgage Leads".into(),
                        clicks: 3,
                        conversions: 2,
                        payout: 80.0,
                        revenue: 200.0,
                    },
                    OfferTotal {
                        offer_id: "900".into(),
                        offer_name: "Daily CPM".into(),
                        clicks: 40,
                        conversions: 0,
                        payout: 0.0,
                        revenue: 400.0,
                    },
                ],
                campaigns: vec![meta("11111", "Sendly", 3_000), meta("22222", "Mailgrid", 1_000)],
                resolved: BTreeMap::new(),
            }
        }

        fn input<'a>(&'a self, volume: Option<&'a VolumeResolution>) -> AttributionInput<'a> {
            AttributionInput {
                clicks: &self.clicks,
                conversions: &self.conversions,
                campaign_report: &[],
                offer_partner: &self.cross_tab,
                offer_totals: &self.totals,
                campaigns: &self.campaigns,
                resolved_properties: &self.resolved,
                volume,
            }
        }
    }

    fn assert_close(a: f64, b: f64) {
        assert!((a - b).abs() <= RECONCILIATION_TOLERANCE, "{a} != {b}");
    }

    #[test]
    fn test_build_is_idempotent() {
        let fixture = Fixture::new();
        let engine = engine();
        let first = engine.build(&fixture.input(None));
        let second = engine.build(&fixture.input(None));
        assert_eq!(first, second);
    }

    #[test]
    fn test_esp_revenue_matches_authoritative_total() {
        let fixture = Fixture::new();
        let snapshot = engine().build(&fixture.input(None));

        let total: f64 = snapshot.esps.values().map(|e| e.revenue).sum();
        assert_close(total, 600.0);
        assert_eq!(snapshot.esp_reconciliation.method, ReconciliationMethod::VolumeWeighted);
        assert_close(snapshot.esp_reconciliation.gap, 440.0);
        // 440 split 3:1 by sends.
        assert_close(snapshot.esps["Sendly"].revenue, 100.0 + 330.0);
        assert_close(snapshot.esps["Mailgrid"].revenue, 60.0 + 110.0);
    }

    #[test]
    fn test_partner_revenue_matches_authoritative_total() {
        let fixture = Fixture::new();
        let snapshot = engine().build(&fixture.input(None));

        assert_close(snapshot.data_partners["P1"].cpm_revenue, 300.0);
        assert_close(snapshot.data_partners["P2"].cpm_revenue, 100.0);
        // CPA 160 + CPM 400 against 600: scaled up without volume.
        assert_eq!(
            snapshot.partner_reconciliation.method,
            ReconciliationMethod::ProportionalScale
        );
        let total: f64 = snapshot.data_partners.values().map(|p| p.revenue).sum();
        assert_close(total, 600.0);
    }

    #[test]
    fn test_partner_gap_follows_volume() {
        let fixture = Fixture::new();
        let volume = VolumeResolution {
            window: crate::model::DateWindow::single_day(day()),
            source: VolumeSource::ExactExport,
            total_sent: 4_000,
            by_partner: BTreeMap::from([
                ("P1".to_string(), 1_000),
                ("P2".to_string(), 1_000),
                ("INT".to_string(), 2_000),
            ]),
        };
        let snapshot = engine().build(&fixture.input(Some(&volume)));

        assert_eq!(
            snapshot.partner_reconciliation.method,
            ReconciliationMethod::VolumeWeighted
        );
        let internal = &snapshot.data_partners["INT"];
        assert_eq!(internal.name, "Internal");
        assert_close(internal.revenue, 20.0);
        assert_close(snapshot.data_partners["P1"].revenue, 400.0 + 10.0);
        assert_eq!(snapshot.data_partners["P1"].sent, Some(1_000));
        assert_eq!(snapshot.data_partners["P1"].volume_source, Some(VolumeSource::ExactExport));
        assert_close(snapshot.data_partners["P1"].rpm.unwrap(), 410.0);
        let total: f64 = snapshot.data_partners.values().map(|p| p.revenue).sum();
        assert_close(total, 600.0);
    }

    #[test]
    fn test_without_totals_gap_is_left_open() {
        let mut fixture = Fixture::new();
        fixture.totals.clear();
        let snapshot = engine().build(&fixture.input(None));
        assert_eq!(snapshot.esp_reconciliation.method, ReconciliationMethod::None);
        assert!(!snapshot.esp_reconciliation.warnings.is_empty());
        assert_close(snapshot.esps["Sendly"].revenue, 100.0);
    }

    #[test]
    fn test_property_key_display() {
        assert_eq!(PropertyKey::Known("TDIH".into()).to_string(), "TDIH");
        assert_eq!(
            PropertyKey::Unattributed(UnattributedReason::UnknownProperty).to_string(),
            "Unattributed: Unknown Property"
        );
    }
}
