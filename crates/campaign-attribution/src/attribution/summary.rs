// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;

use chrono::Datelike;
use serde::Serialize;

use crate::model::Conversion;

/// Calendar-month totals with the change against the previous month.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonthlySummary {
    pub year: i32,
    pub month: u32,
    pub conversions: u64,
    pub revenue: f64,
    pub payout: f64,
    /// Percent change vs. the previous calendar month; `None` without a non-zero baseline.
    pub revenue_change_pct: Option<f64>,
    pub conversions_change_pct: Option<f64>,
}

impl MonthlySummary {
    pub fn label(&self) -> String {
        format!("{:04}-{:02}", self.year, self.month)
    }
}

pub(crate) fn monthly_summaries(conversions: &[Conversion]) -> Vec<MonthlySummary> {
    let mut months: BTreeMap<(i32, u32), (u64, f64, f64)> = BTreeMap::new();
    for conversion in conversions {
        let entry = months
            .entry((conversion.date.year(), conversion.date.month()))
            .or_default();
        entry.0 += 1;
        entry.1 += conversion.revenue;
        entry.2 += conversion.payout;
    }

    months
        .iter()
        .map(|(&(year, month), &(conversions, revenue, payout))| {
            let previous = months.get(&previous_month(year, month));
            MonthlySummary {
                year,
                month,
                conversions,
                revenue,
                payout,
                revenue_change_pct: previous.and_then(|p| pct_change(p.1, revenue)),
                conversions_change_pct: previous
                    .and_then(|p| pct_change(p.0 as f64, conversions as f64)),
            }
        })
        .collect()
}

fn previous_month(year: i32, month: u32) -> (i32, u32) {
    if month == 1 {
        (year - 1, 12)
    } else {
        (year, month - 1)
    }
}

fn pct_change(before: f64, after: f64) -> Option<f64> {
    (before != 0.0).then(|| (after - before) / before * 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn conversion(y: i32, m: u32, d: u32, revenue: f64) -> Conversion {
        Conversion {
            conversion_id: format!("{y}{m}{d}{revenue}"),
            offer_id: "1".into(),
            offer_name: "Offer".into(),
            sub1: String::new(),
            sub2: String::new(),
            data_set: None,
            date: NaiveDate::from_ymd_opt(y, m, d).unwrap(),
            payout: 1.0,
            revenue,
        }
    }

    #[test]
    fn test_month_over_month() {
        let summaries = monthly_summaries(&[
            conversion(2025, 12, 3, 100.0),
            conversion(2026, 1, 4, 100.0),
            conversion(2026, 1, 20, 50.0),
            conversion(2026, 3, 1, 10.0),
        ]);
        let labels: Vec<String> = summaries.iter().map(MonthlySummary::label).collect();
        assert_eq!(labels, vec!["2025-12", "2026-01", "2026-03"]);

        assert_eq!(summaries[0].revenue_change_pct, None);
        assert_eq!(summaries[1].revenue, 150.0);
        assert_eq!(summaries[1].revenue_change_pct, Some(50.0));
        assert_eq!(summaries[1].conversions_change_pct, Some(100.0));
        // February is absent, so March has no baseline.
        assert_eq!(summaries[2].revenue_change_pct, None);
    }
}
