// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Raw records pulled from the tracking network and the sending platform.
//!
//! These are plain data carriers. Every aggregate in [`crate::attribution`] is
//! rebuilt from slices of these types each cycle.

use std::fmt;

use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};

/// Inclusive date range used as the key of every windowed report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        if start <= end {
            Self { start, end }
        } else {
            Self {
                start: end,
                end: start,
            }
        }
    }

    /// Window of `days` days ending on (and including) `end`. Clamped to the
    /// earliest representable date.
    pub fn lookback(end: NaiveDate, days: u32) -> Self {
        let start = end
            .checked_sub_days(Days::new(u64::from(days.saturating_sub(1))))
            .unwrap_or(NaiveDate::MIN);
        Self { start, end }
    }

    pub fn single_day(day: NaiveDate) -> Self {
        Self {
            start: day,
            end: day,
        }
    }

    /// Cache key shared by every report shape: `"{start}|{end}"`.
    pub fn cache_key(&self) -> String {
        format!("{}|{}", self.start, self.end)
    }

    pub fn contains(&self, day: NaiveDate) -> bool {
        self.start <= day && day <= self.end
    }
}

impl fmt::Display for DateWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Click {
    pub offer_id: String,
    pub sub1: String,
    pub sub2: String,
    pub date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversion {
    pub conversion_id: String,
    pub offer_id: String,
    pub offer_name: String,
    pub sub1: String,
    pub sub2: String,
    /// Data-set code carried forward from the originating click when sub2 is missing.
    pub data_set: Option<String>,
    pub date: NaiveDate,
    pub payout: f64,
    pub revenue: f64,
}

/// One page of the paginated conversion report.
#[derive(Debug, Clone, Default)]
pub struct ConversionPage {
    pub conversions: Vec<Conversion>,
    pub next_page: Option<u32>,
}

/// Row of the sub1-keyed campaign report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignReportRow {
    pub sub1: String,
    pub clicks: u64,
    pub conversions: u64,
    pub revenue: f64,
}

/// Row of the offer x sub2 cross-tab report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfferPartnerRow {
    pub offer_id: String,
    pub offer_name: String,
    pub sub2: String,
    pub clicks: u64,
    pub conversions: u64,
    pub revenue: f64,
}

/// Row of the per-partner clicks report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartnerClickRow {
    pub sub2: String,
    pub clicks: u64,
    pub conversions: u64,
}

/// Authoritative offer-level totals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfferTotal {
    pub offer_id: String,
    pub offer_name: String,
    pub clicks: u64,
    pub conversions: u64,
    pub payout: f64,
    pub revenue: f64,
}

/// Campaign metadata from the sending platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignMeta {
    pub mailing_id: String,
    pub name: String,
    pub esp: String,
    pub list_id: Option<String>,
    pub sent: u64,
    pub delivered: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentVolume {
    pub segment_name: String,
    pub sent: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListVolume {
    pub list_id: String,
    pub list_name: String,
    pub sent: u64,
}

/// Identifier of an asynchronous contact-activity export.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExportId(pub String);

impl fmt::Display for ExportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportStatus {
    Pending,
    Ready,
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, m, d).unwrap()
    }

    #[test]
    fn test_window_cache_key() {
        let window = DateWindow::new(day(1, 1), day(1, 31));
        assert_eq!(window.cache_key(), "2026-01-01|2026-01-31");
    }

    #[test]
    fn test_window_normalises_order() {
        let window = DateWindow::new(day(2, 1), day(1, 1));
        assert_eq!(window.start, day(1, 1));
        assert_eq!(window.end, day(2, 1));
    }

    #[test]
    fn test_lookback_includes_end() {
        let window = DateWindow::lookback(day(1, 30), 30);
        assert_eq!(window.start, day(1, 1));
        assert!(window.contains(day(1, 30)));
        assert!(!window.contains(day(1, 31)));
        assert_eq!(DateWindow::lookback(day(1, 30), 1), DateWindow::single_day(day(1, 30)));
    }

    #[test]
    fn test_lookback_clamps_instead_of_overflowing() {
        let window = DateWindow::lookback(day(1, 30), u32::MAX);
        assert_eq!(window.start, NaiveDate::MIN);
        assert_eq!(window.end, day(1, 30));
    }
}
