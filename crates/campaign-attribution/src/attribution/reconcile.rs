// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Gap closing between reconstructed and authoritative revenue.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::debug;

use crate::constants::{RECONCILIATION_TOLERANCE, UNATTRIBUTED};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum ReconciliationMethod {
    /// Reconstructed revenue already matched within tolerance.
    #[default]
    None,
    /// Positive gap split by send volume.
    VolumeWeighted,
    /// Positive gap without volume; entries scaled up.
    ProportionalScale,
    /// Reconstructed revenue exceeded the authoritative total; entries scaled down.
    ScaledDown,
    /// No basis to distribute on; the gap sits in an explicit entry.
    Unattributed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconciliationReport {
    pub authoritative_total: f64,
    pub reconstructed_total: f64,
    /// `authoritative_total - reconstructed_total` before closing.
    pub gap: f64,
    pub method: ReconciliationMethod,
    /// CPM revenue that could not be tied to any partner's clicks.
    pub unattributed_cpm: f64,
    pub warnings: Vec<String>,
}

impl ReconciliationReport {
    pub fn gap_closed(&self) -> bool {
        self.method != ReconciliationMethod::None
    }
}

/// Adjusts `entries` in place so they sum to `authoritative`.
///
/// Entries present in `volume` but missing from `entries` are created when the
/// gap is split by volume.
pub fn reconcile(
    authoritative: f64,
    entries: &mut BTreeMap<String, f64>,
    volume: Option<&BTreeMap<String, u64>>,
) -> ReconciliationReport {
    let reconstructed: f64 = entries.values().sum();
    let gap = authoritative - reconstructed;
    let mut report = ReconciliationReport {
        authoritative_total: authoritative,
        reconstructed_total: reconstructed,
        gap,
        ..Default::default()
    };
    if gap.abs() <= RECONCILIATION_TOLERANCE {
        return report;
    }

    let volume_sum: u64 = volume.map(|v| v.values().sum()).unwrap_or_default();
    report.method = match volume {
        Some(volume) if gap > 0.0 && volume_sum > 0 => {
            distribute_by_volume(gap, entries, volume, volume_sum);
            ReconciliationMethod::VolumeWeighted
        }
        _ if reconstructed > RECONCILIATION_TOLERANCE => {
            let factor = authoritative / reconstructed;
            for value in entries.values_mut() {
                *value *= factor;
            }
            if gap > 0.0 {
                ReconciliationMethod::ProportionalScale
            } else {
                ReconciliationMethod::ScaledDown
            }
        }
        _ => {
            *entries.entry(UNATTRIBUTED.to_string()).or_default() += gap;
            ReconciliationMethod::Unattributed
        }
    };
    debug!(
        "closed revenue gap of {gap:.2} ({:?}) across {} entries",
        report.method,
        entries.len()
    );
    report
}

fn distribute_by_volume(
    gap: f64,
    entries: &mut BTreeMap<String, f64>,
    volume: &BTreeMap<String, u64>,
    volume_sum: u64,
) {
    let mut assigned = 0.0;
    for (key, sent) in volume.iter().filter(|(_, sent)| **sent > 0) {
        let share = gap * (*sent as f64) / (volume_sum as f64);
        *entries.entry(key.clone()).or_default() += share;
        assigned += share;
    }
    // Rounding residue goes to the heaviest sender.
    if let Some((heaviest, _)) = volume.iter().max_by_key(|(_, sent)| **sent) {
        if let Some(value) = entries.get_mut(heaviest) {
            *value += gap - assigned;
        }
    }
}
