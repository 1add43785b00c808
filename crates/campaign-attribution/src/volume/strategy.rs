// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{PartnerActivity, VolumeResolution, VolumeSource};
use crate::identifier::IdentifierCodec;
use crate::model::DateWindow;
use crate::upstream::{with_deadline, SendingApi};

/// Facts shared along the fallback chain.
#[derive(Debug)]
pub struct StrategyContext<'a> {
    pub window: DateWindow,
    pub activity: &'a PartnerActivity,
    /// Total volume learned by an earlier strategy.
    pub known_total: Option<u64>,
}

impl<'a> StrategyContext<'a> {
    pub fn new(window: DateWindow, activity: &'a PartnerActivity) -> Self {
        Self {
            window,
            activity,
            known_total: None,
        }
    }
}

/// One way of answering a volume query. `None` means "try the next one".
#[async_trait]
pub trait VolumeStrategy: Send + Sync {
    fn source(&self) -> VolumeSource;

    async fn resolve(&self, ctx: &mut StrategyContext<'_>) -> Option<VolumeResolution>;
}

/// Segment volumes re-grouped by the partner prefix found in each segment name.
pub struct SegmentAggregation {
    sending: Arc<dyn SendingApi>,
    codec: Arc<IdentifierCodec>,
    timeout: Duration,
    min_partners: usize,
}

impl SegmentAggregation {
    pub fn new(
        sending: Arc<dyn SendingApi>,
        codec: Arc<IdentifierCodec>,
        timeout: Duration,
        min_partners: usize,
    ) -> Self {
        Self {
            sending,
            codec,
            timeout,
            min_partners,
        }
    }
}

#[async_trait]
impl VolumeStrategy for SegmentAggregation {
    fn source(&self) -> VolumeSource {
        VolumeSource::SegmentAggregate
    }

    async fn resolve(&self, ctx: &mut StrategyContext<'_>) -> Option<VolumeResolution> {
        let segments = match with_deadline(self.timeout, self.sending.segment_volumes(&ctx.window))
            .await
        {
            Ok(segments) => segments,
            Err(err) => {
                warn!("segment volumes for {} unavailable: {err}", ctx.window);
                return None;
            }
        };

        let default_prefix = self.codec.default_partner().prefix;
        let mut by_partner: BTreeMap<String, u64> = BTreeMap::new();
        let mut total = 0u64;
        for segment in &segments {
            total += segment.sent;
            let prefix = self
                .codec
                .partner_for_segment(&segment.segment_name)
                .map(|p| p.prefix)
                .unwrap_or_else(|| default_prefix.clone());
            *by_partner.entry(prefix).or_default() += segment.sent;
        }

        let recognised = by_partner.keys().filter(|p| **p != default_prefix).count();
        if recognised < self.min_partners {
            // Segment names that don't follow the convention look like a single
            // in-house bucket; that is a parsing miss, not a real breakdown.
            debug!(
                "segment aggregation for {} found {} partner(s), need {}",
                ctx.window, recognised, self.min_partners
            );
            return None;
        }

        Some(VolumeResolution {
            window: ctx.window,
            source: VolumeSource::SegmentAggregate,
            total_sent: total,
            by_partner,
        })
    }
}

/// List-level totals. Never yields a partner breakdown.
pub struct ListAggregation {
    sending: Arc<dyn SendingApi>,
    timeout: Duration,
}

impl ListAggregation {
    pub fn new(sending: Arc<dyn SendingApi>, timeout: Duration) -> Self {
        Self { sending, timeout }
    }
}

#[async_trait]
impl VolumeStrategy for ListAggregation {
    fn source(&self) -> VolumeSource {
        VolumeSource::ListAggregate
    }

    async fn resolve(&self, ctx: &mut StrategyContext<'_>) -> Option<VolumeResolution> {
        let lists = match with_deadline(self.timeout, self.sending.list_volumes(&ctx.window)).await
        {
            Ok(lists) => lists,
            Err(err) => {
                warn!("list volumes for {} unavailable: {err}", ctx.window);
                return None;
            }
        };
        let total: u64 = lists.iter().map(|l| l.sent).sum();
        (total > 0).then(|| VolumeResolution {
            window: ctx.window,
            source: VolumeSource::ListAggregate,
            total_sent: total,
            by_partner: BTreeMap::new(),
        })
    }
}

/// Splits a known total by each partner's share of clicks, or of conversions
/// when no clicks were seen. An approximation, labelled as such.
pub struct ClickShareEstimate;

#[async_trait]
impl VolumeStrategy for ClickShareEstimate {
    fn source(&self) -> VolumeSource {
        VolumeSource::ClickShareEstimate
    }

    async fn resolve(&self, ctx: &mut StrategyContext<'_>) -> Option<VolumeResolution> {
        let total = ctx.known_total.filter(|t| *t > 0)?;
        let weights = if ctx.activity.clicks.values().sum::<u64>() > 0 {
            &ctx.activity.clicks
        } else {
            &ctx.activity.conversions
        };
        let by_partner = split_proportionally(total, weights)?;
        Some(VolumeResolution {
            window: ctx.window,
            source: VolumeSource::ClickShareEstimate,
            total_sent: total,
            by_partner,
        })
    }
}

/// Splits `total` by `weights` so the parts sum exactly to `total`.
/// The rounding remainder goes to the heaviest key.
pub(crate) fn split_proportionally(
    total: u64,
    weights: &BTreeMap<String, u64>,
) -> Option<BTreeMap<String, u64>> {
    let weight_sum: u64 = weights.values().sum();
    if weight_sum == 0 {
        return None;
    }
    let mut parts: BTreeMap<String, u64> = weights
        .iter()
        .filter(|(_, w)| **w > 0)
        .map(|(k, w)| {
            let share = (u128::from(total) * u128::from(*w) / u128::from(weight_sum)) as u64;
            (k.clone(), share)
        })
        .collect();
    let assigned: u64 = parts.values().sum();
    if let Some((heaviest, _)) = weights.iter().max_by_key(|(_, w)| **w) {
        if let Some(part) = parts.get_mut(heaviest) {
            *part += total - assigned;
        }
    }
    Some(parts)
}
