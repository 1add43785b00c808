// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Secondary property lookup for campaigns whose tag carries no known property.
//!
//! Lookups go one campaign at a time against the sending platform, spaced out
//! and capped per batch. Campaigns that resolve to nothing are remembered in a
//! negative cache so they are not asked about again every cycle.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::cache::{CacheStore, Clock};
use crate::identifier::{IdentifierCodec, PropertyRef};
use crate::upstream::{with_deadline, SendingApi};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyLookupConfig {
    pub max_batch: usize,
    pub spacing: Duration,
    pub timeout: Duration,
    /// How long a campaign without a recoverable property is left alone.
    pub negative_ttl: Duration,
}

impl Default for PropertyLookupConfig {
    fn default() -> Self {
        Self {
            max_batch: 25,
            spacing: Duration::from_millis(250),
            timeout: Duration::from_secs(30),
            negative_ttl: Duration::from_secs(6 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LookupSummary {
    pub attempted: usize,
    pub resolved: usize,
    pub unresolved: usize,
    pub failed: usize,
    /// Set when a rate limit cut the batch short.
    pub throttled: bool,
}

pub struct PropertyResolver {
    sending: Arc<dyn SendingApi>,
    codec: Arc<IdentifierCodec>,
    config: PropertyLookupConfig,
    resolved: RwLock<BTreeMap<String, PropertyRef>>,
    unresolvable: CacheStore<String, ()>,
}

impl PropertyResolver {
    pub fn new(
        sending: Arc<dyn SendingApi>,
        codec: Arc<IdentifierCodec>,
        config: PropertyLookupConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            sending,
            codec,
            config,
            resolved: RwLock::new(BTreeMap::new()),
            unresolvable: CacheStore::new(config.negative_ttl, clock),
        }
    }

    /// Properties recovered so far, keyed by mailing id.
    pub fn resolved(&self) -> BTreeMap<String, PropertyRef> {
        self.resolved
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Forgets resolved campaigns that `keep` rejects and drops expired
    /// negative entries. Returns how many entries were removed.
    pub fn prune(&self, keep: impl Fn(&str) -> bool) -> usize {
        let mut resolved = self.resolved.write().unwrap_or_else(PoisonError::into_inner);
        let before = resolved.len();
        resolved.retain(|mailing_id, _| keep(mailing_id));
        let dropped = before - resolved.len();
        drop(resolved);
        dropped + self.unresolvable.purge_expired()
    }

    /// Resolved plus negatively cached campaigns currently held.
    pub fn cached_entries(&self) -> usize {
        let resolved = self.resolved.read().unwrap_or_else(PoisonError::into_inner).len();
        resolved + self.unresolvable.len()
    }

    /// Candidates that are neither resolved nor recently found unresolvable.
    pub fn pending<'a>(&self, candidates: &'a [String]) -> Vec<&'a String> {
        let resolved = self.resolved.read().unwrap_or_else(PoisonError::into_inner);
        candidates
            .iter()
            .filter(|id| !resolved.contains_key(*id) && self.unresolvable.get(id).is_none())
            .collect()
    }

    /// Looks up at most `max_batch` pending campaigns.
    pub async fn resolve_batch(&self, candidates: &[String]) -> LookupSummary {
        let batch: Vec<String> = self
            .pending(candidates)
            .into_iter()
            .take(self.config.max_batch)
            .cloned()
            .collect();
        let mut summary = LookupSummary::default();

        for (i, mailing_id) in batch.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.config.spacing).await;
            }
            summary.attempted += 1;
            match with_deadline(self.config.timeout, self.sending.campaign(mailing_id)).await {
                Ok(meta) => {
                    let property = meta
                        .and_then(|m| self.codec.parse_campaign_name(&m.name).property)
                        .filter(PropertyRef::is_known);
                    match property {
                        Some(property) => {
                            debug!("campaign {mailing_id} resolved to {:?}", property.code());
                            self.resolved
                                .write()
                                .unwrap_or_else(PoisonError::into_inner)
                                .insert(mailing_id.clone(), property);
                            summary.resolved += 1;
                        }
                        None => {
                            self.unresolvable.insert(mailing_id.clone(), ());
                            summary.unresolved += 1;
                        }
                    }
                }
                Err(err) if err.is_rate_limit() => {
                    warn!("property lookups rate limited; deferring remaining campaigns");
                    summary.failed += 1;
                    summary.throttled = true;
                    break;
                }
                Err(err) => {
                    warn!("property lookup for campaign {mailing_id} failed: {err}");
                    summary.failed += 1;
                }
            }
        }

        if summary.attempted > 0 {
            info!(
                "property lookups: {} attempted, {} resolved, {} unresolved, {} failed",
                summary.attempted, summary.resolved, summary.unresolved, summary.failed
            );
        }
        summary
    }
}
