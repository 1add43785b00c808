// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Attribution and send-volume resolution for email campaign revenue.
//!
//! Revenue recorded by an affiliate tracking network is tied back to the email
//! campaigns, content properties and data partners that produced it, using the
//! loosely structured tags carried on every click together with send volume
//! from the email platform. The [`collector::Collector`] drives periodic fetches
//! and publishes an immutable [`attribution::AttributionSnapshot`].

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod attribution;
pub mod backoff;
pub mod cache;
pub mod collector;
pub mod config;
pub mod constants;
pub mod errors;
pub mod identifier;
pub mod logging;
pub mod model;
pub mod store;
pub mod upstream;
pub mod volume;

pub use attribution::{AttributionEngine, AttributionInput, AttributionSnapshot};
pub use collector::{Collector, CollectorState, FetchKind, FetchSummary, ReportOutcome};
pub use config::AttributionConfig;
pub use errors::{AttributionError, ConfigError, ParseError, StoreError, UpstreamError};
pub use identifier::{IdentifierCodec, IdentifierTables};
pub use upstream::{SendingApi, TrackingApi};
pub use volume::{VolumeResolution, VolumeResolver, VolumeSource};
