// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Label of the explicit entry that receives revenue with no attribution basis.
pub const UNATTRIBUTED: &str = "Unattributed";

/// Partner credited when a data-set code matches neither the override nor the prefix table.
pub const INTERNAL_PARTNER_PREFIX: &str = "INT";
pub const INTERNAL_PARTNER_NAME: &str = "Internal";

/// Length of the mmddyyyy date token embedded in campaign tags.
pub const DATE_TOKEN_LEN: usize = 8;

/// Shortest numeric run accepted as a fallback mailing id.
pub const MIN_MAILING_ID_LEN: usize = 5;

/// Anonymised email hashes are 10 lowercase hex characters.
pub const EMAIL_HASH_LEN: usize = 10;

/// Marker searched for (case-insensitively) in offer names to flag CPM pricing.
pub const CPM_MARKER: &str = "CPM";

/// One cent: tolerance of the reconciliation invariant.
pub const RECONCILIATION_TOLERANCE: f64 = 0.01;

/// Conversion report page size requested from the tracking network.
pub const CONVERSION_PAGE_SIZE: u32 = 500;

/// Upper bound on conversion pages pulled per fetch.
pub const MAX_CONVERSION_PAGES: u32 = 200;

/// Longest accepted lookback, in days.
pub const MAX_LOOKBACK_DAYS: u32 = 366;

/// Upper bound on any configured interval, TTL or timeout.
pub const MAX_CONFIGURED_DURATION: std::time::Duration =
    std::time::Duration::from_secs(30 * 24 * 60 * 60);
