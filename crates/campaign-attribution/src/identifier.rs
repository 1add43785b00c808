// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Parsing of the tracking tags attached to every click and conversion.
//!
//! `sub1` encodes the campaign (`PROPERTY_OFFER_SEGMENT_mmddyyyy_MAILINGID`) and
//! `sub2` encodes the data set the contact came from (`PREFIX_DATASET`). Both are
//! conventions rather than grammars: tags are split into underscore tokens and
//! matched against lookup tables, and anything that does not match is kept as an
//! explicit "unknown" value so aggregation can bucket it.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::{
    DATE_TOKEN_LEN, EMAIL_HASH_LEN, INTERNAL_PARTNER_NAME, INTERNAL_PARTNER_PREFIX,
    MIN_MAILING_ID_LEN,
};
use crate::errors::{ConfigError, ParseError};

#[allow(clippy::expect_used)]
static EMAIL_HASH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-f0-9]{10}$").expect("email hash pattern is valid"));

const SENTINELS: [&str; 10] = [
    "N/A", "NA", "NULL", "NONE", "NIL", "TEST", "UNDEFINED", "UNKNOWN", "-", "0",
];

/// Lookup tables driving property and partner resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentifierTables {
    /// Upper-cased property code to display name.
    pub properties: BTreeMap<String, String>,
    /// Upper-cased partner prefix to partner name.
    pub partners: BTreeMap<String, String>,
    /// Exact data-set code to partner prefix, for data sets that break the prefix rule.
    pub data_set_overrides: BTreeMap<String, String>,
    pub default_partner_prefix: String,
    pub default_partner_name: String,
}

impl Default for IdentifierTables {
    fn default() -> Self {
        Self {
            properties: BTreeMap::from([("TDIH".to_string(), "This Day In History".to_string())]),
            partners: BTreeMap::new(),
            data_set_overrides: BTreeMap::new(),
            default_partner_prefix: INTERNAL_PARTNER_PREFIX.to_string(),
            default_partner_name: INTERNAL_PARTNER_NAME.to_string(),
        }
    }
}

impl IdentifierTables {
    /// Loads tables from a JSON file. Keys are normalised to upper case.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let tables: IdentifierTables = serde_json::from_str(&raw)?;
        Ok(tables.normalised())
    }

    fn normalised(self) -> Self {
        let upper = |map: BTreeMap<String, String>| {
            map.into_iter()
                .map(|(k, v)| (k.trim().to_ascii_uppercase(), v))
                .collect()
        };
        Self {
            properties: upper(self.properties),
            partners: upper(self.partners),
            data_set_overrides: self
                .data_set_overrides
                .into_iter()
                .map(|(k, v)| (k.trim().to_ascii_uppercase(), v.trim().to_ascii_uppercase()))
                .collect(),
            default_partner_prefix: self.default_partner_prefix,
            default_partner_name: self.default_partner_name,
        }
    }
}

/// Resolution of the property segment of a sub1 tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PropertyRef {
    Known { code: String, name: String },
    /// First segment did not match the table; kept verbatim for later resolution.
    Unknown(String),
    /// First segment was numeric, so the tag starts at the offer id.
    Missing,
}

impl PropertyRef {
    pub fn is_known(&self) -> bool {
        matches!(self, PropertyRef::Known { .. })
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            PropertyRef::Known { code, .. } => Some(code),
            PropertyRef::Unknown(code) => Some(code),
            PropertyRef::Missing => None,
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            PropertyRef::Known { name, .. } => Some(name),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSub1 {
    pub property: PropertyRef,
    pub offer_id: Option<String>,
    pub date: Option<NaiveDate>,
    pub mailing_id: Option<String>,
}

impl ParsedSub1 {
    pub fn property_code(&self) -> Option<&str> {
        self.property.code()
    }

    pub fn property_name(&self) -> Option<&str> {
        self.property.name()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Partner {
    pub prefix: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSub2 {
    pub data_set_code: String,
    /// `None` for anonymised email hashes, which are never credited to a partner.
    pub partner: Option<Partner>,
}

impl ParsedSub2 {
    pub fn is_email_hash(&self) -> bool {
        self.partner.is_none()
    }

    pub fn partner_prefix(&self) -> Option<&str> {
        self.partner.as_ref().map(|p| p.prefix.as_str())
    }

    pub fn partner_name(&self) -> Option<&str> {
        self.partner.as_ref().map(|p| p.name.as_str())
    }
}

/// Fields recovered from a human readable campaign name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CampaignName {
    pub date: Option<NaiveDate>,
    pub property: Option<PropertyRef>,
    pub offer_id: Option<String>,
    pub offer_name: Option<String>,
    pub segment: Option<String>,
}

/// Tag parser bound to a set of lookup tables.
#[derive(Debug, Clone, Default)]
pub struct IdentifierCodec {
    tables: IdentifierTables,
}

impl IdentifierCodec {
    pub fn new(tables: IdentifierTables) -> Self {
        Self {
            tables: tables.normalised(),
        }
    }

    pub fn tables(&self) -> &IdentifierTables {
        &self.tables
    }

    pub fn lookup_property(&self, code: &str) -> Option<PropertyRef> {
        let code = code.trim().to_ascii_uppercase();
        self.tables
            .properties
            .get(&code)
            .map(|name| PropertyRef::Known {
                code,
                name: name.clone(),
            })
    }

    pub fn default_partner(&self) -> Partner {
        Partner {
            prefix: self.tables.default_partner_prefix.clone(),
            name: self.tables.default_partner_name.clone(),
        }
    }

    /// Parses a sub1 campaign tag.
    ///
    /// The mailing id is the token after the mmddyyyy date token, or failing
    /// that the last numeric token of at least five digits.
    pub fn parse_sub1(&self, raw: &str) -> Result<ParsedSub1, ParseError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ParseError::Empty);
        }
        let segments = tokenize(trimmed);
        if segments.len() < 2 {
            return Err(ParseError::TooFewSegments(trimmed.to_string()));
        }

        let first = segments[0];
        let second_offer = || {
            let second = segments[1];
            (is_digits(second) && parse_date_token(second).is_none()).then(|| second.to_string())
        };
        let (property, offer_id) = match self.lookup_property(first) {
            Some(known) => (known, second_offer()),
            None if is_digits(first) => (PropertyRef::Missing, Some(first.to_string())),
            None => (PropertyRef::Unknown(first.to_string()), second_offer()),
        };

        let date_position = segments
            .iter()
            .enumerate()
            .skip(1)
            .find_map(|(i, token)| parse_date_token(token).map(|date| (i, date)));

        let mailing_id = match date_position {
            Some((i, _)) if i + 1 < segments.len() => Some(segments[i + 1].to_string()),
            _ => {
                let skip_first = usize::from(property == PropertyRef::Missing);
                segments
                    .iter()
                    .enumerate()
                    .skip(skip_first)
                    .filter(|(i, _)| Some(*i) != date_position.map(|(d, _)| d))
                    .filter(|(_, t)| t.len() >= MIN_MAILING_ID_LEN && is_digits(t))
                    .last()
                    .map(|(_, t)| t.to_string())
            }
        };

        Ok(ParsedSub1 {
            property,
            offer_id,
            date: date_position.map(|(_, date)| date),
            mailing_id,
        })
    }

    /// Parses a sub2 data-set tag. Placeholders and sentinels yield `None`.
    pub fn parse_sub2(&self, raw: &str) -> Option<ParsedSub2> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || is_placeholder(trimmed) || is_sentinel(trimmed) {
            return None;
        }
        if EMAIL_HASH.is_match(trimmed) {
            debug_assert_eq!(trimmed.len(), EMAIL_HASH_LEN);
            return Some(ParsedSub2 {
                data_set_code: trimmed.to_string(),
                partner: None,
            });
        }
        Some(ParsedSub2 {
            data_set_code: trimmed.to_string(),
            partner: Some(self.resolve_partner(trimmed)),
        })
    }

    /// Override table, then prefix table, then the default internal partner.
    pub fn resolve_partner(&self, data_set_code: &str) -> Partner {
        self.match_partner(data_set_code)
            .unwrap_or_else(|| self.default_partner())
    }

    /// Resolves a sending-platform segment name to a partner, without the default fallback.
    pub fn partner_for_segment(&self, segment_name: &str) -> Option<Partner> {
        let trimmed = segment_name.trim();
        if trimmed.is_empty() {
            return None;
        }
        if let Some(partner) = self.match_partner(trimmed) {
            return Some(partner);
        }
        tokenize(trimmed)
            .into_iter()
            .skip(1)
            .find_map(|token| self.partner_by_prefix(token))
    }

    fn match_partner(&self, data_set_code: &str) -> Option<Partner> {
        let key = data_set_code.trim().to_ascii_uppercase();
        if let Some(prefix) = self.tables.data_set_overrides.get(&key) {
            let name = self
                .tables
                .partners
                .get(prefix)
                .cloned()
                .unwrap_or_else(|| prefix.clone());
            return Some(Partner {
                prefix: prefix.clone(),
                name,
            });
        }
        let prefix = key.split('_').next().unwrap_or_default();
        self.partner_by_prefix(prefix)
    }

    fn partner_by_prefix(&self, prefix: &str) -> Option<Partner> {
        let prefix = prefix.trim().to_ascii_uppercase();
        self.tables
            .partners
            .get(&prefix)
            .map(|name| Partner {
                prefix,
                name: name.clone(),
            })
    }

    /// Applies the tag grammar to a campaign name such as
    /// `TDIH_407_Mortgage Leads_01262026_ABC_Openers`.
    pub fn parse_campaign_name(&self, name: &str) -> CampaignName {
        let tokens = tokenize(name);
        let mut consumed = vec![false; tokens.len()];
        let mut parsed = CampaignName::default();

        if let Some(i) = tokens.iter().position(|t| parse_date_token(t).is_some()) {
            parsed.date = parse_date_token(tokens[i]);
            consumed[i] = true;
        }
        if let Some((i, property)) = tokens
            .iter()
            .enumerate()
            .filter(|(i, _)| !consumed[*i])
            .find_map(|(i, t)| self.lookup_property(t).map(|p| (i, p)))
        {
            parsed.property = Some(property);
            consumed[i] = true;
        }
        let offer_position = tokens
            .iter()
            .enumerate()
            .find(|(i, t)| !consumed[*i] && is_digits(t))
            .map(|(i, _)| i);
        if let Some(i) = offer_position {
            parsed.offer_id = Some(tokens[i].to_string());
            consumed[i] = true;
        }

        let last = tokens.len().saturating_sub(1);
        if tokens.len() >= 3 && !consumed[last] {
            parsed.segment = Some(tokens[last].to_string());
            consumed[last] = true;
        }

        if let Some(offer) = offer_position {
            let words: Vec<&str> = tokens
                .iter()
                .enumerate()
                .skip(offer + 1)
                .take_while(|(i, t)| !consumed[*i] && !is_digits(t))
                .map(|(_, t)| *t)
                .collect();
            if !words.is_empty() {
                parsed.offer_name = Some(words.join(" "));
            }
        }

        if parsed.property.is_none() {
            debug!("campaign name '{}' carries no known property code", name);
        }
        parsed
    }
}

fn tokenize(raw: &str) -> Vec<&str> {
    raw.split('_')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect()
}

fn is_digits(token: &str) -> bool {
    !token.is_empty() && token.bytes().all(|b| b.is_ascii_digit())
}

/// An 8-digit mmddyyyy token that forms a valid calendar date.
fn parse_date_token(token: &str) -> Option<NaiveDate> {
    if token.len() != DATE_TOKEN_LEN || !is_digits(token) {
        return None;
    }
    NaiveDate::parse_from_str(token, "%m%d%Y").ok()
}

fn is_placeholder(token: &str) -> bool {
    token.starts_with('$')
        || token
            .chars()
            .any(|c| matches!(c, '{' | '}' | '[' | ']' | '%' | '<' | '>'))
}

fn is_sentinel(token: &str) -> bool {
    SENTINELS.iter().any(|s| s.eq_ignore_ascii_case(token))
}
