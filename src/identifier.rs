//! Identifier classification.
//!
//! Every recurring pattern identifier is in exactly one of three states:
//!
//! - **Placeholder**: minted on the client for an optimistic create and never
//!   sent back to the server for addressing.
//! - **Confirmed**: matches the server's canonical shape (24 hexadecimal
//!   characters) and may be addressed directly.
//! - **Legacy**: anything else. Old records carry identifiers the server can no
//!   longer address, so mutations against them become create-and-replace.
//!
//! The state lives in the [`PatternId`] variant, so call sites match on it
//! exhaustively instead of sniffing string prefixes.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

/// Prefix used when a placeholder identifier is rendered as a string.
pub const PLACEHOLDER_PREFIX: &str = "local-";

static CANONICAL_SHAPE: OnceLock<Regex> = OnceLock::new();

fn canonical_shape() -> &'static Regex {
    // Constant pattern, so a compile failure is a build defect rather than an
    // input error; `test_canonical_shape_compiles` pins it.
    CANONICAL_SHAPE
        .get_or_init(|| Regex::new(r"^[0-9a-fA-F]{24}$").expect("canonical id pattern compiles"))
}

/// Returns true if `raw` has the server's canonical identifier shape.
#[must_use]
pub fn is_canonical(raw: &str) -> bool {
    canonical_shape().is_match(raw)
}

/// Classification of an identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentifierClass {
    /// Client-minted, awaiting server confirmation.
    Placeholder,
    /// Not canonical and not a placeholder.
    LegacyMalformed,
    /// Canonical server identifier.
    Confirmed,
}

impl IdentifierClass {
    /// Returns true if the server may be addressed with an identifier of this class.
    #[must_use]
    pub const fn is_addressable(self) -> bool {
        matches!(self, Self::Confirmed)
    }
}

impl fmt::Display for IdentifierClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Placeholder => write!(f, "placeholder"),
            Self::LegacyMalformed => write!(f, "legacy-malformed"),
            Self::Confirmed => write!(f, "confirmed"),
        }
    }
}

/// Classifies a raw identifier string.
///
/// # Examples
///
/// ```
/// use billsync::identifier::{classify, IdentifierClass};
///
/// assert_eq!(classify("5f1a2b3c4d5e6f7a8b9c0d1e"), IdentifierClass::Confirmed);
/// assert_eq!(classify("manual_1699999999"), IdentifierClass::LegacyMalformed);
/// ```
#[must_use]
pub fn classify(raw: &str) -> IdentifierClass {
    PatternId::parse(raw).class()
}

/// Identifier of a recurring pattern, tagged with its classification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PatternId {
    /// Client-minted placeholder.
    Placeholder(Uuid),
    /// Non-canonical identifier inherited from older records.
    Legacy(String),
    /// Canonical server identifier.
    Confirmed(String),
}

impl PatternId {
    /// Mints a fresh placeholder identifier.
    #[must_use]
    pub fn placeholder() -> Self {
        Self::Placeholder(Uuid::new_v4())
    }

    /// Parses and classifies a raw identifier.
    ///
    /// A string is a placeholder only if it carries [`PLACEHOLDER_PREFIX`]
    /// followed by a valid UUID.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        if let Some(rest) = raw.strip_prefix(PLACEHOLDER_PREFIX) {
            if let Ok(uuid) = Uuid::parse_str(rest) {
                return Self::Placeholder(uuid);
            }
        }
        if is_canonical(raw) {
            Self::Confirmed(raw.to_string())
        } else {
            Self::Legacy(raw.to_string())
        }
    }

    /// Returns the classification of this identifier.
    #[must_use]
    pub const fn class(&self) -> IdentifierClass {
        match self {
            Self::Placeholder(_) => IdentifierClass::Placeholder,
            Self::Legacy(_) => IdentifierClass::LegacyMalformed,
            Self::Confirmed(_) => IdentifierClass::Confirmed,
        }
    }

    /// Returns the server-addressable form, if any.
    #[must_use]
    pub fn as_confirmed(&self) -> Option<&str> {
        match self {
            Self::Confirmed(raw) => Some(raw),
            Self::Placeholder(_) | Self::Legacy(_) => None,
        }
    }

    /// Returns true if this identifier may be sent to the server for update/delete.
    #[must_use]
    pub const fn is_confirmed(&self) -> bool {
        matches!(self, Self::Confirmed(_))
    }

    /// Returns true if this is a client-minted placeholder.
    #[must_use]
    pub const fn is_placeholder(&self) -> bool {
        matches!(self, Self::Placeholder(_))
    }
}

impl fmt::Display for PatternId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Placeholder(uuid) => write!(f, "{PLACEHOLDER_PREFIX}{uuid}"),
            Self::Legacy(raw) | Self::Confirmed(raw) => f.write_str(raw),
        }
    }
}

impl From<&str> for PatternId {
    fn from(raw: &str) -> Self {
        Self::parse(raw)
    }
}

impl From<String> for PatternId {
    fn from(raw: String) -> Self {
        Self::parse(&raw)
    }
}

impl Serialize for PatternId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PatternId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(&raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_shape_compiles() {
        let shape = canonical_shape();
        assert!(shape.is_match("000000000000000000000000"));
        assert!(!shape.is_match(" 000000000000000000000000"));
    }

    #[test]
    fn test_classify_canonical_hex() {
        assert_eq!(classify("5f1a2b3c4d5e6f7a8b9c0db2"), IdentifierClass::Confirmed);
        assert_eq!(classify("5F1A2B3C4D5E6F7A8B9C0DB2"), IdentifierClass::Confirmed);
    }

    #[test]
    fn test_classify_wrong_length_is_legacy() {
        assert_eq!(classify("5f1a2b3c4d5e6f7a8b9c0db"), IdentifierClass::LegacyMalformed);
        assert_eq!(classify("5f1a2b3c4d5e6f7a8b9c0db2a"), IdentifierClass::LegacyMalformed);
        assert_eq!(classify(""), IdentifierClass::LegacyMalformed);
    }

    #[test]
    fn test_classify_non_hex_is_legacy() {
        assert_eq!(classify("zz1a2b3c4d5e6f7a8b9c0db2"), IdentifierClass::LegacyMalformed);
        assert_eq!(classify("manual_1700000000000"), IdentifierClass::LegacyMalformed);
    }

    #[test]
    fn test_placeholder_round_trips_through_string() {
        let id = PatternId::placeholder();
        let rendered = id.to_string();
        assert!(rendered.starts_with(PLACEHOLDER_PREFIX));
        assert_eq!(PatternId::parse(&rendered), id);
        assert_eq!(classify(&rendered), IdentifierClass::Placeholder);
    }

    #[test]
    fn test_placeholder_prefix_without_uuid_is_legacy() {
        assert_eq!(classify("local-not-a-uuid"), IdentifierClass::LegacyMalformed);
    }

    #[test]
    fn test_only_confirmed_is_addressable() {
        assert!(PatternId::parse("5f1a2b3c4d5e6f7a8b9c0db2").as_confirmed().is_some());
        assert!(PatternId::placeholder().as_confirmed().is_none());
        assert!(PatternId::parse("legacy-42").as_confirmed().is_none());
        assert!(IdentifierClass::Confirmed.is_addressable());
        assert!(!IdentifierClass::LegacyMalformed.is_addressable());
    }

    #[test]
    fn test_serde_uses_string_form() {
        let id = PatternId::parse("5f1a2b3c4d5e6f7a8b9c0db2");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"5f1a2b3c4d5e6f7a8b9c0db2\"");
        let back: PatternId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
