//! Identifier reconciliation for server lists.
//!
//! [`normalize`] turns a server response into a list of patterns in which
//! every identifier occurs exactly once.

use std::collections::HashSet;

use tracing::{debug, warn};

use crate::identifier::{is_canonical, PatternId};
use crate::pattern::{RawPattern, RecurringPattern};

/// Outcome counters for one normalization pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NormalizeReport {
    /// Legacy identifiers rewritten to their server-assigned alternate.
    pub rewritten: usize,
    /// Legacy identifiers kept as-is because no usable alternate was present.
    pub unresolved_legacy: usize,
    /// Entries dropped because their identifier was already seen.
    pub duplicates_dropped: usize,
}

/// Resolves the identifier a raw record should be stored under.
///
/// Returns the identifier and whether it was rewritten.
fn resolve_id(raw: &RawPattern) -> (PatternId, bool) {
    let id = PatternId::parse(&raw.id);
    if let PatternId::Legacy(legacy) = &id {
        if let Some(alt) = raw.server_id.as_deref().filter(|alt| is_canonical(alt)) {
            debug!(legacy = %legacy, confirmed = %alt, "rewriting legacy identifier");
            return (PatternId::Confirmed(alt.to_string()), true);
        }
    }
    (id, false)
}

/// Converts a single server record (e.g. a create or update response).
#[must_use]
pub fn reconcile_one(raw: RawPattern) -> RecurringPattern {
    let (id, _) = resolve_id(&raw);
    if let PatternId::Legacy(legacy) = &id {
        warn!(id = %legacy, vendor = %raw.vendor, "server returned a non-canonical identifier");
    }
    raw.into_pattern(id)
}

/// Normalizes a server list: rewrites legacy identifiers that carry a
/// server-assigned alternate, then keeps the first occurrence of each
/// resulting identifier in input order.
#[must_use]
pub fn normalize(raw: Vec<RawPattern>) -> Vec<RecurringPattern> {
    normalize_with_report(raw).0
}

/// Same as [`normalize`], also returning what was changed.
#[must_use]
pub fn normalize_with_report(raw: Vec<RawPattern>) -> (Vec<RecurringPattern>, NormalizeReport) {
    let mut report = NormalizeReport::default();
    let mut seen: HashSet<PatternId> = HashSet::with_capacity(raw.len());
    let mut out = Vec::with_capacity(raw.len());

    for record in raw {
        let (id, rewritten) = resolve_id(&record);
        if rewritten {
            report.rewritten += 1;
        } else if let PatternId::Legacy(legacy) = &id {
            report.unresolved_legacy += 1;
            warn!(id = %legacy, vendor = %record.vendor, "legacy identifier without server alternate");
        }

        if seen.contains(&id) {
            report.duplicates_dropped += 1;
            debug!(id = %id, "dropping duplicate pattern");
            continue;
        }
        seen.insert(id.clone());
        out.push(record.into_pattern(id));
    }

    (out, report)
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;
    use crate::identifier::IdentifierClass;
    use crate::pattern::{Frequency, PatternDraft};

    const A: &str = "aaaaaaaaaaaaaaaaaaaaaaaa";
    const B: &str = "bbbbbbbbbbbbbbbbbbbbbbbb";

    fn raw(id: &str, vendor: &str) -> RawPattern {
        RawPattern::from_draft(
            id,
            PatternDraft::new(
                vendor,
                10.0,
                Frequency::Monthly,
                NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            ),
        )
    }

    #[test]
    fn test_normalize_keeps_first_occurrence_in_order() {
        let input = vec![raw(A, "first"), raw(B, "b"), raw(A, "second")];
        let (out, report) = normalize_with_report(input);
        let vendors: Vec<_> = out.iter().map(|p| p.vendor.as_str()).collect();
        assert_eq!(vendors, vec!["first", "b"]);
        assert_eq!(report.duplicates_dropped, 1);
    }

    #[test]
    fn test_normalize_rewrites_legacy_with_alternate() {
        let mut legacy = raw("manual_1", "Gym");
        legacy.server_id = Some(A.to_string());
        let out = normalize(vec![legacy]);
        assert_eq!(out[0].id, PatternId::Confirmed(A.to_string()));
    }

    #[test]
    fn test_rewritten_legacy_collides_with_confirmed() {
        let mut legacy = raw("manual_1", "legacy copy");
        legacy.server_id = Some(A.to_string());
        let (out, report) = normalize_with_report(vec![raw(A, "confirmed"), legacy]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].vendor, "confirmed");
        assert_eq!(report.rewritten, 1);
        assert_eq!(report.duplicates_dropped, 1);
    }

    #[test]
    fn test_legacy_without_usable_alternate_is_kept() {
        let mut bad_alt = raw("manual_2", "Water");
        bad_alt.server_id = Some("not-canonical".to_string());
        let (out, report) = normalize_with_report(vec![raw("manual_1", "Power"), bad_alt]);
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|p| p.id.class() == IdentifierClass::LegacyMalformed));
        assert_eq!(report.unresolved_legacy, 2);
    }

    #[test]
    fn test_normalize_is_idempotent_on_identifiers() {
        let input = vec![raw(A, "x"), raw(A, "y"), raw(B, "z"), raw(B, "w")];
        let once = normalize(input);
        let again: Vec<RawPattern> = once
            .iter()
            .map(|p| RawPattern::from_draft(p.id.to_string(), p.to_draft()))
            .collect();
        assert_eq!(normalize(again), once);
    }
}
