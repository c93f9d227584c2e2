//! Recurring pattern data model.
//!
//! A [`RecurringPattern`] is one tracked bill or recurring expense. Server
//! responses arrive as [`RawPattern`] and are turned into patterns by
//! [`crate::reconcile::normalize`]. Consumers create patterns from a
//! [`PatternDraft`] and change them with a [`PatternPatch`].

use std::fmt;
use std::str::FromStr;

use chrono::{Duration, Months, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::identifier::PatternId;

/// How often a pattern recurs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    /// Every 7 days.
    Weekly,
    /// Same day each month.
    Monthly,
    /// Every 3 months.
    Quarterly,
    /// Same date each year.
    Yearly,
}

impl Frequency {
    /// Advances `date` by one period.
    ///
    /// Month arithmetic clamps to the last day of the target month, so
    /// January 31 plus one month is the last day of February.
    ///
    /// # Examples
    ///
    /// ```
    /// use billsync::Frequency;
    /// use chrono::NaiveDate;
    ///
    /// let jan31 = NaiveDate::from_ymd_opt(2025, 1, 31).unwrap();
    /// assert_eq!(Frequency::Monthly.advance(jan31), NaiveDate::from_ymd_opt(2025, 2, 28).unwrap());
    /// ```
    #[must_use]
    pub fn advance(self, date: NaiveDate) -> NaiveDate {
        let next = match self {
            Self::Weekly => date.checked_add_signed(Duration::days(7)),
            Self::Monthly => date.checked_add_months(Months::new(1)),
            Self::Quarterly => date.checked_add_months(Months::new(3)),
            Self::Yearly => date.checked_add_months(Months::new(12)),
        };
        // Only overflows at the end of chrono's representable range.
        next.unwrap_or(date)
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Weekly => write!(f, "weekly"),
            Self::Monthly => write!(f, "monthly"),
            Self::Quarterly => write!(f, "quarterly"),
            Self::Yearly => write!(f, "yearly"),
        }
    }
}

impl FromStr for Frequency {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "weekly" => Ok(Self::Weekly),
            "monthly" => Ok(Self::Monthly),
            "quarterly" => Ok(Self::Quarterly),
            "yearly" | "annual" | "annually" => Ok(Self::Yearly),
            _ => Err(ValidationError::UnknownFrequency {
                value: s.to_string(),
            }),
        }
    }
}

/// Where a pattern's icon comes from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppearanceMode {
    /// User-picked icon and color.
    Custom,
    /// Vendor brand artwork.
    Brand,
    /// Generic icon.
    #[default]
    Default,
}

impl fmt::Display for AppearanceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Custom => write!(f, "custom"),
            Self::Brand => write!(f, "brand"),
            Self::Default => write!(f, "default"),
        }
    }
}

impl FromStr for AppearanceMode {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "custom" => Ok(Self::Custom),
            "brand" => Ok(Self::Brand),
            "default" => Ok(Self::Default),
            _ => Err(ValidationError::UnknownAppearanceMode {
                value: s.to_string(),
            }),
        }
    }
}

/// Display appearance of a pattern.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Appearance {
    /// Icon source.
    pub mode: AppearanceMode,
    /// Icon name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    /// Color, usually a hex string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

impl Appearance {
    /// Custom appearance with an icon and color.
    #[must_use]
    pub fn custom(icon: impl Into<String>, color: impl Into<String>) -> Self {
        Self {
            mode: AppearanceMode::Custom,
            icon: Some(icon.into()),
            color: Some(color.into()),
        }
    }

    /// Brand appearance using the vendor's artwork.
    #[must_use]
    pub fn brand(icon: impl Into<String>) -> Self {
        Self {
            mode: AppearanceMode::Brand,
            icon: Some(icon.into()),
            color: None,
        }
    }
}

fn validate_vendor(vendor: &str) -> Result<(), ValidationError> {
    if vendor.trim().is_empty() {
        return Err(ValidationError::EmptyVendor);
    }
    Ok(())
}

fn validate_amount(amount: f64) -> Result<(), ValidationError> {
    if !amount.is_finite() || amount < 0.0 {
        return Err(ValidationError::InvalidAmount { value: amount });
    }
    Ok(())
}

/// A tracked recurring bill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecurringPattern {
    /// Unique within a store.
    pub id: PatternId,
    /// Who the bill is paid to.
    pub vendor: String,
    /// Amount per period.
    pub amount: f64,
    /// Recurrence.
    pub frequency: Frequency,
    /// Next date the bill is due.
    pub next_expected_date: NaiveDate,
    /// Display appearance.
    #[serde(default)]
    pub appearance: Appearance,
}

impl RecurringPattern {
    /// Builds a pattern from a draft under the given identifier.
    #[must_use]
    pub fn from_draft(id: PatternId, draft: PatternDraft) -> Self {
        Self {
            id,
            vendor: draft.vendor,
            amount: draft.amount,
            frequency: draft.frequency,
            next_expected_date: draft.next_expected_date,
            appearance: draft.appearance,
        }
    }

    /// Returns the fields of this pattern as a create payload.
    #[must_use]
    pub fn to_draft(&self) -> PatternDraft {
        PatternDraft {
            vendor: self.vendor.clone(),
            amount: self.amount,
            frequency: self.frequency,
            next_expected_date: self.next_expected_date,
            appearance: self.appearance.clone(),
        }
    }
}

/// Payload for creating a pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternDraft {
    /// Who the bill is paid to.
    pub vendor: String,
    /// Amount per period.
    pub amount: f64,
    /// Recurrence.
    pub frequency: Frequency,
    /// Next date the bill is due.
    pub next_expected_date: NaiveDate,
    /// Display appearance.
    #[serde(default)]
    pub appearance: Appearance,
}

impl PatternDraft {
    /// Creates a draft with the default appearance.
    #[must_use]
    pub fn new(
        vendor: impl Into<String>,
        amount: f64,
        frequency: Frequency,
        next_expected_date: NaiveDate,
    ) -> Self {
        Self {
            vendor: vendor.into(),
            amount,
            frequency,
            next_expected_date,
            appearance: Appearance::default(),
        }
    }

    /// Sets the appearance.
    #[must_use]
    pub fn with_appearance(mut self, appearance: Appearance) -> Self {
        self.appearance = appearance;
        self
    }

    /// Minimal draft used when an update targets a pattern the store no longer has.
    #[must_use]
    pub fn fallback() -> Self {
        Self::new("Untitled bill", 0.0, Frequency::Monthly, Utc::now().date_naive())
    }

    /// Checks the draft invariants.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError` for an empty vendor or a negative/non-finite amount.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_vendor(&self.vendor)?;
        validate_amount(self.amount)
    }
}

/// Partial update of a pattern. `None` fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternPatch {
    /// New vendor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
    /// New amount.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,
    /// New recurrence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency: Option<Frequency>,
    /// New due date.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_expected_date: Option<NaiveDate>,
    /// New appearance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub appearance: Option<Appearance>,
}

impl PatternPatch {
    /// Sets the vendor.
    #[must_use]
    pub fn vendor(mut self, vendor: impl Into<String>) -> Self {
        self.vendor = Some(vendor.into());
        self
    }

    /// Sets the amount.
    #[must_use]
    pub fn amount(mut self, amount: f64) -> Self {
        self.amount = Some(amount);
        self
    }

    /// Sets the frequency.
    #[must_use]
    pub fn frequency(mut self, frequency: Frequency) -> Self {
        self.frequency = Some(frequency);
        self
    }

    /// Sets the next due date.
    #[must_use]
    pub fn next_expected_date(mut self, date: NaiveDate) -> Self {
        self.next_expected_date = Some(date);
        self
    }

    /// Sets the appearance.
    #[must_use]
    pub fn appearance(mut self, appearance: Appearance) -> Self {
        self.appearance = Some(appearance);
        self
    }

    /// Checks the fields this patch sets.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError` if a set field violates the pattern invariants.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(vendor) = &self.vendor {
            validate_vendor(vendor)?;
        }
        if let Some(amount) = self.amount {
            validate_amount(amount)?;
        }
        Ok(())
    }

    /// Applies the patch in place.
    pub fn apply_to(&self, pattern: &mut RecurringPattern) {
        if let Some(vendor) = &self.vendor {
            pattern.vendor.clone_from(vendor);
        }
        if let Some(amount) = self.amount {
            pattern.amount = amount;
        }
        if let Some(frequency) = self.frequency {
            pattern.frequency = frequency;
        }
        if let Some(date) = self.next_expected_date {
            pattern.next_expected_date = date;
        }
        if let Some(appearance) = &self.appearance {
            pattern.appearance = appearance.clone();
        }
    }

    /// Merges the patch over a full draft, producing a create payload.
    #[must_use]
    pub fn merge_over(&self, base: PatternDraft) -> PatternDraft {
        PatternDraft {
            vendor: self.vendor.clone().unwrap_or(base.vendor),
            amount: self.amount.unwrap_or(base.amount),
            frequency: self.frequency.unwrap_or(base.frequency),
            next_expected_date: self.next_expected_date.unwrap_or(base.next_expected_date),
            appearance: self.appearance.clone().unwrap_or(base.appearance),
        }
    }
}

/// A pattern as returned by the server, before identifier reconciliation.
///
/// Older records expose a non-canonical `id` while carrying the real server
/// identifier in `_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPattern {
    /// Identifier as stored by the server; may be legacy.
    pub id: String,
    /// Server-assigned alternate identifier carried by older records.
    #[serde(rename = "_id", alias = "serverId", default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    /// Vendor.
    pub vendor: String,
    /// Amount per period.
    pub amount: f64,
    /// Recurrence.
    pub frequency: Frequency,
    /// Next due date.
    pub next_expected_date: NaiveDate,
    /// Display appearance.
    #[serde(default)]
    pub appearance: Appearance,
}

impl RawPattern {
    /// Builds a server record for a draft.
    #[must_use]
    pub fn from_draft(id: impl Into<String>, draft: PatternDraft) -> Self {
        Self {
            id: id.into(),
            server_id: None,
            vendor: draft.vendor,
            amount: draft.amount,
            frequency: draft.frequency,
            next_expected_date: draft.next_expected_date,
            appearance: draft.appearance,
        }
    }

    /// Converts into a pattern under the given identifier.
    #[must_use]
    pub fn into_pattern(self, id: PatternId) -> RecurringPattern {
        RecurringPattern {
            id,
            vendor: self.vendor,
            amount: self.amount,
            frequency: self.frequency,
            next_expected_date: self.next_expected_date,
            appearance: self.appearance,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn netflix() -> RecurringPattern {
        RecurringPattern::from_draft(
            PatternId::parse("5f1a2b3c4d5e6f7a8b9c0db2"),
            PatternDraft::new("Netflix", 15.99, Frequency::Monthly, date(2025, 3, 14)),
        )
    }

    #[test]
    fn test_frequency_advance() {
        let d = date(2025, 3, 14);
        assert_eq!(Frequency::Weekly.advance(d), date(2025, 3, 21));
        assert_eq!(Frequency::Monthly.advance(d), date(2025, 4, 14));
        assert_eq!(Frequency::Quarterly.advance(d), date(2025, 6, 14));
        assert_eq!(Frequency::Yearly.advance(d), date(2026, 3, 14));
    }

    #[test]
    fn test_frequency_advance_clamps_month_end() {
        assert_eq!(Frequency::Monthly.advance(date(2024, 1, 31)), date(2024, 2, 29));
        assert_eq!(Frequency::Quarterly.advance(date(2025, 11, 30)), date(2026, 2, 28));
        assert_eq!(Frequency::Yearly.advance(date(2024, 2, 29)), date(2025, 2, 28));
    }

    #[test]
    fn test_frequency_parse() {
        assert_eq!("Monthly".parse::<Frequency>().unwrap(), Frequency::Monthly);
        assert_eq!("annual".parse::<Frequency>().unwrap(), Frequency::Yearly);
        assert!(matches!(
            "daily".parse::<Frequency>(),
            Err(ValidationError::UnknownFrequency { .. })
        ));
    }

    #[test]
    fn test_draft_validation() {
        let ok = PatternDraft::new("Rent", 1200.0, Frequency::Monthly, date(2025, 1, 1));
        assert!(ok.validate().is_ok());

        let empty = PatternDraft::new("  ", 10.0, Frequency::Monthly, date(2025, 1, 1));
        assert_eq!(empty.validate(), Err(ValidationError::EmptyVendor));

        let negative = PatternDraft::new("Gym", -1.0, Frequency::Monthly, date(2025, 1, 1));
        assert!(matches!(negative.validate(), Err(ValidationError::InvalidAmount { .. })));

        let nan = PatternDraft::new("Gym", f64::NAN, Frequency::Monthly, date(2025, 1, 1));
        assert!(nan.validate().is_err());
    }

    #[test]
    fn test_patch_apply_only_touches_set_fields() {
        let mut pattern = netflix();
        let before = pattern.clone();
        PatternPatch::default().amount(17.99).apply_to(&mut pattern);
        assert!((pattern.amount - 17.99).abs() < f64::EPSILON);
        assert_eq!(pattern.vendor, before.vendor);
        assert_eq!(pattern.next_expected_date, before.next_expected_date);
    }

    #[test]
    fn test_patch_merge_over_draft() {
        let base = netflix().to_draft();
        let merged = PatternPatch::default()
            .vendor("Netflix Premium")
            .appearance(Appearance::brand("netflix"))
            .merge_over(base.clone());
        assert_eq!(merged.vendor, "Netflix Premium");
        assert_eq!(merged.frequency, base.frequency);
        assert_eq!(merged.appearance.mode, AppearanceMode::Brand);
    }

    #[test]
    fn test_raw_pattern_reads_alternate_id() {
        let json = r##"{
            "id": "manual_17",
            "_id": "5f1a2b3c4d5e6f7a8b9c0db2",
            "vendor": "Spotify",
            "amount": 9.99,
            "frequency": "monthly",
            "nextExpectedDate": "2025-05-01",
            "appearance": { "mode": "custom", "icon": "music", "color": "#1db954" }
        }"##;
        let raw: RawPattern = serde_json::from_str(json).unwrap();
        assert_eq!(raw.server_id.as_deref(), Some("5f1a2b3c4d5e6f7a8b9c0db2"));
        assert_eq!(raw.appearance.mode, AppearanceMode::Custom);
        assert_eq!(raw.appearance.color.as_deref(), Some("#1db954"));
    }
}
