//! Certification lifecycle core: typed records, due-date derivation,
//! due-today scanning, fee summaries, sorted views and bulk-edit planning.
//!
//! Nothing in this crate performs I/O. Persistence lives in
//! `cert-tracker-store-json` and the recurring reminder loop in
//! `cert-tracker-reminders`.

use std::fmt::{Display, Formatter};

use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use time::{Date, Duration, Month, OffsetDateTime};

pub mod bulk;
pub mod query;

pub use bulk::{plan_bulk_edit, BulkEditPlan, BulkEditSummary, BulkOp, EditedRow};
pub use query::{due_soon, sorted_view, DueSoonEntry, SortKey, DEFAULT_DUE_SOON_WINDOW_DAYS};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CertError {
    #[error("validation error on `{field}`: {message}")]
    Validation { field: String, message: String },
    #[error("certification {0} not found")]
    NotFound(CertificationId),
    #[error("invalid date format: {0:?} (expected YYYY-MM-DD)")]
    InvalidFormat(String),
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl CertError {
    pub(crate) fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Prefixes the offending field of a validation error, leaving other
    /// variants untouched. Used to point at a row inside a batch.
    #[must_use]
    pub fn within(self, prefix: &str) -> Self {
        match self {
            Self::Validation { field, message } => Self::Validation {
                field: format!("{prefix}.{field}"),
                message,
            },
            other => other,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct CertificationId(pub u64);

impl Display for CertificationId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RenewalFrequency {
    None,
    Annual,
    Biennial,
    Triennial,
    Other,
}

impl RenewalFrequency {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Annual => "annual",
            Self::Biennial => "biennial",
            Self::Triennial => "triennial",
            Self::Other => "other",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "none" => Some(Self::None),
            "annual" => Some(Self::Annual),
            "biennial" => Some(Self::Biennial),
            "triennial" => Some(Self::Triennial),
            "other" => Some(Self::Other),
            _ => None,
        }
    }

    /// Number of years one fee payment covers. `None` for frequencies that do
    /// not contribute to the annualized total.
    #[must_use]
    pub fn period_years(self) -> Option<u32> {
        match self {
            Self::Annual => Some(1),
            Self::Biennial => Some(2),
            Self::Triennial => Some(3),
            Self::None | Self::Other => None,
        }
    }
}

/// Which dependent date a reminder or due-soon row refers to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum DueKind {
    #[serde(rename = "CE_DUE")]
    Ce,
    #[serde(rename = "AMF_DUE")]
    Amf,
    #[serde(rename = "EXPIRED")]
    Expiration,
}

impl DueKind {
    pub const ALL: [Self; 3] = [Self::Ce, Self::Amf, Self::Expiration];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ce => "CE_DUE",
            Self::Amf => "AMF_DUE",
            Self::Expiration => "EXPIRED",
        }
    }
}

/// A dependent date slot: either a calendar date or the explicit "no date
/// recorded" marker. Serialized as `"YYYY-MM-DD"` or JSON `null`.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum DueDate {
    Set(Date),
    Unset,
}

impl DueDate {
    #[must_use]
    pub fn is_unset(self) -> bool {
        matches!(self, Self::Unset)
    }

    #[must_use]
    pub fn as_date(self) -> Option<Date> {
        match self {
            Self::Set(date) => Some(date),
            Self::Unset => None,
        }
    }
}

impl From<Date> for DueDate {
    fn from(value: Date) -> Self {
        Self::Set(value)
    }
}

impl From<Option<Date>> for DueDate {
    fn from(value: Option<Date>) -> Self {
        value.map_or(Self::Unset, Self::Set)
    }
}

impl Display for DueDate {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Set(date) => f.write_str(&format_date(*date)),
            Self::Unset => f.write_str("unset"),
        }
    }
}

impl Serialize for DueDate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Set(date) => serializer.serialize_str(&format_date(*date)),
            Self::Unset => serializer.serialize_none(),
        }
    }
}

impl<'de> Deserialize<'de> for DueDate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(text) => parse_date(&text)
                .map(Self::Set)
                .map_err(serde::de::Error::custom),
            None => Ok(Self::Unset),
        }
    }
}

/// Serde adapter storing a required [`Date`] as `"YYYY-MM-DD"`.
pub mod iso_date {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::Date;

    /// # Errors
    /// Never fails for dates produced by [`crate::parse_date`].
    pub fn serialize<S: Serializer>(date: &Date, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&crate::format_date(*date))
    }

    /// # Errors
    /// Returns a serde error when the input is not a `YYYY-MM-DD` string.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Date, D::Error> {
        let text = String::deserialize(deserializer)?;
        crate::parse_date(&text).map_err(serde::de::Error::custom)
    }

    /// Same format for an optional date; absent maps to JSON `null`.
    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use time::Date;

        /// # Errors
        /// Never fails for dates produced by [`crate::parse_date`].
        #[allow(clippy::ref_option)]
        pub fn serialize<S: Serializer>(
            date: &Option<Date>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match date {
                Some(date) => serializer.serialize_str(&crate::format_date(*date)),
                None => serializer.serialize_none(),
            }
        }

        /// # Errors
        /// Returns a serde error when a present value is not `YYYY-MM-DD`.
        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Date>, D::Error> {
            match Option::<String>::deserialize(deserializer)? {
                Some(text) => crate::parse_date(&text)
                    .map(Some)
                    .map_err(serde::de::Error::custom),
                None => Ok(None),
            }
        }
    }
}

/// Parses a calendar date in the single accepted form `YYYY-MM-DD`.
///
/// # Errors
/// Returns [`CertError::InvalidFormat`] for any other shape, including
/// surrounding whitespace, missing zero padding, or out-of-range components.
pub fn parse_date(text: &str) -> Result<Date, CertError> {
    let bytes = text.as_bytes();
    let shape_ok = bytes.len() == 10
        && bytes
            .iter()
            .enumerate()
            .all(|(idx, byte)| match idx {
                4 | 7 => *byte == b'-',
                _ => byte.is_ascii_digit(),
            });
    if !shape_ok {
        return Err(CertError::InvalidFormat(text.to_string()));
    }

    Date::parse(text, time::macros::format_description!("[year]-[month]-[day]"))
        .map_err(|_| CertError::InvalidFormat(text.to_string()))
}

#[must_use]
pub fn format_date(date: Date) -> String {
    format!(
        "{:04}-{:02}-{:02}",
        date.year(),
        u8::from(date.month()),
        date.day()
    )
}

/// Signed whole-day difference `later - earlier`.
#[must_use]
pub fn days_between(earlier: Date, later: Date) -> i64 {
    (later - earlier).whole_days()
}

#[must_use]
pub fn today_utc() -> Date {
    OffsetDateTime::now_utc().date()
}

/// Shifts `date` by whole calendar years, keeping month and day. A Feb 29
/// anchor lands on Feb 28 when the target year is not a leap year.
///
/// # Errors
/// Returns [`CertError::Validation`] on `earned_date` when the result falls
/// outside the representable date range.
pub fn add_years(date: Date, years: u32) -> Result<Date, CertError> {
    let out_of_range = || CertError::validation("earned_date", "year offset leaves supported range");
    let offset = i32::try_from(years).map_err(|_| out_of_range())?;
    let year = date.year().checked_add(offset).ok_or_else(out_of_range)?;
    let month: Month = date.month();
    let day = date.day().min(time::util::days_in_year_month(year, month));
    Date::from_calendar_date(year, month, day).map_err(|_| out_of_range())
}

/// Adds whole days, failing instead of wrapping at the end of the calendar.
///
/// # Errors
/// Returns [`CertError::Validation`] when the result is not representable.
pub fn add_days(date: Date, days: i64) -> Result<Date, CertError> {
    date.checked_add(Duration::days(days))
        .ok_or_else(|| CertError::validation("window_days", "date window leaves supported range"))
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DerivationPolicy {
    pub ce_years: u32,
    pub amf_years: u32,
    pub expiration_years: u32,
}

impl Default for DerivationPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

impl DerivationPolicy {
    #[must_use]
    pub fn standard() -> Self {
        Self {
            ce_years: 3,
            amf_years: 1,
            expiration_years: 5,
        }
    }

    /// Validates the year offsets.
    ///
    /// # Errors
    /// Returns [`CertError::Configuration`] when an offset is outside `1..=100`.
    pub fn validate(&self) -> Result<(), CertError> {
        for (name, value) in [
            ("ce_years", self.ce_years),
            ("amf_years", self.amf_years),
            ("expiration_years", self.expiration_years),
        ] {
            if !(1..=100).contains(&value) {
                return Err(CertError::Configuration(format!(
                    "{name} MUST be in [1, 100], got {value}"
                )));
            }
        }
        Ok(())
    }

    /// Decodes and validates a policy from JSON.
    ///
    /// # Errors
    /// Returns [`CertError::Configuration`] when decoding fails or the decoded
    /// offsets are out of bounds.
    pub fn from_json(value: &Value) -> Result<Self, CertError> {
        let policy: Self = serde_json::from_value(value.clone()).map_err(|err| {
            CertError::Configuration(format!("invalid derivation policy JSON payload: {err}"))
        })?;
        policy.validate()?;
        Ok(policy)
    }
}

/// The three dependent dates, always handled as one unit so a record never
/// mixes stale and fresh values.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct DueDates {
    pub ce_due_date: DueDate,
    pub amf_due_date: DueDate,
    pub expiration_date: DueDate,
}

impl DueDates {
    #[must_use]
    pub fn unset() -> Self {
        Self {
            ce_due_date: DueDate::Unset,
            amf_due_date: DueDate::Unset,
            expiration_date: DueDate::Unset,
        }
    }

    #[must_use]
    pub fn get(&self, kind: DueKind) -> DueDate {
        match kind {
            DueKind::Ce => self.ce_due_date,
            DueKind::Amf => self.amf_due_date,
            DueKind::Expiration => self.expiration_date,
        }
    }
}

/// Derives CE, AMF and expiration dates from the anchor date.
///
/// # Errors
/// Returns [`CertError::Validation`] when an offset date is not representable.
pub fn derive(earned_date: Date, policy: &DerivationPolicy) -> Result<DueDates, CertError> {
    Ok(DueDates {
        ce_due_date: add_years(earned_date, policy.ce_years)?.into(),
        amf_due_date: add_years(earned_date, policy.amf_years)?.into(),
        expiration_date: add_years(earned_date, policy.expiration_years)?.into(),
    })
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CertificationRecord {
    pub id: CertificationId,
    pub name: String,
    pub issuer: String,
    pub external_cert_id: Option<String>,
    #[serde(with = "iso_date")]
    pub earned_date: Date,
    pub ce_due_date: DueDate,
    pub amf_due_date: DueDate,
    pub expiration_date: DueDate,
    pub fee: Decimal,
    pub renewal_frequency: RenewalFrequency,
}

impl CertificationRecord {
    #[must_use]
    pub fn due_dates(&self) -> DueDates {
        DueDates {
            ce_due_date: self.ce_due_date,
            amf_due_date: self.amf_due_date,
            expiration_date: self.expiration_date,
        }
    }

    #[must_use]
    pub fn due_date(&self, kind: DueKind) -> DueDate {
        self.due_dates().get(kind)
    }

    fn set_due_dates(&mut self, dates: DueDates) {
        self.ce_due_date = dates.ce_due_date;
        self.amf_due_date = dates.amf_due_date;
        self.expiration_date = dates.expiration_date;
    }

    /// Checks the field-level invariants of a stored record.
    ///
    /// # Errors
    /// Returns [`CertError::Validation`] naming the first offending field.
    pub fn validate(&self) -> Result<(), CertError> {
        validate_required_text("name", &self.name)?;
        validate_required_text("issuer", &self.issuer)?;
        validate_fee(self.fee)?;
        if let Some(external) = &self.external_cert_id {
            validate_required_text("external_cert_id", external)?;
        }
        Ok(())
    }

    /// Returns the record with `patch` applied. A changed `earned_date`
    /// re-derives all three dependent dates unless the patch also carries
    /// explicit overrides. Per-slot edits are laid over the result, so slots
    /// the patch does not touch follow the new anchor.
    ///
    /// # Errors
    /// Returns [`CertError::Validation`] when the patched record violates a
    /// field invariant or derivation overflows.
    pub fn apply_patch(
        &self,
        patch: &CertificationPatch,
        policy: &DerivationPolicy,
    ) -> Result<Self, CertError> {
        let mut next = self.clone();
        if let Some(name) = &patch.name {
            next.name = name.trim().to_string();
        }
        if let Some(issuer) = &patch.issuer {
            next.issuer = issuer.trim().to_string();
        }
        if let Some(external) = &patch.external_cert_id {
            next.external_cert_id = normalize_optional_text(external.as_deref());
        }
        if let Some(fee) = patch.fee {
            next.fee = fee;
        }
        if let Some(frequency) = patch.renewal_frequency {
            next.renewal_frequency = frequency;
        }

        let anchor_changed = patch
            .earned_date
            .is_some_and(|earned| earned != self.earned_date);
        if let Some(earned) = patch.earned_date {
            next.earned_date = earned;
        }

        let base_dates = match patch.due_dates {
            Some(overrides) => overrides,
            None if anchor_changed => derive(next.earned_date, policy)?,
            None => next.due_dates(),
        };
        next.set_due_dates(patch.due_date_edits.apply_to(base_dates));

        next.validate()?;
        Ok(next)
    }

    /// This record's yearly share of its maintenance fee.
    #[must_use]
    pub fn annualized_fee(&self) -> Decimal {
        match self.renewal_frequency.period_years() {
            Some(years) => self.fee / Decimal::from(years),
            None => Decimal::ZERO,
        }
    }
}

/// Input for creating a record. The store assigns the id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCertification {
    pub name: String,
    pub issuer: String,
    pub external_cert_id: Option<String>,
    pub earned_date: Option<Date>,
    /// Explicit overrides for all three dependent dates. `None` derives them.
    pub due_dates: Option<DueDates>,
    pub fee: Decimal,
    pub renewal_frequency: RenewalFrequency,
}

impl NewCertification {
    /// Builds the stored form of this input under `id`.
    ///
    /// # Errors
    /// Returns [`CertError::Validation`] when `name`, `issuer` or
    /// `earned_date` is missing, the fee is negative, or derivation overflows.
    pub fn into_record(
        self,
        id: CertificationId,
        policy: &DerivationPolicy,
    ) -> Result<CertificationRecord, CertError> {
        let Some(earned_date) = self.earned_date else {
            return Err(CertError::validation("earned_date", "earned_date is required"));
        };
        let due_dates = match self.due_dates {
            Some(overrides) => overrides,
            None => derive(earned_date, policy)?,
        };

        let record = CertificationRecord {
            id,
            name: self.name.trim().to_string(),
            issuer: self.issuer.trim().to_string(),
            external_cert_id: normalize_optional_text(self.external_cert_id.as_deref()),
            earned_date,
            ce_due_date: due_dates.ce_due_date,
            amf_due_date: due_dates.amf_due_date,
            expiration_date: due_dates.expiration_date,
            fee: self.fee,
            renewal_frequency: self.renewal_frequency,
        };
        record.validate()?;
        Ok(record)
    }
}

/// Edits to individual due-date slots. A `None` slot keeps its stored value,
/// or its freshly derived value when the anchor changes in the same patch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DueDateEdits {
    pub ce_due_date: Option<DueDate>,
    pub amf_due_date: Option<DueDate>,
    pub expiration_date: Option<DueDate>,
}

impl DueDateEdits {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    #[must_use]
    pub fn apply_to(self, dates: DueDates) -> DueDates {
        DueDates {
            ce_due_date: self.ce_due_date.unwrap_or(dates.ce_due_date),
            amf_due_date: self.amf_due_date.unwrap_or(dates.amf_due_date),
            expiration_date: self.expiration_date.unwrap_or(dates.expiration_date),
        }
    }
}

/// Partial update. `external_cert_id: Some(None)` clears the optional id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertificationPatch {
    pub name: Option<String>,
    pub issuer: Option<String>,
    pub external_cert_id: Option<Option<String>>,
    pub earned_date: Option<Date>,
    /// Replaces all three slots at once.
    pub due_dates: Option<DueDates>,
    pub due_date_edits: DueDateEdits,
    pub fee: Option<Decimal>,
    pub renewal_frequency: Option<RenewalFrequency>,
}

impl CertificationPatch {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReminderEvent {
    pub certification_id: CertificationId,
    pub name: String,
    pub kind: DueKind,
    #[serde(with = "iso_date")]
    pub due_date: Date,
}

/// Point-in-time check: one event per (record, kind) whose date equals
/// `today` exactly. Dates already in the past never fire.
#[must_use]
pub fn due_today(records: &[CertificationRecord], today: Date) -> Vec<ReminderEvent> {
    let mut events = Vec::new();
    for record in records {
        for kind in DueKind::ALL {
            if record.due_date(kind) == DueDate::Set(today) {
                events.push(ReminderEvent {
                    certification_id: record.id,
                    name: record.name.clone(),
                    kind,
                    due_date: today,
                });
            }
        }
    }
    events
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeeSummary {
    pub total_annualized_fee: Decimal,
    pub certifications_tracked: usize,
}

#[must_use]
pub fn summarize_fees(records: &[CertificationRecord]) -> FeeSummary {
    let total: Decimal = records
        .iter()
        .map(CertificationRecord::annualized_fee)
        .sum();
    FeeSummary {
        total_annualized_fee: total.round_dp(2),
        certifications_tracked: records.len(),
    }
}

fn validate_required_text(field: &str, value: &str) -> Result<(), CertError> {
    if value.trim().is_empty() {
        return Err(CertError::validation(
            field,
            format!("{field} MUST be non-empty"),
        ));
    }
    Ok(())
}

fn validate_fee(fee: Decimal) -> Result<(), CertError> {
    if fee.is_sign_negative() && !fee.is_zero() {
        return Err(CertError::validation("fee", "fee MUST be >= 0"));
    }
    Ok(())
}

fn normalize_optional_text(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(ToString::to_string)
}
