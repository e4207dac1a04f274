//! Read-only views over a record snapshot: sorted listings and the
//! "due soon" window.

use std::cmp::Ordering;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::Date;

use crate::{add_days, days_between, iso_date, CertError, CertificationRecord, DueKind};

pub const DEFAULT_DUE_SOON_WINDOW_DAYS: u32 = 180;

/// Due kinds considered by [`due_soon`], in tie-break order.
const DUE_SOON_KINDS: [DueKind; 2] = [DueKind::Expiration, DueKind::Amf];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    Name,
    Issuer,
    EarnedDate,
    CeDueDate,
    AmfDueDate,
    ExpirationDate,
    Fee,
    ExternalCertId,
}

impl SortKey {
    pub const DEFAULT: Self = Self::EarnedDate;

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Name => "name",
            Self::Issuer => "issuer",
            Self::EarnedDate => "earned_date",
            Self::CeDueDate => "ce_due_date",
            Self::AmfDueDate => "amf_due_date",
            Self::ExpirationDate => "expiration_date",
            Self::Fee => "fee",
            Self::ExternalCertId => "external_cert_id",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "name" => Some(Self::Name),
            "issuer" => Some(Self::Issuer),
            "earned_date" => Some(Self::EarnedDate),
            "ce_due_date" => Some(Self::CeDueDate),
            "amf_due_date" => Some(Self::AmfDueDate),
            "expiration_date" => Some(Self::ExpirationDate),
            "fee" => Some(Self::Fee),
            "external_cert_id" => Some(Self::ExternalCertId),
            _ => None,
        }
    }

    /// Unknown names fall back to [`SortKey::DEFAULT`] instead of failing.
    #[must_use]
    pub fn parse_or_default(value: &str) -> Self {
        Self::parse(value).unwrap_or(Self::DEFAULT)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum SortValue<'a> {
    Text(&'a str),
    Date(Date),
    Fee(Decimal),
}

fn sort_value(record: &CertificationRecord, key: SortKey) -> Option<SortValue<'_>> {
    match key {
        SortKey::Name => Some(SortValue::Text(&record.name)),
        SortKey::Issuer => Some(SortValue::Text(&record.issuer)),
        SortKey::EarnedDate => Some(SortValue::Date(record.earned_date)),
        SortKey::CeDueDate => record.ce_due_date.as_date().map(SortValue::Date),
        SortKey::AmfDueDate => record.amf_due_date.as_date().map(SortValue::Date),
        SortKey::ExpirationDate => record.expiration_date.as_date().map(SortValue::Date),
        SortKey::Fee => Some(SortValue::Fee(record.fee)),
        SortKey::ExternalCertId => record.external_cert_id.as_deref().map(SortValue::Text),
    }
}

/// Stable sort by `key`. Records without a value for the key go last in
/// both directions.
#[must_use]
pub fn sorted_view(
    records: &[CertificationRecord],
    key: SortKey,
    ascending: bool,
) -> Vec<CertificationRecord> {
    let mut view = records.to_vec();
    view.sort_by(|lhs, rhs| {
        match (sort_value(lhs, key), sort_value(rhs, key)) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(left), Some(right)) if ascending => left.cmp(&right),
            (Some(left), Some(right)) => right.cmp(&left),
        }
    });
    view
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DueSoonEntry {
    pub record: CertificationRecord,
    pub due_kind: DueKind,
    #[serde(with = "iso_date")]
    pub due_date: Date,
    pub days_left: i64,
}

/// Records whose AMF or expiration date falls in `[today, today + window_days]`,
/// each reported once with its closest qualifying date, ordered by that date.
///
/// # Errors
/// Returns [`CertError::Validation`] when the window end is not a
/// representable date.
pub fn due_soon(
    records: &[CertificationRecord],
    window_days: u32,
    today: Date,
) -> Result<Vec<DueSoonEntry>, CertError> {
    let window_end = add_days(today, i64::from(window_days))?;

    let mut entries: Vec<DueSoonEntry> = records
        .iter()
        .filter_map(|record| {
            DUE_SOON_KINDS
                .iter()
                .filter_map(|kind| {
                    record
                        .due_date(*kind)
                        .as_date()
                        .filter(|date| (today..=window_end).contains(date))
                        .map(|date| (*kind, date))
                })
                .fold(None, |closest: Option<(DueKind, Date)>, candidate| match closest {
                    Some(current) if current.1 <= candidate.1 => Some(current),
                    _ => Some(candidate),
                })
                .map(|(due_kind, due_date)| DueSoonEntry {
                    record: record.clone(),
                    due_kind,
                    due_date,
                    days_left: days_between(today, due_date),
                })
        })
        .collect();

    entries.sort_by_key(|entry| entry.due_date);
    Ok(entries)
}
