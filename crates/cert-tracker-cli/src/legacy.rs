//! Reader for the older flat certification export.
//!
//! That layout is a bare JSON array of objects keyed `name`, `issuer`,
//! `cert_id`, `date`, `expires`, `fee` and `renewal_frequency`, with display
//! labels for the frequency and the string `"N/A"` for a missing expiration.
//! Everything is converted to typed values here so nothing past this module
//! sees sentinels or labels.

use std::str::FromStr;

use cert_tracker_core::{
    derive, parse_date, CertError, DerivationPolicy, DueDate, DueDates, NewCertification,
    RenewalFrequency,
};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;

const MISSING_DATE_MARKERS: [&str; 4] = ["", "N/A", "NAT", "NONE"];

#[derive(Debug, Deserialize)]
struct LegacyCertification {
    #[serde(default)]
    name: String,
    #[serde(default)]
    issuer: String,
    #[serde(default)]
    cert_id: Value,
    #[serde(default)]
    date: String,
    #[serde(default)]
    expires: Value,
    #[serde(default)]
    fee: Value,
    #[serde(default)]
    renewal_frequency: Value,
}

/// Parses a legacy export into creation inputs. CE and AMF dates are derived
/// from `date` under `policy`; the stored expiration is kept as-is.
///
/// # Errors
/// Returns [`CertError::InvalidFormat`] when the body is not a JSON array, or
/// a [`CertError::Validation`] prefixed with `rows[i]` for the first row that
/// cannot be converted.
pub fn parse_legacy_export(
    body: &str,
    policy: &DerivationPolicy,
) -> Result<Vec<NewCertification>, CertError> {
    let rows: Vec<LegacyCertification> = serde_json::from_str(body).map_err(|err| {
        CertError::InvalidFormat(format!("legacy export is not a JSON array of objects: {err}"))
    })?;

    rows.into_iter()
        .enumerate()
        .map(|(idx, row)| {
            convert_row(row, policy).map_err(|err| err.within(&format!("rows[{idx}]")))
        })
        .collect()
}

fn convert_row(
    row: LegacyCertification,
    policy: &DerivationPolicy,
) -> Result<NewCertification, CertError> {
    let earned_date = parse_date(row.date.trim()).map_err(|err| invalid("date", &err))?;
    let derived = derive(earned_date, policy)?;
    let expiration_date = legacy_expiration(&row.expires)?;

    Ok(NewCertification {
        name: row.name,
        issuer: row.issuer,
        external_cert_id: legacy_cert_id(&row.cert_id),
        earned_date: Some(earned_date),
        due_dates: Some(DueDates {
            ce_due_date: derived.ce_due_date,
            amf_due_date: derived.amf_due_date,
            expiration_date,
        }),
        fee: legacy_fee(&row.fee)?,
        renewal_frequency: legacy_frequency(&row.renewal_frequency)?,
    })
}

fn invalid(field: &str, err: &CertError) -> CertError {
    CertError::Validation {
        field: field.to_string(),
        message: err.to_string(),
    }
}

fn legacy_cert_id(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn legacy_expiration(value: &Value) -> Result<DueDate, CertError> {
    let text = match value {
        Value::Null => return Ok(DueDate::Unset),
        Value::String(text) => text.trim(),
        other => {
            return Err(CertError::Validation {
                field: "expires".to_string(),
                message: format!("expected a date string, got {other}"),
            })
        }
    };
    if MISSING_DATE_MARKERS
        .iter()
        .any(|marker| text.eq_ignore_ascii_case(marker))
    {
        return Ok(DueDate::Unset);
    }
    parse_date(text)
        .map(DueDate::Set)
        .map_err(|err| invalid("expires", &err))
}

fn legacy_fee(value: &Value) -> Result<Decimal, CertError> {
    let text = match value {
        Value::Null => return Ok(Decimal::ZERO),
        Value::Number(number) => number.to_string(),
        Value::String(text) if text.trim().is_empty() => return Ok(Decimal::ZERO),
        Value::String(text) => text.trim().to_string(),
        other => {
            return Err(CertError::Validation {
                field: "fee".to_string(),
                message: format!("expected a number, got {other}"),
            })
        }
    };
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .map(|fee| fee.round_dp(2))
        .map_err(|err| CertError::Validation {
            field: "fee".to_string(),
            message: format!("{text:?} is not a decimal amount: {err}"),
        })
}

fn legacy_frequency(value: &Value) -> Result<RenewalFrequency, CertError> {
    let label = match value {
        Value::Null => return Ok(RenewalFrequency::None),
        Value::String(text) => text.trim(),
        other => {
            return Err(CertError::Validation {
                field: "renewal_frequency".to_string(),
                message: format!("expected a label, got {other}"),
            })
        }
    };

    let frequency = match label {
        "" | "None/One-Time" => Some(RenewalFrequency::None),
        "Annual" => Some(RenewalFrequency::Annual),
        "Biennial (Every 2 years)" => Some(RenewalFrequency::Biennial),
        "Triennial (Every 3 years)" => Some(RenewalFrequency::Triennial),
        "Other" => Some(RenewalFrequency::Other),
        canonical => RenewalFrequency::parse(canonical),
    };
    frequency.ok_or_else(|| CertError::Validation {
        field: "renewal_frequency".to_string(),
        message: format!("unknown renewal frequency label {label:?}"),
    })
}
