//! Bulk-edit reconciliation between the snapshot an editor loaded and the
//! snapshot it submitted back.
//!
//! [`plan_bulk_edit`] turns the two snapshots into an ordered list of
//! add/update/delete operations. [`BulkEditPlan::apply`] replays that list on
//! top of a table and either produces the complete next table or fails
//! without side effects, so callers can swap tables atomically.

use std::collections::{BTreeMap, BTreeSet};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::Date;

use crate::{
    iso_date, CertError, CertificationId, CertificationPatch, CertificationRecord,
    DerivationPolicy, DueDate, DueDateEdits, DueDates, NewCertification, RenewalFrequency,
};

/// One row of a submitted grid snapshot. `id` is absent for rows the editor
/// added. Added rows with all three due dates unset get derived dates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EditedRow {
    #[serde(default)]
    pub id: Option<CertificationId>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub issuer: String,
    #[serde(default)]
    pub external_cert_id: Option<String>,
    #[serde(default, with = "iso_date::option")]
    pub earned_date: Option<Date>,
    #[serde(default = "unset_due_date")]
    pub ce_due_date: DueDate,
    #[serde(default = "unset_due_date")]
    pub amf_due_date: DueDate,
    #[serde(default = "unset_due_date")]
    pub expiration_date: DueDate,
    #[serde(default)]
    pub fee: Decimal,
    pub renewal_frequency: RenewalFrequency,
}

fn unset_due_date() -> DueDate {
    DueDate::Unset
}

impl EditedRow {
    #[must_use]
    pub fn due_dates(&self) -> DueDates {
        DueDates {
            ce_due_date: self.ce_due_date,
            amf_due_date: self.amf_due_date,
            expiration_date: self.expiration_date,
        }
    }

    /// Checks required fields without touching any table.
    ///
    /// # Errors
    /// Returns [`CertError::Validation`] naming the offending field.
    pub fn validate(&self) -> Result<(), CertError> {
        if self.name.trim().is_empty() {
            return Err(CertError::validation("name", "name MUST be non-empty"));
        }
        if self.issuer.trim().is_empty() {
            return Err(CertError::validation("issuer", "issuer MUST be non-empty"));
        }
        if self.earned_date.is_none() {
            return Err(CertError::validation("earned_date", "earned_date is required"));
        }
        if self.fee.is_sign_negative() && !self.fee.is_zero() {
            return Err(CertError::validation("fee", "fee MUST be >= 0"));
        }
        Ok(())
    }

    #[must_use]
    pub fn from_record(record: &CertificationRecord) -> Self {
        Self {
            id: Some(record.id),
            name: record.name.clone(),
            issuer: record.issuer.clone(),
            external_cert_id: record.external_cert_id.clone(),
            earned_date: Some(record.earned_date),
            ce_due_date: record.ce_due_date,
            amf_due_date: record.amf_due_date,
            expiration_date: record.expiration_date,
            fee: record.fee,
            renewal_frequency: record.renewal_frequency,
        }
    }

    fn into_new_certification(self) -> NewCertification {
        let due_dates = self.due_dates();
        NewCertification {
            name: self.name,
            issuer: self.issuer,
            external_cert_id: self.external_cert_id,
            earned_date: self.earned_date,
            due_dates: if due_dates == DueDates::unset() {
                None
            } else {
                Some(due_dates)
            },
            fee: self.fee,
            renewal_frequency: self.renewal_frequency,
        }
    }

    fn patch_against(&self, base: &CertificationRecord) -> CertificationPatch {
        let name = self.name.trim();
        let issuer = self.issuer.trim();
        let external = self
            .external_cert_id
            .as_deref()
            .map(str::trim)
            .filter(|text| !text.is_empty());

        CertificationPatch {
            name: (name != base.name).then(|| name.to_string()),
            issuer: (issuer != base.issuer).then(|| issuer.to_string()),
            external_cert_id: (external != base.external_cert_id.as_deref())
                .then(|| external.map(ToString::to_string)),
            earned_date: self.earned_date.filter(|earned| *earned != base.earned_date),
            due_dates: None,
            due_date_edits: DueDateEdits {
                ce_due_date: (self.ce_due_date != base.ce_due_date).then_some(self.ce_due_date),
                amf_due_date: (self.amf_due_date != base.amf_due_date)
                    .then_some(self.amf_due_date),
                expiration_date: (self.expiration_date != base.expiration_date)
                    .then_some(self.expiration_date),
            },
            fee: (self.fee != base.fee).then_some(self.fee),
            renewal_frequency: (self.renewal_frequency != base.renewal_frequency)
                .then_some(self.renewal_frequency),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BulkOp {
    Add(NewCertification),
    Update {
        id: CertificationId,
        patch: CertificationPatch,
    },
    Delete(CertificationId),
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BulkEditSummary {
    pub added: usize,
    pub updated: usize,
    pub deleted: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkEditPlan {
    pub ops: Vec<BulkOp>,
}

impl BulkEditPlan {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    #[must_use]
    pub fn summary(&self) -> BulkEditSummary {
        let mut summary = BulkEditSummary::default();
        for op in &self.ops {
            match op {
                BulkOp::Add(_) => summary.added += 1,
                BulkOp::Update { .. } => summary.updated += 1,
                BulkOp::Delete(_) => summary.deleted += 1,
            }
        }
        summary
    }

    /// Replays the plan on a copy of `table`. New ids are drawn from
    /// `next_id`, which only advances when the whole plan succeeds.
    ///
    /// # Errors
    /// Returns [`CertError::NotFound`] when an update or delete targets an id
    /// missing from `table`, or [`CertError::Validation`] when an operation
    /// produces an invalid record. `table` and `next_id` are untouched on error.
    pub fn apply(
        &self,
        table: &[CertificationRecord],
        next_id: &mut u64,
        policy: &DerivationPolicy,
    ) -> Result<Vec<CertificationRecord>, CertError> {
        let mut working = table.to_vec();
        let mut counter = *next_id;

        for (idx, op) in self.ops.iter().enumerate() {
            let at = format!("ops[{idx}]");
            match op {
                BulkOp::Add(input) => {
                    let record = input
                        .clone()
                        .into_record(CertificationId(counter), policy)
                        .map_err(|err| err.within(&at))?;
                    counter = counter.checked_add(1).ok_or_else(|| {
                        CertError::Persistence("certification id space exhausted".to_string())
                    })?;
                    working.push(record);
                }
                BulkOp::Update { id, patch } => {
                    let position = position_of(&working, *id)?;
                    working[position] = working[position]
                        .apply_patch(patch, policy)
                        .map_err(|err| err.within(&at))?;
                }
                BulkOp::Delete(id) => {
                    let position = position_of(&working, *id)?;
                    working.remove(position);
                }
            }
        }

        *next_id = counter;
        Ok(working)
    }
}

fn position_of(table: &[CertificationRecord], id: CertificationId) -> Result<usize, CertError> {
    table
        .iter()
        .position(|record| record.id == id)
        .ok_or(CertError::NotFound(id))
}

/// Diffs the submitted snapshot against the snapshot it was edited from.
///
/// Rows without an id become adds, rows whose fields differ from their loaded
/// counterpart become updates, and loaded ids missing from the submission
/// become deletes. Only due-date cells that differ from the loaded row are
/// carried as edits, so when `earned_date` changes the untouched cells are
/// re-derived from the new anchor.
///
/// # Errors
/// Returns [`CertError::Validation`] with a `rows[i].<field>` path when any
/// submitted row is malformed, repeats an id, or names an id that was not in
/// the loaded snapshot. No plan is produced in that case.
pub fn plan_bulk_edit(
    loaded: &[CertificationRecord],
    submitted: &[EditedRow],
) -> Result<BulkEditPlan, CertError> {
    let base: BTreeMap<CertificationId, &CertificationRecord> =
        loaded.iter().map(|record| (record.id, record)).collect();
    let mut seen = BTreeSet::new();
    let mut updates = Vec::new();
    let mut adds = Vec::new();

    for (idx, row) in submitted.iter().enumerate() {
        let at = format!("rows[{idx}]");
        row.validate().map_err(|err| err.within(&at))?;

        match row.id {
            Some(id) => {
                if !seen.insert(id) {
                    return Err(CertError::validation(
                        format!("{at}.id"),
                        format!("id {id} appears more than once"),
                    ));
                }
                let Some(original) = base.get(&id) else {
                    return Err(CertError::validation(
                        format!("{at}.id"),
                        format!("id {id} was not part of the loaded snapshot"),
                    ));
                };
                let patch = row.patch_against(original);
                if !patch.is_empty() {
                    updates.push(BulkOp::Update { id, patch });
                }
            }
            None => adds.push(BulkOp::Add(row.clone().into_new_certification())),
        }
    }

    let deletes = loaded
        .iter()
        .filter(|record| !seen.contains(&record.id))
        .map(|record| BulkOp::Delete(record.id));

    let mut ops = updates;
    ops.extend(deletes);
    ops.extend(adds);
    Ok(BulkEditPlan { ops })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{derive, parse_date};

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn date(value: &str) -> Date {
        must_ok(parse_date(value))
    }

    fn seeded_table(count: u64) -> Vec<CertificationRecord> {
        let policy = DerivationPolicy::standard();
        (1..=count)
            .map(|id| {
                must_ok(
                    NewCertification {
                        name: format!("Cert {id}"),
                        issuer: "Issuer".to_string(),
                        external_cert_id: None,
                        earned_date: Some(date("2024-01-15")),
                        due_dates: None,
                        fee: Decimal::new(5_000, 2),
                        renewal_frequency: RenewalFrequency::Annual,
                    }
                    .into_record(CertificationId(id), &policy),
                )
            })
            .collect()
    }

    fn rows(table: &[CertificationRecord]) -> Vec<EditedRow> {
        table.iter().map(EditedRow::from_record).collect()
    }

    #[test]
    fn unchanged_snapshot_plans_nothing() {
        let table = seeded_table(3);
        let plan = must_ok(plan_bulk_edit(&table, &rows(&table)));
        assert!(plan.is_empty());
    }

    #[test]
    fn plan_detects_adds_updates_and_deletes() {
        let table = seeded_table(3);
        let mut submitted = rows(&table);
        submitted.remove(1);
        submitted[0].fee = Decimal::new(7_500, 2);
        submitted.push(EditedRow {
            id: None,
            name: "New".to_string(),
            issuer: "Issuer".to_string(),
            external_cert_id: Some("N-1".to_string()),
            earned_date: Some(date("2025-06-01")),
            ce_due_date: DueDate::Unset,
            amf_due_date: DueDate::Unset,
            expiration_date: DueDate::Unset,
            fee: Decimal::ZERO,
            renewal_frequency: RenewalFrequency::None,
        });

        let plan = must_ok(plan_bulk_edit(&table, &submitted));
        assert_eq!(
            plan.summary(),
            BulkEditSummary {
                added: 1,
                updated: 1,
                deleted: 1
            }
        );

        let mut next_id = 4;
        let applied = must_ok(plan.apply(&table, &mut next_id, &DerivationPolicy::standard()));
        let ids: Vec<u64> = applied.iter().map(|record| record.id.0).collect();
        assert_eq!(ids, vec![1, 3, 4]);
        assert_eq!(next_id, 5);
        assert_eq!(applied[0].fee, Decimal::new(7_500, 2));
        assert_eq!(
            applied[2].due_dates(),
            must_ok(derive(date("2025-06-01"), &DerivationPolicy::standard()))
        );
    }

    #[test]
    fn anchor_edit_without_date_edits_rederives() {
        let table = seeded_table(1);
        let mut submitted = rows(&table);
        submitted[0].earned_date = Some(date("2025-02-01"));

        let plan = must_ok(plan_bulk_edit(&table, &submitted));
        let mut next_id = 2;
        let applied = must_ok(plan.apply(&table, &mut next_id, &DerivationPolicy::standard()));
        assert_eq!(
            applied[0].due_dates(),
            must_ok(derive(date("2025-02-01"), &DerivationPolicy::standard()))
        );
    }

    #[test]
    fn anchor_edit_with_one_date_edit_rederives_the_other_slots() {
        let policy = DerivationPolicy::standard();
        let table = seeded_table(1);
        let mut submitted = rows(&table);
        submitted[0].earned_date = Some(date("2026-06-01"));
        submitted[0].ce_due_date = DueDate::Set(date("2029-06-01"));

        let plan = must_ok(plan_bulk_edit(&table, &submitted));
        let mut next_id = 2;
        let applied = must_ok(plan.apply(&table, &mut next_id, &policy));

        let fresh = must_ok(derive(date("2026-06-01"), &policy));
        assert_eq!(applied[0].ce_due_date, DueDate::Set(date("2029-06-01")));
        assert_eq!(applied[0].amf_due_date, fresh.amf_due_date);
        assert_eq!(applied[0].expiration_date, fresh.expiration_date);
        assert_eq!(applied[0].amf_due_date, DueDate::Set(date("2027-06-01")));
    }

    #[test]
    fn date_edit_without_anchor_change_touches_only_that_slot() {
        let table = seeded_table(1);
        let mut submitted = rows(&table);
        submitted[0].expiration_date = DueDate::Unset;

        let plan = must_ok(plan_bulk_edit(&table, &submitted));
        match plan.ops.as_slice() {
            [BulkOp::Update { patch, .. }] => {
                assert_eq!(patch.due_dates, None);
                assert_eq!(
                    patch.due_date_edits,
                    DueDateEdits {
                        expiration_date: Some(DueDate::Unset),
                        ..DueDateEdits::default()
                    }
                );
            }
            other => panic!("expected a single update, got {other:?}"),
        }

        let mut next_id = 2;
        let applied = must_ok(plan.apply(&table, &mut next_id, &DerivationPolicy::standard()));
        assert_eq!(applied[0].expiration_date, DueDate::Unset);
        assert_eq!(applied[0].ce_due_date, table[0].ce_due_date);
        assert_eq!(applied[0].amf_due_date, table[0].amf_due_date);
    }

    #[test]
    fn malformed_row_rejects_whole_plan() {
        let table = seeded_table(2);
        let mut submitted = rows(&table);
        submitted[1].issuer = "  ".to_string();

        match plan_bulk_edit(&table, &submitted) {
            Err(CertError::Validation { field, .. }) => assert_eq!(field, "rows[1].issuer"),
            other => panic!("expected row validation error, got {other:?}"),
        }
    }

    #[test]
    fn unknown_and_duplicate_ids_are_rejected() {
        let table = seeded_table(2);

        let mut unknown = rows(&table);
        unknown[0].id = Some(CertificationId(99));
        assert!(matches!(
            plan_bulk_edit(&table, &unknown),
            Err(CertError::Validation { field, .. }) if field == "rows[0].id"
        ));

        let mut duplicate = rows(&table);
        duplicate[1].id = Some(CertificationId(1));
        assert!(matches!(
            plan_bulk_edit(&table, &duplicate),
            Err(CertError::Validation { field, .. }) if field == "rows[1].id"
        ));
    }

    #[test]
    fn apply_fails_cleanly_when_target_vanished() {
        let loaded = seeded_table(2);
        let mut submitted = rows(&loaded);
        submitted[1].name = "Edited".to_string();
        let plan = must_ok(plan_bulk_edit(&loaded, &submitted));

        let current = vec![loaded[0].clone()];
        let mut next_id = 3;
        let result = plan.apply(&current, &mut next_id, &DerivationPolicy::standard());
        assert_eq!(result, Err(CertError::NotFound(CertificationId(2))));
        assert_eq!(next_id, 3);
    }

    #[test]
    fn concurrent_additions_survive_three_way_apply() {
        let loaded = seeded_table(1);
        let submitted = Vec::new();
        let plan = must_ok(plan_bulk_edit(&loaded, &submitted));

        let mut current = loaded.clone();
        current.extend(seeded_table(2).into_iter().skip(1));
        let mut next_id = 3;
        let applied = must_ok(plan.apply(&current, &mut next_id, &DerivationPolicy::standard()));
        let ids: Vec<u64> = applied.iter().map(|record| record.id.0).collect();
        assert_eq!(ids, vec![2]);
    }

    #[test]
    fn edited_row_decodes_with_missing_name_as_validation_failure() {
        let row: EditedRow = must_ok(serde_json::from_value(serde_json::json!({
            "issuer": "Issuer",
            "earned_date": "2024-01-15",
            "fee": "10.00",
            "renewal_frequency": "annual"
        })));
        assert!(matches!(
            row.validate(),
            Err(CertError::Validation { field, .. }) if field == "name"
        ));
    }
}
