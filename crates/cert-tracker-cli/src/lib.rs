//! Command surface for the certification tracker.
//!
//! The binary in `main.rs` only installs logging and calls [`run_cli`]. All
//! argument decoding happens here, so everything below this crate receives
//! typed dates, decimals and enums instead of raw strings.

mod legacy;

pub use legacy::parse_legacy_export;

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use cert_tracker_core::{
    derive, due_soon, format_date, parse_date, sorted_view, summarize_fees, today_utc,
    BulkEditPlan, BulkOp, CertificationId, CertificationPatch, CertificationRecord,
    DerivationPolicy, DueDate, DueDateEdits, DueDates, DueSoonEntry, EditedRow,
    NewCertification, RenewalFrequency, ReminderEvent, SortKey, DEFAULT_DUE_SOON_WINDOW_DAYS,
};
use cert_tracker_reminders::{
    Clock, FixedClock, RecordSource, ReminderScheduler, ReminderSink, SystemClock, TracingSink,
    DEFAULT_PERIOD,
};
use cert_tracker_store_json::JsonCertificationStore;
use clap::{Args, Parser, Subcommand, ValueEnum};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use time::{Date, UtcOffset};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "certs")]
#[command(about = "Professional certification tracker")]
pub struct Cli {
    #[arg(long, default_value = "./certifications.json")]
    store: PathBuf,

    /// JSON file with `ce_years`, `amf_years` and `expiration_years`.
    #[arg(long)]
    policy: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Add a certification; due dates are derived unless all three are given.
    Add(AddArgs),
    Update(UpdateArgs),
    Delete(IdArgs),
    Get(IdArgs),
    List(ListArgs),
    /// Certifications whose AMF or expiration date falls inside the window.
    DueSoon(DueSoonArgs),
    /// Annualized maintenance fee across all certifications.
    Summary,
    /// Preview derived due dates without touching the store.
    Derive(DeriveArgs),
    Bulk {
        #[command(subcommand)]
        command: Box<BulkCommand>,
    },
    /// Import the older flat JSON export in one all-or-nothing batch.
    ImportLegacy(FileArgs),
    /// Run the daily reminder scan.
    Remind(RemindArgs),
}

#[derive(Debug, Subcommand)]
pub enum BulkCommand {
    /// Apply the difference between a loaded snapshot and its edited copy.
    Apply(BulkApplyArgs),
    /// Replace the whole table with the submitted rows.
    Replace(FileArgs),
}

#[derive(Debug, Args)]
pub struct DueDateOverrideArgs {
    /// CE due date (`YYYY-MM-DD` or `unset`).
    #[arg(long, value_parser = due_date_arg)]
    ce_due: Option<DueDate>,
    /// AMF due date (`YYYY-MM-DD` or `unset`).
    #[arg(long, value_parser = due_date_arg)]
    amf_due: Option<DueDate>,
    /// Expiration date (`YYYY-MM-DD` or `unset`).
    #[arg(long, value_parser = due_date_arg)]
    expires: Option<DueDate>,
}

impl DueDateOverrideArgs {
    fn into_due_dates(self) -> Result<Option<DueDates>> {
        match (self.ce_due, self.amf_due, self.expires) {
            (None, None, None) => Ok(None),
            (Some(ce_due_date), Some(amf_due_date), Some(expiration_date)) => Ok(Some(DueDates {
                ce_due_date,
                amf_due_date,
                expiration_date,
            })),
            _ => bail!("--ce-due, --amf-due and --expires must be given together"),
        }
    }

    fn into_edits(self) -> DueDateEdits {
        DueDateEdits {
            ce_due_date: self.ce_due,
            amf_due_date: self.amf_due,
            expiration_date: self.expires,
        }
    }
}

#[derive(Debug, Args)]
pub struct AddArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    issuer: String,
    #[arg(long)]
    external_id: Option<String>,
    #[arg(long, value_parser = date_arg)]
    earned: Date,
    #[command(flatten)]
    overrides: DueDateOverrideArgs,
    #[arg(long, value_parser = fee_arg, default_value = "0")]
    fee: Decimal,
    #[arg(long, value_enum, default_value_t = FrequencyArg::None)]
    frequency: FrequencyArg,
}

#[derive(Debug, Args)]
pub struct UpdateArgs {
    #[arg(long)]
    id: u64,
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    issuer: Option<String>,
    #[arg(long, conflicts_with = "clear_external_id")]
    external_id: Option<String>,
    #[arg(long)]
    clear_external_id: bool,
    /// A changed earned date re-derives every due date not given explicitly.
    #[arg(long, value_parser = date_arg)]
    earned: Option<Date>,
    #[command(flatten)]
    overrides: DueDateOverrideArgs,
    #[arg(long, value_parser = fee_arg)]
    fee: Option<Decimal>,
    #[arg(long, value_enum)]
    frequency: Option<FrequencyArg>,
}

#[derive(Debug, Args)]
pub struct IdArgs {
    #[arg(long)]
    id: u64,
}

#[derive(Debug, Args)]
pub struct ListArgs {
    /// Sort column; unknown names fall back to `earned_date`.
    #[arg(long)]
    sort_by: Option<String>,
    #[arg(long)]
    desc: bool,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct DueSoonArgs {
    #[arg(long, default_value_t = DEFAULT_DUE_SOON_WINDOW_DAYS)]
    days: u32,
    #[arg(long, value_parser = date_arg)]
    today: Option<Date>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct DeriveArgs {
    #[arg(long, value_parser = date_arg)]
    earned: Date,
}

#[derive(Debug, Args)]
pub struct BulkApplyArgs {
    /// Records as they were when editing started (`list --json` output).
    #[arg(long)]
    loaded: PathBuf,
    /// Edited rows; rows without `id` are added.
    #[arg(long)]
    submitted: PathBuf,
}

#[derive(Debug, Args)]
pub struct FileArgs {
    #[arg(long)]
    file: PathBuf,
}

#[derive(Debug, Args)]
pub struct RemindArgs {
    /// Scan once, print the report and exit.
    #[arg(long)]
    once: bool,
    /// Pin the calendar day instead of reading the clock.
    #[arg(long, value_parser = date_arg)]
    today: Option<Date>,
    #[arg(long, default_value_t = DEFAULT_PERIOD.as_secs())]
    period_secs: u64,
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    utc_offset_hours: i8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FrequencyArg {
    None,
    Annual,
    Biennial,
    Triennial,
    Other,
}

impl From<FrequencyArg> for RenewalFrequency {
    fn from(value: FrequencyArg) -> Self {
        match value {
            FrequencyArg::None => Self::None,
            FrequencyArg::Annual => Self::Annual,
            FrequencyArg::Biennial => Self::Biennial,
            FrequencyArg::Triennial => Self::Triennial,
            FrequencyArg::Other => Self::Other,
        }
    }
}

fn date_arg(value: &str) -> Result<Date, String> {
    parse_date(value).map_err(|err| err.to_string())
}

fn due_date_arg(value: &str) -> Result<DueDate, String> {
    if value == "unset" {
        return Ok(DueDate::Unset);
    }
    date_arg(value).map(DueDate::Set)
}

fn fee_arg(value: &str) -> Result<Decimal, String> {
    Decimal::from_str(value).map_err(|err| format!("invalid fee {value:?}: {err}"))
}

/// Executes the parsed command.
///
/// # Errors
/// Returns an error when the policy or an input file cannot be read, the store
/// cannot be opened, or the command itself fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let policy = load_policy(cli.policy.as_deref())?;

    if let Command::Derive(args) = &cli.command {
        let dates = derive(args.earned, &policy)?;
        return print_json(&dates);
    }

    let store = JsonCertificationStore::open(&cli.store, policy)
        .with_context(|| format!("failed to open store {}", cli.store.display()))?;
    run_command(cli.command, store)
}

fn run_command(command: Command, store: JsonCertificationStore) -> Result<()> {
    match command {
        Command::Add(args) => {
            let input = NewCertification {
                name: args.name,
                issuer: args.issuer,
                external_cert_id: args.external_id,
                earned_date: Some(args.earned),
                due_dates: args.overrides.into_due_dates()?,
                fee: args.fee,
                renewal_frequency: args.frequency.into(),
            };
            print_json(&store.add(input)?)
        }
        Command::Update(args) => {
            let id = CertificationId(args.id);
            let external_cert_id = if args.clear_external_id {
                Some(None)
            } else {
                args.external_id.map(Some)
            };
            let patch = CertificationPatch {
                name: args.name,
                issuer: args.issuer,
                external_cert_id,
                earned_date: args.earned,
                due_dates: None,
                due_date_edits: args.overrides.into_edits(),
                fee: args.fee,
                renewal_frequency: args.frequency.map(Into::into),
            };
            if patch.is_empty() {
                bail!("update needs at least one field to change");
            }
            print_json(&store.update(id, &patch)?)
        }
        Command::Delete(args) => {
            let id = CertificationId(args.id);
            store.delete(id)?;
            print_json(&json!({ "deleted": id }))
        }
        Command::Get(args) => print_json(&store.get(CertificationId(args.id))?),
        Command::List(args) => {
            let records = store.list()?;
            let records = match args.sort_by.as_deref() {
                Some(name) => sorted_view(&records, sort_key(name), !args.desc),
                None => records,
            };
            if args.json {
                print_json(&records)
            } else {
                print_records(&records);
                Ok(())
            }
        }
        Command::DueSoon(args) => {
            let today = args.today.unwrap_or_else(today_utc);
            let entries = due_soon(&store.list()?, args.days, today)?;
            if args.json {
                print_json(&entries)
            } else {
                print_due_soon(&entries);
                Ok(())
            }
        }
        Command::Summary => print_json(&summarize_fees(&store.list()?)),
        Command::Bulk { command } => match *command {
            BulkCommand::Apply(args) => {
                let loaded: Vec<CertificationRecord> = read_json_file(&args.loaded, "loaded")?;
                let submitted: Vec<EditedRow> = read_json_file(&args.submitted, "submitted")?;
                print_json(&store.apply_bulk_edit(&loaded, &submitted)?)
            }
            BulkCommand::Replace(args) => {
                let rows: Vec<EditedRow> = read_json_file(&args.file, "submitted")?;
                print_json(&store.replace_all(&rows)?)
            }
        },
        Command::ImportLegacy(args) => {
            let body = fs::read_to_string(&args.file)
                .with_context(|| format!("failed to read legacy export {}", args.file.display()))?;
            let inputs = parse_legacy_export(&body, store.policy())?;
            let plan = BulkEditPlan {
                ops: inputs.into_iter().map(BulkOp::Add).collect(),
            };
            print_json(&store.apply_plan(&plan)?)
        }
        Command::Remind(args) => run_remind(store, &args),
        Command::Derive(_) => bail!("derive does not use the store"),
    }
}

fn run_remind(store: JsonCertificationStore, args: &RemindArgs) -> Result<()> {
    let clock: Arc<dyn Clock> = match args.today {
        Some(today) => Arc::new(FixedClock::new(today)),
        None => Arc::new(SystemClock::with_offset(utc_offset(args.utc_offset_hours)?)),
    };
    let source: Arc<dyn RecordSource> = Arc::new(store);

    if args.once {
        let scheduler = ReminderScheduler::new(source, clock, Arc::new(TracingSink));
        return print_json(&scheduler.tick()?);
    }

    let scheduler = Arc::new(
        ReminderScheduler::new(source, clock, Arc::new(StdoutSink))
            .with_period(Duration::from_secs(args.period_secs)),
    );
    let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    runtime.block_on(async move {
        let cancel = CancellationToken::new();
        let handle = Arc::clone(&scheduler).spawn(cancel.clone());
        info!(
            period_secs = scheduler.period().as_secs(),
            "reminder scheduler running, press Ctrl+C to stop"
        );

        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for Ctrl+C")?;
        cancel.cancel();
        handle.await.context("reminder scheduler task failed")?;
        Ok::<(), anyhow::Error>(())
    })
}

/// Prints each reminder as one JSON line.
struct StdoutSink;

impl ReminderSink for StdoutSink {
    fn on_reminder(&self, event: &ReminderEvent) {
        match serde_json::to_string(event) {
            Ok(line) => println!("{line}"),
            Err(err) => warn!(error = %err, "failed to encode reminder event"),
        }
    }
}

fn utc_offset(hours: i8) -> Result<UtcOffset> {
    UtcOffset::from_hms(hours, 0, 0)
        .with_context(|| format!("utc offset of {hours} hours is out of range"))
}

fn sort_key(name: &str) -> SortKey {
    let key = SortKey::parse_or_default(name);
    if key.as_str() != name {
        warn!(
            requested = name,
            fallback = key.as_str(),
            "unknown sort key, using default"
        );
    }
    key
}

fn load_policy(path: Option<&Path>) -> Result<DerivationPolicy> {
    let Some(path) = path else {
        return Ok(DerivationPolicy::standard());
    };
    let value: Value = read_json_file(path, "policy")?;
    Ok(DerivationPolicy::from_json(&value)?)
}

fn read_json_file<T: DeserializeOwned>(path: &Path, what: &str) -> Result<T> {
    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read {what} file {}", path.display()))?;
    serde_json::from_str(&body)
        .with_context(|| format!("failed to decode {what} file {}", path.display()))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_records(records: &[CertificationRecord]) {
    println!(
        "{:<5} {:<28} {:<20} {:<10} {:<10} {:<10} {:<10} {:>10} frequency",
        "id", "name", "issuer", "earned", "ce_due", "amf_due", "expires", "fee"
    );
    println!("{}", "-".repeat(120));

    for record in records {
        println!(
            "{:<5} {:<28} {:<20} {:<10} {:<10} {:<10} {:<10} {:>10} {}",
            record.id.0,
            record.name,
            record.issuer,
            format_date(record.earned_date),
            record.ce_due_date.to_string(),
            record.amf_due_date.to_string(),
            record.expiration_date.to_string(),
            record.fee.to_string(),
            record.renewal_frequency.as_str()
        );
    }
}

fn print_due_soon(entries: &[DueSoonEntry]) {
    if entries.is_empty() {
        println!("nothing due in the window");
        return;
    }
    println!(
        "{:<5} {:<28} {:<10} {:<10} days_left",
        "id", "name", "kind", "due"
    );
    println!("{}", "-".repeat(70));

    for entry in entries {
        println!(
            "{:<5} {:<28} {:<10} {:<10} {}",
            entry.record.id.0,
            entry.record.name,
            entry.due_kind.as_str(),
            format_date(entry.due_date),
            entry.days_left
        );
    }
}
