//! Daily reminder scheduler.
//!
//! A tokio task scans the record store once per period and hands every
//! "due today" event to a [`ReminderSink`]. The calendar day comes from an
//! injectable [`Clock`] so tests can pin it, and the loop stops when its
//! [`CancellationToken`] fires.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cert_tracker_core::{
    add_days, due_today, iso_date, CertError, CertificationRecord, ReminderEvent,
};
use cert_tracker_store_json::JsonCertificationStore;
use serde::Serialize;
use time::{Date, OffsetDateTime, UtcOffset};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Interval between scans.
pub const DEFAULT_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

const MIN_PERIOD: Duration = Duration::from_secs(1);

pub trait Clock: Send + Sync {
    fn today(&self) -> Date;
}

/// Wall clock, read in a fixed UTC offset.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    offset: UtcOffset,
}

impl SystemClock {
    #[must_use]
    pub fn with_offset(offset: UtcOffset) -> Self {
        Self { offset }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::with_offset(UtcOffset::UTC)
    }
}

impl Clock for SystemClock {
    fn today(&self) -> Date {
        OffsetDateTime::now_utc().to_offset(self.offset).date()
    }
}

/// Manually driven clock.
#[derive(Debug)]
pub struct FixedClock {
    today: Mutex<Date>,
}

impl FixedClock {
    #[must_use]
    pub fn new(today: Date) -> Self {
        Self {
            today: Mutex::new(today),
        }
    }

    pub fn set(&self, today: Date) {
        match self.today.lock() {
            Ok(mut guard) => *guard = today,
            Err(poisoned) => *poisoned.into_inner() = today,
        }
    }

    /// # Errors
    /// Returns [`CertError::Validation`] when the shifted date is out of range.
    pub fn advance_days(&self, days: i64) -> Result<Date, CertError> {
        let next = add_days(self.today(), days)?;
        self.set(next);
        Ok(next)
    }
}

impl Clock for FixedClock {
    fn today(&self) -> Date {
        match self.today.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// Read-only view the scheduler scans on every tick.
pub trait RecordSource: Send + Sync {
    /// # Errors
    /// Returns the underlying store error when no consistent snapshot can be taken.
    fn snapshot(&self) -> Result<Vec<CertificationRecord>, CertError>;
}

impl RecordSource for JsonCertificationStore {
    fn snapshot(&self) -> Result<Vec<CertificationRecord>, CertError> {
        self.list()
    }
}

/// Receives reminder events. Delivery (log line, mail, UI badge) is up to the
/// implementation.
pub trait ReminderSink: Send + Sync {
    fn on_reminder(&self, event: &ReminderEvent);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl ReminderSink for TracingSink {
    fn on_reminder(&self, event: &ReminderEvent) {
        info!(
            certification_id = %event.certification_id,
            name = %event.name,
            kind = event.kind.as_str(),
            due_date = %cert_tracker_core::format_date(event.due_date),
            "certification reminder"
        );
    }
}

/// Forwards events into an unbounded tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<ReminderEvent>,
}

impl ChannelSink {
    #[must_use]
    pub fn new(tx: mpsc::UnboundedSender<ReminderEvent>) -> Self {
        Self { tx }
    }
}

impl ReminderSink for ChannelSink {
    fn on_reminder(&self, event: &ReminderEvent) {
        if self.tx.send(event.clone()).is_err() {
            debug!("reminder channel closed, dropping event");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Idle,
    Scanning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TickReport {
    #[serde(with = "iso_date")]
    pub today: Date,
    pub records_scanned: usize,
    pub events: Vec<ReminderEvent>,
}

pub struct ReminderScheduler {
    source: Arc<dyn RecordSource>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn ReminderSink>,
    period: Duration,
    scans_in_flight: AtomicUsize,
    scans_completed: AtomicU64,
}

impl ReminderScheduler {
    #[must_use]
    pub fn new(
        source: Arc<dyn RecordSource>,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn ReminderSink>,
    ) -> Self {
        Self {
            source,
            clock,
            sink,
            period: DEFAULT_PERIOD,
            scans_in_flight: AtomicUsize::new(0),
            scans_completed: AtomicU64::new(0),
        }
    }

    /// Overrides the scan period. Values below one second are raised to one
    /// second.
    #[must_use]
    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period.max(MIN_PERIOD);
        self
    }

    #[must_use]
    pub fn period(&self) -> Duration {
        self.period
    }

    /// `Scanning` while at least one tick is running.
    #[must_use]
    pub fn state(&self) -> SchedulerState {
        if self.scans_in_flight() > 0 {
            SchedulerState::Scanning
        } else {
            SchedulerState::Idle
        }
    }

    #[must_use]
    pub fn scans_in_flight(&self) -> usize {
        self.scans_in_flight.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn scans_completed(&self) -> u64 {
        self.scans_completed.load(Ordering::SeqCst)
    }

    /// Runs one scan: snapshot, compare every due date against today, emit.
    ///
    /// # Errors
    /// Returns the snapshot error; no events are emitted in that case.
    pub fn tick(&self) -> Result<TickReport, CertError> {
        self.scans_in_flight.fetch_add(1, Ordering::SeqCst);
        let result = self.scan();
        self.scans_in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn scan(&self) -> Result<TickReport, CertError> {
        let records = self.source.snapshot()?;
        let today = self.clock.today();
        let events = due_today(&records, today);
        for event in &events {
            self.sink.on_reminder(event);
        }
        self.scans_completed.fetch_add(1, Ordering::SeqCst);

        debug!(
            today = %cert_tracker_core::format_date(today),
            records = records.len(),
            events = events.len(),
            "reminder scan complete"
        );
        Ok(TickReport {
            today,
            records_scanned: records.len(),
            events,
        })
    }

    /// Starts the periodic loop. The first scan runs immediately, later scans
    /// once per period, until `cancel` fires. Each scan runs on the blocking
    /// pool since snapshots take the store lock and sinks may do I/O.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => {
                        debug!("reminder scheduler stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        let scheduler = Arc::clone(&self);
                        match tokio::task::spawn_blocking(move || scheduler.tick()).await {
                            Ok(Ok(_)) => {}
                            Ok(Err(err)) => warn!(error = %err, "reminder scan failed"),
                            Err(err) => warn!(error = %err, "reminder scan task aborted"),
                        }
                    }
                }
            }
        })
    }
}
