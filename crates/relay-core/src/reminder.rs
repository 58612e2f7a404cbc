//! Proactive reminders: the bot writes first at configured local times.
//!
//! Every conversation has a list of `HH:MM` times (the configured defaults
//! unless an admin set its own; an empty list turns reminders off). A check
//! runs every `check_interval`; a time is due when it passed less than one
//! interval ago and the conversation got no reminder in the last hour.

use std::{fmt, str::FromStr, sync::Arc, time::Duration};

use chrono::{DateTime, FixedOffset, Offset, Timelike, Utc};
use serde::{Deserialize, Serialize};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::{domain::ConversationId, relay::Relay, Error, Result};

const MINUTES_PER_DAY: u32 = 24 * 60;
/// Two reminders to one conversation are at least this far apart.
const MIN_GAP_MINUTES: i64 = 60;

pub const DEFAULT_REMINDER_PROMPT: &str = "Write a short, warm message to check in with the user. \
Pick up naturally from your last conversation if there was one. It is {WEEKDAY}, {CURRENTDATE}.";

/// Local wall-clock time of day, minute precision. Serialized as `"HH:MM"`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ReminderTime {
    hour: u8,
    minute: u8,
}

impl ReminderTime {
    pub fn new(hour: u8, minute: u8) -> Option<Self> {
        (hour < 24 && minute < 60).then_some(Self { hour, minute })
    }

    fn minute_of_day(self) -> u32 {
        u32::from(self.hour) * 60 + u32::from(self.minute)
    }
}

impl FromStr for ReminderTime {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::Config(format!("invalid reminder time {s:?}, expected HH:MM"));
        let (h, m) = s.trim().split_once(':').ok_or_else(invalid)?;
        let hour = h.parse::<u8>().map_err(|_| invalid())?;
        let minute = m.parse::<u8>().map_err(|_| invalid())?;
        Self::new(hour, minute).ok_or_else(invalid)
    }
}

impl TryFrom<String> for ReminderTime {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<ReminderTime> for String {
    fn from(t: ReminderTime) -> Self {
        t.to_string()
    }
}

impl fmt::Display for ReminderTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

/// `"09:00 14:30,19:15"` -> sorted, deduplicated times.
pub fn parse_times(s: &str) -> Result<Vec<ReminderTime>> {
    let mut times = s
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|t| !t.is_empty())
        .map(str::parse)
        .collect::<Result<Vec<ReminderTime>>>()?;
    times.sort();
    times.dedup();
    Ok(times)
}

pub fn format_times(times: &[ReminderTime]) -> String {
    if times.is_empty() {
        return "off".to_string();
    }
    times
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReminderConfig {
    /// Times used by conversations without their own list.
    pub default_times: Vec<ReminderTime>,
    /// Offset of the wall clock the times are written in.
    pub utc_offset: FixedOffset,
    /// Check period; zero disables the background loop.
    pub check_interval: Duration,
    /// Extra system instruction for the model. `{CURRENTDATE}` and
    /// `{WEEKDAY}` are filled in with local values.
    pub prompt: String,
}

impl Default for ReminderConfig {
    fn default() -> Self {
        Self {
            default_times: vec![ReminderTime {
                hour: 19,
                minute: 15,
            }],
            utc_offset: FixedOffset::east_opt(3 * 3600).unwrap_or_else(|| Utc.fix()),
            check_interval: Duration::from_secs(900),
            prompt: DEFAULT_REMINDER_PROMPT.to_string(),
        }
    }
}

impl ReminderConfig {
    pub fn times_for<'a>(&'a self, own: Option<&'a [ReminderTime]>) -> &'a [ReminderTime] {
        own.unwrap_or(self.default_times.as_slice())
    }

    pub fn render_prompt(&self, now: DateTime<Utc>) -> String {
        let local = now.with_timezone(&self.utc_offset);
        self.prompt
            .replace("{CURRENTDATE}", &local.format("%Y-%m-%d %H:%M:%S").to_string())
            .replace("{WEEKDAY}", &local.format("%A").to_string())
    }
}

/// Reminder settings of one active conversation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReminderTarget {
    pub id: ConversationId,
    /// `None` follows the configured defaults.
    pub times: Option<Vec<ReminderTime>>,
    pub last_reminded: Option<DateTime<Utc>>,
}

/// Whether one of `times` came up within the last `window` (local clock,
/// wrapping at midnight) and the previous reminder is at least an hour old.
pub fn is_due(
    times: &[ReminderTime],
    now: DateTime<Utc>,
    offset: FixedOffset,
    window: Duration,
    last_reminded: Option<DateTime<Utc>>,
) -> bool {
    if last_reminded.is_some_and(|last| (now - last).num_minutes() < MIN_GAP_MINUTES) {
        return false;
    }
    let local = now.with_timezone(&offset);
    let minute = local.hour() * 60 + local.minute();
    let window = (window.as_secs() / 60).clamp(1, u64::from(MINUTES_PER_DAY)) as u32;

    times.iter().any(|t| {
        let since = (minute + MINUTES_PER_DAY - t.minute_of_day()) % MINUTES_PER_DAY;
        since < window
    })
}

/// Outcome of one reminder round.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReminderRun {
    pub total: usize,
    pub sent: usize,
    pub failed: usize,
}

impl fmt::Display for ReminderRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Reminders: sent {}, failed {} (of {})",
            self.sent, self.failed, self.total
        )
    }
}

/// Background task running the periodic reminder check.
pub struct ReminderLoop {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl ReminderLoop {
    /// Start the loop, or `None` when the check interval is zero.
    pub fn spawn(relay: Arc<Relay>) -> Option<Self> {
        let interval = relay.reminder_config().check_interval;
        if interval.is_zero() {
            tracing::info!("reminders disabled");
            return None;
        }

        let stop = CancellationToken::new();
        let task = tokio::spawn(run_checks(relay, interval, stop.clone()));
        tracing::info!(interval_secs = interval.as_secs(), "reminder loop started");
        Some(Self { stop, task })
    }

    /// Stop after the round in progress, if any.
    pub async fn shutdown(self) {
        self.stop.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "reminder loop ended abnormally");
        }
    }
}

async fn run_checks(relay: Arc<Relay>, interval: Duration, stop: CancellationToken) {
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
          _ = stop.cancelled() => break,
          _ = tick.tick() => match relay.send_due_reminders(Utc::now()).await {
            Ok(run) if run.total > 0 => tracing::info!(
                sent = run.sent,
                failed = run.failed,
                "reminder round finished"
            ),
            Ok(_) => tracing::debug!("no reminders due"),
            Err(e) => tracing::warn!(error = %e, "reminder check failed"),
          }
        }
    }
}
