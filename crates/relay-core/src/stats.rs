//! Activity statistics over stored user messages (`/stats`).
//!
//! Averages follow the usual "per active period" reading: the hourly profile
//! divides by the number of distinct days with messages, the weekday profile
//! by the number of distinct ISO weeks. Only history still held by the store
//! is counted.

use std::{collections::HashSet, fmt::Write as _};

use chrono::{DateTime, Datelike, FixedOffset, Timelike, Utc};

use crate::domain::ConversationId;

const BAR_WIDTH: f64 = 12.0;
const WEEKDAYS: [&str; 7] = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];

/// Raw activity as the store sees it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Activity {
    pub conversations: usize,
    pub active: usize,
    /// When each stored user message was written.
    pub user_messages: Vec<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ActivityStats {
    /// `None` for all conversations.
    pub scope: Option<ConversationId>,
    pub conversations: usize,
    pub active: usize,
    pub messages: usize,
    pub offset: FixedOffset,
    /// Average user messages per local hour of day.
    pub hourly: [f64; 24],
    /// Average user messages per weekday, Monday first.
    pub weekly: [f64; 7],
}

impl ActivityStats {
    pub fn compute(scope: Option<ConversationId>, activity: &Activity, offset: FixedOffset) -> Self {
        let mut days = HashSet::new();
        let mut weeks = HashSet::new();
        let mut per_hour = [0usize; 24];
        let mut per_weekday = [0usize; 7];

        for at in &activity.user_messages {
            let local = at.with_timezone(&offset);
            days.insert(local.date_naive());
            let week = local.iso_week();
            weeks.insert((week.year(), week.week()));
            per_hour[local.hour() as usize] += 1;
            per_weekday[local.weekday().num_days_from_monday() as usize] += 1;
        }

        let day_count = days.len().max(1) as f64;
        let week_count = weeks.len().max(1) as f64;
        Self {
            scope,
            conversations: activity.conversations,
            active: activity.active,
            messages: activity.user_messages.len(),
            offset,
            hourly: per_hour.map(|n| n as f64 / day_count),
            weekly: per_weekday.map(|n| n as f64 / week_count),
        }
    }

    pub fn busiest_hour(&self) -> Option<usize> {
        busiest(&self.hourly)
    }

    pub fn busiest_weekday(&self) -> Option<&'static str> {
        busiest(&self.weekly).map(|d| WEEKDAYS[d])
    }

    /// Plain-text report with bar charts.
    pub fn render(&self) -> String {
        let mut out = match self.scope {
            Some(id) => format!("Activity of conversation {id}\n"),
            None => format!(
                "Activity of all conversations\nConversations: {} (active {})\n",
                self.conversations, self.active
            ),
        };
        let _ = writeln!(out, "User messages: {}", self.messages);
        if self.messages == 0 {
            out.push_str("No stored messages yet.");
            return out;
        }

        let _ = writeln!(out, "\nAverage per hour (UTC{}):", self.offset);
        let peak = max_of(&self.hourly);
        for (hour, avg) in self.hourly.iter().enumerate().filter(|(_, v)| **v > 0.0) {
            let _ = writeln!(out, "{hour:02} {} {avg:.2}", bar(*avg, peak));
        }

        out.push_str("\nAverage per weekday:\n");
        let peak = max_of(&self.weekly);
        for (day, avg) in WEEKDAYS.iter().zip(self.weekly) {
            let _ = writeln!(out, "{day} {} {avg:.2}", bar(avg, peak));
        }

        if let (Some(hour), Some(day)) = (self.busiest_hour(), self.busiest_weekday()) {
            let _ = write!(out, "\nBusiest: {hour:02}:00, {day}");
        }
        out
    }
}

fn max_of(values: &[f64]) -> f64 {
    values.iter().copied().fold(0.0, f64::max)
}

fn busiest(values: &[f64]) -> Option<usize> {
    let peak = max_of(values);
    (peak > 0.0).then(|| values.iter().position(|v| *v == peak)).flatten()
}

fn bar(value: f64, peak: f64) -> String {
    if peak <= 0.0 {
        return String::new();
    }
    let cells = ((value / peak) * BAR_WIDTH).round().max(1.0) as usize;
    "█".repeat(cells)
}
