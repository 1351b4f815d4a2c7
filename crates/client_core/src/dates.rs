use chrono::{DateTime, Days, FixedOffset, NaiveDate, Offset, Utc};

use crate::types::Message;

/// Offset used for every calendar-day computation (UTC+05:30, no DST).
pub const REFERENCE_OFFSET_SECS: i32 = 5 * 3600 + 30 * 60;

pub fn reference_offset() -> FixedOffset {
    FixedOffset::east_opt(REFERENCE_OFFSET_SECS).unwrap_or_else(|| Utc.fix())
}

/// Calendar day of `timestamp` in the reference offset.
pub fn date_key(timestamp: DateTime<Utc>) -> NaiveDate {
    timestamp.with_timezone(&reference_offset()).date_naive()
}

/// Day heading relative to `today`: "Today", "Yesterday", or e.g.
/// "October 17, 2026".
pub fn day_label(day: NaiveDate, today: NaiveDate) -> String {
    if day == today {
        return "Today".to_string();
    }
    if today.checked_sub_days(Days::new(1)) == Some(day) {
        return "Yesterday".to_string();
    }
    day.format("%B %-d, %Y").to_string()
}

/// Messages of one calendar day, in sequence order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayGroup<'a> {
    pub day: NaiveDate,
    pub label: String,
    pub messages: Vec<&'a Message>,
}

/// Splits an ordered sequence into consecutive day groups. A new group
/// starts whenever the day key differs from the previous message's.
pub fn group_by_day(messages: &[Message], now: DateTime<Utc>) -> Vec<DayGroup<'_>> {
    let today = date_key(now);
    let mut groups: Vec<DayGroup<'_>> = Vec::new();
    for message in messages {
        let day = date_key(message.timestamp);
        match groups.last_mut() {
            Some(group) if group.day == day => group.messages.push(message),
            _ => groups.push(DayGroup {
                day,
                label: day_label(day, today),
                messages: vec![message],
            }),
        }
    }
    groups
}

/// Short time of day in the reference offset, e.g. "09:05".
pub fn time_label(timestamp: DateTime<Utc>) -> String {
    timestamp
        .with_timezone(&reference_offset())
        .format("%H:%M")
        .to_string()
}

#[cfg(test)]
#[path = "tests/dates_tests.rs"]
mod tests;
