//! Weekly room bookings and the collision rule between them.

use crate::models::ClubSchedule;
use chrono::NaiveTime;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot<'a> {
    pub room: &'a str,
    pub day_of_week: i16,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
}

impl<'a> From<&'a ClubSchedule> for Slot<'a> {
    fn from(s: &'a ClubSchedule) -> Self {
        Slot {
            room: &s.room,
            day_of_week: s.day_of_week,
            start_time: s.start_time,
            end_time: s.end_time,
        }
    }
}

pub fn normalize_room(room: &str) -> String {
    room.trim().to_lowercase()
}

pub fn validate(slot: &Slot) -> Result<(), &'static str> {
    if slot.room.trim().is_empty() {
        return Err("room must not be empty");
    }
    if !(0..=6).contains(&slot.day_of_week) {
        return Err("day of week must be between 0 (Monday) and 6 (Sunday)");
    }
    if slot.start_time >= slot.end_time {
        return Err("start time must be before end time");
    }
    Ok(())
}

/// Same room, same day, overlapping half-open time ranges.
pub fn collides(a: &Slot, b: &Slot) -> bool {
    normalize_room(a.room) == normalize_room(b.room)
        && a.day_of_week == b.day_of_week
        && a.start_time < b.end_time
        && b.start_time < a.end_time
}

/// First existing schedule that collides with `candidate`, skipping `ignore_id`
/// so an update never collides with its own previous version.
pub fn find_conflict<'a>(
    existing: &'a [ClubSchedule],
    candidate: &Slot,
    ignore_id: Option<i32>,
) -> Option<&'a ClubSchedule> {
    existing
        .iter()
        .filter(|s| Some(s.id) != ignore_id)
        .find(|s| collides(&Slot::from(*s), candidate))
}

pub fn day_name(day_of_week: i16) -> &'static str {
    match day_of_week {
        0 => "Monday",
        1 => "Tuesday",
        2 => "Wednesday",
        3 => "Thursday",
        4 => "Friday",
        5 => "Saturday",
        _ => "Sunday",
    }
}
