// Activity normalization
// Pure mapping from raw API records to destination rows

use chrono::{DateTime, Datelike, NaiveDateTime, Timelike};
use serde_json::Value;

use crate::models::{ActivityRecord, ActivityRow};

/// Source fields copied through unchanged
const PASSTHROUGH_COLUMNS: &[&str] = &["total_elevation_gain", "sport_type", "gear_id", "pr_count"];

/// (source field, destination column, factor) for unit conversions
const CONVERSIONS: &[(&str, &str, f64)] = &[
    ("distance", "distance_km", 1.0 / 1000.0),
    ("moving_time", "moving_time_hr", 1.0 / 3600.0),
    ("average_speed", "average_speed_km_per_hr", 3.6),
    ("max_speed", "max_speed_km_per_hr", 3.6),
];

/// Normalize a batch of raw activities
///
/// Missing source fields are skipped; nothing here fails.
pub fn transform_activities(records: &[ActivityRecord]) -> Vec<ActivityRow> {
    if records.is_empty() {
        tracing::warn!("No activities to transform");
        return Vec::new();
    }

    let rows: Vec<ActivityRow> = records.iter().map(transform_activity).collect();
    tracing::info!("Transformed {} activities", rows.len());
    rows
}

/// Normalize one activity
pub fn transform_activity(record: &ActivityRecord) -> ActivityRow {
    let mut row = ActivityRow::new(record.id);

    if let Some(name) = record.get("name") {
        row.set("activity_name", name);
    }

    for (source, column, factor) in CONVERSIONS {
        if let Some(value) = record.get(source).and_then(|v| v.as_f64()) {
            row.set(*column, round2(value * factor));
        }
    }

    for column in PASSTHROUGH_COLUMNS {
        if let Some(value) = record.get(column) {
            row.set(*column, value);
        }
    }

    split_latlng(&mut row, record.get("start_latlng"), "start");
    split_latlng(&mut row, record.get("end_latlng"), "end");

    if let Some(Value::String(start)) = record.get("start_date_local") {
        row.set("start_date_local", start.as_str());
        if let Some(dt) = parse_local_datetime(&start) {
            row.set("activity_hour", dt.hour());
            // Monday = 1 .. Sunday = 7
            row.set("activity_weekday", dt.weekday().number_from_monday());
            row.set("activity_year", dt.year());
            row.set("activity_month", dt.month());
        }
    }

    row
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// `[lat, lng]` into two columns; absent or empty pairs become nulls
fn split_latlng(row: &mut ActivityRow, value: Option<Value>, prefix: &str) {
    let pair = value
        .as_ref()
        .and_then(|v| v.as_array())
        .filter(|a| a.len() == 2);

    let (lat, lng) = match pair {
        Some(a) => (a[0].clone(), a[1].clone()),
        None => (Value::Null, Value::Null),
    };

    row.set(format!("{}_latitude", prefix), lat);
    row.set(format!("{}_longitude", prefix), lng);
}

/// Strava's local start time is written with a `Z` suffix but is wall-clock time
fn parse_local_datetime(s: &str) -> Option<NaiveDateTime> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.naive_local())
        .ok()
        .or_else(|| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S").ok())
}
