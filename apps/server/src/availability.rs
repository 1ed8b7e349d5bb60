//! Computes the bookable time slots for a product on a given date.
//!
//! Slots follow a fixed 30-minute grid inside the company's open window
//! for the date. Persisted slot rows (created by admins or by earlier
//! commits) are overlaid by start time and carry the authoritative
//! capacity and booked count; grid cells without a row fall back to the
//! product's default capacity with nothing booked. Full slots are
//! returned flagged, never hidden, so callers can render them disabled.

use chrono::{Duration, NaiveTime};
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::HashMap;

use crate::hours::{self, OperatingHours};
use crate::models::{Product, Slot};

/// Grid step between consecutive slot starts (minutes).
const GRID_STEP_MIN: i64 = 30;

/// End of an all-day slot.
const ALL_DAY_END: &str = "23:59";

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DaySlot {
    pub start_time: String,
    pub end_time: String,
    pub capacity: i64,
    pub booked: i64,
    pub available: bool,
}

impl DaySlot {
    fn new(start: String, end: String, capacity: i64, booked: i64) -> Self {
        Self {
            available: booked < capacity,
            start_time: start,
            end_time: end,
            capacity,
            booked,
        }
    }
}

/// Pure core: build the slot sequence for one date.
///
/// `window = None` means the company is closed that date. Rows are the
/// persisted slots for (product, date), any order.
pub fn build_day_slots(
    product: &Product,
    window: Option<(NaiveTime, NaiveTime)>,
    rows: &[Slot],
) -> Vec<DaySlot> {
    // A closed date has no slots, all-day products included.
    let (open, close) = match window {
        Some(w) => w,
        None => return Vec::new(),
    };

    let by_start: HashMap<&str, &Slot> =
        rows.iter().map(|r| (r.start_time.as_str(), r)).collect();

    if product.all_day {
        let (capacity, booked) = match by_start.get("00:00") {
            Some(row) => (row.capacity, row.booked),
            None => (product.default_capacity.max(1), 0),
        };
        return vec![DaySlot::new(
            "00:00".into(),
            ALL_DAY_END.into(),
            capacity,
            booked,
        )];
    }

    let duration = Duration::minutes(product.duration_min.max(GRID_STEP_MIN));
    let step = Duration::minutes(GRID_STEP_MIN);

    let mut slots = Vec::new();
    let mut start = open;
    loop {
        let end = match start.overflowing_add_signed(duration) {
            (end, 0) => end,
            _ => break, // would wrap past midnight
        };
        if end > close {
            break;
        }

        let start_s = hours::fmt_time(start);
        let end_s = hours::fmt_time(end);
        let (capacity, booked) = match by_start.get(start_s.as_str()) {
            Some(row) => (row.capacity, row.booked),
            None => (product.default_capacity.max(1), 0),
        };
        slots.push(DaySlot::new(start_s, end_s, capacity, booked));

        start = match start.overflowing_add_signed(step) {
            (next, 0) => next,
            _ => break,
        };
    }
    slots
}

/// Resolve availability for a product on a date.
///
/// Any backing failure (unknown product, bad date, query error) yields
/// an empty sequence so the wizard can render "no slots" instead of
/// crashing mid-flow.
pub async fn resolve(db: &SqlitePool, product_id: i64, date: &str) -> Vec<DaySlot> {
    let date = match hours::parse_date(date) {
        Some(d) => d,
        None => {
            tracing::warn!("available-slots: bad date for product {}", product_id);
            return Vec::new();
        }
    };

    let product = match sqlx::query_as::<_, Product>(
        "SELECT id, company_id, name, price, duration_min, all_day, default_capacity, is_active
         FROM products WHERE id = ? AND is_active = 1",
    )
    .bind(product_id)
    .fetch_optional(db)
    .await
    {
        Ok(Some(p)) => p,
        Ok(None) => return Vec::new(),
        Err(e) => {
            tracing::error!("available-slots: product query failed: {}", e);
            return Vec::new();
        }
    };

    let raw_hours: Option<String> = match sqlx::query_scalar(
        "SELECT operating_hours FROM companies WHERE id = ?",
    )
    .bind(product.company_id)
    .fetch_optional(db)
    .await
    {
        Ok(raw) => raw.flatten(),
        Err(e) => {
            tracing::error!("available-slots: company query failed: {}", e);
            return Vec::new();
        }
    };
    let parsed = OperatingHours::parse(raw_hours.as_deref());
    let window = hours::open_window(parsed.as_ref(), date);

    let rows = match sqlx::query_as::<_, Slot>(
        "SELECT id, product_id, date, start_time, end_time, capacity, booked
         FROM slots WHERE product_id = ? AND date = ?
         ORDER BY start_time ASC",
    )
    .bind(product_id)
    .bind(hours::fmt_date(date))
    .fetch_all(db)
    .await
    {
        Ok(rows) => rows,
        Err(e) => {
            tracing::error!("available-slots: slot query failed: {}", e);
            return Vec::new();
        }
    };

    build_day_slots(&product, window, &rows)
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hours::parse_time;

    fn make_product(duration_min: i64, all_day: bool, default_capacity: i64) -> Product {
        Product {
            id: 1,
            company_id: 1,
            name: "Grooming".into(),
            price: 80_000,
            duration_min,
            all_day,
            default_capacity,
            is_active: true,
        }
    }

    fn make_row(start: &str, end: &str, capacity: i64, booked: i64) -> Slot {
        Slot {
            id: 0,
            product_id: 1,
            date: "2026-03-03".into(),
            start_time: start.into(),
            end_time: end.into(),
            capacity,
            booked,
        }
    }

    fn window(open: &str, close: &str) -> Option<(NaiveTime, NaiveTime)> {
        Some((parse_time(open).unwrap(), parse_time(close).unwrap()))
    }

    #[test]
    fn test_grid_thirty_minute_steps() {
        let product = make_product(30, false, 2);
        let slots = build_day_slots(&product, window("09:00", "11:00"), &[]);
        let starts: Vec<_> = slots.iter().map(|s| s.start_time.as_str()).collect();
        assert_eq!(starts, vec!["09:00", "09:30", "10:00", "10:30"]);
        assert!(slots.iter().all(|s| s.available && s.capacity == 2));
    }

    #[test]
    fn test_grid_duration_longer_than_step() {
        let product = make_product(60, false, 1);
        let slots = build_day_slots(&product, window("09:00", "11:00"), &[]);
        // 60-min slots starting every 30 min: 09:00-10:00, 09:30-10:30, 10:00-11:00
        assert_eq!(slots.len(), 3);
        assert_eq!(slots[0].end_time, "10:00");
        assert_eq!(slots[2].start_time, "10:00");
    }

    #[test]
    fn test_grid_ordered_ascending() {
        let product = make_product(30, false, 1);
        let slots = build_day_slots(&product, window("08:00", "12:00"), &[]);
        for pair in slots.windows(2) {
            assert!(pair[0].start_time < pair[1].start_time);
        }
    }

    #[test]
    fn test_window_shorter_than_duration() {
        let product = make_product(120, false, 1);
        assert!(build_day_slots(&product, window("10:00", "11:00"), &[]).is_empty());
    }

    #[test]
    fn test_closed_date_yields_nothing() {
        let product = make_product(30, false, 1);
        assert!(build_day_slots(&product, None, &[]).is_empty());
    }

    #[test]
    fn test_full_slot_flagged_not_hidden() {
        let product = make_product(30, false, 1);
        let rows = vec![make_row("09:30", "10:00", 1, 1)];
        let slots = build_day_slots(&product, window("09:00", "10:30"), &rows);
        assert_eq!(slots.len(), 3);
        let full = slots.iter().find(|s| s.start_time == "09:30").unwrap();
        assert!(!full.available);
        assert_eq!(full.booked, 1);
        assert!(slots.iter().filter(|s| s.available).count() == 2);
    }

    #[test]
    fn test_row_overrides_default_capacity() {
        let product = make_product(30, false, 1);
        let rows = vec![make_row("09:00", "09:30", 5, 2)];
        let slots = build_day_slots(&product, window("09:00", "10:00"), &rows);
        assert_eq!(slots[0].capacity, 5);
        assert_eq!(slots[0].booked, 2);
        assert!(slots[0].available);
        assert_eq!(slots[1].capacity, 1); // untouched cell keeps the default
    }

    #[test]
    fn test_all_day_product_closed_date_yields_nothing() {
        let product = make_product(30, true, 3);
        assert!(build_day_slots(&product, None, &[]).is_empty());
    }

    #[test]
    fn test_all_day_product_single_slot() {
        let product = make_product(30, true, 3);
        let slots = build_day_slots(&product, window("09:00", "18:00"), &[]);
        assert_eq!(slots.len(), 1);
        assert_eq!(slots[0].start_time, "00:00");
        assert_eq!(slots[0].end_time, "23:59");
        assert_eq!(slots[0].capacity, 3);
    }

    #[test]
    fn test_all_day_product_overlays_row() {
        let product = make_product(30, true, 3);
        let rows = vec![make_row("00:00", "23:59", 3, 3)];
        let slots = build_day_slots(&product, window("00:00", "23:59"), &rows);
        assert_eq!(slots.len(), 1);
        assert!(!slots[0].available);
    }

    #[test]
    fn test_capacity_one_booked_one_unavailable() {
        let product = make_product(30, false, 1);
        let rows = vec![make_row("09:00", "09:30", 1, 1)];
        let slots = build_day_slots(&product, window("09:00", "09:30"), &rows);
        assert_eq!(slots.len(), 1);
        assert!(!slots[0].available);
    }

    #[test]
    fn test_zero_duration_treated_as_grid_step() {
        let product = make_product(0, false, 1);
        let slots = build_day_slots(&product, window("09:00", "10:00"), &[]);
        assert_eq!(slots.len(), 2);
        assert_eq!(slots[0].end_time, "09:30");
    }
}
