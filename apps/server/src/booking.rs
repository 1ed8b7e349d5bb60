//! The single writer of booking state.
//!
//! Every booking row is created and transitioned here; handlers and
//! payment reconciliation call in, nothing else touches the status
//! column. Slot capacity is enforced with conditional UPDATEs so the
//! check-and-increment is atomic under concurrent commits.

use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::SqlitePool;
use thiserror::Error;

use crate::hours;
use crate::models::{Booking, BookingStatus};

/// Inclusive bounds on pets per booking.
pub const MIN_PETS: i64 = 1;
pub const MAX_PETS: i64 = 10;

#[derive(Debug, Error)]
pub enum CommitError {
    #[error("{0}")]
    Invalid(&'static str),
    /// The slot filled up between availability resolution and commit.
    /// The caller must re-fetch availability, not retry the same slot.
    #[error("time slot is fully booked")]
    SlotFull,
    #[error("booking not found")]
    NotFound,
    #[error("booking can no longer be cancelled")]
    NotCancellable,
    #[error("booking is not in a state that allows this transition")]
    InvalidState,
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
}

/// Everything needed to persist one booking intent.
#[derive(Debug, Clone)]
pub struct CreateBooking {
    pub company_id: i64,
    pub product_id: i64,
    pub owner_id: i64,
    pub date: String,
    pub start_time: String,
    pub end_time: String,
    pub pet_count: i64,
    pub total_price: i64,
    pub special_requests: Option<String>,
    /// Capacity to seed the slot row with when the grid cell has never
    /// been persisted (the product's default).
    pub capacity: i64,
}

const BOOKING_SELECT: &str =
    "SELECT id, company_id, product_id, owner_id, start_dt, end_dt, pet_count, total_price,
            special_requests, status, created_at, cancelled_at
     FROM bookings";

fn combine_dt(date: &str, time: &str) -> Option<DateTime<Utc>> {
    let date = hours::parse_date(date)?;
    let time = hours::parse_time(time)?;
    Some(NaiveDateTime::new(date, time).and_utc())
}

pub async fn fetch(db: &SqlitePool, booking_id: i64) -> Result<Booking, CommitError> {
    sqlx::query_as::<_, Booking>(&format!("{} WHERE id = ?", BOOKING_SELECT))
        .bind(booking_id)
        .fetch_optional(db)
        .await?
        .ok_or(CommitError::NotFound)
}

/// Persist a draft as a `Pending` booking, claiming slot capacity.
///
/// The slot row is upserted first (grid cells only exist once someone
/// books or an admin seeds them), then capacity is claimed with a
/// conditional increment. Zero rows updated means the slot is full —
/// the availability snapshot the caller holds is stale.
pub async fn create(db: &SqlitePool, cmd: CreateBooking) -> Result<Booking, CommitError> {
    if cmd.company_id <= 0 {
        return Err(CommitError::Invalid("company is missing"));
    }
    if cmd.product_id <= 0 {
        return Err(CommitError::Invalid("product is missing"));
    }
    if !(MIN_PETS..=MAX_PETS).contains(&cmd.pet_count) {
        return Err(CommitError::Invalid("pet count must be between 1 and 10"));
    }
    if cmd.total_price < 0 {
        return Err(CommitError::Invalid("total price must not be negative"));
    }
    let start_dt = combine_dt(&cmd.date, &cmd.start_time)
        .ok_or(CommitError::Invalid("bad date or start time format"))?;
    let end_dt = combine_dt(&cmd.date, &cmd.end_time)
        .ok_or(CommitError::Invalid("bad end time format"))?;

    sqlx::query(
        "INSERT INTO slots (product_id, date, start_time, end_time, capacity, booked)
         VALUES (?, ?, ?, ?, ?, 0)
         ON CONFLICT (product_id, date, start_time) DO NOTHING",
    )
    .bind(cmd.product_id)
    .bind(&cmd.date)
    .bind(&cmd.start_time)
    .bind(&cmd.end_time)
    .bind(cmd.capacity.max(1))
    .execute(db)
    .await?;

    // Atomic check-and-increment; the store is the authority on capacity.
    let claimed = sqlx::query(
        "UPDATE slots SET booked = booked + 1
         WHERE product_id = ? AND date = ? AND start_time = ? AND booked < capacity",
    )
    .bind(cmd.product_id)
    .bind(&cmd.date)
    .bind(&cmd.start_time)
    .execute(db)
    .await?
    .rows_affected();

    if claimed == 0 {
        return Err(CommitError::SlotFull);
    }

    let inserted = sqlx::query(
        "INSERT INTO bookings (company_id, product_id, owner_id, start_dt, end_dt,
                               pet_count, total_price, special_requests, status, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(cmd.company_id)
    .bind(cmd.product_id)
    .bind(cmd.owner_id)
    .bind(start_dt)
    .bind(end_dt)
    .bind(cmd.pet_count)
    .bind(cmd.total_price)
    .bind(&cmd.special_requests)
    .bind(BookingStatus::Pending)
    .bind(Utc::now())
    .execute(db)
    .await;

    let booking_id = match inserted {
        Ok(res) => res.last_insert_rowid(),
        Err(e) => {
            // Give the claimed capacity back before surfacing the error.
            release_slot(db, cmd.product_id, &cmd.date, &cmd.start_time).await;
            return Err(e.into());
        }
    };

    tracing::info!(
        "booking {} created (product {}, {} {}, {} pets)",
        booking_id,
        cmd.product_id,
        cmd.date,
        cmd.start_time,
        cmd.pet_count
    );

    fetch(db, booking_id).await
}

/// Promote `Pending → Confirmed`. Called only from payment
/// reconciliation; confirming an already-confirmed booking is a no-op
/// so repeated callback delivery cannot corrupt state.
pub async fn confirm(db: &SqlitePool, booking_id: i64) -> Result<(), CommitError> {
    let updated = sqlx::query("UPDATE bookings SET status = ? WHERE id = ? AND status = ?")
        .bind(BookingStatus::Confirmed)
        .bind(booking_id)
        .bind(BookingStatus::Pending)
        .execute(db)
        .await?
        .rows_affected();

    if updated > 0 {
        tracing::info!("booking {} confirmed", booking_id);
        return Ok(());
    }

    match fetch(db, booking_id).await?.status {
        BookingStatus::Confirmed => Ok(()),
        _ => Err(CommitError::InvalidState),
    }
}

/// Mark a confirmed booking as serviced.
pub async fn complete(db: &SqlitePool, booking_id: i64) -> Result<(), CommitError> {
    let updated = sqlx::query("UPDATE bookings SET status = ? WHERE id = ? AND status = ?")
        .bind(BookingStatus::Completed)
        .bind(booking_id)
        .bind(BookingStatus::Confirmed)
        .execute(db)
        .await?
        .rows_affected();

    if updated > 0 {
        return Ok(());
    }
    match fetch(db, booking_id).await?.status {
        BookingStatus::Completed => Ok(()),
        _ => Err(CommitError::InvalidState),
    }
}

/// User-initiated cancellation, gated by the cancellation window.
/// Idempotent: cancelling a cancelled booking succeeds without effect.
pub async fn cancel(db: &SqlitePool, booking_id: i64, now: DateTime<Utc>) -> Result<(), CommitError> {
    let booking = fetch(db, booking_id).await?;

    if booking.status == BookingStatus::Cancelled {
        return Ok(());
    }
    if !can_cancel(booking.status, booking.start_dt, now) {
        return Err(CommitError::NotCancellable);
    }

    cancel_row(db, &booking, now).await
}

/// Compensating cancellation for a failed or expired payment attempt.
/// Bypasses the time-window policy: a booking that never got paid must
/// not stay `Pending` forever. Only `Pending` bookings are touched.
pub async fn rollback(db: &SqlitePool, booking_id: i64) -> Result<(), CommitError> {
    let booking = fetch(db, booking_id).await?;
    match booking.status {
        BookingStatus::Pending => cancel_row(db, &booking, Utc::now()).await,
        // Already resolved one way or the other; nothing to compensate.
        _ => Ok(()),
    }
}

async fn cancel_row(db: &SqlitePool, booking: &Booking, now: DateTime<Utc>) -> Result<(), CommitError> {
    let updated = sqlx::query(
        "UPDATE bookings SET status = ?, cancelled_at = ?
         WHERE id = ? AND status IN (?, ?)",
    )
    .bind(BookingStatus::Cancelled)
    .bind(now)
    .bind(booking.id)
    .bind(BookingStatus::Pending)
    .bind(BookingStatus::Confirmed)
    .execute(db)
    .await?
    .rows_affected();

    if updated > 0 {
        let date = hours::fmt_date(booking.start_dt.date_naive());
        let start = hours::fmt_time(booking.start_dt.time());
        release_slot(db, booking.product_id, &date, &start).await;
        tracing::info!("booking {} cancelled", booking.id);
    }
    Ok(())
}

/// Conditional decrement; never drives `booked` below zero.
async fn release_slot(db: &SqlitePool, product_id: i64, date: &str, start_time: &str) {
    if let Err(e) = sqlx::query(
        "UPDATE slots SET booked = booked - 1
         WHERE product_id = ? AND date = ? AND start_time = ? AND booked > 0",
    )
    .bind(product_id)
    .bind(date)
    .bind(start_time)
    .execute(db)
    .await
    {
        tracing::error!(
            "failed to release slot {} {} for product {}: {}",
            date,
            start_time,
            product_id,
            e
        );
    }
}

// ── Cancellation policy ──

/// A booking may be cancelled while it is pending or confirmed and the
/// service has not started. Past the start time cancellation is
/// permanently off, whatever the status.
pub fn can_cancel(status: BookingStatus, start_dt: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    matches!(status, BookingStatus::Pending | BookingStatus::Confirmed) && now < start_dt
}

// ── Tests ──
