use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::Duration;
use std::sync::Arc;

use crate::{
    booking,
    booking::CommitError,
    hours,
    models::*,
    AppState,
};

type HandlerError = (StatusCode, Json<ApiResponse<()>>);

/// Longest date range a single bulk request may span.
const MAX_BULK_RANGE_DAYS: i64 = 366;

fn db_error(context: &str, e: sqlx::Error) -> HandlerError {
    tracing::error!("{}: {}", context, e);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ApiResponse::error("DB error")),
    )
}

fn bad_request(msg: &str) -> HandlerError {
    (
        StatusCode::UNPROCESSABLE_ENTITY,
        Json(ApiResponse::error(msg)),
    )
}

/// POST /api/admin/slots/bulk — open capacity over a date range.
///
/// Each (date, start_time) cell is created at most once; cells that
/// already exist are counted as skipped so reruns are harmless.
pub async fn bulk_create_slots(
    State(state): State<Arc<AppState>>,
    Json(body): Json<BulkSlotsRequest>,
) -> Result<Json<ApiResponse<BulkSlotsResponse>>, HandlerError> {
    if body.time_slots.is_empty() {
        return Err(bad_request("At least one time slot is required"));
    }
    if body.capacity <= 0 {
        return Err(bad_request("Capacity must be positive"));
    }
    for ts in &body.time_slots {
        if hours::parse_time(&ts.start_time).is_none() || hours::parse_time(&ts.end_time).is_none()
        {
            return Err(bad_request("Time slots must be HH:MM"));
        }
    }

    let start = hours::parse_date(&body.start_date)
        .ok_or_else(|| bad_request("start_date must be YYYY-MM-DD"))?;
    let end = hours::parse_date(&body.end_date)
        .ok_or_else(|| bad_request("end_date must be YYYY-MM-DD"))?;
    if end < start {
        return Err(bad_request("end_date is before start_date"));
    }
    if (end - start).num_days() > MAX_BULK_RANGE_DAYS {
        return Err(bad_request("Date range is too large"));
    }

    let product_exists: bool =
        sqlx::query_scalar("SELECT COUNT(*) > 0 FROM products WHERE id = ? AND company_id = ?")
            .bind(body.product_id)
            .bind(body.company_id)
            .fetch_one(&state.db)
            .await
            .map_err(|e| db_error("bulk_create_slots", e))?;
    if !product_exists {
        return Err((
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error("Product not found for this company")),
        ));
    }

    let mut created = 0u64;
    let mut skipped = 0u64;
    let mut date = start;
    while date <= end {
        let date_str = hours::fmt_date(date);
        for ts in &body.time_slots {
            let result = sqlx::query(
                "INSERT INTO slots (product_id, date, start_time, end_time, capacity, booked)
                 VALUES (?, ?, ?, ?, ?, 0)
                 ON CONFLICT(product_id, date, start_time) DO NOTHING",
            )
            .bind(body.product_id)
            .bind(&date_str)
            .bind(&ts.start_time)
            .bind(&ts.end_time)
            .bind(body.capacity)
            .execute(&state.db)
            .await
            .map_err(|e| db_error("bulk_create_slots", e))?;

            if result.rows_affected() > 0 {
                created += 1;
            } else {
                skipped += 1;
            }
        }
        date += Duration::days(1);
    }

    tracing::info!(
        "bulk slots for product {}: {} created, {} skipped",
        body.product_id,
        created,
        skipped
    );
    Ok(Json(ApiResponse::success(BulkSlotsResponse {
        created,
        skipped,
    })))
}

/// GET /api/admin/slots?product_id=&date= — raw slot rows for a day.
pub async fn list_slots(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AdminSlotsQuery>,
) -> Result<Json<ApiResponse<Vec<Slot>>>, HandlerError> {
    let slots = sqlx::query_as::<_, Slot>(
        "SELECT id, product_id, date, start_time, end_time, capacity, booked
         FROM slots WHERE product_id = ? AND date = ? ORDER BY start_time ASC",
    )
    .bind(query.product_id)
    .bind(&query.date)
    .fetch_all(&state.db)
    .await
    .map_err(|e| db_error("list_slots", e))?;

    Ok(Json(ApiResponse::success(slots)))
}

/// DELETE /api/admin/slots/:id — remove a slot that has no bookings.
pub async fn delete_slot(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<ApiResponse<&'static str>>, HandlerError> {
    let deleted = sqlx::query("DELETE FROM slots WHERE id = ? AND booked = 0")
        .bind(id)
        .execute(&state.db)
        .await
        .map_err(|e| db_error("delete_slot", e))?;

    if deleted.rows_affected() == 0 {
        let exists: bool = sqlx::query_scalar("SELECT COUNT(*) > 0 FROM slots WHERE id = ?")
            .bind(id)
            .fetch_one(&state.db)
            .await
            .map_err(|e| db_error("delete_slot", e))?;
        return if exists {
            Err((
                StatusCode::CONFLICT,
                Json(ApiResponse::error("Slot has bookings and cannot be deleted")),
            ))
        } else {
            Err((
                StatusCode::NOT_FOUND,
                Json(ApiResponse::error("Slot not found")),
            ))
        };
    }

    Ok(Json(ApiResponse::success("Slot deleted")))
}

/// DELETE /api/admin/slots/product/:id — clear every unbooked slot of
/// a product. Slots with bookings are left in place.
pub async fn delete_product_slots(
    State(state): State<Arc<AppState>>,
    Path(product_id): Path<i64>,
) -> Result<Json<ApiResponse<u64>>, HandlerError> {
    let deleted = sqlx::query("DELETE FROM slots WHERE product_id = ? AND booked = 0")
        .bind(product_id)
        .execute(&state.db)
        .await
        .map_err(|e| db_error("delete_product_slots", e))?;

    Ok(Json(ApiResponse::success(deleted.rows_affected())))
}

/// GET /api/admin/bookings?company_id= — a company's bookings.
pub async fn company_bookings(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CompanyBookingsQuery>,
) -> Result<Json<ApiResponse<Vec<Booking>>>, HandlerError> {
    let bookings = sqlx::query_as::<_, Booking>(
        "SELECT id, company_id, product_id, owner_id, start_dt, end_dt, pet_count, total_price,
                special_requests, status, created_at, cancelled_at
         FROM bookings WHERE company_id = ? ORDER BY start_dt DESC",
    )
    .bind(query.company_id)
    .fetch_all(&state.db)
    .await
    .map_err(|e| db_error("company_bookings", e))?;

    Ok(Json(ApiResponse::success(bookings)))
}

/// POST /api/admin/bookings/:id/complete — mark a confirmed booking as
/// carried out.
pub async fn complete_booking(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<ApiResponse<&'static str>>, HandlerError> {
    match booking::complete(&state.db, id).await {
        Ok(()) => Ok(Json(ApiResponse::success("Booking completed"))),
        Err(CommitError::NotFound) => Err((
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error("Booking not found")),
        )),
        Err(CommitError::InvalidState) => Err((
            StatusCode::CONFLICT,
            Json(ApiResponse::error("Only confirmed bookings can be completed")),
        )),
        Err(e) => {
            tracing::error!("complete booking {} failed: {}", id, e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::error("DB error")),
            ))
        }
    }
}
