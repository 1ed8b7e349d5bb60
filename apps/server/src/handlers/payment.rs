use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Redirect,
    Json,
};
use std::sync::Arc;

use crate::{
    booking,
    booking::CommitError,
    models::*,
    payment,
    payment::PaymentError,
    AppState,
};

/// Where the user's browser lands after a callback has been reconciled.
fn result_url(webapp_url: &str, outcome: &str, order_id: &str) -> String {
    format!(
        "{}/booking/result?outcome={}&orderId={}",
        webapp_url.trim_end_matches('/'),
        outcome,
        order_id
    )
}

/// GET /api/payments/success — provider redirect after a successful
/// payment. Reconciliation is idempotent; duplicate deliveries land on
/// the same result page.
pub async fn payment_success(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PaymentSuccessQuery>,
) -> Redirect {
    match payment::resolve_success(&state.db, &query.order_id, &query.transaction_id).await {
        Ok(()) => {
            tracing::info!("payment success reconciled for order {}", query.order_id);
            Redirect::to(&result_url(&state.webapp_url, "success", &query.order_id))
        }
        Err(PaymentError::UnknownOrder) => {
            tracing::warn!("success callback for unknown order {}", query.order_id);
            Redirect::to(&result_url(&state.webapp_url, "unknown", &query.order_id))
        }
        Err(e) => {
            tracing::error!("success callback for order {} failed: {}", query.order_id, e);
            Redirect::to(&result_url(&state.webapp_url, "error", &query.order_id))
        }
    }
}

/// GET /api/payments/fail — provider redirect after a failed, cancelled
/// or expired payment attempt.
pub async fn payment_fail(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PaymentFailQuery>,
) -> Redirect {
    if let Some(msg) = &query.error_message {
        tracing::info!(
            "payment failed for order {}: {} ({})",
            query.order_id,
            query.error_code,
            msg
        );
    }

    match payment::resolve_failure(&state.db, &query.order_id, &query.error_code).await {
        Ok(status) => {
            let outcome = match status {
                SessionStatus::UserCancelled => "cancelled",
                SessionStatus::Expired => "expired",
                _ => "failed",
            };
            Redirect::to(&result_url(&state.webapp_url, outcome, &query.order_id))
        }
        Err(PaymentError::UnknownOrder) => {
            tracing::warn!("fail callback for unknown order {}", query.order_id);
            Redirect::to(&result_url(&state.webapp_url, "unknown", &query.order_id))
        }
        Err(e) => {
            tracing::error!("fail callback for order {} failed: {}", query.order_id, e);
            Redirect::to(&result_url(&state.webapp_url, "error", &query.order_id))
        }
    }
}

/// DELETE /api/bookings/payment-failed/:id — drop a pending booking
/// whose payment never went through and free its slot seat.
pub async fn delete_payment_failed(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<ApiResponse<&'static str>>, (StatusCode, Json<ApiResponse<()>>)> {
    match booking::rollback(&state.db, id).await {
        Ok(()) => Ok(Json(ApiResponse::success("Booking removed"))),
        Err(CommitError::NotFound) => Err((
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error("Booking not found")),
        )),
        Err(CommitError::InvalidState) => Err((
            StatusCode::CONFLICT,
            Json(ApiResponse::error("Only pending bookings can be removed")),
        )),
        Err(e) => {
            tracing::error!("payment-failed cleanup of booking {} failed: {}", id, e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::error("DB error")),
            ))
        }
    }
}
