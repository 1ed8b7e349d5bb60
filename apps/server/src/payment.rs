//! Bridge to the external payment provider.
//!
//! `open_session` only establishes that a checkout session exists; the
//! terminal outcome arrives later, on a different request (often a
//! different page load), as a redirect to the success/fail callback
//! URLs. Reconciliation is therefore keyed purely by `order_id` against
//! the persisted session row — never by anything held in memory when
//! the session was opened.

use chrono::Utc;
use sqlx::SqlitePool;
use thiserror::Error;
use url::Url;

use crate::booking::{self, CommitError};
use crate::models::{Booking, PaymentSession, SessionStatus};

#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("an active payment session already exists for this booking")]
    SessionAlreadyActive,
    #[error("unknown payment order")]
    UnknownOrder,
    #[error("payment provider error: {0}")]
    Provider(String),
    #[error("booking error: {0}")]
    Commit(#[from] CommitError),
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
}

/// Provider connection settings, read from the environment at startup.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Base URL of the provider's session API.
    pub api_url: String,
    pub merchant_id: String,
    /// Our externally reachable base URL, used to build the callback URLs.
    pub public_url: String,
}

const SESSION_SELECT: &str =
    "SELECT order_id, booking_id, amount, method, status, transaction_id, created_at
     FROM payment_sessions";

/// Fresh correlation key, unique per attempt.
pub fn new_order_id(booking_id: i64) -> String {
    format!("order-{}-{}", booking_id, Utc::now().timestamp_millis())
}

fn callback_url(public_url: &str, path: &str) -> Result<String, PaymentError> {
    Url::parse(public_url)
        .and_then(|base| base.join(path))
        .map(|u| u.to_string())
        .map_err(|e| PaymentError::Provider(format!("bad PUBLIC_URL: {}", e)))
}

async fn fetch_session(db: &SqlitePool, order_id: &str) -> Result<PaymentSession, PaymentError> {
    sqlx::query_as::<_, PaymentSession>(&format!("{} WHERE order_id = ?", SESSION_SELECT))
        .bind(order_id)
        .fetch_optional(db)
        .await?
        .ok_or(PaymentError::UnknownOrder)
}

/// Open a checkout session for a pending booking.
///
/// Returns `(order_id, checkout_url)`. At most one non-terminal session
/// may exist per booking; a failed provider call marks the session row
/// `Failed` so it is never left dangling in `Opened`.
pub async fn open_session(
    db: &SqlitePool,
    cfg: &ProviderConfig,
    booking: &Booking,
    method: &str,
    order_name: &str,
) -> Result<(String, String), PaymentError> {
    let active: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM payment_sessions WHERE booking_id = ? AND status = ?",
    )
    .bind(booking.id)
    .bind(SessionStatus::Opened)
    .fetch_one(db)
    .await?;
    if active {
        return Err(PaymentError::SessionAlreadyActive);
    }

    let order_id = new_order_id(booking.id);
    sqlx::query(
        "INSERT INTO payment_sessions (order_id, booking_id, amount, method, status, created_at)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&order_id)
    .bind(booking.id)
    .bind(booking.total_price)
    .bind(method)
    .bind(SessionStatus::Opened)
    .bind(Utc::now())
    .execute(db)
    .await?;

    let success_url = callback_url(&cfg.public_url, "/api/payments/success")?;
    let fail_url = callback_url(&cfg.public_url, "/api/payments/fail")?;

    match request_checkout(cfg, &order_id, order_name, booking.total_price, method, &success_url, &fail_url)
        .await
    {
        Ok(checkout_url) => {
            tracing::info!("payment session {} opened for booking {}", order_id, booking.id);
            Ok((order_id, checkout_url))
        }
        Err(e) => {
            // The provider never saw a usable session; close ours.
            sqlx::query("UPDATE payment_sessions SET status = ? WHERE order_id = ? AND status = ?")
                .bind(SessionStatus::Failed)
                .bind(&order_id)
                .bind(SessionStatus::Opened)
                .execute(db)
                .await
                .ok();
            tracing::error!("provider session open failed for booking {}: {}", booking.id, e);
            Err(PaymentError::Provider(e.to_string()))
        }
    }
}

/// POST the session to the provider; returns its checkout URL.
async fn request_checkout(
    cfg: &ProviderConfig,
    order_id: &str,
    order_name: &str,
    amount: i64,
    method: &str,
    success_url: &str,
    fail_url: &str,
) -> anyhow::Result<String> {
    let client = reqwest::Client::new();
    let body = serde_json::json!({
        "orderName": order_name,
        "amount": amount,
        "method": method,
        "merchantId": cfg.merchant_id,
        "orderId": order_id,
        "successUrl": success_url,
        "failUrl": fail_url,
    });

    let resp = client
        .post(format!("{}/sessions", cfg.api_url.trim_end_matches('/')))
        .header("Content-Type", "application/json")
        .json(&body)
        .send()
        .await?;

    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        anyhow::bail!("provider returned {}: {}", status, text);
    }

    let json: serde_json::Value = resp.json().await?;
    json["checkoutUrl"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("missing checkoutUrl in provider response"))
}

// ── Reconciliation ──

/// Success callback: finalize the session and promote the booking.
///
/// Idempotent on repeat delivery; a booking that is already confirmed
/// is left alone, and a write failure can be retried with the same
/// `order_id` without opening (and charging) a second session.
pub async fn resolve_success(
    db: &SqlitePool,
    order_id: &str,
    transaction_id: &str,
) -> Result<(), PaymentError> {
    let session = fetch_session(db, order_id).await?;

    match session.status {
        SessionStatus::Opened | SessionStatus::Succeeded => {}
        other => {
            // The session already failed terminally; a late success
            // redirect for it is noise, not a state change.
            tracing::warn!(
                "success callback for order {} ignored: session already {:?}",
                order_id,
                other
            );
            return Ok(());
        }
    }

    sqlx::query(
        "UPDATE payment_sessions SET status = ?, transaction_id = ?
         WHERE order_id = ? AND status = ?",
    )
    .bind(SessionStatus::Succeeded)
    .bind(transaction_id)
    .bind(order_id)
    .bind(SessionStatus::Opened)
    .execute(db)
    .await?;

    match booking::confirm(db, session.booking_id).await {
        Ok(()) => {
            tracing::info!("payment {} reconciled: booking {} confirmed", order_id, session.booking_id);
            Ok(())
        }
        Err(CommitError::InvalidState) => {
            // Paid but the booking is no longer pending/confirmed. Needs
            // manual follow-up (refund); do not fail the callback.
            tracing::error!(
                "payment {} succeeded but booking {} is not confirmable",
                order_id,
                session.booking_id
            );
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Failure callback: finalize the session from the provider error code.
///
/// User-initiated aborts leave the booking `Pending` so the user can
/// retry; provider-side failures and expiry roll the booking back to
/// `Cancelled` so nothing stays pending after a resolved attempt.
pub async fn resolve_failure(
    db: &SqlitePool,
    order_id: &str,
    error_code: &str,
) -> Result<SessionStatus, PaymentError> {
    let session = fetch_session(db, order_id).await?;

    if session.status.is_terminal() {
        return Ok(session.status); // duplicate delivery
    }

    let outcome = map_error_code(error_code);
    sqlx::query("UPDATE payment_sessions SET status = ? WHERE order_id = ? AND status = ?")
        .bind(outcome)
        .bind(order_id)
        .bind(SessionStatus::Opened)
        .execute(db)
        .await?;

    match outcome {
        SessionStatus::UserCancelled => {
            // Non-fatal: booking stays pending and retryable.
            tracing::info!("payment {} aborted by user; booking {} stays pending", order_id, session.booking_id);
        }
        _ => {
            booking::rollback(db, session.booking_id).await?;
            tracing::info!(
                "payment {} failed ({}); booking {} rolled back",
                order_id,
                error_code,
                session.booking_id
            );
        }
    }
    Ok(outcome)
}

/// Map a provider error code to a terminal session status.
pub fn map_error_code(code: &str) -> SessionStatus {
    let upper = code.to_ascii_uppercase();
    if upper.contains("USER_CANCEL") || upper.contains("WINDOW_CLOSED") {
        SessionStatus::UserCancelled
    } else if upper.contains("EXPIRE") || upper.contains("TIMEOUT") {
        SessionStatus::Expired
    } else {
        SessionStatus::Failed
    }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use crate::booking::{self, CreateBooking};
    use crate::models::BookingStatus;

    #[test]
    fn test_order_id_carries_booking_id() {
        let order_id = new_order_id(42);
        assert!(order_id.starts_with("order-42-"));
    }

    #[test]
    fn test_order_ids_unique_per_attempt() {
        // Millisecond clock plus booking id; equal only if generated in
        // the same millisecond, which the retry paths never do.
        let a = new_order_id(1);
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = new_order_id(1);
        assert_ne!(a, b);
    }

    #[test]
    fn test_error_code_mapping() {
        assert_eq!(map_error_code("USER_CANCEL"), SessionStatus::UserCancelled);
        assert_eq!(map_error_code("PAY_WINDOW_CLOSED"), SessionStatus::UserCancelled);
        assert_eq!(map_error_code("SESSION_EXPIRED"), SessionStatus::Expired);
        assert_eq!(map_error_code("TIMEOUT"), SessionStatus::Expired);
        assert_eq!(map_error_code("CARD_DECLINED"), SessionStatus::Failed);
        assert_eq!(map_error_code(""), SessionStatus::Failed);
    }

    #[test]
    fn test_callback_url_join() {
        let url = callback_url("https://pawbook.example.com", "/api/payments/success").unwrap();
        assert_eq!(url, "https://pawbook.example.com/api/payments/success");
    }

    // ── reconciliation against an in-memory store ──

    async fn test_db() -> SqlitePool {
        let db = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::db::run_migrations(&db).await.unwrap();
        db
    }

    /// Seed a product and a pending booking with an opened session.
    async fn seed_pending_payment(db: &SqlitePool) -> (i64, String) {
        let company_id = sqlx::query("INSERT INTO companies (name) VALUES ('Happy Paws')")
            .execute(db)
            .await
            .unwrap()
            .last_insert_rowid();
        let product_id = sqlx::query(
            "INSERT INTO products (company_id, name, price, duration_min, all_day, default_capacity, is_active)
             VALUES (?, 'Daycare', 40000, 60, 0, 1, 1)",
        )
        .bind(company_id)
        .execute(db)
        .await
        .unwrap()
        .last_insert_rowid();

        let booking = booking::create(
            db,
            CreateBooking {
                company_id,
                product_id,
                owner_id: 1,
                date: "2026-03-03".into(),
                start_time: "10:00".into(),
                end_time: "11:00".into(),
                pet_count: 1,
                total_price: 40_000,
                special_requests: None,
                capacity: 1,
            },
        )
        .await
        .unwrap();

        let order_id = new_order_id(booking.id);
        sqlx::query(
            "INSERT INTO payment_sessions (order_id, booking_id, amount, method, status, created_at)
             VALUES (?, ?, ?, 'card', ?, ?)",
        )
        .bind(&order_id)
        .bind(booking.id)
        .bind(booking.total_price)
        .bind(SessionStatus::Opened)
        .bind(Utc::now())
        .execute(db)
        .await
        .unwrap();

        (booking.id, order_id)
    }

    async fn booking_status(db: &SqlitePool, id: i64) -> BookingStatus {
        booking::fetch(db, id).await.unwrap().status
    }

    #[tokio::test]
    async fn test_success_confirms_booking() {
        let db = test_db().await;
        let (booking_id, order_id) = seed_pending_payment(&db).await;

        resolve_success(&db, &order_id, "tx-1").await.unwrap();
        assert_eq!(booking_status(&db, booking_id).await, BookingStatus::Confirmed);

        let session = fetch_session(&db, &order_id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Succeeded);
        assert_eq!(session.transaction_id.as_deref(), Some("tx-1"));
    }

    #[tokio::test]
    async fn test_success_idempotent_on_repeat_delivery() {
        let db = test_db().await;
        let (booking_id, order_id) = seed_pending_payment(&db).await;

        resolve_success(&db, &order_id, "tx-1").await.unwrap();
        resolve_success(&db, &order_id, "tx-1").await.unwrap();
        assert_eq!(booking_status(&db, booking_id).await, BookingStatus::Confirmed);
    }

    #[tokio::test]
    async fn test_failure_with_error_code_cancels_not_confirms() {
        let db = test_db().await;
        let (booking_id, order_id) = seed_pending_payment(&db).await;

        let outcome = resolve_failure(&db, &order_id, "CARD_DECLINED").await.unwrap();
        assert_eq!(outcome, SessionStatus::Failed);
        assert_eq!(booking_status(&db, booking_id).await, BookingStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_user_cancel_leaves_booking_pending() {
        let db = test_db().await;
        let (booking_id, order_id) = seed_pending_payment(&db).await;

        let outcome = resolve_failure(&db, &order_id, "USER_CANCEL").await.unwrap();
        assert_eq!(outcome, SessionStatus::UserCancelled);
        assert_eq!(booking_status(&db, booking_id).await, BookingStatus::Pending);
    }

    #[tokio::test]
    async fn test_expiry_rolls_back() {
        let db = test_db().await;
        let (booking_id, order_id) = seed_pending_payment(&db).await;

        resolve_failure(&db, &order_id, "SESSION_EXPIRED").await.unwrap();
        assert_eq!(booking_status(&db, booking_id).await, BookingStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_failure_idempotent() {
        let db = test_db().await;
        let (booking_id, order_id) = seed_pending_payment(&db).await;

        resolve_failure(&db, &order_id, "CARD_DECLINED").await.unwrap();
        let second = resolve_failure(&db, &order_id, "CARD_DECLINED").await.unwrap();
        assert_eq!(second, SessionStatus::Failed);
        assert_eq!(booking_status(&db, booking_id).await, BookingStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_late_success_after_failure_ignored() {
        let db = test_db().await;
        let (booking_id, order_id) = seed_pending_payment(&db).await;

        resolve_failure(&db, &order_id, "CARD_DECLINED").await.unwrap();
        resolve_success(&db, &order_id, "tx-late").await.unwrap();
        // First terminal outcome wins; the rollback stands.
        assert_eq!(booking_status(&db, booking_id).await, BookingStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_unknown_order_rejected() {
        let db = test_db().await;
        assert!(matches!(
            resolve_success(&db, "order-0-0", "tx").await.unwrap_err(),
            PaymentError::UnknownOrder
        ));
        assert!(matches!(
            resolve_failure(&db, "order-0-0", "X").await.unwrap_err(),
            PaymentError::UnknownOrder
        ));
    }
}
