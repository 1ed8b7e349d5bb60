use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::{
    availability, booking,
    booking::CommitError,
    draft::{Agreements, BookingDraft, DraftError, DraftView, ProductChoice, SlotChoice},
    hours::{self, OperatingHours, DEFAULT_RANGE_DAYS},
    models::*,
    payment,
    AppState,
};

type HandlerError = (StatusCode, Json<ApiResponse<()>>);

// ── Error mapping ──

fn db_error(context: &str, e: sqlx::Error) -> HandlerError {
    tracing::error!("{}: {}", context, e);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ApiResponse::error("DB error")),
    )
}

fn wizard_not_found() -> HandlerError {
    (
        StatusCode::NOT_FOUND,
        Json(ApiResponse::error("Wizard session not found")),
    )
}

fn draft_error(e: DraftError) -> HandlerError {
    let status = match e {
        DraftError::InvalidTransition => StatusCode::CONFLICT,
        _ => StatusCode::UNPROCESSABLE_ENTITY,
    };
    (status, Json(ApiResponse::error(e.to_string())))
}

fn commit_error(e: CommitError) -> HandlerError {
    match e {
        CommitError::Invalid(msg) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(ApiResponse::error(msg)),
        ),
        CommitError::SlotFull => (
            StatusCode::CONFLICT,
            Json(ApiResponse::error(
                "The selected time slot just filled up. Please pick another one.",
            )),
        ),
        CommitError::NotFound => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error("Booking not found")),
        ),
        CommitError::NotCancellable => (
            StatusCode::CONFLICT,
            Json(ApiResponse::error(
                "This booking can no longer be cancelled",
            )),
        ),
        CommitError::InvalidState => (
            StatusCode::CONFLICT,
            Json(ApiResponse::error(
                "Booking is not in a state that allows this",
            )),
        ),
        CommitError::Db(e) => db_error("booking", e),
    }
}

/// Owner identity resolved by the upstream gateway; the engine only
/// checks ownership consistency.
fn extract_owner(headers: &HeaderMap) -> Result<i64, HandlerError> {
    headers
        .get("x-owner-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| {
            (
                StatusCode::UNAUTHORIZED,
                Json(ApiResponse::error("Missing or invalid X-Owner-Id header")),
            )
        })
}

// ── Catalog endpoints ──

/// GET /api/products — list active products.
pub async fn list_products(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ApiResponse<Vec<Product>>>, HandlerError> {
    let products = sqlx::query_as::<_, Product>(
        "SELECT id, company_id, name, price, duration_min, all_day, default_capacity, is_active
         FROM products WHERE is_active = 1 ORDER BY id ASC",
    )
    .fetch_all(&state.db)
    .await
    .map_err(|e| db_error("list_products", e))?;

    Ok(Json(ApiResponse::success(products)))
}

/// GET /api/products/:id/available-slots?date=YYYY-MM-DD
///
/// Never errors toward the wizard: any backing failure shows up as an
/// empty list.
pub async fn available_slots(
    State(state): State<Arc<AppState>>,
    Path(product_id): Path<i64>,
    Query(query): Query<AvailabilityQuery>,
) -> Json<ApiResponse<Vec<availability::DaySlot>>> {
    let slots = availability::resolve(&state.db, product_id, &query.date).await;
    Json(ApiResponse::success(slots))
}

/// GET /api/companies/:id/closed-dates?days=N — dates the company is
/// closed within the look-ahead range (default 90 days).
pub async fn closed_dates(
    State(state): State<Arc<AppState>>,
    Path(company_id): Path<i64>,
    Query(query): Query<ClosedDatesQuery>,
) -> Result<Json<ApiResponse<Vec<String>>>, HandlerError> {
    let raw: Option<Option<String>> =
        sqlx::query_scalar("SELECT operating_hours FROM companies WHERE id = ?")
            .bind(company_id)
            .fetch_optional(&state.db)
            .await
            .map_err(|e| db_error("closed_dates", e))?;

    let raw = raw.ok_or_else(|| {
        (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error("Company not found")),
        )
    })?;

    let hours_parsed = OperatingHours::parse(raw.as_deref());
    let days = query.days.unwrap_or(DEFAULT_RANGE_DAYS).clamp(0, 366);
    let from = Utc::now().date_naive();
    let dates = hours::closed_dates(hours_parsed.as_ref(), from, days)
        .into_iter()
        .map(hours::fmt_date)
        .collect();

    Ok(Json(ApiResponse::success(dates)))
}

// ── Wizard endpoints ──

/// POST /api/wizard — start a new booking wizard session.
pub async fn start_wizard(
    State(state): State<Arc<AppState>>,
) -> Json<ApiResponse<StartWizardResponse>> {
    let wizard_id = state.wizards.start();
    Json(ApiResponse::success(StartWizardResponse { wizard_id }))
}

/// GET /api/wizard/:id — snapshot of the draft.
pub async fn get_wizard(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
) -> Result<Json<ApiResponse<DraftView>>, HandlerError> {
    state
        .wizards
        .view(id)
        .map(|view| Json(ApiResponse::success(view)))
        .ok_or_else(wizard_not_found)
}

/// POST /api/wizard/:id/product — select (or change) the product.
pub async fn wizard_select_product(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
    Json(body): Json<SelectProductRequest>,
) -> Result<Json<ApiResponse<DraftView>>, HandlerError> {
    let product = sqlx::query_as::<_, Product>(
        "SELECT id, company_id, name, price, duration_min, all_day, default_capacity, is_active
         FROM products WHERE id = ? AND is_active = 1",
    )
    .bind(body.product_id)
    .fetch_optional(&state.db)
    .await
    .map_err(|e| db_error("wizard_select_product", e))?
    .ok_or_else(|| {
        (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error("Product not found")),
        )
    })?;

    let choice = ProductChoice {
        product_id: product.id,
        company_id: product.company_id,
        price: product.price,
        all_day: product.all_day,
    };

    state
        .wizards
        .with(id, |draft| draft.select_product(choice))
        .ok_or_else(wizard_not_found)?
        .map_err(draft_error)?;

    Ok(Json(ApiResponse::success(
        state.wizards.view(id).ok_or_else(wizard_not_found)?,
    )))
}

/// POST /api/wizard/:id/slot — select a time slot for a date.
///
/// The slot is validated against current availability; a full slot is a
/// conflict and the client is told to re-fetch, never to retry blindly.
pub async fn wizard_select_slot(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
    Json(body): Json<SelectSlotRequest>,
) -> Result<Json<ApiResponse<DraftView>>, HandlerError> {
    let product_id = state
        .wizards
        .view(id)
        .ok_or_else(wizard_not_found)?
        .product_id
        .ok_or_else(|| draft_error(DraftError::MissingProduct))?;

    let slots = availability::resolve(&state.db, product_id, &body.date).await;
    let slot = slots
        .iter()
        .find(|s| s.start_time == body.start_time)
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                Json(ApiResponse::error("No such time slot on that date")),
            )
        })?;

    if !slot.available {
        return Err((
            StatusCode::CONFLICT,
            Json(ApiResponse::error(
                "That time slot is fully booked. Please pick another one.",
            )),
        ));
    }

    let choice = SlotChoice {
        date: body.date,
        start_time: slot.start_time.clone(),
        end_time: slot.end_time.clone(),
    };

    state
        .wizards
        .with(id, |draft| draft.select_slot(choice))
        .ok_or_else(wizard_not_found)?
        .map_err(draft_error)?;

    Ok(Json(ApiResponse::success(
        state.wizards.view(id).ok_or_else(wizard_not_found)?,
    )))
}

/// POST /api/wizard/:id/pets — select the pets joining the service.
pub async fn wizard_select_pets(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
    headers: HeaderMap,
    Json(body): Json<SelectPetsRequest>,
) -> Result<Json<ApiResponse<DraftView>>, HandlerError> {
    let owner_id = extract_owner(&headers)?;

    let pet_ids: BTreeSet<i64> = body.pet_ids.into_iter().collect();
    for pet_id in &pet_ids {
        let owned: bool =
            sqlx::query_scalar("SELECT COUNT(*) > 0 FROM pets WHERE id = ? AND owner_id = ?")
                .bind(pet_id)
                .bind(owner_id)
                .fetch_one(&state.db)
                .await
                .map_err(|e| db_error("wizard_select_pets", e))?;
        if !owned {
            return Err((
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(ApiResponse::error("Pet does not belong to this owner")),
            ));
        }
    }

    state
        .wizards
        .with(id, |draft| draft.set_pets(pet_ids))
        .ok_or_else(wizard_not_found)?
        .map_err(draft_error)?;

    Ok(Json(ApiResponse::success(
        state.wizards.view(id).ok_or_else(wizard_not_found)?,
    )))
}

/// POST /api/wizard/:id/requests — free-text special requests.
pub async fn wizard_set_requests(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
    Json(body): Json<SpecialRequestsRequest>,
) -> Result<Json<ApiResponse<DraftView>>, HandlerError> {
    state
        .wizards
        .with(id, |draft| draft.set_special_requests(body.text))
        .ok_or_else(wizard_not_found)?
        .map_err(draft_error)?;

    Ok(Json(ApiResponse::success(
        state.wizards.view(id).ok_or_else(wizard_not_found)?,
    )))
}

/// POST /api/wizard/:id/back — previous-step navigation.
pub async fn wizard_back(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
) -> Result<Json<ApiResponse<DraftView>>, HandlerError> {
    state
        .wizards
        .with(id, |draft| draft.back())
        .ok_or_else(wizard_not_found)?
        .map_err(draft_error)?;

    Ok(Json(ApiResponse::success(
        state.wizards.view(id).ok_or_else(wizard_not_found)?,
    )))
}

/// POST /api/wizard/:id/abandon — drop the draft. Any pending booking
/// created from it stays cancellable under the normal window.
pub async fn wizard_abandon(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
) -> Result<Json<ApiResponse<&'static str>>, HandlerError> {
    if state.wizards.remove(id) {
        Ok(Json(ApiResponse::success("Wizard abandoned")))
    } else {
        Err(wizard_not_found())
    }
}

/// POST /api/wizard/:id/confirm — the commit step.
///
/// Persists the draft as a pending booking, opens the payment session
/// and moves the wizard to the paying step. The checkout URL in the
/// response is where the user completes payment; the outcome comes back
/// later through the payment callbacks.
pub async fn wizard_confirm(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
    headers: HeaderMap,
    Json(body): Json<ConfirmWizardRequest>,
) -> Result<Json<ApiResponse<ConfirmWizardResponse>>, HandlerError> {
    let owner_id = extract_owner(&headers)?;

    let agreements = Agreements {
        service_terms: body.agree_service_terms,
        cancellation_policy: body.agree_cancellation_policy,
    };
    // Local validation; nothing is persisted until every box is ticked.
    if !agreements.all_accepted() {
        return Err(draft_error(DraftError::AgreementsNotAccepted));
    }

    state
        .wizards
        .with(id, |draft| {
            draft.to_confirming()?;
            draft.set_agreements(agreements)
        })
        .ok_or_else(wizard_not_found)?
        .map_err(draft_error)?;

    // Snapshot the confirmed selections for the commit.
    let (product_choice, slot, pets, special_requests, total_price) = state
        .wizards
        .with(id, |draft| match draft {
            BookingDraft::Confirming {
                product,
                slot,
                pets,
                special_requests,
                ..
            } => Some((
                product.clone(),
                slot.clone(),
                pets.clone(),
                special_requests.clone(),
                product.price * pets.len() as i64,
            )),
            _ => None,
        })
        .ok_or_else(wizard_not_found)?
        .ok_or_else(|| draft_error(DraftError::InvalidTransition))?;

    let product = sqlx::query_as::<_, Product>(
        "SELECT id, company_id, name, price, duration_min, all_day, default_capacity, is_active
         FROM products WHERE id = ? AND is_active = 1",
    )
    .bind(product_choice.product_id)
    .fetch_optional(&state.db)
    .await
    .map_err(|e| db_error("wizard_confirm", e))?
    .ok_or_else(|| {
        (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error("Product is no longer available")),
        )
    })?;

    let booking = booking::create(
        &state.db,
        booking::CreateBooking {
            company_id: product.company_id,
            product_id: product.id,
            owner_id,
            date: slot.date.clone(),
            start_time: slot.start_time.clone(),
            end_time: slot.end_time.clone(),
            pet_count: pets.len() as i64,
            total_price,
            special_requests,
            capacity: product.default_capacity,
        },
    )
    .await
    .map_err(commit_error)?;

    let order_name = format!("{} × {} pets", product.name, booking.pet_count);
    let (order_id, checkout_url) =
        match payment::open_session(&state.db, &state.provider, &booking, &body.method, &order_name)
            .await
        {
            Ok(opened) => opened,
            Err(e) => {
                // The booking cannot be paid; give the slot back.
                if let Err(rb) = booking::rollback(&state.db, booking.id).await {
                    tracing::error!("rollback of booking {} failed: {}", booking.id, rb);
                }
                tracing::error!("payment session open failed: {}", e);
                return Err((
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ApiResponse::error(
                        "Could not start the payment. Please try again later.",
                    )),
                ));
            }
        };

    state
        .wizards
        .with(id, |draft| draft.to_paying(booking.id, order_id.clone()))
        .ok_or_else(wizard_not_found)?
        .map_err(draft_error)?;

    Ok(Json(ApiResponse::success(ConfirmWizardResponse {
        booking_id: booking.id,
        order_id,
        checkout_url,
        total_price,
    })))
}

/// POST /api/wizard/:id/complete — finish the wizard after payment.
///
/// Succeeds only once reconciliation has confirmed the booking; the
/// draft is destroyed on completion.
pub async fn wizard_complete(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
) -> Result<Json<ApiResponse<Booking>>, HandlerError> {
    let booking_id = state
        .wizards
        .view(id)
        .ok_or_else(wizard_not_found)?
        .booking_id
        .ok_or_else(|| draft_error(DraftError::InvalidTransition))?;

    let booking = booking::fetch(&state.db, booking_id)
        .await
        .map_err(commit_error)?;

    match booking.status {
        BookingStatus::Confirmed => {
            state
                .wizards
                .with(id, |draft| draft.complete())
                .ok_or_else(wizard_not_found)?
                .map_err(draft_error)?;
            state.wizards.remove(id);
            Ok(Json(ApiResponse::success(booking)))
        }
        BookingStatus::Pending => Err((
            StatusCode::CONFLICT,
            Json(ApiResponse::error("Payment has not been resolved yet")),
        )),
        _ => Err((
            StatusCode::CONFLICT,
            Json(ApiResponse::error("Payment did not complete; booking was not confirmed")),
        )),
    }
}

// ── Booking endpoints ──

/// GET /api/bookings/:id — booking detail for its owner.
pub async fn get_booking(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<ApiResponse<Booking>>, HandlerError> {
    let owner_id = extract_owner(&headers)?;
    let booking = booking::fetch(&state.db, id).await.map_err(commit_error)?;
    if booking.owner_id != owner_id {
        return Err((
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error("Booking not found")),
        ));
    }
    Ok(Json(ApiResponse::success(booking)))
}

/// GET /api/bookings — the owner's bookings, soonest first.
pub async fn my_bookings(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<ApiResponse<Vec<Booking>>>, HandlerError> {
    let owner_id = extract_owner(&headers)?;
    let bookings = sqlx::query_as::<_, Booking>(
        "SELECT id, company_id, product_id, owner_id, start_dt, end_dt, pet_count, total_price,
                special_requests, status, created_at, cancelled_at
         FROM bookings WHERE owner_id = ? ORDER BY start_dt ASC",
    )
    .bind(owner_id)
    .fetch_all(&state.db)
    .await
    .map_err(|e| db_error("my_bookings", e))?;

    Ok(Json(ApiResponse::success(bookings)))
}

/// PUT /api/bookings/:id/cancel — user-initiated cancellation, bounded
/// by the cancellation window.
pub async fn cancel_booking(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<ApiResponse<&'static str>>, HandlerError> {
    let owner_id = extract_owner(&headers)?;
    let booking = booking::fetch(&state.db, id).await.map_err(commit_error)?;
    if booking.owner_id != owner_id {
        return Err((
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error("Booking not found")),
        ));
    }

    booking::cancel(&state.db, id, Utc::now())
        .await
        .map_err(commit_error)?;

    Ok(Json(ApiResponse::success("Booking cancelled")))
}
