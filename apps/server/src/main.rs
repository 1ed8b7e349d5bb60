mod availability;
mod booking;
mod db;
mod draft;
mod handlers;
mod hours;
mod models;
mod payment;
mod rate_limit;

use axum::{
    middleware::from_fn_with_state,
    routing::{delete, get, post, put},
    Router,
};
use sqlx::sqlite::SqlitePoolOptions;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use draft::WizardStore;
use payment::ProviderConfig;
use rate_limit::{
    rate_limit_admin, rate_limit_booking, rate_limit_public, rate_limit_wizard, RateLimitConfig,
    RateLimiter,
};

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub db: sqlx::SqlitePool,
    pub wizards: WizardStore,
    pub provider: ProviderConfig,
    pub webapp_url: String,
    pub started_at: Instant,
}

/// Rate limit cleanup interval (seconds).
const RATE_LIMIT_CLEANUP_SECS: u64 = 300;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let env_filter = EnvFilter::from_default_env().add_directive("info".parse()?);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite:pawbook.db?mode=rwc".into());
    let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port = std::env::var("PORT").unwrap_or_else(|_| "8080".into());

    // ── Payment provider config ──
    let pay_api_url = std::env::var("PAY_API_URL").unwrap_or_default();
    let pay_merchant_id = std::env::var("PAY_MERCHANT_ID").unwrap_or_default();
    let public_url =
        std::env::var("PUBLIC_URL").unwrap_or_else(|_| format!("http://localhost:{}", port));
    let webapp_url = std::env::var("WEBAPP_URL").unwrap_or_else(|_| "https://example.com".into());

    if pay_api_url.is_empty() {
        tracing::warn!("PAY_API_URL not set — payments will fail");
    }

    // ── Database ──
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await?;

    db::run_migrations(&pool).await?;

    let state = Arc::new(AppState {
        db: pool,
        wizards: WizardStore::new(),
        provider: ProviderConfig {
            api_url: pay_api_url,
            merchant_id: pay_merchant_id,
            public_url,
        },
        webapp_url: webapp_url.clone(),
        started_at: Instant::now(),
    });

    // ── Rate limiter ──
    let rate_limiter = RateLimiter::new();
    rate_limiter.add_tier(
        "public",
        RateLimitConfig {
            max_requests: 60,
            window: Duration::from_secs(60),
        },
    );
    rate_limiter.add_tier(
        "wizard",
        RateLimitConfig {
            max_requests: 30,
            window: Duration::from_secs(60),
        },
    );
    rate_limiter.add_tier(
        "booking",
        RateLimitConfig {
            max_requests: 5,
            window: Duration::from_secs(300),
        },
    );
    rate_limiter.add_tier(
        "admin",
        RateLimitConfig {
            max_requests: 120,
            window: Duration::from_secs(60),
        },
    );

    // ── Background task: cleanup stale rate limit entries ──
    let cleanup_limiter = rate_limiter.clone();
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(tokio::time::Duration::from_secs(RATE_LIMIT_CLEANUP_SECS));
        loop {
            interval.tick().await;
            cleanup_limiter.cleanup();
        }
    });

    // ── CORS: whitelist WEBAPP_URL when configured, otherwise allow any ──
    let cors = if webapp_url != "https://example.com" {
        let origins: Vec<axum::http::HeaderValue> = vec![
            webapp_url.parse().expect("WEBAPP_URL must be a valid URL"),
            "http://localhost:5173".parse().expect("static origin"), // Vite dev server
        ];
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    };

    // ── Router (5 groups with per-group rate limits) ──

    // 1. No-limit: health check + payment provider callbacks
    let no_limit_routes = Router::new()
        .route("/api/health", get(handlers::health::health))
        .route("/api/payments/success", get(handlers::payment::payment_success))
        .route("/api/payments/fail", get(handlers::payment::payment_fail));

    // 2. Public: read-only catalog endpoints (60 req/min)
    let public_routes = Router::new()
        .route("/api/products", get(handlers::client::list_products))
        .route(
            "/api/products/{id}/available-slots",
            get(handlers::client::available_slots),
        )
        .route(
            "/api/companies/{id}/closed-dates",
            get(handlers::client::closed_dates),
        )
        .layer(from_fn_with_state(rate_limiter.clone(), rate_limit_public));

    // 3. Wizard: draft manipulation (30 req/min)
    let wizard_routes = Router::new()
        .route("/api/wizard", post(handlers::client::start_wizard))
        .route("/api/wizard/{id}", get(handlers::client::get_wizard))
        .route(
            "/api/wizard/{id}/product",
            post(handlers::client::wizard_select_product),
        )
        .route(
            "/api/wizard/{id}/slot",
            post(handlers::client::wizard_select_slot),
        )
        .route(
            "/api/wizard/{id}/pets",
            post(handlers::client::wizard_select_pets),
        )
        .route(
            "/api/wizard/{id}/requests",
            post(handlers::client::wizard_set_requests),
        )
        .route("/api/wizard/{id}/back", post(handlers::client::wizard_back))
        .route(
            "/api/wizard/{id}/abandon",
            post(handlers::client::wizard_abandon),
        )
        .route(
            "/api/wizard/{id}/complete",
            post(handlers::client::wizard_complete),
        )
        .route("/api/bookings", get(handlers::client::my_bookings))
        .route("/api/bookings/{id}", get(handlers::client::get_booking))
        .route(
            "/api/bookings/{id}/cancel",
            put(handlers::client::cancel_booking),
        )
        .route(
            "/api/bookings/payment-failed/{id}",
            delete(handlers::payment::delete_payment_failed),
        )
        .layer(from_fn_with_state(rate_limiter.clone(), rate_limit_wizard));

    // 4. Booking commit: strictest limit (5 req/5min)
    let booking_routes = Router::new()
        .route(
            "/api/wizard/{id}/confirm",
            post(handlers::client::wizard_confirm),
        )
        .layer(from_fn_with_state(rate_limiter.clone(), rate_limit_booking));

    // 5. Admin: slot and booking administration (120 req/min)
    let admin_routes = Router::new()
        .route(
            "/api/admin/slots/bulk",
            post(handlers::admin::bulk_create_slots),
        )
        .route("/api/admin/slots", get(handlers::admin::list_slots))
        .route(
            "/api/admin/slots/{id}",
            delete(handlers::admin::delete_slot),
        )
        .route(
            "/api/admin/slots/product/{id}",
            delete(handlers::admin::delete_product_slots),
        )
        .route(
            "/api/admin/bookings",
            get(handlers::admin::company_bookings),
        )
        .route(
            "/api/admin/bookings/{id}/complete",
            post(handlers::admin::complete_booking),
        )
        .layer(from_fn_with_state(rate_limiter.clone(), rate_limit_admin));

    let app = Router::new()
        .merge(no_limit_routes)
        .merge(public_routes)
        .merge(wizard_routes)
        .merge(booking_routes)
        .merge(admin_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state);

    let addr = format!("{}:{}", host, port);
    tracing::info!("Pawbook reservation server starting on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
