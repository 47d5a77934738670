//! API Service - Dashboard surface for the payment warehouse
//!
//! Endpoints:
//! - GET /health - Health check
//! - GET /payments - The joined fact+dimension view, one row per payment
//! - GET /dashboard - Rollups: grand total, by department, by month
//! - POST /cache/invalidate - Drop cached query results (signalled by the loader)
//!
//! Query results are served through a read-through cache with a fixed TTL
//! (CACHE_TTL_SECS, default 600). The loader invalidates it explicitly after
//! every successful load; stale entries also expire passively.

use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tower_http::cors::{Any, CorsLayer};

// ============================================================================
// State
// ============================================================================

struct CacheEntry {
    fetched_at: Instant,
    payload: serde_json::Value,
}

struct AppState {
    pool: PgPool,
    cache: RwLock<HashMap<&'static str, CacheEntry>>,
    ttl: Duration,
}

/// A cached entry is served only while younger than the TTL.
fn is_fresh(age: Duration, ttl: Duration) -> bool {
    age < ttl
}

async fn cache_get(state: &AppState, key: &str) -> Option<serde_json::Value> {
    let cache = state.cache.read().await;
    cache
        .get(key)
        .filter(|entry| is_fresh(entry.fetched_at.elapsed(), state.ttl))
        .map(|entry| entry.payload.clone())
}

async fn cache_put(state: &AppState, key: &'static str, payload: serde_json::Value) {
    let mut cache = state.cache.write().await;
    cache.insert(
        key,
        CacheEntry {
            fetched_at: Instant::now(),
            payload,
        },
    );
}

// ============================================================================
// Response types
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
    version: &'static str,
}

#[derive(Serialize, sqlx::FromRow)]
struct PaymentRow {
    payment_key: i64,
    date_text: String,
    day_name: String,
    month_name: String,
    year: i32,
    staff_id: String,
    staff_name: String,
    department_name: String,
    job_id: String,
    job_type: String,
    vehicle_type: String,
    weather_condition: String,
    work_hours: Option<f64>,
    holiday_payment: Option<f64>,
    travel_distance: Option<f64>,
    travel_allowance: Option<f64>,
    weather_allowance: Option<f64>,
    total_paid: Option<f64>,
}

#[derive(Serialize)]
struct DepartmentSlice {
    department_name: String,
    total_paid: f64,
    total_formatted: String,
    percentage: f64,
}

#[derive(Serialize)]
struct MonthSlice {
    year: i32,
    month_number: i32,
    month_name: String,
    total_paid: f64,
}

#[derive(Serialize)]
struct DashboardResponse {
    total_paid: f64,
    total_formatted: String,
    payment_count: i64,
    departments: Vec<DepartmentSlice>,
    months: Vec<MonthSlice>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

// ============================================================================
// Helpers
// ============================================================================

/// Share of the grand total, as a percentage. Zero total yields zero.
fn share_pct(part: f64, total: f64) -> f64 {
    if total > 0.0 {
        (part / total) * 100.0
    } else {
        0.0
    }
}

/// Format an amount as Australian dollars for display.
fn format_aud(amount: f64) -> String {
    if amount >= 1_000_000.0 {
        format!("${:.2}M", amount / 1_000_000.0)
    } else {
        format!("${:.2}", amount)
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        version: "0.1.0",
    })
}

/// The fixed join the dashboard renders. Every foreign key is guaranteed to
/// resolve, so inner joins are safe.
const PAYMENTS_VIEW_SQL: &str = r#"
SELECT f.payment_key,
       d.date_text, d.day_name, d.month_name, d.year,
       s.staff_id, s.staff_name,
       p.department_name,
       j.job_id, j.job_type,
       t.vehicle_type,
       f.weather_condition,
       f.work_hours, f.holiday_payment, f.travel_distance, f.travel_allowance,
       f.weather_allowance, f.total_paid
FROM fact_payment f
JOIN dim_date d ON f.date_key = d.date_key
JOIN dim_staff s ON f.staff_key = s.staff_key
JOIN dim_department p ON f.department_key = p.department_key
JOIN dim_maintenance_job j ON f.job_key = j.job_key
JOIN dim_travel_policy t ON f.travel_policy_key = t.travel_policy_key
JOIN dim_weather_policy w ON f.weather_policy_key = w.weather_policy_key
ORDER BY f.payment_key
"#;

async fn payments_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if let Some(cached) = cache_get(&state, "payments").await {
        return Json(cached).into_response();
    }

    let rows: Result<Vec<PaymentRow>, _> = sqlx::query_as(PAYMENTS_VIEW_SQL)
        .fetch_all(&state.pool)
        .await;

    match rows {
        Ok(rows) => {
            let payload = serde_json::json!({ "count": rows.len(), "payments": rows });
            cache_put(&state, "payments", payload.clone()).await;
            Json(payload).into_response()
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
            .into_response(),
    }
}

async fn dashboard_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if let Some(cached) = cache_get(&state, "dashboard").await {
        return Json(cached).into_response();
    }

    let totals: Result<(i64, Option<f64>), _> =
        sqlx::query_as("SELECT COUNT(*), SUM(total_paid) FROM fact_payment")
            .fetch_one(&state.pool)
            .await;

    let (payment_count, total_paid) = match totals {
        Ok((count, sum)) => (count, sum.unwrap_or(0.0)),
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: e.to_string(),
                }),
            )
                .into_response();
        }
    };

    let departments: Result<Vec<(String, Option<f64>)>, _> = sqlx::query_as(
        r#"
        SELECT p.department_name, SUM(f.total_paid)
        FROM fact_payment f
        JOIN dim_department p ON f.department_key = p.department_key
        GROUP BY p.department_name
        ORDER BY SUM(f.total_paid) DESC NULLS LAST
        "#,
    )
    .fetch_all(&state.pool)
    .await;

    let departments = match departments {
        Ok(rows) => rows,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: e.to_string(),
                }),
            )
                .into_response();
        }
    };

    let months: Result<Vec<(i32, i32, String, Option<f64>)>, _> = sqlx::query_as(
        r#"
        SELECT d.year, d.month_number, d.month_name, SUM(f.total_paid)
        FROM fact_payment f
        JOIN dim_date d ON f.date_key = d.date_key
        GROUP BY d.year, d.month_number, d.month_name
        ORDER BY d.year, d.month_number
        "#,
    )
    .fetch_all(&state.pool)
    .await;

    let months = match months {
        Ok(rows) => rows,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: e.to_string(),
                }),
            )
                .into_response();
        }
    };

    let response = DashboardResponse {
        total_paid,
        total_formatted: format_aud(total_paid),
        payment_count,
        departments: departments
            .into_iter()
            .map(|(name, sum)| {
                let dept_total = sum.unwrap_or(0.0);
                DepartmentSlice {
                    department_name: name,
                    total_paid: dept_total,
                    total_formatted: format_aud(dept_total),
                    percentage: share_pct(dept_total, total_paid),
                }
            })
            .collect(),
        months: months
            .into_iter()
            .map(|(year, month_number, month_name, sum)| MonthSlice {
                year,
                month_number,
                month_name,
                total_paid: sum.unwrap_or(0.0),
            })
            .collect(),
    };

    let payload = serde_json::json!(response);
    cache_put(&state, "dashboard", payload.clone()).await;
    Json(payload).into_response()
}

async fn invalidate_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut cache = state.cache.write().await;
    let dropped = cache.len();
    cache.clear();
    println!("Cache invalidated: {} entry(ies) dropped", dropped);
    Json(serde_json::json!({ "invalidated": dropped }))
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let db_url = std::env::var("DB_URL").context("DB_URL env var missing")?;
    let bind = std::env::var("API_BIND").unwrap_or_else(|_| "127.0.0.1:8080".to_string());
    let ttl_secs: u64 = std::env::var("CACHE_TTL_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(600);

    println!("=== Payment Warehouse API ===");
    println!("Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&db_url)
        .await
        .context("Failed to connect to database")?;

    println!("Database connected");
    println!("Cache TTL: {}s", ttl_secs);

    let state = Arc::new(AppState {
        pool,
        cache: RwLock::new(HashMap::new()),
        ttl: Duration::from_secs(ttl_secs),
    });

    // CORS for web frontend
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/payments", get(payments_handler))
        .route("/dashboard", get(dashboard_handler))
        .route("/cache/invalidate", post(invalidate_handler))
        .layer(cors)
        .with_state(state);

    println!("API listening on http://{}", bind);
    println!("\nEndpoints:");
    println!("  GET  /health");
    println!("  GET  /payments");
    println!("  GET  /dashboard");
    println!("  POST /cache/invalidate");

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
