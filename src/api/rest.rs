// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// Market-data endpoints (health, symbols, timeframes, candles, contest state,
// leaderboard) are public. Portfolio, trade history, shorts, and order entry
// require a user token; contest lifecycle control requires the admin role.
//
// CORS is configured permissively for development; tighten `allowed_origins`
// in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::api::auth::{AuthAdmin, AuthUser};
use crate::app_state::AppState;
use crate::market_data::{timeframes, CandleKey};
use crate::types::{ContestStatus, EngineError, OrderType};

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/health", get(health))
        .route("/symbols", get(symbols))
        .route("/timeframes", get(timeframes_info))
        .route("/candlestick/:symbol", get(candlestick))
        .route("/contest/state", get(contest_state))
        .route("/leaderboard", get(leaderboard))
        // ── Authenticated (user) ────────────────────────────────────
        .route("/portfolio", get(portfolio))
        .route("/trades", get(trades))
        .route("/shorts", get(shorts))
        .route("/trade", post(trade))
        // ── Authenticated (admin) ───────────────────────────────────
        .route("/admin/contest/start", post(admin_start))
        .route("/admin/contest/stop", post(admin_stop))
        .route("/admin/contest/pause", post(admin_pause))
        .route("/admin/contest/resume", post(admin_resume))
        .route("/admin/contest/reset-data", post(admin_reset_data))
        // ── WebSocket ───────────────────────────────────────────────
        .route("/ws", get(crate::api::ws::ws_handler))
        // ── Middleware & State ──────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Public endpoints
// =============================================================================

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "contest_state": state.controller.status(),
        "symbols": state
            .controller
            .active_contest()
            .map(|c| c.symbols.len())
            .unwrap_or(0),
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
        "server_time": chrono::Utc::now().timestamp_millis(),
    }))
}

async fn symbols(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let symbols = match state.controller.active_contest() {
        Some(c) => c.symbols,
        None => state.config.symbols.clone(),
    };
    Json(symbols)
}

async fn timeframes_info(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut details = serde_json::Map::new();
    for tf in timeframes::ALL {
        details.insert(
            tf.key.to_string(),
            serde_json::json!({
                "real_seconds": tf.real_seconds,
                "label": tf.label,
            }),
        );
    }
    Json(serde_json::json!({
        "available": timeframes::ALL.iter().map(|tf| tf.key).collect::<Vec<_>>(),
        "default": state.config.default_timeframe,
        "details": details,
    }))
}

#[derive(Deserialize)]
struct CandlestickQuery {
    timeframe: Option<String>,
}

async fn candlestick(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    Query(query): Query<CandlestickQuery>,
) -> Result<impl IntoResponse, EngineError> {
    let tf_key = query
        .timeframe
        .unwrap_or_else(|| state.config.default_timeframe.clone());
    let tf = timeframes::get(&tf_key)
        .ok_or_else(|| EngineError::NotFound(format!("timeframe '{tf_key}'")))?;

    let data = state.candle_cache.series(
        &CandleKey::new(&symbol, tf.key),
        state.config.max_candles_per_key,
    );
    Ok(Json(serde_json::json!({
        "symbol": symbol,
        "timeframe": tf.key,
        "data": data,
    })))
}

async fn contest_state(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.controller.state_snapshot())
}

async fn leaderboard(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.controller.leaderboard_snapshot())
}

// =============================================================================
// Authenticated user endpoints
// =============================================================================

async fn portfolio(
    AuthUser(user): AuthUser,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, EngineError> {
    let mut portfolio = state
        .portfolios
        .get_or_create(&user.email, &user.name)
        .map_err(|e| EngineError::Storage(e.to_string()))?;
    let lots = state.shorts.active_for_user(&user.email);
    portfolio.revalue(&state.price_index, &lots);
    Ok(Json(portfolio))
}

#[derive(Deserialize)]
struct TradesQuery {
    page: Option<i64>,
    limit: Option<i64>,
}

async fn trades(
    AuthUser(user): AuthUser,
    State(state): State<Arc<AppState>>,
    Query(query): Query<TradesQuery>,
) -> Result<impl IntoResponse, EngineError> {
    let limit = query.limit.unwrap_or(50).clamp(1, 200);
    let page = query.page.unwrap_or(1).max(1);
    let offset = (page - 1) * limit;

    let trades = state
        .store
        .trades_for_user(&user.email, limit, offset)
        .map_err(|e| EngineError::Storage(e.to_string()))?;
    Ok(Json(serde_json::json!({
        "trades": trades,
        "page": page,
        "limit": limit,
    })))
}

#[derive(Deserialize)]
struct ShortsQuery {
    active: Option<bool>,
}

async fn shorts(
    AuthUser(user): AuthUser,
    State(state): State<Arc<AppState>>,
    Query(query): Query<ShortsQuery>,
) -> impl IntoResponse {
    let active_only = query.active.unwrap_or(true);
    let shorts = state.shorts.for_user(&user.email, active_only);
    Json(serde_json::json!({ "shorts": shorts }))
}

// =============================================================================
// Order entry
// =============================================================================

#[derive(Deserialize)]
struct TradeRequest {
    symbol: String,
    order_type: String,
    /// Accepted as raw JSON so that anything that is not an integer — a
    /// string, a float, an object — is rejected as INVALID_QTY before it can
    /// reach the strictly-typed trades column.
    quantity: serde_json::Value,
    #[serde(default)]
    company_name: Option<String>,
}

async fn trade(
    AuthUser(user): AuthUser,
    State(state): State<Arc<AppState>>,
    Json(req): Json<TradeRequest>,
) -> axum::response::Response {
    let order_type = match OrderType::parse(&req.order_type) {
        Some(t) => t,
        None => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "error": format!(
                        "invalid order_type '{}'; use buy, sell, short_sell, or buy_to_cover",
                        req.order_type
                    ),
                })),
            )
                .into_response();
        }
    };
    let quantity = match req.quantity.as_i64() {
        Some(q) => q,
        None => return EngineError::InvalidQty.into_response(),
    };
    let company_name = req.company_name.unwrap_or_else(|| req.symbol.clone());

    match state
        .executor
        .execute(
            &user.email,
            &user.name,
            &req.symbol,
            order_type,
            quantity,
            &company_name,
        )
        .await
    {
        Ok(outcome) => {
            // Keep the ranking fresh after each fill without blocking the
            // response.
            let controller = state.controller.clone();
            tokio::spawn(async move {
                controller.refresh_leaderboard();
            });

            Json(serde_json::json!({
                "trade": outcome.trade,
                "portfolio": outcome.portfolio,
            }))
            .into_response()
        }
        Err(e) => e.into_response(),
    }
}

// =============================================================================
// Admin endpoints
// =============================================================================

async fn admin_start(
    AuthAdmin(admin): AuthAdmin,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, EngineError> {
    let contest_id = state.controller.start()?;
    info!(admin = %admin.email, contest_id = %contest_id, "contest started via API");
    Ok(Json(serde_json::json!({
        "success": true,
        "message": "contest started",
        "contest_id": contest_id,
    })))
}

async fn admin_stop(
    AuthAdmin(admin): AuthAdmin,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, EngineError> {
    let summary = state.controller.stop().await?;
    info!(admin = %admin.email, "contest stopped via API");
    Ok(Json(serde_json::json!({
        "success": true,
        "cleanup": summary,
    })))
}

async fn admin_pause(
    AuthAdmin(admin): AuthAdmin,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, EngineError> {
    state.controller.pause()?;
    info!(admin = %admin.email, "contest paused via API");
    Ok(Json(serde_json::json!({ "success": true })))
}

async fn admin_resume(
    AuthAdmin(admin): AuthAdmin,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, EngineError> {
    state.controller.resume()?;
    info!(admin = %admin.email, "contest resumed via API");
    Ok(Json(serde_json::json!({ "success": true })))
}

/// Wipe transient data outside a contest: same reset as cleanup step 4, for
/// recovering a dirty database between contests.
async fn admin_reset_data(
    AuthAdmin(admin): AuthAdmin,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, EngineError> {
    match state.controller.status() {
        ContestStatus::Running | ContestStatus::Paused => {
            return Err(EngineError::ContestConflict(
                "cannot reset data while a contest is active".into(),
            ))
        }
        _ => {}
    }

    let counts = state
        .store
        .wipe_transient(state.config.seed_cash)
        .map_err(|e| EngineError::Storage(e.to_string()))?;
    state.shorts.clear();
    state.portfolios.clear_cache();
    state.candle_cache.clear();
    state.price_index.clear();

    info!(
        admin = %admin.email,
        trades_deleted = counts.trades_deleted,
        shorts_deleted = counts.shorts_deleted,
        portfolios_reset = counts.portfolios_reset,
        "transient data reset via API"
    );
    Ok(Json(serde_json::json!({
        "success": true,
        "details": {
            "trades_deleted": counts.trades_deleted,
            "shorts_deleted": counts.shorts_deleted,
            "portfolios_reset": counts.portfolios_reset,
        },
    })))
}

// =============================================================================
// Tests
// =============================================================================
