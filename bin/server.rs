// Treasury Ledger - Web Server
// JSON API for the admin back-office

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use treasury_ledger::db::{self, SharedConnection};
use treasury_ledger::{
    format_amount, CoinGeckoClient, Config, Event, Investment, LedgerError, LedgerTransaction, LiquidityPool,
    LiquidityPoolEngine, PaymentReconciler, PaymentReconciliation, PoolViolation, PriceSource,
    SwapDetector, SwapRecord, SyncReport, Wallet, WalletSyncEngine,
};

/// Shared application state
#[derive(Clone)]
struct AppState {
    db: SharedConnection,
    sync: Arc<WalletSyncEngine>,
    prices: Arc<dyn PriceSource>,
    config: Arc<Config>,
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

/// Handler error: status code + message, rendered as ApiResponse
struct ApiError {
    status: StatusCode,
    message: String,
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        let status = match &err {
            e if e.is_not_found() => StatusCode::NOT_FOUND,
            LedgerError::SyncInProgress | LedgerError::DuplicateWallet { .. } => StatusCode::CONFLICT,
            LedgerError::InvalidAddress { .. } | LedgerError::InvalidInvestment { .. } => StatusCode::BAD_REQUEST,
            LedgerError::Provider { .. } | LedgerError::NoProvider { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %err, "request failed");
        }
        ApiError {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(self.message),
        };
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

/// Wallet response (current version plus display strings)
#[derive(Serialize)]
struct WalletResponse {
    #[serde(flatten)]
    wallet: Wallet,
    balance_display: String,
}

impl From<Wallet> for WalletResponse {
    fn from(wallet: Wallet) -> Self {
        Self {
            balance_display: format_amount(wallet.balance, &wallet.currency),
            wallet,
        }
    }
}

#[derive(Serialize)]
struct WalletDetailResponse {
    wallet: WalletResponse,
    history: Vec<Wallet>,
    transactions: Vec<LedgerTransaction>,
}

#[derive(Serialize)]
struct PoolsResponse {
    pools: Vec<LiquidityPool>,
    violations: Vec<PoolViolation>,
}

#[derive(Deserialize)]
struct CreateInvestmentRequest {
    investor_id: String,
    amount: Decimal,
    currency: String,
}

#[derive(Deserialize)]
struct LinkPaymentRequest {
    tx_id: String,
}

#[derive(Deserialize)]
struct EventsQuery {
    limit: Option<usize>,
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok("OK"))
}

/// GET /api/wallets - Current version of every wallet
async fn list_wallets(State(state): State<AppState>) -> ApiResult<Vec<WalletResponse>> {
    let conn = db::lock(&state.db);
    let wallets = db::get_current_wallets(&conn)?;
    Ok(Json(ApiResponse::ok(wallets.into_iter().map(Into::into).collect())))
}

/// GET /api/wallets/:id - Wallet with version history and ledger rows
async fn get_wallet(
    State(state): State<AppState>,
    Path(wallet_id): Path<String>,
) -> ApiResult<WalletDetailResponse> {
    let conn = db::lock(&state.db);
    let wallet = db::get_wallet(&conn, &wallet_id)?.ok_or(LedgerError::WalletNotFound {
        id: wallet_id.clone(),
    })?;
    let history = db::get_wallet_history(&conn, &wallet_id)?;
    let transactions = db::get_transactions_for_wallet(&conn, &wallet_id)?;

    Ok(Json(ApiResponse::ok(WalletDetailResponse {
        wallet: wallet.into(),
        history,
        transactions,
    })))
}

/// POST /api/wallets/sync-all - Sync every active wallet (409 if already running)
async fn sync_all(State(state): State<AppState>) -> ApiResult<SyncReport> {
    let report = state.sync.sync_all().await?;
    Ok(Json(ApiResponse::ok(report)))
}

/// GET /api/pools - Liquidity pools, checked against current wallets
async fn list_pools(State(state): State<AppState>) -> ApiResult<PoolsResponse> {
    let conn = db::lock(&state.db);
    let pools = db::get_liquidity_pools(&conn)?;
    let wallets = db::get_current_wallets(&conn)?;
    let violations = LiquidityPoolEngine::new().verify(&pools, &wallets);
    Ok(Json(ApiResponse::ok(PoolsResponse { pools, violations })))
}

/// GET /api/swaps - Recorded swaps
async fn list_swaps(State(state): State<AppState>) -> ApiResult<Vec<SwapRecord>> {
    let conn = db::lock(&state.db);
    Ok(Json(ApiResponse::ok(db::get_swaps(&conn)?)))
}

/// POST /api/swaps/scan - Detect, value and record new swaps
async fn scan_swaps(State(state): State<AppState>) -> ApiResult<Vec<SwapRecord>> {
    let detector = SwapDetector::with_window(chrono::Duration::minutes(state.config.swap_window_minutes));
    let added = detector.scan(&state.db, state.prices.as_ref()).await?;
    Ok(Json(ApiResponse::ok(added)))
}

/// POST /api/investments/:id/reconcile - Recompute one investment's payment status
async fn reconcile_investment(
    State(state): State<AppState>,
    Path(investment_id): Path<String>,
) -> ApiResult<PaymentReconciliation> {
    let conn = db::lock(&state.db);
    let investment = db::get_investment(&conn, &investment_id)?.ok_or(LedgerError::InvestmentNotFound {
        id: investment_id.clone(),
    })?;
    let result = PaymentReconciler::with_tolerance(state.config.payment_tolerance).reconcile_one(&conn, &investment)?;
    Ok(Json(ApiResponse::ok(result)))
}

/// POST /api/investments - Record an investor commitment
async fn create_investment(
    State(state): State<AppState>,
    Json(request): Json<CreateInvestmentRequest>,
) -> ApiResult<Investment> {
    let conn = db::lock(&state.db);
    let investment = db::create_investment(&conn, &request.investor_id, request.amount, &request.currency, "api")?;
    Ok(Json(ApiResponse::ok(investment)))
}

/// POST /api/investments/:id/payments - Link a ledger row, then reconcile the investment
async fn link_payment(
    State(state): State<AppState>,
    Path(investment_id): Path<String>,
    Json(request): Json<LinkPaymentRequest>,
) -> ApiResult<PaymentReconciliation> {
    let conn = db::lock(&state.db);
    db::link_transaction_to_investment(&conn, &request.tx_id, &investment_id, "api")?;
    let investment = db::get_investment(&conn, &investment_id)?.ok_or(LedgerError::InvestmentNotFound {
        id: investment_id.clone(),
    })?;
    let result = PaymentReconciler::with_tolerance(state.config.payment_tolerance).reconcile_one(&conn, &investment)?;
    Ok(Json(ApiResponse::ok(result)))
}

/// GET /api/events?limit=N - Recent audit events
async fn recent_events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<Vec<Event>> {
    let conn = db::lock(&state.db);
    let limit = query.limit.unwrap_or(50).min(500);
    Ok(Json(ApiResponse::ok(db::get_recent_events(&conn, limit)?)))
}

fn app(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/wallets", get(list_wallets))
        .route("/wallets/sync-all", post(sync_all))
        .route("/wallets/:id", get(get_wallet))
        .route("/pools", get(list_pools))
        .route("/swaps", get(list_swaps))
        .route("/swaps/scan", post(scan_swaps))
        .route("/investments", post(create_investment))
        .route("/investments/:id/payments", post(link_payment))
        .route("/investments/:id/reconcile", post(reconcile_investment))
        .route("/events", get(recent_events))
        .with_state(state);

    Router::new()
        .nest("/api", api_routes)
        .layer(CorsLayer::permissive())
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();

    let config = Arc::new(Config::from_env()?);
    let conn = db::open_database(&config.db_path)?;
    info!(path = ?config.db_path, "database opened");

    let shared = db::shared(conn);
    let prices: Arc<dyn PriceSource> = Arc::new(CoinGeckoClient::new(
        treasury_ledger::chain::build_http_client(config.http_timeout_secs)?,
        &config.coingecko_base_url,
    ));
    let state = AppState {
        sync: Arc::new(WalletSyncEngine::from_config(shared.clone(), &config)?),
        db: shared,
        prices,
        config: config.clone(),
    };

    let listener = tokio::net::TcpListener::bind(&config.server_addr).await?;
    info!(addr = %config.server_addr, "treasury server listening");

    axum::serve(listener, app(state)).await?;
    Ok(())
}
