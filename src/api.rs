use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};

use simplebank_core::{
    Account, Context, CreateAccountParams, ErrorKind, LedgerError, ListAccountsParams, Store,
    TransferTxParams, TransferTxResult,
};

pub const SUPPORTED_CURRENCIES: [&str; 2] = ["USD", "EUR"];

const MIN_PAGE_SIZE: i64 = 5;
const MAX_PAGE_SIZE: i64 = 10;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    /// Deadline applied to each request's work against the store.
    pub request_timeout: Duration,
    pub metrics: Option<PrometheusHandle>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/accounts", post(create_account).get(list_accounts))
        .route("/accounts/:id", get(get_account))
        .route("/transfers", post(create_transfer))
        .route("/health", get(health))
        .route("/metrics", get(render_metrics))
        .with_state(state)
}

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        let status = match err.kind() {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::Cancelled | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %err, indeterminate = err.is_indeterminate(), "Request failed");
        } else {
            tracing::debug!(error = %err, "Request rejected");
        }
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorBody {
                success: false,
                error: self.message,
            }),
        )
            .into_response()
    }
}

/// Cancels the request context when the handler future is dropped, e.g. on
/// client disconnect, so blocking store work stops at its next check.
struct CancelOnDrop(Context);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

async fn run_blocking<T, F>(ctx: Context, work: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&Context) -> Result<T, LedgerError> + Send + 'static,
{
    let _cancel = CancelOnDrop(ctx.clone());
    tokio::task::spawn_blocking(move || work(&ctx))
        .await
        .map_err(|e| ApiError::internal(format!("worker failed: {}", e)))?
        .map_err(ApiError::from)
}

fn check_currency(currency: &str) -> Result<(), ApiError> {
    if SUPPORTED_CURRENCIES.contains(&currency) {
        Ok(())
    } else {
        Err(ApiError::bad_request(format!(
            "unsupported currency {:?}, expected one of {}",
            currency,
            SUPPORTED_CURRENCIES.join(", ")
        )))
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateAccountRequest {
    pub owner: String,
    pub currency: String,
}

pub async fn create_account(
    State(state): State<AppState>,
    Json(req): Json<CreateAccountRequest>,
) -> Result<Json<Account>, ApiError> {
    if req.owner.trim().is_empty() {
        return Err(ApiError::bad_request("owner is required"));
    }
    check_currency(&req.currency)?;

    let ctx = Context::background()
        .with_timeout(state.request_timeout)
        .with_label("create account");
    let params = CreateAccountParams {
        owner: req.owner,
        balance: 0,
        currency: req.currency,
    };
    let store = state.store.clone();
    let account = run_blocking(ctx, move |ctx| store.create_account(ctx, &params)).await?;
    tracing::info!(account_id = account.id, owner = %account.owner, "Account created");
    Ok(Json(account))
}

pub async fn get_account(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Account>, ApiError> {
    if id < 1 {
        return Err(ApiError::bad_request(format!("invalid account id {}", id)));
    }
    let ctx = Context::background()
        .with_timeout(state.request_timeout)
        .with_label("get account");
    let store = state.store.clone();
    let account = run_blocking(ctx, move |ctx| store.get_account(ctx, id)).await?;
    Ok(Json(account))
}

#[derive(Debug, Deserialize)]
pub struct ListAccountsRequest {
    pub page_id: Option<i64>,
    pub page_size: Option<i64>,
}

pub async fn list_accounts(
    State(state): State<AppState>,
    Query(req): Query<ListAccountsRequest>,
) -> Result<Json<Vec<Account>>, ApiError> {
    let page_id = match req.page_id {
        Some(page_id) if page_id >= 1 => page_id,
        _ => return Err(ApiError::bad_request("page_id must be at least 1")),
    };
    let page_size = match req.page_size {
        Some(size) if (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&size) => size,
        _ => {
            return Err(ApiError::bad_request(format!(
                "page_size must be between {} and {}",
                MIN_PAGE_SIZE, MAX_PAGE_SIZE
            )))
        }
    };

    let params = ListAccountsParams {
        limit: page_size,
        offset: (page_id - 1).saturating_mul(page_size),
    };
    let ctx = Context::background()
        .with_timeout(state.request_timeout)
        .with_label("list accounts");
    let store = state.store.clone();
    let accounts = run_blocking(ctx, move |ctx| store.list_accounts(ctx, &params)).await?;
    Ok(Json(accounts))
}

#[derive(Debug, Deserialize)]
pub struct TransferRequest {
    pub from_account_id: i64,
    pub to_account_id: i64,
    pub amount: i64,
    pub currency: String,
}

pub async fn create_transfer(
    State(state): State<AppState>,
    Json(req): Json<TransferRequest>,
) -> Result<Json<TransferTxResult>, ApiError> {
    if req.from_account_id < 1 || req.to_account_id < 1 {
        return Err(ApiError::bad_request("account ids must be at least 1"));
    }
    check_currency(&req.currency)?;

    let params = TransferTxParams {
        from_account_id: req.from_account_id,
        to_account_id: req.to_account_id,
        amount: req.amount,
    };
    let ctx = Context::background()
        .with_timeout(state.request_timeout)
        .with_label(format!("transfer {} -> {}", params.from_account_id, params.to_account_id));
    let store = state.store.clone();
    let currency = req.currency;

    let started = Instant::now();
    let result = run_blocking(ctx, move |ctx| {
        params.validate()?;
        let mut source_balance = 0;
        for id in [params.from_account_id, params.to_account_id] {
            let account = store.get_account(ctx, id)?;
            if account.currency != currency {
                return Err(LedgerError::Validation(format!(
                    "account [{}] currency mismatch: {} vs {}",
                    id, account.currency, currency
                )));
            }
            if id == params.from_account_id {
                source_balance = account.balance;
            }
        }
        if source_balance < params.amount {
            return Err(LedgerError::Validation(format!(
                "insufficient funds in account [{}]: balance {}, amount {}",
                params.from_account_id, source_balance, params.amount
            )));
        }
        store.transfer_tx(ctx, &params)
    })
    .await;

    let outcome = match &result {
        Ok(_) => "committed",
        Err(e) if e.status().is_client_error() => "rejected",
        Err(_) => "failed",
    };
    metrics::increment_counter!("simplebank_transfers_total", "outcome" => outcome);
    metrics::histogram!(
        "simplebank_transfer_duration_seconds",
        started.elapsed().as_secs_f64()
    );

    let result = result?;
    tracing::info!(
        transfer_id = result.transfer.id,
        from_account_id = result.from_account.id,
        to_account_id = result.to_account.id,
        amount = result.transfer.amount,
        "Transfer committed"
    );
    Ok(Json(result))
}

pub async fn health() -> &'static str {
    "ok"
}

pub async fn render_metrics(State(state): State<AppState>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (StatusCode::NOT_FOUND, "metrics exporter not installed".to_string()),
    }
}
