//! HTTP ingress: the payment webhook and read-only views of wallets and bets.

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, warn};
use wagerbook_engine::{
    Engine, EngineError, EngineMetricsSnapshot, EnqueueError, LedgerStore, PaymentNotification,
    PaymentQueue,
};
use wagerbook_types::{Bet, BetId, BetTransition, EscrowHold, LedgerEntry, Wallet, WalletId};

pub struct ApiState<S: LedgerStore> {
    pub engine: Arc<Engine<S>>,
    pub queue: PaymentQueue,
    pub webhook_token: String,
}

pub fn router<S: LedgerStore>(state: Arc<ApiState<S>>) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/metrics", get(metrics_handler::<S>))
        .route(
            "/v1/payments/notifications",
            post(notification_handler::<S>),
        )
        .route("/v1/wallets/:id", get(wallet_handler::<S>))
        .route("/v1/wallets/:id/entries", get(entries_handler::<S>))
        .route("/v1/bets/:id", get(bet_handler::<S>))
        .with_state(state)
}

pub struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self(err)
    }
}

fn status_for(err: &EngineError) -> StatusCode {
    match err {
        EngineError::WalletNotFound(_) | EngineError::BetNotFound(_) => StatusCode::NOT_FOUND,
        EngineError::Busy { .. } | EngineError::Timeout => StatusCode::SERVICE_UNAVAILABLE,
        EngineError::IdempotencyConflict { .. } | EngineError::IdempotencyKeyReused { .. } => {
            StatusCode::CONFLICT
        }
        EngineError::InvalidAmount(_) | EngineError::Invalid(_) | EngineError::InvalidBet(_) => {
            StatusCode::BAD_REQUEST
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(err = %self.0, "request failed");
        }
        let body = serde_json::json!({ "error": self.0.to_string() });
        (status, Json(body)).into_response()
    }
}

fn authorize(headers: &HeaderMap, token: &str) -> Result<(), StatusCode> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    if bearer != Some(token) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(())
}

async fn health_handler() -> &'static str {
    "ok"
}

#[derive(Serialize)]
struct MetricsView {
    engine: EngineMetricsSnapshot,
    pending_reviews: usize,
    dropped_reviews: u64,
    payment_queue_free: usize,
}

async fn metrics_handler<S: LedgerStore>(
    State(state): State<Arc<ApiState<S>>>,
) -> Json<MetricsView> {
    let reviews = state.engine.reviews();
    Json(MetricsView {
        engine: state.engine.metrics(),
        pending_reviews: reviews.len(),
        dropped_reviews: reviews.dropped(),
        payment_queue_free: state.queue.capacity(),
    })
}

async fn notification_handler<S: LedgerStore>(
    State(state): State<Arc<ApiState<S>>>,
    headers: HeaderMap,
    Json(notification): Json<PaymentNotification>,
) -> Result<StatusCode, StatusCode> {
    authorize(&headers, &state.webhook_token).inspect_err(|_| {
        warn!("rejected unauthenticated payment notification");
    })?;
    let key = notification.idempotency_key.clone();
    match state.queue.try_enqueue(notification) {
        Ok(()) => {
            debug!(%key, "payment notification queued");
            Ok(StatusCode::ACCEPTED)
        }
        Err(EnqueueError::Full) | Err(EnqueueError::Closed) => {
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

async fn wallet_handler<S: LedgerStore>(
    State(state): State<Arc<ApiState<S>>>,
    Path(id): Path<u64>,
) -> Result<Json<Wallet>, ApiError> {
    Ok(Json(state.engine.wallet(WalletId(id))?))
}

async fn entries_handler<S: LedgerStore>(
    State(state): State<Arc<ApiState<S>>>,
    Path(id): Path<u64>,
) -> Result<Json<Vec<LedgerEntry>>, ApiError> {
    Ok(Json(state.engine.entries(WalletId(id))?))
}

#[derive(Serialize)]
struct BetView {
    #[serde(flatten)]
    bet: Bet,
    holds: Vec<EscrowHold>,
    transitions: Vec<BetTransition>,
}

async fn bet_handler<S: LedgerStore>(
    State(state): State<Arc<ApiState<S>>>,
    Path(id): Path<u64>,
) -> Result<Json<BetView>, ApiError> {
    let escrow = state.engine.escrow();
    let id = BetId(id);
    Ok(Json(BetView {
        bet: escrow.bet(id)?,
        holds: escrow.holds(id)?,
        transitions: escrow.transitions(id)?,
    }))
}
