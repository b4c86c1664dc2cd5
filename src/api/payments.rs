//! Payment endpoints: start a payment, receive the gateway callback.
//!
//! `POST /payments` runs purchase and pay and hands the redirection form back
//! to the caller. The invoice is parked in [`AppState::pending`] until the
//! gateway sends the payer to `/payments/{driver}/callback?invoice={uuid}`,
//! where a fresh [`Payment`] is rebuilt from it and verified. Invoices
//! nobody comes back for are swept after [`PENDING_TTL_SECS`].

use crate::middleware::error::{get_request_id_from_headers, json_error_response, ApiError};
use crate::payments::{
    CallbackRequest, DriverRegistry, EventBus, Invoice, Payment, PaymentError, Receipt,
    RedirectionForm,
};
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Form, Json, Router,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How long an unverified invoice waits for its callback.
pub const PENDING_TTL_SECS: i64 = 60 * 60;

#[derive(Debug, Clone)]
pub struct PendingInvoice {
    pub invoice: Invoice,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<DriverRegistry>,
    pub events: Arc<EventBus>,
    pub pending: Arc<RwLock<HashMap<Uuid, PendingInvoice>>>,
    pub pending_ttl: Duration,
    pub public_base_url: String,
}

impl AppState {
    pub fn new(
        registry: Arc<DriverRegistry>,
        events: Arc<EventBus>,
        public_base_url: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            events,
            pending: Arc::new(RwLock::new(HashMap::new())),
            pending_ttl: Duration::seconds(PENDING_TTL_SECS),
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Parks `invoice` for its callback, dropping the ones that expired.
    async fn park(&self, invoice_id: Uuid, invoice: Invoice) {
        let now = Utc::now();
        let mut pending = self.pending.write().await;
        let before = pending.len();
        pending.retain(|_, entry| now - entry.created_at < self.pending_ttl);
        let expired = before - pending.len();
        if expired > 0 {
            debug!(expired, "Expired pending invoices swept");
        }
        pending.insert(
            invoice_id,
            PendingInvoice {
                invoice,
                created_at: now,
            },
        );
    }

    fn callback_url(&self, driver: &str, invoice: Uuid) -> String {
        format!(
            "{}/payments/{}/callback?invoice={}",
            self.public_base_url, driver, invoice
        )
    }
}

#[derive(Debug, Deserialize)]
pub struct StartPaymentRequest {
    pub driver: Option<String>,
    pub amount: JsonValue,
    #[serde(default)]
    pub details: Map<String, JsonValue>,
}

#[derive(Debug, Serialize)]
pub struct StartPaymentResponse {
    pub invoice_id: Uuid,
    pub driver: String,
    pub transaction_id: String,
    pub form: RedirectionForm,
}

#[derive(Debug, Serialize)]
pub struct CallbackResponse {
    pub invoice_id: Uuid,
    pub receipt: Receipt,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/payments", post(start_payment))
        .route(
            "/payments/{driver}/callback",
            get(callback_get).post(callback_post),
        )
        .with_state(state)
}

pub async fn health() -> &'static str {
    "ok"
}

pub async fn start_payment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<StartPaymentRequest>,
) -> Result<Json<StartPaymentResponse>, ApiError> {
    let fail = |e: PaymentError| ApiError::new(e, &headers);

    let driver = request
        .driver
        .unwrap_or_else(|| state.registry.default_driver().to_string());

    let mut invoice = Invoice::new();
    invoice.set_amount(&request.amount).map_err(fail)?;
    invoice.set_details(request.details);
    let invoice_id = invoice.uuid();

    let mut payment = Payment::new(state.registry.clone(), state.events.clone());
    payment
        .via(&driver)
        .map_err(fail)?
        .callback_url(state.callback_url(&driver, invoice_id));

    let outcome = payment.purchase_with(invoice).await.map_err(fail)?;
    let form = payment.pay().await.map_err(fail)?;

    let stored = payment.invoice().cloned().unwrap_or(outcome.invoice);
    state.park(invoice_id, stored).await;
    info!(
        driver = %driver,
        invoice_id = %invoice_id,
        transaction_id = %outcome.transaction_id,
        "Payment started"
    );

    Ok(Json(StartPaymentResponse {
        invoice_id,
        driver: outcome.driver,
        transaction_id: outcome.transaction_id,
        form,
    }))
}

pub async fn callback_get(
    State(state): State<AppState>,
    Path(driver): Path<String>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    handle_callback(state, driver, headers, CallbackRequest::new(query, HashMap::new())).await
}

pub async fn callback_post(
    State(state): State<AppState>,
    Path(driver): Path<String>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    handle_callback(state, driver, headers, CallbackRequest::new(query, form)).await
}

async fn handle_callback(
    state: AppState,
    driver: String,
    headers: HeaderMap,
    callback: CallbackRequest,
) -> Response {
    let Some(invoice_id) = callback.get("invoice").and_then(|id| Uuid::parse_str(id).ok()) else {
        return json_error_response(
            StatusCode::BAD_REQUEST,
            "callback is missing a valid invoice id",
            get_request_id_from_headers(&headers),
        )
        .into_response();
    };

    match verify_pending(&state, &driver, invoice_id, &callback).await {
        Ok(receipt) => {
            state.pending.write().await.remove(&invoice_id);
            Json(CallbackResponse {
                invoice_id,
                receipt,
            })
            .into_response()
        }
        Err(e) => {
            warn!(
                driver = %driver,
                invoice_id = %invoice_id,
                error = %e,
                "Payment callback rejected"
            );
            ApiError::new(e, &headers).into_response()
        }
    }
}

async fn verify_pending(
    state: &AppState,
    driver: &str,
    invoice_id: Uuid,
    callback: &CallbackRequest,
) -> Result<Receipt, PaymentError> {
    let invoice = state
        .pending
        .read()
        .await
        .get(&invoice_id)
        .filter(|entry| Utc::now() - entry.created_at < state.pending_ttl)
        .map(|entry| entry.invoice.clone())
        .ok_or_else(|| PaymentError::InvoiceNotFound {
            reason: format!("no pending invoice {}", invoice_id),
        })?;
    if invoice.driver() != Some(driver) {
        return Err(PaymentError::InvoiceNotFound {
            reason: format!("invoice {} was not issued through {}", invoice_id, driver),
        });
    }

    let mut payment = Payment::new(state.registry.clone(), state.events.clone());
    payment
        .via(driver)?
        .callback_url(state.callback_url(driver, invoice_id))
        .with_invoice(invoice);
    payment.verify(callback).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::json;
    use tower::util::ServiceExt;

    fn app() -> (Router, AppState) {
        let state = AppState::new(
            Arc::new(DriverRegistry::default()),
            Arc::new(EventBus::new()),
            "http://shop.test/",
        );
        (router(state.clone()), state)
    }

    async fn body_json(response: Response) -> JsonValue {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn start(body: JsonValue) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/payments")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_returns_ok() {
        let (app, _) = app();
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn start_then_callback_returns_receipt() {
        let (app, state) = app();
        let response = app
            .clone()
            .oneshot(start(json!({"amount": 1000, "details": {"mobile": "09120000000"}})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let started = body_json(response).await;
        assert_eq!(started["driver"], "local");
        let invoice_id = started["invoice_id"].as_str().unwrap().to_string();
        let transaction_id = started["transaction_id"].as_str().unwrap().to_string();
        assert!(started["form"]["action"]
            .as_str()
            .unwrap()
            .starts_with("http://shop.test/payments/local/callback"));
        assert_eq!(state.pending.read().await.len(), 1);

        let uri = format!(
            "/payments/local/callback?invoice={}&transaction_id={}",
            invoice_id, transaction_id
        );
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let verified = body_json(response).await;
        assert_eq!(
            verified["receipt"]["reference_id"],
            format!("LOCAL-{}", transaction_id)
        );
        assert!(state.pending.read().await.is_empty());
    }

    #[tokio::test]
    async fn cancelled_callback_is_payment_required() {
        let (app, state) = app();
        let started = body_json(app.clone().oneshot(start(json!({"amount": "500"}))).await.unwrap()).await;
        let invoice_id = started["invoice_id"].as_str().unwrap().to_string();

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/payments/local/callback?invoice={}", invoice_id))
                    .header("content-type", "application/x-www-form-urlencoded")
                    .header("x-request-id", "req-cancel")
                    .body(Body::from("cancel=1"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);

        let error = body_json(response).await;
        assert_eq!(error["error"], "INVALID_PAYMENT");
        assert_eq!(error["code"], "cancelled");
        assert_eq!(error["request_id"], "req-cancel");
        // still pending, the payer may retry
        assert_eq!(state.pending.read().await.len(), 1);
    }

    #[tokio::test]
    async fn unknown_driver_and_bad_amount_are_rejected() {
        let (app, _) = app();
        let response = app
            .clone()
            .oneshot(start(json!({"driver": "paypal", "amount": 1000})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(start(json!({"amount": "ten thousand"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn expired_invoices_are_swept_and_rejected() {
        let (app, state) = app();
        let started = body_json(app.clone().oneshot(start(json!({"amount": 1000}))).await.unwrap()).await;
        let invoice_id: Uuid = started["invoice_id"].as_str().unwrap().parse().unwrap();
        let transaction_id = started["transaction_id"].as_str().unwrap().to_string();

        state.pending.write().await.get_mut(&invoice_id).unwrap().created_at =
            Utc::now() - Duration::seconds(PENDING_TTL_SECS + 1);

        let uri = format!(
            "/payments/local/callback?invoice={}&transaction_id={}",
            invoice_id, transaction_id
        );
        let response = app
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        app.oneshot(start(json!({"amount": 2000}))).await.unwrap();
        let pending = state.pending.read().await;
        assert_eq!(pending.len(), 1);
        assert!(!pending.contains_key(&invoice_id));
    }

    #[tokio::test]
    async fn callback_for_unknown_invoice_is_not_found() {
        let (app, _) = app();
        let uri = format!("/payments/local/callback?invoice={}", Uuid::new_v4());
        let response = app
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/payments/local/callback")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
