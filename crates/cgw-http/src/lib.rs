//! HTTP trigger surface (axum).
//!
//! `POST /send-message` lets the patient-record application push a notification
//! to a patient's linked chat. `GET /health` and `GET /tenants` are for operators.

use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use cgw_core::{
    domain::{OutboundRequest, PatientId, TenantId},
    errors::DispatchError,
    gateway::Gateway,
    registry::ConnectionState,
};

pub const SEND_MESSAGE_ENDPOINT: &str = "/send-message";
pub const HEALTH_ENDPOINT: &str = "/health";
pub const TENANTS_ENDPOINT: &str = "/tenants";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageBody {
    tenant_id: Option<String>,
    patient_id: Option<String>,
    message: Option<String>,
}

impl SendMessageBody {
    fn into_request(self) -> Option<OutboundRequest> {
        let present = |v: Option<String>| v.filter(|s| !s.trim().is_empty());
        Some(OutboundRequest {
            tenant_id: TenantId(present(self.tenant_id)?),
            patient_id: PatientId(present(self.patient_id)?),
            body: present(self.message)?,
        })
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TenantView {
    tenant_id: TenantId,
    state: ConnectionState,
    last_error: Option<String>,
    changed_at: DateTime<Utc>,
}

pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route(SEND_MESSAGE_ENDPOINT, post(handle_send_message))
        .route(HEALTH_ENDPOINT, get(handle_health))
        .route(TENANTS_ENDPOINT, get(handle_tenants))
        .layer(TraceLayer::new_for_http())
        .with_state(gateway)
}

/// Serve until `shutdown` is cancelled, then finish in-flight requests.
pub async fn serve(
    addr: SocketAddr,
    gateway: Arc<Gateway>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "http server listening");
    axum::serve(listener, router(gateway))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
}

fn status_for(e: &DispatchError) -> StatusCode {
    match e {
        DispatchError::NotLinked { .. } => StatusCode::NOT_FOUND,
        DispatchError::OwnershipMismatch { .. } => StatusCode::FORBIDDEN,
        DispatchError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        DispatchError::NoActiveConnection(_)
        | DispatchError::Transport(_)
        | DispatchError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Client-facing text for a failed send. Store failures stay in the logs.
fn client_message(e: &DispatchError) -> String {
    match e {
        DispatchError::Store(_) => "patient records are temporarily unavailable".to_string(),
        other => other.to_string(),
    }
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

async fn handle_send_message(
    State(gateway): State<Arc<Gateway>>,
    payload: Result<Json<SendMessageBody>, JsonRejection>,
) -> Response {
    let body = match payload {
        Ok(Json(body)) => body,
        Err(rejection) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                format!("invalid request body: {}", rejection.body_text()),
            )
        }
    };
    let Some(request) = body.into_request() else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "tenantId, patientId and message are required",
        );
    };

    match gateway.send(&request).await {
        Ok(_) => (StatusCode::OK, Json(json!({ "success": true }))).into_response(),
        Err(e) => {
            let status = status_for(&e);
            if status.is_server_error() {
                warn!(tenant = %request.tenant_id, patient = %request.patient_id, "send failed: {e}");
            }
            error_response(status, client_message(&e))
        }
    }
}

async fn handle_health() -> Response {
    (StatusCode::OK, Json(json!({ "status": "ok" }))).into_response()
}

async fn handle_tenants(State(gateway): State<Arc<Gateway>>) -> Response {
    let tenants: Vec<TenantView> = gateway
        .tenant_statuses()
        .into_iter()
        .map(|t| TenantView {
            tenant_id: t.id,
            state: t.status.state,
            last_error: t.status.last_error,
            changed_at: t.status.changed_at,
        })
        .collect();
    (StatusCode::OK, Json(json!({ "tenants": tenants }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use cgw_core::errors::{StoreError, TransportError};

    #[test]
    fn dispatch_errors_map_to_http_status() {
        let t = TenantId::from("c1");
        let p = PatientId::from("P1");
        assert_eq!(
            status_for(&DispatchError::NotLinked {
                tenant: t.clone(),
                patient: p.clone()
            }),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&DispatchError::OwnershipMismatch {
                tenant: t.clone(),
                patient: p
            }),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            status_for(&DispatchError::NoActiveConnection(t)),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status_for(&DispatchError::Transport(TransportError("reset".into()))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status_for(&DispatchError::Store(StoreError::Backend("down".into()))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(status_for(&DispatchError::Timeout), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn store_failures_do_not_leak_backend_detail() {
        let e = DispatchError::Store(StoreError::Backend(
            "store request failed: 500 relation \"patients\" does not exist".into(),
        ));
        let msg = client_message(&e);
        assert!(!msg.contains("relation"));
        assert!(!msg.contains("patients\""));

        let e = DispatchError::NotLinked {
            tenant: "c1".into(),
            patient: "P1".into(),
        };
        assert_eq!(client_message(&e), e.to_string());
    }

    #[test]
    fn blank_fields_count_as_missing() {
        let body = SendMessageBody {
            tenant_id: Some("c1".into()),
            patient_id: Some("  ".into()),
            message: Some("hi".into()),
        };
        assert!(body.into_request().is_none());

        let body = SendMessageBody {
            tenant_id: Some("c1".into()),
            patient_id: Some("P1".into()),
            message: None,
        };
        assert!(body.into_request().is_none());

        let body = SendMessageBody {
            tenant_id: Some("c1".into()),
            patient_id: Some("P1".into()),
            message: Some("hi".into()),
        };
        let req = body.into_request().unwrap();
        assert_eq!(req.tenant_id, TenantId::from("c1"));
        assert_eq!(req.body, "hi");
    }
}
