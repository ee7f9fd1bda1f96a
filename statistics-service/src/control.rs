//! HTTP control surface: the forced full refresh action.

use std::{net::SocketAddr, sync::Arc};

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    routing::post,
    Json, Router,
};
use time::OffsetDateTime;

use crate::{error::CycleError, reconcile::ReconciliationCoordinator};

#[derive(Debug, Default, serde::Deserialize)]
pub struct ForceRefreshRequest {
    /// Scope to one entry; absent means every known account.
    pub entry_id: Option<String>,
}

#[derive(Debug, PartialEq, serde::Serialize)]
pub struct ForceRefreshResponse {
    pub accounts: Vec<String>,
}

#[derive(Debug, PartialEq, serde::Serialize)]
pub struct ErrorBody {
    pub error: String,
}

pub fn router(coordinator: Arc<ReconciliationCoordinator>) -> Router {
    Router::new()
        .route("/force_full_refresh", post(force_full_refresh))
        .with_state(coordinator)
}

/// Bind the control listener and serve it in the background.
pub async fn serve(bind_addr: &str, coordinator: Arc<ReconciliationCoordinator>) -> anyhow::Result<()> {
    let addr: SocketAddr = bind_addr
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid control bind addr {bind_addr}: {e}"))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let shutdown = coordinator.shutdown_token();
    let app = router(coordinator);

    tokio::spawn(async move {
        let served = axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(async move { shutdown.cancelled().await });
        if let Err(e) = served.await {
            tracing::error!(error = %e, "control server error");
        }
    });

    tracing::info!(%addr, "control surface listening");
    Ok(())
}

type Rejection = (StatusCode, Json<ErrorBody>);

fn rejected(status: StatusCode, error: impl Into<String>) -> Rejection {
    (status, Json(ErrorBody { error: error.into() }))
}

/// An empty body targets every account. A non-empty body must be JSON and
/// must parse; it is never silently widened to every account.
fn parse_request(headers: &HeaderMap, body: &[u8]) -> Result<ForceRefreshRequest, Rejection> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(ForceRefreshRequest::default());
    }

    let is_json = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.trim_start().to_ascii_lowercase().starts_with("application/json"))
        .unwrap_or(false);
    if !is_json {
        return Err(rejected(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "expected Content-Type: application/json",
        ));
    }

    serde_json::from_slice(body).map_err(|e| rejected(StatusCode::BAD_REQUEST, format!("invalid request body: {e}")))
}

async fn force_full_refresh(
    State(coordinator): State<Arc<ReconciliationCoordinator>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<ForceRefreshResponse>), Rejection> {
    metrics::counter!("force_refresh_requests_total").increment(1);
    let entry_id = match parse_request(&headers, &body) {
        Ok(request) => request.entry_id,
        Err(rejection) => {
            tracing::warn!(error = %rejection.1.error, "force refresh request rejected");
            return Err(rejection);
        }
    };

    let accounts: Vec<String> = match coordinator.accounts_for(entry_id.as_deref()) {
        Ok(accounts) => accounts.iter().map(|rt| rt.account_id.clone()).collect(),
        Err(e @ CycleError::UnknownEntry(_)) => return Err(rejected(StatusCode::NOT_FOUND, e.to_string())),
        Err(e) => return Err(rejected(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    };

    tokio::spawn(async move {
        match coordinator
            .force_full_refresh(entry_id.as_deref(), OffsetDateTime::now_utc())
            .await
        {
            Ok(results) => {
                for (account_id, res) in results {
                    if let Err(e) = res {
                        tracing::warn!(error = %e, account_id = %account_id, "forced refresh failed");
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "forced refresh rejected"),
        }
    });

    Ok((StatusCode::ACCEPTED, Json(ForceRefreshResponse { accounts })))
}
