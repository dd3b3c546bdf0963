use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::get;
use axum::{Json, Router};
use http::header::{ACCEPT, ORIGIN};
use http::Method;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use common::prelude::{Courier, Delivery, Error, Resolution, Session};
use common::routing::Redirect as TokenRedirect;

use crate::config::GatewayConfig;

const STATUS_PREFIX: &str = "/_status";
const FORWARDED_FOR: &str = "x-forwarded-for";

#[derive(Debug, Clone)]
pub struct GatewayState {
    pub courier: Courier,
    pub config: Arc<GatewayConfig>,
}

/// Build the gateway router: health routes plus token paths as the fallback
pub fn router(state: GatewayState) -> Router {
    let cors_layer = CorsLayer::new()
        .allow_methods(vec![Method::GET])
        .allow_headers(vec![ACCEPT, ORIGIN])
        .allow_origin(Any)
        .allow_credentials(false);

    let status = Router::new().route("/livez", get(livez));

    Router::new()
        .nest(STATUS_PREFIX, status)
        .fallback(token_handler)
        .with_state(state)
        .layer(cors_layer)
        .layer(TraceLayer::new_for_http())
}

async fn livez() -> Response {
    let msg = serde_json::json!({"status": "ok"});
    (StatusCode::OK, Json(msg)).into_response()
}

async fn token_handler(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    uri: Uri,
) -> Response {
    let mut session = Session::anonymous();
    if let Some(address) = headers
        .get(FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
    {
        session = session.with_remote_address(address.trim());
    }

    match state.courier.resolver().resolve(&session, uri.path()).await {
        Ok(resolution) => resolution_response(&state.config, resolution),
        Err(e) => error_response(e),
    }
}

fn resolution_response(config: &GatewayConfig, resolution: Resolution) -> Response {
    match resolution {
        Resolution::Unmatched | Resolution::NotFound => {
            (StatusCode::NOT_FOUND, "Not Found").into_response()
        }
        Resolution::Redirect(TokenRedirect::Unlock(token)) => {
            Redirect::to(&format!("{}/{}", config.unlock_path, token)).into_response()
        }
        Resolution::Redirect(TokenRedirect::Deposit(token)) => {
            Redirect::to(&format!("{}/{}", config.deposit_path, token)).into_response()
        }
        Resolution::Unroutable(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
        }
        Resolution::Deliver(Delivery::File {
            name,
            mime_type,
            length,
            data,
        }) => attachment(&name, &mime_type, Some(length), data.into()),
        Resolution::Deliver(Delivery::Archive { name, data }) => {
            let length = data.len() as u64;
            attachment(&name, "application/zip", Some(length), data.into())
        }
    }
}

fn attachment(name: &str, mime_type: &str, length: Option<u64>, body: Body) -> Response {
    let disposition = format!("attachment; filename=\"{}\"", name.replace('"', "'"));
    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, mime_type)
        .header(header::CONTENT_DISPOSITION, disposition);
    if let Some(length) = length {
        response = response.header(header::CONTENT_LENGTH, length);
    }
    response.body(body).unwrap_or_else(|e| {
        tracing::error!("failed to build response for {}: {}", name, e);
        StatusCode::INTERNAL_SERVER_ERROR.into_response()
    })
}

fn error_response(err: Error) -> Response {
    let status = match &err {
        Error::NotFound | Error::Expired => StatusCode::NOT_FOUND,
        Error::UnlockFailure => StatusCode::FORBIDDEN,
        Error::OwnershipMismatch { .. } | Error::InvalidToken(_) => StatusCode::BAD_REQUEST,
        _ => {
            tracing::error!("token request failed: {}", err);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    let message = match status {
        StatusCode::FORBIDDEN => "unable to unlock",
        StatusCode::NOT_FOUND => "not found",
        StatusCode::BAD_REQUEST => "bad request",
        _ => "internal server error",
    };
    let msg = serde_json::json!({"status": "failure", "message": message});
    (status, Json(msg)).into_response()
}
