//! HTTP ingress
//!
//! - `POST /email/send`: queue a [`DeliveryRequest`] through the rate limiter
//! - `POST /credentials`: validate and store provider credentials
//! - `GET /credentials/{user}/{tenant}/providers`: providers with credentials
//! - `GET /credentials/{user}/{tenant}/{provider}`: whether credentials exist
//! - `DELETE /credentials/{user}/{tenant}/{provider}`: remove credentials

use std::{sync::Arc, time::Duration};

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use courier_common::{DeliveryRequest, ProviderKind, Signal};
use courier_delivery::{CredentialError, Credentials, DeliveryError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::timeout::TimeoutLayer;

use crate::{Admission, Pipeline, config::HttpConfig};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind HTTP ingress to {address}: {source}")]
    Bind {
        address: String,
        source: std::io::Error,
    },

    #[error("HTTP ingress error: {0}")]
    Serve(String),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Reply {
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    has_credentials: Option<bool>,
}

impl Reply {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            id: None,
            has_credentials: None,
        }
    }

    fn with_status(self, status: StatusCode) -> Response {
        (status, Json(self)).into_response()
    }
}

#[derive(Debug, Serialize)]
struct Providers {
    providers: Vec<ProviderKind>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoreCredentials {
    user_id: String,
    tenant_id: String,
    provider: ProviderKind,
    credentials: Credentials,
}

/// Serves ingress for one [`Pipeline`].
pub struct IngressServer {
    listener: TcpListener,
    router: Router,
}

impl IngressServer {
    /// Bind the configured address.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound.
    pub async fn new(config: &HttpConfig, pipeline: Arc<Pipeline>) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(&config.listen_address)
            .await
            .map_err(|source| ServerError::Bind {
                address: config.listen_address.clone(),
                source,
            })?;

        tracing::info!(address = %config.listen_address, "HTTP ingress bound");

        let router = router(pipeline)
            .layer(TimeoutLayer::new(Duration::from_secs(config.request_timeout_secs)));

        Ok(Self { listener, router })
    }

    /// The address actually bound, useful when binding port 0.
    ///
    /// # Errors
    ///
    /// Fails if the socket has no local address.
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until `shutdown` fires, letting in-flight requests finish.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Serve`] if the server fails while running.
    pub async fn serve(
        self,
        mut shutdown: tokio::sync::broadcast::Receiver<Signal>,
    ) -> Result<(), ServerError> {
        tracing::info!("HTTP ingress starting");

        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                tracing::info!("HTTP ingress received shutdown signal");
            })
            .await
            .map_err(|e| ServerError::Serve(e.to_string()))?;

        tracing::info!("HTTP ingress stopped");
        Ok(())
    }
}

/// Routes for every ingress endpoint, without transport layers.
pub fn router(pipeline: Arc<Pipeline>) -> Router {
    Router::new()
        .route("/email/send", post(send_email))
        .route("/credentials", post(store_credentials))
        .route("/credentials/{user}/{tenant}/providers", get(list_providers))
        .route(
            "/credentials/{user}/{tenant}/{provider}",
            get(get_credentials).delete(delete_credentials),
        )
        .with_state(pipeline)
}

fn delivery_failure(error: &DeliveryError) -> Response {
    let status = if error.is_permanent() {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    Reply::new(error.to_string()).with_status(status)
}

fn store_failure(error: &CredentialError) -> Response {
    tracing::error!(error = %error, "Credential store request failed");
    Reply::new(error.to_string()).with_status(StatusCode::SERVICE_UNAVAILABLE)
}

fn parse_provider(provider: &str) -> Result<ProviderKind, Response> {
    provider
        .parse()
        .map_err(|e: courier_common::UnknownProvider| {
            Reply::new(e.to_string()).with_status(StatusCode::BAD_REQUEST)
        })
}

async fn send_email(
    State(pipeline): State<Arc<Pipeline>>,
    Json(request): Json<DeliveryRequest>,
) -> Response {
    match pipeline.enqueue(request).await {
        Ok(Admission::Queued(event)) => Reply {
            id: Some(event.id),
            ..Reply::new("Email queued for sending")
        }
        .with_status(StatusCode::ACCEPTED),
        Ok(Admission::RateLimited) => Reply::new("Too many requests, please try again later.")
            .with_status(StatusCode::TOO_MANY_REQUESTS),
        Err(e) => delivery_failure(&e),
    }
}

async fn store_credentials(
    State(pipeline): State<Arc<Pipeline>>,
    Json(body): Json<StoreCredentials>,
) -> Response {
    match pipeline
        .processor()
        .register_credentials(&body.user_id, &body.tenant_id, body.provider, body.credentials)
        .await
    {
        Ok(true) => {
            Reply::new("Credentials stored successfully").with_status(StatusCode::CREATED)
        }
        Ok(false) => Reply::new(format!("Credentials rejected by {}", body.provider))
            .with_status(StatusCode::BAD_REQUEST),
        Err(e) => delivery_failure(&e),
    }
}

async fn get_credentials(
    State(pipeline): State<Arc<Pipeline>>,
    Path((user, tenant, provider)): Path<(String, String, String)>,
) -> Response {
    let provider = match parse_provider(&provider) {
        Ok(provider) => provider,
        Err(response) => return response,
    };

    match pipeline.credentials().get(&user, &tenant, provider).await {
        Ok(Some(_)) => Reply {
            has_credentials: Some(true),
            ..Reply::new("Credentials found")
        }
        .with_status(StatusCode::OK),
        Ok(None) => Reply {
            has_credentials: Some(false),
            ..Reply::new("No credentials found")
        }
        .with_status(StatusCode::NOT_FOUND),
        Err(e) => store_failure(&e),
    }
}

async fn delete_credentials(
    State(pipeline): State<Arc<Pipeline>>,
    Path((user, tenant, provider)): Path<(String, String, String)>,
) -> Response {
    let provider = match parse_provider(&provider) {
        Ok(provider) => provider,
        Err(response) => return response,
    };

    match pipeline.credentials().delete(&user, &tenant, provider).await {
        Ok(true) => Reply::new("Credentials deleted successfully").with_status(StatusCode::OK),
        Ok(false) => {
            Reply::new("No credentials found to delete").with_status(StatusCode::NOT_FOUND)
        }
        Err(e) => store_failure(&e),
    }
}

async fn list_providers(
    State(pipeline): State<Arc<Pipeline>>,
    Path((user, tenant)): Path<(String, String)>,
) -> Response {
    match pipeline.credentials().list_providers(&user, &tenant).await {
        Ok(providers) => (StatusCode::OK, Json(Providers { providers })).into_response(),
        Err(e) => store_failure(&e),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_reply_omits_unset_fields() {
        let queued = Reply {
            id: Some("evt-1".to_string()),
            ..Reply::new("Email queued for sending")
        };
        assert_eq!(
            serde_json::to_value(&queued).unwrap(),
            serde_json::json!({ "message": "Email queued for sending", "id": "evt-1" })
        );

        let found = Reply {
            has_credentials: Some(true),
            ..Reply::new("Credentials found")
        };
        assert_eq!(
            serde_json::to_value(&found).unwrap(),
            serde_json::json!({ "message": "Credentials found", "hasCredentials": true })
        );
    }

    #[test]
    fn test_failure_status() {
        let rejected = DeliveryError::Rejected(courier_delivery::RejectReason::UnsafeSubject);
        assert_eq!(delivery_failure(&rejected).status(), StatusCode::BAD_REQUEST);

        let down = DeliveryError::TransientInfra("broker closed".to_string());
        assert_eq!(delivery_failure(&down).status(), StatusCode::SERVICE_UNAVAILABLE);

        assert_eq!(
            parse_provider("Outlook").unwrap(),
            ProviderKind::Outlook
        );
        assert_eq!(
            parse_provider("smtp").unwrap_err().status(),
            StatusCode::BAD_REQUEST
        );
    }
}
