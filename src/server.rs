//! `GET /health` over axum.

use axum::extract::State;
use axum::{Json, Router, http::StatusCode, response::IntoResponse, routing::get};
use kameo::prelude::ActorRef;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::core::HealthStatus;
use crate::transport::WsTransport;
use crate::ws::{GetHealthSnapshot, IngestActor};

#[derive(Serialize)]
struct Unavailable {
    status: HealthStatus,
    error: String,
}

/// Health HTTP server.
pub struct HealthServer;

impl HealthServer {
    pub fn router<T: WsTransport>(actor: ActorRef<IngestActor<T>>) -> Router {
        Router::new()
            .route("/health", get(health_handler::<T>))
            .with_state(actor)
    }

    /// Serve on an already bound listener until the task is aborted.
    pub fn start<T: WsTransport>(
        listener: TcpListener,
        actor: ActorRef<IngestActor<T>>,
    ) -> JoinHandle<()> {
        let app = Self::router(actor);
        tokio::spawn(async move {
            match listener.local_addr() {
                Ok(addr) => info!(addr = %addr, "health server listening"),
                Err(e) => error!(error = %e, "health listener has no local address"),
            }
            if let Err(e) = axum::serve(listener, app).await {
                error!(error = %e, "health server error");
            }
        })
    }
}

/// 200 for healthy and degraded, 503 for unhealthy or when the actor cannot answer.
async fn health_handler<T: WsTransport>(
    State(actor): State<ActorRef<IngestActor<T>>>,
) -> axum::response::Response {
    match actor.ask(GetHealthSnapshot).await {
        Ok(snapshot) => {
            let code = match snapshot.status {
                HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
                HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
            };
            (code, Json(snapshot)).into_response()
        }
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(Unavailable {
                status: HealthStatus::Unhealthy,
                error: e.to_string(),
            }),
        )
            .into_response(),
    }
}
