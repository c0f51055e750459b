mod handlers;

use std::net::SocketAddr;

use axum::{
    extract::Extension,
    routing::{get, patch, post},
    Router,
};

use crate::api::DynAPI;
use crate::error::Error;
use crate::server::handlers::{offers, rides};

pub fn router(api: DynAPI) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/rides", post(rides::create))
        .route("/rides/:id", get(rides::find))
        .route("/rides/:id/history", get(rides::history))
        .route("/rides/:id/accept", patch(rides::accept))
        .route("/rides/:id/cancel", patch(rides::cancel))
        .route("/rides/:id/status", patch(rides::advance_status))
        .route("/rides/:id/offers", post(offers::propose).get(offers::list))
        .route("/rides/:id/offers/summary", get(offers::summary))
        .route("/offers/:id/respond", patch(offers::respond))
        .layer(Extension(api))
}

pub async fn serve(api: DynAPI, addr: SocketAddr) -> Result<(), Error> {
    let app = router(api);

    tracing::info!("listening on {}", addr);

    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| Error::Server(err.to_string()))
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        futures::future::pending::<()>().await;
    }

    tracing::info!("shutting down");
}

async fn root() -> &'static str {
    "ride-dispatch"
}
