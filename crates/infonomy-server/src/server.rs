//! Axum router construction and server startup.

use std::net::SocketAddr;

use axum::routing::{get, patch, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

use crate::api::{self, AppState};

/// Build the full axum router over the HTTP command table (§6).
pub fn build_router(app_state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/contexts", post(api::create_context))
        .route(
            "/contexts/{id}",
            get(api::get_context).patch(api::update_context).delete(api::delete_context),
        )
        .route("/contexts/{cid}/offers", get(api::list_offers).post(api::create_offer))
        .route(
            "/contexts/{cid}/offers/{oid}",
            get(api::get_offer).patch(api::update_offer).delete(api::delete_offer),
        )
        .route(
            "/sellers/me/subscriptions",
            post(api::create_subscription),
        )
        .route(
            "/sellers/me/subscriptions/{id}",
            patch(api::update_subscription).delete(api::delete_subscription),
        )
        .route("/subscriptions/{id}/inbox", get(api::get_inbox))
        .route("/contexts/{id}/inspections", post(api::start_inspection))
        .route("/jobs/{id}", get(api::get_job))
        .layer(cors)
        .with_state(app_state)
}

/// Start the axum server and return the bound address.
pub async fn start_server(router: Router, bind_addr: SocketAddr) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind(bind_addr).await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    addr
}
