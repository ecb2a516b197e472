// libs/booking-cell/src/router.rs
use std::sync::Arc;

use axum::{middleware, routing::post, Router};

use shared_utils::extractor::auth_middleware;

use crate::handlers;
use crate::state::BookingState;

pub fn booking_routes(state: Arc<BookingState>) -> Router {
    // Booking and verification run on behalf of a signed-in patient.
    let protected_routes = Router::new()
        .route("/", post(handlers::create_booking))
        .route("/verify", post(handlers::verify_payment))
        .layer(middleware::from_fn_with_state(
            state.config.clone(),
            auth_middleware,
        ));

    // Webhooks carry no session; the signature check is the authentication.
    let webhook_routes = Router::new().route(
        "/webhooks/{provider}",
        post(handlers::gateway_webhook),
    );

    Router::new()
        .merge(protected_routes)
        .merge(webhook_routes)
        .with_state(state)
}
