// routes.rs
use axum::routing::{get, post, put};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::{self, AppState};

pub fn create_routes(state: AppState) -> Router {
    let api = Router::new()
        .route("/polls", post(handlers::create_poll))
        .route("/polls/{poll_id}", get(handlers::get_poll))
        .route("/polls/{poll_id}/results", get(handlers::get_results))
        .route("/polls/{poll_id}/votes", post(handlers::vote))
        .route("/polls/{poll_id}/votes/{user_id}", get(handlers::user_votes))
        .route("/polls/{poll_id}/close", post(handlers::close_poll))
        .route("/polls/{poll_id}/message", put(handlers::attach_message))
        .route("/interactions", post(handlers::interaction));

    Router::new()
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
