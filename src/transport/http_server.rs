use std::sync::Arc;

use axum::{Router, middleware, routing::get};

use crate::{
    server::AppState,
    transport::{
        middleware::{add_response_headers, check_auth},
        routes::{locations, stats},
    },
};

const API_V1: &str = "/v1";

pub fn router(state: Arc<AppState>) -> Router {
    let v1_routes = Router::new()
        .route("/locations", get(locations::list_locations))
        .route(
            "/locations/{driver_id}",
            get(locations::get_location).delete(locations::delete_location),
        )
        .route(
            "/locations/{driver_id}/nearest",
            get(locations::nearest_distance),
        )
        .route("/stats", get(stats::get_stats));

    Router::new()
        .nest(API_V1, v1_routes)
        .route("/version", get(stats::get_version))
        .layer(middleware::from_fn_with_state(state.clone(), check_auth))
        .layer(middleware::from_fn(add_response_headers))
        .with_state(state)
}
