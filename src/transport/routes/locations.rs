use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};

use crate::common::errors::ApiError;
use crate::common::types::DriverId;
use crate::geo;
use crate::relay::store::LocationRecord;
use crate::server::AppState;

/// GET /v1/locations
pub async fn list_locations(State(state): State<Arc<AppState>>) -> Json<Vec<LocationRecord>> {
    Json(state.store.list_all())
}

/// GET /v1/locations/{driver_id}
pub async fn get_location(
    Path(driver_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let driver_id = DriverId::from(driver_id);
    match state.store.get(&driver_id) {
        Some(record) => (StatusCode::OK, Json(record)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ApiError::not_found(
                format!("No location tracked for driver {driver_id}"),
                format!("/v1/locations/{driver_id}"),
            )),
        )
            .into_response(),
    }
}

/// DELETE /v1/locations/{driver_id}
pub async fn delete_location(
    Path(driver_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let driver_id = DriverId::from(driver_id);
    match state.store.remove(&driver_id) {
        Some(_) => StatusCode::NO_CONTENT.into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ApiError::not_found(
                format!("No location tracked for driver {driver_id}"),
                format!("/v1/locations/{driver_id}"),
            )),
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct NearestQuery {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DistanceResponse {
    pub driver_id: DriverId,
    pub distance_meters: f64,
    pub stale: bool,
}

/// GET /v1/locations/{driver_id}/nearest?lat=..&lng=..
///
/// Great-circle distance from the driver's last known position to the given
/// reference point.
pub async fn nearest_distance(
    Path(driver_id): Path<String>,
    Query(params): Query<NearestQuery>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let driver_id = DriverId::from(driver_id);
    let path = format!("/v1/locations/{driver_id}/nearest");

    if !geo::coordinates_in_range(params.lat, params.lng) {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiError::bad_request(
                format!(
                    "Reference point out of range: lat={} lng={}",
                    params.lat, params.lng
                ),
                path,
            )),
        )
            .into_response();
    }

    match state.store.get(&driver_id) {
        Some(record) => {
            let distance_meters =
                geo::haversine_m(record.latitude, record.longitude, params.lat, params.lng);
            (
                StatusCode::OK,
                Json(DistanceResponse {
                    driver_id,
                    distance_meters,
                    stale: record.stale,
                }),
            )
                .into_response()
        }
        None => (
            StatusCode::NOT_FOUND,
            Json(ApiError::not_found(
                format!("No location tracked for driver {driver_id}"),
                path,
            )),
        )
            .into_response(),
    }
}
