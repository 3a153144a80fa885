use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::routing::{get, patch, post};
use axum::Json;
use axum::Router;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::{AuthenticatedParty, Role};
use crate::error::AppError;
use crate::models::booking::{Booking, BookingStatus, CurrentBooking, NewBookingRequest};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/booking", post(create_booking))
        .route("/booking/accept", post(accept_booking))
        .route("/booking/:requester_id", patch(update_booking))
        .route("/user/booking", get(requester_current))
        .route("/driver/booking", get(operator_current))
        .route("/user/booking-history", get(requester_history))
        .route("/driver/booking-history", get(operator_history))
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, AppError> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| AppError::Validation(rejection.body_text()))
}

#[derive(Serialize)]
pub struct PendingCreated {
    pub pending_id: Uuid,
    pub status: &'static str,
}

async fn create_booking(
    State(state): State<Arc<AppState>>,
    AuthenticatedParty(identity): AuthenticatedParty,
    payload: Result<Json<NewBookingRequest>, JsonRejection>,
) -> Result<Json<PendingCreated>, AppError> {
    let request = state
        .lifecycle
        .create_request(&identity, body(payload)?)
        .await?;

    Ok(Json(PendingCreated {
        pending_id: request.pending_id,
        status: "pending",
    }))
}

#[derive(Deserialize)]
pub struct AcceptBody {
    pub pending_id: Uuid,
}

#[derive(Serialize)]
pub struct Accepted {
    pub requester_id: String,
    pub booking: Booking,
}

async fn accept_booking(
    State(state): State<Arc<AppState>>,
    AuthenticatedParty(identity): AuthenticatedParty,
    payload: Result<Json<AcceptBody>, JsonRejection>,
) -> Result<Json<Accepted>, AppError> {
    let AcceptBody { pending_id } = body(payload)?;
    let booking = state.lifecycle.accept_request(&identity, pending_id).await?;

    Ok(Json(Accepted {
        requester_id: booking.requester_id.clone(),
        booking,
    }))
}

#[derive(Deserialize)]
pub struct StatusBody {
    pub status: String,
}

async fn update_booking(
    State(state): State<Arc<AppState>>,
    AuthenticatedParty(identity): AuthenticatedParty,
    Path(requester_id): Path<String>,
    payload: Result<Json<StatusBody>, JsonRejection>,
) -> Result<Json<Booking>, AppError> {
    let StatusBody { status } = body(payload)?;
    let status = status
        .parse::<BookingStatus>()
        .map_err(AppError::Validation)?;

    let booking = state
        .lifecycle
        .update_status(&identity, &requester_id, status)
        .await?;

    Ok(Json(booking))
}

async fn requester_current(
    State(state): State<Arc<AppState>>,
    AuthenticatedParty(identity): AuthenticatedParty,
) -> Result<Json<CurrentBooking>, AppError> {
    Ok(Json(state.lifecycle.current_for_requester(&identity).await?))
}

async fn operator_current(
    State(state): State<Arc<AppState>>,
    AuthenticatedParty(identity): AuthenticatedParty,
) -> Result<Json<Booking>, AppError> {
    Ok(Json(state.lifecycle.current_for_operator(&identity).await?))
}

async fn requester_history(
    State(state): State<Arc<AppState>>,
    AuthenticatedParty(identity): AuthenticatedParty,
) -> Result<Json<Vec<Booking>>, AppError> {
    Ok(Json(state.lifecycle.history(&identity, Role::Requester).await?))
}

async fn operator_history(
    State(state): State<Arc<AppState>>,
    AuthenticatedParty(identity): AuthenticatedParty,
) -> Result<Json<Vec<Booking>>, AppError> {
    Ok(Json(state.lifecycle.history(&identity, Role::Operator).await?))
}
