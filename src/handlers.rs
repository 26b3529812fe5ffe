// handlers.rs
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use http::StatusCode;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::commands::{self, CommandReply, Interaction};
use crate::error::PollError;
use crate::models::{
    AttachMessageRequest, ClosedPoll, CloseRequest, CreatePollRequest, Poll, PollResults,
    VoteReceipt, VoteRequest,
};
use crate::poll::PollLifecycle;
use crate::vote::VoteEngine;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<VoteEngine>,
    pub lifecycle: Arc<PollLifecycle>,
}

/// Create a poll, scheduling its closure when a duration is given
pub async fn create_poll(
    State(state): State<AppState>,
    Json(req): Json<CreatePollRequest>,
) -> Result<(StatusCode, Json<Poll>), PollError> {
    let poll = state.lifecycle.create_poll(req).await?;
    Ok((StatusCode::CREATED, Json(poll)))
}

pub async fn get_poll(
    State(state): State<AppState>,
    Path(poll_id): Path<Uuid>,
) -> Result<Json<Poll>, PollError> {
    Ok(Json(state.lifecycle.get_poll(poll_id).await?))
}

/// Current tallies in option order
pub async fn get_results(
    State(state): State<AppState>,
    Path(poll_id): Path<Uuid>,
) -> Result<Json<PollResults>, PollError> {
    Ok(Json(state.engine.compute_results(poll_id).await?))
}

/// Cast a vote, or retract it when the user already holds that option
pub async fn vote(
    State(state): State<AppState>,
    Path(poll_id): Path<Uuid>,
    Json(req): Json<VoteRequest>,
) -> Result<Json<VoteReceipt>, PollError> {
    let receipt = state
        .engine
        .cast_or_retract(poll_id, &req.user_id, req.option_id)
        .await?;
    Ok(Json(receipt))
}

pub async fn user_votes(
    State(state): State<AppState>,
    Path((poll_id, user_id)): Path<(Uuid, String)>,
) -> Result<Json<Value>, PollError> {
    let option_ids = state.engine.list_user_votes(poll_id, &user_id).await?;
    Ok(Json(json!({ "poll_id": poll_id, "user_id": user_id, "option_ids": option_ids })))
}

/// Close a poll (creator only)
pub async fn close_poll(
    State(state): State<AppState>,
    Path(poll_id): Path<Uuid>,
    Json(req): Json<CloseRequest>,
) -> Result<Json<ClosedPoll>, PollError> {
    Ok(Json(
        state
            .lifecycle
            .close_poll(poll_id, &req.requester_id)
            .await?,
    ))
}

pub async fn attach_message(
    State(state): State<AppState>,
    Path(poll_id): Path<Uuid>,
    Json(req): Json<AttachMessageRequest>,
) -> Result<StatusCode, PollError> {
    state
        .lifecycle
        .attach_message(poll_id, &req.requester_id, &req.message_ref)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Button and command interactions from the chat front end
pub async fn interaction(
    State(state): State<AppState>,
    Json(interaction): Json<Interaction>,
) -> Result<Json<CommandReply>, PollError> {
    let command = interaction.command()?;
    let reply = commands::dispatch(
        &state.engine,
        &state.lifecycle,
        &interaction.user_id,
        command,
    )
    .await?;
    Ok(Json(reply))
}
