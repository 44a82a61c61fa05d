/*
 * This file is part of Casterd.
 *
 * Copyright (C) 2026 Casterd contributors
 *
 * Casterd is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Casterd is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Casterd. If not, see <https://www.gnu.org/licenses/>.
 */

//! HTTP/JSON control surface.
//!
//! Every response about a known interface carries its current status
//! snapshot; error responses additionally carry the error kind and
//! message, so a client always sees the state a failed request left the
//! machine in.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::caster::{MachineState, OperationMode, StatusSnapshot};
use crate::errors::{CasterError, Result};
use crate::interface::{Command, InterfaceManager};
use crate::signals::Combination;
use crate::translate::Row16Mode;

type SharedManager = Arc<InterfaceManager>;

pub fn router(manager: SharedManager) -> Router {
    Router::new()
        .route("/interfaces", get(list_interfaces))
        .route("/interfaces/:name/status", get(interface_status))
        .route("/interfaces/:name/start", post(start_interface))
        .route("/interfaces/:name/stop", post(stop_interface))
        .route("/interfaces/:name/cast", post(cast_signals))
        .route("/interfaces/:name/punch", post(punch_signals))
        .route("/interfaces/:name/test", post(test_signals))
        .route("/interfaces/:name/reset", post(reset_interface))
        .with_state(manager)
}

// ============================================================================
// Request models
// ============================================================================

/// A combination arrives as a compact string ("NI 0075") or as a list of
/// labels (["N", "I", "0075"]).
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum CombinationInput {
    Text(String),
    Labels(Vec<String>),
}

impl CombinationInput {
    fn build(&self) -> Result<Combination> {
        match self {
            CombinationInput::Text(text) => Combination::parse(text),
            CombinationInput::Labels(labels) => Combination::from_labels(labels),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct StartBody {
    #[serde(default)]
    pub mode: Option<OperationMode>,
}

#[derive(Debug, Deserialize)]
pub struct CastBody {
    pub combinations: Vec<CombinationInput>,
    #[serde(default)]
    pub row16_mode: Option<Row16Mode>,
}

#[derive(Debug, Deserialize)]
pub struct PunchBody {
    pub combinations: Vec<CombinationInput>,
    #[serde(default)]
    pub row16_mode: Option<Row16Mode>,
    #[serde(default)]
    pub manual: bool,
}

#[derive(Debug, Deserialize)]
pub struct TestBody {
    pub combination: CombinationInput,
    #[serde(default)]
    pub row16_mode: Option<Row16Mode>,
}

// ============================================================================
// Response models
// ============================================================================

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub kind: String,
    pub message: String,
}

impl ApiError {
    fn from(error: &CasterError) -> Self {
        Self {
            kind: error.kind().to_string(),
            message: error.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct InterfaceReply {
    pub interface: String,
    pub status: StatusSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

#[derive(Debug, Serialize)]
pub struct InterfaceListEntry {
    pub name: String,
    pub state: MachineState,
    pub supported_modes: Vec<OperationMode>,
    pub supported_row16_modes: Vec<Row16Mode>,
}

fn status_code(error: &CasterError) -> StatusCode {
    match error {
        CasterError::InvalidSignal(_)
        | CasterError::UnsupportedMode(_)
        | CasterError::UnsupportedRow16Mode(_)
        | CasterError::Config { .. } => StatusCode::BAD_REQUEST,
        CasterError::NotFound(_) => StatusCode::NOT_FOUND,
        CasterError::InterfaceBusy
        | CasterError::NotStarted
        | CasterError::Faulted
        | CasterError::Interrupted => StatusCode::CONFLICT,
        CasterError::Timeout(_) | CasterError::HardwareIo(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reply(name: &str, status: StatusSnapshot, error: Option<&CasterError>) -> Response {
    let code = error.map(status_code).unwrap_or(StatusCode::OK);
    let body = InterfaceReply {
        interface: name.to_string(),
        status,
        error: error.map(ApiError::from),
    };
    (code, Json(body)).into_response()
}

fn unknown_interface(error: CasterError) -> Response {
    (
        status_code(&error),
        Json(serde_json::json!({ "error": ApiError::from(&error) })),
    )
        .into_response()
}

// ============================================================================
// Handlers
// ============================================================================

async fn list_interfaces(State(manager): State<SharedManager>) -> Json<Vec<InterfaceListEntry>> {
    let entries = manager
        .names()
        .into_iter()
        .filter_map(|name| manager.get(&name).ok())
        .map(|handle| InterfaceListEntry {
            name: handle.name().to_string(),
            state: handle.status().state,
            supported_modes: handle.supported_modes.clone(),
            supported_row16_modes: handle.supported_row16_modes.clone(),
        })
        .collect();
    Json(entries)
}

async fn interface_status(
    State(manager): State<SharedManager>,
    Path(name): Path<String>,
) -> Response {
    match manager.get(&name) {
        Ok(handle) => reply(handle.name(), handle.status(), None),
        Err(e) => unknown_interface(e),
    }
}

async fn start_interface(
    State(manager): State<SharedManager>,
    Path(name): Path<String>,
    body: Option<Json<StartBody>>,
) -> Response {
    let handle = match manager.get(&name) {
        Ok(handle) => handle,
        Err(e) => return unknown_interface(e),
    };
    let requested = body.and_then(|Json(b)| b.mode);
    let mode = manager.resolve_start_mode(handle, requested);
    match handle.call(Command::Start { mode }).await {
        Ok(snapshot) => reply(handle.name(), snapshot, None),
        Err(e) => reply(handle.name(), handle.status(), Some(&e)),
    }
}

async fn stop_interface(
    State(manager): State<SharedManager>,
    Path(name): Path<String>,
) -> Response {
    simple_command(&manager, &name, Command::Stop).await
}

async fn reset_interface(
    State(manager): State<SharedManager>,
    Path(name): Path<String>,
) -> Response {
    simple_command(&manager, &name, Command::Reset).await
}

async fn cast_signals(
    State(manager): State<SharedManager>,
    Path(name): Path<String>,
    Json(body): Json<CastBody>,
) -> Response {
    let handle = match manager.get(&name) {
        Ok(handle) => handle,
        Err(e) => return unknown_interface(e),
    };
    let combinations = match build_combinations(&body.combinations) {
        Ok(combinations) => combinations,
        Err(e) => return reply(handle.name(), handle.status(), Some(&e)),
    };
    let command = Command::Cast {
        combinations,
        row16_mode: body.row16_mode.unwrap_or(Row16Mode::Off),
    };
    match handle.call(command).await {
        Ok(snapshot) => reply(handle.name(), snapshot, None),
        Err(e) => reply(handle.name(), handle.status(), Some(&e)),
    }
}

async fn punch_signals(
    State(manager): State<SharedManager>,
    Path(name): Path<String>,
    Json(body): Json<PunchBody>,
) -> Response {
    let handle = match manager.get(&name) {
        Ok(handle) => handle,
        Err(e) => return unknown_interface(e),
    };
    let combinations = match build_combinations(&body.combinations) {
        Ok(combinations) => combinations,
        Err(e) => return reply(handle.name(), handle.status(), Some(&e)),
    };
    let command = Command::Punch {
        combinations,
        row16_mode: body.row16_mode.unwrap_or(Row16Mode::Off),
        manual: body.manual,
    };
    match handle.call(command).await {
        Ok(snapshot) => reply(handle.name(), snapshot, None),
        Err(e) => reply(handle.name(), handle.status(), Some(&e)),
    }
}

async fn test_signals(
    State(manager): State<SharedManager>,
    Path(name): Path<String>,
    Json(body): Json<TestBody>,
) -> Response {
    let handle = match manager.get(&name) {
        Ok(handle) => handle,
        Err(e) => return unknown_interface(e),
    };
    let combination = match body.combination.build() {
        Ok(combination) => combination,
        Err(e) => return reply(handle.name(), handle.status(), Some(&e)),
    };
    let command = Command::Test {
        combination,
        row16_mode: body.row16_mode.unwrap_or(Row16Mode::Off),
    };
    match handle.call(command).await {
        Ok(snapshot) => reply(handle.name(), snapshot, None),
        Err(e) => reply(handle.name(), handle.status(), Some(&e)),
    }
}

async fn simple_command(manager: &SharedManager, name: &str, command: Command) -> Response {
    let handle = match manager.get(name) {
        Ok(handle) => handle,
        Err(e) => return unknown_interface(e),
    };
    match handle.call(command).await {
        Ok(snapshot) => reply(handle.name(), snapshot, None),
        Err(e) => reply(handle.name(), handle.status(), Some(&e)),
    }
}

fn build_combinations(inputs: &[CombinationInput]) -> Result<Vec<Combination>> {
    inputs.iter().map(CombinationInput::build).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_follow_the_error_taxonomy() {
        assert_eq!(
            status_code(&CasterError::InvalidSignal("Q".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_code(&CasterError::UnsupportedMode("casting".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_code(&CasterError::NotFound("x".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(status_code(&CasterError::InterfaceBusy), StatusCode::CONFLICT);
        assert_eq!(status_code(&CasterError::Interrupted), StatusCode::CONFLICT);
        assert_eq!(
            status_code(&CasterError::timeout("sensor")),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status_code(&CasterError::hardware("bus")),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_combination_input_accepts_both_shapes() {
        let text: CombinationInput = serde_json::from_str(r#""NI 0075""#).unwrap();
        let labels: CombinationInput = serde_json::from_str(r#"["N", "I", "0075"]"#).unwrap();
        assert_eq!(text.build().unwrap(), labels.build().unwrap());
    }

    #[test]
    fn test_cast_body_defaults() {
        let body: CastBody = serde_json::from_str(r#"{"combinations": ["GS2"]}"#).unwrap();
        assert!(body.row16_mode.is_none());
        assert_eq!(body.combinations.len(), 1);

        let body: CastBody =
            serde_json::from_str(r#"{"combinations": ["16"], "row16_mode": "HMN"}"#).unwrap();
        assert_eq!(body.row16_mode, Some(Row16Mode::Hmn));
    }

    #[test]
    fn test_punch_body_manual_flag() {
        let body: PunchBody =
            serde_json::from_str(r#"{"combinations": ["A"], "manual": true}"#).unwrap();
        assert!(body.manual);
        let body: PunchBody = serde_json::from_str(r#"{"combinations": ["A"]}"#).unwrap();
        assert!(!body.manual);
    }

    #[test]
    fn test_bad_labels_are_rejected_before_dispatch() {
        let input = CombinationInput::Text("NQ".into());
        assert_eq!(input.build().unwrap_err().kind(), "invalid_signal");
    }
}
