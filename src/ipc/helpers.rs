use rusqlite::Connection;

use crate::ipc::error::err;
use crate::ipc::types::{AppState, Identity, Request, Role};

pub fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.to_string())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

pub fn optional_str(req: &Request, key: &str) -> Option<String> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.to_string())
}

pub fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

pub fn require_identity(state: &AppState, req: &Request) -> Result<Identity, serde_json::Value> {
    state
        .identity
        .clone()
        .ok_or_else(|| err(&req.id, "unauthorized", "sign in first", None))
}

pub fn require_role(
    state: &AppState,
    req: &Request,
    role: Role,
) -> Result<Identity, serde_json::Value> {
    let identity = require_identity(state, req)?;
    if identity.role != role {
        return Err(err(
            &req.id,
            "unauthorized",
            format!("requires {} role", role.as_str()),
            None,
        ));
    }
    Ok(identity)
}
