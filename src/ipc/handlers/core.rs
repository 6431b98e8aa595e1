use rusqlite::OptionalExtension;
use serde_json::json;
use std::path::PathBuf;

use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, required_str};
use crate::ipc::types::{AppState, Identity, Request, Role};

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string()),
            "signedInAs": state.identity.as_ref().map(|i| json!({
                "profileId": i.profile_id,
                "fullName": i.full_name,
                "role": i.role.as_str(),
            })),
        }),
    )
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let p = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from);
    let Some(path) = p else {
        return err(&req.id, "bad_params", "missing params.path", None);
    };

    match db::open_db(&path) {
        Ok(conn) => {
            state.workspace = Some(path.clone());
            state.db = Some(conn);
            // A session pinned against the previous workspace would stamp
            // ids the new database has never seen.
            state.identity = None;
            ok(&req.id, json!({ "workspacePath": path.to_string_lossy() }))
        }
        Err(e) => err(&req.id, "db_open_failed", format!("{e:?}"), None),
    }
}

fn handle_session_sign_in(state: &mut AppState, req: &Request) -> serde_json::Value {
    let profile_id = match required_str(req, "profileId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let row: Option<(String, String)> = match conn
        .query_row(
            "SELECT full_name, role FROM profiles WHERE id = ?",
            [&profile_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let Some((full_name, role_text)) = row else {
        return err(&req.id, "not_found", "profile not found", None);
    };
    let Some(role) = Role::parse(&role_text) else {
        return err(
            &req.id,
            "bad_params",
            "profile has an unknown role",
            Some(json!({ "role": role_text })),
        );
    };

    state.identity = Some(Identity {
        profile_id: profile_id.clone(),
        full_name: full_name.clone(),
        role,
    });

    ok(
        &req.id,
        json!({
            "profileId": profile_id,
            "fullName": full_name,
            "role": role.as_str(),
        }),
    )
}

fn handle_session_sign_out(state: &mut AppState, req: &Request) -> serde_json::Value {
    state.identity = None;
    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        "session.signIn" => Some(handle_session_sign_in(state, req)),
        "session.signOut" => Some(handle_session_sign_out(state, req)),
        _ => None,
    }
}
