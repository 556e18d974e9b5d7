// src/server/dispatch.rs

//! The fixed command-name -> handler table (§6). Every handler has the
//! signature `(state, session_id, request) -> Result<Value, SpallocError>`;
//! an `Err` here causes the reactor to disconnect the calling client.

use crate::core::board::BoardAddress;
use crate::core::job::JobRequest;
use crate::core::SpallocError;
use crate::server::reactor::ReactorState;
use serde_json::Value;
use std::collections::BTreeSet;

pub type Handler = fn(&mut ReactorState, u64, &crate::protocol::Request) -> Result<Value, SpallocError>;

pub fn lookup(command: &str) -> Option<Handler> {
    Some(match command {
        "version" => version,
        "create_job" => create_job,
        "job_keepalive" => job_keepalive,
        "get_job_state" => get_job_state,
        "get_job_machine_info" => get_job_machine_info,
        "power_on_job_boards" => power_on_job_boards,
        "power_off_job_boards" => power_off_job_boards,
        "destroy_job" => destroy_job,
        "list_jobs" => list_jobs,
        "list_machines" => list_machines,
        "where_is" => where_is,
        "get_board_position" => get_board_position,
        "get_board_at_position" => get_board_at_position,
        "notify_job" => notify_job,
        "no_notify_job" => no_notify_job,
        "notify_machine" => notify_machine,
        "no_notify_machine" => no_notify_machine,
        _ => return None,
    })
}

fn bad_args(command: &str, why: impl Into<String>) -> SpallocError {
    SpallocError::BadArguments(command.to_string(), why.into())
}

fn arg_u64(req: &crate::protocol::Request, idx: usize, key: &str) -> Option<u64> {
    req.args
        .get(idx)
        .or_else(|| req.kwargs.get(key))
        .and_then(Value::as_u64)
}

fn arg_str(req: &crate::protocol::Request, key: &str) -> Option<String> {
    req.kwargs.get(key).and_then(Value::as_str).map(str::to_string)
}

fn version(_state: &mut ReactorState, _session_id: u64, _req: &crate::protocol::Request) -> Result<Value, SpallocError> {
    Ok(Value::String(env!("CARGO_PKG_VERSION").to_string()))
}

/// `create_job(*args, owner, keepalive=60, tags=[], require_torus=false)`.
/// `*args` shape dispatches on positional arg count: 0 -> any board, 1 ->
/// exact board count, 2 -> rectangle, 3 -> a specific board address.
fn create_job(state: &mut ReactorState, _session_id: u64, req: &crate::protocol::Request) -> Result<Value, SpallocError> {
    let owner = arg_str(req, "owner").ok_or_else(|| bad_args("create_job", "missing 'owner'"))?;
    let keepalive = req
        .kwargs
        .get("keepalive")
        .and_then(Value::as_u64)
        .or(Some(60));
    let require_torus = req
        .kwargs
        .get("require_torus")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let tags: BTreeSet<String> = req
        .kwargs
        .get("tags")
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default();

    let request = match req.args.len() {
        0 => JobRequest::AnyBoard,
        1 => {
            let n = req.args[0]
                .as_u64()
                .ok_or_else(|| bad_args("create_job", "expected an integer board count"))?;
            JobRequest::NumBoards(n as u32)
        }
        2 => {
            let width = req.args[0]
                .as_u64()
                .ok_or_else(|| bad_args("create_job", "expected integer width"))? as u32;
            let height = req.args[1]
                .as_u64()
                .ok_or_else(|| bad_args("create_job", "expected integer height"))? as u32;
            JobRequest::Rectangle { width, height }
        }
        3 => {
            let cabinet = req.args[0].as_u64().ok_or_else(|| bad_args("create_job", "expected integer cabinet"))? as u8;
            let frame = req.args[1].as_u64().ok_or_else(|| bad_args("create_job", "expected integer frame"))? as u8;
            let board = req.args[2].as_u64().ok_or_else(|| bad_args("create_job", "expected integer board"))? as u8;
            JobRequest::SpecificBoard(BoardAddress::new(cabinet, frame, board))
        }
        n => return Err(bad_args("create_job", format!("unexpected {n} positional arguments"))),
    };

    let job_id = state
        .controller
        .create_job(owner, keepalive, tags, require_torus, request);
    Ok(Value::from(job_id))
}

fn job_keepalive(state: &mut ReactorState, _session_id: u64, req: &crate::protocol::Request) -> Result<Value, SpallocError> {
    let id = arg_u64(req, 0, "id").ok_or_else(|| bad_args("job_keepalive", "missing job id"))?;
    state.controller.job_keepalive(id)?;
    Ok(Value::Null)
}

fn get_job_state(state: &mut ReactorState, _session_id: u64, req: &crate::protocol::Request) -> Result<Value, SpallocError> {
    let id = arg_u64(req, 0, "id").ok_or_else(|| bad_args("get_job_state", "missing job id"))?;
    Ok(state.controller.get_job_state(id))
}

fn get_job_machine_info(state: &mut ReactorState, _session_id: u64, req: &crate::protocol::Request) -> Result<Value, SpallocError> {
    let id = arg_u64(req, 0, "id").ok_or_else(|| bad_args("get_job_machine_info", "missing job id"))?;
    Ok(state.controller.get_job_machine_info(id))
}

fn power_on_job_boards(state: &mut ReactorState, _session_id: u64, req: &crate::protocol::Request) -> Result<Value, SpallocError> {
    let id = arg_u64(req, 0, "id").ok_or_else(|| bad_args("power_on_job_boards", "missing job id"))?;
    state.controller.power_on_job_boards(id)?;
    Ok(Value::Null)
}

fn power_off_job_boards(state: &mut ReactorState, _session_id: u64, req: &crate::protocol::Request) -> Result<Value, SpallocError> {
    let id = arg_u64(req, 0, "id").ok_or_else(|| bad_args("power_off_job_boards", "missing job id"))?;
    state.controller.power_off_job_boards(id)?;
    Ok(Value::Null)
}

fn destroy_job(state: &mut ReactorState, _session_id: u64, req: &crate::protocol::Request) -> Result<Value, SpallocError> {
    let id = arg_u64(req, 0, "id").ok_or_else(|| bad_args("destroy_job", "missing job id"))?;
    let reason = req.args.get(1).and_then(Value::as_str).map(str::to_string)
        .or_else(|| arg_str(req, "reason"));
    state.controller.destroy_job(id, reason)?;
    Ok(Value::Null)
}

fn list_jobs(state: &mut ReactorState, _session_id: u64, _req: &crate::protocol::Request) -> Result<Value, SpallocError> {
    Ok(Value::Array(state.controller.list_jobs()))
}

fn list_machines(state: &mut ReactorState, _session_id: u64, _req: &crate::protocol::Request) -> Result<Value, SpallocError> {
    Ok(Value::Array(state.controller.list_machines()))
}

fn where_is(state: &mut ReactorState, _session_id: u64, req: &crate::protocol::Request) -> Result<Value, SpallocError> {
    if let Some(job_id) = arg_u64(req, 0, "job_id") {
        return Ok(state
            .controller
            .where_is_by_job_chip(job_id)
            .unwrap_or(Value::Null));
    }
    let machine = arg_str(req, "machine").ok_or_else(|| bad_args("where_is", "expected 'job_id' or 'machine'"))?;
    let x = req.kwargs.get("x").and_then(Value::as_u64).ok_or_else(|| bad_args("where_is", "missing 'x'"))? as u32;
    let y = req.kwargs.get("y").and_then(Value::as_u64).ok_or_else(|| bad_args("where_is", "missing 'y'"))? as u32;
    let z = req.kwargs.get("z").and_then(Value::as_u64).ok_or_else(|| bad_args("where_is", "missing 'z'"))? as u32;
    Ok(state
        .controller
        .where_is_by_physical(&machine, x, y, z)
        .unwrap_or(Value::Null))
}

fn get_board_position(state: &mut ReactorState, _session_id: u64, req: &crate::protocol::Request) -> Result<Value, SpallocError> {
    let (machine, x, y, z) = coordinate_args(req, "get_board_position")?;
    Ok(match state.controller.get_board_position(&machine, x, y, z) {
        Some(board) => serde_json::json!([board.cabinet, board.frame, board.board]),
        None => Value::Null,
    })
}

fn get_board_at_position(state: &mut ReactorState, _session_id: u64, req: &crate::protocol::Request) -> Result<Value, SpallocError> {
    let (machine, x, y, z) = coordinate_args(req, "get_board_at_position")?;
    let (cabinet, frame, board) = (x as u8, y as u8, z as u8);
    Ok(match state.controller.get_board_at_position(&machine, cabinet, frame, board) {
        Some(triad) => serde_json::json!([triad.0, triad.1, triad.2]),
        None => Value::Null,
    })
}

fn coordinate_args(req: &crate::protocol::Request, command: &str) -> Result<(String, u32, u32, u32), SpallocError> {
    let machine = req
        .args
        .first()
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| arg_str(req, "machine"))
        .ok_or_else(|| bad_args(command, "missing 'machine'"))?;
    let get = |idx: usize, key: &str| -> Result<u32, SpallocError> {
        req.args
            .get(idx)
            .or_else(|| req.kwargs.get(key))
            .and_then(Value::as_u64)
            .map(|v| v as u32)
            .ok_or_else(|| bad_args(command, format!("missing '{key}'")))
    };
    let x = get(1, "x")?;
    let y = get(2, "y")?;
    let z = get(3, "z")?;
    Ok((machine, x, y, z))
}

fn notify_job(state: &mut ReactorState, session_id: u64, req: &crate::protocol::Request) -> Result<Value, SpallocError> {
    match arg_u64(req, 0, "id") {
        Some(id) => state.job_watches.subscribe_one(session_id, id),
        None => state.job_watches.subscribe_all(session_id),
    }
    Ok(Value::Null)
}

fn no_notify_job(state: &mut ReactorState, session_id: u64, req: &crate::protocol::Request) -> Result<Value, SpallocError> {
    match arg_u64(req, 0, "id") {
        Some(id) => state.job_watches.unsubscribe_one(session_id, &id),
        None => state.job_watches.unsubscribe_all(session_id),
    }
    Ok(Value::Null)
}

fn notify_machine(state: &mut ReactorState, session_id: u64, req: &crate::protocol::Request) -> Result<Value, SpallocError> {
    match arg_str(req, "name").or_else(|| req.args.first().and_then(Value::as_str).map(str::to_string)) {
        Some(name) => state.machine_watches.subscribe_one(session_id, name),
        None => state.machine_watches.subscribe_all(session_id),
    }
    Ok(Value::Null)
}

fn no_notify_machine(state: &mut ReactorState, session_id: u64, req: &crate::protocol::Request) -> Result<Value, SpallocError> {
    match arg_str(req, "name").or_else(|| req.args.first().and_then(Value::as_str).map(str::to_string)) {
        Some(name) => state.machine_watches.unsubscribe_one(session_id, &name),
        None => state.machine_watches.unsubscribe_all(session_id),
    }
    Ok(Value::Null)
}
