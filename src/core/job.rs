// src/core/job.rs

//! Job records: a client's reservation of a set of boards on some machine,
//! with a keepalive deadline.

use crate::core::board::BoardAddress;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::{SystemTime, UNIX_EPOCH};

/// The observable lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobState {
    /// Waiting for the allocator to find it a machine/board set.
    Queued,
    /// Boards assigned; waiting for them to power on and links to settle.
    Power,
    /// Fully allocated, powered, and ready for use.
    Ready,
    /// Torn down; `destroy_reason` explains why.
    Destroyed,
    /// Not a known job id (never returned from the job table itself; used
    /// by `get_job_state` for unknown ids so the wire contract always
    /// resolves to a state rather than an error).
    Unknown,
}

/// What the client asked for, before allocation resolves it to a board set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobRequest {
    /// Any single free board.
    AnyBoard,
    /// A rectangle of the given dimensions.
    Rectangle { width: u32, height: u32 },
    /// Exactly this many boards, shape chosen by the allocator.
    NumBoards(u32),
    /// One specific board, addressed by triad or physical address.
    SpecificBoard(BoardAddress),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: u64,
    pub owner: String,
    pub keepalive: Option<u64>,
    pub tags: BTreeSet<String>,
    pub require_torus: bool,
    pub request: JobRequest,

    pub state: JobState,
    pub power: bool,
    pub destroy_reason: Option<String>,
    pub start_time: f64,

    pub machine_name: Option<String>,
    pub allocated_boards: BTreeSet<BoardAddress>,
    pub width: Option<u32>,
    pub height: Option<u32>,

    /// Unix-epoch seconds after which the job is considered expired if no
    /// `job_keepalive` call resets it. `None` when `keepalive` is `None`.
    pub keepalive_deadline: Option<f64>,
}

impl JobRecord {
    pub fn new(
        job_id: u64,
        owner: String,
        keepalive: Option<u64>,
        tags: BTreeSet<String>,
        require_torus: bool,
        request: JobRequest,
        now: f64,
    ) -> Self {
        Self {
            job_id,
            owner,
            keepalive,
            tags,
            require_torus,
            request,
            state: JobState::Queued,
            power: false,
            destroy_reason: None,
            start_time: now,
            machine_name: None,
            allocated_boards: BTreeSet::new(),
            width: None,
            height: None,
            keepalive_deadline: keepalive.map(|k| now + k as f64),
        }
    }

    pub fn touch_keepalive(&mut self, now: f64) {
        if let Some(k) = self.keepalive {
            self.keepalive_deadline = Some(now + k as f64);
        }
    }

    pub fn is_expired(&self, now: f64) -> bool {
        matches!(self.keepalive_deadline, Some(deadline) if now > deadline)
    }

    pub fn destroy(&mut self, reason: Option<String>) {
        self.state = JobState::Destroyed;
        self.destroy_reason = reason;
        self.power = false;
    }
}

/// Current time as Unix-epoch seconds with sub-second precision.
pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
