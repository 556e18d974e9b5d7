// src/server/reactor.rs

//! The single-writer reactor task: owns the `Controller`, the subscription
//! tables, and every connection's outbox. Connection tasks (`session.rs`)
//! only do JSON-line I/O framing; all server-internal mutation happens here,
//! on one task, so no lock is ever held across a hardware call.

use crate::config::Config;
use crate::core::job::now_secs;
use crate::core::{metrics, persistence, Controller};
use crate::protocol::{Request, Response};
use crate::server::notify::WatchTable;
use crate::server::{dispatch, session};
use anyhow::Result;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::SystemTime;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// A message from a connection task to the reactor.
pub enum ReactorEvent {
    Request { session_id: u64, request: Request },
    Disconnect { session_id: u64 },
}

/// A message from the reactor to a connection task, ready to be framed and
/// written out.
pub enum ToClient {
    Response(Value),
    JobsChanged(Vec<u64>),
    MachinesChanged(Vec<String>),
}

impl ToClient {
    pub fn into_value(self) -> Value {
        let response = match self {
            ToClient::Response(value) => Response::ret(value),
            ToClient::JobsChanged(jobs_changed) => Response::JobsChanged { jobs_changed },
            ToClient::MachinesChanged(machines_changed) => Response::MachinesChanged { machines_changed },
        };
        serde_json::to_value(response).expect("Response always serialises")
    }
}

/// Everything the reactor owns. Dispatch handlers in `dispatch.rs` operate
/// directly on this struct's fields.
pub struct ReactorState {
    pub controller: Controller,
    pub job_watches: WatchTable<u64>,
    pub machine_watches: WatchTable<String>,
    outboxes: HashMap<u64, mpsc::UnboundedSender<ToClient>>,
}

impl ReactorState {
    fn send(&mut self, session_id: u64, msg: ToClient) {
        let Some(tx) = self.outboxes.get(&session_id) else {
            return;
        };
        if tx.send(msg).is_err() {
            self.disconnect(session_id);
        }
    }

    fn disconnect(&mut self, session_id: u64) {
        self.outboxes.remove(&session_id);
        self.job_watches.remove_session(session_id);
        self.machine_watches.remove_session(session_id);
    }

    fn fan_out(&mut self, changed_jobs: HashSet<u64>, changed_machines: HashSet<String>) {
        if changed_jobs.is_empty() && changed_machines.is_empty() {
            return;
        }
        let sessions: HashSet<u64> = self
            .job_watches
            .subscribed_sessions()
            .chain(self.machine_watches.subscribed_sessions())
            .collect();
        for session_id in sessions {
            if let Some(ids) = self.job_watches.matching(session_id, &changed_jobs) {
                self.send(session_id, ToClient::JobsChanged(ids));
            }
            if let Some(names) = self.machine_watches.matching(session_id, &changed_machines) {
                self.send(session_id, ToClient::MachinesChanged(names));
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Runs the server: binds the listening socket, restores persisted state
/// (unless `cold_start`), and drives the single reactor loop until shutdown.
pub async fn run(mut config: Config, config_path: PathBuf, cold_start: bool) -> Result<()> {
    let mut controller = Controller::new();
    controller.set_max_retired_jobs(config.max_retired_jobs);
    controller.set_machines(config.machines.clone());
    let hot = persistence::restore(&mut controller, &config_path, cold_start);
    info!(hot_start = hot, "controller state initialised");

    let mut state = ReactorState {
        controller,
        job_watches: WatchTable::new(),
        machine_watches: WatchTable::new(),
        outboxes: HashMap::new(),
    };

    let mut listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
    info!(host = %config.host, port = config.port, "spallocd listening");

    if config.metrics.enabled {
        tokio::spawn(crate::server::metrics_server::run(config.metrics.port));
    }

    let (to_reactor, mut from_clients) = mpsc::unbounded_channel::<ReactorEvent>();
    let mut next_session_id: u64 = 0;
    let mut tick = tokio::time::interval(config.timeout_check_interval);
    let mut last_config_mtime = config_mtime(&config_path);

    loop {
        tokio::select! {
            biased;

            _ = shutdown_signal() => {
                info!("shutdown signal received");
                break;
            }

            accept_res = listener.accept() => {
                match accept_res {
                    Ok((stream, addr)) => {
                        next_session_id += 1;
                        let session_id = next_session_id;
                        let outbox = session::spawn(stream, addr, session_id, to_reactor.clone());
                        state.outboxes.insert(session_id, outbox);
                        metrics::CONNECTED_CLIENTS.inc();
                        metrics::CONNECTIONS_RECEIVED_TOTAL.inc();
                        info!(session_id, %addr, "accepted connection");
                    }
                    Err(e) => warn!(error = %e, "failed to accept connection"),
                }
            }

            event = from_clients.recv() => {
                match event {
                    Some(event) => handle_event(&mut state, event),
                    None => {
                        error!("all client-event senders dropped, reactor channel closed unexpectedly");
                        break;
                    }
                }
            }

            _ = tick.tick() => {
                if let Some(new_mtime) = config_mtime(&config_path) {
                    if last_config_mtime != Some(new_mtime) {
                        last_config_mtime = Some(new_mtime);
                        reload_config(&mut state, &mut config, &config_path, &mut listener, &mut tick).await;
                    }
                }

                let report = state.controller.tick(now_secs());
                state.fan_out(report.changed_jobs, report.changed_machines);
            }
        }
    }

    info!("shutting down, draining connections and machine workers");
    for session_id in state.outboxes.keys().copied().collect::<Vec<_>>() {
        state.disconnect(session_id);
    }
    state.controller.stop_all_machines();
    if let Err(e) = persistence::save(&state.controller, &config_path) {
        error!(error = %e, "failed to write state sidecar file on shutdown");
    }
    Ok(())
}

fn handle_event(state: &mut ReactorState, event: ReactorEvent) {
    match event {
        ReactorEvent::Request { session_id, request } => {
            metrics::COMMANDS_PROCESSED_TOTAL.inc();
            let timer = metrics::COMMAND_LATENCY_SECONDS.start_timer();
            let result = match dispatch::lookup(&request.command) {
                Some(handler) => handler(state, session_id, &request),
                None => Err(crate::core::SpallocError::UnknownCommand(request.command.clone())),
            };
            timer.observe_duration();
            match result {
                Ok(value) => state.send(session_id, ToClient::Response(value)),
                Err(e) => {
                    warn!(session_id, command = %request.command, error = %e, "command failed, disconnecting client");
                    state.disconnect(session_id);
                }
            }
        }
        ReactorEvent::Disconnect { session_id } => {
            state.disconnect(session_id);
            metrics::CONNECTED_CLIENTS.dec();
        }
    }
}

async fn reload_config(
    state: &mut ReactorState,
    config: &mut Config,
    config_path: &PathBuf,
    listener: &mut TcpListener,
    tick: &mut tokio::time::Interval,
) {
    let path = config_path.to_string_lossy().into_owned();
    let new_config = match Config::from_file(&path) {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "config reload failed, keeping previous configuration");
            return;
        }
    };
    metrics::CONFIG_RELOADS_TOTAL.inc();

    let recreate_listener = new_config.host != config.host || new_config.port != config.port;
    let changed_machines = state.controller.set_machines(new_config.machines.clone());
    state.controller.set_max_retired_jobs(new_config.max_retired_jobs);
    *tick = tokio::time::interval(new_config.timeout_check_interval);

    if recreate_listener {
        match TcpListener::bind((new_config.host.as_str(), new_config.port)).await {
            Ok(new_listener) => {
                *listener = new_listener;
                info!(host = %new_config.host, port = new_config.port, "listening socket recreated after config reload");
            }
            Err(e) => error!(error = %e, host = %new_config.host, port = new_config.port, "failed to bind new listening socket, keeping old one"),
        }
    }

    *config = new_config;
    info!("configuration reloaded");
    state.fan_out(HashSet::new(), changed_machines);
}

fn config_mtime(path: &PathBuf) -> Option<SystemTime> {
    std::fs::metadata(path).ok()?.modified().ok()
}
