// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The request dispatcher: the accept loop, per-connection handling, the
//! session registry, attach-lease bookkeeping and the dead-session/lease
//! reaper. Grounded in `daemon/server.rs`'s `Server`/`serve`/`handle_conn`
//! structure and in `daemon/ttl_reaper.rs`'s generation-id reaper, both
//! generalized here: the teacher's single-client-`Busy` attach model becomes
//! hauntty's always-succeeds multi-client model, and the reaper now carries
//! two independent timer kinds on one heap instead of one.

use std::{
    cmp::Ordering,
    collections::{BinaryHeap, HashMap, HashSet},
    os::unix::net::{UnixListener, UnixStream},
    sync::{
        atomic::{AtomicBool, Ordering as AtomicOrdering},
        Arc, Mutex,
    },
    thread,
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use anyhow::{anyhow, Context};
use hauntty_protocol::{
    CreateMode, CreateOutcome, CreatedResponse, DaemonStatus, Handshake, Request, Response,
    SessionEntry, SessionState, StatusResponse, PROTOCOL_REVISION, PROTOCOL_VERSION,
};
use rand::{distributions::Alphanumeric, Rng};
use tracing::{debug, info, instrument, warn};

use super::{names, persister, session};
use crate::{config::ServerConfig, consts, hooks::Hooks};

type Registry = Arc<Mutex<HashMap<String, Arc<session::Session>>>>;

struct Lease {
    session_name: String,
    expires_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReapKind {
    DeadSession,
    Lease,
}

impl ReapKind {
    fn tag(self) -> u8 {
        match self {
            ReapKind::DeadSession => 0,
            ReapKind::Lease => 1,
        }
    }
}

struct ReapRequest {
    kind: ReapKind,
    key: String,
    at: Instant,
}

/// One entry on the reaper's wait heap. `gen` is the generation of `key`'s
/// timer as of when this entry was scheduled; a popped entry whose `gen`
/// doesn't match the live generation for `(kind, key)` is stale and ignored,
/// exactly as in the teacher's ttl reaper.
struct Reapable {
    kind: ReapKind,
    key: String,
    gen: u64,
    at: Instant,
}

impl PartialEq for Reapable {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at
    }
}
impl Eq for Reapable {}
impl PartialOrd for Reapable {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Reapable {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the earliest deadline sorts first.
        other.at.cmp(&self.at)
    }
}

/// The daemon's request dispatcher and session registry.
pub struct Server {
    pub config: ServerConfig,
    sessions: Registry,
    dead: Mutex<HashMap<String, Instant>>,
    leases: Mutex<HashMap<String, Lease>>,
    reap_tx: crossbeam_channel::Sender<ReapRequest>,
    hooks: Box<dyn Hooks + Send + Sync>,
    persister: Mutex<Option<persister::Persister>>,
    started_at: Instant,
    shutting_down: AtomicBool,
}

impl Server {
    #[instrument(skip(config, hooks))]
    pub fn new(config: ServerConfig, hooks: Box<dyn Hooks + Send + Sync>) -> anyhow::Result<Arc<Server>> {
        persister::sweep_stale_tmp(&config.state_dir).context("sweeping stale persisted state")?;

        let (reap_tx, reap_rx) = crossbeam_channel::unbounded();
        let server = Arc::new(Server {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            dead: Mutex::new(HashMap::new()),
            leases: Mutex::new(HashMap::new()),
            reap_tx,
            hooks,
            persister: Mutex::new(None),
            started_at: Instant::now(),
            shutting_down: AtomicBool::new(false),
            config,
        });

        {
            let server = Arc::clone(&server);
            thread::spawn(move || run_reaper(server, reap_rx));
        }

        if server.config.persist_enabled {
            let persister = persister::Persister::start(
                server.config.state_dir.clone(),
                server.config.persist_interval,
                Arc::clone(&server.sessions),
            );
            *server.persister.lock().unwrap() = Some(persister);
        }

        Ok(server)
    }

    /// Accepts connections until the listener is closed, spawning a
    /// dispatcher thread per connection.
    pub fn serve(self: &Arc<Self>, listener: UnixListener) -> anyhow::Result<()> {
        for stream in listener.incoming() {
            let stream = match stream {
                Ok(s) => s,
                Err(e) => {
                    warn!("accept error: {}", e);
                    continue;
                }
            };
            let server = Arc::clone(self);
            thread::spawn(move || {
                if let Err(e) = server.handle_conn(stream) {
                    debug!("connection handler exited: {:?}", e);
                }
            });
        }
        Ok(())
    }

    /// Stops the persister (performing its final save), closes every
    /// session and removes the socket and pid files. Idempotent.
    pub fn shutdown(self: &Arc<Self>) {
        if self.shutting_down.swap(true, AtomicOrdering::SeqCst) {
            return;
        }
        info!("server shutting down");
        if let Some(p) = self.persister.lock().unwrap().take() {
            p.stop_and_final_save(&self.config.state_dir, &self.sessions);
        }
        let sessions: Vec<Arc<session::Session>> =
            self.sessions.lock().unwrap().drain().map(|(_, v)| v).collect();
        for session in sessions {
            session.close();
        }
        let _ = std::fs::remove_file(&self.config.socket_path);
        if let Some(parent) = self.config.socket_path.parent() {
            let _ = std::fs::remove_file(parent.join(consts::PID_FILE_NAME));
        }
    }

    fn lookup(&self, name: &str) -> Option<Arc<session::Session>> {
        self.sessions.lock().unwrap().get(name).cloned()
    }

    // -----------------------------------------------------------------
    // session lifecycle
    // -----------------------------------------------------------------

    /// Resolves a `Create`'s target session: reuses a live session of that
    /// name, otherwise attempts to restore persisted state and spawns a
    /// fresh one. Two racing callers for the same unoccupied name may both
    /// spawn a child; the loser's duplicate is closed and the winner is
    /// returned instead, still reported as `Created`.
    fn ensure_session(
        self: &Arc<Self>,
        name: &str,
        command: Vec<String>,
        env: Vec<String>,
        cwd: Option<String>,
    ) -> anyhow::Result<(Arc<session::Session>, CreateOutcome)> {
        let name = if name.is_empty() {
            let sessions = Arc::clone(&self.sessions);
            names::generate(&move |candidate| sessions.lock().unwrap().contains_key(candidate))
        } else {
            name.to_string()
        };

        if let Some(existing) = self.lookup(&name) {
            if !existing.is_done() {
                self.dead.lock().unwrap().remove(&name);
                return Ok((existing, CreateOutcome::Existing));
            }
        }

        let restore = persister::load_state(&self.config.state_dir, &name).unwrap_or_else(|e| {
            warn!("loading persisted state for {}: {}", name, e);
            None
        });
        let params = session::SpawnParams { name: name.clone(), command, env, cwd };
        let fresh = session::Session::spawn(params, self.config.session.clone(), restore)
            .context("spawning session")?;

        let winner = {
            let mut sessions = self.sessions.lock().unwrap();
            let keep_existing = sessions.get(&name).map(|s| !s.is_done()).unwrap_or(false);
            if keep_existing {
                sessions.get(&name).cloned()
            } else {
                sessions.insert(name.clone(), Arc::clone(&fresh));
                None
            }
        };

        if let Some(existing) = winner {
            debug!("lost ensure_session race for {}, closing duplicate", name);
            fresh.close();
            return Ok((existing, CreateOutcome::Existing));
        }

        if let Err(e) = persister::clean_state(&self.config.state_dir, &name) {
            debug!("cleaning stale persisted state for {}: {}", name, e);
        }
        self.spawn_watcher(Arc::clone(&fresh));
        Ok((fresh, CreateOutcome::Created))
    }

    /// Spawns the thread that waits for a session's child to exit and
    /// begins its dead-retention window once it does.
    fn spawn_watcher(self: &Arc<Self>, session: Arc<session::Session>) {
        let server = Arc::clone(self);
        thread::spawn(move || {
            let exit_code = session.wait_exit();
            info!("session {} exited with code {}", session.name, exit_code);
            server.on_session_done(&session);
        });
    }

    fn on_session_done(self: &Arc<Self>, session: &Arc<session::Session>) {
        let name = session.name.clone();
        if let Err(e) = self.hooks.on_shell_disconnect(&name) {
            warn!("on_shell_disconnect hook for {}: {:?}", name, e);
        }
        // Capture the final screen before the retention clock starts so a
        // restore during the window (or after a restart) is never stale.
        persister::save_one(&self.config.state_dir, &name, session);

        if self.config.dead_session_ttl.is_zero() {
            self.reap_dead_session(&name);
            return;
        }
        let deadline = Instant::now() + self.config.dead_session_ttl;
        self.dead.lock().unwrap().insert(name.clone(), deadline);
        self.schedule_reap(ReapKind::DeadSession, name, deadline);
    }

    fn reap_dead_session(self: &Arc<Self>, name: &str) {
        let candidate = self.sessions.lock().unwrap().get(name).cloned();
        let Some(session) = candidate else {
            self.dead.lock().unwrap().remove(name);
            return;
        };
        if !session.is_done() {
            // A new session was created under this name before the timer
            // fired; the old dead-session record no longer applies.
            return;
        }
        self.sessions.lock().unwrap().remove(name);
        self.dead.lock().unwrap().remove(name);
        debug!("reaping dead session {}", name);
        session.close();
        self.maybe_auto_exit();
    }

    /// Forcibly reaps every currently-dead session, bypassing the
    /// retention timer. Returns the number removed.
    fn prune_dead_sessions(self: &Arc<Self>) -> u32 {
        let dead_names: Vec<String> = self
            .sessions
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, s)| s.is_done())
            .map(|(k, _)| k.clone())
            .collect();
        let mut count = 0;
        for name in dead_names {
            let removed = self.sessions.lock().unwrap().remove(&name);
            self.dead.lock().unwrap().remove(&name);
            if let Some(session) = removed {
                session.close();
                count += 1;
            }
        }
        self.maybe_auto_exit();
        count
    }

    fn maybe_auto_exit(self: &Arc<Self>) {
        if self.config.auto_exit && self.sessions.lock().unwrap().is_empty() {
            info!("auto_exit: no sessions remain, shutting down");
            self.shutdown();
            std::process::exit(0);
        }
    }

    // -----------------------------------------------------------------
    // attach leases
    // -----------------------------------------------------------------

    fn issue_lease(self: &Arc<Self>, session_name: &str) -> (String, u64) {
        let token: String =
            rand::thread_rng().sample_iter(&Alphanumeric).take(consts::ATTACH_TOKEN_LEN).map(char::from).collect();
        let ttl = self.config.attach_lease_ttl;
        let expires_at = Instant::now() + ttl;
        let expires_at_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
            + ttl.as_millis() as u64;

        self.leases
            .lock()
            .unwrap()
            .insert(token.clone(), Lease { session_name: session_name.to_string(), expires_at });
        self.schedule_reap(ReapKind::Lease, token.clone(), expires_at);
        self.extend_dead_timer(session_name, expires_at);

        (token, expires_at_ms)
    }

    /// Consumes an outstanding lease. A lease is valid at most once, must
    /// name the session being attached to, and must not have expired.
    fn consume_lease(self: &Arc<Self>, token: &str, session_name: &str) -> anyhow::Result<()> {
        let lease = self.leases.lock().unwrap().remove(token);
        match lease {
            Some(l) if l.session_name == session_name && l.expires_at > Instant::now() => {
                self.extend_dead_timer(session_name, l.expires_at);
                Ok(())
            }
            Some(_) => Err(anyhow!("attach token does not match this session, or has expired")),
            None => Err(anyhow!("attach token is unknown, already used, or expired")),
        }
    }

    fn expire_lease(self: &Arc<Self>, token: &str) {
        self.leases.lock().unwrap().remove(token);
    }

    /// While the session is live this is a no-op. While dead, the
    /// retention deadline is pushed out to `lease_expiry` if that's later
    /// than the current deadline, and the reaper is re-armed accordingly.
    fn extend_dead_timer(self: &Arc<Self>, session_name: &str, lease_expiry: Instant) {
        let mut dead = self.dead.lock().unwrap();
        if let Some(&current_deadline) = dead.get(session_name) {
            if lease_expiry > current_deadline {
                dead.insert(session_name.to_string(), lease_expiry);
                drop(dead);
                self.schedule_reap(ReapKind::DeadSession, session_name.to_string(), lease_expiry);
            }
        }
    }

    fn schedule_reap(&self, kind: ReapKind, key: String, at: Instant) {
        let _ = self.reap_tx.send(ReapRequest { kind, key, at });
    }

    // -----------------------------------------------------------------
    // request dispatch
    // -----------------------------------------------------------------

    fn handle_conn(self: &Arc<Self>, mut stream: UnixStream) -> anyhow::Result<()> {
        check_peer(&stream).context("rejecting connection")?;

        let client_handshake = Handshake::read_from(&mut stream).context("reading handshake")?;
        let our_handshake = Handshake { version: PROTOCOL_VERSION, revision: PROTOCOL_REVISION.to_string() };
        our_handshake.write_to(&mut stream).context("writing handshake")?;
        if client_handshake.version != PROTOCOL_VERSION {
            return Err(anyhow!(
                "client protocol version {} does not match ours ({})",
                client_handshake.version,
                PROTOCOL_VERSION
            ));
        }

        let mut attached: Option<(Arc<session::Session>, String)> = None;
        let result = self.dispatch_loop(&mut stream, &client_handshake.revision, &mut attached);

        if let Some((session, client_id)) = attached.take() {
            if let Err(e) = session.detach_self(&client_id) {
                debug!("detaching client {} of {} on connection close: {:?}", client_id, session.name, e);
            }
            if let Err(e) = self.hooks.on_client_disconnect(&session.name) {
                warn!("on_client_disconnect hook for {}: {:?}", session.name, e);
            }
        }

        result
    }

    fn dispatch_loop(
        self: &Arc<Self>,
        stream: &mut UnixStream,
        client_version: &str,
        attached: &mut Option<(Arc<session::Session>, String)>,
    ) -> anyhow::Result<()> {
        loop {
            let req = match Request::read_from(stream) {
                Ok(r) => r,
                Err(e) => {
                    debug!("connection read ended: {}", e);
                    return Ok(());
                }
            };

            match req {
                Request::Create(req) => {
                    let resp = match self.dispatch_create(&req) {
                        Ok(resp) => resp,
                        Err(e) => Response::Error { message: e.to_string() },
                    };
                    resp.write_to(stream).context("writing Created response")?;
                }
                Request::Attach(req) => {
                    let conn_for_attach = stream.try_clone().context("cloning connection for attach")?;
                    match self.dispatch_attach(&req, client_version, conn_for_attach) {
                        Ok((session, client_id, exit_code)) => {
                            *attached = Some((session, client_id));
                            if let Some(code) = exit_code {
                                Response::Exited { exit_code: code }.write_to(stream)?;
                            }
                        }
                        Err(e) => {
                            Response::Error { message: e.to_string() }.write_to(stream)?;
                        }
                    }
                }
                Request::Input { data } => {
                    if let Some((session, client_id)) = attached.as_ref() {
                        if let Err(e) = session.input(client_id, &data) {
                            warn!("forwarding input to {}: {}", session.name, e);
                        }
                    }
                }
                Request::Resize(size) => {
                    if let Some((session, client_id)) = attached.as_ref() {
                        if let Err(e) = session.resize(client_id, size) {
                            warn!("resizing {}: {}", session.name, e);
                        }
                    }
                }
                Request::Detach(req) => {
                    let resp = self.dispatch_detach(&req, attached);
                    resp.write_to(stream).context("writing Detach response")?;
                }
                Request::List(req) => {
                    self.dispatch_list(&req).write_to(stream).context("writing Sessions response")?;
                }
                Request::Kill { name } => {
                    self.dispatch_kill(&name).write_to(stream).context("writing Kill response")?;
                }
                Request::Send { name, data } => {
                    let resp = match self.lookup(&name) {
                        Some(session) => match session.write_input(&data) {
                            Ok(()) => Response::Ok,
                            Err(e) => Response::Error { message: e.to_string() },
                        },
                        None => Response::Error { message: format!("session {:?} not found", name) },
                    };
                    resp.write_to(stream).context("writing Send response")?;
                }
                Request::SendKey(req) => {
                    let resp = match self.lookup(&req.name) {
                        Some(session) => match session.send_key(req.key_code, req.mods) {
                            Ok(()) => Response::Ok,
                            Err(e) => Response::Error { message: e.to_string() },
                        },
                        None => Response::Error { message: format!("session {:?} not found", req.name) },
                    };
                    resp.write_to(stream).context("writing SendKey response")?;
                }
                Request::Dump(req) => {
                    let resp = match self.lookup(&req.name) {
                        Some(session) => Response::DumpResponse { data: session.dump(req.format) },
                        None => Response::Error { message: format!("session {:?} not found", req.name) },
                    };
                    resp.write_to(stream).context("writing DumpResponse")?;
                }
                Request::Prune => {
                    let count = self.prune_dead_sessions();
                    Response::PruneResponse { count }.write_to(stream).context("writing PruneResponse")?;
                }
                Request::Status { session_name } => {
                    self.dispatch_status(session_name.as_deref())
                        .write_to(stream)
                        .context("writing StatusResponse")?;
                }
            }
        }
    }

    fn dispatch_create(self: &Arc<Self>, req: &hauntty_protocol::CreateRequest) -> anyhow::Result<Response> {
        if !req.name.is_empty() && req.mode == CreateMode::RequireNew {
            if let Some(existing) = self.lookup(&req.name) {
                if !existing.is_done() {
                    if let Err(e) = self.hooks.on_busy(&req.name) {
                        warn!("on_busy hook for {}: {:?}", req.name, e);
                    }
                    return Err(anyhow!("session {:?} already exists", req.name));
                }
            }
        }

        let (session, outcome) =
            self.ensure_session(&req.name, req.command.clone(), req.env.clone(), req.cwd.clone())?;

        if req.mode == CreateMode::RequireNew && outcome == CreateOutcome::Existing {
            if let Err(e) = self.hooks.on_busy(&session.name) {
                warn!("on_busy hook for {}: {:?}", session.name, e);
            }
            return Err(anyhow!("session {:?} already exists", session.name));
        }

        if outcome == CreateOutcome::Created {
            if let Err(e) = self.hooks.on_new_session(&session.name) {
                warn!("on_new_session hook for {}: {:?}", session.name, e);
            }
        }

        let (attach_token, attach_token_expires_at_ms) = self.issue_lease(&session.name);

        Ok(Response::Created(CreatedResponse {
            session_name: session.name.clone(),
            pid: session.pid as u32,
            outcome,
            attach_token,
            attach_token_expires_at_ms,
        }))
    }

    /// Returns the session, the new client's id, and — if the session had
    /// already exited before this attach landed — its exit code so the
    /// caller can immediately follow `Attached` with `Exited`.
    fn dispatch_attach(
        self: &Arc<Self>,
        req: &hauntty_protocol::AttachRequest,
        client_version: &str,
        conn: UnixStream,
    ) -> anyhow::Result<(Arc<session::Session>, String, Option<i32>)> {
        if let Some(token) = req.attach_token.as_deref() {
            if !token.is_empty() {
                self.consume_lease(token, &req.name)?;
            }
        }

        let session =
            self.lookup(&req.name).ok_or_else(|| anyhow!("session {:?} not found", req.name))?;
        let was_live = !session.is_done();

        let client_id = session.attach(req, client_version.to_string(), conn)?;

        if was_live {
            if let Err(e) = self.hooks.on_reattach(&session.name) {
                warn!("on_reattach hook for {}: {:?}", session.name, e);
            }
        }

        let exit_code = if session.is_done() { Some(session.exit_code().unwrap_or(1)) } else { None };
        Ok((session, client_id, exit_code))
    }

    fn dispatch_detach(
        self: &Arc<Self>,
        req: &hauntty_protocol::DetachRequest,
        attached: &mut Option<(Arc<session::Session>, String)>,
    ) -> Response {
        let session = match self.lookup(&req.name) {
            Some(s) => s,
            None => return Response::Error { message: format!("session {:?} not found", req.name) },
        };

        let result = if req.target_client_id.is_none() && req.target_tty.is_none() {
            if let Some((attached_session, client_id)) = attached.as_ref() {
                if attached_session.name == req.name {
                    let client_id = client_id.clone();
                    let r = session.detach_self(&client_id);
                    if r.is_ok() {
                        *attached = None;
                    }
                    r.map(|()| true)
                } else {
                    session.detach_target(None, None)
                }
            } else {
                session.detach_target(None, None)
            }
        } else {
            let r = session.detach_target(req.target_client_id.as_deref(), req.target_tty.as_deref());
            if matches!(r, Ok(true)) {
                if let Some((attached_session, client_id)) = attached.as_ref() {
                    if attached_session.name == req.name
                        && req.target_client_id.as_deref() == Some(client_id.as_str())
                    {
                        *attached = None;
                    }
                }
            }
            r
        };

        match result {
            Ok(true) => {
                if let Err(e) = self.hooks.on_client_disconnect(&session.name) {
                    warn!("on_client_disconnect hook for {}: {:?}", session.name, e);
                }
                Response::Ok
            }
            Ok(false) => Response::Error { message: "no matching client to detach".to_string() },
            Err(e) => Response::Error { message: e.to_string() },
        }
    }

    fn dispatch_list(self: &Arc<Self>, req: &hauntty_protocol::ListRequest) -> Response {
        let mut entries = Vec::new();
        let mut seen = HashSet::new();
        {
            let sessions = self.sessions.lock().unwrap();
            for (name, session) in sessions.iter() {
                seen.insert(name.clone());
                match query_session_metadata(session, req.include_clients) {
                    Some(meta) => entries.push(SessionEntry {
                        name: name.clone(),
                        state: if session.is_done() { SessionState::Dead } else { SessionState::Running },
                        cols: meta.size.cols,
                        rows: meta.size.rows,
                        pid: session.pid as u32,
                        created_at_unix_secs: session.created_at_unix_secs,
                        cwd: meta.cwd,
                        clients: meta.clients,
                    }),
                    None => warn!(
                        "session {:?} did not answer a List query within {:?}, omitting from results",
                        name, consts::EMULATOR_QUERY_TIMEOUT
                    ),
                }
            }
        }
        match persister::list_dead_sessions(&self.config.state_dir, &seen) {
            Ok(dead_names) => {
                for name in dead_names {
                    if let Ok(Some(state)) = persister::load_state(&self.config.state_dir, &name) {
                        entries.push(SessionEntry {
                            name,
                            state: SessionState::Dead,
                            cols: state.cols,
                            rows: state.rows,
                            pid: 0,
                            created_at_unix_secs: state.saved_at_unix_secs,
                            cwd: None,
                            clients: if req.include_clients { Some(Vec::new()) } else { None },
                        });
                    }
                }
            }
            Err(e) => warn!("listing dead sessions from disk: {}", e),
        }
        Response::Sessions { entries }
    }

    fn dispatch_kill(self: &Arc<Self>, name: &str) -> Response {
        match self.lookup(name) {
            Some(session) => {
                session.signal_hup();
                Response::Ok
            }
            None => Response::Error { message: format!("session {:?} not found", name) },
        }
    }

    fn dispatch_status(self: &Arc<Self>, session_name: Option<&str>) -> Response {
        let (running_count, dead_count) = {
            let sessions = self.sessions.lock().unwrap();
            let dead = sessions.values().filter(|s| s.is_done()).count();
            (sessions.len() - dead, dead)
        };
        let daemon = DaemonStatus {
            pid: std::process::id(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            socket_path: self.config.socket_path.to_string_lossy().into_owned(),
            running_count: running_count as u32,
            dead_count: dead_count as u32,
            version: PROTOCOL_REVISION.to_string(),
        };
        let session = session_name.and_then(|name| {
            self.lookup(name).map(|s| {
                let size = s.current_size();
                SessionEntry {
                    name: s.name.clone(),
                    state: if s.is_done() { SessionState::Dead } else { SessionState::Running },
                    cols: size.cols,
                    rows: size.rows,
                    pid: s.pid as u32,
                    created_at_unix_secs: s.created_at_unix_secs,
                    cwd: s.cwd(),
                    clients: Some(s.clients_snapshot()),
                }
            })
        });
        Response::StatusResponse(StatusResponse { daemon, session })
    }
}

struct SessionMetadata {
    size: hauntty_protocol::WinSize,
    cwd: Option<String>,
    clients: Option<Vec<hauntty_protocol::ClientEntry>>,
}

/// Gathers one session's `List` fields off of its own locks and `/proc`
/// lookup, bounded by `consts::EMULATOR_QUERY_TIMEOUT`. A session whose
/// pumps are pegged (e.g. a client holding the output-channel mutex under a
/// flood) can't stall the whole `List` response; it's just dropped from
/// this round's results.
fn query_session_metadata(
    session: &Arc<session::Session>,
    include_clients: bool,
) -> Option<SessionMetadata> {
    let session = Arc::clone(session);
    let (tx, rx) = crossbeam_channel::bounded(1);
    thread::spawn(move || {
        let meta = SessionMetadata {
            size: session.current_size(),
            cwd: session.cwd(),
            clients: if include_clients { Some(session.clients_snapshot()) } else { None },
        };
        let _ = tx.send(meta);
    });
    crossbeam_channel::select! {
        recv(rx) -> result => result.ok(),
        default(consts::EMULATOR_QUERY_TIMEOUT) => None,
    }
}

/// Verifies the connecting peer runs as the same uid as the daemon. Unlike
/// the teacher, this does not additionally compare executable paths: that
/// check is a soft, warn-only heuristic upstream and isn't part of this
/// daemon's trust model.
fn check_peer(sock: &UnixStream) -> anyhow::Result<()> {
    use nix::sys::socket;

    let peer_creds = socket::getsockopt(sock, socket::sockopt::PeerCredentials)
        .context("reading peer credentials from socket")?;
    let peer_uid = nix::unistd::Uid::from_raw(peer_creds.uid());
    let self_uid = nix::unistd::Uid::current();
    if peer_uid != self_uid {
        return Err(anyhow!("hauntty prohibits connections across users"));
    }
    Ok(())
}

/// Waits on the reap channel and the earliest-scheduled timer, firing
/// whichever comes first. Generalizes the teacher's single-purpose ttl
/// reaper to carry both dead-session and lease timers on one heap,
/// disambiguated by `ReapKind`.
fn run_reaper(server: Arc<Server>, rx: crossbeam_channel::Receiver<ReapRequest>) {
    let mut heap: BinaryHeap<Reapable> = BinaryHeap::new();
    let mut gens: HashMap<(u8, String), u64> = HashMap::new();

    let schedule = |heap: &mut BinaryHeap<Reapable>, gens: &mut HashMap<(u8, String), u64>, req: ReapRequest| {
        let slot = gens.entry((req.kind.tag(), req.key.clone())).or_insert(0);
        *slot += 1;
        heap.push(Reapable { kind: req.kind, key: req.key, gen: *slot, at: req.at });
    };

    loop {
        if heap.is_empty() {
            match rx.recv() {
                Ok(req) => schedule(&mut heap, &mut gens, req),
                Err(_) => return,
            }
            continue;
        }

        let wake_at = heap.peek().unwrap().at;
        crossbeam_channel::select! {
            recv(rx) -> msg => match msg {
                Ok(req) => schedule(&mut heap, &mut gens, req),
                Err(_) => return,
            },
            recv(crossbeam_channel::at(wake_at)) -> _ => {
                let entry = heap.pop().unwrap();
                let current_gen = gens.get(&(entry.kind.tag(), entry.key.clone())).copied().unwrap_or(0);
                if current_gen != entry.gen {
                    // Superseded by a later reschedule (e.g. a lease extending
                    // the dead timer); drop this stale wakeup.
                    continue;
                }
                match entry.kind {
                    ReapKind::DeadSession => server.reap_dead_session(&entry.key),
                    ReapKind::Lease => server.expire_lease(&entry.key),
                }
            }
        }
    }
}
