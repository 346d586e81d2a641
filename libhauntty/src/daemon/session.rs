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

//! The per-session engine: spawns the child under a PTY, runs the read/feed
//! pumps, and multiplexes a session's output to however many clients are
//! attached. Grounded in `daemon/server.rs`'s `spawn_subshell` and
//! `child_watcher` for the fork/wait half, and in `session_restore.rs` for
//! the screen-dump half.

use std::{
    io,
    os::unix::{net::UnixStream, process::CommandExt},
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use anyhow::{anyhow, Context};
use hauntty_protocol::{AttachRequest, ClientEntry, ClientsChanged, Response, WinSize};
use tracing::{debug, error, info, instrument, warn};

use super::{exit_notify::ExitNotifier, persister::PersistedState};
use crate::{
    config::SessionConfig,
    consts,
    emulator::{self, DumpFormat, Emulator},
    tty, user,
};

/// Default PTY geometry for a session that hasn't been attached to yet.
/// `Create` carries no geometry; the first `Attach` re-arbitrates it.
const INITIAL_SIZE: WinSize = WinSize { cols: 80, rows: 24, xpixel: 0, ypixel: 0 };

/// Parameters needed to spawn a fresh child under a new PTY.
pub struct SpawnParams {
    pub name: String,
    pub command: Vec<String>,
    pub env: Vec<String>,
    pub cwd: Option<String>,
}

/// A connected client's identity, independent of its transport.
#[derive(Debug, Clone)]
pub struct AttachedClient {
    pub id: String,
    pub tty: Option<String>,
    pub read_only: bool,
    pub version: String,
}

/// Snapshot handed to the persister; mirrors `PersistedState` without the
/// save timestamp, which the persister stamps itself.
pub struct PersistSnapshot {
    pub cols: u16,
    pub rows: u16,
    pub cursor_row: u32,
    pub cursor_col: u32,
    pub is_alt_screen: bool,
    pub vt_data: Vec<u8>,
}

struct SizeState {
    cols: u16,
    rows: u16,
    xpixel: u16,
    ypixel: u16,
}

/// One attached client's connection state. `output_tx` carries fully
/// pre-encoded response frames (`Output`, `ClientsChanged`, the final
/// `Exited`) so every message destined for this client serializes through
/// a single bounded channel in the order it was produced.
struct ClientSlot {
    client: AttachedClient,
    desired: WinSize,
    output_tx: crossbeam_channel::Sender<Vec<u8>>,
    conn: UnixStream,
    write_thread: Option<JoinHandle<()>>,
}

/// A live (or recently-dead) terminal session: one PTY, one child process
/// tree, one `Emulator`, and zero or more attached clients.
///
/// Two locks guard mutable state, never held together: `size` guards the
/// session's current geometry, `clients` guards the attached-client list.
pub struct Session {
    pub name: String,
    pub pid: libc::pid_t,
    pub created_at: Instant,
    pub created_at_unix_secs: u64,
    config: SessionConfig,
    size: Mutex<SizeState>,
    clients: Mutex<Vec<ClientSlot>>,
    master_fd: i32,
    /// Keeps the PTY master open and the forked child reachable; its `Drop`
    /// impl closes the master fd when this session is torn down.
    _fork: shpool_pty::fork::Fork,
    emulator: Mutex<Emulator>,
    done: Arc<ExitNotifier>,
    client_id_counter: AtomicU64,
    cwd_hint: Option<String>,
    /// Shell-integration scratch directory, if one was ever populated.
    /// Setting it up is out of scope here; this field only exists so
    /// teardown can remove it if a future embedder populates it.
    shell_integration_tmp_dir: Option<PathBuf>,
}

impl Session {
    /// Spawns a new child under a fresh PTY. If `restore` is `Some`, the
    /// emulator is primed by replaying the persisted VT bytes before the
    /// session is usable, so a client attaching immediately after restore
    /// sees the screen as it was before the daemon restarted.
    #[instrument(skip(params, config, restore), fields(session = %params.name))]
    pub fn spawn(
        params: SpawnParams,
        config: SessionConfig,
        restore: Option<PersistedState>,
    ) -> anyhow::Result<Arc<Session>> {
        let forwarded_env = parse_env_pairs(&params.env);
        let is_login_shell = params.command.is_empty();
        let argv = resolve_argv(&params.command, &forwarded_env);

        let info = user::info().context("resolving user info")?;
        let start_dir = params.cwd.clone().unwrap_or_else(|| info.home_dir.clone());

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        cmd.current_dir(&start_dir);
        cmd.stdin(Stdio::inherit()).stdout(Stdio::inherit()).stderr(Stdio::inherit());
        cmd.env_clear();
        for (k, v) in &forwarded_env {
            cmd.env(k, v);
        }
        cmd.env(consts::SESSION_NAME_ENV, &params.name);
        if is_login_shell {
            let basename =
                Path::new(&argv[0]).file_name().and_then(|f| f.to_str()).unwrap_or(&argv[0]);
            cmd.arg0(format!("-{}", basename));
        }

        let mut fork = shpool_pty::fork::Fork::from_ptmx().context("forking pty")?;
        if let Ok(_slave) = fork.is_child() {
            // We are the child. Detach from any fds above stderr that
            // `env_clear`/`Stdio::inherit` left open, then exec.
            for fd in (consts::STDERR_FD + 1)..1024 {
                unsafe {
                    libc::close(fd);
                }
            }
            let err = cmd.exec();
            eprintln!("hauntty: exec of {:?} failed: {:?}", argv, err);
            std::process::exit(1);
        }

        let master = fork.is_parent().context("expected parent side of pty fork")?;
        let master_fd = master.raw_fd().ok_or_else(|| anyhow!("pty master has no fd"))?;
        let child_pid =
            fork.child_pid().ok_or_else(|| anyhow!("pty fork reported no child pid"))?;

        let initial_size = restore.as_ref().map(|s| (s.cols, s.rows)).unwrap_or((
            INITIAL_SIZE.cols,
            INITIAL_SIZE.rows,
        ));
        tty::Size { rows: initial_size.1, cols: initial_size.0, xpixel: 0, ypixel: 0 }
            .set_fd(master_fd)
            .context("setting initial pty size")?;

        let done = Arc::new(ExitNotifier::new());
        spawn_child_watcher(child_pid, Arc::clone(&done));

        let mut emu = Emulator::new(initial_size.0, initial_size.1, config.scrollback_lines);
        if let Some(state) = &restore {
            emu.replay(&state.vt_data);
            if state.is_alt_screen {
                emu.replay(b"\x1b[?1049l");
            }
            emu.replay(b"\x1b[!p");
            info!(
                session = %params.name,
                "restored session from persisted state saved at {}", state.saved_at_unix_secs
            );
        }

        let session = Arc::new(Session {
            name: params.name,
            pid: child_pid,
            created_at: Instant::now(),
            created_at_unix_secs: now_unix(),
            config,
            size: Mutex::new(SizeState {
                cols: initial_size.0,
                rows: initial_size.1,
                xpixel: 0,
                ypixel: 0,
            }),
            clients: Mutex::new(Vec::new()),
            master_fd,
            _fork: fork,
            emulator: Mutex::new(emu),
            done,
            client_id_counter: AtomicU64::new(1),
            cwd_hint: params.cwd,
            shell_integration_tmp_dir: None,
        });

        let (feed_tx, feed_rx) = crossbeam_channel::bounded::<Vec<u8>>(0);
        {
            let s = Arc::clone(&session);
            thread::spawn(move || feed_pump(s, feed_rx));
        }
        {
            let s = Arc::clone(&session);
            thread::spawn(move || read_pump(s, feed_tx));
        }

        Ok(session)
    }

    /// Attaches a new client, arbitrating the session's geometry over the
    /// attached set (including this one) before dumping the screen, so the
    /// dump and the `Attached` response both reflect the post-join size.
    /// Writes the `Attached` response onto `conn` itself and only then
    /// starts this client's write pump, guaranteeing no `Output` or
    /// `ClientsChanged` frame can reach the client ahead of it.
    #[instrument(skip(self, req, conn), fields(session = %self.name))]
    pub fn attach(
        self: &Arc<Self>,
        req: &AttachRequest,
        client_version: String,
        mut conn: UnixStream,
    ) -> anyhow::Result<String> {
        let client_id = self.client_id_counter.fetch_add(1, Ordering::Relaxed).to_string();

        let mut dims: Vec<WinSize> = {
            let clients = self.clients.lock().unwrap();
            clients.iter().map(|c| c.desired).collect()
        };
        dims.push(req.size);
        let new_size = self.config.resize_policy.arbitrate(&dims);
        self.apply_size_if_changed(new_size)?;

        let dump = {
            let emu = self.emulator.lock().unwrap();
            emu.dump(DumpFormat::from_byte(0b0000_0001))
        };
        let size = self.current_size();

        let resp = hauntty_protocol::AttachedResponse {
            session_name: self.name.clone(),
            cols: size.cols,
            rows: size.rows,
            pid: self.pid as u32,
            client_id: client_id.clone(),
            screen_dump: dump.vt,
            cursor_row: dump.cursor_row,
            cursor_col: dump.cursor_col,
            is_alternate_screen: dump.is_alt_screen,
        };
        Response::Attached(resp).write_to(&mut conn).context("writing Attached response")?;

        let write_conn = conn.try_clone().context("cloning client connection for write pump")?;
        let (output_tx, output_rx) =
            crossbeam_channel::bounded(self.config.client_channel_capacity);
        let write_thread = {
            let id = client_id.clone();
            thread::spawn(move || write_pump(write_conn, output_rx, id))
        };

        let client = AttachedClient {
            id: client_id.clone(),
            tty: req.client_tty.clone(),
            read_only: req.read_only,
            version: client_version,
        };

        let count = {
            let mut clients = self.clients.lock().unwrap();
            clients.push(ClientSlot {
                client,
                desired: req.size,
                output_tx,
                conn,
                write_thread: Some(write_thread),
            });
            clients.len()
        };

        let size = self.current_size();
        self.broadcast_clients_changed(count as u16, size.cols, size.rows);

        Ok(client_id)
    }

    /// Forwards a client's input to the pty, unless that client is
    /// read-only, in which case the input is silently dropped.
    pub fn input(&self, client_id: &str, data: &[u8]) -> anyhow::Result<()> {
        let read_only = {
            let clients = self.clients.lock().unwrap();
            match clients.iter().find(|c| c.client.id == client_id) {
                Some(c) => c.client.read_only,
                None => return Ok(()),
            }
        };
        if read_only {
            debug!("ignoring input from read-only client {} on session {}", client_id, self.name);
            return Ok(());
        }
        self.write_input(data)
    }

    /// Encodes a logical key press and forwards it exactly like `input`.
    pub fn send_key(&self, key_code: u32, mods: u32) -> anyhow::Result<()> {
        let bytes = emulator::encode_key(key_code, mods);
        self.write_input(&bytes)
    }

    /// Writes raw bytes to the pty master, used for both attributed client
    /// input and the name-addressed `Send`/`SendKey` requests, which bypass
    /// the attach/client model entirely.
    pub fn write_input(&self, data: &[u8]) -> anyhow::Result<()> {
        let mut remaining = data;
        while !remaining.is_empty() {
            match pty_write(self.master_fd, remaining) {
                Ok(0) => break,
                Ok(n) => remaining = &remaining[n..],
                Err(e) => return Err(anyhow!("writing to pty master: {}", e)),
            }
        }
        Ok(())
    }

    /// Updates one client's desired geometry and re-arbitrates the
    /// session's size over the whole attached set.
    pub fn resize(&self, client_id: &str, size: WinSize) -> anyhow::Result<()> {
        {
            let mut clients = self.clients.lock().unwrap();
            match clients.iter_mut().find(|c| c.client.id == client_id) {
                Some(c) => c.desired = size,
                None => return Ok(()),
            }
        }
        self.rearbitrate()
    }

    /// Removes the calling client without closing its connection, per the
    /// anonymous-detach variant of the `Detach` request.
    pub fn detach_self(&self, client_id: &str) -> anyhow::Result<()> {
        self.remove_client(|c| c.id == client_id, false)
    }

    /// Removes and disconnects a client identified by id or tty, or — if
    /// neither is given — the sole attached client if there is exactly one.
    /// Returns whether a client was found and removed.
    pub fn detach_target(
        &self,
        target_client_id: Option<&str>,
        target_tty: Option<&str>,
    ) -> anyhow::Result<bool> {
        let target_id = match (target_client_id, target_tty) {
            (Some(id), _) if !id.is_empty() => Some(id.to_string()),
            (_, Some(target_tty)) if !target_tty.is_empty() => {
                let clients = self.clients.lock().unwrap();
                clients.iter().find(|c| c.client.tty.as_deref() == Some(target_tty)).map(|c| c.client.id.clone())
            }
            _ => {
                let clients = self.clients.lock().unwrap();
                if clients.len() == 1 {
                    Some(clients[0].client.id.clone())
                } else {
                    None
                }
            }
        };
        let Some(target_id) = target_id else {
            return Ok(false);
        };
        self.remove_client(|c| c.id == target_id, true)?;
        Ok(true)
    }

    fn remove_client(&self, predicate: impl Fn(&AttachedClient) -> bool, close_connection: bool) -> anyhow::Result<()> {
        let removed = {
            let mut clients = self.clients.lock().unwrap();
            clients.iter().position(|c| predicate(&c.client)).map(|i| clients.remove(i))
        };
        if let Some(slot) = removed {
            if close_connection {
                let _ = slot.conn.shutdown(std::net::Shutdown::Both);
            }
            drop(slot.output_tx);
            if let Some(h) = slot.write_thread {
                let _ = h.join();
            }
        }
        self.rearbitrate()?;
        let size = self.current_size();
        let count = self.clients.lock().unwrap().len();
        self.broadcast_clients_changed(count as u16, size.cols, size.rows);
        Ok(())
    }

    fn rearbitrate(&self) -> anyhow::Result<()> {
        let dims: Vec<WinSize> = {
            let clients = self.clients.lock().unwrap();
            if clients.is_empty() {
                return Ok(());
            }
            clients.iter().map(|c| c.desired).collect()
        };
        let new_size = self.config.resize_policy.arbitrate(&dims);
        self.apply_size_if_changed(new_size)
    }

    fn apply_size_if_changed(&self, new_size: WinSize) -> anyhow::Result<()> {
        let changed = {
            let mut size = self.size.lock().unwrap();
            if size.cols == new_size.cols && size.rows == new_size.rows {
                false
            } else {
                size.cols = new_size.cols;
                size.rows = new_size.rows;
                size.xpixel = new_size.xpixel;
                size.ypixel = new_size.ypixel;
                true
            }
        };
        if changed {
            tty::Size {
                rows: new_size.rows,
                cols: new_size.cols,
                xpixel: new_size.xpixel,
                ypixel: new_size.ypixel,
            }
            .set_fd(self.master_fd)
            .context("resizing pty")?;
            if let Err(e) =
                nix::sys::signal::killpg(nix::unistd::Pid::from_raw(self.pid), nix::sys::signal::Signal::SIGWINCH)
            {
                warn!("sending SIGWINCH to session {} (pid {}): {}", self.name, self.pid, e);
            }
            self.emulator.lock().unwrap().resize(new_size.cols, new_size.rows);
            debug!("resized session {} to {}x{}", self.name, new_size.cols, new_size.rows);
        }
        Ok(())
    }

    /// Renders the screen in the format the `Dump` request asked for.
    pub fn dump(&self, format_byte: u8) -> Vec<u8> {
        self.emulator.lock().unwrap().dump(DumpFormat::from_byte(format_byte)).vt
    }

    /// Full-fidelity snapshot for the persister: vt-safe rendering with
    /// scrollback included, so a restored session looks the same as it did
    /// the moment before the daemon went down.
    pub fn dump_for_persist(&self) -> PersistSnapshot {
        let emu = self.emulator.lock().unwrap();
        let dump = emu.dump(DumpFormat::from_byte(0b0010_0001));
        let (cols, rows) = emu.size();
        PersistSnapshot {
            cols,
            rows,
            cursor_row: dump.cursor_row,
            cursor_col: dump.cursor_col,
            is_alt_screen: dump.is_alt_screen,
            vt_data: dump.vt,
        }
    }

    pub fn current_size(&self) -> WinSize {
        let s = self.size.lock().unwrap();
        WinSize { cols: s.cols, rows: s.rows, xpixel: s.xpixel, ypixel: s.ypixel }
    }

    pub fn cwd(&self) -> Option<String> {
        emulator::get_pwd(self.pid).or_else(|| self.cwd_hint.clone())
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().unwrap().len()
    }

    pub fn clients_snapshot(&self) -> Vec<ClientEntry> {
        self.clients
            .lock()
            .unwrap()
            .iter()
            .map(|c| ClientEntry {
                id: c.client.id.clone(),
                tty: c.client.tty.clone(),
                read_only: c.client.read_only,
                version: c.client.version.clone(),
            })
            .collect()
    }

    pub fn is_done(&self) -> bool {
        self.done.peek().is_some()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.done.peek()
    }

    /// Blocks until the child exits, returning its mapped exit code. Used by
    /// the server's per-session watcher thread to learn when to begin
    /// dead-retention.
    pub fn wait_exit(&self) -> i32 {
        self.done.wait(None).unwrap_or(1)
    }

    /// Sends SIGHUP to the child's process group. Used for the `Kill`
    /// request; the session tears itself down naturally once the read pump
    /// observes the pty hitting EOF.
    pub fn signal_hup(&self) {
        if let Err(e) =
            nix::sys::signal::killpg(nix::unistd::Pid::from_raw(self.pid), nix::sys::signal::Signal::SIGHUP)
        {
            debug!("sending SIGHUP to session {} (pid {}): {}", self.name, self.pid, e);
        }
    }

    /// Full teardown used by daemon shutdown: disconnects every attached
    /// client, signals the child, escalates to SIGKILL if it doesn't exit
    /// within the grace period, and releases the emulator and any
    /// shell-integration scratch directory.
    #[instrument(skip(self), fields(session = %self.name))]
    pub fn close(&self) {
        {
            let clients: Vec<ClientSlot> = std::mem::take(&mut *self.clients.lock().unwrap());
            for slot in clients {
                let _ = slot.conn.shutdown(std::net::Shutdown::Both);
                drop(slot.output_tx);
                if let Some(h) = slot.write_thread {
                    let _ = h.join();
                }
            }
        }
        if !self.is_done() {
            self.signal_hup();
            if self.done.wait(Some(consts::CHILD_KILL_TIMEOUT)).is_none() {
                warn!(
                    "session {} (pid {}) did not exit within {:?} of SIGHUP, sending SIGKILL",
                    self.name, self.pid, consts::CHILD_KILL_TIMEOUT
                );
                if let Err(e) = nix::sys::signal::killpg(
                    nix::unistd::Pid::from_raw(self.pid),
                    nix::sys::signal::Signal::SIGKILL,
                ) {
                    error!("sending SIGKILL to session {} (pid {}): {}", self.name, self.pid, e);
                }
                self.done.wait(None);
            }
        }
        self.emulator.lock().unwrap().close();
        if let Some(dir) = &self.shell_integration_tmp_dir {
            if let Err(e) = std::fs::remove_dir_all(dir) {
                debug!("removing shell integration tmp dir {:?}: {}", dir, e);
            }
        }
    }
}

fn now_unix() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

fn parse_env_pairs(env: &[String]) -> Vec<(String, String)> {
    env.iter()
        .filter_map(|kv| kv.split_once('=').map(|(k, v)| (k.to_string(), v.to_string())))
        .collect()
}

/// Explicit argv wins; failing that a forwarded `SHELL=` env var; failing
/// that the daemon process's own `SHELL`; failing that `/bin/sh`.
fn resolve_argv(command: &[String], forwarded_env: &[(String, String)]) -> Vec<String> {
    if !command.is_empty() {
        return command.to_vec();
    }
    if let Some((_, shell)) = forwarded_env.iter().find(|(k, _)| k == "SHELL") {
        return vec![shell.clone()];
    }
    if let Ok(shell) = std::env::var("SHELL") {
        return vec![shell];
    }
    vec!["/bin/sh".to_string()]
}

/// Reaps the child and publishes its exit code to `done`, mapping a
/// `WIFSIGNALED` death to `128 + signal` the way a POSIX shell would report
/// it, rather than collapsing it to a fixed sentinel the way `Fork`'s own
/// `wait_for_exit` does.
fn spawn_child_watcher(pid: libc::pid_t, done: Arc<ExitNotifier>) {
    thread::spawn(move || {
        let mut status: i32 = 0;
        loop {
            // Safety: pid is a valid child of this process until it's reaped.
            let ret = unsafe { libc::waitpid(pid, &mut status, 0) };
            match ret {
                -1 => {
                    let err = io::Error::last_os_error();
                    if err.kind() == io::ErrorKind::Interrupted {
                        continue;
                    }
                    error!("waitpid({}) failed: {}", pid, err);
                    done.notify_exit(1);
                    return;
                }
                _ => break,
            }
        }
        let code = if libc::WIFEXITED(status) {
            libc::WEXITSTATUS(status)
        } else if libc::WIFSIGNALED(status) {
            128 + libc::WTERMSIG(status)
        } else {
            1
        };
        info!("child {} exited with code {}", pid, code);
        done.notify_exit(code);
    });
}

fn evict_locked(clients: &mut Vec<ClientSlot>, i: usize, session_name: &str, reason: &str) {
    let slot = clients.remove(i);
    warn!("evicting client {} from session {}: {}", slot.client.id, session_name, reason);
    let _ = slot.conn.shutdown(std::net::Shutdown::Both);
    drop(slot.output_tx);
    // Not joined here: joining while holding the client list lock could
    // stall every other client's pump. The write pump exits on its own once
    // it sees the channel closed.
}

#[instrument(skip(session, feed_tx), fields(session = %session.name))]
fn read_pump(session: Arc<Session>, feed_tx: crossbeam_channel::Sender<Vec<u8>>) {
    let mut buf = vec![0u8; consts::PTY_READ_CHUNK_SIZE];
    loop {
        let n = match pty_read(session.master_fd, &mut buf) {
            Ok(0) => {
                debug!("pty eof for session {}", session.name);
                break;
            }
            Ok(n) => n,
            Err(e) if e.raw_os_error() == Some(libc::EIO) => {
                debug!("pty read EIO for session {} (child likely exited)", session.name);
                break;
            }
            Err(e) => {
                warn!("pty read error for session {}: {}", session.name, e);
                break;
            }
        };
        let chunk = &buf[..n];

        let frame = encode_response(&Response::Output { data: chunk.to_vec() });
        {
            let mut clients = session.clients.lock().unwrap();
            let mut i = 0;
            while i < clients.len() {
                match clients[i].output_tx.try_send(frame.clone()) {
                    Ok(()) => i += 1,
                    Err(crossbeam_channel::TrySendError::Full(_)) => {
                        evict_locked(&mut clients, i, &session.name, "output queue full")
                    }
                    Err(crossbeam_channel::TrySendError::Disconnected(_)) => {
                        evict_locked(&mut clients, i, &session.name, "connection closed")
                    }
                }
            }
        }

        if feed_tx.send(chunk.to_vec()).is_err() {
            break;
        }
    }
    drop(feed_tx);

    let exit_code = session.done.wait(None).unwrap_or(1);
    info!("session {} shell exited with code {}", session.name, exit_code);

    let clients: Vec<ClientSlot> = std::mem::take(&mut *session.clients.lock().unwrap());
    for slot in clients {
        let ClientSlot { client, output_tx, mut conn, write_thread, .. } = slot;
        drop(output_tx);
        if let Some(h) = write_thread {
            let _ = h.join();
        }
        if let Err(e) = Response::Exited { exit_code }.write_to(&mut conn) {
            debug!("sending Exited to client {} of session {}: {}", client.id, session.name, e);
        }
    }
}

fn feed_pump(session: Arc<Session>, feed_rx: crossbeam_channel::Receiver<Vec<u8>>) {
    while let Ok(buf) = feed_rx.recv() {
        session.emulator.lock().unwrap().feed(&buf);
    }
    debug!("feed pump for session {} exiting", session.name);
}

fn write_pump(mut conn: UnixStream, output_rx: crossbeam_channel::Receiver<Vec<u8>>, client_id: String) {
    use std::io::Write;
    while let Ok(frame) = output_rx.recv() {
        if let Err(e) = conn.write_all(&frame) {
            debug!("write pump for client {} exiting: {}", client_id, e);
            break;
        }
    }
}

impl Session {
    fn broadcast_clients_changed(&self, count: u16, cols: u16, rows: u16) {
        let frame = encode_response(&Response::ClientsChanged(ClientsChanged { count, cols, rows }));
        let mut clients = self.clients.lock().unwrap();
        let mut i = 0;
        while i < clients.len() {
            match clients[i].output_tx.try_send(frame.clone()) {
                Ok(()) => i += 1,
                Err(_) => evict_locked(&mut clients, i, &self.name, "clients-changed delivery failed"),
            }
        }
    }
}

fn encode_response(resp: &Response) -> Vec<u8> {
    let mut buf = Vec::new();
    // Writing to an in-memory Vec<u8> cannot fail.
    let _ = resp.write_to(&mut buf);
    buf
}

fn pty_read(fd: i32, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        let ret = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if ret >= 0 {
            return Ok(ret as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            continue;
        }
        return Err(err);
    }
}

fn pty_write(fd: i32, buf: &[u8]) -> io::Result<usize> {
    loop {
        let ret = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if ret >= 0 {
            return Ok(ret as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            continue;
        }
        return Err(err);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn resolve_argv_prefers_explicit_command() {
        let argv = resolve_argv(&["/usr/bin/fish".to_string()], &[("SHELL".to_string(), "/bin/zsh".to_string())]);
        assert_eq!(argv, vec!["/usr/bin/fish".to_string()]);
    }

    #[test]
    fn resolve_argv_falls_back_to_forwarded_shell_env() {
        let argv = resolve_argv(&[], &[("SHELL".to_string(), "/bin/zsh".to_string())]);
        assert_eq!(argv, vec!["/bin/zsh".to_string()]);
    }

    #[test]
    fn parse_env_pairs_splits_on_first_equals() {
        let pairs = parse_env_pairs(&["FOO=bar=baz".to_string(), "malformed".to_string()]);
        assert_eq!(pairs, vec![("FOO".to_string(), "bar=baz".to_string())]);
    }
}
