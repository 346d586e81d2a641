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

//! On-disk screen-state snapshots and the ticker-driven loop that writes
//! them. Grounded in `session_restore.rs`'s dump/restore plumbing, which the
//! teacher only uses for in-process reattach; here it is generalized into a
//! standalone component with its own atomic-write discipline for surviving
//! a daemon restart.

use std::{
    collections::{HashMap, HashSet},
    fs,
    io::{self, Cursor, Read},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use anyhow::{anyhow, Context};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use tracing::{debug, error, info, instrument};

use super::session::Session;
use crate::consts;

/// On-disk snapshot of one session's emulator screen, as specified by the
/// wire-independent `PersistedState` layout: 4-byte magic, 1-byte version,
/// cols/rows, cursor position, alt-screen flag, save time, and the raw VT
/// bytes needed to redraw the screen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedState {
    pub cols: u16,
    pub rows: u16,
    pub cursor_row: u32,
    pub cursor_col: u32,
    pub is_alt_screen: bool,
    pub saved_at_unix_secs: u64,
    pub vt_data: Vec<u8>,
}

impl PersistedState {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 + self.vt_data.len());
        out.extend_from_slice(&consts::STATE_FILE_MAGIC);
        out.write_u8(consts::STATE_FILE_VERSION).unwrap();
        out.write_u16::<BigEndian>(self.cols).unwrap();
        out.write_u16::<BigEndian>(self.rows).unwrap();
        out.write_u32::<BigEndian>(self.cursor_row).unwrap();
        out.write_u32::<BigEndian>(self.cursor_col).unwrap();
        out.write_u8(if self.is_alt_screen { 1 } else { 0 }).unwrap();
        out.write_u64::<BigEndian>(self.saved_at_unix_secs).unwrap();
        out.write_u32::<BigEndian>(self.vt_data.len() as u32).unwrap();
        out.extend_from_slice(&self.vt_data);
        out
    }

    pub fn decode(bytes: &[u8]) -> anyhow::Result<PersistedState> {
        let mut cur = Cursor::new(bytes);
        let mut magic = [0u8; 4];
        cur.read_exact(&mut magic).context("reading state magic")?;
        if magic != consts::STATE_FILE_MAGIC {
            return Err(anyhow!("bad persisted state magic {:?}", magic));
        }
        let version = cur.read_u8().context("reading state version")?;
        if version != consts::STATE_FILE_VERSION {
            return Err(anyhow!("unsupported persisted state version {}", version));
        }
        let cols = cur.read_u16::<BigEndian>()?;
        let rows = cur.read_u16::<BigEndian>()?;
        let cursor_row = cur.read_u32::<BigEndian>()?;
        let cursor_col = cur.read_u32::<BigEndian>()?;
        let is_alt_screen = cur.read_u8()? != 0;
        let saved_at_unix_secs = cur.read_u64::<BigEndian>()?;
        let len = cur.read_u32::<BigEndian>()? as usize;
        let mut vt_data = vec![0u8; len];
        cur.read_exact(&mut vt_data).context("reading vt_data")?;
        Ok(PersistedState {
            cols,
            rows,
            cursor_row,
            cursor_col,
            is_alt_screen,
            saved_at_unix_secs,
            vt_data,
        })
    }
}

fn state_path(state_dir: &Path, name: &str) -> PathBuf {
    state_dir.join(format!("{}.{}", name, consts::STATE_FILE_SUFFIX))
}

fn tmp_path(state_dir: &Path, name: &str) -> PathBuf {
    state_dir.join(format!("{}.{}", name, consts::STATE_FILE_TMP_SUFFIX))
}

/// Writes `data` to `<dir>/<name>.state` via a `.tmp` sibling + rename so a
/// reader never observes a partial file.
fn write_atomic(state_dir: &Path, name: &str, data: &[u8]) -> anyhow::Result<()> {
    fs::create_dir_all(state_dir).context("creating state dir")?;
    let tmp = tmp_path(state_dir, name);
    fs::write(&tmp, data).context("writing tmp state file")?;
    fs::rename(&tmp, state_path(state_dir, name)).context("renaming tmp state file into place")?;
    Ok(())
}

/// Reads and validates a session's persisted state, if present.
pub fn load_state(state_dir: &Path, name: &str) -> anyhow::Result<Option<PersistedState>> {
    let path = state_path(state_dir, name);
    let bytes = match fs::read(&path) {
        Ok(b) => b,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).context("reading persisted state file"),
    };
    Ok(Some(PersistedState::decode(&bytes)?))
}

/// Names with a `.state` file on disk that aren't in `running`.
pub fn list_dead_sessions(
    state_dir: &Path,
    running: &HashSet<String>,
) -> anyhow::Result<Vec<String>> {
    let mut out = Vec::new();
    let entries = match fs::read_dir(state_dir) {
        Ok(e) => e,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(e).context("reading state dir"),
    };
    for entry in entries {
        let entry = entry.context("reading state dir entry")?;
        let file_name = entry.file_name();
        let file_name = file_name.to_string_lossy();
        if let Some(name) = file_name.strip_suffix(&format!(".{}", consts::STATE_FILE_SUFFIX)) {
            if !running.contains(name) {
                out.push(name.to_string());
            }
        }
    }
    Ok(out)
}

/// Removes a session's persisted state file, if present.
pub fn clean_state(state_dir: &Path, name: &str) -> anyhow::Result<()> {
    match fs::remove_file(state_path(state_dir, name)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).context("removing persisted state file"),
    }
}

/// Removes leftover `.state.tmp` files from a prior daemon instance that
/// crashed mid-write.
pub fn sweep_stale_tmp(state_dir: &Path) -> anyhow::Result<()> {
    let entries = match fs::read_dir(state_dir) {
        Ok(e) => e,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).context("reading state dir"),
    };
    for entry in entries {
        let entry = entry.context("reading state dir entry")?;
        if entry.file_name().to_string_lossy().ends_with(&format!(".{}", consts::STATE_FILE_TMP_SUFFIX))
        {
            if let Err(e) = fs::remove_file(entry.path()) {
                error!("error sweeping stale tmp state file {:?}: {}", entry.path(), e);
            }
        }
    }
    Ok(())
}

fn dump_one(state_dir: &Path, name: &str, session: &Session) {
    let snapshot = session.dump_for_persist();
    let saved_at_unix_secs =
        SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
    let state = PersistedState {
        cols: snapshot.cols,
        rows: snapshot.rows,
        cursor_row: snapshot.cursor_row,
        cursor_col: snapshot.cursor_col,
        is_alt_screen: snapshot.is_alt_screen,
        saved_at_unix_secs,
        vt_data: snapshot.vt_data,
    };
    if let Err(e) = write_atomic(state_dir, name, &state.encode()) {
        error!("error persisting session {}: {}", name, e);
    } else {
        debug!("persisted session {}", name);
    }
}

/// Persists one session immediately, bypassing the ticker. Used when a
/// session transitions to dead so its final screen is on disk before the
/// retention window (and any restore attempt within it) begins.
pub(crate) fn save_one(state_dir: &Path, name: &str, session: &Session) {
    dump_one(state_dir, name, session);
}

fn save_all(state_dir: &Path, registry: &Mutex<HashMap<String, Arc<Session>>>) {
    let snapshot: Vec<(String, Arc<Session>)> =
        registry.lock().unwrap().iter().map(|(k, v)| (k.clone(), Arc::clone(v))).collect();
    for (name, session) in snapshot {
        if session.is_done() {
            // The session's last live tick already captured its final
            // screen; no point re-writing a frozen snapshot on every tick.
            continue;
        }
        dump_one(state_dir, &name, &session);
    }
}

/// A ticker-driven background saver. `start` spawns the ticker thread;
/// `stop_and_final_save` stops it and performs the shutdown-time save the
/// spec requires.
pub struct Persister {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Persister {
    #[instrument(skip(registry))]
    pub fn start(
        state_dir: PathBuf,
        interval: Duration,
        registry: Arc<Mutex<HashMap<String, Arc<Session>>>>,
    ) -> Persister {
        info!("starting persister with interval {:?}", interval);
        let stop = Arc::new(AtomicBool::new(false));
        let stop_for_thread = Arc::clone(&stop);
        let thread = thread::spawn(move || {
            let mut last_tick = Instant::now();
            while !stop_for_thread.load(Ordering::Relaxed) {
                thread::sleep(consts::JOIN_POLL_DURATION);
                if last_tick.elapsed() >= interval {
                    save_all(&state_dir, &registry);
                    last_tick = Instant::now();
                }
            }
        });
        Persister { stop, thread: Some(thread) }
    }

    /// Stops the ticker and performs one final synchronous save. Takes the
    /// same state dir/registry the caller passed to `start` since the
    /// background thread owns its own copies.
    pub fn stop_and_final_save(
        mut self,
        state_dir: &Path,
        registry: &Mutex<HashMap<String, Arc<Session>>>,
    ) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        info!("performing final persister save");
        save_all(state_dir, registry);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn persisted_state_round_trips() {
        let state = PersistedState {
            cols: 80,
            rows: 24,
            cursor_row: 3,
            cursor_col: 7,
            is_alt_screen: true,
            saved_at_unix_secs: 1_700_000_000,
            vt_data: b"hello\x1b[1mworld".to_vec(),
        };
        let encoded = state.encode();
        let decoded = PersistedState::decode(&encoded).unwrap();
        assert_eq!(state, decoded);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut bytes = PersistedState {
            cols: 1,
            rows: 1,
            cursor_row: 0,
            cursor_col: 0,
            is_alt_screen: false,
            saved_at_unix_secs: 0,
            vt_data: vec![],
        }
        .encode();
        bytes[0] = b'X';
        assert!(PersistedState::decode(&bytes).is_err());
    }

    #[test]
    fn unknown_version_is_rejected() {
        let mut bytes = PersistedState {
            cols: 1,
            rows: 1,
            cursor_row: 0,
            cursor_col: 0,
            is_alt_screen: false,
            saved_at_unix_secs: 0,
            vt_data: vec![],
        }
        .encode();
        bytes[4] = 99;
        assert!(PersistedState::decode(&bytes).is_err());
    }

    #[test]
    fn load_state_missing_file_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_state(dir.path(), "nope").unwrap().is_none());
    }

    #[test]
    fn write_then_load_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let state = PersistedState {
            cols: 80,
            rows: 24,
            cursor_row: 0,
            cursor_col: 0,
            is_alt_screen: false,
            saved_at_unix_secs: 42,
            vt_data: b"marker".to_vec(),
        };
        write_atomic(dir.path(), "gamma", &state.encode()).unwrap();
        let loaded = load_state(dir.path(), "gamma").unwrap().unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn list_dead_sessions_excludes_running() {
        let dir = tempfile::tempdir().unwrap();
        let state = PersistedState {
            cols: 1,
            rows: 1,
            cursor_row: 0,
            cursor_col: 0,
            is_alt_screen: false,
            saved_at_unix_secs: 0,
            vt_data: vec![],
        };
        write_atomic(dir.path(), "alpha", &state.encode()).unwrap();
        write_atomic(dir.path(), "beta", &state.encode()).unwrap();
        let mut running = HashSet::new();
        running.insert("alpha".to_string());
        let dead = list_dead_sessions(dir.path(), &running).unwrap();
        assert_eq!(dead, vec!["beta".to_string()]);
    }

    #[test]
    fn clean_state_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let state = PersistedState {
            cols: 1,
            rows: 1,
            cursor_row: 0,
            cursor_col: 0,
            is_alt_screen: false,
            saved_at_unix_secs: 0,
            vt_data: vec![],
        };
        write_atomic(dir.path(), "alpha", &state.encode()).unwrap();
        clean_state(dir.path(), "alpha").unwrap();
        assert!(load_state(dir.path(), "alpha").unwrap().is_none());
    }

    #[test]
    fn sweep_stale_tmp_removes_tmp_files_only() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("alpha.state.tmp"), b"partial").unwrap();
        fs::write(dir.path().join("beta.state"), b"whole").unwrap();
        sweep_stale_tmp(dir.path()).unwrap();
        assert!(!dir.path().join("alpha.state.tmp").exists());
        assert!(dir.path().join("beta.state").exists());
    }
}
