use std::{
    os::unix::net::UnixStream,
    path::{Path, PathBuf},
    process,
    process::{Command, Stdio},
    time,
};

use anyhow::Context;

/// Overrides applied to a spawned daemon's environment on top of the
/// socket/state-dir plumbing every `Proc` sets up. Mirrors the `HAUNTTY_*`
/// knobs `ServerConfig::from_env` reads, letting tests exercise short
/// TTLs/intervals instead of the multi-second production defaults.
#[derive(Default)]
pub struct DaemonArgs {
    pub dead_session_ttl_ms: Option<u64>,
    pub attach_lease_ttl_ms: Option<u64>,
    pub persist_interval_ms: Option<u64>,
    pub persist_enabled: Option<bool>,
    pub resize_policy: Option<String>,
    pub auto_exit: Option<bool>,
    pub extra_env: Vec<(String, String)>,
}

/// Handle for a `hauntty` daemon subprocess. Kills the process when
/// dropped; does not own the scratch directory it runs against, so tests
/// that need the directory to survive a restart keep their own
/// `tmpdir::Dir` alive alongside this handle.
pub struct Proc {
    pub proc: process::Child,
    pub socket_path: PathBuf,
    pub state_dir: PathBuf,
}

impl Proc {
    /// Spawns a daemon rooted at `dir`, with `dir/hauntty.sock` as the
    /// socket and `dir/state` as the persisted-state directory.
    pub fn new_in<P: AsRef<Path>>(dir: P, args: DaemonArgs) -> anyhow::Result<Proc> {
        let dir = dir.as_ref();
        let socket_path = dir.join("hauntty.sock");
        // Matches `ServerConfig::state_dir`'s `$XDG_STATE_HOME/hauntty/sessions`
        // resolution rule; setting XDG_STATE_HOME below is what actually
        // pins this, kept here only so tests can inspect the same path.
        let state_dir = dir.join("hauntty").join("sessions");

        let mut cmd = Command::new(env!("CARGO_BIN_EXE_hauntty"));
        cmd.stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("HAUNTTY_SOCKET", &socket_path)
            .env("XDG_STATE_HOME", dir)
            .env("RUST_LOG", "debug");

        if let Some(ms) = args.dead_session_ttl_ms {
            cmd.env("HAUNTTY_DEAD_SESSION_TTL_MS", ms.to_string());
        }
        if let Some(ms) = args.attach_lease_ttl_ms {
            cmd.env("HAUNTTY_ATTACH_LEASE_TTL_MS", ms.to_string());
        }
        if let Some(ms) = args.persist_interval_ms {
            cmd.env("HAUNTTY_PERSIST_INTERVAL_MS", ms.to_string());
        }
        if let Some(enabled) = args.persist_enabled {
            cmd.env("HAUNTTY_PERSIST_ENABLED", if enabled { "true" } else { "false" });
        }
        if let Some(policy) = &args.resize_policy {
            cmd.env("HAUNTTY_RESIZE_POLICY", policy);
        }
        if let Some(auto_exit) = args.auto_exit {
            cmd.env("HAUNTTY_AUTO_EXIT", if auto_exit { "true" } else { "false" });
        }
        for (k, v) in &args.extra_env {
            cmd.env(k, v);
        }

        let proc = cmd.spawn().context("spawning hauntty daemon process")?;

        let mut sleep_dur = time::Duration::from_millis(5);
        let mut connected = false;
        for _ in 0..14 {
            if UnixStream::connect(&socket_path).is_ok() {
                connected = true;
                break;
            }
            std::thread::sleep(sleep_dur);
            sleep_dur *= 2;
        }
        if !connected {
            return Err(anyhow::anyhow!("daemon never bound {:?}", socket_path));
        }

        Ok(Proc { proc, socket_path, state_dir })
    }

    /// Sends SIGTERM and waits for the process to exit, the way a process
    /// supervisor would stop the daemon for a restart.
    pub fn terminate_and_wait(&mut self) -> anyhow::Result<()> {
        let pid = nix::unistd::Pid::from_raw(self.proc.id() as i32);
        nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM)
            .context("sending SIGTERM to daemon")?;
        self.proc.wait().context("waiting for daemon to exit")?;
        Ok(())
    }
}

impl Drop for Proc {
    fn drop(&mut self) {
        if let Err(e) = self.proc.kill() {
            eprintln!("err killing daemon proc: {:?}", e);
        }
        let _ = self.proc.wait();
    }
}
