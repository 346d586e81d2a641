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

//! Daemon startup: resolves the socket/pid file paths, binds the listener,
//! wires up the signal handler, and hands off to [`server::Server`].

use std::{fs, io, os::unix::fs::PermissionsExt, os::unix::net::UnixListener, sync::Arc};

use anyhow::Context;
use tracing::{info, instrument};

use crate::{config::ServerConfig, hooks::Hooks};

mod exit_notify;
pub mod names;
pub mod persister;
pub mod server;
mod session;
mod signals;

/// Starts the daemon and blocks forever accepting connections. Binds
/// `config.socket_path`, writes a pid file alongside it, and runs until a
/// `TERM_SIGNALS` delivery (or an `auto_exit`-triggered shutdown) stops it.
#[instrument(skip(config, hooks))]
pub fn run(config: ServerConfig, hooks: Box<dyn Hooks + Send + Sync>) -> anyhow::Result<()> {
    info!("starting hauntty daemon, socket={:?}", config.socket_path);

    let socket_dir = config
        .socket_path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("socket path {:?} has no parent directory", config.socket_path))?;
    fs::create_dir_all(socket_dir).context("creating socket directory")?;
    fs::set_permissions(socket_dir, fs::Permissions::from_mode(0o700))
        .context("setting socket directory permissions")?;

    match fs::remove_file(&config.socket_path) {
        Ok(()) => info!("removed stale socket file"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).context("removing stale socket file"),
    }

    let pid_path = socket_dir.join(crate::consts::PID_FILE_NAME);
    fs::write(&pid_path, std::process::id().to_string()).context("writing pid file")?;
    fs::set_permissions(&pid_path, fs::Permissions::from_mode(0o600)).context("setting pid file permissions")?;

    let listener = UnixListener::bind(&config.socket_path).context("binding to socket")?;

    let server = server::Server::new(config, hooks)?;

    let shutdown_server = Arc::clone(&server);
    signals::Handler::new(Box::new(move || shutdown_server.shutdown())).spawn()?;

    server::Server::serve(&server, listener)?;

    Ok(())
}
