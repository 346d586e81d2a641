// Copyright 2024 Google LLC
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

/// Callbacks the process embedding `libhauntty` can implement to react to
/// session lifecycle events — for example to inject telemetry, or to kick
/// off a background job some number of minutes after a particular named
/// session's last client disconnects.
///
/// Hooks are invoked inline within the daemon's control flow, so you MUST
/// NOT block for extended periods of time. If you need to do work that
/// could block for a while, spin up a worker thread and enqueue events so
/// the hooks can be processed async.
///
/// It would be nicer if the hooks took `&mut self`, but they are called
/// from an immutable context and it is nice to avoid the synchronization
/// / interior mutability unless it is required. Users can always get
/// mutable state with a cell / mutex.
///
/// Any errors returned will simply be logged.
///
/// All hooks do nothing by default.
pub trait Hooks {
    /// Triggered when a fresh session is created.
    fn on_new_session(&self, _session_name: &str) -> anyhow::Result<()> {
        Ok(())
    }

    /// Triggered when a client attaches to a session that already existed
    /// (as opposed to one just created for it).
    fn on_reattach(&self, _session_name: &str) -> anyhow::Result<()> {
        Ok(())
    }

    /// Triggered when a `Create{mode: RequireNew}` finds a session of that
    /// name already live.
    fn on_busy(&self, _session_name: &str) -> anyhow::Result<()> {
        Ok(())
    }

    /// Triggered when an attached client's connection goes away, whether by
    /// explicit `Detach` or by hanging up.
    fn on_client_disconnect(&self, _session_name: &str) -> anyhow::Result<()> {
        Ok(())
    }

    /// Triggered when a session closes because its shell exited.
    fn on_shell_disconnect(&self, _session_name: &str) -> anyhow::Result<()> {
        Ok(())
    }
}
