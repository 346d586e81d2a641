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

use std::time::Duration;

/// Size of the chunks the read pump pulls off of the PTY master.
pub const PTY_READ_CHUNK_SIZE: usize = 1024 * 32;

/// How long a poll-based loop sleeps between checks (dead-session and
/// lease timers, join-style waits on pump threads).
pub const JOIN_POLL_DURATION: Duration = Duration::from_millis(100);

/// How long `Session::close` waits for `done` after `SIGHUP` before
/// escalating to `SIGKILL`.
pub const CHILD_KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// Default dead-session retention window.
pub const DEFAULT_DEAD_SESSION_TTL: Duration = Duration::from_secs(20);

/// Default attach-lease lifetime.
pub const DEFAULT_ATTACH_LEASE_TTL: Duration = Duration::from_secs(5);

/// Default Persister tick interval.
pub const DEFAULT_PERSIST_INTERVAL: Duration = Duration::from_secs(30);

/// Default number of scrollback lines the emulator retains.
pub const DEFAULT_SCROLLBACK_LINES: usize = 10_000;

/// Default capacity of a client's bounded output channel.
pub const DEFAULT_CLIENT_CHANNEL_CAPACITY: usize = 64;

/// How long `Server`-level emulator queries (e.g. `List`) are bounded by.
pub const EMULATOR_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

pub const STDERR_FD: i32 = 2;

/// Injected into the child's environment so a shell or script run inside a
/// session can discover its own name.
pub const SESSION_NAME_ENV: &str = "HAUNTTY_SESSION";

/// Overrides the daemon socket path when set.
pub const SOCKET_ENV: &str = "HAUNTTY_SOCKET";

pub const SOCKET_FILE_NAME: &str = "hauntty.sock";
pub const PID_FILE_NAME: &str = "hauntty.pid";

/// Magic bytes at the front of a `PersistedState` file.
pub const STATE_FILE_MAGIC: [u8; 4] = *b"HTST";
pub const STATE_FILE_VERSION: u8 = 1;
pub const STATE_FILE_SUFFIX: &str = "state";
pub const STATE_FILE_TMP_SUFFIX: &str = "state.tmp";

/// Length, in random alphanumeric characters, of a generated attach token.
pub const ATTACH_TOKEN_LEN: usize = 32;

/// How many adjective+noun combinations `names::generate` retries before
/// falling back to a numeric suffix.
pub const NAME_GEN_RETRIES: u32 = 100;
