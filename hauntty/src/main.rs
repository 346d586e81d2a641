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

//! hauntty is a terminal session multiplexer daemon: it runs shells under
//! pseudoterminals decoupled from the lifetime of any attached client,
//! broadcasting their output to every attached client and persisting their
//! screen across a daemon restart. This binary is a thin entry point with
//! no flags: all configuration comes from the environment (see
//! `libhauntty::config::ServerConfig::from_env`).

use tracing_subscriber::fmt::format::FmtSpan;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_thread_ids(true)
        .with_target(false)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(std::io::stderr)
        .init();

    let config = libhauntty::config::ServerConfig::from_env()?;
    libhauntty::daemon::run(config, Box::new(libhauntty::NoopHooks))
}
