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

//! A terminal session multiplexer daemon library: PTY-backed sessions that
//! survive the disconnect of any one client, support multiple simultaneous
//! clients per session, and can persist their screen across a daemon
//! restart.
//!
//! This crate has no CLI front end and does no flag or config-file parsing;
//! a binary embedding it is responsible for building a [`config::ServerConfig`]
//! (by hand or via [`config::ServerConfig::from_env`]) and calling [`daemon::run`].

pub mod config;
pub mod consts;
pub mod daemon;
pub mod emulator;
mod hooks;
mod tty;
mod user;

pub use hooks::Hooks;

/// A [`Hooks`] implementation that does nothing, for embedders with no
/// lifecycle callbacks to register.
pub struct NoopHooks;
impl Hooks for NoopHooks {}
