//! A bare protocol client for the integration suite: connects to a running
//! daemon's socket, performs the handshake, and sends/receives
//! `hauntty_protocol` frames directly. There is no CLI front end to drive
//! here, so tests talk the wire protocol the way a real client library
//! would.
//!
//! Responses are pulled off the socket by a dedicated background thread
//! and handed to the caller over a channel, the same thread-per-pump shape
//! `libhauntty`'s own session pumps use. This sidesteps the framing
//! desync a raw socket read timeout would risk: `hauntty_protocol::read_frame`
//! issues several reads per message, and a timeout landing mid-frame would
//! leave the stream's cursor between fields with no way to resume cleanly.

use std::{os::unix::net::UnixStream, path::Path, thread, time::Duration};

use anyhow::Context;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use hauntty_protocol::{Handshake, Request, Response, PROTOCOL_VERSION};

/// Connects to `socket`, retrying briefly while the daemon finishes
/// binding, then exchanges handshakes. Returns the raw, un-drained
/// connection: nothing reads from it until the caller does.
fn connect_raw<P: AsRef<Path>>(socket: P) -> anyhow::Result<(UnixStream, Handshake)> {
    let mut sleep_dur = Duration::from_millis(5);
    let mut last_err = None;
    let mut conn = None;
    for _ in 0..8 {
        match UnixStream::connect(socket.as_ref()) {
            Ok(s) => {
                conn = Some(s);
                break;
            }
            Err(e) => {
                last_err = Some(e);
                std::thread::sleep(sleep_dur);
                sleep_dur *= 2;
            }
        }
    }
    let mut conn = conn.ok_or_else(|| {
        anyhow::anyhow!("could not connect to {:?}: {:?}", socket.as_ref(), last_err)
    })?;

    let ours = Handshake { version: PROTOCOL_VERSION, revision: "test-client".to_string() };
    ours.write_to(&mut conn).context("writing handshake")?;
    let theirs = Handshake::read_from(&mut conn).context("reading handshake")?;
    Ok((conn, theirs))
}

pub struct Client {
    conn: UnixStream,
    rx: Receiver<anyhow::Result<Response>>,
    pub handshake: Handshake,
}

impl Client {
    /// Connects and starts a background reader thread that continuously
    /// drains the socket — the shape every test wants except the one
    /// playing the role of an unresponsive attached client (see
    /// `StalledClient`).
    pub fn connect<P: AsRef<Path>>(socket: P) -> anyhow::Result<Client> {
        let (conn, theirs) = connect_raw(socket)?;

        let reader_conn = conn.try_clone().context("cloning connection for reader thread")?;
        let (tx, rx) = crossbeam_channel::unbounded();
        thread::spawn(move || {
            let mut reader_conn = reader_conn;
            loop {
                let result = Response::read_from(&mut reader_conn);
                let done = result.is_err();
                if tx.send(result).is_err() || done {
                    return;
                }
            }
        });

        Ok(Client { conn, rx, handshake: theirs })
    }

    pub fn send(&mut self, req: &Request) -> anyhow::Result<()> {
        req.write_to(&mut self.conn).context("writing request")
    }

    /// Blocks for the next frame. Once the reader thread has hit an error
    /// (typically EOF after the daemon closes the connection) every
    /// subsequent call returns that same error.
    pub fn recv(&mut self) -> anyhow::Result<Response> {
        match self.rx.recv() {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!("connection reader thread exited")),
        }
    }

    /// A single round trip: send `req`, return the next frame back.
    pub fn roundtrip(&mut self, req: &Request) -> anyhow::Result<Response> {
        self.send(req)?;
        self.recv()
    }

    /// Waits up to `timeout` for the next frame without blocking forever;
    /// `Ok(None)` means nothing arrived in time, not that the connection is
    /// dead. Used to drain `Output`/`ClientsChanged`/`Exited` frames that
    /// arrive asynchronously once attached.
    pub fn recv_timeout(&mut self, timeout: Duration) -> anyhow::Result<Option<Response>> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => result.map(Some),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(anyhow::anyhow!("connection reader thread exited"))
            }
        }
    }
}

/// A connection that plays the role of an unresponsive attached client: it
/// can send requests and synchronously read the handful of frames it
/// chooses to, but nothing drains it in the background. Left alone, the
/// daemon's output for it piles up in the kernel socket buffer and then in
/// the session's per-client channel, which is exactly the backpressure
/// scenario eviction testing needs — a `Client`'s background reader thread
/// would defeat that by always keeping the socket empty.
pub struct StalledClient {
    conn: UnixStream,
}

impl StalledClient {
    pub fn connect<P: AsRef<Path>>(socket: P) -> anyhow::Result<StalledClient> {
        let (conn, _handshake) = connect_raw(socket)?;
        Ok(StalledClient { conn })
    }

    pub fn send(&mut self, req: &Request) -> anyhow::Result<()> {
        req.write_to(&mut self.conn).context("writing request")
    }

    /// Synchronously reads exactly one frame. Only safe to call before the
    /// flood of asynchronous output begins.
    pub fn recv_one(&mut self) -> anyhow::Result<Response> {
        Response::read_from(&mut self.conn).context("reading response")
    }
}

/// Accumulates `Output` bytes off an attached client connection and scans
/// them for patterns, the way a terminal would watch a shell's output for
/// a prompt. Swallows unrelated frames; records the exit code if `Exited`
/// arrives.
pub struct OutputMatcher {
    pending: Vec<u8>,
    pub exit_code: Option<i32>,
}

impl OutputMatcher {
    pub fn new() -> Self {
        OutputMatcher { pending: Vec::new(), exit_code: None }
    }

    fn pump_one(&mut self, client: &mut Client, timeout: Duration) -> anyhow::Result<bool> {
        match client.recv_timeout(timeout)? {
            Some(Response::Output { data }) => {
                self.pending.extend_from_slice(&data);
                Ok(true)
            }
            Some(Response::Exited { exit_code }) => {
                self.exit_code = Some(exit_code);
                Ok(true)
            }
            Some(_other) => Ok(true),
            None => Ok(false),
        }
    }

    /// Polls until `needle` appears in the accumulated output, or `overall`
    /// elapses.
    pub fn wait_for(
        &mut self,
        client: &mut Client,
        needle: &str,
        overall: Duration,
    ) -> anyhow::Result<()> {
        let deadline = std::time::Instant::now() + overall;
        loop {
            if String::from_utf8_lossy(&self.pending).contains(needle) {
                return Ok(());
            }
            if std::time::Instant::now() >= deadline {
                return Err(anyhow::anyhow!(
                    "timed out waiting for {:?} in output: {:?}",
                    needle,
                    String::from_utf8_lossy(&self.pending)
                ));
            }
            self.pump_one(client, Duration::from_millis(200))?;
        }
    }

    pub fn contains(&self, needle: &str) -> bool {
        String::from_utf8_lossy(&self.pending).contains(needle)
    }
}

impl Default for OutputMatcher {
    fn default() -> Self {
        Self::new()
    }
}
