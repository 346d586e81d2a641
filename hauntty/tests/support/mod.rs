// This module is used from multiple different test files, each of which
// gets compiled into its own binary. Not all the binaries use all the
// stuff here.
#![allow(dead_code)]

use std::time;

use anyhow::anyhow;

pub mod client;
pub mod daemon;
pub mod tmpdir;

pub fn wait_until<P>(mut pred: P) -> anyhow::Result<()>
where
    P: FnMut() -> anyhow::Result<bool>,
{
    let mut sleep_dur = time::Duration::from_millis(5);
    for _ in 0..12 {
        if pred()? {
            return Ok(());
        } else {
            std::thread::sleep(sleep_dur);
            sleep_dur *= 2;
        }
    }

    Err(anyhow!("pred never became true"))
}

/// Runs `f`, printing its error (with the full `anyhow` context chain)
/// before propagating it, so a failing integration test leaves a readable
/// trail in the test runner's captured output.
pub fn dump_err<F>(f: F) -> anyhow::Result<()>
where
    F: FnOnce() -> anyhow::Result<()>,
{
    if let Err(e) = f() {
        eprintln!("test failed: {:?}", e);
        return Err(e);
    }
    Ok(())
}
