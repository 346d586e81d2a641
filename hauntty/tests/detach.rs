use std::time::Duration;

use anyhow::Context;
use hauntty_protocol::{
    AttachRequest, ClientsChanged, CreateMode, CreateRequest, DetachRequest, Request, Response,
    WinSize,
};
use ntest::timeout;

mod support;

use support::{
    client::Client,
    daemon::{DaemonArgs, Proc},
    dump_err, tmpdir,
};

fn win(cols: u16, rows: u16) -> WinSize {
    WinSize { cols, rows, xpixel: 0, ypixel: 0 }
}

fn create_and_attach(
    socket: &std::path::Path,
    name: &str,
    tty: Option<&str>,
) -> anyhow::Result<Client> {
    let mut client = Client::connect(socket)?;
    let resp = client.roundtrip(&Request::Create(CreateRequest {
        name: name.to_string(),
        command: vec!["/bin/sh".to_string(), "-c".to_string(), "sleep 60".to_string()],
        env: vec![],
        cwd: None,
        mode: CreateMode::OpenOrCreate,
    }))?;
    let token = match resp {
        Response::Created(c) => c.attach_token,
        other => return Err(anyhow::anyhow!("unexpected response: {:?}", other)),
    };
    let resp = client.roundtrip(&Request::Attach(AttachRequest {
        name: name.to_string(),
        size: win(80, 24),
        read_only: false,
        client_tty: tty.map(|s| s.to_string()),
        attach_token: Some(token),
    }))?;
    match resp {
        Response::Attached(_) => Ok(client),
        other => Err(anyhow::anyhow!("expected Attached, got {:?}", other)),
    }
}

#[test]
#[timeout(30000)]
fn self_detach_closes_no_further_output() -> anyhow::Result<()> {
    dump_err(|| {
        let dir = tmpdir::Dir::new("/tmp/hauntty-test")?;
        let daemon = Proc::new_in(dir.path(), DaemonArgs::default()).context("starting daemon")?;

        let mut client = create_and_attach(&daemon.socket_path, "solo", None)?;
        client.send(&Request::Detach(DetachRequest {
            name: "solo".to_string(),
            target_client_id: None,
            target_tty: None,
        }))?;
        assert_eq!(client.recv()?, Response::Ok);

        Ok(())
    })
}

#[test]
#[timeout(30000)]
fn detach_unknown_session_errors() -> anyhow::Result<()> {
    dump_err(|| {
        let dir = tmpdir::Dir::new("/tmp/hauntty-test")?;
        let daemon = Proc::new_in(dir.path(), DaemonArgs::default()).context("starting daemon")?;

        let mut client = Client::connect(&daemon.socket_path)?;
        client.send(&Request::Detach(DetachRequest {
            name: "does-not-exist".to_string(),
            target_client_id: None,
            target_tty: None,
        }))?;
        match client.recv()? {
            Response::Error { .. } => {}
            other => return Err(anyhow::anyhow!("expected Error, got {:?}", other)),
        }

        Ok(())
    })
}

/// S6: detaching a client identified by its reported tty, from a third,
/// uninvolved connection, leaves the other attached client alone and
/// broadcasts an updated client count.
#[test]
#[timeout(30000)]
fn detach_by_tty_leaves_other_client_attached() -> anyhow::Result<()> {
    dump_err(|| {
        let dir = tmpdir::Dir::new("/tmp/hauntty-test")?;
        let daemon = Proc::new_in(
            dir.path(),
            DaemonArgs { resize_policy: Some("smallest".to_string()), ..Default::default() },
        )
        .context("starting daemon")?;

        let mut a = create_and_attach(&daemon.socket_path, "shared", Some("/dev/ttys001"))?;

        let mut b = Client::connect(&daemon.socket_path)?;
        let resp = b.roundtrip(&Request::Attach(AttachRequest {
            name: "shared".to_string(),
            size: win(80, 24),
            read_only: false,
            client_tty: Some("/dev/ttys002".to_string()),
            attach_token: None,
        }))?;
        assert!(matches!(resp, Response::Attached(_)));

        // draining: both A and B should see a ClientsChanged{count: 2} once
        // B attaches.
        let mut saw_two = false;
        for _ in 0..20 {
            if let Some(Response::ClientsChanged(ClientsChanged { count, .. })) =
                a.recv_timeout(Duration::from_millis(100))?
            {
                if count == 2 {
                    saw_two = true;
                    break;
                }
            }
        }
        assert!(saw_two, "expected A to observe a 2-client broadcast");

        let mut controller = Client::connect(&daemon.socket_path)?;
        let resp = controller.roundtrip(&Request::Detach(DetachRequest {
            name: "shared".to_string(),
            target_client_id: None,
            target_tty: Some("/dev/ttys001".to_string()),
        }))?;
        assert_eq!(resp, Response::Ok);

        // A's connection should now be closed by the daemon: polling it
        // eventually turns up a read error (EOF) rather than a fresh frame
        // or a bare timeout.
        let mut closed = false;
        for _ in 0..20 {
            match a.recv_timeout(Duration::from_millis(100)) {
                Ok(_) => continue,
                Err(_) => {
                    closed = true;
                    break;
                }
            }
        }
        assert!(closed, "expected A's connection to be torn down after targeted detach");

        // B should observe the resulting ClientsChanged{count: 1}.
        let mut saw_one = false;
        for _ in 0..20 {
            if let Some(Response::ClientsChanged(ClientsChanged { count, .. })) =
                b.recv_timeout(Duration::from_millis(100))?
            {
                if count == 1 {
                    saw_one = true;
                    break;
                }
            }
        }
        assert!(saw_one, "expected B to observe the post-detach client count");

        Ok(())
    })
}
