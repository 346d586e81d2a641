use std::time::Duration;

use anyhow::Context;
use hauntty_protocol::{
    AttachRequest, CreateMode, CreateOutcome, CreateRequest, DetachRequest, Request, Response,
    WinSize,
};
use ntest::timeout;

mod support;

use support::{
    client::{Client, OutputMatcher},
    daemon::{DaemonArgs, Proc},
    dump_err, tmpdir,
};

fn win(cols: u16, rows: u16) -> WinSize {
    WinSize { cols, rows, xpixel: 0, ypixel: 0 }
}

fn create(client: &mut Client, name: &str, command: &[&str]) -> anyhow::Result<String> {
    let resp = client.roundtrip(&Request::Create(CreateRequest {
        name: name.to_string(),
        command: command.iter().map(|s| s.to_string()).collect(),
        env: vec!["PS1=$ ".to_string()],
        cwd: Some("/tmp".to_string()),
        mode: CreateMode::OpenOrCreate,
    }))?;
    match resp {
        Response::Created(c) => Ok(c.attach_token),
        Response::Error { message } => Err(anyhow::anyhow!("create failed: {}", message)),
        other => Err(anyhow::anyhow!("unexpected create response: {:?}", other)),
    }
}

#[test]
#[timeout(30000)]
fn happy_path() -> anyhow::Result<()> {
    dump_err(|| {
        let dir = tmpdir::Dir::new("/tmp/hauntty-test")?;
        let daemon = Proc::new_in(dir.path(), DaemonArgs::default()).context("starting daemon")?;

        let mut client = Client::connect(&daemon.socket_path).context("connecting")?;
        let token = create(&mut client, "alpha", &["/bin/sh", "-c", "printf hi\\\\n; sleep 60"])?;

        let resp = client.roundtrip(&Request::Attach(AttachRequest {
            name: "alpha".to_string(),
            size: win(80, 24),
            read_only: false,
            client_tty: None,
            attach_token: Some(token),
        }))?;
        let attached = match resp {
            Response::Attached(a) => a,
            other => return Err(anyhow::anyhow!("expected Attached, got {:?}", other)),
        };
        assert_eq!(attached.cols, 80);
        assert_eq!(attached.rows, 24);

        let mut out = OutputMatcher::new();
        out.wait_for(&mut client, "hi", Duration::from_secs(5))?;

        client.send(&Request::Detach(DetachRequest {
            name: "alpha".to_string(),
            target_client_id: None,
            target_tty: None,
        }))?;
        assert_eq!(client.recv()?, Response::Ok);

        Ok(())
    })
}

#[test]
#[timeout(30000)]
fn create_require_new_rejects_duplicate() -> anyhow::Result<()> {
    dump_err(|| {
        let dir = tmpdir::Dir::new("/tmp/hauntty-test")?;
        let daemon = Proc::new_in(dir.path(), DaemonArgs::default()).context("starting daemon")?;

        let mut client = Client::connect(&daemon.socket_path)?;
        let resp = client.roundtrip(&Request::Create(CreateRequest {
            name: "dup".to_string(),
            command: vec!["/bin/sh".to_string(), "-c".to_string(), "sleep 60".to_string()],
            env: vec![],
            cwd: None,
            mode: CreateMode::RequireNew,
        }))?;
        match resp {
            Response::Created(c) => assert_eq!(c.outcome, CreateOutcome::Created),
            other => return Err(anyhow::anyhow!("unexpected response: {:?}", other)),
        }

        let mut second = Client::connect(&daemon.socket_path)?;
        let resp = second.roundtrip(&Request::Create(CreateRequest {
            name: "dup".to_string(),
            command: vec!["/bin/sh".to_string(), "-c".to_string(), "sleep 60".to_string()],
            env: vec![],
            cwd: None,
            mode: CreateMode::RequireNew,
        }))?;
        match resp {
            Response::Error { .. } => {}
            other => return Err(anyhow::anyhow!("expected Error for duplicate create, got {:?}", other)),
        }

        Ok(())
    })
}

#[test]
#[timeout(30000)]
fn create_open_or_create_reuses_existing() -> anyhow::Result<()> {
    dump_err(|| {
        let dir = tmpdir::Dir::new("/tmp/hauntty-test")?;
        let daemon = Proc::new_in(dir.path(), DaemonArgs::default()).context("starting daemon")?;

        let mut client = Client::connect(&daemon.socket_path)?;
        let token1 = create(&mut client, "reuse", &["/bin/sh", "-c", "sleep 60"])?;
        let _ = client.roundtrip(&Request::Attach(AttachRequest {
            name: "reuse".to_string(),
            size: win(80, 24),
            read_only: false,
            client_tty: None,
            attach_token: Some(token1),
        }))?;

        let mut second = Client::connect(&daemon.socket_path)?;
        let resp = second.roundtrip(&Request::Create(CreateRequest {
            name: "reuse".to_string(),
            command: vec!["/bin/sh".to_string(), "-c".to_string(), "sleep 60".to_string()],
            env: vec![],
            cwd: None,
            mode: CreateMode::OpenOrCreate,
        }))?;
        match resp {
            Response::Created(c) => assert_eq!(c.outcome, CreateOutcome::Existing),
            other => return Err(anyhow::anyhow!("unexpected response: {:?}", other)),
        }

        Ok(())
    })
}

#[test]
#[timeout(30000)]
fn reattach_after_detach_replays_screen() -> anyhow::Result<()> {
    dump_err(|| {
        let dir = tmpdir::Dir::new("/tmp/hauntty-test")?;
        let daemon = Proc::new_in(dir.path(), DaemonArgs::default()).context("starting daemon")?;

        let mut client = Client::connect(&daemon.socket_path)?;
        let token =
            create(&mut client, "reattach", &["/bin/sh", "-c", "printf marker\\\\n; sleep 60"])?;
        client.roundtrip(&Request::Attach(AttachRequest {
            name: "reattach".to_string(),
            size: win(80, 24),
            read_only: false,
            client_tty: None,
            attach_token: Some(token),
        }))?;
        let mut out = OutputMatcher::new();
        out.wait_for(&mut client, "marker", Duration::from_secs(5))?;
        client.send(&Request::Detach(DetachRequest {
            name: "reattach".to_string(),
            target_client_id: None,
            target_tty: None,
        }))?;
        assert_eq!(client.recv()?, Response::Ok);

        let mut second = Client::connect(&daemon.socket_path)?;
        let resp = second.roundtrip(&Request::Attach(AttachRequest {
            name: "reattach".to_string(),
            size: win(80, 24),
            read_only: false,
            client_tty: None,
            attach_token: None,
        }))?;
        let attached = match resp {
            Response::Attached(a) => a,
            other => return Err(anyhow::anyhow!("expected Attached, got {:?}", other)),
        };
        assert!(
            String::from_utf8_lossy(&attached.screen_dump).contains("marker"),
            "expected the redrawn screen to still contain the earlier output"
        );

        Ok(())
    })
}
