//! Behaviour every adapter must share, run once per provider.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::sandbox::error::SandboxError;
use crate::sandbox::handle::Sandbox;
use crate::sandbox::types::*;

/// What the provider under test can do natively or by emulation.
#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
    pub suspend: bool,
    pub terminal: bool,
    pub delete_directory: bool,
    /// `id()` works while connected (false only for Modal).
    pub id_while_connected: bool,
    /// `init(Some(unknown))` is rejected with `NotFound`.
    pub missing_id_fails: bool,
}

pub async fn run_contract_suite<F>(make: F, caps: Capabilities)
where
    F: Fn() -> Box<dyn Sandbox>,
{
    operations_require_connection(make()).await;

    let mut sbx = make();
    sbx.init(None, &CreateSandboxOptions::default())
        .await
        .expect("init");
    assert!(matches!(
        sbx.init(None, &CreateSandboxOptions::default()).await,
        Err(SandboxError::InvalidState(_))
    ));

    files_round_trip(sbx.as_ref(), caps).await;
    commands(sbx.as_ref()).await;
    terminal(sbx.as_ref(), caps).await;
    suspend_resume(sbx.as_mut(), caps).await;
    second_instance_sees_writes(&make, sbx.as_mut(), caps).await;

    sbx.destroy().await.expect("first destroy");
    sbx.destroy().await.expect("second destroy is a no-op");
    assert!(matches!(sbx.run("echo hi").await, Err(SandboxError::NotConnected)));
    assert!(matches!(sbx.id(), Err(SandboxError::NotConnected)));

    if caps.missing_id_fails {
        let mut ghost = make();
        let err = ghost
            .init(Some("does-not-exist"), &CreateSandboxOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::NotFound(_)), "got {err:?}");
    }
}

async fn operations_require_connection(mut sbx: Box<dyn Sandbox>) {
    let not_connected = |r: Result<(), SandboxError>| matches!(r, Err(SandboxError::NotConnected));

    assert!(matches!(sbx.id(), Err(SandboxError::NotConnected)));
    assert!(matches!(sbx.run("ls").await, Err(SandboxError::NotConnected)));
    assert!(matches!(sbx.read_file("a").await, Err(SandboxError::NotConnected)));
    assert!(not_connected(sbx.write_file("a", "b").await));
    assert!(matches!(sbx.list_files(".").await, Err(SandboxError::NotConnected)));
    assert!(not_connected(sbx.move_file("a", "b").await));
    assert!(not_connected(sbx.delete_file("a").await));
    assert!(not_connected(sbx.create_directory("d").await));
    assert!(matches!(sbx.get_preview_url(3000).await, Err(SandboxError::NotConnected)));
    assert!(matches!(
        sbx.create_terminal(Box::new(|_| {})).await,
        Err(SandboxError::NotConnected)
    ));
    assert!(sbx.suspend().await.unwrap_err().is_state_error());
    assert!(sbx.resume().await.unwrap_err().is_state_error());
    sbx.destroy().await.expect("destroy before init is a no-op");
}

async fn files_round_trip(sbx: &dyn Sandbox, caps: Capabilities) {
    let content = format!("Hello from {} sandbox!", sbx.provider());
    sbx.write_file("testfile.txt", &content).await.expect("write");
    assert_eq!(sbx.read_file("testfile.txt").await.expect("read"), content);

    sbx.create_directory("testdir").await.expect("mkdir");
    let root = sbx.list_files(".").await.expect("list root");
    assert!(root.contains(&FileEntry::directory("testdir")), "{root:?}");
    assert!(root.contains(&FileEntry::file("testfile.txt")), "{root:?}");

    sbx.write_file("moved.txt", "move me").await.expect("write");
    sbx.move_file("moved.txt", "testdir/moved.txt")
        .await
        .expect("move");
    let root = sbx.list_files(".").await.expect("list root");
    assert!(!root.iter().any(|e| e.name == "moved.txt"), "{root:?}");
    let inner = sbx.list_files("testdir").await.expect("list testdir");
    assert!(inner.contains(&FileEntry::file("moved.txt")), "{inner:?}");

    sbx.delete_file("testdir/moved.txt").await.expect("delete file");
    let inner = sbx.list_files("testdir").await.expect("list testdir");
    assert!(inner.is_empty(), "{inner:?}");

    let removed = sbx.delete_file("testdir").await;
    if caps.delete_directory {
        removed.expect("delete directory");
        let root = sbx.list_files(".").await.expect("list root");
        assert!(!root.iter().any(|e| e.name == "testdir"), "{root:?}");
    } else {
        assert!(matches!(removed, Err(SandboxError::Unsupported(_))), "{removed:?}");
    }
}

async fn commands(sbx: &dyn Sandbox) {
    let res = sbx.run("exit 3").await.expect("exit 3 is a result");
    assert_eq!(res.exit_code(), Some(3));

    let res = sbx.run("cat testfile.txt").await.expect("cat");
    assert_eq!(res.exit_code(), Some(0));
    assert!(res.output().unwrap_or_default().contains("sandbox!"));

    let opts = RunCommandOptions::default().with_env("GREETING", "hi");
    let res = sbx.run_command("echo $GREETING", &opts).await.expect("env");
    assert_eq!(res.output().map(str::trim), Some("hi"));

    let res = tokio::time::timeout(
        Duration::from_secs(2),
        sbx.run_command("sleep 30", &RunCommandOptions::background()),
    )
    .await
    .expect("background returns promptly")
    .expect("background");
    assert!(res.pid().is_some_and(|pid| pid > 0), "{res:?}");

    let opts = RunCommandOptions::default().with_timeout(Duration::from_millis(50));
    let err = sbx.run_command("sleep 5", &opts).await.unwrap_err();
    assert!(matches!(err, SandboxError::Timeout(_)), "{err:?}");
}

async fn terminal(sbx: &dyn Sandbox, caps: Capabilities) {
    let seen = Arc::new(Mutex::new(String::new()));
    let sink = seen.clone();
    let created = sbx
        .create_terminal(Box::new(move |chunk| sink.lock().unwrap().push_str(&chunk)))
        .await;
    if !caps.terminal {
        assert!(matches!(created, Err(SandboxError::Unsupported(_))));
        return;
    }
    let mut term = created.expect("terminal");
    term.write("echo terminal-ok\n").await.expect("write");
    for _ in 0..100 {
        if seen.lock().unwrap().contains("\nterminal-ok\n") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(seen.lock().unwrap().contains("\nterminal-ok\n"));
    term.kill().await.expect("kill");
    term.kill().await.expect("second kill is a no-op");
}

async fn suspend_resume(sbx: &mut dyn Sandbox, caps: Capabilities) {
    if !caps.suspend {
        assert!(matches!(sbx.suspend().await, Err(SandboxError::Unsupported(_))));
        assert!(matches!(sbx.resume().await, Err(SandboxError::Unsupported(_))));
        return;
    }
    assert!(sbx.resume().await.unwrap_err().is_state_error());

    sbx.write_file("persist.txt", "still here").await.expect("write");
    sbx.suspend().await.expect("suspend");
    assert!(sbx.suspend().await.unwrap_err().is_state_error());
    assert!(matches!(sbx.run("ls").await, Err(SandboxError::NotConnected)));

    sbx.resume().await.expect("resume");
    assert_eq!(
        sbx.read_file("persist.txt").await.expect("read after resume"),
        "still here"
    );
    assert!(sbx.resume().await.unwrap_err().is_state_error());
}

async fn second_instance_sees_writes<F>(make: &F, sbx: &mut dyn Sandbox, caps: Capabilities)
where
    F: Fn() -> Box<dyn Sandbox>,
{
    let greeting = format!("Hello from {} sandbox!", sbx.provider());
    sbx.write_file("testfile.txt", &greeting).await.expect("write");

    let id = if caps.id_while_connected {
        sbx.id().expect("id")
    } else {
        assert!(sbx.id().is_err());
        sbx.suspend().await.expect("suspend for id");
        sbx.id().expect("id after suspend")
    };

    let mut other = make();
    other
        .init(Some(&id), &CreateSandboxOptions::default())
        .await
        .expect("connect by id");
    let res = other.run("cat testfile.txt").await.expect("cat");
    assert_eq!(res.output(), Some(greeting.as_str()));
    // Dropped, not destroyed: it may share the remote sandbox with `sbx`.
    drop(other);

    if !caps.id_while_connected {
        sbx.resume().await.expect("resume after id");
    }
}
