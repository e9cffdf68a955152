//! End-to-end reload of the built binary over a unix socket.
//!
//! Run with: `cargo test -p molt-server --test restart`

#![cfg(target_os = "linux")]

use std::io::Read;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

const DEADLINE: Duration = Duration::from_secs(15);

fn sock_path(tag: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("molt-restart-{}-{tag}.sock", std::process::id()));
    let _ = std::fs::remove_file(&path);
    path
}

fn start_server(path: &Path) -> Child {
    Command::new(env!("CARGO_BIN_EXE_molt-server"))
        .args(["serve", "--listen"])
        .arg(format!("unix@{}", path.display()))
        .env("RUST_LOG", "warn")
        .env_remove("MOLT_IS_CHILD")
        .env_remove("MOLT_MULTI")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("start molt-server")
}

/// Connect and read the greeting. `Err` only when the connection was refused.
fn greet(path: &Path) -> std::io::Result<Option<u32>> {
    let mut stream = UnixStream::connect(path)?;
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut reply = String::new();
    let _ = stream.read_to_string(&mut reply);
    // "OK! Hello app0! (pid 1234)"
    Ok(reply
        .trim()
        .strip_suffix(')')
        .and_then(|s| s.rsplit_once("(pid "))
        .and_then(|(_, pid)| pid.parse().ok()))
}

fn signal(pid: u32, sig: libc::c_int) {
    let rc = unsafe { libc::kill(pid as libc::pid_t, sig) };
    assert_eq!(rc, 0, "kill({pid}, {sig}) failed");
}

/// Poll until a process other than `original` answers; every connection
/// must succeed meanwhile.
fn wait_for_replacement(path: &Path, original: u32) -> u32 {
    let start = Instant::now();
    loop {
        match greet(path).expect("connection refused during handoff") {
            Some(pid) if pid != original => return pid,
            _ => {}
        }
        assert!(start.elapsed() < DEADLINE, "replacement never took over");
        std::thread::sleep(Duration::from_millis(20));
    }
}

fn wait_for_exit(server: &mut Child) -> ExitStatus {
    let start = Instant::now();
    loop {
        if let Some(status) = server.try_wait().unwrap() {
            return status;
        }
        assert!(start.elapsed() < DEADLINE, "original process did not exit");
        std::thread::sleep(Duration::from_millis(50));
    }
}

/// A genuine exit removes the socket file.
fn terminate(pid: u32, path: &Path) {
    signal(pid, libc::SIGTERM);
    let start = Instant::now();
    while path.exists() {
        assert!(start.elapsed() < DEADLINE, "socket file not cleaned up");
        std::thread::sleep(Duration::from_millis(50));
    }
}

#[test]
fn test_reload_hands_over_without_refusing_connections() {
    let path = sock_path("steady");
    let mut server = start_server(&path);
    let original = server.id();

    // Wait for the first process to serve.
    let start = Instant::now();
    loop {
        if let Ok(Some(pid)) = greet(&path) {
            assert_eq!(pid, original);
            break;
        }
        assert!(start.elapsed() < DEADLINE, "server never came up");
        std::thread::sleep(Duration::from_millis(50));
    }

    signal(original, libc::SIGUSR2);
    let replacement = wait_for_replacement(&path, original);

    // The replacement asks the original to exit; it leaves cleanly and
    // keeps the socket file the replacement is serving on.
    let status = wait_for_exit(&mut server);
    assert!(status.success(), "{status:?}");
    assert!(path.exists());
    assert_eq!(greet(&path).unwrap(), Some(replacement));

    terminate(replacement, &path);
}

#[test]
fn test_reload_right_after_bind_is_not_fatal() {
    for round in 0..8 {
        let path = sock_path(&format!("early-{round}"));
        let mut server = start_server(&path);
        let original = server.id();

        // Signal the moment the socket accepts, before the first greeting.
        let start = Instant::now();
        while UnixStream::connect(&path).is_err() {
            assert!(start.elapsed() < DEADLINE, "server never came up");
            std::thread::sleep(Duration::from_millis(1));
        }
        signal(original, libc::SIGUSR2);

        let replacement = wait_for_replacement(&path, original);
        let status = wait_for_exit(&mut server);
        assert!(status.success(), "round {round}: {status:?}");

        terminate(replacement, &path);
    }
}
