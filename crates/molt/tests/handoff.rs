//! Descriptor handoff into a real child process.
//!
//! Run with: `cargo test -p molt --test handoff`

#![cfg(target_os = "linux")]

use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use molt::{Adapter, Address, Grace, GraceConfig, Role};

struct ShellApp {
    address: Address,
    grace: Option<Arc<Grace>>,
}

impl Adapter for ShellApp {
    fn name(&self) -> &str {
        "shell"
    }

    fn address(&self) -> &Address {
        &self.address
    }

    fn attach(&mut self, grace: Arc<Grace>) {
        self.grace = Some(grace);
    }
}

fn sock_path(tag: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("molt-it-{}-{tag}.sock", std::process::id()));
    let _ = std::fs::remove_file(&path);
    path
}

fn socket_inode(fd: i32) -> String {
    std::fs::read_link(format!("/proc/self/fd/{fd}"))
        .unwrap()
        .display()
        .to_string()
}

#[test]
fn test_child_receives_listeners_at_offsets() {
    let grace = Arc::new(Grace::new(Role::SingleMaster, GraceConfig::default()));

    // Registered out of order; offsets follow sorted canonical names.
    let (path_a, path_b) = (sock_path("a"), sock_path("b"));
    let mut app_b = ShellApp {
        address: Address::unix(&path_b),
        grace: None,
    };
    let mut app_a = ShellApp {
        address: Address::unix(&path_a),
        grace: None,
    };
    grace.register(&mut app_b).unwrap();
    grace.register(&mut app_a).unwrap();
    assert!(app_a.grace.is_some() && app_b.grace.is_some());

    let listener_b = grace.get_listener(&app_b).unwrap();
    let listener_a = grace.get_listener(&app_a).unwrap();

    let handoff = grace.handoff().single_process();
    assert_eq!(handoff.len(), 2);

    let script = format!(
        "readlink /proc/self/fd/3; readlink /proc/self/fd/4; \
         echo \"child=$MOLT_IS_CHILD\"; echo \"single=$MOLT_FDS_IN_SINGLE\"; \
         printenv {}; printenv {}",
        app_a.address.env_key(),
        app_b.address.env_key(),
    );

    let output = handoff
        .command(Path::new("/bin/sh"), ["-c", script.as_str()], &std::env::temp_dir())
        .stdin(Stdio::null())
        .output()
        .expect("spawn /bin/sh");
    drop(handoff);

    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8(output.stdout).unwrap();
    let lines: Vec<&str> = stdout.lines().collect();

    // Same sockets as the parent's, not new ones.
    assert_eq!(lines[0], socket_inode(listener_a.as_raw_fd()));
    assert_eq!(lines[1], socket_inode(listener_b.as_raw_fd()));
    assert!(lines[0].starts_with("socket:["));
    assert_eq!(lines[2], "child=true");
    assert_eq!(lines[3], "single=true");
    assert_eq!(lines[4], "3");
    assert_eq!(lines[5], "4");

    // Both listeners still serve in the parent.
    assert!(std::os::unix::net::UnixStream::connect(&path_a).is_ok());
    assert!(std::os::unix::net::UnixStream::connect(&path_b).is_ok());

    let _ = std::fs::remove_file(&path_a);
    let _ = std::fs::remove_file(&path_b);
}

#[test]
fn test_staged_fds_do_not_leak_into_child() {
    let grace = Arc::new(Grace::new(Role::SingleMaster, GraceConfig::default()));
    let path = sock_path("leak");
    let mut app = ShellApp {
        address: Address::unix(&path),
        grace: None,
    };
    grace.register(&mut app).unwrap();
    let _listener = grace.get_listener(&app).unwrap();

    let handoff = grace.handoff();
    let staged: Vec<i32> = handoff.fds().map(|fd| fd.as_raw_fd()).collect();
    let script = format!("test -e /proc/self/fd/{} && echo leaked || echo closed", staged[0]);

    let output = handoff
        .command(Path::new("/bin/sh"), ["-c", script.as_str()], &std::env::temp_dir())
        .output()
        .expect("spawn /bin/sh");

    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "closed");
    let _ = std::fs::remove_file(&path);
}
