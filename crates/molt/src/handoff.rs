//! Descriptor handoff across re-execution.
//!
//! The parent exports each listener as an inherited fd and one environment
//! entry per listener:
//!
//! ```text
//! <md5 hex of canonical address>=<fd offset>
//! ```
//!
//! Offsets start at 3 (after stdio) and follow the registry's sorted order.
//! Placement happens in two phases so no source fd is clobbered: every
//! listener is first duplicated above the target range with close-on-exec
//! set, then `dup2`'d onto its offset in the forked child, which clears
//! close-on-exec on the target only.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::io;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command};

use tracing::{debug, error, warn};

use crate::address::Address;
use crate::container::Container;

/// Marks a re-executed process.
pub const ENV_IS_CHILD: &str = "MOLT_IS_CHILD";

/// Marks that fd offsets were exported in single-process mode.
pub const ENV_FDS_IN_SINGLE: &str = "MOLT_FDS_IN_SINGLE";

/// First inherited fd; 0..2 are stdio.
pub const DEFAULT_OFFSET: RawFd = 3;

/// Lowest fd used for the temporary close-on-exec duplicates.
const STAGING_FLOOR: RawFd = 100;

/// One exported listener.
#[derive(Debug)]
struct Exported {
    name: String,
    env_key: String,
    offset: RawFd,
    fd: OwnedFd,
}

/// Listeners prepared for a child process.
///
/// Holds close-on-exec duplicates of every exported socket; they are closed
/// when the handoff is dropped, after the child has been spawned.
#[derive(Debug, Default)]
pub struct Handoff {
    exported: Vec<Exported>,
    single_process: bool,
}

impl Handoff {
    /// Snapshot the registry in sorted order.
    ///
    /// Slots without a listener and descriptors that cannot be duplicated
    /// are logged and skipped; the remaining listeners keep dense offsets.
    pub fn export(container: &Container) -> Self {
        let filled = container.iter().filter(|(_, slot)| slot.is_some()).count();
        let floor = STAGING_FLOOR.max(DEFAULT_OFFSET + filled as RawFd);

        let mut exported = Vec::with_capacity(filled);
        for (name, slot) in container.iter() {
            let Some(listener) = slot else {
                warn!(name, "No listener acquired for address, not exported");
                continue;
            };

            match listener.dup_above(floor) {
                Ok(fd) => {
                    let offset = DEFAULT_OFFSET + exported.len() as RawFd;
                    debug!(name, offset, staged_fd = fd.as_raw_fd(), "Listener exported");
                    exported.push(Exported {
                        name: name.to_string(),
                        env_key: crate::address::env_key_for(name),
                        offset,
                        fd,
                    });
                }
                Err(e) => {
                    error!(name, error = %e, "Failed to duplicate listener fd, not exported");
                }
            }
        }

        Self {
            exported,
            single_process: false,
        }
    }

    /// Mark the child as a single-process replacement
    /// (`MOLT_FDS_IN_SINGLE=true`). Leave unset when spawning workers.
    pub fn single_process(mut self) -> Self {
        self.single_process = true;
        self
    }

    pub fn len(&self) -> usize {
        self.exported.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exported.is_empty()
    }

    /// `(canonical name, offset)` pairs in export order.
    pub fn offsets(&self) -> impl Iterator<Item = (&str, RawFd)> {
        self.exported.iter().map(|e| (e.name.as_str(), e.offset))
    }

    /// Staged descriptors in export order.
    pub fn fds(&self) -> impl Iterator<Item = &OwnedFd> {
        self.exported.iter().map(|e| &e.fd)
    }

    /// Offset environment entries: md5 key to decimal offset.
    pub fn env(&self) -> Vec<(String, String)> {
        self.exported
            .iter()
            .map(|e| (e.env_key.clone(), e.offset.to_string()))
            .collect()
    }

    /// Build a command that starts `program` with every exported listener
    /// placed at its offset.
    ///
    /// The handoff must stay alive until the command has been spawned.
    pub fn command<I, S>(&self, program: &Path, args: I, dir: &Path) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut command = Command::new(program);
        command.args(args).current_dir(dir);

        // Offsets inherited from our own parent would point at the wrong fds
        // in the new process.
        for (key, _) in std::env::vars_os() {
            if key.to_str().is_some_and(is_offset_key) {
                command.env_remove(key);
            }
        }

        command.env(ENV_IS_CHILD, "true").envs(self.env());
        if self.single_process {
            command.env(ENV_FDS_IN_SINGLE, "true");
        } else {
            command.env_remove(ENV_FDS_IN_SINGLE);
        }

        let placements: Vec<(RawFd, RawFd)> = self
            .exported
            .iter()
            .map(|e| (e.fd.as_raw_fd(), e.offset))
            .collect();

        // SAFETY: the closure runs between fork and exec and only calls
        // dup2, which is async-signal-safe; `placements` was allocated
        // before the fork. Staged fds sit above every target offset.
        unsafe {
            command.pre_exec(move || {
                for &(staged, offset) in &placements {
                    if libc::dup2(staged, offset) < 0 {
                        return Err(io::Error::last_os_error());
                    }
                }
                Ok(())
            });
        }

        command
    }

    /// Spawn `program` with the exported listeners, then release the staged fds.
    pub fn spawn<I, S>(self, program: &Path, args: I, dir: &Path) -> io::Result<Child>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut command = self.command(program, args, dir);
        command.spawn()
    }
}

/// Offsets inherited from the parent process, keyed by md5 env key.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Inherited {
    offsets: HashMap<String, RawFd>,
}

impl Inherited {
    /// Read every offset entry from the process environment.
    ///
    /// Variables that are not valid UTF-8 cannot be offset entries and are
    /// skipped.
    pub fn from_env() -> Self {
        Self::from_env_vars(
            std::env::vars_os()
                .filter_map(|(key, value)| Some((key.into_string().ok()?, value.into_string().ok()?))),
        )
    }

    /// Keep the pairs shaped like offset entries: a 32-digit lowercase hex
    /// key and an integer value of at least 3.
    pub fn from_env_vars<I>(vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let offsets = vars
            .into_iter()
            .filter(|(key, _)| is_offset_key(key))
            .filter_map(|(key, value)| {
                let offset = value.trim().parse::<RawFd>().ok()?;
                (offset >= DEFAULT_OFFSET).then_some((key, offset))
            })
            .collect();
        Self { offsets }
    }

    /// Build from `(canonical address, offset)` pairs.
    pub fn from_offsets<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, RawFd)>,
        S: AsRef<str>,
    {
        let offsets = pairs
            .into_iter()
            .map(|(name, offset)| (crate::address::env_key_for(name.as_ref()), offset))
            .collect();
        Self { offsets }
    }

    /// The offset exported for `address`, without consuming it.
    pub fn offset_for(&self, address: &Address) -> Option<RawFd> {
        self.offsets.get(&address.env_key()).copied()
    }

    /// Remove and return the offset exported for `address`.
    ///
    /// Each offset is adopted at most once.
    pub fn take(&mut self, address: &Address) -> Option<RawFd> {
        self.offsets.remove(&address.env_key())
    }

    /// Remove every remaining entry as `(env key, offset)` pairs.
    pub fn take_all(&mut self) -> Vec<(String, RawFd)> {
        self.offsets.drain().collect()
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }
}

/// Whether `key` has the shape of an offset entry.
pub fn is_offset_key(key: &str) -> bool {
    key.len() == 32 && key.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
