//! The handoff orchestrator.
//!
//! # Data Flow
//! ```text
//! register(adapter)      reserve ordinal (or bind now, multi-process master)
//!     → get_listener     bind fresh, or adopt the fd inherited from the parent
//!     → wait()           signal loop (signals.rs)
//!         SIGUSR2        → reload_single(): export fds + offsets, re-exec
//!         SIGTERM etc.   → exit hooks under the wait budget
//! ```

use std::fmt;
use std::os::unix::io::{FromRawFd, OwnedFd};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::address::Address;
use crate::config::{GraceConfig, Role};
use crate::container::Container;
use crate::error::{GraceError, Result};
use crate::handoff::{Handoff, Inherited};
use crate::hooks::{self, Hook, Outcome};
use crate::listener::{validate_fd, Listener};
use crate::signals::SignalChannel;

/// A server that serves on a listener provided by [`Grace`].
///
/// Implemented by framework shims. Setting the address and serving on the
/// listener are the adapter's own business.
pub trait Adapter {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// The address to listen on.
    fn address(&self) -> &Address;

    /// Receive the orchestrator back-reference during registration.
    fn attach(&mut self, grace: Arc<Grace>);
}

/// Lifecycle status of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Status {
    #[default]
    Unknown,
    /// A replacement process has been spawned.
    Reloading,
    /// A terminal signal was handled. Never left.
    Exiting,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Unknown => write!(f, "Unknown"),
            Status::Reloading => write!(f, "Reloading"),
            Status::Exiting => write!(f, "Exiting"),
        }
    }
}

/// Single-process exit behaviour.
#[derive(Clone)]
pub(crate) enum SingleExit {
    /// Run as-is.
    Raw(Hook),
    /// `clean_up` only on a genuine exit, then `before_exit`.
    Composed {
        before_exit: Hook,
        clean_up: Option<Hook>,
    },
}

#[derive(Default)]
pub(crate) struct Hooks {
    pub(crate) single_exit: Option<SingleExit>,
    pub(crate) master_exit: Option<Hook>,
    pub(crate) master_reload: Option<Hook>,
    pub(crate) worker_exit: Option<Hook>,
}

/// Owns the listener registry and drives registration, acquisition and
/// reload for one process.
pub struct Grace {
    role: Role,
    status: Mutex<Status>,
    max_wait: Mutex<Duration>,
    working_dir: PathBuf,
    program: Option<PathBuf>,
    listeners: Mutex<Container>,
    inherited: Mutex<Inherited>,
    hooks: Mutex<Hooks>,
    signals: Mutex<Option<SignalChannel>>,
}

impl fmt::Debug for Grace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Grace")
            .field("role", &self.role)
            .field("status", &self.status())
            .field("max_wait", &self.max_wait())
            .field("working_dir", &self.working_dir)
            .field("program", &self.program)
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Grace {
    /// Create an orchestrator for an explicitly chosen role.
    pub fn new(role: Role, config: GraceConfig) -> Self {
        let working_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self {
            role,
            status: Mutex::new(Status::Unknown),
            max_wait: Mutex::new(config.max_wait),
            working_dir,
            program: None,
            listeners: Mutex::new(Container::new()),
            inherited: Mutex::new(Inherited::default()),
            hooks: Mutex::new(Hooks::default()),
            signals: Mutex::new(None),
        }
    }

    /// Create an orchestrator from the process environment.
    ///
    /// Reads the configuration, the role and, in child roles, the inherited
    /// offsets. Call once at startup.
    pub fn from_env() -> Self {
        let config = GraceConfig::from_env();
        let role = Role::detect(config.multi);
        let inherited = if role.is_child() {
            Inherited::from_env()
        } else {
            Inherited::default()
        };

        info!(
            role = %role,
            max_wait_secs = config.max_wait.as_secs(),
            inherited = inherited.len(),
            "Graceful restart orchestrator created"
        );

        Self::new(role, config).with_inherited(inherited)
    }

    /// Use `inherited` as the table of fds passed by the parent.
    pub fn with_inherited(self, inherited: Inherited) -> Self {
        *lock(&self.inherited) = inherited;
        self
    }

    /// Run re-executed processes in `dir` instead of the startup directory.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    /// Re-execute `program` on reload instead of the current executable.
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = Some(program.into());
        self
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn status(&self) -> Status {
        *lock(&self.status)
    }

    /// Move to `status`. `Exiting` is absorbing; returns false if ignored.
    pub(crate) fn set_status(&self, status: Status) -> bool {
        let mut current = lock(&self.status);
        if *current == Status::Exiting {
            return false;
        }
        *current = status;
        true
    }

    pub(crate) fn hooks(&self) -> MutexGuard<'_, Hooks> {
        lock(&self.hooks)
    }

    pub(crate) fn signal_channel(&self) -> MutexGuard<'_, Option<SignalChannel>> {
        lock(&self.signals)
    }

    pub fn max_wait(&self) -> Duration {
        *lock(&self.max_wait)
    }

    pub fn set_max_wait(&self, max_wait: Duration) {
        *lock(&self.max_wait) = max_wait;
    }

    /// Register an adapter's address before it runs.
    ///
    /// A multi-process master binds now; every other role only reserves the
    /// ordinal slot so offsets agree across processes. Nothing is recorded
    /// if validation or binding fails.
    pub fn register<A>(self: &Arc<Self>, adapter: &mut A) -> Result<()>
    where
        A: Adapter + ?Sized,
    {
        let address = adapter.address().clone();
        address.check()?;
        let name = address.canonical();

        {
            let mut listeners = lock(&self.listeners);
            if listeners.contains(&name) {
                return Err(GraceError::AlreadyRegistered(name));
            }

            match self.role {
                Role::MultiMaster => {
                    let listener = Listener::bind(&address)?;
                    listeners.add(name.clone(), listener);
                }
                Role::SingleMaster | Role::SingleChild | Role::MultiWorker => {
                    listeners.add_null(name.clone());
                }
            }
        }

        adapter.attach(Arc::clone(self));
        info!(app = adapter.name(), address = %name, role = %self.role, "Registered");
        Ok(())
    }

    /// Resolve the listener for a registered adapter. Call once per adapter.
    ///
    /// - multi-process master: the listener bound at registration
    /// - single-process master: a freshly bound listener
    /// - child roles: the fd inherited from the parent if one was exported
    ///   for this address, otherwise a freshly bound listener
    pub fn get_listener<A>(&self, adapter: &A) -> Result<Listener>
    where
        A: Adapter + ?Sized,
    {
        let address = adapter.address();
        address.check()?;
        let name = address.canonical();

        if !lock(&self.listeners).contains(&name) {
            return Err(GraceError::NotRegistered(name));
        }

        let listener = match self.role {
            Role::MultiMaster => {
                let listeners = lock(&self.listeners);
                let bound = listeners
                    .get(&name)
                    .ok_or_else(|| GraceError::NotRegistered(name.clone()))?;
                return bound.try_clone().map_err(|source| GraceError::Listen {
                    address: name.clone(),
                    source,
                });
            }
            Role::SingleMaster => Listener::bind(address)?,
            Role::SingleChild | Role::MultiWorker => {
                let inherited = lock(&self.inherited).take(address);
                match inherited {
                    Some(fd) => {
                        info!(
                            app = adapter.name(),
                            address = %name,
                            fd,
                            parent = std::os::unix::process::parent_id(),
                            "Listener inherited from parent"
                        );
                        Listener::adopt(fd)?
                    }
                    None => Listener::bind(address)?,
                }
            }
        };

        self.store_listener(&name, &listener)?;
        Ok(listener)
    }

    /// Keep a registry handle of `listener` under `name` for export.
    pub(crate) fn store_listener(&self, name: &str, listener: &Listener) -> Result<()> {
        let handle = listener.try_clone().map_err(|source| GraceError::Listen {
            address: name.to_string(),
            source,
        })?;
        lock(&self.listeners).add(name, handle);
        Ok(())
    }

    /// Close inherited listeners that no adapter claimed.
    ///
    /// Call after every adapter has acquired its listener; [`Grace::wait`]
    /// does. An unclaimed offset belongs to an address this process no longer
    /// serves. Returns how many were closed.
    pub fn release_unclaimed(&self) -> usize {
        let leftover = lock(&self.inherited).take_all();
        let mut closed = 0;
        for (env_key, fd) in leftover {
            if !validate_fd(fd) {
                warn!(env_key, fd, "Unclaimed inherited offset is not a socket, left alone");
                continue;
            }
            warn!(env_key, fd, "Inherited listener not claimed by any adapter, closing");
            // SAFETY: the parent placed this socket for us and no adapter
            // adopted it, so nothing else owns the descriptor.
            drop(unsafe { OwnedFd::from_raw_fd(fd) });
            closed += 1;
        }
        closed
    }

    /// Ordinal of `address` in the registry.
    pub fn search_index(&self, address: &Address) -> Option<usize> {
        lock(&self.listeners).search_index(&address.canonical())
    }

    /// Registered canonical names, sorted.
    pub fn registered(&self) -> Vec<String> {
        lock(&self.listeners).names().map(str::to_string).collect()
    }

    /// Export every acquired listener for a new process.
    ///
    /// Used by [`Grace::reload_single`]; also the seam for externally
    /// managed worker processes in multi-process mode.
    pub fn handoff(&self) -> Handoff {
        Handoff::export(&lock(&self.listeners))
    }

    /// Re-execute the current binary with every listener handed over.
    ///
    /// Returns the new process id. On failure nothing changes and this
    /// process keeps serving.
    pub fn reload_single(&self) -> Result<u32> {
        if self.role.is_multi() {
            return Err(GraceError::NotSingleProcess);
        }

        let exe = match &self.program {
            Some(program) => program.clone(),
            None => std::env::current_exe().map_err(GraceError::Spawn)?,
        };
        let args: Vec<_> = std::env::args_os().skip(1).collect();
        let handoff = self.handoff().single_process();

        info!(
            exe = %exe.display(),
            listener_count = handoff.len(),
            "Re-executing for graceful reload"
        );

        let child = handoff
            .spawn(&exe, &args, &self.working_dir)
            .map_err(GraceError::Spawn)?;

        info!(
            pid = std::process::id(),
            child_pid = child.id(),
            "New process started"
        );
        Ok(child.id())
    }

    /// Ask the parent to terminate, ending the overlap after a reload.
    ///
    /// Only a single-process child does this, and never towards init.
    pub fn notify_parent(&self) {
        if self.role != Role::SingleChild {
            return;
        }

        let parent = std::os::unix::process::parent_id();
        if parent == 1 {
            warn!("Parent already exited, nothing to notify");
            return;
        }

        let result = unsafe { libc::kill(parent as libc::pid_t, libc::SIGTERM) };
        if result != 0 {
            error!(
                parent,
                error = %std::io::Error::last_os_error(),
                "Failed to send SIGTERM to parent process"
            );
            return;
        }

        info!(
            pid = std::process::id(),
            parent,
            "Graceful restart: child sent SIGTERM to parent"
        );
    }

    /// Bounded wait on `work` using the current wait budget.
    pub async fn execute_with_timeout<W>(&self, action: &str, work: W) -> Outcome
    where
        W: FnOnce(Instant) -> oneshot::Receiver<()>,
    {
        hooks::execute_with_timeout(action, self.max_wait(), work).await
    }

    /// Run `chain` on a hook thread under the wait budget.
    pub(crate) async fn run_hooks(&self, action: &str, chain: Vec<(&'static str, Hook)>) -> Outcome {
        self.execute_with_timeout(action, |_| hooks::spawn_chain(action, chain))
            .await
    }

    /// Hook run on exit in single-process mode, as-is.
    pub fn set_single_exit_hook(&self, hook: Hook) {
        lock(&self.hooks).single_exit = Some(SingleExit::Raw(hook));
    }

    /// Exit hooks for single-process mode.
    ///
    /// `clean_up` runs only on a genuine exit, not when this process is
    /// exiting because it handed its listeners to a replacement. Then
    /// `before_exit` runs. Both share one wait budget.
    pub fn set_exit_hooks_for_single(&self, before_exit: Hook, clean_up: Option<Hook>) {
        lock(&self.hooks).single_exit = Some(SingleExit::Composed {
            before_exit,
            clean_up,
        });
    }

    /// Hook run by a multi-process master on a terminal signal.
    pub fn set_master_exit_hook(&self, hook: Hook) {
        lock(&self.hooks).master_exit = Some(hook);
    }

    /// Hook run by a multi-process master on the reload signal.
    pub fn set_master_reload_hook(&self, hook: Hook) {
        lock(&self.hooks).master_reload = Some(hook);
    }

    /// Hook run by a multi-process worker on a terminal signal.
    pub fn set_worker_exit_hook(&self, hook: Hook) {
        lock(&self.hooks).worker_exit = Some(hook);
    }
}
