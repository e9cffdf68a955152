//! Signal-driven lifecycle.
//!
//! | Role | Reload | On terminal signal |
//! |---|---|---|
//! | single master / child | `SIGUSR2`: re-exec | single-process exit hooks |
//! | multi master | `SIGUSR2`: reload hook | master exit hook |
//! | multi worker | none | worker exit hook |
//!
//! Terminal signals are `SIGINT`, `SIGQUIT`, `SIGTERM`, `SIGABRT` and
//! `SIGKILL`. All but `SIGQUIT` cut the wait budget to one second.
//!
//! An OS forwarder task feeds one channel; the loop handles one signal at a
//! time, in arrival order. After the first terminal signal the terminal set
//! is reset to its default disposition, so a second Ctrl-C kills outright.

use std::fmt;
use std::future::poll_fn;
use std::task::Poll;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Role, SEVERE_MAX_WAIT};
use crate::error::{GraceError, Result};
use crate::grace::{Grace, SingleExit, Status};
use crate::hooks::{Hook, Outcome};

/// Signals the lifecycle reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    Interrupt,
    Quit,
    Terminate,
    Abort,
    /// Cannot be intercepted; listed so the terminal set is complete.
    Kill,
    User1,
    User2,
}

const TERMINAL: [Signal; 5] = [
    Signal::Interrupt,
    Signal::Quit,
    Signal::Terminate,
    Signal::Abort,
    Signal::Kill,
];

const WITH_RELOAD: [Signal; 7] = [
    Signal::Interrupt,
    Signal::Quit,
    Signal::Terminate,
    Signal::Abort,
    Signal::Kill,
    Signal::User1,
    Signal::User2,
];

impl Signal {
    /// The signal number.
    pub fn raw(&self) -> libc::c_int {
        match self {
            Signal::Interrupt => libc::SIGINT,
            Signal::Quit => libc::SIGQUIT,
            Signal::Terminate => libc::SIGTERM,
            Signal::Abort => libc::SIGABRT,
            Signal::Kill => libc::SIGKILL,
            Signal::User1 => libc::SIGUSR1,
            Signal::User2 => libc::SIGUSR2,
        }
    }

    /// Tokio signal kind, `None` for `SIGKILL`.
    fn kind(&self) -> Option<SignalKind> {
        match self {
            Signal::Interrupt => Some(SignalKind::interrupt()),
            Signal::Quit => Some(SignalKind::quit()),
            Signal::Terminate => Some(SignalKind::terminate()),
            Signal::Abort => Some(SignalKind::from_raw(libc::SIGABRT)),
            Signal::Kill => None,
            Signal::User1 => Some(SignalKind::user_defined1()),
            Signal::User2 => Some(SignalKind::user_defined2()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        TERMINAL.contains(self)
    }

    /// Terminal signals that force the one second wait budget.
    pub fn is_severe(&self) -> bool {
        matches!(
            self,
            Signal::Interrupt | Signal::Terminate | Signal::Abort | Signal::Kill
        )
    }

    /// Signals a process in `role` listens for.
    pub fn set_for(role: Role) -> &'static [Signal] {
        match role {
            Role::MultiWorker => &TERMINAL,
            Role::SingleMaster | Role::SingleChild | Role::MultiMaster => &WITH_RELOAD,
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Signal::Interrupt => "SIGINT",
            Signal::Quit => "SIGQUIT",
            Signal::Terminate => "SIGTERM",
            Signal::Abort => "SIGABRT",
            Signal::Kill => "SIGKILL",
            Signal::User1 => "SIGUSR1",
            Signal::User2 => "SIGUSR2",
        };
        f.write_str(name)
    }
}

/// How the signal loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exit {
    /// The terminal signal that was handled.
    pub signal: Signal,
    /// This process had already spawned a replacement.
    pub handed_off: bool,
    /// Whether the exit hooks finished within the wait budget.
    pub outcome: Outcome,
}

/// Owns the OS signal streams and forwards deliveries into one channel.
struct SignalForwarder {
    streams: Vec<(Signal, tokio::signal::unix::Signal)>,
}

impl SignalForwarder {
    fn register(set: &[Signal]) -> Result<Self> {
        let mut streams = Vec::with_capacity(set.len());
        for &sig in set {
            match sig.kind() {
                Some(kind) => streams.push((sig, signal(kind).map_err(GraceError::Signal)?)),
                None => debug!(signal = %sig, "Signal cannot be intercepted, not registered"),
            }
        }
        Ok(Self { streams })
    }

    async fn run(mut self, tx: mpsc::Sender<Signal>, disarm: CancellationToken) {
        let mut disarmed = false;
        loop {
            let next = tokio::select! {
                biased;
                _ = disarm.cancelled(), if !disarmed => {
                    self.disarm();
                    disarmed = true;
                    continue;
                }
                next = self.recv() => next,
            };

            match next {
                Some(sig) => {
                    if tx.send(sig).await.is_err() {
                        return;
                    }
                }
                None => return,
            }
        }
    }

    /// Next delivery on any stream. Pending forever when none are left.
    async fn recv(&mut self) -> Option<Signal> {
        if self.streams.is_empty() {
            return std::future::pending().await;
        }
        poll_fn(|cx| {
            for (sig, stream) in self.streams.iter_mut() {
                if let Poll::Ready(delivered) = stream.poll_recv(cx) {
                    return Poll::Ready(delivered.map(|()| *sig));
                }
            }
            Poll::Pending
        })
        .await
    }

    /// Stop intercepting terminal signals and restore their default action.
    fn disarm(&mut self) {
        self.streams.retain(|(sig, _)| !sig.is_terminal());
        for sig in TERMINAL {
            if sig == Signal::Kill {
                continue;
            }
            unsafe {
                libc::signal(sig.raw(), libc::SIG_DFL);
            }
        }
        debug!("Terminal signals reset to default disposition");
    }
}

fn channel_closed() -> GraceError {
    GraceError::Signal(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        "signal channel closed",
    ))
}

/// Signals forwarded by the OS task, waiting for [`Grace::wait`].
pub(crate) struct SignalChannel {
    rx: mpsc::Receiver<Signal>,
    disarm: CancellationToken,
}

impl Grace {
    /// Install the handlers for this role's signals.
    ///
    /// Call before serving on any listener. Until then a reload or terminal
    /// signal still has its default action and kills the process. Signals
    /// that arrive before [`Grace::wait`] are queued for it. Calling again is
    /// a no-op. Must run inside a tokio runtime.
    pub fn listen_signals(&self) -> Result<()> {
        let mut slot = self.signal_channel();
        if slot.is_some() {
            return Ok(());
        }

        let forwarder = SignalForwarder::register(Signal::set_for(self.role()))?;
        let (tx, rx) = mpsc::channel(16);
        let disarm = CancellationToken::new();
        tokio::spawn(forwarder.run(tx, disarm.clone()));
        debug!(role = %self.role(), "Signal handlers installed");

        *slot = Some(SignalChannel { rx, disarm });
        Ok(())
    }

    /// Block until this process should exit.
    ///
    /// Installs the signal handlers if [`Grace::listen_signals`] has not run,
    /// closes inherited listeners no adapter claimed, and lets a
    /// single-process child ask its parent to terminate. Returns after a
    /// terminal signal was handled and its hooks finished or timed out; the
    /// caller then leaves `main`.
    pub async fn wait(&self) -> Result<Exit> {
        self.listen_signals()?;
        let Some(SignalChannel { rx, disarm }) = self.signal_channel().take() else {
            return Err(channel_closed());
        };

        self.release_unclaimed();
        self.notify_parent();

        info!(
            pid = std::process::id(),
            role = %self.role(),
            "Waiting for signals"
        );

        self.run_signal_loop(rx, disarm).await.ok_or_else(channel_closed)
    }

    /// Handle signals from `rx` one at a time until an exit is reached.
    ///
    /// `disarm` is cancelled when the first terminal signal is handled.
    /// Returns `None` if the channel closes first.
    pub(crate) async fn run_signal_loop(
        &self,
        mut rx: mpsc::Receiver<Signal>,
        disarm: CancellationToken,
    ) -> Option<Exit> {
        let pid = std::process::id();
        while let Some(signal) = rx.recv().await {
            info!(pid, role = %self.role(), signal = %signal, "Received signal");
            if let Some(exit) = self.handle_signal(signal, &disarm).await {
                return Some(exit);
            }
        }
        None
    }

    async fn handle_signal(&self, signal: Signal, disarm: &CancellationToken) -> Option<Exit> {
        if self.status() == Status::Exiting {
            warn!(signal = %signal, "Already exiting, signal ignored");
            return None;
        }

        if signal.is_terminal() {
            disarm.cancel();
            if signal.is_severe() {
                self.set_max_wait(SEVERE_MAX_WAIT);
            }
            return match self.role() {
                Role::SingleMaster | Role::SingleChild => Some(self.exit_single(signal).await),
                Role::MultiMaster => self.exit_master(signal).await,
                Role::MultiWorker => Some(self.exit_worker(signal).await),
            };
        }

        match (self.role(), signal) {
            (Role::SingleMaster | Role::SingleChild, Signal::User2) => match self.reload_single() {
                Ok(child_pid) => {
                    self.set_status(Status::Reloading);
                    info!(child_pid, "Reloading, waiting for the new process to take over");
                }
                Err(e) => {
                    error!(error = %e, "Restart process failed, continuing to serve");
                }
            },
            (Role::MultiMaster, Signal::User2) => {
                let hook = self.hooks().master_reload.clone();
                match hook {
                    Some(hook) => {
                        self.set_status(Status::Reloading);
                        self.run_hooks("reload", vec![("master_reload", hook)]).await;
                    }
                    None => error!("Master reload hook is not set"),
                }
            }
            _ => debug!(signal = %signal, "Signal ignored"),
        }
        None
    }

    async fn exit_single(&self, signal: Signal) -> Exit {
        let pid = std::process::id();
        let handed_off = self.status() == Status::Reloading;
        self.set_status(Status::Exiting);

        if handed_off {
            info!(pid, "Parent process exiting after handoff");
        } else {
            info!(pid, "Process exiting");
        }

        let single_exit = self.hooks().single_exit.clone();
        let chain: Vec<(&'static str, Hook)> = match single_exit {
            None => Vec::new(),
            Some(SingleExit::Raw(hook)) => vec![("exit", hook)],
            Some(SingleExit::Composed {
                before_exit,
                clean_up,
            }) => {
                let mut chain = Vec::with_capacity(2);
                if let Some(clean_up) = clean_up.filter(|_| !handed_off) {
                    chain.push(("clean_up", clean_up));
                }
                chain.push(("before_exit", before_exit));
                chain
            }
        };

        let outcome = if chain.is_empty() {
            Outcome::Completed
        } else {
            self.run_hooks("exit", chain).await
        };

        info!(pid, outcome = ?outcome, "Process exited");
        Exit {
            signal,
            handed_off,
            outcome,
        }
    }

    async fn exit_master(&self, signal: Signal) -> Option<Exit> {
        self.set_status(Status::Exiting);
        let hook = self.hooks().master_exit.clone();
        let Some(hook) = hook else {
            error!("Master exit hook is not set");
            return None;
        };

        let outcome = self.run_hooks("exit", vec![("master_exit", hook)]).await;
        info!(pid = std::process::id(), outcome = ?outcome, "Master exited");
        Some(Exit {
            signal,
            handed_off: false,
            outcome,
        })
    }

    async fn exit_worker(&self, signal: Signal) -> Exit {
        let pid = std::process::id();
        self.set_status(Status::Exiting);
        info!(pid, "Worker exiting");

        let hook = self.hooks().worker_exit.clone();
        let outcome = match hook {
            Some(hook) => self.run_hooks("exit", vec![("worker_exit", hook)]).await,
            None => Outcome::Completed,
        };

        Exit {
            signal,
            handed_off: false,
            outcome,
        }
    }
}
