//! # molt
//!
//! Zero-downtime restarts for long-running network servers.
//!
//! ## Overview
//!
//! On a reload signal the running process re-executes its own binary and
//! hands the new process every listening socket it owns:
//! 1. Each registered listener is keyed by its canonical address
//!    (`tcp@0.0.0.0:8080`, `unix@/run/app.sock`)
//! 2. Listeners are passed by fd inheritance, starting at fd 3, in sorted key order
//! 3. The new process adopts the inherited sockets and asks the old one to terminate
//! 4. The old process runs its exit hooks under a bounded wait and exits
//!
//! No socket is closed and reopened, so no connection attempt is refused
//! during the swap.
//!
//! ## Signal Conventions
//!
//! - `SIGUSR2`: Reload (single-process re-exec, or the master reload hook)
//! - `SIGINT` / `SIGTERM` / `SIGABRT`: Exit within a 1 second wait budget
//! - `SIGQUIT`: Exit within the configured wait budget
//!
//! ## Environment Variables
//!
//! - `MOLT_IS_CHILD`: Set to `true` in a re-executed process
//! - `MOLT_FDS_IN_SINGLE`: Set to `true` in a single-process replacement
//! - `<md5 hex of canonical address>`: Decimal fd offset of that listener
//! - `MOLT_MAX_WAIT_SECS`: Hook wait budget in seconds (default: 15)
//! - `MOLT_MULTI`: Run in multi-process mode
//!
//! ## Usage
//!
//! ```ignore
//! let grace = Arc::new(Grace::from_env());
//! grace.listen_signals()?; // before serving anything
//! grace.register(&mut app)?;
//! let listener = grace.get_listener(&app)?;
//! tokio::spawn(app.serve(listener));
//! let exit = grace.wait().await?;
//! ```
//!
//! ## Platform
//!
//! This crate requires Unix (Linux / macOS). It will not compile on other platforms.

#[cfg(not(unix))]
compile_error!("molt requires a Unix platform (Linux or macOS)");

pub mod address;
pub mod config;
pub mod container;
mod error;
pub mod grace;
pub mod handoff;
pub mod hooks;
pub mod listener;
pub mod signals;

pub use address::{Address, Network};
pub use config::{GraceConfig, Role};
pub use container::Container;
pub use error::{GraceError, Result};
pub use grace::{Adapter, Grace, Status};
pub use handoff::{Handoff, Inherited};
pub use hooks::{BoxError, Hook, Outcome};
pub use listener::Listener;
pub use signals::{Exit, Signal};
