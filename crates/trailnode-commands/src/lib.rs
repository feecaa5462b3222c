//! `trailnode-commands`: durable command scheduling on SQLite.
//!
//! # Overview
//!
//! A [`Command`] is a persisted unit of work run by the [`CommandHandler`]
//! registered under its name. Handlers chain work by returning follow-up
//! commands, usually the next step of the command's `sequence`. The
//! [`CommandExecutor`] persists every command before scheduling it, so a
//! restart resumes unfinished work through [`CommandExecutor::replay`].
//!
//! # Lifecycle
//!
//! | Status      | Meaning                                              |
//! |-------------|------------------------------------------------------|
//! | `PENDING`   | Persisted, waiting for dispatch                      |
//! | `STARTED`   | Handler `execute` running                            |
//! | `COMPLETED` | Done; children inserted                              |
//! | `FAILED`    | Retries exhausted; `recover` called                  |
//! | `EXPIRED`   | Dispatched after `deadline_at`; `expired` called     |
//! | `REPEATING` | Re-armed every `period`                              |

pub mod cleaner;
pub mod clock;
pub mod db;
pub mod error;
pub mod executor;
pub mod handler;
mod replay;
pub mod resolver;
pub mod store;
pub mod types;

pub use cleaner::CommandsCleanerCommand;
pub use clock::{Clock, SystemClock};
pub use error::{CommandError, CommandFault, HandlerError, Result};
pub use executor::{CommandExecutor, ExecutorBuilder};
pub use handler::{CommandContext, CommandHandler, ErasedHandler, Executed};
pub use resolver::CommandResolver;
pub use store::{CommandStore, StoreTx};
pub use types::{Command, CommandId, CommandOutcome, CommandStatus, CommandUpdate};
