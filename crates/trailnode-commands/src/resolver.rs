use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{CommandError, Result};
use crate::handler::{CommandHandler, ErasedHandler, Typed};
use crate::types::{Command, CommandOutcome};

/// Name-keyed registry of command handlers.
///
/// Cheap to clone; clones share the same registry.
#[derive(Clone, Default)]
pub struct CommandResolver {
    handlers: Arc<DashMap<String, Arc<dyn ErasedHandler>>>,
}

impl CommandResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under its own name. A later registration with the
    /// same name replaces the earlier one.
    pub fn register<H: CommandHandler>(&self, handler: H) {
        let name = handler.name();
        let previous = self
            .handlers
            .insert(name.to_string(), Arc::new(Typed(handler)));
        if previous.is_some() {
            warn!(name, "command handler replaced");
        } else {
            debug!(name, "command handler registered");
        }
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn ErasedHandler>> {
        self.handlers
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| CommandError::UnknownHandler {
                name: name.to_string(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered handler names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// The named handler's canonical command, ready to be customised.
    pub fn default_command(&self, name: &str) -> Result<Command> {
        Ok(self.resolve(name)?.default_command())
    }

    /// Build a command for `name`: its default command with `data` merged
    /// over the default payload and `sequence` as the remaining steps.
    pub fn build<D: Serialize + ?Sized>(
        &self,
        name: &str,
        data: &D,
        sequence: Vec<String>,
    ) -> Result<Command> {
        self.build_with(name, data, sequence, |command| command)
    }

    /// [`build`](Self::build), then apply `overrides` to the result, e.g.
    /// `|c| c.with_delay(5_000).with_retries(0)` for one caller's timing.
    pub fn build_with<D: Serialize + ?Sized>(
        &self,
        name: &str,
        data: &D,
        sequence: Vec<String>,
        overrides: impl FnOnce(Command) -> Command,
    ) -> Result<Command> {
        let handler = self.resolve(name)?;
        let mut command = handler.default_command();
        let stowed = handler.stow(command.data.as_deref(), serde_json::to_value(data)?)?;
        command.data = Some(stowed);
        command.sequence = sequence;
        Ok(overrides(command))
    }

    /// Hand `data` to the head of `sequence`, carrying the tail along.
    /// An empty sequence ends the chain.
    pub fn continue_sequence<D: Serialize + ?Sized>(
        &self,
        data: &D,
        sequence: &[String],
    ) -> Result<CommandOutcome> {
        self.continue_sequence_with(data, sequence, |command| command)
    }

    /// [`continue_sequence`](Self::continue_sequence) with `overrides`
    /// applied to the next step's command.
    pub fn continue_sequence_with<D: Serialize + ?Sized>(
        &self,
        data: &D,
        sequence: &[String],
        overrides: impl FnOnce(Command) -> Command,
    ) -> Result<CommandOutcome> {
        let Some((next, rest)) = sequence.split_first() else {
            return Ok(CommandOutcome::empty());
        };
        let command = self.build_with(next, data, rest.to_vec(), overrides)?;
        Ok(CommandOutcome::from(command))
    }
}
