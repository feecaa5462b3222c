use async_trait::async_trait;
use tracing::info;
use trailnode_core::config::COMMANDS_CLEANER;
use trailnode_core::CommandsConfig;

use crate::error::HandlerError;
use crate::handler::{CommandContext, CommandHandler};
use crate::store::CommandStore;
use crate::types::{Command, CommandOutcome};

/// Permanent maintenance command: prunes finished commands older than the
/// retention window, then repeats every cleanup interval.
pub struct CommandsCleanerCommand {
    store: CommandStore,
    retention_ms: i64,
    interval_ms: i64,
}

impl CommandsCleanerCommand {
    pub fn new(store: CommandStore, config: &CommandsConfig) -> Self {
        Self {
            store,
            retention_ms: config.finalized_retention_ms,
            interval_ms: config.cleanup_interval_ms,
        }
    }
}

#[async_trait]
impl CommandHandler for CommandsCleanerCommand {
    type Payload = ();

    fn name(&self) -> &'static str {
        COMMANDS_CLEANER
    }

    fn default_command(&self) -> Command {
        Command::new(COMMANDS_CLEANER).with_period(self.interval_ms)
    }

    async fn execute(
        &self,
        _ctx: &mut CommandContext<'_>,
        _payload: &mut (),
    ) -> Result<CommandOutcome, HandlerError> {
        // Same clock that stamps `updated_at`, not the executor's.
        let cutoff = self.store.now_ms().saturating_sub(self.retention_ms);
        let removed = self.store.remove_finalized_before(cutoff).await?;
        info!(removed, cutoff_ms = cutoff, "finalized commands removed");
        Ok(CommandOutcome::repeat())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::clock::Clock;
    use crate::resolver::CommandResolver;
    use crate::types::{CommandStatus, CommandUpdate};

    struct ManualClock(AtomicI64);

    impl Clock for ManualClock {
        fn now_ms(&self) -> i64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn removes_only_old_finalized_commands() {
        let clock = Arc::new(ManualClock(AtomicI64::new(1_000_000)));
        let store = CommandStore::open_in_memory()
            .unwrap()
            .with_clock(clock.clone());
        let config = CommandsConfig {
            finalized_retention_ms: 60_000,
            ..CommandsConfig::default()
        };
        let cleaner = CommandsCleanerCommand::new(store.clone(), &config);

        let mut done = Command::new("echo");
        let mut live = Command::new("echo");
        store.insert(&mut done).await.unwrap();
        store.insert(&mut live).await.unwrap();
        store
            .update(
                done.id.as_ref().unwrap(),
                &CommandUpdate::status(CommandStatus::Completed),
            )
            .await
            .unwrap();

        let resolver = CommandResolver::new();
        let me = cleaner.default_command();

        // The dispatch time handed to the handler is ignored: a context clock
        // running far ahead of the store must not widen the cutoff.
        clock.0.store(1_030_000, Ordering::SeqCst);
        let mut ctx = CommandContext::new(&me, &resolver, i64::MAX, None);
        let outcome = cleaner.execute(&mut ctx, &mut ()).await.unwrap();
        assert_eq!(outcome, CommandOutcome::Repeat);
        assert_eq!(store.list().await.unwrap().len(), 2);

        // Two minutes later on the store clock the completed command is past retention.
        clock.0.store(1_120_000, Ordering::SeqCst);
        let mut ctx = CommandContext::new(&me, &resolver, 0, None);
        cleaner.execute(&mut ctx, &mut ()).await.unwrap();
        let left = store.list().await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, live.id);
    }

    #[test]
    fn default_command_repeats_on_interval() {
        let store = CommandStore::open_in_memory().unwrap();
        let cleaner = CommandsCleanerCommand::new(store, &CommandsConfig::default());
        let cmd = cleaner.default_command();
        assert_eq!(cmd.name, COMMANDS_CLEANER);
        assert_eq!(cmd.period, Some(trailnode_core::config::CLEANUP_INTERVAL_MS));
    }
}
