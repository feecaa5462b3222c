use tracing::{debug, info};

use crate::error::Result;
use crate::executor::CommandExecutor;
use crate::types::CommandStatus;

impl CommandExecutor {
    /// Resume unfinished commands persisted by a previous run.
    ///
    /// Loads `PENDING`, `STARTED` and `REPEATING` commands, minus permanent
    /// names and `replay_excluded`. A child whose parent still exists and is
    /// not `COMPLETED` is left alone: the parent will run again and produce
    /// its children anew. Commands already tracked in memory are skipped.
    /// Returns the number of commands resubmitted.
    pub async fn replay(&self) -> Result<usize> {
        let inner = &self.inner;
        let mut excluded = inner.config.permanent.clone();
        excluded.extend(inner.config.replay_excluded.iter().cloned());

        let pending = inner
            .store
            .find_by_status(&CommandStatus::RESUMABLE, &excluded)
            .await?;
        let found = pending.len();
        let mut resumed = 0usize;
        let mut waiting_on_parent = 0usize;
        let mut already_tracked = 0usize;

        for command in pending {
            if let Some(parent_id) = &command.parent_id {
                if let Some(parent) = inner.store.get(parent_id).await? {
                    if parent.status != CommandStatus::Completed {
                        debug!(
                            command_id = %command.id_str(),
                            name = %command.name,
                            parent_id = %parent_id,
                            parent_status = %parent.status,
                            "replay skipped, parent not completed"
                        );
                        waiting_on_parent += 1;
                        continue;
                    }
                }
            }
            if command.id.as_ref().is_some_and(|id| inner.tracked.contains(id)) {
                already_tracked += 1;
                continue;
            }
            inner.add(command, 0, false).await?;
            resumed += 1;
        }

        info!(
            found,
            resumed, waiting_on_parent, already_tracked, "commands replayed"
        );
        Ok(resumed)
    }
}
