use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use futures_util::FutureExt;
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use trailnode_core::CommandsConfig;

use crate::clock::{Clock, SystemClock};
use crate::error::{CommandError, CommandFault, HandlerError, Result};
use crate::handler::{panic_message, CommandContext, ErasedHandler};
use crate::resolver::CommandResolver;
use crate::store::{CommandStore, StoreTx};
use crate::types::{Command, CommandId, CommandOutcome, CommandStatus, CommandUpdate};

/// Configures and builds a [`CommandExecutor`].
pub struct ExecutorBuilder {
    store: CommandStore,
    resolver: CommandResolver,
    config: CommandsConfig,
    clock: Arc<dyn Clock>,
    faults: Option<mpsc::Sender<CommandFault>>,
}

impl ExecutorBuilder {
    pub fn config(mut self, config: CommandsConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Receive callback failures and fatal executor faults here.
    /// Delivery is `try_send`; a full channel drops the report after logging it.
    pub fn faults(mut self, tx: mpsc::Sender<CommandFault>) -> Self {
        self.faults = Some(tx);
        self
    }

    pub fn build(self) -> CommandExecutor {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (started, _) = watch::channel(false);
        let permits = Arc::new(Semaphore::new(self.config.parallelism.max(1)));
        CommandExecutor {
            inner: Arc::new(Inner {
                store: self.store,
                resolver: self.resolver,
                config: self.config,
                clock: self.clock,
                faults: self.faults,
                queue_tx,
                queue_rx: Mutex::new(Some(queue_rx)),
                started,
                tracked: DashSet::new(),
                permits,
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
        }
    }
}

/// Durable command executor.
///
/// Commands are persisted before they are scheduled, so anything still
/// `PENDING`, `STARTED` or `REPEATING` when the process dies is picked up
/// again by [`CommandExecutor::replay`] on the next boot.
///
/// Lifecycle: [`init`](Self::init), [`replay`](Self::replay),
/// [`start`](Self::start), and eventually [`shutdown`](Self::shutdown).
/// Commands submitted before `start` are queued but not run.
#[derive(Clone)]
pub struct CommandExecutor {
    pub(crate) inner: Arc<Inner>,
}

pub(crate) struct Inner {
    pub(crate) store: CommandStore,
    pub(crate) resolver: CommandResolver,
    pub(crate) config: CommandsConfig,
    clock: Arc<dyn Clock>,
    faults: Option<mpsc::Sender<CommandFault>>,
    queue_tx: mpsc::UnboundedSender<Command>,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    started: watch::Sender<bool>,
    /// IDs currently queued, waiting on a timer or running.
    pub(crate) tracked: DashSet<CommandId>,
    permits: Arc<Semaphore>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

/// Where a successful `execute` left the command.
enum Step {
    Completed(Vec<Command>),
    Repeat,
    Retry,
}

impl CommandExecutor {
    pub fn builder(store: CommandStore, resolver: CommandResolver) -> ExecutorBuilder {
        ExecutorBuilder {
            store,
            resolver,
            config: CommandsConfig::default(),
            clock: Arc::new(SystemClock),
            faults: None,
        }
    }

    /// Recreate the permanent commands and spawn the dispatcher.
    ///
    /// Permanent commands are deleted by name and inserted afresh from their
    /// handler's default, so whatever state they carried is discarded.
    pub async fn init(&self) -> Result<()> {
        let inner = &self.inner;
        let rx = inner
            .queue_rx
            .lock()
            .await
            .take()
            .ok_or(CommandError::AlreadyInitialized)?;

        for name in &inner.config.permanent {
            let removed = inner.store.delete_by_name(name).await?;
            let command = inner.resolver.default_command(name)?;
            inner
                .add(command, inner.config.permanent_command_delay_ms, true)
                .await?;
            info!(name = %name, removed, "permanent command recreated");
        }

        inner.tasks.spawn(Arc::clone(inner).dispatch(rx));
        info!(
            parallelism = inner.config.parallelism,
            handlers = inner.resolver.names().len(),
            "command executor initialised"
        );
        Ok(())
    }

    /// Open the start gate. Queued commands begin running.
    pub fn start(&self) {
        if !self.inner.started.send_replace(true) {
            info!("command executor started");
        }
    }

    pub fn is_started(&self) -> bool {
        *self.inner.started.borrow()
    }

    /// Schedule `command` to be dispatched after `delay_ms`.
    ///
    /// With `insert` the command is persisted first and gets its ID;
    /// otherwise it must already be persisted. Returns the command's ID.
    pub async fn add(&self, command: Command, delay_ms: i64, insert: bool) -> Result<CommandId> {
        self.inner.add(command, delay_ms, insert).await
    }

    /// Persist a new command and schedule it after its own `delay`.
    pub async fn submit(&self, command: Command) -> Result<CommandId> {
        let delay = command.delay;
        self.inner.add(command, delay, true).await
    }

    /// Whether the command is queued, waiting on a timer or running.
    pub fn is_tracked(&self, id: &CommandId) -> bool {
        self.inner.tracked.contains(id)
    }

    pub fn store(&self) -> &CommandStore {
        &self.inner.store
    }

    pub fn resolver(&self) -> &CommandResolver {
        &self.inner.resolver
    }

    /// True once shutdown began, either requested or after a fatal fault.
    pub fn is_stopped(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Stop dispatching, cancel pending timers and wait for running
    /// commands to finish. Unfinished work stays persisted for replay.
    pub async fn shutdown(&self) {
        info!("command executor shutting down");
        self.inner.shutdown.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        info!("command executor stopped");
    }
}

impl Inner {
    async fn dispatch(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Command>) {
        let mut started = self.started.subscribe();
        let gate = async { started.wait_for(|ready| *ready).await.is_ok() };
        tokio::select! {
            _ = self.shutdown.cancelled() => return,
            open = gate => if !open { return },
        }

        loop {
            let command = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                next = rx.recv() => match next {
                    Some(command) => command,
                    None => break,
                },
            };
            let permit = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let inner = Arc::clone(&self);
            self.tasks.spawn(async move {
                inner.run(command).await;
                drop(permit);
            });
        }
        debug!("command dispatcher stopped");
    }

    async fn run(&self, command: Command) {
        let id = command.id.clone();
        let name = command.name.clone();
        let error = match AssertUnwindSafe(self.process(command)).catch_unwind().await {
            Ok(Ok(rescheduled)) => {
                if !rescheduled {
                    self.untrack(id.as_ref());
                }
                return;
            }
            Ok(Err(e)) => e.to_string(),
            Err(panic) => format!("command task panicked: {}", panic_message(&*panic)),
        };
        self.untrack(id.as_ref());
        self.report(CommandFault::Internal {
            id: id.map(|id| id.to_string()).unwrap_or_default(),
            name,
            error,
        });
    }

    fn untrack(&self, id: Option<&CommandId>) {
        if let Some(id) = id {
            self.tracked.remove(id);
        }
    }

    /// Run one dispatch of `command`. Returns `true` when the command was
    /// handed back to the scheduler and is still tracked.
    async fn process(&self, mut command: Command) -> Result<bool> {
        let now = self.clock.now_ms();
        self.write(&mut command, CommandUpdate::started_at(now), None)
            .await?;

        let handler = match self.resolver.resolve(&command.name) {
            Ok(handler) => handler,
            Err(e) => {
                warn!(command_id = %command.id_str(), name = %command.name, "{e}");
                let update =
                    CommandUpdate::status(CommandStatus::Failed).with_message(e.to_string());
                self.write(&mut command, update, None).await?;
                return Ok(false);
            }
        };

        if command.deadline_at.is_some_and(|deadline| now > deadline) {
            return self.expire(handler.as_ref(), command, now).await;
        }

        let wait = command.eligible_at(now).saturating_sub(now);
        if wait > 0 {
            if self.config.verbose_logging {
                debug!(
                    command_id = %command.id_str(),
                    name = %command.name,
                    delay_ms = wait,
                    "command not ready yet"
                );
            }
            self.add(command, wait.min(self.config.max_delay_ms), false)
                .await?;
            return Ok(true);
        }

        if self.config.verbose_logging {
            debug!(
                command_id = %command.id_str(),
                name = %command.name,
                retries = command.retries,
                "command started"
            );
        }

        let step = if command.transactional {
            let mut tx = self.store.begin().await?;
            match self
                .execute_step(handler.as_ref(), &mut command, now, Some(&mut tx))
                .await
            {
                Ok(step) => {
                    tx.commit()?;
                    Ok(step)
                }
                Err(e) => {
                    tx.rollback()?;
                    Err(e)
                }
            }
        } else {
            self.execute_step(handler.as_ref(), &mut command, now, None)
                .await
        };

        match step {
            Ok(Step::Repeat) => {
                let period = command
                    .period
                    .unwrap_or(self.config.default_repeat_interval_ms);
                self.add(command, period, false).await?;
                Ok(true)
            }
            Ok(Step::Retry) => {
                let delay = command.period.unwrap_or(0).saturating_add(command.delay);
                debug!(
                    command_id = %command.id_str(),
                    name = %command.name,
                    retries = command.retries,
                    delay_ms = delay,
                    "command asked to be retried"
                );
                self.add(command, delay, false).await?;
                Ok(true)
            }
            Ok(Step::Completed(children)) => {
                if self.config.verbose_logging {
                    debug!(
                        command_id = %command.id_str(),
                        name = %command.name,
                        children = children.len(),
                        "command completed"
                    );
                }
                for child in children {
                    let delay = child.delay;
                    self.add(child, delay, false).await?;
                }
                Ok(false)
            }
            Err(e) => self.fail(handler.as_ref(), command, now, e).await,
        }
    }

    /// Mark `STARTED`, run the handler and persist what it asked for.
    /// Children are inserted here but scheduled by the caller, after commit.
    async fn execute_step(
        &self,
        handler: &dyn ErasedHandler,
        command: &mut Command,
        now: i64,
        mut tx: Option<&mut StoreTx>,
    ) -> std::result::Result<Step, HandlerError> {
        self.write(
            command,
            CommandUpdate::status(CommandStatus::Started),
            tx.as_deref_mut(),
        )
        .await?;

        let executed = {
            let mut ctx = CommandContext::new(command, &self.resolver, now, tx.as_deref_mut());
            handler.execute(&mut ctx, command.data.as_deref()).await?
        };

        match executed.outcome {
            CommandOutcome::Repeat => {
                let update =
                    CommandUpdate::status(CommandStatus::Repeating).with_data(executed.data);
                self.write(command, update, tx).await?;
                Ok(Step::Repeat)
            }
            // The run that asks for a retry spends the last unit itself.
            CommandOutcome::Retry if command.retries > 1 => {
                let update = CommandUpdate::status(CommandStatus::Pending)
                    .with_retries(command.retries - 1)
                    .with_data(executed.data);
                self.write(command, update, tx).await?;
                Ok(Step::Retry)
            }
            CommandOutcome::Retry => {
                {
                    let mut ctx =
                        CommandContext::new(command, &self.resolver, now, tx.as_deref_mut());
                    handler.retry_finished(&mut ctx).await;
                }
                self.write(command, CommandUpdate::status(CommandStatus::Completed), tx)
                    .await?;
                Ok(Step::Completed(Vec::new()))
            }
            CommandOutcome::Commands(mut children) => {
                for child in &mut children {
                    child.parent_id = command.id.clone();
                    self.insert(child, tx.as_deref_mut()).await?;
                }
                self.write(command, CommandUpdate::status(CommandStatus::Completed), tx)
                    .await?;
                Ok(Step::Completed(children))
            }
        }
    }

    /// `STARTED` is never written here: an expired command goes straight
    /// from `PENDING` to `EXPIRED` with only `started_at` stamped.
    async fn expire(
        &self,
        handler: &dyn ErasedHandler,
        mut command: Command,
        now: i64,
    ) -> Result<bool> {
        warn!(
            command_id = %command.id_str(),
            name = %command.name,
            "command expired before execution"
        );
        self.write(&mut command, CommandUpdate::status(CommandStatus::Expired), None)
            .await?;

        let mut ctx = CommandContext::new(&command, &self.resolver, now, None);
        match handler.expired(&mut ctx).await {
            Ok(commands) => {
                for follow_up in commands {
                    let delay = follow_up.delay;
                    self.add(follow_up, delay, true).await?;
                }
            }
            Err(e) => self.report(CommandFault::ExpiredFailed {
                id: command.id_str().to_string(),
                name: command.name.clone(),
                error: e.to_string(),
            }),
        }
        Ok(false)
    }

    async fn fail(
        &self,
        handler: &dyn ErasedHandler,
        mut command: Command,
        now: i64,
        error: HandlerError,
    ) -> Result<bool> {
        if command.retries > 0 {
            let retries = command.retries - 1;
            warn!(
                command_id = %command.id_str(),
                name = %command.name,
                retries,
                "command failed, retrying: {error}"
            );
            self.write(&mut command, CommandUpdate::default().with_retries(retries), None)
                .await?;
            let delay = command.delay;
            self.add(command, delay, false).await?;
            return Ok(true);
        }

        warn!(command_id = %command.id_str(), name = %command.name, "command failed: {error}");
        let update = CommandUpdate::status(CommandStatus::Failed).with_message(error.to_string());
        self.write(&mut command, update, None).await?;

        let mut ctx = CommandContext::new(&command, &self.resolver, now, None);
        match handler
            .recover(&mut ctx, command.data.as_deref(), &error)
            .await
        {
            Ok(commands) => {
                for follow_up in commands {
                    let delay = follow_up.delay;
                    self.add(follow_up, delay, true).await?;
                }
            }
            Err(e) => self.report(CommandFault::RecoverFailed {
                id: command.id_str().to_string(),
                name: command.name.clone(),
                error: e.to_string(),
            }),
        }
        Ok(false)
    }

    pub(crate) async fn add(
        &self,
        mut command: Command,
        delay_ms: i64,
        insert: bool,
    ) -> Result<CommandId> {
        let mut delay = delay_ms.max(0);
        let mut folded = None;
        if delay > self.config.max_delay_ms {
            let ready_at = self
                .clock
                .now_ms()
                .saturating_add(delay.saturating_sub(command.delay));
            command.ready_at = Some(ready_at);
            folded = Some(ready_at);
            delay = self.config.max_delay_ms;
        }

        if insert {
            self.insert(&mut command, None).await?;
        }
        let id = command.id.clone().ok_or_else(|| {
            CommandError::Invalid(format!("{} was never persisted", command.name))
        })?;
        if let (false, Some(ready_at)) = (insert, folded) {
            self.store
                .update(&id, &CommandUpdate::ready_at(ready_at))
                .await?;
        }

        self.schedule(command, delay);
        Ok(id)
    }

    async fn insert(&self, command: &mut Command, tx: Option<&mut StoreTx>) -> Result<()> {
        if command.name.is_empty() {
            if command.sequence.is_empty() {
                return Err(CommandError::Invalid(
                    "command has neither a name nor a sequence".into(),
                ));
            }
            command.name = command.sequence.remove(0);
        }
        self.resolver.resolve(&command.name)?;
        if command.ready_at.is_none() {
            command.ready_at = Some(self.clock.now_ms());
        }
        match tx {
            Some(tx) => tx.insert(command),
            None => self.store.insert(command).await,
        }
    }

    /// Apply `update` in memory and persist it, through `tx` when given.
    async fn write(
        &self,
        command: &mut Command,
        update: CommandUpdate,
        tx: Option<&mut StoreTx>,
    ) -> Result<()> {
        update.apply(command);
        let id = command
            .id
            .as_ref()
            .ok_or_else(|| CommandError::Invalid(format!("{} was never persisted", command.name)))?;
        match tx {
            Some(tx) => tx.update(id, &update),
            None => self.store.update(id, &update).await,
        }
    }

    fn schedule(&self, command: Command, delay_ms: i64) {
        if let Some(id) = &command.id {
            self.tracked.insert(id.clone());
        }
        if delay_ms <= 0 {
            if self.queue_tx.send(command).is_err() {
                debug!("command queue closed, command dropped");
            }
            return;
        }

        let queue = self.queue_tx.clone();
        let shutdown = self.shutdown.clone();
        let delay = Duration::from_millis(delay_ms as u64);
        self.tasks.spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if queue.send(command).is_err() {
                        debug!("command queue closed, timer dropped");
                    }
                }
            }
        });
    }

    fn report(&self, fault: CommandFault) {
        error!("{fault}");
        let fatal = fault.is_fatal();
        if let Some(tx) = &self.faults {
            if tx.try_send(fault).is_err() {
                warn!("fault channel full or closed, fault dropped");
            }
        }
        if fatal {
            self.shutdown.cancel();
        }
    }
}
