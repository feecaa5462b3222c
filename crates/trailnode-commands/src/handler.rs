use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures_util::FutureExt;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::{trace, warn};

use crate::error::{CommandError, HandlerError};
use crate::resolver::CommandResolver;
use crate::store::StoreTx;
use crate::types::{Command, CommandOutcome};

/// Everything a handler sees while one command runs.
///
/// For transactional commands the open [`StoreTx`] is available through
/// [`CommandContext::transaction`]; the executor writes the command's status
/// and children through the same transaction once `execute` returns.
pub struct CommandContext<'a> {
    command: &'a Command,
    resolver: &'a CommandResolver,
    now_ms: i64,
    tx: Option<&'a mut StoreTx>,
}

impl<'a> CommandContext<'a> {
    pub fn new(
        command: &'a Command,
        resolver: &'a CommandResolver,
        now_ms: i64,
        tx: Option<&'a mut StoreTx>,
    ) -> Self {
        Self {
            command,
            resolver,
            now_ms,
            tx,
        }
    }

    pub fn command(&self) -> &Command {
        self.command
    }

    pub fn resolver(&self) -> &CommandResolver {
        self.resolver
    }

    /// Dispatch time of this run, epoch milliseconds.
    pub fn now_ms(&self) -> i64 {
        self.now_ms
    }

    /// The open transaction, present only for transactional commands.
    pub fn transaction(&mut self) -> Option<&mut StoreTx> {
        self.tx.as_deref_mut()
    }

    /// Hand `data` to the next step of this command's own sequence.
    pub fn continue_sequence<D: Serialize + ?Sized>(
        &self,
        data: &D,
    ) -> Result<CommandOutcome, CommandError> {
        self.resolver.continue_sequence(data, &self.command.sequence)
    }

    /// Build a command for a different handler, outside this sequence.
    pub fn build<D: Serialize + ?Sized>(
        &self,
        name: &str,
        data: &D,
        sequence: Vec<String>,
    ) -> Result<Command, CommandError> {
        self.resolver.build(name, data, sequence)
    }

    /// [`continue_sequence`](Self::continue_sequence) with per-call
    /// overrides on the next step, such as a delay or a deadline.
    pub fn continue_sequence_with<D: Serialize + ?Sized>(
        &self,
        data: &D,
        overrides: impl FnOnce(Command) -> Command,
    ) -> Result<CommandOutcome, CommandError> {
        self.resolver
            .continue_sequence_with(data, &self.command.sequence, overrides)
    }

    pub fn build_with<D: Serialize + ?Sized>(
        &self,
        name: &str,
        data: &D,
        sequence: Vec<String>,
        overrides: impl FnOnce(Command) -> Command,
    ) -> Result<Command, CommandError> {
        self.resolver.build_with(name, data, sequence, overrides)
    }
}

/// A workflow step the executor can run.
///
/// Handlers are registered once and shared by every command with their
/// name, so all per-command state lives in the [`Command`] and its payload.
/// `execute` reports failure by returning `Err`; retry and recovery policy
/// belong to the executor.
///
/// `unpack(pack(x))` must equal `x`. A handler that changes its format must
/// keep reading the old one while unresumed commands may still hold it.
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    /// In-memory payload; persisted as the text produced by [`Self::pack`].
    type Payload: Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Registry key, matched against `Command::name`.
    fn name(&self) -> &'static str;

    /// This handler's canonical command: defaults for delay, period,
    /// deadline, transactional and retries.
    fn default_command(&self) -> Command {
        Command::new(self.name())
    }

    fn pack(&self, payload: &Self::Payload) -> Result<String, CommandError> {
        Ok(serde_json::to_string(payload)?)
    }

    /// Absent data decodes as JSON `null`, which `()` and `Option<_>` accept.
    fn unpack(&self, data: Option<&str>) -> Result<Self::Payload, CommandError> {
        Ok(serde_json::from_str(data.unwrap_or("null"))?)
    }

    async fn execute(
        &self,
        ctx: &mut CommandContext<'_>,
        payload: &mut Self::Payload,
    ) -> Result<CommandOutcome, HandlerError>;

    /// Called once when the retry budget is exhausted. `payload` is `None`
    /// when the stored data could not be unpacked.
    async fn recover(
        &self,
        ctx: &mut CommandContext<'_>,
        _payload: Option<&Self::Payload>,
        error: &HandlerError,
    ) -> Result<Vec<Command>, HandlerError> {
        let command = ctx.command();
        warn!(
            command_id = %command.id_str(),
            name = %command.name,
            "no recovery for failed command: {error}"
        );
        Ok(Vec::new())
    }

    /// Called instead of `execute` once `deadline_at` has passed.
    async fn expired(&self, _ctx: &mut CommandContext<'_>) -> Result<Vec<Command>, HandlerError> {
        Ok(Vec::new())
    }

    /// Called when `execute` asked for a retry but no retries are left.
    async fn retry_finished(&self, ctx: &mut CommandContext<'_>) {
        let command = ctx.command();
        trace!(command_id = %command.id_str(), name = %command.name, "retry count reached");
    }
}

/// Result of an erased `execute`: the outcome plus the re-packed payload
/// when the command will run again.
#[derive(Debug)]
pub struct Executed {
    pub outcome: CommandOutcome,
    pub data: Option<String>,
}

/// Object-safe view of a [`CommandHandler`], keyed by name in the resolver.
///
/// Payloads cross this boundary only in their packed text form.
#[async_trait]
pub trait ErasedHandler: Send + Sync {
    fn name(&self) -> &'static str;

    fn default_command(&self) -> Command;

    /// Decode `data` into this handler's payload, merged over the payload
    /// packed in `defaults`, and pack the result.
    fn stow(&self, defaults: Option<&str>, data: Value) -> Result<String, CommandError>;

    async fn execute(
        &self,
        ctx: &mut CommandContext<'_>,
        data: Option<&str>,
    ) -> Result<Executed, HandlerError>;

    async fn recover(
        &self,
        ctx: &mut CommandContext<'_>,
        data: Option<&str>,
        error: &HandlerError,
    ) -> Result<Vec<Command>, HandlerError>;

    async fn expired(&self, ctx: &mut CommandContext<'_>) -> Result<Vec<Command>, HandlerError>;

    async fn retry_finished(&self, ctx: &mut CommandContext<'_>);
}

pub(crate) struct Typed<H>(pub(crate) H);

#[async_trait]
impl<H: CommandHandler> ErasedHandler for Typed<H> {
    fn name(&self) -> &'static str {
        self.0.name()
    }

    fn default_command(&self) -> Command {
        self.0.default_command()
    }

    fn stow(&self, defaults: Option<&str>, data: Value) -> Result<String, CommandError> {
        let mut merged = match defaults {
            Some(packed) => serde_json::to_value(self.0.unpack(Some(packed))?)?,
            None => Value::Null,
        };
        merge_payload(&mut merged, data);
        let payload: H::Payload = serde_json::from_value(merged).map_err(|e| {
            CommandError::Payload(format!("{} cannot accept handed-off data: {e}", self.0.name()))
        })?;
        self.0.pack(&payload)
    }

    async fn execute(
        &self,
        ctx: &mut CommandContext<'_>,
        data: Option<&str>,
    ) -> Result<Executed, HandlerError> {
        guarded(self.0.name(), async move {
            let mut payload = self.0.unpack(data)?;
            let outcome = self.0.execute(ctx, &mut payload).await?;
            let data = match outcome {
                CommandOutcome::Commands(_) => None,
                CommandOutcome::Repeat | CommandOutcome::Retry => Some(self.0.pack(&payload)?),
            };
            Ok::<_, HandlerError>(Executed { outcome, data })
        })
        .await
    }

    async fn recover(
        &self,
        ctx: &mut CommandContext<'_>,
        data: Option<&str>,
        error: &HandlerError,
    ) -> Result<Vec<Command>, HandlerError> {
        let payload = self.0.unpack(data).ok();
        guarded(self.0.name(), self.0.recover(ctx, payload.as_ref(), error)).await
    }

    async fn expired(&self, ctx: &mut CommandContext<'_>) -> Result<Vec<Command>, HandlerError> {
        guarded(self.0.name(), self.0.expired(ctx)).await
    }

    async fn retry_finished(&self, ctx: &mut CommandContext<'_>) {
        let finished = self.0.retry_finished(ctx).map(Ok::<_, HandlerError>);
        let result = guarded(self.0.name(), finished).await;
        if let Err(e) = result {
            let command = ctx.command();
            warn!(
                command_id = %command.id_str(),
                name = %command.name,
                "retry_finished failed: {e}"
            );
        }
    }
}

/// Await a handler callback, turning a panic into [`HandlerError::Failed`]
/// so the executor's failure policy applies to it.
async fn guarded<T>(
    name: &str,
    callback: impl Future<Output = Result<T, HandlerError>>,
) -> Result<T, HandlerError> {
    match AssertUnwindSafe(callback).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(HandlerError::Failed(format!(
            "{name} panicked: {}",
            panic_message(&*panic)
        ))),
    }
}

/// Text of a panic payload raised by `panic!` with a literal or format string.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

/// Shallow merge: object keys from `patch` win, a null patch keeps `base`,
/// anything else replaces it.
fn merge_payload(base: &mut Value, patch: Value) {
    match (base, patch) {
        (Value::Object(base), Value::Object(patch)) => {
            for (key, value) in patch {
                base.insert(key, value);
            }
        }
        (_, Value::Null) => {}
        (base, patch) => *base = patch,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[test]
    fn merge_overrides_object_keys() {
        let mut base = json!({"a": 1, "b": 2});
        merge_payload(&mut base, json!({"b": 3, "c": 4}));
        assert_eq!(base, json!({"a": 1, "b": 3, "c": 4}));
    }

    #[test]
    fn merge_null_patch_keeps_base() {
        let mut base = json!({"a": 1});
        merge_payload(&mut base, Value::Null);
        assert_eq!(base, json!({"a": 1}));

        let mut base = Value::Null;
        merge_payload(&mut base, json!(7));
        assert_eq!(base, json!(7));
    }

    /// Token amounts exceed what JSON numbers carry safely, so they are
    /// persisted as decimal strings.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Payout {
        offer_id: String,
        amount: u128,
    }

    struct PayoutHandler;

    #[async_trait]
    impl CommandHandler for PayoutHandler {
        type Payload = Payout;

        fn name(&self) -> &'static str {
            "payoutCommand"
        }

        fn pack(&self, payload: &Payout) -> Result<String, CommandError> {
            let packed = json!({
                "offer_id": payload.offer_id,
                "amount": payload.amount.to_string(),
            });
            Ok(packed.to_string())
        }

        fn unpack(&self, data: Option<&str>) -> Result<Payout, CommandError> {
            let value: Value = serde_json::from_str(data.unwrap_or("null"))?;
            let offer_id = value["offer_id"]
                .as_str()
                .ok_or_else(|| CommandError::Payload("missing offer_id".into()))?
                .to_string();
            // Records written before amounts were strings carry plain numbers.
            let amount = match &value["amount"] {
                Value::String(s) => s
                    .parse()
                    .map_err(|e| CommandError::Payload(format!("bad amount: {e}")))?,
                Value::Number(n) => n
                    .as_u64()
                    .ok_or_else(|| CommandError::Payload("bad amount".into()))?
                    as u128,
                _ => return Err(CommandError::Payload("missing amount".into())),
            };
            Ok(Payout { offer_id, amount })
        }

        async fn execute(
            &self,
            _ctx: &mut CommandContext<'_>,
            _payload: &mut Payout,
        ) -> Result<CommandOutcome, HandlerError> {
            Ok(CommandOutcome::empty())
        }
    }

    #[test]
    fn pack_unpack_round_trip_preserves_big_amounts() {
        let handler = PayoutHandler;
        for amount in [0u128, 1, u64::MAX as u128 + 1, u128::MAX] {
            let payout = Payout {
                offer_id: "0xoffer".into(),
                amount,
            };
            let packed = handler.pack(&payout).unwrap();
            assert_eq!(handler.unpack(Some(&packed)).unwrap(), payout);
        }
    }

    #[test]
    fn unpack_reads_legacy_numeric_amounts() {
        let legacy = r#"{"offer_id":"0xoffer","amount":42}"#;
        let payout = PayoutHandler.unpack(Some(legacy)).unwrap();
        assert_eq!(payout.amount, 42);
    }

    #[tokio::test]
    async fn guarded_turns_panics_into_failures() {
        let code = 7;
        let err = guarded::<()>("payoutCommand", async move { panic!("bad code {code}") })
            .await
            .unwrap_err();
        assert!(matches!(
            &err,
            HandlerError::Failed(m) if m == "payoutCommand panicked: bad code 7"
        ));

        let ok = guarded("payoutCommand", async { Ok(3) }).await.unwrap();
        assert_eq!(ok, 3);
    }

    #[test]
    fn stow_rejects_foreign_payloads() {
        let erased = Typed(PayoutHandler);
        let err = erased.stow(None, json!({"unrelated": true})).unwrap_err();
        assert!(matches!(err, CommandError::Payload(_)));
    }
}
