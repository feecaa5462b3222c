use std::sync::Arc;

use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::db::init_db;
use crate::error::{CommandError, Result};
use crate::types::{Command, CommandId, CommandStatus, CommandUpdate};

const COLUMNS: &str = "id, name, data, sequence, parent_id, status, ready_at, delay, period,
                       deadline_at, transactional, retries, message, started_at";

/// SQLite-backed persistence for command records.
///
/// Wraps one connection in an async mutex so a transaction can stay open
/// across a handler's `execute` await. Cloning shares the connection.
///
/// `created_at` and `updated_at` are stamped from the store's own clock;
/// retention cutoffs must be computed from [`CommandStore::now_ms`].
#[derive(Clone)]
pub struct CommandStore {
    conn: Arc<Mutex<Connection>>,
    clock: Arc<dyn Clock>,
}

impl CommandStore {
    /// Wrap an open connection, initialising the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            clock: Arc::new(SystemClock),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    /// Stamp rows from `clock` instead of the system clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Current time on the clock that stamps `updated_at`.
    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    /// Persist a new command, assigning its ID and marking it `PENDING`.
    pub async fn insert(&self, command: &mut Command) -> Result<()> {
        let conn = self.conn.lock().await;
        insert_row(&conn, command, self.now_ms())
    }

    pub async fn update(&self, id: &CommandId, update: &CommandUpdate) -> Result<()> {
        let conn = self.conn.lock().await;
        update_row(&conn, id, update, self.now_ms())
    }

    pub async fn get(&self, id: &CommandId) -> Result<Option<Command>> {
        let conn = self.conn.lock().await;
        get_row(&conn, id)
    }

    /// Commands in any of `statuses`, skipping names in `exclude_names`,
    /// oldest first.
    pub async fn find_by_status(
        &self,
        statuses: &[CommandStatus],
        exclude_names: &[String],
    ) -> Result<Vec<Command>> {
        let conn = self.conn.lock().await;
        find_rows(&conn, statuses, exclude_names)
    }

    /// Every command row, oldest first.
    pub async fn list(&self) -> Result<Vec<Command>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM commands ORDER BY created_at, id"
        ))?;
        let rows = stmt.query_map([], row_to_command)?;
        Ok(collect_rows(rows))
    }

    /// Remove every command with the given name. Returns the number deleted.
    pub async fn delete_by_name(&self, name: &str) -> Result<usize> {
        let conn = self.conn.lock().await;
        let n = conn.execute("DELETE FROM commands WHERE name = ?1", [name])?;
        debug!(name, deleted = n, "commands deleted by name");
        Ok(n)
    }

    /// Delete finished commands last touched before `cutoff_ms`.
    pub async fn remove_finalized_before(&self, cutoff_ms: i64) -> Result<usize> {
        let conn = self.conn.lock().await;
        let n = conn.execute(
            "DELETE FROM commands
             WHERE status IN (?1, ?2, ?3) AND updated_at < ?4",
            params![
                CommandStatus::Completed.as_str(),
                CommandStatus::Failed.as_str(),
                CommandStatus::Expired.as_str(),
                cutoff_ms
            ],
        )?;
        Ok(n)
    }

    /// Open a write transaction (`BEGIN IMMEDIATE`).
    ///
    /// The transaction holds the store lock until it is committed, rolled
    /// back or dropped, so nothing may call back into this store while it
    /// is open; use the [`StoreTx`] methods instead.
    pub async fn begin(&self) -> Result<StoreTx> {
        let conn = Arc::clone(&self.conn).lock_owned().await;
        conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(StoreTx {
            conn,
            clock: Arc::clone(&self.clock),
            finished: false,
        })
    }
}

/// An open store transaction shared by a transactional handler and the
/// executor's own post-execute writes. Dropped without `commit`, it rolls back.
pub struct StoreTx {
    conn: OwnedMutexGuard<Connection>,
    clock: Arc<dyn Clock>,
    finished: bool,
}

impl StoreTx {
    /// Raw connection for domain writes that must commit with the command.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn insert(&mut self, command: &mut Command) -> Result<()> {
        insert_row(&self.conn, command, self.clock.now_ms())
    }

    pub fn update(&mut self, id: &CommandId, update: &CommandUpdate) -> Result<()> {
        update_row(&self.conn, id, update, self.clock.now_ms())
    }

    pub fn get(&self, id: &CommandId) -> Result<Option<Command>> {
        get_row(&self.conn, id)
    }

    pub fn commit(mut self) -> Result<()> {
        self.finished = true;
        if let Err(e) = self.conn.execute_batch("COMMIT") {
            let _ = self.conn.execute_batch("ROLLBACK");
            return Err(e.into());
        }
        Ok(())
    }

    pub fn rollback(mut self) -> Result<()> {
        self.finished = true;
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }
}

impl Drop for StoreTx {
    fn drop(&mut self) {
        if !self.finished && !self.conn.is_autocommit() {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                warn!("rollback of abandoned command transaction failed: {e}");
            }
        }
    }
}

// --- row helpers shared by the store and its transactions -------------------

fn insert_row(conn: &Connection, command: &mut Command, now: i64) -> Result<()> {
    if let Some(ref id) = command.id {
        return Err(CommandError::Invalid(format!(
            "command {id} is already persisted"
        )));
    }
    let id = CommandId::new();
    let sequence = serde_json::to_string(&command.sequence)?;
    command.status = CommandStatus::Pending;

    conn.execute(
        "INSERT INTO commands
         (id, name, data, sequence, parent_id, status, ready_at, delay, period,
          deadline_at, transactional, retries, message, started_at, created_at, updated_at)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?15)",
        params![
            id.as_str(),
            command.name,
            command.data,
            sequence,
            command.parent_id.as_ref().map(CommandId::as_str),
            command.status.as_str(),
            command.ready_at,
            command.delay,
            command.period,
            command.deadline_at,
            command.transactional,
            command.retries,
            command.message,
            command.started_at,
            now,
        ],
    )?;

    command.id = Some(id);
    Ok(())
}

fn update_row(conn: &Connection, id: &CommandId, update: &CommandUpdate, now: i64) -> Result<()> {
    if update.is_empty() {
        return Ok(());
    }

    let mut sets = vec!["updated_at = ?"];
    let mut values = vec![Value::Integer(now)];

    if let Some(status) = update.status {
        sets.push("status = ?");
        values.push(Value::Text(status.as_str().to_string()));
    }
    if let Some(ref message) = update.message {
        sets.push("message = ?");
        values.push(Value::Text(message.clone()));
    }
    if let Some(retries) = update.retries {
        sets.push("retries = ?");
        values.push(Value::Integer(retries as i64));
    }
    if let Some(started_at) = update.started_at {
        sets.push("started_at = ?");
        values.push(Value::Integer(started_at));
    }
    if let Some(ready_at) = update.ready_at {
        sets.push("ready_at = ?");
        values.push(Value::Integer(ready_at));
    }
    if let Some(ref data) = update.data {
        sets.push("data = ?");
        values.push(Value::Text(data.clone()));
    }
    values.push(Value::Text(id.0.clone()));

    let sql = format!("UPDATE commands SET {} WHERE id = ?", sets.join(", "));
    let n = conn.execute(&sql, params_from_iter(values))?;
    if n == 0 {
        return Err(CommandError::NotFound { id: id.to_string() });
    }
    Ok(())
}

fn get_row(conn: &Connection, id: &CommandId) -> Result<Option<Command>> {
    match conn.query_row(
        &format!("SELECT {COLUMNS} FROM commands WHERE id = ?1"),
        [id.as_str()],
        row_to_command,
    ) {
        Ok(c) => Ok(Some(c)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(CommandError::Database(e)),
    }
}

fn find_rows(
    conn: &Connection,
    statuses: &[CommandStatus],
    exclude_names: &[String],
) -> Result<Vec<Command>> {
    if statuses.is_empty() {
        return Ok(Vec::new());
    }

    let mut sql = format!(
        "SELECT {COLUMNS} FROM commands WHERE status IN ({})",
        placeholders(statuses.len())
    );
    let mut values: Vec<Value> = statuses
        .iter()
        .map(|s| Value::Text(s.as_str().to_string()))
        .collect();
    if !exclude_names.is_empty() {
        sql.push_str(&format!(
            " AND name NOT IN ({})",
            placeholders(exclude_names.len())
        ));
        values.extend(exclude_names.iter().cloned().map(Value::Text));
    }
    sql.push_str(" ORDER BY created_at, id");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(values), row_to_command)?;
    Ok(collect_rows(rows))
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// Keep readable rows; a corrupt row is logged and skipped rather than
/// blocking every other command.
fn collect_rows(rows: impl Iterator<Item = rusqlite::Result<Command>>) -> Vec<Command> {
    rows.filter_map(|r| match r {
        Ok(c) => Some(c),
        Err(e) => {
            warn!("skipping unreadable command row: {e}");
            None
        }
    })
    .collect()
}

/// Map a SQLite row (in `COLUMNS` order) to a `Command`.
fn row_to_command(row: &rusqlite::Row<'_>) -> rusqlite::Result<Command> {
    let sequence_json: String = row.get(3)?;
    let sequence: Vec<String> = serde_json::from_str(&sequence_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?;
    let status_str: String = row.get(5)?;
    let status: CommandStatus = status_str
        .parse()
        .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, e.into()))?;

    Ok(Command {
        id: Some(CommandId(row.get(0)?)),
        name: row.get(1)?,
        data: row.get(2)?,
        sequence,
        parent_id: row.get::<_, Option<String>>(4)?.map(CommandId),
        status,
        ready_at: row.get(6)?,
        delay: row.get(7)?,
        period: row.get(8)?,
        deadline_at: row.get(9)?,
        transactional: row.get(10)?,
        retries: row.get(11)?,
        message: row.get(12)?,
        started_at: row.get(13)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo() -> Command {
        Command::new("echo")
            .with_data(r#"{"v":1}"#)
            .with_sequence(vec!["a".into(), "b".into()])
            .with_retries(2)
            .with_ready_at(1_000)
    }

    #[tokio::test]
    async fn insert_assigns_id_and_reads_back() {
        let store = CommandStore::open_in_memory().unwrap();
        let mut cmd = echo();
        store.insert(&mut cmd).await.unwrap();

        let id = cmd.id.clone().expect("id assigned");
        let loaded = store.get(&id).await.unwrap().expect("row exists");
        assert_eq!(loaded, cmd);
        assert_eq!(loaded.status, CommandStatus::Pending);
    }

    #[tokio::test]
    async fn second_insert_is_rejected() {
        let store = CommandStore::open_in_memory().unwrap();
        let mut cmd = echo();
        store.insert(&mut cmd).await.unwrap();
        let first = cmd.id.clone();
        assert!(matches!(
            store.insert(&mut cmd).await,
            Err(CommandError::Invalid(_))
        ));
        assert_eq!(cmd.id, first);
    }

    #[tokio::test]
    async fn update_writes_selected_columns() {
        let store = CommandStore::open_in_memory().unwrap();
        let mut cmd = echo();
        store.insert(&mut cmd).await.unwrap();
        let id = cmd.id.clone().unwrap();

        store
            .update(
                &id,
                &CommandUpdate::status(CommandStatus::Failed)
                    .with_message("boom")
                    .with_retries(0),
            )
            .await
            .unwrap();

        let loaded = store.get(&id).await.unwrap().unwrap();
        assert_eq!(loaded.status, CommandStatus::Failed);
        assert_eq!(loaded.message.as_deref(), Some("boom"));
        assert_eq!(loaded.retries, 0);
        assert_eq!(loaded.data, cmd.data);
    }

    #[tokio::test]
    async fn update_missing_row_is_not_found() {
        let store = CommandStore::open_in_memory().unwrap();
        let err = store
            .update(&CommandId::from("nope"), &CommandUpdate::started_at(1))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::NotFound { .. }));
    }

    #[tokio::test]
    async fn find_by_status_filters_names() {
        let store = CommandStore::open_in_memory().unwrap();
        for name in ["echo", "cleaner", "echo"] {
            store.insert(&mut Command::new(name)).await.unwrap();
        }
        let mut done = Command::new("echo");
        store.insert(&mut done).await.unwrap();
        store
            .update(
                done.id.as_ref().unwrap(),
                &CommandUpdate::status(CommandStatus::Completed),
            )
            .await
            .unwrap();

        let found = store
            .find_by_status(&CommandStatus::RESUMABLE, &["cleaner".to_string()])
            .await
            .unwrap();
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|c| c.name == "echo"));
    }

    #[tokio::test]
    async fn remove_finalized_keeps_live_commands() {
        let store = CommandStore::open_in_memory().unwrap();
        let mut live = Command::new("echo");
        let mut done = Command::new("echo");
        store.insert(&mut live).await.unwrap();
        store.insert(&mut done).await.unwrap();
        store
            .update(
                done.id.as_ref().unwrap(),
                &CommandUpdate::status(CommandStatus::Expired),
            )
            .await
            .unwrap();

        let removed = store
            .remove_finalized_before(store.now_ms() + 1_000)
            .await
            .unwrap();
        assert_eq!(removed, 1);
        let left = store.list().await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, live.id);
    }

    #[tokio::test]
    async fn dropped_transaction_rolls_back() {
        let store = CommandStore::open_in_memory().unwrap();
        {
            let mut tx = store.begin().await.unwrap();
            tx.insert(&mut Command::new("echo")).unwrap();
        }
        assert!(store.list().await.unwrap().is_empty());

        let mut tx = store.begin().await.unwrap();
        tx.insert(&mut Command::new("echo")).unwrap();
        tx.commit().unwrap();
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_by_name_counts_rows() {
        let store = CommandStore::open_in_memory().unwrap();
        store.insert(&mut Command::new("cleaner")).await.unwrap();
        store.insert(&mut Command::new("cleaner")).await.unwrap();
        store.insert(&mut Command::new("echo")).await.unwrap();
        assert_eq!(store.delete_by_name("cleaner").await.unwrap(), 2);
        assert_eq!(store.list().await.unwrap().len(), 1);
    }
}
