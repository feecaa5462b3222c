use rusqlite::Connection;

use crate::error::Result;

/// Initialise the command schema in `conn`.
///
/// Creates the `commands` table (idempotent) plus the indexes replay and the
/// parent lookup rely on.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS commands (
            id            TEXT    NOT NULL PRIMARY KEY,
            name          TEXT    NOT NULL,
            data          TEXT,               -- packed by the handler
            sequence      TEXT    NOT NULL DEFAULT '[]',
            parent_id     TEXT,
            status        TEXT    NOT NULL DEFAULT 'PENDING',
            ready_at      INTEGER,            -- epoch ms
            delay         INTEGER NOT NULL DEFAULT 0,
            period        INTEGER,
            deadline_at   INTEGER,
            transactional INTEGER NOT NULL DEFAULT 0,
            retries       INTEGER NOT NULL DEFAULT 0,
            message       TEXT,
            started_at    INTEGER,
            created_at    INTEGER NOT NULL,
            updated_at    INTEGER NOT NULL
        ) STRICT;

        -- Replay: SELECT … WHERE status IN (…) AND name NOT IN (…)
        CREATE INDEX IF NOT EXISTS idx_commands_status_name ON commands (status, name);
        CREATE INDEX IF NOT EXISTS idx_commands_parent ON commands (parent_id);
        ",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        init_db(&conn).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM commands", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
