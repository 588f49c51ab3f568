//! Database migration system

use rusqlite::{Connection, Result};
use tracing::{error, info};

use crate::memory_db::schema::{self, DatabaseStats};

/// Manages database schema migrations
pub struct MigrationManager<'a> {
    conn: &'a mut Connection,
}

impl<'a> MigrationManager<'a> {
    pub fn new(conn: &'a mut Connection) -> Self {
        Self { conn }
    }

    /// Create the version table and apply whatever is pending
    pub fn initialize_database(&mut self) -> Result<i32> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        let current = current_version(self.conn)?;
        info!("Current database schema version: {}", current);
        self.apply_migrations(current)
    }

    fn apply_migrations(&mut self, current_version: i32) -> Result<i32> {
        let mut version_now = current_version;
        for (version, migration_sql) in MIGRATIONS.iter() {
            if *version <= current_version {
                continue;
            }
            info!("Applying migration {}...", version);

            let tx = self.conn.transaction()?;
            if let Err(e) = tx.execute_batch(migration_sql) {
                error!("Failed to apply migration {}: {}", version, e);
                return Err(e);
            }
            tx.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
            tx.commit()?;

            version_now = *version;
        }
        Ok(version_now)
    }
}

const MIGRATIONS: &[(i32, &str)] = &[(1, schema::SCHEMA_SQL), (2, schema::INDEXES_SQL)];

pub fn latest_version() -> i32 {
    MIGRATIONS.last().map(|(v, _)| *v).unwrap_or(0)
}

fn current_version(conn: &Connection) -> Result<i32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
}

pub fn get_database_stats(conn: &Connection) -> Result<DatabaseStats> {
    let count = |table: &str| -> Result<i64> {
        conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))
    };
    Ok(DatabaseStats {
        schema_version: current_version(conn)?,
        checkpoints: count("checkpoints")?,
        checkpoint_messages: count("checkpoint_messages")?,
        compacted_sessions: count("compacted_sessions")?,
        indexed_conversations: count("indexed_conversations")?,
    })
}
