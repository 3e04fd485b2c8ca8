//! Persisted subscription state.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

#[cfg(test)]
use mockall::automock;
use rusqlite::{Connection, OptionalExtension};
use thiserror::Error;
use tracing::{debug, info};

use crate::subscription::{ReadyCondition, SubscriptionId, SubscriptionState};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("database lock poisoned")]
    LockPoisoned,
}

/// Strongly consistent per-key read/write access to subscription state.
///
/// The host scheduler guarantees a single writer per subscription id, so
/// implementations only need to be safe for concurrent access across distinct
/// keys.
#[cfg_attr(test, automock)]
pub trait StateStore: Send + Sync {
    fn load(&self, id: &SubscriptionId) -> Result<Option<SubscriptionState>, StoreError>;

    fn save(&self, id: &SubscriptionId, state: &SubscriptionState) -> Result<(), StoreError>;
}

/// SQLite-backed [`StateStore`].
pub struct SqliteStateStore {
    conn: Mutex<Connection>,
}

impl SqliteStateStore {
    pub fn new(db_path: &Path) -> Result<Self, StoreError> {
        info!("initializing state database at {:?}", db_path);

        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.create_schema()?;

        Ok(store)
    }

    /// In-memory store, handy for tests and dry runs.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.create_schema()?;
        Ok(store)
    }

    fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    fn current_timestamp_ms() -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system time before UNIX epoch")
            .as_millis() as i64
    }

    fn create_schema(&self) -> Result<(), StoreError> {
        debug!("creating state database schema");

        let conn = self.lock_conn()?;
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS subscription_state (
                namespace TEXT NOT NULL,
                name TEXT NOT NULL,
                last_attempted_version TEXT NOT NULL DEFAULT '',
                last_applied_version TEXT NOT NULL DEFAULT '',
                replicated_repository_url TEXT NOT NULL DEFAULT '',
                observed_generation INTEGER NOT NULL DEFAULT 0,
                ready_status INTEGER,
                ready_reason TEXT,
                ready_message TEXT,
                ready_last_transition TEXT,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (namespace, name)
            )
            "#,
            [],
        )?;

        Ok(())
    }
}

impl StateStore for SqliteStateStore {
    fn load(&self, id: &SubscriptionId) -> Result<Option<SubscriptionState>, StoreError> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT last_attempted_version, last_applied_version,
                   replicated_repository_url, observed_generation,
                   ready_status, ready_reason, ready_message, ready_last_transition
            FROM subscription_state
            WHERE namespace = ?1 AND name = ?2
            "#,
        )?;

        let state = stmt
            .query_row((&id.namespace, &id.name), |row| {
                let ready_status: Option<bool> = row.get(4)?;
                let ready = match ready_status {
                    Some(status) => Some(ReadyCondition {
                        status,
                        reason: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
                        message: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
                        last_transition_time: row.get::<_, Option<String>>(7)?.unwrap_or_default(),
                    }),
                    None => None,
                };

                Ok(SubscriptionState {
                    last_attempted_version: row.get(0)?,
                    last_applied_version: row.get(1)?,
                    replicated_repository_url: row.get(2)?,
                    observed_generation: row.get(3)?,
                    ready,
                })
            })
            .optional()?;

        Ok(state)
    }

    fn save(&self, id: &SubscriptionId, state: &SubscriptionState) -> Result<(), StoreError> {
        let conn = self.lock_conn()?;
        conn.execute(
            r#"
            INSERT INTO subscription_state (
                namespace, name, last_attempted_version, last_applied_version,
                replicated_repository_url, observed_generation,
                ready_status, ready_reason, ready_message, ready_last_transition,
                updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT (namespace, name) DO UPDATE SET
                last_attempted_version = excluded.last_attempted_version,
                last_applied_version = excluded.last_applied_version,
                replicated_repository_url = excluded.replicated_repository_url,
                observed_generation = excluded.observed_generation,
                ready_status = excluded.ready_status,
                ready_reason = excluded.ready_reason,
                ready_message = excluded.ready_message,
                ready_last_transition = excluded.ready_last_transition,
                updated_at = excluded.updated_at
            "#,
            (
                &id.namespace,
                &id.name,
                &state.last_attempted_version,
                &state.last_applied_version,
                &state.replicated_repository_url,
                state.observed_generation,
                state.ready.as_ref().map(|c| c.status),
                state.ready.as_ref().map(|c| c.reason.as_str()),
                state.ready.as_ref().map(|c| c.message.as_str()),
                state.ready.as_ref().map(|c| c.last_transition_time.as_str()),
                Self::current_timestamp_ms(),
            ),
        )?;

        Ok(())
    }
}
