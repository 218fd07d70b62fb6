//! Local record store: cached entities, the mutation queue, conflicts and
//! per-table sync state, all in one SQLite database.

use crate::error::{StorageError, StorageResult};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde_json::Value;
use sitehero_types::{
    Conflict, ConflictId, EntityId, MutationId, MutationStatus, PendingMutation, Record,
    SyncStatus, TableName, TableSyncState, VersionSnapshot, now_millis,
};
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

const RECORD_COLUMNS: &str = "id, payload, local_revision, server_version, server_payload, \
     sync_status, deleted, modified_at, last_accessed_at";

const MUTATION_COLUMNS: &str = "id, table_name, entity_id, operation, payload, base_version, \
     priority, retry_count, enqueued_at, next_attempt_at, status, last_error";

const CONFLICT_COLUMNS: &str =
    "id, mutation_id, table_name, entity_id, local_json, server_json, strategy, fields_json, created_at";

/// Durable keyed storage for cached records and sync bookkeeping.
///
/// Cloning is cheap; clones share the same connection.
#[derive(Debug, Clone)]
pub struct LocalStore {
    conn: Arc<Mutex<Connection>>,
    /// Byte quota for record writes. Zero means unlimited.
    quota_bytes: Arc<AtomicU64>,
}

/// A synced record that may be evicted under storage pressure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionCandidate {
    pub table: TableName,
    pub id: EntityId,
    pub size_bytes: u64,
    pub last_accessed_at: i64,
}

impl LocalStore {
    /// Opens or creates a store at the given path.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let conn = crate::open_sqlite_with_wal_recovery(path)?;
        initialize_schema(&conn)?;
        let recovered = reset_in_flight(&conn)?;
        if recovered > 0 {
            info!("recovered {recovered} in-flight mutations from previous session");
        }
        Ok(Self::from_connection(conn))
    }

    /// Opens an in-memory store (for testing).
    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        initialize_schema(&conn)?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            quota_bytes: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_quota(self, quota_bytes: u64) -> Self {
        self.set_quota(quota_bytes);
        self
    }

    pub fn set_quota(&self, quota_bytes: u64) {
        self.quota_bytes.store(quota_bytes, Ordering::Relaxed);
    }

    pub fn quota(&self) -> u64 {
        self.quota_bytes.load(Ordering::Relaxed)
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StorageError::Lock)
    }

    /// Runs `f` inside a single transaction. Nothing is written unless `f`
    /// returns `Ok`.
    pub fn atomically<T>(&self, f: impl FnOnce(&StoreTxn<'_>) -> StorageResult<T>) -> StorageResult<T> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let out = {
            let txn = StoreTxn {
                conn: &tx,
                quota: self.quota(),
            };
            f(&txn)?
        };
        tx.commit()?;
        Ok(out)
    }

    // ── Records ──

    /// Gets a record and marks it as recently accessed.
    pub fn get(&self, table: TableName, id: &EntityId) -> StorageResult<Option<Record>> {
        let conn = self.lock()?;
        let now = now_millis();
        conn.execute(
            &format!("UPDATE {} SET last_accessed_at = ?2 WHERE id = ?1", record_table(table)),
            params![id.as_str(), now],
        )?;
        get_record(&conn, table, id)
    }

    /// Gets a record without touching its access time.
    pub fn peek(&self, table: TableName, id: &EntityId) -> StorageResult<Option<Record>> {
        let conn = self.lock()?;
        get_record(&conn, table, id)
    }

    /// Upserts a record into its table (`record.table`).
    pub fn put(&self, record: &Record) -> StorageResult<()> {
        let conn = self.lock()?;
        put_record(&conn, self.quota(), record)
    }

    /// Removes a record. Returns true if a row was deleted.
    pub fn delete(&self, table: TableName, id: &EntityId) -> StorageResult<bool> {
        let conn = self.lock()?;
        delete_record(&conn, table, id)
    }

    pub fn query_by_status(&self, table: TableName, status: SyncStatus) -> StorageResult<Vec<Record>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM {} WHERE sync_status = ?1 ORDER BY modified_at ASC",
            record_table(table)
        ))?;
        let rows = stmt
            .query_map(params![status.as_str()], |row| row_to_record(table, row))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn count_records(&self, table: TableName) -> StorageResult<u64> {
        let conn = self.lock()?;
        let n: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", record_table(table)),
            [],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }

    // ── Mutations ──

    pub fn put_mutation(&self, mutation: &PendingMutation) -> StorageResult<()> {
        let conn = self.lock()?;
        put_mutation(&conn, mutation)
    }

    pub fn get_mutation(&self, id: &MutationId) -> StorageResult<Option<PendingMutation>> {
        let conn = self.lock()?;
        get_mutation(&conn, id)
    }

    pub fn delete_mutation(&self, id: &MutationId) -> StorageResult<bool> {
        let conn = self.lock()?;
        delete_mutation(&conn, id)
    }

    /// All mutations for one entity in enqueue order.
    pub fn mutations_for_entity(
        &self,
        table: TableName,
        id: &EntityId,
    ) -> StorageResult<Vec<PendingMutation>> {
        let conn = self.lock()?;
        mutations_for_entity(&conn, table, id)
    }

    /// Mutations ordered by `(priority desc, enqueued_at asc)`, optionally
    /// restricted to one status.
    pub fn list_mutations(&self, status: Option<MutationStatus>) -> StorageResult<Vec<PendingMutation>> {
        let conn = self.lock()?;
        list_mutations(&conn, status)
    }

    pub fn count_mutations(&self, status: MutationStatus) -> StorageResult<u64> {
        let conn = self.lock()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM pending_mutations WHERE status = ?1",
            params![status.as_str()],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }

    /// Returns in-flight mutations to pending (after a crash or restart).
    pub fn reset_in_flight(&self) -> StorageResult<usize> {
        let conn = self.lock()?;
        reset_in_flight(&conn)
    }

    // ── Conflicts ──

    pub fn put_conflict(&self, conflict: &Conflict) -> StorageResult<()> {
        let conn = self.lock()?;
        put_conflict(&conn, conflict)
    }

    pub fn get_conflict(&self, id: &ConflictId) -> StorageResult<Option<Conflict>> {
        let conn = self.lock()?;
        get_conflict(&conn, id)
    }

    pub fn list_conflicts(&self) -> StorageResult<Vec<Conflict>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {CONFLICT_COLUMNS} FROM conflicts ORDER BY created_at ASC, id ASC"
        ))?;
        let rows = stmt
            .query_map([], row_to_conflict)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn count_conflicts(&self) -> StorageResult<u64> {
        let conn = self.lock()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM conflicts", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    pub fn delete_conflict(&self, id: &ConflictId) -> StorageResult<bool> {
        let conn = self.lock()?;
        delete_conflict(&conn, id)
    }

    // ── Sync state ──

    pub fn table_sync_state(&self, table: TableName) -> StorageResult<TableSyncState> {
        let conn = self.lock()?;
        let state = conn
            .query_row(
                "SELECT priority, cursor, last_synced_at FROM sync_state WHERE table_name = ?1",
                params![table.as_str()],
                |row| {
                    Ok(TableSyncState {
                        table,
                        priority: row.get(0)?,
                        cursor: row.get::<_, i64>(1)? as u64,
                        last_synced_at: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(state.unwrap_or_else(|| TableSyncState::initial(table)))
    }

    /// Moves a table's cursor forward. Never moves it backwards.
    pub fn advance_cursor(&self, table: TableName, version: u64, at: i64) -> StorageResult<()> {
        let conn = self.lock()?;
        advance_cursor(&conn, table, version, at)
    }

    // ── Quota accounting ──

    /// Approximate bytes held by records, queued mutations and conflicts.
    pub fn usage_bytes(&self) -> StorageResult<u64> {
        let conn = self.lock()?;
        usage_bytes(&conn)
    }

    /// Synced records with no outstanding mutation, lowest table priority
    /// first, least recently accessed first within a priority.
    pub fn eviction_candidates(&self, limit: usize) -> StorageResult<Vec<EvictionCandidate>> {
        let conn = self.lock()?;
        let selects: Vec<String> = TableName::ALL
            .iter()
            .map(|t| {
                format!(
                    "SELECT '{name}' AS tbl, {prio} AS prio, r.id, r.size_bytes, r.last_accessed_at \
                     FROM {table} r \
                     WHERE r.sync_status = 'synced' AND r.deleted = 0 AND NOT EXISTS ( \
                         SELECT 1 FROM pending_mutations m \
                         WHERE m.table_name = '{name}' AND m.entity_id = r.id)",
                    name = t.as_str(),
                    prio = t.priority(),
                    table = record_table(*t),
                )
            })
            .collect();
        let sql = format!(
            "{} ORDER BY prio ASC, last_accessed_at ASC LIMIT ?1",
            selects.join(" UNION ALL ")
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok(EvictionCandidate {
                    table: parsed_col(row, 0)?,
                    id: EntityId(row.get(2)?),
                    size_bytes: row.get::<_, i64>(3)? as u64,
                    last_accessed_at: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Deletes a record only if it is still synced and has no outstanding
    /// mutation. Returns the bytes freed.
    pub fn evict(&self, table: TableName, id: &EntityId) -> StorageResult<u64> {
        let conn = self.lock()?;
        let size: Option<i64> = conn
            .query_row(
                &format!(
                    "SELECT size_bytes FROM {} WHERE id = ?1 AND sync_status = 'synced'",
                    record_table(table)
                ),
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        let Some(size) = size else {
            return Ok(0);
        };
        if !mutations_for_entity(&conn, table, id)?.is_empty() {
            return Ok(0);
        }
        delete_record(&conn, table, id)?;
        debug!("evicted {table}/{id} ({size} bytes)");
        Ok(size as u64)
    }
}

/// Transactional view of the store handed out by [`LocalStore::atomically`].
pub struct StoreTxn<'a> {
    conn: &'a Connection,
    quota: u64,
}

impl StoreTxn<'_> {
    pub fn get(&self, table: TableName, id: &EntityId) -> StorageResult<Option<Record>> {
        get_record(self.conn, table, id)
    }

    pub fn put(&self, record: &Record) -> StorageResult<()> {
        put_record(self.conn, self.quota, record)
    }

    pub fn delete(&self, table: TableName, id: &EntityId) -> StorageResult<bool> {
        delete_record(self.conn, table, id)
    }

    pub fn get_mutation(&self, id: &MutationId) -> StorageResult<Option<PendingMutation>> {
        get_mutation(self.conn, id)
    }

    pub fn put_mutation(&self, mutation: &PendingMutation) -> StorageResult<()> {
        put_mutation(self.conn, mutation)
    }

    pub fn delete_mutation(&self, id: &MutationId) -> StorageResult<bool> {
        delete_mutation(self.conn, id)
    }

    pub fn mutations_for_entity(
        &self,
        table: TableName,
        id: &EntityId,
    ) -> StorageResult<Vec<PendingMutation>> {
        mutations_for_entity(self.conn, table, id)
    }

    pub fn list_mutations(&self, status: Option<MutationStatus>) -> StorageResult<Vec<PendingMutation>> {
        list_mutations(self.conn, status)
    }

    /// Moves a pending mutation to in flight. Returns false if it is gone or
    /// no longer pending.
    pub fn lease_mutation(&self, id: &MutationId) -> StorageResult<bool> {
        let changed = self.conn.execute(
            "UPDATE pending_mutations SET status = ?2 WHERE id = ?1 AND status = ?3",
            params![
                id.to_string(),
                MutationStatus::InFlight.as_str(),
                MutationStatus::Pending.as_str()
            ],
        )?;
        Ok(changed == 1)
    }

    pub fn get_conflict(&self, id: &ConflictId) -> StorageResult<Option<Conflict>> {
        get_conflict(self.conn, id)
    }

    pub fn put_conflict(&self, conflict: &Conflict) -> StorageResult<()> {
        put_conflict(self.conn, conflict)
    }

    pub fn delete_conflict(&self, id: &ConflictId) -> StorageResult<bool> {
        delete_conflict(self.conn, id)
    }

    pub fn advance_cursor(&self, table: TableName, version: u64, at: i64) -> StorageResult<()> {
        advance_cursor(self.conn, table, version, at)
    }
}

fn record_table(table: TableName) -> String {
    format!("rec_{}", table.as_str())
}

// ── Row access shared by the store and its transactions ──

fn get_record(conn: &Connection, table: TableName, id: &EntityId) -> StorageResult<Option<Record>> {
    let record = conn
        .query_row(
            &format!("SELECT {RECORD_COLUMNS} FROM {} WHERE id = ?1", record_table(table)),
            params![id.as_str()],
            |row| row_to_record(table, row),
        )
        .optional()?;
    Ok(record)
}

fn put_record(conn: &Connection, quota: u64, record: &Record) -> StorageResult<()> {
    let table = record_table(record.table);
    let size = record.approx_size() as i64;

    if quota > 0 {
        let used = usage_bytes(conn)? as i64;
        let existing: i64 = conn
            .query_row(
                &format!("SELECT size_bytes FROM {table} WHERE id = ?1"),
                params![record.id.as_str()],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0);
        let projected = (used - existing + size).max(0) as u64;
        // Rewrites that do not grow the row (status flips) always pass.
        if projected > quota && size > existing {
            return Err(StorageError::QuotaExceeded {
                used: projected,
                quota,
            });
        }
    }

    let payload = serde_json::to_string(&record.payload)?;
    let server_payload = record
        .server_payload
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    conn.execute(
        &format!(
            "INSERT INTO {table} ({RECORD_COLUMNS}, size_bytes)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(id) DO UPDATE SET
                payload = excluded.payload,
                local_revision = excluded.local_revision,
                server_version = excluded.server_version,
                server_payload = excluded.server_payload,
                sync_status = excluded.sync_status,
                deleted = excluded.deleted,
                modified_at = excluded.modified_at,
                last_accessed_at = excluded.last_accessed_at,
                size_bytes = excluded.size_bytes"
        ),
        params![
            record.id.as_str(),
            payload,
            record.local_revision as i64,
            record.server_version.map(|v| v as i64),
            server_payload,
            record.sync_status.as_str(),
            record.deleted,
            record.modified_at,
            record.last_accessed_at,
            size,
        ],
    )?;
    Ok(())
}

fn delete_record(conn: &Connection, table: TableName, id: &EntityId) -> StorageResult<bool> {
    let n = conn.execute(
        &format!("DELETE FROM {} WHERE id = ?1", record_table(table)),
        params![id.as_str()],
    )?;
    Ok(n > 0)
}

fn put_mutation(conn: &Connection, m: &PendingMutation) -> StorageResult<()> {
    let payload = m.payload.as_ref().map(serde_json::to_string).transpose()?;
    conn.execute(
        &format!(
            "INSERT INTO pending_mutations ({MUTATION_COLUMNS}, size_bytes)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             ON CONFLICT(id) DO UPDATE SET
                operation = excluded.operation,
                payload = excluded.payload,
                base_version = excluded.base_version,
                priority = excluded.priority,
                retry_count = excluded.retry_count,
                enqueued_at = excluded.enqueued_at,
                next_attempt_at = excluded.next_attempt_at,
                status = excluded.status,
                last_error = excluded.last_error,
                size_bytes = excluded.size_bytes"
        ),
        params![
            m.id.to_string(),
            m.table.as_str(),
            m.entity_id.as_str(),
            m.operation.as_str(),
            payload,
            m.base_version.map(|v| v as i64),
            m.priority,
            m.retry_count,
            m.enqueued_at,
            m.next_attempt_at,
            m.status.as_str(),
            m.last_error,
            m.approx_size() as i64,
        ],
    )?;
    Ok(())
}

fn get_mutation(conn: &Connection, id: &MutationId) -> StorageResult<Option<PendingMutation>> {
    let m = conn
        .query_row(
            &format!("SELECT {MUTATION_COLUMNS} FROM pending_mutations WHERE id = ?1"),
            params![id.to_string()],
            row_to_mutation,
        )
        .optional()?;
    Ok(m)
}

fn delete_mutation(conn: &Connection, id: &MutationId) -> StorageResult<bool> {
    let n = conn.execute(
        "DELETE FROM pending_mutations WHERE id = ?1",
        params![id.to_string()],
    )?;
    Ok(n > 0)
}

fn mutations_for_entity(
    conn: &Connection,
    table: TableName,
    id: &EntityId,
) -> StorageResult<Vec<PendingMutation>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {MUTATION_COLUMNS} FROM pending_mutations
         WHERE table_name = ?1 AND entity_id = ?2
         ORDER BY enqueued_at ASC, id ASC"
    ))?;
    let rows = stmt
        .query_map(params![table.as_str(), id.as_str()], row_to_mutation)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn list_mutations(conn: &Connection, status: Option<MutationStatus>) -> StorageResult<Vec<PendingMutation>> {
    let order = "ORDER BY priority DESC, enqueued_at ASC, id ASC";
    let rows = match status {
        Some(status) => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MUTATION_COLUMNS} FROM pending_mutations WHERE status = ?1 {order}"
            ))?;
            stmt.query_map(params![status.as_str()], row_to_mutation)?
                .collect::<Result<Vec<_>, _>>()?
        }
        None => {
            let mut stmt = conn.prepare(&format!("SELECT {MUTATION_COLUMNS} FROM pending_mutations {order}"))?;
            stmt.query_map([], row_to_mutation)?
                .collect::<Result<Vec<_>, _>>()?
        }
    };
    Ok(rows)
}

fn reset_in_flight(conn: &Connection) -> StorageResult<usize> {
    let n = conn.execute(
        "UPDATE pending_mutations SET status = 'pending' WHERE status = 'in_flight'",
        [],
    )?;
    for table in TableName::ALL {
        conn.execute(
            &format!(
                "UPDATE {} SET sync_status = 'pending' WHERE sync_status = 'syncing'",
                record_table(table)
            ),
            [],
        )?;
    }
    Ok(n)
}

fn put_conflict(conn: &Connection, c: &Conflict) -> StorageResult<()> {
    conn.execute(
        &format!(
            "INSERT OR REPLACE INTO conflicts ({CONFLICT_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
        ),
        params![
            c.id.to_string(),
            c.mutation_id.to_string(),
            c.table.as_str(),
            c.entity_id.as_str(),
            serde_json::to_string(&c.local)?,
            serde_json::to_string(&c.server)?,
            c.strategy,
            serde_json::to_string(&c.fields)?,
            c.created_at,
        ],
    )?;
    Ok(())
}

fn get_conflict(conn: &Connection, id: &ConflictId) -> StorageResult<Option<Conflict>> {
    let c = conn
        .query_row(
            &format!("SELECT {CONFLICT_COLUMNS} FROM conflicts WHERE id = ?1"),
            params![id.to_string()],
            row_to_conflict,
        )
        .optional()?;
    Ok(c)
}

fn delete_conflict(conn: &Connection, id: &ConflictId) -> StorageResult<bool> {
    let n = conn.execute("DELETE FROM conflicts WHERE id = ?1", params![id.to_string()])?;
    Ok(n > 0)
}

fn advance_cursor(conn: &Connection, table: TableName, version: u64, at: i64) -> StorageResult<()> {
    conn.execute(
        "UPDATE sync_state SET cursor = MAX(cursor, ?2), last_synced_at = ?3 WHERE table_name = ?1",
        params![table.as_str(), version as i64, at],
    )?;
    Ok(())
}

fn usage_bytes(conn: &Connection) -> StorageResult<u64> {
    let mut parts: Vec<String> = TableName::ALL
        .iter()
        .map(|t| format!("(SELECT COALESCE(SUM(size_bytes), 0) FROM {})", record_table(*t)))
        .collect();
    parts.push("(SELECT COALESCE(SUM(size_bytes), 0) FROM pending_mutations)".to_string());
    parts.push(
        "(SELECT COALESCE(SUM(LENGTH(local_json) + LENGTH(server_json)), 0) FROM conflicts)"
            .to_string(),
    );
    let used: i64 = conn.query_row(&format!("SELECT {}", parts.join(" + ")), [], |row| row.get(0))?;
    Ok(used.max(0) as u64)
}

// ── Row mapping ──

fn corrupt(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, msg)),
    )
}

fn parsed_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>().map_err(|e| corrupt(idx, e.to_string()))
}

fn json_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Value> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| corrupt(idx, e.to_string()))
}

fn opt_json_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Value>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| serde_json::from_str(&s).map_err(|e| corrupt(idx, e.to_string())))
        .transpose()
}

fn row_to_record(table: TableName, row: &Row<'_>) -> rusqlite::Result<Record> {
    Ok(Record {
        table,
        id: EntityId(row.get(0)?),
        payload: json_col(row, 1)?,
        local_revision: row.get::<_, i64>(2)? as u64,
        server_version: row.get::<_, Option<i64>>(3)?.map(|v| v as u64),
        server_payload: opt_json_col(row, 4)?,
        sync_status: parsed_col(row, 5)?,
        deleted: row.get(6)?,
        modified_at: row.get(7)?,
        last_accessed_at: row.get(8)?,
    })
}

fn row_to_mutation(row: &Row<'_>) -> rusqlite::Result<PendingMutation> {
    Ok(PendingMutation {
        id: parsed_col(row, 0)?,
        table: parsed_col(row, 1)?,
        entity_id: EntityId(row.get(2)?),
        operation: parsed_col(row, 3)?,
        payload: opt_json_col(row, 4)?,
        base_version: row.get::<_, Option<i64>>(5)?.map(|v| v as u64),
        priority: row.get(6)?,
        retry_count: row.get(7)?,
        enqueued_at: row.get(8)?,
        next_attempt_at: row.get(9)?,
        status: parsed_col(row, 10)?,
        last_error: row.get(11)?,
    })
}

fn row_to_conflict(row: &Row<'_>) -> rusqlite::Result<Conflict> {
    let local_raw: String = row.get(4)?;
    let server_raw: String = row.get(5)?;
    let fields_raw: String = row.get(7)?;
    let local: VersionSnapshot =
        serde_json::from_str(&local_raw).map_err(|e| corrupt(4, e.to_string()))?;
    let server: VersionSnapshot =
        serde_json::from_str(&server_raw).map_err(|e| corrupt(5, e.to_string()))?;
    let fields: Vec<String> =
        serde_json::from_str(&fields_raw).map_err(|e| corrupt(7, e.to_string()))?;
    Ok(Conflict {
        id: parsed_col(row, 0)?,
        mutation_id: parsed_col(row, 1)?,
        table: parsed_col(row, 2)?,
        entity_id: EntityId(row.get(3)?),
        local,
        server,
        strategy: row.get(6)?,
        fields,
        created_at: row.get(8)?,
    })
}

fn initialize_schema(conn: &Connection) -> StorageResult<()> {
    for table in TableName::ALL {
        let name = record_table(table);
        conn.execute_batch(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {name} (
                id TEXT PRIMARY KEY,
                payload TEXT NOT NULL,
                local_revision INTEGER NOT NULL DEFAULT 0,
                server_version INTEGER,
                server_payload TEXT,
                sync_status TEXT NOT NULL,
                deleted INTEGER NOT NULL DEFAULT 0,
                modified_at INTEGER NOT NULL,
                last_accessed_at INTEGER NOT NULL,
                size_bytes INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_{name}_status ON {name}(sync_status);
            CREATE INDEX IF NOT EXISTS idx_{name}_accessed ON {name}(last_accessed_at);
            "#
        ))?;
    }

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS pending_mutations (
            id TEXT PRIMARY KEY,
            table_name TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            operation TEXT NOT NULL,
            payload TEXT,
            base_version INTEGER,
            priority INTEGER NOT NULL,
            retry_count INTEGER NOT NULL DEFAULT 0,
            enqueued_at INTEGER NOT NULL,
            next_attempt_at INTEGER NOT NULL,
            status TEXT NOT NULL,
            last_error TEXT,
            size_bytes INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_mutations_order
            ON pending_mutations(status, priority DESC, enqueued_at ASC);
        CREATE INDEX IF NOT EXISTS idx_mutations_entity
            ON pending_mutations(table_name, entity_id);

        CREATE TABLE IF NOT EXISTS conflicts (
            id TEXT PRIMARY KEY,
            mutation_id TEXT NOT NULL,
            table_name TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            local_json TEXT NOT NULL,
            server_json TEXT NOT NULL,
            strategy TEXT NOT NULL,
            fields_json TEXT NOT NULL DEFAULT '[]',
            created_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_conflicts_entity ON conflicts(table_name, entity_id);

        CREATE TABLE IF NOT EXISTS sync_state (
            table_name TEXT PRIMARY KEY,
            priority INTEGER NOT NULL,
            cursor INTEGER NOT NULL DEFAULT 0,
            last_synced_at INTEGER
        );
        "#,
    )?;

    for table in TableName::ALL {
        conn.execute(
            "INSERT INTO sync_state (table_name, priority, cursor) VALUES (?1, ?2, 0)
             ON CONFLICT(table_name) DO UPDATE SET priority = excluded.priority",
            params![table.as_str(), table.priority()],
        )?;
    }
    Ok(())
}
