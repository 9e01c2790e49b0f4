// This file is part of GridSQL.
//
// Copyright (C) 2022 The GridSQL Authors.
//
// GridSQL is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the
// Free Software Foundation, either version 3 of the License, or (at your
// option) any later version.
//
// GridSQL is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License
// for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with GridSQL. If not, see <https://www.gnu.org/licenses/>.

//! SQLite-backed storage, the local participant of the replicated
//! two-phase-commit protocol.
//!
//! A storage owns at most one active transaction at a time. The transaction
//! identity is set on prepare and cleared on commit or rollback; prepare is
//! idempotent for the identity currently held. Statements are buffered at
//! prepare time and executed in order only when the consensus driver decides
//! to commit.

use crate::{
    base::{schema::SqlValue, Mutex},
    twopc::{Participant, WriteBatch},
    Error, ErrorKind, Result,
};
use once_cell::sync::Lazy;
use rusqlite::{types::ValueRef, Connection, OpenFlags};
use std::collections::HashMap;
use std::sync::Arc;

/// Writer and reader handles of one open database.
///
/// Reads run on their own connection so they never collide with a
/// transaction left open on the writer between prepare and commit.
struct DbHandles {
    write: Arc<Mutex<Connection>>,
    read: Arc<Mutex<Connection>>,
}

/// Process-wide index of open connections, keyed by file name.
///
/// Connections are never evicted: SQLite handles are cheap to keep and the
/// set of hosted databases on one node is small.
static DB_INDEX: Lazy<Mutex<HashMap<String, DbHandles>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Transaction identity.
///
/// Equality is component-wise; a participant holds at most one at a time.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy, Default)]
pub struct TxId {
    /// Client connection identifier.
    pub connection_id: u64,
    /// Request sequence number within the connection.
    pub seq_no: u64,
    /// Client-side request time, nanoseconds since the UNIX epoch.
    pub timestamp: i64,
}

/// Execution log: the participant-level write batch.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct ExecLog {
    /// Transaction identity.
    pub tx_id: TxId,
    /// SQL statements, executed in order on commit.
    pub queries: Vec<String>,
}

impl ExecLog {
    /// Wrap into an opaque write batch for the consensus driver.
    pub fn to_batch(&self) -> Result<WriteBatch> {
        WriteBatch::pack(self)
    }
}

/// Read-only query result.
#[derive(Debug, PartialEq, Clone, Default)]
pub struct QueryResult {
    /// Result set column names.
    pub columns: Vec<String>,
    /// Column types as declared by the driver. Empty string when undeclared.
    pub decl_types: Vec<String>,
    /// Rows, values keep the driver's original storage class.
    pub rows: Vec<Vec<SqlValue>>,
}

#[derive(Default)]
struct TxState {
    /// Identity of the current (or last) transaction.
    id: TxId,
    /// Whether an underlying transaction is open.
    active: bool,
    /// Statements buffered by prepare.
    queries: Vec<String>,
}

/// SQLite-backed two-phase-commit participant.
pub struct Storage {
    path: String,
    /// Writer connection, owner of the two-phase-commit transaction.
    conn: Arc<Mutex<Connection>>,
    /// Reader connection. Same handle as `conn` for private in-memory
    /// databases, which cannot be opened twice.
    read_conn: Arc<Mutex<Connection>>,
    state: Mutex<TxState>,
}

impl Storage {
    /// Open (or attach to) the database stored at `path`.
    ///
    /// File-backed connections are shared process-wide by file name. Private
    /// in-memory databases are opened fresh on every call and never cached.
    pub fn new(path: &str) -> Result<Storage> {
        let (conn, read_conn) = open_db(path)?;
        Ok(Storage {
            path: path.to_owned(),
            conn,
            read_conn,
            state: Mutex::new(TxState::default()),
        })
    }

    /// Database path this storage is attached to.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Read-only query. Only the first statement is executed, multiple
    /// result sets are not supported. The read transaction is always rolled
    /// back on exit.
    pub fn query(&self, queries: &[String]) -> Result<QueryResult> {
        let mut result = QueryResult::default();
        if queries.is_empty() {
            return Ok(result);
        }

        if Arc::ptr_eq(&self.conn, &self.read_conn) {
            // Shared handle: hold the transaction slot so the read cannot
            // interleave with a prepare on the same connection.
            let state = self.state.lock();
            let conn = self.read_conn.lock();
            if state.active {
                // The connection already holds the prepared transaction and
                // its statements are not executed before commit; the read
                // runs inside it.
                run_query(&conn, &queries[0], &mut result)?;
                return Ok(result);
            }
            read_in_tx(&conn, &queries[0], &mut result)?;
            return Ok(result);
        }

        let conn = self.read_conn.lock();
        read_in_tx(&conn, &queries[0], &mut result)?;
        Ok(result)
    }

    /// Direct write outside the two-phase-commit path.
    ///
    /// Executes the first statement in its own transaction and returns the
    /// affected rows count. Used for bootstrap and administrative writes;
    /// rejected while a replicated transaction is prepared on this storage.
    pub fn exec(&self, queries: &[String]) -> Result<u64> {
        if queries.is_empty() {
            return Ok(0);
        }
        let state = self.state.lock();
        if state.active {
            return Err(inconsistent_state(&state.id));
        }
        let conn = self.conn.lock();
        conn.execute_batch("BEGIN IMMEDIATE").map_err(db_fault)?;
        let affected = match conn.execute(&queries[0], []) {
            Ok(affected) => affected,
            Err(err) => {
                let _ = conn.execute_batch("ROLLBACK");
                return Err(db_fault(err));
            }
        };
        conn.execute_batch("COMMIT").map_err(db_fault)?;
        Ok(affected as u64)
    }

    /// Release the storage, rolling back a transaction left open.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.active {
            let conn = self.conn.lock();
            conn.execute_batch("ROLLBACK").map_err(db_fault)?;
            state.active = false;
            state.queries.clear();
        }
        Ok(())
    }
}

impl Participant for Storage {
    fn prepare(&self, batch: &WriteBatch) -> Result<()> {
        let log: ExecLog = batch.unpack()?;
        let mut state = self.state.lock();

        if state.active {
            if state.id == log.tx_id {
                // Idempotent prepare: overwrite the buffered statements.
                state.queries = log.queries;
                return Ok(());
            }
            return Err(inconsistent_state(&state.id));
        }

        let conn = self.conn.lock();
        conn.execute_batch("BEGIN IMMEDIATE").map_err(db_fault)?;
        state.id = log.tx_id;
        state.active = true;
        state.queries = log.queries;
        Ok(())
    }

    fn commit(&self, batch: &WriteBatch) -> Result<()> {
        let log: ExecLog = batch.unpack()?;
        let mut state = self.state.lock();

        if !state.active {
            return Err(ErrorKind::NotPrepared.into());
        }
        if state.id != log.tx_id {
            return Err(inconsistent_state(&state.id));
        }

        let queries = std::mem::take(&mut state.queries);
        let conn = self.conn.lock();
        for query in &queries {
            if let Err(err) = conn.execute_batch(query) {
                let _ = conn.execute_batch("ROLLBACK");
                state.active = false;
                return Err(db_fault(err));
            }
        }
        if let Err(err) = conn.execute_batch("COMMIT") {
            let _ = conn.execute_batch("ROLLBACK");
            state.active = false;
            return Err(db_fault(err));
        }
        state.active = false;
        Ok(())
    }

    fn rollback(&self, batch: &WriteBatch) -> Result<()> {
        let log: ExecLog = batch.unpack()?;
        let mut state = self.state.lock();

        if state.id != log.tx_id {
            return Err(inconsistent_state(&state.id));
        }
        // Tolerate a redundant rollback with no transaction open.
        if state.active {
            let conn = self.conn.lock();
            conn.execute_batch("ROLLBACK").map_err(db_fault)?;
            state.active = false;
            state.queries.clear();
        }
        Ok(())
    }
}

fn open_db(path: &str) -> Result<(Arc<Mutex<Connection>>, Arc<Mutex<Connection>>)> {
    // Private in-memory databases get a fresh connection each time and the
    // single handle doubles as the reader.
    if is_private_memory(path) {
        let conn = Arc::new(Mutex::new(open_conn(path)?));
        return Ok((conn.clone(), conn));
    }

    let mut index = DB_INDEX.lock();
    if let Some(handles) = index.get(path) {
        return Ok((handles.write.clone(), handles.read.clone()));
    }
    let write = Arc::new(Mutex::new(open_conn(path)?));
    let read = Arc::new(Mutex::new(open_conn(path)?));
    index.insert(
        path.to_owned(),
        DbHandles {
            write: write.clone(),
            read: read.clone(),
        },
    );
    Ok((write, read))
}

fn is_private_memory(path: &str) -> bool {
    (path == ":memory:" || path.contains("mode=memory")) && !path.contains("cache=shared")
}

fn open_conn(path: &str) -> Result<Connection> {
    let conn = if path.starts_with("file:") {
        Connection::open_with_flags(path, OpenFlags::default() | OpenFlags::SQLITE_OPEN_URI)
    } else {
        Connection::open(path)
    }
    .map_err(db_fault)?;
    conn.pragma_update(None, "journal_mode", &"WAL")
        .map_err(db_fault)?;
    conn.pragma_update(None, "synchronous", &"FULL")
        .map_err(db_fault)?;
    Ok(conn)
}

fn read_in_tx(conn: &Connection, query: &str, out: &mut QueryResult) -> Result<()> {
    conn.execute_batch("BEGIN").map_err(db_fault)?;
    let res = run_query(conn, query, out);
    let _ = conn.execute_batch("ROLLBACK");
    res
}

fn run_query(conn: &Connection, query: &str, out: &mut QueryResult) -> Result<()> {
    let mut stmt = conn.prepare(query).map_err(db_fault)?;
    out.columns = stmt.column_names().iter().map(|s| s.to_string()).collect();
    out.decl_types = stmt
        .columns()
        .iter()
        .map(|c| c.decl_type().unwrap_or("").to_owned())
        .collect();
    let ncols = out.columns.len();
    let mut rows = stmt.query([]).map_err(db_fault)?;
    while let Some(row) = rows.next().map_err(db_fault)? {
        let mut values = Vec::with_capacity(ncols);
        for i in 0..ncols {
            let value = row.get_ref(i).map_err(db_fault)?;
            values.push(sql_value(value));
        }
        out.rows.push(values);
    }
    Ok(())
}

fn sql_value(value: ValueRef) -> SqlValue {
    match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(v) => SqlValue::Integer(v),
        ValueRef::Real(v) => SqlValue::Real(v),
        ValueRef::Text(v) => SqlValue::Text(String::from_utf8_lossy(v).into_owned()),
        ValueRef::Blob(v) => SqlValue::Blob(v.to_vec()),
    }
}

fn db_fault(err: rusqlite::Error) -> Error {
    Error::new_ext(ErrorKind::DatabaseFault, err)
}

fn inconsistent_state(id: &TxId) -> Error {
    Error::new_ext(
        ErrorKind::InconsistentState,
        format!(
            "currently in tx: conn = {}, seq = {}, time = {}",
            id.connection_id, id.seq_no, id.timestamp
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tx_id(seq_no: u64) -> TxId {
        TxId {
            connection_id: 1,
            seq_no,
            timestamp: 1_647_429_000,
        }
    }

    fn batch(seq_no: u64, queries: &[&str]) -> WriteBatch {
        let log = ExecLog {
            tx_id: tx_id(seq_no),
            queries: queries.iter().map(|q| q.to_string()).collect(),
        };
        log.to_batch().unwrap()
    }

    fn create_test_storage() -> Storage {
        let storage = Storage::new(":memory:").unwrap();
        storage
            .exec(&["CREATE TABLE t (k INTEGER PRIMARY KEY, v TEXT)".to_owned()])
            .unwrap();
        storage
    }

    fn count_rows(storage: &Storage) -> i64 {
        let result = storage
            .query(&["SELECT COUNT(*) AS cnt FROM t".to_owned()])
            .unwrap();
        match result.rows[0][0] {
            SqlValue::Integer(v) => v,
            _ => panic!("unexpected count type"),
        }
    }

    #[test]
    fn prepare_commit() {
        let storage = create_test_storage();

        storage
            .prepare(&batch(1, &["INSERT INTO t (v) VALUES ('x')"]))
            .unwrap();
        storage
            .commit(&batch(1, &["INSERT INTO t (v) VALUES ('x')"]))
            .unwrap();

        assert_eq!(count_rows(&storage), 1);
    }

    #[test]
    fn prepare_does_not_execute() {
        let storage = create_test_storage();

        storage
            .prepare(&batch(1, &["INSERT INTO t (v) VALUES ('x')"]))
            .unwrap();

        let state = storage.state.lock();
        assert!(state.active);
        assert_eq!(state.queries.len(), 1);
    }

    #[test]
    fn prepare_idempotent_overwrites_buffer() {
        let storage = create_test_storage();

        storage
            .prepare(&batch(1, &["INSERT INTO t (v) VALUES ('first')"]))
            .unwrap();
        storage
            .prepare(&batch(1, &["INSERT INTO t (v) VALUES ('second')"]))
            .unwrap();
        storage
            .commit(&batch(1, &["INSERT INTO t (v) VALUES ('second')"]))
            .unwrap();

        let result = storage.query(&["SELECT v FROM t".to_owned()]).unwrap();
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.rows[0][0], SqlValue::Text("second".to_owned()));
    }

    #[test]
    fn prepare_foreign_txid_rejected() {
        let storage = create_test_storage();

        storage
            .prepare(&batch(1, &["INSERT INTO t (v) VALUES ('x')"]))
            .unwrap();
        let err = storage
            .prepare(&batch(2, &["INSERT INTO t (v) VALUES ('y')"]))
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::InconsistentState);
        // The active transaction is untouched.
        storage
            .commit(&batch(1, &["INSERT INTO t (v) VALUES ('x')"]))
            .unwrap();
        assert_eq!(count_rows(&storage), 1);
    }

    #[test]
    fn commit_not_prepared() {
        let storage = create_test_storage();

        let err = storage
            .commit(&batch(1, &["INSERT INTO t (v) VALUES ('x')"]))
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::NotPrepared);
    }

    #[test]
    fn commit_statement_failure_rolls_back() {
        let storage = create_test_storage();

        storage
            .prepare(&batch(
                1,
                &[
                    "INSERT INTO t (v) VALUES ('x')",
                    "INSERT INTO bogus (v) VALUES ('y')",
                    "INSERT INTO t (v) VALUES ('z')",
                ],
            ))
            .unwrap();
        let err = storage.commit(&batch(1, &[])).unwrap_err();

        assert_eq!(err.kind, ErrorKind::DatabaseFault);
        assert_eq!(count_rows(&storage), 0);
        // Participant is back to idle, a fresh transaction can be prepared.
        storage
            .prepare(&batch(2, &["INSERT INTO t (v) VALUES ('w')"]))
            .unwrap();
        storage.commit(&batch(2, &[])).unwrap();
        assert_eq!(count_rows(&storage), 1);
    }

    #[test]
    fn rollback_discards_prepared() {
        let storage = create_test_storage();

        storage
            .prepare(&batch(1, &["INSERT INTO t (v) VALUES ('x')"]))
            .unwrap();
        storage.rollback(&batch(1, &[])).unwrap();

        assert_eq!(count_rows(&storage), 0);
        let err = storage.commit(&batch(1, &[])).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotPrepared);
    }

    #[test]
    fn rollback_redundant_tolerated() {
        let storage = create_test_storage();

        storage
            .prepare(&batch(1, &["INSERT INTO t (v) VALUES ('x')"]))
            .unwrap();
        storage.rollback(&batch(1, &[])).unwrap();
        // Same identity again, no transaction open anymore.
        storage.rollback(&batch(1, &[])).unwrap();
    }

    #[test]
    fn rollback_foreign_txid_rejected() {
        let storage = create_test_storage();

        storage
            .prepare(&batch(1, &["INSERT INTO t (v) VALUES ('x')"]))
            .unwrap();
        let err = storage.rollback(&batch(2, &[])).unwrap_err();

        assert_eq!(err.kind, ErrorKind::InconsistentState);
    }

    #[test]
    fn bad_batch_rejected() {
        let storage = create_test_storage();
        let bogus = WriteBatch::pack(&"not an exec log").unwrap();

        let err = storage.prepare(&bogus).unwrap_err();

        assert_eq!(err.kind, ErrorKind::BadBatch);
    }

    #[test]
    fn query_preserves_driver_types() {
        let storage = Storage::new(":memory:").unwrap();
        storage
            .exec(&["CREATE TABLE v (i INTEGER, r REAL, t TEXT, b BLOB, n INTEGER)".to_owned()])
            .unwrap();
        storage
            .exec(&["INSERT INTO v VALUES (42, 2.5, 'hi', x'c0ffee', NULL)".to_owned()])
            .unwrap();

        let result = storage.query(&["SELECT * FROM v".to_owned()]).unwrap();

        assert_eq!(result.columns, vec!["i", "r", "t", "b", "n"]);
        assert_eq!(
            result.decl_types,
            vec!["INTEGER", "REAL", "TEXT", "BLOB", "INTEGER"]
        );
        assert_eq!(
            result.rows[0],
            vec![
                SqlValue::Integer(42),
                SqlValue::Real(2.5),
                SqlValue::Text("hi".to_owned()),
                SqlValue::Blob(vec![0xc0, 0xff, 0xee]),
                SqlValue::Null,
            ]
        );
    }

    #[test]
    fn query_executes_first_statement_only() {
        let storage = create_test_storage();
        storage
            .exec(&["INSERT INTO t (v) VALUES ('x')".to_owned()])
            .unwrap();

        let result = storage
            .query(&[
                "SELECT v FROM t".to_owned(),
                "DELETE FROM t".to_owned(),
            ])
            .unwrap();

        assert_eq!(result.rows.len(), 1);
        assert_eq!(count_rows(&storage), 1);
    }

    #[test]
    fn exec_returns_affected_rows() {
        let storage = create_test_storage();
        storage
            .exec(&["INSERT INTO t (v) VALUES ('x'), ('y')".to_owned()])
            .unwrap();

        let affected = storage.exec(&["DELETE FROM t".to_owned()]).unwrap();

        assert_eq!(affected, 2);
    }

    #[test]
    fn file_connections_are_shared() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shared.db3");
        let path = path.to_str().unwrap();

        let first = Storage::new(path).unwrap();
        first
            .exec(&["CREATE TABLE s (v TEXT)".to_owned()])
            .unwrap();
        first
            .exec(&["INSERT INTO s VALUES ('x')".to_owned()])
            .unwrap();

        let second = Storage::new(path).unwrap();
        let result = second.query(&["SELECT v FROM s".to_owned()]).unwrap();

        assert_eq!(result.rows.len(), 1);
        assert!(Arc::ptr_eq(&first.conn, &second.conn));
        assert!(Arc::ptr_eq(&first.read_conn, &second.read_conn));
        // Reads run on their own handle.
        assert!(!Arc::ptr_eq(&first.conn, &first.read_conn));
    }

    #[test]
    fn query_during_prepared_transaction() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("inflight.db3");
        let storage = Storage::new(path.to_str().unwrap()).unwrap();
        storage
            .exec(&["CREATE TABLE t (k INTEGER PRIMARY KEY, v TEXT)".to_owned()])
            .unwrap();
        storage
            .exec(&["INSERT INTO t (v) VALUES ('x')".to_owned()])
            .unwrap();

        storage
            .prepare(&batch(1, &["INSERT INTO t (v) VALUES ('y')"]))
            .unwrap();

        // A read in the prepare-to-commit window succeeds and sees the
        // committed state only.
        assert_eq!(count_rows(&storage), 1);

        storage.commit(&batch(1, &[])).unwrap();
        assert_eq!(count_rows(&storage), 2);
    }

    #[test]
    fn query_during_prepared_transaction_in_memory() {
        let storage = create_test_storage();
        storage
            .exec(&["INSERT INTO t (v) VALUES ('x')".to_owned()])
            .unwrap();

        storage
            .prepare(&batch(1, &["INSERT INTO t (v) VALUES ('y')"]))
            .unwrap();

        assert_eq!(count_rows(&storage), 1);

        storage.commit(&batch(1, &[])).unwrap();
        assert_eq!(count_rows(&storage), 2);
    }

    #[test]
    fn exec_rejected_during_prepared_transaction() {
        let storage = create_test_storage();

        storage
            .prepare(&batch(1, &["INSERT INTO t (v) VALUES ('x')"]))
            .unwrap();
        let err = storage
            .exec(&["INSERT INTO t (v) VALUES ('y')".to_owned()])
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::InconsistentState);
        // The prepared transaction is untouched.
        storage.commit(&batch(1, &[])).unwrap();
        assert_eq!(count_rows(&storage), 1);
    }

    #[test]
    fn private_memory_not_shared() {
        let first = Storage::new(":memory:").unwrap();
        first
            .exec(&["CREATE TABLE m (v TEXT)".to_owned()])
            .unwrap();

        let second = Storage::new(":memory:").unwrap();
        let err = second.query(&["SELECT v FROM m".to_owned()]).unwrap_err();

        assert_eq!(err.kind, ErrorKind::DatabaseFault);
    }

    #[test]
    fn close_rolls_back_open_transaction() {
        let storage = create_test_storage();

        storage
            .prepare(&batch(1, &["INSERT INTO t (v) VALUES ('x')"]))
            .unwrap();
        storage.close().unwrap();

        assert_eq!(count_rows(&storage), 0);
        let err = storage.commit(&batch(1, &[])).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotPrepared);
    }
}
