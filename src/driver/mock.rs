//! Recording driver used by the crate's unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{ConnectArgs, Connection, Cursor, Driver, Row, RowSet, Value};
use crate::error::DriverError;

/// Calls observed on one connection.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Calls {
    pub cursors: usize,
    pub executes: Vec<String>,
    pub fetches: usize,
    pub cursor_closes: usize,
    pub commits: usize,
    pub rollbacks: usize,
    pub closes: usize,
    pub hooked: usize,
}

#[derive(Default)]
pub struct MockState {
    next_id: AtomicUsize,
    fail_connect: AtomicBool,
    fail_commit: AtomicBool,
    results: Mutex<HashMap<String, RowSet>>,
    fail_execute: Mutex<Vec<String>>,
    fail_fetch: Mutex<Vec<String>>,
    calls: Mutex<HashMap<usize, Calls>>,
}

impl MockState {
    fn record(&self, id: usize, f: impl FnOnce(&mut Calls)) {
        let mut calls = self.calls.lock();
        f(calls.entry(id).or_default());
    }
}

#[derive(Clone, Default)]
pub struct MockDriver {
    state: Arc<MockState>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows returned when `sql` is executed.
    pub fn with_result(self, sql: &str, rows: RowSet) -> Self {
        self.state.results.lock().insert(sql.to_owned(), rows);
        self
    }

    /// Makes `execute` fail for statements containing `fragment`.
    pub fn failing_on(self, fragment: &str) -> Self {
        self.state.fail_execute.lock().push(fragment.to_owned());
        self
    }

    /// Makes fetches fail after executing a statement containing `fragment`.
    pub fn failing_fetch_on(self, fragment: &str) -> Self {
        self.state.fail_fetch.lock().push(fragment.to_owned());
        self
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.state.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_commit(&self, fail: bool) {
        self.state.fail_commit.store(fail, Ordering::SeqCst);
    }

    /// Number of connections opened so far.
    pub fn opened(&self) -> usize {
        self.state.next_id.load(Ordering::SeqCst)
    }

    pub fn calls(&self, id: usize) -> Calls {
        self.state
            .calls
            .lock()
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }

    /// Sum of the calls across every connection.
    pub fn totals(&self) -> Calls {
        let calls = self.state.calls.lock();
        calls.values().fold(Calls::default(), |mut acc, c| {
            acc.cursors += c.cursors;
            acc.executes.extend(c.executes.iter().cloned());
            acc.fetches += c.fetches;
            acc.cursor_closes += c.cursor_closes;
            acc.commits += c.commits;
            acc.rollbacks += c.rollbacks;
            acc.closes += c.closes;
            acc.hooked += c.hooked;
            acc
        })
    }
}

impl Driver for MockDriver {
    type Connection = MockConnection;

    fn name(&self) -> &str {
        "mock"
    }

    fn check_args(&self, args: &ConnectArgs) -> Result<(), DriverError> {
        match args.get_named("reject") {
            Some(_) => Err("rejected connect arguments".into()),
            None => Ok(()),
        }
    }

    fn connect(&self, _args: &ConnectArgs) -> Result<MockConnection, DriverError> {
        if self.state.fail_connect.load(Ordering::SeqCst) {
            return Err("connection refused".into());
        }
        let id = self.state.next_id.fetch_add(1, Ordering::SeqCst);
        self.state.record(id, |_| {});
        Ok(MockConnection {
            id,
            state: Arc::clone(&self.state),
        })
    }
}

pub struct MockConnection {
    pub id: usize,
    state: Arc<MockState>,
}

impl MockConnection {
    /// Marks this connection as seen by the on-connect hook.
    pub fn mark_hooked(&mut self) {
        self.state.record(self.id, |c| c.hooked += 1);
    }
}

impl Connection for MockConnection {
    type Cursor = MockCursor;

    fn cursor(&mut self) -> Result<MockCursor, DriverError> {
        self.state.record(self.id, |c| c.cursors += 1);
        Ok(MockCursor {
            conn: self.id,
            state: Arc::clone(&self.state),
            rows: VecDeque::new(),
            rowcount: None,
            fail_fetch: false,
        })
    }

    fn commit(&mut self) -> Result<(), DriverError> {
        self.state.record(self.id, |c| c.commits += 1);
        if self.state.fail_commit.load(Ordering::SeqCst) {
            return Err("commit failed".into());
        }
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), DriverError> {
        self.state.record(self.id, |c| c.rollbacks += 1);
        Ok(())
    }

    fn close(&mut self) -> Result<(), DriverError> {
        self.state.record(self.id, |c| c.closes += 1);
        Ok(())
    }
}

pub struct MockCursor {
    conn: usize,
    state: Arc<MockState>,
    rows: VecDeque<Row>,
    rowcount: Option<u64>,
    fail_fetch: bool,
}

impl MockCursor {
    fn fetched(&mut self) -> Result<(), DriverError> {
        self.state.record(self.conn, |c| c.fetches += 1);
        if self.fail_fetch {
            return Err("fetch failed".into());
        }
        Ok(())
    }
}

impl Cursor for MockCursor {
    fn execute(&mut self, sql: &str, _params: &[Value]) -> Result<(), DriverError> {
        self.state.record(self.conn, |c| c.executes.push(sql.to_owned()));
        let matches = |list: &Mutex<Vec<String>>| {
            list.lock().iter().any(|fragment| sql.contains(fragment.as_str()))
        };
        if matches(&self.state.fail_execute) {
            return Err(format!("execute failed: {sql}").into());
        }
        self.fail_fetch = matches(&self.state.fail_fetch);
        let rows = self.state.results.lock().get(sql).cloned().unwrap_or_default();
        self.rowcount = Some(rows.len() as u64);
        self.rows = rows.into();
        Ok(())
    }

    fn fetch_one(&mut self) -> Result<Option<Row>, DriverError> {
        self.fetched()?;
        Ok(self.rows.pop_front())
    }

    fn fetch_all(&mut self) -> Result<RowSet, DriverError> {
        self.fetched()?;
        Ok(self.rows.drain(..).collect())
    }

    fn rowcount(&self) -> Option<u64> {
        self.rowcount
    }

    fn close(&mut self) -> Result<(), DriverError> {
        self.state.record(self.conn, |c| c.cursor_closes += 1);
        Ok(())
    }
}
