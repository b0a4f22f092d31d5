//! Scripted backend for tests.
//!
//! Responses are keyed by SQL substring, first match wins. Every
//! statement the adapter hands down is recorded, so tests can assert on
//! the exact translated SQL an engine would have received.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::error::BackendError;
use super::{Backend, BackendSession, RawTable};
use crate::net::{Datum, ExecuteResult, QueryResult};

#[derive(Clone)]
pub enum Outcome {
    Rows(QueryResult),
    Affected(ExecuteResult),
    Fail(BackendError),
}

struct Rule {
    pattern: String,
    outcome: Outcome,
}

#[derive(Default)]
struct MockState {
    rules: Mutex<Vec<Rule>>,
    log: Mutex<Vec<(String, Vec<Datum>)>>,
    begins: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
    fail_begins: AtomicBool,
    fail_commits: AtomicUsize,
    schema: Mutex<Vec<RawTable>>,
    closed: AtomicBool,
    delay_ms: AtomicUsize,
}

impl MockState {
    fn record(&self, sql: &str, params: &[Datum]) {
        self.log.lock().push((sql.to_string(), params.to_vec()));
    }

    fn lookup(&self, sql: &str) -> Option<Outcome> {
        self.rules
            .lock()
            .iter()
            .find(|rule| sql.contains(&rule.pattern))
            .map(|rule| rule.outcome.clone())
    }

    fn query(&self, sql: &str, params: &[Datum]) -> Result<QueryResult, BackendError> {
        self.record(sql, params);
        match self.lookup(sql) {
            Some(Outcome::Rows(result)) => Ok(result),
            Some(Outcome::Affected(_)) | None => Ok(QueryResult::empty()),
            Some(Outcome::Fail(error)) => Err(error),
        }
    }

    fn execute(&self, sql: &str, params: &[Datum]) -> Result<ExecuteResult, BackendError> {
        self.record(sql, params);
        match self.lookup(sql) {
            Some(Outcome::Affected(result)) => Ok(result),
            Some(Outcome::Rows(result)) => Ok(ExecuteResult::new(result.row_count as u64)),
            Some(Outcome::Fail(error)) => Err(error),
            None => Ok(ExecuteResult::new(1)),
        }
    }
}

#[derive(Clone, Default)]
pub struct MockBackend {
    state: Arc<MockState>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(self, pattern: &str, result: QueryResult) -> Self {
        self.state.rules.lock().push(Rule {
            pattern: pattern.into(),
            outcome: Outcome::Rows(result),
        });
        self
    }

    pub fn with_affected(self, pattern: &str, result: ExecuteResult) -> Self {
        self.state.rules.lock().push(Rule {
            pattern: pattern.into(),
            outcome: Outcome::Affected(result),
        });
        self
    }

    pub fn with_failure(self, pattern: &str, error: BackendError) -> Self {
        self.state.rules.lock().push(Rule {
            pattern: pattern.into(),
            outcome: Outcome::Fail(error),
        });
        self
    }

    pub fn with_schema(self, tables: Vec<RawTable>) -> Self {
        *self.state.schema.lock() = tables;
        self
    }

    pub fn fail_begins(self) -> Self {
        self.state.fail_begins.store(true, Ordering::SeqCst);
        self
    }

    /// Answer every statement after a pause, for deadline tests.
    pub fn with_delay_ms(self, delay: usize) -> Self {
        self.state.delay_ms.store(delay, Ordering::SeqCst);
        self
    }

    /// Fail the next `count` session commits.
    pub fn fail_commits(&self, count: usize) {
        self.state.fail_commits.store(count, Ordering::SeqCst);
    }

    pub fn sql_log(&self) -> Vec<String> {
        self.state.log.lock().iter().map(|(sql, _)| sql.clone()).collect()
    }

    pub fn params_log(&self) -> Vec<Vec<Datum>> {
        self.state
            .log
            .lock()
            .iter()
            .map(|(_, params)| params.clone())
            .collect()
    }

    pub fn begins(&self) -> usize {
        self.state.begins.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> usize {
        self.state.commits.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> usize {
        self.state.rollbacks.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }
}

async fn pause(state: &MockState) {
    let delay = state.delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(std::time::Duration::from_millis(delay as u64)).await;
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn query(&self, sql: &str, params: &[Datum]) -> Result<QueryResult, BackendError> {
        pause(&self.state).await;
        self.state.query(sql, params)
    }

    async fn execute(&self, sql: &str, params: &[Datum]) -> Result<ExecuteResult, BackendError> {
        pause(&self.state).await;
        self.state.execute(sql, params)
    }

    async fn begin(&self) -> Result<Box<dyn BackendSession>, BackendError> {
        if self.state.fail_begins.load(Ordering::SeqCst) {
            return Err(BackendError::new("cannot begin"));
        }
        self.state.begins.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockSession {
            state: Arc::clone(&self.state),
        }))
    }

    async fn schema(&self) -> Result<Vec<RawTable>, BackendError> {
        Ok(self.state.schema.lock().clone())
    }

    async fn close(&self) -> Result<(), BackendError> {
        self.state.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub struct MockSession {
    state: Arc<MockState>,
}

#[async_trait]
impl BackendSession for MockSession {
    async fn query(&mut self, sql: &str, params: &[Datum]) -> Result<QueryResult, BackendError> {
        self.state.query(sql, params)
    }

    async fn execute(
        &mut self,
        sql: &str,
        params: &[Datum],
    ) -> Result<ExecuteResult, BackendError> {
        self.state.execute(sql, params)
    }

    async fn commit(&mut self) -> Result<(), BackendError> {
        let failures = self.state.fail_commits.load(Ordering::SeqCst);
        if failures > 0 {
            self.state.fail_commits.store(failures - 1, Ordering::SeqCst);
            return Err(BackendError::new("commit failed"));
        }
        self.state.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), BackendError> {
        self.state.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
