// clusterrestore/src/testutils.rs
//! In-memory doubles for the database and cluster seams.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::cluster::{CommandOutput, RemoteExecutor};
use crate::errors::{RestoreError, Result};
use crate::restore::db_restore::{Connector, RestoreConnection};

/// Orders database statements against cluster commands within one test.
static SEQUENCE: AtomicUsize = AtomicUsize::new(0);

fn next_seq() -> usize {
    SEQUENCE.fetch_add(1, Ordering::SeqCst)
}

/// State shared by every connection handed out by one `MockConnector`.
#[derive(Default)]
pub struct MockDb {
    log: Mutex<Vec<(usize, usize, String)>>,
    failures: Mutex<Vec<(String, String)>>,
    rows: Mutex<Vec<(String, Vec<Vec<String>>)>>,
    affected: Mutex<Vec<(String, u64)>>,
    delays: Mutex<Vec<(String, Duration)>>,
    closed: AtomicUsize,
}

impl MockDb {
    pub fn new() -> Arc<Self> {
        Arc::new(MockDb::default())
    }

    pub fn fail_when_contains(&self, pattern: &str, message: &str) {
        self.failures.lock().unwrap().push((pattern.to_string(), message.to_string()));
    }

    pub fn respond_rows(&self, pattern: &str, rows: Vec<Vec<String>>) {
        self.rows.lock().unwrap().push((pattern.to_string(), rows));
    }

    pub fn rows_affected_when_contains(&self, pattern: &str, count: u64) {
        self.affected.lock().unwrap().push((pattern.to_string(), count));
    }

    pub fn delay_when_contains(&self, pattern: &str, delay: Duration) {
        self.delays.lock().unwrap().push((pattern.to_string(), delay));
    }

    pub fn executed(&self) -> Vec<String> {
        self.log.lock().unwrap().iter().map(|(_, _, sql)| sql.clone()).collect()
    }

    pub fn executed_on(&self, conn_num: usize) -> Vec<String> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, n, _)| *n == conn_num)
            .map(|(_, _, sql)| sql.clone())
            .collect()
    }

    /// When the first statement containing `pattern` ran.
    pub fn first_seq(&self, pattern: &str) -> Option<usize> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .find(|(_, _, sql)| sql.contains(pattern))
            .map(|(seq, _, _)| *seq)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    async fn run(&self, conn_num: usize, sql: &str) -> Result<()> {
        self.log.lock().unwrap().push((next_seq(), conn_num, sql.to_string()));
        let delay = self
            .delays
            .lock()
            .unwrap()
            .iter()
            .find(|(p, _)| sql.contains(p.as_str()))
            .map(|(_, d)| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failure = self
            .failures
            .lock()
            .unwrap()
            .iter()
            .find(|(p, _)| sql.contains(p.as_str()))
            .map(|(_, m)| m.clone());
        match failure {
            Some(message) => Err(RestoreError::Execution(message)),
            None => Ok(()),
        }
    }
}

pub struct MockConnection {
    db: Arc<MockDb>,
    conn_num: usize,
}

impl MockConnection {
    pub fn new(conn_num: usize) -> Self {
        MockConnection { db: MockDb::new(), conn_num }
    }

    pub fn on(db: Arc<MockDb>, conn_num: usize) -> Self {
        MockConnection { db, conn_num }
    }

    pub fn fail_when_contains(&self, pattern: &str, message: &str) {
        self.db.fail_when_contains(pattern, message);
    }

    pub fn respond_rows(&self, pattern: &str, rows: Vec<Vec<String>>) {
        self.db.respond_rows(pattern, rows);
    }

    pub fn executed(&self) -> Vec<String> {
        self.db.executed()
    }
}

#[async_trait]
impl RestoreConnection for MockConnection {
    fn conn_num(&self) -> usize {
        self.conn_num
    }

    async fn exec(&mut self, sql: &str) -> Result<u64> {
        self.db.run(self.conn_num, sql).await?;
        let count = self
            .db
            .affected
            .lock()
            .unwrap()
            .iter()
            .find(|(p, _)| sql.contains(p.as_str()))
            .map(|(_, c)| *c)
            .unwrap_or(0);
        Ok(count)
    }

    async fn select_rows(&mut self, sql: &str) -> Result<Vec<Vec<String>>> {
        self.db.run(self.conn_num, sql).await?;
        let rows = self
            .db
            .rows
            .lock()
            .unwrap()
            .iter()
            .find(|(p, _)| sql.contains(p.as_str()))
            .map(|(_, r)| r.clone())
            .unwrap_or_default();
        Ok(rows)
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.db.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct MockConnector {
    pub db: Arc<MockDb>,
    user: String,
    connects: Mutex<Vec<String>>,
}

impl MockConnector {
    pub fn new(user: &str) -> Self {
        MockConnector {
            db: MockDb::new(),
            user: user.to_string(),
            connects: Mutex::new(Vec::new()),
        }
    }

    /// Databases connected to, in order.
    pub fn connects(&self) -> Vec<String> {
        self.connects.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, database: &str, conn_num: usize) -> Result<Box<dyn RestoreConnection>> {
        self.connects.lock().unwrap().push(database.to_string());
        Ok(Box::new(MockConnection::on(self.db.clone(), conn_num)))
    }

    fn user(&self) -> String {
        self.user.clone()
    }
}

/// Records every command and answers from canned responses. Commands match
/// a failure or response when they contain its pattern.
#[derive(Default)]
pub struct MockExecutor {
    remote: Mutex<Vec<(String, String)>>,
    local: Mutex<Vec<String>>,
    failures: Mutex<Vec<String>>,
    responses: Mutex<Vec<(String, String)>>,
    issued: Mutex<Vec<(usize, String)>>,
    copied: Mutex<Vec<String>>,
}

impl MockExecutor {
    pub fn fail_when_contains(&self, pattern: &str) {
        self.failures.lock().unwrap().push(pattern.to_string());
    }

    pub fn respond_when_contains(&self, pattern: &str, stdout: &str) {
        self.responses.lock().unwrap().push((pattern.to_string(), stdout.to_string()));
    }

    pub fn remote_commands(&self) -> Vec<(String, String)> {
        self.remote.lock().unwrap().clone()
    }

    pub fn local_commands(&self) -> Vec<String> {
        self.local.lock().unwrap().clone()
    }

    /// When the first command containing `pattern` was issued.
    pub fn first_seq(&self, pattern: &str) -> Option<usize> {
        self.issued
            .lock()
            .unwrap()
            .iter()
            .find(|(_, c)| c.contains(pattern))
            .map(|(seq, _)| *seq)
    }

    /// Contents of every local file shipped with scp, in order.
    pub fn copied_files(&self) -> Vec<String> {
        self.copied.lock().unwrap().clone()
    }

    /// Every command run anywhere, remote ones without their host.
    pub fn all_commands(&self) -> Vec<String> {
        let mut all = self.local_commands();
        all.extend(self.remote_commands().into_iter().map(|(_, c)| c));
        all
    }

    fn answer(&self, command: &str) -> CommandOutput {
        self.issued.lock().unwrap().push((next_seq(), command.to_string()));
        if self.failures.lock().unwrap().iter().any(|p| command.contains(p.as_str())) {
            return CommandOutput {
                stdout: String::new(),
                stderr: "command failed".to_string(),
                exit_code: 1,
            };
        }
        let stdout = self
            .responses
            .lock()
            .unwrap()
            .iter()
            .find(|(p, _)| command.contains(p.as_str()))
            .map(|(_, s)| s.clone())
            .unwrap_or_default();
        CommandOutput { stdout, stderr: String::new(), exit_code: 0 }
    }
}

#[async_trait]
impl RemoteExecutor for MockExecutor {
    async fn execute_remote(&self, host: &str, command: &str) -> Result<CommandOutput> {
        self.remote.lock().unwrap().push((host.to_string(), command.to_string()));
        Ok(self.answer(command))
    }

    async fn execute_local(&self, command: &str) -> Result<CommandOutput> {
        self.local.lock().unwrap().push(command.to_string());
        if let Some(source) = command.strip_prefix("scp ").and_then(|rest| rest.split_whitespace().next()) {
            if let Ok(contents) = std::fs::read_to_string(source) {
                self.copied.lock().unwrap().push(contents);
            }
        }
        Ok(self.answer(command))
    }
}
