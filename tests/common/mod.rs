//! Scripted in-memory pool shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use db_timeout_pool::error::{DriverError, PoolResult};
use db_timeout_pool::{Connection, Destroyable, Pool, Query, QueryOutput, Releasable};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::sleep;

/// Enable log output for a test run (`RUST_LOG=debug cargo test`).
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// How the native connection answers a query.
#[derive(Debug, Clone)]
pub enum QueryScript {
    Reply(Duration),
    Fail(Duration, DriverError),
    Hang,
    /// Pending until the transport is destroyed, then a connection error.
    FailOnDestroy,
}

/// How the native pool answers an acquire.
#[derive(Debug, Clone)]
pub enum AcquireScript {
    After(Duration),
    Fail(Duration, DriverError),
    Never,
}

struct State {
    acquire: Mutex<AcquireScript>,
    query: Mutex<QueryScript>,
    thread_id: Mutex<Option<u64>>,
    release_fails: AtomicBool,
    kill_fails: AtomicBool,
    statements: Mutex<Vec<String>>,
    acquired: AtomicUsize,
    released: AtomicUsize,
    destroyed: AtomicUsize,
}

/// A native pool driven by scripts instead of a server.
#[derive(Clone)]
pub struct MockPool {
    state: Arc<State>,
}

impl MockPool {
    pub fn new() -> Self {
        Self {
            state: Arc::new(State {
                acquire: Mutex::new(AcquireScript::After(Duration::ZERO)),
                query: Mutex::new(QueryScript::Reply(Duration::from_millis(10))),
                thread_id: Mutex::new(Some(42)),
                release_fails: AtomicBool::new(false),
                kill_fails: AtomicBool::new(false),
                statements: Mutex::new(Vec::new()),
                acquired: AtomicUsize::new(0),
                released: AtomicUsize::new(0),
                destroyed: AtomicUsize::new(0),
            }),
        }
    }

    pub fn acquire_script(self, script: AcquireScript) -> Self {
        *self.state.acquire.lock().unwrap() = script;
        self
    }

    pub fn query_script(self, script: QueryScript) -> Self {
        *self.state.query.lock().unwrap() = script;
        self
    }

    pub fn thread_id(self, thread_id: Option<u64>) -> Self {
        *self.state.thread_id.lock().unwrap() = thread_id;
        self
    }

    pub fn failing_release(self) -> Self {
        self.state.release_fails.store(true, Ordering::SeqCst);
        self
    }

    pub fn failing_kill(self) -> Self {
        self.state.kill_fails.store(true, Ordering::SeqCst);
        self
    }

    /// Statements run through `Pool::execute` (KILL goes here).
    pub fn statements(&self) -> Vec<String> {
        self.state.statements.lock().unwrap().clone()
    }

    pub fn acquired(&self) -> usize {
        self.state.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.state.released.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> usize {
        self.state.destroyed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Pool for MockPool {
    type Connection = MockConnection;

    async fn acquire(&self) -> PoolResult<MockConnection> {
        let script = self.state.acquire.lock().unwrap().clone();
        match script {
            AcquireScript::After(delay) => sleep(delay).await,
            AcquireScript::Fail(delay, err) => {
                sleep(delay).await;
                return Err(err.into());
            }
            AcquireScript::Never => std::future::pending::<()>().await,
        }

        self.state.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(MockConnection {
            state: Arc::clone(&self.state),
            switch: Arc::new(Switch {
                state: Arc::clone(&self.state),
                destroyed: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        })
    }

    async fn execute(&self, query: &Query) -> PoolResult<QueryOutput> {
        self.state.statements.lock().unwrap().push(query.sql.clone());
        if self.state.kill_fails.load(Ordering::SeqCst) {
            return Err(DriverError::database("Access denied; you need the SUPER privilege", None).into());
        }
        Ok(QueryOutput::write_result(0))
    }
}

struct Switch {
    state: Arc<State>,
    destroyed: AtomicBool,
    notify: Notify,
}

impl Destroyable for Switch {
    fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
        self.state.destroyed.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn thread_id(&self) -> Option<u64> {
        *self.state.thread_id.lock().unwrap()
    }
}

pub struct MockConnection {
    state: Arc<State>,
    switch: Arc<Switch>,
}

#[async_trait]
impl Connection for MockConnection {
    async fn execute(&mut self, _query: &Query) -> PoolResult<QueryOutput> {
        let script = self.state.query.lock().unwrap().clone();
        match script {
            QueryScript::Reply(delay) => {
                sleep(delay).await;
                Ok(QueryOutput::write_result(1))
            }
            QueryScript::Fail(delay, err) => {
                sleep(delay).await;
                Err(err.into())
            }
            QueryScript::Hang => std::future::pending().await,
            QueryScript::FailOnDestroy => {
                let notified = self.switch.notify.notified();
                if !self.switch.destroyed.load(Ordering::SeqCst) {
                    notified.await;
                }
                Err(DriverError::connection_lost("socket destroyed").into())
            }
        }
    }

    fn thread_id(&self) -> Option<u64> {
        *self.state.thread_id.lock().unwrap()
    }

    fn as_releasable(&mut self) -> Option<&mut dyn Releasable> {
        Some(self)
    }

    fn destroyer(&self) -> Option<Arc<dyn Destroyable>> {
        Some(self.switch.clone())
    }
}

#[async_trait]
impl Releasable for MockConnection {
    async fn release(&mut self) -> PoolResult<()> {
        self.state.released.fetch_add(1, Ordering::SeqCst);
        if self.state.release_fails.load(Ordering::SeqCst) {
            return Err(DriverError::pool("pool is draining").into());
        }
        Ok(())
    }
}
