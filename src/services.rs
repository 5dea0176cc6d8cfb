//! [`ManagedService`] adapters over the library's own start/stop shapes.
//! None of `Scheduler`, `Heartbeat`, or the HTTP API server implement the
//! trait directly — they predate the daemon supervisor and each has its own
//! `start(self: Arc<Self>)`/`stop(&self)` pair — so each gets a thin wrapper
//! here that spawns the service's loop and tracks the `JoinHandle` needed to
//! make `ManagedService::stop` actually stop anything.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use mama_core::channels::HttpApiState;
use mama_core::daemon::ManagedService;
use mama_core::error::Result;
use mama_core::heartbeat::Heartbeat;
use mama_core::scheduler::Scheduler;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

pub struct SchedulerService {
    scheduler: Arc<Scheduler>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SchedulerService {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self {
            scheduler,
            handle: Mutex::new(None),
        }
    }
}

#[async_trait]
impl ManagedService for SchedulerService {
    fn name(&self) -> &str {
        "scheduler"
    }

    async fn start(&self) -> Result<()> {
        let scheduler = self.scheduler.clone();
        *self.handle.lock().await = Some(tokio::spawn(async move { scheduler.start().await }));
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.scheduler.stop();
        if let Some(handle) = self.handle.lock().await.take() {
            handle.abort();
        }
        Ok(())
    }
}

pub struct HeartbeatService {
    heartbeat: Arc<Heartbeat>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl HeartbeatService {
    pub fn new(heartbeat: Arc<Heartbeat>) -> Self {
        Self {
            heartbeat,
            handle: Mutex::new(None),
        }
    }
}

#[async_trait]
impl ManagedService for HeartbeatService {
    fn name(&self) -> &str {
        "heartbeat"
    }

    async fn start(&self) -> Result<()> {
        let heartbeat = self.heartbeat.clone();
        *self.handle.lock().await = Some(tokio::spawn(async move { heartbeat.start().await }));
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.heartbeat.stop();
        if let Some(handle) = self.handle.lock().await.take() {
            handle.abort();
        }
        Ok(())
    }
}

pub struct HttpApiService {
    addr: SocketAddr,
    state: Arc<HttpApiState>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl HttpApiService {
    pub fn new(addr: SocketAddr, state: Arc<HttpApiState>) -> Self {
        Self {
            addr,
            state,
            handle: Mutex::new(None),
        }
    }
}

#[async_trait]
impl ManagedService for HttpApiService {
    fn name(&self) -> &str {
        "http_api"
    }

    async fn start(&self) -> Result<()> {
        let addr = self.addr;
        let state = self.state.clone();
        *self.handle.lock().await = Some(tokio::spawn(async move {
            if let Err(e) = mama_core::channels::http::serve(addr, state).await {
                tracing::error!(error = %e, "http api server exited");
            }
        }));
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if let Some(handle) = self.handle.lock().await.take() {
            handle.abort();
        }
        Ok(())
    }
}
