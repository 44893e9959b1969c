//! Background jobs: database and HTTP self-checks, periodic SQLite snapshots.

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use sqld_core::{snapshot, BackgroundWorker, QueryService};
use tokio::{
    sync::watch,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

/// Process wide stop flag. Any holder may trigger it; every worker and the HTTP
/// server watch it.
#[derive(Clone, Debug)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn trigger(&self, reason: &str) {
        if !self.tx.send_replace(true) {
            info!(reason, "shutdown requested");
        }
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Resolves once shutdown has been triggered.
    pub async fn wait(&self) {
        let mut rx = self.subscribe();
        // The sender lives in `self`, so this only returns once the flag is set.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

/// Waits for the next tick. `false` once shutdown has been triggered.
async fn tick_or_stop(
    ticker: &mut tokio::time::Interval,
    stop: &mut watch::Receiver<bool>,
) -> bool {
    if *stop.borrow_and_update() {
        return false;
    }
    tokio::select! {
        _ = ticker.tick() => true,
        changed = stop.changed() => changed.is_ok() && !*stop.borrow(),
    }
}

/// First tick fires one `period` from now, not immediately.
fn ticker(period: Duration) -> tokio::time::Interval {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Pings the database every interval; a failed ping stops the process.
pub struct DbHealthWorker {
    service: Arc<QueryService>,
    period: Duration,
    shutdown: ShutdownHandle,
}

impl DbHealthWorker {
    pub fn new(service: Arc<QueryService>, period: Duration, shutdown: ShutdownHandle) -> Self {
        Self {
            service,
            period,
            shutdown,
        }
    }
}

#[async_trait]
impl BackgroundWorker for DbHealthWorker {
    fn name(&self) -> &'static str {
        "db-health"
    }

    async fn run(self: Arc<Self>) -> Result<()> {
        let mut ticker = ticker(self.period);
        let mut stop = self.shutdown.subscribe();

        while tick_or_stop(&mut ticker, &mut stop).await {
            match self.service.database().ping().await {
                Ok(()) => debug!("database self-check ok"),
                Err(err) => {
                    error!(error = %err, "database self-check failed");
                    self.shutdown.trigger("database self-check failed");
                    return Err(anyhow!("database self-check failed: {err}"));
                }
            }
        }
        Ok(())
    }
}

/// Per-request limit of the HTTP self-check.
const HTTP_CHECK_TIMEOUT_SECS: u64 = 30;
/// Wait before the one retry of a failed HTTP self-check.
const HTTP_CHECK_RETRY_SECS: u64 = 5;

/// Fetches a URL every interval. Any HTTP response counts as alive; a transport
/// failure is retried once, and a second failure stops the process.
pub struct HttpHealthWorker {
    client: reqwest::Client,
    url: reqwest::Url,
    period: Duration,
    retry_after: Duration,
    shutdown: ShutdownHandle,
}

impl HttpHealthWorker {
    pub fn new(url: &str, period: Duration, shutdown: ShutdownHandle) -> Result<Self> {
        let url = reqwest::Url::parse(url).with_context(|| format!("invalid health check url {url}"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_CHECK_TIMEOUT_SECS))
            .build()
            .context("build reqwest client")?;
        Ok(Self {
            client,
            url,
            period,
            retry_after: Duration::from_secs(HTTP_CHECK_RETRY_SECS),
            shutdown,
        })
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = retry_after;
        self
    }

    pub async fn check(&self) -> Result<(), reqwest::Error> {
        let response = self.client.get(self.url.clone()).send().await?;
        debug!(status = response.status().as_u16(), "http self-check ok");
        Ok(())
    }
}

#[async_trait]
impl BackgroundWorker for HttpHealthWorker {
    fn name(&self) -> &'static str {
        "http-health"
    }

    async fn run(self: Arc<Self>) -> Result<()> {
        let mut ticker = ticker(self.period);
        let mut stop = self.shutdown.subscribe();

        while tick_or_stop(&mut ticker, &mut stop).await {
            let Err(err) = self.check().await else {
                continue;
            };
            warn!(error = %err, url = %self.url, "http self-check failed, retrying");

            tokio::select! {
                _ = tokio::time::sleep(self.retry_after) => {}
                _ = stop.changed() => return Ok(()),
            }

            if let Err(err) = self.check().await {
                error!(error = %err, url = %self.url, "http self-check failed twice");
                self.shutdown.trigger("http self-check failed");
                return Err(anyhow!("http self-check failed: {err}"));
            }
        }
        Ok(())
    }
}

/// Writes a SQLite snapshot every interval when something was written since the
/// previous one.
pub struct SnapshotWorker {
    service: Arc<QueryService>,
    path: PathBuf,
    period: Duration,
    shutdown: ShutdownHandle,
}

impl SnapshotWorker {
    pub fn new(
        service: Arc<QueryService>,
        path: PathBuf,
        period: Duration,
        shutdown: ShutdownHandle,
    ) -> Self {
        Self {
            service,
            path,
            period,
            shutdown,
        }
    }

    /// Takes one snapshot if there are pending writes. Returns whether it did.
    pub async fn snapshot_if_dirty(&self) -> Result<bool> {
        let writes = self.service.take_writes();
        if writes == 0 {
            return Ok(false);
        }
        let Some(pool) = self.service.database().sqlite_pool() else {
            return Err(anyhow!("snapshots require a sqlite database"));
        };
        match snapshot::snapshot_to(pool, &self.path).await {
            Ok(report) => {
                debug!(writes, rows = report.rows, "auto snapshot complete");
                Ok(true)
            }
            Err(err) => {
                self.service.restore_writes(writes);
                Err(err)
            }
        }
    }
}

#[async_trait]
impl BackgroundWorker for SnapshotWorker {
    fn name(&self) -> &'static str {
        "sqlite-snapshot"
    }

    async fn run(self: Arc<Self>) -> Result<()> {
        let mut ticker = ticker(self.period);
        let mut stop = self.shutdown.subscribe();

        while tick_or_stop(&mut ticker, &mut stop).await {
            if let Err(err) = self.snapshot_if_dirty().await {
                warn!(error = %err, path = %self.path.display(), "auto snapshot failed");
            }
        }
        Ok(())
    }
}
