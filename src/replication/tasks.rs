//! Background loops
//!
//! One fixed set of tokio tasks per node:
//! - master: apply loop (WAL -> engine) and retention loop
//! - replica: replication loop (bootstrap, then poll the master) and report loop
//! - both: expired-record reaper
//!
//! All loops stop when the shutdown channel flips. A loop that keeps failing
//! returns its last error, which the node treats as fatal.

use crate::common::{backoff_delay, Error, NodeConfig, Result};
use crate::replication::client::MasterClient;
use crate::replication::manager::Manager;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;

#[derive(Debug, Clone)]
pub struct TaskOptions {
    /// Replica poll interval
    pub poll_interval: Duration,
    /// Master apply loop wakes at least this often even without a signal
    pub apply_tick: Duration,
    pub report_interval: Duration,
    pub retention_interval: Duration,
    pub reaper_interval: Duration,
    pub reaper_batch_size: usize,
    /// WAL entries fetched per poll
    pub fetch_batch_size: usize,
    /// Consecutive failures tolerated before a loop gives up
    pub max_retries: usize,
    pub retry_backoff: Duration,
    pub max_backoff: Duration,
}

impl TaskOptions {
    pub fn from_config(config: &NodeConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            apply_tick: Duration::from_secs(1),
            report_interval: config.report_interval(),
            retention_interval: config.retention_interval(),
            reaper_interval: config.reaper_interval(),
            reaper_batch_size: config.reaper_batch_size,
            fetch_batch_size: config.apply_batch_size,
            max_retries: config.max_retries,
            retry_backoff: config.retry_backoff(),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self::from_config(&NodeConfig::default())
    }
}

type TaskResult = (&'static str, Result<()>);

pub struct BackgroundTasks {
    shutdown: watch::Sender<bool>,
    set: JoinSet<TaskResult>,
}

impl BackgroundTasks {
    /// Spawn the loops for the manager's role. Replicas need a master client.
    pub fn spawn(
        manager: Arc<Manager>,
        client: Option<MasterClient>,
        options: TaskOptions,
    ) -> Result<Self> {
        let (shutdown, rx) = watch::channel(false);
        let mut set = JoinSet::new();

        if manager.is_master() {
            set.spawn(named("apply", apply_loop(manager.clone(), options.clone(), rx.clone())));
            set.spawn(named(
                "retention",
                retention_loop(manager.clone(), options.clone(), rx.clone()),
            ));
        } else {
            let client = client.ok_or_else(|| {
                Error::InvalidConfig("replica tasks need a master client".into())
            })?;
            set.spawn(named(
                "replication",
                replication_loop(manager.clone(), client.clone(), options.clone(), rx.clone()),
            ));
            set.spawn(named(
                "report",
                report_loop(manager.clone(), client, options.clone(), rx.clone()),
            ));
        }
        set.spawn(named("reaper", reaper_loop(manager, options, rx)));

        Ok(Self { shutdown, set })
    }

    /// Wait for the next loop to exit. Loops only exit on shutdown or a fatal error.
    pub async fn next_exit(&mut self) -> Option<TaskResult> {
        let joined = self.set.join_next().await?;
        Some(joined.unwrap_or_else(|e| ("task", Err(Error::Internal(format!("task panicked: {}", e))))))
    }

    /// Signal every loop to stop and wait for all of them.
    /// Returns the first error any loop ended with.
    pub async fn shutdown(mut self) -> Result<()> {
        let _ = self.shutdown.send(true);
        let mut first_error = None;
        while let Some((name, result)) = self.next_exit().await {
            match result {
                Ok(()) => tracing::debug!(task = name, "background task stopped"),
                Err(e) => {
                    tracing::error!(task = name, "background task failed: {}", e);
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

async fn named<F>(name: &'static str, fut: F) -> TaskResult
where
    F: std::future::Future<Output = Result<()>>,
{
    (name, fut.await)
}

/// Sleep for `delay` unless shutdown is requested first. Returns true on shutdown.
async fn pause(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        res = shutdown.changed() => res.is_err() || *shutdown.borrow(),
    }
}

/// Consecutive-failure counter shared by the loops
struct Failures {
    count: u32,
    max: usize,
    initial: Duration,
    cap: Duration,
}

impl Failures {
    fn new(options: &TaskOptions) -> Self {
        Self {
            count: 0,
            max: options.max_retries,
            initial: options.retry_backoff,
            cap: options.max_backoff,
        }
    }

    fn reset(&mut self) {
        self.count = 0;
    }

    /// Record a failure; gives the error back once the budget is spent
    fn record(&mut self, task: &str, err: Error) -> std::result::Result<Duration, Error> {
        self.count += 1;
        if self.count as usize >= self.max {
            tracing::error!(task, failures = self.count, "giving up: {}", err);
            return Err(err);
        }
        let delay = backoff_delay(self.initial, self.count - 1, self.cap);
        tracing::warn!(task, failures = self.count, "{}; retrying in {:?}", err, delay);
        Ok(delay)
    }
}

async fn blocking<T, F>(manager: &Arc<Manager>, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&Manager) -> Result<T> + Send + 'static,
{
    let manager = manager.clone();
    tokio::task::spawn_blocking(move || f(&manager))
        .await
        .map_err(|e| Error::Internal(format!("blocking task failed: {}", e)))?
}

async fn apply_loop(
    manager: Arc<Manager>,
    options: TaskOptions,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let batch = manager.options().apply_batch_size;
    let mut failures = Failures::new(&options);

    loop {
        if *shutdown.borrow() {
            return Ok(());
        }
        match blocking(&manager, |m| m.apply_pending()).await {
            Ok(applied) => {
                failures.reset();
                if applied >= batch {
                    continue;
                }
            }
            Err(e) => {
                let delay = failures.record("apply", e)?;
                if pause(&mut shutdown, delay).await {
                    return Ok(());
                }
                continue;
            }
        }

        tokio::select! {
            _ = manager.wal_signal().notified() => {}
            _ = tokio::time::sleep(options.apply_tick) => {}
            _ = shutdown.changed() => return Ok(()),
        }
    }
}

async fn replication_loop(
    manager: Arc<Manager>,
    client: MasterClient,
    options: TaskOptions,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    if manager.needs_bootstrap()? {
        tracing::info!("no local offset, bootstrapping from {}", client.base_url());
        bootstrap(&manager, &client)
            .await
            .map_err(|e| Error::Bootstrap(e.to_string()))?;
    }
    let local = manager.current_position()?;
    match client.current_offset().await {
        Ok(master) => tracing::info!(
            %local,
            %master,
            "streaming WAL from {}",
            client.base_url()
        ),
        Err(e) => tracing::warn!("master offset unavailable, polling anyway: {}", e),
    }

    let mut failures = Failures::new(&options);
    loop {
        let position = manager.current_position()?;
        let fetched = client.fetch_wal(position, options.fetch_batch_size).await;
        let result = match fetched {
            Ok(entries) if entries.is_empty() => Ok(0),
            Ok(entries) => {
                let n = entries.len();
                blocking(&manager, move |m| m.apply_batch(&entries))
                    .await
                    .map(|applied| {
                        tracing::debug!(fetched = n, applied, "replicated WAL entries");
                        n
                    })
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(n) => {
                failures.reset();
                if n >= options.fetch_batch_size {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                    continue;
                }
                if pause(&mut shutdown, options.poll_interval).await {
                    return Ok(());
                }
            }
            Err(e @ Error::OffsetTrimmed(_)) => {
                tracing::error!(
                    offset = %position,
                    "master no longer retains entries after the local offset; wipe the replica state to re-bootstrap"
                );
                return Err(e);
            }
            Err(e) => {
                let delay = failures.record("replication", e)?;
                if pause(&mut shutdown, delay).await {
                    return Ok(());
                }
            }
        }
    }
}

async fn bootstrap(manager: &Arc<Manager>, client: &MasterClient) -> Result<()> {
    let dump = client.fetch_dump(manager.node_id()).await?;
    let position = dump.position;
    blocking(manager, move |m| {
        m.bootstrap(dump.position, &mut dump.body.as_ref(), dump.declared_len)
    })
    .await?;

    // refresh last_seen now instead of a report interval later
    if let Err(e) = client.report_offset(manager.node_id(), position).await {
        tracing::warn!("failed to report bootstrap offset to master: {}", e);
    }
    Ok(())
}

async fn report_loop(
    manager: Arc<Manager>,
    client: MasterClient,
    options: TaskOptions,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    loop {
        if !manager.needs_bootstrap()? {
            let position = manager.current_position()?;
            match client.report_offset(manager.node_id(), position).await {
                Ok(()) => tracing::debug!(offset = %position, "reported offset to master"),
                Err(e) if e.is_retryable() => {
                    tracing::debug!("master unreachable, offset report skipped: {}", e)
                }
                Err(e) => tracing::warn!("failed to report offset to master: {}", e),
            }
        }
        if pause(&mut shutdown, options.report_interval).await {
            return Ok(());
        }
    }
}

async fn retention_loop(
    manager: Arc<Manager>,
    options: TaskOptions,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut failures = Failures::new(&options);
    loop {
        let delay = match blocking(&manager, |m| m.enforce_retention()).await {
            Ok(_) => {
                failures.reset();
                options.retention_interval
            }
            Err(e) => failures.record("retention", e)?,
        };
        if pause(&mut shutdown, delay).await {
            return Ok(());
        }
    }
}

async fn reaper_loop(
    manager: Arc<Manager>,
    options: TaskOptions,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    loop {
        if pause(&mut shutdown, options.reaper_interval).await {
            return Ok(());
        }
        // one bounded batch per commit, until a short batch says we're done
        loop {
            let batch = options.reaper_batch_size;
            match blocking(&manager, move |m| m.reap_expired(batch)).await {
                Ok(reaped) if reaped >= batch && !*shutdown.borrow() => continue,
                Ok(reaped) => {
                    if reaped > 0 {
                        tracing::debug!(reaped, "reaper pass finished");
                    }
                    break;
                }
                Err(e) => {
                    tracing::warn!("reaper failed: {}", e);
                    break;
                }
            }
        }
    }
}
