//! Node runtime

use crate::common::{Error, NodeConfig, Result};
use crate::engine::EngineRegistry;
use crate::replication::{BackgroundTasks, Manager, MasterClient, TaskOptions};
use crate::server::http::{create_router, HttpState};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub struct Node {
    config: NodeConfig,
    registry: EngineRegistry,
    task_options: TaskOptions,
}

/// A node whose HTTP API and background loops are running
pub struct RunningNode {
    addr: SocketAddr,
    manager: Arc<Manager>,
    tasks: BackgroundTasks,
    http_shutdown: watch::Sender<bool>,
    http_handle: JoinHandle<std::io::Result<()>>,
}

impl Node {
    pub fn new(config: NodeConfig) -> Self {
        let task_options = TaskOptions::from_config(&config);
        Self {
            config,
            registry: EngineRegistry::with_defaults(),
            task_options,
        }
    }

    /// Use a registry with additional engines
    pub fn with_registry(mut self, registry: EngineRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_task_options(mut self, options: TaskOptions) -> Self {
        self.task_options = options;
        self
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Open the stores, start the background loops and bind the HTTP API.
    pub async fn start(self) -> Result<RunningNode> {
        tracing::info!("Starting relaykv node: {}", self.config.node_id);
        tracing::info!("  Role: {}", self.config.role);
        tracing::info!("  Engine: {}", self.config.engine);
        tracing::info!("  HTTP API: {}", self.config.http_addr);
        tracing::info!("  Data path: {}", self.config.data_dir.display());
        if let Some(master) = &self.config.master_url {
            tracing::info!("  Master: {}", master);
        }

        let manager = Arc::new(Manager::open(&self.config, &self.registry)?);

        let client = match &self.config.master_url {
            Some(url) if !manager.is_master() => Some(MasterClient::new(
                url.clone(),
                self.config.request_timeout(),
            )?),
            _ => None,
        };
        let tasks = BackgroundTasks::spawn(manager.clone(), client, self.task_options)?;

        let listener = tokio::net::TcpListener::bind(self.config.http_addr).await?;
        let addr = listener.local_addr()?;
        let router = create_router(HttpState {
            manager: manager.clone(),
            apply_timeout: self.config.request_timeout(),
        });

        let (http_shutdown, mut rx) = watch::channel(false);
        let http_handle = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = rx.wait_for(|stop| *stop).await;
                })
                .await
        });

        tracing::info!("✓ Node ready on {}", addr);
        Ok(RunningNode {
            addr,
            manager,
            tasks,
            http_shutdown,
            http_handle,
        })
    }

    /// Run until ctrl-c or until a background loop fails.
    pub async fn serve(self) -> Result<()> {
        let mut node = self.start().await?;

        let fatal = tokio::select! {
            res = tokio::signal::ctrl_c() => {
                res?;
                tracing::info!("Shutdown requested");
                None
            }
            exit = node.tasks.next_exit() => match exit {
                Some((name, Err(e))) => {
                    tracing::error!(task = name, "fatal background error: {}", e);
                    Some(e)
                }
                Some((name, Ok(()))) => {
                    tracing::warn!(task = name, "background task exited");
                    None
                }
                None => None,
            },
        };

        node.shutdown().await?;
        fatal.map_or(Ok(()), Err)
    }
}

impl RunningNode {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// `http://<addr>`
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn manager(&self) -> &Arc<Manager> {
        &self.manager
    }

    /// Stop accepting requests, stop the loops and flush the engine.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.http_shutdown.send(true);
        match tokio::time::timeout(Duration::from_secs(10), self.http_handle).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => tracing::error!("HTTP server error: {}", e),
            Ok(Err(e)) => tracing::error!("HTTP server task failed: {}", e),
            Err(_) => tracing::warn!("HTTP server did not drain in time"),
        }

        let tasks = self.tasks.shutdown().await;
        let manager = self.manager;
        tokio::task::spawn_blocking(move || manager.close())
            .await
            .map_err(|e| Error::Internal(format!("close task failed: {}", e)))??;
        tracing::info!("Node stopped");
        tasks
    }
}
