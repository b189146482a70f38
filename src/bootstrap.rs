//! Isolate bootstrap.
//!
//! Wires configuration into a running isolate: directory, repository,
//! transport, broadcaster, HTTP listener, resync task, and (when enabled)
//! the multicast discovery peer. Each isolate process owns exactly one
//! [`IsolateHandle`]; there are no process-wide globals.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::broadcast::RemoteServiceBroadcaster;
use crate::config::IsolateConfig;
use crate::directory::{DirectoryConfig, SignalDirectory};
use crate::multicast::{MulticastPeer, RegistryAccess};
use crate::repository::RemoteServiceRepository;
use crate::server::{build_router, serve};
use crate::signals::HttpSignalTransport;

/// Bounded wait for background tasks at shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// A running isolate's discovery engine.
///
/// Dropping the handle without [`shutdown`] aborts the background tasks.
///
/// [`shutdown`]: IsolateHandle::shutdown
pub struct IsolateHandle {
    broadcaster: Arc<RemoteServiceBroadcaster>,
    http_addr: std::net::SocketAddr,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    multicast: Option<MulticastPeer>,
}

/// Builds and starts an isolate from its configuration.
pub async fn bootstrap_isolate(config: IsolateConfig) -> anyhow::Result<IsolateHandle> {
    config.validate().context("invalid configuration")?;

    let directory = match &config.directory_file {
        Some(path) => Arc::new(
            SignalDirectory::from_file(&config.isolate_uid, path)
                .context("failed to load directory")?,
        ),
        None => Arc::new(SignalDirectory::new(
            &config.isolate_uid,
            DirectoryConfig::default(),
        )),
    };
    let repository = Arc::new(RemoteServiceRepository::new(&config.isolate_uid));
    let transport = Arc::new(
        HttpSignalTransport::new(
            Duration::from_millis(config.send_timeout_ms),
            config.transport_intents.clone(),
        )
        .context("failed to build signal transport")?,
    );
    let broadcaster = Arc::new(RemoteServiceBroadcaster::new(
        Arc::clone(&repository),
        Arc::clone(&directory),
        transport,
    ));

    let listener = tokio::net::TcpListener::bind(config.http_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.http_addr))?;
    let http_addr = listener.local_addr().context("listener has no address")?;

    let cancel = CancellationToken::new();
    let mut tasks = Vec::new();

    let router = build_router(
        Arc::clone(&broadcaster),
        Arc::clone(&repository),
        &config.registry_path,
    );
    let server_cancel = cancel.child_token();
    tasks.push(tokio::spawn(async move {
        if let Err(error) = serve(listener, router, server_cancel).await {
            warn!(%error, "http listener stopped");
        }
    }));

    tasks.push(broadcaster.spawn_resync(
        Duration::from_secs(config.resync_interval_secs),
        cancel.child_token(),
    ));

    let multicast = if config.multicast.enabled {
        let access = RegistryAccess {
            path: config.registry_path.clone(),
            port: http_addr.port(),
        };
        Some(
            MulticastPeer::spawn(
                &config.multicast,
                access,
                Arc::clone(&broadcaster),
                cancel.child_token(),
            )
            .await
            .context("failed to start multicast peer")?,
        )
    } else {
        None
    };

    info!(
        isolate = %config.isolate_uid,
        name = %config.isolate_name,
        %http_addr,
        multicast = config.multicast.enabled,
        "isolate ready"
    );

    Ok(IsolateHandle {
        broadcaster,
        http_addr,
        cancel,
        tasks,
        multicast,
    })
}

impl IsolateHandle {
    /// The protocol handler, for exporting services and subscribing to
    /// notifications.
    pub fn broadcaster(&self) -> &Arc<RemoteServiceBroadcaster> {
        &self.broadcaster
    }

    /// Actual bound address of the HTTP listener.
    pub fn http_addr(&self) -> std::net::SocketAddr {
        self.http_addr
    }

    /// UID of this isolate.
    pub fn local_uid(&self) -> &str {
        self.broadcaster.local_uid()
    }

    /// Stops every background task, bounded, and clears the repository.
    pub async fn shutdown(mut self) {
        info!(isolate = %self.broadcaster.local_uid(), "shutting down isolate");
        self.cancel.cancel();

        if let Some(multicast) = self.multicast.take() {
            multicast.shutdown().await;
        }
        for mut task in self.tasks.drain(..) {
            tokio::select! {
                _ = &mut task => {}
                _ = tokio::time::sleep(SHUTDOWN_TIMEOUT) => {
                    warn!("background task did not stop in time, aborting");
                    task.abort();
                }
            }
        }
        self.broadcaster.repository().clear();
    }
}

impl Drop for IsolateHandle {
    fn drop(&mut self) {
        if !self.tasks.is_empty() {
            self.cancel.cancel();
            for task in self.tasks.drain(..) {
                task.abort();
            }
        }
    }
}
