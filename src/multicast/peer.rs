//! Multicast discovery peer.
//!
//! Secondary bootstrap path for isolates that cannot rely on directed
//! signals. Three background tasks:
//! 1. Listener: receives packets from the multicast group and dispatches
//!    them.
//! 2. Beacon: periodically broadcasts a `discovery` packet so late joiners
//!    find us without configuration.
//! 3. Emitter: translates locally emitted repository events into
//!    `add`/`update`/`remove` packets.
//!
//! Packets carry identities only; endpoint data is pulled over HTTP from the
//! sender's registry, then fed through the same ingest path as directed
//! signals. Packets from the local sender id are ignored.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde_json::Value;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::broadcast::RemoteServiceBroadcaster;
use crate::config::MulticastConfig;
use crate::model::RemoteServiceEvent;
use crate::multicast::packet::{MulticastPacket, PacketEvent, RegistryAccess, MAX_PACKET_BYTES};
use crate::multicast::registry::registration_from_map;

/// Timeout for the registry pulls triggered by packets.
const FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Bounded wait for task completion at shutdown before aborting.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

struct PeerContext {
    broadcaster: Arc<RemoteServiceBroadcaster>,
    socket: Arc<UdpSocket>,
    group_target: SocketAddr,
    access: RegistryAccess,
    client: reqwest::Client,
}

/// Handle to the running multicast discovery tasks.
pub struct MulticastPeer {
    cancel: CancellationToken,
    listener_task: Option<JoinHandle<()>>,
    beacon_task: Option<JoinHandle<()>>,
    emitter_task: Option<JoinHandle<()>>,
}

impl MulticastPeer {
    /// Joins the multicast group and starts the background tasks.
    ///
    /// `access` is the path/port of the local HTTP registry that peers will
    /// pull from.
    pub async fn spawn(
        config: &MulticastConfig,
        access: RegistryAccess,
        broadcaster: Arc<RemoteServiceBroadcaster>,
        cancel: CancellationToken,
    ) -> anyhow::Result<Self> {
        let socket = open_multicast_socket(config.group, config.port)
            .context("failed to open multicast socket")?;
        let socket = Arc::new(
            UdpSocket::from_std(socket).context("failed to register multicast socket")?,
        );
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .context("failed to build registry client")?;

        let ctx = Arc::new(PeerContext {
            broadcaster,
            socket,
            group_target: SocketAddr::from((config.group, config.port)),
            access,
            client,
        });

        let listener_cancel = cancel.child_token();
        let listener_ctx = Arc::clone(&ctx);
        let listener_task = tokio::spawn(async move {
            let mut buffer = vec![0u8; MAX_PACKET_BYTES];
            loop {
                tokio::select! {
                    _ = listener_cancel.cancelled() => {
                        debug!("multicast listener shutting down");
                        break;
                    }
                    received = listener_ctx.socket.recv_from(&mut buffer) => match received {
                        Ok((length, from)) => {
                            let packet: MulticastPacket =
                                match serde_json::from_slice(&buffer[..length]) {
                                    Ok(packet) => packet,
                                    Err(error) => {
                                        warn!(%from, %error, "discarding malformed multicast packet");
                                        continue;
                                    }
                                };
                            handle_packet(&listener_ctx, packet, from).await;
                        }
                        Err(error) => {
                            warn!(%error, "multicast receive failed");
                        }
                    }
                }
            }
        });

        let beacon_cancel = cancel.child_token();
        let beacon_ctx = Arc::clone(&ctx);
        let beacon_interval = Duration::from_secs(config.beacon_interval_secs);
        let beacon_task = tokio::spawn(async move {
            // Announce ourselves immediately, then on every tick.
            send_packet(
                &beacon_ctx,
                &MulticastPacket::discovery(
                    beacon_ctx.broadcaster.local_uid(),
                    beacon_ctx.access.clone(),
                ),
                beacon_ctx.group_target,
            )
            .await;

            let mut ticker = tokio::time::interval(beacon_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = beacon_cancel.cancelled() => {
                        debug!("multicast beacon shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        send_packet(
                            &beacon_ctx,
                            &MulticastPacket::discovery(
                                beacon_ctx.broadcaster.local_uid(),
                                beacon_ctx.access.clone(),
                            ),
                            beacon_ctx.group_target,
                        )
                        .await;
                    }
                }
            }
        });

        let emitter_cancel = cancel.child_token();
        let emitter_ctx = Arc::clone(&ctx);
        let mut local_events = emitter_ctx.broadcaster.subscribe_local_events();
        let emitter_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = emitter_cancel.cancelled() => {
                        debug!("multicast emitter shutting down");
                        break;
                    }
                    event = local_events.recv() => match event {
                        Ok(event) => {
                            let packet = MulticastPacket::from_local_event(
                                emitter_ctx.broadcaster.local_uid(),
                                &event,
                                emitter_ctx.access.clone(),
                            );
                            send_packet(&emitter_ctx, &packet, emitter_ctx.group_target).await;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "multicast emitter lagged, peers resync later");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });

        Ok(Self {
            cancel,
            listener_task: Some(listener_task),
            beacon_task: Some(beacon_task),
            emitter_task: Some(emitter_task),
        })
    }

    /// Stops the tasks and waits for them, bounded.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        for mut task in [
            self.listener_task.take(),
            self.beacon_task.take(),
            self.emitter_task.take(),
        ]
        .into_iter()
        .flatten()
        {
            tokio::select! {
                _ = &mut task => {}
                _ = tokio::time::sleep(SHUTDOWN_TIMEOUT) => {
                    warn!("multicast task did not stop in time, aborting");
                    task.abort();
                }
            }
        }
    }
}

impl Drop for MulticastPeer {
    fn drop(&mut self) {
        for task in [
            self.listener_task.take(),
            self.beacon_task.take(),
            self.emitter_task.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }
    }
}

/// Creates the shared multicast socket: address reuse so several isolates on
/// one host can join, loopback enabled so they hear each other.
fn open_multicast_socket(group: Ipv4Addr, port: u16) -> std::io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)).into())?;
    socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
    socket.set_multicast_loop_v4(true)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

async fn send_packet(ctx: &PeerContext, packet: &MulticastPacket, target: SocketAddr) {
    let bytes = match serde_json::to_vec(packet) {
        Ok(bytes) => bytes,
        Err(error) => {
            warn!(%error, "failed to serialize multicast packet");
            return;
        }
    };
    if let Err(error) = ctx.socket.send_to(&bytes, target).await {
        warn!(%target, %error, "failed to send multicast packet");
    }
}

async fn handle_packet(ctx: &PeerContext, packet: MulticastPacket, from: SocketAddr) {
    if packet.sender == ctx.broadcaster.local_uid() {
        // Loopback suppression: multicast loop is enabled on purpose.
        return;
    }
    debug!(sender = %packet.sender, event = ?packet.event, %from, "multicast packet");

    match packet.event {
        PacketEvent::Discovery => {
            let reply = MulticastPacket::discovered(
                ctx.broadcaster.local_uid(),
                ctx.access.clone(),
            );
            send_packet(ctx, &reply, from).await;
            if let Some(access) = &packet.access {
                pull_registry(ctx, &packet.sender, from, access).await;
            }
        }
        PacketEvent::Discovered => {
            if let Some(access) = &packet.access {
                pull_registry(ctx, &packet.sender, from, access).await;
            } else {
                warn!(sender = %packet.sender, "discovered packet without access");
            }
        }
        PacketEvent::Add | PacketEvent::Update => {
            let (Some(uid), Some(access)) = (&packet.uid, &packet.access) else {
                warn!(sender = %packet.sender, event = ?packet.event, "event packet missing uid or access");
                return;
            };
            match fetch_endpoint(ctx, from, access, uid).await {
                Ok(Some(registration)) => {
                    let event = match packet.event {
                        PacketEvent::Add => RemoteServiceEvent::Registered { registration },
                        _ => RemoteServiceEvent::Updated {
                            registration,
                            changed_properties: packet.new_properties.clone(),
                        },
                    };
                    ctx.broadcaster.ingest_event(event).await;
                }
                Ok(None) => {
                    // The endpoint is already gone on the sender; drop the
                    // packet without touching the repository.
                    debug!(sender = %packet.sender, uid = %uid, "endpoint unknown to sender registry");
                }
                Err(error) => {
                    warn!(sender = %packet.sender, uid = %uid, %error, "registry pull failed");
                }
            }
        }
        PacketEvent::Remove => {
            let Some(uid) = &packet.uid else {
                warn!(sender = %packet.sender, "remove packet without uid");
                return;
            };
            match ctx
                .broadcaster
                .repository()
                .remote_registration(&packet.sender, uid)
            {
                Some(registration) => {
                    ctx.broadcaster
                        .ingest_event(RemoteServiceEvent::Unregistered { registration })
                        .await;
                }
                None => debug!(sender = %packet.sender, uid = %uid, "remove for unknown service"),
            }
        }
    }
}

/// Pulls the sender's full registry and merges every endpoint in it.
async fn pull_registry(
    ctx: &PeerContext,
    sender: &str,
    from: SocketAddr,
    access: &RegistryAccess,
) {
    let server = from.ip().to_string();
    let url = format!("http://{server}:{}{}/endpoints", access.port, access.path);
    let maps: Vec<Value> = match ctx.client.get(&url).send().await {
        Ok(response) if response.status().is_success() => match response.json().await {
            Ok(maps) => maps,
            Err(error) => {
                warn!(sender, %url, %error, "invalid registry listing");
                return;
            }
        },
        Ok(response) => {
            warn!(sender, %url, status = %response.status(), "registry listing refused");
            return;
        }
        Err(error) => {
            warn!(sender, %url, %error, "registry listing failed");
            return;
        }
    };

    debug!(sender, endpoints = maps.len(), "pulled peer registry");
    for map in &maps {
        match registration_from_map(map, &server) {
            Ok(registration) => {
                ctx.broadcaster
                    .ingest_event(RemoteServiceEvent::Registered { registration })
                    .await;
            }
            Err(error) => {
                warn!(sender, %error, "skipping malformed registry entry");
            }
        }
    }
}

/// Pulls one endpoint by uid. `Ok(None)` is the benign 404 case.
async fn fetch_endpoint(
    ctx: &PeerContext,
    from: SocketAddr,
    access: &RegistryAccess,
    uid: &str,
) -> anyhow::Result<Option<crate::model::RemoteServiceRegistration>> {
    let server = from.ip().to_string();
    let url = format!(
        "http://{server}:{}{}/endpoint/{uid}",
        access.port, access.path
    );
    let response = ctx
        .client
        .get(&url)
        .send()
        .await
        .with_context(|| format!("GET {url}"))?;

    if response.status() == reqwest::StatusCode::NOT_FOUND {
        return Ok(None);
    }
    if !response.status().is_success() {
        anyhow::bail!("GET {url} answered {}", response.status());
    }
    let map: Value = response
        .json()
        .await
        .with_context(|| format!("invalid endpoint map from {url}"))?;
    let registration = registration_from_map(&map, &server)?;
    Ok(Some(registration))
}
