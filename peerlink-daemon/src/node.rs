//! Wiring: blob store, resolver and tcp transport behind one dispatcher, run by a reactor task.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use peerlink_core::{
    BincodeCodec, Command, Dispatcher, ListenOptions, OutboxEvent, OutboxStatus, Packet,
    PacketId, PeerId,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::reactor::{Reactor, ReactorHandle};
use crate::resolver::StaticResolver;
use crate::store::FsBlobStore;
use crate::tcp::{self, TcpTransport};

pub struct Node {
    pub handle: ReactorHandle,
    /// Where the tcp listener actually bound (useful with `listen_port = 0`).
    pub listen_addr: SocketAddr,
    pub task: JoinHandle<anyhow::Result<()>>,
}

/// Build the dispatcher, start the tcp listener and spawn the reactor.
/// `setup` can register extra callbacks before any traffic flows.
/// Must be called from within a tokio runtime.
pub fn start(
    cfg: &Config,
    setup: impl FnOnce(&mut Dispatcher, &ReactorHandle),
) -> anyhow::Result<Node> {
    let (tx, rx) = mpsc::unbounded_channel();
    let store = FsBlobStore::open(&cfg.store_dir)
        .with_context(|| format!("opening blob store {}", cfg.store_dir.display()))?;
    let resolver = StaticResolver::new(cfg.contact_table(), tx.clone());
    let mut dispatcher = Dispatcher::new(
        cfg.local_id.clone(),
        cfg.transport.clone(),
        Box::new(BincodeCodec),
        Box::new(store.clone()),
        Box::new(resolver),
    );
    let transport = TcpTransport::new(store, tx.clone());
    let listeners = transport.listeners();
    dispatcher.register_transport(Box::new(transport));

    let handle = ReactorHandle::new(tx);
    install_callbacks(&mut dispatcher, &handle);
    setup(&mut dispatcher, &handle);

    let listener = dispatcher
        .start_listening(
            tcp::PROTOCOL,
            ListenOptions {
                host: "0.0.0.0".into(),
                port: cfg.listen_port,
                path: None,
            },
        )
        .with_context(|| format!("listening on tcp port {}", cfg.listen_port))?;
    let listen_addr = listeners
        .local_addr(listener)
        .context("tcp listener vanished")?;

    let task = tokio::spawn(Reactor::new(dispatcher, rx, listeners).run());
    Ok(Node {
        handle,
        listen_addr,
        task,
    })
}

/// Daemon-wide hooks: status logging and keep-alive pings.
fn install_callbacks(dispatcher: &mut Dispatcher, handle: &ReactorHandle) {
    let local_id = dispatcher.local_id().clone();
    let callbacks = dispatcher.callbacks_mut();

    callbacks
        .protocol_state
        .add(Arc::new(|protocol: &str, enabled: bool| {
            info!("protocol {} {}", protocol, if enabled { "enabled" } else { "disabled" });
        }));
    callbacks
        .contact_alive
        .add(Arc::new(|peer: &PeerId, alive: bool| {
            info!("{} is {}", peer, if alive { "online" } else { "offline" });
        }));
    callbacks.outbox_status.add(Arc::new(|e: &OutboxEvent| {
        if e.status.is_terminal() {
            warn!("send of {} to {} dropped: {:?}", e.packet_id, e.peer, e.status);
        } else if e.status != OutboxStatus::Started {
            debug!("send of {} to {}: {:?}", e.packet_id, e.peer, e.status);
        }
    }));

    // The core decides who is due; a ping is an Identity packet.
    let pinger = handle.clone();
    callbacks.ping.add(Arc::new(move |peer: &PeerId| {
        let packet = Packet::new(
            Command::Identity,
            local_id.clone(),
            PacketId::new(uuid::Uuid::new_v4().to_string()),
            Vec::new(),
            peer.clone(),
        );
        if let Err(e) = pinger.send_packet(packet, false, false) {
            debug!("ping to {} not sent: {}", peer, e);
        }
    }));
    // Identity packets only refresh liveness, which inbox already did.
    callbacks
        .inbox_packet
        .add(Arc::new(|packet: &Packet, _protocol: &str, _host: &str| {
            packet.command == Command::Identity
        }));
}
