//! Single-task reactor. It owns the dispatcher; transports, the resolver and callers
//! only talk to it through [`ReactorEvent`]s on an unbounded channel.

use std::pin::Pin;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use peerlink_core::transfer::Direction;
use peerlink_core::{BlobRef, ContactInfo, Dispatcher, Packet, PeerId, ShutdownStep};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{MissedTickBehavior, Sleep};
use tracing::{debug, info, warn};

use crate::tcp::ListenerSet;

const TICK: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub enum ReactorEvent {
    /// Send a packet we created (or Data we return to its creator).
    Outbox {
        packet: Packet,
        want_ack: bool,
        wide: bool,
    },
    Inbound {
        blob: BlobRef,
        protocol: String,
        host: String,
    },
    SendCompleted {
        blob: BlobRef,
        succeeded: bool,
        protocol: String,
        host: String,
    },
    ContactResolved {
        peer: PeerId,
        contact: Option<ContactInfo>,
    },
    /// A transport finished moving `bytes` for `blob`.
    Transfer {
        protocol: String,
        direction: Direction,
        remote_address: String,
        blob: BlobRef,
        bytes: u64,
    },
    /// Size of the next chunk a sender may write under the outbound cap.
    SendChunk {
        prev: usize,
        requested: usize,
        reply: oneshot::Sender<usize>,
    },
    /// Pause a reader should take after reading `bytes` under the inbound cap.
    ReceiveDelay {
        bytes: u64,
        reply: oneshot::Sender<Duration>,
    },
    Shutdown,
}

pub type EventSender = mpsc::UnboundedSender<ReactorEvent>;

/// Cloneable front door to a running reactor.
#[derive(Clone)]
pub struct ReactorHandle {
    events: EventSender,
}

impl ReactorHandle {
    pub fn new(events: EventSender) -> Self {
        Self { events }
    }

    pub fn send_packet(&self, packet: Packet, want_ack: bool, wide: bool) -> anyhow::Result<()> {
        self.events
            .send(ReactorEvent::Outbox {
                packet,
                want_ack,
                wide,
            })
            .map_err(|_| anyhow!("reactor stopped"))
    }

    /// Start a graceful shutdown. No-op if the reactor is already gone.
    pub fn shutdown(&self) {
        let _ = self.events.send(ReactorEvent::Shutdown);
    }
}

/// Current time on tokio's clock, so paused-time tests drive the dispatcher too.
fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

pub struct Reactor {
    dispatcher: Dispatcher,
    events: mpsc::UnboundedReceiver<ReactorEvent>,
    listeners: ListenerSet,
}

impl Reactor {
    pub fn new(
        dispatcher: Dispatcher,
        events: mpsc::UnboundedReceiver<ReactorEvent>,
        listeners: ListenerSet,
    ) -> Self {
        Self {
            dispatcher,
            events,
            listeners,
        }
    }

    /// Run until a `Shutdown` event (or every sender is gone), then drain and stop listeners.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let scheduler = tokio::time::sleep(self.dispatcher.next_delay());
        tokio::pin!(scheduler);
        loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(ReactorEvent::Shutdown) | None => break,
                    Some(event) => {
                        self.handle(event);
                        self.pull_in(scheduler.as_mut());
                    }
                },
                () = &mut scheduler => {
                    let delay = self.dispatcher.run_scheduler(now());
                    scheduler.as_mut().reset(tokio::time::Instant::now() + delay);
                }
                _ = tick.tick() => self.dispatcher.tick(now()),
            }
        }
        self.shutdown().await
    }

    /// Bring the scheduler wakeup forward when handling an event shortened the delay
    /// (a new outbox item resets it). Never pushes a pending wakeup back.
    fn pull_in(&self, scheduler: Pin<&mut Sleep>) {
        let at = tokio::time::Instant::now() + self.dispatcher.next_delay();
        if at < scheduler.deadline() {
            scheduler.reset(at);
        }
    }

    fn handle(&mut self, event: ReactorEvent) {
        let now = now();
        match event {
            ReactorEvent::Outbox {
                packet,
                want_ack,
                wide,
            } => match self.dispatcher.outbox(packet, want_ack, wide, now) {
                Ok(outcome) => debug!("outbox: {:?}", outcome),
                Err(e) => warn!("outbox rejected: {}", e),
            },
            ReactorEvent::Inbound {
                blob,
                protocol,
                host,
            } => {
                self.dispatcher.inbox(&blob, &protocol, &host, now);
            }
            ReactorEvent::SendCompleted {
                blob,
                succeeded,
                protocol,
                host,
            } => self
                .dispatcher
                .handle_send_completion(&blob, succeeded, &protocol, &host, now),
            ReactorEvent::ContactResolved { peer, contact } => {
                self.dispatcher.on_contact_resolved(&peer, contact, now)
            }
            ReactorEvent::Transfer {
                protocol,
                direction,
                remote_address,
                blob,
                bytes,
            } => {
                let id = self.dispatcher.start_transfer(
                    &protocol,
                    direction,
                    &remote_address,
                    blob,
                    bytes,
                    None,
                );
                self.dispatcher.end_transfer(id, Some(bytes));
            }
            ReactorEvent::SendChunk {
                prev,
                requested,
                reply,
            } => {
                let _ = reply.send(self.dispatcher.next_send_chunk_size(prev, requested));
            }
            ReactorEvent::ReceiveDelay { bytes, reply } => {
                let _ = reply.send(self.dispatcher.next_receive_delay(bytes));
            }
            ReactorEvent::Shutdown => {}
        }
    }

    /// Keep serving completions while queued sends to live peers drain, then stop
    /// every listener and wait for all of them to finish.
    async fn shutdown(mut self) -> anyhow::Result<()> {
        self.dispatcher.begin_shutdown();
        while let Ok(event) = self.events.try_recv() {
            self.handle(event);
        }
        let poll = self.dispatcher.config().shutdown_poll();
        loop {
            match self.dispatcher.shutdown_poll(now()) {
                ShutdownStep::Draining { .. } => self.serve_for(poll).await,
                ShutdownStep::Stopped {
                    listeners,
                    abandoned,
                } => {
                    if abandoned > 0 {
                        warn!("{} queued send(s) abandoned at shutdown", abandoned);
                    }
                    debug!("stopping {} listener(s)", listeners.len());
                    break;
                }
            }
        }
        for task in self.listeners.take_stopped() {
            task.await?;
        }
        let stats = self.dispatcher.stats();
        info!(
            "transport control stopped: {} bytes sent, {} bytes received",
            stats.totals.sent, stats.totals.received
        );
        Ok(())
    }

    async fn serve_for(&mut self, window: Duration) {
        let deadline = tokio::time::sleep(window);
        tokio::pin!(deadline);
        let scheduler = tokio::time::sleep(self.dispatcher.next_delay());
        tokio::pin!(scheduler);
        loop {
            tokio::select! {
                () = &mut deadline => return,
                event = self.events.recv() => match event {
                    Some(event) => {
                        self.handle(event);
                        self.pull_in(scheduler.as_mut());
                    }
                    None => {
                        (&mut deadline).await;
                        return;
                    }
                },
                () = &mut scheduler => {
                    let delay = self.dispatcher.run_scheduler(now());
                    scheduler.as_mut().reset(tokio::time::Instant::now() + delay);
                }
            }
        }
    }
}
