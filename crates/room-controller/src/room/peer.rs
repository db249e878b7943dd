//! Per-connection participant state.
//!
//! A `Peer` owns the transports, producers and consumers one signaling
//! connection created inside a room. It is only ever touched under its
//! room's lock; cross-peer effects (closing downstream consumers, notifying
//! their owners) are driven by the room.

use super::PeerEvent;
use crate::errors::RcError;
use crate::media::{MediaConsumer, MediaKind, MediaProducer, MediaSource, MediaTransport};
use crate::observability::metrics;
use common::types::{ConsumerId, PeerId, ProducerId, TransportId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

/// Outbound event queue of one peer.
///
/// Deliveries never block: a full or closed queue drops that one event.
#[derive(Debug, Clone)]
pub struct EventSink {
    peer_id: PeerId,
    tx: mpsc::Sender<PeerEvent>,
}

impl EventSink {
    #[must_use]
    pub fn new(peer_id: PeerId, tx: mpsc::Sender<PeerEvent>) -> Self {
        Self { peer_id, tx }
    }

    /// Queue `event` for the peer. Returns `false` if it was dropped.
    pub fn deliver(&self, event: PeerEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                warn!(
                    target: "rc.peer",
                    peer_id = %self.peer_id,
                    event = event.name(),
                    "Event queue full, dropping delivery"
                );
                metrics::record_broadcast_dropped();
                false
            }
            Err(TrySendError::Closed(event)) => {
                debug!(
                    target: "rc.peer",
                    peer_id = %self.peer_id,
                    event = event.name(),
                    "Event queue closed, dropping delivery"
                );
                metrics::record_broadcast_dropped();
                false
            }
        }
    }
}

struct ProducerEntry {
    handle: Arc<dyn MediaProducer>,
    source: MediaSource,
    transport_id: TransportId,
}

struct ConsumerEntry {
    handle: Arc<dyn MediaConsumer>,
    transport_id: TransportId,
}

/// One participant in a room.
pub struct Peer {
    id: PeerId,
    display_name: String,
    sink: EventSink,
    transports: HashMap<TransportId, Arc<dyn MediaTransport>>,
    producers: HashMap<ProducerId, ProducerEntry>,
    consumers: HashMap<ConsumerId, ConsumerEntry>,
}

impl Peer {
    #[must_use]
    pub fn new(id: PeerId, display_name: impl Into<String>, sink: EventSink) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            sink,
            transports: HashMap::new(),
            producers: HashMap::new(),
            consumers: HashMap::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> &PeerId {
        &self.id
    }

    #[must_use]
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    #[must_use]
    pub fn sink(&self) -> &EventSink {
        &self.sink
    }

    pub fn add_transport(&mut self, transport: Arc<dyn MediaTransport>) {
        debug!(
            target: "rc.peer",
            peer_id = %self.id,
            transport_id = %transport.id(),
            "Transport added"
        );
        self.transports.insert(transport.id().clone(), transport);
    }

    /// One of this peer's transports.
    pub fn transport(&self, transport_id: &TransportId) -> Result<Arc<dyn MediaTransport>, RcError> {
        self.transports
            .get(transport_id)
            .cloned()
            .ok_or_else(|| RcError::TransportNotFound(transport_id.clone()))
    }

    #[must_use]
    pub fn has_transport(&self, transport_id: &TransportId) -> bool {
        self.transports.contains_key(transport_id)
    }

    /// Record a producer the engine created on `transport_id`.
    pub fn add_producer(
        &mut self,
        producer: Arc<dyn MediaProducer>,
        source: MediaSource,
        transport_id: &TransportId,
    ) {
        self.producers.insert(
            producer.id().clone(),
            ProducerEntry {
                handle: producer,
                source,
                transport_id: transport_id.clone(),
            },
        );
    }

    /// Record a consumer the engine created on `transport_id`.
    pub fn add_consumer(&mut self, consumer: Arc<dyn MediaConsumer>, transport_id: &TransportId) {
        self.consumers.insert(
            consumer.id().clone(),
            ConsumerEntry {
                handle: consumer,
                transport_id: transport_id.clone(),
            },
        );
    }

    pub fn consumer(&self, consumer_id: &ConsumerId) -> Result<Arc<dyn MediaConsumer>, RcError> {
        self.consumers
            .get(consumer_id)
            .map(|entry| Arc::clone(&entry.handle))
            .ok_or_else(|| RcError::ConsumerNotFound(consumer_id.clone()))
    }

    #[must_use]
    pub fn owns_producer(&self, producer_id: &ProducerId) -> bool {
        self.producers.contains_key(producer_id)
    }

    /// `(id, kind, source)` of every open producer.
    pub fn producers(&self) -> impl Iterator<Item = (&ProducerId, MediaKind, MediaSource)> {
        self.producers
            .iter()
            .map(|(id, entry)| (id, entry.handle.kind(), entry.source))
    }

    #[must_use]
    pub fn producer_count(&self) -> usize {
        self.producers.len()
    }

    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    #[must_use]
    pub fn transport_count(&self) -> usize {
        self.transports.len()
    }

    /// Close and remove a producer. Returns `false` if it was already gone.
    ///
    /// Downstream consumers in other peers are the room's concern.
    pub fn close_producer(&mut self, producer_id: &ProducerId) -> bool {
        match self.producers.remove(producer_id) {
            Some(entry) => {
                entry.handle.close();
                true
            }
            None => false,
        }
    }

    /// Close and remove a consumer. Returns `false` if it was already gone.
    pub fn close_consumer(&mut self, consumer_id: &ConsumerId) -> bool {
        match self.consumers.remove(consumer_id) {
            Some(entry) => {
                entry.handle.close();
                true
            }
            None => false,
        }
    }

    /// Close every consumer whose upstream is one of `producer_ids`.
    pub fn close_consumers_of(&mut self, producer_ids: &[ProducerId]) -> Vec<ConsumerId> {
        let doomed: Vec<ConsumerId> = self
            .consumers
            .iter()
            .filter(|(_, entry)| producer_ids.contains(entry.handle.producer_id()))
            .map(|(id, _)| id.clone())
            .collect();
        for consumer_id in &doomed {
            self.close_consumer(consumer_id);
        }
        doomed
    }

    /// Close a transport and everything bound to it.
    ///
    /// Returns the ids of the producers that were closed, or `None` if the
    /// peer has no such transport.
    pub fn close_transport(&mut self, transport_id: &TransportId) -> Option<Vec<ProducerId>> {
        let transport = self.transports.remove(transport_id)?;
        transport.close();

        let producers: Vec<ProducerId> = self
            .producers
            .iter()
            .filter(|(_, entry)| &entry.transport_id == transport_id)
            .map(|(id, _)| id.clone())
            .collect();
        for producer_id in &producers {
            self.close_producer(producer_id);
        }

        let consumers: Vec<ConsumerId> = self
            .consumers
            .iter()
            .filter(|(_, entry)| &entry.transport_id == transport_id)
            .map(|(id, _)| id.clone())
            .collect();
        for consumer_id in &consumers {
            self.close_consumer(consumer_id);
        }

        debug!(
            target: "rc.peer",
            peer_id = %self.id,
            transport_id = %transport_id,
            producers = producers.len(),
            consumers = consumers.len(),
            "Transport closed"
        );
        Some(producers)
    }

    /// Close all transports. Returns the ids of every producer closed.
    pub fn close(&mut self) -> Vec<ProducerId> {
        let transport_ids: Vec<TransportId> = self.transports.keys().cloned().collect();
        let mut closed = Vec::new();
        for transport_id in &transport_ids {
            if let Some(producers) = self.close_transport(transport_id) {
                closed.extend(producers);
            }
        }

        // Entries whose transport vanished underneath them.
        let leftover: Vec<ProducerId> = self.producers.keys().cloned().collect();
        for producer_id in leftover {
            self.close_producer(&producer_id);
            closed.push(producer_id);
        }
        let leftover: Vec<ConsumerId> = self.consumers.keys().cloned().collect();
        for consumer_id in &leftover {
            self.close_consumer(consumer_id);
        }

        closed
    }
}
