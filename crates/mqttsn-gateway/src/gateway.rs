// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Aggregating gateway: dispatch loop and protocol translation.
//
// Decodes client datagrams, routes each message type to its handler,
// forwards client publishes to the broker and fans broker deliveries out to
// subscribed clients. Each datagram and each (delivery, subscriber) pair is
// handled on its own task; a failure only affects that message.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Notify, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::observe::{CloseReason, GatewayEvent, Observer};
use crate::protocol::{
    Advertise, Connect, DecodeError, Flags, GwInfo, Message, MessageType, Puback, Publish, QoS,
    Regack, Register, ReturnCode, Suback, TopicIdType, TopicRef, TopicRequest, WillTopic,
};
use crate::session::{validate_client_id, ClientRegistry, ClientSession};
use crate::topics::TopicRegistry;
use crate::transport::DatagramTransport;
use crate::tree::{contains_wildcard, validate_filter, SubscriptionTree};
use crate::upstream::{BrokerEvent, Delivery, Upstream};

// ---------------------------------------------------------------------------
// Per-filter locks
// ---------------------------------------------------------------------------

/// One async lock per filter, held while a filter's tree entry and its
/// broker subscription change together. Entries are dropped with their
/// last user.
#[derive(Default)]
struct FilterLocks {
    locks: parking_lot::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl FilterLocks {
    async fn lock(&self, filter: &str) -> FilterGuard<'_> {
        let lock = Arc::clone(self.locks.lock().entry(filter.to_string()).or_default());
        let guard = Arc::clone(&lock).lock_owned().await;
        FilterGuard {
            locks: self,
            filter: filter.to_string(),
            lock,
            guard: Some(guard),
        }
    }

    fn len(&self) -> usize {
        self.locks.lock().len()
    }
}

struct FilterGuard<'a> {
    locks: &'a FilterLocks,
    filter: String,
    lock: Arc<tokio::sync::Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for FilterGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.locks.locks.lock();
        // Only the map and this guard still hold it: nobody is waiting.
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.filter);
        }
    }
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

/// The MQTT-SN gateway. Shared as `Arc<Gateway>` by the receive loop and
/// every handler task.
pub struct Gateway {
    config: GatewayConfig,
    topics: TopicRegistry,
    tree: SubscriptionTree<ClientSession>,
    clients: ClientRegistry,
    filter_locks: FilterLocks,
    transport: Arc<dyn DatagramTransport>,
    upstream: Arc<dyn Upstream>,
    observer: Arc<dyn Observer>,
    shutdown: Notify,
}

impl Gateway {
    pub fn new(
        config: GatewayConfig,
        transport: Arc<dyn DatagramTransport>,
        upstream: Arc<dyn Upstream>,
        observer: Arc<dyn Observer>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            topics: TopicRegistry::new(),
            tree: SubscriptionTree::new(),
            clients: ClientRegistry::new(),
            filter_locks: FilterLocks::default(),
            transport,
            upstream,
            observer,
            shutdown: Notify::new(),
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn topics(&self) -> &TopicRegistry {
        &self.topics
    }

    pub fn tree(&self) -> &SubscriptionTree<ClientSession> {
        &self.tree
    }

    pub fn clients(&self) -> &ClientRegistry {
        &self.clients
    }

    /// Filters with a subscribe, unsubscribe or teardown in progress.
    pub fn filters_in_flight(&self) -> usize {
        self.filter_locks.len()
    }

    fn broker_qos(&self) -> QoS {
        QoS::from_level(self.config.broker.qos)
    }

    // -----------------------------------------------------------------------
    // Run loop
    // -----------------------------------------------------------------------

    /// Receive datagrams and broker events until [`Gateway::shutdown`].
    pub async fn run(self: Arc<Self>, mut broker: mpsc::Receiver<BrokerEvent>) {
        let max = self.config.max_message_size;
        // One spare byte tells an oversized datagram from a full one.
        let mut buf = vec![0u8; max + 1];
        let mut sweep = tokio::time::interval(self.config.sweep_interval());
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut broker_open = true;

        info!("Gateway {} running", self.config.name);

        loop {
            tokio::select! {
                result = self.transport.recv_from(&mut buf) => match result {
                    Ok((n, addr)) if n > max => {
                        self.observer.record(GatewayEvent::DecodeFailed {
                            addr,
                            error: format!("datagram exceeds {} bytes", max),
                        });
                    }
                    Ok((n, addr)) => {
                        let data = buf[..n].to_vec();
                        let gateway = Arc::clone(&self);
                        tokio::spawn(async move {
                            gateway.handle_datagram(addr, &data).await;
                        });
                    }
                    Err(e) => warn!("UDP receive error: {}", e),
                },
                event = broker.recv(), if broker_open => match event {
                    Some(BrokerEvent::Delivery(delivery)) => {
                        let topic = delivery.topic.clone();
                        if let Err(e) = self.distribute(delivery) {
                            self.observer.record(GatewayEvent::DistributeFailed {
                                topic,
                                error: e.to_string(),
                            });
                        }
                    }
                    Some(BrokerEvent::Reconnected) => {
                        let gateway = Arc::clone(&self);
                        tokio::spawn(async move {
                            gateway.resubscribe().await;
                        });
                    }
                    None => {
                        warn!("Broker event channel closed");
                        broker_open = false;
                    }
                },
                _ = sweep.tick() => {
                    let gateway = Arc::clone(&self);
                    tokio::spawn(async move {
                        gateway.sweep(Instant::now()).await;
                    });
                }
                _ = self.shutdown.notified() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        self.close().await;
    }

    /// Ask [`Gateway::run`] to stop. Safe to call before `run` awaits.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Drop every session, leave the broker and wait out the grace period.
    async fn close(&self) {
        for session in self.clients.drain() {
            self.observer.record(GatewayEvent::SessionClosed {
                addr: session.addr(),
                client_id: session.client_id().to_string(),
                reason: CloseReason::Shutdown,
            });
        }
        if let Err(e) = self.upstream.disconnect().await {
            warn!("Broker disconnect failed: {}", e);
        }
        tokio::time::sleep(self.config.shutdown_grace()).await;
        info!("Gateway {} stopped", self.config.name);
    }

    /// Expire pending messages and idle sessions.
    pub async fn sweep(&self, now: Instant) {
        let max_age = self.config.pending_timeout();
        for session in self.clients.sessions() {
            for topic_id in session.evict_stale_pending(max_age, now) {
                self.observer.record(GatewayEvent::PendingExpired {
                    addr: session.addr(),
                    topic_id,
                });
            }
        }
        for session in self.clients.expired(now) {
            self.close_session(&session, CloseReason::KeepAlive).await;
        }
    }

    /// Subscribe upstream again to every filter that still has subscribers.
    /// Used after the broker session was re-established.
    pub async fn resubscribe(&self) {
        let filters = self.tree.filters();
        info!("Restoring {} broker subscription(s)", filters.len());
        for filter in filters {
            let _guard = self.filter_locks.lock(&filter).await;
            // Emptied (and unsubscribed) while waiting for the lock.
            if !self.tree.contains_filter(&filter) {
                continue;
            }
            match self.upstream.subscribe(&filter, self.broker_qos()).await {
                Ok(()) => self
                    .observer
                    .record(GatewayEvent::UpstreamSubscribed { filter }),
                Err(e) => self.observer.record(GatewayEvent::ResubscribeFailed {
                    filter,
                    error: e.to_string(),
                }),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Inbound datagrams
    // -----------------------------------------------------------------------

    /// Decode and handle one datagram from `addr`. Never fails: problems
    /// become observability records.
    pub async fn handle_datagram(&self, addr: SocketAddr, data: &[u8]) {
        let message = match Message::decode(data) {
            Ok(m) => m,
            Err(e) => {
                self.observer.record(GatewayEvent::DecodeFailed {
                    addr,
                    error: e.to_string(),
                });
                return;
            }
        };
        let kind = message.message_type();
        self.observer.record(GatewayEvent::Received {
            addr,
            kind,
            bytes: data.len(),
        });

        if let Err(e) = self.dispatch(addr, message).await {
            self.observer.record(GatewayEvent::HandlerFailed {
                addr,
                kind,
                error: e.to_string(),
            });
        }
    }

    async fn dispatch(&self, addr: SocketAddr, message: Message) -> Result<()> {
        if let Ok(session) = self.clients.get_client(addr) {
            session.touch();
        }

        match message {
            Message::Advertise(m) => self.handle_advertise(addr, &m),
            Message::SearchGw { radius } => self.handle_searchgw(addr, radius),
            Message::GwInfo(m) => self.handle_gwinfo(addr, &m),
            Message::Connect(m) => self.handle_connect(addr, m).await,
            Message::Connack { return_code } => self.handle_connack(addr, return_code),
            Message::WillTopicReq => self.handle_willtopicreq(addr),
            Message::WillTopic(m) => self.handle_willtopic(addr, &m),
            Message::WillMsgReq => self.handle_willmsgreq(addr),
            Message::WillMsg { msg } => self.handle_willmsg(addr, &msg),
            Message::Register(m) => self.handle_register(addr, m).await,
            Message::Regack(m) => self.handle_regack(addr, m).await,
            Message::Publish(m) => self.handle_publish(addr, m).await,
            Message::Puback(m) => self.handle_puback(addr, &m),
            Message::Pubcomp { msg_id } => self.handle_pubcomp(addr, msg_id),
            Message::Pubrec { msg_id } => self.handle_pubrec(addr, msg_id),
            Message::Pubrel { msg_id } => self.handle_pubrel(addr, msg_id),
            Message::Subscribe(m) => self.handle_subscribe(addr, m).await,
            Message::Suback(m) => self.handle_suback(addr, &m),
            Message::Unsubscribe(m) => self.handle_unsubscribe(addr, m).await,
            Message::Unsuback { msg_id } => self.handle_unsuback(addr, msg_id),
            Message::Pingreq { client_id } => self.handle_pingreq(addr, client_id).await,
            Message::Pingresp => self.handle_pingresp(addr),
            Message::Disconnect { duration } => self.handle_disconnect(addr, duration).await,
            Message::WillTopicUpd(m) => self.handle_willtopicupd(addr, &m),
            Message::WillTopicResp { return_code } => self.handle_willtopicresp(addr, return_code),
            Message::WillMsgUpd { msg } => self.handle_willmsgupd(addr, &msg),
            Message::WillMsgResp { return_code } => self.handle_willmsgresp(addr, return_code),
        }
    }

    // -----------------------------------------------------------------------
    // Handlers with gateway behavior
    // -----------------------------------------------------------------------

    async fn handle_connect(&self, addr: SocketAddr, connect: Connect) -> Result<()> {
        let client_id = validate_client_id(&connect.client_id)?;

        if let Ok(previous) = self.clients.get_client(addr) {
            self.close_session(&previous, CloseReason::Reconnect).await;
        }

        let session = Arc::new(ClientSession::new(
            client_id.clone(),
            addr,
            Arc::clone(&self.transport),
            Duration::from_secs(connect.duration.into()),
            self.config.max_message_size,
        ));
        self.clients.add_client(Arc::clone(&session));
        self.observer.record(GatewayEvent::SessionOpened {
            addr,
            client_id,
            will: connect.flags.will,
        });

        self.send(
            &session,
            Message::Connack {
                return_code: ReturnCode::Accepted,
            },
        )
        .await
    }

    async fn handle_register(&self, addr: SocketAddr, register: Register) -> Result<()> {
        let session = self.clients.get_client(addr)?;
        let topic_id = self.topics.get_or_create_id(&register.topic_name)?;
        session.register(topic_id);

        self.send(
            &session,
            Message::Regack(Regack {
                topic_id,
                msg_id: register.msg_id,
                return_code: ReturnCode::Accepted,
            }),
        )
        .await
    }

    /// Reply to a gateway REGISTER: release the message parked on the id.
    async fn handle_regack(&self, addr: SocketAddr, regack: Regack) -> Result<()> {
        let session = self.clients.get_client(addr)?;
        let topic_id = regack.topic_id;

        if regack.return_code != ReturnCode::Accepted {
            session.fetch_pending_message(topic_id);
            self.observer.record(GatewayEvent::RegisterRejected {
                addr,
                topic_id,
                code: regack.return_code,
            });
            return Ok(());
        }

        session.register(topic_id);
        match session.fetch_pending_message(topic_id) {
            Some(publish) => self.send(&session, Message::Publish(publish)).await,
            None => {
                self.observer
                    .record(GatewayEvent::NothingPending { addr, topic_id });
                Ok(())
            }
        }
    }

    async fn handle_subscribe(&self, addr: SocketAddr, request: TopicRequest) -> Result<()> {
        let session = self.clients.get_client(addr)?;
        let (filter, topic_id) = match request.topic {
            TopicRef::Name(name) => self.resolve_filter(name)?,
            TopicRef::Short(raw) => self.resolve_filter(short_topic_name(raw)?)?,
            TopicRef::Predefined(id) => {
                let name = self
                    .topics
                    .name_of(id)
                    .ok_or(GatewayError::UnknownTopicId(id))?;
                (name, id)
            }
        };

        // Later subscribers to the filter wait here for the first one's
        // broker receipt; after a failure the next in line subscribes again.
        let guard = self.filter_locks.lock(&filter).await;
        let first = self
            .tree
            .add_subscription(addr, Arc::clone(&session), &filter)?;
        session.add_filter(&filter);

        // Closed while waiting: teardown may have missed this filter.
        if !self.clients.is_current(&session) {
            session.remove_filter(&filter);
            if self.tree.remove_subscription(&addr, &filter) && !first {
                self.unsubscribe_upstream(&filter).await;
            }
            return Err(GatewayError::UnknownClient(addr));
        }

        if first {
            if let Err(e) = self.upstream.subscribe(&filter, self.broker_qos()).await {
                session.remove_filter(&filter);
                self.tree.remove_subscription(&addr, &filter);
                return Err(e.into());
            }
            self.observer.record(GatewayEvent::UpstreamSubscribed {
                filter: filter.clone(),
            });
        }
        drop(guard);

        if topic_id != 0 {
            session.register(topic_id);
        }

        self.send(
            &session,
            Message::Suback(Suback {
                flags: Flags::with_qos(request.flags.qos),
                topic_id,
                msg_id: request.msg_id,
                return_code: ReturnCode::Accepted,
            }),
        )
        .await
    }

    async fn handle_unsubscribe(&self, addr: SocketAddr, request: TopicRequest) -> Result<()> {
        let session = self.clients.get_client(addr)?;
        let filter = match request.topic {
            TopicRef::Name(name) => name,
            TopicRef::Short(raw) => short_topic_name(raw)?,
            TopicRef::Predefined(id) => self
                .topics
                .name_of(id)
                .ok_or(GatewayError::UnknownTopicId(id))?,
        };

        let guard = self.filter_locks.lock(&filter).await;
        session.remove_filter(&filter);
        if self.tree.remove_subscription(&addr, &filter) {
            self.unsubscribe_upstream(&filter).await;
        }
        drop(guard);

        self.send(
            &session,
            Message::Unsuback {
                msg_id: request.msg_id,
            },
        )
        .await
    }

    /// Client -> broker. Waits for the broker receipt before returning.
    async fn handle_publish(&self, addr: SocketAddr, publish: Publish) -> Result<()> {
        // QoS -1 publishes are sent without a session.
        let session = match self.clients.get_client(addr) {
            Ok(session) => Some(session),
            Err(_) if publish.flags.qos == QoS::Connectionless => None,
            Err(e) => return Err(e),
        };

        let topic = match self.publish_topic(&publish) {
            Ok(topic) => topic,
            Err(e) => {
                if let (Some(session), GatewayError::UnknownTopicId(_)) = (&session, &e) {
                    self.puback(session, &publish, ReturnCode::InvalidTopicId)
                        .await?;
                }
                return Err(e);
            }
        };

        let bytes = publish.data.len();
        self.upstream
            .publish(
                &topic,
                self.broker_qos(),
                publish.flags.retain,
                publish.data.clone(),
            )
            .await?;
        self.observer
            .record(GatewayEvent::Forwarded { topic, bytes });

        match session {
            Some(session) if publish.flags.qos == QoS::AtLeastOnce => {
                self.puback(&session, &publish, ReturnCode::Accepted).await
            }
            _ => Ok(()),
        }
    }

    async fn handle_pingreq(&self, addr: SocketAddr, client_id: Option<Vec<u8>>) -> Result<()> {
        if let Some(id) = client_id {
            debug!("PINGREQ from {} carries client id {:?}", addr, String::from_utf8_lossy(&id));
        }
        match self.clients.get_client(addr) {
            Ok(session) => self.send(&session, Message::Pingresp).await,
            Err(_) => self.reply(addr, Message::Pingresp).await,
        }
    }

    async fn handle_disconnect(&self, addr: SocketAddr, duration: Option<u16>) -> Result<()> {
        let session = self.clients.get_client(addr)?;
        if duration.is_some() {
            debug!("{} asked to sleep; sleeping clients are treated as disconnected", addr);
        }
        self.close_session(&session, CloseReason::Disconnect).await;
        self.send(&session, Message::Disconnect { duration: None })
            .await
    }

    // -----------------------------------------------------------------------
    // Inert message types
    // -----------------------------------------------------------------------

    fn ignore(&self, addr: SocketAddr, kind: MessageType) -> Result<()> {
        self.observer.record(GatewayEvent::Ignored { addr, kind });
        Ok(())
    }

    fn handle_advertise(&self, addr: SocketAddr, _advertise: &Advertise) -> Result<()> {
        self.ignore(addr, MessageType::Advertise)
    }

    fn handle_searchgw(&self, addr: SocketAddr, _radius: u8) -> Result<()> {
        self.ignore(addr, MessageType::SearchGw)
    }

    fn handle_gwinfo(&self, addr: SocketAddr, _info: &GwInfo) -> Result<()> {
        self.ignore(addr, MessageType::GwInfo)
    }

    fn handle_connack(&self, addr: SocketAddr, _code: ReturnCode) -> Result<()> {
        self.ignore(addr, MessageType::Connack)
    }

    fn handle_willtopicreq(&self, addr: SocketAddr) -> Result<()> {
        self.ignore(addr, MessageType::WillTopicReq)
    }

    fn handle_willtopic(&self, addr: SocketAddr, _will: &WillTopic) -> Result<()> {
        self.ignore(addr, MessageType::WillTopic)
    }

    fn handle_willmsgreq(&self, addr: SocketAddr) -> Result<()> {
        self.ignore(addr, MessageType::WillMsgReq)
    }

    fn handle_willmsg(&self, addr: SocketAddr, _msg: &[u8]) -> Result<()> {
        self.ignore(addr, MessageType::WillMsg)
    }

    fn handle_puback(&self, addr: SocketAddr, _puback: &Puback) -> Result<()> {
        self.ignore(addr, MessageType::Puback)
    }

    fn handle_pubcomp(&self, addr: SocketAddr, _msg_id: u16) -> Result<()> {
        self.ignore(addr, MessageType::Pubcomp)
    }

    fn handle_pubrec(&self, addr: SocketAddr, _msg_id: u16) -> Result<()> {
        self.ignore(addr, MessageType::Pubrec)
    }

    fn handle_pubrel(&self, addr: SocketAddr, _msg_id: u16) -> Result<()> {
        self.ignore(addr, MessageType::Pubrel)
    }

    fn handle_suback(&self, addr: SocketAddr, _suback: &Suback) -> Result<()> {
        self.ignore(addr, MessageType::Suback)
    }

    fn handle_unsuback(&self, addr: SocketAddr, _msg_id: u16) -> Result<()> {
        self.ignore(addr, MessageType::Unsuback)
    }

    fn handle_pingresp(&self, addr: SocketAddr) -> Result<()> {
        self.ignore(addr, MessageType::Pingresp)
    }

    fn handle_willtopicupd(&self, addr: SocketAddr, _will: &WillTopic) -> Result<()> {
        self.ignore(addr, MessageType::WillTopicUpd)
    }

    fn handle_willtopicresp(&self, addr: SocketAddr, _code: ReturnCode) -> Result<()> {
        self.ignore(addr, MessageType::WillTopicResp)
    }

    fn handle_willmsgupd(&self, addr: SocketAddr, _msg: &[u8]) -> Result<()> {
        self.ignore(addr, MessageType::WillMsgUpd)
    }

    fn handle_willmsgresp(&self, addr: SocketAddr, _code: ReturnCode) -> Result<()> {
        self.ignore(addr, MessageType::WillMsgResp)
    }

    // -----------------------------------------------------------------------
    // Broker -> clients
    // -----------------------------------------------------------------------

    /// Fan a broker delivery out to every matching subscriber, one task per
    /// subscriber. Returns the task handles.
    pub fn distribute(self: &Arc<Self>, delivery: Delivery) -> Result<Vec<JoinHandle<()>>> {
        let mut matches = self.tree.subscribers_of(&delivery.topic);
        for error in std::mem::take(&mut matches.skipped) {
            self.observer.record(GatewayEvent::MatchSkipped {
                topic: delivery.topic.clone(),
                error: error.to_string(),
            });
        }
        let subscribers = matches.subscribers();
        self.observer.record(GatewayEvent::Distributed {
            topic: delivery.topic.clone(),
            subscribers: subscribers.len(),
        });
        if subscribers.is_empty() {
            return Ok(Vec::new());
        }

        let topic_id = self.topics.get_or_create_id(&delivery.topic)?;
        let publish = Publish {
            flags: Flags {
                retain: delivery.retain,
                ..Default::default()
            },
            topic_id,
            msg_id: 0,
            data: delivery.payload,
        };
        let topic: Arc<str> = Arc::from(delivery.topic);

        let handles = subscribers
            .into_iter()
            .map(|session| {
                let gateway = Arc::clone(self);
                let publish = publish.clone();
                let topic = Arc::clone(&topic);
                tokio::spawn(async move {
                    gateway.deliver(&session, &topic, publish).await;
                })
            })
            .collect();
        Ok(handles)
    }

    async fn deliver(&self, session: &ClientSession, topic: &str, publish: Publish) {
        let result = if session.is_registered(publish.topic_id) {
            self.send(session, Message::Publish(publish)).await
        } else {
            let topic_id = publish.topic_id;
            session.add_pending_message(topic_id, publish);
            self.observer.record(GatewayEvent::Deferred {
                addr: session.addr(),
                topic_id,
            });
            let register = Register {
                topic_id,
                msg_id: session.next_msg_id(),
                topic_name: topic.to_string(),
            };
            self.send(session, Message::Register(register)).await
        };

        if let Err(e) = result {
            self.observer.record(GatewayEvent::DeliveryFailed {
                addr: session.addr(),
                topic: topic.to_string(),
                error: e.to_string(),
            });
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    async fn send(&self, session: &ClientSession, message: Message) -> Result<()> {
        let bytes = session.write(&message).await?;
        self.observer.record(GatewayEvent::Sent {
            addr: session.addr(),
            kind: message.message_type(),
            bytes,
        });
        Ok(())
    }

    /// Send to an endpoint that has no session.
    async fn reply(&self, addr: SocketAddr, message: Message) -> Result<()> {
        let bytes = message.encode();
        self.transport
            .send_to(&bytes, addr)
            .await
            .map_err(|source| GatewayError::Write { addr, source })?;
        self.observer.record(GatewayEvent::Sent {
            addr,
            kind: message.message_type(),
            bytes: bytes.len(),
        });
        Ok(())
    }

    async fn puback(
        &self,
        session: &ClientSession,
        publish: &Publish,
        return_code: ReturnCode,
    ) -> Result<()> {
        self.send(
            session,
            Message::Puback(Puback {
                topic_id: publish.topic_id,
                msg_id: publish.msg_id,
                return_code,
            }),
        )
        .await
    }

    /// Validate a SUBSCRIBE filter and pick the topic id for its SUBACK:
    /// 0 for wildcard filters, the registry id otherwise.
    fn resolve_filter(&self, filter: String) -> Result<(String, u16)> {
        validate_filter(&filter)?;
        let topic_id = if contains_wildcard(&filter) {
            0
        } else {
            self.topics.get_or_create_id(&filter)?
        };
        Ok((filter, topic_id))
    }

    fn publish_topic(&self, publish: &Publish) -> Result<String> {
        match publish.flags.topic_id_type {
            TopicIdType::Short => short_topic_name(publish.topic_id.to_be_bytes()),
            TopicIdType::Normal | TopicIdType::Predefined => self
                .topics
                .name_of(publish.topic_id)
                .ok_or(GatewayError::UnknownTopicId(publish.topic_id)),
        }
    }

    /// Tear down a live session: registry entry, tree entries and the
    /// broker subscriptions nobody else needs. No-op if already closed.
    async fn close_session(&self, session: &Arc<ClientSession>, reason: CloseReason) {
        if !self.clients.remove_if_current(session) {
            return;
        }
        let addr = session.addr();
        for filter in session.filters() {
            let _guard = self.filter_locks.lock(&filter).await;
            session.remove_filter(&filter);
            if self.tree.remove_subscription(&addr, &filter) {
                self.unsubscribe_upstream(&filter).await;
            }
        }
        self.observer.record(GatewayEvent::SessionClosed {
            addr: session.addr(),
            client_id: session.client_id().to_string(),
            reason,
        });
    }

    async fn unsubscribe_upstream(&self, filter: &str) {
        match self.upstream.unsubscribe(filter).await {
            Ok(()) => self.observer.record(GatewayEvent::UpstreamUnsubscribed {
                filter: filter.to_string(),
            }),
            Err(e) => self.observer.record(GatewayEvent::UnsubscribeFailed {
                filter: filter.to_string(),
                error: e.to_string(),
            }),
        }
    }
}

fn short_topic_name(raw: [u8; 2]) -> Result<String> {
    String::from_utf8(raw.to_vec())
        .map_err(|_| GatewayError::Decode(DecodeError::InvalidUtf8("short topic name")))
}
