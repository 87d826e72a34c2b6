// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Upstream trait - bridges the gateway to the MQTT broker.
//
// The gateway keeps one broker session for all of its clients. Every call
// resolves once the broker acknowledged it (PUBACK/PUBCOMP, SUBACK, UNSUBACK),
// not when the request was queued.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, ClientError, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet,
    SubscribeReasonCode,
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::config::BrokerConfig;
use crate::protocol::QoS;

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Errors from the broker session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpstreamError {
    #[error("broker request could not be queued: {0}")]
    Client(String),

    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("broker refused connection: {0}")]
    Refused(String),

    #[error("broker rejected the request")]
    Rejected,

    #[error("no broker receipt within {0:?}")]
    Timeout(Duration),

    #[error("broker session closed")]
    Closed,
}

impl From<ClientError> for UpstreamError {
    fn from(e: ClientError) -> Self {
        Self::Client(e.to_string())
    }
}

/// A message the broker delivered for one of the gateway's subscriptions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
}

/// What the broker session hands to the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    Delivery(Delivery),
    /// The session came back after a connection loss. The broker was
    /// connected with a clean session, so every subscription is gone.
    Reconnected,
}

/// Broker operations used by the gateway.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Bytes,
    ) -> Result<(), UpstreamError>;

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), UpstreamError>;

    async fn unsubscribe(&self, filter: &str) -> Result<(), UpstreamError>;

    async fn disconnect(&self) -> Result<(), UpstreamError>;
}

// ---------------------------------------------------------------------------
// Receipt tracking
// ---------------------------------------------------------------------------

/// Request families with their own packet-id receipts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Publish,
    Subscribe,
    Unsubscribe,
}

type Waiter = oneshot::Sender<Result<(), UpstreamError>>;

/// Matches broker receipts to the callers waiting on them.
///
/// rumqttc assigns packet ids inside its event loop, in request order. A
/// waiter is queued when its request is handed to the client, bound to the
/// packet id when the event loop reports the outgoing packet, and completed
/// when the matching acknowledgement comes back.
#[derive(Debug, Default)]
pub struct ReceiptTracker {
    queued: HashMap<RequestKind, VecDeque<Waiter>>,
    in_flight: HashMap<(RequestKind, u16), Waiter>,
    /// Packet ids whose waiters were failed; rumqttc resends them after a
    /// reconnect and those resends must not bind queued waiters.
    abandoned: HashSet<(RequestKind, u16)>,
}

impl ReceiptTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, kind: RequestKind, waiter: Waiter) {
        self.queued.entry(kind).or_default().push_back(waiter);
    }

    /// Take back the most recent waiter after its request failed to queue.
    pub fn withdraw(&mut self, kind: RequestKind) -> Option<Waiter> {
        self.queued.get_mut(&kind).and_then(VecDeque::pop_back)
    }

    /// The event loop sent a packet. QoS 0 publishes carry packet id 0 and
    /// complete immediately.
    pub fn on_outgoing(&mut self, kind: RequestKind, pkid: u16) {
        let key = (kind, pkid);
        if pkid != 0 && (self.in_flight.contains_key(&key) || self.abandoned.remove(&key)) {
            tracing::trace!("resend of {:?} pkid {}", kind, pkid);
            return;
        }
        let Some(waiter) = self.queued.get_mut(&kind).and_then(VecDeque::pop_front) else {
            tracing::debug!("untracked outgoing {:?} pkid {}", kind, pkid);
            return;
        };
        if pkid == 0 {
            let _ = waiter.send(Ok(()));
        } else {
            self.in_flight.insert(key, waiter);
        }
    }

    /// The broker acknowledged `pkid`.
    pub fn complete(&mut self, kind: RequestKind, pkid: u16, result: Result<(), UpstreamError>) {
        self.abandoned.remove(&(kind, pkid));
        match self.in_flight.remove(&(kind, pkid)) {
            // The caller may have timed out already.
            Some(waiter) => {
                let _ = waiter.send(result);
            }
            None => tracing::debug!("receipt for unknown {:?} pkid {}", kind, pkid),
        }
    }

    /// Fail every queued and in-flight waiter.
    pub fn fail_all(&mut self, error: &UpstreamError) {
        for (key, waiter) in self.in_flight.drain() {
            self.abandoned.insert(key);
            let _ = waiter.send(Err(error.clone()));
        }
        for waiter in self.queued.values_mut().flat_map(|q| q.drain(..)) {
            let _ = waiter.send(Err(error.clone()));
        }
    }

    /// Waiters not yet completed.
    pub fn pending(&self) -> usize {
        self.in_flight.len() + self.queued.values().map(VecDeque::len).sum::<usize>()
    }
}

// ---------------------------------------------------------------------------
// rumqttc upstream
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Shared {
    tracker: Mutex<ReceiptTracker>,
    closing: AtomicBool,
}

/// Broker session backed by `rumqttc`.
pub struct MqttUpstream {
    client: AsyncClient,
    shared: Arc<Shared>,
    /// Held across queueing a waiter and handing the request to rumqttc so
    /// waiters line up with the order packets are sent.
    submit: tokio::sync::Mutex<()>,
    timeout: Duration,
}

impl MqttUpstream {
    /// Connect to the broker and wait for its CONNACK.
    ///
    /// Returns the session and the channel on which broker deliveries and
    /// reconnects arrive. Failing to connect within `timeout_secs` is an
    /// error.
    pub async fn connect(
        config: &BrokerConfig,
    ) -> Result<(Self, mpsc::Receiver<BrokerEvent>), UpstreamError> {
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
        options.set_clean_session(true);
        if let Some(username) = &config.username {
            options.set_credentials(username, config.password.as_deref().unwrap_or_default());
        }

        let (client, mut eventloop) = AsyncClient::new(options, config.channel_capacity);
        let timeout = config.timeout();

        tokio::time::timeout(timeout, wait_for_connack(&mut eventloop))
            .await
            .map_err(|_| UpstreamError::Timeout(timeout))??;
        tracing::info!(
            "Connected to broker {}:{} as {}",
            config.host,
            config.port,
            config.client_id
        );

        let shared = Arc::new(Shared::default());
        let (tx, rx) = mpsc::channel(config.channel_capacity);
        tokio::spawn(drive(eventloop, Arc::clone(&shared), tx));

        Ok((
            Self {
                client,
                shared,
                submit: tokio::sync::Mutex::new(()),
                timeout,
            },
            rx,
        ))
    }

    async fn submit<F, Fut>(&self, kind: RequestKind, send: F) -> Result<(), UpstreamError>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<(), ClientError>> + Send,
    {
        if self.shared.closing.load(Ordering::Acquire) {
            return Err(UpstreamError::Closed);
        }
        let rx = {
            let _order = self.submit.lock().await;
            let (tx, rx) = oneshot::channel();
            self.shared.tracker.lock().enqueue(kind, tx);
            if let Err(e) = send().await {
                self.shared.tracker.lock().withdraw(kind);
                return Err(e.into());
            }
            rx
        };
        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(UpstreamError::Closed),
            Err(_) => Err(UpstreamError::Timeout(self.timeout)),
        }
    }
}

#[async_trait]
impl Upstream for MqttUpstream {
    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Bytes,
    ) -> Result<(), UpstreamError> {
        self.submit(RequestKind::Publish, || {
            self.client
                .publish_bytes(topic.to_string(), to_mqtt_qos(qos), retain, payload)
        })
        .await
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), UpstreamError> {
        self.submit(RequestKind::Subscribe, || {
            self.client.subscribe(filter.to_string(), to_mqtt_qos(qos))
        })
        .await
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), UpstreamError> {
        self.submit(RequestKind::Unsubscribe, || {
            self.client.unsubscribe(filter.to_string())
        })
        .await
    }

    async fn disconnect(&self) -> Result<(), UpstreamError> {
        self.shared.closing.store(true, Ordering::Release);
        self.client.disconnect().await?;
        self.shared.tracker.lock().fail_all(&UpstreamError::Closed);
        Ok(())
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), UpstreamError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return if ack.code == ConnectReturnCode::Success {
                    Ok(())
                } else {
                    Err(UpstreamError::Refused(format!("{:?}", ack.code)))
                };
            }
            Ok(_) => {}
            Err(e) => return Err(UpstreamError::Connection(e.to_string())),
        }
    }
}

/// Poll the rumqttc event loop until the session is closed.
async fn drive(mut eventloop: EventLoop, shared: Arc<Shared>, tx: mpsc::Sender<BrokerEvent>) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(packet)) => on_incoming(packet, &shared, &tx).await,
            Ok(Event::Outgoing(outgoing)) => on_outgoing(outgoing, &shared),
            Err(e) => {
                if shared.closing.load(Ordering::Acquire) {
                    tracing::debug!("Broker event loop stopped: {}", e);
                    break;
                }
                tracing::warn!("Broker connection error: {}", e);
                shared
                    .tracker
                    .lock()
                    .fail_all(&UpstreamError::Connection(e.to_string()));
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

async fn on_incoming(packet: Packet, shared: &Shared, tx: &mpsc::Sender<BrokerEvent>) {
    match packet {
        Packet::Publish(publish) => {
            let delivery = Delivery {
                topic: publish.topic,
                payload: publish.payload,
                qos: from_mqtt_qos(publish.qos),
                retain: publish.retain,
                dup: publish.dup,
            };
            if tx.send(BrokerEvent::Delivery(delivery)).await.is_err() {
                tracing::debug!("Delivery receiver dropped");
            }
        }
        Packet::PubAck(ack) => shared
            .tracker
            .lock()
            .complete(RequestKind::Publish, ack.pkid, Ok(())),
        Packet::PubComp(comp) => shared
            .tracker
            .lock()
            .complete(RequestKind::Publish, comp.pkid, Ok(())),
        Packet::SubAck(ack) => {
            let result = if ack
                .return_codes
                .iter()
                .any(|code| matches!(code, SubscribeReasonCode::Failure))
            {
                Err(UpstreamError::Rejected)
            } else {
                Ok(())
            };
            shared
                .tracker
                .lock()
                .complete(RequestKind::Subscribe, ack.pkid, result);
        }
        Packet::UnsubAck(ack) => shared
            .tracker
            .lock()
            .complete(RequestKind::Unsubscribe, ack.pkid, Ok(())),
        // The first CONNACK is consumed by `connect`; any later one follows
        // a reconnect.
        Packet::ConnAck(ack) if ack.code == ConnectReturnCode::Success => {
            tracing::info!("Broker session re-established");
            if tx.send(BrokerEvent::Reconnected).await.is_err() {
                tracing::debug!("Delivery receiver dropped");
            }
        }
        Packet::ConnAck(ack) => tracing::warn!("Broker refused reconnect ({:?})", ack.code),
        _ => {}
    }
}

fn on_outgoing(outgoing: Outgoing, shared: &Shared) {
    let (kind, pkid) = match outgoing {
        Outgoing::Publish(pkid) => (RequestKind::Publish, pkid),
        Outgoing::Subscribe(pkid) => (RequestKind::Subscribe, pkid),
        Outgoing::Unsubscribe(pkid) => (RequestKind::Unsubscribe, pkid),
        _ => return,
    };
    shared.tracker.lock().on_outgoing(kind, pkid);
}

fn to_mqtt_qos(qos: QoS) -> rumqttc::QoS {
    match qos.level() {
        0 => rumqttc::QoS::AtMostOnce,
        1 => rumqttc::QoS::AtLeastOnce,
        _ => rumqttc::QoS::ExactlyOnce,
    }
}

fn from_mqtt_qos(qos: rumqttc::QoS) -> QoS {
    match qos {
        rumqttc::QoS::AtMostOnce => QoS::AtMostOnce,
        rumqttc::QoS::AtLeastOnce => QoS::AtLeastOnce,
        rumqttc::QoS::ExactlyOnce => QoS::ExactlyOnce,
    }
}
