// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Observability records emitted by the gateway.
//!
//! The gateway never logs directly; it hands a [`GatewayEvent`] to the
//! [`Observer`] it was built with. [`TracingObserver`] writes them to
//! `tracing` and keeps [`GatewayStats`] counters.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, trace, warn};

use crate::protocol::{MessageType, ReturnCode};

/// Why a client session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Client sent DISCONNECT.
    Disconnect,
    /// Client sent CONNECT again from the same endpoint.
    Reconnect,
    /// No traffic for longer than the keep-alive allows.
    KeepAlive,
    Shutdown,
}

/// One observable occurrence inside the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEvent {
    Received {
        addr: SocketAddr,
        kind: MessageType,
        bytes: usize,
    },
    Sent {
        addr: SocketAddr,
        kind: MessageType,
        bytes: usize,
    },
    /// A message type the gateway accepts but does not act on.
    Ignored { addr: SocketAddr, kind: MessageType },
    DecodeFailed { addr: SocketAddr, error: String },
    HandlerFailed {
        addr: SocketAddr,
        kind: MessageType,
        error: String,
    },
    /// Client PUBLISH acknowledged by the broker.
    Forwarded { topic: String, bytes: usize },
    /// Broker delivery handed to its subscribers.
    Distributed { topic: String, subscribers: usize },
    /// Delivery parked behind a gateway REGISTER.
    Deferred { addr: SocketAddr, topic_id: u16 },
    DeliveryFailed {
        addr: SocketAddr,
        topic: String,
        error: String,
    },
    /// REGACK arrived with nothing pending for the topic id.
    NothingPending { addr: SocketAddr, topic_id: u16 },
    /// Client rejected a gateway REGISTER; the pending message was dropped.
    RegisterRejected {
        addr: SocketAddr,
        topic_id: u16,
        code: ReturnCode,
    },
    PendingExpired { addr: SocketAddr, topic_id: u16 },
    SessionOpened {
        addr: SocketAddr,
        client_id: String,
        /// The client asked for a will, which the gateway does not keep.
        will: bool,
    },
    SessionClosed {
        addr: SocketAddr,
        client_id: String,
        reason: CloseReason,
    },
    UpstreamSubscribed { filter: String },
    UpstreamUnsubscribed { filter: String },
    UnsubscribeFailed { filter: String, error: String },
    /// A broker delivery could not be given a topic id.
    DistributeFailed { topic: String, error: String },
    /// A corrupt filter entry was passed over while matching `topic`.
    MatchSkipped { topic: String, error: String },
    /// A filter could not be restored after the broker session came back.
    ResubscribeFailed { filter: String, error: String },
}

/// Sink for gateway events.
pub trait Observer: Send + Sync {
    fn record(&self, event: GatewayEvent);
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Gateway counters.
#[derive(Debug)]
pub struct GatewayStats {
    pub datagrams_received: AtomicU64,
    pub bytes_received: AtomicU64,
    pub datagrams_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub decode_errors: AtomicU64,
    pub handler_errors: AtomicU64,
    pub ignored: AtomicU64,
    /// Client publishes acknowledged by the broker.
    pub forwarded: AtomicU64,
    /// Broker deliveries distributed.
    pub distributed: AtomicU64,
    pub deferred: AtomicU64,
    pub delivery_failures: AtomicU64,
    pub pending_expired: AtomicU64,
    pub sessions_opened: AtomicU64,
    pub sessions_closed: AtomicU64,
    pub created: Instant,
}

impl Default for GatewayStats {
    fn default() -> Self {
        Self::new()
    }
}

impl GatewayStats {
    pub fn new() -> Self {
        Self {
            datagrams_received: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            datagrams_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            handler_errors: AtomicU64::new(0),
            ignored: AtomicU64::new(0),
            forwarded: AtomicU64::new(0),
            distributed: AtomicU64::new(0),
            deferred: AtomicU64::new(0),
            delivery_failures: AtomicU64::new(0),
            pending_expired: AtomicU64::new(0),
            sessions_opened: AtomicU64::new(0),
            sessions_closed: AtomicU64::new(0),
            created: Instant::now(),
        }
    }

    pub fn snapshot(&self) -> GatewayStatsSnapshot {
        let opened = self.sessions_opened.load(Ordering::Relaxed);
        let closed = self.sessions_closed.load(Ordering::Relaxed);
        GatewayStatsSnapshot {
            datagrams_received: self.datagrams_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            datagrams_sent: self.datagrams_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            distributed: self.distributed.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
            delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
            pending_expired: self.pending_expired.load(Ordering::Relaxed),
            active_sessions: opened.saturating_sub(closed),
            uptime_secs: self.created.elapsed().as_secs(),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}

/// Point-in-time copy of [`GatewayStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GatewayStatsSnapshot {
    pub datagrams_received: u64,
    pub bytes_received: u64,
    pub datagrams_sent: u64,
    pub bytes_sent: u64,
    pub decode_errors: u64,
    pub handler_errors: u64,
    pub ignored: u64,
    pub forwarded: u64,
    pub distributed: u64,
    pub deferred: u64,
    pub delivery_failures: u64,
    pub pending_expired: u64,
    pub active_sessions: u64,
    pub uptime_secs: u64,
}

impl GatewayStatsSnapshot {
    /// Inbound datagrams per second since start.
    pub fn datagrams_per_second(&self) -> f64 {
        if self.uptime_secs > 0 {
            self.datagrams_received as f64 / self.uptime_secs as f64
        } else {
            0.0
        }
    }
}

// ---------------------------------------------------------------------------
// Tracing observer
// ---------------------------------------------------------------------------

/// Observer that logs through `tracing` and counts into [`GatewayStats`].
#[derive(Debug, Clone, Default)]
pub struct TracingObserver {
    stats: Arc<GatewayStats>,
}

impl TracingObserver {
    pub fn new(stats: Arc<GatewayStats>) -> Self {
        Self { stats }
    }

    pub fn stats(&self) -> &Arc<GatewayStats> {
        &self.stats
    }
}

impl Observer for TracingObserver {
    fn record(&self, event: GatewayEvent) {
        let stats = &self.stats;
        match event {
            GatewayEvent::Received { addr, kind, bytes } => {
                GatewayStats::bump(&stats.datagrams_received);
                GatewayStats::add(&stats.bytes_received, bytes);
                trace!("<- {} {} ({} bytes)", addr, kind, bytes);
            }
            GatewayEvent::Sent { addr, kind, bytes } => {
                GatewayStats::bump(&stats.datagrams_sent);
                GatewayStats::add(&stats.bytes_sent, bytes);
                trace!("-> {} {} ({} bytes)", addr, kind, bytes);
            }
            GatewayEvent::Ignored { addr, kind } => {
                GatewayStats::bump(&stats.ignored);
                debug!("Ignoring {} from {}", kind, addr);
            }
            GatewayEvent::DecodeFailed { addr, error } => {
                GatewayStats::bump(&stats.decode_errors);
                warn!("Undecodable datagram from {}: {}", addr, error);
            }
            GatewayEvent::HandlerFailed { addr, kind, error } => {
                GatewayStats::bump(&stats.handler_errors);
                warn!("{} from {} failed: {}", kind, addr, error);
            }
            GatewayEvent::Forwarded { topic, bytes } => {
                GatewayStats::bump(&stats.forwarded);
                debug!("Forwarded {} bytes to broker topic {}", bytes, topic);
            }
            GatewayEvent::Distributed { topic, subscribers } => {
                GatewayStats::bump(&stats.distributed);
                debug!("Broker message on {} -> {} subscriber(s)", topic, subscribers);
            }
            GatewayEvent::Deferred { addr, topic_id } => {
                GatewayStats::bump(&stats.deferred);
                debug!("Deferred delivery to {} behind REGISTER of topic {}", addr, topic_id);
            }
            GatewayEvent::DeliveryFailed { addr, topic, error } => {
                GatewayStats::bump(&stats.delivery_failures);
                warn!("Delivery of {} to {} failed: {}", topic, addr, error);
            }
            GatewayEvent::NothingPending { addr, topic_id } => {
                debug!("REGACK from {} for topic {} with nothing pending", addr, topic_id);
            }
            GatewayEvent::RegisterRejected {
                addr,
                topic_id,
                code,
            } => {
                GatewayStats::bump(&stats.delivery_failures);
                warn!(
                    "{} rejected REGISTER of topic {} ({:?}), pending message dropped",
                    addr, topic_id, code
                );
            }
            GatewayEvent::PendingExpired { addr, topic_id } => {
                GatewayStats::bump(&stats.pending_expired);
                debug!("Pending message for {} topic {} expired", addr, topic_id);
            }
            GatewayEvent::SessionOpened {
                addr,
                client_id,
                will,
            } => {
                GatewayStats::bump(&stats.sessions_opened);
                info!("Client {} connected from {}", client_id, addr);
                if will {
                    debug!("Client {} requested a will; wills are not supported", client_id);
                }
            }
            GatewayEvent::SessionClosed {
                addr,
                client_id,
                reason,
            } => {
                GatewayStats::bump(&stats.sessions_closed);
                info!("Client {} at {} closed ({:?})", client_id, addr, reason);
            }
            GatewayEvent::UpstreamSubscribed { filter } => {
                info!("Subscribed upstream to {}", filter);
            }
            GatewayEvent::UpstreamUnsubscribed { filter } => {
                info!("Unsubscribed upstream from {}", filter);
            }
            GatewayEvent::UnsubscribeFailed { filter, error } => {
                GatewayStats::bump(&stats.handler_errors);
                warn!("Upstream unsubscribe from {} failed: {}", filter, error);
            }
            GatewayEvent::DistributeFailed { topic, error } => {
                GatewayStats::bump(&stats.delivery_failures);
                warn!("Broker message on {} not distributed: {}", topic, error);
            }
            GatewayEvent::MatchSkipped { topic, error } => {
                GatewayStats::bump(&stats.handler_errors);
                warn!("Skipped a filter while matching {}: {}", topic, error);
            }
            GatewayEvent::ResubscribeFailed { filter, error } => {
                GatewayStats::bump(&stats.handler_errors);
                warn!("Resubscribe to {} after reconnect failed: {}", filter, error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], 5000))
    }

    #[test]
    fn test_tracing_observer_counts() {
        let observer = TracingObserver::default();
        observer.record(GatewayEvent::Received {
            addr: addr(),
            kind: MessageType::Connect,
            bytes: 12,
        });
        observer.record(GatewayEvent::Sent {
            addr: addr(),
            kind: MessageType::Connack,
            bytes: 3,
        });
        observer.record(GatewayEvent::SessionOpened {
            addr: addr(),
            client_id: "dev".into(),
            will: false,
        });
        observer.record(GatewayEvent::DecodeFailed {
            addr: addr(),
            error: "empty datagram".into(),
        });

        let snap = observer.stats().snapshot();
        assert_eq!(snap.datagrams_received, 1);
        assert_eq!(snap.bytes_received, 12);
        assert_eq!(snap.datagrams_sent, 1);
        assert_eq!(snap.bytes_sent, 3);
        assert_eq!(snap.decode_errors, 1);
        assert_eq!(snap.active_sessions, 1);

        observer.record(GatewayEvent::SessionClosed {
            addr: addr(),
            client_id: "dev".into(),
            reason: CloseReason::Disconnect,
        });
        assert_eq!(observer.stats().snapshot().active_sessions, 0);
    }

    #[test]
    fn test_rate_without_uptime() {
        let snap = GatewayStatsSnapshot {
            datagrams_received: 10,
            ..Default::default()
        };
        assert_eq!(snap.datagrams_per_second(), 0.0);

        let snap = GatewayStatsSnapshot {
            datagrams_received: 10,
            uptime_secs: 5,
            ..Default::default()
        };
        assert_eq!(snap.datagrams_per_second(), 2.0);
    }
}
