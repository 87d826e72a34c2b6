// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// MQTT-SN client sessions.
//
// Each connected client has a `ClientSession` holding the topic ids it has
// learned, at most one message per topic id waiting for its REGACK, and its
// subscribed filters. All of it sits behind one per-session mutex, so
// sessions never contend with each other.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use crate::error::GatewayError;
use crate::protocol::{Message, Publish};
use crate::transport::DatagramTransport;

/// Longest client id MQTT-SN allows.
pub const MAX_CLIENT_ID_LEN: usize = 23;

/// Check a raw CONNECT client id: 1..=23 bytes of UTF-8 without control
/// characters.
pub fn validate_client_id(raw: &[u8]) -> Result<String, GatewayError> {
    let invalid = || GatewayError::InvalidClientId(String::from_utf8_lossy(raw).into_owned());
    if raw.is_empty() || raw.len() > MAX_CLIENT_ID_LEN {
        return Err(invalid());
    }
    let id = std::str::from_utf8(raw).map_err(|_| invalid())?;
    if id.chars().any(char::is_control) {
        return Err(invalid());
    }
    Ok(id.to_string())
}

// ---------------------------------------------------------------------------
// Client session
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct PendingMessage {
    publish: Publish,
    queued_at: Instant,
}

#[derive(Debug)]
struct SessionState {
    registered: HashSet<u16>,
    pending: HashMap<u16, PendingMessage>,
    filters: HashSet<String>,
    keep_alive: Duration,
    last_seen: Instant,
    next_msg_id: u16,
}

/// State for one connected MQTT-SN client.
pub struct ClientSession {
    client_id: String,
    addr: SocketAddr,
    transport: Arc<dyn DatagramTransport>,
    max_message_size: usize,
    state: Mutex<SessionState>,
}

impl fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSession")
            .field("client_id", &self.client_id)
            .field("addr", &self.addr)
            .finish_non_exhaustive()
    }
}

impl ClientSession {
    pub fn new(
        client_id: String,
        addr: SocketAddr,
        transport: Arc<dyn DatagramTransport>,
        keep_alive: Duration,
        max_message_size: usize,
    ) -> Self {
        Self {
            client_id,
            addr,
            transport,
            max_message_size,
            state: Mutex::new(SessionState {
                registered: HashSet::new(),
                pending: HashMap::new(),
                filters: HashSet::new(),
                keep_alive,
                last_seen: Instant::now(),
                next_msg_id: 1,
            }),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Record that the client knows `topic_id`.
    pub fn register(&self, topic_id: u16) {
        self.state.lock().registered.insert(topic_id);
    }

    pub fn is_registered(&self, topic_id: u16) -> bool {
        self.state.lock().registered.contains(&topic_id)
    }

    /// Park `publish` until the client acknowledges `topic_id`. A message
    /// already waiting on the same id is replaced and returned.
    pub fn add_pending_message(&self, topic_id: u16, publish: Publish) -> Option<Publish> {
        let pending = PendingMessage {
            publish,
            queued_at: Instant::now(),
        };
        self.state
            .lock()
            .pending
            .insert(topic_id, pending)
            .map(|old| old.publish)
    }

    /// Remove and return the message waiting on `topic_id`.
    pub fn fetch_pending_message(&self, topic_id: u16) -> Option<Publish> {
        self.state
            .lock()
            .pending
            .remove(&topic_id)
            .map(|p| p.publish)
    }

    /// Drop pending messages queued more than `max_age` before `now`.
    /// Returns their topic ids.
    pub fn evict_stale_pending(&self, max_age: Duration, now: Instant) -> Vec<u16> {
        let mut state = self.state.lock();
        let stale: Vec<u16> = state
            .pending
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.queued_at) > max_age)
            .map(|(&id, _)| id)
            .collect();
        for id in &stale {
            state.pending.remove(id);
        }
        stale
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn add_filter(&self, filter: &str) {
        self.state.lock().filters.insert(filter.to_string());
    }

    pub fn remove_filter(&self, filter: &str) -> bool {
        self.state.lock().filters.remove(filter)
    }

    pub fn filters(&self) -> Vec<String> {
        self.state.lock().filters.iter().cloned().collect()
    }

    /// Update the last-activity timestamp.
    pub fn touch(&self) {
        self.state.lock().last_seen = Instant::now();
    }

    /// A session expires after 1.5 keep-alive periods without traffic. A
    /// zero keep-alive never expires.
    pub fn is_expired(&self, now: Instant) -> bool {
        let state = self.state.lock();
        if state.keep_alive.is_zero() {
            return false;
        }
        now.saturating_duration_since(state.last_seen) > state.keep_alive.mul_f32(1.5)
    }

    /// Next gateway-side message id; never 0.
    pub fn next_msg_id(&self) -> u16 {
        let mut state = self.state.lock();
        let id = state.next_msg_id;
        state.next_msg_id = match id.wrapping_add(1) {
            0 => 1,
            next => next,
        };
        id
    }

    /// Encode `message` and send it to the client. Returns the datagram size.
    pub async fn write(&self, message: &Message) -> Result<usize, GatewayError> {
        let bytes = message.encode();
        if bytes.len() > self.max_message_size {
            return Err(GatewayError::Oversized {
                addr: self.addr,
                size: bytes.len(),
                max: self.max_message_size,
            });
        }
        self.transport
            .send_to(&bytes, self.addr)
            .await
            .map_err(|source| GatewayError::Write {
                addr: self.addr,
                source,
            })?;
        Ok(bytes.len())
    }
}

// ---------------------------------------------------------------------------
// Client registry
// ---------------------------------------------------------------------------

/// Sessions keyed by client endpoint.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: RwLock<HashMap<SocketAddr, Arc<ClientSession>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session, returning the one it replaced.
    pub fn add_client(&self, session: Arc<ClientSession>) -> Option<Arc<ClientSession>> {
        self.clients.write().insert(session.addr(), session)
    }

    pub fn get_client(&self, addr: SocketAddr) -> Result<Arc<ClientSession>, GatewayError> {
        self.clients
            .read()
            .get(&addr)
            .cloned()
            .ok_or(GatewayError::UnknownClient(addr))
    }

    /// True while `session` is the one registered for its endpoint.
    pub fn is_current(&self, session: &Arc<ClientSession>) -> bool {
        self.clients
            .read()
            .get(&session.addr())
            .is_some_and(|current| Arc::ptr_eq(current, session))
    }

    /// Remove `session` only if it is still the one registered for its
    /// endpoint.
    pub fn remove_if_current(&self, session: &Arc<ClientSession>) -> bool {
        let mut clients = self.clients.write();
        match clients.get(&session.addr()) {
            Some(current) if Arc::ptr_eq(current, session) => {
                clients.remove(&session.addr());
                true
            }
            _ => false,
        }
    }

    /// Remove and return every session.
    pub fn drain(&self) -> Vec<Arc<ClientSession>> {
        self.clients.write().drain().map(|(_, s)| s).collect()
    }

    /// Sessions whose keep-alive ran out at `now`.
    pub fn expired(&self, now: Instant) -> Vec<Arc<ClientSession>> {
        self.clients
            .read()
            .values()
            .filter(|s| s.is_expired(now))
            .cloned()
            .collect()
    }

    pub fn sessions(&self) -> Vec<Arc<ClientSession>> {
        self.clients.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Flags;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::io;

    struct SinkTransport {
        sent: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
    }

    #[async_trait]
    impl DatagramTransport for SinkTransport {
        async fn recv_from(&self, _buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
            Err(io::Error::new(io::ErrorKind::Unsupported, "send-only"))
        }

        async fn send_to(&self, data: &[u8], addr: SocketAddr) -> io::Result<()> {
            self.sent.lock().push((addr, data.to_vec()));
            Ok(())
        }
    }

    fn sink() -> Arc<SinkTransport> {
        Arc::new(SinkTransport {
            sent: Mutex::new(Vec::new()),
        })
    }

    fn session_at(port: u16, keep_alive: Duration) -> Arc<ClientSession> {
        Arc::new(ClientSession::new(
            format!("dev-{}", port),
            SocketAddr::from(([127, 0, 0, 1], port)),
            sink(),
            keep_alive,
            64,
        ))
    }

    fn publish(data: &'static [u8]) -> Publish {
        Publish {
            flags: Flags::default(),
            topic_id: 1,
            msg_id: 0,
            data: Bytes::from_static(data),
        }
    }

    #[test]
    fn test_client_id_validation() {
        assert_eq!(validate_client_id(b"sensor-1").expect("valid"), "sensor-1");
        assert!(validate_client_id(b"").is_err());
        assert!(validate_client_id(&[b'x'; 24]).is_err());
        assert!(validate_client_id(&[b'x'; 23]).is_ok());
        assert!(validate_client_id(&[0xFF, 0xFE]).is_err());
        assert!(validate_client_id(b"bad\nid").is_err());
    }

    #[test]
    fn test_register_is_per_session() {
        let a = session_at(1, Duration::ZERO);
        let b = session_at(2, Duration::ZERO);
        a.register(5);
        assert!(a.is_registered(5));
        assert!(!b.is_registered(5));
        assert!(!a.is_registered(6));
    }

    #[test]
    fn test_pending_supersession() {
        let s = session_at(1, Duration::ZERO);
        assert!(s.add_pending_message(3, publish(b"first")).is_none());
        let replaced = s.add_pending_message(3, publish(b"second")).expect("replaced");
        assert_eq!(replaced.data, Bytes::from_static(b"first"));

        let got = s.fetch_pending_message(3).expect("pending");
        assert_eq!(got.data, Bytes::from_static(b"second"));
        assert!(s.fetch_pending_message(3).is_none());
    }

    #[test]
    fn test_evict_stale_pending() {
        let s = session_at(1, Duration::ZERO);
        s.add_pending_message(1, publish(b"a"));
        s.add_pending_message(2, publish(b"b"));

        let now = Instant::now();
        assert!(s.evict_stale_pending(Duration::from_secs(30), now).is_empty());

        let later = now + Duration::from_secs(31);
        let mut evicted = s.evict_stale_pending(Duration::from_secs(30), later);
        evicted.sort_unstable();
        assert_eq!(evicted, vec![1, 2]);
        assert_eq!(s.pending_count(), 0);
    }

    #[test]
    fn test_keep_alive_expiry() {
        let s = session_at(1, Duration::from_secs(10));
        let now = Instant::now();
        assert!(!s.is_expired(now + Duration::from_secs(14)));
        assert!(s.is_expired(now + Duration::from_secs(16)));

        let forever = session_at(2, Duration::ZERO);
        assert!(!forever.is_expired(now + Duration::from_secs(3600)));
    }

    #[test]
    fn test_msg_id_skips_zero() {
        let s = session_at(1, Duration::ZERO);
        s.state.lock().next_msg_id = u16::MAX;
        assert_eq!(s.next_msg_id(), u16::MAX);
        assert_eq!(s.next_msg_id(), 1);
    }

    #[test]
    fn test_filters() {
        let s = session_at(1, Duration::ZERO);
        s.add_filter("a/+");
        s.add_filter("a/+");
        assert_eq!(s.filters(), vec!["a/+".to_string()]);
        assert!(s.remove_filter("a/+"));
        assert!(!s.remove_filter("a/+"));
    }

    #[tokio::test]
    async fn test_write_encodes_and_limits() {
        let transport = sink();
        let addr = SocketAddr::from(([127, 0, 0, 1], 9));
        let s = ClientSession::new("d".into(), addr, transport.clone(), Duration::ZERO, 16);

        let n = s.write(&Message::Pingresp).await.expect("write");
        assert_eq!(n, 2);
        assert_eq!(transport.sent.lock()[0], (addr, vec![2, 0x17]));

        let big = Message::Publish(publish(&[0u8; 32]));
        assert!(matches!(
            s.write(&big).await,
            Err(GatewayError::Oversized { size: 39, max: 16, .. })
        ));
        assert_eq!(transport.sent.lock().len(), 1);
    }

    #[test]
    fn test_registry() {
        let registry = ClientRegistry::new();
        let first = session_at(1, Duration::ZERO);
        let addr = first.addr();
        assert!(registry.add_client(first.clone()).is_none());
        assert!(Arc::ptr_eq(&registry.get_client(addr).expect("client"), &first));

        let second = session_at(1, Duration::ZERO);
        let replaced = registry.add_client(second.clone()).expect("replaced");
        assert!(Arc::ptr_eq(&replaced, &first));
        assert!(!registry.is_current(&first));
        assert!(registry.is_current(&second));
        assert!(!registry.remove_if_current(&first));
        assert_eq!(registry.len(), 1);
        assert!(registry.remove_if_current(&second));

        assert!(matches!(
            registry.get_client(addr),
            Err(GatewayError::UnknownClient(a)) if a == addr
        ));
    }

    #[test]
    fn test_registry_expired_and_drain() {
        let registry = ClientRegistry::new();
        registry.add_client(session_at(1, Duration::from_secs(1)));
        registry.add_client(session_at(2, Duration::ZERO));

        let expired = registry.expired(Instant::now() + Duration::from_secs(5));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].client_id(), "dev-1");

        assert_eq!(registry.drain().len(), 2);
        assert!(registry.is_empty());
    }
}
