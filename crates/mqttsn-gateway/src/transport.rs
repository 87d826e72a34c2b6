// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Datagram transport between the gateway and its MQTT-SN clients.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::UdpSocket;

// ---------------------------------------------------------------------------
// Transport trait
// ---------------------------------------------------------------------------

/// Abstraction over the datagram socket shared by every client session.
///
/// Both methods take `&self` so one handle can be used by the receive loop
/// and by any number of concurrent senders.
#[async_trait]
pub trait DatagramTransport: Send + Sync {
    /// Receive one datagram into `buf`. Returns (bytes_read, sender).
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    /// Send one datagram to `addr`.
    async fn send_to(&self, data: &[u8], addr: SocketAddr) -> io::Result<()>;
}

// ---------------------------------------------------------------------------
// UDP transport
// ---------------------------------------------------------------------------

/// UDP transport on a tokio socket.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

#[async_trait]
impl DatagramTransport for UdpTransport {
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }

    async fn send_to(&self, data: &[u8], addr: SocketAddr) -> io::Result<()> {
        let sent = self.socket.send_to(data, addr).await?;
        if sent != data.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short datagram write ({} of {} bytes)", sent, data.len()),
            ));
        }
        Ok(())
    }
}
