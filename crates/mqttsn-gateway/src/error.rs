// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Gateway error taxonomy.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::config::ConfigError;
use crate::protocol::DecodeError;
use crate::topics::TopicError;
use crate::upstream::UpstreamError;

/// Errors raised while handling a client message or running the gateway.
///
/// Handler errors never stop the gateway: the dispatcher turns them into
/// observability records and drops the message.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("invalid client id: {0:?}")]
    InvalidClientId(String),

    #[error("no session for {0}")]
    UnknownClient(SocketAddr),

    #[error("unknown topic id {0}")]
    UnknownTopicId(u16),

    #[error("topic error: {0}")]
    Topic(#[from] TopicError),

    #[error("upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("write to {addr} failed: {source}")]
    Write {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("{size}-byte message to {addr} exceeds the {max}-byte limit")]
    Oversized {
        addr: SocketAddr,
        size: usize,
        max: usize,
    },

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, GatewayError>;
