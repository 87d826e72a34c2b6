// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Topic registry: bidirectional topic name <-> 16-bit topic id mapping.
//
// Ids are gateway-wide, allocated on first sight of a name and never
// reclaimed. Id 0 is reserved (wildcard placeholder in SUBACK).

use std::collections::HashMap;

use parking_lot::RwLock;
use thiserror::Error;
use tracing::debug;

/// Errors from the topic registry and the subscription tree.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopicError {
    #[error("topic id space exhausted")]
    Exhausted,

    #[error("invalid topic filter: {0:?}")]
    InvalidFilter(String),

    #[error("subscription tree corrupt while matching {0:?}")]
    Match(String),
}

#[derive(Debug)]
struct Inner {
    by_name: HashMap<String, u16>,
    by_id: HashMap<u16, String>,
    next_id: u16,
}

/// Gateway-wide topic id allocator.
#[derive(Debug)]
pub struct TopicRegistry {
    inner: RwLock<Inner>,
}

impl Default for TopicRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                by_name: HashMap::new(),
                by_id: HashMap::new(),
                next_id: 1,
            }),
        }
    }

    /// Existing id for `name`, or a freshly allocated one.
    pub fn get_or_create_id(&self, name: &str) -> Result<u16, TopicError> {
        if let Some(&id) = self.inner.read().by_name.get(name) {
            return Ok(id);
        }

        let mut inner = self.inner.write();
        // Another task may have allocated between the two locks.
        if let Some(&id) = inner.by_name.get(name) {
            return Ok(id);
        }
        if inner.by_id.len() >= u16::MAX as usize {
            return Err(TopicError::Exhausted);
        }

        let mut id = inner.next_id;
        while id == 0 || inner.by_id.contains_key(&id) {
            id = id.wrapping_add(1);
        }
        inner.next_id = id.wrapping_add(1);
        inner.by_name.insert(name.to_string(), id);
        inner.by_id.insert(id, name.to_string());
        debug!("topic {:?} -> id {}", name, id);
        Ok(id)
    }

    /// Id for `name`, or 0 when the name was never seen.
    pub fn id_of(&self, name: &str) -> u16 {
        self.inner.read().by_name.get(name).copied().unwrap_or(0)
    }

    pub fn name_of(&self, id: u16) -> Option<String> {
        self.inner.read().by_id.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
