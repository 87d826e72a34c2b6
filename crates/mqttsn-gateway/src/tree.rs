// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Subscription tree: topic filters with `+` / `#` wildcards -> subscribers.
//
// One trie node per filter level. Literal levels live in `children`, the
// single-level wildcard in `plus`, the multi-level wildcard in `hash`. A `#`
// node is always a leaf. Subscribers are keyed by client endpoint so a
// (filter, session) pair is stored once.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::topics::TopicError;

const LEVEL_SEPARATOR: char = '/';
const SINGLE_LEVEL: &str = "+";
const MULTI_LEVEL: &str = "#";

/// True if `topic` contains a `+` or `#` wildcard character.
pub fn contains_wildcard(topic: &str) -> bool {
    topic.contains(|c: char| c == '+' || c == '#')
}

/// Reject empty filters, `#` anywhere but last, and wildcards sharing a
/// level with other characters.
pub fn validate_filter(filter: &str) -> Result<(), TopicError> {
    if filter.is_empty() {
        return Err(TopicError::InvalidFilter(filter.to_string()));
    }
    let levels: Vec<&str> = filter.split(LEVEL_SEPARATOR).collect();
    for (i, level) in levels.iter().enumerate() {
        let bad = match *level {
            SINGLE_LEVEL => false,
            MULTI_LEVEL => i + 1 != levels.len(),
            other => contains_wildcard(other),
        };
        if bad {
            return Err(TopicError::InvalidFilter(filter.to_string()));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Trie node
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Node<T> {
    children: HashMap<String, Node<T>>,
    plus: Option<Box<Node<T>>>,
    hash: Option<Box<Node<T>>>,
    subscribers: HashMap<SocketAddr, Arc<T>>,
}

impl<T> Node<T> {
    fn new() -> Self {
        Self {
            children: HashMap::new(),
            plus: None,
            hash: None,
            subscribers: HashMap::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
            && self.children.is_empty()
            && self.plus.is_none()
            && self.hash.is_none()
    }

    fn has_descendants(&self) -> bool {
        !self.children.is_empty() || self.plus.is_some() || self.hash.is_some()
    }

    fn child_mut(&mut self, level: &str) -> &mut Node<T> {
        match level {
            SINGLE_LEVEL => self.plus.get_or_insert_with(|| Box::new(Node::new())),
            MULTI_LEVEL => self.hash.get_or_insert_with(|| Box::new(Node::new())),
            other => self.children.entry(other.to_string()).or_insert_with(Node::new),
        }
    }

    fn collect(&self, topic: &str, levels: &[&str], out: &mut Matches<T>) {
        // `#` also matches the parent level itself ("a/#" matches "a").
        if let Some(hash) = &self.hash {
            if hash.has_descendants() {
                out.skipped.push(TopicError::Match(topic.to_string()));
            } else {
                out.extend(&hash.subscribers);
            }
        }
        match levels.split_first() {
            None => out.extend(&self.subscribers),
            Some((head, tail)) => {
                if let Some(child) = self.children.get(*head) {
                    child.collect(topic, tail, out);
                }
                if let Some(plus) = &self.plus {
                    plus.collect(topic, tail, out);
                }
            }
        }
    }

    /// Remove `key` at the node for `levels`, pruning empty nodes on the way
    /// back. Returns true when that node lost its last subscriber.
    fn remove_at(&mut self, levels: &[&str], key: &SocketAddr) -> bool {
        let Some((head, tail)) = levels.split_first() else {
            return self.subscribers.remove(key).is_some() && self.subscribers.is_empty();
        };
        match *head {
            SINGLE_LEVEL => {
                let Some(plus) = self.plus.as_mut() else {
                    return false;
                };
                let emptied = plus.remove_at(tail, key);
                if plus.is_empty() {
                    self.plus = None;
                }
                emptied
            }
            MULTI_LEVEL => {
                let Some(hash) = self.hash.as_mut() else {
                    return false;
                };
                let emptied = hash.remove_at(tail, key);
                if hash.is_empty() {
                    self.hash = None;
                }
                emptied
            }
            other => {
                let Some(child) = self.children.get_mut(other) else {
                    return false;
                };
                let emptied = child.remove_at(tail, key);
                if child.is_empty() {
                    self.children.remove(other);
                }
                emptied
            }
        }
    }

    fn list_filters(&self, path: &mut Vec<String>, out: &mut Vec<String>) {
        if !self.subscribers.is_empty() {
            out.push(path.join("/"));
        }
        for (level, child) in &self.children {
            path.push(level.clone());
            child.list_filters(path, out);
            path.pop();
        }
        for (level, child) in [(SINGLE_LEVEL, &self.plus), (MULTI_LEVEL, &self.hash)] {
            if let Some(child) = child {
                path.push(level.to_string());
                child.list_filters(path, out);
                path.pop();
            }
        }
    }

    fn find(&self, levels: &[&str]) -> Option<&Node<T>> {
        let Some((head, tail)) = levels.split_first() else {
            return Some(self);
        };
        let next = match *head {
            SINGLE_LEVEL => self.plus.as_deref(),
            MULTI_LEVEL => self.hash.as_deref(),
            other => self.children.get(other),
        };
        next?.find(tail)
    }

    fn count_filters(&self) -> usize {
        let own = usize::from(!self.subscribers.is_empty());
        own + self.children.values().map(Node::count_filters).sum::<usize>()
            + self.plus.as_ref().map_or(0, |n| n.count_filters())
            + self.hash.as_ref().map_or(0, |n| n.count_filters())
    }
}

/// Subscribers matching one concrete topic.
#[derive(Debug)]
pub struct Matches<T> {
    found: HashMap<SocketAddr, Arc<T>>,
    /// Corrupt filter entries passed over while matching.
    pub skipped: Vec<TopicError>,
}

impl<T> Matches<T> {
    fn new() -> Self {
        Self {
            found: HashMap::new(),
            skipped: Vec::new(),
        }
    }

    fn extend(&mut self, from: &HashMap<SocketAddr, Arc<T>>) {
        for (key, sub) in from {
            self.found.entry(*key).or_insert_with(|| Arc::clone(sub));
        }
    }

    /// Matched subscribers, each at most once.
    pub fn subscribers(self) -> Vec<Arc<T>> {
        self.found.into_values().collect()
    }

    pub fn len(&self) -> usize {
        self.found.len()
    }

    pub fn is_empty(&self) -> bool {
        self.found.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Subscription tree
// ---------------------------------------------------------------------------

/// Filter index shared by all handlers. Matching takes the read lock,
/// subscription changes take the write lock.
#[derive(Debug)]
pub struct SubscriptionTree<T> {
    root: RwLock<Node<T>>,
}

impl<T> Default for SubscriptionTree<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SubscriptionTree<T> {
    pub fn new() -> Self {
        Self {
            root: RwLock::new(Node::new()),
        }
    }

    /// Subscribe `subscriber` (keyed by `key`) to `filter`.
    ///
    /// Returns true iff this call created the filter entry, i.e. the filter
    /// had no subscribers before. Re-subscribing is idempotent.
    pub fn add_subscription(
        &self,
        key: SocketAddr,
        subscriber: Arc<T>,
        filter: &str,
    ) -> Result<bool, TopicError> {
        validate_filter(filter)?;
        let mut root = self.root.write();
        let mut node = &mut *root;
        for level in filter.split(LEVEL_SEPARATOR) {
            node = node.child_mut(level);
        }
        let created = node.subscribers.is_empty();
        node.subscribers.insert(key, subscriber);
        Ok(created)
    }

    /// Every subscriber of every filter matching the concrete `topic`. A
    /// `#` entry with descendants is skipped and reported in
    /// [`Matches::skipped`]; the other filters still match.
    pub fn subscribers_of(&self, topic: &str) -> Matches<T> {
        let levels: Vec<&str> = topic.split(LEVEL_SEPARATOR).collect();
        let mut matches = Matches::new();
        self.root.read().collect(topic, &levels, &mut matches);
        matches
    }

    /// Drop one (filter, subscriber) pair. Returns true when the filter lost
    /// its last subscriber and was pruned.
    pub fn remove_subscription(&self, key: &SocketAddr, filter: &str) -> bool {
        let levels: Vec<&str> = filter.split(LEVEL_SEPARATOR).collect();
        self.root.write().remove_at(&levels, key)
    }

    /// Filters with at least one subscriber.
    pub fn filters(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.root.read().list_filters(&mut Vec::new(), &mut out);
        out
    }

    /// True if `filter` has at least one subscriber.
    pub fn contains_filter(&self, filter: &str) -> bool {
        let levels: Vec<&str> = filter.split(LEVEL_SEPARATOR).collect();
        self.root
            .read()
            .find(&levels)
            .is_some_and(|node| !node.subscribers.is_empty())
    }

    /// Number of filters with at least one subscriber.
    pub fn filter_count(&self) -> usize {
        self.root.read().count_filters()
    }
    /// Hang a subscriber under the `#` of `prefix/#`, which well-formed
    /// filters never do.
    #[cfg(test)]
    pub(crate) fn graft_under_multi_level(&self, prefix: &str, key: SocketAddr, subscriber: Arc<T>) {
        let mut root = self.root.write();
        let mut node = &mut *root;
        for level in prefix.split(LEVEL_SEPARATOR) {
            node = node.child_mut(level);
        }
        node.child_mut(MULTI_LEVEL)
            .child_mut("x")
            .subscribers
            .insert(key, subscriber);
    }
}
