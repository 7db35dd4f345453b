//! Process-wide table of live nodes.
//!
//! Background tasks never hold a node directly. They carry its
//! [`NodeHandle`] and resolve it here, so a destroyed node stops receiving
//! callbacks as soon as it is removed.

use crate::node::{Node, NodeShared};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Opaque, process-unique identifier of a live node.
pub type NodeHandle = u64;

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

static LIVE_NODES: Lazy<RwLock<HashMap<NodeHandle, Weak<NodeShared>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

pub(crate) fn next_handle() -> NodeHandle {
    NEXT_HANDLE.fetch_add(1, Ordering::Relaxed)
}

pub(crate) fn insert(handle: NodeHandle, shared: &Arc<NodeShared>) {
    LIVE_NODES
        .write()
        .unwrap()
        .insert(handle, Arc::downgrade(shared));
}

pub(crate) fn remove(handle: NodeHandle) -> bool {
    LIVE_NODES.write().unwrap().remove(&handle).is_some()
}

/// Resolves `handle` to its node, if it is still registered and alive.
pub fn lookup(handle: NodeHandle) -> Option<Node> {
    LIVE_NODES
        .read()
        .unwrap()
        .get(&handle)
        .and_then(Weak::upgrade)
        .map(Node::from_shared)
}

pub fn is_live(handle: NodeHandle) -> bool {
    lookup(handle).is_some()
}
