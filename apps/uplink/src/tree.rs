//! The state tree the server's changes are applied to. The communication
//! layer only needs the narrow surface below.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Map, Value};

pub type NodeId = i64;

pub trait StateTree: Send {
    /// Applies a batch of changes and returns the nodes that were touched.
    fn process_changes(&mut self, changes: &[Value]) -> Vec<NodeId>;

    /// Runs once per touched node after the whole message has been applied.
    fn after_server_update(&mut self, node: NodeId);

    /// Invocations targeting unregistered nodes are stale and never sent.
    fn is_node_registered(&self, node: NodeId) -> bool;

    fn import_constants(&mut self, constants: &Map<String, Value>);
}

impl<T: StateTree + ?Sized> StateTree for Box<T> {
    fn process_changes(&mut self, changes: &[Value]) -> Vec<NodeId> {
        (**self).process_changes(changes)
    }

    fn after_server_update(&mut self, node: NodeId) {
        (**self).after_server_update(node)
    }

    fn is_node_registered(&self, node: NodeId) -> bool {
        (**self).is_node_registered(node)
    }

    fn import_constants(&mut self, constants: &Map<String, Value>) {
        (**self).import_constants(constants)
    }
}

/// What a [`RecordingTree`] has seen, shared with whoever holds the log.
#[derive(Debug, Default)]
pub struct TreeLog {
    pub changes: Vec<Value>,
    pub constants: Map<String, Value>,
    pub updated: Vec<NodeId>,
    pub unregistered: HashSet<NodeId>,
}

/// A tree that keeps no model and only records what it was asked to do.
/// Touched nodes are read from each change's `node` field.
#[derive(Clone, Debug, Default)]
pub struct RecordingTree {
    log: Arc<Mutex<TreeLog>>,
}

impl RecordingTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&self) -> Arc<Mutex<TreeLog>> {
        self.log.clone()
    }

    pub fn unregister(&self, node: NodeId) {
        self.log.lock().unregistered.insert(node);
    }
}

impl StateTree for RecordingTree {
    fn process_changes(&mut self, changes: &[Value]) -> Vec<NodeId> {
        let mut log = self.log.lock();
        log.changes.extend(changes.iter().cloned());
        let mut touched: Vec<NodeId> = changes
            .iter()
            .filter_map(|change| change.get("node").and_then(Value::as_i64))
            .collect();
        touched.sort_unstable();
        touched.dedup();
        touched
    }

    fn after_server_update(&mut self, node: NodeId) {
        self.log.lock().updated.push(node);
    }

    fn is_node_registered(&self, node: NodeId) -> bool {
        !self.log.lock().unregistered.contains(&node)
    }

    fn import_constants(&mut self, constants: &Map<String, Value>) {
        let mut log = self.log.lock();
        for (key, value) in constants {
            log.constants.insert(key.clone(), value.clone());
        }
    }
}
