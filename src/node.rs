//! Per-node state and the node registry.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::message::SerialMessage;

/// Initialization progress of a node.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NodeStage {
    /// The node is known to exist, nothing has been queried yet.
    Empty,
    /// Protocol information (listening, device class) is being queried.
    ProtocolInfo,
    /// The node information frame is being queried.
    NodeInfo,
    /// The node has been fully interviewed.
    Done,
    /// The node stalled during initialization and was declared dead.
    Dead,
}

impl NodeStage {
    /// Returns whether this stage ends the node's lifecycle.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Dead)
    }
}

/// State the driver keeps about a single node.
#[derive(Debug)]
pub struct Node {
    /// Node ID, `1..=232`.
    pub id: u8,
    /// Home ID of the network this node belongs to.
    pub home_id: u32,
    /// Whether the node is permanently listening.
    pub listening: bool,
    /// Whether the node wakes up periodically for beams (FLiRS).
    pub frequently_listening: bool,
    /// Whether a non-listening node is currently awake.
    pub awake: bool,
    /// Whether the protocol info response for this node has been seen. The
    /// listening flags mean nothing before it arrives.
    pub protocol_info_known: bool,
    /// Basic device class byte.
    pub basic_class: u8,
    /// Generic device class byte.
    pub generic_class: u8,
    /// Specific device class byte.
    pub specific_class: u8,
    /// Command classes announced in the node information frame.
    pub command_classes: BTreeSet<u8>,
    /// Neighboring node IDs from the controller's routing table.
    pub neighbors: Vec<u8>,
    /// Number of messages sent to this node.
    pub send_count: u32,
    /// Unacknowledged deliveries reported by the stick since the last
    /// successful send.
    pub failure_count: u32,
    stage: NodeStage,
    stage_entered: Instant,
    wake_up_queue: VecDeque<SerialMessage>,
}

impl Node {
    /// Creates a new node in the [`NodeStage::Empty`] stage.
    #[must_use]
    pub fn new(id: u8) -> Self {
        Self {
            id,
            home_id: 0,
            listening: false,
            frequently_listening: false,
            awake: false,
            protocol_info_known: false,
            basic_class: 0,
            generic_class: 0,
            specific_class: 0,
            command_classes: BTreeSet::new(),
            neighbors: Vec::new(),
            send_count: 0,
            failure_count: 0,
            stage: NodeStage::Empty,
            stage_entered: Instant::now(),
            wake_up_queue: VecDeque::new(),
        }
    }

    /// Returns the current initialization stage.
    #[must_use]
    pub const fn stage(&self) -> NodeStage {
        self.stage
    }

    /// Advances the node to `stage`, restarting the stage timer.
    pub fn set_stage(&mut self, stage: NodeStage) {
        if self.stage != stage {
            log::debug!("Node {}: stage {:?} -> {:?}", self.id, self.stage, stage);
        }

        self.stage = stage;
        self.stage_entered = Instant::now();
    }

    /// Returns how long the node has been in its current stage.
    #[must_use]
    pub fn stage_age(&self) -> Duration {
        self.stage_entered.elapsed()
    }

    /// Returns whether the node counts as complete for initialization and
    /// dead-node purposes.
    ///
    /// Battery-operated nodes cannot be interviewed on the driver's
    /// schedule, so once a node is known to be neither listening nor
    /// frequently listening it is complete as-is.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.stage.is_terminal()
            || (self.protocol_info_known && !self.listening && !self.frequently_listening)
    }

    /// Returns whether messages to this node must wait for a wake-up.
    ///
    /// Nodes whose protocol info is still unknown are treated as awake.
    #[must_use]
    pub const fn is_asleep(&self) -> bool {
        self.protocol_info_known
            && !self.listening
            && !self.frequently_listening
            && !self.awake
    }

    /// Appends a message to the wake-up queue.
    pub fn defer_until_wake_up(&mut self, message: SerialMessage) {
        log::debug!(
            "Node {} is asleep. Deferring {:?} until wake-up.",
            self.id,
            message.class
        );
        self.wake_up_queue.push_back(message);
    }

    /// Removes and returns all deferred messages in submission order.
    pub fn drain_wake_up_queue(&mut self) -> Vec<SerialMessage> {
        self.wake_up_queue.drain(..).collect()
    }

    /// Returns the number of deferred messages.
    #[must_use]
    pub fn wake_up_queue_len(&self) -> usize {
        self.wake_up_queue.len()
    }
}

/// All nodes of the current network.
///
/// Nodes are created when the init data response arrives and live until the
/// controller is closed. Lookups are safe from any thread.
#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: Mutex<BTreeMap<u8, Node>>,
}

impl NodeRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node unless one with the same ID already exists.
    ///
    /// Returns whether the node was added.
    pub fn add(&self, node: Node) -> bool {
        let mut nodes = self.nodes.lock().expect("node registry lock poisoned");

        if nodes.contains_key(&node.id) {
            return false;
        }

        nodes.insert(node.id, node);
        true
    }

    /// Returns whether a node with the given ID exists.
    pub fn contains(&self, node_id: u8) -> bool {
        self.nodes
            .lock()
            .expect("node registry lock poisoned")
            .contains_key(&node_id)
    }

    /// Removes a node, returning whether it existed.
    pub fn remove(&self, node_id: u8) -> bool {
        self.nodes
            .lock()
            .expect("node registry lock poisoned")
            .remove(&node_id)
            .is_some()
    }

    /// Returns the number of known nodes.
    pub fn len(&self) -> usize {
        self.nodes.lock().expect("node registry lock poisoned").len()
    }

    /// Returns whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the IDs of all known nodes.
    pub fn node_ids(&self) -> Vec<u8> {
        self.nodes
            .lock()
            .expect("node registry lock poisoned")
            .keys()
            .copied()
            .collect()
    }

    /// Runs `f` against the node with the given ID, if it exists.
    pub fn with_node<R>(&self, node_id: u8, f: impl FnOnce(&mut Node) -> R) -> Option<R> {
        self.nodes
            .lock()
            .expect("node registry lock poisoned")
            .get_mut(&node_id)
            .map(f)
    }

    /// Runs `f` against every node.
    pub fn each_node(&self, mut f: impl FnMut(&mut Node)) {
        for node in self
            .nodes
            .lock()
            .expect("node registry lock poisoned")
            .values_mut()
        {
            f(node);
        }
    }

    /// Returns whether the given node is asleep. Unknown nodes count as
    /// awake.
    pub fn is_asleep(&self, node_id: u8) -> bool {
        self.with_node(node_id, |node| node.is_asleep())
            .unwrap_or(false)
    }

    /// Returns whether every known node is complete.
    ///
    /// An empty registry is not complete: initialization has not produced
    /// the node list yet.
    pub fn all_complete(&self) -> bool {
        let nodes = self.nodes.lock().expect("node registry lock poisoned");
        !nodes.is_empty() && nodes.values().all(Node::is_complete)
    }

    /// Removes all nodes.
    pub fn clear(&self) {
        self.nodes
            .lock()
            .expect("node registry lock poisoned")
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::{Node, NodeRegistry, NodeStage};
    use crate::message::{MessageClass, SerialMessage};

    #[test]
    fn test_listening_node_is_incomplete_until_terminal() {
        let mut node = Node::new(2);
        node.listening = true;
        assert!(!node.is_complete());

        node.set_stage(NodeStage::Done);
        assert!(node.is_complete());

        node.set_stage(NodeStage::Dead);
        assert!(node.is_complete());
    }

    #[test]
    fn test_battery_node_is_complete_and_asleep() {
        let mut node = Node::new(7);
        assert!(!node.is_complete());
        assert!(!node.is_asleep());

        // Only a seen protocol info makes the listening flags meaningful.
        node.protocol_info_known = true;
        assert!(node.is_complete());
        assert!(node.is_asleep());
    }

    #[test]
    fn test_awake_battery_node_is_not_asleep() {
        let mut node = Node::new(7);
        node.protocol_info_known = true;
        node.awake = true;
        assert!(!node.is_asleep());
    }

    #[test]
    fn test_flirs_node_is_never_asleep() {
        let mut node = Node::new(3);
        node.frequently_listening = true;
        assert!(!node.is_asleep());
        assert!(!node.is_complete());
    }

    #[test]
    fn test_wake_up_queue_preserves_order() {
        let mut node = Node::new(7);
        node.defer_until_wake_up(SerialMessage::request(MessageClass::SendData, [0x01]));
        node.defer_until_wake_up(SerialMessage::request(MessageClass::SendData, [0x02]));

        let drained = node.drain_wake_up_queue();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].payload, vec![0x01]);
        assert_eq!(drained[1].payload, vec![0x02]);
        assert_eq!(node.wake_up_queue_len(), 0);
    }

    #[test]
    fn test_registry_add_is_idempotent() {
        let registry = NodeRegistry::new();
        assert!(registry.add(Node::new(5)));
        assert!(!registry.add(Node::new(5)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_empty_registry_is_not_complete() {
        let registry = NodeRegistry::new();
        assert!(!registry.all_complete());
    }

    #[test]
    fn test_all_complete() {
        let registry = NodeRegistry::new();

        let mut listening = Node::new(1);
        listening.listening = true;
        listening.set_stage(NodeStage::Done);
        registry.add(listening);

        // Battery node: complete once its protocol info has been seen.
        let mut battery = Node::new(7);
        battery.protocol_info_known = true;
        registry.add(battery);
        assert!(registry.all_complete());

        let mut stalled = Node::new(9);
        stalled.listening = true;
        stalled.set_stage(NodeStage::NodeInfo);
        registry.add(stalled);
        assert!(!registry.all_complete());

        registry.with_node(9, |node| node.set_stage(NodeStage::Dead));
        assert!(registry.all_complete());
    }
}
