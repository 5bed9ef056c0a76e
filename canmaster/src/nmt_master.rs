//! NMT master service
//!
//! Issues NMT state commands, consumes heartbeat frames, and tracks the
//! liveness of every node on the bus. Liveness uses a two-phase sweep: on
//! each pass every ALIVE node is demoted to TO_BE_KILLED, and any node still
//! TO_BE_KILLED on the following pass is declared DEAD. A heartbeat arriving
//! between passes restores the node to ALIVE, so a node gets one full check
//! interval of grace before its dead callback fires.

use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};
use std::time::Duration;

use canmaster_common::{
    constants::cob_ids,
    nmt::{NmtCommand, NmtState},
    node_id::BROADCAST,
    CanId, CanMessage, NodeId,
};
use tokio::task::JoinHandle;

use crate::core::{CoreError, CoreHandle};

/// Liveness of a node as tracked by the heartbeat sweep
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceLiveness {
    /// A heartbeat has been seen since the last sweep
    Alive,
    /// No heartbeat since the last sweep; one more silent interval means dead
    ToBeKilled,
    /// No heartbeat for two consecutive sweeps
    Dead,
}

/// Configuration for the NMT master
#[derive(Clone, Copy, Debug)]
pub struct NmtMasterConfig {
    /// Period of the liveness sweep
    pub alive_check_interval: Duration,
}

impl Default for NmtMasterConfig {
    fn default() -> Self {
        Self {
            alive_check_interval: Duration::from_millis(1000),
        }
    }
}

type NodeCallback = Arc<dyn Fn(NodeId) + Send + Sync>;

struct NmtShared {
    handle: CoreHandle,
    liveness: Mutex<HashMap<u8, DeviceLiveness>>,
    states: Mutex<HashMap<u8, NmtState>>,
    alive_callbacks: Mutex<Vec<NodeCallback>>,
    dead_callbacks: Mutex<Vec<NodeCallback>>,
    alive_check_interval_ms: AtomicU64,
}

/// The NMT master service
///
/// Cloning is cheap and clones share all state.
#[derive(Clone)]
pub struct NmtMaster {
    shared: Arc<NmtShared>,
}

impl NmtMaster {
    pub(crate) fn new(handle: CoreHandle, config: NmtMasterConfig) -> Self {
        Self {
            shared: Arc::new(NmtShared {
                handle,
                liveness: Mutex::new(HashMap::new()),
                states: Mutex::new(HashMap::new()),
                alive_callbacks: Mutex::new(Vec::new()),
                dead_callbacks: Mutex::new(Vec::new()),
                alive_check_interval_ms: AtomicU64::new(
                    config.alive_check_interval.as_millis() as u64
                ),
            }),
        }
    }

    /// Send an NMT command to a single node
    pub fn send_nmt_command(&self, node: NodeId, command: NmtCommand) -> Result<(), CoreError> {
        self.send_raw_command(node.raw(), command)
    }

    /// Send an NMT command to all nodes at once
    pub fn broadcast_nmt_command(&self, command: NmtCommand) -> Result<(), CoreError> {
        self.send_raw_command(BROADCAST, command)
    }

    fn send_raw_command(&self, node: u8, command: NmtCommand) -> Result<(), CoreError> {
        let frame = CanMessage::new(CanId::std(cob_ids::NMT), &command.to_bytes(node));
        self.shared.handle.send(frame)
    }

    /// Command a node into the Operational state
    pub fn start_node(&self, node: NodeId) -> Result<(), CoreError> {
        self.send_nmt_command(node, NmtCommand::StartNode)
    }

    /// Command a node into the Stopped state
    pub fn stop_node(&self, node: NodeId) -> Result<(), CoreError> {
        self.send_nmt_command(node, NmtCommand::StopNode)
    }

    /// Command a node into the PreOperational state
    pub fn enter_preoperational(&self, node: NodeId) -> Result<(), CoreError> {
        self.send_nmt_command(node, NmtCommand::EnterPreOperational)
    }

    /// Command a full application reset on a node
    pub fn reset_node(&self, node: NodeId) -> Result<(), CoreError> {
        self.send_nmt_command(node, NmtCommand::ResetNode)
    }

    /// Command a communication reset on a node
    pub fn reset_communication(&self, node: NodeId) -> Result<(), CoreError> {
        self.send_nmt_command(node, NmtCommand::ResetCommunication)
    }

    /// Reset every node on the network
    pub fn reset_all_nodes(&self) -> Result<(), CoreError> {
        self.broadcast_nmt_command(NmtCommand::ResetNode)
    }

    /// Discover nodes via the node guard protocol
    ///
    /// Sends a node-guard remote frame to every assignable node ID. Nodes
    /// answer with their state on `0x700+id`, which feeds the normal
    /// heartbeat path, so discovered nodes fire the alive callbacks.
    pub fn discover_nodes(&self) -> Result<(), CoreError> {
        for node in NodeId::all() {
            let frame = CanMessage::new_rtr(
                CanId::std(cob_ids::HEARTBEAT_BASE + node.raw() as u16),
                1,
            );
            self.shared.handle.send(frame)?;
        }
        Ok(())
    }

    /// Register a callback fired when a node is first seen, or seen again
    /// after having been declared dead
    ///
    /// Callbacks run on their own task; the receive worker never waits for
    /// them.
    pub fn register_device_alive_callback(&self, callback: impl Fn(NodeId) + Send + Sync + 'static) {
        self.shared
            .alive_callbacks
            .lock()
            .unwrap()
            .push(Arc::new(callback));
    }

    /// Register a callback fired when a node misses two consecutive sweeps
    pub fn register_device_dead_callback(&self, callback: impl Fn(NodeId) + Send + Sync + 'static) {
        self.shared
            .dead_callbacks
            .lock()
            .unwrap()
            .push(Arc::new(callback));
    }

    /// The last NMT state a node reported via heartbeat
    pub fn node_state(&self, node: NodeId) -> Option<NmtState> {
        self.shared.states.lock().unwrap().get(&node.raw()).copied()
    }

    /// The current liveness of a node, if it has ever been heard from
    pub fn liveness(&self, node: NodeId) -> Option<DeviceLiveness> {
        self.shared
            .liveness
            .lock()
            .unwrap()
            .get(&node.raw())
            .copied()
    }

    /// All nodes currently considered alive (including those pending a sweep)
    pub fn alive_nodes(&self) -> Vec<NodeId> {
        let liveness = self.shared.liveness.lock().unwrap();
        let mut nodes: Vec<NodeId> = liveness
            .iter()
            .filter(|(_, state)| **state != DeviceLiveness::Dead)
            .filter_map(|(id, _)| NodeId::new(*id).ok())
            .collect();
        nodes.sort();
        nodes
    }

    /// Change the liveness sweep period
    ///
    /// Takes effect after the sweep in progress completes.
    pub fn set_alive_check_interval(&self, interval: Duration) {
        self.shared
            .alive_check_interval_ms
            .store(interval.as_millis() as u64, Ordering::Relaxed);
    }

    /// Called by the dispatcher for every frame on `0x700 + node`
    pub(crate) fn handle_heartbeat(&self, node: u8, data: &[u8]) {
        let Some(&state_byte) = data.first() else {
            log::warn!("Empty heartbeat frame from node {node}");
            return;
        };
        match NmtState::try_from(state_byte) {
            Ok(state) => {
                self.shared.states.lock().unwrap().insert(node, state);
                log::debug!("Heartbeat from node {node}: {state}");
            }
            Err(_) => {
                log::warn!("Heartbeat from node {node} with unknown state 0x{state_byte:02X}");
            }
        }

        let newly_alive = {
            let mut liveness = self.shared.liveness.lock().unwrap();
            let previous = liveness.insert(node, DeviceLiveness::Alive);
            // A TO_BE_KILLED node never died, so returning to ALIVE is not an
            // event worth announcing
            !matches!(
                previous,
                Some(DeviceLiveness::Alive) | Some(DeviceLiveness::ToBeKilled)
            )
        };

        if newly_alive {
            if let Ok(node) = NodeId::new(node) {
                self.shared.fire(&self.shared.alive_callbacks, node);
            }
        }
    }

    /// Spawn the periodic liveness sweep
    pub(crate) fn spawn_sweep_task(&self) -> JoinHandle<()> {
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let stop = shared.handle.stop_signal();
            loop {
                let interval = shared.alive_check_interval_ms.load(Ordering::Relaxed);
                tokio::select! {
                    _ = stop.wait() => break,
                    _ = tokio::time::sleep(Duration::from_millis(interval)) => {}
                }
                shared.sweep();
            }
            log::debug!("Liveness sweep exited");
        })
    }
}

impl NmtShared {
    /// One pass of the two-phase liveness check
    fn sweep(&self) {
        let mut newly_dead = Vec::new();
        {
            let mut liveness = self.liveness.lock().unwrap();
            for (node, state) in liveness.iter_mut() {
                match state {
                    DeviceLiveness::Alive => *state = DeviceLiveness::ToBeKilled,
                    DeviceLiveness::ToBeKilled => {
                        *state = DeviceLiveness::Dead;
                        newly_dead.push(*node);
                    }
                    DeviceLiveness::Dead => {}
                }
            }
        }
        for node in newly_dead {
            log::info!("Node {node} missed two heartbeat check intervals, declaring dead");
            if let Ok(node) = NodeId::new(node) {
                self.fire(&self.dead_callbacks, node);
            }
        }
    }

    /// Invoke callbacks asynchronously, one task per callback
    fn fire(&self, callbacks: &Mutex<Vec<NodeCallback>>, node: NodeId) {
        let callbacks: Vec<NodeCallback> = callbacks.lock().unwrap().to_vec();
        for cb in callbacks {
            tokio::spawn(async move { cb(node) });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared_for_test() -> Arc<NmtShared> {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let handle = crate::core::CoreHandle::detached(tx);
        NmtMaster::new(handle, NmtMasterConfig::default()).shared
    }

    #[tokio::test]
    async fn test_two_phase_sweep() {
        let shared = shared_for_test();
        shared
            .liveness
            .lock()
            .unwrap()
            .insert(5, DeviceLiveness::Alive);

        shared.sweep();
        assert_eq!(
            Some(&DeviceLiveness::ToBeKilled),
            shared.liveness.lock().unwrap().get(&5)
        );

        shared.sweep();
        assert_eq!(
            Some(&DeviceLiveness::Dead),
            shared.liveness.lock().unwrap().get(&5)
        );

        // Idempotent once dead
        shared.sweep();
        assert_eq!(
            Some(&DeviceLiveness::Dead),
            shared.liveness.lock().unwrap().get(&5)
        );
    }

    #[tokio::test]
    async fn test_heartbeat_restores_grace() {
        let shared = shared_for_test();
        let master = NmtMaster { shared };

        master.handle_heartbeat(7, &[0x05]);
        master.shared.sweep();
        // Node answered between sweeps: back to ALIVE, no dead transition
        master.handle_heartbeat(7, &[0x05]);
        assert_eq!(
            Some(&DeviceLiveness::Alive),
            master.shared.liveness.lock().unwrap().get(&7)
        );
    }

    #[tokio::test]
    async fn test_heartbeat_records_state() {
        let shared = shared_for_test();
        let master = NmtMaster { shared };
        master.handle_heartbeat(3, &[0x7F]);
        assert_eq!(
            Some(NmtState::PreOperational),
            master.node_state(NodeId::new(3).unwrap())
        );
    }
}
