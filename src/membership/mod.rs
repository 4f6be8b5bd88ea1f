//! Membership & Discovery Module
//!
//! Gossip-based membership (SWIM-like) backing the networked transport.
//! Nodes exchange their member lists over UDP, detect failures and elect the
//! coordinator from the alive view.
//!
//! ## Core Mechanisms
//! - **Gossip**: periodic Ping/Ack with the full member list.
//! - **Failure Detection**: "Suspect" -> "Dead" transitions on silence. Suspected
//!   members stay in the view but worker RPCs to them report `Suspected`.
//! - **Incarnation Numbers**: a node refutes a false suspicion by bumping its incarnation.
//! - **Election**: the smallest alive node id is the coordinator.
//! - **Grid Payloads**: `GossipMessage::Grid` carries grid broadcasts on the same
//!   socket; they surface through the grid inbox.

pub mod service;
pub mod types;
