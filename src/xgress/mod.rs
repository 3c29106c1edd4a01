//! Local endpoints of circuits, the reliable delivery protocol between them, and the shared
//!  pipelines that serve it.

pub mod acker;
pub mod data_plane;
pub mod link_send_buffer;
pub mod message;
pub mod payload_ingester;
pub mod reorder_buffer;
pub mod retransmit_queue;
pub mod retransmitter;
pub mod tx_payload;
pub mod xgress;
