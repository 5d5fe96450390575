//! TCP State Components
//!
//! A connection PCB is split into four disjoint parts:
//! 1. Connection Management - state machine position, 4-tuple, idle timers
//! 2. Reliable Ordered Delivery - sequence numbers, queues, retransmission
//! 3. Flow Control - receive and send windows, persist timer
//! 4. Congestion Control - congestion window and slow start threshold

mod connection_mgmt;
mod rod;
mod flow_control;
mod congestion_control;

pub use connection_mgmt::{ip_addr_overlaps, ConnectionManagementState, IpAddrType, PcbFlags, SocketOptions};
pub use rod::ReliableOrderedDeliveryState;
pub use flow_control::FlowControlState;
pub use congestion_control::CongestionControlState;
