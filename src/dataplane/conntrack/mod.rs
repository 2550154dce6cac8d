//! Connection tracking for the switch's own L4 endpoints
//!
//! Each network owns one [`Conntrack`]: TCP/UDP listeners bound to its
//! local addresses and the TCP flows opened against them. The [`l4`]
//! functions drive those flows from inbound segments and timers.

pub mod entry;
pub mod l4;
pub mod queue;
pub mod table;

pub use entry::{FlowKey, TcpEntry, TcpState};
pub use l4::L4Input;
pub use queue::{QueueViolation, ReceiveQueue, Segment, SendQueue};
pub use table::{Conntrack, TcpListener, UdpListener};
