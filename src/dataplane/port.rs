//! Port abstraction
//!
//! A port is a named transmit endpoint. Frames arriving on it are handed to
//! [`Switch::on_frame_received`](super::Switch::on_frame_received) by
//! whatever drives its receive side.

use crate::Result;

/// Default Ethernet MTU
pub const DEFAULT_MTU: usize = 1500;

pub trait Port: Send + Sync {
    /// Name, unique within a switch
    fn name(&self) -> &str;

    /// Send one Ethernet frame
    fn transmit(&self, frame: &[u8]) -> Result<()>;

    fn mtu(&self) -> usize {
        DEFAULT_MTU
    }
}
