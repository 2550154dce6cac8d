//! Port drivers
//!
//! Real [`Port`] implementations plus the receive loops that feed their
//! frames into a [`Switch`]:
//! - AF_PACKET: raw socket on a host interface
//! - VXLAN: UDP tunnel to a remote VTEP

mod af_packet;
mod vxlan;

pub use af_packet::AfPacketPort;
pub use vxlan::VxlanPort;

use crate::config::{PortConfig, PortKind};
use crate::dataplane::{Port, Switch};
use crate::Result;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// Open the port described by `config`, attach it to its network and
/// spawn its receive loop
pub async fn spawn_port(config: &PortConfig, switch: Arc<Switch>) -> Result<JoinHandle<()>> {
    let task = match &config.kind {
        PortKind::AfPacket { interface } => {
            let port = Arc::new(AfPacketPort::bind(&config.name, interface, config.mtu())?);
            switch.attach_port(port.clone() as Arc<dyn Port>, config.network)?;
            tokio::spawn(port.run(switch))
        }
        PortKind::Vxlan { bind, remote } => {
            let port = Arc::new(
                VxlanPort::bind(&config.name, config.network, *bind, *remote, config.mtu()).await?,
            );
            switch.attach_port(port.clone() as Arc<dyn Port>, config.network)?;
            tokio::spawn(port.run(switch))
        }
    };
    info!(port = %config.name, network = config.network, kind = ?config.kind, "port started");
    Ok(task)
}
