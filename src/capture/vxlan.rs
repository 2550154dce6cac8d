//! VXLAN-over-UDP port
//!
//! Frames leaving the port are wrapped in a VXLAN header carrying the VNI
//! of the network the port is attached to and sent to a single remote VTEP.
//! Datagrams with another VNI are dropped on receive.

use crate::dataplane::{Port, Switch};
use crate::protocol::vxlan::{VxlanHeader, HEADER_SIZE};
use crate::{Error, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, trace, warn};

const RECV_BUF_SIZE: usize = 65536;

pub struct VxlanPort {
    name: String,
    header: VxlanHeader,
    remote: SocketAddr,
    mtu: usize,
    socket: UdpSocket,
}

impl VxlanPort {
    pub async fn bind(
        name: &str,
        vni: u32,
        bind: SocketAddr,
        remote: SocketAddr,
        mtu: usize,
    ) -> Result<Self> {
        let header = VxlanHeader::new(vni)?;
        let socket = UdpSocket::bind(bind).await?;
        debug!(port = name, %bind, %remote, vni, "vxlan socket bound");
        Ok(Self {
            name: name.to_string(),
            header,
            remote,
            mtu,
            socket,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Decapsulate received datagrams into the switch until the socket fails
    pub async fn run(self: Arc<Self>, switch: Arc<Switch>) {
        let mut buf = vec![0u8; RECV_BUF_SIZE];
        loop {
            let (len, from) = match self.socket.recv_from(&mut buf).await {
                Ok(r) => r,
                Err(e) => {
                    warn!(port = %self.name, error = %e, "receive failed, stopping port");
                    return;
                }
            };
            match VxlanHeader::parse(&buf[..len]) {
                Ok((header, frame)) if header == self.header => {
                    switch.on_frame_received(&self.name, frame)
                }
                Ok((header, _)) => {
                    trace!(port = %self.name, %from, vni = header.vni, "foreign vni dropped")
                }
                Err(e) => trace!(port = %self.name, %from, error = %e, "bad vxlan packet"),
            }
        }
    }
}

impl Port for VxlanPort {
    fn name(&self) -> &str {
        &self.name
    }

    fn transmit(&self, frame: &[u8]) -> Result<()> {
        let packet = self.header.encapsulate(frame);
        let sent = self.socket.try_send_to(&packet, self.remote)?;
        if sent != packet.len() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "short vxlan send",
            )));
        }
        Ok(())
    }

    /// Inner MTU; the outer headers are not counted
    fn mtu(&self) -> usize {
        self.mtu
    }
}
