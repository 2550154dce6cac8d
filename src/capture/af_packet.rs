//! AF_PACKET raw socket port

use crate::dataplane::{Port, Switch};
use crate::{Error, Result};
use std::ffi::CString;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use tokio::io::unix::AsyncFd;
use tracing::{debug, warn};

/// Largest frame read from the socket
const RECV_BUF_SIZE: usize = 65536;

/// Port bound to a host interface in promiscuous mode
pub struct AfPacketPort {
    name: String,
    interface: String,
    mtu: usize,
    async_fd: AsyncFd<RawFd>,
    ifindex: i32,
}

impl AfPacketPort {
    /// Open a raw socket on `interface`; needs CAP_NET_RAW
    pub fn bind(name: &str, interface: &str, mtu: usize) -> Result<Self> {
        let protocol = (libc::ETH_P_ALL as u16).to_be();
        let fd = unsafe { libc::socket(libc::AF_PACKET, libc::SOCK_RAW, protocol as i32) };
        if fd < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }

        let ifindex = match Self::ifindex_of(fd, interface) {
            Ok(i) => i,
            Err(e) => {
                unsafe { libc::close(fd) };
                return Err(e);
            }
        };

        let sockaddr = libc::sockaddr_ll {
            sll_family: libc::AF_PACKET as u16,
            sll_protocol: protocol,
            sll_ifindex: ifindex,
            sll_hatype: 0,
            sll_pkttype: 0,
            sll_halen: 0,
            sll_addr: [0; 8],
        };
        let ret = unsafe {
            libc::bind(
                fd,
                &sockaddr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as u32,
            )
        };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(Error::Io(err));
        }

        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };

        if let Err(e) = Self::set_promisc(fd, ifindex, true) {
            unsafe { libc::close(fd) };
            return Err(e);
        }

        let async_fd = match AsyncFd::new(fd) {
            Ok(a) => a,
            Err(e) => {
                unsafe { libc::close(fd) };
                return Err(Error::Io(e));
            }
        };
        debug!(port = name, interface, ifindex, "af_packet socket bound");

        Ok(Self {
            name: name.to_string(),
            interface: interface.to_string(),
            mtu,
            async_fd,
            ifindex,
        })
    }

    fn ifindex_of(fd: RawFd, interface: &str) -> Result<i32> {
        let not_found = || Error::not_found("interface", interface);
        let name = CString::new(interface).map_err(|_| not_found())?;
        let name = name.as_bytes_with_nul();

        let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
        if name.len() > ifr.ifr_name.len() {
            return Err(not_found());
        }
        for (dst, src) in ifr.ifr_name.iter_mut().zip(name) {
            *dst = *src as libc::c_char;
        }

        let ret = unsafe { libc::ioctl(fd, libc::SIOCGIFINDEX, &mut ifr) };
        if ret < 0 {
            return Err(not_found());
        }
        Ok(unsafe { ifr.ifr_ifru.ifru_ifindex })
    }

    fn set_promisc(fd: RawFd, ifindex: i32, enable: bool) -> Result<()> {
        let mreq = libc::packet_mreq {
            mr_ifindex: ifindex,
            mr_type: libc::PACKET_MR_PROMISC as u16,
            mr_alen: 0,
            mr_address: [0; 8],
        };
        let optname = if enable {
            libc::PACKET_ADD_MEMBERSHIP
        } else {
            libc::PACKET_DROP_MEMBERSHIP
        };
        let ret = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_PACKET,
                optname,
                &mreq as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::packet_mreq>() as u32,
            )
        };
        if ret < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            let mut guard = self.async_fd.readable().await.map_err(Error::Io)?;
            match guard.try_io(|inner| {
                let n = unsafe { libc::recv(*inner.get_ref(), buf.as_mut_ptr() as *mut _, buf.len(), 0) };
                if n < 0 {
                    Err(std::io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            }) {
                Ok(result) => return result.map_err(Error::Io),
                Err(_would_block) => continue,
            }
        }
    }

    /// Feed received frames to the switch until the socket fails
    pub async fn run(self: Arc<Self>, switch: Arc<Switch>) {
        let mut buf = vec![0u8; RECV_BUF_SIZE];
        loop {
            match self.recv(&mut buf).await {
                Ok(len) => switch.on_frame_received(&self.name, &buf[..len]),
                Err(e) => {
                    warn!(port = %self.name, error = %e, "receive failed, stopping port");
                    return;
                }
            }
        }
    }
}

impl Port for AfPacketPort {
    fn name(&self) -> &str {
        &self.name
    }

    /// Non-blocking send; a full socket buffer is reported as an error
    fn transmit(&self, frame: &[u8]) -> Result<()> {
        let fd = self.as_raw_fd();
        let n = unsafe { libc::send(fd, frame.as_ptr() as *const _, frame.len(), 0) };
        if n < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    fn mtu(&self) -> usize {
        self.mtu
    }
}

impl AsRawFd for AfPacketPort {
    fn as_raw_fd(&self) -> RawFd {
        *self.async_fd.get_ref()
    }
}

impl Drop for AfPacketPort {
    fn drop(&mut self) {
        let _ = Self::set_promisc(self.as_raw_fd(), self.ifindex, false);
        unsafe { libc::close(self.as_raw_fd()) };
    }
}
