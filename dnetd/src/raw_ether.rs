//! A promiscuous AF_PACKET socket bound to one interface and the DECnet
//! ethertype, wrapped in `async_io::Async` for the event loop.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd};

use async_io::Async;

use dnet_packet::frame::ETHERTYPE_DECNET;

macro_rules! syscall_los {
    ($ret:expr) => {{
        let result = $ret;

        if result == -1 {
            Err(::std::io::Error::last_os_error())
        } else {
            Ok(result)
        }
    }};
}

pub struct RawEthernet {
    socket: Async<std::net::UdpSocket>,
}

impl RawEthernet {
    /// Opens the interface for DECnet traffic: an AF_PACKET SOCK_RAW
    /// socket with the ethertype as its protocol filter, joined to
    /// promiscuous mode so frames for other stations' DECnet addresses
    /// are seen too.
    pub fn open(interface: &str) -> io::Result<Self> {
        let name = std::ffi::CString::new(interface)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "interface name"))?;

        let ifindex = unsafe { libc::if_nametoindex(name.as_ptr()) };
        if ifindex == 0 {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no such interface: {}", interface),
            ));
        }

        let protocol = ETHERTYPE_DECNET.to_be() as libc::c_int;

        let fd = syscall_los!(unsafe { libc::socket(libc::PF_PACKET, libc::SOCK_RAW, protocol) })?;

        // From here on the fd is owned; errors close it on drop.
        let socket = unsafe { std::net::UdpSocket::from_raw_fd(fd) };

        let sockaddr = libc::sockaddr_ll {
            sll_family: libc::AF_PACKET as _,
            sll_protocol: ETHERTYPE_DECNET.to_be() as _,
            sll_ifindex: ifindex as _,
            sll_hatype: 0,
            sll_pkttype: 0,
            sll_halen: 0,
            sll_addr: Default::default(),
        };

        syscall_los!(unsafe {
            libc::bind(
                fd,
                &sockaddr as *const _ as *const _,
                core::mem::size_of::<libc::sockaddr_ll>() as _,
            )
        })?;

        let mreq = libc::packet_mreq {
            mr_ifindex: ifindex as _,
            mr_type: libc::PACKET_MR_PROMISC as _,
            mr_alen: 0,
            mr_address: Default::default(),
        };

        syscall_los!(unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_PACKET,
                libc::PACKET_ADD_MEMBERSHIP,
                &mreq as *const _ as *const _,
                core::mem::size_of::<libc::packet_mreq>() as _,
            )
        })?;

        Ok(Self {
            socket: Async::new(socket)?,
        })
    }

    /// Receives one frame, Ethernet header included.
    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.socket
            .read_with(|io| {
                let ret = syscall_los!(unsafe {
                    libc::recv(
                        io.as_raw_fd(),
                        buf.as_mut_ptr() as *mut _,
                        buf.len(),
                        0,
                    )
                })?;

                Ok(ret as usize)
            })
            .await
    }

    /// Injects one framed packet.
    pub async fn send(&self, frame: &[u8]) -> io::Result<()> {
        self.socket
            .write_with(|io| {
                syscall_los!(unsafe {
                    libc::send(io.as_raw_fd(), frame.as_ptr() as *const _, frame.len(), 0)
                })?;

                Ok(())
            })
            .await
    }
}
