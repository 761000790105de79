//! Line drivers: the I/O backends under each circuit. One tagged
//! variant per wire medium, all driven from the single event loop.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use embedded_io_async::{Read, Write};

use edge_nal::{UdpBind, UdpReceive, UdpSend};
use edge_nal_std::{Stack, TcpSocket, UdpSocket};

use log::{debug, info, warn};

use dnet_packet::frame::{Frame, MAX_FRAME_LEN};
use dnet_packet::MacAddr;

use crate::raw_ether::RawEthernet;

/// What a line's read future resolved to.
pub enum ReadEvent {
    /// A raw Ethernet frame is in the line's buffer.
    Frame(usize),
    /// A chunk of DDCMP byte stream is in the line's buffer.
    Bytes(usize),
    /// The stream under a DDCMP circuit went away.
    Closed,
}

pub enum LineBackend {
    /// Promiscuous capture and injection on a real interface.
    EthernetRaw(RawEthernet),
    /// Ethernet frames tunneled in UDP datagrams to another router.
    EthernetBridge {
        socket: UdpSocket,
        host: String,
        port: u16,
        peer: Option<IpAddr>,
    },
    /// DDCMP over an accepted TCP byte stream.
    DdcmpTcp {
        stream: Option<TcpSocket>,
        host: String,
        peer: Option<IpAddr>,
    },
}

pub struct Line {
    pub slot: usize,
    pub backend: LineBackend,
    pub buf: Vec<u8>,
}

impl Line {
    pub fn new(slot: usize, backend: LineBackend) -> Self {
        Self {
            slot,
            backend,
            buf: vec![0; MAX_FRAME_LEN.max(4096)],
        }
    }

    /// The hostname whose address this line tracks, for DNS
    /// re-resolution.
    pub fn tracked_host(&self) -> Option<&str> {
        match &self.backend {
            LineBackend::EthernetBridge { host, .. } => Some(host),
            LineBackend::DdcmpTcp { host, .. } => Some(host),
            LineBackend::EthernetRaw(_) => None,
        }
    }

    pub fn set_peer(&mut self, addr: IpAddr) {
        match &mut self.backend {
            LineBackend::EthernetBridge { peer, .. } => *peer = Some(addr),
            LineBackend::DdcmpTcp { peer, .. } => *peer = Some(addr),
            LineBackend::EthernetRaw(_) => (),
        }
    }

    /// Waits for the next readable event on this line. Pends forever on
    /// a DDCMP line with no attached stream.
    pub async fn read(&mut self) -> io::Result<ReadEvent> {
        match &mut self.backend {
            LineBackend::EthernetRaw(raw) => {
                let len = raw.recv(&mut self.buf).await?;

                Ok(ReadEvent::Frame(len))
            }
            LineBackend::EthernetBridge { socket, peer, .. } => loop {
                let (len, remote) = socket
                    .receive(&mut self.buf)
                    .await
                    .map_err(io::Error::other)?;

                // The tunnel only trusts its configured far end.
                match peer {
                    Some(addr) if *addr == remote.ip() => break Ok(ReadEvent::Frame(len)),
                    _ => {
                        debug!("dropping bridge datagram from unexpected {}", remote);
                    }
                }
            },
            LineBackend::DdcmpTcp { stream, .. } => match stream {
                Some(stream) => {
                    let len = stream
                        .read(&mut self.buf)
                        .await
                        .map_err(io::Error::other)?;

                    if len == 0 {
                        Ok(ReadEvent::Closed)
                    } else {
                        Ok(ReadEvent::Bytes(len))
                    }
                }
                None => core::future::pending().await,
            },
        }
    }

    /// Frames and transmits one routing-layer payload.
    pub async fn send_frame(&mut self, dst: &MacAddr, src: &MacAddr, payload: &[u8]) {
        let mut raw = [0u8; MAX_FRAME_LEN];

        let len = match Frame::emit(dst, src, payload, &mut raw) {
            Ok(len) => len,
            Err(err) => {
                warn!("cannot frame outbound packet: {}", err);
                return;
            }
        };

        match &mut self.backend {
            LineBackend::EthernetRaw(ethernet) => {
                if let Err(err) = ethernet.send(&raw[..len]).await {
                    warn!("ethernet send failed: {}", err);
                }
            }
            LineBackend::EthernetBridge {
                socket, host, port, peer,
            } => match peer {
                Some(addr) => {
                    let remote = SocketAddr::new(*addr, *port);
                    if let Err(err) = socket.send(remote, &raw[..len]).await {
                        warn!("bridge send to {} failed: {:?}", host, err);
                    }
                }
                None => debug!("bridge peer {} not resolved yet, dropping frame", host),
            },
            LineBackend::DdcmpTcp { .. } => {
                warn!("framed send on a point-to-point line");
            }
        }
    }

    /// Pushes pending DDCMP output onto the stream. A write failure
    /// closes the stream; the caller notices through the read side.
    pub async fn send_stream(&mut self, data: &[u8]) -> io::Result<()> {
        if let LineBackend::DdcmpTcp { stream, .. } = &mut self.backend {
            if let Some(stream) = stream {
                stream.write_all(data).await.map_err(io::Error::other)?;
            }
        }

        Ok(())
    }

    /// Attaches an accepted connection to this DDCMP line. Refused when
    /// one is already up.
    pub fn attach_stream(&mut self, remote: SocketAddr, socket: TcpSocket) -> bool {
        if let LineBackend::DdcmpTcp { stream, host, .. } = &mut self.backend {
            if stream.is_some() {
                warn!("connection from {} refused, line already attached", remote);
                return false;
            }

            info!("connection from {} attached to {}", remote, host);
            *stream = Some(socket);
            return true;
        }

        false
    }

    pub fn detach_stream(&mut self) {
        if let LineBackend::DdcmpTcp { stream, .. } = &mut self.backend {
            *stream = None;
        }
    }

    /// Whether an inbound connection from `remote` belongs to this
    /// line.
    pub fn expects_peer(&self, remote: &SocketAddr) -> bool {
        match &self.backend {
            LineBackend::DdcmpTcp { peer, .. } => *peer == Some(remote.ip()),
            _ => false,
        }
    }
}

/// Binds the bridge tunnel's local UDP socket.
pub async fn bind_bridge(stack: &Stack, port: u16) -> io::Result<UdpSocket> {
    stack
        .bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port))
        .await
}
