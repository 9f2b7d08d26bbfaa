//! `[AMBIENT]` The default `Transport`: a multicast UDP socket bound to
//! `224.0.0.251:5353`, using `socket2` for the parts `tokio::net::UdpSocket`
//! doesn't expose (joining the multicast group, TTL, loopback). Plain
//! `tokio::net::UdpSocket` has no `recvmsg`/control-message path, so this
//! transport can't read `IP_PKTINFO`/`IP_RECVIF` and always reports
//! `ifIndex=0` — see `recv` below.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use async_trait::async_trait;
use bytes::BytesMut;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{error, info};

use crate::error::Result;
use crate::transport::{Received, Transport, MULTICAST_ADDR};

const MDNS_PORT: u16 = 5353;
const MDNS_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);
const UDP_BUFFER_SIZE: usize = 9000;

/// Binds `224.0.0.251:5353` on `bind_addr`, joins the multicast group, and
/// sets the IP TTL to 255 as required by §6.1.
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    pub fn bind(bind_addr: Ipv4Addr) -> Result<UdpTransport> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
        socket.set_multicast_ttl_v4(255)?;
        // looped-back copies of our own probes/announcements would otherwise
        // be misread as a simultaneous probe or conflicting answer by C4.
        socket.set_multicast_loop_v4(false)?;

        let local_addr = SocketAddrV4::new(bind_addr, MDNS_PORT);
        socket.bind(&local_addr.into())?;
        socket
            .join_multicast_v4(&MDNS_GROUP, &bind_addr)
            .map_err(|e| {
                error!("failed to join {MDNS_GROUP}: {e}");
                e
            })?;
        socket.set_nonblocking(true)?;

        info!("bound mDNS socket on {local_addr}, joined {MDNS_GROUP}");

        let socket = UdpSocket::from_std(socket.into())?;
        Ok(UdpTransport { socket })
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&self, packet: &[u8], dest: Option<SocketAddr>) -> Result<()> {
        let dest = dest.unwrap_or_else(|| MULTICAST_ADDR.parse().expect("valid multicast addr"));
        self.socket.send_to(packet, dest).await?;
        Ok(())
    }

    async fn recv(&self) -> Result<Received> {
        let mut buf = BytesMut::zeroed(UDP_BUFFER_SIZE);
        let (len, src) = self.socket.recv_from(&mut buf).await?;
        buf.truncate(len);
        // plain tokio::net::UdpSocket doesn't surface IP_PKTINFO; without a
        // raw recvmsg path the arriving interface is unknown, so every
        // packet degrades to the documented ifIndex=0 fallback (§6.2).
        Ok((buf.to_vec(), src, 0))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
