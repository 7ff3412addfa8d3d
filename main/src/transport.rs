use crate::property::Properties;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use mockall::automock;
use slp_protocol::SlpError;
use socket2::Domain;
use socket2::Protocol;
use socket2::Socket;
use socket2::Type;
use std::net::Ipv4Addr;
use std::net::SocketAddr;
use std::net::SocketAddrV4;
use std::net::UdpSocket as StdUdpSocket;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;

/// Largest UDP payload.
const RECEIVE_BUFFER_SIZE: usize = 65535;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Target {
    Multicast,
    Broadcast,
    Unicast(SocketAddr),
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Datagram {
    pub payload: Vec<u8>,
    pub source: SocketAddr,
}

#[automock]
pub trait Transport {
    fn send(&self, target: Target, payload: Arc<[u8]>) -> BoxFuture<'static, std::io::Result<()>>;

    /// Waits at most `timeout` for the next datagram.
    ///
    /// `None` means nothing arrived in time.
    fn receive(&self, timeout: Duration) -> BoxFuture<'static, std::io::Result<Option<Datagram>>>;
}

pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    multicast_address: SocketAddrV4,
    broadcast_address: SocketAddrV4,
}

impl UdpTransport {
    /// Binds an ephemeral port.
    ///
    /// Fails outside a Tokio runtime.
    pub fn bind(properties: &Properties) -> std::io::Result<Self> {
        tokio::runtime::Handle::try_current()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        let socket = new_socket(properties.multicast_ttl())?;
        let local_address = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);
        socket.bind(&local_address.into())?;
        let transport = Self {
            socket: Arc::new(new_async_socket(socket)?),
            multicast_address: crate::get_multicast_address(properties.port()),
            broadcast_address: SocketAddrV4::new(Ipv4Addr::BROADCAST, properties.port()),
        };
        log::info!("SLP socket bound at {}", transport.local_addr()?);
        Ok(transport)
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    async fn send_to(
        socket: Arc<UdpSocket>,
        destination: SocketAddr,
        payload: Arc<[u8]>,
    ) -> std::io::Result<()> {
        log::debug!("Sending {} bytes to {}", payload.len(), destination);
        socket.send_to(&payload, destination).await?;
        Ok(())
    }

    async fn receive_from(
        socket: Arc<UdpSocket>,
        timeout: Duration,
    ) -> std::io::Result<Option<Datagram>> {
        let mut buffer = vec![0; RECEIVE_BUFFER_SIZE];
        let Ok(received) = tokio::time::timeout(timeout, socket.recv_from(&mut buffer)).await else {
            return Ok(None);
        };
        let (receive_size, source) = received?;
        buffer.truncate(receive_size);
        Ok(Some(Datagram {
            payload: buffer,
            source,
        }))
    }
}

impl Transport for UdpTransport {
    fn send(&self, target: Target, payload: Arc<[u8]>) -> BoxFuture<'static, std::io::Result<()>> {
        let destination = match target {
            Target::Multicast => self.multicast_address.into(),
            Target::Broadcast => self.broadcast_address.into(),
            Target::Unicast(address) => address,
        };
        Self::send_to(self.socket.clone(), destination, payload).boxed()
    }

    fn receive(&self, timeout: Duration) -> BoxFuture<'static, std::io::Result<Option<Datagram>>> {
        Self::receive_from(self.socket.clone(), timeout).boxed()
    }
}

/// Maps a failed send or receive.
pub fn network_error(e: std::io::Error) -> SlpError {
    log::warn!("SLP network failure: {}", e);
    SlpError::NetworkError
}

fn new_socket(multicast_ttl: u32) -> std::io::Result<Socket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.set_multicast_ttl_v4(multicast_ttl)?;

    // Lets a Service Agent on this host see our requests.
    socket.set_multicast_loop_v4(true)?;

    socket.set_nonblocking(true)?;
    Ok(socket)
}

fn new_async_socket(socket: Socket) -> std::io::Result<UdpSocket> {
    let socket: StdUdpSocket = socket.into();
    socket.try_into()
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn unicast_exchange() -> anyhow::Result<()> {
        crate::test::init();

        let transport = UdpTransport::bind(&Properties::default())?;
        let transport_port = transport.local_addr()?.port();
        let peer = UdpSocket::bind("127.0.0.1:0").await?;
        let peer_address = peer.local_addr()?;

        // When
        let packet: Arc<[u8]> = vec![1, 2, 3].into();
        Transport::send(&transport, Target::Unicast(peer_address), packet).await?;
        let mut buffer = [0; 16];
        let (size, source) = peer.recv_from(&mut buffer).await?;
        peer.send_to(&[4, 5], source).await?;
        let reply = Transport::receive(&transport, Duration::from_secs(5)).await?;

        // Then
        assert_eq!(&buffer[..size], &[1, 2, 3]);
        assert_eq!(source.port(), transport_port);
        assert_eq!(
            reply,
            Some(Datagram {
                payload: vec![4, 5],
                source: peer_address,
            })
        );
        Ok(())
    }

    #[test]
    fn bind_outside_runtime() {
        crate::test::init();

        let result = UdpTransport::bind(&Properties::default());

        assert_eq!(result.err().map(|e| e.kind()), Some(std::io::ErrorKind::Other));
    }

    #[tokio::test]
    async fn receive_times_out() -> anyhow::Result<()> {
        crate::test::init();

        let transport = UdpTransport::bind(&Properties::default())?;

        let reply = Transport::receive(&transport, Duration::from_millis(50)).await?;

        assert_eq!(reply, None);
        Ok(())
    }
}
