// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 CHIPS Collaboration

//! Bus transports.
//!
//! Pub/sub topics ride UDP multicast: the publisher sends to the group
//! with loopback enabled, every subscriber binds the group port with
//! `SO_REUSEADDR` and joins the group, so any number of processes on the
//! shore machine observe the topic. A unicast endpoint degrades to
//! single-subscriber delivery, which the tests use. The operator uplink is
//! plain UDP request/reply: one datagram each way.

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// A bus endpoint of the form `udp://ADDR:PORT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusUrl {
    addr: SocketAddrV4,
}

/// Endpoint parse errors.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid bus url '{0}' (expected udp://ADDR:PORT)")]
pub struct InvalidBusUrl(String);

impl BusUrl {
    pub fn addr(&self) -> SocketAddrV4 {
        self.addr
    }

    pub fn is_multicast(&self) -> bool {
        self.addr.ip().is_multicast()
    }
}

impl FromStr for BusUrl {
    type Err = InvalidBusUrl;

    fn from_str(url: &str) -> Result<Self, Self::Err> {
        let rest = url
            .strip_prefix("udp://")
            .ok_or_else(|| InvalidBusUrl(url.to_owned()))?;
        let addr = rest
            .parse()
            .map_err(|_| InvalidBusUrl(url.to_owned()))?;
        Ok(Self { addr })
    }
}

impl std::fmt::Display for BusUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "udp://{}", self.addr)
    }
}

fn new_udp_socket() -> io::Result<Socket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    Ok(socket)
}

/// Publishing side of a pub/sub topic.
#[derive(Debug)]
pub struct PubSocket {
    socket: UdpSocket,
    dest: SocketAddrV4,
}

impl PubSocket {
    pub fn open(url: BusUrl) -> io::Result<Self> {
        let socket = new_udp_socket()?;
        let bind: SocketAddr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0).into();
        socket.bind(&bind.into())?;
        if url.is_multicast() {
            // Subscribers on this host must see our datagrams.
            socket.set_multicast_loop_v4(true)?;
        }
        Ok(Self {
            socket: socket.into(),
            dest: url.addr(),
        })
    }

    pub fn publish(&self, payload: &[u8]) -> io::Result<()> {
        let sent = self.socket.send_to(payload, self.dest)?;
        if sent != payload.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "short datagram send",
            ));
        }
        Ok(())
    }
}

/// Subscribing side of a pub/sub topic.
#[derive(Debug)]
pub struct SubSocket {
    socket: UdpSocket,
}

impl SubSocket {
    /// Bind the topic port (joining the group for multicast endpoints)
    /// with `recv` returning after at most `recv_timeout`.
    pub fn open(url: BusUrl, recv_timeout: Duration) -> io::Result<Self> {
        let socket = new_udp_socket()?;
        let bind: SocketAddr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, url.addr().port()).into();
        socket.bind(&bind.into())?;
        if url.is_multicast() {
            socket.join_multicast_v4(url.addr().ip(), &Ipv4Addr::UNSPECIFIED)?;
        }

        let socket: UdpSocket = socket.into();
        socket.set_read_timeout(Some(recv_timeout))?;
        Ok(Self { socket })
    }

    /// Receive one message. Timeouts surface as `WouldBlock`/`TimedOut`.
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let (size, _source) = self.socket.recv_from(buf)?;
        Ok(size)
    }
}

/// True when a recv error is just the configured timeout.
pub fn is_timeout(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

/// Server side of a request/reply endpoint.
#[derive(Debug)]
pub struct RepSocket {
    socket: UdpSocket,
}

impl RepSocket {
    pub fn open(url: BusUrl, recv_timeout: Duration) -> io::Result<Self> {
        let socket = new_udp_socket()?;
        let bind: SocketAddr = url.addr().into();
        socket.bind(&bind.into())?;
        let socket: UdpSocket = socket.into();
        socket.set_read_timeout(Some(recv_timeout))?;
        Ok(Self { socket })
    }

    /// Receive one request and its reply address.
    pub fn recv_request(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf)
    }

    /// Send the reply back before the next request is received.
    pub fn reply(&self, payload: &[u8], peer: SocketAddr) -> io::Result<()> {
        self.socket.send_to(payload, peer)?;
        Ok(())
    }
}

/// Client side of a request/reply endpoint.
#[derive(Debug)]
pub struct ReqSocket {
    socket: UdpSocket,
}

impl ReqSocket {
    pub fn open(url: BusUrl, reply_timeout: Duration) -> io::Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect(url.addr())?;
        socket.set_read_timeout(Some(reply_timeout))?;
        Ok(Self { socket })
    }

    /// Send one request and wait for the reply.
    pub fn request(&self, payload: &[u8], reply: &mut [u8]) -> io::Result<usize> {
        self.socket.send(payload)?;
        self.socket.recv(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bus_url_parse() {
        let url: BusUrl = "udp://239.255.86.1:56071".parse().expect("valid url");
        assert_eq!(url.addr().port(), 56071);
        assert!(url.is_multicast());
        assert_eq!(url.to_string(), "udp://239.255.86.1:56071");

        let unicast: BusUrl = "udp://127.0.0.1:56070".parse().expect("valid url");
        assert!(!unicast.is_multicast());

        assert!("tcp://127.0.0.1:1".parse::<BusUrl>().is_err());
        assert!("udp://not-an-addr".parse::<BusUrl>().is_err());
    }

    fn free_unicast_url() -> BusUrl {
        // Bind port 0 to discover a free port, then release it.
        let probe = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).expect("probe bind");
        let port = probe.local_addr().expect("probe addr").port();
        drop(probe);
        format!("udp://127.0.0.1:{}", port).parse().expect("url")
    }

    #[test]
    fn test_pub_sub_unicast_delivery() {
        let url = free_unicast_url();
        let subscriber = SubSocket::open(url, Duration::from_millis(500)).expect("sub");
        let publisher = PubSocket::open(url).expect("pub");

        publisher.publish(&[0, 1, 2, 3]).expect("publish");

        let mut buf = [0u8; 16];
        let size = subscriber.recv(&mut buf).expect("recv");
        assert_eq!(&buf[..size], &[0, 1, 2, 3]);
    }

    #[test]
    fn test_sub_timeout_is_distinguishable() {
        let url = free_unicast_url();
        let subscriber = SubSocket::open(url, Duration::from_millis(50)).expect("sub");
        let mut buf = [0u8; 16];
        let err = subscriber.recv(&mut buf).expect_err("no publisher");
        assert!(is_timeout(&err));
    }

    #[test]
    fn test_req_rep_roundtrip() {
        let url = free_unicast_url();
        let server = RepSocket::open(url, Duration::from_millis(500)).expect("rep");

        let client_thread = std::thread::spawn(move || {
            let client = ReqSocket::open(url, Duration::from_millis(500)).expect("req");
            let mut reply = [0u8; 1];
            let size = client.request(&[42], &mut reply).expect("request");
            (size, reply[0])
        });

        let mut buf = [0u8; 16];
        let (size, peer) = server.recv_request(&mut buf).expect("request arrives");
        assert_eq!(&buf[..size], &[42]);
        server.reply(&[1], peer).expect("reply");

        let (size, ack) = client_thread.join().expect("client");
        assert_eq!((size, ack), (1, 1));
    }
}
