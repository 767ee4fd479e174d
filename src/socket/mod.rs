// Copyright (C) 2025, Cloudflare, Inc.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are
// met:
//
//     * Redistributions of source code must retain the above copyright notice,
//       this list of conditions and the following disclaimer.
//
//     * Redistributions in binary form must reproduce the above copyright
//       notice, this list of conditions and the following disclaimer in the
//       documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS
// IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO,
// THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR
// PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR
// CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL,
// EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
// PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR
// PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF
// LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING
// NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE OF THIS
// SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

//! The UDP socket a frontend address listens on, with the Linux sockopts
//! that improve QUIC datagram I/O.

use std::io;
#[cfg(unix)]
use std::os::fd::AsFd;
#[cfg(unix)]
use std::os::fd::AsRawFd;
#[cfg(unix)]
use std::os::fd::BorrowedFd;
#[cfg(unix)]
use std::os::fd::RawFd;

use tokio::net::UdpSocket;

#[cfg(target_os = "linux")]
mod linux_imports {
    pub use libc::c_int;
    pub use libc::c_void;
    pub use libc::sock_txtime;
    pub use libc::socklen_t;
    pub use libc::IPPROTO_IP;
    pub use libc::IPPROTO_IPV6;
    pub use libc::IPV6_MTU_DISCOVER;
    pub use libc::IPV6_PMTUDISC_PROBE;
    pub use libc::IP_MTU_DISCOVER;
    pub use libc::IP_PMTUDISC_PROBE;
    pub use nix::errno::Errno;
    pub use nix::sys::socket::setsockopt;
    pub use nix::sys::socket::sockopt::Ipv4PacketInfo;
    pub use nix::sys::socket::sockopt::Ipv6RecvPacketInfo;
    pub use nix::sys::socket::sockopt::TxTime;
    pub use nix::sys::socket::sockopt::UdpGroSegment;
    pub use nix::sys::socket::sockopt::UdpGsoSegment;
    pub use nix::sys::socket::SetSockOpt;
}

#[cfg(target_os = "linux")]
use linux_imports::*;

#[cfg(target_os = "linux")]
#[derive(Clone)]
struct IpMtuDiscoverProbe;

#[cfg(target_os = "linux")]
impl SetSockOpt for IpMtuDiscoverProbe {
    type Val = ();

    fn set<F: AsFd>(&self, fd: &F, _val: &Self::Val) -> nix::Result<()> {
        let pmtud_mode: c_int = IP_PMTUDISC_PROBE;
        let ret = unsafe {
            libc::setsockopt(
                fd.as_fd().as_raw_fd(),
                IPPROTO_IP,
                IP_MTU_DISCOVER,
                &pmtud_mode as *const c_int as *const c_void,
                std::mem::size_of::<c_int>() as socklen_t,
            )
        };

        match ret {
            0 => Ok(()),
            _ => Err(Errno::last()),
        }
    }
}

#[cfg(target_os = "linux")]
#[derive(Clone)]
struct Ipv6MtuDiscoverProbe;

#[cfg(target_os = "linux")]
impl SetSockOpt for Ipv6MtuDiscoverProbe {
    type Val = ();

    fn set<F: AsFd>(&self, fd: &F, _val: &Self::Val) -> nix::Result<()> {
        let pmtud_mode: c_int = IPV6_PMTUDISC_PROBE;
        let ret = unsafe {
            libc::setsockopt(
                fd.as_fd().as_raw_fd(),
                IPPROTO_IPV6,
                IPV6_MTU_DISCOVER,
                &pmtud_mode as *const c_int as *const c_void,
                std::mem::size_of::<c_int>() as socklen_t,
            )
        };

        match ret {
            0 => Ok(()),
            _ => Err(Errno::last()),
        }
    }
}

/// Builder to enable Linux sockopts which improve QUIC performance.
#[cfg(target_os = "linux")]
pub struct SocketCapabilitiesBuilder<'s> {
    socket: BorrowedFd<'s>,
    cap: SocketCapabilities,
}

#[cfg(target_os = "linux")]
impl<'s> SocketCapabilitiesBuilder<'s> {
    /// Creates a new sockopt builder for `socket`.
    pub fn new<S: AsFd>(socket: &'s S) -> Self {
        Self {
            socket: socket.as_fd(),
            cap: Default::default(),
        }
    }

    /// Enables [`UDP_SEGMENT`](https://man7.org/linux/man-pages/man7/udp.7.html),
    /// a generic segmentation offload (GSO).
    ///
    /// GSO improves transmit performance by treating multiple sequential UDP
    /// packets as a single entity in the kernel. Segmentation into
    /// individual packets happens in the NIC, if it supports GSO.
    pub fn gso(&mut self) -> io::Result<()> {
        // Initialize GSO with the maximum possible segment size so that later
        // increases of max_send_udp_payload_size stay within bounds.
        setsockopt(&self.socket.as_fd(), UdpGsoSegment, &(u16::MAX as i32))?;
        self.cap.has_gso = true;
        Ok(())
    }

    /// Enables [`UDP_GRO`](https://man7.org/linux/man-pages/man7/udp.7.html),
    /// a generic receive offload (GRO).
    ///
    /// GRO improves receive performance by allowing the kernel to yield
    /// multiple UDP packets in one
    /// [`recvmsg(2)`](https://man7.org/linux/man-pages/man2/recv.2.html)
    /// call. It is the equivalent of GSO for the receive path.
    pub fn gro(&mut self) -> io::Result<()> {
        UdpGroSegment.set(&self.socket.as_fd(), &true)?;

        self.cap.has_gro = true;
        Ok(())
    }

    /// Enables [`SO_TXTIME`](https://man7.org/linux/man-pages/man8/tc-etf.8.html)
    /// to control packet transmit timestamps for QUIC pacing.
    pub fn txtime(&mut self) -> io::Result<()> {
        let cfg = sock_txtime {
            clockid: libc::CLOCK_MONOTONIC,
            flags: 0,
        };
        setsockopt(&self.socket.as_fd(), TxTime, &cfg)?;

        self.cap.has_txtime = true;
        Ok(())
    }

    /// Enables [`IP_PKTINFO`](https://man7.org/linux/man-pages/man7/ip.7.html)
    /// to learn the real local address of inbound IPv4 packets and to pin
    /// the source IP of outbound ones.
    pub fn ipv4_pktinfo(&mut self) -> io::Result<()> {
        setsockopt(&self.socket.as_fd(), Ipv4PacketInfo, &true)?;

        self.cap.has_ippktinfo = true;
        Ok(())
    }

    /// Enables [`IPV6_RECVPKTINFO`](https://man7.org/linux/man-pages/man7/ipv6.7.html)
    /// to learn the real local address of inbound IPv6 packets and to pin
    /// the source IP of outbound ones.
    pub fn ipv6_pktinfo(&mut self) -> io::Result<()> {
        setsockopt(&self.socket.as_fd(), Ipv6RecvPacketInfo, &true)?;

        self.cap.has_ipv6pktinfo = true;
        Ok(())
    }

    /// Sets [`IP_MTU_DISCOVER`](https://man7.org/linux/man-pages/man7/ip.7.html)
    /// to `IP_PMTUDISC_PROBE`, which disables kernel PMTUD and sets the `DF`
    /// (Don't Fragment) flag.
    pub fn ip_mtu_discover_probe(&mut self) -> io::Result<()> {
        setsockopt(&self.socket.as_fd(), IpMtuDiscoverProbe, &())?;

        self.cap.has_ip_mtu_discover_probe = true;
        Ok(())
    }

    /// Sets [`IPV6_MTU_DISCOVER`](https://man7.org/linux/man-pages/man7/ipv6.7.html)
    /// to `IPV6_PMTUDISC_PROBE`, which disables kernel PMTUD and sets the
    /// `DF` (Don't Fragment) flag.
    pub fn ipv6_mtu_discover_probe(&mut self) -> io::Result<()> {
        setsockopt(&self.socket.as_fd(), Ipv6MtuDiscoverProbe, &())?;

        self.cap.has_ipv6_mtu_discover_probe = true;
        Ok(())
    }

    /// Consumes the builder and returns the configured
    /// [`SocketCapabilities`].
    pub fn finish(self) -> SocketCapabilities {
        self.cap
    }
}

/// Indicators of sockopts configured for a socket.
///
/// On Linux, a socket can be configured using a
/// [`SocketCapabilitiesBuilder`], which returns the sockopts that were
/// applied successfully. By default, all options are assumed to be disabled
/// (including on OSes besides Linux).
#[derive(Debug, Default)]
pub struct SocketCapabilities {
    /// Indicates if the socket has `UDP_SEGMENT` enabled.
    pub(crate) has_gso: bool,

    /// Indicates if the socket has `UDP_GRO` enabled.
    #[cfg_attr(not(target_os = "linux"), expect(dead_code))]
    pub(crate) has_gro: bool,

    /// Indicates if the socket was configured with `SO_TXTIME`.
    pub(crate) has_txtime: bool,

    /// Indicates if the socket has `IP_PKTINFO` set.
    pub(crate) has_ippktinfo: bool,

    /// Indicates if the socket has `IPV6_RECVPKTINFO` set.
    pub(crate) has_ipv6pktinfo: bool,

    // Indicates if the socket has `IP_MTU_DISCOVER` set to
    // `IP_PMTUDISC_PROBE`.
    #[cfg_attr(not(target_os = "linux"), expect(dead_code))]
    pub(crate) has_ip_mtu_discover_probe: bool,

    // Indicates if the socket has `IPV6_MTU_DISCOVER` set to
    // `IPV6_PMTUDISC_PROBE`.
    #[cfg_attr(not(target_os = "linux"), expect(dead_code))]
    pub(crate) has_ipv6_mtu_discover_probe: bool,
}

impl SocketCapabilities {
    /// Tries to enable all supported sockopts and returns indicators
    /// of which settings were successfully applied.
    #[cfg(target_os = "linux")]
    pub fn apply_all_and_get_compatibility<S>(socket: &S) -> Self
    where
        S: AsFd,
    {
        let mut b = SocketCapabilitiesBuilder::new(socket);
        let _ = b.gso();
        let _ = b.gro();
        let _ = b.txtime();
        let _ = b.ip_mtu_discover_probe();
        let _ = b.ipv6_mtu_discover_probe();
        let _ = b.ipv4_pktinfo();
        let _ = b.ipv6_pktinfo();
        b.finish()
    }
}

/// A UDP socket for a frontend address, with the capabilities applied to it.
pub struct QuicListener {
    /// The wrapped socket.
    pub socket: UdpSocket,
    /// The sockopts applied to `socket`.
    pub capabilities: SocketCapabilities,
}

impl QuicListener {
    /// Tries to enable all sockopts supported by the crate for this socket.
    /// See [`SocketCapabilities::apply_all_and_get_compatibility`] for
    /// details.
    #[cfg(target_os = "linux")]
    pub fn apply_max_capabilities(&mut self) {
        self.capabilities =
            SocketCapabilities::apply_all_and_get_compatibility(&self.socket);
    }
}

impl TryFrom<UdpSocket> for QuicListener {
    type Error = io::Error;

    fn try_from(socket: UdpSocket) -> Result<Self, Self::Error> {
        Ok(Self {
            socket,
            capabilities: SocketCapabilities::default(),
        })
    }
}

impl TryFrom<std::net::UdpSocket> for QuicListener {
    type Error = io::Error;

    fn try_from(socket: std::net::UdpSocket) -> Result<Self, Self::Error> {
        socket.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(socket)?;
        Self::try_from(socket)
    }
}

#[cfg(unix)]
impl AsFd for QuicListener {
    fn as_fd(&self) -> BorrowedFd {
        self.socket.as_fd()
    }
}

#[cfg(unix)]
impl AsRawFd for QuicListener {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}
