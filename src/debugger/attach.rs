//! Handshake that turns a breakpoint hit into a debug session.
//!
//! A worker takes one of two roles, decided by the matched breakpoint:
//!
//! * server: the breakpoint has no proxy port. The worker listens on an
//!   ephemeral port, announces it with a `PLDBGBREAK:<port>` notice and waits
//!   for a proxy to dial in.
//! * client: the breakpoint names the port of a proxy already listening. The
//!   worker dials it.
//!
//! On the wire both roles look the same, the dialing side sends
//! `[u32 pid][u64 identity token]`, the listening side answers with a framed
//! boolean, then the dialing side sends its protocol version and the
//! listening side answers with its own.

use crate::config::AttachConfig;
use crate::debugger::error::Error;
use crate::debugger::process::{ProcessIdentity, ProcessTable};
use crate::debugger::session::NoticeSink;
use crate::debugger::transport::{Channel, BREAK_NOTICE_PREFIX, PROTOCOL_VERSION};
use crate::{pd_debug, pd_info, pd_warn};
use nix::unistd::Pid;
use std::io;
use std::net::{TcpListener, TcpStream};

/// Listening side of the handshake, after the connection is accepted.
///
/// Return `Ok(None)` if the peer credentials are rejected, the peer is told
/// so and the connection should be dropped. Otherwise return the peer
/// protocol version.
pub(crate) fn accept_peer<S: io::Read + io::Write>(
    channel: &mut Channel<S>,
    processes: &dyn ProcessTable,
) -> Result<Option<String>, Error> {
    let pid = Pid::from_raw(channel.read_u32()? as i32);
    let token = channel.read_token()?;

    let peer = ProcessIdentity { pid, token };
    if !peer.verify(processes) {
        channel.send_bool(false)?;
        return Ok(None);
    }
    channel.send_bool(true)?;

    let peer_version = channel.read_str()?;
    channel.send_string(PROTOCOL_VERSION)?;
    Ok(Some(peer_version))
}

/// What an accept loop does when a connection breaks mid-handshake.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum BrokenPeer {
    /// Give up waiting, return the error.
    Abort,
    /// Drop the connection and accept the next one.
    Skip,
}

/// Accept connections until one of them passes [`accept_peer`].
pub(crate) fn accept_loop(
    listener: &TcpListener,
    processes: &dyn ProcessTable,
    on_broken: BrokenPeer,
) -> Result<(Channel, String), Error> {
    loop {
        let (stream, peer) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::IO(e)),
        };

        let handshake = Channel::from_tcp(stream).and_then(|mut channel| {
            Ok(accept_peer(&mut channel, processes)?.map(|version| (channel, version)))
        });
        match handshake {
            Ok(Some(session)) => return Ok(session),
            Ok(None) => {
                pd_warn!(target: "attach", "reject connection from {peer}: identity mismatch");
            }
            Err(e) if on_broken == BrokenPeer::Skip => {
                pd_warn!(target: "attach", "drop connection from {peer}: {e:#}");
            }
            Err(e) => return Err(e),
        }
    }
}

/// Take the server role: listen, announce the port and wait for a genuine proxy.
pub fn connect_as_server(
    config: &AttachConfig,
    processes: &dyn ProcessTable,
    notices: &mut dyn NoticeSink,
) -> Result<Channel, Error> {
    let listener = TcpListener::bind((config.listen_host.as_str(), 0))?;
    let port = listener.local_addr()?.port();

    notices.notice(&format!("{BREAK_NOTICE_PREFIX}{port}"));
    pd_info!(target: "attach", "waiting for debugger proxy on port {port}");

    let (channel, proxy_version) = accept_loop(&listener, processes, BrokenPeer::Abort)?;
    pd_debug!(target: "attach", "proxy attached, protocol version {proxy_version}");
    Ok(channel)
}

/// Take the client role: dial a proxy waiting on `port`.
///
/// A refusal of our credentials is an error only with
/// [`AttachConfig::strict_proxy_auth`], otherwise it is logged and the
/// version exchange goes on.
pub fn connect_as_client(
    config: &AttachConfig,
    identity: &ProcessIdentity,
    port: u16,
) -> Result<Channel, Error> {
    let stream = TcpStream::connect((config.proxy_host.as_str(), port))?;
    let mut channel = Channel::from_tcp(stream)?;

    channel.write_u32(identity.pid.as_raw() as u32)?;
    channel.write_token(identity.token)?;

    if !channel.get_bool()? {
        if config.strict_proxy_auth {
            return Err(Error::AuthRejected);
        }
        pd_warn!(target: "attach", "debugger proxy on port {port} refused authentication");
    }

    channel.send_string(PROTOCOL_VERSION)?;
    match channel.get_nstring()? {
        Some(version) => {
            pd_debug!(target: "attach", "attached to proxy, protocol version {version}")
        }
        None => pd_debug!(target: "attach", "attached to proxy, no protocol version"),
    }
    Ok(channel)
}
