//! Proxy side of a debug session.
//!
//! A proxy sits between a debugger front-end and a worker. It either dials a
//! worker that announced a break notice ([`ProxySession::attach_to_target`]),
//! or registers global breakpoints carrying its own port and waits for the
//! first worker that hits one ([`GlobalProxy`]).

use crate::debugger::attach::{accept_loop, BrokenPeer};
use crate::debugger::breakpoint::{
    BreakpointData, BreakpointKey, Oid, Registry, Scope, SharedRegion, Target,
};
use crate::debugger::error::Error;
use crate::debugger::process::{ProcessIdentity, ProcessTable};
use crate::debugger::transport::{Channel, PROTOCOL_VERSION};
use crate::{pd_debug, pd_info, weak_error};
use std::net::{TcpListener, TcpStream};

/// Established session with a worker.
pub struct ProxySession {
    channel: Channel,
    target_version: Option<String>,
}

impl ProxySession {
    /// Dial a worker waiting on `host:port` and authenticate with `identity`.
    pub fn attach_to_target(
        host: &str,
        port: u16,
        identity: &ProcessIdentity,
    ) -> Result<Self, Error> {
        let stream = TcpStream::connect((host, port))?;
        let mut channel = Channel::from_tcp(stream)?;

        channel.write_u32(identity.pid.as_raw() as u32)?;
        channel.write_token(identity.token)?;
        if !channel.get_bool()? {
            return Err(Error::TargetRejected);
        }

        channel.send_string(PROTOCOL_VERSION)?;
        let target_version = channel.get_nstring()?;
        pd_debug!(target: "proxy", "attached to target at {host}:{port}, version {target_version:?}");

        Ok(Self {
            channel,
            target_version,
        })
    }

    pub fn target_version(&self) -> Option<&str> {
        self.target_version.as_deref()
    }

    /// Send a command and wait for its reply.
    pub fn request(&mut self, command: &str) -> Result<String, Error> {
        self.channel.send_string(command)?;
        self.channel.read_str()
    }

    /// Set a breakpoint local to the attached worker.
    pub fn set_breakpoint(&mut self, routine_id: Oid, line_number: i32) -> Result<bool, Error> {
        let reply = self.request(&format!("b {routine_id}:{line_number}"))?;
        Ok(reply.starts_with('t'))
    }

    /// Clear a breakpoint local to the attached worker.
    pub fn clear_breakpoint(&mut self, routine_id: Oid, line_number: i32) -> Result<bool, Error> {
        let reply = self.request(&format!("f {routine_id}:{line_number}"))?;
        Ok(reply.starts_with('t'))
    }

    /// Close the connection, the worker sees a lost session on its next read.
    pub fn close(self) -> Result<(), Error> {
        self.channel.shutdown()
    }
}

/// Proxy waiting for any worker to hit one of its global breakpoints.
///
/// Global breakpoints of the proxy are removed from the shared region when
/// it is dropped, on error paths too.
pub struct GlobalProxy {
    listener: TcpListener,
    port: u16,
    registry: Registry,
    identity: ProcessIdentity,
    processes: Box<dyn ProcessTable>,
    purged: bool,
}

impl GlobalProxy {
    /// Bind a listener on `host`, port is chosen by the system.
    ///
    /// # Arguments
    ///
    /// * `host`: host to listen on, workers dial it
    /// * `region`: handle onto the shared breakpoint region
    /// * `database_id`: database of breakpoints this proxy sets
    /// * `identity`: this proxy's identity, its pid owns the breakpoints
    /// * `processes`: process table used to verify dialing workers
    pub fn bind(
        host: &str,
        region: SharedRegion,
        database_id: Oid,
        identity: ProcessIdentity,
        processes: Box<dyn ProcessTable>,
    ) -> Result<Self, Error> {
        let listener = TcpListener::bind((host, 0))?;
        let port = listener.local_addr()?.port();
        pd_info!(
            target: "proxy",
            "global proxy listening on port {port}, breakpoint region {}",
            region.path().display()
        );

        Ok(Self {
            listener,
            port,
            registry: Registry::new(region, identity.pid, database_id),
            identity,
            processes,
            purged: false,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Register a global breakpoint owned by this proxy. Return `false` if
    /// the breakpoint already exists.
    pub fn set_global_breakpoint(
        &mut self,
        routine_id: Oid,
        line_number: i32,
        target: Target,
    ) -> Result<bool, Error> {
        let key = BreakpointKey::new(
            self.registry.database_id(),
            routine_id,
            line_number,
            target,
        );
        let data = BreakpointData::global(self.port, self.identity.pid);
        self.registry.insert(Scope::Global, &key, &data)
    }

    /// Remove a global breakpoint of this proxy.
    pub fn clear_global_breakpoint(
        &mut self,
        routine_id: Oid,
        line_number: i32,
        target: Target,
    ) -> Result<bool, Error> {
        let key = BreakpointKey::new(
            self.registry.database_id(),
            routine_id,
            line_number,
            target,
        );
        self.registry.delete(Scope::Global, &key)
    }

    /// Block until a genuine worker dials in. Workers with wrong credentials
    /// or a broken handshake are dropped and the proxy keeps waiting.
    pub fn wait_for_target(&mut self) -> Result<ProxySession, Error> {
        let (channel, target_version) =
            accept_loop(&self.listener, self.processes.as_ref(), BrokenPeer::Skip)?;
        pd_info!(target: "proxy", "target attached, protocol version {target_version}");

        Ok(ProxySession {
            channel,
            target_version: Some(target_version).filter(|v| !v.is_empty()),
        })
    }

    /// End a session, global breakpoints of this proxy become available to
    /// all workers again.
    pub fn end_session(&mut self, session: ProxySession) -> Result<usize, Error> {
        weak_error!(session.close(), "close session:");
        self.registry.free_for_proxy(self.identity.pid)
    }

    /// Remove all global breakpoints of this proxy.
    pub fn shutdown(mut self) -> Result<usize, Error> {
        self.purge()
    }

    fn purge(&mut self) -> Result<usize, Error> {
        if self.purged {
            return Ok(0);
        }
        let removed = self.registry.purge_for_proxy(self.identity.pid)?;
        self.purged = true;
        pd_info!(target: "proxy", "global proxy on port {} removed {removed} breakpoint(s)", self.port);
        Ok(removed)
    }
}

impl Drop for GlobalProxy {
    fn drop(&mut self) {
        weak_error!(self.purge(), "purge global breakpoints:");
    }
}
