use crate::debugger::error::Error;
use nix::unistd::{getpid, Pid};
use std::collections::HashMap;
use sysinfo::{RefreshKind, System};

/// Opaque value proving a process is who it claims to be. Two processes
/// that reuse one pid over time get different tokens.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct IdentityToken(pub u64);

/// Resolves a process id to the identity of the live process.
pub trait ProcessTable: Send {
    fn identity_of(&self, pid: Pid) -> Result<IdentityToken, Error>;
}

/// Process table of the running system.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemProcessTable;

impl ProcessTable for SystemProcessTable {
    fn identity_of(&self, pid: Pid) -> Result<IdentityToken, Error> {
        let sys =
            System::new_with_specifics(RefreshKind::everything().without_cpu().without_memory());
        let process = sys
            .process(sysinfo::Pid::from_u32(pid.as_raw() as u32))
            .ok_or(Error::ProcessNotFound(pid.as_raw()))?;

        Ok(IdentityToken(
            (process.start_time() << 32) | (pid.as_raw() as u32 as u64),
        ))
    }
}

impl ProcessTable for HashMap<Pid, IdentityToken> {
    fn identity_of(&self, pid: Pid) -> Result<IdentityToken, Error> {
        self.get(&pid)
            .copied()
            .ok_or(Error::ProcessNotFound(pid.as_raw()))
    }
}

/// Credentials a process presents to its peer during handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProcessIdentity {
    pub pid: Pid,
    pub token: IdentityToken,
}

impl ProcessIdentity {
    /// Identity of the calling process as seen by a process table.
    pub fn current(table: &dyn ProcessTable) -> Result<Self, Error> {
        let pid = getpid();
        Ok(Self {
            pid,
            token: table.identity_of(pid)?,
        })
    }

    /// Check that a process table knows the process under this identity.
    pub fn verify(&self, table: &dyn ProcessTable) -> bool {
        match table.identity_of(self.pid) {
            Ok(actual) => actual == self.token,
            Err(e) => {
                crate::pd_debug!(target: "attach", "identity check for pid {}: {e}", self.pid);
                false
            }
        }
    }
}
