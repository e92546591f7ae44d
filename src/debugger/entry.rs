use crate::debugger::breakpoint::{Oid, ANY_LINE, INVALID_OID};
use crate::debugger::error::Error;
use crate::debugger::Worker;
use std::collections::HashMap;

/// Routine metadata lookup.
pub trait Catalog {
    /// Return owner role of a routine, `None` if no such routine.
    fn routine_owner(&self, routine_id: Oid) -> Option<Oid>;
}

/// Routine id to owner id.
impl Catalog for HashMap<Oid, Oid> {
    fn routine_owner(&self, routine_id: Oid) -> Option<Oid> {
        self.get(&routine_id).copied()
    }
}

/// Role calling a debugger entry point.
#[derive(Clone, Copy, Debug)]
pub struct Caller {
    pub role_id: Oid,
    pub superuser: bool,
}

impl Worker {
    /// Entry point for application code: break at the start of a routine
    /// next time this worker runs it.
    ///
    /// Caller must own the routine or be a superuser. Return `false` if the
    /// breakpoint already exists.
    pub fn debug_routine(
        &mut self,
        routine_id: Oid,
        caller: &Caller,
        catalog: &dyn Catalog,
    ) -> Result<bool, Error> {
        if routine_id == INVALID_OID {
            return Err(Error::NoTarget);
        }
        let owner = catalog
            .routine_owner(routine_id)
            .ok_or(Error::RoutineNotFound(routine_id))?;
        if !caller.superuser && caller.role_id != owner {
            return Err(Error::InsufficientPrivilege);
        }

        self.registry_mut().add_local_breakpoint(routine_id, ANY_LINE)
    }
}
