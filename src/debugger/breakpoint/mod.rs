//! Breakpoint registry.
//!
//! Two independent key spaces: the global tables, shared by every worker
//! through a [`SharedRegion`], and the local tables, private to one worker.
//! Each scope carries a break count table next to its breakpoints, so
//! "does this routine have any breakpoint" is a single lookup. Counts are
//! only ever changed together with the breakpoint set, under the same lock.

mod local;
mod region;

pub use region::{SharedRegion, MAX_CAPACITY};

use crate::debugger::error::Error;
use crate::pd_info;
use local::LocalTables;
use nix::unistd::Pid;
use region::{LockMode, RegionLock};
use std::collections::hash_map;
use strum_macros::{Display, EnumIter};

/// Object identifier of a database, package or routine.
pub type Oid = u32;

pub const INVALID_OID: Oid = 0;

/// Line number matching any line of a routine.
pub const ANY_LINE: i32 = -1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumIter)]
pub enum Scope {
    #[strum(serialize = "global")]
    Global,
    #[strum(serialize = "local")]
    Local,
}

/// Worker that a breakpoint applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Target {
    Any,
    Process(Pid),
}

impl Target {
    const ANY_RAW: i32 = -1;

    pub(crate) fn as_raw(self) -> i32 {
        match self {
            Target::Any => Self::ANY_RAW,
            Target::Process(pid) => pid.as_raw(),
        }
    }

    pub(crate) fn from_raw(raw: i32) -> Self {
        if raw == Self::ANY_RAW {
            Target::Any
        } else {
            Target::Process(Pid::from_raw(raw))
        }
    }
}

/// Identifies one potential stop point.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BreakpointKey {
    pub database_id: Oid,
    pub package_id: Option<Oid>,
    pub routine_id: Oid,
    pub line_number: i32,
    pub target: Target,
}

impl BreakpointKey {
    pub fn new(database_id: Oid, routine_id: Oid, line_number: i32, target: Target) -> Self {
        Self {
            database_id,
            package_id: None,
            routine_id,
            line_number,
            target,
        }
    }

    pub fn with_target(self, target: Target) -> Self {
        Self { target, ..self }
    }

    pub fn count_key(&self) -> BreakCountKey {
        BreakCountKey {
            database_id: self.database_id,
            routine_id: self.routine_id,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct BreakpointData {
    /// Port of a proxy already listening on localhost. `None` means the
    /// worker must listen itself and wait for a proxy to dial in.
    pub proxy_port: Option<u16>,
    /// Proxy owning this breakpoint.
    pub proxy_pid: Option<Pid>,
    /// A front-end is engaged with some worker for this breakpoint.
    pub busy: bool,
    pub temporary: bool,
}

impl BreakpointData {
    pub fn local() -> Self {
        Self::default()
    }

    pub fn global(proxy_port: u16, proxy_pid: Pid) -> Self {
        Self {
            proxy_port: Some(proxy_port),
            proxy_pid: Some(proxy_pid),
            ..Self::default()
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Breakpoint {
    pub key: BreakpointKey,
    pub data: BreakpointData,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BreakCountKey {
    pub database_id: Oid,
    pub routine_id: Oid,
}

/// Number of breakpoints sharing a (database, routine) pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BreakCount {
    pub key: BreakCountKey,
    pub count: u32,
}

/// Result of breakpoint resolution for a statement.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Stop {
    /// Matched breakpoint, `None` when stopping because of a step into request.
    pub breakpoint: Option<Breakpoint>,
    pub scope: Scope,
}

/// Raw table operations, no locking and no count bookkeeping.
pub(crate) trait Tables {
    fn find(&self, key: &BreakpointKey) -> Option<BreakpointData>;

    /// Store data under key. Return `true` if the key was not present.
    fn store(&mut self, key: &BreakpointKey, data: &BreakpointData) -> Result<bool, Error>;

    fn remove(&mut self, key: &BreakpointKey) -> bool;

    fn breakpoints(&self) -> Vec<Breakpoint>;

    fn count(&self, key: &BreakCountKey) -> Option<u32>;

    /// Set a count, zero removes the entry.
    fn set_count(&mut self, key: &BreakCountKey, count: u32) -> Result<(), Error>;

    fn counts(&self) -> Vec<BreakCount>;
}

fn insert_fresh(
    tables: &mut dyn Tables,
    key: &BreakpointKey,
    data: &BreakpointData,
) -> Result<bool, Error> {
    if tables.find(key).is_some() {
        return Ok(false);
    }
    let data = BreakpointData {
        busy: false,
        ..*data
    };
    tables.store(key, &data)?;
    let count_key = key.count_key();
    let count = tables.count(&count_key).unwrap_or(0);
    tables.set_count(&count_key, count + 1)?;
    Ok(true)
}

fn upsert(
    tables: &mut dyn Tables,
    key: &BreakpointKey,
    data: &BreakpointData,
) -> Result<bool, Error> {
    if tables.find(key).is_some() {
        tables.store(key, data)?;
        return Ok(false);
    }
    insert_fresh(tables, key, data)
}

fn remove_counted(tables: &mut dyn Tables, key: &BreakpointKey) -> Result<bool, Error> {
    if !tables.remove(key) {
        return Ok(false);
    }
    let count_key = key.count_key();
    if let Some(count) = tables.count(&count_key) {
        tables.set_count(&count_key, count.saturating_sub(1))?;
    }
    Ok(true)
}

/// Lock handle of a scope. For local scope it is a no-op.
enum ScopeLock {
    Global(#[allow(dead_code)] RegionLock),
    Local,
}

/// Iterates over breakpoints of one scope, holding the scope lock in shared
/// mode until dropped.
pub struct Cursor<'a> {
    source: CursorSource<'a>,
    _lock: ScopeLock,
}

enum CursorSource<'a> {
    Global { region: &'a SharedRegion, slot: usize },
    Local(hash_map::Iter<'a, BreakpointKey, BreakpointData>),
}

impl Iterator for Cursor<'_> {
    type Item = Breakpoint;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.source {
            CursorSource::Global { region, slot } => {
                while *slot < region.capacity() {
                    let current = *slot;
                    *slot += 1;
                    if let Some(breakpoint) = region.breakpoint_at(current) {
                        return Some(breakpoint);
                    }
                }
                None
            }
            CursorSource::Local(iter) => iter.next().map(|(key, data)| Breakpoint {
                key: *key,
                data: *data,
            }),
        }
    }
}

/// Breakpoint registry as seen by one worker.
pub struct Registry {
    global: SharedRegion,
    local: LocalTables,
    pid: Pid,
    database_id: Oid,
}

impl Registry {
    /// Create a registry for a worker.
    ///
    /// # Arguments
    ///
    /// * `global`: this worker's handle onto the shared region
    /// * `pid`: worker process id, used as a target of local breakpoints
    /// * `database_id`: database the worker is connected to
    pub fn new(global: SharedRegion, pid: Pid, database_id: Oid) -> Self {
        Self {
            global,
            local: LocalTables::default(),
            pid,
            database_id,
        }
    }

    pub fn database_id(&self) -> Oid {
        self.database_id
    }

    fn lock(&self, scope: Scope, mode: LockMode) -> Result<ScopeLock, Error> {
        Ok(match scope {
            Scope::Global => ScopeLock::Global(self.global.lock(mode)?),
            Scope::Local => ScopeLock::Local,
        })
    }

    fn tables(&self, scope: Scope) -> &dyn Tables {
        match scope {
            Scope::Global => &self.global,
            Scope::Local => &self.local,
        }
    }

    fn tables_mut(&mut self, scope: Scope) -> &mut dyn Tables {
        match scope {
            Scope::Global => &mut self.global,
            Scope::Local => &mut self.local,
        }
    }

    /// Exact key lookup.
    pub fn lookup(&self, scope: Scope, key: &BreakpointKey) -> Result<Option<Breakpoint>, Error> {
        let _lock = self.lock(scope, LockMode::Shared)?;
        Ok(self
            .tables(scope)
            .find(key)
            .map(|data| Breakpoint { key: *key, data }))
    }

    /// Return `true` if at least one breakpoint exists for a routine in the scope.
    pub fn exists_for_routine(
        &self,
        scope: Scope,
        database_id: Oid,
        routine_id: Oid,
    ) -> Result<bool, Error> {
        let key = BreakCountKey {
            database_id,
            routine_id,
        };
        let _lock = self.lock(scope, LockMode::Shared)?;
        Ok(self.tables(scope).count(&key).is_some())
    }

    /// Return `true` if any scope holds a breakpoint for a routine of the worker's database.
    pub fn breakpoints_for_routine(&self, routine_id: Oid) -> Result<bool, Error> {
        Ok(
            self.exists_for_routine(Scope::Local, self.database_id, routine_id)?
                || self.exists_for_routine(Scope::Global, self.database_id, routine_id)?,
        )
    }

    /// Insert a new breakpoint. Return `false` and change nothing if the key
    /// already exists. A fresh breakpoint is never busy.
    pub fn insert(
        &mut self,
        scope: Scope,
        key: &BreakpointKey,
        data: &BreakpointData,
    ) -> Result<bool, Error> {
        let _lock = self.lock(scope, LockMode::Exclusive)?;
        insert_fresh(self.tables_mut(scope), key, data)
    }

    /// Insert a breakpoint or overwrite data of an existing one (including
    /// `busy`). Return `true` only on a fresh insert.
    pub fn insert_or_update(
        &mut self,
        scope: Scope,
        key: &BreakpointKey,
        data: &BreakpointData,
    ) -> Result<bool, Error> {
        let _lock = self.lock(scope, LockMode::Exclusive)?;
        upsert(self.tables_mut(scope), key, data)
    }

    /// Remove a breakpoint. Return `false` if there is no such key.
    pub fn delete(&mut self, scope: Scope, key: &BreakpointKey) -> Result<bool, Error> {
        let _lock = self.lock(scope, LockMode::Exclusive)?;
        remove_counted(self.tables_mut(scope), key)
    }

    /// Mark all global breakpoints of a proxy as busy and copy them into the
    /// local tables targeted at this worker, so this worker keeps hitting
    /// them while other workers ignore them.
    pub fn mark_busy_for_proxy(&mut self, proxy_pid: Pid) -> Result<usize, Error> {
        let _lock = self.lock(Scope::Global, LockMode::Exclusive)?;
        let owned = owned_by(&self.global, proxy_pid);
        for breakpoint in &owned {
            let busy = BreakpointData {
                busy: true,
                ..breakpoint.data
            };
            self.global.store(&breakpoint.key, &busy)?;

            let local_key = breakpoint.key.with_target(Target::Process(self.pid));
            upsert(&mut self.local, &local_key, &breakpoint.data)?;
        }
        Ok(owned.len())
    }

    /// Clear `busy` on all global breakpoints of a proxy. Local copies stay.
    pub fn free_for_proxy(&mut self, proxy_pid: Pid) -> Result<usize, Error> {
        let _lock = self.lock(Scope::Global, LockMode::Exclusive)?;
        let owned = owned_by(&self.global, proxy_pid);
        for breakpoint in &owned {
            let free = BreakpointData {
                busy: false,
                ..breakpoint.data
            };
            self.global.store(&breakpoint.key, &free)?;
        }
        Ok(owned.len())
    }

    /// Remove all global breakpoints of a proxy.
    pub fn purge_for_proxy(&mut self, proxy_pid: Pid) -> Result<usize, Error> {
        let _lock = self.lock(Scope::Global, LockMode::Exclusive)?;
        let owned = owned_by(&self.global, proxy_pid);
        for breakpoint in &owned {
            remove_counted(&mut self.global, &breakpoint.key)?;
        }
        Ok(owned.len())
    }

    /// Iterate over breakpoints of a scope. The scope lock is held in shared
    /// mode while the cursor is alive, so writers of the scope wait for it.
    pub fn iter(&self, scope: Scope) -> Result<Cursor<'_>, Error> {
        let lock = self.lock(scope, LockMode::Shared)?;
        let source = match scope {
            Scope::Global => CursorSource::Global {
                region: &self.global,
                slot: 0,
            },
            Scope::Local => CursorSource::Local(self.local.iter()),
        };
        Ok(Cursor {
            source,
            _lock: lock,
        })
    }

    /// Snapshot of break counts of a scope.
    pub fn break_counts(&self, scope: Scope) -> Result<Vec<BreakCount>, Error> {
        let _lock = self.lock(scope, LockMode::Shared)?;
        Ok(self.tables(scope).counts())
    }

    /// Find a breakpoint where a worker should stop.
    ///
    /// Searches, in order: a free global breakpoint targeting this worker, a
    /// free global breakpoint targeting any worker, a local breakpoint.
    /// Local tables are searched last: they may keep stale copies of global
    /// breakpoints from a previous session.
    ///
    /// # Arguments
    ///
    /// * `routine_id`: routine being executed
    /// * `line_number`: line of the current statement
    /// * `step_into`: stop unconditionally (local scope, no breakpoint)
    pub fn find_active(
        &self,
        routine_id: Oid,
        line_number: i32,
        step_into: bool,
    ) -> Result<Option<Stop>, Error> {
        if step_into {
            return Ok(Some(Stop {
                breakpoint: None,
                scope: Scope::Local,
            }));
        }

        let own = BreakpointKey::new(
            self.database_id,
            routine_id,
            line_number,
            Target::Process(self.pid),
        );

        for key in [own, own.with_target(Target::Any)] {
            if let Some(breakpoint) = self.lookup(Scope::Global, &key)? {
                if !breakpoint.data.busy {
                    return Ok(Some(Stop {
                        breakpoint: Some(breakpoint),
                        scope: Scope::Global,
                    }));
                }
            }
        }

        Ok(self.lookup(Scope::Local, &own)?.map(|breakpoint| Stop {
            breakpoint: Some(breakpoint),
            scope: Scope::Local,
        }))
    }

    /// Add a breakpoint for this worker into the local tables.
    pub fn add_local_breakpoint(&mut self, routine_id: Oid, line_number: i32) -> Result<bool, Error> {
        let key = BreakpointKey::new(
            self.database_id,
            routine_id,
            line_number,
            Target::Process(self.pid),
        );
        self.insert(Scope::Local, &key, &BreakpointData::local())
    }

    /// Remove a breakpoint of this worker from the local tables.
    pub fn delete_local_breakpoint(
        &mut self,
        routine_id: Oid,
        line_number: i32,
    ) -> Result<bool, Error> {
        let key = BreakpointKey::new(
            self.database_id,
            routine_id,
            line_number,
            Target::Process(self.pid),
        );
        self.delete(Scope::Local, &key)
    }

    /// Write all breakpoints and break counts of a scope into the info log.
    /// Return the written lines.
    pub fn dump(&self, scope: Scope) -> Result<Vec<String>, Error> {
        let mut lines = vec![format!("breakpoints - {scope}")];
        for bp in self.iter(scope)? {
            lines.push(format!(
                "database({}) routine({}) line({}) target({}) proxy port({}) proxy pid({}) busy({}) tmp({})",
                bp.key.database_id,
                bp.key.routine_id,
                bp.key.line_number,
                bp.key.target.as_raw(),
                bp.data.proxy_port.map(i32::from).unwrap_or(-1),
                bp.data.proxy_pid.map(Pid::as_raw).unwrap_or(-1),
                if bp.data.busy { 'T' } else { 'F' },
                if bp.data.temporary { 'T' } else { 'F' },
            ));
        }

        lines.push(format!("break counts - {scope}"));
        for count in self.break_counts(scope)? {
            lines.push(format!(
                "database({}) routine({}) count({})",
                count.key.database_id, count.key.routine_id, count.count
            ));
        }

        for line in &lines {
            pd_info!(target: "registry", "{line}");
        }
        Ok(lines)
    }
}

fn owned_by(tables: &dyn Tables, proxy_pid: Pid) -> Vec<Breakpoint> {
    tables
        .breakpoints()
        .into_iter()
        .filter(|bp| bp.data.proxy_pid == Some(proxy_pid))
        .collect()
}
