use super::{BreakCount, BreakCountKey, Breakpoint, BreakpointData, BreakpointKey, Tables};
use crate::debugger::error::Error;
use std::collections::hash_map;
use std::collections::HashMap;

/// Breakpoint tables private to one worker. Maps allocate on first insert.
#[derive(Default, Debug)]
pub(super) struct LocalTables {
    breakpoints: HashMap<BreakpointKey, BreakpointData>,
    counts: HashMap<BreakCountKey, u32>,
}

impl LocalTables {
    pub(super) fn iter(&self) -> hash_map::Iter<'_, BreakpointKey, BreakpointData> {
        self.breakpoints.iter()
    }
}

impl Tables for LocalTables {
    fn find(&self, key: &BreakpointKey) -> Option<BreakpointData> {
        self.breakpoints.get(key).copied()
    }

    fn store(&mut self, key: &BreakpointKey, data: &BreakpointData) -> Result<bool, Error> {
        Ok(self.breakpoints.insert(*key, *data).is_none())
    }

    fn remove(&mut self, key: &BreakpointKey) -> bool {
        self.breakpoints.remove(key).is_some()
    }

    fn breakpoints(&self) -> Vec<Breakpoint> {
        self.breakpoints
            .iter()
            .map(|(key, data)| Breakpoint {
                key: *key,
                data: *data,
            })
            .collect()
    }

    fn count(&self, key: &BreakCountKey) -> Option<u32> {
        self.counts.get(key).copied()
    }

    fn set_count(&mut self, key: &BreakCountKey, count: u32) -> Result<(), Error> {
        if count == 0 {
            self.counts.remove(key);
        } else {
            self.counts.insert(*key, count);
        }
        Ok(())
    }

    fn counts(&self) -> Vec<BreakCount> {
        self.counts
            .iter()
            .map(|(key, count)| BreakCount {
                key: *key,
                count: *count,
            })
            .collect()
    }
}
