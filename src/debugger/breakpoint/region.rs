//! Fixed-capacity breakpoint tables living in a file-backed shared mapping.
//!
//! Region layout (all integers big-endian):
//!
//! ```text
//! [ header: magic "PLBR" | layout version u32 | capacity u32 | reserved u32 ]
//! [ capacity x breakpoint slot (32 bytes) ]
//! [ capacity x break count slot (16 bytes) ]
//! ```
//!
//! Every slot starts with a state byte followed by the encoded key and value.
//! Slots are addressed by open addressing with linear probing, deleted slots
//! become tombstones so probe chains stay intact.

use super::{BreakCount, BreakCountKey, Breakpoint, BreakpointData, BreakpointKey, Tables, Target};
use crate::debugger::error::Error;
use crate::{pd_info, weak_error};
use bytes::{Buf, BufMut};
use memmap2::{MmapMut, MmapOptions};
use nix::errno::Errno;
use nix::fcntl::{flock, FlockArg};
use nix::unistd::Pid;
use std::fs::{File, OpenOptions};
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

const MAGIC: &[u8; 4] = b"PLBR";
const LAYOUT_VERSION: u32 = 1;
const HEADER_SIZE: usize = 16;

const BREAKPOINT_SLOT_SIZE: usize = 32;
const BREAKPOINT_KEY_SIZE: usize = 21;
const COUNT_SLOT_SIZE: usize = 16;
const COUNT_KEY_SIZE: usize = 8;

/// Upper bound of region capacity.
pub const MAX_CAPACITY: usize = 1 << 20;

const NO_VALUE: i32 = -1;

#[derive(Clone, Copy, PartialEq, Debug)]
#[repr(u8)]
enum SlotState {
    Empty = 0,
    Used = 1,
    Deleted = 2,
}

impl SlotState {
    fn from_byte(b: u8) -> Self {
        match b {
            1 => SlotState::Used,
            2 => SlotState::Deleted,
            _ => SlotState::Empty,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub(super) enum LockMode {
    Shared,
    Exclusive,
}

/// Advisory lock over the whole region, released on drop.
pub(super) struct RegionLock {
    fd: RawFd,
}

impl Drop for RegionLock {
    fn drop(&mut self) {
        weak_error!(
            flock(self.fd, FlockArg::Unlock),
            "release breakpoint region lock:"
        );
    }
}

/// One table of fixed-size slots inside the mapping.
#[derive(Clone, Copy, Debug)]
struct SlotTable {
    base: usize,
    slot_size: usize,
    key_size: usize,
    capacity: usize,
}

impl SlotTable {
    fn slot<'m>(&self, map: &'m [u8], slot: usize) -> &'m [u8] {
        let offset = self.base + slot * self.slot_size;
        &map[offset..offset + self.slot_size]
    }

    fn slot_mut<'m>(&self, map: &'m mut [u8], slot: usize) -> &'m mut [u8] {
        let offset = self.base + slot * self.slot_size;
        &mut map[offset..offset + self.slot_size]
    }

    fn value<'m>(&self, map: &'m [u8], slot: usize) -> &'m [u8] {
        &self.slot(map, slot)[1 + self.key_size..]
    }

    fn state(&self, map: &[u8], slot: usize) -> SlotState {
        SlotState::from_byte(self.slot(map, slot)[0])
    }

    fn probe(&self, raw_key: &[u8]) -> impl Iterator<Item = usize> {
        let capacity = self.capacity;
        let start = (fnv1a(raw_key) % capacity as u64) as usize;
        (0..capacity).map(move |i| (start + i) % capacity)
    }

    fn find(&self, map: &[u8], raw_key: &[u8]) -> Option<usize> {
        for slot in self.probe(raw_key) {
            let bytes = self.slot(map, slot);
            match SlotState::from_byte(bytes[0]) {
                SlotState::Empty => return None,
                SlotState::Deleted => continue,
                SlotState::Used => {
                    if &bytes[1..1 + self.key_size] == raw_key {
                        return Some(slot);
                    }
                }
            }
        }
        None
    }

    /// First slot on the probe path that may take a new key.
    fn vacant(&self, map: &[u8], raw_key: &[u8]) -> Option<usize> {
        self.probe(raw_key)
            .find(|&slot| self.state(map, slot) != SlotState::Used)
    }

    fn write<'m>(&self, map: &'m mut [u8], slot: usize, raw_key: &[u8]) -> &'m mut [u8] {
        let key_size = self.key_size;
        let bytes = self.slot_mut(map, slot);
        bytes[0] = SlotState::Used as u8;
        bytes[1..1 + key_size].copy_from_slice(raw_key);
        &mut bytes[1 + key_size..]
    }

    fn release(&self, map: &mut [u8], slot: usize) {
        self.slot_mut(map, slot)[0] = SlotState::Deleted as u8;
    }
}

/// A worker's handle onto the shared breakpoint region.
///
/// Every handle owns its own descriptor, so the advisory lock works between
/// workers in different processes as well as between handles inside one
/// process.
pub struct SharedRegion {
    path: PathBuf,
    file: File,
    map: MmapMut,
    capacity: usize,
    breakpoints: SlotTable,
    counts: SlotTable,
}

impl SharedRegion {
    /// Allocate a region for `capacity` breakpoints. Must be called once, at
    /// process-group startup, before any worker opens the region.
    ///
    /// # Arguments
    ///
    /// * `path`: backing file, created or truncated
    /// * `capacity`: maximum number of global breakpoints
    pub fn create(path: impl AsRef<Path>, capacity: usize) -> Result<Self, Error> {
        let path = path.as_ref();
        if capacity == 0 || capacity > MAX_CAPACITY {
            return Err(Error::RegionCapacity(capacity));
        }

        let len = region_len(capacity);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(Error::RegionAlloc)?;
        file.set_len(len as u64).map_err(Error::RegionAlloc)?;

        // SAFETY: the file was just sized to `len`, and every access goes through
        // bounds-checked slices under the region lock.
        let mut map = unsafe { MmapOptions::new().len(len).map_mut(&file) }
            .map_err(Error::RegionAlloc)?;

        let mut header = &mut map[..HEADER_SIZE];
        header.put_slice(MAGIC);
        header.put_u32(LAYOUT_VERSION);
        header.put_u32(capacity as u32);
        header.put_u32(0);

        pd_info!(
            target: "registry",
            "shared breakpoint region {} allocated, capacity {capacity}",
            path.display()
        );

        Ok(Self::from_parts(path.to_path_buf(), file, map, capacity))
    }

    /// Open a region previously allocated by [`SharedRegion::create`].
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len() as usize;
        if len < HEADER_SIZE {
            return Err(Error::RegionLayout("region is smaller than its header"));
        }

        // SAFETY: length is taken from the file itself, the header is validated below.
        let map = unsafe { MmapOptions::new().len(len).map_mut(&file) }?;

        let mut header = &map[..HEADER_SIZE];
        let mut magic = [0u8; 4];
        header.copy_to_slice(&mut magic);
        if &magic != MAGIC {
            return Err(Error::RegionLayout("bad magic"));
        }
        if header.get_u32() != LAYOUT_VERSION {
            return Err(Error::RegionLayout("unsupported layout version"));
        }
        let capacity = header.get_u32() as usize;
        if capacity == 0 || capacity > MAX_CAPACITY || region_len(capacity) != len {
            return Err(Error::RegionLayout("capacity does not match region size"));
        }

        Ok(Self::from_parts(path.to_path_buf(), file, map, capacity))
    }

    fn from_parts(path: PathBuf, file: File, map: MmapMut, capacity: usize) -> Self {
        let breakpoints = SlotTable {
            base: HEADER_SIZE,
            slot_size: BREAKPOINT_SLOT_SIZE,
            key_size: BREAKPOINT_KEY_SIZE,
            capacity,
        };
        let counts = SlotTable {
            base: HEADER_SIZE + capacity * BREAKPOINT_SLOT_SIZE,
            slot_size: COUNT_SLOT_SIZE,
            key_size: COUNT_KEY_SIZE,
            capacity,
        };
        Self {
            path,
            file,
            map,
            capacity,
            breakpoints,
            counts,
        }
    }

    /// Maximum number of breakpoints the region can hold.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(super) fn lock(&self, mode: LockMode) -> Result<RegionLock, Error> {
        let fd = self.file.as_raw_fd();
        loop {
            let arg = match mode {
                LockMode::Shared => FlockArg::LockShared,
                LockMode::Exclusive => FlockArg::LockExclusive,
            };
            match flock(fd, arg) {
                Ok(()) => return Ok(RegionLock { fd }),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(Error::Syscall("flock", e)),
            }
        }
    }

    /// Breakpoint stored at `slot`, if the slot is in use.
    pub(super) fn breakpoint_at(&self, slot: usize) -> Option<Breakpoint> {
        let map = &self.map[..];
        if self.breakpoints.state(map, slot) != SlotState::Used {
            return None;
        }
        let mut bytes = &self.breakpoints.slot(map, slot)[1..];
        let key = get_key(&mut bytes);
        let data = get_data(&mut bytes);
        Some(Breakpoint { key, data })
    }
}

impl Tables for SharedRegion {
    fn find(&self, key: &BreakpointKey) -> Option<BreakpointData> {
        let map = &self.map[..];
        let slot = self.breakpoints.find(map, &encode_key(key))?;
        let mut value = self.breakpoints.value(map, slot);
        Some(get_data(&mut value))
    }

    fn store(&mut self, key: &BreakpointKey, data: &BreakpointData) -> Result<bool, Error> {
        let raw = encode_key(key);
        let table = self.breakpoints;
        let (slot, fresh) = match table.find(&self.map[..], &raw) {
            Some(slot) => (slot, false),
            None => {
                let slot = table
                    .vacant(&self.map[..], &raw)
                    .ok_or(Error::RegionFull(self.capacity))?;
                (slot, true)
            }
        };
        let mut value = table.write(&mut self.map[..], slot, &raw);
        put_data(&mut value, data);
        Ok(fresh)
    }

    fn remove(&mut self, key: &BreakpointKey) -> bool {
        let table = self.breakpoints;
        match table.find(&self.map[..], &encode_key(key)) {
            Some(slot) => {
                table.release(&mut self.map[..], slot);
                true
            }
            None => false,
        }
    }

    fn breakpoints(&self) -> Vec<Breakpoint> {
        (0..self.capacity)
            .filter_map(|slot| self.breakpoint_at(slot))
            .collect()
    }

    fn count(&self, key: &BreakCountKey) -> Option<u32> {
        let map = &self.map[..];
        let slot = self.counts.find(map, &encode_count_key(key))?;
        Some(self.counts.value(map, slot).get_u32())
    }

    fn set_count(&mut self, key: &BreakCountKey, count: u32) -> Result<(), Error> {
        let raw = encode_count_key(key);
        let table = self.counts;
        match (table.find(&self.map[..], &raw), count) {
            (Some(slot), 0) => table.release(&mut self.map[..], slot),
            (None, 0) => {}
            (Some(slot), count) => {
                table.write(&mut self.map[..], slot, &raw).put_u32(count);
            }
            (None, count) => {
                let slot = table
                    .vacant(&self.map[..], &raw)
                    .ok_or(Error::RegionFull(self.capacity))?;
                table.write(&mut self.map[..], slot, &raw).put_u32(count);
            }
        }
        Ok(())
    }

    fn counts(&self) -> Vec<BreakCount> {
        let map = &self.map[..];
        (0..self.capacity)
            .filter(|&slot| self.counts.state(map, slot) == SlotState::Used)
            .map(|slot| {
                let mut bytes = &self.counts.slot(map, slot)[1..];
                let database_id = bytes.get_u32();
                let routine_id = bytes.get_u32();
                BreakCount {
                    key: BreakCountKey {
                        database_id,
                        routine_id,
                    },
                    count: bytes.get_u32(),
                }
            })
            .collect()
    }
}

fn region_len(capacity: usize) -> usize {
    HEADER_SIZE + capacity * (BREAKPOINT_SLOT_SIZE + COUNT_SLOT_SIZE)
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325, |hash, b| {
        (hash ^ u64::from(*b)).wrapping_mul(0x0100_0000_01b3)
    })
}

fn encode_key(key: &BreakpointKey) -> [u8; BREAKPOINT_KEY_SIZE] {
    let mut raw = [0u8; BREAKPOINT_KEY_SIZE];
    let mut buf = &mut raw[..];
    buf.put_u32(key.database_id);
    match key.package_id {
        Some(package_id) => {
            buf.put_u8(1);
            buf.put_u32(package_id);
        }
        None => {
            buf.put_u8(0);
            buf.put_u32(0);
        }
    }
    buf.put_u32(key.routine_id);
    buf.put_i32(key.line_number);
    buf.put_i32(key.target.as_raw());
    raw
}

fn get_key(buf: &mut impl Buf) -> BreakpointKey {
    let database_id = buf.get_u32();
    let has_package = buf.get_u8() != 0;
    let package_id = buf.get_u32();
    BreakpointKey {
        database_id,
        package_id: has_package.then_some(package_id),
        routine_id: buf.get_u32(),
        line_number: buf.get_i32(),
        target: Target::from_raw(buf.get_i32()),
    }
}

fn put_data(buf: &mut impl BufMut, data: &BreakpointData) {
    buf.put_i32(data.proxy_port.map(i32::from).unwrap_or(NO_VALUE));
    buf.put_i32(data.proxy_pid.map(Pid::as_raw).unwrap_or(NO_VALUE));
    buf.put_u8(data.busy as u8);
    buf.put_u8(data.temporary as u8);
}

fn get_data(buf: &mut impl Buf) -> BreakpointData {
    let port = buf.get_i32();
    let pid = buf.get_i32();
    BreakpointData {
        proxy_port: u16::try_from(port).ok(),
        proxy_pid: (pid > 0).then(|| Pid::from_raw(pid)),
        busy: buf.get_u8() != 0,
        temporary: buf.get_u8() != 0,
    }
}

fn encode_count_key(key: &BreakCountKey) -> [u8; COUNT_KEY_SIZE] {
    let mut raw = [0u8; COUNT_KEY_SIZE];
    let mut buf = &mut raw[..];
    buf.put_u32(key.database_id);
    buf.put_u32(key.routine_id);
    raw
}
