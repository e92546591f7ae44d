use crate::common::{Group, DB};
use nix::unistd::Pid;
use pldbg::debugger::breakpoint::{
    BreakCountKey, BreakpointData, BreakpointKey, Oid, Scope, Stop, Target,
};
use pldbg::debugger::error::Error;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use strum::IntoEnumIterator;

const PROXY: i32 = 7000;

fn key(routine_id: Oid, line_number: i32, target: Target) -> BreakpointKey {
    BreakpointKey::new(DB, routine_id, line_number, target)
}

fn pid(raw: i32) -> Target {
    Target::Process(Pid::from_raw(raw))
}

#[test]
fn test_global_tables_shared_between_workers() {
    let group = Group::new(16);
    let mut first = group.registry(100);
    let mut second = group.registry(200);

    let k1 = key(10, 1, Target::Any);
    let k2 = key(10, 2, pid(200));
    let data = BreakpointData::global(5433, Pid::from_raw(PROXY));

    assert!(first.insert(Scope::Global, &k1, &data).unwrap());
    assert!(first.insert(Scope::Global, &k2, &data).unwrap());

    assert_eq!(second.lookup(Scope::Global, &k1).unwrap().unwrap().data, data);
    assert_eq!(second.lookup(Scope::Global, &k2).unwrap().unwrap().key, k2);
    assert!(second.exists_for_routine(Scope::Global, DB, 10).unwrap());

    assert!(second.delete(Scope::Global, &k1).unwrap());
    assert!(first.lookup(Scope::Global, &k1).unwrap().is_none());
    assert!(first.lookup(Scope::Global, &k2).unwrap().is_some());

    assert!(second.delete(Scope::Global, &k2).unwrap());
    assert!(!first.exists_for_routine(Scope::Global, DB, 10).unwrap());
    assert!(!second.delete(Scope::Global, &k2).unwrap());
}

#[test]
fn test_local_tables_are_private() {
    let group = Group::new(16);
    let mut first = group.registry(100);
    let second = group.registry(200);

    assert!(first.add_local_breakpoint(10, 3).unwrap());
    assert!(first.breakpoints_for_routine(10).unwrap());
    assert!(!second.breakpoints_for_routine(10).unwrap());
    assert!(!first.exists_for_routine(Scope::Global, DB, 10).unwrap());

    assert!(first.delete_local_breakpoint(10, 3).unwrap());
    assert!(!first.breakpoints_for_routine(10).unwrap());
}

#[test]
fn test_duplicate_insert_keeps_first() {
    for scope in Scope::iter() {
        let group = Group::new(16);
        let mut registry = group.registry(100);
        let k = key(10, 1, Target::Any);

        let first = BreakpointData {
            busy: true,
            temporary: true,
            ..BreakpointData::local()
        };
        let second = BreakpointData::global(5433, Pid::from_raw(PROXY));

        assert!(registry.insert(scope, &k, &first).unwrap());
        assert!(!registry.insert(scope, &k, &second).unwrap());

        let stored = registry.lookup(scope, &k).unwrap().unwrap().data;
        assert!(!stored.busy, "{}", scope);
        assert!(stored.temporary, "{}", scope);
        assert_eq!(stored.proxy_port, None, "{}", scope);

        // overwrite keeps caller's busy flag and does not count twice
        assert!(!registry.insert_or_update(scope, &k, &first).unwrap());
        assert!(registry.lookup(scope, &k).unwrap().unwrap().data.busy);
        let counts = registry.break_counts(scope).unwrap();
        assert_eq!(counts.len(), 1, "{}", scope);
        assert_eq!(counts[0].count, 1, "{}", scope);
    }
}

#[test]
fn test_break_count_matches_breakpoint_set() {
    let group = Group::new(32);
    let mut registry = group.registry(100);
    let data = BreakpointData::local();

    let ops: Vec<(bool, BreakpointKey)> = vec![
        (true, key(10, 1, Target::Any)),
        (true, key(10, 2, Target::Any)),
        (true, key(10, 2, pid(100))),
        (true, key(11, 1, Target::Any)),
        (true, key(10, 1, Target::Any)),
        (false, key(10, 2, Target::Any)),
        (false, key(12, 1, Target::Any)),
        (true, key(12, 7, pid(300))),
        (false, key(11, 1, Target::Any)),
        (false, key(10, 1, Target::Any)),
        (true, key(11, 9, Target::Any)),
    ];

    for scope in Scope::iter() {
        for (insert, k) in &ops {
            if *insert {
                registry.insert(scope, k, &data).unwrap();
            } else {
                registry.delete(scope, k).unwrap();
            }

            let mut expected: HashMap<Oid, u32> = HashMap::new();
            for bp in registry.iter(scope).unwrap() {
                *expected.entry(bp.key.routine_id).or_default() += 1;
            }

            let counts = registry.break_counts(scope).unwrap();
            assert_eq!(counts.len(), expected.len());
            for count in counts {
                assert!(count.count > 0);
                assert_eq!(Some(&count.count), expected.get(&count.key.routine_id));
            }
            for routine_id in [10, 11, 12] {
                assert_eq!(
                    registry.exists_for_routine(scope, DB, routine_id).unwrap(),
                    expected.contains_key(&routine_id)
                );
            }
        }
    }

    let counts = registry.break_counts(Scope::Global).unwrap();
    let remaining: Vec<_> = counts
        .iter()
        .map(|c| (c.key, c.count))
        .filter(|(k, _)| k.routine_id == 10)
        .collect();
    assert_eq!(
        remaining,
        vec![(
            BreakCountKey {
                database_id: DB,
                routine_id: 10
            },
            1
        )]
    );
}

#[test]
fn test_busy_marking_follows_proxy() {
    let group = Group::new(16);
    let mut worker = group.registry(100);
    let mut other = group.registry(200);
    let proxy = Pid::from_raw(PROXY);

    let owned = [key(10, 1, Target::Any), key(10, 5, pid(100))];
    let foreign = key(11, 1, Target::Any);
    for k in &owned {
        other
            .insert(Scope::Global, k, &BreakpointData::global(5433, proxy))
            .unwrap();
    }
    other
        .insert(
            Scope::Global,
            &foreign,
            &BreakpointData::global(5434, Pid::from_raw(PROXY + 1)),
        )
        .unwrap();

    assert_eq!(worker.mark_busy_for_proxy(proxy).unwrap(), 2);
    for k in &owned {
        assert!(other.lookup(Scope::Global, k).unwrap().unwrap().data.busy);

        let copy = worker
            .lookup(Scope::Local, &k.with_target(pid(100)))
            .unwrap()
            .unwrap();
        assert_eq!(copy.data.proxy_pid, Some(proxy));
        assert!(!copy.data.busy);
    }
    assert!(!other.lookup(Scope::Global, &foreign).unwrap().unwrap().data.busy);
    assert_eq!(worker.break_counts(Scope::Local).unwrap()[0].count, 2);
    assert!(other.iter(Scope::Local).unwrap().next().is_none());

    // busy breakpoints do not match for other workers
    assert_eq!(other.find_active(10, 1, false).unwrap(), None);
    // but the attached worker keeps stopping through its local copy
    let stop = worker.find_active(10, 1, false).unwrap().unwrap();
    assert_eq!(stop.scope, Scope::Local);

    assert_eq!(other.free_for_proxy(proxy).unwrap(), 2);
    for k in &owned {
        assert!(!worker.lookup(Scope::Global, k).unwrap().unwrap().data.busy);
    }
    assert_eq!(worker.iter(Scope::Local).unwrap().count(), 2);

    assert_eq!(other.purge_for_proxy(proxy).unwrap(), 2);
    assert!(worker.lookup(Scope::Global, &owned[0]).unwrap().is_none());
    assert!(worker.lookup(Scope::Global, &foreign).unwrap().is_some());
    let counts = worker.break_counts(Scope::Global).unwrap();
    assert_eq!(counts.len(), 1);
    assert_eq!(counts[0].key.routine_id, 11);
}

#[test]
fn test_resolution_order() {
    let group = Group::new(16);
    let mut registry = group.registry(100);
    let proxy = Pid::from_raw(PROXY);

    let own = key(10, 4, pid(100));
    let any = key(10, 4, Target::Any);

    registry
        .insert(Scope::Global, &own, &BreakpointData::global(1000, proxy))
        .unwrap();
    registry
        .insert(Scope::Global, &any, &BreakpointData::global(2000, proxy))
        .unwrap();
    registry.add_local_breakpoint(10, 4).unwrap();

    let found = |registry: &pldbg::debugger::breakpoint::Registry| -> Stop {
        registry.find_active(10, 4, false).unwrap().unwrap()
    };
    let busy = |port| BreakpointData {
        busy: true,
        ..BreakpointData::global(port, proxy)
    };

    let stop = found(&registry);
    assert_eq!(stop.scope, Scope::Global);
    assert_eq!(stop.breakpoint.unwrap().key, own);

    registry
        .insert_or_update(Scope::Global, &own, &busy(1000))
        .unwrap();
    let stop = found(&registry);
    assert_eq!(stop.scope, Scope::Global);
    assert_eq!(stop.breakpoint.unwrap().key, any);

    registry
        .insert_or_update(Scope::Global, &any, &busy(2000))
        .unwrap();
    let stop = found(&registry);
    assert_eq!(stop.scope, Scope::Local);
    assert_eq!(stop.breakpoint.unwrap().key, own);

    assert_eq!(registry.find_active(10, 5, false).unwrap(), None);
    assert_eq!(
        registry.find_active(99, 1, true).unwrap(),
        Some(Stop {
            breakpoint: None,
            scope: Scope::Local
        })
    );
}

#[test]
fn test_cursor_blocks_writers() {
    let group = Group::new(16);
    let mut reader = group.registry(100);
    let mut writer = group.registry(200);
    reader.add_local_breakpoint(1, 1).unwrap();
    writer
        .insert(
            Scope::Global,
            &key(10, 1, Target::Any),
            &BreakpointData::local(),
        )
        .unwrap();

    let cursor = reader.iter(Scope::Global).unwrap();
    let done = Arc::new(AtomicBool::new(false));

    let handle = {
        let done = done.clone();
        thread::spawn(move || {
            writer
                .insert(
                    Scope::Global,
                    &key(10, 2, Target::Any),
                    &BreakpointData::local(),
                )
                .unwrap();
            done.store(true, Ordering::SeqCst);
        })
    };

    thread::sleep(Duration::from_millis(200));
    assert!(!done.load(Ordering::SeqCst));
    assert_eq!(cursor.count(), 1);

    handle.join().unwrap();
    assert!(done.load(Ordering::SeqCst));
    assert_eq!(reader.iter(Scope::Global).unwrap().count(), 2);

    // local cursor takes no lock
    let local = reader.iter(Scope::Local).unwrap();
    reader_side_insert(&group);
    assert_eq!(local.count(), 1);
}

fn reader_side_insert(group: &Group) {
    let mut registry = group.registry(300);
    registry
        .insert(
            Scope::Global,
            &key(10, 3, Target::Any),
            &BreakpointData::local(),
        )
        .unwrap();
}

#[test]
fn test_full_region() {
    let group = Group::new(2);
    let mut registry = group.registry(100);
    let data = BreakpointData::local();

    assert!(registry
        .insert(Scope::Global, &key(10, 1, Target::Any), &data)
        .unwrap());
    assert!(registry
        .insert(Scope::Global, &key(10, 2, Target::Any), &data)
        .unwrap());
    assert!(matches!(
        registry.insert(Scope::Global, &key(10, 3, Target::Any), &data),
        Err(Error::RegionFull(2))
    ));

    // failed insert leaves counts consistent
    assert_eq!(registry.break_counts(Scope::Global).unwrap()[0].count, 2);
    assert!(registry
        .delete(Scope::Global, &key(10, 1, Target::Any))
        .unwrap());
    assert!(registry
        .insert(Scope::Global, &key(10, 3, Target::Any), &data)
        .unwrap());
}

#[test]
fn test_dump() {
    let group = Group::new(4);
    let mut registry = group.registry(100);
    registry.add_local_breakpoint(10, 1).unwrap();
    registry
        .insert(
            Scope::Global,
            &key(12, 4, Target::Any),
            &BreakpointData::global(9000, Pid::from_raw(PROXY)),
        )
        .unwrap();

    assert_eq!(
        registry.dump(Scope::Local).unwrap(),
        vec![
            "breakpoints - local",
            "database(5) routine(10) line(1) target(100) proxy port(-1) proxy pid(-1) busy(F) tmp(F)",
            "break counts - local",
            "database(5) routine(10) count(1)",
        ]
    );
    assert_eq!(
        registry.dump(Scope::Global).unwrap(),
        vec![
            "breakpoints - global",
            "database(5) routine(12) line(4) target(-1) proxy port(9000) proxy pid(7000) busy(F) tmp(F)",
            "break counts - global",
            "database(5) routine(12) count(1)",
        ]
    );
}
