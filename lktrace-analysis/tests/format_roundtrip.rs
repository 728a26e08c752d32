// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Writing histories with the tracer's serializer and parsing them back
//! must reproduce the records field-wise.

use lktrace_analysis::Trace;
use lktrace_common::wire::write_trace;
use lktrace_common::{EventKind, EventRecord};

fn ev(ts: u64, kind: EventKind, addr: u64, caller: u64) -> EventRecord {
    EventRecord {
        ts_ns: ts,
        kind,
        addr,
        caller,
    }
}

#[test]
fn writer_output_parses_back_to_the_same_records() {
    let main_hist = vec![
        ev(0, EventKind::ThrdSpawn, 0, 0x7000),
        ev(10, EventKind::LockReq, 0x1000, 0x4001),
        ev(12, EventKind::LockAcq, 0x1000, 0x4001),
        ev(14, EventKind::CondWait, 0x2000, 0x4005),
        ev(15, EventKind::LockRel, 0x1000, 0x4005),
        ev(40, EventKind::CondLeave, 0x2000, 0x4005),
        ev(41, EventKind::LockAcq, 0x1000, 0x4005),
        ev(45, EventKind::LockRel, 0x1000, 0x4006),
        ev(90, EventKind::ThrdExit, 0xaaa, 0x7000),
    ];
    let worker_hist = vec![
        ev(5, EventKind::ThrdSpawn, 0x5500, 0x4010),
        ev(20, EventKind::LockReq, 0x1000, 0x4011),
        ev(22, EventKind::LockErr, 0x1000, 0x4011),
        ev(30, EventKind::CondSignal, 0x2000, 0x4012),
        ev(80, EventKind::ThrdExit, 0xbbb, 0x4013),
    ];
    let threads: Vec<(u64, &[EventRecord])> = vec![
        (0xaaa, main_hist.as_slice()),
        (0xbbb, worker_hist.as_slice()),
    ];

    let mut buf = Vec::new();
    write_trace(&mut buf, &threads, &mut |pc| Ok(format!("sym_{pc:x}@f.c:1")))
        .unwrap();
    let text = String::from_utf8(buf).unwrap();

    let trace = Trace::parse(&text).unwrap();
    assert_eq!(trace.threads.len(), 2);
    assert_eq!(trace.threads[&0xaaa], main_hist);
    assert_eq!(trace.threads[&0xbbb], worker_hist);

    // every caller PC resolved through the name table
    for hist in trace.threads.values() {
        for event in hist {
            assert!(
                trace.caller_names.contains_key(&event.caller),
                "caller 0x{:x} missing from name table",
                event.caller
            );
        }
    }
    assert_eq!(trace.thread_hooks[&0xaaa], "<program entry point>");
    assert_eq!(trace.thread_hooks[&0xbbb], "sym_5500@f.c:1");
}

#[test]
fn empty_histories_are_skipped_not_serialized() {
    let hist = vec![
        ev(0, EventKind::ThrdSpawn, 0, 0x1),
        ev(1, EventKind::ThrdExit, 0xa, 0x1),
    ];
    let threads: Vec<(u64, &[EventRecord])> = vec![(0xa, hist.as_slice()), (0xb, &[])];
    let mut buf = Vec::new();
    write_trace(&mut buf, &threads, &mut |pc| Ok(format!("s{pc:x}"))).unwrap();
    let trace = Trace::parse(&String::from_utf8(buf).unwrap()).unwrap();
    assert_eq!(trace.threads.len(), 1);
}
