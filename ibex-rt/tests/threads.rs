//! Tests for global threads and the exit protocol.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ibex_abi::exit::{decode_exit, STACK_SENTINEL};
use ibex_abi::Qpd;
use ibex_rt::thread::GlobalThread;
use ibex_rt::{Env, Error};

#[test]
fn start_runs_entry_on_its_cpu() {
    let env = Env::new(2);
    let ran_on = Arc::new(AtomicUsize::new(usize::MAX));
    let seen = ran_on.clone();
    let env_in = env.clone();
    let t = GlobalThread::create(&env, 1, "probe", move || {
        seen.store(env_in.current_cpu(), Ordering::SeqCst);
    })
    .unwrap();

    // Nothing runs before start attaches a scheduling context.
    std::thread::sleep(std::time::Duration::from_millis(20));
    assert_eq!(ran_on.load(Ordering::SeqCst), usize::MAX);

    t.start(Qpd::default()).unwrap();
    t.join();
    assert_eq!(ran_on.load(Ordering::SeqCst), 1);
}

#[test]
fn start_is_once_only() {
    let env = Env::new(1);
    let t = GlobalThread::create(&env, 0, "once", || {}).unwrap();
    t.start(Qpd::default()).unwrap();
    assert_eq!(t.start(Qpd::default()), Err(Error::Exists));
    t.join();
}

#[test]
fn zero_quantum_is_rejected() {
    let env = Env::new(1);
    let t = GlobalThread::create(&env, 0, "bad", || {}).unwrap();
    assert_eq!(
        t.start(Qpd {
            quantum: 0,
            prio: 1
        }),
        Err(Error::ArgsInvalid)
    );
}

#[test]
fn out_of_range_cpu_is_rejected() {
    let env = Env::new(2);
    assert!(matches!(
        GlobalThread::create(&env, 2, "nope", || {}),
        Err(Error::ArgsInvalid)
    ));
}

#[test]
fn landing_reports_reclaim_record() {
    let env = Env::new(1);
    let t = GlobalThread::create(&env, 0, "short", || {}).unwrap();
    let tid = t.tid();
    t.start(Qpd::default()).unwrap();
    t.join();

    let reclaims = env.reclaimed();
    let record = reclaims
        .iter()
        .find(|r| r.tid == tid)
        .expect("thread exit must be reported");
    // The thread owned its stack and message buffer.
    assert_eq!(record.stack, 0);
    assert_eq!(record.utcb, 0);
    // The landing registers carry the sentinel bit.
    let regs = record.encode();
    assert_ne!(regs.0 & STACK_SENTINEL, 0);
}

#[test]
fn join_all_waits_for_every_thread() {
    let env = Env::new(2);
    let done = Arc::new(AtomicUsize::new(0));
    let mut threads = Vec::new();
    for cpu in 0..2 {
        let done = done.clone();
        let t = GlobalThread::create(&env, cpu, "worker", move || {
            std::thread::sleep(std::time::Duration::from_millis(10));
            done.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        t.start(Qpd::default()).unwrap();
        threads.push(t);
    }
    env.join_all();
    assert_eq!(done.load(Ordering::SeqCst), 2);
}

#[test]
fn process_exit_encodes_into_fault_address() {
    let env = Env::new(1);
    assert_eq!(env.exit_status(), None);
    env.exit(3);
    assert_eq!(env.exit_status(), Some(3));
    // The first exit wins.
    env.exit(7);
    assert_eq!(env.exit_status(), Some(3));
}

#[test]
fn exit_codes_wrap_at_the_sentinel_range() {
    let env = Env::new(1);
    env.exit(0x1000 + 5);
    assert_eq!(env.exit_status(), Some(5));
    // Sanity: the decode helper rejects non-sentinel addresses.
    assert_eq!(decode_exit(0x1234), None);
}
