//! Tests for services, sessions and the registration protocol.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Barrier, Mutex};
use std::time::Duration;

use ibex_abi::cpu::CpuSet;
use ibex_abi::dataspace::Perm;
use ibex_abi::error::ErrorCode;
use ibex_abi::protocol::{ParentCmd, SessionCmd};
use ibex_abi::Qpd;
use ibex_rt::ipc::{
    ClientSession, Connection, Consumer, Producer, Service, ServiceConfig, SessionData,
};
use ibex_rt::mem::Dataspace;
use ibex_rt::sync::Sm;
use ibex_rt::thread::GlobalThread;
use ibex_rt::utcb::UtcbFrame;
use ibex_rt::{Env, Error};

const CMD_ECHO: u64 = SessionCmd::FIRST_CUSTOM;
const CMD_SLOW: u64 = SessionCmd::FIRST_CUSTOM + 1;

/// A service answering `CMD_ECHO x` with `x + 1`.
fn echo_service(env: &Env, name: &str, max_sessions: usize) -> Service<()> {
    let service = Service::new(
        env,
        name,
        ServiceConfig { max_sessions },
        |_args| Ok(()),
        |_session, frame| {
            let cmd: u64 = frame.get()?;
            if cmd != CMD_ECHO {
                return Err(Error::ArgsInvalid);
            }
            let value: u64 = frame.get()?;
            frame.finish_input()?;
            frame.put(ErrorCode::Success);
            frame.put(value + 1);
            Ok(())
        },
    )
    .unwrap();
    service
}

#[test]
fn open_call_close() {
    let env = Env::new(2);
    let service = echo_service(&env, "echo", 4);
    service.provide(&CpuSet::first(2)).unwrap();
    service.reg().unwrap();

    let conn = Connection::open(&env, "echo").unwrap();
    assert_eq!(conn.cpus(), CpuSet::first(2));
    let session = ClientSession::open(&conn, "hello").unwrap();

    let mut frame = UtcbFrame::new();
    frame.put(CMD_ECHO);
    frame.put(41u64);
    session.call(&mut frame).unwrap();
    frame.check_reply().unwrap();
    assert_eq!(frame.get::<u64>().unwrap(), 42);

    session.close().unwrap();
    assert!(service.get_session(0).is_none());
}

#[test]
fn unknown_command_clears_frame_and_replies_error() {
    let env = Env::new(1);
    let service = echo_service(&env, "strict", 4);
    service.provide_on(0).unwrap();
    service.reg().unwrap();

    let conn = Connection::open(&env, "strict").unwrap();
    let session = ClientSession::open(&conn, "").unwrap();

    let mut frame = UtcbFrame::new();
    frame.put(0xdeadu64);
    frame.put(1u64);
    frame.put(2u64);
    session.call(&mut frame).unwrap();
    assert_eq!(frame.check_reply(), Err(Error::ArgsInvalid));
    // On error the frame carries nothing but the code.
    assert_eq!(frame.remaining(), 0);
}

#[test]
fn lookup_is_per_cpu() {
    let env = Env::new(4);
    let service = echo_service(&env, "sparse", 4);
    service.provide_on(0).unwrap();
    service.provide_on(2).unwrap();
    service.reg().unwrap();

    // CPU 0 (this thread) is covered.
    let conn = Connection::open(&env, "sparse").unwrap();
    let mut expected = CpuSet::empty();
    expected.set(0);
    expected.set(2);
    assert_eq!(conn.cpus(), expected);

    // CPU 1 is not.
    let (tx, rx) = mpsc::channel();
    let env1 = env.clone();
    let t = GlobalThread::create(&env, 1, "lookup1", move || {
        tx.send(Connection::open(&env1, "sparse").map(|_| ())).unwrap();
    })
    .unwrap();
    t.start(Qpd::default()).unwrap();
    t.join();
    assert_eq!(rx.recv().unwrap(), Err(Error::NotFound));

    // CPU 2 is covered again.
    let (tx, rx) = mpsc::channel();
    let env2 = env.clone();
    let t = GlobalThread::create(&env, 2, "lookup2", move || {
        tx.send(Connection::open(&env2, "sparse").map(|_| ())).unwrap();
    })
    .unwrap();
    t.start(Qpd::default()).unwrap();
    t.join();
    assert_eq!(rx.recv().unwrap(), Ok(()));

    // Unknown names miss everywhere.
    assert!(matches!(
        Connection::open(&env, "nosuch"),
        Err(Error::NotFound)
    ));
}

#[test]
fn registration_is_idempotent_per_name() {
    let env = Env::new(2);
    let service = echo_service(&env, "dup", 4);
    service.provide(&CpuSet::first(2)).unwrap();
    service.reg().unwrap();
    // Retrying after a recoverable failure must succeed.
    service.reg().unwrap();

    // A different service under the same name collides.
    let other = echo_service(&env, "dup", 4);
    other.provide(&CpuSet::first(2)).unwrap();
    assert_eq!(other.reg(), Err(Error::Exists));
}

#[test]
fn reply_delegation_requires_a_window() {
    let env = Env::new(1);
    let service = echo_service(&env, "windowless", 4);
    service.provide_on(0).unwrap();
    service.reg().unwrap();

    // A lookup reply delegates the registration portal; without a receive
    // window the call must fail instead of silently dropping capabilities.
    let mut frame = UtcbFrame::new();
    frame.put(ParentCmd::SvcLookup);
    frame.put_str("windowless");
    assert_eq!(
        env.call(env.parent_pt(0).unwrap(), &mut frame),
        Err(Error::ArgsInvalid)
    );
}

#[test]
fn session_table_capacity_and_slot_reuse() {
    let env = Env::new(2);
    let service = echo_service(&env, "twoslots", 2);
    service.provide(&CpuSet::first(2)).unwrap();
    service.reg().unwrap();

    // Two CPUs race to open; with two slots both must win.
    let barrier = Arc::new(Barrier::new(2));
    let (tx, rx) = mpsc::channel();
    let mut threads = Vec::new();
    for cpu in 0..2usize {
        let env = env.clone();
        let barrier = barrier.clone();
        let tx = tx.clone();
        let t = GlobalThread::create(&env.clone(), cpu, "opener", move || {
            let conn = Connection::open(&env, "twoslots").unwrap();
            barrier.wait();
            tx.send(ClientSession::open(&conn, "")).unwrap();
        })
        .unwrap();
        t.start(Qpd::default()).unwrap();
        threads.push(t);
    }
    for t in &threads {
        t.join();
    }
    let first = rx.recv().unwrap().unwrap();
    let second = rx.recv().unwrap().unwrap();
    assert_ne!(first.id(), second.id());

    // The table is full now.
    let conn = Connection::open(&env, "twoslots").unwrap();
    assert_eq!(
        ClientSession::open(&conn, "").map(|_| ()),
        Err(Error::Capacity)
    );

    // Closing one vacates its slot for the next open.
    let vacated = first.id();
    first.close().unwrap();
    let reopened = ClientSession::open(&conn, "").unwrap();
    assert_eq!(reopened.id(), vacated);
}

// ---------------------------------------------------------------------------
// Invalidate ordering under in-flight dispatch
// ---------------------------------------------------------------------------

struct SlowSession {
    entered: Arc<AtomicBool>,
    release: Arc<AtomicBool>,
    invalidations: Arc<AtomicUsize>,
    alive: Arc<AtomicUsize>,
}

impl SessionData for SlowSession {
    fn invalidate(&self) {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
    }
}

impl Drop for SlowSession {
    fn drop(&mut self) {
        self.alive.fetch_sub(1, Ordering::SeqCst);
    }
}

#[test]
fn remove_during_dispatch_defers_destruction() {
    let env = Env::new(2);
    let entered = Arc::new(AtomicBool::new(false));
    let release = Arc::new(AtomicBool::new(false));
    let invalidations = Arc::new(AtomicUsize::new(0));
    let alive = Arc::new(AtomicUsize::new(0));

    let service = {
        let (entered, release) = (entered.clone(), release.clone());
        let (invalidations, alive) = (invalidations.clone(), alive.clone());
        Service::new(
            &env,
            "slow",
            ServiceConfig::default(),
            move |_args| {
                alive.fetch_add(1, Ordering::SeqCst);
                Ok(SlowSession {
                    entered: entered.clone(),
                    release: release.clone(),
                    invalidations: invalidations.clone(),
                    alive: alive.clone(),
                })
            },
            |session, frame| {
                let cmd: u64 = frame.get()?;
                if cmd != CMD_SLOW {
                    return Err(Error::ArgsInvalid);
                }
                frame.finish_input()?;
                session.data().entered.store(true, Ordering::SeqCst);
                while !session.data().release.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(1));
                }
                frame.put(ErrorCode::Success);
                Ok(())
            },
        )
        .unwrap()
    };
    service.provide_on(0).unwrap();
    service.reg().unwrap();

    let conn = Connection::open(&env, "slow").unwrap();
    let client = ClientSession::open(&conn, "").unwrap();
    let server_session = service.get_session(0).unwrap();

    // Blocked dispatch in flight on the service CPU.
    let (tx, rx) = mpsc::channel();
    let caller = GlobalThread::create(&env, 1, "caller", move || {
        let mut frame = UtcbFrame::new();
        frame.put(CMD_SLOW);
        // The service is provided on CPU 0 only.
        let result = client
            .call_on(0, &mut frame)
            .and_then(|()| frame.check_reply());
        tx.send(result).unwrap();
        // Keep the client alive until here so teardown happens after the
        // reply.
        drop(client);
    })
    .unwrap();
    caller.start(Qpd::default()).unwrap();
    while !entered.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(1));
    }

    // Remove while the dispatch still runs: slot empties and invalidate
    // fires once, but the object must survive the in-flight reference.
    service.remove(&server_session).unwrap();
    assert_eq!(invalidations.load(Ordering::SeqCst), 1);
    assert!(server_session.is_invalidated());
    assert!(service.get_session(0).is_none());
    assert_eq!(alive.load(Ordering::SeqCst), 1, "session must not be freed");

    // A second remove finds nothing and invalidate stays at one.
    assert_eq!(service.remove(&server_session), Err(Error::NotFound));
    assert_eq!(invalidations.load(Ordering::SeqCst), 1);

    // Let the dispatch finish; it completes normally.
    release.store(true, Ordering::SeqCst);
    caller.join();
    assert_eq!(rx.recv().unwrap(), Ok(()));

    // The last reference drops, now the session dies.
    drop(server_session);
    assert_eq!(alive.load(Ordering::SeqCst), 0);
}

#[test]
fn calls_after_remove_abort() {
    let env = Env::new(1);
    let service = echo_service(&env, "gone", 4);
    service.provide_on(0).unwrap();
    service.reg().unwrap();

    let conn = Connection::open(&env, "gone").unwrap();
    let client = ClientSession::open(&conn, "").unwrap();
    let server_session = service.get_session(0).unwrap();
    service.remove(&server_session).unwrap();

    let mut frame = UtcbFrame::new();
    frame.put(CMD_ECHO);
    frame.put(1u64);
    assert_eq!(client.call(&mut frame), Err(Error::Abort));
}

// ---------------------------------------------------------------------------
// Shared-ring sessions (the broadcast idiom)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Packet {
    keycode: u64,
    flags: u64,
}

struct InputSession {
    producer: Mutex<Option<Producer<Packet>>>,
}

impl SessionData for InputSession {
    fn invalidate(&self) {
        // Detach from the broadcast path before destruction.
        *self.producer.lock().unwrap() = None;
    }
}

fn input_service(env: &Env) -> Service<InputSession> {
    let handler_env = env.clone();
    Service::new(
        env,
        "input",
        ServiceConfig::default(),
        |_args| {
            Ok(InputSession {
                producer: Mutex::new(None),
            })
        },
        move |session, frame| {
            let cmd: u64 = frame.get()?;
            match cmd {
                SessionCmd::SHARE_DATASPACE => {
                    let ds_caps = frame.take_delegated()?;
                    let sm_caps = frame.take_delegated()?;
                    frame.finish_input()?;
                    let ds = Dataspace::join(&handler_env, ds_caps.base)?;
                    let sm = Sm::adopt(&handler_env, sm_caps.base)?;
                    let producer = Producer::new(ds, sm, false)?;
                    let mut slot = session.data().producer.lock().unwrap();
                    if slot.is_some() {
                        return Err(Error::Exists);
                    }
                    *slot = Some(producer);
                    frame.put(ErrorCode::Success);
                    Ok(())
                }
                _ => Err(Error::ArgsInvalid),
            }
        },
    )
    .unwrap()
}

/// Produce into every session that shared a ring.
fn broadcast(service: &Service<InputSession>, packet: Packet) {
    for session in service.sessions() {
        if let Some(producer) = session.data().producer.lock().unwrap().as_mut() {
            producer.produce(packet);
        }
    }
}

#[test]
fn shared_rings_broadcast_to_all_sessions() {
    let env = Env::new(1);
    let service = input_service(&env);
    service.provide_on(0).unwrap();
    service.reg().unwrap();

    let conn = Connection::open(&env, "input").unwrap();

    let mut clients = Vec::new();
    for _ in 0..2 {
        let session = ClientSession::open(&conn, "").unwrap();
        let ds = Dataspace::create_anonymous(&env, 4096, Perm::RW).unwrap();
        let sm = Sm::create(&env, 0).unwrap();
        // The creator initializes the ring header before sharing it.
        let consumer_ds = Dataspace::join(&env, ds.map_sel()).unwrap();
        let consumer_sm = Sm::adopt(&env, sm.sel()).unwrap();
        let consumer = Consumer::<Packet>::new(consumer_ds, consumer_sm, true, false).unwrap();
        session.share_dataspace(&ds, Some(&sm)).unwrap();
        clients.push((session, consumer, ds, sm));
    }

    // One session never shares a ring; the broadcast must skip it.
    let idle = ClientSession::open(&conn, "").unwrap();

    for i in 0..3u64 {
        broadcast(
            &service,
            Packet {
                keycode: 30 + i,
                flags: i,
            },
        );
    }

    for (_, consumer, _, _) in clients.iter_mut() {
        for i in 0..3u64 {
            let got = *consumer.get().expect("packet missing");
            assert_eq!(got.keycode, 30 + i);
            assert_eq!(got.flags, i);
            consumer.next();
        }
        assert!(!consumer.has_data());
    }

    drop(idle);
}

#[test]
fn sharing_twice_is_rejected_without_partial_delegation() {
    let env = Env::new(1);
    let service = input_service(&env);
    service.provide_on(0).unwrap();
    service.reg().unwrap();

    let conn = Connection::open(&env, "input").unwrap();
    let session = ClientSession::open(&conn, "").unwrap();

    let ds = Dataspace::create_anonymous(&env, 4096, Perm::RW).unwrap();
    let sm = Sm::create(&env, 0).unwrap();
    session.share_dataspace(&ds, Some(&sm)).unwrap();
    assert_eq!(
        session.share_dataspace(&ds, Some(&sm)),
        Err(Error::Exists)
    );
}
