//! Tests for the shared single-producer/single-consumer ring.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ibex_abi::dataspace::Perm;
use ibex_abi::{CapRange, Qpd};
use ibex_rt::ipc::{Consumer, Producer};
use ibex_rt::mem::Dataspace;
use ibex_rt::sync::Sm;
use ibex_rt::thread::GlobalThread;
use ibex_rt::{Env, Error};

/// 16-byte ring entry, the geometry used throughout the fill/drain tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Packet {
    seq: u64,
    payload: u64,
}

/// Build both ring ends over one dataspace: the producer owns the original
/// mapping and initializes the header, the consumer joins it.
fn ring_pair(
    env: &Env,
    size: usize,
    blocking: bool,
) -> (Producer<Packet>, Consumer<Packet>) {
    let ds = Dataspace::create_anonymous(env, size, Perm::RW).unwrap();
    let ds_peer = Dataspace::join(env, ds.map_sel()).unwrap();
    let sm = Sm::create(env, 0).unwrap();
    let sm_peer = Sm::adopt(env, sm.sel()).unwrap();
    let producer = Producer::new(ds, sm, true).unwrap();
    let consumer = Consumer::new(ds_peer, sm_peer, false, blocking).unwrap();
    (producer, consumer)
}

#[test]
fn capacity_is_largest_fitting_pow2() {
    let env = Env::new(1);
    // (4096 - 16) / 16 = 255 -> 128 slots.
    let (producer, consumer) = ring_pair(&env, 4096, false);
    assert_eq!(producer.capacity(), 128);
    assert_eq!(consumer.capacity(), 128);
}

#[test]
fn fill_and_drain() {
    let env = Env::new(1);
    let (mut producer, mut consumer) = ring_pair(&env, 4096, false);

    // One slot is wasted: 127 entries fit.
    for i in 0..127u64 {
        assert!(producer.produce(Packet {
            seq: i,
            payload: i * 3,
        }));
    }
    assert!(producer.current().is_none());
    assert!(!producer.produce(Packet {
        seq: 999,
        payload: 0,
    }));

    // Consuming one frees exactly one slot.
    assert_eq!(consumer.get().unwrap().seq, 0);
    consumer.next();
    assert!(producer.produce(Packet {
        seq: 127,
        payload: 0,
    }));
    assert!(producer.current().is_none());

    // Drain the rest in order.
    for i in 1..=127u64 {
        let got = *consumer.get().unwrap();
        assert_eq!(got.seq, i);
        consumer.next();
    }
    assert!(!consumer.has_data());
    assert!(consumer.get().is_none()); // non-blocking empty read
}

#[test]
fn too_small_dataspace_is_rejected() {
    let env = Env::new(1);
    // One page dataspace with entries bigger than page-minus-header does
    // not hold a single slot.
    #[derive(Clone, Copy)]
    struct Huge {
        _data: [u64; 1024],
    }
    let ds = Dataspace::create_anonymous(&env, 4096, Perm::RW).unwrap();
    let sm = Sm::create(&env, 0).unwrap();
    assert!(matches!(
        Producer::<Huge>::new(ds, sm, true),
        Err(Error::ArgsInvalid)
    ));
}

#[test]
fn empty_ring_blocks_consumer_until_produce() {
    let env = Env::new(2);
    let ds = Dataspace::create_anonymous(&env, 4096, Perm::RW).unwrap();
    let ds_peer = Dataspace::join(&env, ds.map_sel()).unwrap();
    let sm = Sm::create(&env, 0).unwrap();
    let sm_peer = Sm::adopt(&env, sm.sel()).unwrap();
    let mut producer = Producer::<Packet>::new(ds, sm, true).unwrap();
    let mut consumer = Consumer::<Packet>::new(ds_peer, sm_peer, false, true).unwrap();

    let got_one = Arc::new(AtomicBool::new(false));
    let flag = got_one.clone();
    let reader = GlobalThread::create(&env, 1, "reader", move || {
        let packet = *consumer.get().unwrap();
        assert_eq!(packet.seq, 7);
        consumer.next();
        flag.store(true, Ordering::Release);
    })
    .unwrap();
    reader.start(Qpd::default()).unwrap();

    std::thread::sleep(Duration::from_millis(50));
    assert!(!got_one.load(Ordering::Acquire), "consumer must block");

    assert!(producer.produce(Packet { seq: 7, payload: 0 }));
    reader.join();
    assert!(got_one.load(Ordering::Acquire));
}

#[test]
fn concurrent_stream_is_lossless_and_ordered() {
    const COUNT: u64 = 20_000;
    let env = Env::new(2);
    let ds = Dataspace::create_anonymous(&env, 4096, Perm::RW).unwrap();
    let ds_peer = Dataspace::join(&env, ds.map_sel()).unwrap();
    let sm = Sm::create(&env, 0).unwrap();
    let sm_peer = Sm::adopt(&env, sm.sel()).unwrap();
    let mut producer = Producer::<Packet>::new(ds, sm, true).unwrap();
    let mut consumer = Consumer::<Packet>::new(ds_peer, sm_peer, false, true).unwrap();

    let writer = GlobalThread::create(&env, 1, "writer", move || {
        for i in 0..COUNT {
            while !producer.produce(Packet {
                seq: i,
                payload: i.wrapping_mul(0x9e37_79b9),
            }) {
                std::thread::yield_now();
            }
        }
    })
    .unwrap();
    writer.start(Qpd::default()).unwrap();

    for i in 0..COUNT {
        let packet = *consumer.get().unwrap();
        assert_eq!(packet.seq, i, "entries must arrive in order, exactly once");
        assert_eq!(packet.payload, i.wrapping_mul(0x9e37_79b9));
        consumer.next();
    }
    writer.join();
    assert!(!consumer.has_data());
}

#[test]
fn peer_death_mid_stream() {
    let env = Env::new(1);
    let ds = Dataspace::create_anonymous(&env, 4096, Perm::RW).unwrap();
    let sm = Sm::create(&env, 0).unwrap();
    let producer_sm = Sm::adopt(&env, sm.sel()).unwrap();
    let consumer_sm_sel = sm.sel();
    let mut producer = Producer::<Packet>::new(ds, producer_sm, true).unwrap();

    for i in 0..3u64 {
        assert!(producer.produce(Packet { seq: i, payload: 0 }));
    }

    // The consumer dies: the kernel revokes its capabilities, which kills
    // the shared semaphore for the producer too.
    env.revoke(CapRange::new(consumer_sm_sel, 1));
    drop(sm);

    // The failing signal is swallowed; the ring header is in the
    // producer's own mapping, so slots keep coming.
    assert!(producer.produce(Packet { seq: 3, payload: 0 }));
    assert!(producer.current().is_some());
}

#[test]
fn consumer_sees_producer_death_as_normal_return() {
    let env = Env::new(1);
    let ds = Dataspace::create_anonymous(&env, 4096, Perm::RW).unwrap();
    let ds_peer = Dataspace::join(&env, ds.map_sel()).unwrap();
    let sm = Sm::create(&env, 0).unwrap();
    let sm_peer = Sm::adopt(&env, sm.sel()).unwrap();
    let producer_sm_sel = sm.sel();
    let mut producer = Producer::<Packet>::new(ds, sm, true).unwrap();
    let mut consumer = Consumer::<Packet>::new(ds_peer, sm_peer, false, true).unwrap();

    assert!(producer.produce(Packet { seq: 1, payload: 0 }));
    env.revoke(CapRange::new(producer_sm_sel, 1));
    drop(producer);

    // Buffered data is still there; after that a blocking read returns
    // None instead of waiting forever.
    assert_eq!(consumer.get().unwrap().seq, 1);
    consumer.next();
    assert!(consumer.get().is_none());
}
