//! Property-based tests for ordered delivery
//!
//! Arbitrary interleavings of send bursts, receive bursts and buffer holds
//! must deliver every frame exactly once, in order, and return every block
//! to its pool.

use pktio::PktioParam;
use pktio::loopback::QUEUE_MULTI_MAX;
use pktio_integration_tests::{Fixture, numbered, seq_of};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Step {
    Send(usize),
    Recv(usize),
    /// Keep received packets instead of dropping them
    Hold(bool),
}

fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![
        (1usize..12).prop_map(Step::Send),
        (1usize..12).prop_map(Step::Recv),
        any::<bool>().prop_map(Step::Hold),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn test_ipc_delivers_in_order(
        slave_blocks in 1u32..8,
        len in 8usize..200,
        steps in prop::collection::vec(step_strategy(), 1..40),
    ) {
        let fx = Fixture::with_config(|c| c.ipc.ring_entries = 16);
        // no more blocks than ring slots, so the free ring never fills up
        let master_pool = fx.pool("m_pool", 16, 256);
        let slave_pool = fx.pool("s_pool", slave_blocks, 256);
        let (master, slave) = fx.ipc_pair("ipc:prop", &master_pool, &slave_pool);

        let mut next = 0u64;
        let mut expected = 0u64;
        let mut held = Vec::new();
        let mut hold = false;
        for step in steps {
            match step {
                Step::Send(n) => {
                    let n = n.min(master_pool.available());
                    let mut pkts = numbered(&master_pool, next, n, len);
                    let sent = master.send(0, &mut pkts).unwrap();
                    prop_assert_eq!(pkts.len(), n - sent);
                    next += sent as u64;
                }
                Step::Recv(max) => {
                    let mut out = Vec::new();
                    let n = slave.recv(0, &mut out, max).unwrap();
                    prop_assert!(n <= max);
                    for pkt in &out {
                        prop_assert_eq!(seq_of(pkt), expected);
                        prop_assert_eq!(pkt.len(), len.max(8));
                        expected += 1;
                    }
                    if hold {
                        held.extend(out);
                    }
                }
                Step::Hold(on) => {
                    hold = on;
                    if !on {
                        held.clear();
                    }
                }
            }
        }

        held.clear();
        while expected < next {
            let mut out = Vec::new();
            prop_assert!(slave.recv(0, &mut out, 16).unwrap() > 0);
            for pkt in &out {
                prop_assert_eq!(seq_of(pkt), expected);
                expected += 1;
            }
        }

        let mut none = Vec::new();
        prop_assert_eq!(master.recv(0, &mut none, 16).unwrap(), 0);
        prop_assert_eq!(master_pool.available(), 16);
        prop_assert_eq!(slave_pool.available(), slave_blocks as usize);
    }

    #[test]
    fn test_loopback_delivers_in_order(
        bursts in prop::collection::vec((1usize..16, 1usize..16), 1..30),
    ) {
        let fx = Fixture::with_config(|c| c.loopback.queue_size = 64);
        let pool = fx.pool("lp_pool", 128, 128);
        let entry = fx.registry.open("loop", &pool, PktioParam::default()).unwrap();
        entry.start().unwrap();

        let mut next = 0u64;
        let mut expected = 0u64;
        for (send, recv) in bursts {
            let mut pkts = numbered(&pool, next, send.min(pool.available()), 16);
            let sent = entry.send(0, &mut pkts).unwrap();
            prop_assert!(sent <= QUEUE_MULTI_MAX);
            next += sent as u64;

            let mut out = Vec::new();
            let got = entry.recv(0, &mut out, recv).unwrap();
            prop_assert!(got <= recv.min(QUEUE_MULTI_MAX));
            for pkt in &out {
                prop_assert_eq!(seq_of(pkt), expected);
                expected += 1;
            }
        }
        prop_assert_eq!(entry.stats().unwrap().out_packets, next);
    }
}
