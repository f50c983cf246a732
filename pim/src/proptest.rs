// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Property-based tests of an instance driven by generated event streams.
//!
//! Table invariants are checked after every event, and the final state must
//! not depend on the order route changes were reported in.

use crate::event::JoinPrune;
use crate::platform::Route;
use crate::test::{check_invariants, test_instance, TestInstance};
use crate::types::{ChannelKey, IfIndex};
use crate::upstream::UpstreamState;
use crate::PimConfig;
use pim_common::net::IpNet;
use proptest::prelude::*;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

const INTERFACES: u32 = 4;

fn source() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))
}

fn channel(group: u8) -> ChannelKey {
    ChannelKey::new(source(), IpAddr::V4(Ipv4Addr::new(224, 1, 1, group)))
}

/// Gateways are unique per interface, so two candidates with the same
/// next hop are always the same path.
fn route(len: u8, ifindex: u32, metric: u32, preference: u8) -> Route {
    Route {
        prefix: IpNet::new(source(), len),
        nexthop: Some(IpAddr::V4(Ipv4Addr::new(192, 0, 2, ifindex as u8))),
        ifindex: Some(IfIndex(ifindex)),
        metric,
        preference,
    }
}

fn route_strategy() -> impl Strategy<Value = Route> {
    (
        prop::sample::select(vec![8u8, 16, 24, 32]),
        1..=INTERFACES,
        0u32..4,
        0u8..3,
    )
        .prop_map(|(len, ifindex, metric, preference)| {
            route(len, ifindex, metric, preference)
        })
}

/// A routing table with at most one route per prefix and interface.
fn table_strategy() -> impl Strategy<Value = Vec<Route>> {
    prop::collection::btree_map(
        (prop::sample::select(vec![8u8, 16, 24, 32]), 1..=INTERFACES),
        (0u32..4, 0u8..3),
        1..8,
    )
    .prop_map(|table| {
        table
            .into_iter()
            .map(|((len, ifindex), (metric, preference))| {
                route(len, ifindex, metric, preference)
            })
            .collect()
    })
}

fn instance(name: &str) -> TestInstance {
    let mut inst = test_instance(name, PimConfig::default());
    for i in 1..=INTERFACES {
        inst.add_interface(IfIndex(i), format!("eth{i}"), true, vec![]);
    }
    inst
}

#[derive(Debug, Clone)]
enum Op {
    Join { ifindex: u32, group: u8, holdtime: u16 },
    Prune { ifindex: u32, group: u8 },
    Local { ifindex: u32, group: u8, present: bool },
    Data { group: u8 },
    Advance { millis: u64 },
    Route(Option<Route>),
    Down(u32),
    Up(u32),
    Scan,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    let ifindex = 1..=INTERFACES;
    let group = 1u8..=2;
    prop_oneof![
        4 => (
            ifindex.clone(),
            group.clone(),
            prop::sample::select(vec![0u16, 5, 30, 210, crate::HOLDTIME_INFINITE]),
        )
            .prop_map(|(ifindex, group, holdtime)| Op::Join {
                ifindex,
                group,
                holdtime,
            }),
        2 => (ifindex.clone(), group.clone())
            .prop_map(|(ifindex, group)| Op::Prune { ifindex, group }),
        2 => (ifindex.clone(), group.clone(), any::<bool>()).prop_map(
            |(ifindex, group, present)| Op::Local {
                ifindex,
                group,
                present,
            }
        ),
        1 => group.prop_map(|group| Op::Data { group }),
        3 => (0u64..300_000).prop_map(|millis| Op::Advance { millis }),
        2 => prop::option::of(route_strategy()).prop_map(Op::Route),
        1 => ifindex.clone().prop_map(Op::Down),
        1 => ifindex.prop_map(Op::Up),
        1 => Just(Op::Scan),
    ]
}

fn apply(inst: &mut TestInstance, op: &Op) {
    let neighbor = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 100));
    match *op {
        Op::Join {
            ifindex,
            group,
            holdtime,
        } => inst.receive_join_prune(JoinPrune {
            ifindex: IfIndex(ifindex),
            neighbor,
            key: channel(group),
            joined: true,
            holdtime,
        }),
        Op::Prune { ifindex, group } => inst.receive_join_prune(JoinPrune {
            ifindex: IfIndex(ifindex),
            neighbor,
            key: channel(group),
            joined: false,
            holdtime: 0,
        }),
        Op::Local {
            ifindex,
            group,
            present,
        } => inst.local_membership(IfIndex(ifindex), channel(group), present),
        Op::Data { group } => inst.data_arrival(channel(group), IfIndex(1)),
        Op::Advance { millis } => inst.advance(Duration::from_millis(millis)),
        Op::Route(Some(r)) => {
            inst.routes().add(r);
            inst.on_route_change(r.prefix);
        }
        Op::Route(None) => {
            let prefix = IpNet::new(source(), 24);
            inst.routes().remove(prefix);
            inst.on_route_change(prefix);
        }
        Op::Down(i) => inst.interface_down(IfIndex(i)),
        Op::Up(i) => inst.interface_up(IfIndex(i)),
        Op::Scan => inst.scan_oil(),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// The RPF an entry ends up with depends only on the final routing
    /// table, not on the order route changes were reported in.
    #[test]
    fn prop_route_change_order_independent(
        (routes, shuffled) in table_strategy()
            .prop_flat_map(|routes| {
                let shuffled = Just(routes.clone()).prop_shuffle();
                (Just(routes), shuffled)
            })
    ) {
        let mut a = instance("prop_order_a");
        let mut b = instance("prop_order_b");
        for inst in [&mut a, &mut b] {
            inst.receive_join_prune(JoinPrune {
                ifindex: IfIndex(1),
                neighbor: IpAddr::V4(Ipv4Addr::new(192, 0, 2, 100)),
                key: channel(1),
                joined: true,
                holdtime: crate::HOLDTIME_INFINITE,
            });
        }
        for r in &routes {
            a.routes().add(*r);
            a.on_route_change(r.prefix);
            a.advance(Duration::from_millis(20));
        }
        for r in &shuffled {
            b.routes().add(*r);
            b.on_route_change(r.prefix);
        }
        a.advance(Duration::from_millis(50));
        b.advance(Duration::from_millis(50));

        let ua = a.upstream(&channel(1)).expect("upstream a");
        let ub = b.upstream(&channel(1)).expect("upstream b");
        prop_assert_eq!(ua.rpf, ub.rpf);
        prop_assert_eq!(ua.state, ub.state);
        prop_assert_eq!(ua.iif, ub.iif);
        prop_assert_eq!(
            a.forwarding_plane().entry(&channel(1)),
            b.forwarding_plane().entry(&channel(1))
        );
        check_invariants(&a);
        check_invariants(&b);
    }

    /// Arbitrary event streams keep the tables consistent, never fire a
    /// timer for a destroyed entry, and leave nothing behind on shutdown.
    #[test]
    fn prop_event_streams_keep_tables_consistent(
        ops in prop::collection::vec(op_strategy(), 1..60)
    ) {
        let mut inst = instance("prop_events");
        for op in &ops {
            apply(&mut inst, op);
            check_invariants(&inst);
            for up in inst.upstreams() {
                if up.state == UpstreamState::Joined {
                    prop_assert_eq!(up.iif, up.rpf.interface());
                }
            }
            for group in 1..=2 {
                let key = channel(group);
                if inst.upstream(&key).is_none() {
                    prop_assert_eq!(inst.timers().count_for(&key), 0);
                }
            }
        }
        prop_assert_eq!(inst.stats().stale_timers, 0);

        // after a full sweep every entry agrees with a fresh resolution
        inst.update_all_interfaces();
        inst.advance(Duration::from_millis(50));
        for up in inst.upstreams() {
            let fresh = inst.resolve(up.key.source).ok();
            prop_assert_eq!(up.rpf.path(), fresh.and_then(|r| r.path()));
        }

        inst.shutdown();
        prop_assert!(inst.timers().is_empty());
        prop_assert_eq!(inst.forwarding_plane().len(), 0);
        prop_assert!(inst.upstreams().is_empty());
    }
}
