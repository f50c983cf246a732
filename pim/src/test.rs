// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory collaborators and end to end tests of an instance.

use crate::error::Error;
use crate::instance::Instance;
use crate::platform::{ForwardingPlane, JoinPruneSender, Route, RouteSource};
use crate::types::{ChannelKey, IfIndex, JoinPruneIntent, OifMap};
use crate::upstream::UpstreamState;
use crate::PimConfig;
use pim_common::lock;
use pim_common::log::init_file_logger;
use pim_common::net::IpNet;
use slog::Logger;
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub(crate) fn test_logger(filename: &str) -> Logger {
    init_file_logger(filename)
}

/// Routing table answering longest prefix match lookups.
#[derive(Clone, Default)]
pub(crate) struct TestRib {
    routes: Arc<Mutex<BTreeMap<IpNet, Vec<Route>>>>,
    registered: Arc<Mutex<Vec<String>>>,
    fail: Arc<AtomicBool>,
    lookups: Arc<AtomicUsize>,
}

impl TestRib {
    /// Add a route, replacing one with the same prefix and next hop.
    pub(crate) fn add(&self, route: Route) {
        let mut routes = lock!(self.routes);
        let candidates = routes.entry(route.prefix).or_default();
        candidates.retain(|r| r.nexthop != route.nexthop);
        candidates.push(route);
    }

    pub(crate) fn replace(&self, prefix: IpNet, candidates: Vec<Route>) {
        lock!(self.routes).insert(prefix, candidates);
    }

    pub(crate) fn remove(&self, prefix: IpNet) {
        lock!(self.routes).remove(&prefix);
    }

    pub(crate) fn fail_lookups(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    pub(crate) fn registered(&self) -> Vec<String> {
        lock!(self.registered).clone()
    }
}

impl RouteSource for TestRib {
    fn lookup_best_route(
        &self,
        addr: IpAddr,
        _timeout: Duration,
    ) -> Result<Vec<Route>, Error> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::RouteLookup(addr, "timed out".into()));
        }
        Ok(lock!(self.routes)
            .iter()
            .filter(|(prefix, _)| prefix.contains(addr))
            .max_by_key(|(prefix, _)| prefix.length())
            .map(|(_, candidates)| candidates.clone())
            .unwrap_or_default())
    }

    fn register(&self, instance: &str) -> Result<(), Error> {
        lock!(self.registered).push(instance.to_string());
        Ok(())
    }

    fn deregister(&self, instance: &str) {
        lock!(self.registered).retain(|i| i != instance);
    }
}

/// Forwarding plane that records the entries installed into it.
#[derive(Clone, Default)]
pub(crate) struct TestForwardingPlane {
    entries: Arc<Mutex<BTreeMap<ChannelKey, (IfIndex, OifMap)>>>,
    fail_installs: Arc<AtomicBool>,
    fail_removes: Arc<AtomicBool>,
    installs: Arc<AtomicUsize>,
    removes: Arc<AtomicUsize>,
    last_timeout: Arc<Mutex<Option<Duration>>>,
}

impl TestForwardingPlane {
    pub(crate) fn entry(&self, key: &ChannelKey) -> Option<(IfIndex, OifMap)> {
        lock!(self.entries).get(key).cloned()
    }

    pub(crate) fn len(&self) -> usize {
        lock!(self.entries).len()
    }

    pub(crate) fn fail_installs(&self, fail: bool) {
        self.fail_installs.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_removes(&self, fail: bool) {
        self.fail_removes.store(fail, Ordering::SeqCst);
    }

    /// Install calls, successful or not.
    pub(crate) fn installs(&self) -> usize {
        self.installs.load(Ordering::SeqCst)
    }

    /// Remove calls, successful or not.
    pub(crate) fn removes(&self) -> usize {
        self.removes.load(Ordering::SeqCst)
    }

    /// Time bound passed with the most recent call.
    pub(crate) fn last_timeout(&self) -> Option<Duration> {
        *lock!(self.last_timeout)
    }
}

impl ForwardingPlane for TestForwardingPlane {
    fn install_forwarding_entry(
        &self,
        key: ChannelKey,
        iif: IfIndex,
        oifs: &OifMap,
        timeout: Duration,
    ) -> Result<(), Error> {
        self.installs.fetch_add(1, Ordering::SeqCst);
        *lock!(self.last_timeout) = Some(timeout);
        if self.fail_installs.load(Ordering::SeqCst) {
            return Err(Error::ForwardingPlaneInstallFailure(
                key,
                "table full".into(),
            ));
        }
        lock!(self.entries).insert(key, (iif, oifs.clone()));
        Ok(())
    }

    fn remove_forwarding_entry(
        &self,
        key: ChannelKey,
        timeout: Duration,
    ) -> Result<(), Error> {
        self.removes.fetch_add(1, Ordering::SeqCst);
        *lock!(self.last_timeout) = Some(timeout);
        if self.fail_removes.load(Ordering::SeqCst) {
            return Err(Error::ForwardingPlaneRemoveFailure(
                key,
                "busy".into(),
            ));
        }
        lock!(self.entries).remove(&key);
        Ok(())
    }
}

/// Message layer that records intents and can be told to reject them.
#[derive(Clone, Default)]
pub(crate) struct TestSender {
    sent: Arc<Mutex<Vec<JoinPruneIntent>>>,
    reject: Arc<AtomicBool>,
}

impl TestSender {
    pub(crate) fn sent(&self) -> Vec<JoinPruneIntent> {
        lock!(self.sent).clone()
    }

    pub(crate) fn take(&self) -> Vec<JoinPruneIntent> {
        std::mem::take(&mut *lock!(self.sent))
    }

    pub(crate) fn reject(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }
}

impl JoinPruneSender for TestSender {
    fn send(&self, intent: JoinPruneIntent) -> Result<(), Error> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(Error::MessageLayer("no neighbor adjacency".into()));
        }
        lock!(self.sent).push(intent);
        Ok(())
    }
}

pub(crate) type TestInstance =
    Instance<TestRib, TestForwardingPlane, TestSender>;

pub(crate) fn test_instance(name: &str, config: PimConfig) -> TestInstance {
    let log = test_logger(&format!("{name}.log"));
    Instance::new(
        name,
        config,
        TestRib::default(),
        TestForwardingPlane::default(),
        TestSender::default(),
        &log,
    )
    .expect("create instance")
}

/// Check the relationships that must hold between the tables of an
/// instance after every event.
pub(crate) fn check_invariants(inst: &TestInstance) {
    for up in inst.upstreams() {
        let joined = inst.joined_interfaces(&up.key);
        assert_eq!(up.interest, joined.len(), "interest of {}", up.key);
        let expected = match (up.interest, up.rpf.is_resolved()) {
            (0, _) => UpstreamState::NotJoined,
            (_, true) => UpstreamState::Joined,
            (_, false) => UpstreamState::JoinPending,
        };
        assert_eq!(up.state, expected, "state of {}", up.key);

        let oil = inst.channel_oil(&up.key);
        if up.state != UpstreamState::Joined {
            assert_eq!(up.iif, None, "iif of {}", up.key);
            assert_eq!(oil, None, "oil of {}", up.key);
            continue;
        }
        if let (Some(iif), Some(oil)) = (up.iif, oil) {
            let oifs: BTreeSet<IfIndex> =
                oil.oifs.iter().map(|o| o.ifindex).collect();
            let mut want = joined.clone();
            want.remove(&iif);
            assert_eq!(oil.iif, iif, "oil iif of {}", up.key);
            assert_eq!(oifs, want, "oifs of {}", up.key);
        }
    }
    for oil in inst.channel_oils() {
        let up = inst.upstream(&oil.key).expect("oil without upstream");
        assert_eq!(up.state, UpstreamState::Joined);
        if oil.installed {
            let (iif, oifs) = inst
                .forwarding_plane()
                .entry(&oil.key)
                .expect("installed entry");
            assert_eq!(iif, oil.iif);
            assert_eq!(oifs.len(), oil.oifs.len());
        }
    }
}

mod scenario {
    use super::*;
    use crate::driver::Driver;
    use crate::event::{Event, JoinPrune};
    use crate::types::{JoinPruneKind, OifFlags};
    use crate::upstream::UpstreamInfo;
    use crate::HOLDTIME_INFINITE;
    use pim_common::{cidr, ip, wait_for_eq};
    use pretty_assertions::assert_eq;
    use std::sync::mpsc;

    const I1: IfIndex = IfIndex(1);
    const I2: IfIndex = IfIndex(2);
    const I3: IfIndex = IfIndex(3);
    const I4: IfIndex = IfIndex(4);

    fn key() -> ChannelKey {
        ChannelKey::new(ip!("10.0.0.1"), ip!("224.1.1.1"))
    }

    fn n1() -> IpAddr {
        ip!("192.0.2.1")
    }

    fn n2() -> IpAddr {
        ip!("198.51.100.1")
    }

    fn prefix() -> IpNet {
        cidr!("10.0.0.0/24")
    }

    fn via(nexthop: IpAddr, ifindex: IfIndex, metric: u32) -> Route {
        Route {
            prefix: prefix(),
            nexthop: Some(nexthop),
            ifindex: Some(ifindex),
            metric,
            preference: 110,
        }
    }

    fn pim() -> OifFlags {
        OifFlags {
            pim: true,
            local: false,
        }
    }

    fn intent(
        kind: JoinPruneKind,
        ifindex: IfIndex,
        neighbor: IpAddr,
    ) -> JoinPruneIntent {
        JoinPruneIntent {
            kind,
            ifindex,
            neighbor,
            key: key(),
            holdtime: PimConfig::default().join_holdtime,
        }
    }

    fn setup_with(name: &str, config: PimConfig) -> TestInstance {
        let mut inst = test_instance(name, config);
        let interfaces =
            [(I1, "eth1"), (I2, "eth2"), (I3, "eth3"), (I4, "eth4")];
        for (ifindex, name) in interfaces {
            inst.add_interface(ifindex, name, true, vec![]);
        }
        inst
    }

    /// Instance with S reachable via I2/N1.
    fn setup(name: &str) -> TestInstance {
        let inst = setup_with(name, PimConfig::default());
        inst.routes().add(via(n1(), I2, 10));
        inst
    }

    fn join(inst: &mut TestInstance, ifindex: IfIndex, holdtime: u16) {
        inst.receive_join_prune(JoinPrune {
            ifindex,
            neighbor: ip!("192.0.2.100"),
            key: key(),
            joined: true,
            holdtime,
        });
        check_invariants(inst);
    }

    fn prune(inst: &mut TestInstance, ifindex: IfIndex) {
        inst.receive_join_prune(JoinPrune {
            ifindex,
            neighbor: ip!("192.0.2.100"),
            key: key(),
            joined: false,
            holdtime: 0,
        });
        check_invariants(inst);
    }

    fn upstream(inst: &TestInstance) -> UpstreamInfo {
        inst.upstream(&key()).expect("upstream entry")
    }

    fn oifs(entries: &[IfIndex]) -> OifMap {
        entries.iter().map(|i| (*i, pim())).collect()
    }

    #[test]
    fn join_installs_forwarding_entry() {
        let mut inst = setup("scenario_join");
        join(&mut inst, I1, 210);

        let up = upstream(&inst);
        assert_eq!(up.state, UpstreamState::Joined);
        assert_eq!(up.iif, Some(I2));
        assert_eq!(up.upstream_neighbor, Some(n1()));

        let oil = inst.channel_oil(&key()).expect("channel oil");
        assert!(oil.installed);
        assert_eq!(oil.iif, I2);
        assert_eq!(
            inst.forwarding_plane().entry(&key()),
            Some((I2, oifs(&[I1])))
        );
        assert_eq!(
            inst.sender().sent(),
            vec![intent(JoinPruneKind::Join, I2, n1())]
        );
    }

    #[test]
    fn rpf_change_moves_upstream() {
        let mut inst = setup("scenario_rpf_change");
        join(&mut inst, I1, 210);
        inst.sender().take();

        inst.routes().replace(prefix(), vec![via(n2(), I3, 10)]);
        inst.on_route_change(prefix());
        // nothing happens until the coalescing delay passed
        assert_eq!(upstream(&inst).iif, Some(I2));
        assert!(inst.sender().sent().is_empty());

        inst.advance(Duration::from_millis(50));
        check_invariants(&inst);
        assert_eq!(
            inst.sender().sent(),
            vec![
                intent(JoinPruneKind::Prune, I2, n1()),
                intent(JoinPruneKind::Join, I3, n2()),
            ]
        );
        let up = upstream(&inst);
        assert_eq!(up.state, UpstreamState::Joined);
        assert_eq!(up.iif, Some(I3));
        assert_eq!(
            inst.forwarding_plane().entry(&key()),
            Some((I3, oifs(&[I1])))
        );
        assert_eq!(inst.stats().rpf_changes, 1);
    }

    #[test]
    fn forwarding_calls_are_time_bounded() {
        let config = PimConfig {
            collaborator_timeout_ms: 250,
            ..Default::default()
        };
        let mut inst = setup_with("fp_timeout", config);
        inst.routes().add(via(n1(), I2, 10));
        join(&mut inst, I1, 210);
        assert_eq!(inst.forwarding_plane().installs(), 1);
        assert_eq!(
            inst.forwarding_plane().last_timeout(),
            Some(Duration::from_millis(250))
        );

        inst.forwarding_plane().fail_removes(true);
        prune(&mut inst, I1);
        inst.advance(Duration::from_secs(3));
        assert_eq!(inst.forwarding_plane().removes(), 1);
        assert_eq!(
            inst.forwarding_plane().last_timeout(),
            Some(Duration::from_millis(250))
        );
    }

    #[test]
    fn last_join_expiring_withdraws() {
        let mut inst = setup("scenario_expiry");
        join(&mut inst, I1, 10);
        inst.sender().take();

        inst.advance(Duration::from_secs(10));
        check_invariants(&inst);
        let up = upstream(&inst);
        assert_eq!(up.state, UpstreamState::NotJoined);
        assert_eq!(up.interest, 0);
        assert_eq!(inst.channel_oil(&key()), None);
        assert_eq!(inst.forwarding_plane().entry(&key()), None);
        assert_eq!(inst.interface_channel(I1, &key()), None);
        assert_eq!(
            inst.sender().sent(),
            vec![intent(JoinPruneKind::Prune, I2, n1())]
        );

        // held for the inactivity window, then destroyed
        inst.advance(Duration::from_secs(209));
        assert!(inst.upstream(&key()).is_some());
        inst.advance(Duration::from_secs(1));
        assert_eq!(inst.upstream(&key()), None);
        assert_eq!(inst.timers().count_for(&key()), 0);
        assert_eq!(inst.stats().upstreams_destroyed, 1);
        assert_eq!(inst.stats().stale_timers, 0);
    }

    #[test]
    fn join_without_route_waits() {
        let mut inst = setup_with("scenario_unresolved", PimConfig::default());
        join(&mut inst, I1, 210);

        let up = upstream(&inst);
        assert_eq!(up.state, UpstreamState::JoinPending);
        assert_eq!(up.iif, None);
        assert_eq!(inst.forwarding_plane().installs(), 0);
        assert!(inst.sender().sent().is_empty());

        inst.routes().add(via(n1(), I2, 10));
        inst.on_route_change(prefix());
        inst.advance(Duration::from_millis(50));
        check_invariants(&inst);
        assert_eq!(upstream(&inst).state, UpstreamState::Joined);
        assert_eq!(
            inst.forwarding_plane().entry(&key()),
            Some((I2, oifs(&[I1])))
        );
    }

    #[test]
    fn route_loss_moves_to_join_pending() {
        let mut inst = setup("route_loss");
        join(&mut inst, I1, 210);
        inst.sender().take();

        inst.routes().remove(prefix());
        inst.on_route_change(prefix());
        inst.advance(Duration::from_millis(50));
        check_invariants(&inst);
        assert_eq!(upstream(&inst).state, UpstreamState::JoinPending);
        assert_eq!(inst.forwarding_plane().entry(&key()), None);
        assert_eq!(
            inst.sender().sent(),
            vec![intent(JoinPruneKind::Prune, I2, n1())]
        );
    }

    #[test]
    fn route_changes_are_coalesced() {
        let mut inst = setup("route_coalesce");
        join(&mut inst, I1, 210);
        let lookups = inst.routes().lookups();

        inst.routes().replace(prefix(), vec![via(n2(), I3, 10)]);
        for _ in 0..3 {
            inst.on_route_change(prefix());
        }
        inst.on_route_change(cidr!("10.0.0.0/8"));
        inst.advance(Duration::from_millis(50));

        assert_eq!(inst.stats().rpf_refresh_requests, 4);
        assert_eq!(inst.stats().rpf_refresh_runs, 1);
        assert_eq!(inst.routes().lookups(), lookups + 1);
        assert_eq!(upstream(&inst).iif, Some(I3));
    }

    #[test]
    fn unrelated_route_change_is_not_resolved() {
        let mut inst = setup("route_unrelated");
        join(&mut inst, I1, 210);
        let lookups = inst.routes().lookups();

        inst.on_route_change(cidr!("172.16.0.0/16"));
        inst.advance(Duration::from_millis(50));
        assert_eq!(inst.routes().lookups(), lookups);
        assert_eq!(inst.stats().rpf_refresh_runs, 1);
    }

    #[test]
    fn metric_change_is_silent() {
        let mut inst = setup("route_metric");
        join(&mut inst, I1, 210);
        inst.sender().take();
        let installs = inst.forwarding_plane().installs();

        inst.routes().add(via(n1(), I2, 50));
        inst.on_route_change(prefix());
        inst.advance(Duration::from_millis(50));
        assert_eq!(upstream(&inst).rpf.metric(), 50);
        assert!(inst.sender().sent().is_empty());
        assert_eq!(inst.forwarding_plane().installs(), installs);
        assert_eq!(inst.stats().rpf_changes, 0);
    }

    #[test]
    fn lookup_failure_keeps_rpf() {
        let mut inst = setup("route_lookup_failure");
        join(&mut inst, I1, 210);

        inst.routes().fail_lookups(true);
        inst.on_route_change(prefix());
        inst.advance(Duration::from_millis(50));
        let up = upstream(&inst);
        assert_eq!(up.state, UpstreamState::Joined);
        assert_eq!(up.rpf.neighbor(), Some(n1()));
        assert_eq!(inst.stats().rpf_lookup_failures, 1);
    }

    #[test]
    fn prune_override_window() {
        let mut inst = setup("prune_override");
        join(&mut inst, I1, 210);
        join(&mut inst, I3, 210);

        prune(&mut inst, I1);
        // still forwarding during the override window
        assert_eq!(
            inst.forwarding_plane().entry(&key()),
            Some((I2, oifs(&[I1, I3])))
        );
        inst.advance(Duration::from_secs(1));
        join(&mut inst, I1, 210);
        inst.advance(Duration::from_secs(5));
        assert_eq!(
            inst.forwarding_plane().entry(&key()),
            Some((I2, oifs(&[I1, I3])))
        );

        prune(&mut inst, I1);
        inst.advance(Duration::from_secs(3));
        check_invariants(&inst);
        assert_eq!(
            inst.forwarding_plane().entry(&key()),
            Some((I2, oifs(&[I3])))
        );
        assert_eq!(upstream(&inst).interest, 1);
    }

    #[test]
    fn rpf_interface_is_never_an_oif() {
        let mut inst = setup("rpf_not_oif");
        join(&mut inst, I2, 210);
        assert_eq!(upstream(&inst).state, UpstreamState::Joined);
        assert_eq!(inst.channel_oil(&key()), None);

        join(&mut inst, I1, 210);
        assert_eq!(
            inst.forwarding_plane().entry(&key()),
            Some((I2, oifs(&[I1])))
        );
    }

    #[test]
    fn local_membership_holds_oif() {
        let mut inst = setup("local_membership");
        inst.local_membership(I1, key(), true);
        check_invariants(&inst);
        let (_, entry) = inst.forwarding_plane().entry(&key()).unwrap();
        assert_eq!(
            entry.get(&I1),
            Some(&OifFlags {
                pim: false,
                local: true
            })
        );

        // a protocol join and prune leave local membership in place
        join(&mut inst, I1, 210);
        prune(&mut inst, I1);
        inst.advance(Duration::from_secs(3));
        check_invariants(&inst);
        assert_eq!(upstream(&inst).state, UpstreamState::Joined);

        inst.local_membership(I1, key(), false);
        check_invariants(&inst);
        assert_eq!(upstream(&inst).state, UpstreamState::NotJoined);
        assert_eq!(inst.forwarding_plane().len(), 0);
    }

    #[test]
    fn infinite_holdtime() {
        let mut inst = setup("infinite_holdtime");
        join(&mut inst, I1, HOLDTIME_INFINITE);
        inst.advance(Duration::from_secs(3600));
        check_invariants(&inst);
        assert_eq!(upstream(&inst).state, UpstreamState::Joined);
    }

    #[test]
    fn periodic_join_refresh() {
        let mut inst = setup("join_refresh");
        join(&mut inst, I1, HOLDTIME_INFINITE);
        inst.sender().take();
        inst.advance(Duration::from_secs(120));
        assert_eq!(
            inst.sender().sent(),
            vec![
                intent(JoinPruneKind::Join, I2, n1()),
                intent(JoinPruneKind::Join, I2, n1()),
            ]
        );
    }

    #[test]
    fn rejected_join_delays_iif_commit() {
        let mut inst = setup("join_rejected");
        join(&mut inst, I1, HOLDTIME_INFINITE);

        inst.sender().reject(true);
        inst.routes().replace(prefix(), vec![via(n2(), I3, 10)]);
        inst.on_route_change(prefix());
        inst.advance(Duration::from_millis(50));
        check_invariants(&inst);
        let up = upstream(&inst);
        assert_eq!(up.rpf.interface(), Some(I3));
        assert_eq!(up.iif, Some(I2));
        assert_eq!(inst.forwarding_plane().entry(&key()).map(|e| e.0), Some(I2));
        assert_eq!(inst.stats().send_failures, 2);

        inst.sender().reject(false);
        inst.advance(Duration::from_secs(60));
        check_invariants(&inst);
        assert_eq!(upstream(&inst).iif, Some(I3));
        assert_eq!(inst.forwarding_plane().entry(&key()).map(|e| e.0), Some(I3));
    }

    #[test]
    fn committed_iif_going_down_withdraws_entry() {
        let mut inst = setup("join_rejected_iif_down");
        join(&mut inst, I1, HOLDTIME_INFINITE);

        inst.sender().reject(true);
        inst.routes().replace(prefix(), vec![via(n2(), I3, 10)]);
        inst.on_route_change(prefix());
        inst.advance(Duration::from_millis(50));
        assert_eq!(upstream(&inst).iif, Some(I2));

        inst.interface_down(I2);
        check_invariants(&inst);
        let up = upstream(&inst);
        assert_eq!(up.state, UpstreamState::Joined);
        assert_eq!(up.rpf.interface(), Some(I3));
        assert_eq!(up.iif, None);
        assert_eq!(up.pending_prune, None);
        assert_eq!(inst.channel_oil(&key()), None);
        assert_eq!(inst.forwarding_plane().entry(&key()), None);
        // the join toward the new neighbor was retried at once
        assert_eq!(inst.stats().send_failures, 3);

        inst.sender().reject(false);
        inst.advance(Duration::from_secs(60));
        check_invariants(&inst);
        assert_eq!(upstream(&inst).iif, Some(I3));
        assert_eq!(
            inst.forwarding_plane().entry(&key()),
            Some((I3, oifs(&[I1])))
        );
    }

    #[test]
    fn refused_prune_follows_join_refresh() {
        let mut inst = setup("prune_refused");
        join(&mut inst, I1, HOLDTIME_INFINITE);
        inst.sender().take();

        inst.sender().reject(true);
        inst.routes().replace(prefix(), vec![via(n2(), I3, 10)]);
        inst.on_route_change(prefix());
        inst.advance(Duration::from_millis(50));
        assert_eq!(upstream(&inst).pending_prune, Some(n1()));

        inst.sender().reject(false);
        inst.advance(Duration::from_secs(60));
        let sent = inst.sender().take();
        assert_eq!(sent[0].kind, JoinPruneKind::Prune);
        assert_eq!(sent[0].neighbor, n1());
        assert_eq!(sent[1].kind, JoinPruneKind::Join);
        assert_eq!(sent[1].neighbor, n2());
        assert_eq!(upstream(&inst).pending_prune, None);
        check_invariants(&inst);
    }

    #[test]
    fn directly_connected_source_sends_nothing() {
        let mut inst = setup_with("direct_source", PimConfig::default());
        inst.routes().add(Route {
            prefix: prefix(),
            nexthop: None,
            ifindex: Some(I2),
            metric: 0,
            preference: 0,
        });
        join(&mut inst, I1, 210);
        let up = upstream(&inst);
        assert_eq!(up.state, UpstreamState::Joined);
        assert_eq!(up.iif, Some(I2));
        assert!(up.rpf.is_directly_connected());
        assert!(inst.sender().sent().is_empty());
        assert_eq!(
            inst.forwarding_plane().entry(&key()),
            Some((I2, oifs(&[I1])))
        );
    }

    #[test]
    fn install_failures_degrade_entry() {
        let mut inst = setup("install_degraded");
        inst.forwarding_plane().fail_installs(true);
        join(&mut inst, I1, HOLDTIME_INFINITE);
        inst.scan_oil();
        inst.scan_oil();
        inst.scan_oil();

        let oil = inst.channel_oil(&key()).unwrap();
        assert!(oil.degraded);
        assert!(!oil.installed);
        assert_eq!(oil.failures, 3);
        assert_eq!(inst.forwarding_plane().installs(), 3);

        inst.forwarding_plane().fail_installs(false);
        inst.scan_oil();
        assert!(inst.channel_oil(&key()).unwrap().degraded);

        join(&mut inst, I3, HOLDTIME_INFINITE);
        let oil = inst.channel_oil(&key()).unwrap();
        assert!(oil.installed);
        assert!(!oil.degraded);
        assert_eq!(
            inst.forwarding_plane().entry(&key()),
            Some((I2, oifs(&[I1, I3])))
        );
    }

    #[test]
    fn recompute_is_idempotent() {
        let mut inst = setup("recompute");
        join(&mut inst, I1, 210);
        assert!(inst.recompute(key()).is_empty());
        let installs = inst.forwarding_plane().installs();
        assert!(inst.sync(key()).is_empty());
        assert!(inst.scan_individual_oil(key()).is_empty());
        assert_eq!(inst.forwarding_plane().installs(), installs);
        assert_eq!(inst.stats().iif_repairs, 0);
    }

    #[test]
    fn downstream_interface_down_destroys_channels() {
        let mut inst = setup("downstream_down");
        join(&mut inst, I1, 210);
        join(&mut inst, I3, 210);

        inst.interface_down(I1);
        check_invariants(&inst);
        assert_eq!(inst.interface_channel(I1, &key()), None);
        assert_eq!(
            inst.forwarding_plane().entry(&key()),
            Some((I2, oifs(&[I3])))
        );

        inst.interface_down(I3);
        check_invariants(&inst);
        assert_eq!(upstream(&inst).state, UpstreamState::NotJoined);
        assert_eq!(inst.forwarding_plane().len(), 0);
    }

    #[test]
    fn rpf_interface_down_reresolves() {
        let mut inst = setup("rpf_down");
        inst.routes().add(via(n2(), I3, 20));
        join(&mut inst, I1, 210);
        assert_eq!(upstream(&inst).iif, Some(I2));
        inst.sender().take();

        inst.interface_down(I2);
        check_invariants(&inst);
        assert_eq!(upstream(&inst).iif, Some(I3));
        assert_eq!(
            inst.sender().sent(),
            vec![
                intent(JoinPruneKind::Prune, I2, n1()),
                intent(JoinPruneKind::Join, I3, n2()),
            ]
        );

        inst.interface_down(I3);
        check_invariants(&inst);
        assert_eq!(upstream(&inst).state, UpstreamState::JoinPending);

        inst.interface_up(I2);
        check_invariants(&inst);
        assert_eq!(upstream(&inst).iif, Some(I2));
    }

    #[test]
    fn data_arrival_creates_entry() {
        let mut inst = setup("data_arrival");
        inst.data_arrival(key(), I2);
        let up = upstream(&inst);
        assert_eq!(up.state, UpstreamState::NotJoined);
        assert_eq!(up.rpf.interface(), Some(I2));

        // traffic keeps the entry alive past the first window
        inst.advance(Duration::from_secs(200));
        inst.data_arrival(key(), I2);
        inst.advance(Duration::from_secs(100));
        assert!(inst.upstream(&key()).is_some());
        inst.advance(Duration::from_secs(110));
        assert_eq!(inst.upstream(&key()), None);
        assert_eq!(inst.timers().count_for(&key()), 0);
    }

    #[test]
    fn inconsistent_events_are_ignored() {
        let mut inst = setup("inconsistent");
        prune(&mut inst, I1);
        inst.receive_join_prune(JoinPrune {
            ifindex: IfIndex(99),
            neighbor: n1(),
            key: key(),
            joined: true,
            holdtime: 210,
        });
        inst.local_membership(I1, key(), false);
        inst.add_interface(I1, "dup", true, vec![]);
        assert_eq!(inst.stats().ignored_events, 4);
        assert_eq!(inst.upstream(&key()), None);
        check_invariants(&inst);
    }

    #[test]
    fn update_all_interfaces_sweeps_everything() {
        let mut inst = setup("update_all");
        join(&mut inst, I1, 210);
        inst.routes().replace(prefix(), vec![via(n2(), I3, 10)]);
        inst.update_all_interfaces();
        inst.advance(Duration::from_millis(50));
        check_invariants(&inst);
        assert_eq!(upstream(&inst).iif, Some(I3));
    }

    #[test]
    fn periodic_scan_repairs_missed_route_change() {
        let mut inst = setup("periodic_scan");
        join(&mut inst, I1, HOLDTIME_INFINITE);
        inst.routes().replace(prefix(), vec![via(n2(), I3, 10)]);
        inst.advance(Duration::from_secs(60));
        check_invariants(&inst);
        assert_eq!(upstream(&inst).iif, Some(I3));
        assert_eq!(inst.stats().oil_scans, 1);
    }

    #[test]
    fn set_master_moves_interface() {
        let mut inst = setup("set_master_from");
        let mut other = test_instance("set_master_to", PimConfig::default());
        join(&mut inst, I1, 210);

        inst.set_master(I1, &mut other).unwrap();
        check_invariants(&inst);
        assert_eq!(upstream(&inst).state, UpstreamState::NotJoined);
        assert_eq!(inst.forwarding_plane().len(), 0);
        assert!(inst.interfaces().iter().all(|i| i.ifindex != I1));
        let moved = other.interfaces();
        assert_eq!(moved.len(), 1);
        assert_eq!(moved[0].name, "eth1");

        assert_eq!(
            inst.set_master(I1, &mut other),
            Err(Error::InterfaceExists(I1))
        );
        assert_eq!(
            inst.set_master(IfIndex(42), &mut other),
            Err(Error::UnknownInterface(IfIndex(42)))
        );
    }

    #[test]
    fn shutdown_cleans_up() {
        let mut inst = setup("shutdown");
        join(&mut inst, I1, 210);
        inst.sender().take();
        assert_eq!(inst.routes().registered(), vec!["shutdown".to_string()]);

        inst.shutdown();
        assert_eq!(inst.forwarding_plane().len(), 0);
        assert!(inst.timers().is_empty());
        assert!(inst.routes().registered().is_empty());
        assert_eq!(
            inst.sender().sent(),
            vec![intent(JoinPruneKind::Prune, I2, n1())]
        );
    }

    #[test]
    fn diagnostics_serialize() -> anyhow::Result<()> {
        let mut inst = setup("diagnostics");
        join(&mut inst, I1, 210);

        let up = serde_json::to_value(upstream(&inst))?;
        assert_eq!(up["state"], "Joined");
        let oil = serde_json::to_value(inst.channel_oil(&key()))?;
        assert_eq!(oil["installed"], true);
        let ch = inst.interface_channel(I1, &key()).unwrap();
        assert_eq!(ch.expires_in, Some(210));
        serde_json::to_string(inst.stats())?;
        let schema = schemars::schema_for!(UpstreamInfo);
        serde_json::to_string(&schema)?;
        Ok(())
    }

    #[test]
    fn driver_runs_instance() -> anyhow::Result<()> {
        let log = test_logger("driver.log");
        let rib = TestRib::default();
        let fp = TestForwardingPlane::default();
        let (tx, rx) = mpsc::channel::<JoinPruneIntent>();
        rib.add(via(n1(), I2, 10));

        let config = PimConfig {
            rpf_refresh_delay_ms: 10,
            ..Default::default()
        };
        let inst = Instance::new("driver", config, rib.clone(), fp.clone(), tx, &log)?;
        let driver = Driver::spawn(inst, &log)?;
        for (ifindex, name) in [(I1, "eth1"), (I2, "eth2"), (I3, "eth3")] {
            driver.send(Event::InterfaceAdd {
                ifindex,
                name: name.into(),
                up: true,
                addresses: vec![],
            })?;
        }
        driver.send(Event::JoinPrune(JoinPrune {
            ifindex: I1,
            neighbor: ip!("192.0.2.100"),
            key: key(),
            joined: true,
            holdtime: 210,
        }))?;
        wait_for_eq!(fp.entry(&key()).map(|e| e.0), Some(I2));
        let sent = rx.recv_timeout(Duration::from_secs(5))?;
        assert_eq!(sent, intent(JoinPruneKind::Join, I2, n1()));

        rib.replace(prefix(), vec![via(n2(), I3, 10)]);
        driver.send(Event::RouteChange(prefix()))?;
        wait_for_eq!(fp.entry(&key()).map(|e| e.0), Some(I3));

        let inst = driver.shutdown()?;
        assert_eq!(fp.len(), 0);
        assert_eq!(inst.stats().rpf_changes, 1);
        assert!(rib.registered().is_empty());
        Ok(())
    }
}
