use abcast::engine::{Engine, Event, Target};
use abcast::message::Message;
use abcast::*;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

type Reply = oneshot::Receiver<Result<Round, Error>>;

/// Deterministic in-memory cluster. Messages are only delivered by `pump`,
/// time only moves through `advance`.
struct Cluster {
    nodes: BTreeMap<NodeId, Engine>,
    events: BTreeMap<NodeId, Vec<Event>>,
    now: Instant,
    queue: VecDeque<(NodeId, NodeId, Message)>,
    down: HashSet<NodeId>,
    cut: HashSet<(NodeId, NodeId)>,
    auto_confirm: bool,
}

impl Cluster {
    fn new(size: usize) -> Self {
        Self::with_config(size, EngineConfig::default())
    }

    fn with_config(size: usize, config: EngineConfig) -> Self {
        let now = Instant::now();
        let ids: Vec<NodeId> = (1..=size as NodeId).collect();
        let mut nodes = BTreeMap::new();
        for &id in &ids {
            let mut engine = Engine::new(id, size, config.clone(), now);
            for &peer in &ids {
                engine.peer_connected(peer, now);
            }
            nodes.insert(id, engine);
        }
        let events = ids.iter().map(|&id| (id, Vec::new())).collect();

        let mut cluster = Self {
            nodes,
            events,
            now,
            queue: VecDeque::new(),
            down: HashSet::new(),
            cut: HashSet::new(),
            auto_confirm: true,
        };
        cluster.pump();
        cluster
    }

    fn node(&self, id: NodeId) -> &Engine {
        &self.nodes[&id]
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Engine {
        self.nodes.get_mut(&id).unwrap()
    }

    fn reachable(&self, from: NodeId, to: NodeId) -> bool {
        from != to
            && !self.down.contains(&from)
            && !self.down.contains(&to)
            && !self.cut.contains(&(from, to))
            && !self.cut.contains(&(to, from))
    }

    fn isolate(&mut self, id: NodeId) {
        let others: Vec<NodeId> = self.nodes.keys().copied().filter(|&o| o != id).collect();
        for other in others {
            self.cut.insert((id, other));
        }
    }

    fn heal(&mut self) {
        self.cut.clear();
    }

    fn collect(&mut self) {
        let ids: Vec<NodeId> = self.nodes.keys().copied().collect();
        for id in ids {
            let output = self.node_mut(id).take_output();
            if self.down.contains(&id) {
                continue;
            }

            for outgoing in output.messages {
                let targets: Vec<NodeId> = match outgoing.to {
                    Target::All => self.nodes.keys().copied().collect(),
                    Target::Peer(peer) => vec![peer],
                };
                for to in targets {
                    if self.reachable(id, to) {
                        self.queue.push_back((id, to, outgoing.message.clone()));
                    }
                }
            }

            let mut appended = Vec::new();
            for event in output.events {
                if let Event::Append { round, .. } = &event {
                    appended.push(*round);
                }
                self.events.get_mut(&id).unwrap().push(event);
            }
            if self.auto_confirm {
                let now = self.now;
                for round in appended {
                    self.node_mut(id).confirm(round, now);
                }
            }
        }
    }

    /// Delivers messages until the cluster is quiet.
    fn pump(&mut self) {
        for _ in 0..10_000 {
            self.collect();
            let Some((from, to, message)) = self.queue.pop_front() else {
                return;
            };
            if !self.reachable(from, to) {
                continue;
            }
            let now = self.now;
            self.node_mut(to).step(from, message, now);
        }
        panic!("cluster did not settle");
    }

    /// Moves the clock forward in heartbeat-sized steps, ticking every live
    /// node and delivering traffic after each step.
    fn advance(&mut self, total: Duration) {
        let step = Duration::from_millis(50);
        let mut elapsed = Duration::ZERO;
        while elapsed < total {
            self.now += step;
            elapsed += step;
            let ids: Vec<NodeId> = self.nodes.keys().copied().collect();
            let now = self.now;
            for id in ids {
                if !self.down.contains(&id) {
                    self.node_mut(id).tick(now);
                }
            }
            self.pump();
        }
    }

    fn elect(&mut self, id: NodeId) {
        let now = self.now;
        self.node_mut(id).campaign(now);
        self.pump();
        assert!(self.node(id).is_leader(), "node {} failed to win", id);
    }

    fn propose(&mut self, id: NodeId, payload: &str) -> Reply {
        let (tx, rx) = oneshot::channel();
        let now = self.now;
        self.node_mut(id).propose(payload.as_bytes().to_vec(), tx, now);
        self.pump();
        rx
    }

    fn confirm(&mut self, id: NodeId, round: Round) {
        let now = self.now;
        self.node_mut(id).confirm(round, now);
        self.pump();
    }

    fn crash(&mut self, id: NodeId) {
        self.node_mut(id).shutdown();
        self.down.insert(id);
    }

    fn events(&self, id: NodeId) -> &[Event] {
        &self.events[&id]
    }

    fn clear_events(&mut self) {
        for events in self.events.values_mut() {
            events.clear();
        }
    }

    fn appended(&self, id: NodeId) -> Vec<(Round, String)> {
        self.events(id)
            .iter()
            .filter_map(|e| match e {
                Event::Append { round, payload } => {
                    Some((*round, String::from_utf8_lossy(payload).into_owned()))
                }
                _ => None,
            })
            .collect()
    }

    fn committed(&self, id: NodeId) -> Vec<Round> {
        self.events(id)
            .iter()
            .filter_map(|e| match e {
                Event::Commit { round } => Some(*round),
                _ => None,
            })
            .collect()
    }

    fn leaders_by_term(&self) -> BTreeMap<Term, Vec<NodeId>> {
        let mut leaders: BTreeMap<Term, Vec<NodeId>> = BTreeMap::new();
        for (id, node) in &self.nodes {
            if node.is_leader() && !self.down.contains(id) {
                leaders.entry(node.term()).or_default().push(*id);
            }
        }
        leaders
    }

    fn assert_single_leader_per_term(&self) {
        for (term, leaders) in self.leaders_by_term() {
            assert!(leaders.len() <= 1, "term {} has leaders {:?}", term, leaders);
        }
    }
}

fn resolved(rx: &mut Reply) -> Option<Result<Round, Error>> {
    rx.try_recv().ok()
}

#[test]
fn test_election_elects_single_leader() {
    let mut cluster = Cluster::new(3);
    cluster.elect(1);

    assert_eq!(cluster.node(1).term(), 1);
    assert_eq!(cluster.node(1).leadership(), LeadershipState::Leader);
    for id in [2, 3] {
        assert_eq!(cluster.node(id).leadership(), LeadershipState::Follower);
        assert_eq!(cluster.node(id).leader(), Some(1));
        assert_eq!(cluster.events(id), &[Event::LeaderChange(Some(1))]);
    }
    assert_eq!(
        cluster.events(1),
        &[Event::GainedLeadership, Event::LeaderChange(Some(1))]
    );
    cluster.assert_single_leader_per_term();
}

#[test]
fn test_competing_candidates_yield_one_leader() {
    let mut cluster = Cluster::new(3);
    let now = cluster.now;
    cluster.node_mut(2).campaign(now);
    cluster.node_mut(3).campaign(now);
    cluster.pump();

    cluster.assert_single_leader_per_term();
    let leaders = cluster.leaders_by_term();
    assert_eq!(leaders.get(&1).map(Vec::len), Some(1));
}

#[test]
fn test_single_node_cluster_commits_alone() {
    let mut cluster = Cluster::new(1);
    cluster.elect(1);

    let mut rx = cluster.propose(1, "solo");
    assert_eq!(resolved(&mut rx).unwrap().unwrap(), 1);
    assert_eq!(cluster.committed(1), vec![1]);
}

#[test]
fn test_propose_delivers_to_followers_and_commits() {
    let mut cluster = Cluster::new(3);
    cluster.elect(1);

    let mut rx = cluster.propose(1, "hello");
    assert_eq!(resolved(&mut rx).unwrap().unwrap(), 1);

    for id in [2, 3] {
        assert_eq!(cluster.appended(id), vec![(1, "hello".to_string())]);
        assert_eq!(cluster.committed(id), vec![1]);
    }
    assert!(cluster.appended(1).is_empty());
    assert_eq!(cluster.committed(1), vec![1]);
}

#[test]
fn test_commit_waits_for_majority_confirmation() {
    let mut cluster = Cluster::new(3);
    cluster.auto_confirm = false;
    cluster.elect(1);

    let mut rx = cluster.propose(1, "hello");
    assert!(resolved(&mut rx).is_none());
    assert_eq!(cluster.appended(2), vec![(1, "hello".to_string())]);
    assert!(cluster.committed(1).is_empty());

    cluster.confirm(3, 1);
    assert_eq!(resolved(&mut rx).unwrap().unwrap(), 1);
    assert_eq!(cluster.node(1).log().commit(), 1);
    assert_eq!(cluster.node(2).log().commit(), 1);
}

#[test]
fn test_five_node_cluster_needs_three_confirmations() {
    let mut cluster = Cluster::new(5);
    cluster.auto_confirm = false;
    cluster.elect(1);

    let mut rx = cluster.propose(1, "x");
    cluster.confirm(2, 1);
    assert!(resolved(&mut rx).is_none());

    cluster.confirm(4, 1);
    assert_eq!(resolved(&mut rx).unwrap().unwrap(), 1);
}

#[test]
fn test_second_proposal_is_rejected_while_one_is_pending() {
    let mut cluster = Cluster::new(3);
    cluster.auto_confirm = false;
    cluster.elect(1);

    let mut first = cluster.propose(1, "first");
    let mut second = cluster.propose(1, "second");
    assert!(matches!(
        resolved(&mut second),
        Some(Err(Error::ProposalInProgress))
    ));
    assert!(resolved(&mut first).is_none());

    cluster.confirm(2, 1);
    assert_eq!(resolved(&mut first).unwrap().unwrap(), 1);

    let mut third = cluster.propose(1, "third");
    cluster.confirm(2, 2);
    assert_eq!(resolved(&mut third).unwrap().unwrap(), 2);
}

#[test]
fn test_follower_rejects_proposal() {
    let mut cluster = Cluster::new(3);
    cluster.elect(1);

    let mut rx = cluster.propose(2, "nope");
    assert!(matches!(resolved(&mut rx), Some(Err(Error::NotLeader))));
    assert!(!cluster.node(2).has_pending_proposal());
}

#[test]
fn test_rounds_are_delivered_in_order_without_gaps() {
    let mut cluster = Cluster::new(3);
    cluster.elect(1);

    for i in 1..=5 {
        let mut rx = cluster.propose(1, &format!("m{}", i));
        assert_eq!(resolved(&mut rx).unwrap().unwrap(), i);
    }

    for id in [2, 3] {
        let rounds: Vec<Round> = cluster.appended(id).iter().map(|(r, _)| *r).collect();
        assert_eq!(rounds, vec![1, 2, 3, 4, 5]);
        assert_eq!(cluster.committed(id), vec![1, 2, 3, 4, 5]);
    }
}

#[test]
fn test_lagging_follower_catches_up_in_order() {
    let mut cluster = Cluster::new(3);
    cluster.elect(1);
    cluster.isolate(3);

    for i in 1..=3 {
        let mut rx = cluster.propose(1, &format!("m{}", i));
        assert_eq!(resolved(&mut rx).unwrap().unwrap(), i);
    }
    assert!(cluster.appended(3).is_empty());

    cluster.heal();
    cluster.advance(Duration::from_millis(50));

    assert_eq!(
        cluster.appended(3),
        vec![
            (1, "m1".to_string()),
            (2, "m2".to_string()),
            (3, "m3".to_string())
        ]
    );
    assert_eq!(cluster.committed(3), vec![1, 2, 3]);
}

#[test]
fn test_catch_up_spans_multiple_batches() {
    let config = EngineConfig {
        max_batch_rounds: 2,
        ..EngineConfig::default()
    };
    let mut cluster = Cluster::with_config(3, config);
    cluster.elect(1);
    cluster.isolate(3);

    for i in 1..=5 {
        let mut rx = cluster.propose(1, &format!("m{}", i));
        assert_eq!(resolved(&mut rx).unwrap().unwrap(), i);
    }

    cluster.heal();
    cluster.advance(Duration::from_millis(50));

    let rounds: Vec<Round> = cluster.appended(3).iter().map(|(r, _)| *r).collect();
    assert_eq!(rounds, vec![1, 2, 3, 4, 5]);
}

#[test]
fn test_leader_crash_mid_proposal_never_reuses_round() {
    let mut cluster = Cluster::new(3);
    cluster.elect(1);

    for i in 1..=4 {
        let mut rx = cluster.propose(1, &format!("m{}", i));
        assert_eq!(resolved(&mut rx).unwrap().unwrap(), i);
    }

    cluster.auto_confirm = false;
    let mut pending = cluster.propose(1, "m5");
    assert!(resolved(&mut pending).is_none());
    assert_eq!(cluster.appended(2).last(), Some(&(5, "m5".to_string())));

    cluster.crash(1);
    assert!(matches!(
        resolved(&mut pending),
        Some(Err(Error::Lifecycle(LifecycleError::Destroyed)))
    ));

    cluster.clear_events();
    cluster.elect(2);
    assert_eq!(cluster.node(2).term(), 2);
    assert_eq!(cluster.node(3).leader(), Some(2));

    let mut next = cluster.propose(2, "m6");
    assert!(resolved(&mut next).is_none());

    cluster.auto_confirm = true;
    cluster.confirm(2, 5);
    cluster.confirm(3, 5);
    assert_eq!(resolved(&mut next).unwrap().unwrap(), 6);
    assert_eq!(cluster.node(3).log().commit(), 6);

    // Round 5 was already handed to node 3 and is not delivered twice.
    let rounds: Vec<Round> = cluster.appended(3).iter().map(|(r, _)| *r).collect();
    assert_eq!(rounds, vec![6]);
    cluster.assert_single_leader_per_term();
}

#[test]
fn test_catch_up_beyond_retention_window() {
    let config = EngineConfig {
        retained_rounds: 2,
        ..EngineConfig::default()
    };
    let mut cluster = Cluster::with_config(3, config);
    cluster.elect(1);
    cluster.isolate(3);

    for i in 1..=5 {
        let mut rx = cluster.propose(1, &format!("m{}", i));
        assert_eq!(resolved(&mut rx).unwrap().unwrap(), i);
    }
    assert_eq!(cluster.node(1).log().first_round(), 1);

    cluster.heal();
    cluster.advance(Duration::from_millis(500));

    let rounds: Vec<Round> = cluster.appended(3).iter().map(|(r, _)| *r).collect();
    assert_eq!(rounds, vec![1, 2, 3, 4, 5]);
    assert_eq!(cluster.node(3).log().commit(), 5);
    assert_eq!(cluster.node(1).log().len(), 2);
}

#[test]
fn test_deposed_leader_receives_its_recovered_round() {
    let mut cluster = Cluster::new(3);
    cluster.auto_confirm = false;
    cluster.elect(1);
    cluster.cut.insert((1, 3));

    let mut rx = cluster.propose(1, "x");
    assert_eq!(cluster.appended(2), vec![(1, "x".to_string())]);
    assert!(cluster.appended(3).is_empty());

    cluster.isolate(1);
    cluster.confirm(2, 1);
    cluster.advance(Duration::from_millis(400));
    assert!(!cluster.node(1).is_leader());
    assert!(matches!(
        resolved(&mut rx),
        Some(Err(Error::AppendFailed(AppendFailure::LeadershipLost)))
    ));
    assert_eq!(cluster.node(1).log().delivered(), 0);
    assert_eq!(cluster.node(1).log().confirmed(), 0);

    cluster.auto_confirm = true;
    cluster.elect(2);
    assert_eq!(cluster.node(2).log().commit(), 1);

    cluster.heal();
    cluster.advance(Duration::from_millis(50));

    assert_eq!(cluster.node(1).leader(), Some(2));
    assert_eq!(cluster.appended(1), vec![(1, "x".to_string())]);
    assert_eq!(cluster.committed(1), vec![1]);
    assert_eq!(cluster.node(1).log().confirmed(), 1);
}

#[test]
fn test_reelected_leader_needs_its_own_confirmation() {
    let mut cluster = Cluster::new(3);
    cluster.auto_confirm = false;
    cluster.elect(1);
    cluster.isolate(1);

    let mut rx = cluster.propose(1, "again");
    cluster.advance(Duration::from_millis(400));
    assert!(resolved(&mut rx).unwrap().is_err());

    cluster.heal();
    cluster.elect(1);
    assert_eq!(cluster.appended(1), vec![(1, "again".to_string())]);
    cluster.confirm(2, 1);
    assert_eq!(cluster.node(1).log().commit(), 0);

    cluster.confirm(1, 1);
    assert_eq!(cluster.node(1).log().commit(), 1);
    assert_eq!(cluster.committed(1), vec![1]);
}

#[test]
fn test_isolated_leader_steps_down_after_lease() {
    let mut cluster = Cluster::new(3);
    cluster.elect(1);
    cluster.auto_confirm = false;
    cluster.isolate(1);

    let mut rx = cluster.propose(1, "lost");
    cluster.advance(Duration::from_millis(400));

    assert!(!cluster.node(1).is_leader());
    assert!(cluster.events(1).contains(&Event::LostLeadership));
    assert!(cluster.events(1).contains(&Event::LeaderChange(None)));
    assert!(matches!(
        resolved(&mut rx),
        Some(Err(Error::AppendFailed(AppendFailure::LeadershipLost)))
    ));
}

#[test]
fn test_unconfirmed_round_times_out() {
    let config = EngineConfig {
        proposal_timeout_ms: 500,
        ..EngineConfig::default()
    };
    let mut cluster = Cluster::with_config(3, config);
    cluster.elect(1);
    cluster.auto_confirm = false;

    let mut rx = cluster.propose(1, "stuck");
    cluster.advance(Duration::from_millis(600));

    assert!(matches!(
        resolved(&mut rx),
        Some(Err(Error::AppendFailed(AppendFailure::QuorumTimeout)))
    ));
    assert!(!cluster.node(1).is_leader());
    assert!(cluster.events(1).contains(&Event::LostLeadership));
}

#[test]
fn test_deposed_leader_adopts_new_leader_and_superseded_round() {
    let mut cluster = Cluster::new(3);
    cluster.elect(1);
    let mut rx = cluster.propose(1, "m1");
    assert_eq!(resolved(&mut rx).unwrap().unwrap(), 1);

    cluster.isolate(1);
    let mut stale = cluster.propose(1, "from-old-leader");
    assert!(resolved(&mut stale).is_none());

    cluster.elect(2);
    let mut fresh = cluster.propose(2, "from-new-leader");
    assert_eq!(resolved(&mut fresh).unwrap().unwrap(), 2);
    cluster.assert_single_leader_per_term();

    cluster.clear_events();
    cluster.heal();
    cluster.advance(Duration::from_millis(50));

    assert!(!cluster.node(1).is_leader());
    assert_eq!(cluster.node(1).leader(), Some(2));
    assert_eq!(cluster.node(1).term(), 2);
    assert!(cluster.events(1).contains(&Event::LostLeadership));
    assert!(matches!(
        resolved(&mut stale),
        Some(Err(Error::AppendFailed(AppendFailure::LeadershipLost)))
    ));

    assert_eq!(
        cluster.appended(1),
        vec![(2, "from-new-leader".to_string())]
    );
    assert_eq!(cluster.node(1).log().get(2).unwrap().payload, b"from-new-leader");
    assert_eq!(cluster.node(1).log().commit(), 2);
}

#[test]
fn test_candidate_with_stale_log_cannot_win() {
    let mut cluster = Cluster::new(3);
    cluster.elect(1);
    cluster.isolate(3);
    let mut rx = cluster.propose(1, "m1");
    assert_eq!(resolved(&mut rx).unwrap().unwrap(), 1);

    cluster.heal();
    cluster.cut.insert((1, 3));
    let now = cluster.now;
    cluster.node_mut(3).campaign(now);
    cluster.pump();

    assert!(!cluster.node(3).is_leader());
    assert_eq!(cluster.node(2).log().last_round(), 1);
}

#[test]
fn test_status_reflects_engine_state() {
    let mut cluster = Cluster::new(3);
    cluster.elect(1);
    let mut rx = cluster.propose(1, "m1");
    assert!(resolved(&mut rx).unwrap().is_ok());

    let status = cluster.node(2).status();
    assert_eq!(status.id, 2);
    assert_eq!(status.term, 1);
    assert_eq!(status.leader, Some(1));
    assert_eq!(status.leadership, LeadershipState::Follower);
    assert_eq!(status.last_round, 1);
    assert_eq!(status.commit_round, 1);
    assert!(cluster.node(1).status().is_leader());
}
