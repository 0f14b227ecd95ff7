//! Wait-for graph reconstruction, deadlock detection and chain severity.
//!
//! Nodes are sessions; an edge `A -> B` means "A is blocked by B". Cycles
//! are found with a white/gray/black depth-first search: an edge into a gray
//! node closes a cycle. Each cycle is then widened to its full strongly
//! connected component (forward reachable ∩ backward reachable), so sessions
//! that sit on a cycle only reachable through an already finished branch are
//! still reported as deadlocked. Every component is collapsed into one
//! cyclic `WaitChain`.

use crate::model::{ChainNode, LockSnapshot, SessionId, Severity, WaitChain};
use crate::policy::ChainThresholds;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Paths enumerated per head session before giving up on further branches.
const MAX_PATHS_PER_HEAD: usize = 32;

/// One session as seen by the wait-for graph.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionNode {
    pub session_id: SessionId,
    pub process_id: i64,
    pub query: Option<String>,
    pub wait_time: f64,
    pub blocked_by: Vec<SessionId>,
}

impl SessionNode {
    pub fn new(session_id: impl Into<SessionId>, process_id: i64) -> Self {
        Self {
            session_id: session_id.into(),
            process_id,
            query: None,
            wait_time: 0.0,
            blocked_by: Vec::new(),
        }
    }
}

/// Fold lock rows into one node per session: longest wait, union of
/// blockers, first query text seen.
#[must_use]
pub fn sessions_from_locks(locks: &[LockSnapshot], now: DateTime<Utc>) -> Vec<SessionNode> {
    let mut sessions: BTreeMap<&str, SessionNode> = BTreeMap::new();

    for lock in locks {
        let node = sessions
            .entry(lock.session_id.as_str())
            .or_insert_with(|| SessionNode::new(lock.session_id.clone(), lock.process_id));

        node.wait_time = node.wait_time.max(lock.wait_seconds(now));

        if node.query.is_none() {
            node.query.clone_from(&lock.query);
        }

        for blocker in &lock.blocked_by {
            if !node.blocked_by.contains(blocker) {
                node.blocked_by.push(blocker.clone());
            }
        }
    }

    sessions.into_values().collect()
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Directed wait-for graph with deterministic (sorted) iteration order.
#[derive(Debug, Default)]
pub struct WaitGraph {
    nodes: BTreeMap<SessionId, SessionNode>,
    edges: BTreeMap<SessionId, BTreeSet<SessionId>>,
    reverse: BTreeMap<SessionId, BTreeSet<SessionId>>,
}

impl WaitGraph {
    pub fn from_sessions(sessions: impl IntoIterator<Item = SessionNode>) -> Self {
        let mut graph = Self::default();

        for session in sessions {
            for blocker in &session.blocked_by {
                if *blocker == session.session_id {
                    continue;
                }
                graph
                    .edges
                    .entry(session.session_id.clone())
                    .or_default()
                    .insert(blocker.clone());
                graph
                    .reverse
                    .entry(blocker.clone())
                    .or_default()
                    .insert(session.session_id.clone());
            }

            match graph.nodes.get_mut(&session.session_id) {
                Some(existing) => {
                    existing.wait_time = existing.wait_time.max(session.wait_time);
                    if existing.query.is_none() {
                        existing.query = session.query;
                    }
                }
                None => {
                    graph.nodes.insert(session.session_id.clone(), session);
                }
            }
        }

        // Blockers that never showed up as rows of their own still need a node.
        let missing: Vec<SessionId> = graph
            .reverse
            .keys()
            .filter(|id| !graph.nodes.contains_key(*id))
            .cloned()
            .collect();
        for id in missing {
            let pid = id.parse().unwrap_or(0);
            graph.nodes.insert(id.clone(), SessionNode::new(id, pid));
        }

        graph
    }

    fn successors<'s>(&'s self, id: &str) -> impl Iterator<Item = &'s SessionId> + use<'s> {
        self.edges.get(id).into_iter().flatten()
    }

    fn predecessors<'s>(&'s self, id: &str) -> impl Iterator<Item = &'s SessionId> + use<'s> {
        self.reverse.get(id).into_iter().flatten()
    }

    /// Sets of sessions that are deadlocked together, each a strongly
    /// connected component containing at least one cycle. Sorted by their
    /// smallest member.
    #[must_use]
    pub fn deadlock_groups(&self) -> Vec<BTreeSet<SessionId>> {
        let mut color: HashMap<&str, Color> =
            self.nodes.keys().map(|k| (k.as_str(), Color::White)).collect();
        let mut back_edge_cycles: Vec<Vec<SessionId>> = Vec::new();

        for start in self.nodes.keys() {
            if color.get(start.as_str()) == Some(&Color::White) {
                self.visit(start, &mut color, &mut back_edge_cycles);
            }
        }

        let mut groups: Vec<BTreeSet<SessionId>> = Vec::new();
        for cycle in back_edge_cycles {
            let Some(seed) = cycle.first() else {
                continue;
            };
            if groups.iter().any(|g| g.contains(seed)) {
                continue;
            }
            groups.push(self.component_of(&cycle));
        }

        groups.sort();
        groups
    }

    // Iterative colored DFS; `path` mirrors the gray nodes in visit order.
    fn visit<'a>(
        &'a self,
        start: &'a SessionId,
        color: &mut HashMap<&'a str, Color>,
        cycles: &mut Vec<Vec<SessionId>>,
    ) {
        let mut path: Vec<&'a SessionId> = vec![start];
        let mut stack: Vec<Box<dyn Iterator<Item = &'a SessionId> + 'a>> =
            vec![Box::new(self.successors(start))];
        color.insert(start.as_str(), Color::Gray);

        while let Some(iter) = stack.last_mut() {
            match iter.next() {
                Some(next) => match color.get(next.as_str()).copied().unwrap_or(Color::White) {
                    Color::White => {
                        color.insert(next.as_str(), Color::Gray);
                        path.push(next);
                        stack.push(Box::new(self.successors(next)));
                    }
                    Color::Gray => {
                        if let Some(pos) = path.iter().position(|p| *p == next) {
                            cycles.push(path.iter().skip(pos).map(|s| (*s).clone()).collect());
                        }
                    }
                    Color::Black => {}
                },
                None => {
                    stack.pop();
                    if let Some(done) = path.pop() {
                        color.insert(done.as_str(), Color::Black);
                    }
                }
            }
        }
    }

    fn component_of(&self, cycle: &[SessionId]) -> BTreeSet<SessionId> {
        let forward = reach(cycle, &self.edges);
        let backward = reach(cycle, &self.reverse);
        forward.intersection(&backward).cloned().collect()
    }

    /// Order a deadlock group along its edges, starting from the smallest
    /// session id, so `A -> B -> C -> A` yields `[A, B, C]`.
    fn cycle_order(&self, group: &BTreeSet<SessionId>) -> Vec<SessionId> {
        let mut order: Vec<SessionId> = Vec::with_capacity(group.len());
        let mut visited: BTreeSet<&SessionId> = BTreeSet::new();
        let mut current = group.first();

        while let Some(id) = current {
            visited.insert(id);
            order.push(id.clone());
            current = self
                .successors(id)
                .find(|n| group.contains(*n) && !visited.contains(n));
        }

        for id in group {
            if !visited.contains(&id) {
                order.push(id.clone());
            }
        }

        order
    }

    fn chain_node(&self, id: &SessionId, depth: usize) -> ChainNode {
        let node = self.nodes.get(id);
        ChainNode {
            session_id: id.clone(),
            process_id: node.map_or(0, |n| n.process_id),
            query: node.and_then(|n| n.query.clone()),
            depth,
            wait_time: node.map_or(0.0, |n| n.wait_time),
        }
    }

    /// Every wait chain in the graph: one collapsed entry per deadlock group
    /// plus one entry per head-to-root path through the acyclic part.
    #[must_use]
    pub fn chains(&self, thresholds: &ChainThresholds) -> Vec<WaitChain> {
        let groups = self.deadlock_groups();
        let in_cycle: BTreeSet<&SessionId> = groups.iter().flatten().collect();
        let mut chains = Vec::new();

        for group in &groups {
            let order = self.cycle_order(group);
            let nodes = order
                .iter()
                .enumerate()
                .map(|(depth, id)| self.chain_node(id, depth))
                .collect();
            let id = format!(
                "cycle:{}",
                group.iter().map(String::as_str).collect::<Vec<_>>().join(",")
            );
            chains.push(finish_chain(id, nodes, true, thresholds));
        }

        for head in self.nodes.keys() {
            if in_cycle.contains(&head) || self.successors(head).next().is_none() {
                continue;
            }
            // Heads are blocked sessions nobody outside a deadlock waits on.
            if self.predecessors(head).any(|p| !in_cycle.contains(&p)) {
                continue;
            }

            for path in self.paths_from(head, &in_cycle) {
                let nodes = path
                    .iter()
                    .enumerate()
                    .map(|(depth, id)| self.chain_node(id, depth))
                    .collect();
                let id = format!(
                    "chain:{}",
                    path.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(">")
                );
                chains.push(finish_chain(id, nodes, false, thresholds));
            }
        }

        sort_chains(&mut chains);
        chains
    }

    // Depth-first path enumeration from `head`, stopping at root blockers
    // and at the first deadlocked session reached.
    fn paths_from<'a>(
        &'a self,
        head: &'a SessionId,
        in_cycle: &BTreeSet<&SessionId>,
    ) -> Vec<Vec<&'a SessionId>> {
        let mut paths = Vec::new();
        let mut pending: Vec<Vec<&'a SessionId>> = vec![vec![head]];

        while let Some(path) = pending.pop() {
            if paths.len() >= MAX_PATHS_PER_HEAD {
                break;
            }
            let Some(&last) = path.last() else {
                continue;
            };

            let stop = path.len() > 1 && in_cycle.contains(&last);
            let next: Vec<&SessionId> = if stop {
                Vec::new()
            } else {
                self.successors(last).filter(|n| !path.contains(n)).collect()
            };

            if next.is_empty() {
                paths.push(path);
                continue;
            }

            // Reverse so the smallest successor is explored first.
            for n in next.into_iter().rev() {
                let mut extended = path.clone();
                extended.push(n);
                pending.push(extended);
            }
        }

        paths
    }
}

fn reach(
    seeds: &[SessionId],
    adjacency: &BTreeMap<SessionId, BTreeSet<SessionId>>,
) -> BTreeSet<SessionId> {
    let mut seen: BTreeSet<SessionId> = seeds.iter().cloned().collect();
    let mut queue: Vec<SessionId> = seeds.to_vec();

    while let Some(id) = queue.pop() {
        for n in adjacency.get(&id).into_iter().flatten() {
            if seen.insert(n.clone()) {
                queue.push(n.clone());
            }
        }
    }

    seen
}

fn finish_chain(
    id: String,
    nodes: Vec<ChainNode>,
    is_cycle: bool,
    thresholds: &ChainThresholds,
) -> WaitChain {
    let chain_length = nodes.len();
    let total_wait_time: f64 = nodes.iter().map(|n| n.wait_time).sum();
    let head_session = nodes.first().map(|n| n.session_id.clone()).unwrap_or_default();
    let tail_session = nodes.last().map(|n| n.session_id.clone()).unwrap_or_default();

    WaitChain {
        id,
        severity: classify_severity(chain_length, total_wait_time, is_cycle, thresholds),
        nodes,
        chain_length,
        total_wait_time,
        head_session,
        tail_session,
        is_cycle,
    }
}

/// Fixed-threshold severity of a chain.
#[must_use]
pub fn classify_severity(
    chain_length: usize,
    total_wait_time: f64,
    is_cycle: bool,
    t: &ChainThresholds,
) -> Severity {
    if is_cycle {
        Severity::Critical
    } else if total_wait_time >= t.high_wait_secs || chain_length >= t.high_length {
        Severity::High
    } else if total_wait_time >= t.medium_wait_secs || chain_length >= t.medium_length {
        Severity::Medium
    } else {
        Severity::Low
    }
}

fn sort_chains(chains: &mut [WaitChain]) {
    chains.sort_by(|a, b| {
        b.is_cycle
            .cmp(&a.is_cycle)
            .then_with(|| b.severity.cmp(&a.severity))
            .then_with(|| b.total_wait_time.total_cmp(&a.total_wait_time))
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// Normalizes and classifies wait chains.
#[derive(Debug, Clone, Default)]
pub struct WaitChainAnalyzer {
    thresholds: ChainThresholds,
}

impl WaitChainAnalyzer {
    #[must_use]
    pub const fn new(thresholds: ChainThresholds) -> Self {
        Self { thresholds }
    }

    /// Re-derive the computed fields of collector-built chains (length, depth,
    /// total wait, head/tail, severity), drop empty and duplicate chains, and
    /// order the result deterministically.
    #[must_use]
    pub fn analyze(&self, chains: Vec<WaitChain>) -> Vec<WaitChain> {
        let mut seen = BTreeSet::new();
        let mut out: Vec<WaitChain> = chains
            .into_iter()
            .filter(|c| !c.nodes.is_empty() && seen.insert(c.id.clone()))
            .map(|c| {
                let nodes = c
                    .nodes
                    .into_iter()
                    .enumerate()
                    .map(|(depth, mut n)| {
                        n.depth = depth;
                        n.wait_time = n.wait_time.max(0.0);
                        n
                    })
                    .collect();
                finish_chain(c.id, nodes, c.is_cycle, &self.thresholds)
            })
            .collect();

        sort_chains(&mut out);
        out
    }

    /// Build chains from session rows carrying wait-for edges.
    #[must_use]
    pub fn from_sessions(&self, sessions: Vec<SessionNode>) -> Vec<WaitChain> {
        WaitGraph::from_sessions(sessions).chains(&self.thresholds)
    }

    /// Build chains straight from lock snapshots; used when the collector's
    /// own chain reconstruction is unavailable.
    #[must_use]
    pub fn from_locks(&self, locks: &[LockSnapshot], now: DateTime<Utc>) -> Vec<WaitChain> {
        self.from_sessions(sessions_from_locks(locks, now))
    }
}
