//! Read-side view of the commit DAG.
//!
//! Nothing here is cached between calls: each query walks the store as it is at call time. Any
//! commit that cannot be loaded fails the whole query with [`Error::IncompleteHistory`].

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::*;

use crate::digest::Digest;
use crate::object::Commit;
use crate::store::ObjectStore;
use crate::{Error, Result};

/// Cooperative cancellation flag, checked before every commit a traversal visits.
#[derive(Debug, Clone, Default)]
pub struct Cancel(Arc<AtomicBool>);

impl Cancel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Clone)]
pub struct HistoryGraph<'a> {
    store: &'a ObjectStore,
    cancel: Cancel,
}

type ParentMemo = HashMap<Digest, Vec<Digest>>;

impl<'a> HistoryGraph<'a> {
    pub fn new(store: &'a ObjectStore) -> Self {
        Self {
            store,
            cancel: Cancel::default(),
        }
    }

    pub fn with_cancel(mut self, cancel: Cancel) -> Self {
        self.cancel = cancel;
        self
    }

    fn check_cancelled(&self, digest: &Digest) -> Result<()> {
        if self.cancel.is_cancelled() {
            debug!(at = %digest.short(), "History traversal cancelled");
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    fn load(&self, digest: &Digest) -> Result<Commit> {
        self.check_cancelled(digest)?;
        self.store
            .get_commit(digest)
            .map_err(|source| Error::IncompleteHistory {
                digest: digest.clone(),
                source: Box::new(source),
            })
    }

    fn parents(&self, memo: &mut ParentMemo, digest: &Digest) -> Result<Vec<Digest>> {
        if let Some(parents) = memo.get(digest) {
            return Ok(parents.clone());
        }
        let parents = self.load(digest)?.parents().to_vec();
        memo.insert(digest.clone(), parents.clone());
        Ok(parents)
    }

    /// `start` and everything reachable from it.
    fn reachable(&self, memo: &mut ParentMemo, start: &Digest) -> Result<HashSet<Digest>> {
        let mut seen = HashSet::from([start.clone()]);
        let mut queue = VecDeque::from([start.clone()]);
        while let Some(digest) = queue.pop_front() {
            for parent in self.parents(memo, &digest)? {
                if seen.insert(parent.clone()) {
                    queue.push_back(parent);
                }
            }
        }
        Ok(seen)
    }

    /// Lazily yield `start` and all of its ancestors, children always before their parents.
    ///
    /// Among commits that are ready to be emitted, the one with the newest committer time goes
    /// first, then the one discovered first.
    pub fn ancestors(&self, start: &Digest) -> Ancestors<'a> {
        Ancestors {
            graph: self.clone(),
            state: State::Unwalked(start.clone()),
        }
    }

    /// Every lowest common ancestor of `a` and `b`, in tie-break order: the order a breadth-first
    /// walk reaches them when each level visits `a`'s side before `b`'s.
    pub fn merge_bases(&self, a: &Digest, b: &Digest) -> Result<Vec<Digest>> {
        let mut memo = ParentMemo::new();

        let from_a = self.reachable(&mut memo, a)?;
        let from_b = self.reachable(&mut memo, b)?;
        let common = from_a.intersection(&from_b).cloned().collect::<HashSet<_>>();
        if common.is_empty() {
            return Ok(Vec::new());
        }

        // Common ancestors are closed under ancestry, so whatever lies strictly below one of
        // them is some common commit's parent.
        let mut lowest = common.clone();
        for digest in &common {
            for parent in self.parents(&mut memo, digest)? {
                lowest.remove(&parent);
            }
        }

        if lowest.len() == 1 {
            return Ok(lowest.into_iter().collect());
        }

        let mut ordered = Vec::with_capacity(lowest.len());
        let mut sides = [
            (vec![a.clone()], HashSet::from([a.clone()])),
            (vec![b.clone()], HashSet::from([b.clone()])),
        ];
        while ordered.len() < lowest.len() {
            if sides.iter().all(|(frontier, _)| frontier.is_empty()) {
                break;
            }
            for (frontier, seen) in &mut sides {
                let mut next = Vec::new();
                for digest in frontier.iter() {
                    if lowest.contains(digest) && !ordered.contains(digest) {
                        ordered.push(digest.clone());
                    }
                    for parent in self.parents(&mut memo, digest)? {
                        if seen.insert(parent.clone()) {
                            next.push(parent);
                        }
                    }
                }
                *frontier = next;
            }
        }

        debug!(candidates = ordered.len(), "Multiple merge bases");
        Ok(ordered)
    }

    /// The lowest common ancestor of `a` and `b`, or `None` if their histories are unrelated.
    pub fn merge_base(&self, a: &Digest, b: &Digest) -> Result<Option<Digest>> {
        Ok(self.merge_bases(a, b)?.into_iter().next())
    }

    /// Whether `candidate` is reachable from `of`. A commit counts as its own ancestor.
    pub fn is_ancestor(&self, candidate: &Digest, of: &Digest) -> Result<bool> {
        let mut commit = self.load(of)?;
        if candidate == of {
            return Ok(true);
        }

        let mut seen = HashSet::from([of.clone()]);
        let mut queue = VecDeque::new();
        loop {
            for parent in commit.parents() {
                if parent == candidate {
                    return Ok(true);
                }
                if seen.insert(parent.clone()) {
                    queue.push_back(parent.clone());
                }
            }
            match queue.pop_front() {
                Some(digest) => commit = self.load(&digest)?,
                None => return Ok(false),
            }
        }
    }
}

/// A discovered commit, held until it is yielded.
struct Node {
    digest: Digest,
    commit: Option<Commit>,
    parents: Vec<usize>,
    time: i64,
    unemitted_children: usize,
}

enum State {
    Unwalked(Digest),
    Walking {
        nodes: Vec<Node>,
        ready: BinaryHeap<(i64, Reverse<usize>)>,
    },
    Done,
}

/// Iterator returned by [`HistoryGraph::ancestors`].
///
/// The first call to `next` loads the whole reachable graph, so a missing or corrupt commit fails
/// the walk before anything is yielded. Each commit is then held in memory until it is yielded.
/// After an error the iterator is exhausted.
pub struct Ancestors<'a> {
    graph: HistoryGraph<'a>,
    state: State,
}

impl Ancestors<'_> {
    fn discover(&self, start: &Digest) -> Result<Vec<Node>> {
        let mut index = HashMap::from([(start.clone(), 0)]);
        let mut nodes = vec![Node {
            digest: start.clone(),
            commit: None,
            parents: Vec::new(),
            time: 0,
            unemitted_children: 0,
        }];

        let mut next = 0;
        while next < nodes.len() {
            let commit = self.graph.load(&nodes[next].digest)?;
            nodes[next].time = commit.committer().when().unix();

            for parent in commit.parents() {
                let parent_idx = *index.entry(parent.clone()).or_insert_with(|| {
                    nodes.push(Node {
                        digest: parent.clone(),
                        commit: None,
                        parents: Vec::new(),
                        time: 0,
                        unemitted_children: 0,
                    });
                    nodes.len() - 1
                });
                nodes[parent_idx].unemitted_children += 1;
                nodes[next].parents.push(parent_idx);
            }
            nodes[next].commit = Some(commit);
            next += 1;
        }

        trace!(commits = nodes.len(), "Discovered history");
        Ok(nodes)
    }

    fn step(&mut self) -> Option<Result<(Digest, Commit)>> {
        loop {
            match &mut self.state {
                State::Done => return None,
                State::Unwalked(start) => {
                    let start = start.clone();
                    match self.discover(&start) {
                        Ok(nodes) => {
                            let ready = BinaryHeap::from([(nodes[0].time, Reverse(0))]);
                            self.state = State::Walking { nodes, ready };
                        }
                        Err(e) => return Some(Err(e)),
                    }
                }
                State::Walking { nodes, ready } => {
                    let (_, Reverse(idx)) = ready.pop()?;
                    let digest = nodes[idx].digest.clone();
                    if let Err(e) = self.graph.check_cancelled(&digest) {
                        return Some(Err(e));
                    }
                    let commit = match nodes[idx].commit.take() {
                        Some(commit) => commit,
                        None => match self.graph.load(&digest) {
                            Ok(commit) => commit,
                            Err(e) => return Some(Err(e)),
                        },
                    };

                    for parent_idx in nodes[idx].parents.clone() {
                        let parent = &mut nodes[parent_idx];
                        parent.unemitted_children -= 1;
                        if parent.unemitted_children == 0 {
                            ready.push((parent.time, Reverse(parent_idx)));
                        }
                    }
                    return Some(Ok((digest, commit)));
                }
            }
        }
    }
}

impl Iterator for Ancestors<'_> {
    type Item = Result<(Digest, Commit)>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.step();
        if !matches!(item, Some(Ok(_))) {
            self.state = State::Done;
        }
        item
    }
}

impl std::iter::FusedIterator for Ancestors<'_> {}
