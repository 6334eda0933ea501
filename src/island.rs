//! Graph structure used to separate bodies into islands,
//! sets of bodies connected to each other through contacts and constraints.
//!
//! Static bodies don't connect anything: two bodies resting on the same floor
//! are in different islands unless something else links them.

use itertools::Itertools;
use std::collections::VecDeque;
use thunderdome as td;

/// Key type to look up a body tracked by an [`IslandSet`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BodyKey(pub(crate) td::Index);

impl BodyKey {
    /// Get the underlying [`thunderdome::Index`][thunderdome::Index] of this key.
    #[inline]
    pub fn index(&self) -> td::Index {
        self.0
    }
}

/// Key type to look up an island in an [`IslandSet`].
///
/// Keys of islands that were merged away or emptied become invalid.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct IslandKey(td::Index);

impl IslandKey {
    #[inline]
    pub fn index(&self) -> td::Index {
        self.0
    }
}

/// A group of non-static bodies that are connected, directly or through each other.
#[derive(Clone, Debug, Default)]
pub struct Island {
    bodies: Vec<BodyKey>,
}

impl Island {
    #[inline]
    pub fn bodies(&self) -> &[BodyKey] {
        &self.bodies
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bodies.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bodies.is_empty()
    }
}

#[derive(Clone, Debug)]
struct BodyNode {
    is_static: bool,
    /// Island and position in its body list. Always `None` for static bodies.
    island: Option<(IslandKey, usize)>,
    /// Other ends of this body's connections.
    /// A body connected to another by several contacts or constraints appears once per connection.
    connections: Vec<BodyKey>,
    /// Which search last visited this body, see [`IslandSet::try_split`].
    search_mark: u64,
}

/// One side of the two-sided search done when a connection is removed.
struct SearchFront {
    mark: u64,
    queue: VecDeque<BodyKey>,
    visited: Vec<BodyKey>,
}

impl SearchFront {
    fn new(start: BodyKey, mark: u64) -> Self {
        Self {
            mark,
            queue: VecDeque::from([start]),
            visited: vec![start],
        }
    }
}

enum SearchStep {
    Continue,
    /// The two fronts found each other, the bodies are still connected.
    Met,
    /// Every body reachable from this front was visited without meeting the other one.
    Exhausted,
}

/// Keeps track of the islands formed by bodies and the connections between them.
///
/// Islands are merged as connections are created and split as they are removed,
/// so that at all times every non-static body belongs to exactly one island
/// and two bodies share an island exactly when
/// a chain of non-static bodies and connections links them.
#[derive(Default)]
pub struct IslandSet {
    bodies: td::Arena<BodyNode>,
    islands: td::Arena<Island>,
    /// Emptied islands kept around to reuse their allocations.
    island_pool: Vec<Island>,
    search_count: u64,
}

impl IslandSet {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn body_count(&self) -> usize {
        self.bodies.len()
    }

    #[inline]
    pub fn island_count(&self) -> usize {
        self.islands.len()
    }

    #[inline]
    pub fn island(&self, key: IslandKey) -> Option<&Island> {
        self.islands.get(key.0)
    }

    pub fn islands(&self) -> impl '_ + Iterator<Item = (IslandKey, &Island)> {
        self.islands.iter().map(|(idx, island)| (IslandKey(idx), island))
    }

    /// The island a body is in. `None` for static bodies and bodies not in the set.
    #[inline]
    pub fn island_of(&self, body: BodyKey) -> Option<IslandKey> {
        self.bodies
            .get(body.0)
            .and_then(|node| node.island)
            .map(|(key, _)| key)
    }

    #[inline]
    pub fn is_static(&self, body: BodyKey) -> Option<bool> {
        self.bodies.get(body.0).map(|node| node.is_static)
    }

    /// The other ends of every connection a body has.
    pub fn connections(&self, body: BodyKey) -> &[BodyKey] {
        self.bodies
            .get(body.0)
            .map(|node| node.connections.as_slice())
            .unwrap_or(&[])
    }

    /// Start tracking a body. Non-static bodies get an island of their own.
    pub fn body_added(&mut self, is_static: bool) -> BodyKey {
        let body = BodyKey(self.bodies.insert(BodyNode {
            is_static,
            island: None,
            connections: Vec::new(),
            search_mark: 0,
        }));
        if !is_static {
            let island = self.alloc_island();
            self.push_to_island(body, island);
        }
        body
    }

    /// Stop tracking a body, removing all of its connections.
    ///
    /// Returns false if the body wasn't in the set.
    pub fn body_removed(&mut self, body: BodyKey) -> bool {
        if !self.bodies.contains(body.0) {
            return false;
        }
        self.remove_from_island(body);
        let node = match self.bodies.remove(body.0) {
            Some(node) => node,
            None => return false,
        };
        for other in &node.connections {
            if let Some(other_node) = self.bodies.get_mut(other.0) {
                remove_one(&mut other_node.connections, body);
            }
        }
        if !node.is_static {
            self.resolve_splits(&node.connections);
        }
        true
    }

    /// A contact started between two bodies.
    #[inline]
    pub fn arbiter_created(&mut self, a: BodyKey, b: BodyKey) -> bool {
        self.connection_created(a, b)
    }

    /// A contact between two bodies ended.
    #[inline]
    pub fn arbiter_removed(&mut self, a: BodyKey, b: BodyKey) -> bool {
        self.connection_removed(a, b)
    }

    /// A constraint was created between two bodies.
    #[inline]
    pub fn constraint_created(&mut self, a: BodyKey, b: BodyKey) -> bool {
        self.connection_created(a, b)
    }

    /// A constraint between two bodies was removed.
    #[inline]
    pub fn constraint_removed(&mut self, a: BodyKey, b: BodyKey) -> bool {
        self.connection_removed(a, b)
    }

    /// Change whether a body is static, repartitioning the islands around it.
    pub fn set_static(&mut self, body: BodyKey, is_static: bool) {
        let node = match self.bodies.get_mut(body.0) {
            Some(node) if node.is_static != is_static => node,
            _ => return,
        };
        node.is_static = is_static;

        if is_static {
            // the body no longer links its neighbors together
            self.remove_from_island(body);
            let neighbors = self.bodies[body.0].connections.clone();
            self.resolve_splits(&neighbors);
        } else {
            let island = self.alloc_island();
            self.push_to_island(body, island);
            let neighbors = self.bodies[body.0].connections.clone();
            for other in neighbors {
                self.merge_islands_of(body, other);
            }
        }
    }

    fn connection_created(&mut self, a: BodyKey, b: BodyKey) -> bool {
        if a == b || !self.bodies.contains(a.0) || !self.bodies.contains(b.0) {
            log::debug!("Ignored connection between {:?} and {:?}", a, b);
            return false;
        }
        self.bodies[a.0].connections.push(b);
        self.bodies[b.0].connections.push(a);
        self.merge_islands_of(a, b);
        true
    }

    fn connection_removed(&mut self, a: BodyKey, b: BodyKey) -> bool {
        let removed = match self.bodies.get_mut(a.0) {
            Some(node) => remove_one(&mut node.connections, b),
            None => false,
        };
        if !removed {
            return false;
        }
        if let Some(node) = self.bodies.get_mut(b.0) {
            remove_one(&mut node.connections, a);
        }
        self.try_split(a, b);
        true
    }

    //
    // Island bookkeeping
    //

    fn alloc_island(&mut self) -> IslandKey {
        let island = self.island_pool.pop().unwrap_or_default();
        IslandKey(self.islands.insert(island))
    }

    fn free_island(&mut self, key: IslandKey) {
        if let Some(mut island) = self.islands.remove(key.0) {
            island.bodies.clear();
            self.island_pool.push(island);
        }
    }

    fn push_to_island(&mut self, body: BodyKey, key: IslandKey) {
        let island = &mut self.islands[key.0];
        self.bodies[body.0].island = Some((key, island.bodies.len()));
        island.bodies.push(body);
    }

    /// Take a body out of its island, freeing the island if it becomes empty.
    fn remove_from_island(&mut self, body: BodyKey) {
        let (key, idx) = match self.bodies.get_mut(body.0).and_then(|n| n.island.take()) {
            Some(island) => island,
            None => return,
        };
        let island = &mut self.islands[key.0];
        island.bodies.swap_remove(idx);
        if let Some(swapped) = island.bodies.get(idx) {
            self.bodies[swapped.0].island = Some((key, idx));
        }
        if island.bodies.is_empty() {
            self.free_island(key);
        }
    }

    /// Move every body of the smaller island into the larger one
    /// if the two bodies aren't static and are in different islands.
    fn merge_islands_of(&mut self, a: BodyKey, b: BodyKey) {
        let (island_a, island_b) = match (self.island_of(a), self.island_of(b)) {
            (Some(ia), Some(ib)) if ia != ib => (ia, ib),
            _ => return,
        };
        let (into, from) = if self.islands[island_a.0].len() >= self.islands[island_b.0].len() {
            (island_a, island_b)
        } else {
            (island_b, island_a)
        };

        let mut from_island = match self.islands.remove(from.0) {
            Some(island) => island,
            None => return,
        };
        let into_island = &mut self.islands[into.0];
        for body in from_island.bodies.drain(..) {
            self.bodies[body.0].island = Some((into, into_island.bodies.len()));
            into_island.bodies.push(body);
        }
        self.island_pool.push(from_island);
    }

    //
    // Splitting
    //

    /// After a body stopped linking its neighbors,
    /// make sure every pair of them that shares an island is still connected.
    fn resolve_splits(&mut self, neighbors: &[BodyKey]) {
        let mut candidates: Vec<BodyKey> = Vec::with_capacity(neighbors.len());
        for &n in neighbors {
            if self.island_of(n).is_some() && !candidates.contains(&n) {
                candidates.push(n);
            }
        }
        for (a, b) in candidates.into_iter().tuple_combinations() {
            self.try_split(a, b);
        }
    }

    /// Check whether two bodies in the same island are still connected
    /// and split the island in two if they aren't.
    ///
    /// Searches breadth first from both bodies at once, one step at a time on each side,
    /// until the searches meet or one side runs out of bodies to visit.
    /// The side that ran out has found its whole component, which becomes a new island.
    /// This way the cost is bounded by the size of the smaller component.
    ///
    /// Returns true if the island was split.
    fn try_split(&mut self, a: BodyKey, b: BodyKey) -> bool {
        match (self.island_of(a), self.island_of(b)) {
            (Some(ia), Some(ib)) if ia == ib && a != b => {}
            _ => return false,
        }

        self.search_count += 1;
        let mark_a = 2 * self.search_count;
        let mark_b = mark_a + 1;
        self.bodies[a.0].search_mark = mark_a;
        self.bodies[b.0].search_mark = mark_b;
        let mut front_a = SearchFront::new(a, mark_a);
        let mut front_b = SearchFront::new(b, mark_b);

        let exhausted = loop {
            match self.search_step(&mut front_a, mark_b) {
                SearchStep::Met => return false,
                SearchStep::Exhausted => break front_a,
                SearchStep::Continue => {}
            }
            match self.search_step(&mut front_b, mark_a) {
                SearchStep::Met => return false,
                SearchStep::Exhausted => break front_b,
                SearchStep::Continue => {}
            }
        };

        let new_island = self.alloc_island();
        for body in exhausted.visited {
            self.remove_from_island(body);
            self.push_to_island(body, new_island);
        }
        log::trace!("Split an island, {} bodies moved", self.islands[new_island.0].len());
        true
    }

    fn search_step(&mut self, front: &mut SearchFront, other_mark: u64) -> SearchStep {
        let current = match front.queue.pop_front() {
            Some(current) => current,
            None => return SearchStep::Exhausted,
        };
        for conn_idx in 0..self.bodies[current.0].connections.len() {
            let next = self.bodies[current.0].connections[conn_idx];
            let next_node = &mut self.bodies[next.0];
            if next_node.is_static {
                continue;
            }
            if next_node.search_mark == other_mark {
                return SearchStep::Met;
            }
            if next_node.search_mark != front.mark {
                next_node.search_mark = front.mark;
                front.queue.push_back(next);
                front.visited.push(next);
            }
        }
        SearchStep::Continue
    }
}

/// Remove one occurrence of a body from a connection list.
fn remove_one(connections: &mut Vec<BodyKey>, body: BodyKey) -> bool {
    match connections.iter().position(|b| *b == body) {
        Some(idx) => {
            connections.swap_remove(idx);
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::SmallRng, Rng, SeedableRng};

    /// Plain connectivity model to check the island set against.
    #[derive(Default)]
    struct Reference {
        /// `None` for removed bodies, otherwise whether the body is static.
        bodies: Vec<Option<bool>>,
        keys: Vec<BodyKey>,
        edges: Vec<(usize, usize)>,
    }

    impl Reference {
        fn add(&mut self, set: &mut IslandSet, is_static: bool) -> usize {
            self.keys.push(set.body_added(is_static));
            self.bodies.push(Some(is_static));
            self.bodies.len() - 1
        }

        fn live(&self) -> Vec<usize> {
            (0..self.bodies.len())
                .filter(|i| self.bodies[*i].is_some())
                .collect()
        }

        /// Component label of every live non-static body.
        fn components(&self) -> Vec<Option<usize>> {
            let mut labels = vec![None; self.bodies.len()];
            let mut label = 0;
            for start in self.live() {
                if self.bodies[start] != Some(false) || labels[start].is_some() {
                    continue;
                }
                let mut stack = vec![start];
                labels[start] = Some(label);
                while let Some(curr) = stack.pop() {
                    for &(a, b) in &self.edges {
                        let next = if a == curr {
                            b
                        } else if b == curr {
                            a
                        } else {
                            continue;
                        };
                        if self.bodies[next] == Some(false) && labels[next].is_none() {
                            labels[next] = Some(label);
                            stack.push(next);
                        }
                    }
                }
                label += 1;
            }
            labels
        }

        fn check(&self, set: &IslandSet) {
            let labels = self.components();
            let live = self.live();
            let mut distinct_labels: Vec<usize> = labels.iter().flatten().copied().collect();
            distinct_labels.sort_unstable();
            distinct_labels.dedup();
            assert_eq!(set.island_count(), distinct_labels.len());
            assert_eq!(set.body_count(), live.len());

            for &i in &live {
                let island = set.island_of(self.keys[i]);
                assert_eq!(island.is_none(), self.bodies[i] == Some(true));
                for &j in &live {
                    if labels[i].is_some() && labels[j].is_some() {
                        assert_eq!(
                            island == set.island_of(self.keys[j]),
                            labels[i] == labels[j],
                            "bodies {} and {} disagree",
                            i,
                            j
                        );
                    }
                }
            }

            let mut total = 0;
            for (key, island) in set.islands() {
                assert!(!island.is_empty());
                for (idx, body) in island.bodies().iter().enumerate() {
                    assert_eq!(set.bodies[body.0].island, Some((key, idx)));
                }
                total += island.len();
            }
            assert_eq!(total, labels.iter().flatten().count());
        }
    }

    #[test]
    fn chain_splits_in_the_middle() {
        let mut set = IslandSet::new();
        let bodies: Vec<BodyKey> = (0..5).map(|_| set.body_added(false)).collect();
        assert_eq!(set.island_count(), 5);
        for w in bodies.windows(2) {
            set.arbiter_created(w[0], w[1]);
        }
        assert_eq!(set.island_count(), 1);

        assert!(set.arbiter_removed(bodies[1], bodies[2]));
        assert_eq!(set.island_count(), 2);
        assert_eq!(set.island_of(bodies[0]), set.island_of(bodies[1]));
        assert_eq!(set.island_of(bodies[2]), set.island_of(bodies[4]));
        assert_ne!(set.island_of(bodies[1]), set.island_of(bodies[2]));
        assert!(!set.arbiter_removed(bodies[1], bodies[2]));
    }

    #[test]
    fn alternate_path_prevents_split() {
        let mut set = IslandSet::new();
        let [a, b, c] = [(); 3].map(|_| set.body_added(false));
        set.arbiter_created(a, b);
        set.arbiter_created(b, c);
        set.constraint_created(c, a);
        assert!(set.arbiter_removed(a, b));
        assert_eq!(set.island_count(), 1);
        assert_eq!(set.island(set.island_of(a).unwrap()).unwrap().len(), 3);
    }

    #[test]
    fn duplicate_connections_count_separately() {
        let mut set = IslandSet::new();
        let a = set.body_added(false);
        let b = set.body_added(false);
        set.arbiter_created(a, b);
        set.constraint_created(a, b);
        set.arbiter_removed(a, b);
        assert_eq!(set.island_of(a), set.island_of(b));
        set.constraint_removed(b, a);
        assert_ne!(set.island_of(a), set.island_of(b));
    }

    #[test]
    fn statics_do_not_connect() {
        let mut set = IslandSet::new();
        let floor = set.body_added(true);
        let a = set.body_added(false);
        let b = set.body_added(false);
        set.arbiter_created(a, floor);
        set.arbiter_created(b, floor);
        assert_eq!(set.island_of(floor), None);
        assert_eq!(set.island_count(), 2);

        // a body that becomes static stops linking its neighbors
        let c = set.body_added(false);
        set.arbiter_created(a, c);
        set.arbiter_created(c, b);
        assert_eq!(set.island_count(), 1);
        set.set_static(c, true);
        assert_eq!(set.island_count(), 2);
        set.set_static(c, false);
        assert_eq!(set.island_count(), 1);
        set.set_static(floor, false);
        assert_eq!(set.island_count(), 1);
        assert_eq!(set.island(set.island_of(floor).unwrap()).unwrap().len(), 4);
    }

    #[test]
    fn removing_a_static_body_leaves_islands_alone() {
        let mut set = IslandSet::new();
        let floor = set.body_added(true);
        let bodies: Vec<BodyKey> = (0..6).map(|_| set.body_added(false)).collect();
        for b in &bodies {
            set.arbiter_created(*b, floor);
        }
        set.arbiter_created(bodies[0], bodies[1]);
        set.arbiter_created(bodies[1], bodies[2]);
        let before: Vec<_> = bodies.iter().map(|b| set.island_of(*b)).collect();
        let searches = set.search_count;

        assert!(set.body_removed(floor));
        assert_eq!(set.island_count(), 4);
        let after: Vec<_> = bodies.iter().map(|b| set.island_of(*b)).collect();
        assert_eq!(before, after);
        // the floor never linked anything, so no connectivity search was needed
        assert_eq!(set.search_count, searches);
        for b in &bodies {
            assert!(!set.connections(*b).contains(&floor));
        }
    }

    #[test]
    fn removing_a_hub_splits_every_spoke() {
        let mut set = IslandSet::new();
        let hub = set.body_added(false);
        let spokes: Vec<BodyKey> = (0..4).map(|_| set.body_added(false)).collect();
        for s in &spokes {
            set.arbiter_created(hub, *s);
        }
        assert!(set.body_removed(hub));
        assert!(!set.body_removed(hub));
        assert_eq!(set.island_count(), 4);
        for s in &spokes {
            assert!(set.connections(*s).is_empty());
        }
    }

    #[test]
    fn islands_are_pooled() {
        let mut set = IslandSet::new();
        let a = set.body_added(false);
        let b = set.body_added(false);
        set.arbiter_created(a, b);
        assert_eq!(set.island_pool.len(), 1);
        set.arbiter_removed(a, b);
        assert_eq!(set.island_pool.len(), 0);
    }

    #[test]
    fn matches_reference_model() {
        let mut rng = SmallRng::seed_from_u64(1);
        let mut set = IslandSet::new();
        let mut reference = Reference::default();

        for _ in 0..10 {
            reference.add(&mut set, false);
        }

        for step in 0..1500 {
            let live = reference.live();
            match rng.gen_range(0..20) {
                0..=2 => {
                    let is_static = rng.gen_bool(0.15);
                    reference.add(&mut set, is_static);
                }
                3 if live.len() > 2 => {
                    let i = live[rng.gen_range(0..live.len())];
                    assert!(set.body_removed(reference.keys[i]));
                    reference.bodies[i] = None;
                    reference.edges.retain(|(a, b)| *a != i && *b != i);
                }
                4 if !live.is_empty() => {
                    let i = live[rng.gen_range(0..live.len())];
                    let is_static = rng.gen_bool(0.3);
                    set.set_static(reference.keys[i], is_static);
                    reference.bodies[i] = Some(is_static);
                }
                5..=11 if live.len() >= 2 => {
                    let i = live[rng.gen_range(0..live.len())];
                    let j = live[rng.gen_range(0..live.len())];
                    if i != j {
                        if rng.gen_bool(0.5) {
                            set.arbiter_created(reference.keys[i], reference.keys[j]);
                        } else {
                            set.constraint_created(reference.keys[i], reference.keys[j]);
                        }
                        reference.edges.push((i, j));
                    }
                }
                _ if !reference.edges.is_empty() => {
                    let edge_idx = rng.gen_range(0..reference.edges.len());
                    let (i, j) = reference.edges.swap_remove(edge_idx);
                    assert!(set.arbiter_removed(reference.keys[j], reference.keys[i]));
                }
                _ => {}
            }
            if step % 5 == 0 {
                reference.check(&set);
            }
        }
        reference.check(&set);
    }
}
