//! A dynamic AABB tree that tracks which proxies might be touching.
//!
//! Every proxy is stored in a leaf with an expanded bounding box,
//! stretched along the proxy's velocity and padded on all sides.
//! Leaves are only reinserted when the actual bounding box escapes the expanded one,
//! and the set of overlapping pairs of expanded boxes is maintained incrementally.

use super::pair_set::{Pair, PairHashSet, DEFAULT_MINIMUM_CAPACITY};
use crate::collision::{query::ray_aabb, Ray, AABB};
use crate::math as m;

use rand::{rngs::SmallRng, Rng, SeedableRng};
use std::collections::BinaryHeap;

/// Number of proxies handled by one task in multithreaded updates.
#[cfg(feature = "parallel")]
const PARALLEL_BATCH_SIZE: usize = 64;

/// An object that can be stored in a [`DynamicTree`].
pub trait TreeProxy {
    /// Current bounding box of the object in world space.
    fn world_bounding_box(&self) -> AABB;
    /// Velocity of the object, used to predict where its bounding box is going.
    fn velocity(&self) -> m::Vec3;
}

/// Handle to a proxy stored in a [`DynamicTree`].
///
/// Ids of removed proxies are reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProxyId(pub(crate) u32);

impl ProxyId {
    #[inline]
    pub fn index(&self) -> u32 {
        self.0
    }
}

/// Parameters for the creation of a [`DynamicTree`].
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde-types", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde-types", serde(default))]
pub struct DynamicTreeParams {
    /// How far ahead along its velocity an expanded box reaches,
    /// in the same time unit as the velocity.
    /// Each leaf multiplies this with a random factor between one and two
    /// so that objects moving together don't all get reinserted on the same step.
    pub expand_factor: f64,
    /// Padding added to expanded boxes on all sides.
    ///
    /// Larger values mean fewer reinsertions but more pairs for the narrow phase to check.
    pub expand_eps: f64,
    /// Number of nodes to allocate space for up front.
    pub initial_capacity: usize,
    /// Capacity the pair set never shrinks below.
    pub min_pair_capacity: usize,
    /// Seed for the random expansion factors and [`optimize`][DynamicTree::optimize].
    pub seed: u64,
}

impl Default for DynamicTreeParams {
    fn default() -> Self {
        Self {
            expand_factor: 0.1,
            expand_eps: 0.1,
            initial_capacity: 64,
            min_pair_capacity: DEFAULT_MINIMUM_CAPACITY,
            seed: 0,
        }
    }
}

/// Decides whether a pair of proxies may ever be reported as overlapping.
pub type PairFilter<T> = dyn Fn(&T, &T) -> bool + Send + Sync;

//
// Internal types
//

#[derive(Clone, Copy, Debug)]
struct Node {
    /// Expanded box for leaves, union of the children for branches.
    aabb: AABB,
    kind: NodeKind,
    parent: Option<usize>,
    height: u32,
}

#[derive(Clone, Copy, Debug)]
enum NodeKind {
    Branch { left: usize, right: usize },
    Leaf { proxy: ProxyId },
    /// In the free list waiting to be reused.
    Free,
}

#[derive(Clone, Debug)]
struct ProxySlot<T> {
    proxy: T,
    /// The leaf this proxy lives in.
    node: usize,
}

/// A "call stack" for efficient recursion through the tree.
#[derive(Clone, Debug, Default)]
struct Stack(Vec<usize>);

/// Like a Stack, but ordered by reverse distance
/// for traversing the tree in spatial order along a ray.
#[derive(Clone, Debug, Default)]
struct RayStack(BinaryHeap<RayStackEntry>);

impl RayStack {
    fn push(&mut self, node_idx: usize, distance: f64) {
        self.0.push(RayStackEntry { node_idx, distance });
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct RayStackEntry {
    node_idx: usize,
    distance: f64,
}
impl Eq for RayStackEntry {}
impl PartialOrd for RayStackEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for RayStackEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // reversed to make the max-heap pop the nearest entry first
        other.distance.total_cmp(&self.distance)
    }
}

/// Read-only view of the parts of the tree needed to find overlaps,
/// separate from the pair set so that both can be borrowed at once.
struct OverlapFinder<'a, T> {
    nodes: &'a [Node],
    root: Option<usize>,
    proxies: &'a [Option<ProxySlot<T>>],
    filter: Option<&'a PairFilter<T>>,
}

impl<'a, T> OverlapFinder<'a, T> {
    /// Call `f` with every pair the given leaf forms with other leaves
    /// whose expanded boxes intersect its own.
    fn for_each_pair(
        &self,
        leaf: usize,
        apply_filter: bool,
        stack: &mut Vec<usize>,
        mut f: impl FnMut(Pair),
    ) {
        let proxy = match self.nodes[leaf].kind {
            NodeKind::Leaf { proxy } => proxy,
            _ => return,
        };
        let aabb = self.nodes[leaf].aabb;

        stack.clear();
        stack.extend(self.root);
        while let Some(idx) = stack.pop() {
            let node = &self.nodes[idx];
            if idx == leaf || !node.aabb.intersects(&aabb) {
                continue;
            }
            match node.kind {
                NodeKind::Branch { left, right } => {
                    stack.push(left);
                    stack.push(right);
                }
                NodeKind::Leaf { proxy: other } => {
                    if !apply_filter || self.passes_filter(proxy, other) {
                        f(Pair::new(proxy.0, other.0));
                    }
                }
                NodeKind::Free => {}
            }
        }
    }

    fn passes_filter(&self, a: ProxyId, b: ProxyId) -> bool {
        let filter = match self.filter {
            Some(filter) => filter,
            None => return true,
        };
        match (&self.proxies[a.0 as usize], &self.proxies[b.0 as usize]) {
            (Some(a), Some(b)) => filter(&a.proxy, &b.proxy),
            _ => false,
        }
    }
}

fn expanded_box<T: TreeProxy>(params: &DynamicTreeParams, node: usize, proxy: &T) -> AABB {
    // deterministic per leaf so that the same scene always builds the same tree
    let mut rng = SmallRng::seed_from_u64(params.seed ^ node as u64);
    let jitter: f64 = rng.gen_range(1.0..2.0);
    proxy
        .world_bounding_box()
        .swept(proxy.velocity() * (params.expand_factor * jitter))
        .padded(params.expand_eps)
}

//
// The tree itself
//

/// A bounding volume hierarchy over moving proxies
/// that keeps track of every pair of proxies whose expanded boxes overlap.
///
/// Insertion uses the surface area heuristic. The tree is not rebalanced
/// with rotations; call [`optimize`][Self::optimize] occasionally instead
/// if proxies move around a lot.
pub struct DynamicTree<T> {
    nodes: Vec<Node>,
    free_nodes: Vec<usize>,
    root: Option<usize>,
    proxies: Vec<Option<ProxySlot<T>>>,
    free_proxies: Vec<u32>,
    proxy_count: usize,
    pairs: PairHashSet,
    filter: Option<Box<PairFilter<T>>>,
    params: DynamicTreeParams,
    rng: SmallRng,
    /// Scratch list of proxies reinserted in the current update.
    moved: Vec<ProxyId>,
    /// Stacks that are kept around so that we don't need to
    /// allocate separate ones for every traversal.
    shared_stack: Stack,
    shared_ray_stack: RayStack,
    debug_timings: [f64; 3],
}

impl<T: TreeProxy> DynamicTree<T> {
    pub fn new(params: DynamicTreeParams) -> Self {
        Self {
            nodes: Vec::with_capacity(params.initial_capacity),
            free_nodes: Vec::new(),
            root: None,
            proxies: Vec::new(),
            free_proxies: Vec::new(),
            proxy_count: 0,
            pairs: PairHashSet::with_minimum_capacity(params.min_pair_capacity),
            filter: None,
            rng: SmallRng::seed_from_u64(params.seed),
            params,
            moved: Vec::new(),
            shared_stack: Stack::default(),
            shared_ray_stack: RayStack::default(),
            debug_timings: [0.0; 3],
        }
    }

    /// Create a tree that never reports pairs for which `filter` returns false.
    pub fn with_filter(
        params: DynamicTreeParams,
        filter: impl Fn(&T, &T) -> bool + Send + Sync + 'static,
    ) -> Self {
        let mut tree = Self::new(params);
        tree.filter = Some(Box::new(filter));
        tree
    }

    #[inline]
    pub fn params(&self) -> &DynamicTreeParams {
        &self.params
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.proxy_count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.proxy_count == 0
    }

    /// Pairs of proxies whose expanded boxes overlap.
    #[inline]
    pub fn pairs(&self) -> &PairHashSet {
        &self.pairs
    }

    #[inline]
    pub fn get(&self, id: ProxyId) -> Option<&T> {
        self.slot(id).map(|slot| &slot.proxy)
    }

    /// Access a proxy to change its position or velocity.
    /// The tree picks up the change in the next [`update`][Self::update]
    /// or [`update_proxy`][Self::update_proxy].
    #[inline]
    pub fn get_mut(&mut self, id: ProxyId) -> Option<&mut T> {
        self.proxies
            .get_mut(id.0 as usize)
            .and_then(|slot| slot.as_mut())
            .map(|slot| &mut slot.proxy)
    }

    /// The expanded box the tree currently stores for a proxy.
    pub fn expanded_box(&self, id: ProxyId) -> Option<AABB> {
        self.slot(id).map(|slot| self.nodes[slot.node].aabb)
    }

    pub fn iter(&self) -> impl '_ + Iterator<Item = (ProxyId, &T)> {
        self.proxies.iter().enumerate().filter_map(|(idx, slot)| {
            slot.as_ref()
                .map(|slot| (ProxyId(idx as u32), &slot.proxy))
        })
    }

    /// Time in milliseconds spent in each of the three phases of the last [`update`][Self::update]:
    /// finding moved proxies, reinserting them and finding their new pairs.
    #[inline]
    pub fn debug_timings(&self) -> [f64; 3] {
        self.debug_timings
    }

    #[inline]
    fn slot(&self, id: ProxyId) -> Option<&ProxySlot<T>> {
        self.proxies.get(id.0 as usize).and_then(|slot| slot.as_ref())
    }

    pub fn add_proxy(&mut self, proxy: T) -> ProxyId {
        let id = match self.free_proxies.pop() {
            Some(idx) => ProxyId(idx),
            None => {
                self.proxies.push(None);
                ProxyId((self.proxies.len() - 1) as u32)
            }
        };

        let node = self.alloc_node(Node {
            aabb: AABB::empty(),
            kind: NodeKind::Leaf { proxy: id },
            parent: None,
            height: 0,
        });
        self.nodes[node].aabb = expanded_box(&self.params, node, &proxy);
        self.proxies[id.0 as usize] = Some(ProxySlot { proxy, node });
        self.proxy_count += 1;

        self.insert_leaf(node);
        self.add_pairs_of(node);
        id
    }

    /// Remove a proxy along with every pair it's in.
    /// Returns `None` if the id doesn't refer to a live proxy.
    pub fn remove_proxy(&mut self, id: ProxyId) -> Option<T> {
        let node = self.slot(id)?.node;
        self.remove_pairs_of(node);
        self.remove_leaf(node);
        self.free_node(node);

        let slot = self.proxies[id.0 as usize].take()?;
        self.free_proxies.push(id.0);
        self.proxy_count -= 1;
        Some(slot.proxy)
    }

    /// Bring a single proxy up to date with its current bounding box,
    /// updating its pairs if it had to be reinserted.
    ///
    /// Returns true if the proxy was reinserted.
    pub fn update_proxy(&mut self, id: ProxyId) -> bool {
        let slot = match self.slot(id) {
            Some(slot) => slot,
            None => return false,
        };
        let node = slot.node;
        if self.nodes[node].aabb.contains(&slot.proxy.world_bounding_box()) {
            return false;
        }

        self.remove_pairs_of(node);
        self.reinsert(node);
        self.add_pairs_of(node);
        true
    }

    /// Bring every proxy up to date with its current bounding box.
    ///
    /// Proceeds in three phases: find proxies that escaped their expanded boxes
    /// and remove their pairs, reinsert them, then find their new pairs.
    /// With the `parallel` feature enabled and `multi_thread` set,
    /// the first and last phase are spread over the rayon thread pool.
    pub fn update(&mut self, multi_thread: bool)
    where
        T: Sync,
    {
        let _span = tracy_span!("broad phase update", "update");
        let start = instant::Instant::now();

        self.moved.clear();
        {
            let _span = tracy_span!("find moved proxies", "update");
            self.find_moved(multi_thread);
        }
        let scanned = instant::Instant::now();

        {
            let _span = tracy_span!("reinsert moved proxies", "update");
            for idx in 0..self.moved.len() {
                let id = self.moved[idx];
                if let Some(slot) = self.slot(id) {
                    let node = slot.node;
                    self.reinsert(node);
                }
            }
        }
        let reinserted = instant::Instant::now();

        {
            let _span = tracy_span!("find new pairs", "update");
            self.find_new_pairs(multi_thread);
        }
        let finished = instant::Instant::now();

        let millis = |from: instant::Instant, to: instant::Instant| {
            to.duration_since(from).as_secs_f64() * 1000.0
        };
        self.debug_timings = [
            millis(start, scanned),
            millis(scanned, reinserted),
            millis(reinserted, finished),
        ];
    }

    #[cfg(feature = "parallel")]
    fn find_moved(&mut self, multi_thread: bool)
    where
        T: Sync,
    {
        if multi_thread {
            self.scan_moved_parallel();
        } else {
            self.scan_moved();
        }
    }

    #[cfg(not(feature = "parallel"))]
    fn find_moved(&mut self, _multi_thread: bool) {
        self.scan_moved();
    }

    #[cfg(feature = "parallel")]
    fn find_new_pairs(&mut self, multi_thread: bool)
    where
        T: Sync,
    {
        if multi_thread {
            self.add_moved_pairs_parallel();
        } else {
            self.add_moved_pairs();
        }
    }

    #[cfg(not(feature = "parallel"))]
    fn find_new_pairs(&mut self, _multi_thread: bool) {
        self.add_moved_pairs();
    }

    fn scan_moved(&mut self) {
        let mut stack = std::mem::take(&mut self.shared_stack.0);
        let finder = OverlapFinder {
            nodes: &self.nodes,
            root: self.root,
            proxies: &self.proxies,
            filter: self.filter.as_deref(),
        };

        for (idx, slot) in self.proxies.iter().enumerate() {
            let slot = match slot {
                Some(slot) => slot,
                None => continue,
            };
            if self.nodes[slot.node]
                .aabb
                .contains(&slot.proxy.world_bounding_box())
            {
                continue;
            }
            self.moved.push(ProxyId(idx as u32));
            finder.for_each_pair(slot.node, false, &mut stack, |pair| {
                self.pairs.remove(pair);
            });
        }

        self.shared_stack.0 = stack;
    }

    fn add_moved_pairs(&mut self) {
        let mut stack = std::mem::take(&mut self.shared_stack.0);
        let finder = OverlapFinder {
            nodes: &self.nodes,
            root: self.root,
            proxies: &self.proxies,
            filter: self.filter.as_deref(),
        };

        for id in &self.moved {
            if let Some(slot) = &self.proxies[id.0 as usize] {
                finder.for_each_pair(slot.node, true, &mut stack, |pair| {
                    self.pairs.add(pair);
                });
            }
        }

        self.shared_stack.0 = stack;
    }

    #[cfg(feature = "parallel")]
    fn scan_moved_parallel(&mut self)
    where
        T: Sync,
    {
        use parking_lot::Mutex;
        use rayon::prelude::*;

        let finder = OverlapFinder {
            nodes: &self.nodes,
            root: self.root,
            proxies: &self.proxies,
            filter: self.filter.as_deref(),
        };
        let nodes = &self.nodes;
        let pairs = Mutex::new(&mut self.pairs);
        let moved = Mutex::new(&mut self.moved);

        self.proxies
            .par_chunks(PARALLEL_BATCH_SIZE)
            .enumerate()
            .for_each(|(batch_idx, batch)| {
                let mut stack = Vec::new();
                let mut batch_moved = Vec::new();
                let mut batch_pairs = Vec::new();
                for (idx_in_batch, slot) in batch.iter().enumerate() {
                    let slot = match slot {
                        Some(slot) => slot,
                        None => continue,
                    };
                    if nodes[slot.node]
                        .aabb
                        .contains(&slot.proxy.world_bounding_box())
                    {
                        continue;
                    }
                    let idx = batch_idx * PARALLEL_BATCH_SIZE + idx_in_batch;
                    batch_moved.push(ProxyId(idx as u32));
                    finder.for_each_pair(slot.node, false, &mut stack, |pair| {
                        batch_pairs.push(pair)
                    });
                }

                if !batch_pairs.is_empty() {
                    let mut pairs = pairs.lock();
                    for pair in batch_pairs {
                        pairs.remove(pair);
                    }
                }
                if !batch_moved.is_empty() {
                    moved.lock().extend(batch_moved);
                }
            });

        // batches finish in any order, reinsertion shouldn't depend on it
        self.moved.sort_unstable();
    }

    #[cfg(feature = "parallel")]
    fn add_moved_pairs_parallel(&mut self)
    where
        T: Sync,
    {
        use parking_lot::Mutex;
        use rayon::prelude::*;

        let finder = OverlapFinder {
            nodes: &self.nodes,
            root: self.root,
            proxies: &self.proxies,
            filter: self.filter.as_deref(),
        };
        let proxies = &self.proxies;
        let pairs = Mutex::new(&mut self.pairs);

        self.moved.par_chunks(PARALLEL_BATCH_SIZE).for_each(|batch| {
            let mut stack = Vec::new();
            let mut batch_pairs = Vec::new();
            for id in batch {
                if let Some(slot) = &proxies[id.0 as usize] {
                    finder.for_each_pair(slot.node, true, &mut stack, |pair| {
                        batch_pairs.push(pair)
                    });
                }
            }

            if !batch_pairs.is_empty() {
                let mut pairs = pairs.lock();
                for pair in batch_pairs {
                    pairs.add(pair);
                }
            }
        });
    }

    fn add_pairs_of(&mut self, leaf: usize) {
        let mut stack = std::mem::take(&mut self.shared_stack.0);
        let pairs = &mut self.pairs;
        OverlapFinder {
            nodes: &self.nodes,
            root: self.root,
            proxies: &self.proxies,
            filter: self.filter.as_deref(),
        }
        .for_each_pair(leaf, true, &mut stack, |pair| {
            pairs.add(pair);
        });
        self.shared_stack.0 = stack;
    }

    fn remove_pairs_of(&mut self, leaf: usize) {
        let mut stack = std::mem::take(&mut self.shared_stack.0);
        let pairs = &mut self.pairs;
        OverlapFinder {
            nodes: &self.nodes,
            root: self.root,
            proxies: &self.proxies,
            filter: None,
        }
        .for_each_pair(leaf, false, &mut stack, |pair| {
            pairs.remove(pair);
        });
        self.shared_stack.0 = stack;
    }

    /// Take a leaf out of the tree, recompute its expanded box and put it back.
    fn reinsert(&mut self, leaf: usize) {
        let proxy = match self.nodes[leaf].kind {
            NodeKind::Leaf { proxy } => proxy,
            _ => return,
        };
        self.remove_leaf(leaf);
        let aabb = match self.slot(proxy) {
            Some(slot) => expanded_box(&self.params, leaf, &slot.proxy),
            None => self.nodes[leaf].aabb,
        };
        self.nodes[leaf].aabb = aabb;
        self.insert_leaf(leaf);
    }

    /// Randomly remove and reinsert leaves to improve the tree's structure
    /// after lots of movement.
    ///
    /// Each leaf is reinserted with probability `chance` on each of the `sweeps` passes.
    /// Expanded boxes are kept, so this never changes the set of pairs.
    pub fn optimize(&mut self, sweeps: usize, chance: f64) {
        let _span = tracy_span!("optimize broad phase tree", "optimize");
        let chance = chance.clamp(0.0, 1.0);
        for _ in 0..sweeps {
            for idx in 0..self.proxies.len() {
                let node = match &self.proxies[idx] {
                    Some(slot) => slot.node,
                    None => continue,
                };
                if self.rng.gen_bool(chance) {
                    self.remove_leaf(node);
                    self.insert_leaf(node);
                }
            }
        }
    }

    //
    // Tree structure
    //

    fn alloc_node(&mut self, node: Node) -> usize {
        if let Some(idx) = self.free_nodes.pop() {
            self.nodes[idx] = node;
            return idx;
        }
        if self.nodes.len() == self.nodes.capacity() {
            log::debug!(
                "Growing broad phase tree beyond {} nodes",
                self.nodes.capacity()
            );
        }
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    fn free_node(&mut self, idx: usize) {
        self.nodes[idx].kind = NodeKind::Free;
        self.nodes[idx].parent = None;
        self.free_nodes.push(idx);
    }

    /// Cost of descending into `child` to insert a leaf with the given box,
    /// not counting what the ancestors have to grow.
    fn descend_cost(&self, child: usize, leaf_aabb: &AABB) -> f64 {
        let child_node = &self.nodes[child];
        let combined = child_node.aabb.union(leaf_aabb).perimeter();
        match child_node.kind {
            NodeKind::Leaf { .. } => combined,
            _ => combined - child_node.aabb.perimeter(),
        }
    }

    fn insert_leaf(&mut self, leaf: usize) {
        let root = match self.root {
            Some(root) => root,
            None => {
                self.root = Some(leaf);
                self.nodes[leaf].parent = None;
                return;
            }
        };

        // find the best sibling with the surface area heuristic

        let leaf_aabb = self.nodes[leaf].aabb;
        let mut sibling = root;
        while let NodeKind::Branch { left, right } = self.nodes[sibling].kind {
            let perimeter = self.nodes[sibling].aabb.perimeter();
            let combined = self.nodes[sibling].aabb.union(&leaf_aabb).perimeter();
            // cost of pairing the leaf with this node under a new parent
            let cost = 2.0 * combined;
            // growth this node must take on if the leaf goes further down
            let inheritance = 2.0 * (combined - perimeter);

            let cost_left = self.descend_cost(left, &leaf_aabb) + inheritance;
            let cost_right = self.descend_cost(right, &leaf_aabb) + inheritance;
            if cost < cost_left && cost < cost_right {
                break;
            }
            sibling = if cost_left < cost_right { left } else { right };
        }

        // put a new branch where the sibling was and the sibling and leaf under it

        let old_parent = self.nodes[sibling].parent;
        let new_parent = self.alloc_node(Node {
            aabb: leaf_aabb.union(&self.nodes[sibling].aabb),
            kind: NodeKind::Branch {
                left: sibling,
                right: leaf,
            },
            parent: old_parent,
            height: self.nodes[sibling].height + 1,
        });
        match old_parent {
            Some(parent) => self.replace_child(parent, sibling, new_parent),
            None => self.root = Some(new_parent),
        }
        self.nodes[sibling].parent = Some(new_parent);
        self.nodes[leaf].parent = Some(new_parent);

        self.refit_upwards(old_parent);
    }

    /// Detach a leaf from the tree without freeing it.
    fn remove_leaf(&mut self, leaf: usize) {
        if self.root == Some(leaf) {
            self.root = None;
            return;
        }
        let parent = match self.nodes[leaf].parent {
            Some(parent) => parent,
            None => return,
        };
        let sibling = match self.nodes[parent].kind {
            NodeKind::Branch { left, right } => {
                if left == leaf {
                    right
                } else {
                    left
                }
            }
            _ => return,
        };

        // the sibling takes the parent's place
        let grandparent = self.nodes[parent].parent;
        match grandparent {
            Some(grandparent) => self.replace_child(grandparent, parent, sibling),
            None => self.root = Some(sibling),
        }
        self.nodes[sibling].parent = grandparent;
        self.free_node(parent);
        self.nodes[leaf].parent = None;

        self.refit_upwards(grandparent);
    }

    fn replace_child(&mut self, parent: usize, old_child: usize, new_child: usize) {
        if let NodeKind::Branch { left, right } = &mut self.nodes[parent].kind {
            if *left == old_child {
                *left = new_child;
            } else {
                *right = new_child;
            }
        }
    }

    /// Recompute boxes and heights from a node up to the root.
    fn refit_upwards(&mut self, start: Option<usize>) {
        let mut next = start;
        while let Some(idx) = next {
            if let NodeKind::Branch { left, right } = self.nodes[idx].kind {
                let (l, r) = (&self.nodes[left], &self.nodes[right]);
                let aabb = l.aabb.union(&r.aabb);
                let height = 1 + l.height.max(r.height);
                self.nodes[idx].aabb = aabb;
                self.nodes[idx].height = height;
            }
            next = self.nodes[idx].parent;
        }
    }

    //
    // Queries
    //

    /// Iterate over every proxy whose expanded box intersects the given box.
    pub fn query(&mut self, aabb: AABB) -> AABBIter<'_> {
        self.shared_stack.0.clear();
        AABBIter {
            aabb,
            next_node: self
                .root
                .filter(|root| self.nodes[*root].aabb.intersects(&aabb)),
            stack: &mut self.shared_stack,
            nodes: &self.nodes,
        }
    }

    /// Iterate over every proxy whose expanded box a ray hits before `max_t`,
    /// in order of where the ray enters the box.
    ///
    /// Yields the proxy together with the ray parameter of the entry point.
    pub fn query_ray(&mut self, ray: Ray, max_t: f64) -> RayIter<'_> {
        let stack = &mut self.shared_ray_stack;
        stack.0.clear();
        if let Some(root) = self.root {
            match ray_aabb(ray, self.nodes[root].aabb) {
                Some(t) if t <= max_t => stack.push(root, t),
                _ => {}
            }
        }
        RayIter {
            ray,
            max_t,
            stack,
            nodes: &self.nodes,
        }
    }

    //
    // Debugging
    //

    /// Visit every node in the tree depth first,
    /// calling `f` with its box and depth (zero for the root).
    pub fn enumerate_all(&self, mut f: impl FnMut(&AABB, usize)) {
        let mut stack: Vec<(usize, usize)> = Vec::new();
        stack.extend(self.root.map(|root| (root, 0)));
        while let Some((idx, depth)) = stack.pop() {
            let node = &self.nodes[idx];
            f(&node.aabb, depth);
            if let NodeKind::Branch { left, right } = node.kind {
                stack.push((right, depth + 1));
                stack.push((left, depth + 1));
            }
        }
    }

    /// Total surface area of every node's box.
    /// Lower is better; useful for measuring the effect of [`optimize`][Self::optimize].
    pub fn calculate_cost(&self) -> f64 {
        let mut cost = 0.0;
        self.enumerate_all(|aabb, _| cost += aabb.surface_area());
        cost
    }

    /// Length of the longest path from the root to a leaf,
    /// found by walking the tree rather than trusting stored heights.
    pub fn calculate_height(&self) -> usize {
        let mut height = 0;
        self.enumerate_all(|_, depth| height = height.max(depth));
        height
    }
}

//
// Iterators
//

/// An iterator that yields every proxy whose expanded box intersects a given AABB.
#[derive(Debug)]
pub struct AABBIter<'a> {
    aabb: AABB,
    stack: &'a mut Stack,
    nodes: &'a [Node],
    next_node: Option<usize>,
}

impl<'a> Iterator for AABBIter<'a> {
    type Item = ProxyId;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let next_node = self.next_node?;

            match self.nodes[next_node].kind {
                NodeKind::Branch { left, right } => {
                    match (
                        self.aabb.intersects(&self.nodes[left].aabb),
                        self.aabb.intersects(&self.nodes[right].aabb),
                    ) {
                        (true, true) => {
                            // need to visit both children, push to stack to return to later
                            self.stack.0.push(right);
                            self.next_node = Some(left);
                        }
                        (true, false) => {
                            self.next_node = Some(left);
                        }
                        (false, true) => {
                            self.next_node = Some(right);
                        }
                        (false, false) => {
                            // nothing below this, return back up the stack
                            self.next_node = self.stack.0.pop();
                        }
                    }
                }
                NodeKind::Leaf { proxy } => {
                    self.next_node = self.stack.0.pop();
                    return Some(proxy);
                }
                NodeKind::Free => {
                    self.next_node = self.stack.0.pop();
                }
            }
        }
    }
}

impl<'a> Drop for AABBIter<'a> {
    fn drop(&mut self) {
        // clear the stack on drop; it may not be empty
        // if the iteration didn't finish
        self.stack.0.clear();
    }
}

/// An iterator over the proxies along a ray, nearest first.
#[derive(Debug)]
pub struct RayIter<'a> {
    ray: Ray,
    max_t: f64,
    stack: &'a mut RayStack,
    nodes: &'a [Node],
}

impl<'a> Iterator for RayIter<'a> {
    type Item = (ProxyId, f64);

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(entry) = self.stack.0.pop() {
            match self.nodes[entry.node_idx].kind {
                NodeKind::Branch { left, right } => {
                    // a child's box is inside its parent's,
                    // so the ray can't enter it before the parent
                    for child in [left, right] {
                        match ray_aabb(self.ray, self.nodes[child].aabb) {
                            Some(t) if t <= self.max_t => self.stack.push(child, t),
                            _ => {}
                        }
                    }
                }
                NodeKind::Leaf { proxy } => return Some((proxy, entry.distance)),
                NodeKind::Free => {}
            }
        }
        None
    }
}

impl<'a> Drop for RayIter<'a> {
    fn drop(&mut self) {
        self.stack.0.clear();
    }
}
