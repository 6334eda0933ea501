//! A set of collision objects with broad phase, narrow phase
//! and island tracking wired together.

use crate::{
    broadphase::{DynamicTree, DynamicTreeParams, Pair, ProxyId, TreeProxy},
    collision::{Contact, ColliderShape, Ray, RayHit, Solver, SolverParams, SupportMap, AABB},
    island::{self, IslandKey, IslandSet},
    math as m,
};

use std::collections::HashMap;

/// Key type to look up a collider stored in a [`CollisionWorld`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ColliderKey(ProxyId);

impl ColliderKey {
    #[inline]
    pub fn index(&self) -> u32 {
        self.0.index()
    }
}

/// A shape placed in the world.
#[derive(Clone, Debug)]
pub struct Collider {
    pub shape: ColliderShape,
    pub pose: m::Pose,
    /// Used by the broad phase to predict movement. Nothing here integrates it.
    pub velocity: m::Vec3,
    is_static: bool,
}

impl Collider {
    pub fn new(shape: ColliderShape) -> Self {
        Self {
            shape,
            pose: m::Pose::identity(),
            velocity: m::Vec3::zero(),
            is_static: false,
        }
    }

    pub fn with_pose(mut self, pose: m::Pose) -> Self {
        self.pose = pose;
        self
    }

    pub fn with_velocity(mut self, velocity: m::Vec3) -> Self {
        self.velocity = velocity;
        self
    }

    /// Make the collider static. Static colliders don't touch each other
    /// and don't link the colliders touching them into one island.
    pub fn as_static(mut self) -> Self {
        self.is_static = true;
        self
    }

    #[inline]
    pub fn is_static(&self) -> bool {
        self.is_static
    }
}

/// Events produced by [`CollisionWorld::step`] when contacts begin or end.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ContactEvent {
    /// Two colliders started touching. `contact.normal` points from `b` toward `a`.
    Started {
        a: ColliderKey,
        b: ColliderKey,
        contact: Contact,
    },
    /// Two colliders stopped touching.
    Ended { a: ColliderKey, b: ColliderKey },
}

/// Parameters for the creation of a [`CollisionWorld`].
#[derive(Clone, Copy, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde-types", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde-types", serde(default))]
pub struct CollisionWorldParams {
    pub broad_phase: DynamicTreeParams,
    pub narrow_phase: SolverParams,
    /// Spread the broad phase update and narrow phase over the rayon thread pool.
    /// Only has an effect with the `parallel` feature.
    pub multi_thread: bool,
}

/// What the broad phase tree actually stores.
struct Entry {
    collider: Collider,
    island_body: island::BodyKey,
}

impl TreeProxy for Entry {
    #[inline]
    fn world_bounding_box(&self) -> AABB {
        self.collider.shape.bounding_box(&self.collider.pose)
    }

    #[inline]
    fn velocity(&self) -> m::Vec3 {
        self.collider.velocity
    }
}

/// Colliders, the contacts between them and the islands they form.
///
/// Move colliders around with [`get_mut`][Self::get_mut]
/// and call [`step`][Self::step] to find out what's touching what.
pub struct CollisionWorld {
    tree: DynamicTree<Entry>,
    islands: IslandSet,
    solver: Solver,
    /// One contact per pair of touching colliders.
    arbiters: HashMap<Pair, Contact>,
    events: Vec<ContactEvent>,
    params: CollisionWorldParams,
}

impl Default for CollisionWorld {
    fn default() -> Self {
        Self::new(CollisionWorldParams::default())
    }
}

impl CollisionWorld {
    pub fn new(params: CollisionWorldParams) -> Self {
        Self {
            tree: DynamicTree::with_filter(params.broad_phase, |a: &Entry, b: &Entry| {
                !(a.collider.is_static && b.collider.is_static)
            }),
            islands: IslandSet::new(),
            solver: Solver::new(params.narrow_phase),
            arbiters: HashMap::new(),
            events: Vec::new(),
            params,
        }
    }

    #[inline]
    pub fn params(&self) -> &CollisionWorldParams {
        &self.params
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    pub fn add_collider(&mut self, collider: Collider) -> ColliderKey {
        let island_body = self.islands.body_added(collider.is_static);
        ColliderKey(self.tree.add_proxy(Entry {
            collider,
            island_body,
        }))
    }

    /// Remove a collider along with its contacts.
    /// No [`ContactEvent::Ended`] events are generated for them.
    pub fn remove_collider(&mut self, key: ColliderKey) -> Option<Collider> {
        let entry = self.tree.remove_proxy(key.0)?;
        let id = key.0.index();
        self.arbiters.retain(|pair, _| pair.id1 != id && pair.id2 != id);
        self.islands.body_removed(entry.island_body);
        Some(entry.collider)
    }

    #[inline]
    pub fn get(&self, key: ColliderKey) -> Option<&Collider> {
        self.tree.get(key.0).map(|e| &e.collider)
    }

    /// Access a collider to move it.
    /// Changes take effect on the next [`step`][Self::step].
    #[inline]
    pub fn get_mut(&mut self, key: ColliderKey) -> Option<&mut Collider> {
        self.tree.get_mut(key.0).map(|e| &mut e.collider)
    }

    pub fn iter(&self) -> impl '_ + Iterator<Item = (ColliderKey, &Collider)> {
        self.tree
            .iter()
            .map(|(id, entry)| (ColliderKey(id), &entry.collider))
    }

    /// Change whether a collider is static.
    ///
    /// Pairs of colliders that both are static stop touching on the next step,
    /// but new pairs of them may still be picked up by the broad phase
    /// until one of them moves.
    pub fn set_static(&mut self, key: ColliderKey, is_static: bool) {
        if let Some(entry) = self.tree.get_mut(key.0) {
            entry.collider.is_static = is_static;
            let body = entry.island_body;
            self.islands.set_static(body, is_static);
        }
    }

    #[inline]
    pub fn islands(&self) -> &IslandSet {
        &self.islands
    }

    /// The island a collider is in. `None` for static colliders.
    pub fn island_of(&self, key: ColliderKey) -> Option<IslandKey> {
        self.tree
            .get(key.0)
            .and_then(|e| self.islands.island_of(e.island_body))
    }

    /// Every pair of colliders currently touching.
    pub fn contacts(&self) -> impl '_ + Iterator<Item = (ColliderKey, ColliderKey, &Contact)> {
        self.arbiters.iter().map(|(pair, contact)| {
            let (a, b) = pair_keys(*pair);
            (a, b, contact)
        })
    }

    /// Events generated by the last [`step`][Self::step].
    #[inline]
    pub fn events(&self) -> &[ContactEvent] {
        &self.events
    }

    /// Time spent in the phases of the last broad phase update,
    /// see [`DynamicTree::debug_timings`].
    #[inline]
    pub fn debug_timings(&self) -> [f64; 3] {
        self.tree.debug_timings()
    }

    /// Improve the broad phase tree after lots of movement.
    /// See [`DynamicTree::optimize`].
    pub fn optimize_broad_phase(&mut self, sweeps: usize, chance: f64) {
        self.tree.optimize(sweeps, chance);
    }

    /// Update the broad phase, test every candidate pair
    /// and report which contacts started and ended.
    pub fn step(&mut self) -> &[ContactEvent] {
        let _span = tracy_span!("collision world step", "step");
        self.events.clear();

        self.tree.update(self.params.multi_thread);

        // sorted so that events come out in the same order every time
        let mut pairs: Vec<Pair> = self.tree.pairs().iter().collect();
        pairs.sort_unstable();
        let contacts = {
            let _span = tracy_span!("narrow phase", "step");
            self.narrow_phase(&pairs)
        };

        // pairs the broad phase dropped can't be touching anymore
        let mut dropped: Vec<Pair> = self
            .arbiters
            .keys()
            .filter(|pair| !self.tree.pairs().contains(**pair))
            .copied()
            .collect();
        dropped.sort_unstable();
        for pair in dropped {
            self.end_contact(pair);
        }

        for (pair, contact) in pairs.into_iter().zip(contacts) {
            match (contact, self.arbiters.get_mut(&pair)) {
                (Some(contact), Some(arbiter)) => *arbiter = contact,
                (Some(contact), None) => self.start_contact(pair, contact),
                (None, Some(_)) => self.end_contact(pair),
                (None, None) => {}
            }
        }

        &self.events
    }

    fn narrow_phase(&mut self, pairs: &[Pair]) -> Vec<Option<Contact>> {
        let tree = &self.tree;
        let test = |solver: &mut Solver, pair: &Pair| -> Option<Contact> {
            let (a, b) = pair_keys(*pair);
            let a = &tree.get(a.0)?.collider;
            let b = &tree.get(b.0)?.collider;
            if a.is_static && b.is_static {
                return None;
            }
            solver
                .mpr_epa(&a.shape, &a.pose, &b.shape, &b.pose)
                .filter(|contact| contact.penetration >= 0.0)
        };

        #[cfg(feature = "parallel")]
        if self.params.multi_thread {
            use crate::collision::with_solver;
            use rayon::prelude::*;
            // each worker keeps its own polytope in its thread-local solver
            let params = *self.solver.params();
            return pairs
                .par_iter()
                .map(|pair| {
                    with_solver(|solver| {
                        if *solver.params() != params {
                            solver.set_params(params);
                        }
                        test(solver, pair)
                    })
                })
                .collect();
        }

        let solver = &mut self.solver;
        pairs.iter().map(|pair| test(solver, pair)).collect()
    }

    fn start_contact(&mut self, pair: Pair, contact: Contact) {
        self.arbiters.insert(pair, contact);
        let (a, b) = pair_keys(pair);
        if let (Some(body_a), Some(body_b)) = (self.island_body(a), self.island_body(b)) {
            self.islands.arbiter_created(body_a, body_b);
        }
        self.events.push(ContactEvent::Started { a, b, contact });
    }

    fn end_contact(&mut self, pair: Pair) {
        if self.arbiters.remove(&pair).is_none() {
            return;
        }
        let (a, b) = pair_keys(pair);
        if let (Some(body_a), Some(body_b)) = (self.island_body(a), self.island_body(b)) {
            self.islands.arbiter_removed(body_a, body_b);
        }
        self.events.push(ContactEvent::Ended { a, b });
    }

    #[inline]
    fn island_body(&self, key: ColliderKey) -> Option<island::BodyKey> {
        self.tree.get(key.0).map(|e| e.island_body)
    }

    //
    // Queries
    //

    /// Find the first collider hit by a ray within `max_fraction` multiples of `direction`.
    pub fn ray_cast(
        &mut self,
        origin: m::Vec3,
        direction: m::Vec3,
        max_fraction: f64,
    ) -> Option<(ColliderKey, RayHit)> {
        let candidates: Vec<(ProxyId, f64)> = self
            .tree
            .query_ray(Ray::new(origin, direction), max_fraction)
            .collect();

        let mut closest: Option<(ColliderKey, RayHit)> = None;
        for (id, entry_fraction) in candidates {
            // candidates come in order and shapes are inside their boxes,
            // nothing further can be closer than a hit we already have
            if matches!(closest, Some((_, hit)) if entry_fraction > hit.fraction) {
                break;
            }
            let collider = match self.tree.get(id) {
                Some(entry) => &entry.collider,
                None => continue,
            };
            let hit = match self
                .solver
                .ray_cast(&collider.shape, &collider.pose, origin, direction)
            {
                Some(hit) if hit.fraction <= max_fraction => hit,
                _ => continue,
            };
            if !matches!(closest, Some((_, best)) if best.fraction <= hit.fraction) {
                closest = Some((ColliderKey(id), hit));
            }
        }
        closest
    }

    /// Every collider whose bounding box intersects the given box.
    pub fn query_aabb(&mut self, aabb: AABB) -> Vec<ColliderKey> {
        let candidates: Vec<ProxyId> = self.tree.query(aabb).collect();
        candidates
            .into_iter()
            .filter(|id| {
                self.tree
                    .get(*id)
                    .map_or(false, |e| e.world_bounding_box().intersects(&aabb))
            })
            .map(ColliderKey)
            .collect()
    }

    /// Every collider containing the given point.
    pub fn query_point(&mut self, point: m::Vec3) -> Vec<ColliderKey> {
        let candidates: Vec<ProxyId> = self.tree.query(AABB::new(point, point)).collect();
        let solver = &mut self.solver;
        let tree = &self.tree;
        candidates
            .into_iter()
            .filter(|id| {
                tree.get(*id).map_or(false, |e| {
                    solver.point_test(&e.collider.shape, &e.collider.pose, point)
                })
            })
            .map(ColliderKey)
            .collect()
    }
}

#[inline]
fn pair_keys(pair: Pair) -> (ColliderKey, ColliderKey) {
    (ColliderKey(ProxyId(pair.id1)), ColliderKey(ProxyId(pair.id2)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::{PoseBuilder, Vec3};

    fn sphere_at(x: f64, y: f64, z: f64) -> Collider {
        Collider::new(ColliderShape::sphere(1.0))
            .with_pose(PoseBuilder::new().with_position([x, y, z]).build())
    }

    fn move_to(world: &mut CollisionWorld, key: ColliderKey, pos: [f64; 3]) {
        world.get_mut(key).unwrap().pose = PoseBuilder::new().with_position(pos).build();
    }

    #[test]
    fn contacts_start_and_end() {
        let mut world = CollisionWorld::default();
        let a = world.add_collider(sphere_at(0.0, 0.0, 0.0));
        let b = world.add_collider(sphere_at(5.0, 0.0, 0.0));
        assert!(world.step().is_empty());
        assert_ne!(world.island_of(a), world.island_of(b));

        move_to(&mut world, b, [1.5, 0.0, 0.0]);
        let events = world.step().to_vec();
        assert_eq!(events.len(), 1);
        match events[0] {
            ContactEvent::Started {
                a: ea,
                b: eb,
                contact,
            } => {
                assert_eq!((ea, eb), (a, b));
                assert!((contact.penetration - 0.5).abs() < 1e-2);
                assert!((contact.normal - Vec3::new(-1.0, 0.0, 0.0)).mag() < 5e-2);
            }
            other => panic!("Expected a started contact, got {:?}", other),
        }
        assert_eq!(world.island_of(a), world.island_of(b));
        assert_eq!(world.contacts().count(), 1);

        // still touching, no new events
        move_to(&mut world, b, [1.6, 0.0, 0.0]);
        assert!(world.step().is_empty());

        // separated but still within the expanded boxes
        move_to(&mut world, b, [2.05, 0.0, 0.0]);
        assert_eq!(world.step(), &[ContactEvent::Ended { a, b }]);
        assert_ne!(world.island_of(a), world.island_of(b));

        // touching again, then far away so that the broad phase drops the pair
        move_to(&mut world, b, [1.8, 0.0, 0.0]);
        assert_eq!(world.step().len(), 1);
        move_to(&mut world, b, [50.0, 0.0, 0.0]);
        assert_eq!(world.step(), &[ContactEvent::Ended { a, b }]);
        assert_eq!(world.contacts().count(), 0);
    }

    #[test]
    fn deep_overlap_keeps_contact() {
        let mut world = CollisionWorld::default();
        let a = world.add_collider(sphere_at(0.0, 0.0, 0.0));
        let b = world.add_collider(sphere_at(1.5, 0.0, 0.0));
        assert_eq!(world.step().len(), 1);
        let island = world.island_of(a);
        assert_eq!(island, world.island_of(b));

        move_to(&mut world, b, [0.2, 0.1, 0.0]);
        assert!(world.step().is_empty());
        assert_eq!(world.island_of(a), island);
        assert_eq!(world.island_of(b), island);
        let (_, _, contact) = world.contacts().next().expect("Still touching");
        assert!(contact.penetration > 1.5);

        // all the way through and out again
        move_to(&mut world, b, [0.0, 0.0, 0.0]);
        assert!(world.step().is_empty());
        move_to(&mut world, b, [-1.5, 0.0, 0.0]);
        assert!(world.step().is_empty());
        assert_eq!(world.island_of(a), world.island_of(b));
    }

    #[cfg(feature = "parallel")]
    #[test]
    fn parallel_narrow_phase_matches_serial() {
        fn build(multi_thread: bool) -> CollisionWorld {
            let mut world = CollisionWorld::new(CollisionWorldParams {
                multi_thread,
                ..Default::default()
            });
            for i in 0..40 {
                let x = (i % 8) as f64 * 1.7;
                let y = (i / 8) as f64 * 1.2;
                world.add_collider(sphere_at(x, y, 0.1 * (i % 3) as f64));
            }
            world
        }

        let mut serial = build(false);
        let mut parallel = build(true);
        assert_eq!(serial.step(), parallel.step());

        let sorted = |world: &CollisionWorld| {
            let mut contacts: Vec<_> = world.contacts().map(|(a, b, c)| (a, b, *c)).collect();
            contacts.sort_by_key(|(a, b, _)| (*a, *b));
            contacts
        };
        let serial_contacts = sorted(&serial);
        assert!(!serial_contacts.is_empty());
        assert_eq!(serial_contacts, sorted(&parallel));
    }

    #[test]
    fn static_floor_keeps_islands_apart() {
        let mut world = CollisionWorld::default();
        let floor = world.add_collider(
            Collider::new(ColliderShape::cuboid(20.0, 1.0, 20.0))
                .with_pose(PoseBuilder::new().with_position([0.0, -1.0, 0.0]).build())
                .as_static(),
        );
        let a = world.add_collider(sphere_at(-3.0, 0.4, 0.0));
        let b = world.add_collider(sphere_at(3.0, 0.4, 0.0));
        let events = world.step().to_vec();
        assert_eq!(events.len(), 2);
        assert_eq!(world.island_of(floor), None);
        assert_ne!(world.island_of(a), world.island_of(b));
        assert_eq!(world.islands().island_count(), 2);

        // a second static object overlapping the floor never touches it
        world.add_collider(
            Collider::new(ColliderShape::cuboid(1.0, 1.0, 1.0))
                .with_pose(PoseBuilder::new().with_position([8.0, -1.0, 0.0]).build())
                .as_static(),
        );
        assert!(world.step().is_empty());
    }

    #[test]
    fn removing_a_collider_drops_its_contacts() {
        let mut world = CollisionWorld::default();
        let a = world.add_collider(sphere_at(0.0, 0.0, 0.0));
        let b = world.add_collider(sphere_at(1.5, 0.0, 0.0));
        let c = world.add_collider(sphere_at(3.0, 0.0, 0.0));
        world.step();
        assert_eq!(world.contacts().count(), 2);
        assert_eq!(world.islands().island_count(), 1);

        assert!(world.remove_collider(b).is_some());
        assert!(world.get(b).is_none());
        assert_eq!(world.contacts().count(), 0);
        assert_ne!(world.island_of(a), world.island_of(c));
        assert!(world.step().is_empty());
    }

    #[test]
    fn ray_cast_finds_nearest() {
        let mut world = CollisionWorld::default();
        let far = world.add_collider(sphere_at(10.0, 0.0, 0.0));
        let near = world.add_collider(sphere_at(4.0, 0.0, 0.0));
        world.add_collider(sphere_at(4.0, 5.0, 0.0));
        world.step();

        let (key, hit) = world
            .ray_cast(Vec3::zero(), Vec3::unit_x(), 100.0)
            .expect("Ray should hit");
        assert_eq!(key, near);
        assert!((hit.fraction - 3.0).abs() < 1e-2);
        assert!((hit.normal - Vec3::new(-1.0, 0.0, 0.0)).mag() < 5e-2);

        world.remove_collider(near);
        let (key, _) = world
            .ray_cast(Vec3::zero(), Vec3::unit_x(), 100.0)
            .expect("Ray should hit");
        assert_eq!(key, far);
        assert!(world.ray_cast(Vec3::zero(), Vec3::unit_x(), 5.0).is_none());
        assert!(world.ray_cast(Vec3::zero(), -Vec3::unit_x(), 100.0).is_none());
    }

    #[test]
    fn aabb_and_point_queries() {
        let mut world = CollisionWorld::default();
        let a = world.add_collider(sphere_at(0.0, 0.0, 0.0));
        let b = world.add_collider(sphere_at(6.0, 0.0, 0.0));

        let found = world.query_aabb(AABB::new(Vec3::new(0.5, -0.5, -0.5), Vec3::new(1.5, 0.5, 0.5)));
        assert_eq!(found, vec![a]);
        let mut both = world.query_aabb(AABB::new(Vec3::broadcast(-10.0), Vec3::broadcast(10.0)));
        both.sort();
        assert_eq!(both, vec![a, b]);

        assert_eq!(world.query_point(Vec3::new(6.5, 0.0, 0.0)), vec![b]);
        // inside the bounding box but outside the sphere
        assert!(world.query_point(Vec3::new(0.9, 0.9, 0.0)).is_empty());
    }

    #[cfg(feature = "serde-types")]
    #[test]
    fn params_from_partial_config() {
        let params: CollisionWorldParams = ron::from_str(
            "(broad_phase: (expand_eps: 0.2), narrow_phase: (max_epa_iterations: 100))",
        )
        .expect("Valid config");
        assert_eq!(params.broad_phase.expand_eps, 0.2);
        assert_eq!(params.narrow_phase.max_epa_iterations, 100);
        assert_eq!(params.narrow_phase.max_iterations, 34);
        assert!(!params.multi_thread);
    }
}
