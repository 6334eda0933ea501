//! Convex collision detection for 3D shapes described by support functions.
//!
//! The pieces, from the bottom up:
//! - [`collision`]: the narrow phase. Point tests, ray casts, sweeps and
//!   penetration queries (MPR and GJK/EPA) between any two [`SupportMap`]s.
//! - [`broadphase`]: a dynamic AABB tree keeping a set of potentially touching pairs.
//! - [`island`]: groups of bodies connected through contacts and constraints.
//! - [`world`]: all of the above wired together.

/// Open a tracy profiling span that lasts until the returned value is dropped.
/// Does nothing unless the `tracy` feature is enabled and a client is running.
macro_rules! tracy_span {
    ($name:literal, $fn_name:literal) => {
        tracy_client::Client::running()
            .map(|client| client.span_alloc(Some($name), $fn_name, file!(), line!(), 0))
    };
}

pub mod math;
pub use math::{uv, Angle, Pose, PoseBuilder, Vec3};

pub mod collision;
pub use collision::{
    gjk_epa, mpr_epa, point_test, ray_cast, sweep_test, with_solver, ColliderShape, Contact,
    ConvexPolytope, MeshError, RayHit, Solver, SolverParams, SupportMap, SweepHit, TriangleMesh,
    Ray, TriangleShape, AABB,
};

pub mod broadphase;
pub use broadphase::{DynamicTree, DynamicTreeParams, Pair, PairHashSet, ProxyId, TreeProxy};

pub mod island;
pub use island::{BodyKey, Island, IslandKey, IslandSet};

pub mod world;
pub use world::{Collider, ColliderKey, CollisionWorld, CollisionWorldParams, ContactEvent};
