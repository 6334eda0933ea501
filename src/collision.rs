//! Convex collision detection: shapes described by support mappings
//! and the narrow phase solver operating on them.

use crate::math as m;

pub mod mesh;
pub use mesh::{MeshError, TriangleMesh, TriangleShape};

pub mod minkowski;
pub use minkowski::{MinkowskiDifference, Vertex};

pub mod narrowphase;
pub use narrowphase::{
    gjk_epa, mpr_epa, point_test, ray_cast, sweep_test, with_solver, Contact, RayHit, Solver,
    SolverParams, SweepHit,
};

pub mod polytope;
pub use polytope::{ConvexPolytope, Triangle};

pub mod query;

pub mod shape;
pub use shape::{ColliderShape, SupportMap};

/// An axis-aligned bounding box.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde-types", derive(serde::Serialize, serde::Deserialize))]
pub struct AABB {
    pub min: m::Vec3,
    pub max: m::Vec3,
}

impl AABB {
    pub fn new(min: m::Vec3, max: m::Vec3) -> Self {
        Self { min, max }
    }

    /// A box that contains nothing, not even the origin.
    /// Useful as the starting point of a union.
    pub fn empty() -> Self {
        Self {
            min: m::Vec3::broadcast(f64::INFINITY),
            max: m::Vec3::broadcast(f64::NEG_INFINITY),
        }
    }

    /// The smallest box that contains both `self` and `other`.
    #[inline]
    pub fn union(&self, other: &AABB) -> AABB {
        AABB {
            min: self.min.min_by_component(other.min),
            max: self.max.max_by_component(other.max),
        }
    }

    /// Overlapping region of the two boxes, if there is one.
    #[inline]
    pub fn intersection(&self, other: &AABB) -> Option<AABB> {
        if self.intersects(other) {
            Some(AABB {
                min: self.min.max_by_component(other.min),
                max: self.max.min_by_component(other.max),
            })
        } else {
            None
        }
    }

    #[inline]
    pub fn intersects(&self, other: &AABB) -> bool {
        self.min.x <= other.max.x
            && self.max.x >= other.min.x
            && self.min.y <= other.max.y
            && self.max.y >= other.min.y
            && self.min.z <= other.max.z
            && self.max.z >= other.min.z
    }

    /// Whether `other` is completely inside this box.
    #[inline]
    pub fn contains(&self, other: &AABB) -> bool {
        self.min.x <= other.min.x
            && self.min.y <= other.min.y
            && self.min.z <= other.min.z
            && self.max.x >= other.max.x
            && self.max.y >= other.max.y
            && self.max.z >= other.max.z
    }

    #[inline]
    pub fn contains_point(&self, point: m::Vec3) -> bool {
        point.x >= self.min.x
            && point.x <= self.max.x
            && point.y >= self.min.y
            && point.y <= self.max.y
            && point.z >= self.min.z
            && point.z <= self.max.z
    }

    /// Grow the box by `amount` in every direction.
    #[inline]
    pub fn padded(&self, amount: f64) -> AABB {
        let pad = m::Vec3::broadcast(amount);
        AABB {
            min: self.min - pad,
            max: self.max + pad,
        }
    }

    /// Stretch the box along a displacement vector,
    /// so that it contains both the original box and the box moved by `offset`.
    #[inline]
    pub fn swept(&self, offset: m::Vec3) -> AABB {
        let mut out = *self;
        if offset.x < 0.0 {
            out.min.x += offset.x;
        } else {
            out.max.x += offset.x;
        }
        if offset.y < 0.0 {
            out.min.y += offset.y;
        } else {
            out.max.y += offset.y;
        }
        if offset.z < 0.0 {
            out.min.z += offset.z;
        } else {
            out.max.z += offset.z;
        }
        out
    }

    #[inline]
    pub fn center(&self) -> m::Vec3 {
        (self.min + self.max) * 0.5
    }

    /// Half of the surface area of the box.
    ///
    /// This is the cost metric of the surface area heuristic;
    /// the constant factor doesn't matter when comparing costs.
    #[inline]
    pub fn perimeter(&self) -> f64 {
        let d = self.max - self.min;
        d.x * d.y + d.x * d.z + d.y * d.z
    }

    #[inline]
    pub fn surface_area(&self) -> f64 {
        2.0 * self.perimeter()
    }
}

/// A ray with a starting point and a direction.
///
/// The direction doesn't need to be normalized;
/// distances along the ray are measured in multiples of it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Ray {
    pub start: m::Vec3,
    pub dir: m::Vec3,
}

impl Ray {
    pub fn new(start: m::Vec3, dir: m::Vec3) -> Self {
        Self { start, dir }
    }

    #[inline]
    pub fn point_at(&self, t: f64) -> m::Vec3 {
        self.start + self.dir * t
    }
}
