//! The Minkowski difference of two support-mapped shapes.

use super::SupportMap;
use crate::math as m;

/// A point on the Minkowski difference together with
/// the support points on each shape that produced it.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Vertex {
    /// The point in Minkowski space, `a - b`.
    pub v: m::Vec3,
    /// Support point on shape A.
    pub a: m::Vec3,
    /// Support point on shape B, in A's local space.
    pub b: m::Vec3,
}

impl Vertex {
    /// A vertex with no witness points, for purely geometric queries.
    #[inline]
    pub fn from_point(v: m::Vec3) -> Self {
        Self {
            v,
            a: m::Vec3::zero(),
            b: m::Vec3::zero(),
        }
    }
}

/// The set `A - B` of two convex shapes, with B placed relative to A's local frame.
///
/// The shapes intersect if and only if this set contains the origin.
/// Only lives for the duration of a single query.
pub struct MinkowskiDifference<'a, A: ?Sized, B: ?Sized> {
    pub shape_a: &'a A,
    pub shape_b: &'a B,
    /// Rotation of B relative to A.
    pub orientation_b: m::Mat3,
    /// Position of B in A's local space.
    pub position_b: m::Vec3,
}

impl<'a, A, B> MinkowskiDifference<'a, A, B>
where
    A: SupportMap + ?Sized,
    B: SupportMap + ?Sized,
{
    /// Express B's pose relative to A so that queries happen in A's local space.
    pub fn new(shape_a: &'a A, pose_a: &m::Pose, shape_b: &'a B, pose_b: &m::Pose) -> Self {
        let relative = pose_a.inversed() * *pose_b;
        Self {
            shape_a,
            shape_b,
            orientation_b: relative.rotation.into_matrix(),
            position_b: relative.translation,
        }
    }

    #[inline]
    fn support_b(&self, direction: m::Vec3) -> m::Vec3 {
        let local_dir = self.orientation_b.transposed() * direction;
        self.orientation_b * self.shape_b.support(local_dir) + self.position_b
    }

    /// Support point of the difference set, `S_A(d) - S_B(-d)`.
    #[inline]
    pub fn support(&self, direction: m::Vec3) -> Vertex {
        let a = self.shape_a.support(direction);
        let b = self.support_b(-direction);
        Vertex { v: a - b, a, b }
    }

    /// A point inside the difference set:
    /// the difference of the shapes' geometric centers.
    #[inline]
    pub fn center(&self) -> Vertex {
        let a = self.shape_a.geometric_center();
        let b = self.orientation_b * self.shape_b.geometric_center() + self.position_b;
        Vertex { v: a - b, a, b }
    }
}
