use super::AABB;
use crate::math as m;

use std::sync::Arc;

/// A convex shape described implicitly by its support function.
///
/// This is everything the narrow phase needs to know about a shape.
/// Spheres, boxes, hulls and single mesh triangles all look the same to it.
pub trait SupportMap {
    /// The point on the surface of the shape farthest along `direction`,
    /// in the shape's local space.
    ///
    /// `direction` is not necessarily normalized.
    fn support(&self, direction: m::Vec3) -> m::Vec3;

    /// A point strictly inside the shape, in local space.
    fn geometric_center(&self) -> m::Vec3;

    /// World space bounding box of the shape placed at `pose`,
    /// computed from six support queries.
    fn bounding_box(&self, pose: &m::Pose) -> AABB {
        let rot = m::rotation_matrix(pose);
        let inv_rot = rot.transposed();
        let mut aabb = AABB::empty();
        for axis in [m::Vec3::unit_x(), m::Vec3::unit_y(), m::Vec3::unit_z()] {
            let max = rot * self.support(inv_rot * axis);
            let min = rot * self.support(inv_rot * -axis);
            aabb.max = aabb.max.max_by_component(max);
            aabb.min = aabb.min.min_by_component(min);
        }
        AABB {
            min: aabb.min + pose.translation,
            max: aabb.max + pose.translation,
        }
    }
}

impl<T: SupportMap + ?Sized> SupportMap for &T {
    #[inline]
    fn support(&self, direction: m::Vec3) -> m::Vec3 {
        (**self).support(direction)
    }

    #[inline]
    fn geometric_center(&self) -> m::Vec3 {
        (**self).geometric_center()
    }
}

/// The physical shape of a collider.
///
/// Capsules and cylinders are aligned with the local y axis.
#[derive(Clone, Debug)]
pub enum ColliderShape {
    Sphere {
        r: f64,
    },
    /// Boxes store their side lengths halved because this makes
    /// the support function simpler.
    Cuboid {
        half_extents: m::Vec3,
    },
    /// A line segment of half-length `hl` with radius `r`.
    Capsule {
        hl: f64,
        r: f64,
    },
    Cylinder {
        hh: f64,
        r: f64,
    },
    /// The convex hull of a point cloud.
    ConvexHull {
        points: Arc<[m::Vec3]>,
        center: m::Vec3,
    },
}

impl ColliderShape {
    pub fn sphere(r: f64) -> Self {
        ColliderShape::Sphere { r }
    }

    pub fn cuboid(width: f64, height: f64, depth: f64) -> Self {
        ColliderShape::Cuboid {
            half_extents: m::Vec3::new(width, height, depth) * 0.5,
        }
    }

    pub fn capsule(length: f64, r: f64) -> Self {
        ColliderShape::Capsule { hl: length / 2.0, r }
    }

    pub fn cylinder(height: f64, r: f64) -> Self {
        ColliderShape::Cylinder { hh: height / 2.0, r }
    }

    /// Create a convex hull collider from a point cloud.
    ///
    /// The points don't need to be on the hull; interior points are simply never
    /// returned from the support function. The cloud must span a volume,
    /// otherwise the geometric center is not strictly inside the shape.
    ///
    /// # Panics
    /// Panics if `points` is empty.
    pub fn convex_hull(points: impl Into<Arc<[m::Vec3]>>) -> Self {
        let points = points.into();
        assert!(!points.is_empty(), "Convex hull needs at least one point");
        let center =
            points.iter().fold(m::Vec3::zero(), |acc, p| acc + *p) / points.len() as f64;
        ColliderShape::ConvexHull { points, center }
    }
}

#[inline]
fn sign(x: f64) -> f64 {
    if x >= 0.0 {
        1.0
    } else {
        -1.0
    }
}

fn sphere_support(r: f64, dir: m::Vec3) -> m::Vec3 {
    let len_sq = dir.mag_sq();
    if len_sq < 1e-24 {
        // any surface point will do
        return m::Vec3::new(r, 0.0, 0.0);
    }
    dir * (r / len_sq.sqrt())
}

impl SupportMap for ColliderShape {
    fn support(&self, dir: m::Vec3) -> m::Vec3 {
        use ColliderShape::*;
        match self {
            Sphere { r } => sphere_support(*r, dir),
            Cuboid { half_extents } => m::Vec3::new(
                sign(dir.x) * half_extents.x,
                sign(dir.y) * half_extents.y,
                sign(dir.z) * half_extents.z,
            ),
            Capsule { hl, r } => {
                sphere_support(*r, dir) + m::Vec3::new(0.0, sign(dir.y) * hl, 0.0)
            }
            Cylinder { hh, r } => {
                let radial = m::Vec3::new(dir.x, 0.0, dir.z);
                let radial_len = radial.mag();
                let radial = if radial_len < 1e-12 {
                    m::Vec3::zero()
                } else {
                    radial * (r / radial_len)
                };
                radial + m::Vec3::new(0.0, sign(dir.y) * hh, 0.0)
            }
            ConvexHull { points, .. } => {
                let mut best = points[0];
                let mut best_dot = best.dot(dir);
                for p in points.iter().skip(1) {
                    let d = p.dot(dir);
                    if d > best_dot {
                        best_dot = d;
                        best = *p;
                    }
                }
                best
            }
        }
    }

    fn geometric_center(&self) -> m::Vec3 {
        match self {
            ColliderShape::ConvexHull { center, .. } => *center,
            _ => m::Vec3::zero(),
        }
    }
}
