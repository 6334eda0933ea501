//! Intersection queries for rays and bounding boxes.

use super::{Ray, AABB};

/// Find the ray parameter where a ray enters an AABB, if it hits it at all.
///
/// Returns 0 if the ray starts inside the box.
/// Hits behind the start of the ray are not reported.
pub fn ray_aabb(ray: Ray, aabb: AABB) -> Option<f64> {
    let mut t_min = 0.0_f64;
    let mut t_max = f64::INFINITY;

    for (start, dir, min, max) in [
        (ray.start.x, ray.dir.x, aabb.min.x, aabb.max.x),
        (ray.start.y, ray.dir.y, aabb.min.y, aabb.max.y),
        (ray.start.z, ray.dir.z, aabb.min.z, aabb.max.z),
    ] {
        if dir == 0.0 {
            // parallel to this slab, either always inside or never
            if start < min || start > max {
                return None;
            }
            continue;
        }
        let inv_dir = 1.0 / dir;
        let (t0, t1) = {
            let a = (min - start) * inv_dir;
            let b = (max - start) * inv_dir;
            if a <= b {
                (a, b)
            } else {
                (b, a)
            }
        };
        t_min = t_min.max(t0);
        t_max = t_max.min(t1);
        if t_min > t_max {
            return None;
        }
    }

    Some(t_min)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::Vec3;

    fn unit_box() -> AABB {
        AABB::new(Vec3::broadcast(-1.0), Vec3::broadcast(1.0))
    }

    #[test]
    fn hits_and_misses() {
        let hit = ray_aabb(
            Ray::new(Vec3::new(-5.0, 0.0, 0.0), Vec3::new(2.0, 0.0, 0.0)),
            unit_box(),
        );
        assert_eq!(hit, Some(2.0));

        // pointing away
        let miss = ray_aabb(
            Ray::new(Vec3::new(-5.0, 0.0, 0.0), Vec3::new(-1.0, 0.0, 0.0)),
            unit_box(),
        );
        assert_eq!(miss, None);

        // parallel and outside
        let miss = ray_aabb(
            Ray::new(Vec3::new(-5.0, 2.0, 0.0), Vec3::new(1.0, 0.0, 0.0)),
            unit_box(),
        );
        assert_eq!(miss, None);
    }

    #[test]
    fn starting_inside_is_zero() {
        let hit = ray_aabb(Ray::new(Vec3::zero(), Vec3::new(0.0, 1.0, 1.0)), unit_box());
        assert_eq!(hit, Some(0.0));
    }
}
