//! Exact collision queries between convex shapes.
//!
//! All queries operate on [`SupportMap`]s and share a [`ConvexPolytope`]
//! owned by a per-thread [`Solver`]. The free functions in this module
//! use the calling thread's solver with default parameters;
//! use [`with_solver`] to change the parameters or make several queries
//! with a single thread-local lookup.
//!
//! Normals are unit vectors pointing from shape B toward shape A
//! and every point is in world space.

use super::polytope::MAX_VERTICES;
use super::{ConvexPolytope, MinkowskiDifference, SupportMap, Triangle, Vertex};
use crate::math as m;

use std::cell::RefCell;

/// Tolerances and iteration limits of the narrow phase.
///
/// The defaults work for objects roughly between 0.1 and 100 units in size.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde-types", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde-types", serde(default))]
pub struct SolverParams {
    /// Convergence tolerance.
    /// Compared against squared distances in point tests and ray casts,
    /// and against how far a new support point gets past the current estimate in MPR and GJK/EPA.
    pub collide_epsilon: f64,
    /// Squared normal length below which polytope triangles are degenerate.
    pub numeric_epsilon: f64,
    /// MPR results deeper than this are recomputed with GJK/EPA
    /// by [`mpr_epa`][Solver::mpr_epa]. MPR only finds the penetration
    /// along the line between the shapes' centers, which is increasingly
    /// inaccurate the deeper the shapes go.
    pub epa_penetration_threshold: f64,
    /// Iteration cap for point tests, ray casts, sweeps and each phase of MPR.
    ///
    /// Each iteration may add a vertex to the polytope,
    /// so [`Solver`] clamps this to [`MAX_ITERATIONS_LIMIT`].
    pub max_iterations: usize,
    /// Iteration cap for GJK/EPA. Clamped to [`MAX_ITERATIONS_LIMIT`] like `max_iterations`.
    pub max_epa_iterations: usize,
}

/// Upper bound for the iteration caps in [`SolverParams`]:
/// the polytope's vertex capacity minus the initial tetrahedron.
pub const MAX_ITERATIONS_LIMIT: usize = MAX_VERTICES - 4;

impl SolverParams {
    fn clamped(mut self) -> Self {
        if self.max_iterations > MAX_ITERATIONS_LIMIT
            || self.max_epa_iterations > MAX_ITERATIONS_LIMIT
        {
            log::warn!(
                "Solver iteration caps ({}, {}) exceed the polytope capacity, clamping to {}",
                self.max_iterations,
                self.max_epa_iterations,
                MAX_ITERATIONS_LIMIT
            );
            self.max_iterations = self.max_iterations.min(MAX_ITERATIONS_LIMIT);
            self.max_epa_iterations = self.max_epa_iterations.min(MAX_ITERATIONS_LIMIT);
        }
        self
    }
}

impl Default for SolverParams {
    fn default() -> Self {
        Self {
            collide_epsilon: 1e-4,
            numeric_epsilon: 1e-16,
            epa_penetration_threshold: 0.02,
            max_iterations: 34,
            max_epa_iterations: 85,
        }
    }
}

/// Result of an overlap query between two shapes.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Contact {
    /// Deepest point of A inside B, or closest point of A to B if separated.
    pub point_a: m::Vec3,
    /// Deepest point of B inside A, or closest point of B to A if separated.
    pub point_b: m::Vec3,
    /// Unit vector pointing from B toward A.
    /// Moving A by `normal * penetration` separates the shapes.
    pub normal: m::Vec3,
    /// Penetration depth. Negative values are separation distances.
    pub penetration: f64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RayHit {
    /// Distance to the hit in multiples of the ray's direction vector.
    pub fraction: f64,
    /// Unit surface normal at the hit point,
    /// or zero if the ray started inside the shape.
    pub normal: m::Vec3,
}

/// Result of a sweep test, describing the moment the shapes first touch.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SweepHit {
    /// Point of first contact on A at the time of impact.
    pub point_a: m::Vec3,
    /// Point of first contact on B at the time of impact.
    pub point_b: m::Vec3,
    /// Unit vector pointing from B toward A,
    /// or zero if the shapes were overlapping from the start.
    pub normal: m::Vec3,
    /// Time of impact in multiples of the sweep vectors.
    /// Can be greater than one.
    pub fraction: f64,
}

/// Narrow phase state: a polytope reused across queries and the parameters to run them with.
///
/// Usually accessed through [`with_solver`] instead of being created directly.
#[derive(Clone, Debug)]
pub struct Solver {
    polytope: ConvexPolytope,
    params: SolverParams,
}

thread_local! {
    static SOLVER: RefCell<Solver> = RefCell::new(Solver::new(SolverParams::default()));
}

/// Run a closure with the calling thread's solver.
///
/// Parameters set on the solver persist for later queries on the same thread.
///
/// # Panics
/// Panics if called recursively, e.g. from within a support function.
pub fn with_solver<R>(f: impl FnOnce(&mut Solver) -> R) -> R {
    SOLVER.with(|solver| f(&mut solver.borrow_mut()))
}

/// Check whether a point is inside a shape.
pub fn point_test<S>(shape: &S, pose: &m::Pose, point: m::Vec3) -> bool
where
    S: SupportMap + ?Sized,
{
    with_solver(|s| s.point_test(shape, pose, point))
}

/// Cast a ray against a shape. See [`Solver::ray_cast`].
pub fn ray_cast<S>(
    shape: &S,
    pose: &m::Pose,
    origin: m::Vec3,
    direction: m::Vec3,
) -> Option<RayHit>
where
    S: SupportMap + ?Sized,
{
    with_solver(|s| s.ray_cast(shape, pose, origin, direction))
}

/// Find the time of impact of two moving shapes. See [`Solver::sweep_test`].
pub fn sweep_test<A, B>(
    shape_a: &A,
    pose_a: &m::Pose,
    shape_b: &B,
    pose_b: &m::Pose,
    sweep_a: m::Vec3,
    sweep_b: m::Vec3,
) -> Option<SweepHit>
where
    A: SupportMap + ?Sized,
    B: SupportMap + ?Sized,
{
    with_solver(|s| s.sweep_test(shape_a, pose_a, shape_b, pose_b, sweep_a, sweep_b))
}

/// Fast overlap test with accurate results for deep contacts.
/// See [`Solver::mpr_epa`].
pub fn mpr_epa<A, B>(
    shape_a: &A,
    pose_a: &m::Pose,
    shape_b: &B,
    pose_b: &m::Pose,
) -> Option<Contact>
where
    A: SupportMap + ?Sized,
    B: SupportMap + ?Sized,
{
    with_solver(|s| s.mpr_epa(shape_a, pose_a, shape_b, pose_b))
}

/// Penetration depth or separation distance. See [`Solver::gjk_epa`].
pub fn gjk_epa<A, B>(
    shape_a: &A,
    pose_a: &m::Pose,
    shape_b: &B,
    pose_b: &m::Pose,
) -> Option<Contact>
where
    A: SupportMap + ?Sized,
    B: SupportMap + ?Sized,
{
    with_solver(|s| s.gjk_epa(shape_a, pose_a, shape_b, pose_b))
}

impl Default for Solver {
    fn default() -> Self {
        Self::new(SolverParams::default())
    }
}

impl Solver {
    pub fn new(params: SolverParams) -> Self {
        let params = params.clamped();
        let mut polytope = ConvexPolytope::new();
        polytope.set_numeric_epsilon(params.numeric_epsilon);
        Self { polytope, params }
    }

    #[inline]
    pub fn params(&self) -> &SolverParams {
        &self.params
    }

    /// Iteration caps above [`MAX_ITERATIONS_LIMIT`] are clamped.
    pub fn set_params(&mut self, params: SolverParams) {
        let params = params.clamped();
        self.polytope.set_numeric_epsilon(params.numeric_epsilon);
        self.params = params;
    }

    /// Check whether a point is inside a shape, within `collide_epsilon`.
    ///
    /// Grows a hull of the shape's support points toward the point
    /// until the hull either contains it or a separating plane is found.
    pub fn point_test<S>(&mut self, shape: &S, pose: &m::Pose, point: m::Vec3) -> bool
    where
        S: SupportMap + ?Sized,
    {
        let point = pose.inversed().transform_vec(point);
        let eps = self.params.collide_epsilon;
        // the hull lives in the space of `shape - point`
        // so that the query point is at the origin
        self.polytope
            .init_tetrahedron_around(Vertex::from_point(shape.geometric_center() - point));

        for _ in 0..self.params.max_iterations {
            let tri = self.polytope.closest_triangle();
            if self.polytope.origin_enclosed() || tri.closest_to_origin_sq < eps {
                return true;
            }

            let closest = tri.closest_to_origin;
            let w = shape.support(-closest) - point;
            if w.dot(closest) >= 0.0 {
                // the supporting plane in the direction of the point doesn't reach it
                return false;
            }
            if !self.polytope.add_point(w) {
                return false;
            }
        }

        log::warn!("Point test did not converge");
        false
    }

    /// Cast a ray against a shape.
    ///
    /// The ray starts at `origin` and `direction` doesn't need to be normalized;
    /// [`RayHit::fraction`] is measured in multiples of it.
    /// Rays starting inside the shape hit at fraction zero.
    pub fn ray_cast<S>(
        &mut self,
        shape: &S,
        pose: &m::Pose,
        origin: m::Vec3,
        direction: m::Vec3,
    ) -> Option<RayHit>
    where
        S: SupportMap + ?Sized,
    {
        let inv_rot = pose.rotation.reversed();
        let origin = pose.inversed().transform_vec(origin);
        let direction = inv_rot * direction;

        let cast = self.conservative_advancement(
            |dir| Vertex::from_point(shape.support(dir)),
            Vertex::from_point(shape.geometric_center()),
            origin,
            direction,
        )?;

        Some(RayHit {
            fraction: cast.fraction,
            normal: cast
                .normal
                .map(|n| pose.rotation * n)
                .unwrap_or_else(m::Vec3::zero),
        })
    }

    /// Find the time of impact of two shapes moving linearly
    /// by `sweep_a` and `sweep_b` respectively.
    ///
    /// Rotation during the motion is not taken into account.
    /// Returns `None` if the shapes never touch along the sweep,
    /// no matter how long it is extended.
    pub fn sweep_test<A, B>(
        &mut self,
        shape_a: &A,
        pose_a: &m::Pose,
        shape_b: &B,
        pose_b: &m::Pose,
        sweep_a: m::Vec3,
        sweep_b: m::Vec3,
    ) -> Option<SweepHit>
    where
        A: SupportMap + ?Sized,
        B: SupportMap + ?Sized,
    {
        let mkd = MinkowskiDifference::new(shape_a, pose_a, shape_b, pose_b);
        // the shapes touch when the origin moved by the relative sweep
        // enters the Minkowski difference, which is a ray cast against it
        let relative_sweep = pose_a.rotation.reversed() * (sweep_b - sweep_a);

        let cast = self.conservative_advancement(
            |dir| mkd.support(dir),
            mkd.center(),
            m::Vec3::zero(),
            relative_sweep,
        )?;

        let (point_a, point_b) = self.polytope.calculate_points(&cast.triangle);
        let t = cast.fraction;
        Some(SweepHit {
            point_a: pose_a.transform_vec(point_a) + sweep_a * t,
            point_b: pose_a.transform_vec(point_b) + sweep_b * t,
            normal: cast
                .normal
                .map(|n| pose_a.rotation * -n)
                .unwrap_or_else(m::Vec3::zero),
            fraction: t,
        })
    }

    /// Shared ray casting routine of [`ray_cast`][Self::ray_cast]
    /// and [`sweep_test`][Self::sweep_test]: march along the ray,
    /// each step jumping to the nearest supporting plane of the shape.
    ///
    /// Instead of rebuilding the hull when the ray point moves,
    /// the hull is translated the opposite way so that the ray point
    /// always stays at the origin of the polytope's space.
    fn conservative_advancement(
        &mut self,
        support: impl Fn(m::Vec3) -> Vertex,
        center: Vertex,
        origin: m::Vec3,
        direction: m::Vec3,
    ) -> Option<CastResult> {
        let eps = self.params.collide_epsilon;
        let mut lambda = 0.0;
        let mut x = origin;
        let mut normal: Option<m::Vec3> = None;

        self.polytope.init_tetrahedron_around(Vertex {
            v: center.v - x,
            ..center
        });

        for _ in 0..self.params.max_iterations {
            let tri = self.polytope.closest_triangle();
            if self.polytope.origin_enclosed() || tri.closest_to_origin_sq < eps {
                return Some(CastResult {
                    fraction: lambda,
                    normal: normal.map(|n| n.normalized()),
                    triangle: tri,
                });
            }

            // from the hull toward the ray point
            let v = -tri.closest_to_origin;
            let w = support(v);
            let to_x = x - w.v;
            let v_dot_w = v.dot(to_x);
            if v_dot_w > 0.0 {
                let v_dot_r = v.dot(direction);
                if v_dot_r >= -self.params.numeric_epsilon {
                    // moving parallel to or away from a separating plane
                    return None;
                }
                lambda -= v_dot_w / v_dot_r;
                let next_x = origin + direction * lambda;
                self.polytope.translate(x - next_x);
                x = next_x;
                normal = Some(v);
            }

            self.polytope.add_vertex(Vertex { v: w.v - x, ..w });
        }

        log::warn!("Ray cast did not converge");
        None
    }

    /// Overlap test using Minkowski Portal Refinement.
    ///
    /// Cheap but only accurate for shallow contacts,
    /// since the penetration is measured along the line between the
    /// shapes' centers rather than in the direction of least penetration.
    /// Returns `None` if the shapes are separated.
    pub fn mpr<A, B>(
        &mut self,
        shape_a: &A,
        pose_a: &m::Pose,
        shape_b: &B,
        pose_b: &m::Pose,
    ) -> Option<Contact>
    where
        A: SupportMap + ?Sized,
        B: SupportMap + ?Sized,
    {
        let mkd = MinkowskiDifference::new(shape_a, pose_a, shape_b, pose_b);
        let eps = self.params.collide_epsilon;
        let num_eps = self.params.numeric_epsilon;

        // phase 0: find a candidate portal the ray from the center toward the origin passes through

        let mut v0 = mkd.center();
        if v0.v.mag_sq() < 1e-10 {
            // the ray direction is undefined if the centers coincide
            v0.v = m::Vec3::new(1e-5, 0.0, 0.0);
        }

        let mut n = -v0.v;
        let mut v1 = mkd.support(n);
        if v1.v.dot(n) <= 0.0 {
            return None;
        }

        n = v1.v.cross(v0.v);
        if n.mag_sq() < num_eps {
            // the origin is on the line between v0 and v1
            let normal = (v1.v - v0.v).normalized();
            return Some(Contact {
                point_a: pose_a.transform_vec(v1.a),
                point_b: pose_a.transform_vec(v1.b),
                normal: pose_a.rotation * -normal,
                penetration: v1.v.dot(normal),
            });
        }

        let mut v2 = mkd.support(n);
        if v2.v.dot(n) <= 0.0 {
            return None;
        }

        n = (v1.v - v0.v).cross(v2.v - v0.v);
        if n.dot(v0.v) > 0.0 {
            std::mem::swap(&mut v1, &mut v2);
            n = -n;
        }

        // phase 1: adjust the portal until the ray passes through it

        let mut v3;
        let mut phase1 = 0;
        loop {
            if phase1 >= self.params.max_iterations {
                log::warn!("MPR portal discovery did not converge");
                return None;
            }
            phase1 += 1;

            v3 = mkd.support(n);
            if v3.v.dot(n) <= 0.0 {
                return None;
            }

            if v1.v.cross(v3.v).dot(v0.v) < 0.0 {
                // origin outside of the plane (v0, v1, v3), replace v2
                v2 = v3;
                n = (v1.v - v0.v).cross(v3.v - v0.v);
                continue;
            }
            if v3.v.cross(v2.v).dot(v0.v) < 0.0 {
                // origin outside of the plane (v0, v3, v2), replace v1
                v1 = v3;
                n = (v3.v - v0.v).cross(v2.v - v0.v);
                continue;
            }
            break;
        }

        // phase 2: refine the portal toward the surface of the difference

        let mut hit = false;
        for _ in 0..self.params.max_iterations {
            n = (v2.v - v1.v).cross(v3.v - v1.v);
            let n_sq = n.mag_sq();
            if n_sq < num_eps {
                log::trace!("MPR portal collapsed");
                return None;
            }

            if !hit && n.dot(v1.v) >= 0.0 {
                hit = true;
            }

            let v4 = mkd.support(n);
            let delta = (v4.v - v3.v).dot(n);
            let support_dist = v4.v.dot(n);

            if delta * delta <= eps * eps * n_sq || support_dist <= 0.0 {
                if !hit {
                    return None;
                }
                let normal = n / n_sq.sqrt();
                let (point_a, point_b) = portal_witness_points([v0, v1, v2, v3], n);
                return Some(Contact {
                    point_a: pose_a.transform_vec(point_a),
                    point_b: pose_a.transform_vec(point_b),
                    normal: pose_a.rotation * -normal,
                    penetration: v1.v.dot(normal),
                });
            }

            // choose the new portal among the three faces v4 forms with the old one
            let v4_cross_v0 = v4.v.cross(v0.v);
            if v1.v.dot(v4_cross_v0) > 0.0 {
                if v2.v.dot(v4_cross_v0) > 0.0 {
                    v1 = v4;
                } else {
                    v3 = v4;
                }
            } else if v3.v.dot(v4_cross_v0) > 0.0 {
                v2 = v4;
            } else {
                v1 = v4;
            }
        }

        log::warn!("MPR portal refinement did not converge");
        None
    }

    /// Overlap test using MPR for shallow contacts
    /// and falling back to GJK/EPA for deep ones.
    ///
    /// Returns `None` if the shapes are separated.
    pub fn mpr_epa<A, B>(
        &mut self,
        shape_a: &A,
        pose_a: &m::Pose,
        shape_b: &B,
        pose_b: &m::Pose,
    ) -> Option<Contact>
    where
        A: SupportMap + ?Sized,
        B: SupportMap + ?Sized,
    {
        let contact = self.mpr(shape_a, pose_a, shape_b, pose_b)?;
        if contact.penetration <= self.params.epa_penetration_threshold {
            return Some(contact);
        }
        match self.gjk_epa(shape_a, pose_a, shape_b, pose_b) {
            Some(refined) => Some(refined),
            None => {
                // MPR's depth along the center line is an upper bound
                log::warn!("GJK/EPA failed on a deep contact, using the MPR result");
                Some(contact)
            }
        }
    }

    /// Find the penetration depth of two overlapping shapes
    /// or the distance between separated ones.
    ///
    /// Expands a polytope inside the Minkowski difference toward the origin.
    /// While the origin is outside, this is GJK finding the closest point;
    /// once it's enclosed, EPA finding the closest face.
    /// [`Contact::penetration`] is negative for separated shapes.
    ///
    /// If the iteration cap runs out after the origin has been enclosed,
    /// the closest face found so far is returned. Its depth is a lower bound.
    /// `None` means the shapes weren't resolved either way.
    pub fn gjk_epa<A, B>(
        &mut self,
        shape_a: &A,
        pose_a: &m::Pose,
        shape_b: &B,
        pose_b: &m::Pose,
    ) -> Option<Contact>
    where
        A: SupportMap + ?Sized,
        B: SupportMap + ?Sized,
    {
        let mkd = MinkowskiDifference::new(shape_a, pose_a, shape_b, pose_b);
        let eps = self.params.collide_epsilon;

        self.polytope.init_tetrahedron_around(mkd.center());

        for _ in 0..self.params.max_epa_iterations {
            let tri = self.polytope.closest_triangle();

            let mut search = tri.closest_to_origin;
            let mut search_sq = tri.closest_to_origin_sq;
            if !self.polytope.origin_enclosed() {
                search = -search;
            }
            if search_sq < eps {
                // too close to the origin for a meaningful direction
                search = tri.normal;
                search_sq = tri.normal_sq;
            }

            let w = mkd.support(search);
            let improvement = (w.v - tri.closest_to_origin).dot(search);
            if improvement <= eps * search_sq.sqrt() || !self.polytope.add_vertex(w) {
                return Some(self.contact_from_triangle(&tri, pose_a));
            }
        }

        if self.polytope.origin_enclosed() {
            let tri = self.polytope.closest_triangle();
            log::warn!("GJK/EPA did not converge, using the closest face found");
            return Some(self.contact_from_triangle(&tri, pose_a));
        }

        log::warn!("GJK/EPA did not converge");
        None
    }

    fn contact_from_triangle(&self, tri: &Triangle, pose_a: &m::Pose) -> Contact {
        let enclosed = self.polytope.origin_enclosed();
        let (point_a, point_b) = self.polytope.calculate_points(tri);

        let dist = tri.closest_to_origin_sq.sqrt();
        // outward normal of the Minkowski difference at the closest point
        let outward = if tri.closest_to_origin_sq < self.params.collide_epsilon {
            tri.normal / tri.normal_sq.sqrt()
        } else if enclosed {
            tri.closest_to_origin / dist
        } else {
            -tri.closest_to_origin / dist
        };

        Contact {
            point_a: pose_a.transform_vec(point_a),
            point_b: pose_a.transform_vec(point_b),
            normal: pose_a.rotation * -outward,
            penetration: if enclosed { dist } else { -dist },
        }
    }
}

struct CastResult {
    fraction: f64,
    /// `None` if the ray started inside the shape.
    normal: Option<m::Vec3>,
    triangle: Triangle,
}

/// Witness points of an MPR portal, from the barycentric coordinates
/// of the origin in the tetrahedron formed by the portal and the interior point.
fn portal_witness_points(verts: [Vertex; 4], n: m::Vec3) -> (m::Vec3, m::Vec3) {
    let [v0, v1, v2, v3] = verts;
    let mut b = [
        v1.v.cross(v2.v).dot(v3.v),
        v3.v.cross(v2.v).dot(v0.v),
        v0.v.cross(v1.v).dot(v3.v),
        v2.v.cross(v1.v).dot(v0.v),
    ];
    let mut sum: f64 = b.iter().sum();

    if sum <= 0.0 {
        // origin projected onto the portal face alone
        b = [
            0.0,
            v2.v.cross(v3.v).dot(n),
            v3.v.cross(v1.v).dot(n),
            v1.v.cross(v2.v).dot(n),
        ];
        sum = b[1] + b[2] + b[3];
    }

    let inv_sum = 1.0 / sum;
    let mut point_a = m::Vec3::zero();
    let mut point_b = m::Vec3::zero();
    for (coef, vert) in b.iter().zip(&verts) {
        point_a += vert.a * (coef * inv_sum);
        point_b += vert.b * (coef * inv_sum);
    }
    (point_a, point_b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collision::ColliderShape;
    use crate::math::{Angle, PoseBuilder, Vec3};
    use rand::{rngs::SmallRng, Rng, SeedableRng};

    fn at(x: f64, y: f64, z: f64) -> m::Pose {
        PoseBuilder::new().with_position([x, y, z]).build()
    }

    fn approx(a: Vec3, b: Vec3, tol: f64) -> bool {
        (a - b).mag() < tol
    }

    #[test]
    fn point_in_sphere() {
        let sphere = ColliderShape::sphere(1.0);
        let pose = at(2.0, 0.0, 0.0);
        assert!(point_test(&sphere, &pose, Vec3::new(2.5, 0.0, 0.0)));
        assert!(point_test(&sphere, &pose, Vec3::new(2.0, 0.6, -0.6)));
        assert!(!point_test(&sphere, &pose, Vec3::new(3.5, 0.0, 0.0)));
        assert!(!point_test(&sphere, &pose, Vec3::new(2.8, 0.8, 0.0)));
        assert!(!point_test(&sphere, &pose, Vec3::zero()));
    }

    #[test]
    fn point_in_rotated_box() {
        let cuboid = ColliderShape::cuboid(4.0, 1.0, 1.0);
        let pose = PoseBuilder::new()
            .with_position([0.0, 1.0, 0.0])
            .with_rotation(Angle::Deg(90.0), Angle::default(), Angle::default())
            .build();
        // rotated around z, the long side is along y
        assert!(point_test(&cuboid, &pose, Vec3::new(0.0, 2.5, 0.0)));
        assert!(!point_test(&cuboid, &pose, Vec3::new(1.5, 1.0, 0.0)));
    }

    #[test]
    fn gjk_epa_overlapping_spheres() {
        let sphere = ColliderShape::sphere(1.0);
        let contact = gjk_epa(&sphere, &at(0.0, 0.0, 0.0), &sphere, &at(1.5, 0.0, 0.0))
            .expect("Should converge");
        assert!((contact.penetration - 0.5).abs() < 1e-3);
        // B is on the +x side of A.
        // EPA approximates the spheres with facets, so the direction is less exact than the depth
        assert!(approx(contact.normal, Vec3::new(-1.0, 0.0, 0.0), 3e-2));
        assert!(approx(contact.point_a, Vec3::new(1.0, 0.0, 0.0), 5e-2));
        assert!(approx(contact.point_b, Vec3::new(0.5, 0.0, 0.0), 5e-2));
    }

    #[test]
    fn gjk_epa_separated_spheres() {
        let sphere = ColliderShape::sphere(1.0);
        let contact = gjk_epa(&sphere, &at(0.0, 0.0, 0.0), &sphere, &at(3.0, 0.0, 0.0))
            .expect("Should converge");
        assert!((contact.penetration + 1.0).abs() < 1e-3);
        assert!(approx(contact.normal, Vec3::new(-1.0, 0.0, 0.0), 1e-3));
        assert!(approx(contact.point_a, Vec3::new(1.0, 0.0, 0.0), 1e-3));
        assert!(approx(contact.point_b, Vec3::new(2.0, 0.0, 0.0), 1e-3));
    }

    #[test]
    fn mpr_detects_separation() {
        let a = ColliderShape::cuboid(1.0, 1.0, 1.0);
        let b = ColliderShape::sphere(0.5);
        assert!(mpr_epa(&a, &at(0.0, 0.0, 0.0), &b, &at(0.0, 2.0, 0.3)).is_none());
        assert!(mpr_epa(&a, &at(0.0, 0.0, 0.0), &b, &at(0.0, 0.9, 0.3)).is_some());
    }

    #[test]
    fn mpr_agrees_with_epa_for_shallow_contacts() {
        let sphere = ColliderShape::sphere(1.0);
        let dir = Vec3::new(0.9, 1.0, 0.5).normalized();
        let pos_b = dir * 1.99;
        let pose_a = at(0.0, 0.0, 0.0);
        let pose_b = at(pos_b.x, pos_b.y, pos_b.z);

        let mpr = mpr_epa(&sphere, &pose_a, &sphere, &pose_b).expect("Should overlap");
        let epa = gjk_epa(&sphere, &pose_a, &sphere, &pose_b).expect("Should converge");
        assert!((mpr.penetration - 0.01).abs() < 1e-3);
        assert!((mpr.penetration - epa.penetration).abs() < 1e-3);
        assert!(approx(mpr.normal, epa.normal, 5e-2));
        assert!(approx(mpr.normal, -dir, 1e-2));
    }

    #[test]
    fn deep_mpr_falls_back_to_epa() {
        let a = ColliderShape::cuboid(2.0, 2.0, 2.0);
        let b = ColliderShape::sphere(1.0);
        let pose_a = at(0.0, 0.0, 0.0);
        let pose_b = at(1.5, 0.4, 0.0);

        let combined = mpr_epa(&a, &pose_a, &b, &pose_b).expect("Should overlap");
        let epa = gjk_epa(&a, &pose_a, &b, &pose_b).expect("Should converge");
        assert_eq!(combined, epa);
        // sphere reaches 0.5 into the box's +x face
        assert!((epa.penetration - 0.5).abs() < 1e-3);
        assert!(approx(epa.normal, Vec3::new(-1.0, 0.0, 0.0), 1e-2));
    }

    #[test]
    fn deep_sphere_overlap_still_reports_contact() {
        let sphere = ColliderShape::sphere(1.0);
        let pose_a = at(0.0, 0.0, 0.0);
        let pose_b = at(0.2, 0.1, 0.0);
        let expected_depth = 2.0 - Vec3::new(0.2, 0.1, 0.0).mag();

        let contact = mpr_epa(&sphere, &pose_a, &sphere, &pose_b).expect("Should overlap");
        assert!(contact.penetration > 1.5);
        assert!(contact.penetration < expected_depth + 1e-3);
        assert!((contact.normal.mag() - 1.0).abs() < 1e-6);
        assert!(contact.normal.dot(-Vec3::new(0.2, 0.1, 0.0).normalized()) > 0.5);

        let epa = gjk_epa(&sphere, &pose_a, &sphere, &pose_b).expect("Origin is enclosed");
        assert_eq!(contact, epa);
    }

    fn random_shape(rng: &mut SmallRng) -> ColliderShape {
        match rng.gen_range(0..3) {
            0 => ColliderShape::cuboid(
                rng.gen_range(0.3..1.5),
                rng.gen_range(0.3..1.5),
                rng.gen_range(0.3..1.5),
            ),
            1 => ColliderShape::capsule(rng.gen_range(0.2..1.2), rng.gen_range(0.1..0.5)),
            _ => ColliderShape::convex_hull(
                (0..8)
                    .map(|_| {
                        Vec3::new(
                            rng.gen_range(-0.8..0.8),
                            rng.gen_range(-0.8..0.8),
                            rng.gen_range(-0.8..0.8),
                        )
                    })
                    .collect::<Vec<_>>(),
            ),
        }
    }

    fn random_pose(rng: &mut SmallRng, spread: f64) -> m::Pose {
        PoseBuilder::new()
            .with_position([
                rng.gen_range(-spread..spread),
                rng.gen_range(-spread..spread),
                rng.gen_range(-spread..spread),
            ])
            .with_rotation(
                Angle::Rad(rng.gen_range(-3.1..3.1)),
                Angle::Rad(rng.gen_range(-3.1..3.1)),
                Angle::Rad(rng.gen_range(-3.1..3.1)),
            )
            .build()
    }

    fn random_dir(rng: &mut SmallRng) -> Vec3 {
        loop {
            let v = Vec3::new(
                rng.gen_range(-1.0..1.0),
                rng.gen_range(-1.0..1.0),
                rng.gen_range(-1.0..1.0),
            );
            if v.mag_sq() > 0.01 && v.mag_sq() <= 1.0 {
                return v.normalized();
            }
        }
    }

    /// Press the face of a large box into `shape` along `dir` by `depth`.
    /// The minimum translation out of the box is then exactly `depth` along `-dir`.
    fn box_pressed_into(
        shape: &ColliderShape,
        pose: &m::Pose,
        dir: Vec3,
        depth: f64,
    ) -> (ColliderShape, m::Pose) {
        let local_dir = pose.rotation.reversed() * dir;
        let extreme = pose.transform_vec(shape.support(local_dir));
        let half_size = 3.0;
        let rotation = m::Rotor3::from_rotation_between(Vec3::unit_x(), dir);
        let center = extreme + dir * (half_size - depth);
        (
            ColliderShape::cuboid(2.0 * half_size, 2.0 * half_size, 2.0 * half_size),
            m::Pose::new(center, rotation),
        )
    }

    #[test]
    fn random_face_contacts_agree() {
        let mut rng = SmallRng::seed_from_u64(7);
        let threshold = SolverParams::default().epa_penetration_threshold;
        for _ in 0..200 {
            let shape = random_shape(&mut rng);
            let pose = random_pose(&mut rng, 2.0);
            let dir = random_dir(&mut rng);

            // shallow: MPR answers alone and must match EPA
            let depth = rng.gen_range(0.002..0.015);
            let (floor, floor_pose) = box_pressed_into(&shape, &pose, dir, depth);
            let mpr = mpr_epa(&shape, &pose, &floor, &floor_pose).expect("Should overlap");
            assert!(mpr.penetration <= threshold);
            assert!((mpr.penetration - depth).abs() < 1e-3);
            assert!(approx(mpr.normal, -dir, 1e-2));
            let epa = gjk_epa(&shape, &pose, &floor, &floor_pose).expect("Should converge");
            assert!((mpr.penetration - epa.penetration).abs() < 1e-3);

            // deep: the combined query hands over to EPA
            let depth = rng.gen_range(0.1..0.6);
            let (floor, floor_pose) = box_pressed_into(&shape, &pose, dir, depth);
            let combined = mpr_epa(&shape, &pose, &floor, &floor_pose).expect("Should overlap");
            let epa = gjk_epa(&shape, &pose, &floor, &floor_pose).expect("Should converge");
            assert_eq!(combined, epa);
            assert!(combined.penetration < depth + 1e-3);
            let tolerance = match shape {
                ColliderShape::Capsule { .. } => 5e-2,
                _ => 1e-3,
            };
            assert!(combined.penetration > depth - tolerance);
        }
    }

    #[test]
    fn random_overlaps_always_report_contacts() {
        let mut rng = SmallRng::seed_from_u64(1234);
        let threshold = SolverParams::default().epa_penetration_threshold;
        let mut deep_count = 0;
        for _ in 0..500 {
            let shape_a = random_shape(&mut rng);
            let shape_b = random_shape(&mut rng);
            let pose_a = random_pose(&mut rng, 0.6);
            let pose_b = random_pose(&mut rng, 0.6);

            let mpr = match with_solver(|s| s.mpr(&shape_a, &pose_a, &shape_b, &pose_b)) {
                Some(c) => c,
                None => continue,
            };
            let combined =
                mpr_epa(&shape_a, &pose_a, &shape_b, &pose_b).expect("MPR found an overlap");
            let epa = gjk_epa(&shape_a, &pose_a, &shape_b, &pose_b);

            if mpr.penetration > threshold {
                deep_count += 1;
                assert!(combined.penetration >= 0.0);
                if let Some(epa) = epa {
                    assert_eq!(combined, epa);
                }
            } else {
                assert_eq!(combined, mpr);
            }
            // MPR measures along one direction, which can't beat the minimum depth
            if let Some(epa) = epa {
                assert!(epa.penetration <= mpr.penetration + 1e-3);
            }
        }
        assert!(deep_count > 50);
    }

    #[test]
    fn ray_hits_sphere() {
        let sphere = ColliderShape::sphere(1.0);
        let hit = ray_cast(
            &sphere,
            &at(0.0, 0.0, 5.0),
            Vec3::zero(),
            Vec3::new(0.0, 0.0, 2.0),
        )
        .expect("Should hit");
        assert!((hit.fraction - 2.0).abs() < 1e-6);
        assert!(approx(hit.normal, Vec3::new(0.0, 0.0, -1.0), 1e-6));

        let miss = ray_cast(
            &sphere,
            &at(0.0, 0.0, 5.0),
            Vec3::zero(),
            Vec3::new(0.0, 1.0, 0.0),
        );
        assert!(miss.is_none());
    }

    #[test]
    fn ray_hits_box_face() {
        let cuboid = ColliderShape::cuboid(2.0, 2.0, 2.0);
        let hit = ray_cast(
            &cuboid,
            &at(5.0, 0.0, 0.0),
            Vec3::new(0.0, 0.3, 0.0),
            Vec3::unit_x(),
        )
        .expect("Should hit");
        assert!((hit.fraction - 4.0).abs() < 1e-2);
        assert!(hit.normal.dot(Vec3::new(-1.0, 0.0, 0.0)) > 0.99);
    }

    #[test]
    fn ray_starting_inside() {
        let cuboid = ColliderShape::cuboid(2.0, 2.0, 2.0);
        let hit = ray_cast(&cuboid, &at(0.0, 0.0, 0.0), Vec3::zero(), Vec3::unit_y())
            .expect("Should hit");
        assert_eq!(hit.fraction, 0.0);
        assert_eq!(hit.normal, Vec3::zero());
    }

    #[test]
    fn ray_cast_is_deterministic() {
        let hull = ColliderShape::convex_hull(vec![
            Vec3::new(-1.0, -1.0, -1.0),
            Vec3::new(1.0, -1.0, -0.5),
            Vec3::new(0.2, 1.0, -1.0),
            Vec3::new(0.0, 0.3, 1.5),
            Vec3::new(-0.7, 0.8, 0.9),
        ]);
        let pose = PoseBuilder::new()
            .with_position([0.3, -0.2, 6.0])
            .with_rotation(Angle::Deg(20.0), Angle::Deg(-35.0), Angle::Deg(10.0))
            .build();
        // straight through the hull's local origin, which is inside it
        let origin = Vec3::new(0.3, -0.2, 0.0);
        let dir = Vec3::new(0.0, 0.0, 1.0);

        let first = ray_cast(&hull, &pose, origin, dir);
        // interleave another query to make sure no state leaks between them
        ray_cast(&ColliderShape::sphere(3.0), &at(0.0, 0.0, 0.0), origin, dir);
        let second = ray_cast(&hull, &pose, origin, dir);
        assert!(first.is_some());
        assert_eq!(first, second);
    }

    #[test]
    fn sweep_spheres_head_on() {
        let sphere = ColliderShape::sphere(1.0);
        let hit = sweep_test(
            &sphere,
            &at(0.0, 0.0, 0.0),
            &sphere,
            &at(5.0, 0.0, 0.0),
            Vec3::zero(),
            Vec3::new(-10.0, 0.0, 0.0),
        )
        .expect("Should hit");
        assert!((hit.fraction - 0.3).abs() < 1e-6);
        assert!(approx(hit.normal, Vec3::new(-1.0, 0.0, 0.0), 1e-6));
        assert!(approx(hit.point_a, Vec3::new(1.0, 0.0, 0.0), 1e-6));
        assert!(approx(hit.point_b, Vec3::new(1.0, 0.0, 0.0), 1e-6));
    }

    #[test]
    fn sweep_missing() {
        let sphere = ColliderShape::sphere(1.0);
        let hit = sweep_test(
            &sphere,
            &at(0.0, 0.0, 0.0),
            &sphere,
            &at(5.0, 3.0, 0.0),
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(-10.0, 0.0, 0.0),
        );
        assert!(hit.is_none());
    }

    #[cfg(feature = "serde-types")]
    #[test]
    fn params_from_partial_config() {
        let params: SolverParams =
            ron::from_str("(max_iterations: 50, collide_epsilon: 1e-5)").expect("Valid config");
        assert_eq!(params.max_iterations, 50);
        assert_eq!(params.collide_epsilon, 1e-5);
        assert_eq!(
            params.max_epa_iterations,
            SolverParams::default().max_epa_iterations
        );
    }

    #[cfg(feature = "serde-types")]
    #[test]
    fn iteration_caps_are_clamped_to_polytope_capacity() {
        let params: SolverParams =
            ron::from_str("(max_epa_iterations: 150, max_iterations: 1000)").expect("Valid config");
        let mut solver = Solver::new(params);
        assert_eq!(solver.params().max_epa_iterations, MAX_ITERATIONS_LIMIT);
        assert_eq!(solver.params().max_iterations, MAX_ITERATIONS_LIMIT);

        let sphere = ColliderShape::sphere(1.0);
        let pose_a = at(0.0, 0.0, 0.0);
        let pose_b = at(2.1, 0.0, 0.0);
        let contact = solver
            .gjk_epa(&sphere, &pose_a, &sphere, &pose_b)
            .expect("Should converge");
        assert!((contact.penetration + 0.1).abs() < 1e-3);
        assert!(solver
            .gjk_epa(&sphere, &pose_a, &sphere, &at(0.2, 0.1, 0.0))
            .is_some());
        assert!(solver.point_test(&sphere, &pose_a, Vec3::new(0.5, 0.5, 0.0)));

        solver.set_params(SolverParams {
            max_epa_iterations: 500,
            ..Default::default()
        });
        assert_eq!(solver.params().max_epa_iterations, MAX_ITERATIONS_LIMIT);
        assert_eq!(
            solver.params().max_iterations,
            SolverParams::default().max_iterations
        );
    }

    #[test]
    fn solver_params_persist_per_thread() {
        let params = SolverParams {
            max_iterations: 50,
            ..Default::default()
        };
        with_solver(|s| s.set_params(params));
        assert_eq!(with_solver(|s| s.params().max_iterations), 50);
        with_solver(|s| s.set_params(SolverParams::default()));
    }
}
