//! Incrementally constructed convex hull of points in Minkowski space.
//!
//! The narrow phase grows this hull one support point at a time,
//! always looking at the triangle closest to the origin.
//! Storage is a fixed-capacity arena that is reset, never reallocated,
//! between queries.

use super::Vertex;
use crate::math as m;

/// Maximum number of vertices in a polytope.
pub const MAX_VERTICES: usize = 128;
/// Maximum number of triangles.
/// A closed convex polyhedron has `2 * vertices - 4` triangles.
pub const MAX_TRIANGLES: usize = 2 * MAX_VERTICES;

/// Size of the tetrahedron synthesized around a seed point.
/// Minkowski differences thinner than this aren't supported.
const SEED_SCALE: f64 = 1e-2;

/// Default squared normal length below which a triangle is degenerate.
pub const DEFAULT_NUMERIC_EPSILON: f64 = 1e-16;

/// A face of the polytope with precomputed data about its relation to the origin.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Triangle {
    /// Vertex indices, ordered so that `normal` points outward.
    pub indices: [u16; 3],
    /// Outward normal, not normalized.
    pub normal: m::Vec3,
    pub normal_sq: f64,
    /// Point on the triangle closest to the origin.
    pub closest_to_origin: m::Vec3,
    pub closest_to_origin_sq: f64,
    /// Whether the origin is on the inner side of this triangle's plane.
    pub facing_origin: bool,
}

#[derive(Clone, Copy, Debug)]
struct Edge {
    a: u16,
    b: u16,
}

impl Edge {
    /// Edges are compared without direction.
    #[inline]
    fn same_as(&self, other: &Edge) -> bool {
        (self.a == other.a && self.b == other.b) || (self.a == other.b && self.b == other.a)
    }
}

/// A closed triangulated convex surface built from [`Vertex`]es.
#[derive(Clone, Debug)]
pub struct ConvexPolytope {
    vertices: Vec<Vertex>,
    triangles: Vec<Triangle>,
    // scratch buffers kept around so that adding vertices doesn't allocate
    edges: Vec<Edge>,
    lit: Vec<usize>,
    /// Point strictly inside the polytope, used to orient triangles.
    center: m::Vec3,
    origin_enclosed: bool,
    numeric_epsilon: f64,
}

impl Default for ConvexPolytope {
    fn default() -> Self {
        Self::new()
    }
}

impl ConvexPolytope {
    pub fn new() -> Self {
        Self {
            vertices: Vec::with_capacity(MAX_VERTICES),
            triangles: Vec::with_capacity(MAX_TRIANGLES),
            edges: Vec::with_capacity(MAX_TRIANGLES),
            lit: Vec::with_capacity(MAX_TRIANGLES),
            center: m::Vec3::zero(),
            origin_enclosed: false,
            numeric_epsilon: DEFAULT_NUMERIC_EPSILON,
        }
    }

    /// Set the squared normal length below which triangles are rejected as degenerate.
    pub fn set_numeric_epsilon(&mut self, eps: f64) {
        self.numeric_epsilon = eps;
    }

    #[inline]
    pub fn vertices(&self) -> &[Vertex] {
        &self.vertices
    }

    #[inline]
    pub fn triangles(&self) -> &[Triangle] {
        &self.triangles
    }

    /// Whether every triangle faces the origin, i.e. the origin is inside the polytope.
    ///
    /// Updated by [`closest_triangle`][Self::closest_triangle].
    #[inline]
    pub fn origin_enclosed(&self) -> bool {
        self.origin_enclosed
    }

    /// Reset to a tetrahedron with the given corners.
    ///
    /// The corners must not be coplanar.
    pub fn init_tetrahedron(&mut self, corners: [Vertex; 4]) {
        self.vertices.clear();
        self.triangles.clear();
        self.origin_enclosed = false;
        self.vertices.extend_from_slice(&corners);
        self.center = corners.iter().fold(m::Vec3::zero(), |acc, c| acc + c.v) * 0.25;

        for [a, b, c] in [[0, 2, 1], [0, 1, 3], [0, 3, 2], [1, 2, 3]] {
            let created = self.create_triangle(a, b, c);
            debug_assert!(created, "Initial tetrahedron is degenerate");
        }
    }

    /// Reset to a small regular tetrahedron around a seed vertex.
    ///
    /// The seed's witness point on A is offset along with it,
    /// so every vertex still satisfies `v = a - b`.
    pub fn init_tetrahedron_around(&mut self, seed: Vertex) {
        let offsets = [
            m::Vec3::new(1.0, 1.0, 1.0),
            m::Vec3::new(1.0, -1.0, -1.0),
            m::Vec3::new(-1.0, 1.0, -1.0),
            m::Vec3::new(-1.0, -1.0, 1.0),
        ];
        let corners = offsets.map(|o| {
            let o = o * SEED_SCALE;
            Vertex {
                v: seed.v + o,
                a: seed.a + o,
                b: seed.b,
            }
        });
        self.init_tetrahedron(corners);
    }

    /// Move every vertex by `offset`, keeping the shape of the polytope.
    ///
    /// Used by queries that march the point they measure distances from,
    /// which is equivalent to moving the polytope the other way.
    pub fn translate(&mut self, offset: m::Vec3) {
        for vert in &mut self.vertices {
            vert.v += offset;
        }
        self.center += offset;
        self.origin_enclosed = false;
        for idx in 0..self.triangles.len() {
            let mut tri = self.triangles[idx];
            self.update_origin_data(&mut tri);
            self.triangles[idx] = tri;
        }
    }

    /// Find the triangle whose closest point is nearest to the origin,
    /// also updating whether the origin is enclosed.
    ///
    /// # Panics
    /// Panics if the polytope hasn't been initialized.
    pub fn closest_triangle(&mut self) -> Triangle {
        assert!(!self.triangles.is_empty(), "Polytope not initialized");
        let mut closest_idx = 0;
        let mut min_dist_sq = f64::MAX;

        if self.origin_enclosed {
            // the hull only ever grows, so it can't un-enclose the origin
            for (idx, tri) in self.triangles.iter().enumerate() {
                if tri.closest_to_origin_sq < min_dist_sq {
                    min_dist_sq = tri.closest_to_origin_sq;
                    closest_idx = idx;
                }
            }
            return self.triangles[closest_idx];
        }

        let mut enclosed = true;
        for (idx, tri) in self.triangles.iter().enumerate() {
            if tri.closest_to_origin_sq < min_dist_sq {
                min_dist_sq = tri.closest_to_origin_sq;
                closest_idx = idx;
            }
            enclosed &= tri.facing_origin;
        }
        self.origin_enclosed = enclosed;
        self.triangles[closest_idx]
    }

    /// Extend the hull to include a new vertex.
    ///
    /// Every triangle the vertex can "see" is removed and the hole is
    /// filled with triangles connecting its boundary to the new vertex.
    /// Returns false without modifying the polytope if the vertex is
    /// inside the hull or would create a degenerate triangle.
    ///
    /// # Panics
    /// Panics if the vertex or triangle capacity is exceeded.
    pub fn add_vertex(&mut self, vertex: Vertex) -> bool {
        assert!(
            self.vertices.len() < MAX_VERTICES,
            "Convex polytope vertex capacity exceeded"
        );

        self.lit.clear();
        self.edges.clear();
        for (idx, tri) in self.triangles.iter().enumerate() {
            let to_vertex = vertex.v - self.vertices[tri.indices[0] as usize].v;
            if to_vertex.dot(tri.normal) <= 0.0 {
                continue;
            }
            self.lit.push(idx);

            // edges shared by two lit triangles are interior to the hole and cancel out
            for k in 0..3 {
                let edge = Edge {
                    a: tri.indices[k],
                    b: tri.indices[(k + 1) % 3],
                };
                match self.edges.iter().position(|e| e.same_as(&edge)) {
                    Some(existing) => {
                        self.edges.swap_remove(existing);
                    }
                    None => self.edges.push(edge),
                }
            }
        }

        if self.edges.is_empty() {
            return false;
        }

        // check everything before touching the hull so that failure leaves it intact
        for edge in &self.edges {
            let a = self.vertices[edge.a as usize].v;
            let b = self.vertices[edge.b as usize].v;
            if (a - b).cross(a - vertex.v).mag_sq() < self.numeric_epsilon {
                log::trace!("Rejected vertex creating a degenerate triangle");
                return false;
            }
        }
        assert!(
            self.triangles.len() - self.lit.len() + self.edges.len() <= MAX_TRIANGLES,
            "Convex polytope triangle capacity exceeded"
        );

        // descending order so that swap_remove only moves triangles we keep
        for &idx in self.lit.iter().rev() {
            self.triangles.swap_remove(idx);
        }

        let new_idx = self.vertices.len() as u16;
        self.vertices.push(vertex);
        for edge_idx in 0..self.edges.len() {
            let edge = self.edges[edge_idx];
            self.create_triangle(edge.a, edge.b, new_idx);
        }
        true
    }

    /// Extend the hull with a point that has no witness points.
    #[inline]
    pub fn add_point(&mut self, point: m::Vec3) -> bool {
        self.add_vertex(Vertex::from_point(point))
    }

    /// Interpolate the witness points of a triangle at the
    /// point closest to the origin (its projection if the origin is enclosed).
    pub fn calculate_points(&self, tri: &Triangle) -> (m::Vec3, m::Vec3) {
        let coefs = if self.origin_enclosed {
            self.barycentric(tri)
        } else {
            self.clamped_barycentric(tri)
        };
        let [va, vb, vc] = tri.indices.map(|i| &self.vertices[i as usize]);
        let point_a = coefs[0] * va.a + coefs[1] * vb.a + coefs[2] * vc.a;
        let point_b = coefs[0] * va.b + coefs[1] * vb.b + coefs[2] * vc.b;
        (point_a, point_b)
    }

    fn create_triangle(&mut self, a: u16, b: u16, c: u16) -> bool {
        let va = self.vertices[a as usize].v;
        let vb = self.vertices[b as usize].v;
        let vc = self.vertices[c as usize].v;

        let mut tri = Triangle {
            indices: [a, b, c],
            normal: (vb - va).cross(vc - va),
            normal_sq: 0.0,
            closest_to_origin: m::Vec3::zero(),
            closest_to_origin_sq: 0.0,
            facing_origin: false,
        };
        tri.normal_sq = tri.normal.mag_sq();
        if tri.normal_sq < self.numeric_epsilon {
            return false;
        }

        // orient outward, away from the interior point
        if tri.normal.dot(va - self.center) < 0.0 {
            tri.indices.swap(0, 1);
            tri.normal = -tri.normal;
        }

        self.update_origin_data(&mut tri);
        self.triangles.push(tri);
        true
    }

    fn update_origin_data(&self, tri: &mut Triangle) {
        let va = self.vertices[tri.indices[0] as usize].v;
        let plane_dist = tri.normal.dot(va);
        tri.facing_origin = plane_dist >= 0.0;

        let coefs = self.barycentric(tri);
        tri.closest_to_origin = if coefs.iter().all(|c| *c >= 0.0) {
            // projection of the origin falls inside the triangle
            tri.normal * (plane_dist / tri.normal_sq)
        } else {
            self.interpolate(tri, self.clamped_barycentric(tri))
        };
        tri.closest_to_origin_sq = tri.closest_to_origin.mag_sq();
    }

    #[inline]
    fn interpolate(&self, tri: &Triangle, coefs: [f64; 3]) -> m::Vec3 {
        let [a, b, c] = tri.indices.map(|i| self.vertices[i as usize].v);
        coefs[0] * a + coefs[1] * b + coefs[2] * c
    }

    /// Barycentric coordinates of the origin's projection onto the triangle's plane.
    fn barycentric(&self, tri: &Triangle) -> [f64; 3] {
        let [a, b, c] = tri.indices.map(|i| self.vertices[i as usize].v);
        // the components of the origin's projection orthogonal to the plane
        // vanish in these triple products
        let inv = 1.0 / tri.normal_sq;
        [
            b.cross(c).dot(tri.normal) * inv,
            c.cross(a).dot(tri.normal) * inv,
            a.cross(b).dot(tri.normal) * inv,
        ]
    }

    /// Barycentric coordinates of the point on the triangle closest to the origin.
    fn clamped_barycentric(&self, tri: &Triangle) -> [f64; 3] {
        let coefs = self.barycentric(tri);
        if coefs.iter().all(|c| *c >= 0.0) {
            return coefs;
        }

        // the closest point is on an edge opposite a negative coordinate
        let verts = tri.indices.map(|i| self.vertices[i as usize].v);
        let mut best = coefs;
        let mut best_dist_sq = f64::MAX;
        for skip in 0..3 {
            if coefs[skip] >= 0.0 {
                continue;
            }
            let i0 = (skip + 1) % 3;
            let i1 = (skip + 2) % 3;
            let edge = verts[i1] - verts[i0];
            let edge_sq = edge.mag_sq();
            let t = if edge_sq > 0.0 {
                (-verts[i0].dot(edge) / edge_sq).clamp(0.0, 1.0)
            } else {
                0.0
            };
            let dist_sq = (verts[i0] + edge * t).mag_sq();
            if dist_sq < best_dist_sq {
                best_dist_sq = dist_sq;
                best = [0.0; 3];
                best[i0] = 1.0 - t;
                best[i1] = t;
            }
        }
        best
    }
}
