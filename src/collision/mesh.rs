//! Triangle meshes whose individual triangles can be used as convex shapes.

use super::{SupportMap, AABB};
use crate::math as m;

/// Squared length of the cross product of two triangle edges
/// below which the triangle is considered to have no area.
const DEGENERATE_EPSILON: f64 = 1e-16;

/// Problems with the source geometry found while building a mesh.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum MeshError {
    #[error("Triangle {triangle} has zero area")]
    DegenerateTriangle { triangle: usize },
    #[error("Triangle {triangle} refers to vertex {index} but there are only {vertex_count} vertices")]
    IndexOutOfBounds {
        triangle: usize,
        index: u32,
        vertex_count: usize,
    },
}

/// A static triangle soup.
///
/// Meshes aren't convex, so they can't be given to the narrow phase as a whole.
/// Instead, each triangle is a convex shape of its own via [`TriangleShape`].
#[derive(Clone, Debug)]
pub struct TriangleMesh {
    vertices: Vec<m::Vec3>,
    indices: Vec<[u32; 3]>,
    normals: Vec<m::Vec3>,
}

impl TriangleMesh {
    /// Build a mesh, validating every triangle.
    ///
    /// Triangles are expected in counterclockwise winding order
    /// when looking at the front face.
    pub fn new(vertices: Vec<m::Vec3>, indices: Vec<[u32; 3]>) -> Result<Self, MeshError> {
        let mut normals = Vec::with_capacity(indices.len());
        for (tri_idx, tri) in indices.iter().enumerate() {
            for &index in tri {
                if index as usize >= vertices.len() {
                    return Err(MeshError::IndexOutOfBounds {
                        triangle: tri_idx,
                        index,
                        vertex_count: vertices.len(),
                    });
                }
            }
            let [a, b, c] = tri.map(|i| vertices[i as usize]);
            let normal = (b - a).cross(c - a);
            if normal.mag_sq() < DEGENERATE_EPSILON {
                return Err(MeshError::DegenerateTriangle { triangle: tri_idx });
            }
            normals.push(normal.normalized());
        }

        Ok(Self {
            vertices,
            indices,
            normals,
        })
    }

    #[inline]
    pub fn triangle_count(&self) -> usize {
        self.indices.len()
    }

    #[inline]
    pub fn vertices(&self) -> &[m::Vec3] {
        &self.vertices
    }

    /// Get a single triangle as a convex shape.
    ///
    /// # Panics
    /// Panics if the index is out of range.
    pub fn triangle(&self, idx: usize) -> TriangleShape {
        let [a, b, c] = self.indices[idx].map(|i| self.vertices[i as usize]);
        TriangleShape {
            vertices: [a, b, c],
            normal: self.normals[idx],
        }
    }

    pub fn triangles(&self) -> impl '_ + Iterator<Item = TriangleShape> {
        (0..self.indices.len()).map(move |idx| self.triangle(idx))
    }

    /// Bounding box of the whole mesh in its local space.
    pub fn local_bounding_box(&self) -> AABB {
        self.vertices.iter().fold(AABB::empty(), |aabb, v| AABB {
            min: aabb.min.min_by_component(*v),
            max: aabb.max.max_by_component(*v),
        })
    }
}

/// A single triangle of a [`TriangleMesh`].
#[derive(Clone, Copy, Debug)]
pub struct TriangleShape {
    pub vertices: [m::Vec3; 3],
    /// Unit normal of the front face.
    pub normal: m::Vec3,
}

impl SupportMap for TriangleShape {
    fn support(&self, direction: m::Vec3) -> m::Vec3 {
        let [a, b, c] = self.vertices;
        let (da, db, dc) = (a.dot(direction), b.dot(direction), c.dot(direction));
        if da >= db && da >= dc {
            a
        } else if db >= dc {
            b
        } else {
            c
        }
    }

    fn geometric_center(&self) -> m::Vec3 {
        let [a, b, c] = self.vertices;
        (a + b + c) / 3.0
    }
}
