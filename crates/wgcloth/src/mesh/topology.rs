//! Derivation of constraint topology from face lists.

use crate::dynamics::components::{AreaTriangle, MeshFace, SimMass, SimPosition, SpringEdge};
use nalgebra::Vector3;
use std::collections::BTreeSet;

/// Lower bound applied to per-vertex masses.
pub const MIN_VERTEX_MASS: f32 = 1.0e-6;

/// The unique undirected edges of a face list, as sorted `(min, max)` pairs
/// in ascending order.
pub fn unique_edges(faces: &[MeshFace]) -> Vec<[u32; 2]> {
    let mut edges = BTreeSet::new();
    for face in faces {
        let [a, b, c] = face.nodes;
        edges.insert([a.min(b), a.max(b)]);
        edges.insert([a.min(c), a.max(c)]);
        edges.insert([b.min(c), b.max(c)]);
    }
    edges.into_iter().collect()
}

/// Builds structural springs along every unique edge, with rest lengths
/// measured from the given positions.
pub fn spring_edges(positions: &[SimPosition], faces: &[MeshFace]) -> Vec<SpringEdge> {
    unique_edges(faces)
        .into_iter()
        .map(|[a, b]| SpringEdge {
            nodes: [a, b],
            rest_length: (positions[a as usize].xyz() - positions[b as usize].xyz()).norm(),
            _pad: 0,
        })
        .collect()
}

/// Builds area-preservation triangles with their rest areas and inverted
/// material-space edge matrices.
///
/// Degenerate faces are skipped.
pub fn area_triangles(positions: &[SimPosition], faces: &[MeshFace]) -> Vec<AreaTriangle> {
    let mut triangles = Vec::with_capacity(faces.len());
    for face in faces {
        let [n0, n1, n2] = face.nodes;
        let p0 = positions[n0 as usize].xyz();
        let e1 = positions[n1 as usize].xyz() - p0;
        let e2 = positions[n2 as usize].xyz() - p0;
        let normal = e1.cross(&e2);
        let double_area = normal.norm();
        if double_area < 1.0e-12 {
            log::warn!("skipping degenerate face ({n0}, {n1}, {n2})");
            continue;
        }

        // Orthonormal material frame in the triangle plane.
        let u = e1.normalize();
        let v = (normal / double_area).cross(&u);
        let m00 = e1.dot(&u);
        let m01 = e2.dot(&u);
        let m10 = e1.dot(&v);
        let m11 = e2.dot(&v);
        let det = m00 * m11 - m01 * m10;

        triangles.push(AreaTriangle {
            nodes: face.nodes,
            _pad: 0,
            dm_inv: [m11 / det, -m01 / det, -m10 / det, m00 / det],
            rest_area: double_area * 0.5,
            _pad2: [0.0; 3],
        });
    }
    triangles
}

/// Area-weighted per-vertex masses: `density · Σ tri_area / 3` over the
/// faces incident to each vertex, clamped to [`MIN_VERTEX_MASS`].
pub fn vertex_masses(positions: &[SimPosition], faces: &[MeshFace], density: f32) -> Vec<SimMass> {
    let mut masses = vec![0.0f32; positions.len()];
    for face in faces {
        let [n0, n1, n2] = face.nodes;
        let p0 = positions[n0 as usize].xyz();
        let e1 = positions[n1 as usize].xyz() - p0;
        let e2 = positions[n2 as usize].xyz() - p0;
        let share = density * e1.cross(&e2).norm() * 0.5 / 3.0;
        masses[n0 as usize] += share;
        masses[n1 as usize] += share;
        masses[n2 as usize] += share;
    }
    masses
        .into_iter()
        .map(|m| SimMass::new(m.max(MIN_VERTEX_MASS)))
        .collect()
}

/// Area of a triangle given by three positions.
pub fn triangle_area(p0: Vector3<f32>, p1: Vector3<f32>, p2: Vector3<f32>) -> f32 {
    (p1 - p0).cross(&(p2 - p0)).norm() * 0.5
}
