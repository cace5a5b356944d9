//! Procedural mesh generators.

use crate::dynamics::components::{MeshFace, SimPosition, SimVelocity};
use crate::mesh::pinning;
use crate::mesh::topology;
use crate::store::{Entity, EntityStore};
use wgcloth_core::ClothResult;

/// Parameters of the [`create_grid`] generator.
#[derive(Copy, Clone, Debug)]
pub struct GridDesc {
    /// Number of cells along X.
    pub cols: u32,
    /// Number of cells along Z.
    pub rows: u32,
    /// Cell edge length.
    pub spacing: f32,
    /// Y coordinate of the plane.
    pub height: f32,
    /// Surface density used for the per-vertex masses.
    pub density: f32,
    /// Pin the two corners of the first row (the default).
    pub pin_top_corners: bool,
}

impl Default for GridDesc {
    fn default() -> Self {
        Self {
            cols: 10,
            rows: 10,
            spacing: 0.1,
            height: 0.0,
            density: 1.0,
            pin_top_corners: true,
        }
    }
}

impl GridDesc {
    /// A square grid with the given resolution and spacing.
    pub fn square(cells: u32, spacing: f32) -> Self {
        Self {
            cols: cells,
            rows: cells,
            spacing,
            ..Default::default()
        }
    }
}

/// Creates a mesh entity holding an axis-aligned grid on the XZ plane.
///
/// Cells are split into two triangles with counter-clockwise winding when
/// viewed from +Y. Position, velocity, mass, and face arrays are set in one
/// transaction; the two top-row corners are pinned by default.
pub fn create_grid(store: &mut EntityStore, desc: &GridDesc) -> ClothResult<Entity> {
    let verts_x = desc.cols + 1;
    let verts_z = desc.rows + 1;

    let mut positions = Vec::with_capacity((verts_x * verts_z) as usize);
    for j in 0..verts_z {
        for i in 0..verts_x {
            positions.push(SimPosition::new(
                i as f32 * desc.spacing,
                desc.height,
                j as f32 * desc.spacing,
            ));
        }
    }

    let mut faces = Vec::with_capacity((desc.cols * desc.rows * 2) as usize);
    for j in 0..desc.rows {
        for i in 0..desc.cols {
            let v00 = j * verts_x + i;
            let v10 = v00 + 1;
            let v01 = v00 + verts_x;
            let v11 = v01 + 1;
            faces.push(MeshFace::new(v00, v01, v11));
            faces.push(MeshFace::new(v00, v11, v10));
        }
    }

    let masses = topology::vertex_masses(&positions, &faces, desc.density);
    let velocities = vec![SimVelocity::default(); positions.len()];

    store.transact(|store| {
        let mesh = store.create_entity();
        store.add_array(mesh, positions)?;
        store.add_array(mesh, velocities)?;
        store.add_array(mesh, masses)?;
        store.add_array(mesh, faces)?;
        if desc.pin_top_corners {
            pinning::pin(store, mesh, &[0, desc.cols])?;
        }
        Ok(mesh)
    })
}

#[cfg(test)]
mod test {
    use super::{create_grid, GridDesc};
    use crate::dynamics::components::{MeshFace, SimMass, SimPosition};
    use crate::store::EntityStore;

    #[test]
    fn grid_counts_and_layout() {
        let mut store = EntityStore::new();
        let mesh = create_grid(
            &mut store,
            &GridDesc {
                cols: 3,
                rows: 2,
                spacing: 0.5,
                height: 1.25,
                ..Default::default()
            },
        )
        .unwrap();

        let positions = store.get_array::<SimPosition>(mesh).unwrap();
        assert_eq!(positions.len(), 4 * 3);
        let faces = store.get_array::<MeshFace>(mesh).unwrap();
        assert_eq!(faces.len(), 3 * 2 * 2);

        for p in positions {
            assert_eq!(p.y, 1.25);
        }
        assert_eq!(positions[5].x, 0.5);
        assert_eq!(positions[5].z, 0.5);
    }

    #[test]
    fn winding_is_ccw_from_above() {
        let mut store = EntityStore::new();
        let mesh = create_grid(&mut store, &GridDesc::square(2, 1.0)).unwrap();
        let positions = store.get_array::<SimPosition>(mesh).unwrap().to_vec();
        let faces = store.get_array::<MeshFace>(mesh).unwrap().to_vec();

        for face in &faces {
            let [a, b, c] = face.nodes;
            let p0 = positions[a as usize].xyz();
            let n = (positions[b as usize].xyz() - p0)
                .cross(&(positions[c as usize].xyz() - p0));
            assert!(n.y > 0.0, "face normal must point toward +Y");
        }
    }

    #[test]
    fn top_row_corners_are_pinned() {
        let mut store = EntityStore::new();
        let desc = GridDesc::square(4, 0.25);
        let mesh = create_grid(&mut store, &desc).unwrap();
        let masses = store.get_array::<SimMass>(mesh).unwrap();

        assert_eq!(masses[0].inv_mass, 0.0);
        assert_eq!(masses[desc.cols as usize].inv_mass, 0.0);
        let pinned = masses.iter().filter(|m| m.is_pinned()).count();
        assert_eq!(pinned, 2);
    }
}
