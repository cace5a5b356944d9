//! Wavefront OBJ import.
//!
//! Supports `v x y z` and `f ...` records. Polygons are fan-triangulated;
//! negative indices count from the end of the vertex list as parsed so far.
//! All other record types are ignored.

use crate::dynamics::components::{MeshFace, SimPosition, SimVelocity};
use crate::mesh::topology;
use crate::store::{Entity, EntityStore};
use std::path::Path;
use wgcloth_core::{ClothError, ClothResult};

/// Parses OBJ source into positions and triangulated faces.
pub fn parse_obj(source: &str) -> ClothResult<(Vec<SimPosition>, Vec<MeshFace>)> {
    let mut positions: Vec<SimPosition> = Vec::new();
    let mut faces = Vec::new();

    for (line_no, line) in source.lines().enumerate() {
        let mut fields = line.split_whitespace();
        match fields.next() {
            Some("v") => {
                let mut coord = |name: &str| -> ClothResult<f32> {
                    fields
                        .next()
                        .and_then(|f| f.parse::<f32>().ok())
                        .ok_or_else(|| malformed(line_no, &format!("vertex {name} coordinate")))
                };
                let x = coord("x")?;
                let y = coord("y")?;
                let z = coord("z")?;
                positions.push(SimPosition::new(x, y, z));
            }
            Some("f") => {
                let mut indices = Vec::new();
                for field in fields {
                    indices.push(parse_index(field, positions.len(), line_no)?);
                }
                if indices.len() < 3 {
                    return Err(malformed(line_no, "face with fewer than 3 vertices"));
                }
                for i in 1..indices.len() - 1 {
                    faces.push(MeshFace::new(indices[0], indices[i], indices[i + 1]));
                }
            }
            _ => {}
        }
    }

    Ok((positions, faces))
}

/// Loads an OBJ file and spawns a mesh entity with area-weighted vertex
/// masses, all arrays set in one transaction.
pub fn create_obj_mesh(
    store: &mut EntityStore,
    path: impl AsRef<Path>,
    density: f32,
) -> ClothResult<Entity> {
    let source = std::fs::read_to_string(path)?;
    let (positions, faces) = parse_obj(&source)?;
    let masses = topology::vertex_masses(&positions, &faces, density);
    let velocities = vec![SimVelocity::default(); positions.len()];

    store.transact(|store| {
        let mesh = store.create_entity();
        store.add_array(mesh, positions)?;
        store.add_array(mesh, velocities)?;
        store.add_array(mesh, masses)?;
        store.add_array(mesh, faces)?;
        Ok(mesh)
    })
}

fn parse_index(field: &str, vertex_count: usize, line_no: usize) -> ClothResult<u32> {
    // "v", "v/vt", "v/vt/vn", and "v//vn" all start with the position index.
    let first = field.split('/').next().unwrap_or("");
    let raw: i64 = first
        .parse()
        .map_err(|_| malformed(line_no, &format!("face index `{field}`")))?;
    let resolved = if raw < 0 {
        vertex_count as i64 + raw
    } else {
        raw - 1
    };
    if resolved < 0 || resolved >= vertex_count as i64 {
        return Err(malformed(
            line_no,
            &format!("face index {raw} out of range"),
        ));
    }
    Ok(resolved as u32)
}

fn malformed(line_no: usize, what: &str) -> ClothError {
    ClothError::Io(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        format!("obj line {}: malformed {what}", line_no + 1),
    ))
}

#[cfg(test)]
mod test {
    use super::parse_obj;
    use wgcloth_core::ClothError;

    #[test]
    fn parses_triangles_and_ignores_other_records() {
        let src = "\
# comment
v 0 0 0
v 1 0 0
v 0 1 0
vn 0 0 1
vt 0 0
f 1 2 3
";
        let (positions, faces) = parse_obj(src).unwrap();
        assert_eq!(positions.len(), 3);
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].nodes, [0, 1, 2]);
    }

    #[test]
    fn fan_triangulates_polygons() {
        let src = "\
v 0 0 0
v 1 0 0
v 1 1 0
v 0 1 0
f 1 2 3 4
";
        let (_, faces) = parse_obj(src).unwrap();
        assert_eq!(faces.len(), 2);
        assert_eq!(faces[0].nodes, [0, 1, 2]);
        assert_eq!(faces[1].nodes, [0, 2, 3]);
    }

    #[test]
    fn negative_indices_count_from_the_end() {
        let src = "\
v 0 0 0
v 1 0 0
v 0 1 0
f -3 -2 -1
";
        let (_, faces) = parse_obj(src).unwrap();
        assert_eq!(faces[0].nodes, [0, 1, 2]);
    }

    #[test]
    fn slash_separated_indices_use_the_position() {
        let src = "\
v 0 0 0
v 1 0 0
v 0 1 0
f 1/1/1 2/2/2 3//3
";
        let (_, faces) = parse_obj(src).unwrap();
        assert_eq!(faces[0].nodes, [0, 1, 2]);
    }

    #[test]
    fn out_of_range_indices_are_io_errors() {
        let src = "v 0 0 0\nf 1 2 3\n";
        assert!(matches!(parse_obj(src), Err(ClothError::Io(_))));
    }
}
