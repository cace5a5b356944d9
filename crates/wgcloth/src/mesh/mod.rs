//! Mesh tools: procedural generators, OBJ import, topology derivation, and
//! the pinning API.

pub mod generators;
pub mod obj;
pub mod pinning;
pub mod topology;

pub use generators::{create_grid, GridDesc};
pub use obj::{create_obj_mesh, parse_obj};
pub use pinning::{pin, unpin};
