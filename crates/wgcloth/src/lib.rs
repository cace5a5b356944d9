#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![allow(clippy::too_many_arguments)]

pub extern crate nalgebra as na;

pub mod dynamics;
pub mod mesh;
pub mod pipeline;
pub mod store;

pub use pipeline::{ClothPipeline, StepStats, TopologySignature};
pub use wgcloth_core::{ClothError, ClothResult, ShaderLoader, WORKGROUP_SIZE};

/// A shader loader rooted at this crate's own `shaders/` directory.
///
/// Applications normally resolve shaders through
/// [`ShaderLoader::from_assets`]; this loader serves tests, demos, and any
/// embedder running from a source checkout.
pub fn bundled_shaders() -> ShaderLoader {
    ShaderLoader::new(concat!(env!("CARGO_MANIFEST_DIR"), "/shaders"))
}
