#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

pub mod error;
pub mod gpu;
pub mod kernel;
pub mod shader;
pub mod tensor;

pub use error::{ClothError, ClothResult};
pub use shader::ShaderLoader;

/// The number of threads per compute workgroup used by every kernel in the engine.
///
/// Dispatch counts are always `⌈work_items / WORKGROUP_SIZE⌉`.
pub const WORKGROUP_SIZE: u32 = 64;

/// Generates a test checking that a shader-backed struct compiles from the given loader.
///
/// The generated test initializes a GPU device, builds the shader loader from the
/// given expression, and asserts that `$ty::from_device` succeeds. The test is a
/// no-op on machines without a GPU adapter.
#[macro_export]
macro_rules! test_shader_compilation {
    ($ty:ident, $loader:expr) => {
        #[cfg(test)]
        mod shader_compilation {
            use super::$ty;

            #[futures_test::test]
            #[serial_test::serial]
            async fn shader_compiles() {
                let Ok(gpu) = $crate::gpu::GpuInstance::new().await else {
                    log::warn!("no gpu adapter available, skipping shader test");
                    return;
                };
                let shaders = $loader;
                $ty::from_device(gpu.device(), &shaders).unwrap();
            }
        }
    };
}
