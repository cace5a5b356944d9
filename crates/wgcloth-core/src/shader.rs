//! Runtime WGSL shader loading with `#import` resolution.
//!
//! Shaders are plain `.wgsl` files loaded by name relative to a base path.
//! A file can pull in another file with an import directive:
//!
//! ```wgsl
//! #import "common.wgsl"
//! ```
//!
//! Imports are resolved relative to the importing file. Every file is
//! included at most once per composition, so import cycles terminate.

use crate::error::{ClothError, ClothResult};
use std::borrow::Cow;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use wgpu::{ComputePipeline, Device};

/// Resolves the asset base directory.
///
/// The lookup order is `./assets/`, `../assets/`, then the directory
/// containing the running executable.
pub fn find_asset_dir() -> ClothResult<PathBuf> {
    for candidate in ["./assets", "../assets"] {
        let path = Path::new(candidate);
        if path.is_dir() {
            return Ok(path.to_path_buf());
        }
    }

    let exe = std::env::current_exe()?;
    let dir = exe.parent().ok_or_else(|| {
        ClothError::NotFound("executable has no parent directory".to_string())
    })?;
    Ok(dir.to_path_buf())
}

/// Loads and composes WGSL shader files from a base directory.
pub struct ShaderLoader {
    base: PathBuf,
}

impl ShaderLoader {
    /// Creates a loader rooted at an explicit base directory.
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// Creates a loader rooted at `<asset dir>/shaders`, with the asset
    /// directory resolved by [`find_asset_dir`].
    pub fn from_assets() -> ClothResult<Self> {
        Ok(Self::new(find_asset_dir()?.join("shaders")))
    }

    /// The base directory shader names are resolved against.
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Reads a shader file and splices in all its (transitive) imports.
    pub fn compose(&self, name: &str) -> ClothResult<String> {
        let path = self.base.join(name);
        let mut included = HashSet::new();
        compose_file(&path, &mut included)
    }

    /// Composes, validates, and compiles a shader file into a gpu module.
    pub fn load(&self, device: &Device, name: &str) -> ClothResult<LoadedShader> {
        let source = self.compose(name)?;

        // Validate with naga first so malformed WGSL surfaces as a typed
        // error instead of an uncaptured device error.
        let module = naga::front::wgsl::parse_str(&source).map_err(|e| ClothError::Shader {
            path: name.to_string(),
            message: e.emit_to_string(&source),
        })?;
        naga::valid::Validator::new(
            naga::valid::ValidationFlags::all(),
            naga::valid::Capabilities::all(),
        )
        .validate(&module)
        .map_err(|e| ClothError::Shader {
            path: name.to_string(),
            message: format!("{e:?}"),
        })?;

        let entry_points = module.entry_points.iter().map(|ep| ep.name.clone()).collect();
        log::debug!("compiled shader `{name}` ({} bytes of wgsl)", source.len());
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(name),
            source: wgpu::ShaderSource::Wgsl(Cow::Owned(source)),
        });

        Ok(LoadedShader {
            module: shader,
            entry_points,
            label: name.to_string(),
        })
    }
}

/// A compiled shader module and the names of its entry points.
pub struct LoadedShader {
    /// The compiled gpu shader module.
    pub module: wgpu::ShaderModule,
    entry_points: Vec<String>,
    label: String,
}

impl LoadedShader {
    /// Creates a compute pipeline for one of the module's entry points.
    ///
    /// Fails with a device error if the entry point does not exist in the
    /// module.
    pub fn compute_pipeline(&self, device: &Device, entry: &str) -> ClothResult<ComputePipeline> {
        if !self.entry_points.iter().any(|ep| ep == entry) {
            return Err(ClothError::Device(format!(
                "shader `{}` has no entry point `{entry}`",
                self.label
            )));
        }

        Ok(device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(&format!("{}::{}", self.label, entry)),
            layout: None,
            module: &self.module,
            entry_point: Some(entry),
            compilation_options: Default::default(),
            cache: None,
        }))
    }
}

fn compose_file(path: &Path, included: &mut HashSet<PathBuf>) -> ClothResult<String> {
    let canonical = path.canonicalize().map_err(|e| {
        ClothError::Io(std::io::Error::new(
            e.kind(),
            format!("shader file `{}`: {e}", path.display()),
        ))
    })?;
    if !included.insert(canonical) {
        // Already spliced in by an earlier import.
        return Ok(String::new());
    }

    let source = std::fs::read_to_string(path)?;
    let dir = path.parent().unwrap_or(Path::new("."));
    let mut out = String::with_capacity(source.len());

    for line in source.lines() {
        if let Some(import) = parse_import(line) {
            let imported = compose_file(&dir.join(import), included)?;
            out.push_str(&imported);
        } else {
            out.push_str(line);
            out.push('\n');
        }
    }

    Ok(out)
}

fn parse_import(line: &str) -> Option<&str> {
    let rest = line.trim().strip_prefix("#import")?;
    let rest = rest.trim();
    let rest = rest.strip_prefix('"')?;
    let (path, _) = rest.split_once('"')?;
    Some(path)
}
