//! Host → device data mirroring.
//!
//! The mirror tracks a set of registered component types and uploads their
//! host-side data into GPU buffers whenever the backing storage is dirty.
//! Entities are always processed in identifier order, so buffer layouts are
//! deterministic. For topology arrays whose elements hold indices relative to
//! a reference component (usually positions), the mirror rewrites the indices
//! with the owning entity's offset in the reference buffer before uploading.

use crate::store::{ComponentValue, Entity, EntityStore};
use bytemuck::Pod;
use std::any::TypeId;
use std::collections::HashMap;
use wgcloth_core::{ClothError, ClothResult};
use wgpu::util::DeviceExt;
use wgpu::{Buffer, BufferUsages, Device, Queue};

/// The slice of a concatenated GPU buffer owned by one entity.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Region {
    /// The entity owning this slice.
    pub entity: Entity,
    /// First element of the slice.
    pub offset: u32,
    /// Number of elements in the slice.
    pub len: u32,
}

type CollectFn = Box<
    dyn Fn(&EntityStore, Option<&[Region]>) -> ClothResult<(Vec<u8>, Vec<Region>)> + Send + Sync,
>;

struct MirrorEntry {
    label: String,
    usage: BufferUsages,
    buffer: Option<Buffer>,
    regions: Vec<Region>,
    /// Bumped whenever the region layout of this entry changes.
    layout_generation: u64,
    /// For indexed arrays: the entry index of the reference component.
    ref_entry: Option<usize>,
    seen_ref_generation: u64,
    /// Singletons re-materialize on every sync instead of tracking dirt.
    always_refresh: bool,
    collect: CollectFn,
    is_dirty: Box<dyn Fn(&EntityStore) -> bool + Send + Sync>,
    clear_dirty: Box<dyn Fn(&mut EntityStore) + Send + Sync>,
}

/// Mirrors registered component data from an [`EntityStore`] into GPU buffers.
#[derive(Default)]
pub struct DeviceMirror {
    entries: Vec<MirrorEntry>,
    index: HashMap<TypeId, usize>,
}

impl DeviceMirror {
    /// Creates an empty mirror.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a dense component type `T` for mirroring.
    ///
    /// The GPU buffer holds one `T` per entity carrying the component, in
    /// entity-id order. Registration is idempotent per type.
    pub fn register<T: Pod + ComponentValue>(&mut self, extra_usage: BufferUsages, label: &str) {
        if self.index.contains_key(&TypeId::of::<T>()) {
            return;
        }
        self.push_entry::<T>(
            label,
            extra_usage,
            None,
            false,
            Box::new(|store, _| {
                let mut bytes = Vec::new();
                let mut regions = Vec::new();
                for entity in store.entities_with::<T>() {
                    let value = store
                        .get_component::<T>(entity)
                        .expect("entity listed by entities_with must have the component");
                    regions.push(Region {
                        entity,
                        offset: (bytes.len() / std::mem::size_of::<T>()) as u32,
                        len: 1,
                    });
                    bytes.extend_from_slice(bytemuck::bytes_of(value));
                }
                Ok((bytes, regions))
            }),
            Box::new(|store| store.component_dirty::<T>()),
            Box::new(|store| store.clear_component_dirty::<T>()),
        );
    }

    /// Registers an array component type `T` for mirroring.
    ///
    /// Per-entity arrays are concatenated in entity-id order; the resulting
    /// regions are queryable through [`DeviceMirror::regions`].
    pub fn register_array<T: Pod + ComponentValue>(
        &mut self,
        extra_usage: BufferUsages,
        label: &str,
    ) {
        if self.index.contains_key(&TypeId::of::<Vec<T>>()) {
            return;
        }
        self.push_array_entry::<T>(label, extra_usage, None, |elems, _| elems.to_vec());
    }

    /// Registers a topology array type `T` whose elements hold indices into
    /// the concatenated buffer of the reference component `Ref`.
    ///
    /// Before upload, `offset_fn` is applied to every element with the owning
    /// entity's offset in the `Ref` buffer, rewriting entity-local indices to
    /// global ones. `Ref` must already be registered. When the reference
    /// layout changes, this entry is rebuilt even if its own storage is clean.
    pub fn register_indexed_array<T, Ref>(
        &mut self,
        extra_usage: BufferUsages,
        label: &str,
        offset_fn: fn(&mut T, u32),
    ) -> ClothResult<()>
    where
        T: Pod + ComponentValue,
        Ref: Pod + ComponentValue,
    {
        if self.index.contains_key(&TypeId::of::<Vec<T>>()) {
            return Ok(());
        }
        let ref_entry = *self
            .index
            .get(&TypeId::of::<Vec<Ref>>())
            .ok_or_else(|| {
                ClothError::NotFound(format!(
                    "reference type {} must be registered before its indexed arrays",
                    std::any::type_name::<Ref>()
                ))
            })?;
        self.push_array_entry::<T>(label, extra_usage, Some(ref_entry), move |elems, offset| {
            let mut elems = elems.to_vec();
            for elem in &mut elems {
                offset_fn(elem, offset);
            }
            elems
        });
        Ok(())
    }

    /// Registers a singleton component mirrored as a GPU uniform.
    ///
    /// Exactly one entity is expected to carry `Host`; its value is run
    /// through `to_gpu` and re-uploaded on every sync.
    pub fn register_singleton<Host, Gpu>(&mut self, to_gpu: fn(&Host) -> Gpu, label: &str)
    where
        Host: ComponentValue,
        Gpu: Pod,
    {
        if self.index.contains_key(&TypeId::of::<Host>()) {
            return;
        }
        self.push_entry_keyed::<Host>(
            label,
            BufferUsages::UNIFORM,
            None,
            true,
            Box::new(move |store, _| {
                let entities = store.entities_with::<Host>();
                let Some(&entity) = entities.first() else {
                    return Ok((Vec::new(), Vec::new()));
                };
                let host = store
                    .get_component::<Host>(entity)
                    .expect("entity listed by entities_with must have the component");
                let gpu = to_gpu(host);
                Ok((
                    bytemuck::bytes_of(&gpu).to_vec(),
                    vec![Region {
                        entity,
                        offset: 0,
                        len: 1,
                    }],
                ))
            }),
            Box::new(|store| store.component_dirty::<Host>()),
            Box::new(|store| store.clear_component_dirty::<Host>()),
        );
    }

    /// Uploads every dirty registered storage to the GPU.
    ///
    /// Buffers are recreated when their byte size changes (entity set or
    /// array count changed) and rewritten in place otherwise. Indexed arrays
    /// are also rebuilt when their reference layout changed.
    pub fn sync(
        &mut self,
        store: &mut EntityStore,
        device: &Device,
        queue: &Queue,
    ) -> ClothResult<()> {
        for i in 0..self.entries.len() {
            let (before, rest) = self.entries.split_at_mut(i);
            let entry = &mut rest[0];

            let ref_regions = entry.ref_entry.map(|r| {
                let reference = &before[r];
                (reference.layout_generation, &reference.regions[..])
            });

            let ref_changed = ref_regions
                .map(|(generation, _)| generation != entry.seen_ref_generation)
                .unwrap_or(false);
            let dirty = entry.always_refresh || ref_changed || (entry.is_dirty)(store);
            if !dirty {
                continue;
            }

            let (bytes, regions) = (entry.collect)(store, ref_regions.map(|(_, r)| r))?;

            let size_changed = entry
                .buffer
                .as_ref()
                .map(|b| b.size() != bytes.len().max(4) as u64)
                .unwrap_or(true);
            if size_changed {
                entry.buffer = Some(create_exact(device, &entry.label, &bytes, entry.usage));
            } else if !bytes.is_empty() {
                queue.write_buffer(
                    entry.buffer.as_ref().expect("buffer exists when unchanged"),
                    0,
                    &bytes,
                );
            }

            if entry.regions != regions {
                entry.regions = regions;
                entry.layout_generation += 1;
            }
            if let Some((generation, _)) = ref_regions {
                entry.seen_ref_generation = generation;
            }
            (entry.clear_dirty)(store);
        }
        Ok(())
    }

    /// The GPU buffer mirroring `T`.
    ///
    /// `T` can be a dense component type, an array element type, or a
    /// singleton host type. Fails with a not-found error for unregistered
    /// types or types that have never been synced.
    pub fn buffer<T: ComponentValue>(&self) -> ClothResult<&Buffer> {
        let entry = self.entry::<T>()?;
        entry.buffer.as_ref().ok_or_else(|| {
            ClothError::NotFound(format!(
                "{} has not been synced to the gpu yet",
                std::any::type_name::<T>()
            ))
        })
    }

    /// Per-entity regions of the concatenated buffer mirroring `T`.
    pub fn regions<T: ComponentValue>(&self) -> ClothResult<&[Region]> {
        Ok(&self.entry::<T>()?.regions)
    }

    /// The offset of `entity`'s slice in the buffer mirroring `T`.
    pub fn entity_offset<T: ComponentValue>(&self, entity: Entity) -> Option<u32> {
        self.entry::<T>()
            .ok()?
            .regions
            .iter()
            .find(|r| r.entity == entity)
            .map(|r| r.offset)
    }

    /// The region of `entity`'s slice in the buffer mirroring `T`.
    pub fn entity_region<T: ComponentValue>(&self, entity: Entity) -> Option<Region> {
        self.entry::<T>()
            .ok()?
            .regions
            .iter()
            .find(|r| r.entity == entity)
            .copied()
    }

    /// Total number of elements mirrored for `T`.
    pub fn len<T: ComponentValue>(&self) -> u32 {
        self.entry::<T>()
            .map(|e| e.regions.iter().map(|r| r.len).sum())
            .unwrap_or(0)
    }

    fn entry<T: ComponentValue>(&self) -> ClothResult<&MirrorEntry> {
        let index = self
            .index
            .get(&TypeId::of::<T>())
            .or_else(|| self.index.get(&TypeId::of::<Vec<T>>()))
            .ok_or_else(|| {
                ClothError::NotFound(format!(
                    "{} is not registered with the device mirror",
                    std::any::type_name::<T>()
                ))
            })?;
        Ok(&self.entries[*index])
    }

    fn push_array_entry<T: Pod + ComponentValue>(
        &mut self,
        label: &str,
        extra_usage: BufferUsages,
        ref_entry: Option<usize>,
        transform: impl Fn(&[T], u32) -> Vec<T> + Send + Sync + 'static,
    ) {
        let collect: CollectFn = Box::new(move |store, ref_regions| {
            let mut bytes = Vec::new();
            let mut regions = Vec::new();
            for entity in store.entities_with_array::<T>() {
                let elems = store
                    .get_array::<T>(entity)
                    .expect("entity listed by entities_with_array must have the array");
                let ref_offset = ref_regions
                    .and_then(|regions| regions.iter().find(|r| r.entity == entity))
                    .map(|r| r.offset)
                    .unwrap_or(0);
                let elems = transform(elems, ref_offset);
                regions.push(Region {
                    entity,
                    offset: (bytes.len() / std::mem::size_of::<T>()) as u32,
                    len: elems.len() as u32,
                });
                bytes.extend_from_slice(bytemuck::cast_slice(&elems));
            }
            Ok((bytes, regions))
        });
        self.entries.push(MirrorEntry {
            label: label.to_string(),
            usage: BufferUsages::STORAGE | BufferUsages::COPY_DST | extra_usage,
            buffer: None,
            regions: Vec::new(),
            layout_generation: 0,
            ref_entry,
            seen_ref_generation: 0,
            always_refresh: false,
            collect,
            is_dirty: Box::new(|store| store.array_dirty::<T>()),
            clear_dirty: Box::new(|store| store.clear_array_dirty::<T>()),
        });
        self.index
            .insert(TypeId::of::<Vec<T>>(), self.entries.len() - 1);
    }

    #[allow(clippy::too_many_arguments)]
    fn push_entry<T: ComponentValue>(
        &mut self,
        label: &str,
        extra_usage: BufferUsages,
        ref_entry: Option<usize>,
        always_refresh: bool,
        collect: CollectFn,
        is_dirty: Box<dyn Fn(&EntityStore) -> bool + Send + Sync>,
        clear_dirty: Box<dyn Fn(&mut EntityStore) + Send + Sync>,
    ) {
        self.entries.push(MirrorEntry {
            label: label.to_string(),
            usage: BufferUsages::STORAGE | BufferUsages::COPY_DST | extra_usage,
            buffer: None,
            regions: Vec::new(),
            layout_generation: 0,
            ref_entry,
            seen_ref_generation: 0,
            always_refresh,
            collect,
            is_dirty,
            clear_dirty,
        });
        self.index.insert(TypeId::of::<T>(), self.entries.len() - 1);
    }

    #[allow(clippy::too_many_arguments)]
    fn push_entry_keyed<T: ComponentValue>(
        &mut self,
        label: &str,
        usage: BufferUsages,
        ref_entry: Option<usize>,
        always_refresh: bool,
        collect: CollectFn,
        is_dirty: Box<dyn Fn(&EntityStore) -> bool + Send + Sync>,
        clear_dirty: Box<dyn Fn(&mut EntityStore) + Send + Sync>,
    ) {
        self.entries.push(MirrorEntry {
            label: label.to_string(),
            usage: usage | BufferUsages::COPY_DST,
            buffer: None,
            regions: Vec::new(),
            layout_generation: 0,
            ref_entry,
            seen_ref_generation: 0,
            always_refresh,
            collect,
            is_dirty,
            clear_dirty,
        });
        self.index.insert(TypeId::of::<T>(), self.entries.len() - 1);
    }
}

fn create_exact(device: &Device, label: &str, bytes: &[u8], usage: BufferUsages) -> Buffer {
    if bytes.is_empty() {
        device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: 4,
            usage,
            mapped_at_creation: false,
        })
    } else {
        device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(label),
            contents: bytes,
            usage,
        })
    }
}
