//! The per-step orchestrator wiring the entity store, device mirror,
//! providers, and solvers together.

use crate::dynamics::components::{
    AreaConstraint, GravityConstraint, GpuPhysicsParams, MeshFace, NewtonConfig, PdConfig,
    PhysicsParams, SimMass, SimPosition, SimVelocity, SpringConstraint, SpringEdge,
};
use crate::dynamics::newton::NewtonSolver;
use crate::dynamics::normals::NormalsPass;
use crate::dynamics::pd::PdSolver;
use crate::dynamics::terms::{gather_terms, DynamicsTerm, InertiaTerm, TopologyScope};
use crate::store::{DeviceMirror, EntityStore};
use wgcloth_core::gpu::GpuInstance;
use wgcloth_core::{ClothError, ClothResult, ShaderLoader};
use wgpu::{BufferUsages, CommandEncoder, Device};

/// Timing and iteration counts of one pipeline step.
#[derive(Default, Copy, Clone, Debug)]
pub struct StepStats {
    /// Wall-clock time spent recording and submitting the step.
    pub step_time: std::time::Duration,
    /// Newton iterations recorded (zero for projective dynamics).
    pub newton_iterations: u32,
    /// CG iterations recorded per Newton iteration.
    pub cg_iterations: u32,
    /// Jacobi iterations recorded (zero for the Newton solver).
    pub pd_iterations: u32,
}

/// A summary of the simulated topology. A change forces solver
/// re-initialization.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct TopologySignature {
    /// Total simulated nodes across all mesh entities.
    pub node_count: u32,
    /// Total spring edges.
    pub total_edges: u32,
    /// Total mesh faces.
    pub total_faces: u32,
    /// Number of constraint configuration components.
    pub constraint_count: u32,
}

impl TopologySignature {
    /// Computes the signature of the current store contents.
    pub fn from_store(store: &EntityStore) -> Self {
        let node_count = store
            .entities_with_array::<SimPosition>()
            .into_iter()
            .map(|e| store.get_array::<SimPosition>(e).map_or(0, |a| a.len() as u32))
            .sum();
        let total_edges = store
            .entities_with_array::<SpringEdge>()
            .into_iter()
            .map(|e| store.get_array::<SpringEdge>(e).map_or(0, |a| a.len() as u32))
            .sum();
        let total_faces = store
            .entities_with_array::<MeshFace>()
            .into_iter()
            .map(|e| store.get_array::<MeshFace>(e).map_or(0, |a| a.len() as u32))
            .sum();
        let constraint_count = store.entities_with::<SpringConstraint>().len() as u32
            + store.entities_with::<AreaConstraint>().len() as u32
            + store.entities_with::<GravityConstraint>().len() as u32;
        Self {
            node_count,
            total_edges,
            total_faces,
            constraint_count,
        }
    }
}

enum AnySolver {
    Newton(NewtonSolver),
    Pd(PdSolver),
}

/// The integrator shell.
///
/// Discovers the single [`NewtonConfig`] or [`PdConfig`] entity, gathers the
/// referenced constraint entities through the providers, and wires them into
/// a solver instance. Each step syncs the device mirror, records the solve,
/// recomputes vertex normals, and submits everything.
pub struct ClothPipeline {
    shaders: ShaderLoader,
    mirror: DeviceMirror,
    solver: Option<AnySolver>,
    normals: Option<NormalsPass>,
    signature: TopologySignature,
}

impl ClothPipeline {
    /// Creates the pipeline and registers the simulation component types
    /// with the device mirror.
    pub fn new(shaders: ShaderLoader) -> Self {
        let mut mirror = DeviceMirror::new();
        mirror.register_array::<SimPosition>(BufferUsages::COPY_SRC, "positions");
        mirror.register_array::<SimVelocity>(BufferUsages::COPY_SRC, "velocities");
        mirror.register_array::<SimMass>(BufferUsages::COPY_SRC, "masses");
        mirror
            .register_indexed_array::<MeshFace, SimPosition>(
                BufferUsages::COPY_SRC,
                "faces",
                |face, offset| {
                    for n in &mut face.nodes {
                        *n += offset;
                    }
                },
            )
            .expect("positions are registered before faces");
        mirror.register_singleton::<PhysicsParams, GpuPhysicsParams>(
            PhysicsParams::to_gpu,
            "physics_params",
        );

        Self {
            shaders,
            mirror,
            solver: None,
            normals: None,
            signature: TopologySignature::default(),
        }
    }

    /// The device mirror, e.g. for renderers that need the mirrored buffers.
    pub fn mirror(&self) -> &DeviceMirror {
        &self.mirror
    }

    /// The vertex-normals buffer of the last step, if a solver is active.
    pub fn normals_buffer(&self) -> Option<&wgpu::Buffer> {
        self.normals.as_ref().map(|n| n.buffer())
    }

    /// The current topology signature.
    pub fn signature(&self) -> TopologySignature {
        self.signature
    }

    /// Notifies the pipeline that the store contents changed.
    ///
    /// When the topology signature changed, the active solver is torn down
    /// and rebuilt on the next step.
    pub fn on_database_changed(&mut self, store: &EntityStore) {
        let signature = TopologySignature::from_store(store);
        if signature != self.signature {
            log::info!(
                "topology signature changed ({:?} -> {:?}), reinitializing the solver",
                self.signature,
                signature
            );
            self.solver = None;
            self.normals = None;
            self.signature = signature;
        }
    }

    /// Advances the simulation by one timestep.
    pub async fn step(
        &mut self,
        gpu: &GpuInstance,
        store: &mut EntityStore,
    ) -> ClothResult<StepStats> {
        let t0 = web_time::Instant::now();
        let device = gpu.device();
        self.mirror.sync(store, device, gpu.queue())?;

        if self.solver.is_none() {
            self.signature = TopologySignature::from_store(store);
            self.build_solver(device, store)?;
        }

        let mut stats = StepStats::default();
        match &mut self.solver {
            None => {}
            Some(AnySolver::Newton(solver)) => {
                let mut encoder = device.create_command_encoder(&Default::default());
                solver.step(device, &mut encoder);
                record_normals(&self.normals, &self.mirror, device, &mut encoder)?;
                gpu.queue().submit(Some(encoder.finish()));
                stats.newton_iterations = solver.config().newton_iterations;
                stats.cg_iterations = solver.config().cg_iterations;
            }
            Some(AnySolver::Pd(solver)) => {
                stats.pd_iterations = solver.config().iterations;
                let mut encoder = device.create_command_encoder(&Default::default());
                let calibrating = solver.record(device, &mut encoder);
                record_normals(&self.normals, &self.mirror, device, &mut encoder)?;
                gpu.queue().submit(Some(encoder.finish()));
                if calibrating {
                    solver.finish_calibration(gpu).await?;
                }
            }
        }

        stats.step_time = t0.elapsed();
        Ok(stats)
    }

    fn build_solver(&mut self, device: &Device, store: &EntityStore) -> ClothResult<()> {
        let node_count = self.mirror.len::<SimPosition>();
        if node_count == 0 {
            return Ok(());
        }

        if let Some(&config_entity) = store.entities_with::<NewtonConfig>().first() {
            let config = *store
                .get_component::<NewtonConfig>(config_entity)
                .expect("entity listed by entities_with must have the component");

            let mut terms: Vec<Box<dyn DynamicsTerm>> = vec![Box::new(InertiaTerm::new())];
            terms.extend(gather_terms(
                store,
                &self.mirror,
                config.constraint_entities(),
                TopologyScope::Global,
            )?);

            let solver = NewtonSolver::new(
                device,
                &self.shaders,
                config,
                self.mirror.buffer::<PhysicsParams>()?.clone(),
                self.mirror.buffer::<SimPosition>()?.clone(),
                self.mirror.buffer::<SimVelocity>()?.clone(),
                self.mirror.buffer::<SimMass>()?.clone(),
                node_count,
                terms,
            )?;
            self.solver = Some(AnySolver::Newton(solver));
        } else if let Some(&config_entity) = store.entities_with::<PdConfig>().first() {
            let config = *store
                .get_component::<PdConfig>(config_entity)
                .expect("entity listed by entities_with must have the component");

            let (scope, scope_offset, solver_nodes) = if config.mesh.is_valid() {
                let region = self
                    .mirror
                    .entity_region::<SimPosition>(config.mesh)
                    .ok_or_else(|| {
                        ClothError::NotFound(format!(
                            "scoped mesh entity {} has no mirrored positions",
                            config.mesh.id()
                        ))
                    })?;
                (
                    TopologyScope::Local(config.mesh),
                    Some(region.offset),
                    region.len,
                )
            } else {
                (TopologyScope::Global, None, node_count)
            };

            let terms = gather_terms(
                store,
                &self.mirror,
                config.constraint_entities(),
                scope,
            )?;
            let solver = PdSolver::new(
                device,
                &self.shaders,
                config,
                self.mirror.buffer::<PhysicsParams>()?.clone(),
                self.mirror.buffer::<SimPosition>()?.clone(),
                self.mirror.buffer::<SimVelocity>()?.clone(),
                self.mirror.buffer::<SimMass>()?.clone(),
                solver_nodes,
                scope_offset,
                terms,
            )?;
            self.solver = Some(AnySolver::Pd(solver));
        } else {
            return Ok(());
        }

        self.normals = Some(NormalsPass::new(device, &self.shaders, node_count)?);
        Ok(())
    }
}

fn record_normals(
    normals: &Option<NormalsPass>,
    mirror: &DeviceMirror,
    device: &Device,
    encoder: &mut CommandEncoder,
) -> ClothResult<()> {
    let Some(pass) = normals else {
        return Ok(());
    };
    let face_count = mirror.len::<MeshFace>();
    if face_count == 0 {
        return Ok(());
    }
    pass.record(
        device,
        encoder,
        mirror.buffer::<SimPosition>()?,
        mirror.buffer::<MeshFace>()?,
        face_count,
    );
    Ok(())
}

#[cfg(test)]
mod test {
    use super::TopologySignature;
    use crate::dynamics::components::{
        MeshFace, SimPosition, SpringConstraint, SpringEdge,
    };
    use crate::store::EntityStore;

    #[test]
    fn signature_tracks_counts() {
        let mut store = EntityStore::new();
        assert_eq!(
            TopologySignature::from_store(&store),
            TopologySignature::default()
        );

        let mesh = store.create_entity();
        store
            .add_array(
                mesh,
                vec![
                    SimPosition::new(0.0, 0.0, 0.0),
                    SimPosition::new(1.0, 0.0, 0.0),
                ],
            )
            .unwrap();
        store.add_array(mesh, vec![MeshFace::new(0, 1, 1)]).unwrap();
        store
            .add_array(
                mesh,
                vec![SpringEdge {
                    nodes: [0, 1],
                    rest_length: 1.0,
                    _pad: 0,
                }],
            )
            .unwrap();
        let constraint = store.create_entity();
        store
            .add_component(constraint, SpringConstraint::default())
            .unwrap();

        let signature = TopologySignature::from_store(&store);
        assert_eq!(
            signature,
            TopologySignature {
                node_count: 2,
                total_edges: 1,
                total_faces: 1,
                constraint_count: 1,
            }
        );

        // Growing the mesh changes the signature.
        store
            .set_array(
                mesh,
                vec![
                    SimPosition::new(0.0, 0.0, 0.0),
                    SimPosition::new(1.0, 0.0, 0.0),
                    SimPosition::new(2.0, 0.0, 0.0),
                ],
            )
            .unwrap();
        assert_ne!(TopologySignature::from_store(&store), signature);
    }
}
