//! End-to-end simulation scenarios running on a real GPU device.
//!
//! Every test degrades to a no-op on machines without a GPU adapter.

use wgcloth::dynamics::components::{
    AreaConstraint, GravityConstraint, MeshFace, NewtonConfig, PdConfig, PhysicsParams, SimMass,
    SimPosition, SimVelocity, SpringConstraint, SpringEdge,
};
use wgcloth::mesh::{self, topology, GridDesc};
use wgcloth::na::Vector3;
use wgcloth::store::{Entity, EntityStore};
use wgcloth::ClothPipeline;
use wgcloth_core::gpu::GpuInstance;
use wgcloth_core::tensor::GpuVector;
use wgpu::BufferUsages;

async fn read_positions(gpu: &GpuInstance, pipeline: &ClothPipeline) -> Vec<SimPosition> {
    let buffer = pipeline.mirror().buffer::<SimPosition>().unwrap();
    let n = pipeline.mirror().len::<SimPosition>();
    let staging = GpuVector::<SimPosition>::uninit(
        gpu.device(),
        n,
        BufferUsages::MAP_READ | BufferUsages::COPY_DST,
    );
    let mut encoder = gpu.device().create_command_encoder(&Default::default());
    encoder.copy_buffer_to_buffer(buffer, 0, staging.buffer(), 0, n as u64 * 16);
    gpu.submit_and_wait(encoder).unwrap();
    staging.read(gpu.device()).await.unwrap()
}

fn add_params(store: &mut EntityStore, gravity: Vector3<f32>, damping: f32) -> Entity {
    let e = store.create_entity();
    store
        .add_component(
            e,
            PhysicsParams {
                dt: 1.0 / 60.0,
                gravity,
                damping,
            },
        )
        .unwrap();
    e
}

/// Builds the draped-grid scene: pinned top corners, structural springs,
/// gravity, and a Newton system configuration.
fn drape_scene(store: &mut EntityStore, cells: u32, spacing: f32, height: f32) -> Entity {
    let mesh = mesh::create_grid(
        store,
        &GridDesc {
            cols: cells,
            rows: cells,
            spacing,
            height,
            ..Default::default()
        },
    )
    .unwrap();

    let positions = store.get_array::<SimPosition>(mesh).unwrap().to_vec();
    let faces = store
        .get_array::<MeshFace>(mesh)
        .unwrap()
        .to_vec();
    store
        .add_array(mesh, topology::spring_edges(&positions, &faces))
        .unwrap();

    let springs = store.create_entity();
    store
        .add_component(springs, SpringConstraint { stiffness: 500.0 })
        .unwrap();
    let gravity = store.create_entity();
    store
        .add_component(gravity, GravityConstraint::default())
        .unwrap();

    let system = store.create_entity();
    store
        .add_component(
            system,
            NewtonConfig::default().with_constraints(&[springs, gravity]),
        )
        .unwrap();

    add_params(store, Vector3::new(0.0, -9.81, 0.0), 0.999);
    mesh
}

#[futures_test::test]
#[serial_test::serial]
async fn grid_drape_under_gravity() {
    let Ok(gpu) = GpuInstance::new().await else {
        return;
    };
    let mut store = EntityStore::new();
    let height = 1.0;
    let cells = 10;
    drape_scene(&mut store, cells, 0.1, height);

    let mut pipeline = ClothPipeline::new(wgcloth::bundled_shaders());
    for _ in 0..60 {
        pipeline.step(&gpu, &mut store).await.unwrap();
    }

    let positions = read_positions(&gpu, &pipeline).await;
    let pinned = [0usize, cells as usize];
    for (i, p) in positions.iter().enumerate() {
        assert!(p.y.is_finite());
        if pinned.contains(&i) {
            let rest = SimPosition::new(i as f32 * 0.1, height, 0.0);
            assert!(
                (p.xyz() - rest.xyz()).norm() < 1.0e-6,
                "pinned corner {i} moved to {p:?}"
            );
        } else {
            assert!(
                p.y < height,
                "unpinned node {i} did not sag: y = {}",
                p.y
            );
        }
    }
}

#[futures_test::test]
#[serial_test::serial]
async fn static_mesh_stays_put_without_gravity() {
    let Ok(gpu) = GpuInstance::new().await else {
        return;
    };
    let mut store = EntityStore::new();
    let mesh = mesh::create_grid(&mut store, &GridDesc::square(4, 0.25)).unwrap();
    let positions = store.get_array::<SimPosition>(mesh).unwrap().to_vec();
    let faces = store
        .get_array::<MeshFace>(mesh)
        .unwrap()
        .to_vec();
    store
        .add_array(mesh, topology::spring_edges(&positions, &faces))
        .unwrap();

    let springs = store.create_entity();
    store
        .add_component(springs, SpringConstraint { stiffness: 500.0 })
        .unwrap();
    let system = store.create_entity();
    store
        .add_component(system, NewtonConfig::default().with_constraints(&[springs]))
        .unwrap();
    add_params(&mut store, Vector3::zeros(), 0.999);

    let before = store.get_array::<SimPosition>(mesh).unwrap().to_vec();
    let mut pipeline = ClothPipeline::new(wgcloth::bundled_shaders());
    pipeline.step(&gpu, &mut store).await.unwrap();

    // Springs at rest length and zero velocity produce a (numerically) zero
    // right-hand side; one Newton step must not move anything beyond
    // round-off between host- and device-side rest-length evaluation.
    let after = read_positions(&gpu, &pipeline).await;
    let tolerance = 1.0e-5 * 0.25;
    for (i, (b, a)) in before.iter().zip(after.iter()).enumerate() {
        assert!(
            (b.xyz() - a.xyz()).norm() <= tolerance,
            "node {i} drifted from {b:?} to {a:?}"
        );
    }
}

#[futures_test::test]
#[serial_test::serial]
async fn pinned_chain_node_never_moves() {
    let Ok(gpu) = GpuInstance::new().await else {
        return;
    };
    let mut store = EntityStore::new();

    // Three nodes in a line; the middle one is pinned; the end nodes start
    // displaced away from the spring rest lengths.
    let positions = vec![
        SimPosition::new(-1.5, 0.0, 0.0),
        SimPosition::new(0.0, 0.0, 0.0),
        SimPosition::new(1.5, 0.0, 0.0),
    ];
    let rest = 1.0;
    let edges = vec![SpringEdge::new(0, 1, rest), SpringEdge::new(1, 2, rest)];
    let mesh = store
        .transact(|store| {
            let mesh = store.create_entity();
            store.add_array(mesh, positions.clone())?;
            store.add_array(mesh, vec![SimVelocity::default(); 3])?;
            store.add_array(mesh, vec![SimMass::new(0.1); 3])?;
            store.add_array(mesh, edges.clone())?;
            mesh::pin(store, mesh, &[1])?;
            Ok(mesh)
        })
        .unwrap();

    let springs = store.create_entity();
    store
        .add_component(springs, SpringConstraint { stiffness: 100.0 })
        .unwrap();
    let system = store.create_entity();
    store
        .add_component(
            system,
            NewtonConfig {
                cg_iterations: 40,
                ..NewtonConfig::default().with_constraints(&[springs])
            },
        )
        .unwrap();
    add_params(&mut store, Vector3::zeros(), 0.999);

    let mut pipeline = ClothPipeline::new(wgcloth::bundled_shaders());
    for _ in 0..90 {
        pipeline.step(&gpu, &mut store).await.unwrap();
    }

    let after = read_positions(&gpu, &pipeline).await;
    assert_eq!(
        after[1], positions[1],
        "the pinned node must hold its position bitwise"
    );

    // The free ends relax toward the spring rest length.
    let d0 = (after[0].xyz() - after[1].xyz()).norm();
    let d2 = (after[2].xyz() - after[1].xyz()).norm();
    assert!((d0 - rest).abs() < 0.1, "left end at distance {d0}");
    assert!((d2 - rest).abs() < 0.1, "right end at distance {d2}");
    let _ = mesh;
}

#[futures_test::test]
#[serial_test::serial]
async fn pd_preserves_triangle_area() {
    let Ok(gpu) = GpuInstance::new().await else {
        return;
    };
    let mut store = EntityStore::new();

    let positions = vec![
        SimPosition::new(0.0, 0.0, 0.3),
        SimPosition::new(1.0, 0.0, 0.0),
        SimPosition::new(0.0, 1.0, 0.0),
    ];
    // Rest shape is the flat unit right triangle (area 0.5); the first
    // vertex starts perturbed out of plane.
    let rest_positions = vec![
        SimPosition::new(0.0, 0.0, 0.0),
        SimPosition::new(1.0, 0.0, 0.0),
        SimPosition::new(0.0, 1.0, 0.0),
    ];
    let faces = vec![MeshFace::new(0, 1, 2)];
    let triangles = topology::area_triangles(&rest_positions, &faces);
    let masses = topology::vertex_masses(&rest_positions, &faces, 1.0);

    let mesh = store
        .transact(|store| {
            let mesh = store.create_entity();
            store.add_array(mesh, positions)?;
            store.add_array(mesh, vec![SimVelocity::default(); 3])?;
            store.add_array(mesh, masses.clone())?;
            store.add_array(mesh, faces.clone())?;
            store.add_array(mesh, triangles.clone())?;
            Ok(mesh)
        })
        .unwrap();

    let area = store.create_entity();
    store
        .add_component(
            area,
            AreaConstraint {
                stiffness: 1000.0,
                shear_stiffness: 0.0,
            },
        )
        .unwrap();
    let system = store.create_entity();
    store
        .add_component(system, PdConfig::default().with_constraints(&[area]))
        .unwrap();
    add_params(&mut store, Vector3::zeros(), 0.9);

    let mut pipeline = ClothPipeline::new(wgcloth::bundled_shaders());
    for _ in 0..200 {
        pipeline.step(&gpu, &mut store).await.unwrap();
    }

    let after = read_positions(&gpu, &pipeline).await;
    let integrated_area =
        topology::triangle_area(after[0].xyz(), after[1].xyz(), after[2].xyz());
    assert!(
        (integrated_area - 0.5).abs() / 0.5 < 0.01,
        "triangle area {integrated_area} drifted more than 1% from 0.5"
    );
    let _ = mesh;
}

/// Runs the spring-grid PD scene for `steps` steps and returns the final
/// positions.
async fn run_pd_grid(gpu: &GpuInstance, config: PdConfig, steps: u32) -> Vec<SimPosition> {
    let mut store = EntityStore::new();
    // Heavy nodes relative to the spring stiffness keep the Jacobi spectral
    // radius well below the pessimistic 0.99 candidate.
    let mesh = mesh::create_grid(
        &mut store,
        &GridDesc {
            cols: 20,
            rows: 20,
            spacing: 0.05,
            height: 1.0,
            density: 100.0,
            ..Default::default()
        },
    )
    .unwrap();
    let positions = store.get_array::<SimPosition>(mesh).unwrap().to_vec();
    let faces = store
        .get_array::<MeshFace>(mesh)
        .unwrap()
        .to_vec();
    store
        .add_array(mesh, topology::spring_edges(&positions, &faces))
        .unwrap();

    let springs = store.create_entity();
    store
        .add_component(springs, SpringConstraint { stiffness: 200.0 })
        .unwrap();
    let system = store.create_entity();
    store
        .add_component(system, config.with_constraints(&[springs]))
        .unwrap();
    add_params(&mut store, Vector3::new(0.0, -9.81, 0.0), 0.999);

    let mut pipeline = ClothPipeline::new(wgcloth::bundled_shaders());
    for _ in 0..steps {
        pipeline.step(gpu, &mut store).await.unwrap();
    }
    read_positions(gpu, &pipeline).await
}

#[futures_test::test]
#[serial_test::serial]
async fn pd_calibration_beats_a_pessimistic_fixed_rho() {
    let Ok(gpu) = GpuInstance::new().await else {
        return;
    };
    const STEPS: u32 = 15;

    // A highly converged run is the per-step ground truth.
    let reference = run_pd_grid(
        &gpu,
        PdConfig {
            iterations: 300,
            rho: 0.3,
            ..Default::default()
        },
        STEPS,
    )
    .await;
    let calibrated = run_pd_grid(
        &gpu,
        PdConfig {
            iterations: 20,
            rho: 0.0,
            ..Default::default()
        },
        STEPS,
    )
    .await;
    let pessimistic = run_pd_grid(
        &gpu,
        PdConfig {
            iterations: 20,
            rho: 0.99,
            ..Default::default()
        },
        STEPS,
    )
    .await;

    let error = |run: &[SimPosition]| -> f32 {
        run.iter()
            .zip(reference.iter())
            .map(|(a, b)| (a.xyz() - b.xyz()).norm_squared())
            .sum::<f32>()
            .sqrt()
    };
    let calibrated_error = error(&calibrated);
    let pessimistic_error = error(&pessimistic);
    assert!(
        calibrated_error.is_finite() && pessimistic_error.is_finite(),
        "both runs must stay stable"
    );
    assert!(
        calibrated_error < pessimistic_error,
        "calibrated rho (err {calibrated_error}) should converge better than \
         a fixed rho of 0.99 (err {pessimistic_error})"
    );
}

#[futures_test::test]
#[serial_test::serial]
async fn scoped_pd_leaves_other_meshes_untouched() {
    let Ok(gpu) = GpuInstance::new().await else {
        return;
    };
    let mut store = EntityStore::new();

    let bystander = mesh::create_grid(
        &mut store,
        &GridDesc {
            pin_top_corners: false,
            ..GridDesc::square(2, 0.5)
        },
    )
    .unwrap();
    let simulated = mesh::create_grid(
        &mut store,
        &GridDesc {
            pin_top_corners: false,
            height: 2.0,
            ..GridDesc::square(2, 0.5)
        },
    )
    .unwrap();

    let positions = store.get_array::<SimPosition>(simulated).unwrap().to_vec();
    let faces = store
        .get_array::<MeshFace>(simulated)
        .unwrap()
        .to_vec();
    store
        .add_array(simulated, topology::spring_edges(&positions, &faces))
        .unwrap();

    let springs = store.create_entity();
    store
        .add_component(springs, SpringConstraint { stiffness: 100.0 })
        .unwrap();
    let system = store.create_entity();
    store
        .add_component(
            system,
            PdConfig {
                mesh: simulated,
                ..PdConfig::default().with_constraints(&[springs])
            },
        )
        .unwrap();
    add_params(&mut store, Vector3::new(0.0, -9.81, 0.0), 0.999);

    let mut pipeline = ClothPipeline::new(wgcloth::bundled_shaders());
    for _ in 0..10 {
        pipeline.step(&gpu, &mut store).await.unwrap();
    }

    let all = read_positions(&gpu, &pipeline).await;
    let bystander_offset = pipeline
        .mirror()
        .entity_offset::<SimPosition>(bystander)
        .unwrap() as usize;
    let simulated_offset = pipeline
        .mirror()
        .entity_offset::<SimPosition>(simulated)
        .unwrap() as usize;

    let initial = store.get_array::<SimPosition>(bystander).unwrap();
    for (i, p) in initial.iter().enumerate() {
        assert_eq!(
            &all[bystander_offset + i], p,
            "bystander mesh must remain untouched by the scoped solve"
        );
    }
    for (i, p) in all[simulated_offset..simulated_offset + 9].iter().enumerate() {
        assert!(
            p.y < 2.0,
            "scoped node {i} should fall under gravity, y = {}",
            p.y
        );
    }
}
