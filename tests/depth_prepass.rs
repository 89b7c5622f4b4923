use glam::{Mat4, Vec3};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use multipass_backend::renderer::batches::classify_depth_surfaces;
use multipass_backend::renderer::internal::MultiDrawBuffers;
use multipass_backend::renderer::surface::{
    CacheHandle, Coverage, DrawSurface, Material, NoOcclusion, PackedVertexCache, ScreenRect,
    ShaderStage, SortClass, SurfaceGeometry, ViewDef, ViewEntity, DRAW_VERT_SIZE, INDEX_SIZE,
};
use multipass_backend::renderer::{Capabilities, DepthPass, GpuCommand, RecordingDevice};
use multipass_backend::RenderSettings;

fn materials() -> Vec<Material> {
    vec![
        Material::opaque("wall"),
        Material::opaque("glass").with_coverage(Coverage::Translucent),
        Material::opaque("grate")
            .with_coverage(Coverage::Perforated)
            .with_stages(vec![ShaderStage::new(0).alpha_tested(0, 0)]),
        Material::opaque("decal").with_polygon_offset(1.0),
        Material::opaque("mirror").with_sort(SortClass::Subview),
        Material::opaque("sky").with_sort(SortClass::PortalSky),
        Material {
            drawn: false,
            ..Material::opaque("hidden")
        },
    ]
}

fn geometry(slot: u64, static_vertex: bool, static_index: bool) -> SurfaceGeometry {
    SurfaceGeometry {
        num_indexes: 36,
        ambient_cache: Some(CacheHandle::pack(
            static_vertex,
            24 * DRAW_VERT_SIZE,
            slot * 24 * DRAW_VERT_SIZE,
            0,
        )),
        index_cache: Some(CacheHandle::pack(
            static_index,
            36 * INDEX_SIZE,
            slot * 36 * INDEX_SIZE,
            0,
        )),
        ..SurfaceGeometry::default()
    }
}

struct Scene {
    spaces: Vec<ViewEntity>,
    materials: Vec<Material>,
    geometry: Vec<SurfaceGeometry>,
    picks: Vec<(usize, usize, usize)>,
}

impl Scene {
    fn random(rng: &mut SmallRng, count: usize) -> Self {
        let spaces: Vec<ViewEntity> = (0..count)
            .map(|i| {
                let offset = Vec3::new(
                    rng.gen_range(-50.0..50.0),
                    rng.gen_range(-50.0..50.0),
                    rng.gen_range(-50.0..50.0),
                );
                ViewEntity::new(i, Mat4::from_translation(offset))
            })
            .collect();
        let materials = materials();
        let mut geometry: Vec<SurfaceGeometry> = (0..count as u64)
            .map(|slot| geometry(slot, rng.gen_bool(0.6), rng.gen_bool(0.5)))
            .collect();
        // A few surfaces without indexes or without a vertex cache.
        for geo in geometry.iter_mut() {
            match rng.gen_range(0..10) {
                0 => geo.num_indexes = 0,
                1 => geo.ambient_cache = None,
                _ => {}
            }
        }
        let picks = (0..count)
            .map(|i| (i, rng.gen_range(0..materials.len()), i))
            .collect();
        Self {
            spaces,
            materials,
            geometry,
            picks,
        }
    }

    fn surfaces(&self) -> Vec<DrawSurface<'_>> {
        self.picks
            .iter()
            .map(|&(space, material, geometry)| DrawSurface {
                space: &self.spaces[space],
                material: &self.materials[material],
                geometry: &self.geometry[geometry],
                registers: &[1.0],
                scissor: ScreenRect::full(640, 480),
            })
            .collect()
    }
}

#[test]
fn every_surface_is_routed_or_dropped_exactly_once() {
    let mut rng = SmallRng::seed_from_u64(0x5EED);
    for round in 0..50 {
        let count = rng.gen_range(0..40);
        let scene = Scene::random(&mut rng, count);
        let surfaces = scene.surfaces();
        let skip_sky = round % 2 == 0;

        let buckets =
            classify_depth_surfaces(&surfaces, &PackedVertexCache, Vec3::ZERO, skip_sky);

        let mut seen = vec![0usize; count];
        let routed = buckets
            .sub_view
            .iter()
            .chain(&buckets.static_vertex_static_index)
            .chain(&buckets.static_vertex_frame_index)
            .chain(&buckets.frame_vertex_frame_index)
            .chain(&buckets.remaining);
        for &index in routed.chain(buckets.dropped.iter().map(|(index, _)| index)) {
            seen[index] += 1;
        }
        assert!(
            seen.iter().all(|&n| n == 1),
            "round {}: {:?}",
            round,
            seen
        );
        assert_eq!(buckets.routed() + buckets.dropped.len(), count);
    }
}

#[test]
fn fast_path_draws_each_bucketed_surface_once() {
    let mut rng = SmallRng::seed_from_u64(7);
    let scene = Scene::random(&mut rng, 32);
    let surfaces = scene.surfaces();
    let view = ViewDef::new(640, 480, Mat4::IDENTITY);
    let settings = RenderSettings::default();

    let mut device = RecordingDevice::new();
    let mut buffers = MultiDrawBuffers::new(64, 256);
    buffers.init(&mut device);

    let pass = DepthPass {
        view: &view,
        settings: &settings,
        caps: &Capabilities::default(),
        cache: &PackedVertexCache,
        occlusion: &NoOcclusion,
    };
    let mut scissor = view.viewport;
    let stats = pass
        .fill_depth_buffer(&mut device, &mut buffers, &surfaces, &mut scissor)
        .expect("depth pass");

    let buckets = classify_depth_surfaces(
        &surfaces,
        &PackedVertexCache,
        view.view_origin,
        settings.skip_portal_sky,
    );
    let fast = buckets.static_vertex_static_index.len()
        + buckets.static_vertex_frame_index.len()
        + buckets.frame_vertex_frame_index.len();
    assert_eq!(stats.multi_draw_commands, fast);
    assert_eq!(stats.dropped, buckets.dropped.len());
    let commands: usize = device.multi_draws().iter().map(|(_, c)| c.len()).sum();
    assert_eq!(commands, fast);
}

#[test]
fn static_bucket_commands_follow_front_to_back_order() {
    let spaces: Vec<ViewEntity> = [9.0, 2.0, 5.0, 2.0, 7.0]
        .iter()
        .enumerate()
        .map(|(i, &z)| ViewEntity::new(i, Mat4::from_translation(Vec3::new(0.0, 0.0, z))))
        .collect();
    let material = Material::opaque("wall");
    let geometry: Vec<SurfaceGeometry> = (0..5).map(|slot| geometry(slot, true, true)).collect();
    let surfaces: Vec<DrawSurface> = spaces
        .iter()
        .zip(&geometry)
        .map(|(space, geometry)| DrawSurface {
            space,
            material: &material,
            geometry,
            registers: &[1.0],
            scissor: ScreenRect::full(640, 480),
        })
        .collect();

    let view = ViewDef::new(640, 480, Mat4::IDENTITY);
    let settings = RenderSettings::default();
    let mut device = RecordingDevice::new();
    let mut buffers = MultiDrawBuffers::new(16, 256);
    buffers.init(&mut device);
    let pass = DepthPass {
        view: &view,
        settings: &settings,
        caps: &Capabilities::default(),
        cache: &PackedVertexCache,
        occlusion: &NoOcclusion,
    };
    let mut scissor = view.viewport;
    pass.fill_depth_buffer(&mut device, &mut buffers, &surfaces, &mut scissor)
        .expect("depth pass");

    let draws = device.multi_draws();
    assert_eq!(draws.len(), 1);
    // Slot n starts at index 36 * n; ties keep their submission order.
    let slots: Vec<u32> = draws[0].1.iter().map(|c| c.first_index / 36).collect();
    assert_eq!(slots, vec![1, 3, 2, 4, 0]);
    let bases: Vec<u32> = draws[0].1.iter().map(|c| c.base_instance).collect();
    assert_eq!(bases, vec![0, 2, 4, 6, 8]);
}

#[test]
fn large_buckets_split_into_several_multi_draws() {
    let space = ViewEntity::new(0, Mat4::IDENTITY);
    let material = Material::opaque("wall");
    let geometry: Vec<SurfaceGeometry> = (0..10).map(|slot| geometry(slot, false, false)).collect();
    let surfaces: Vec<DrawSurface> = geometry
        .iter()
        .map(|geometry| DrawSurface {
            space: &space,
            material: &material,
            geometry,
            registers: &[1.0],
            scissor: ScreenRect::full(640, 480),
        })
        .collect();

    let view = ViewDef::new(640, 480, Mat4::IDENTITY);
    let settings = RenderSettings::default();
    let mut device = RecordingDevice::new();
    let mut buffers = MultiDrawBuffers::new(4, 256);
    buffers.init(&mut device);
    let pass = DepthPass {
        view: &view,
        settings: &settings,
        caps: &Capabilities::default(),
        cache: &PackedVertexCache,
        occlusion: &NoOcclusion,
    };
    let mut scissor = view.viewport;
    let stats = pass
        .fill_depth_buffer(&mut device, &mut buffers, &surfaces, &mut scissor)
        .expect("depth pass");

    assert_eq!(stats.multi_draws, 3);
    assert_eq!(stats.multi_draw_commands, 10);
    let sizes: Vec<usize> = device.multi_draws().iter().map(|(_, c)| c.len()).collect();
    assert_eq!(sizes, vec![4, 4, 2]);
    // Every chunk restarts its draw ids.
    for (_, commands) in device.multi_draws() {
        assert_eq!(commands[0].base_instance, 0);
    }
}

#[test]
fn occluded_entities_are_skipped_when_culling_is_enabled() {
    let spaces: Vec<ViewEntity> = (0..6).map(|i| ViewEntity::new(i, Mat4::IDENTITY)).collect();
    let material = Material::opaque("wall");
    let grate = Material::opaque("grate").with_coverage(Coverage::Perforated);
    let geometry: Vec<SurfaceGeometry> = (0..6).map(|slot| geometry(slot, true, true)).collect();
    let surfaces: Vec<DrawSurface> = spaces
        .iter()
        .zip(&geometry)
        .enumerate()
        .map(|(i, (space, geometry))| DrawSurface {
            space,
            material: if i == 5 { &grate } else { &material },
            geometry,
            registers: &[1.0],
            scissor: ScreenRect::full(640, 480),
        })
        .collect();

    let view = ViewDef::new(640, 480, Mat4::IDENTITY);
    let settings = RenderSettings {
        use_occlusion_culling: true,
        ..RenderSettings::default()
    };
    let culled = |entity: usize| entity % 2 == 1;
    let mut device = RecordingDevice::new();
    let mut buffers = MultiDrawBuffers::new(16, 256);
    buffers.init(&mut device);
    let pass = DepthPass {
        view: &view,
        settings: &settings,
        caps: &Capabilities::default(),
        cache: &PackedVertexCache,
        occlusion: &culled,
    };
    let mut scissor = view.viewport;
    let stats = pass
        .fill_depth_buffer(&mut device, &mut buffers, &surfaces, &mut scissor)
        .expect("depth pass");

    assert_eq!(stats.occlusion_skipped, 3);
    assert_eq!(stats.multi_draw_commands, 3);
    assert_eq!(stats.generic_draws, 0);
    assert_eq!(
        device.count(|c| matches!(c, GpuCommand::DrawIndexed(_))),
        0
    );
}

#[test]
fn missing_indirect_first_instance_replays_commands_as_direct_draws() {
    let spaces: Vec<ViewEntity> = (0..3).map(|i| ViewEntity::new(i, Mat4::IDENTITY)).collect();
    let material = Material::opaque("wall");
    let geometry: Vec<SurfaceGeometry> = (0..3).map(|slot| geometry(slot, true, true)).collect();
    let surfaces: Vec<DrawSurface> = spaces
        .iter()
        .zip(&geometry)
        .map(|(space, geometry)| DrawSurface {
            space,
            material: &material,
            geometry,
            registers: &[1.0],
            scissor: ScreenRect::full(640, 480),
        })
        .collect();

    let view = ViewDef::new(640, 480, Mat4::IDENTITY);
    let settings = RenderSettings::default();
    let caps = Capabilities {
        indirect_first_instance: false,
        ..Capabilities::default()
    };
    let mut device = RecordingDevice::new();
    let mut buffers = MultiDrawBuffers::new(16, 256);
    buffers.init(&mut device);
    let pass = DepthPass {
        view: &view,
        settings: &settings,
        caps: &caps,
        cache: &PackedVertexCache,
        occlusion: &NoOcclusion,
    };
    let mut scissor = view.viewport;
    let stats = pass
        .fill_depth_buffer(&mut device, &mut buffers, &surfaces, &mut scissor)
        .expect("depth pass");

    assert_eq!(stats.multi_draw_commands, 3);
    assert_eq!(
        device.count(|c| matches!(c, GpuCommand::MultiDrawIndexedIndirect { .. })),
        0
    );
    let draws: Vec<(u32, u32, u32)> = device
        .commands()
        .iter()
        .filter_map(|c| match c {
            GpuCommand::DrawIndexed(draw) => {
                Some((draw.first_index / 36, draw.first_instance, draw.instance_count))
            }
            _ => None,
        })
        .collect();
    // Each surface still reads its own draw id.
    assert_eq!(draws, vec![(0, 0, 2), (1, 2, 2), (2, 4, 2)]);
}
