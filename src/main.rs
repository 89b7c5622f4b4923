use std::collections::BTreeMap;

use glam::{Mat4, Vec3};
use multipass_backend::renderer::device::ImageId;
use multipass_backend::renderer::surface::{
    CacheHandle, Coverage, DrawSurface, Material, NoOcclusion, PackedVertexCache, ScreenRect,
    ShaderStage, ShadowCapBits, ShadowSurface, SortClass, SurfaceGeometry, ViewDef, ViewEntity,
    ViewLight, DRAW_VERT_SIZE, INDEX_SIZE, SHADOW_VERT_SIZE,
};
use multipass_backend::renderer::{Capabilities, GpuCommand, RecordingDevice, Renderer};
use multipass_backend::{init_logging, RenderError, RenderSettings};

const DISPLAY_WIDTH: u32 = 1280;
const DISPLAY_HEIGHT: u32 = 720;
const GRID: usize = 8;
const FRAMES: usize = 3;

/// Entities, materials and cache handles of a small synthetic scene: a grid
/// of boxes, some of them animated (per-frame caches), plus a grate and a
/// mirror.
struct SyntheticScene {
    entities: Vec<ViewEntity>,
    geometry: Vec<SurfaceGeometry>,
    wall: Material,
    grate: Material,
    mirror: Material,
    registers: Vec<f32>,
}

impl SyntheticScene {
    fn new() -> Self {
        let mut entities = Vec::new();
        let mut geometry = Vec::new();
        for i in 0..GRID * GRID {
            let (x, z) = ((i % GRID) as f32, (i / GRID) as f32);
            let translation = Vec3::new(x * 4.0 - 16.0, 0.0, -z * 4.0 - 4.0);
            entities.push(ViewEntity::new(i, Mat4::from_translation(translation)));

            let animated = i % 5 == 0;
            let frame = if animated { 1 } else { 0 };
            let vertex_offset = i as u64 * 24 * DRAW_VERT_SIZE;
            let index_offset = i as u64 * 36 * INDEX_SIZE;
            let shadow_offset = i as u64 * 48 * SHADOW_VERT_SIZE;
            geometry.push(SurfaceGeometry {
                num_indexes: 36,
                ambient_cache: Some(CacheHandle::pack(
                    !animated,
                    24 * DRAW_VERT_SIZE,
                    vertex_offset,
                    frame,
                )),
                index_cache: Some(CacheHandle::pack(!animated, 36 * INDEX_SIZE, index_offset, frame)),
                // Shadow volumes are generated per frame.
                shadow_cache: Some(CacheHandle::pack(false, 48 * SHADOW_VERT_SIZE, shadow_offset, 1)),
                num_shadow_indexes_no_caps: 24,
                num_shadow_indexes_no_front_caps: 30,
                shadow_cap_plane_bits: ShadowCapBits::PLANE_2,
            });
        }

        let grate = Material::opaque("textures/base/grate")
            .with_coverage(Coverage::Perforated)
            .with_stages(vec![ShaderStage::new(0)
                .alpha_tested(0, 1)
                .with_image(ImageId(7))]);
        let mirror = Material::opaque("textures/base/mirror").with_sort(SortClass::Subview);

        Self {
            entities,
            geometry,
            wall: Material::opaque("textures/base/wall"),
            grate,
            mirror,
            registers: vec![1.0, 0.5],
        }
    }

    fn draw_surfaces(&self) -> Vec<DrawSurface<'_>> {
        let full = ScreenRect::full(DISPLAY_WIDTH, DISPLAY_HEIGHT);
        self.entities
            .iter()
            .zip(&self.geometry)
            .enumerate()
            .map(|(i, (space, geometry))| {
                let material = match i {
                    3 => &self.grate,
                    9 => &self.mirror,
                    _ => &self.wall,
                };
                DrawSurface {
                    space,
                    material,
                    geometry,
                    registers: &self.registers,
                    scissor: full,
                }
            })
            .collect()
    }

    fn shadow_surfaces(&self) -> Vec<ShadowSurface<'_>> {
        self.entities
            .iter()
            .zip(&self.geometry)
            .enumerate()
            .map(|(i, (space, geometry))| ShadowSurface {
                space,
                geometry,
                view_inside_shadow: i % 3 == 0,
            })
            .collect()
    }
}

fn command_histogram(commands: &[GpuCommand]) -> BTreeMap<String, usize> {
    let mut histogram = BTreeMap::new();
    for command in commands {
        let text = format!("{:?}", command);
        let name = text
            .split(|c: char| !c.is_alphanumeric())
            .next()
            .unwrap_or_default()
            .to_string();
        *histogram.entry(name).or_insert(0) += 1;
    }
    histogram
}

fn run() -> Result<(), RenderError> {
    let settings = match std::env::args().nth(1) {
        Some(path) => RenderSettings::load_from_path(path),
        None => RenderSettings::load(),
    };
    let caps = Capabilities::from_pci_id(0x10DE);
    let mut renderer = Renderer::new(
        RecordingDevice::new(),
        caps,
        settings,
        DISPLAY_WIDTH,
        DISPLAY_HEIGHT,
    );

    let scene = SyntheticScene::new();
    let projection = Mat4::perspective_rh(60f32.to_radians(), 16.0 / 9.0, 1.0, 4096.0);
    let view = ViewDef {
        view_origin: Vec3::new(0.0, 2.0, 6.0),
        ..ViewDef::new(
            DISPLAY_WIDTH,
            DISPLAY_HEIGHT,
            projection * Mat4::look_at_rh(Vec3::new(0.0, 2.0, 6.0), Vec3::ZERO, Vec3::Y),
        )
    };
    let light = ViewLight {
        global_origin: Vec3::new(0.0, 12.0, -12.0),
        scissor: ScreenRect::new(200, 100, 1000, 600),
        view_inside_light: false,
        view_sees_shadow_plane_bits: ShadowCapBits::PLANE_2,
    };

    let surfaces = scene.draw_surfaces();
    let casters = scene.shadow_surfaces();

    for _ in 0..FRAMES {
        renderer.begin_frame();
        renderer.begin_view(&view);
        renderer.fill_depth_buffer(&view, &surfaces, &PackedVertexCache, &NoOcclusion)?;

        renderer.toggle_shadow(true, true, light.scissor);
        renderer.stencil_shadow_pass(&view, &light, &casters, &PackedVertexCache)?;
        renderer.toggle_shadow(false, false, light.scissor);
        renderer.bind_shadow_textures();

        renderer.copy_color_buffer(&view);
        let stats = renderer.end_frame();
        log::info!("Frame {}: {:?}", renderer.frames(), stats);
    }

    let mut pixels = vec![0u8; (DISPLAY_WIDTH * DISPLAY_HEIGHT * 3) as usize];
    renderer.capture_display(&mut pixels)?;

    let device = renderer.shutdown();
    for (name, count) in command_histogram(device.commands()) {
        log::info!("{:>28}: {}", name, count);
    }
    Ok(())
}

fn main() {
    init_logging();
    if let Err(err) = run() {
        log::error!("Synthetic frame failed: {}", err);
        std::process::exit(1);
    }
}
