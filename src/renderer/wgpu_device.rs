// renderer/wgpu_device.rs
//! [`GpuDevice`] on top of wgpu.
//!
//! The backend speaks in immediate-mode calls while wgpu records whole render
//! passes, so draws are queued as [`PassOp`]s and replayed into a render pass
//! whenever the bound framebuffer changes or something outside a pass (a
//! copy, a read-back, a submit) has to observe the results. Clears become the
//! load operations of the next pass.

use std::collections::{BTreeMap, HashMap};
use std::sync::mpsc;

use glam::Mat4;
use log::{debug, info, warn};
use wgpu::util::DeviceExt;

use crate::renderer::capabilities::Capabilities;
use crate::renderer::device::{
    Attachment, AttachmentPoint, BlendMode, BufferKind, BufferRange, ClearPlanes, CullType,
    DrawState, Filter, FramebufferAttachments, FramebufferId, FramebufferStatus,
    GeometryBinding, GpuDevice, ImageId, IndexedDraw, PixelRect, Program, RenderTarget,
    Residency, StencilState, TargetFormat, TextureDesc, TextureShape, TextureSource,
};
use crate::renderer::error::DeviceError;
use crate::renderer::shadows::STENCIL_CLEAR;

const BACKBUFFER_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;
const DRAW_VERTEX_STRIDE: u64 = 60;
const SHADOW_VERTEX_STRIDE: u64 = 16;
const VIEW_UNIFORM_SIZE: u64 = 2 * 64;

const DRAW_VERTEX_ATTRIBUTES: [wgpu::VertexAttribute; 2] =
    wgpu::vertex_attr_array![0 => Float32x3, 2 => Float32x2];
const SHADOW_VERTEX_ATTRIBUTES: [wgpu::VertexAttribute; 1] =
    wgpu::vertex_attr_array![0 => Float32x4];
const DRAW_ID_ATTRIBUTES: [wgpu::VertexAttribute; 1] = wgpu::vertex_attr_array![1 => Uint32];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum PipelineProgram {
    Scene(Program),
    Present,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PipelineKey {
    program: PipelineProgram,
    color: Option<wgpu::TextureFormat>,
    depth: Option<wgpu::TextureFormat>,
    depth_compare: wgpu::CompareFunction,
    depth_write: bool,
    color_write: bool,
    blend: BlendMode,
    cull: CullType,
    /// Constant units and slope factor bits.
    bias: Option<(i32, u32)>,
    /// Reference value zeroed: it is dynamic pass state.
    stencil: StencilState,
}

impl PipelineKey {
    fn new(program: PipelineProgram, state: &DrawState, formats: AttachmentFormats) -> Self {
        Self {
            program,
            color: formats.color,
            depth: formats.depth,
            depth_compare: state.depth_compare,
            depth_write: state.depth_write,
            color_write: state.color_write,
            blend: state.blend,
            cull: state.cull,
            bias: state
                .polygon_offset
                .map(|offset| (offset.units as i32, offset.factor.to_bits())),
            stencil: StencilState {
                reference: 0,
                ..state.stencil
            },
        }
    }

    /// Fullscreen copies ignore the scene state entirely.
    fn present(formats: AttachmentFormats) -> Self {
        let state = DrawState {
            depth_compare: wgpu::CompareFunction::Always,
            depth_write: false,
            cull: CullType::TwoSided,
            ..DrawState::default()
        };
        Self::new(PipelineProgram::Present, &state, formats)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AttachmentFormats {
    color: Option<wgpu::TextureFormat>,
    depth: Option<wgpu::TextureFormat>,
}

/// Shader modules, layouts and the render pipelines built from them.
struct PipelineLibrary {
    view_layout: wgpu::BindGroupLayout,
    storage_layout: wgpu::BindGroupLayout,
    uniform_layout: wgpu::BindGroupLayout,
    texture_layout: wgpu::BindGroupLayout,
    multi_draw_layout: wgpu::PipelineLayout,
    generic_layout: wgpu::PipelineLayout,
    present_layout: wgpu::PipelineLayout,
    depth_fast: wgpu::ShaderModule,
    depth_generic: wgpu::ShaderModule,
    stencil_shadow: wgpu::ShaderModule,
    present: wgpu::ShaderModule,
    linear_sampler: wgpu::Sampler,
    nearest_sampler: wgpu::Sampler,
    white: wgpu::TextureView,
    pipelines: HashMap<PipelineKey, wgpu::RenderPipeline>,
}

impl PipelineLibrary {
    fn new(device: &wgpu::Device, queue: &wgpu::Queue) -> Self {
        let view_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("ViewBindGroupLayout"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: wgpu::BufferSize::new(VIEW_UNIFORM_SIZE),
                },
                count: None,
            }],
        });
        let storage_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("MultiDrawStorageLayout"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Storage { read_only: true },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            }],
        });
        let uniform_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("DrawUniformLayout"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            }],
        });
        let texture_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("TextureBindGroupLayout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });

        let multi_draw_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("MultiDrawPipelineLayout"),
            bind_group_layouts: &[&view_layout, &storage_layout],
            push_constant_ranges: &[],
        });
        let generic_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("DepthGenericPipelineLayout"),
            bind_group_layouts: &[&view_layout, &uniform_layout, &texture_layout],
            push_constant_ranges: &[],
        });
        let present_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("PresentPipelineLayout"),
            bind_group_layouts: &[&texture_layout],
            push_constant_ranges: &[],
        });

        let shader = |label: &str, source: &'static str| {
            device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(label),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            })
        };
        let depth_fast = shader("DepthFastShader", include_str!("../shader/depth_fast.wgsl"));
        let depth_generic = shader(
            "DepthGenericShader",
            include_str!("../shader/depth_generic.wgsl"),
        );
        let stencil_shadow = shader(
            "StencilShadowShader",
            include_str!("../shader/stencil_shadow.wgsl"),
        );
        let present = shader("PresentShader", include_str!("../shader/present.wgsl"));

        let sampler = |label: &str, filter: wgpu::FilterMode| {
            device.create_sampler(&wgpu::SamplerDescriptor {
                label: Some(label),
                address_mode_u: wgpu::AddressMode::Repeat,
                address_mode_v: wgpu::AddressMode::Repeat,
                address_mode_w: wgpu::AddressMode::Repeat,
                mag_filter: filter,
                min_filter: filter,
                mipmap_filter: filter,
                ..Default::default()
            })
        };
        let linear_sampler = sampler("LinearSampler", wgpu::FilterMode::Linear);
        let nearest_sampler = sampler("NearestSampler", wgpu::FilterMode::Nearest);

        // Stages without an image sample plain white.
        let white_texture = device.create_texture_with_data(
            queue,
            &wgpu::TextureDescriptor {
                label: Some("WhiteTexture"),
                size: wgpu::Extent3d {
                    width: 1,
                    height: 1,
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: wgpu::TextureFormat::Rgba8Unorm,
                usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
                view_formats: &[],
            },
            wgpu::util::TextureDataOrder::LayerMajor,
            &[255, 255, 255, 255],
        );
        let white = white_texture.create_view(&wgpu::TextureViewDescriptor::default());

        Self {
            view_layout,
            storage_layout,
            uniform_layout,
            texture_layout,
            multi_draw_layout,
            generic_layout,
            present_layout,
            depth_fast,
            depth_generic,
            stencil_shadow,
            present,
            linear_sampler,
            nearest_sampler,
            white,
            pipelines: HashMap::new(),
        }
    }

    fn get(&mut self, device: &wgpu::Device, key: &PipelineKey) -> wgpu::RenderPipeline {
        if let Some(pipeline) = self.pipelines.get(key) {
            return pipeline.clone();
        }
        debug!("Building render pipeline {:?}", key);
        let pipeline = self.build(device, key);
        self.pipelines.insert(*key, pipeline.clone());
        pipeline
    }

    fn build(&self, device: &wgpu::Device, key: &PipelineKey) -> wgpu::RenderPipeline {
        let draw_vertex = wgpu::VertexBufferLayout {
            array_stride: DRAW_VERTEX_STRIDE,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &DRAW_VERTEX_ATTRIBUTES,
        };
        let shadow_vertex = wgpu::VertexBufferLayout {
            array_stride: SHADOW_VERTEX_STRIDE,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &SHADOW_VERTEX_ATTRIBUTES,
        };
        let draw_id = wgpu::VertexBufferLayout {
            array_stride: std::mem::size_of::<u32>() as u64,
            step_mode: wgpu::VertexStepMode::Instance,
            attributes: &DRAW_ID_ATTRIBUTES,
        };

        let (label, module, layout, buffers) = match key.program {
            PipelineProgram::Scene(Program::DepthFastMultiDraw) => (
                "DepthFastMultiDraw",
                &self.depth_fast,
                &self.multi_draw_layout,
                vec![draw_vertex, draw_id],
            ),
            PipelineProgram::Scene(Program::DepthGeneric) => (
                "DepthGeneric",
                &self.depth_generic,
                &self.generic_layout,
                vec![draw_vertex],
            ),
            PipelineProgram::Scene(Program::StencilShadowMultiDraw) => (
                "StencilShadowMultiDraw",
                &self.stencil_shadow,
                &self.multi_draw_layout,
                vec![shadow_vertex, draw_id],
            ),
            PipelineProgram::Present => {
                ("Present", &self.present, &self.present_layout, Vec::new())
            }
        };

        let blend = match key.blend {
            BlendMode::Opaque => None,
            BlendMode::ModulateDestination => {
                let component = wgpu::BlendComponent {
                    src_factor: wgpu::BlendFactor::Dst,
                    dst_factor: wgpu::BlendFactor::Zero,
                    operation: wgpu::BlendOperation::Add,
                };
                Some(wgpu::BlendState {
                    color: component,
                    alpha: component,
                })
            }
        };
        let targets: Vec<Option<wgpu::ColorTargetState>> = key
            .color
            .map(|format| wgpu::ColorTargetState {
                format,
                blend,
                write_mask: if key.color_write {
                    wgpu::ColorWrites::ALL
                } else {
                    wgpu::ColorWrites::empty()
                },
            })
            .into_iter()
            .map(Some)
            .collect();

        let depth_stencil = key.depth.map(|format| {
            let (constant, slope_scale) = key
                .bias
                .map(|(units, factor)| (units, f32::from_bits(factor)))
                .unwrap_or((0, 0.0));
            wgpu::DepthStencilState {
                format,
                depth_write_enabled: key.depth_write && format.has_depth_aspect(),
                depth_compare: key.depth_compare,
                stencil: if format.has_stencil_aspect() {
                    key.stencil.to_wgpu()
                } else {
                    wgpu::StencilState::default()
                },
                bias: wgpu::DepthBiasState {
                    constant,
                    slope_scale,
                    clamp: 0.0,
                },
            }
        });

        device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some(label),
            layout: Some(layout),
            vertex: wgpu::VertexState {
                module,
                entry_point: Some("vs_main"),
                buffers: &buffers,
                compilation_options: Default::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module,
                entry_point: Some("fs_main"),
                targets: &targets,
                compilation_options: Default::default(),
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                front_face: wgpu::FrontFace::Ccw,
                cull_mode: key.cull.cull_face(),
                ..Default::default()
            },
            depth_stencil,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        })
    }
}

#[derive(Clone)]
struct TargetTexture {
    texture: wgpu::Texture,
    desc: TextureDesc,
    format: wgpu::TextureFormat,
}

struct VertexCacheBuffers {
    vertices: wgpu::Buffer,
    indices: wgpu::Buffer,
}

enum DrawCall {
    Indexed(IndexedDraw),
    Indirect {
        buffer: wgpu::Buffer,
        offset: u64,
        count: u32,
    },
    Fullscreen,
}

struct DrawOp {
    pipeline: wgpu::RenderPipeline,
    bind_groups: Vec<wgpu::BindGroup>,
    vertex_buffers: Vec<(wgpu::Buffer, u64)>,
    index_buffer: Option<wgpu::Buffer>,
    stencil_reference: u32,
    call: DrawCall,
}

enum PassOp {
    Viewport(PixelRect),
    Scissor(PixelRect),
    Draw(DrawOp),
}

/// Attachments of the bound framebuffer as seen by a render pass.
struct PassTargets {
    color: Option<(wgpu::TextureView, wgpu::TextureFormat)>,
    depth: Option<(wgpu::TextureView, wgpu::TextureFormat)>,
    extent: (u32, u32),
}

struct PackReadback {
    buffer: wgpu::Buffer,
    layout: ReadbackLayout,
    mapped: mpsc::Receiver<Result<(), wgpu::BufferAsyncError>>,
}

/// Where the clipped copy of a read-back rectangle lands in the caller's
/// tightly packed RGB8 output.
#[derive(Debug, Clone, Copy)]
struct ReadbackLayout {
    /// Size of the clipped copy.
    width: u32,
    height: u32,
    /// Bytes per row of the copy buffer.
    padded_row: u32,
    format: wgpu::TextureFormat,
    /// Width of the requested rectangle; the output row stride.
    dst_width: u32,
    dst_height: u32,
    /// Offset of the clipped copy inside the requested rectangle.
    dst_x: u32,
    dst_y: u32,
}

impl ReadbackLayout {
    /// `clipped` is the top-left rectangle `flip_rect` produced for `rect`.
    fn new(
        rect: PixelRect,
        clipped: (u32, u32, u32, u32),
        extent: (u32, u32),
        format: wgpu::TextureFormat,
    ) -> Self {
        let (x, top, width, height) = clipped;
        let bottom = extent.1 - (top + height);
        Self {
            width,
            height,
            padded_row: padded_row(width),
            format,
            dst_width: rect.width.max(0) as u32,
            dst_height: rect.height.max(0) as u32,
            dst_x: (x as i32 - rect.x).max(0) as u32,
            dst_y: (bottom as i32 - rect.y).max(0) as u32,
        }
    }

    /// Bytes the requested rectangle takes as RGB8.
    fn output_size(&self) -> u64 {
        self.dst_width as u64 * self.dst_height as u64 * 3
    }

    /// Rows come back top-down, RGB8 output is bottom-up. Pixels of the
    /// request outside the source are left black.
    fn write_rgb(&self, data: &[u8], dst: &mut [u8]) {
        let width = self.width as usize;
        let height = self.height as usize;
        let stride = self.dst_width as usize * 3;
        let filled = (self.output_size() as usize).min(dst.len());
        dst[..filled].fill(0);
        for row in 0..height {
            let src_row = &data[(height - 1 - row) * self.padded_row as usize..];
            let dst_row = (self.dst_y as usize + row) * stride + self.dst_x as usize * 3;
            for column in 0..width {
                let out = dst_row + column * 3;
                if out + 3 > dst.len() {
                    return;
                }
                let texel = &src_row[column * 4..column * 4 + 4];
                dst[out..out + 3].copy_from_slice(&texel_to_rgb(self.format, texel));
            }
        }
    }
}

fn texel_to_rgb(format: wgpu::TextureFormat, texel: &[u8]) -> [u8; 3] {
    match format {
        wgpu::TextureFormat::Rgb10a2Unorm => {
            let packed = u32::from_le_bytes([texel[0], texel[1], texel[2], texel[3]]);
            [
                ((packed & 0x3FF) >> 2) as u8,
                (((packed >> 10) & 0x3FF) >> 2) as u8,
                (((packed >> 20) & 0x3FF) >> 2) as u8,
            ]
        }
        _ => [texel[0], texel[1], texel[2]],
    }
}

/// Converts a bottom-left rectangle into a top-left one clipped to `extent`.
fn flip_rect(rect: PixelRect, extent: (u32, u32)) -> Option<(u32, u32, u32, u32)> {
    let (width, height) = (extent.0 as i32, extent.1 as i32);
    let x0 = rect.x.clamp(0, width);
    let x1 = (rect.x + rect.width).clamp(0, width);
    let top = (height - (rect.y + rect.height)).clamp(0, height);
    let bottom = (height - rect.y).clamp(0, height);
    if x1 <= x0 || bottom <= top {
        return None;
    }
    Some((x0 as u32, top as u32, (x1 - x0) as u32, (bottom - top) as u32))
}

fn padded_row(width: u32) -> u32 {
    let unpadded = width * 4;
    let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
    unpadded.div_ceil(align) * align
}

pub struct WgpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    caps: Capabilities,
    depth_stencil_format: wgpu::TextureFormat,
    backbuffer: TargetTexture,
    backbuffer_depth: TargetTexture,
    library: PipelineLibrary,

    textures: BTreeMap<RenderTarget, TargetTexture>,
    framebuffers: BTreeMap<FramebufferId, FramebufferAttachments>,
    next_framebuffer: u32,
    bound: Option<FramebufferId>,
    buffers: BTreeMap<BufferKind, wgpu::Buffer>,
    pack_size: Option<u64>,
    pack: Option<PackReadback>,
    vertex_caches: HashMap<Residency, VertexCacheBuffers>,
    images: HashMap<ImageId, wgpu::TextureView>,

    texture_units: BTreeMap<u32, TextureSource>,
    program: Option<Program>,
    state: DrawState,
    geometry: Option<GeometryBinding>,
    view_bind_group: Option<wgpu::BindGroup>,
    storage: Option<BufferRange>,
    uniforms: Option<wgpu::Buffer>,
    viewport: Option<PixelRect>,
    scissor: Option<PixelRect>,

    pending_clear: ClearPlanes,
    ops: Vec<PassOp>,
    encoder: Option<wgpu::CommandEncoder>,
    debug_groups: Vec<String>,
    errors: Vec<String>,
}

impl WgpuDevice {
    /// Creates a device that renders into an offscreen backbuffer of
    /// `width` × `height`.
    pub fn new_headless(width: u32, height: u32) -> Result<Self, DeviceError> {
        pollster::block_on(Self::new_headless_async(width, height))
    }

    pub async fn new_headless_async(width: u32, height: u32) -> Result<Self, DeviceError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map_err(|_| DeviceError::NoAdapter)?;

        let caps = Capabilities::from_adapter(&adapter);
        let wanted = wgpu::Features::INDIRECT_FIRST_INSTANCE
            | wgpu::Features::DEPTH32FLOAT_STENCIL8;
        let required_features = adapter.features() & wanted;

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("MultipassBackendDevice"),
                required_features,
                required_limits: adapter.limits(),
                experimental_features: wgpu::ExperimentalFeatures::disabled(),
                memory_hints: wgpu::MemoryHints::Performance,
                trace: wgpu::Trace::Off,
            })
            .await
            .map_err(|err| DeviceError::RequestDevice(err.to_string()))?;

        // Depth24Plus variants cannot be copied, which the shadow framebuffer
        // relies on.
        let depth_stencil_format =
            if required_features.contains(wgpu::Features::DEPTH32FLOAT_STENCIL8) {
                wgpu::TextureFormat::Depth32FloatStencil8
            } else {
                warn!("Depth32FloatStencil8 unavailable; depth copies will fail");
                wgpu::TextureFormat::Depth24PlusStencil8
            };

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let library = PipelineLibrary::new(&device, &queue);
        let backbuffer = Self::create_target(
            &device,
            "Backbuffer",
            TextureDesc::d2(width, height, TargetFormat::Rgba8),
            BACKBUFFER_FORMAT,
        );
        let backbuffer_depth = Self::create_target(
            &device,
            "BackbufferDepth",
            TextureDesc::d2(width, height, TargetFormat::Depth24Stencil8),
            depth_stencil_format,
        );
        info!("Created headless wgpu device with a {}x{} backbuffer", width, height);

        Ok(Self {
            device,
            queue,
            caps,
            depth_stencil_format,
            backbuffer,
            backbuffer_depth,
            library,
            textures: BTreeMap::new(),
            framebuffers: BTreeMap::new(),
            next_framebuffer: 1,
            bound: None,
            buffers: BTreeMap::new(),
            pack_size: None,
            pack: None,
            vertex_caches: HashMap::new(),
            images: HashMap::new(),
            texture_units: BTreeMap::new(),
            program: None,
            state: DrawState::default(),
            geometry: None,
            view_bind_group: None,
            storage: None,
            uniforms: None,
            viewport: None,
            scissor: None,
            pending_clear: ClearPlanes::empty(),
            ops: Vec::new(),
            encoder: None,
            debug_groups: Vec::new(),
            errors: Vec::new(),
        })
    }

    pub fn capabilities(&self) -> Capabilities {
        self.caps
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// The offscreen image the default framebuffer renders into.
    pub fn backbuffer(&self) -> &wgpu::Texture {
        &self.backbuffer.texture
    }

    /// Replaces the vertex and index storage addressed by cache handles of
    /// the given residency.
    pub fn upload_vertex_cache(&mut self, residency: Residency, vertices: &[u8], indices: &[u8]) {
        let label = match residency {
            Residency::Static => "StaticVertexCache",
            Residency::Frame => "FrameVertexCache",
        };
        let vertices = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents: vertices,
                usage: wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_DST,
            });
        let indices = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents: indices,
                usage: wgpu::BufferUsages::INDEX | wgpu::BufferUsages::COPY_DST,
            });
        self.vertex_caches
            .insert(residency, VertexCacheBuffers { vertices, indices });
    }

    /// Makes a material image available to [`TextureSource::Image`].
    pub fn register_image(&mut self, id: ImageId, texture: &wgpu::Texture) {
        self.images
            .insert(id, texture.create_view(&wgpu::TextureViewDescriptor::default()));
    }

    fn create_target(
        device: &wgpu::Device,
        label: &str,
        desc: TextureDesc,
        format: wgpu::TextureFormat,
    ) -> TargetTexture {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: wgpu::Extent3d {
                width: desc.width.max(1),
                height: desc.height.max(1),
                depth_or_array_layers: desc.shape.layers(),
            },
            mip_level_count: desc.mip_levels.max(1),
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_SRC
                | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        TargetTexture {
            texture,
            desc,
            format,
        }
    }

    fn wgpu_format(&self, format: TargetFormat) -> wgpu::TextureFormat {
        match format {
            TargetFormat::Depth24Stencil8 => self.depth_stencil_format,
            other => other.to_wgpu(),
        }
    }

    fn encoder(&mut self) -> &mut wgpu::CommandEncoder {
        let device = &self.device;
        self.encoder.get_or_insert_with(|| {
            device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("MultipassEncoder"),
            })
        })
    }

    /// Texture and mip level behind an attachment point of the bound
    /// framebuffer.
    fn attachment_texture(&self, attachment: Option<Attachment>) -> Option<(&TargetTexture, u32)> {
        let attachment = attachment?;
        self.textures
            .get(&attachment.target)
            .map(|texture| (texture, attachment.level))
    }

    fn bound_color(&self) -> Option<(&TargetTexture, u32)> {
        match self.bound {
            None => Some((&self.backbuffer, 0)),
            Some(id) => self
                .framebuffers
                .get(&id)
                .and_then(|fb| self.attachment_texture(fb.color)),
        }
    }

    fn bound_depth(&self) -> Option<(&TargetTexture, u32)> {
        match self.bound {
            None => Some((&self.backbuffer_depth, 0)),
            Some(id) => self
                .framebuffers
                .get(&id)
                .and_then(|fb| self.attachment_texture(fb.depth_stencil.or(fb.depth))),
        }
    }

    fn attachment_formats(&self) -> AttachmentFormats {
        AttachmentFormats {
            color: self.bound_color().map(|(texture, _)| texture.format),
            depth: self.bound_depth().map(|(texture, _)| texture.format),
        }
    }

    fn pass_targets(&self) -> PassTargets {
        let level_view = |(texture, level): (&TargetTexture, u32)| {
            let view = texture.texture.create_view(&wgpu::TextureViewDescriptor {
                label: Some(attachment_label(texture.desc.format)),
                dimension: Some(wgpu::TextureViewDimension::D2),
                base_mip_level: level,
                mip_level_count: Some(1),
                base_array_layer: 0,
                array_layer_count: Some(1),
                ..Default::default()
            });
            (view, texture.format, texture.desc.mip_extent(level))
        };
        let color = self.bound_color().map(level_view);
        let depth = self.bound_depth().map(level_view);
        let extent = color
            .as_ref()
            .or(depth.as_ref())
            .map(|(_, _, extent)| *extent)
            .unwrap_or((1, 1));
        PassTargets {
            color: color.map(|(view, format, _)| (view, format)),
            depth: depth.map(|(view, format, _)| (view, format)),
            extent,
        }
    }

    /// Starts a pass worth of ops with the current dynamic state, which wgpu
    /// resets at every pass boundary.
    fn begin_ops(&mut self) {
        if !self.ops.is_empty() {
            return;
        }
        if let Some(viewport) = self.viewport {
            self.ops.push(PassOp::Viewport(viewport));
        }
        if let Some(scissor) = self.scissor {
            self.ops.push(PassOp::Scissor(scissor));
        }
    }

    /// Replays the queued ops into one render pass on the bound framebuffer.
    fn flush_pass(&mut self) {
        let has_draws = self.ops.iter().any(|op| matches!(op, PassOp::Draw(_)));
        if !has_draws && self.pending_clear.is_empty() {
            self.ops.clear();
            return;
        }
        if let Some(id) = self.bound {
            if self.framebuffer_status(id) != FramebufferStatus::Complete {
                self.errors
                    .push(format!("render pass on incomplete framebuffer {:?}", id));
                self.ops.clear();
                self.pending_clear = ClearPlanes::empty();
                return;
            }
        }

        let ops = std::mem::take(&mut self.ops);
        let clear = std::mem::take(&mut self.pending_clear);
        let targets = self.pass_targets();
        let label = self.debug_groups.join("/");
        let extent = targets.extent;

        let color_attachments: Vec<Option<wgpu::RenderPassColorAttachment>> = targets
            .color
            .as_ref()
            .map(|(view, _)| wgpu::RenderPassColorAttachment {
                view,
                depth_slice: None,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: if clear.contains(ClearPlanes::COLOR) {
                        wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT)
                    } else {
                        wgpu::LoadOp::Load
                    },
                    store: wgpu::StoreOp::Store,
                },
            })
            .into_iter()
            .map(Some)
            .collect();
        let depth_stencil_attachment =
            targets
                .depth
                .as_ref()
                .map(|(view, format)| wgpu::RenderPassDepthStencilAttachment {
                    view,
                    depth_ops: format.has_depth_aspect().then(|| wgpu::Operations {
                        load: if clear.contains(ClearPlanes::DEPTH) {
                            wgpu::LoadOp::Clear(1.0)
                        } else {
                            wgpu::LoadOp::Load
                        },
                        store: wgpu::StoreOp::Store,
                    }),
                    stencil_ops: format.has_stencil_aspect().then(|| wgpu::Operations {
                        load: if clear.contains(ClearPlanes::STENCIL) {
                            wgpu::LoadOp::Clear(STENCIL_CLEAR)
                        } else {
                            wgpu::LoadOp::Load
                        },
                        store: wgpu::StoreOp::Store,
                    }),
                });

        let encoder = self.encoder();
        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: (!label.is_empty()).then_some(label.as_str()),
            color_attachments: &color_attachments,
            depth_stencil_attachment,
            timestamp_writes: None,
            occlusion_query_set: None,
        });

        for op in &ops {
            match op {
                PassOp::Viewport(rect) => {
                    if let Some((x, y, width, height)) = flip_rect(*rect, extent) {
                        pass.set_viewport(
                            x as f32,
                            y as f32,
                            width as f32,
                            height as f32,
                            0.0,
                            1.0,
                        );
                    }
                }
                PassOp::Scissor(rect) => {
                    let (x, y, width, height) =
                        flip_rect(*rect, extent).unwrap_or((0, 0, 0, 0));
                    pass.set_scissor_rect(x, y, width, height);
                }
                PassOp::Draw(draw) => {
                    pass.set_pipeline(&draw.pipeline);
                    pass.set_stencil_reference(draw.stencil_reference);
                    for (index, group) in draw.bind_groups.iter().enumerate() {
                        pass.set_bind_group(index as u32, group, &[]);
                    }
                    for (slot, (buffer, offset)) in draw.vertex_buffers.iter().enumerate() {
                        pass.set_vertex_buffer(slot as u32, buffer.slice(*offset..));
                    }
                    if let Some(indices) = &draw.index_buffer {
                        pass.set_index_buffer(indices.slice(..), wgpu::IndexFormat::Uint32);
                    }
                    match &draw.call {
                        DrawCall::Indexed(indexed) => pass.draw_indexed(
                            indexed.first_index..indexed.first_index + indexed.index_count,
                            indexed.base_vertex,
                            indexed.first_instance
                                ..indexed.first_instance + indexed.instance_count,
                        ),
                        DrawCall::Indirect {
                            buffer,
                            offset,
                            count,
                        } => pass.multi_draw_indexed_indirect(buffer, *offset, *count),
                        DrawCall::Fullscreen => pass.draw(0..3, 0..1),
                    }
                }
            }
        }
    }

    fn submit_encoder(&mut self) {
        self.flush_pass();
        if let Some(encoder) = self.encoder.take() {
            self.queue.submit(std::iter::once(encoder.finish()));
        }
    }

    fn wait_idle(&mut self) {
        if let Err(err) = self.device.poll(wgpu::PollType::wait_indefinitely()) {
            self.errors.push(format!("device poll failed: {}", err));
        }
    }

    fn source_view(&mut self, source: TextureSource) -> (wgpu::TextureView, Filter) {
        match source {
            TextureSource::Image(id) => match self.images.get(&id) {
                Some(view) => (view.clone(), Filter::Linear),
                None => {
                    warn!("Image {:?} is not registered; sampling white", id);
                    (self.library.white.clone(), Filter::Linear)
                }
            },
            TextureSource::Target { target, aspect } => {
                let sampled = self
                    .textures
                    .get(&target)
                    .filter(|texture| {
                        texture.desc.shape == TextureShape::D2 && texture.desc.format.is_color()
                    })
                    .map(|texture| {
                        let view = texture.texture.create_view(&wgpu::TextureViewDescriptor {
                            aspect,
                            ..Default::default()
                        });
                        (view, texture.desc.filter)
                    });
                sampled.unwrap_or_else(|| {
                    self.errors.push(format!(
                        "{} cannot be sampled as a colour image",
                        target.label()
                    ));
                    (self.library.white.clone(), Filter::Linear)
                })
            }
        }
    }

    fn texture_bind_group(&mut self, source: Option<TextureSource>) -> wgpu::BindGroup {
        let (view, filter) = match source {
            Some(source) => self.source_view(source),
            None => (self.library.white.clone(), Filter::Linear),
        };
        let sampler = match filter {
            Filter::Linear => &self.library.linear_sampler,
            Filter::Nearest => &self.library.nearest_sampler,
        };
        self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("TextureBindGroup"),
            layout: &self.library.texture_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(sampler),
                },
            ],
        })
    }

    fn storage_bind_group(&self) -> Option<wgpu::BindGroup> {
        let range = self.storage?;
        let buffer = self.buffers.get(&BufferKind::Storage)?;
        Some(self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("MultiDrawStorageBindGroup"),
            layout: &self.library.storage_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                    buffer,
                    offset: range.offset,
                    size: wgpu::BufferSize::new(range.size),
                }),
            }],
        }))
    }

    fn uniform_bind_group(&self) -> Option<wgpu::BindGroup> {
        let buffer = self.uniforms.as_ref()?;
        Some(self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("DrawUniformBindGroup"),
            layout: &self.library.uniform_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: buffer.as_entire_binding(),
            }],
        }))
    }

    /// Resolves everything a scene draw needs from the current bindings.
    fn record_draw(&mut self, call: DrawCall) -> Result<(), DeviceError> {
        let program = self.program.ok_or(DeviceError::IncompleteDraw("a program"))?;
        let binding = self
            .geometry
            .ok_or(DeviceError::IncompleteDraw("bound geometry"))?;
        let view = self
            .view_bind_group
            .clone()
            .ok_or(DeviceError::IncompleteDraw("a view projection"))?;
        let cache = self
            .vertex_caches
            .get(&binding.vertex)
            .ok_or(DeviceError::IncompleteDraw("a vertex cache"))?;
        let vertices = cache.vertices.clone();
        let indices = self
            .vertex_caches
            .get(&binding.index)
            .ok_or(DeviceError::IncompleteDraw("an index cache"))?
            .indices
            .clone();

        let mut vertex_buffers = vec![(vertices, 0)];
        let bind_groups = match program {
            Program::DepthFastMultiDraw | Program::StencilShadowMultiDraw => {
                let draw_ids = self
                    .buffers
                    .get(&BufferKind::DrawId)
                    .ok_or(DeviceError::IncompleteDraw("the draw-id stream"))?;
                vertex_buffers.push((draw_ids.clone(), 0));
                let storage = self
                    .storage_bind_group()
                    .ok_or(DeviceError::IncompleteDraw("bound storage"))?;
                vec![view, storage]
            }
            Program::DepthGeneric => {
                let uniforms = self
                    .uniform_bind_group()
                    .ok_or(DeviceError::IncompleteDraw("a uniform block"))?;
                let texture = self.texture_bind_group(self.texture_units.get(&0).copied());
                vec![view, uniforms, texture]
            }
        };

        let key = PipelineKey::new(
            PipelineProgram::Scene(program),
            &self.state,
            self.attachment_formats(),
        );
        let pipeline = self.library.get(&self.device, &key);
        self.begin_ops();
        self.ops.push(PassOp::Draw(DrawOp {
            pipeline,
            bind_groups,
            vertex_buffers,
            index_buffer: Some(indices),
            stencil_reference: self.state.stencil.reference,
            call,
        }));
        Ok(())
    }

    /// Copies `rect` of the bound colour attachment into a mappable buffer.
    fn encode_readback(&mut self, rect: PixelRect) -> Option<(wgpu::Buffer, ReadbackLayout)> {
        self.flush_pass();
        let bound = self
            .bound_color()
            .map(|(texture, level)| (texture.clone(), level));
        let Some((texture, level)) = bound else {
            self.errors
                .push("read-back from a framebuffer without colour".into());
            return None;
        };
        let extent = texture.desc.mip_extent(level);
        let clipped = flip_rect(rect, extent)?;
        let (x, y, width, height) = clipped;
        let layout = ReadbackLayout::new(rect, clipped, extent, texture.format);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("ReadbackBuffer"),
            size: layout.padded_row as u64 * height as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        self.encoder().copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &texture.texture,
                mip_level: level,
                origin: wgpu::Origin3d { x, y, z: 0 },
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &buffer,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(layout.padded_row),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        self.submit_encoder();
        Some((buffer, layout))
    }

    fn map_readback(
        &mut self,
        buffer: &wgpu::Buffer,
        layout: &ReadbackLayout,
        mapped: mpsc::Receiver<Result<(), wgpu::BufferAsyncError>>,
        dst: &mut [u8],
    ) -> Result<(), DeviceError> {
        let result = match mapped.try_recv() {
            Ok(result) => result,
            Err(_) => {
                self.wait_idle();
                mapped
                    .recv()
                    .map_err(|err| DeviceError::Readback(err.to_string()))?
            }
        };
        result.map_err(|err| DeviceError::Readback(err.to_string()))?;

        {
            let data = buffer.slice(..).get_mapped_range();
            layout.write_rgb(&data, dst);
        }
        buffer.unmap();
        Ok(())
    }
}

fn start_map(buffer: &wgpu::Buffer) -> mpsc::Receiver<Result<(), wgpu::BufferAsyncError>> {
    let (tx, rx) = mpsc::channel();
    buffer
        .slice(..)
        .map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
    rx
}

fn attachment_label(format: TargetFormat) -> &'static str {
    match format {
        TargetFormat::Rgba8 | TargetFormat::Rgb5A1 => "ColorAttachment",
        TargetFormat::Stencil8 => "StencilAttachment",
        _ => "DepthAttachment",
    }
}

impl GpuDevice for WgpuDevice {
    fn allocate_texture(&mut self, target: RenderTarget, desc: &TextureDesc) {
        self.flush_pass();
        let format = self.wgpu_format(desc.format);
        let texture = Self::create_target(&self.device, target.label(), *desc, format);
        self.textures.insert(target, texture);
    }

    fn generate_mipmaps(&mut self, target: RenderTarget) {
        // Render targets have every level drawn into directly.
        if !self.textures.contains_key(&target) {
            self.errors
                .push(format!("mipmaps requested for missing {}", target.label()));
        }
    }

    fn create_framebuffer(&mut self) -> FramebufferId {
        let id = FramebufferId(self.next_framebuffer);
        self.next_framebuffer += 1;
        self.framebuffers.insert(id, FramebufferAttachments::default());
        id
    }

    fn delete_framebuffer(&mut self, framebuffer: FramebufferId) {
        if self.bound == Some(framebuffer) {
            self.flush_pass();
            self.bound = None;
        }
        self.framebuffers.remove(&framebuffer);
    }

    fn attach(
        &mut self,
        framebuffer: FramebufferId,
        point: AttachmentPoint,
        attachment: Option<Attachment>,
    ) {
        if self.bound == Some(framebuffer) {
            self.flush_pass();
        }
        match self.framebuffers.get_mut(&framebuffer) {
            Some(attachments) => attachments.set(point, attachment),
            None => self
                .errors
                .push(format!("attach to unknown framebuffer {:?}", framebuffer)),
        }
    }

    fn framebuffer_status(&mut self, framebuffer: FramebufferId) -> FramebufferStatus {
        let Some(attachments) = self.framebuffers.get(&framebuffer) else {
            return FramebufferStatus::MissingAttachment;
        };
        // wgpu render passes take one combined depth-stencil view of a 2D
        // image.
        let cube_attached = attachments.iter().any(|(_, attachment)| {
            self.textures
                .get(&attachment.target)
                .is_some_and(|texture| texture.desc.shape == TextureShape::Cube)
        });
        if attachments.stencil.is_some()
            || (attachments.depth.is_some() && attachments.depth_stencil.is_some())
            || cube_attached
        {
            return FramebufferStatus::Unsupported;
        }
        attachments.validate(|target| self.textures.get(&target).map(|texture| texture.desc))
    }

    fn bind_framebuffer(&mut self, framebuffer: Option<FramebufferId>) {
        if self.bound == framebuffer {
            return;
        }
        self.flush_pass();
        self.bound = framebuffer;
    }

    fn clear(&mut self, planes: ClearPlanes) {
        if self.ops.iter().any(|op| matches!(op, PassOp::Draw(_))) {
            self.flush_pass();
        }
        self.pending_clear |= planes;
    }

    fn set_viewport(&mut self, rect: PixelRect) {
        self.begin_ops();
        self.viewport = Some(rect);
        self.ops.push(PassOp::Viewport(rect));
    }

    fn set_scissor(&mut self, rect: PixelRect) {
        self.begin_ops();
        self.scissor = Some(rect);
        self.ops.push(PassOp::Scissor(rect));
    }

    fn copy_to_texture(&mut self, target: RenderTarget, rect: PixelRect) {
        self.flush_pass();
        let Some(destination) = self.textures.get(&target).cloned() else {
            self.errors
                .push(format!("copy into missing {}", target.label()));
            return;
        };
        let color = destination.desc.format.is_color();
        let source = if color {
            self.bound_color()
        } else {
            self.bound_depth()
        };
        let Some((source, level)) = source.map(|(texture, level)| (texture.clone(), level)) else {
            self.errors.push(format!(
                "bound framebuffer has nothing to copy into {}",
                target.label()
            ));
            return;
        };
        if source.format != destination.format {
            self.errors.push(format!(
                "copy into {} from {:?} needs {:?}",
                target.label(),
                source.format,
                destination.format
            ));
            return;
        }

        let extent = source.desc.mip_extent(level);
        // Depth-stencil copies must cover the whole image.
        let region = if color {
            flip_rect(rect, extent)
        } else if destination.desc.mip_extent(0) == extent {
            Some((0, 0, extent.0, extent.1))
        } else {
            None
        };
        let Some((x, y, width, height)) = region else {
            self.errors.push(format!(
                "copy region {:?} does not fit {}",
                rect,
                target.label()
            ));
            return;
        };

        self.encoder().copy_texture_to_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &source.texture,
                mip_level: level,
                origin: wgpu::Origin3d { x, y, z: 0 },
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyTextureInfo {
                texture: &destination.texture,
                mip_level: 0,
                origin: wgpu::Origin3d { x, y, z: 0 },
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
    }

    fn bind_texture(&mut self, unit: u32, source: Option<TextureSource>) {
        match source {
            Some(source) => {
                self.texture_units.insert(unit, source);
            }
            None => {
                self.texture_units.remove(&unit);
            }
        }
    }

    fn present_fullscreen(&mut self, source: RenderTarget) {
        let texture = self.texture_bind_group(Some(TextureSource::target(source)));
        let key = PipelineKey::present(self.attachment_formats());
        let pipeline = self.library.get(&self.device, &key);
        self.begin_ops();
        self.ops.push(PassOp::Draw(DrawOp {
            pipeline,
            bind_groups: vec![texture],
            vertex_buffers: Vec::new(),
            index_buffer: None,
            stencil_reference: 0,
            call: DrawCall::Fullscreen,
        }));
    }

    fn use_program(&mut self, program: Option<Program>) {
        self.program = program;
    }

    fn set_view_projection(&mut self, matrices: [Mat4; 2]) {
        let columns: [[[f32; 4]; 4]; 2] = matrices.map(|m| m.to_cols_array_2d());
        let buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("ViewUniforms"),
                contents: bytemuck::cast_slice(&columns),
                usage: wgpu::BufferUsages::UNIFORM,
            });
        self.view_bind_group = Some(self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("ViewBindGroup"),
            layout: &self.library.view_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: buffer.as_entire_binding(),
            }],
        }));
    }

    fn set_state(&mut self, state: &DrawState) {
        self.state = *state;
    }

    fn bind_geometry(&mut self, binding: GeometryBinding) {
        self.geometry = Some(binding);
    }

    fn create_buffer(&mut self, kind: BufferKind, size: u64) {
        // Pack buffers are created per read, sized to the copied rectangle.
        let (label, usage) = match kind {
            BufferKind::Storage => ("MultiDrawStorage", wgpu::BufferUsages::STORAGE),
            BufferKind::Indirect => ("MultiDrawCommands", wgpu::BufferUsages::INDIRECT),
            BufferKind::DrawId => ("DrawIds", wgpu::BufferUsages::VERTEX),
            BufferKind::PixelPack => {
                self.pack_size = Some(size);
                self.pack = None;
                return;
            }
        };
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: size.next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT),
            usage: usage | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        self.buffers.insert(kind, buffer);
    }

    fn destroy_buffer(&mut self, kind: BufferKind) {
        if kind == BufferKind::PixelPack {
            self.pack_size = None;
            self.pack = None;
            return;
        }
        if let Some(buffer) = self.buffers.remove(&kind) {
            buffer.destroy();
        }
    }

    fn write_buffer(&mut self, kind: BufferKind, offset: u64, data: &[u8]) {
        match self.buffers.get(&kind) {
            Some(buffer) => self.queue.write_buffer(buffer, offset, data),
            None => self.errors.push(format!("write to missing {:?} buffer", kind)),
        }
    }

    fn bind_storage(&mut self, slot: u32, range: BufferRange) {
        if slot != 0 {
            self.errors
                .push(format!("storage slot {} is not wired to any program", slot));
        }
        self.storage = Some(range);
    }

    fn write_uniforms(&mut self, data: &[u8]) {
        self.uniforms = Some(
            self.device
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("DrawUniforms"),
                    contents: data,
                    usage: wgpu::BufferUsages::UNIFORM,
                }),
        );
    }

    fn draw_indexed(&mut self, draw: &IndexedDraw) {
        if let Err(err) = self.record_draw(DrawCall::Indexed(*draw)) {
            self.errors.push(err.to_string());
        }
    }

    fn multi_draw_indexed_indirect(&mut self, commands: BufferRange, draw_count: u32) {
        let Some(buffer) = self.buffers.get(&BufferKind::Indirect).cloned() else {
            self.errors.push("multi-draw without a command buffer".into());
            return;
        };
        let call = DrawCall::Indirect {
            buffer,
            offset: commands.offset,
            count: draw_count,
        };
        if let Err(err) = self.record_draw(call) {
            self.errors.push(err.to_string());
        }
    }

    fn memory_barrier(&mut self) {
        // Queue writes land before the next submit; nothing to fence.
    }

    fn read_pixels(&mut self, rect: PixelRect, dst: &mut [u8]) {
        let Some((buffer, layout)) = self.encode_readback(rect) else {
            return;
        };
        let mapped = start_map(&buffer);
        if let Err(err) = self.map_readback(&buffer, &layout, mapped, dst) {
            self.errors.push(err.to_string());
        }
    }

    fn read_pixels_to_pack_buffer(&mut self, rect: PixelRect) {
        let Some(size) = self.pack_size else {
            self.errors.push("read into missing pack buffer".into());
            return;
        };
        if let Some((buffer, layout)) = self.encode_readback(rect) {
            let required = layout.output_size();
            if required > size {
                self.errors.push(format!(
                    "pack buffer of {} bytes cannot hold {} bytes",
                    size, required
                ));
            }
            let mapped = start_map(&buffer);
            self.pack = Some(PackReadback {
                buffer,
                layout,
                mapped,
            });
        }
    }

    fn map_pack_buffer(&mut self, dst: &mut [u8]) -> bool {
        if self.pack_size.is_none() {
            return false;
        }
        // Nothing read yet: the buffer maps fine and holds a black image.
        let Some(pack) = self.pack.take() else {
            let size = self.pack_size.unwrap_or(0).min(dst.len() as u64) as usize;
            dst[..size].fill(0);
            return true;
        };
        match self.map_readback(&pack.buffer, &pack.layout, pack.mapped, dst) {
            Ok(()) => true,
            Err(err) => {
                warn!("Pixel pack buffer could not be mapped: {}", err);
                false
            }
        }
    }

    fn push_debug_group(&mut self, label: &str) {
        self.debug_groups.push(label.to_string());
    }

    fn pop_debug_group(&mut self) {
        if self.debug_groups.pop().is_none() {
            self.errors.push("unbalanced debug group pop".into());
        }
    }

    fn submit(&mut self) {
        self.submit_encoder();
    }

    fn finish(&mut self) {
        self.submit_encoder();
        self.wait_idle();
    }

    fn drain_errors(&mut self) -> Vec<String> {
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            self.errors.push(err.to_string());
        }
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        std::mem::take(&mut self.errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rectangles_flip_to_top_left_and_clip() {
        assert_eq!(
            flip_rect(PixelRect::new(0, 0, 640, 480), (640, 480)),
            Some((0, 0, 640, 480))
        );
        // Bottom strip of a 100 pixel tall target starts at row 90.
        assert_eq!(
            flip_rect(PixelRect::new(10, 0, 20, 10), (64, 100)),
            Some((10, 90, 20, 10))
        );
        assert_eq!(
            flip_rect(PixelRect::new(-5, -5, 20, 20), (10, 10)),
            Some((0, 0, 10, 10))
        );
        assert_eq!(flip_rect(PixelRect::new(20, 0, 5, 5), (10, 10)), None);
    }

    #[test]
    fn readback_rows_are_padded_to_copy_alignment() {
        assert_eq!(padded_row(1), 256);
        assert_eq!(padded_row(64), 256);
        assert_eq!(padded_row(65), 512);
    }

    #[test]
    fn readback_writes_bottom_up_rgb() {
        let rect = PixelRect::new(0, 0, 1, 2);
        let layout = ReadbackLayout {
            padded_row: 4,
            ..ReadbackLayout::new(rect, (0, 0, 1, 2), (1, 2), wgpu::TextureFormat::Rgba8Unorm)
        };
        let data = [1, 2, 3, 255, 4, 5, 6, 255];
        let mut dst = [9u8; 6];
        layout.write_rgb(&data, &mut dst);
        assert_eq!(dst, [4, 5, 6, 1, 2, 3]);
    }

    #[test]
    fn clipped_readback_keeps_the_requested_row_stride() {
        // A 3x2 request hanging one pixel off the left of a 2x2 target.
        let rect = PixelRect::new(-1, 0, 3, 2);
        let clipped = flip_rect(rect, (2, 2)).expect("overlaps");
        let layout =
            ReadbackLayout::new(rect, clipped, (2, 2), wgpu::TextureFormat::Rgba8Unorm);
        assert_eq!((layout.width, layout.height), (2, 2));
        assert_eq!((layout.dst_x, layout.dst_y), (1, 0));
        assert_eq!(layout.padded_row, 256);
        assert_eq!(layout.output_size(), 18);

        // Copy rows are `padded_row` apart; padding bytes are garbage.
        let mut data = vec![0xEEu8; 512];
        data[..8].copy_from_slice(&[1, 1, 1, 255, 2, 2, 2, 255]);
        data[256..264].copy_from_slice(&[3, 3, 3, 255, 4, 4, 4, 255]);
        let mut dst = [9u8; 18];
        layout.write_rgb(&data, &mut dst);
        assert_eq!(
            dst,
            [0, 0, 0, 3, 3, 3, 4, 4, 4, 0, 0, 0, 1, 1, 1, 2, 2, 2]
        );
    }

    #[test]
    fn packed_ten_bit_colour_truncates_to_eight_bits() {
        let packed: u32 = 0x3FF | (0x200 << 10) | (0x004 << 20);
        let rgb = texel_to_rgb(wgpu::TextureFormat::Rgb10a2Unorm, &packed.to_le_bytes());
        assert_eq!(rgb, [255, 128, 1]);
    }

    #[test]
    fn pipeline_key_ignores_the_stencil_reference() {
        let formats = AttachmentFormats {
            color: Some(wgpu::TextureFormat::Rgba8Unorm),
            depth: Some(wgpu::TextureFormat::Depth24PlusStencil8),
        };
        let program = PipelineProgram::Scene(Program::DepthGeneric);
        let mut state = DrawState {
            stencil: StencilState::test(wgpu::CompareFunction::Always, 1, 255),
            ..DrawState::default()
        };
        let first = PipelineKey::new(program, &state, formats);
        state.stencil.reference = 128;
        assert_eq!(first, PipelineKey::new(program, &state, formats));
        state.depth_write = false;
        assert_ne!(first, PipelineKey::new(program, &state, formats));
    }
}
