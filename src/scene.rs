// Scene - floor and table cuboids drawn into each view
//
// One unit cube mesh is drawn twice per view with per-draw camera constants
// written at 256-byte aligned offsets of a per-view uniform buffer.

use anyhow::{Context, Result};
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Quat, Vec3, Vec4};
use openxr as xr;
use std::mem::size_of;
use std::path::Path;

use crate::backend::*;
use crate::config::RenderConfig;

const UNIFORM_ALIGNMENT: usize = 256;
const CUBOIDS_PER_VIEW: usize = 2;
const CUBE_INDEX_COUNT: u32 = 36;

/// Per-draw constants, laid out to match the shaders' camera block
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct CameraConstants {
    pub view_proj: Mat4,
    pub model_view_proj: Mat4,
    pub model: Mat4,
    pub colour: Vec4,
    pub pad: [Vec4; 3],
}

/// Face normals indexed by primitive id / 2 in the shaders
pub const NORMALS: [Vec4; 6] = [
    Vec4::new(1.0, 0.0, 0.0, 0.0),
    Vec4::new(-1.0, 0.0, 0.0, 0.0),
    Vec4::new(0.0, 1.0, 0.0, 0.0),
    Vec4::new(0.0, -1.0, 0.0, 0.0),
    Vec4::new(0.0, 0.0, 1.0, 0.0),
    Vec4::new(0.0, 0.0, -1.0, 0.0),
];

pub fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) / alignment * alignment
}

/// Byte offset of the `index`th draw's constants in a uniform buffer
pub fn uniform_offset(index: usize) -> usize {
    index * align_up(size_of::<CameraConstants>(), UNIFORM_ALIGNMENT)
}

/// Two triangles per face of a 1m cube, six vertices per face
pub fn cube_vertices() -> Vec<Vec4> {
    let corners = [
        Vec4::new(0.5, 0.5, 0.5, 1.0),
        Vec4::new(0.5, 0.5, -0.5, 1.0),
        Vec4::new(0.5, -0.5, 0.5, 1.0),
        Vec4::new(0.5, -0.5, -0.5, 1.0),
        Vec4::new(-0.5, 0.5, 0.5, 1.0),
        Vec4::new(-0.5, 0.5, -0.5, 1.0),
        Vec4::new(-0.5, -0.5, 0.5, 1.0),
        Vec4::new(-0.5, -0.5, -0.5, 1.0),
    ];
    let faces: [[usize; 6]; 6] = [
        [2, 1, 0, 2, 3, 1],
        [6, 4, 5, 6, 5, 7],
        [0, 1, 5, 0, 5, 4],
        [2, 6, 7, 2, 7, 3],
        [0, 4, 6, 0, 6, 2],
        [1, 3, 7, 1, 7, 5],
    ];
    faces.iter().flatten().map(|&i| corners[i]).collect()
}

pub fn cube_indices() -> Vec<u32> {
    (0..CUBE_INDEX_COUNT).collect()
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Cuboid {
    pub position: Vec3,
    pub scale: Vec3,
    pub colour: Vec3,
}

impl Cuboid {
    pub fn model(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.scale, Quat::IDENTITY, self.position)
    }
}

/// A floor at the user's feet and a table in front of them
pub fn scene_cuboids(view_height: f32) -> [Cuboid; CUBOIDS_PER_VIEW] {
    [
        Cuboid {
            position: Vec3::new(0.0, -view_height, 0.0),
            scale: Vec3::new(2.0, 0.1, 2.0),
            colour: Vec3::new(0.4, 0.5, 0.5),
        },
        Cuboid {
            position: Vec3::new(0.0, -view_height + 0.9, -0.7),
            scale: Vec3::new(1.0, 0.2, 1.0),
            colour: Vec3::new(0.6, 0.6, 0.4),
        },
    ]
}

/// Column-major projection from an OpenXR field of view. Vulkan flips Y;
/// GL and GLES clip depth to -1..1, the others to 0..1.
pub fn projection_fov(api: GraphicsApiType, fov: xr::Fovf, near: f32, far: f32) -> Mat4 {
    let tan_left = fov.angle_left.tan();
    let tan_right = fov.angle_right.tan();
    let tan_down = fov.angle_down.tan();
    let tan_up = fov.angle_up.tan();

    let width = tan_right - tan_left;
    let height = if api == GraphicsApiType::Vulkan {
        tan_down - tan_up
    } else {
        tan_up - tan_down
    };
    let offset_z = match api {
        GraphicsApiType::OpenGL | GraphicsApiType::OpenGLES => near,
        _ => 0.0,
    };

    Mat4::from_cols(
        Vec4::new(2.0 / width, 0.0, 0.0, 0.0),
        Vec4::new(0.0, 2.0 / height, 0.0, 0.0),
        Vec4::new(
            (tan_right + tan_left) / width,
            (tan_up + tan_down) / height,
            -(far + offset_z) / (far - near),
            -1.0,
        ),
        Vec4::new(0.0, 0.0, -(far * (near + offset_z)) / (far - near), 0.0),
    )
}

/// World-to-eye transform for a located view
pub fn view_matrix(pose: xr::Posef) -> Mat4 {
    let o = pose.orientation;
    let p = pose.position;
    Mat4::from_rotation_translation(Quat::from_xyzw(o.x, o.y, o.z, o.w), Vec3::new(p.x, p.y, p.z))
        .inverse()
}

/// Shader file names for a backend: (vertex, pixel)
pub fn shader_file_names(api: GraphicsApiType) -> Option<(&'static str, &'static str)> {
    match api {
        GraphicsApiType::Vulkan => Some(("VertexShader.spv", "PixelShader.spv")),
        GraphicsApiType::D3D11 => Some(("VertexShader_5_0.cso", "PixelShader_5_0.cso")),
        GraphicsApiType::D3D12 => Some(("VertexShader_5_1.cso", "PixelShader_5_1.cso")),
        GraphicsApiType::OpenGL => Some(("VertexShader.glsl", "PixelShader.glsl")),
        GraphicsApiType::OpenGLES => Some(("VertexShader_GLES.glsl", "PixelShader_GLES.glsl")),
        GraphicsApiType::Unknown => None,
    }
}

fn load_shader_sources(api: GraphicsApiType, dir: &Path) -> Option<(Vec<u8>, Vec<u8>)> {
    let (vertex, pixel) = shader_file_names(api)?;
    let read = |name: &str| {
        let path = dir.join(name);
        std::fs::read(&path)
            .map_err(|e| log::warn!("Shader {:?} not loaded: {}", path, e))
            .ok()
    };
    Some((read(vertex)?, read(pixel)?))
}

/// Everything one view needs for a frame
pub struct ViewTarget {
    pub index: usize,
    pub colour_view: ImageViewHandle,
    pub depth_view: ImageViewHandle,
    pub width: u32,
    pub height: u32,
    pub pose: xr::Posef,
    pub fov: xr::Fovf,
}

struct Pipeline {
    shaders: [ShaderHandle; 2],
    pipeline: PipelineHandle,
}

pub struct Scene {
    api: GraphicsApiType,
    vertex_buffer: BufferHandle,
    index_buffer: BufferHandle,
    normals_buffer: BufferHandle,
    camera_buffers: Vec<BufferHandle>,
    pipeline: Option<Pipeline>,
    clear_depth: f32,
    near_z: f32,
    far_z: f32,
    cuboids: [Cuboid; CUBOIDS_PER_VIEW],
}

impl Scene {
    pub fn new<B: GraphicsApi>(
        api: &mut B,
        config: &RenderConfig,
        view_count: usize,
        colour_format: i64,
        depth_format: i64,
    ) -> Result<Self> {
        let api_type = api.api_type();

        let vertices = cube_vertices();
        let vertex_buffer = api.create_buffer(&BufferCreateInfo {
            kind: BufferKind::Vertex,
            stride: size_of::<Vec4>(),
            size: vertices.len() * size_of::<Vec4>(),
            data: Some(bytemuck::cast_slice(&vertices).to_vec()),
            index_buffer_uint16: false,
        })?;

        let indices = cube_indices();
        let index_buffer = api.create_buffer(&BufferCreateInfo {
            kind: BufferKind::Index,
            stride: size_of::<u32>(),
            size: indices.len() * size_of::<u32>(),
            data: Some(bytemuck::cast_slice(&indices).to_vec()),
            index_buffer_uint16: false,
        })?;

        let normals_buffer = api.create_buffer(&BufferCreateInfo {
            kind: BufferKind::Uniform,
            stride: 0,
            size: size_of::<[Vec4; 6]>(),
            data: Some(bytemuck::cast_slice(&NORMALS).to_vec()),
            index_buffer_uint16: false,
        })?;

        let camera_buffers = (0..view_count)
            .map(|_| {
                api.create_buffer(&BufferCreateInfo {
                    kind: BufferKind::Uniform,
                    stride: 0,
                    size: uniform_offset(CUBOIDS_PER_VIEW),
                    data: None,
                    index_buffer_uint16: false,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let pipeline = match load_shader_sources(api_type, &config.shader_dir) {
            Some((vertex, pixel)) => {
                let camera = *camera_buffers
                    .first()
                    .context("Scene needs at least one view")?;
                Some(Self::create_pipeline(
                    api,
                    vertex,
                    pixel,
                    colour_format,
                    depth_format,
                    camera,
                    normals_buffer,
                )?)
            }
            None => {
                log::warn!(
                    "No {} shaders in {:?}; views will only be cleared",
                    api_type,
                    config.shader_dir
                );
                None
            }
        };

        Ok(Self {
            api: api_type,
            vertex_buffer,
            index_buffer,
            normals_buffer,
            camera_buffers,
            pipeline,
            clear_depth: config.clear_depth,
            near_z: config.near_z,
            far_z: config.far_z,
            cuboids: scene_cuboids(config.view_height),
        })
    }

    fn create_pipeline<B: GraphicsApi>(
        api: &mut B,
        vertex_source: Vec<u8>,
        pixel_source: Vec<u8>,
        colour_format: i64,
        depth_format: i64,
        camera_buffer: BufferHandle,
        normals_buffer: BufferHandle,
    ) -> Result<Pipeline> {
        let vertex = api.create_shader(&ShaderCreateInfo {
            stage: ShaderStage::Vertex,
            source: vertex_source,
        })?;
        let pixel = api.create_shader(&ShaderCreateInfo {
            stage: ShaderStage::Fragment,
            source: pixel_source,
        })?;

        let buffer_binding = |binding_index, resource, stage| DescriptorInfo {
            binding_index,
            resource: DescriptorResource::Buffer(resource),
            stage,
            read_write: false,
            buffer_offset: 0,
            buffer_size: 0,
        };

        let info = PipelineCreateInfo {
            shaders: vec![vertex, pixel],
            vertex_input_state: VertexInputState {
                attributes: vec![VertexInputAttribute {
                    attrib_index: 0,
                    binding_index: 0,
                    vertex_type: VertexType::Vec4,
                    offset: 0,
                    semantic_name: "TEXCOORD".to_string(),
                }],
                bindings: vec![VertexInputBinding {
                    binding_index: 0,
                    offset: 0,
                    stride: size_of::<Vec4>(),
                }],
            },
            rasterisation_state: RasterisationState {
                cull_mode: CullMode::Back,
                front_face: FrontFace::CounterClockwise,
                ..Default::default()
            },
            depth_stencil_state: DepthStencilState {
                depth_compare_op: CompareOp::LessOrEqual,
                ..Default::default()
            },
            colour_blend_state: ColourBlendState {
                attachments: vec![ColourBlendAttachmentState {
                    blend_enable: true,
                    src_colour_blend_factor: BlendFactor::SrcAlpha,
                    dst_colour_blend_factor: BlendFactor::OneMinusSrcAlpha,
                    ..Default::default()
                }],
                ..Default::default()
            },
            colour_formats: vec![colour_format],
            depth_format,
            layout: vec![
                buffer_binding(0, camera_buffer, ShaderStage::Vertex),
                buffer_binding(1, normals_buffer, ShaderStage::Vertex),
                buffer_binding(2, camera_buffer, ShaderStage::Fragment),
            ],
            ..Default::default()
        };

        let pipeline = api.create_pipeline(&info)?;
        Ok(Pipeline {
            shaders: [vertex, pixel],
            pipeline,
        })
    }

    /// Record and submit one view: clear, then the cuboids when shaders are loaded
    pub fn render_view<B: GraphicsApi>(
        &self,
        api: &mut B,
        target: &ViewTarget,
        clear_colour: [f32; 4],
    ) -> Result<()> {
        let camera_buffer = *self
            .camera_buffers
            .get(target.index)
            .with_context(|| format!("No uniform buffer for view {}", target.index))?;

        api.begin_rendering()?;

        api.clear_colour(target.colour_view, clear_colour)?;
        api.clear_depth(target.depth_view, self.clear_depth)?;

        let scissor = Rect2D::from_extent(target.width, target.height);
        api.set_render_attachments(&[target.colour_view], Some(target.depth_view))?;
        api.set_viewports(&[Viewport::from_rect(scissor)])?;
        api.set_scissors(&[scissor])?;

        if let Some(pipeline) = &self.pipeline {
            let view_proj = projection_fov(self.api, target.fov, self.near_z, self.far_z)
                * view_matrix(target.pose);

            for (i, cuboid) in self.cuboids.iter().enumerate() {
                let model = cuboid.model();
                let constants = CameraConstants {
                    view_proj,
                    model_view_proj: view_proj * model,
                    model,
                    colour: cuboid.colour.extend(1.0),
                    pad: [Vec4::ZERO; 3],
                };
                let offset = uniform_offset(i);
                let size = size_of::<CameraConstants>();

                api.set_pipeline(pipeline.pipeline)?;
                api.set_buffer_data(camera_buffer, offset, bytemuck::bytes_of(&constants))?;
                api.set_descriptor(&DescriptorInfo {
                    binding_index: 0,
                    resource: DescriptorResource::Buffer(camera_buffer),
                    stage: ShaderStage::Vertex,
                    read_write: false,
                    buffer_offset: offset,
                    buffer_size: size,
                })?;
                api.set_descriptor(&DescriptorInfo {
                    binding_index: 1,
                    resource: DescriptorResource::Buffer(self.normals_buffer),
                    stage: ShaderStage::Vertex,
                    read_write: false,
                    buffer_offset: 0,
                    buffer_size: size_of::<[Vec4; 6]>(),
                })?;
                api.set_descriptor(&DescriptorInfo {
                    binding_index: 2,
                    resource: DescriptorResource::Buffer(camera_buffer),
                    stage: ShaderStage::Fragment,
                    read_write: false,
                    buffer_offset: offset,
                    buffer_size: size,
                })?;
                api.update_descriptors()?;

                api.set_vertex_buffers(&[self.vertex_buffer])?;
                api.set_index_buffer(self.index_buffer)?;
                api.draw_indexed(CUBE_INDEX_COUNT, 1, 0, 0, 0)?;
            }
        }

        api.end_rendering()
    }

    pub fn destroy<B: GraphicsApi>(self, api: &mut B) -> Result<()> {
        if let Some(pipeline) = self.pipeline {
            api.destroy_pipeline(pipeline.pipeline)?;
            for shader in pipeline.shaders {
                api.destroy_shader(shader)?;
            }
        }
        for buffer in self.camera_buffers {
            api.destroy_buffer(buffer)?;
        }
        api.destroy_buffer(self.normals_buffer)?;
        api.destroy_buffer(self.index_buffer)?;
        api.destroy_buffer(self.vertex_buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn symmetric_fov(half_angle: f32) -> xr::Fovf {
        xr::Fovf {
            angle_left: -half_angle,
            angle_right: half_angle,
            angle_up: half_angle,
            angle_down: -half_angle,
        }
    }

    #[test]
    fn camera_constants_fill_one_alignment_slot() {
        assert_eq!(size_of::<CameraConstants>(), UNIFORM_ALIGNMENT);
        assert_eq!(uniform_offset(0), 0);
        assert_eq!(uniform_offset(1), 256);
        assert_eq!(uniform_offset(CUBOIDS_PER_VIEW), 512);
    }

    fn camera_descriptor(draw: usize) -> DescriptorInfo {
        DescriptorInfo {
            binding_index: 0,
            resource: DescriptorResource::Buffer(BufferHandle::from_raw(1)),
            stage: ShaderStage::Vertex,
            read_write: false,
            buffer_offset: uniform_offset(draw),
            buffer_size: size_of::<CameraConstants>(),
        }
    }

    #[test]
    fn every_draw_binds_inside_the_camera_buffer() {
        let buffer_size = uniform_offset(CUBOIDS_PER_VIEW);
        for draw in 0..CUBOIDS_PER_VIEW {
            let (offset, size) = camera_descriptor(draw).buffer_range(buffer_size).unwrap();
            assert_eq!(offset % UNIFORM_ALIGNMENT, 0);
            let (first, count) = d3d::convert::constant_buffer_window(offset, size).unwrap();
            assert_eq!(first as usize, draw * 16);
            assert_eq!(count, 16);
        }
        assert!(camera_descriptor(CUBOIDS_PER_VIEW)
            .buffer_range(buffer_size)
            .is_err());
    }

    #[test]
    fn align_up_rounds_to_multiple() {
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(257, 256), 512);
    }

    #[test]
    fn cube_has_six_faces_of_two_triangles() {
        let vertices = cube_vertices();
        assert_eq!(vertices.len(), CUBE_INDEX_COUNT as usize);
        assert!(vertices
            .iter()
            .all(|v| v.x.abs() == 0.5 && v.y.abs() == 0.5 && v.z.abs() == 0.5 && v.w == 1.0));
        // First face lies on x = +0.5 for all six vertices
        assert!(vertices[..6].iter().all(|v| v.x == 0.5));
        assert_eq!(cube_indices(), (0..36).collect::<Vec<u32>>());
    }

    #[test]
    fn floor_sits_at_view_height() {
        let [floor, table] = scene_cuboids(1.5);
        assert_eq!(floor.position, Vec3::new(0.0, -1.5, 0.0));
        assert_eq!(floor.scale, Vec3::new(2.0, 0.1, 2.0));
        assert!((table.position.y - -0.6).abs() < 1e-6);
        assert_eq!(table.position.z, -0.7);
    }

    #[test]
    fn cuboid_model_scales_then_translates() {
        let cuboid = scene_cuboids(1.5)[0];
        let corner = cuboid.model() * Vec4::new(0.5, 0.5, 0.5, 1.0);
        assert!((corner - Vec4::new(1.0, -1.45, 1.0, 1.0)).length() < 1e-6);
    }

    fn clip_depth(api: GraphicsApiType, z: f32) -> f32 {
        let proj = projection_fov(api, symmetric_fov(0.7), 0.05, 100.0);
        let clip = proj * Vec4::new(0.0, 0.0, z, 1.0);
        clip.z / clip.w
    }

    #[test]
    fn depth_range_depends_on_api() {
        assert!((clip_depth(GraphicsApiType::D3D11, -0.05) - 0.0).abs() < 1e-4);
        assert!((clip_depth(GraphicsApiType::D3D11, -100.0) - 1.0).abs() < 1e-4);
        assert!((clip_depth(GraphicsApiType::OpenGL, -0.05) + 1.0).abs() < 1e-4);
        assert!((clip_depth(GraphicsApiType::OpenGL, -100.0) - 1.0).abs() < 1e-4);
    }

    #[test]
    fn vulkan_projection_flips_y() {
        let fov = symmetric_fov(0.7);
        let point = Vec4::new(0.0, 1.0, -2.0, 1.0);
        let gl = projection_fov(GraphicsApiType::OpenGL, fov, 0.05, 100.0) * point;
        let vk = projection_fov(GraphicsApiType::Vulkan, fov, 0.05, 100.0) * point;
        assert!(gl.y > 0.0);
        assert!((vk.y + gl.y).abs() < 1e-5);
    }

    #[test]
    fn view_matrix_inverts_the_pose() {
        let pose = xr::Posef {
            orientation: xr::Quaternionf::IDENTITY,
            position: xr::Vector3f {
                x: 0.0,
                y: 1.5,
                z: 0.0,
            },
        };
        let eye = view_matrix(pose) * Vec4::new(0.0, 1.5, 0.0, 1.0);
        assert!((eye - Vec4::new(0.0, 0.0, 0.0, 1.0)).length() < 1e-6);
    }

    #[test]
    fn every_backend_has_shader_names() {
        for api in [
            GraphicsApiType::D3D11,
            GraphicsApiType::D3D12,
            GraphicsApiType::OpenGL,
            GraphicsApiType::OpenGLES,
            GraphicsApiType::Vulkan,
        ] {
            assert!(shader_file_names(api).is_some());
        }
        assert!(shader_file_names(GraphicsApiType::Unknown).is_none());
    }

    #[test]
    fn missing_shader_dir_means_clear_only() {
        let dir = Path::new("definitely/not/a/shader/dir");
        assert!(load_shader_sources(GraphicsApiType::Vulkan, dir).is_none());
    }
}
