// Backend-neutral resource and pipeline descriptors
//
// Every backend translates these into its own native structs. Field names
// follow the OpenXR/Vulkan vocabulary; D3D and GL backends map them onto
// the nearest native equivalent.

use anyhow::Result;

use super::handles::{BufferHandle, ImageHandle, ImageViewHandle, SamplerHandle, ShaderHandle};

// ─────────────────────────────────────────────────────────────────────────────
// Pipeline enums
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VertexType {
    Float,
    Vec2,
    Vec3,
    Vec4,
    Int,
    IVec2,
    IVec3,
    IVec4,
    UInt,
    UVec2,
    UVec3,
    UVec4,
}

/// Scalar type of a vertex attribute component
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScalarKind {
    Float,
    Int,
    UInt,
}

impl VertexType {
    /// Number of components (1..=4)
    pub fn component_count(self) -> u32 {
        (self as u32 % 4) + 1
    }

    pub fn scalar_kind(self) -> ScalarKind {
        match self as u32 {
            0..=3 => ScalarKind::Float,
            4..=7 => ScalarKind::Int,
            _ => ScalarKind::UInt,
        }
    }

    /// Size in bytes; every component is 32 bits wide
    pub fn byte_size(self) -> u32 {
        self.component_count() * 4
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PrimitiveTopology {
    PointList,
    LineList,
    LineStrip,
    #[default]
    TriangleList,
    TriangleStrip,
    TriangleFan,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PolygonMode {
    #[default]
    Fill,
    Line,
    Point,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CullMode {
    #[default]
    None,
    Front,
    Back,
    FrontAndBack,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FrontFace {
    #[default]
    CounterClockwise,
    Clockwise,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CompareOp {
    Never,
    #[default]
    Less,
    Equal,
    LessOrEqual,
    Greater,
    NotEqual,
    GreaterOrEqual,
    Always,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StencilOp {
    #[default]
    Keep,
    Zero,
    Replace,
    IncrementAndClamp,
    DecrementAndClamp,
    Invert,
    IncrementAndWrap,
    DecrementAndWrap,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StencilOpState {
    pub fail_op: StencilOp,
    pub pass_op: StencilOp,
    pub depth_fail_op: StencilOp,
    pub compare_op: CompareOp,
    pub compare_mask: u32,
    pub write_mask: u32,
    pub reference: u32,
}

impl Default for StencilOpState {
    fn default() -> Self {
        Self {
            fail_op: StencilOp::Keep,
            pass_op: StencilOp::Keep,
            depth_fail_op: StencilOp::Keep,
            compare_op: CompareOp::Always,
            compare_mask: 0xFF,
            write_mask: 0xFF,
            reference: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlendFactor {
    Zero,
    One,
    SrcColour,
    OneMinusSrcColour,
    DstColour,
    OneMinusDstColour,
    SrcAlpha,
    OneMinusSrcAlpha,
    DstAlpha,
    OneMinusDstAlpha,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BlendOp {
    #[default]
    Add,
    Subtract,
    ReverseSubtract,
    Min,
    Max,
}

bitflags::bitflags! {
    /// Colour channels written by a blend attachment
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ColourComponent: u8 {
        const R = 0x01;
        const G = 0x02;
        const B = 0x04;
        const A = 0x08;
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogicOp {
    Clear,
    And,
    AndReverse,
    #[default]
    Copy,
    AndInverted,
    NoOp,
    Xor,
    Or,
    Nor,
    Equivalent,
    Invert,
    OrReverse,
    CopyInverted,
    OrInverted,
    Nand,
    Set,
}

// ─────────────────────────────────────────────────────────────────────────────
// Pipeline state
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ColourBlendAttachmentState {
    pub blend_enable: bool,
    pub src_colour_blend_factor: BlendFactor,
    pub dst_colour_blend_factor: BlendFactor,
    pub colour_blend_op: BlendOp,
    pub src_alpha_blend_factor: BlendFactor,
    pub dst_alpha_blend_factor: BlendFactor,
    pub alpha_blend_op: BlendOp,
    pub colour_write_mask: ColourComponent,
}

impl Default for ColourBlendAttachmentState {
    fn default() -> Self {
        Self {
            blend_enable: false,
            src_colour_blend_factor: BlendFactor::One,
            dst_colour_blend_factor: BlendFactor::Zero,
            colour_blend_op: BlendOp::Add,
            src_alpha_blend_factor: BlendFactor::One,
            dst_alpha_blend_factor: BlendFactor::Zero,
            alpha_blend_op: BlendOp::Add,
            colour_write_mask: ColourComponent::all(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VertexInputAttribute {
    /// `layout(location = X)` in GLSL
    pub attrib_index: u32,
    /// Vertex buffer slot this attribute reads from
    pub binding_index: u32,
    pub vertex_type: VertexType,
    pub offset: usize,
    /// HLSL semantic, e.g. "POSITION"
    pub semantic_name: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VertexInputBinding {
    pub binding_index: u32,
    pub offset: usize,
    pub stride: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VertexInputState {
    pub attributes: Vec<VertexInputAttribute>,
    pub bindings: Vec<VertexInputBinding>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InputAssemblyState {
    pub topology: PrimitiveTopology,
    pub primitive_restart_enable: bool,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RasterisationState {
    pub depth_clamp_enable: bool,
    pub rasteriser_discard_enable: bool,
    pub polygon_mode: PolygonMode,
    pub cull_mode: CullMode,
    pub front_face: FrontFace,
    pub depth_bias_enable: bool,
    pub depth_bias_constant_factor: f32,
    pub depth_bias_clamp: f32,
    pub depth_bias_slope_factor: f32,
    pub line_width: f32,
}

impl Default for RasterisationState {
    fn default() -> Self {
        Self {
            depth_clamp_enable: false,
            rasteriser_discard_enable: false,
            polygon_mode: PolygonMode::Fill,
            cull_mode: CullMode::Back,
            front_face: FrontFace::CounterClockwise,
            depth_bias_enable: false,
            depth_bias_constant_factor: 0.0,
            depth_bias_clamp: 0.0,
            depth_bias_slope_factor: 0.0,
            line_width: 1.0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MultisampleState {
    pub rasterisation_samples: u32,
    pub sample_shading_enable: bool,
    pub min_sample_shading: f32,
    pub sample_mask: u32,
    pub alpha_to_coverage_enable: bool,
    pub alpha_to_one_enable: bool,
}

impl Default for MultisampleState {
    fn default() -> Self {
        Self {
            rasterisation_samples: 1,
            sample_shading_enable: false,
            min_sample_shading: 1.0,
            sample_mask: u32::MAX,
            alpha_to_coverage_enable: false,
            alpha_to_one_enable: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DepthStencilState {
    pub depth_test_enable: bool,
    pub depth_write_enable: bool,
    pub depth_compare_op: CompareOp,
    pub depth_bounds_test_enable: bool,
    pub stencil_test_enable: bool,
    pub front: StencilOpState,
    pub back: StencilOpState,
    pub min_depth_bounds: f32,
    pub max_depth_bounds: f32,
}

impl Default for DepthStencilState {
    fn default() -> Self {
        Self {
            depth_test_enable: true,
            depth_write_enable: true,
            depth_compare_op: CompareOp::LessOrEqual,
            depth_bounds_test_enable: false,
            stencil_test_enable: false,
            front: StencilOpState::default(),
            back: StencilOpState::default(),
            min_depth_bounds: 0.0,
            max_depth_bounds: 1.0,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ColourBlendState {
    pub logic_op_enable: bool,
    pub logic_op: LogicOp,
    pub attachments: Vec<ColourBlendAttachmentState>,
    pub blend_constants: [f32; 4],
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PipelineCreateInfo {
    pub shaders: Vec<ShaderHandle>,
    pub vertex_input_state: VertexInputState,
    pub input_assembly_state: InputAssemblyState,
    pub rasterisation_state: RasterisationState,
    pub multisample_state: MultisampleState,
    pub depth_stencil_state: DepthStencilState,
    pub colour_blend_state: ColourBlendState,
    /// Native formats of the colour attachments the pipeline renders into
    pub colour_formats: Vec<i64>,
    pub depth_format: i64,
    pub layout: Vec<DescriptorInfo>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Shaders
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    TessellationControl,
    TessellationEvaluation,
    Geometry,
    Fragment,
    Compute,
}

/// Precompiled shader input. SPIR-V for Vulkan, DXBC for D3D, GLSL text for GL.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShaderCreateInfo {
    pub stage: ShaderStage,
    pub source: Vec<u8>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Buffers
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferKind {
    Vertex,
    Index,
    Uniform,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BufferCreateInfo {
    pub kind: BufferKind,
    pub stride: usize,
    pub size: usize,
    /// Initial contents, copied at creation when present
    pub data: Option<Vec<u8>>,
    pub index_buffer_uint16: bool,
}

impl BufferCreateInfo {
    /// Index width for draws; a stride of 4 selects 32-bit indices
    pub fn index_is_u32(&self) -> bool {
        self.stride == 4
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Images
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageCreateInfo {
    /// 1, 2 or 3
    pub dimension: u32,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub sample_count: u32,
    /// Native format value of the active backend
    pub format: i64,
    pub cubemap: bool,
    pub colour_attachment: bool,
    pub depth_attachment: bool,
    pub sampled: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageViewKind {
    /// Render target
    Rtv,
    /// Depth stencil
    Dsv,
    /// Shader resource
    Srv,
    /// Unordered access
    Uav,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageViewType {
    Type1D,
    Type2D,
    Type3D,
    TypeCube,
    Type1DArray,
    Type2DArray,
    TypeCubeArray,
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ImageAspect: u8 {
        const COLOUR = 0x01;
        const DEPTH = 0x02;
        const STENCIL = 0x04;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageViewCreateInfo {
    pub image: ImageHandle,
    pub kind: ImageViewKind,
    pub view: ImageViewType,
    pub format: i64,
    pub aspect: ImageAspect,
    pub base_mip_level: u32,
    pub level_count: u32,
    pub base_array_layer: u32,
    pub layer_count: u32,
}

// ─────────────────────────────────────────────────────────────────────────────
// Samplers
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Filter {
    Nearest,
    Linear,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MipmapMode {
    Nearest,
    Linear,
    /// No mipmapping; sample the base level only
    NoOp,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressMode {
    Repeat,
    MirroredRepeat,
    ClampToEdge,
    ClampToBorder,
    MirrorClampToEdge,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SamplerCreateInfo {
    pub mag_filter: Filter,
    pub min_filter: Filter,
    pub mipmap_mode: MipmapMode,
    pub address_mode_s: AddressMode,
    pub address_mode_t: AddressMode,
    pub address_mode_r: AddressMode,
    pub mip_lod_bias: f32,
    pub compare_enable: bool,
    pub compare_op: CompareOp,
    pub min_lod: f32,
    pub max_lod: f32,
    pub border_colour: [f32; 4],
}

impl Default for SamplerCreateInfo {
    fn default() -> Self {
        Self {
            mag_filter: Filter::Linear,
            min_filter: Filter::Linear,
            mipmap_mode: MipmapMode::Linear,
            address_mode_s: AddressMode::Repeat,
            address_mode_t: AddressMode::Repeat,
            address_mode_r: AddressMode::Repeat,
            mip_lod_bias: 0.0,
            compare_enable: false,
            compare_op: CompareOp::Never,
            min_lod: 0.0,
            max_lod: f32::MAX,
            border_colour: [0.0, 0.0, 0.0, 0.0],
        }
    }
}

/// Named border colours every backend can express natively
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BorderColour {
    TransparentBlack,
    OpaqueBlack,
    OpaqueWhite,
}

impl BorderColour {
    pub fn from_rgba(rgba: [f32; 4]) -> Self {
        if rgba == [1.0, 1.0, 1.0, 1.0] {
            BorderColour::OpaqueWhite
        } else if rgba == [0.0, 0.0, 0.0, 1.0] {
            BorderColour::OpaqueBlack
        } else {
            BorderColour::TransparentBlack
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Descriptors
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DescriptorResource {
    Buffer(BufferHandle),
    /// Sampled images are bound through a shader resource view
    Image(ImageViewHandle),
    Sampler(SamplerHandle),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DescriptorType {
    Buffer,
    Image,
    Sampler,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DescriptorInfo {
    pub binding_index: u32,
    pub resource: DescriptorResource,
    pub stage: ShaderStage,
    pub read_write: bool,
    pub buffer_offset: usize,
    /// Zero means "to the end of the buffer"
    pub buffer_size: usize,
}

impl DescriptorInfo {
    pub fn descriptor_type(&self) -> DescriptorType {
        match self.resource {
            DescriptorResource::Buffer(_) => DescriptorType::Buffer,
            DescriptorResource::Image(_) => DescriptorType::Image,
            DescriptorResource::Sampler(_) => DescriptorType::Sampler,
        }
    }

    /// Byte range `(offset, size)` this descriptor covers in a buffer of
    /// `buffer_size` bytes, with a zero size resolved to the rest of the buffer
    pub fn buffer_range(&self, buffer_size: usize) -> Result<(usize, usize)> {
        let offset = self.buffer_offset;
        if offset > buffer_size {
            anyhow::bail!(
                "Descriptor offset {} is past the end of a {} byte buffer",
                offset,
                buffer_size
            );
        }
        let size = if self.buffer_size == 0 {
            buffer_size - offset
        } else {
            self.buffer_size
        };
        if size == 0 || offset.checked_add(size).map_or(true, |end| end > buffer_size) {
            anyhow::bail!(
                "Descriptor range {}..+{} does not fit a {} byte buffer",
                offset,
                size,
                buffer_size
            );
        }
        Ok((offset, size))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Dynamic state
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Offset2D {
    pub x: i32,
    pub y: i32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Extent2D {
    pub width: u32,
    pub height: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Rect2D {
    pub offset: Offset2D,
    pub extent: Extent2D,
}

impl Rect2D {
    pub fn from_extent(width: u32, height: u32) -> Self {
        Self {
            offset: Offset2D::default(),
            extent: Extent2D { width, height },
        }
    }
}

impl Viewport {
    /// Full-surface viewport covering `rect` with depth range 0..1
    pub fn from_rect(rect: Rect2D) -> Self {
        Self {
            x: rect.offset.x as f32,
            y: rect.offset.y as f32,
            width: rect.extent.width as f32,
            height: rect.extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_type_components() {
        assert_eq!(VertexType::Float.component_count(), 1);
        assert_eq!(VertexType::Vec3.component_count(), 3);
        assert_eq!(VertexType::IVec4.component_count(), 4);
        assert_eq!(VertexType::UVec2.component_count(), 2);
        assert_eq!(VertexType::Vec4.byte_size(), 16);
    }

    #[test]
    fn vertex_type_scalar_kinds() {
        assert_eq!(VertexType::Vec4.scalar_kind(), ScalarKind::Float);
        assert_eq!(VertexType::Int.scalar_kind(), ScalarKind::Int);
        assert_eq!(VertexType::IVec3.scalar_kind(), ScalarKind::Int);
        assert_eq!(VertexType::UInt.scalar_kind(), ScalarKind::UInt);
        assert_eq!(VertexType::UVec4.scalar_kind(), ScalarKind::UInt);
    }

    #[test]
    fn index_width_follows_stride() {
        let mut info = BufferCreateInfo {
            kind: BufferKind::Index,
            stride: 4,
            size: 144,
            data: None,
            index_buffer_uint16: false,
        };
        assert!(info.index_is_u32());
        info.stride = 2;
        assert!(!info.index_is_u32());
    }

    #[test]
    fn border_colours() {
        assert_eq!(BorderColour::from_rgba([1.0; 4]), BorderColour::OpaqueWhite);
        assert_eq!(
            BorderColour::from_rgba([0.0, 0.0, 0.0, 1.0]),
            BorderColour::OpaqueBlack
        );
        assert_eq!(
            BorderColour::from_rgba([0.5, 0.0, 0.0, 1.0]),
            BorderColour::TransparentBlack
        );
    }

    #[test]
    fn colour_mask_bits_match_native_layout() {
        assert_eq!(ColourComponent::all().bits(), 0x0F);
        assert_eq!((ColourComponent::R | ColourComponent::A).bits(), 0x09);
    }

    #[test]
    fn descriptor_type_comes_from_resource() {
        let info = DescriptorInfo {
            binding_index: 0,
            resource: DescriptorResource::Buffer(BufferHandle::from_raw(7)),
            stage: ShaderStage::Vertex,
            read_write: false,
            buffer_offset: 0,
            buffer_size: 64,
        };
        assert_eq!(info.descriptor_type(), DescriptorType::Buffer);
    }

    fn uniform_at(offset: usize, size: usize) -> DescriptorInfo {
        DescriptorInfo {
            binding_index: 0,
            resource: DescriptorResource::Buffer(BufferHandle::from_raw(7)),
            stage: ShaderStage::Vertex,
            read_write: false,
            buffer_offset: offset,
            buffer_size: size,
        }
    }

    #[test]
    fn zero_size_covers_rest_of_buffer() {
        assert_eq!(uniform_at(0, 0).buffer_range(1024).unwrap(), (0, 1024));
        assert_eq!(uniform_at(256, 0).buffer_range(1024).unwrap(), (256, 768));
    }

    #[test]
    fn explicit_size_is_kept() {
        assert_eq!(uniform_at(512, 256).buffer_range(1024).unwrap(), (512, 256));
        assert_eq!(uniform_at(768, 256).buffer_range(1024).unwrap(), (768, 256));
    }

    #[test]
    fn offset_past_end_is_an_error() {
        assert!(uniform_at(512, 0).buffer_range(256).is_err());
        assert!(uniform_at(512, 64).buffer_range(256).is_err());
    }

    #[test]
    fn range_overrunning_buffer_is_an_error() {
        assert!(uniform_at(192, 128).buffer_range(256).is_err());
        assert!(uniform_at(1, usize::MAX).buffer_range(256).is_err());
        // Offset exactly at the end leaves nothing to bind
        assert!(uniform_at(256, 0).buffer_range(256).is_err());
    }

    #[test]
    fn viewport_from_rect() {
        let vp = Viewport::from_rect(Rect2D::from_extent(1832, 1920));
        assert_eq!(vp.width, 1832.0);
        assert_eq!(vp.height, 1920.0);
        assert_eq!(vp.max_depth, 1.0);
    }
}
