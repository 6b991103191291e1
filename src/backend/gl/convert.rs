// Neutral descriptor -> GL enum translation shared by desktop GL and GLES

use anyhow::Result;

use crate::backend::types::*;

/// Desktop GL colour formats in preference order. The 8-bit linear formats
/// are fallbacks; they band without sRGB encoding.
pub const DESKTOP_SWAPCHAIN_FORMATS: [i64; 4] = [
    glow::RGB10_A2 as i64,
    glow::RGBA16F as i64,
    glow::RGBA8 as i64,
    glow::RGBA8_SNORM as i64,
];

/// GLES 3.x colour formats in preference order
pub const ES_SWAPCHAIN_FORMATS: [i64; 3] = [
    glow::RGBA8 as i64,
    glow::RGBA8_SNORM as i64,
    glow::SRGB8_ALPHA8 as i64,
];

pub const DEPTH_FORMAT: i64 = glow::DEPTH_COMPONENT32F as i64;

/// Texture target for an image, from its dimension, layering and sampling
pub fn texture_target(info: &ImageCreateInfo) -> Result<u32> {
    let target = match info.dimension {
        1 if info.array_layers > 1 => glow::TEXTURE_1D_ARRAY,
        1 => glow::TEXTURE_1D,
        2 if info.cubemap && info.array_layers > 6 => glow::TEXTURE_CUBE_MAP_ARRAY,
        2 if info.cubemap => glow::TEXTURE_CUBE_MAP,
        2 if info.sample_count > 1 && info.array_layers > 1 => glow::TEXTURE_2D_MULTISAMPLE_ARRAY,
        2 if info.sample_count > 1 => glow::TEXTURE_2D_MULTISAMPLE,
        2 if info.array_layers > 1 => glow::TEXTURE_2D_ARRAY,
        2 => glow::TEXTURE_2D,
        3 => glow::TEXTURE_3D,
        other => anyhow::bail!("Unknown image dimension {}", other),
    };
    Ok(target)
}

pub fn filter(filter: Filter) -> i32 {
    match filter {
        Filter::Nearest => glow::NEAREST as i32,
        Filter::Linear => glow::LINEAR as i32,
    }
}

/// GL folds the mipmap mode into the minification filter
pub fn min_filter(filter: Filter, mipmap: MipmapMode) -> i32 {
    let value = match (filter, mipmap) {
        (Filter::Nearest, MipmapMode::Linear) => glow::NEAREST_MIPMAP_LINEAR,
        (Filter::Nearest, MipmapMode::Nearest) => glow::NEAREST_MIPMAP_NEAREST,
        (Filter::Nearest, MipmapMode::NoOp) => glow::NEAREST,
        (Filter::Linear, MipmapMode::Linear) => glow::LINEAR_MIPMAP_LINEAR,
        (Filter::Linear, MipmapMode::Nearest) => glow::LINEAR_MIPMAP_NEAREST,
        (Filter::Linear, MipmapMode::NoOp) => glow::LINEAR,
    };
    value as i32
}

pub fn address_mode(mode: AddressMode) -> i32 {
    let value = match mode {
        AddressMode::Repeat => glow::REPEAT,
        AddressMode::MirroredRepeat => glow::MIRRORED_REPEAT,
        AddressMode::ClampToEdge => glow::CLAMP_TO_EDGE,
        AddressMode::ClampToBorder => glow::CLAMP_TO_BORDER,
        AddressMode::MirrorClampToEdge => glow::MIRROR_CLAMP_TO_EDGE,
    };
    value as i32
}

pub fn topology(topology: PrimitiveTopology) -> u32 {
    match topology {
        PrimitiveTopology::PointList => glow::POINTS,
        PrimitiveTopology::LineList => glow::LINES,
        PrimitiveTopology::LineStrip => glow::LINE_STRIP,
        PrimitiveTopology::TriangleList => glow::TRIANGLES,
        PrimitiveTopology::TriangleStrip => glow::TRIANGLE_STRIP,
        PrimitiveTopology::TriangleFan => glow::TRIANGLE_FAN,
    }
}

pub fn polygon_mode(mode: PolygonMode) -> u32 {
    match mode {
        PolygonMode::Fill => glow::FILL,
        PolygonMode::Line => glow::LINE,
        PolygonMode::Point => glow::POINT,
    }
}

/// Polygon offset capability matching the rasterised primitive type
pub fn polygon_offset_mode(mode: PolygonMode) -> u32 {
    match mode {
        PolygonMode::Fill => glow::POLYGON_OFFSET_FILL,
        PolygonMode::Line => glow::POLYGON_OFFSET_LINE,
        PolygonMode::Point => glow::POLYGON_OFFSET_POINT,
    }
}

/// None when culling is disabled
pub fn cull_face(mode: CullMode) -> Option<u32> {
    match mode {
        CullMode::None => None,
        CullMode::Front => Some(glow::FRONT),
        CullMode::Back => Some(glow::BACK),
        CullMode::FrontAndBack => Some(glow::FRONT_AND_BACK),
    }
}

pub fn front_face(face: FrontFace) -> u32 {
    match face {
        FrontFace::CounterClockwise => glow::CCW,
        FrontFace::Clockwise => glow::CW,
    }
}

pub fn compare_op(op: CompareOp) -> u32 {
    match op {
        CompareOp::Never => glow::NEVER,
        CompareOp::Less => glow::LESS,
        CompareOp::Equal => glow::EQUAL,
        CompareOp::LessOrEqual => glow::LEQUAL,
        CompareOp::Greater => glow::GREATER,
        CompareOp::NotEqual => glow::NOTEQUAL,
        CompareOp::GreaterOrEqual => glow::GEQUAL,
        CompareOp::Always => glow::ALWAYS,
    }
}

pub fn stencil_op(op: StencilOp) -> u32 {
    match op {
        StencilOp::Keep => glow::KEEP,
        StencilOp::Zero => glow::ZERO,
        StencilOp::Replace => glow::REPLACE,
        StencilOp::IncrementAndClamp => glow::INCR,
        StencilOp::DecrementAndClamp => glow::DECR,
        StencilOp::Invert => glow::INVERT,
        StencilOp::IncrementAndWrap => glow::INCR_WRAP,
        StencilOp::DecrementAndWrap => glow::DECR_WRAP,
    }
}

pub fn blend_factor(factor: BlendFactor) -> u32 {
    match factor {
        BlendFactor::Zero => glow::ZERO,
        BlendFactor::One => glow::ONE,
        BlendFactor::SrcColour => glow::SRC_COLOR,
        BlendFactor::OneMinusSrcColour => glow::ONE_MINUS_SRC_COLOR,
        BlendFactor::DstColour => glow::DST_COLOR,
        BlendFactor::OneMinusDstColour => glow::ONE_MINUS_DST_COLOR,
        BlendFactor::SrcAlpha => glow::SRC_ALPHA,
        BlendFactor::OneMinusSrcAlpha => glow::ONE_MINUS_SRC_ALPHA,
        BlendFactor::DstAlpha => glow::DST_ALPHA,
        BlendFactor::OneMinusDstAlpha => glow::ONE_MINUS_DST_ALPHA,
    }
}

pub fn blend_op(op: BlendOp) -> u32 {
    match op {
        BlendOp::Add => glow::FUNC_ADD,
        BlendOp::Subtract => glow::FUNC_SUBTRACT,
        BlendOp::ReverseSubtract => glow::FUNC_REVERSE_SUBTRACT,
        BlendOp::Min => glow::MIN,
        BlendOp::Max => glow::MAX,
    }
}

pub fn shader_type(stage: ShaderStage) -> u32 {
    match stage {
        ShaderStage::Vertex => glow::VERTEX_SHADER,
        ShaderStage::TessellationControl => glow::TESS_CONTROL_SHADER,
        ShaderStage::TessellationEvaluation => glow::TESS_EVALUATION_SHADER,
        ShaderStage::Geometry => glow::GEOMETRY_SHADER,
        ShaderStage::Fragment => glow::FRAGMENT_SHADER,
        ShaderStage::Compute => glow::COMPUTE_SHADER,
    }
}

pub fn buffer_target(kind: BufferKind) -> u32 {
    match kind {
        BufferKind::Vertex => glow::ARRAY_BUFFER,
        BufferKind::Index => glow::ELEMENT_ARRAY_BUFFER,
        BufferKind::Uniform => glow::UNIFORM_BUFFER,
    }
}

pub fn index_type(info: &BufferCreateInfo) -> u32 {
    if info.index_is_u32() {
        glow::UNSIGNED_INT
    } else {
        glow::UNSIGNED_SHORT
    }
}

/// Component data type of a vertex attribute
pub fn vertex_data_type(ty: VertexType) -> u32 {
    match ty.scalar_kind() {
        ScalarKind::Float => glow::FLOAT,
        ScalarKind::Int => glow::INT,
        ScalarKind::UInt => glow::UNSIGNED_INT,
    }
}

/// Framebuffer attachment point for a view's aspect
pub fn attachment(aspect: ImageAspect) -> u32 {
    if aspect.contains(ImageAspect::DEPTH | ImageAspect::STENCIL) {
        glow::DEPTH_STENCIL_ATTACHMENT
    } else if aspect.contains(ImageAspect::DEPTH) {
        glow::DEPTH_ATTACHMENT
    } else if aspect.contains(ImageAspect::STENCIL) {
        glow::STENCIL_ATTACHMENT
    } else {
        glow::COLOR_ATTACHMENT0
    }
}

pub fn version_supported(actual: (u32, u32), min: (u32, u32), max: (u32, u32)) -> bool {
    actual >= min && actual <= max
}

/// GL_SAMPLE_SHADING is core from GL 4.0 and GLES 3.2
pub fn sample_shading_available(desktop: bool, version: (u32, u32)) -> bool {
    if desktop {
        version >= (4, 0)
    } else {
        version >= (3, 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(dimension: u32, layers: u32, samples: u32, cubemap: bool) -> ImageCreateInfo {
        ImageCreateInfo {
            dimension,
            width: 64,
            height: 64,
            depth: 1,
            mip_levels: 1,
            array_layers: layers,
            sample_count: samples,
            format: glow::RGBA8 as i64,
            cubemap,
            colour_attachment: true,
            depth_attachment: false,
            sampled: false,
        }
    }

    #[test]
    fn texture_targets() {
        assert_eq!(texture_target(&image(2, 1, 1, false)).unwrap(), glow::TEXTURE_2D);
        assert_eq!(texture_target(&image(2, 2, 1, false)).unwrap(), glow::TEXTURE_2D_ARRAY);
        assert_eq!(
            texture_target(&image(2, 1, 4, false)).unwrap(),
            glow::TEXTURE_2D_MULTISAMPLE
        );
        assert_eq!(texture_target(&image(2, 6, 1, true)).unwrap(), glow::TEXTURE_CUBE_MAP);
        assert_eq!(
            texture_target(&image(2, 12, 1, true)).unwrap(),
            glow::TEXTURE_CUBE_MAP_ARRAY
        );
        assert_eq!(texture_target(&image(1, 4, 1, false)).unwrap(), glow::TEXTURE_1D_ARRAY);
        assert_eq!(texture_target(&image(3, 1, 1, false)).unwrap(), glow::TEXTURE_3D);
        assert!(texture_target(&image(4, 1, 1, false)).is_err());
    }

    #[test]
    fn min_filter_folds_mipmap_mode() {
        assert_eq!(
            min_filter(Filter::Linear, MipmapMode::Linear),
            glow::LINEAR_MIPMAP_LINEAR as i32
        );
        assert_eq!(
            min_filter(Filter::Nearest, MipmapMode::Linear),
            glow::NEAREST_MIPMAP_LINEAR as i32
        );
        assert_eq!(min_filter(Filter::Linear, MipmapMode::NoOp), glow::LINEAR as i32);
    }

    #[test]
    fn polygon_modes_are_not_faces() {
        assert_eq!(polygon_mode(PolygonMode::Line), glow::LINE);
        assert_eq!(polygon_offset_mode(PolygonMode::Point), glow::POLYGON_OFFSET_POINT);
    }

    #[test]
    fn culling() {
        assert_eq!(cull_face(CullMode::None), None);
        assert_eq!(cull_face(CullMode::Back), Some(glow::BACK));
        assert_eq!(cull_face(CullMode::FrontAndBack), Some(glow::FRONT_AND_BACK));
    }

    #[test]
    fn index_type_from_stride() {
        let mut info = BufferCreateInfo {
            kind: BufferKind::Index,
            stride: 4,
            size: 144,
            data: None,
            index_buffer_uint16: false,
        };
        assert_eq!(index_type(&info), glow::UNSIGNED_INT);
        info.stride = 2;
        assert_eq!(index_type(&info), glow::UNSIGNED_SHORT);
    }

    #[test]
    fn vertex_data_types() {
        assert_eq!(vertex_data_type(VertexType::Vec4), glow::FLOAT);
        assert_eq!(vertex_data_type(VertexType::IVec2), glow::INT);
        assert_eq!(vertex_data_type(VertexType::UInt), glow::UNSIGNED_INT);
    }

    #[test]
    fn attachments_follow_aspect() {
        assert_eq!(attachment(ImageAspect::COLOUR), glow::COLOR_ATTACHMENT0);
        assert_eq!(attachment(ImageAspect::DEPTH), glow::DEPTH_ATTACHMENT);
        assert_eq!(
            attachment(ImageAspect::DEPTH | ImageAspect::STENCIL),
            glow::DEPTH_STENCIL_ATTACHMENT
        );
    }

    #[test]
    fn version_range() {
        assert!(version_supported((4, 5), (4, 0), (4, 6)));
        assert!(!version_supported((3, 3), (4, 0), (4, 6)));
        assert!(!version_supported((5, 0), (4, 0), (4, 6)));
    }

    #[test]
    fn sample_shading_needs_gl40_or_gles32() {
        assert!(sample_shading_available(true, (4, 0)));
        assert!(sample_shading_available(true, (4, 6)));
        assert!(!sample_shading_available(true, (3, 3)));
        assert!(sample_shading_available(false, (3, 2)));
        assert!(!sample_shading_available(false, (3, 1)));
    }

    #[test]
    fn swapchain_format_preference() {
        assert_eq!(DESKTOP_SWAPCHAIN_FORMATS[0], glow::RGB10_A2 as i64);
        assert_eq!(ES_SWAPCHAIN_FORMATS[2], glow::SRGB8_ALPHA8 as i64);
        assert_eq!(DEPTH_FORMAT, glow::DEPTH_COMPONENT32F as i64);
    }
}
