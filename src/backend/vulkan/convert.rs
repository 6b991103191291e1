// Neutral descriptor -> Vulkan enum translation

use ash::vk;

use crate::backend::types::*;

/// Colour swapchain formats in preference order
pub const SUPPORTED_SWAPCHAIN_FORMATS: [i64; 4] = [
    vk::Format::B8G8R8A8_SRGB.as_raw() as i64,
    vk::Format::R8G8B8A8_SRGB.as_raw() as i64,
    vk::Format::B8G8R8A8_UNORM.as_raw() as i64,
    vk::Format::R8G8B8A8_UNORM.as_raw() as i64,
];

pub const DEPTH_FORMAT: i64 = vk::Format::D32_SFLOAT.as_raw() as i64;

pub fn format(format: i64) -> vk::Format {
    vk::Format::from_raw(format as i32)
}

pub fn vertex_format(ty: VertexType) -> vk::Format {
    match ty {
        VertexType::Float => vk::Format::R32_SFLOAT,
        VertexType::Vec2 => vk::Format::R32G32_SFLOAT,
        VertexType::Vec3 => vk::Format::R32G32B32_SFLOAT,
        VertexType::Vec4 => vk::Format::R32G32B32A32_SFLOAT,
        VertexType::Int => vk::Format::R32_SINT,
        VertexType::IVec2 => vk::Format::R32G32_SINT,
        VertexType::IVec3 => vk::Format::R32G32B32_SINT,
        VertexType::IVec4 => vk::Format::R32G32B32A32_SINT,
        VertexType::UInt => vk::Format::R32_UINT,
        VertexType::UVec2 => vk::Format::R32G32_UINT,
        VertexType::UVec3 => vk::Format::R32G32B32_UINT,
        VertexType::UVec4 => vk::Format::R32G32B32A32_UINT,
    }
}

pub fn topology(topology: PrimitiveTopology) -> vk::PrimitiveTopology {
    match topology {
        PrimitiveTopology::PointList => vk::PrimitiveTopology::POINT_LIST,
        PrimitiveTopology::LineList => vk::PrimitiveTopology::LINE_LIST,
        PrimitiveTopology::LineStrip => vk::PrimitiveTopology::LINE_STRIP,
        PrimitiveTopology::TriangleList => vk::PrimitiveTopology::TRIANGLE_LIST,
        PrimitiveTopology::TriangleStrip => vk::PrimitiveTopology::TRIANGLE_STRIP,
        PrimitiveTopology::TriangleFan => vk::PrimitiveTopology::TRIANGLE_FAN,
    }
}

pub fn polygon_mode(mode: PolygonMode) -> vk::PolygonMode {
    match mode {
        PolygonMode::Fill => vk::PolygonMode::FILL,
        PolygonMode::Line => vk::PolygonMode::LINE,
        PolygonMode::Point => vk::PolygonMode::POINT,
    }
}

pub fn cull_mode(mode: CullMode) -> vk::CullModeFlags {
    match mode {
        CullMode::None => vk::CullModeFlags::NONE,
        CullMode::Front => vk::CullModeFlags::FRONT,
        CullMode::Back => vk::CullModeFlags::BACK,
        CullMode::FrontAndBack => vk::CullModeFlags::FRONT_AND_BACK,
    }
}

pub fn front_face(face: FrontFace) -> vk::FrontFace {
    match face {
        FrontFace::CounterClockwise => vk::FrontFace::COUNTER_CLOCKWISE,
        FrontFace::Clockwise => vk::FrontFace::CLOCKWISE,
    }
}

pub fn compare_op(op: CompareOp) -> vk::CompareOp {
    match op {
        CompareOp::Never => vk::CompareOp::NEVER,
        CompareOp::Less => vk::CompareOp::LESS,
        CompareOp::Equal => vk::CompareOp::EQUAL,
        CompareOp::LessOrEqual => vk::CompareOp::LESS_OR_EQUAL,
        CompareOp::Greater => vk::CompareOp::GREATER,
        CompareOp::NotEqual => vk::CompareOp::NOT_EQUAL,
        CompareOp::GreaterOrEqual => vk::CompareOp::GREATER_OR_EQUAL,
        CompareOp::Always => vk::CompareOp::ALWAYS,
    }
}

pub fn stencil_op(op: StencilOp) -> vk::StencilOp {
    match op {
        StencilOp::Keep => vk::StencilOp::KEEP,
        StencilOp::Zero => vk::StencilOp::ZERO,
        StencilOp::Replace => vk::StencilOp::REPLACE,
        StencilOp::IncrementAndClamp => vk::StencilOp::INCREMENT_AND_CLAMP,
        StencilOp::DecrementAndClamp => vk::StencilOp::DECREMENT_AND_CLAMP,
        StencilOp::Invert => vk::StencilOp::INVERT,
        StencilOp::IncrementAndWrap => vk::StencilOp::INCREMENT_AND_WRAP,
        StencilOp::DecrementAndWrap => vk::StencilOp::DECREMENT_AND_WRAP,
    }
}

pub fn stencil_op_state(state: &StencilOpState) -> vk::StencilOpState {
    vk::StencilOpState {
        fail_op: stencil_op(state.fail_op),
        pass_op: stencil_op(state.pass_op),
        depth_fail_op: stencil_op(state.depth_fail_op),
        compare_op: compare_op(state.compare_op),
        compare_mask: state.compare_mask,
        write_mask: state.write_mask,
        reference: state.reference,
    }
}

pub fn blend_factor(factor: BlendFactor) -> vk::BlendFactor {
    match factor {
        BlendFactor::Zero => vk::BlendFactor::ZERO,
        BlendFactor::One => vk::BlendFactor::ONE,
        BlendFactor::SrcColour => vk::BlendFactor::SRC_COLOR,
        BlendFactor::OneMinusSrcColour => vk::BlendFactor::ONE_MINUS_SRC_COLOR,
        BlendFactor::DstColour => vk::BlendFactor::DST_COLOR,
        BlendFactor::OneMinusDstColour => vk::BlendFactor::ONE_MINUS_DST_COLOR,
        BlendFactor::SrcAlpha => vk::BlendFactor::SRC_ALPHA,
        BlendFactor::OneMinusSrcAlpha => vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
        BlendFactor::DstAlpha => vk::BlendFactor::DST_ALPHA,
        BlendFactor::OneMinusDstAlpha => vk::BlendFactor::ONE_MINUS_DST_ALPHA,
    }
}

pub fn blend_op(op: BlendOp) -> vk::BlendOp {
    match op {
        BlendOp::Add => vk::BlendOp::ADD,
        BlendOp::Subtract => vk::BlendOp::SUBTRACT,
        BlendOp::ReverseSubtract => vk::BlendOp::REVERSE_SUBTRACT,
        BlendOp::Min => vk::BlendOp::MIN,
        BlendOp::Max => vk::BlendOp::MAX,
    }
}

pub fn colour_mask(mask: ColourComponent) -> vk::ColorComponentFlags {
    vk::ColorComponentFlags::from_raw(mask.bits() as u32)
}

pub fn logic_op(op: LogicOp) -> vk::LogicOp {
    // Declaration order matches VkLogicOp
    vk::LogicOp::from_raw(op as i32)
}

pub fn filter(filter: Filter) -> vk::Filter {
    match filter {
        Filter::Nearest => vk::Filter::NEAREST,
        Filter::Linear => vk::Filter::LINEAR,
    }
}

pub fn mipmap_mode(mode: MipmapMode) -> vk::SamplerMipmapMode {
    match mode {
        MipmapMode::Nearest | MipmapMode::NoOp => vk::SamplerMipmapMode::NEAREST,
        MipmapMode::Linear => vk::SamplerMipmapMode::LINEAR,
    }
}

pub fn address_mode(mode: AddressMode) -> vk::SamplerAddressMode {
    match mode {
        AddressMode::Repeat => vk::SamplerAddressMode::REPEAT,
        AddressMode::MirroredRepeat => vk::SamplerAddressMode::MIRRORED_REPEAT,
        AddressMode::ClampToEdge => vk::SamplerAddressMode::CLAMP_TO_EDGE,
        AddressMode::ClampToBorder => vk::SamplerAddressMode::CLAMP_TO_BORDER,
        AddressMode::MirrorClampToEdge => vk::SamplerAddressMode::MIRROR_CLAMP_TO_EDGE,
    }
}

pub fn border_colour(rgba: [f32; 4]) -> vk::BorderColor {
    match BorderColour::from_rgba(rgba) {
        BorderColour::OpaqueWhite => vk::BorderColor::FLOAT_OPAQUE_WHITE,
        BorderColour::OpaqueBlack => vk::BorderColor::FLOAT_OPAQUE_BLACK,
        BorderColour::TransparentBlack => vk::BorderColor::FLOAT_TRANSPARENT_BLACK,
    }
}

pub fn image_type(dimension: u32) -> vk::ImageType {
    match dimension {
        1 => vk::ImageType::TYPE_1D,
        3 => vk::ImageType::TYPE_3D,
        _ => vk::ImageType::TYPE_2D,
    }
}

pub fn view_type(view: ImageViewType) -> vk::ImageViewType {
    match view {
        ImageViewType::Type1D => vk::ImageViewType::TYPE_1D,
        ImageViewType::Type2D => vk::ImageViewType::TYPE_2D,
        ImageViewType::Type3D => vk::ImageViewType::TYPE_3D,
        ImageViewType::TypeCube => vk::ImageViewType::CUBE,
        ImageViewType::Type1DArray => vk::ImageViewType::TYPE_1D_ARRAY,
        ImageViewType::Type2DArray => vk::ImageViewType::TYPE_2D_ARRAY,
        ImageViewType::TypeCubeArray => vk::ImageViewType::CUBE_ARRAY,
    }
}

pub fn aspect(aspect: ImageAspect) -> vk::ImageAspectFlags {
    vk::ImageAspectFlags::from_raw(aspect.bits() as u32)
}

pub fn sample_count(count: u32) -> vk::SampleCountFlags {
    match count {
        2 => vk::SampleCountFlags::TYPE_2,
        4 => vk::SampleCountFlags::TYPE_4,
        8 => vk::SampleCountFlags::TYPE_8,
        16 => vk::SampleCountFlags::TYPE_16,
        32 => vk::SampleCountFlags::TYPE_32,
        64 => vk::SampleCountFlags::TYPE_64,
        _ => vk::SampleCountFlags::TYPE_1,
    }
}

pub fn image_usage(info: &ImageCreateInfo) -> vk::ImageUsageFlags {
    let mut usage = vk::ImageUsageFlags::TRANSFER_DST;
    if info.sampled {
        usage |= vk::ImageUsageFlags::SAMPLED;
    }
    if info.colour_attachment {
        usage |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
    }
    if info.depth_attachment {
        usage |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
    }
    usage
}

pub fn image_create_flags(info: &ImageCreateInfo) -> vk::ImageCreateFlags {
    let mut flags = vk::ImageCreateFlags::empty();
    if info.cubemap {
        flags |= vk::ImageCreateFlags::CUBE_COMPATIBLE;
    }
    if info.dimension == 3 {
        flags |= vk::ImageCreateFlags::TYPE_2D_ARRAY_COMPATIBLE;
    }
    flags
}

pub fn buffer_usage(kind: BufferKind) -> vk::BufferUsageFlags {
    vk::BufferUsageFlags::TRANSFER_DST
        | match kind {
            BufferKind::Vertex => vk::BufferUsageFlags::VERTEX_BUFFER,
            BufferKind::Index => vk::BufferUsageFlags::INDEX_BUFFER,
            BufferKind::Uniform => vk::BufferUsageFlags::UNIFORM_BUFFER,
        }
}

pub fn index_type(info: &BufferCreateInfo) -> vk::IndexType {
    if info.index_is_u32() {
        vk::IndexType::UINT32
    } else {
        vk::IndexType::UINT16
    }
}

pub fn shader_stage(stage: ShaderStage) -> vk::ShaderStageFlags {
    match stage {
        ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
        ShaderStage::TessellationControl => vk::ShaderStageFlags::TESSELLATION_CONTROL,
        ShaderStage::TessellationEvaluation => vk::ShaderStageFlags::TESSELLATION_EVALUATION,
        ShaderStage::Geometry => vk::ShaderStageFlags::GEOMETRY,
        ShaderStage::Fragment => vk::ShaderStageFlags::FRAGMENT,
        ShaderStage::Compute => vk::ShaderStageFlags::COMPUTE,
    }
}

pub fn descriptor_type(info: &DescriptorInfo) -> vk::DescriptorType {
    match (info.descriptor_type(), info.read_write) {
        (DescriptorType::Buffer, false) => vk::DescriptorType::UNIFORM_BUFFER,
        (DescriptorType::Buffer, true) => vk::DescriptorType::STORAGE_BUFFER,
        (DescriptorType::Image, false) => vk::DescriptorType::SAMPLED_IMAGE,
        (DescriptorType::Image, true) => vk::DescriptorType::STORAGE_IMAGE,
        (DescriptorType::Sampler, _) => vk::DescriptorType::SAMPLER,
    }
}

pub fn is_depth_format(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D16_UNORM
            | vk::Format::X8_D24_UNORM_PACK32
            | vk::Format::D32_SFLOAT
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swapchain_formats_prefer_srgb() {
        assert_eq!(format(SUPPORTED_SWAPCHAIN_FORMATS[0]), vk::Format::B8G8R8A8_SRGB);
        assert_eq!(format(SUPPORTED_SWAPCHAIN_FORMATS[3]), vk::Format::R8G8B8A8_UNORM);
        assert_eq!(format(DEPTH_FORMAT), vk::Format::D32_SFLOAT);
    }

    #[test]
    fn vertex_formats() {
        assert_eq!(vertex_format(VertexType::Vec4), vk::Format::R32G32B32A32_SFLOAT);
        assert_eq!(vertex_format(VertexType::IVec2), vk::Format::R32G32_SINT);
        assert_eq!(vertex_format(VertexType::UInt), vk::Format::R32_UINT);
    }

    #[test]
    fn logic_op_order_matches() {
        assert_eq!(logic_op(LogicOp::Clear), vk::LogicOp::CLEAR);
        assert_eq!(logic_op(LogicOp::Xor), vk::LogicOp::XOR);
        assert_eq!(logic_op(LogicOp::Set), vk::LogicOp::SET);
    }

    #[test]
    fn border_colour_choices() {
        assert_eq!(border_colour([1.0; 4]), vk::BorderColor::FLOAT_OPAQUE_WHITE);
        assert_eq!(
            border_colour([0.0, 0.0, 0.0, 1.0]),
            vk::BorderColor::FLOAT_OPAQUE_BLACK
        );
        assert_eq!(
            border_colour([0.0; 4]),
            vk::BorderColor::FLOAT_TRANSPARENT_BLACK
        );
    }

    #[test]
    fn usage_flags_follow_create_info() {
        let info = ImageCreateInfo {
            dimension: 2,
            width: 64,
            height: 64,
            depth: 1,
            mip_levels: 1,
            array_layers: 1,
            sample_count: 1,
            format: DEPTH_FORMAT,
            cubemap: false,
            colour_attachment: false,
            depth_attachment: true,
            sampled: false,
        };
        let usage = image_usage(&info);
        assert!(usage.contains(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT));
        assert!(!usage.contains(vk::ImageUsageFlags::COLOR_ATTACHMENT));
        assert!(image_create_flags(&info).is_empty());
    }

    #[test]
    fn descriptor_types() {
        let mut info = DescriptorInfo {
            binding_index: 0,
            resource: DescriptorResource::Buffer(crate::backend::BufferHandle::from_raw(1)),
            stage: ShaderStage::Vertex,
            read_write: false,
            buffer_offset: 0,
            buffer_size: 0,
        };
        assert_eq!(descriptor_type(&info), vk::DescriptorType::UNIFORM_BUFFER);
        info.read_write = true;
        assert_eq!(descriptor_type(&info), vk::DescriptorType::STORAGE_BUFFER);
    }

    #[test]
    fn masks_keep_bit_layout() {
        assert_eq!(colour_mask(ColourComponent::all()), vk::ColorComponentFlags::RGBA);
        assert_eq!(
            aspect(ImageAspect::DEPTH | ImageAspect::STENCIL),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
    }

    #[test]
    fn depth_detection() {
        assert!(is_depth_format(vk::Format::D32_SFLOAT));
        assert!(!is_depth_format(vk::Format::R8G8B8A8_SRGB));
    }
}
