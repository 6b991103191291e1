// Neutral descriptor -> D3D11/D3D12 value translation
//
// D3D11 and D3D12 wrap the same numeric values in distinct newtypes
// (D3D11_BLEND vs D3D12_BLEND, ...), so these return the raw values and each
// backend wraps them. Kept free of the `windows` crate so they are checked
// on every platform.

use anyhow::Result;

use crate::backend::types::*;

pub const DXGI_FORMAT_R32G32B32A32_FLOAT: i32 = 2;
pub const DXGI_FORMAT_R32G32B32A32_UINT: i32 = 3;
pub const DXGI_FORMAT_R32G32B32A32_SINT: i32 = 4;
pub const DXGI_FORMAT_R32G32B32_FLOAT: i32 = 6;
pub const DXGI_FORMAT_R32G32B32_UINT: i32 = 7;
pub const DXGI_FORMAT_R32G32B32_SINT: i32 = 8;
pub const DXGI_FORMAT_R32G32_FLOAT: i32 = 16;
pub const DXGI_FORMAT_R32G32_UINT: i32 = 17;
pub const DXGI_FORMAT_R32G32_SINT: i32 = 18;
pub const DXGI_FORMAT_R8G8B8A8_UNORM: i32 = 28;
pub const DXGI_FORMAT_R8G8B8A8_UNORM_SRGB: i32 = 29;
pub const DXGI_FORMAT_D32_FLOAT: i32 = 40;
pub const DXGI_FORMAT_R32_FLOAT: i32 = 41;
pub const DXGI_FORMAT_R32_UINT: i32 = 42;
pub const DXGI_FORMAT_R32_SINT: i32 = 43;
pub const DXGI_FORMAT_R16_UINT: i32 = 57;
pub const DXGI_FORMAT_B8G8R8A8_UNORM: i32 = 87;
pub const DXGI_FORMAT_B8G8R8A8_UNORM_SRGB: i32 = 91;

/// Colour swapchain formats in preference order
pub const SUPPORTED_SWAPCHAIN_FORMATS: [i64; 4] = [
    DXGI_FORMAT_R8G8B8A8_UNORM as i64,
    DXGI_FORMAT_B8G8R8A8_UNORM as i64,
    DXGI_FORMAT_R8G8B8A8_UNORM_SRGB as i64,
    DXGI_FORMAT_B8G8R8A8_UNORM_SRGB as i64,
];

pub const DEPTH_FORMAT: i64 = DXGI_FORMAT_D32_FLOAT as i64;

/// Both APIs require constant buffer views on 256 byte boundaries
pub const CONSTANT_BUFFER_ALIGNMENT: usize = 256;

pub fn vertex_format(ty: VertexType) -> i32 {
    match ty {
        VertexType::Float => DXGI_FORMAT_R32_FLOAT,
        VertexType::Vec2 => DXGI_FORMAT_R32G32_FLOAT,
        VertexType::Vec3 => DXGI_FORMAT_R32G32B32_FLOAT,
        VertexType::Vec4 => DXGI_FORMAT_R32G32B32A32_FLOAT,
        VertexType::Int => DXGI_FORMAT_R32_SINT,
        VertexType::IVec2 => DXGI_FORMAT_R32G32_SINT,
        VertexType::IVec3 => DXGI_FORMAT_R32G32B32_SINT,
        VertexType::IVec4 => DXGI_FORMAT_R32G32B32A32_SINT,
        VertexType::UInt => DXGI_FORMAT_R32_UINT,
        VertexType::UVec2 => DXGI_FORMAT_R32G32_UINT,
        VertexType::UVec3 => DXGI_FORMAT_R32G32B32_UINT,
        VertexType::UVec4 => DXGI_FORMAT_R32G32B32A32_UINT,
    }
}

pub fn index_format(info: &BufferCreateInfo) -> i32 {
    if info.index_is_u32() {
        DXGI_FORMAT_R32_UINT
    } else {
        DXGI_FORMAT_R16_UINT
    }
}

/// D3D_PRIMITIVE_TOPOLOGY
pub fn topology(topology: PrimitiveTopology) -> Result<i32> {
    Ok(match topology {
        PrimitiveTopology::PointList => 1,
        PrimitiveTopology::LineList => 2,
        PrimitiveTopology::LineStrip => 3,
        PrimitiveTopology::TriangleList => 4,
        PrimitiveTopology::TriangleStrip => 5,
        PrimitiveTopology::TriangleFan => anyhow::bail!("Direct3D has no triangle fan topology"),
    })
}

/// D3D12_PRIMITIVE_TOPOLOGY_TYPE for pipeline state objects
pub fn topology_type(topology: PrimitiveTopology) -> i32 {
    match topology {
        PrimitiveTopology::PointList => 1,
        PrimitiveTopology::LineList | PrimitiveTopology::LineStrip => 2,
        _ => 3,
    }
}

/// D3D1x_FILL_MODE
pub fn fill_mode(mode: PolygonMode) -> Result<i32> {
    match mode {
        PolygonMode::Line => Ok(2),
        PolygonMode::Fill => Ok(3),
        PolygonMode::Point => anyhow::bail!("Direct3D has no point fill mode"),
    }
}

/// D3D1x_CULL_MODE
pub fn cull_mode(mode: CullMode) -> Result<i32> {
    match mode {
        CullMode::None => Ok(1),
        CullMode::Front => Ok(2),
        CullMode::Back => Ok(3),
        CullMode::FrontAndBack => anyhow::bail!("Direct3D cannot cull both faces"),
    }
}

/// D3D1x_COMPARISON_FUNC
pub fn comparison_func(op: CompareOp) -> i32 {
    match op {
        CompareOp::Never => 1,
        CompareOp::Less => 2,
        CompareOp::Equal => 3,
        CompareOp::LessOrEqual => 4,
        CompareOp::Greater => 5,
        CompareOp::NotEqual => 6,
        CompareOp::GreaterOrEqual => 7,
        CompareOp::Always => 8,
    }
}

/// D3D1x_STENCIL_OP
pub fn stencil_op(op: StencilOp) -> i32 {
    match op {
        StencilOp::Keep => 1,
        StencilOp::Zero => 2,
        StencilOp::Replace => 3,
        StencilOp::IncrementAndClamp => 4,
        StencilOp::DecrementAndClamp => 5,
        StencilOp::Invert => 6,
        StencilOp::IncrementAndWrap => 7,
        StencilOp::DecrementAndWrap => 8,
    }
}

/// D3D1x_BLEND
pub fn blend(factor: BlendFactor) -> i32 {
    match factor {
        BlendFactor::Zero => 1,
        BlendFactor::One => 2,
        BlendFactor::SrcColour => 3,
        BlendFactor::OneMinusSrcColour => 4,
        BlendFactor::SrcAlpha => 5,
        BlendFactor::OneMinusSrcAlpha => 6,
        BlendFactor::DstAlpha => 7,
        BlendFactor::OneMinusDstAlpha => 8,
        BlendFactor::DstColour => 9,
        BlendFactor::OneMinusDstColour => 10,
    }
}

/// D3D1x_BLEND_OP
pub fn blend_op(op: BlendOp) -> i32 {
    match op {
        BlendOp::Add => 1,
        BlendOp::Subtract => 2,
        BlendOp::ReverseSubtract => 3,
        BlendOp::Min => 4,
        BlendOp::Max => 5,
    }
}

/// D3D12_LOGIC_OP
pub fn logic_op(op: LogicOp) -> i32 {
    match op {
        LogicOp::Clear => 0,
        LogicOp::Set => 1,
        LogicOp::Copy => 2,
        LogicOp::CopyInverted => 3,
        LogicOp::NoOp => 4,
        LogicOp::Invert => 5,
        LogicOp::And => 6,
        LogicOp::Nand => 7,
        LogicOp::Or => 8,
        LogicOp::Nor => 9,
        LogicOp::Xor => 10,
        LogicOp::Equivalent => 11,
        LogicOp::AndReverse => 12,
        LogicOp::AndInverted => 13,
        LogicOp::OrReverse => 14,
        LogicOp::OrInverted => 15,
    }
}

/// D3D1x_FILTER built from its min/mag/mip/comparison bit fields
pub fn filter(info: &SamplerCreateInfo) -> i32 {
    let bit = |f: Filter| match f {
        Filter::Nearest => 0,
        Filter::Linear => 1,
    };
    let mip = match info.mipmap_mode {
        MipmapMode::Linear => 1,
        MipmapMode::Nearest | MipmapMode::NoOp => 0,
    };
    let comparison = if info.compare_enable { 0x80 } else { 0 };
    comparison | (bit(info.min_filter) << 4) | (bit(info.mag_filter) << 2) | mip
}

/// D3D1x_TEXTURE_ADDRESS_MODE
pub fn address_mode(mode: AddressMode) -> i32 {
    match mode {
        AddressMode::Repeat => 1,
        AddressMode::MirroredRepeat => 2,
        AddressMode::ClampToEdge => 3,
        AddressMode::ClampToBorder => 4,
        AddressMode::MirrorClampToEdge => 5,
    }
}

/// Mip range of a sampler; MipmapMode::NoOp pins sampling to the base level
pub fn lod_range(info: &SamplerCreateInfo) -> (f32, f32) {
    match info.mipmap_mode {
        MipmapMode::NoOp => (0.0, 0.0),
        _ => (info.min_lod, info.max_lod),
    }
}

/// Split "TEXCOORD1" into ("TEXCOORD", 1)
pub fn split_semantic(name: &str) -> (&str, u32) {
    let base = name.trim_end_matches(|c: char| c.is_ascii_digit());
    let index = name[base.len()..].parse().unwrap_or(0);
    (base, index)
}

/// Round a constant buffer size or offset up to the CBV alignment
pub fn align_constant_buffer(size: usize) -> usize {
    size.div_ceil(CONSTANT_BUFFER_ALIGNMENT) * CONSTANT_BUFFER_ALIGNMENT
}

/// Shader constants (16 bytes) one cbuffer binding may address
pub const MAX_CONSTANT_BUFFER_CONSTANTS: u32 = 4096;

/// `(first_constant, num_constants)` for `*SetConstantBuffers1`
pub fn constant_buffer_window(offset: usize, size: usize) -> Result<(u32, u32)> {
    if offset % CONSTANT_BUFFER_ALIGNMENT != 0 {
        anyhow::bail!(
            "Constant buffer offset {} is not {}-byte aligned",
            offset,
            CONSTANT_BUFFER_ALIGNMENT
        );
    }
    let first = (offset / 16) as u32;
    let count = (align_constant_buffer(size) / 16) as u32;
    if count > MAX_CONSTANT_BUFFER_CONSTANTS {
        anyhow::bail!(
            "Constant buffer range of {} bytes exceeds {} constants",
            size,
            MAX_CONSTANT_BUFFER_CONSTANTS
        );
    }
    Ok((first, count))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swapchain_formats_match_dxgi() {
        assert_eq!(SUPPORTED_SWAPCHAIN_FORMATS[0], 28);
        assert_eq!(SUPPORTED_SWAPCHAIN_FORMATS[3], 91);
        assert_eq!(DEPTH_FORMAT, 40);
    }

    #[test]
    fn vertex_and_index_formats() {
        assert_eq!(vertex_format(VertexType::Vec4), DXGI_FORMAT_R32G32B32A32_FLOAT);
        assert_eq!(vertex_format(VertexType::UVec3), DXGI_FORMAT_R32G32B32_UINT);
        let mut info = BufferCreateInfo {
            kind: BufferKind::Index,
            stride: 4,
            size: 36 * 4,
            data: None,
            index_buffer_uint16: false,
        };
        assert_eq!(index_format(&info), DXGI_FORMAT_R32_UINT);
        info.stride = 2;
        assert_eq!(index_format(&info), DXGI_FORMAT_R16_UINT);
    }

    #[test]
    fn unsupported_states_are_errors() {
        assert!(topology(PrimitiveTopology::TriangleFan).is_err());
        assert!(fill_mode(PolygonMode::Point).is_err());
        assert!(cull_mode(CullMode::FrontAndBack).is_err());
        assert_eq!(topology(PrimitiveTopology::TriangleList).unwrap(), 4);
        assert_eq!(cull_mode(CullMode::Back).unwrap(), 3);
    }

    #[test]
    fn blend_factor_order_differs_from_vulkan() {
        assert_eq!(blend(BlendFactor::SrcAlpha), 5);
        assert_eq!(blend(BlendFactor::DstColour), 9);
    }

    #[test]
    fn comparison_values() {
        assert_eq!(comparison_func(CompareOp::Never), 1);
        assert_eq!(comparison_func(CompareOp::LessOrEqual), 4);
        assert_eq!(comparison_func(CompareOp::Always), 8);
    }

    #[test]
    fn filter_encoding() {
        let mut info = SamplerCreateInfo::default();
        // D3D11_FILTER_MIN_MAG_MIP_LINEAR
        assert_eq!(filter(&info), 0x15);
        info.min_filter = Filter::Nearest;
        info.mag_filter = Filter::Nearest;
        info.mipmap_mode = MipmapMode::Nearest;
        assert_eq!(filter(&info), 0);
        info.compare_enable = true;
        assert_eq!(filter(&info), 0x80);
    }

    #[test]
    fn no_op_mipmap_pins_base_level() {
        let info = SamplerCreateInfo {
            mipmap_mode: MipmapMode::NoOp,
            ..Default::default()
        };
        assert_eq!(lod_range(&info), (0.0, 0.0));
    }

    #[test]
    fn semantic_names_split_index() {
        assert_eq!(split_semantic("TEXCOORD1"), ("TEXCOORD", 1));
        assert_eq!(split_semantic("POSITION"), ("POSITION", 0));
        assert_eq!(split_semantic("COLOR12"), ("COLOR", 12));
    }

    #[test]
    fn constant_buffer_alignment() {
        assert_eq!(align_constant_buffer(1), 256);
        assert_eq!(align_constant_buffer(256), 256);
        assert_eq!(align_constant_buffer(257), 512);
        assert_eq!(align_constant_buffer(0), 0);
    }

    #[test]
    fn constant_buffer_window_counts_constants() {
        // Camera block for the third draw in a per-view buffer
        assert_eq!(constant_buffer_window(512, 256).unwrap(), (32, 16));
        // Partial blocks round up to a whole 256 byte window
        assert_eq!(constant_buffer_window(0, 96).unwrap(), (0, 16));
    }

    #[test]
    fn constant_buffer_window_rejects_bad_ranges() {
        assert!(constant_buffer_window(64, 256).is_err());
        assert!(constant_buffer_window(0, 65536 + 1).is_err());
        assert!(constant_buffer_window(0, 65536).is_ok());
    }
}
