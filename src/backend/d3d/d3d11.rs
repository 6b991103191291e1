// D3D11 backend
//
// The immediate context records directly, so begin/end_rendering only track
// state. Uniform buffers keep a CPU shadow copy: D3D11 dynamic buffers can
// only be written with MAP_WRITE_DISCARD, which would otherwise drop every
// region except the one just written.

use anyhow::{Context, Result};
use openxr as xr;
use std::ffi::CString;
use windows::core::Interface;
use windows::Win32::Foundation::{BOOL, HMODULE, RECT};
use windows::Win32::Graphics::Direct3D::*;
use windows::Win32::Graphics::Direct3D11::*;
use windows::Win32::Graphics::Dxgi::Common::*;

use super::convert;
use crate::backend::handles::ResourceTable;
use crate::backend::types::*;
use crate::backend::{
    BufferHandle, GraphicsApi, GraphicsApiType, ImageHandle, ImageViewHandle, PipelineHandle,
    SamplerHandle, ShaderHandle,
};

struct D3D11Image {
    resource: ID3D11Resource,
    swapchain: bool,
}

enum D3D11View {
    Rtv(ID3D11RenderTargetView),
    Dsv(ID3D11DepthStencilView),
    Srv(ID3D11ShaderResourceView),
    Uav(ID3D11UnorderedAccessView),
}

impl D3D11View {
    fn raw(&self) -> u64 {
        match self {
            D3D11View::Rtv(v) => v.as_raw() as u64,
            D3D11View::Dsv(v) => v.as_raw() as u64,
            D3D11View::Srv(v) => v.as_raw() as u64,
            D3D11View::Uav(v) => v.as_raw() as u64,
        }
    }
}

struct D3D11Buffer {
    buffer: ID3D11Buffer,
    info: BufferCreateInfo,
    /// CPU copy of dynamic (uniform) buffers
    shadow: Option<Vec<u8>>,
}

enum D3D11Shader {
    Vertex(ID3D11VertexShader, Vec<u8>),
    Pixel(ID3D11PixelShader),
    Geometry(ID3D11GeometryShader),
    Hull(ID3D11HullShader),
    Domain(ID3D11DomainShader),
    Compute(ID3D11ComputeShader),
}

impl D3D11Shader {
    fn raw(&self) -> u64 {
        match self {
            D3D11Shader::Vertex(s, _) => s.as_raw() as u64,
            D3D11Shader::Pixel(s) => s.as_raw() as u64,
            D3D11Shader::Geometry(s) => s.as_raw() as u64,
            D3D11Shader::Hull(s) => s.as_raw() as u64,
            D3D11Shader::Domain(s) => s.as_raw() as u64,
            D3D11Shader::Compute(s) => s.as_raw() as u64,
        }
    }
}

#[derive(Default)]
struct D3D11Pipeline {
    vertex: Option<ID3D11VertexShader>,
    pixel: Option<ID3D11PixelShader>,
    geometry: Option<ID3D11GeometryShader>,
    hull: Option<ID3D11HullShader>,
    domain: Option<ID3D11DomainShader>,
    input_layout: Option<ID3D11InputLayout>,
    blend_state: Option<ID3D11BlendState>,
    rasterizer_state: Option<ID3D11RasterizerState>,
    depth_stencil_state: Option<ID3D11DepthStencilState>,
    topology: D3D_PRIMITIVE_TOPOLOGY,
    stencil_ref: u32,
    blend_constants: [f32; 4],
    sample_mask: u32,
    /// (binding index, stride) for each vertex buffer slot
    strides: Vec<(u32, u32)>,
}

pub struct D3D11Api {
    device: ID3D11Device,
    context: ID3D11DeviceContext,
    context1: ID3D11DeviceContext1,

    images: ResourceTable<ImageHandle, D3D11Image>,
    image_views: ResourceTable<ImageViewHandle, D3D11View>,
    samplers: ResourceTable<SamplerHandle, ID3D11SamplerState>,
    buffers: ResourceTable<BufferHandle, D3D11Buffer>,
    shaders: ResourceTable<ShaderHandle, D3D11Shader>,
    pipelines: ResourceTable<PipelineHandle, D3D11Pipeline>,

    recording: bool,
    current_pipeline: Option<PipelineHandle>,
    pending_descriptors: Vec<DescriptorInfo>,
}

impl D3D11Api {
    pub fn new(xr_instance: &xr::Instance, system: xr::SystemId, enable_debug: bool) -> Result<Self> {
        let reqs = xr_instance
            .graphics_requirements::<xr::D3D11>(system)
            .context("Failed to get D3D11 graphics requirements")?;
        let adapter = super::find_adapter(reqs.adapter_luid.LowPart, reqs.adapter_luid.HighPart)?;
        let feature_levels = [D3D_FEATURE_LEVEL(reqs.min_feature_level as i32)];

        let create = |flags: D3D11_CREATE_DEVICE_FLAG| {
            let mut device: Option<ID3D11Device> = None;
            let mut context: Option<ID3D11DeviceContext> = None;
            unsafe {
                D3D11CreateDevice(
                    &adapter,
                    D3D_DRIVER_TYPE_UNKNOWN,
                    HMODULE::default(),
                    flags,
                    Some(&feature_levels),
                    D3D11_SDK_VERSION,
                    Some(&mut device),
                    None,
                    Some(&mut context),
                )
            }
            .map(|_| (device, context))
        };

        // The debug layer needs the Graphics Tools optional feature
        let created = if enable_debug {
            create(D3D11_CREATE_DEVICE_DEBUG).or_else(|e| {
                log::warn!("D3D11 debug layer unavailable ({}), continuing without it", e);
                create(D3D11_CREATE_DEVICE_FLAG(0))
            })
        } else {
            create(D3D11_CREATE_DEVICE_FLAG(0))
        };
        let (device, context) = created.context("Failed to create D3D11 device")?;
        let device = device.context("D3D11CreateDevice returned no device")?;
        let context = context.context("D3D11CreateDevice returned no context")?;
        let context1: ID3D11DeviceContext1 = context
            .cast()
            .context("D3D11.1 device context is required")?;

        log::info!("Created D3D11 device");

        Ok(Self {
            device,
            context,
            context1,
            images: ResourceTable::new(),
            image_views: ResourceTable::new(),
            samplers: ResourceTable::new(),
            buffers: ResourceTable::new(),
            shaders: ResourceTable::new(),
            pipelines: ResourceTable::new(),
            recording: false,
            current_pipeline: None,
            pending_descriptors: Vec::new(),
        })
    }

    fn check_recording(&self) -> Result<()> {
        if !self.recording {
            anyhow::bail!("D3D11 command recorded outside begin_rendering/end_rendering");
        }
        Ok(())
    }

    fn bind_flags(info: &ImageCreateInfo) -> u32 {
        let mut flags = 0;
        if info.sampled {
            flags |= D3D11_BIND_SHADER_RESOURCE.0 as u32;
        }
        if info.colour_attachment {
            flags |= D3D11_BIND_RENDER_TARGET.0 as u32;
        }
        if info.depth_attachment {
            flags |= D3D11_BIND_DEPTH_STENCIL.0 as u32;
        }
        flags
    }

    fn create_texture(&self, info: &ImageCreateInfo) -> Result<ID3D11Resource> {
        let misc_mips = if info.mip_levels > 1 {
            D3D11_RESOURCE_MISC_GENERATE_MIPS.0 as u32
        } else {
            0
        };
        let format = DXGI_FORMAT(info.format as i32);

        let resource: ID3D11Resource = match info.dimension {
            1 => {
                let desc = D3D11_TEXTURE1D_DESC {
                    Width: info.width,
                    MipLevels: info.mip_levels,
                    ArraySize: info.array_layers,
                    Format: format,
                    Usage: D3D11_USAGE_DEFAULT,
                    BindFlags: Self::bind_flags(info),
                    CPUAccessFlags: 0,
                    MiscFlags: misc_mips,
                };
                let mut texture: Option<ID3D11Texture1D> = None;
                unsafe { self.device.CreateTexture1D(&desc, None, Some(&mut texture)) }
                    .context("Failed to create Texture1D")?;
                texture.context("CreateTexture1D returned null")?.cast()?
            }
            2 => {
                let cube = if info.cubemap {
                    D3D11_RESOURCE_MISC_TEXTURECUBE.0 as u32
                } else {
                    0
                };
                let desc = D3D11_TEXTURE2D_DESC {
                    Width: info.width,
                    Height: info.height,
                    MipLevels: info.mip_levels,
                    ArraySize: info.array_layers,
                    Format: format,
                    SampleDesc: DXGI_SAMPLE_DESC {
                        Count: info.sample_count.max(1),
                        Quality: 0,
                    },
                    Usage: D3D11_USAGE_DEFAULT,
                    BindFlags: Self::bind_flags(info),
                    CPUAccessFlags: 0,
                    MiscFlags: cube | misc_mips,
                };
                let mut texture: Option<ID3D11Texture2D> = None;
                unsafe { self.device.CreateTexture2D(&desc, None, Some(&mut texture)) }
                    .context("Failed to create Texture2D")?;
                texture.context("CreateTexture2D returned null")?.cast()?
            }
            3 => {
                let desc = D3D11_TEXTURE3D_DESC {
                    Width: info.width,
                    Height: info.height,
                    Depth: info.depth,
                    MipLevels: info.mip_levels,
                    Format: format,
                    Usage: D3D11_USAGE_DEFAULT,
                    BindFlags: Self::bind_flags(info),
                    CPUAccessFlags: 0,
                    MiscFlags: misc_mips,
                };
                let mut texture: Option<ID3D11Texture3D> = None;
                unsafe { self.device.CreateTexture3D(&desc, None, Some(&mut texture)) }
                    .context("Failed to create Texture3D")?;
                texture.context("CreateTexture3D returned null")?.cast()?
            }
            other => anyhow::bail!("Unknown image dimension {}", other),
        };
        Ok(resource)
    }

    fn create_rtv(&self, resource: &ID3D11Resource, info: &ImageViewCreateInfo) -> Result<D3D11View> {
        let (dimension, anonymous) = match info.view {
            ImageViewType::Type1D => (
                D3D11_RTV_DIMENSION_TEXTURE1D,
                D3D11_RENDER_TARGET_VIEW_DESC_0 {
                    Texture1D: D3D11_TEX1D_RTV {
                        MipSlice: info.base_mip_level,
                    },
                },
            ),
            ImageViewType::Type1DArray => (
                D3D11_RTV_DIMENSION_TEXTURE1DARRAY,
                D3D11_RENDER_TARGET_VIEW_DESC_0 {
                    Texture1DArray: D3D11_TEX1D_ARRAY_RTV {
                        MipSlice: info.base_mip_level,
                        FirstArraySlice: info.base_array_layer,
                        ArraySize: info.layer_count,
                    },
                },
            ),
            ImageViewType::Type2D => (
                D3D11_RTV_DIMENSION_TEXTURE2D,
                D3D11_RENDER_TARGET_VIEW_DESC_0 {
                    Texture2D: D3D11_TEX2D_RTV {
                        MipSlice: info.base_mip_level,
                    },
                },
            ),
            ImageViewType::Type2DArray => (
                D3D11_RTV_DIMENSION_TEXTURE2DARRAY,
                D3D11_RENDER_TARGET_VIEW_DESC_0 {
                    Texture2DArray: D3D11_TEX2D_ARRAY_RTV {
                        MipSlice: info.base_mip_level,
                        FirstArraySlice: info.base_array_layer,
                        ArraySize: info.layer_count,
                    },
                },
            ),
            ImageViewType::Type3D => (
                D3D11_RTV_DIMENSION_TEXTURE3D,
                D3D11_RENDER_TARGET_VIEW_DESC_0 {
                    Texture3D: D3D11_TEX3D_RTV {
                        MipSlice: info.base_mip_level,
                        FirstWSlice: info.base_array_layer,
                        WSize: info.layer_count,
                    },
                },
            ),
            other => anyhow::bail!("{:?} cannot be a render target view", other),
        };
        let desc = D3D11_RENDER_TARGET_VIEW_DESC {
            Format: DXGI_FORMAT(info.format as i32),
            ViewDimension: dimension,
            Anonymous: anonymous,
        };
        let mut view: Option<ID3D11RenderTargetView> = None;
        unsafe { self.device.CreateRenderTargetView(resource, Some(&desc), Some(&mut view)) }
            .context("Failed to create render target view")?;
        Ok(D3D11View::Rtv(view.context("CreateRenderTargetView returned null")?))
    }

    fn create_dsv(&self, resource: &ID3D11Resource, info: &ImageViewCreateInfo) -> Result<D3D11View> {
        let (dimension, anonymous) = match info.view {
            ImageViewType::Type1D => (
                D3D11_DSV_DIMENSION_TEXTURE1D,
                D3D11_DEPTH_STENCIL_VIEW_DESC_0 {
                    Texture1D: D3D11_TEX1D_DSV {
                        MipSlice: info.base_mip_level,
                    },
                },
            ),
            ImageViewType::Type1DArray => (
                D3D11_DSV_DIMENSION_TEXTURE1DARRAY,
                D3D11_DEPTH_STENCIL_VIEW_DESC_0 {
                    Texture1DArray: D3D11_TEX1D_ARRAY_DSV {
                        MipSlice: info.base_mip_level,
                        FirstArraySlice: info.base_array_layer,
                        ArraySize: info.layer_count,
                    },
                },
            ),
            ImageViewType::Type2D => (
                D3D11_DSV_DIMENSION_TEXTURE2D,
                D3D11_DEPTH_STENCIL_VIEW_DESC_0 {
                    Texture2D: D3D11_TEX2D_DSV {
                        MipSlice: info.base_mip_level,
                    },
                },
            ),
            ImageViewType::Type2DArray => (
                D3D11_DSV_DIMENSION_TEXTURE2DARRAY,
                D3D11_DEPTH_STENCIL_VIEW_DESC_0 {
                    Texture2DArray: D3D11_TEX2D_ARRAY_DSV {
                        MipSlice: info.base_mip_level,
                        FirstArraySlice: info.base_array_layer,
                        ArraySize: info.layer_count,
                    },
                },
            ),
            other => anyhow::bail!("{:?} cannot be a depth stencil view", other),
        };
        let desc = D3D11_DEPTH_STENCIL_VIEW_DESC {
            Format: DXGI_FORMAT(info.format as i32),
            ViewDimension: dimension,
            Flags: 0,
            Anonymous: anonymous,
        };
        let mut view: Option<ID3D11DepthStencilView> = None;
        unsafe { self.device.CreateDepthStencilView(resource, Some(&desc), Some(&mut view)) }
            .context("Failed to create depth stencil view")?;
        Ok(D3D11View::Dsv(view.context("CreateDepthStencilView returned null")?))
    }

    fn create_srv(&self, resource: &ID3D11Resource, info: &ImageViewCreateInfo) -> Result<D3D11View> {
        let (dimension, anonymous) = match info.view {
            ImageViewType::Type1D => (
                D3D11_SRV_DIMENSION_TEXTURE1D,
                D3D11_SHADER_RESOURCE_VIEW_DESC_0 {
                    Texture1D: D3D11_TEX1D_SRV {
                        MostDetailedMip: info.base_mip_level,
                        MipLevels: info.level_count,
                    },
                },
            ),
            ImageViewType::Type1DArray => (
                D3D11_SRV_DIMENSION_TEXTURE1DARRAY,
                D3D11_SHADER_RESOURCE_VIEW_DESC_0 {
                    Texture1DArray: D3D11_TEX1D_ARRAY_SRV {
                        MostDetailedMip: info.base_mip_level,
                        MipLevels: info.level_count,
                        FirstArraySlice: info.base_array_layer,
                        ArraySize: info.layer_count,
                    },
                },
            ),
            ImageViewType::Type2D => (
                D3D11_SRV_DIMENSION_TEXTURE2D,
                D3D11_SHADER_RESOURCE_VIEW_DESC_0 {
                    Texture2D: D3D11_TEX2D_SRV {
                        MostDetailedMip: info.base_mip_level,
                        MipLevels: info.level_count,
                    },
                },
            ),
            ImageViewType::Type2DArray => (
                D3D11_SRV_DIMENSION_TEXTURE2DARRAY,
                D3D11_SHADER_RESOURCE_VIEW_DESC_0 {
                    Texture2DArray: D3D11_TEX2D_ARRAY_SRV {
                        MostDetailedMip: info.base_mip_level,
                        MipLevels: info.level_count,
                        FirstArraySlice: info.base_array_layer,
                        ArraySize: info.layer_count,
                    },
                },
            ),
            ImageViewType::Type3D => (
                D3D11_SRV_DIMENSION_TEXTURE3D,
                D3D11_SHADER_RESOURCE_VIEW_DESC_0 {
                    Texture3D: D3D11_TEX3D_SRV {
                        MostDetailedMip: info.base_mip_level,
                        MipLevels: info.level_count,
                    },
                },
            ),
            ImageViewType::TypeCube => (
                D3D11_SRV_DIMENSION_TEXTURECUBE,
                D3D11_SHADER_RESOURCE_VIEW_DESC_0 {
                    TextureCube: D3D11_TEXCUBE_SRV {
                        MostDetailedMip: info.base_mip_level,
                        MipLevels: info.level_count,
                    },
                },
            ),
            ImageViewType::TypeCubeArray => (
                D3D11_SRV_DIMENSION_TEXTURECUBEARRAY,
                D3D11_SHADER_RESOURCE_VIEW_DESC_0 {
                    TextureCubeArray: D3D11_TEXCUBE_ARRAY_SRV {
                        MostDetailedMip: info.base_mip_level,
                        MipLevels: info.level_count,
                        First2DArrayFace: info.base_array_layer,
                        NumCubes: info.layer_count / 6,
                    },
                },
            ),
        };
        let desc = D3D11_SHADER_RESOURCE_VIEW_DESC {
            Format: DXGI_FORMAT(info.format as i32),
            ViewDimension: dimension,
            Anonymous: anonymous,
        };
        let mut view: Option<ID3D11ShaderResourceView> = None;
        unsafe { self.device.CreateShaderResourceView(resource, Some(&desc), Some(&mut view)) }
            .context("Failed to create shader resource view")?;
        Ok(D3D11View::Srv(view.context("CreateShaderResourceView returned null")?))
    }

    fn create_uav(&self, resource: &ID3D11Resource, info: &ImageViewCreateInfo) -> Result<D3D11View> {
        let (dimension, anonymous) = match info.view {
            ImageViewType::Type1D => (
                D3D11_UAV_DIMENSION_TEXTURE1D,
                D3D11_UNORDERED_ACCESS_VIEW_DESC_0 {
                    Texture1D: D3D11_TEX1D_UAV {
                        MipSlice: info.base_mip_level,
                    },
                },
            ),
            ImageViewType::Type1DArray => (
                D3D11_UAV_DIMENSION_TEXTURE1DARRAY,
                D3D11_UNORDERED_ACCESS_VIEW_DESC_0 {
                    Texture1DArray: D3D11_TEX1D_ARRAY_UAV {
                        MipSlice: info.base_mip_level,
                        FirstArraySlice: info.base_array_layer,
                        ArraySize: info.layer_count,
                    },
                },
            ),
            ImageViewType::Type2D => (
                D3D11_UAV_DIMENSION_TEXTURE2D,
                D3D11_UNORDERED_ACCESS_VIEW_DESC_0 {
                    Texture2D: D3D11_TEX2D_UAV {
                        MipSlice: info.base_mip_level,
                    },
                },
            ),
            ImageViewType::Type2DArray => (
                D3D11_UAV_DIMENSION_TEXTURE2DARRAY,
                D3D11_UNORDERED_ACCESS_VIEW_DESC_0 {
                    Texture2DArray: D3D11_TEX2D_ARRAY_UAV {
                        MipSlice: info.base_mip_level,
                        FirstArraySlice: info.base_array_layer,
                        ArraySize: info.layer_count,
                    },
                },
            ),
            ImageViewType::Type3D => (
                D3D11_UAV_DIMENSION_TEXTURE3D,
                D3D11_UNORDERED_ACCESS_VIEW_DESC_0 {
                    Texture3D: D3D11_TEX3D_UAV {
                        MipSlice: info.base_mip_level,
                        FirstWSlice: info.base_array_layer,
                        WSize: info.layer_count,
                    },
                },
            ),
            other => anyhow::bail!("{:?} cannot be an unordered access view", other),
        };
        let desc = D3D11_UNORDERED_ACCESS_VIEW_DESC {
            Format: DXGI_FORMAT(info.format as i32),
            ViewDimension: dimension,
            Anonymous: anonymous,
        };
        let mut view: Option<ID3D11UnorderedAccessView> = None;
        unsafe { self.device.CreateUnorderedAccessView(resource, Some(&desc), Some(&mut view)) }
            .context("Failed to create unordered access view")?;
        Ok(D3D11View::Uav(view.context("CreateUnorderedAccessView returned null")?))
    }

    fn create_input_layout(
        &self,
        state: &VertexInputState,
        bytecode: &[u8],
    ) -> Result<Option<ID3D11InputLayout>> {
        if state.attributes.is_empty() {
            return Ok(None);
        }

        // Semantic names must outlive CreateInputLayout
        let names = state
            .attributes
            .iter()
            .map(|a| {
                let (base, index) = convert::split_semantic(&a.semantic_name);
                Ok((CString::new(base)?, index))
            })
            .collect::<Result<Vec<_>>>()?;

        let elements: Vec<D3D11_INPUT_ELEMENT_DESC> = state
            .attributes
            .iter()
            .zip(&names)
            .map(|(a, (name, index))| D3D11_INPUT_ELEMENT_DESC {
                SemanticName: windows::core::PCSTR(name.as_ptr() as _),
                SemanticIndex: *index,
                Format: DXGI_FORMAT(convert::vertex_format(a.vertex_type)),
                InputSlot: a.binding_index,
                AlignedByteOffset: a.offset as u32,
                InputSlotClass: D3D11_INPUT_PER_VERTEX_DATA,
                InstanceDataStepRate: 0,
            })
            .collect();

        let mut layout: Option<ID3D11InputLayout> = None;
        unsafe { self.device.CreateInputLayout(&elements, bytecode, Some(&mut layout)) }
            .context("Failed to create input layout")?;
        Ok(layout)
    }

    fn bind_descriptor(&self, d: &DescriptorInfo) -> Result<()> {
        let slot = d.binding_index;
        let ctx = &self.context;
        unsafe {
            match d.resource {
                DescriptorResource::Buffer(handle) => {
                    let entry = self.buffers.get(handle)?;
                    let (offset, size) = d.buffer_range(entry.info.size)?;
                    let (first, count) = convert::constant_buffer_window(offset, size)?;
                    let buffer = Some(entry.buffer.clone());
                    let c1 = &self.context1;
                    match d.stage {
                        ShaderStage::Vertex => {
                            c1.VSSetConstantBuffers1(slot, 1, Some(&buffer), Some(&first), Some(&count))
                        }
                        ShaderStage::Fragment => {
                            c1.PSSetConstantBuffers1(slot, 1, Some(&buffer), Some(&first), Some(&count))
                        }
                        ShaderStage::Geometry => {
                            c1.GSSetConstantBuffers1(slot, 1, Some(&buffer), Some(&first), Some(&count))
                        }
                        ShaderStage::TessellationControl => {
                            c1.HSSetConstantBuffers1(slot, 1, Some(&buffer), Some(&first), Some(&count))
                        }
                        ShaderStage::TessellationEvaluation => {
                            c1.DSSetConstantBuffers1(slot, 1, Some(&buffer), Some(&first), Some(&count))
                        }
                        ShaderStage::Compute => {
                            c1.CSSetConstantBuffers1(slot, 1, Some(&buffer), Some(&first), Some(&count))
                        }
                    }
                }
                DescriptorResource::Image(handle) => match self.image_views.get(handle)? {
                    D3D11View::Srv(srv) => {
                        let views = [Some(srv.clone())];
                        match d.stage {
                            ShaderStage::Vertex => ctx.VSSetShaderResources(slot, Some(&views)),
                            ShaderStage::Fragment => ctx.PSSetShaderResources(slot, Some(&views)),
                            ShaderStage::Geometry => ctx.GSSetShaderResources(slot, Some(&views)),
                            ShaderStage::TessellationControl => {
                                ctx.HSSetShaderResources(slot, Some(&views))
                            }
                            ShaderStage::TessellationEvaluation => {
                                ctx.DSSetShaderResources(slot, Some(&views))
                            }
                            ShaderStage::Compute => ctx.CSSetShaderResources(slot, Some(&views)),
                        }
                    }
                    D3D11View::Uav(uav) if d.stage == ShaderStage::Compute => {
                        let views = Some(uav.clone());
                        ctx.CSSetUnorderedAccessViews(slot, 1, Some(&views), None);
                    }
                    _ => anyhow::bail!(
                        "{:?} cannot be bound as a {:?} shader resource",
                        handle,
                        d.stage
                    ),
                },
                DescriptorResource::Sampler(handle) => {
                    let samplers = [Some(self.samplers.get(handle)?.clone())];
                    match d.stage {
                        ShaderStage::Vertex => ctx.VSSetSamplers(slot, Some(&samplers)),
                        ShaderStage::Fragment => ctx.PSSetSamplers(slot, Some(&samplers)),
                        ShaderStage::Geometry => ctx.GSSetSamplers(slot, Some(&samplers)),
                        ShaderStage::TessellationControl => ctx.HSSetSamplers(slot, Some(&samplers)),
                        ShaderStage::TessellationEvaluation => {
                            ctx.DSSetSamplers(slot, Some(&samplers))
                        }
                        ShaderStage::Compute => ctx.CSSetSamplers(slot, Some(&samplers)),
                    }
                }
            }
        }
        Ok(())
    }
}

impl GraphicsApi for D3D11Api {
    type Xr = xr::D3D11;

    fn api_type(&self) -> GraphicsApiType {
        GraphicsApiType::D3D11
    }

    fn graphics_binding(&self) -> xr::d3d::SessionCreateInfoD3D11 {
        xr::d3d::SessionCreateInfoD3D11 {
            device: self.device.as_raw() as *mut _,
        }
    }

    fn depth_format(&self) -> i64 {
        convert::DEPTH_FORMAT
    }

    fn supported_swapchain_formats(&self) -> &'static [i64] {
        &convert::SUPPORTED_SWAPCHAIN_FORMATS
    }

    fn register_swapchain_images(
        &mut self,
        images: Vec<<xr::D3D11 as xr::Graphics>::SwapchainImage>,
        _info: &ImageCreateInfo,
    ) -> Result<Vec<ImageHandle>> {
        images
            .into_iter()
            .map(|ptr| {
                let raw = ptr as *mut std::ffi::c_void;
                // Borrow and AddRef; the runtime keeps its own reference
                let texture = unsafe { ID3D11Texture2D::from_raw_borrowed(&raw) }
                    .cloned()
                    .context("Swapchain returned a null texture")?;
                self.images.insert(
                    ImageHandle::from_raw(raw as u64),
                    D3D11Image {
                        resource: texture.cast()?,
                        swapchain: true,
                    },
                )
            })
            .collect()
    }

    fn release_swapchain_images(&mut self, images: &[ImageHandle]) -> Result<()> {
        for &handle in images {
            if !self.images.get(handle)?.swapchain {
                anyhow::bail!("{:?} is not a swapchain image", handle);
            }
            self.images.remove(handle)?;
        }
        Ok(())
    }

    fn create_image(&mut self, info: &ImageCreateInfo) -> Result<ImageHandle> {
        let resource = self.create_texture(info)?;
        self.images.insert(
            ImageHandle::from_raw(resource.as_raw() as u64),
            D3D11Image {
                resource,
                swapchain: false,
            },
        )
    }

    fn destroy_image(&mut self, image: ImageHandle) -> Result<()> {
        if self.images.get(image)?.swapchain {
            anyhow::bail!("Swapchain image {:?} is owned by the OpenXR runtime", image);
        }
        // Dropping the last COM reference releases the texture
        self.images.remove(image)?;
        Ok(())
    }

    fn create_image_view(&mut self, info: &ImageViewCreateInfo) -> Result<ImageViewHandle> {
        let resource = &self.images.get(info.image)?.resource;
        let view = match info.kind {
            ImageViewKind::Rtv => self.create_rtv(resource, info)?,
            ImageViewKind::Dsv => self.create_dsv(resource, info)?,
            ImageViewKind::Srv => self.create_srv(resource, info)?,
            ImageViewKind::Uav => self.create_uav(resource, info)?,
        };
        self.image_views
            .insert(ImageViewHandle::from_raw(view.raw()), view)
    }

    fn destroy_image_view(&mut self, view: ImageViewHandle) -> Result<()> {
        self.image_views.remove(view)?;
        Ok(())
    }

    fn create_sampler(&mut self, info: &SamplerCreateInfo) -> Result<SamplerHandle> {
        let (min_lod, max_lod) = convert::lod_range(info);
        let desc = D3D11_SAMPLER_DESC {
            Filter: D3D11_FILTER(convert::filter(info)),
            AddressU: D3D11_TEXTURE_ADDRESS_MODE(convert::address_mode(info.address_mode_s)),
            AddressV: D3D11_TEXTURE_ADDRESS_MODE(convert::address_mode(info.address_mode_t)),
            AddressW: D3D11_TEXTURE_ADDRESS_MODE(convert::address_mode(info.address_mode_r)),
            MipLODBias: info.mip_lod_bias,
            MaxAnisotropy: 1,
            ComparisonFunc: D3D11_COMPARISON_FUNC(convert::comparison_func(info.compare_op)),
            BorderColor: info.border_colour,
            MinLOD: min_lod,
            MaxLOD: max_lod,
        };
        let mut sampler: Option<ID3D11SamplerState> = None;
        unsafe { self.device.CreateSamplerState(&desc, Some(&mut sampler)) }
            .context("Failed to create sampler state")?;
        let sampler = sampler.context("CreateSamplerState returned null")?;
        self.samplers
            .insert(SamplerHandle::from_raw(sampler.as_raw() as u64), sampler)
    }

    fn destroy_sampler(&mut self, sampler: SamplerHandle) -> Result<()> {
        self.samplers.remove(sampler)?;
        Ok(())
    }

    fn create_buffer(&mut self, info: &BufferCreateInfo) -> Result<BufferHandle> {
        let dynamic = info.kind == BufferKind::Uniform;
        let (bind, byte_width) = match info.kind {
            BufferKind::Vertex => (D3D11_BIND_VERTEX_BUFFER, info.size),
            BufferKind::Index => (D3D11_BIND_INDEX_BUFFER, info.size),
            BufferKind::Uniform => (
                D3D11_BIND_CONSTANT_BUFFER,
                convert::align_constant_buffer(info.size),
            ),
        };
        let desc = D3D11_BUFFER_DESC {
            ByteWidth: byte_width as u32,
            Usage: if dynamic {
                D3D11_USAGE_DYNAMIC
            } else {
                D3D11_USAGE_DEFAULT
            },
            BindFlags: bind.0 as u32,
            CPUAccessFlags: if dynamic {
                D3D11_CPU_ACCESS_WRITE.0 as u32
            } else {
                0
            },
            MiscFlags: 0,
            StructureByteStride: 0,
        };

        let mut shadow = dynamic.then(|| vec![0u8; byte_width]);
        if let (Some(shadow), Some(data)) = (shadow.as_mut(), info.data.as_ref()) {
            let len = data.len().min(shadow.len());
            shadow[..len].copy_from_slice(&data[..len]);
        }
        let initial = shadow.as_deref().or(info.data.as_deref());
        let init_data = initial.map(|bytes| D3D11_SUBRESOURCE_DATA {
            pSysMem: bytes.as_ptr() as *const _,
            SysMemPitch: info.stride as u32,
            SysMemSlicePitch: 0,
        });

        let mut buffer: Option<ID3D11Buffer> = None;
        unsafe {
            self.device.CreateBuffer(
                &desc,
                init_data.as_ref().map(|d| d as *const _),
                Some(&mut buffer),
            )
        }
        .context("Failed to create buffer")?;
        let buffer = buffer.context("CreateBuffer returned null")?;

        self.buffers.insert(
            BufferHandle::from_raw(buffer.as_raw() as u64),
            D3D11Buffer {
                buffer,
                info: BufferCreateInfo {
                    data: None,
                    ..info.clone()
                },
                shadow,
            },
        )
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) -> Result<()> {
        self.buffers.remove(buffer)?;
        Ok(())
    }

    fn create_shader(&mut self, info: &ShaderCreateInfo) -> Result<ShaderHandle> {
        let bytes = info.source.as_slice();
        let shader = unsafe {
            match info.stage {
                ShaderStage::Vertex => {
                    let mut s: Option<ID3D11VertexShader> = None;
                    self.device.CreateVertexShader(bytes, None, Some(&mut s))?;
                    D3D11Shader::Vertex(s.context("CreateVertexShader returned null")?, bytes.to_vec())
                }
                ShaderStage::Fragment => {
                    let mut s: Option<ID3D11PixelShader> = None;
                    self.device.CreatePixelShader(bytes, None, Some(&mut s))?;
                    D3D11Shader::Pixel(s.context("CreatePixelShader returned null")?)
                }
                ShaderStage::Geometry => {
                    let mut s: Option<ID3D11GeometryShader> = None;
                    self.device.CreateGeometryShader(bytes, None, Some(&mut s))?;
                    D3D11Shader::Geometry(s.context("CreateGeometryShader returned null")?)
                }
                ShaderStage::TessellationControl => {
                    let mut s: Option<ID3D11HullShader> = None;
                    self.device.CreateHullShader(bytes, None, Some(&mut s))?;
                    D3D11Shader::Hull(s.context("CreateHullShader returned null")?)
                }
                ShaderStage::TessellationEvaluation => {
                    let mut s: Option<ID3D11DomainShader> = None;
                    self.device.CreateDomainShader(bytes, None, Some(&mut s))?;
                    D3D11Shader::Domain(s.context("CreateDomainShader returned null")?)
                }
                ShaderStage::Compute => {
                    let mut s: Option<ID3D11ComputeShader> = None;
                    self.device.CreateComputeShader(bytes, None, Some(&mut s))?;
                    D3D11Shader::Compute(s.context("CreateComputeShader returned null")?)
                }
            }
        };
        self.shaders
            .insert(ShaderHandle::from_raw(shader.raw()), shader)
    }

    fn destroy_shader(&mut self, shader: ShaderHandle) -> Result<()> {
        self.shaders.remove(shader)?;
        Ok(())
    }

    fn create_pipeline(&mut self, info: &PipelineCreateInfo) -> Result<PipelineHandle> {
        let mut pipeline = D3D11Pipeline::default();

        for &handle in &info.shaders {
            match self.shaders.get(handle)? {
                D3D11Shader::Vertex(s, bytecode) => {
                    pipeline.vertex = Some(s.clone());
                    pipeline.input_layout =
                        self.create_input_layout(&info.vertex_input_state, bytecode)?;
                }
                D3D11Shader::Pixel(s) => pipeline.pixel = Some(s.clone()),
                D3D11Shader::Geometry(s) => pipeline.geometry = Some(s.clone()),
                D3D11Shader::Hull(s) => pipeline.hull = Some(s.clone()),
                D3D11Shader::Domain(s) => pipeline.domain = Some(s.clone()),
                D3D11Shader::Compute(_) => {
                    anyhow::bail!("Compute shaders cannot be part of a graphics pipeline")
                }
            }
        }

        // Blend
        let cb = &info.colour_blend_state;
        let mut render_targets = [D3D11_RENDER_TARGET_BLEND_DESC::default(); 8];
        for (target, a) in render_targets.iter_mut().zip(&cb.attachments) {
            *target = D3D11_RENDER_TARGET_BLEND_DESC {
                BlendEnable: BOOL::from(a.blend_enable),
                SrcBlend: D3D11_BLEND(convert::blend(a.src_colour_blend_factor)),
                DestBlend: D3D11_BLEND(convert::blend(a.dst_colour_blend_factor)),
                BlendOp: D3D11_BLEND_OP(convert::blend_op(a.colour_blend_op)),
                SrcBlendAlpha: D3D11_BLEND(convert::blend(a.src_alpha_blend_factor)),
                DestBlendAlpha: D3D11_BLEND(convert::blend(a.dst_alpha_blend_factor)),
                BlendOpAlpha: D3D11_BLEND_OP(convert::blend_op(a.alpha_blend_op)),
                RenderTargetWriteMask: a.colour_write_mask.bits(),
            };
        }
        if cb.logic_op_enable {
            log::warn!("D3D11 pipelines ignore logic ops");
        }
        let blend_desc = D3D11_BLEND_DESC {
            AlphaToCoverageEnable: BOOL::from(info.multisample_state.alpha_to_coverage_enable),
            IndependentBlendEnable: BOOL::from(cb.attachments.len() > 1),
            RenderTarget: render_targets,
        };
        let mut blend_state: Option<ID3D11BlendState> = None;
        unsafe { self.device.CreateBlendState(&blend_desc, Some(&mut blend_state)) }
            .context("Failed to create blend state")?;
        pipeline.blend_state = blend_state;

        // Rasterizer
        let rs = &info.rasterisation_state;
        let raster_desc = D3D11_RASTERIZER_DESC {
            FillMode: D3D11_FILL_MODE(convert::fill_mode(rs.polygon_mode)?),
            CullMode: D3D11_CULL_MODE(convert::cull_mode(rs.cull_mode)?),
            FrontCounterClockwise: BOOL::from(rs.front_face == FrontFace::CounterClockwise),
            DepthBias: rs.depth_bias_constant_factor as i32,
            DepthBiasClamp: rs.depth_bias_clamp,
            SlopeScaledDepthBias: rs.depth_bias_slope_factor,
            DepthClipEnable: BOOL::from(!rs.depth_clamp_enable),
            ScissorEnable: BOOL::from(true),
            MultisampleEnable: BOOL::from(info.multisample_state.rasterisation_samples > 1),
            AntialiasedLineEnable: BOOL::from(false),
        };
        let mut rasterizer_state: Option<ID3D11RasterizerState> = None;
        unsafe { self.device.CreateRasterizerState(&raster_desc, Some(&mut rasterizer_state)) }
            .context("Failed to create rasterizer state")?;
        pipeline.rasterizer_state = rasterizer_state;

        // Depth / stencil
        let ds = &info.depth_stencil_state;
        let face = |s: &StencilOpState| D3D11_DEPTH_STENCILOP_DESC {
            StencilFailOp: D3D11_STENCIL_OP(convert::stencil_op(s.fail_op)),
            StencilDepthFailOp: D3D11_STENCIL_OP(convert::stencil_op(s.depth_fail_op)),
            StencilPassOp: D3D11_STENCIL_OP(convert::stencil_op(s.pass_op)),
            StencilFunc: D3D11_COMPARISON_FUNC(convert::comparison_func(s.compare_op)),
        };
        let depth_desc = D3D11_DEPTH_STENCIL_DESC {
            DepthEnable: BOOL::from(ds.depth_test_enable),
            DepthWriteMask: if ds.depth_write_enable {
                D3D11_DEPTH_WRITE_MASK_ALL
            } else {
                D3D11_DEPTH_WRITE_MASK_ZERO
            },
            DepthFunc: D3D11_COMPARISON_FUNC(convert::comparison_func(ds.depth_compare_op)),
            StencilEnable: BOOL::from(ds.stencil_test_enable),
            StencilReadMask: ds.front.compare_mask as u8,
            StencilWriteMask: ds.front.write_mask as u8,
            FrontFace: face(&ds.front),
            BackFace: face(&ds.back),
        };
        let mut depth_stencil_state: Option<ID3D11DepthStencilState> = None;
        unsafe {
            self.device
                .CreateDepthStencilState(&depth_desc, Some(&mut depth_stencil_state))
        }
        .context("Failed to create depth stencil state")?;
        pipeline.depth_stencil_state = depth_stencil_state;

        pipeline.topology =
            D3D_PRIMITIVE_TOPOLOGY(convert::topology(info.input_assembly_state.topology)?);
        pipeline.stencil_ref = ds.front.reference;
        pipeline.blend_constants = cb.blend_constants;
        pipeline.sample_mask = info.multisample_state.sample_mask;
        pipeline.strides = info
            .vertex_input_state
            .bindings
            .iter()
            .map(|b| (b.binding_index, b.stride as u32))
            .collect();

        Ok(self.pipelines.insert_next(pipeline))
    }

    fn destroy_pipeline(&mut self, pipeline: PipelineHandle) -> Result<()> {
        if self.current_pipeline == Some(pipeline) {
            self.current_pipeline = None;
        }
        self.pipelines.remove(pipeline)?;
        Ok(())
    }

    fn begin_rendering(&mut self) -> Result<()> {
        if self.recording {
            anyhow::bail!("begin_rendering called twice without end_rendering");
        }
        self.recording = true;
        self.current_pipeline = None;
        self.pending_descriptors.clear();
        Ok(())
    }

    fn end_rendering(&mut self) -> Result<()> {
        self.check_recording()?;
        // Unbind so the runtime can compose the swapchain images
        unsafe { self.context.OMSetRenderTargets(None, None::<&ID3D11DepthStencilView>) };
        self.recording = false;
        Ok(())
    }

    fn set_buffer_data(&mut self, buffer: BufferHandle, offset: usize, data: &[u8]) -> Result<()> {
        let entry = self.buffers.get_mut(buffer)?;
        let end = offset
            .checked_add(data.len())
            .filter(|end| *end <= entry.info.size)
            .with_context(|| {
                format!(
                    "Write of {} bytes at offset {} overflows buffer of {} bytes",
                    data.len(),
                    offset,
                    entry.info.size
                )
            })?;

        match entry.shadow.as_mut() {
            Some(shadow) => {
                shadow[offset..end].copy_from_slice(data);
                let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
                unsafe {
                    self.context
                        .Map(&entry.buffer, 0, D3D11_MAP_WRITE_DISCARD, 0, Some(&mut mapped))
                        .context("Failed to map constant buffer")?;
                    std::ptr::copy_nonoverlapping(
                        shadow.as_ptr(),
                        mapped.pData as *mut u8,
                        shadow.len(),
                    );
                    self.context.Unmap(&entry.buffer, 0);
                }
            }
            None => {
                let region = D3D11_BOX {
                    left: offset as u32,
                    top: 0,
                    front: 0,
                    right: end as u32,
                    bottom: 1,
                    back: 1,
                };
                unsafe {
                    self.context.UpdateSubresource(
                        &entry.buffer,
                        0,
                        Some(&region),
                        data.as_ptr() as *const _,
                        0,
                        0,
                    )
                };
            }
        }
        Ok(())
    }

    fn clear_colour(&mut self, view: ImageViewHandle, colour: [f32; 4]) -> Result<()> {
        self.check_recording()?;
        match self.image_views.get(view)? {
            D3D11View::Rtv(rtv) => unsafe { self.context.ClearRenderTargetView(rtv, &colour) },
            _ => anyhow::bail!("{:?} is not a render target view", view),
        }
        Ok(())
    }

    fn clear_depth(&mut self, view: ImageViewHandle, depth: f32) -> Result<()> {
        self.check_recording()?;
        match self.image_views.get(view)? {
            D3D11View::Dsv(dsv) => unsafe {
                self.context
                    .ClearDepthStencilView(dsv, D3D11_CLEAR_DEPTH.0 as u32, depth, 0)
            },
            _ => anyhow::bail!("{:?} is not a depth stencil view", view),
        }
        Ok(())
    }

    fn set_render_attachments(
        &mut self,
        colour_views: &[ImageViewHandle],
        depth_view: Option<ImageViewHandle>,
    ) -> Result<()> {
        self.check_recording()?;
        let rtvs = colour_views
            .iter()
            .map(|&v| match self.image_views.get(v)? {
                D3D11View::Rtv(rtv) => Ok(Some(rtv.clone())),
                _ => anyhow::bail!("{:?} is not a render target view", v),
            })
            .collect::<Result<Vec<_>>>()?;
        let dsv = match depth_view {
            Some(v) => match self.image_views.get(v)? {
                D3D11View::Dsv(dsv) => Some(dsv.clone()),
                _ => anyhow::bail!("{:?} is not a depth stencil view", v),
            },
            None => None,
        };
        unsafe { self.context.OMSetRenderTargets(Some(&rtvs), dsv.as_ref()) };
        Ok(())
    }

    fn set_viewports(&mut self, viewports: &[Viewport]) -> Result<()> {
        self.check_recording()?;
        let viewports: Vec<D3D11_VIEWPORT> = viewports
            .iter()
            .map(|v| D3D11_VIEWPORT {
                TopLeftX: v.x,
                TopLeftY: v.y,
                Width: v.width,
                Height: v.height,
                MinDepth: v.min_depth,
                MaxDepth: v.max_depth,
            })
            .collect();
        unsafe { self.context.RSSetViewports(Some(&viewports)) };
        Ok(())
    }

    fn set_scissors(&mut self, scissors: &[Rect2D]) -> Result<()> {
        self.check_recording()?;
        let rects: Vec<RECT> = scissors
            .iter()
            .map(|s| RECT {
                left: s.offset.x,
                top: s.offset.y,
                right: s.offset.x + s.extent.width as i32,
                bottom: s.offset.y + s.extent.height as i32,
            })
            .collect();
        unsafe { self.context.RSSetScissorRects(Some(&rects)) };
        Ok(())
    }

    fn set_pipeline(&mut self, pipeline: PipelineHandle) -> Result<()> {
        self.check_recording()?;
        let p = self.pipelines.get(pipeline)?;
        let ctx = &self.context;
        unsafe {
            ctx.VSSetShader(p.vertex.as_ref(), None);
            ctx.PSSetShader(p.pixel.as_ref(), None);
            ctx.GSSetShader(p.geometry.as_ref(), None);
            ctx.HSSetShader(p.hull.as_ref(), None);
            ctx.DSSetShader(p.domain.as_ref(), None);
            ctx.IASetInputLayout(p.input_layout.as_ref());
            ctx.IASetPrimitiveTopology(p.topology);
            ctx.OMSetBlendState(p.blend_state.as_ref(), Some(&p.blend_constants), p.sample_mask);
            ctx.RSSetState(p.rasterizer_state.as_ref());
            ctx.OMSetDepthStencilState(p.depth_stencil_state.as_ref(), p.stencil_ref);
        }
        self.current_pipeline = Some(pipeline);
        self.pending_descriptors.clear();
        Ok(())
    }

    fn set_descriptor(&mut self, info: &DescriptorInfo) -> Result<()> {
        self.pending_descriptors
            .retain(|d| d.binding_index != info.binding_index || d.stage != info.stage);
        self.pending_descriptors.push(*info);
        Ok(())
    }

    fn update_descriptors(&mut self) -> Result<()> {
        self.check_recording()?;
        let pending = std::mem::take(&mut self.pending_descriptors);
        for d in &pending {
            self.bind_descriptor(d)?;
        }
        Ok(())
    }

    fn set_vertex_buffers(&mut self, buffers: &[BufferHandle]) -> Result<()> {
        self.check_recording()?;
        let strides_by_slot = self
            .current_pipeline
            .and_then(|p| self.pipelines.get(p).ok())
            .map(|p| p.strides.clone())
            .unwrap_or_default();

        let mut d3d_buffers = Vec::with_capacity(buffers.len());
        let mut strides = Vec::with_capacity(buffers.len());
        for (slot, &handle) in buffers.iter().enumerate() {
            let buffer = self.buffers.get(handle)?;
            let stride = strides_by_slot
                .iter()
                .find(|(binding, _)| *binding == slot as u32)
                .map(|(_, stride)| *stride)
                .unwrap_or(buffer.info.stride as u32);
            d3d_buffers.push(Some(buffer.buffer.clone()));
            strides.push(stride);
        }
        let offsets = vec![0u32; buffers.len()];

        unsafe {
            self.context.IASetVertexBuffers(
                0,
                d3d_buffers.len() as u32,
                Some(d3d_buffers.as_ptr()),
                Some(strides.as_ptr()),
                Some(offsets.as_ptr()),
            )
        };
        Ok(())
    }

    fn set_index_buffer(&mut self, buffer: BufferHandle) -> Result<()> {
        self.check_recording()?;
        let buffer = self.buffers.get(buffer)?;
        unsafe {
            self.context.IASetIndexBuffer(
                &buffer.buffer,
                DXGI_FORMAT(convert::index_format(&buffer.info)),
                0,
            )
        };
        Ok(())
    }

    fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) -> Result<()> {
        self.check_recording()?;
        unsafe {
            self.context.DrawIndexedInstanced(
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            )
        };
        Ok(())
    }

    fn draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) -> Result<()> {
        self.check_recording()?;
        unsafe {
            self.context
                .DrawInstanced(vertex_count, instance_count, first_vertex, first_instance)
        };
        Ok(())
    }
}

impl Drop for D3D11Api {
    fn drop(&mut self) {
        log::info!("Destroying D3D11 device...");
        unsafe {
            self.context.ClearState();
            self.context.Flush();
        }
    }
}
