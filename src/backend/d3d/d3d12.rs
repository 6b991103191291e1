// D3D12 backend
//
// One command allocator/list pair is reset at begin_rendering and executed
// at end_rendering, then the CPU waits on a fence. Every view owns a single
// entry CPU descriptor heap; update_descriptors copies SRV/UAV/sampler
// descriptors into shader-visible heaps whose cursors reset each frame.
// Uniform buffers bind as root CBVs.

use anyhow::{Context, Result};
use openxr as xr;
use std::collections::HashMap;
use std::ffi::CString;
use std::mem::ManuallyDrop;
use windows::core::Interface;
use windows::Win32::Foundation::{CloseHandle, BOOL, HANDLE, RECT};
use windows::Win32::Graphics::Direct3D::*;
use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::Common::*;
use windows::Win32::System::Threading::{CreateEventW, WaitForSingleObject, INFINITE};

use super::convert;
use crate::backend::handles::ResourceTable;
use crate::backend::types::*;
use crate::backend::{
    BufferHandle, GraphicsApi, GraphicsApiType, ImageHandle, ImageViewHandle, PipelineHandle,
    SamplerHandle, ShaderHandle,
};

const SHADER_VISIBLE_VIEWS: u32 = 256;
const SHADER_VISIBLE_SAMPLERS: u32 = 64;

struct D3D12Image {
    resource: ID3D12Resource,
    state: D3D12_RESOURCE_STATES,
    /// State the runtime expects the image back in; None for owned images
    swapchain_state: Option<D3D12_RESOURCE_STATES>,
}

struct D3D12View {
    /// Owns the descriptor `cpu` points into
    _heap: ID3D12DescriptorHeap,
    cpu: D3D12_CPU_DESCRIPTOR_HANDLE,
    image: ImageHandle,
    kind: ImageViewKind,
}

struct D3D12Sampler {
    _heap: ID3D12DescriptorHeap,
    cpu: D3D12_CPU_DESCRIPTOR_HANDLE,
}

struct D3D12Buffer {
    resource: ID3D12Resource,
    mapped: *mut u8,
    info: BufferCreateInfo,
}

struct D3D12Shader {
    stage: ShaderStage,
    bytecode: Vec<u8>,
}

struct D3D12Pipeline {
    state: ID3D12PipelineState,
    root_signature: ID3D12RootSignature,
    topology: D3D_PRIMITIVE_TOPOLOGY,
    stencil_ref: u32,
    blend_constants: [f32; 4],
    strides: Vec<(u32, u32)>,
    /// (stage, binding, type) -> root parameter index
    root_parameters: HashMap<(ShaderStage, u32, DescriptorType), u32>,
}

/// Linear allocator over a shader-visible descriptor heap
struct DescriptorRing {
    heap: ID3D12DescriptorHeap,
    increment: u32,
    capacity: u32,
    next: u32,
}

impl DescriptorRing {
    fn new(device: &ID3D12Device, ty: D3D12_DESCRIPTOR_HEAP_TYPE, capacity: u32) -> Result<Self> {
        let heap: ID3D12DescriptorHeap = unsafe {
            device.CreateDescriptorHeap(&D3D12_DESCRIPTOR_HEAP_DESC {
                Type: ty,
                NumDescriptors: capacity,
                Flags: D3D12_DESCRIPTOR_HEAP_FLAG_SHADER_VISIBLE,
                NodeMask: 0,
            })
        }
        .context("Failed to create shader-visible descriptor heap")?;
        let increment = unsafe { device.GetDescriptorHandleIncrementSize(ty) };
        Ok(Self {
            heap,
            increment,
            capacity,
            next: 0,
        })
    }

    fn allocate(&mut self) -> Result<(D3D12_CPU_DESCRIPTOR_HANDLE, D3D12_GPU_DESCRIPTOR_HANDLE)> {
        if self.next >= self.capacity {
            anyhow::bail!("Shader-visible descriptor heap exhausted ({} entries)", self.capacity);
        }
        let offset = (self.next * self.increment) as usize;
        self.next += 1;
        unsafe {
            let cpu = self.heap.GetCPUDescriptorHandleForHeapStart();
            let gpu = self.heap.GetGPUDescriptorHandleForHeapStart();
            Ok((
                D3D12_CPU_DESCRIPTOR_HANDLE { ptr: cpu.ptr + offset },
                D3D12_GPU_DESCRIPTOR_HANDLE { ptr: gpu.ptr + offset as u64 },
            ))
        }
    }
}

fn transition_barrier(
    resource: &ID3D12Resource,
    before: D3D12_RESOURCE_STATES,
    after: D3D12_RESOURCE_STATES,
) -> D3D12_RESOURCE_BARRIER {
    D3D12_RESOURCE_BARRIER {
        Type: D3D12_RESOURCE_BARRIER_TYPE_TRANSITION,
        Flags: D3D12_RESOURCE_BARRIER_FLAG_NONE,
        Anonymous: D3D12_RESOURCE_BARRIER_0 {
            Transition: ManuallyDrop::new(D3D12_RESOURCE_TRANSITION_BARRIER {
                // Borrowed without AddRef; the barrier never outlives the resource
                pResource: unsafe { std::mem::transmute_copy(resource) },
                StateBefore: before,
                StateAfter: after,
                Subresource: D3D12_RESOURCE_BARRIER_ALL_SUBRESOURCES,
            }),
        },
    }
}

fn shader_visibility(stage: ShaderStage) -> D3D12_SHADER_VISIBILITY {
    match stage {
        ShaderStage::Vertex => D3D12_SHADER_VISIBILITY_VERTEX,
        ShaderStage::TessellationControl => D3D12_SHADER_VISIBILITY_HULL,
        ShaderStage::TessellationEvaluation => D3D12_SHADER_VISIBILITY_DOMAIN,
        ShaderStage::Geometry => D3D12_SHADER_VISIBILITY_GEOMETRY,
        ShaderStage::Fragment => D3D12_SHADER_VISIBILITY_PIXEL,
        ShaderStage::Compute => D3D12_SHADER_VISIBILITY_ALL,
    }
}

fn bytecode(shader: Option<&D3D12Shader>) -> D3D12_SHADER_BYTECODE {
    match shader {
        Some(s) => D3D12_SHADER_BYTECODE {
            pShaderBytecode: s.bytecode.as_ptr() as *const _,
            BytecodeLength: s.bytecode.len(),
        },
        None => D3D12_SHADER_BYTECODE::default(),
    }
}

pub struct D3D12Api {
    device: ID3D12Device,
    queue: ID3D12CommandQueue,
    allocator: ID3D12CommandAllocator,
    list: ID3D12GraphicsCommandList,
    fence: ID3D12Fence,
    fence_value: u64,
    fence_event: HANDLE,

    view_ring: DescriptorRing,
    sampler_ring: DescriptorRing,

    images: ResourceTable<ImageHandle, D3D12Image>,
    image_views: ResourceTable<ImageViewHandle, D3D12View>,
    samplers: ResourceTable<SamplerHandle, D3D12Sampler>,
    buffers: ResourceTable<BufferHandle, D3D12Buffer>,
    shaders: ResourceTable<ShaderHandle, D3D12Shader>,
    pipelines: ResourceTable<PipelineHandle, D3D12Pipeline>,

    recording: bool,
    current_pipeline: Option<PipelineHandle>,
    pending_descriptors: Vec<DescriptorInfo>,
}

impl D3D12Api {
    pub fn new(xr_instance: &xr::Instance, system: xr::SystemId, enable_debug: bool) -> Result<Self> {
        let reqs = xr_instance
            .graphics_requirements::<xr::D3D12>(system)
            .context("Failed to get D3D12 graphics requirements")?;

        if enable_debug {
            let mut debug: Option<ID3D12Debug> = None;
            match unsafe { D3D12GetDebugInterface(&mut debug) } {
                Ok(()) => {
                    if let Some(debug) = debug {
                        unsafe { debug.EnableDebugLayer() };
                        log::info!("D3D12 debug layer enabled");
                    }
                }
                Err(e) => log::warn!("D3D12 debug layer unavailable: {}", e),
            }
        }

        let adapter = super::find_adapter(reqs.adapter_luid.LowPart, reqs.adapter_luid.HighPart)?;
        let mut device: Option<ID3D12Device> = None;
        unsafe {
            D3D12CreateDevice(
                &adapter,
                D3D_FEATURE_LEVEL(reqs.min_feature_level as i32),
                &mut device,
            )
        }
        .context("Failed to create D3D12 device")?;
        let device = device.context("D3D12CreateDevice returned no device")?;

        let queue: ID3D12CommandQueue = unsafe {
            device.CreateCommandQueue(&D3D12_COMMAND_QUEUE_DESC {
                Type: D3D12_COMMAND_LIST_TYPE_DIRECT,
                Priority: 0,
                Flags: D3D12_COMMAND_QUEUE_FLAG_NONE,
                NodeMask: 0,
            })
        }
        .context("Failed to create D3D12 command queue")?;

        let allocator: ID3D12CommandAllocator =
            unsafe { device.CreateCommandAllocator(D3D12_COMMAND_LIST_TYPE_DIRECT) }
                .context("Failed to create command allocator")?;
        let list: ID3D12GraphicsCommandList = unsafe {
            device.CreateCommandList(
                0,
                D3D12_COMMAND_LIST_TYPE_DIRECT,
                &allocator,
                None::<&ID3D12PipelineState>,
            )
        }
        .context("Failed to create command list")?;
        // Lists are created open; keep it closed until begin_rendering
        unsafe { list.Close() }.context("Failed to close command list")?;

        let fence: ID3D12Fence = unsafe { device.CreateFence(0, D3D12_FENCE_FLAG_NONE) }
            .context("Failed to create fence")?;
        let fence_event =
            unsafe { CreateEventW(None, false, false, None) }.context("Failed to create fence event")?;

        let view_ring = DescriptorRing::new(
            &device,
            D3D12_DESCRIPTOR_HEAP_TYPE_CBV_SRV_UAV,
            SHADER_VISIBLE_VIEWS,
        )?;
        let sampler_ring = DescriptorRing::new(
            &device,
            D3D12_DESCRIPTOR_HEAP_TYPE_SAMPLER,
            SHADER_VISIBLE_SAMPLERS,
        )?;

        log::info!("Created D3D12 device and command queue");

        Ok(Self {
            device,
            queue,
            allocator,
            list,
            fence,
            fence_value: 0,
            fence_event,
            view_ring,
            sampler_ring,
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
            anyhow::bail!("D3D12 command recorded outside begin_rendering/end_rendering");
        }
        Ok(())
    }

    fn wait_idle(&mut self) -> Result<()> {
        self.fence_value += 1;
        unsafe {
            self.queue
                .Signal(&self.fence, self.fence_value)
                .context("Failed to signal fence")?;
            if self.fence.GetCompletedValue() < self.fence_value {
                self.fence
                    .SetEventOnCompletion(self.fence_value, self.fence_event)
                    .context("Failed to set fence event")?;
                WaitForSingleObject(self.fence_event, INFINITE);
            }
        }
        Ok(())
    }

    fn transition(&mut self, image: ImageHandle, state: D3D12_RESOURCE_STATES) -> Result<()> {
        let entry = self.images.get_mut(image)?;
        if entry.state != state {
            let barrier = transition_barrier(&entry.resource, entry.state, state);
            unsafe { self.list.ResourceBarrier(&[barrier]) };
            entry.state = state;
        }
        Ok(())
    }

    fn descriptor_heap(&self, ty: D3D12_DESCRIPTOR_HEAP_TYPE) -> Result<ID3D12DescriptorHeap> {
        unsafe {
            self.device.CreateDescriptorHeap(&D3D12_DESCRIPTOR_HEAP_DESC {
                Type: ty,
                NumDescriptors: 1,
                Flags: D3D12_DESCRIPTOR_HEAP_FLAG_NONE,
                NodeMask: 0,
            })
        }
        .context("Failed to create descriptor heap")
    }

    fn write_rtv(
        &self,
        resource: &ID3D12Resource,
        info: &ImageViewCreateInfo,
        cpu: D3D12_CPU_DESCRIPTOR_HANDLE,
    ) -> Result<()> {
        let (dimension, anonymous) = match info.view {
            ImageViewType::Type1D => (
                D3D12_RTV_DIMENSION_TEXTURE1D,
                D3D12_RENDER_TARGET_VIEW_DESC_0 {
                    Texture1D: D3D12_TEX1D_RTV {
                        MipSlice: info.base_mip_level,
                    },
                },
            ),
            ImageViewType::Type2D => (
                D3D12_RTV_DIMENSION_TEXTURE2D,
                D3D12_RENDER_TARGET_VIEW_DESC_0 {
                    Texture2D: D3D12_TEX2D_RTV {
                        MipSlice: info.base_mip_level,
                        PlaneSlice: 0,
                    },
                },
            ),
            ImageViewType::Type2DArray => (
                D3D12_RTV_DIMENSION_TEXTURE2DARRAY,
                D3D12_RENDER_TARGET_VIEW_DESC_0 {
                    Texture2DArray: D3D12_TEX2D_ARRAY_RTV {
                        MipSlice: info.base_mip_level,
                        FirstArraySlice: info.base_array_layer,
                        ArraySize: info.layer_count,
                        PlaneSlice: 0,
                    },
                },
            ),
            ImageViewType::Type3D => (
                D3D12_RTV_DIMENSION_TEXTURE3D,
                D3D12_RENDER_TARGET_VIEW_DESC_0 {
                    Texture3D: D3D12_TEX3D_RTV {
                        MipSlice: info.base_mip_level,
                        FirstWSlice: info.base_array_layer,
                        WSize: info.layer_count,
                    },
                },
            ),
            other => anyhow::bail!("{:?} cannot be a render target view", other),
        };
        let desc = D3D12_RENDER_TARGET_VIEW_DESC {
            Format: DXGI_FORMAT(info.format as i32),
            ViewDimension: dimension,
            Anonymous: anonymous,
        };
        unsafe { self.device.CreateRenderTargetView(resource, Some(&desc), cpu) };
        Ok(())
    }

    fn write_dsv(
        &self,
        resource: &ID3D12Resource,
        info: &ImageViewCreateInfo,
        cpu: D3D12_CPU_DESCRIPTOR_HANDLE,
    ) -> Result<()> {
        let (dimension, anonymous) = match info.view {
            ImageViewType::Type1D => (
                D3D12_DSV_DIMENSION_TEXTURE1D,
                D3D12_DEPTH_STENCIL_VIEW_DESC_0 {
                    Texture1D: D3D12_TEX1D_DSV {
                        MipSlice: info.base_mip_level,
                    },
                },
            ),
            ImageViewType::Type2D => (
                D3D12_DSV_DIMENSION_TEXTURE2D,
                D3D12_DEPTH_STENCIL_VIEW_DESC_0 {
                    Texture2D: D3D12_TEX2D_DSV {
                        MipSlice: info.base_mip_level,
                    },
                },
            ),
            ImageViewType::Type2DArray => (
                D3D12_DSV_DIMENSION_TEXTURE2DARRAY,
                D3D12_DEPTH_STENCIL_VIEW_DESC_0 {
                    Texture2DArray: D3D12_TEX2D_ARRAY_DSV {
                        MipSlice: info.base_mip_level,
                        FirstArraySlice: info.base_array_layer,
                        ArraySize: info.layer_count,
                    },
                },
            ),
            other => anyhow::bail!("{:?} cannot be a depth stencil view", other),
        };
        let desc = D3D12_DEPTH_STENCIL_VIEW_DESC {
            Format: DXGI_FORMAT(info.format as i32),
            ViewDimension: dimension,
            Flags: D3D12_DSV_FLAG_NONE,
            Anonymous: anonymous,
        };
        unsafe { self.device.CreateDepthStencilView(resource, Some(&desc), cpu) };
        Ok(())
    }

    fn write_srv(
        &self,
        resource: &ID3D12Resource,
        info: &ImageViewCreateInfo,
        cpu: D3D12_CPU_DESCRIPTOR_HANDLE,
    ) -> Result<()> {
        let (dimension, anonymous) = match info.view {
            ImageViewType::Type1D => (
                D3D12_SRV_DIMENSION_TEXTURE1D,
                D3D12_SHADER_RESOURCE_VIEW_DESC_0 {
                    Texture1D: D3D12_TEX1D_SRV {
                        MostDetailedMip: info.base_mip_level,
                        MipLevels: info.level_count,
                        ResourceMinLODClamp: 0.0,
                    },
                },
            ),
            ImageViewType::Type2D => (
                D3D12_SRV_DIMENSION_TEXTURE2D,
                D3D12_SHADER_RESOURCE_VIEW_DESC_0 {
                    Texture2D: D3D12_TEX2D_SRV {
                        MostDetailedMip: info.base_mip_level,
                        MipLevels: info.level_count,
                        PlaneSlice: 0,
                        ResourceMinLODClamp: 0.0,
                    },
                },
            ),
            ImageViewType::Type2DArray => (
                D3D12_SRV_DIMENSION_TEXTURE2DARRAY,
                D3D12_SHADER_RESOURCE_VIEW_DESC_0 {
                    Texture2DArray: D3D12_TEX2D_ARRAY_SRV {
                        MostDetailedMip: info.base_mip_level,
                        MipLevels: info.level_count,
                        FirstArraySlice: info.base_array_layer,
                        ArraySize: info.layer_count,
                        PlaneSlice: 0,
                        ResourceMinLODClamp: 0.0,
                    },
                },
            ),
            ImageViewType::Type3D => (
                D3D12_SRV_DIMENSION_TEXTURE3D,
                D3D12_SHADER_RESOURCE_VIEW_DESC_0 {
                    Texture3D: D3D12_TEX3D_SRV {
                        MostDetailedMip: info.base_mip_level,
                        MipLevels: info.level_count,
                        ResourceMinLODClamp: 0.0,
                    },
                },
            ),
            ImageViewType::TypeCube => (
                D3D12_SRV_DIMENSION_TEXTURECUBE,
                D3D12_SHADER_RESOURCE_VIEW_DESC_0 {
                    TextureCube: D3D12_TEXCUBE_SRV {
                        MostDetailedMip: info.base_mip_level,
                        MipLevels: info.level_count,
                        ResourceMinLODClamp: 0.0,
                    },
                },
            ),
            other => anyhow::bail!("{:?} shader resource views are not supported", other),
        };
        let desc = D3D12_SHADER_RESOURCE_VIEW_DESC {
            Format: DXGI_FORMAT(info.format as i32),
            ViewDimension: dimension,
            Shader4ComponentMapping: D3D12_DEFAULT_SHADER_4_COMPONENT_MAPPING,
            Anonymous: anonymous,
        };
        unsafe { self.device.CreateShaderResourceView(resource, Some(&desc), cpu) };
        Ok(())
    }

    fn write_uav(
        &self,
        resource: &ID3D12Resource,
        info: &ImageViewCreateInfo,
        cpu: D3D12_CPU_DESCRIPTOR_HANDLE,
    ) -> Result<()> {
        let (dimension, anonymous) = match info.view {
            ImageViewType::Type2D => (
                D3D12_UAV_DIMENSION_TEXTURE2D,
                D3D12_UNORDERED_ACCESS_VIEW_DESC_0 {
                    Texture2D: D3D12_TEX2D_UAV {
                        MipSlice: info.base_mip_level,
                        PlaneSlice: 0,
                    },
                },
            ),
            ImageViewType::Type2DArray => (
                D3D12_UAV_DIMENSION_TEXTURE2DARRAY,
                D3D12_UNORDERED_ACCESS_VIEW_DESC_0 {
                    Texture2DArray: D3D12_TEX2D_ARRAY_UAV {
                        MipSlice: info.base_mip_level,
                        FirstArraySlice: info.base_array_layer,
                        ArraySize: info.layer_count,
                        PlaneSlice: 0,
                    },
                },
            ),
            ImageViewType::Type3D => (
                D3D12_UAV_DIMENSION_TEXTURE3D,
                D3D12_UNORDERED_ACCESS_VIEW_DESC_0 {
                    Texture3D: D3D12_TEX3D_UAV {
                        MipSlice: info.base_mip_level,
                        FirstWSlice: info.base_array_layer,
                        WSize: info.layer_count,
                    },
                },
            ),
            other => anyhow::bail!("{:?} unordered access views are not supported", other),
        };
        let desc = D3D12_UNORDERED_ACCESS_VIEW_DESC {
            Format: DXGI_FORMAT(info.format as i32),
            ViewDimension: dimension,
            Anonymous: anonymous,
        };
        unsafe {
            self.device
                .CreateUnorderedAccessView(resource, None::<&ID3D12Resource>, Some(&desc), cpu)
        };
        Ok(())
    }

    /// Root signature with one parameter per layout entry, in layout order
    fn create_root_signature(
        &self,
        layout: &[DescriptorInfo],
    ) -> Result<(ID3D12RootSignature, HashMap<(ShaderStage, u32, DescriptorType), u32>)> {
        let ranges: Vec<D3D12_DESCRIPTOR_RANGE> = layout
            .iter()
            .map(|d| D3D12_DESCRIPTOR_RANGE {
                RangeType: match d.descriptor_type() {
                    DescriptorType::Image if d.read_write => D3D12_DESCRIPTOR_RANGE_TYPE_UAV,
                    DescriptorType::Image => D3D12_DESCRIPTOR_RANGE_TYPE_SRV,
                    DescriptorType::Sampler => D3D12_DESCRIPTOR_RANGE_TYPE_SAMPLER,
                    DescriptorType::Buffer => D3D12_DESCRIPTOR_RANGE_TYPE_CBV,
                },
                NumDescriptors: 1,
                BaseShaderRegister: d.binding_index,
                RegisterSpace: 0,
                OffsetInDescriptorsFromTableStart: D3D12_DESCRIPTOR_RANGE_OFFSET_APPEND,
            })
            .collect();

        let mut parameters = Vec::with_capacity(layout.len());
        let mut indices = HashMap::new();
        for (i, (d, range)) in layout.iter().zip(&ranges).enumerate() {
            let parameter = match d.descriptor_type() {
                DescriptorType::Buffer => D3D12_ROOT_PARAMETER {
                    ParameterType: D3D12_ROOT_PARAMETER_TYPE_CBV,
                    Anonymous: D3D12_ROOT_PARAMETER_0 {
                        Descriptor: D3D12_ROOT_DESCRIPTOR {
                            ShaderRegister: d.binding_index,
                            RegisterSpace: 0,
                        },
                    },
                    ShaderVisibility: shader_visibility(d.stage),
                },
                DescriptorType::Image | DescriptorType::Sampler => D3D12_ROOT_PARAMETER {
                    ParameterType: D3D12_ROOT_PARAMETER_TYPE_DESCRIPTOR_TABLE,
                    Anonymous: D3D12_ROOT_PARAMETER_0 {
                        DescriptorTable: D3D12_ROOT_DESCRIPTOR_TABLE {
                            NumDescriptorRanges: 1,
                            pDescriptorRanges: range,
                        },
                    },
                    ShaderVisibility: shader_visibility(d.stage),
                },
            };
            parameters.push(parameter);
            indices.insert((d.stage, d.binding_index, d.descriptor_type()), i as u32);
        }

        let desc = D3D12_ROOT_SIGNATURE_DESC {
            NumParameters: parameters.len() as u32,
            pParameters: parameters.as_ptr(),
            NumStaticSamplers: 0,
            pStaticSamplers: std::ptr::null(),
            Flags: D3D12_ROOT_SIGNATURE_FLAG_ALLOW_INPUT_ASSEMBLER_INPUT_LAYOUT,
        };

        let mut blob: Option<ID3DBlob> = None;
        let mut error: Option<ID3DBlob> = None;
        let serialized = unsafe {
            D3D12SerializeRootSignature(
                &desc,
                D3D_ROOT_SIGNATURE_VERSION_1,
                &mut blob,
                Some(&mut error),
            )
        };
        if let Err(e) = serialized {
            let message = error
                .map(|b| unsafe {
                    String::from_utf8_lossy(std::slice::from_raw_parts(
                        b.GetBufferPointer() as *const u8,
                        b.GetBufferSize(),
                    ))
                    .into_owned()
                })
                .unwrap_or_default();
            anyhow::bail!("Failed to serialize root signature: {} {}", e, message);
        }
        let blob = blob.context("D3D12SerializeRootSignature returned no blob")?;
        let root_signature: ID3D12RootSignature = unsafe {
            self.device.CreateRootSignature(
                0,
                std::slice::from_raw_parts(blob.GetBufferPointer() as *const u8, blob.GetBufferSize()),
            )
        }
        .context("Failed to create root signature")?;

        Ok((root_signature, indices))
    }
}

impl GraphicsApi for D3D12Api {
    type Xr = xr::D3D12;

    fn api_type(&self) -> GraphicsApiType {
        GraphicsApiType::D3D12
    }

    fn graphics_binding(&self) -> xr::d3d::SessionCreateInfoD3D12 {
        xr::d3d::SessionCreateInfoD3D12 {
            device: self.device.as_raw() as *mut _,
            queue: self.queue.as_raw() as *mut _,
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
        images: Vec<<xr::D3D12 as xr::Graphics>::SwapchainImage>,
        info: &ImageCreateInfo,
    ) -> Result<Vec<ImageHandle>> {
        // The runtime hands images over in these states after xrWaitSwapchainImage
        let state = if info.depth_attachment {
            D3D12_RESOURCE_STATE_DEPTH_WRITE
        } else {
            D3D12_RESOURCE_STATE_RENDER_TARGET
        };
        images
            .into_iter()
            .map(|ptr| {
                let raw = ptr as *mut std::ffi::c_void;
                let resource = unsafe { ID3D12Resource::from_raw_borrowed(&raw) }
                    .cloned()
                    .context("Swapchain returned a null resource")?;
                self.images.insert(
                    ImageHandle::from_raw(raw as u64),
                    D3D12Image {
                        resource,
                        state,
                        swapchain_state: Some(state),
                    },
                )
            })
            .collect()
    }

    fn release_swapchain_images(&mut self, images: &[ImageHandle]) -> Result<()> {
        for &handle in images {
            if self.images.get(handle)?.swapchain_state.is_none() {
                anyhow::bail!("{:?} is not a swapchain image", handle);
            }
            self.images.remove(handle)?;
        }
        Ok(())
    }

    fn create_image(&mut self, info: &ImageCreateInfo) -> Result<ImageHandle> {
        let mut flags = D3D12_RESOURCE_FLAG_NONE;
        if info.colour_attachment {
            flags |= D3D12_RESOURCE_FLAG_ALLOW_RENDER_TARGET;
        }
        if info.depth_attachment {
            flags |= D3D12_RESOURCE_FLAG_ALLOW_DEPTH_STENCIL;
        }
        let desc = D3D12_RESOURCE_DESC {
            Dimension: D3D12_RESOURCE_DIMENSION(info.dimension as i32 + 1),
            Alignment: 0,
            Width: info.width as u64,
            Height: info.height.max(1),
            DepthOrArraySize: if info.dimension == 3 {
                info.depth as u16
            } else {
                info.array_layers as u16
            },
            MipLevels: info.mip_levels as u16,
            Format: DXGI_FORMAT(info.format as i32),
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: info.sample_count.max(1),
                Quality: 0,
            },
            Layout: D3D12_TEXTURE_LAYOUT_UNKNOWN,
            Flags: flags,
        };

        let (state, clear) = if info.depth_attachment {
            (
                D3D12_RESOURCE_STATE_DEPTH_WRITE,
                Some(D3D12_CLEAR_VALUE {
                    Format: desc.Format,
                    Anonymous: D3D12_CLEAR_VALUE_0 {
                        DepthStencil: D3D12_DEPTH_STENCIL_VALUE {
                            Depth: 1.0,
                            Stencil: 0,
                        },
                    },
                }),
            )
        } else if info.colour_attachment {
            (
                D3D12_RESOURCE_STATE_RENDER_TARGET,
                Some(D3D12_CLEAR_VALUE {
                    Format: desc.Format,
                    Anonymous: D3D12_CLEAR_VALUE_0 { Color: [0.0; 4] },
                }),
            )
        } else {
            (D3D12_RESOURCE_STATE_COMMON, None)
        };

        let heap = D3D12_HEAP_PROPERTIES {
            Type: D3D12_HEAP_TYPE_DEFAULT,
            ..Default::default()
        };
        let mut resource: Option<ID3D12Resource> = None;
        unsafe {
            self.device.CreateCommittedResource(
                &heap,
                D3D12_HEAP_FLAG_NONE,
                &desc,
                state,
                clear.as_ref().map(|c| c as *const _),
                &mut resource,
            )
        }
        .context("Failed to create texture")?;
        let resource = resource.context("CreateCommittedResource returned null")?;

        self.images.insert(
            ImageHandle::from_raw(resource.as_raw() as u64),
            D3D12Image {
                resource,
                state,
                swapchain_state: None,
            },
        )
    }

    fn destroy_image(&mut self, image: ImageHandle) -> Result<()> {
        if self.images.get(image)?.swapchain_state.is_some() {
            anyhow::bail!("Swapchain image {:?} is owned by the OpenXR runtime", image);
        }
        self.images.remove(image)?;
        Ok(())
    }

    fn create_image_view(&mut self, info: &ImageViewCreateInfo) -> Result<ImageViewHandle> {
        let heap_type = match info.kind {
            ImageViewKind::Rtv => D3D12_DESCRIPTOR_HEAP_TYPE_RTV,
            ImageViewKind::Dsv => D3D12_DESCRIPTOR_HEAP_TYPE_DSV,
            ImageViewKind::Srv | ImageViewKind::Uav => D3D12_DESCRIPTOR_HEAP_TYPE_CBV_SRV_UAV,
        };
        let heap = self.descriptor_heap(heap_type)?;
        let cpu = unsafe { heap.GetCPUDescriptorHandleForHeapStart() };

        let resource = &self.images.get(info.image)?.resource;
        match info.kind {
            ImageViewKind::Rtv => self.write_rtv(resource, info, cpu)?,
            ImageViewKind::Dsv => self.write_dsv(resource, info, cpu)?,
            ImageViewKind::Srv => self.write_srv(resource, info, cpu)?,
            ImageViewKind::Uav => self.write_uav(resource, info, cpu)?,
        }

        self.image_views.insert(
            ImageViewHandle::from_raw(cpu.ptr as u64),
            D3D12View {
                _heap: heap,
                cpu,
                image: info.image,
                kind: info.kind,
            },
        )
    }

    fn destroy_image_view(&mut self, view: ImageViewHandle) -> Result<()> {
        self.image_views.remove(view)?;
        Ok(())
    }

    fn create_sampler(&mut self, info: &SamplerCreateInfo) -> Result<SamplerHandle> {
        let (min_lod, max_lod) = convert::lod_range(info);
        let desc = D3D12_SAMPLER_DESC {
            Filter: D3D12_FILTER(convert::filter(info)),
            AddressU: D3D12_TEXTURE_ADDRESS_MODE(convert::address_mode(info.address_mode_s)),
            AddressV: D3D12_TEXTURE_ADDRESS_MODE(convert::address_mode(info.address_mode_t)),
            AddressW: D3D12_TEXTURE_ADDRESS_MODE(convert::address_mode(info.address_mode_r)),
            MipLODBias: info.mip_lod_bias,
            MaxAnisotropy: 1,
            ComparisonFunc: D3D12_COMPARISON_FUNC(convert::comparison_func(info.compare_op)),
            BorderColor: info.border_colour,
            MinLOD: min_lod,
            MaxLOD: max_lod,
        };
        let heap = self.descriptor_heap(D3D12_DESCRIPTOR_HEAP_TYPE_SAMPLER)?;
        let cpu = unsafe { heap.GetCPUDescriptorHandleForHeapStart() };
        unsafe { self.device.CreateSampler(&desc, cpu) };
        self.samplers
            .insert(SamplerHandle::from_raw(cpu.ptr as u64), D3D12Sampler { _heap: heap, cpu })
    }

    fn destroy_sampler(&mut self, sampler: SamplerHandle) -> Result<()> {
        self.samplers.remove(sampler)?;
        Ok(())
    }

    fn create_buffer(&mut self, info: &BufferCreateInfo) -> Result<BufferHandle> {
        let size = match info.kind {
            BufferKind::Uniform => convert::align_constant_buffer(info.size),
            _ => info.size,
        };
        let desc = D3D12_RESOURCE_DESC {
            Dimension: D3D12_RESOURCE_DIMENSION_BUFFER,
            Alignment: 0,
            Width: size as u64,
            Height: 1,
            DepthOrArraySize: 1,
            MipLevels: 1,
            Format: DXGI_FORMAT_UNKNOWN,
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            Layout: D3D12_TEXTURE_LAYOUT_ROW_MAJOR,
            Flags: D3D12_RESOURCE_FLAG_NONE,
        };
        let heap = D3D12_HEAP_PROPERTIES {
            Type: D3D12_HEAP_TYPE_UPLOAD,
            ..Default::default()
        };
        let mut resource: Option<ID3D12Resource> = None;
        unsafe {
            self.device.CreateCommittedResource(
                &heap,
                D3D12_HEAP_FLAG_NONE,
                &desc,
                D3D12_RESOURCE_STATE_GENERIC_READ,
                None,
                &mut resource,
            )
        }
        .context("Failed to create buffer")?;
        let resource = resource.context("CreateCommittedResource returned null")?;

        // Upload heaps stay mapped for the buffer's lifetime
        let mut mapped = std::ptr::null_mut();
        unsafe { resource.Map(0, None, Some(&mut mapped)) }.context("Failed to map buffer")?;
        let mapped = mapped as *mut u8;
        if let Some(data) = &info.data {
            let len = data.len().min(size);
            unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), mapped, len) };
        }

        self.buffers.insert(
            BufferHandle::from_raw(resource.as_raw() as u64),
            D3D12Buffer {
                resource,
                mapped,
                info: BufferCreateInfo {
                    data: None,
                    ..info.clone()
                },
            },
        )
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) -> Result<()> {
        let buffer = self.buffers.remove(buffer)?;
        unsafe { buffer.resource.Unmap(0, None) };
        Ok(())
    }

    fn create_shader(&mut self, info: &ShaderCreateInfo) -> Result<ShaderHandle> {
        if info.source.is_empty() {
            anyhow::bail!("Empty {:?} shader bytecode", info.stage);
        }
        Ok(self.shaders.insert_next(D3D12Shader {
            stage: info.stage,
            bytecode: info.source.clone(),
        }))
    }

    fn destroy_shader(&mut self, shader: ShaderHandle) -> Result<()> {
        self.shaders.remove(shader)?;
        Ok(())
    }

    fn create_pipeline(&mut self, info: &PipelineCreateInfo) -> Result<PipelineHandle> {
        let mut stages: HashMap<ShaderStage, &D3D12Shader> = HashMap::new();
        for &handle in &info.shaders {
            let shader = self.shaders.get(handle)?;
            if shader.stage == ShaderStage::Compute {
                anyhow::bail!("Compute shaders cannot be part of a graphics pipeline");
            }
            stages.insert(shader.stage, shader);
        }

        let (root_signature, root_parameters) = self.create_root_signature(&info.layout)?;

        let names = info
            .vertex_input_state
            .attributes
            .iter()
            .map(|a| {
                let (base, index) = convert::split_semantic(&a.semantic_name);
                Ok((CString::new(base)?, index))
            })
            .collect::<Result<Vec<_>>>()?;
        let elements: Vec<D3D12_INPUT_ELEMENT_DESC> = info
            .vertex_input_state
            .attributes
            .iter()
            .zip(&names)
            .map(|(a, (name, index))| D3D12_INPUT_ELEMENT_DESC {
                SemanticName: windows::core::PCSTR(name.as_ptr() as _),
                SemanticIndex: *index,
                Format: DXGI_FORMAT(convert::vertex_format(a.vertex_type)),
                InputSlot: a.binding_index,
                AlignedByteOffset: a.offset as u32,
                InputSlotClass: D3D12_INPUT_CLASSIFICATION_PER_VERTEX_DATA,
                InstanceDataStepRate: 0,
            })
            .collect();

        let cb = &info.colour_blend_state;
        let mut render_targets = [D3D12_RENDER_TARGET_BLEND_DESC::default(); 8];
        for (target, a) in render_targets.iter_mut().zip(&cb.attachments) {
            *target = D3D12_RENDER_TARGET_BLEND_DESC {
                BlendEnable: BOOL::from(a.blend_enable),
                LogicOpEnable: BOOL::from(cb.logic_op_enable),
                SrcBlend: D3D12_BLEND(convert::blend(a.src_colour_blend_factor)),
                DestBlend: D3D12_BLEND(convert::blend(a.dst_colour_blend_factor)),
                BlendOp: D3D12_BLEND_OP(convert::blend_op(a.colour_blend_op)),
                SrcBlendAlpha: D3D12_BLEND(convert::blend(a.src_alpha_blend_factor)),
                DestBlendAlpha: D3D12_BLEND(convert::blend(a.dst_alpha_blend_factor)),
                BlendOpAlpha: D3D12_BLEND_OP(convert::blend_op(a.alpha_blend_op)),
                LogicOp: D3D12_LOGIC_OP(convert::logic_op(cb.logic_op)),
                RenderTargetWriteMask: a.colour_write_mask.bits(),
            };
        }

        let rs = &info.rasterisation_state;
        let ds = &info.depth_stencil_state;
        let face = |s: &StencilOpState| D3D12_DEPTH_STENCILOP_DESC {
            StencilFailOp: D3D12_STENCIL_OP(convert::stencil_op(s.fail_op)),
            StencilDepthFailOp: D3D12_STENCIL_OP(convert::stencil_op(s.depth_fail_op)),
            StencilPassOp: D3D12_STENCIL_OP(convert::stencil_op(s.pass_op)),
            StencilFunc: D3D12_COMPARISON_FUNC(convert::comparison_func(s.compare_op)),
        };

        let mut rtv_formats = [DXGI_FORMAT_UNKNOWN; 8];
        for (slot, &format) in rtv_formats.iter_mut().zip(&info.colour_formats) {
            *slot = DXGI_FORMAT(format as i32);
        }

        let desc = D3D12_GRAPHICS_PIPELINE_STATE_DESC {
            pRootSignature: ManuallyDrop::new(Some(root_signature.clone())),
            VS: bytecode(stages.get(&ShaderStage::Vertex).copied()),
            PS: bytecode(stages.get(&ShaderStage::Fragment).copied()),
            GS: bytecode(stages.get(&ShaderStage::Geometry).copied()),
            HS: bytecode(stages.get(&ShaderStage::TessellationControl).copied()),
            DS: bytecode(stages.get(&ShaderStage::TessellationEvaluation).copied()),
            BlendState: D3D12_BLEND_DESC {
                AlphaToCoverageEnable: BOOL::from(info.multisample_state.alpha_to_coverage_enable),
                IndependentBlendEnable: BOOL::from(cb.attachments.len() > 1),
                RenderTarget: render_targets,
            },
            SampleMask: info.multisample_state.sample_mask,
            RasterizerState: D3D12_RASTERIZER_DESC {
                FillMode: D3D12_FILL_MODE(convert::fill_mode(rs.polygon_mode)?),
                CullMode: D3D12_CULL_MODE(convert::cull_mode(rs.cull_mode)?),
                FrontCounterClockwise: BOOL::from(rs.front_face == FrontFace::CounterClockwise),
                DepthBias: rs.depth_bias_constant_factor as i32,
                DepthBiasClamp: rs.depth_bias_clamp,
                SlopeScaledDepthBias: rs.depth_bias_slope_factor,
                DepthClipEnable: BOOL::from(!rs.depth_clamp_enable),
                MultisampleEnable: BOOL::from(info.multisample_state.rasterisation_samples > 1),
                AntialiasedLineEnable: BOOL::from(false),
                ForcedSampleCount: 0,
                ConservativeRaster: D3D12_CONSERVATIVE_RASTERIZATION_MODE_OFF,
            },
            DepthStencilState: D3D12_DEPTH_STENCIL_DESC {
                DepthEnable: BOOL::from(ds.depth_test_enable),
                DepthWriteMask: if ds.depth_write_enable {
                    D3D12_DEPTH_WRITE_MASK_ALL
                } else {
                    D3D12_DEPTH_WRITE_MASK_ZERO
                },
                DepthFunc: D3D12_COMPARISON_FUNC(convert::comparison_func(ds.depth_compare_op)),
                StencilEnable: BOOL::from(ds.stencil_test_enable),
                StencilReadMask: ds.front.compare_mask as u8,
                StencilWriteMask: ds.front.write_mask as u8,
                FrontFace: face(&ds.front),
                BackFace: face(&ds.back),
            },
            InputLayout: D3D12_INPUT_LAYOUT_DESC {
                pInputElementDescs: elements.as_ptr(),
                NumElements: elements.len() as u32,
            },
            PrimitiveTopologyType: D3D12_PRIMITIVE_TOPOLOGY_TYPE(convert::topology_type(
                info.input_assembly_state.topology,
            )),
            NumRenderTargets: info.colour_formats.len().min(8) as u32,
            RTVFormats: rtv_formats,
            DSVFormat: DXGI_FORMAT(info.depth_format as i32),
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: info.multisample_state.rasterisation_samples.max(1),
                Quality: 0,
            },
            ..Default::default()
        };

        let created: windows::core::Result<ID3D12PipelineState> =
            unsafe { self.device.CreateGraphicsPipelineState(&desc) };
        drop(ManuallyDrop::into_inner(desc.pRootSignature));
        let state = created.context("Failed to create graphics pipeline state")?;

        let pipeline = D3D12Pipeline {
            topology: D3D_PRIMITIVE_TOPOLOGY(convert::topology(info.input_assembly_state.topology)?),
            stencil_ref: ds.front.reference,
            blend_constants: cb.blend_constants,
            strides: info
                .vertex_input_state
                .bindings
                .iter()
                .map(|b| (b.binding_index, b.stride as u32))
                .collect(),
            root_parameters,
            root_signature,
            state,
        };
        self.pipelines
            .insert(PipelineHandle::from_raw(pipeline.state.as_raw() as u64), pipeline)
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
        unsafe {
            self.allocator
                .Reset()
                .context("Failed to reset command allocator")?;
            self.list
                .Reset(&self.allocator, None::<&ID3D12PipelineState>)
                .context("Failed to reset command list")?;
            self.list.SetDescriptorHeaps(&[
                Some(self.view_ring.heap.clone()),
                Some(self.sampler_ring.heap.clone()),
            ]);
        }
        self.view_ring.next = 0;
        self.sampler_ring.next = 0;
        self.recording = true;
        self.current_pipeline = None;
        self.pending_descriptors.clear();
        Ok(())
    }

    fn end_rendering(&mut self) -> Result<()> {
        self.check_recording()?;

        // Hand swapchain images back in the state the runtime gave them to us
        let mut barriers = Vec::new();
        for image in self.images.values_mut() {
            if let Some(expected) = image.swapchain_state {
                if image.state != expected {
                    barriers.push(transition_barrier(&image.resource, image.state, expected));
                    image.state = expected;
                }
            }
        }

        unsafe {
            if !barriers.is_empty() {
                self.list.ResourceBarrier(&barriers);
            }
            self.list.Close().context("Failed to close command list")?;
            let list: ID3D12CommandList = self.list.cast()?;
            self.queue.ExecuteCommandLists(&[Some(list)]);
        }
        self.recording = false;
        self.wait_idle()
    }

    fn set_buffer_data(&mut self, buffer: BufferHandle, offset: usize, data: &[u8]) -> Result<()> {
        let entry = self.buffers.get(buffer)?;
        if offset
            .checked_add(data.len())
            .map_or(true, |end| end > entry.info.size)
        {
            anyhow::bail!(
                "Write of {} bytes at offset {} overflows buffer of {} bytes",
                data.len(),
                offset,
                entry.info.size
            );
        }
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), entry.mapped.add(offset), data.len())
        };
        Ok(())
    }

    fn clear_colour(&mut self, view: ImageViewHandle, colour: [f32; 4]) -> Result<()> {
        self.check_recording()?;
        let (image, cpu, kind) = {
            let v = self.image_views.get(view)?;
            (v.image, v.cpu, v.kind)
        };
        if kind != ImageViewKind::Rtv {
            anyhow::bail!("{:?} is not a render target view", view);
        }
        self.transition(image, D3D12_RESOURCE_STATE_RENDER_TARGET)?;
        unsafe { self.list.ClearRenderTargetView(cpu, &colour, None) };
        Ok(())
    }

    fn clear_depth(&mut self, view: ImageViewHandle, depth: f32) -> Result<()> {
        self.check_recording()?;
        let (image, cpu, kind) = {
            let v = self.image_views.get(view)?;
            (v.image, v.cpu, v.kind)
        };
        if kind != ImageViewKind::Dsv {
            anyhow::bail!("{:?} is not a depth stencil view", view);
        }
        self.transition(image, D3D12_RESOURCE_STATE_DEPTH_WRITE)?;
        unsafe {
            self.list
                .ClearDepthStencilView(cpu, D3D12_CLEAR_FLAG_DEPTH, depth, 0, None)
        };
        Ok(())
    }

    fn set_render_attachments(
        &mut self,
        colour_views: &[ImageViewHandle],
        depth_view: Option<ImageViewHandle>,
    ) -> Result<()> {
        self.check_recording()?;
        let mut rtvs = Vec::with_capacity(colour_views.len());
        for &v in colour_views {
            let (image, cpu, kind) = {
                let view = self.image_views.get(v)?;
                (view.image, view.cpu, view.kind)
            };
            if kind != ImageViewKind::Rtv {
                anyhow::bail!("{:?} is not a render target view", v);
            }
            self.transition(image, D3D12_RESOURCE_STATE_RENDER_TARGET)?;
            rtvs.push(cpu);
        }
        let dsv = match depth_view {
            Some(v) => {
                let (image, cpu, kind) = {
                    let view = self.image_views.get(v)?;
                    (view.image, view.cpu, view.kind)
                };
                if kind != ImageViewKind::Dsv {
                    anyhow::bail!("{:?} is not a depth stencil view", v);
                }
                self.transition(image, D3D12_RESOURCE_STATE_DEPTH_WRITE)?;
                Some(cpu)
            }
            None => None,
        };
        unsafe {
            self.list.OMSetRenderTargets(
                rtvs.len() as u32,
                (!rtvs.is_empty()).then(|| rtvs.as_ptr()),
                false,
                dsv.as_ref().map(|d| d as *const _),
            )
        };
        Ok(())
    }

    fn set_viewports(&mut self, viewports: &[Viewport]) -> Result<()> {
        self.check_recording()?;
        let viewports: Vec<D3D12_VIEWPORT> = viewports
            .iter()
            .map(|v| D3D12_VIEWPORT {
                TopLeftX: v.x,
                TopLeftY: v.y,
                Width: v.width,
                Height: v.height,
                MinDepth: v.min_depth,
                MaxDepth: v.max_depth,
            })
            .collect();
        unsafe { self.list.RSSetViewports(&viewports) };
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
        unsafe { self.list.RSSetScissorRects(&rects) };
        Ok(())
    }

    fn set_pipeline(&mut self, pipeline: PipelineHandle) -> Result<()> {
        self.check_recording()?;
        let p = self.pipelines.get(pipeline)?;
        unsafe {
            self.list.SetGraphicsRootSignature(&p.root_signature);
            self.list.SetPipelineState(&p.state);
            self.list.IASetPrimitiveTopology(p.topology);
            self.list.OMSetBlendFactor(Some(&p.blend_constants));
            self.list.OMSetStencilRef(p.stencil_ref);
        }
        self.current_pipeline = Some(pipeline);
        self.pending_descriptors.clear();
        Ok(())
    }

    fn set_descriptor(&mut self, info: &DescriptorInfo) -> Result<()> {
        self.pending_descriptors.retain(|d| {
            d.binding_index != info.binding_index
                || d.stage != info.stage
                || d.descriptor_type() != info.descriptor_type()
        });
        self.pending_descriptors.push(*info);
        Ok(())
    }

    fn update_descriptors(&mut self) -> Result<()> {
        self.check_recording()?;
        let pipeline = self
            .current_pipeline
            .context("update_descriptors called without a bound pipeline")?;
        let pending = std::mem::take(&mut self.pending_descriptors);

        for d in &pending {
            let index = *self
                .pipelines
                .get(pipeline)?
                .root_parameters
                .get(&(d.stage, d.binding_index, d.descriptor_type()))
                .with_context(|| {
                    format!(
                        "Pipeline layout has no {:?} binding {} for {:?}",
                        d.descriptor_type(),
                        d.binding_index,
                        d.stage
                    )
                })?;

            match d.resource {
                DescriptorResource::Buffer(handle) => {
                    let buffer = self.buffers.get(handle)?;
                    let (offset, size) = d.buffer_range(buffer.info.size)?;
                    if offset % convert::CONSTANT_BUFFER_ALIGNMENT != 0 {
                        anyhow::bail!(
                            "Root CBV offset {} is not {}-byte aligned",
                            offset,
                            convert::CONSTANT_BUFFER_ALIGNMENT
                        );
                    }
                    log::trace!("Root CBV {} bytes at offset {}", size, offset);
                    let address =
                        unsafe { buffer.resource.GetGPUVirtualAddress() } + offset as u64;
                    unsafe { self.list.SetGraphicsRootConstantBufferView(index, address) };
                }
                DescriptorResource::Image(handle) => {
                    let (image, src, kind) = {
                        let v = self.image_views.get(handle)?;
                        (v.image, v.cpu, v.kind)
                    };
                    let state = match kind {
                        ImageViewKind::Srv => {
                            D3D12_RESOURCE_STATE_PIXEL_SHADER_RESOURCE
                                | D3D12_RESOURCE_STATE_NON_PIXEL_SHADER_RESOURCE
                        }
                        ImageViewKind::Uav => D3D12_RESOURCE_STATE_UNORDERED_ACCESS,
                        _ => anyhow::bail!("{:?} cannot be bound as a shader resource", handle),
                    };
                    self.transition(image, state)?;
                    let (dst, gpu) = self.view_ring.allocate()?;
                    unsafe {
                        self.device.CopyDescriptorsSimple(
                            1,
                            dst,
                            src,
                            D3D12_DESCRIPTOR_HEAP_TYPE_CBV_SRV_UAV,
                        );
                        self.list.SetGraphicsRootDescriptorTable(index, gpu);
                    }
                }
                DescriptorResource::Sampler(handle) => {
                    let src = self.samplers.get(handle)?.cpu;
                    let (dst, gpu) = self.sampler_ring.allocate()?;
                    unsafe {
                        self.device
                            .CopyDescriptorsSimple(1, dst, src, D3D12_DESCRIPTOR_HEAP_TYPE_SAMPLER);
                        self.list.SetGraphicsRootDescriptorTable(index, gpu);
                    }
                }
            }
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

        let views = buffers
            .iter()
            .enumerate()
            .map(|(slot, &handle)| {
                let buffer = self.buffers.get(handle)?;
                let stride = strides_by_slot
                    .iter()
                    .find(|(binding, _)| *binding == slot as u32)
                    .map(|(_, stride)| *stride)
                    .unwrap_or(buffer.info.stride as u32);
                Ok(D3D12_VERTEX_BUFFER_VIEW {
                    BufferLocation: unsafe { buffer.resource.GetGPUVirtualAddress() },
                    SizeInBytes: buffer.info.size as u32,
                    StrideInBytes: stride,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        unsafe { self.list.IASetVertexBuffers(0, Some(&views)) };
        Ok(())
    }

    fn set_index_buffer(&mut self, buffer: BufferHandle) -> Result<()> {
        self.check_recording()?;
        let buffer = self.buffers.get(buffer)?;
        let view = D3D12_INDEX_BUFFER_VIEW {
            BufferLocation: unsafe { buffer.resource.GetGPUVirtualAddress() },
            SizeInBytes: buffer.info.size as u32,
            Format: DXGI_FORMAT(convert::index_format(&buffer.info)),
        };
        unsafe { self.list.IASetIndexBuffer(Some(&view)) };
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
            self.list.DrawIndexedInstanced(
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
            self.list
                .DrawInstanced(vertex_count, instance_count, first_vertex, first_instance)
        };
        Ok(())
    }
}

impl Drop for D3D12Api {
    fn drop(&mut self) {
        log::info!("Destroying D3D12 device...");
        if let Err(e) = self.wait_idle() {
            log::error!("Failed to drain the D3D12 queue: {:#}", e);
        }
        for (_, buffer) in self.buffers.drain() {
            unsafe { buffer.resource.Unmap(0, None) };
        }
        unsafe {
            let _ = CloseHandle(self.fence_event);
        }
    }
}
