// Direct3D backends
//
// `convert` holds the value translation shared by D3D11 and D3D12; the
// device code only builds on Windows.

pub mod convert;

#[cfg(windows)]
pub mod d3d11;
#[cfg(windows)]
pub mod d3d12;

#[cfg(windows)]
pub use d3d11::D3D11Api;
#[cfg(windows)]
pub use d3d12::D3D12Api;

#[cfg(windows)]
use anyhow::{Context, Result};
#[cfg(windows)]
use windows::Win32::Graphics::Dxgi::{CreateDXGIFactory1, IDXGIAdapter1, IDXGIFactory1};

/// Adapter whose LUID matches the one the OpenXR runtime asked for
#[cfg(windows)]
pub(crate) fn find_adapter(low_part: u32, high_part: i32) -> Result<IDXGIAdapter1> {
    let factory: IDXGIFactory1 =
        unsafe { CreateDXGIFactory1() }.context("Failed to create DXGI factory")?;

    let mut index = 0;
    while let Ok(adapter) = unsafe { factory.EnumAdapters1(index) } {
        let desc = unsafe { adapter.GetDesc1() }.context("Failed to get adapter description")?;
        if desc.AdapterLuid.LowPart == low_part && desc.AdapterLuid.HighPart == high_part {
            let name_len = desc.Description.iter().position(|&c| c == 0).unwrap_or(desc.Description.len());
            log::info!(
                "Selected GPU: {}",
                String::from_utf16_lossy(&desc.Description[..name_len])
            );
            return Ok(adapter);
        }
        index += 1;
    }

    anyhow::bail!("No DXGI adapter matches the OpenXR runtime's LUID")
}
