// Shader module loading
//
// Vulkan consumes SPIR-V words. Input bytes come straight from a file, so
// they are re-read into an aligned Vec<u32> instead of being cast in place.

use anyhow::{Context, Result};
use ash::vk;
use std::io::Cursor;

use super::VulkanDevice;
use crate::backend::types::ShaderStage;

pub struct VulkanShader {
    pub module: vk::ShaderModule,
    pub stage: ShaderStage,
}

const SPIRV_MAGIC: u32 = 0x0723_0203;

/// SPIR-V words from file bytes, checking the header magic
pub fn spirv_words(code: &[u8]) -> Result<Vec<u32>> {
    let words = ash::util::read_spv(&mut Cursor::new(code)).context("Invalid SPIR-V bytecode")?;
    match words.first() {
        Some(&SPIRV_MAGIC) => Ok(words),
        Some(&other) => anyhow::bail!("Not SPIR-V: magic {:#010x}", other),
        None => anyhow::bail!("Empty SPIR-V bytecode"),
    }
}

/// Create a shader module from SPIR-V bytes
pub fn create_shader_module(device: &VulkanDevice, code: &[u8]) -> Result<vk::ShaderModule> {
    let words = spirv_words(code)?;

    let create_info = vk::ShaderModuleCreateInfo::builder().code(&words);

    unsafe {
        device
            .device
            .create_shader_module(&create_info, None)
            .context("Failed to create shader module")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module_bytes(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn accepts_spirv_header() {
        let bytes = module_bytes(&[SPIRV_MAGIC, 0x0001_0000, 0, 8, 0]);
        assert_eq!(spirv_words(&bytes).unwrap().len(), 5);
    }

    #[test]
    fn accepts_unaligned_input() {
        let mut bytes = vec![0u8];
        bytes.extend(module_bytes(&[SPIRV_MAGIC, 0x0001_0300]));
        assert_eq!(spirv_words(&bytes[1..]).unwrap(), vec![SPIRV_MAGIC, 0x0001_0300]);
    }

    #[test]
    fn rejects_dxbc_and_glsl_files() {
        // Shader directory mix-ups: a D3D blob or GLSL text handed to Vulkan
        assert!(spirv_words(b"DXBC\0\0\0\0").is_err());
        assert!(spirv_words(b"#version 450\n\n\n\n").is_err());
    }

    #[test]
    fn rejects_truncated_and_empty_input() {
        assert!(spirv_words(&[0x03, 0x02, 0x23]).is_err());
        assert!(spirv_words(&[]).is_err());
    }
}
