// Shader module loading
//
// Vulkan consumes SPIR-V bytecode. Bytes read from disk are checked and
// realigned to 32-bit words before the module is created.

use super::VulkanDevice;
use anyhow::{Context, Result};
use ash::vk;
use std::io::Cursor;
use std::sync::Arc;

/// Validate SPIR-V bytes (magic number, word multiple) and convert to words
pub fn spirv_words(code: &[u8]) -> Result<Vec<u32>> {
    ash::util::read_spv(&mut Cursor::new(code)).context("Invalid SPIR-V bytecode")
}

/// Shader module destroyed on drop; only needed until the pipeline is built
pub struct ShaderModule {
    pub module: vk::ShaderModule,
    device: Arc<VulkanDevice>,
}

impl ShaderModule {
    pub fn new(device: Arc<VulkanDevice>, code: &[u8]) -> Result<Self> {
        let words = spirv_words(code)?;
        let create_info = vk::ShaderModuleCreateInfo::builder().code(&words);

        let module = unsafe { device.device.create_shader_module(&create_info, None) }
            .context("Failed to create shader module")?;

        Ok(Self { module, device })
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_shader_module(self.module, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPIRV_MAGIC: u32 = 0x0723_0203;

    #[test]
    fn accepts_word_aligned_spirv() {
        let mut bytes = SPIRV_MAGIC.to_le_bytes().to_vec();
        bytes.extend_from_slice(&0x0001_0000u32.to_le_bytes());

        let words = spirv_words(&bytes).unwrap();
        assert_eq!(words, vec![SPIRV_MAGIC, 0x0001_0000]);
    }

    #[test]
    fn rejects_truncated_bytecode() {
        let mut bytes = SPIRV_MAGIC.to_le_bytes().to_vec();
        bytes.push(0);
        assert!(spirv_words(&bytes).is_err());
    }

    #[test]
    fn rejects_non_spirv_file() {
        // A PNG passed as a shader by mistake
        assert!(spirv_words(b"\x89PNG\r\n\x1a\n").is_err());
    }
}
