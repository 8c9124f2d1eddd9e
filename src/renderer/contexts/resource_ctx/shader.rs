use std::io::Cursor;
use std::sync::Arc;

use ash::vk;
use color_eyre::Result;

use crate::renderer::contexts::device_ctx::DeviceContext;
use crate::renderer::error::GfxError;
use crate::renderer::internals::registry::Registry;
use crate::renderer::sync_policy::SyncPolicy;

slotmap::new_key_type! {
    pub struct ShaderKey;
}

const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Decodes SPIR-V bytecode into words. Endianness is fixed up by `read_spv`.
pub fn parse_spirv(bytes: &[u8]) -> Result<Vec<u32>, GfxError> {
    let words = ash::util::read_spv(&mut Cursor::new(bytes)).map_err(|_| GfxError::InvalidShader)?;
    match words.first() {
        Some(&SPIRV_MAGIC) => Ok(words),
        _ => Err(GfxError::InvalidShader),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Shader {
    key: ShaderKey,
    handle: vk::ShaderModule,
    size: usize,
}

impl Shader {
    pub fn is_valid(&self) -> bool {
        self.handle != vk::ShaderModule::null() && self.size > 0
    }

    pub fn handle(&self) -> vk::ShaderModule {
        self.handle
    }

    /// Bytecode size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }
}

pub struct ShaderFactory<S: SyncPolicy> {
    modules: Registry<ShaderKey, vk::ShaderModule, S>,
    device_ctx: Arc<DeviceContext>,
}

impl<S: SyncPolicy> ShaderFactory<S> {
    pub fn new(device_ctx: Arc<DeviceContext>) -> Self {
        Self {
            modules: Registry::new(),
            device_ctx,
        }
    }

    pub fn make_shader(&self, bytecode: &[u8]) -> Result<Shader> {
        let code = parse_spirv(bytecode)?;
        let info = vk::ShaderModuleCreateInfo::default().code(&code);
        let handle = unsafe { self.device_ctx.device().create_shader_module(&info, None)? };

        let key = self.modules.insert(handle);
        Ok(Shader {
            key,
            handle,
            size: bytecode.len(),
        })
    }

    pub fn destroy_shader(&self, shader: Shader) {
        let module = self.modules.remove(shader.key);
        debug_assert!(module.is_some(), "shader destroyed twice");
        if let Some(module) = module {
            unsafe { self.device_ctx.device().destroy_shader_module(module, None) };
        }
    }

    pub fn is_live(&self, shader: &Shader) -> bool {
        self.modules.contains(shader.key)
    }
}

impl<S: SyncPolicy> Drop for ShaderFactory<S> {
    fn drop(&mut self) {
        for module in self.modules.drain() {
            unsafe { self.device_ctx.device().destroy_shader_module(module, None) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words_to_bytes(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn accepts_spirv_header() {
        let bytes = words_to_bytes(&[SPIRV_MAGIC, 0x0001_0000, 0, 1, 0]);
        let words = parse_spirv(&bytes).unwrap();
        assert_eq!(words.len(), 5);
        assert_eq!(words[0], SPIRV_MAGIC);
    }

    #[test]
    fn rejects_misaligned_bytecode() {
        let mut bytes = words_to_bytes(&[SPIRV_MAGIC, 0x0001_0000]);
        bytes.push(0);
        assert_eq!(parse_spirv(&bytes), Err(GfxError::InvalidShader));
    }

    #[test]
    fn rejects_wrong_magic() {
        let bytes = words_to_bytes(&[0xdead_beef, 0]);
        assert_eq!(parse_spirv(&bytes), Err(GfxError::InvalidShader));
        assert_eq!(parse_spirv(&[]), Err(GfxError::InvalidShader));
    }
}
