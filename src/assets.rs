// Asset loading
//
// Shaders and the texture are read fully into memory up front; nothing is
// streamed. Interpretation of the bytes happens in the backend.

use crate::config::AssetsConfig;
use crate::error::RendererError;
use std::path::Path;

/// Raw bytes of every file the renderer needs at startup
pub struct Assets {
    pub vertex_shader: Vec<u8>,
    pub fragment_shader: Vec<u8>,
    pub texture: Vec<u8>,
}

impl Assets {
    pub fn load(config: &AssetsConfig) -> Result<Self, RendererError> {
        let assets = Self {
            vertex_shader: read_bytes(&config.vertex_shader)?,
            fragment_shader: read_bytes(&config.fragment_shader)?,
            texture: read_bytes(&config.texture)?,
        };

        log::info!(
            "Loaded assets: vertex shader {} B, fragment shader {} B, texture {} B",
            assets.vertex_shader.len(),
            assets.fragment_shader.len(),
            assets.texture.len()
        );

        Ok(assets)
    }
}

pub fn read_bytes(path: &Path) -> Result<Vec<u8>, RendererError> {
    std::fs::read(path).map_err(|source| RendererError::AssetLoad {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn scratch_file(name: &str, contents: &[u8]) -> PathBuf {
        let path = std::env::temp_dir().join(format!("quad-renderer-{}-{}", std::process::id(), name));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn reads_whole_file() {
        let path = scratch_file("bytes.bin", &[1, 2, 3, 4, 5]);
        assert_eq!(read_bytes(&path).unwrap(), vec![1, 2, 3, 4, 5]);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn missing_file_reports_its_path() {
        let err = read_bytes(Path::new("no/such/shader.spv")).unwrap_err();
        match err {
            RendererError::AssetLoad { path, source } => {
                assert_eq!(path, PathBuf::from("no/such/shader.spv"));
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn load_fails_on_first_missing_asset() {
        let vert = scratch_file("vert.spv", b"vert");
        let config = AssetsConfig {
            vertex_shader: vert.clone(),
            fragment_shader: PathBuf::from("no/such/frag.spv"),
            texture: PathBuf::from("no/such/texture.png"),
        };

        let err = Assets::load(&config).err().unwrap();
        assert!(err.to_string().contains("frag.spv"));
        std::fs::remove_file(vert).unwrap();
    }
}
