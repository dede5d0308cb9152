// SPDX-License-Identifier: CEPL-1.0
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const DEFAULT_CONFIG: &str = "chopper.toml";

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WindowCfg {
    pub title: String,
    pub width: u32,
    pub height: u32,
}

impl Default for WindowCfg {
    fn default() -> Self {
        Self {
            title: "chopper".into(),
            width: 1920,
            height: 1080,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VsyncMode {
    Fifo,
    #[default]
    Mailbox,
}

#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(default)]
pub struct RenderCfg {
    pub clear_color: [f32; 4],
    pub vsync_mode: VsyncMode,
    pub msaa_samples: u32,
    pub validation: bool,
}

impl Default for RenderCfg {
    fn default() -> Self {
        Self {
            clear_color: [0.02, 0.02, 0.04, 1.0],
            vsync_mode: VsyncMode::Mailbox,
            msaa_samples: 4,
            validation: cfg!(debug_assertions),
        }
    }
}

/// Missing paths fall back to the built-in cube and checkerboard.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AssetsCfg {
    pub model: Option<PathBuf>,
    pub texture: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(default)]
pub struct CameraCfg {
    pub fov_deg: f32,
    pub speed: f32,
    pub sensitivity: f32,
    pub znear: f32,
    pub zfar: f32,
}

impl Default for CameraCfg {
    fn default() -> Self {
        Self {
            fov_deg: 45.0,
            speed: 2.5,
            sensitivity: 0.1,
            znear: 0.1,
            zfar: 100.0,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppCfg {
    pub window: WindowCfg,
    pub render: RenderCfg,
    pub assets: AssetsCfg,
    pub camera: CameraCfg,
}

impl AppCfg {
    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }
}

/// A missing file is normal; a malformed one is reported and ignored.
pub fn load_cfg(path: &Path) -> AppCfg {
    match fs::read_to_string(path) {
        Ok(s) => match AppCfg::parse(&s) {
            Ok(cfg) => {
                info!("config: loaded {}", path.display());
                cfg
            }
            Err(e) => {
                warn!("config: {} is malformed ({e}); using defaults", path.display());
                AppCfg::default()
            }
        },
        Err(_) => AppCfg::default(),
    }
}
