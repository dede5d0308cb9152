// SPDX-License-Identifier: CEPL-1.0
//! Backend-agnostic rendering types shared by the app and the Vulkan core.
mod frame;
mod mesh;
mod texture;

pub use frame::{
    wait_for_framebuffer, Acquired, FrameBackend, FrameDriver, FrameInput, FrameStatus,
    FramebufferSource, Presented,
};
pub use mesh::{MeshBuilder, MeshData, Vertex};
pub use texture::TextureData;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct RenderSize {
    pub width: u32,
    pub height: u32,
}

impl RenderSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// A minimized window reports a zero-sized framebuffer in at least one axis.
    pub fn is_zero(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn aspect(&self) -> f32 {
        if self.height == 0 {
            1.0
        } else {
            self.width as f32 / self.height as f32
        }
    }
}
