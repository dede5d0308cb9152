// SPDX-License-Identifier: CEPL-1.0
use anyhow::{ensure, Result};

/// Tightly packed RGBA8 pixels, row-major, top row first.
#[derive(Clone, Debug)]
pub struct TextureData {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl TextureData {
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self> {
        ensure!(width > 0 && height > 0, "texture has zero extent ({width}x{height})");
        let expected = width as usize * height as usize * 4;
        ensure!(
            pixels.len() == expected,
            "texture {width}x{height} needs {expected} RGBA8 bytes, got {}",
            pixels.len()
        );
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_mismatched_pixel_count() {
        assert!(TextureData::new(2, 2, vec![0; 15]).is_err());
        assert!(TextureData::new(0, 2, vec![]).is_err());
        let t = TextureData::new(2, 2, vec![0; 16]).unwrap();
        assert_eq!((t.width(), t.height(), t.pixels().len()), (2, 2, 16));
    }
}
