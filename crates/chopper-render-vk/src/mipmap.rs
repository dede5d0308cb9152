// SPDX-License-Identifier: CEPL-1.0
use crate::barrier::{self, Transition};
use anyhow::Result;
use ash::vk;
use chopper_core::FatalError;
use tracing::debug;

/// `floor(log2(max(w, h))) + 1`; a 0-sized axis counts as 1.
pub fn mip_levels(width: u32, height: u32) -> u32 {
    let largest = width.max(height).max(1);
    u32::BITS - largest.leading_zeros()
}

/// Extent of level `k` of a `width` x `height` base image, floored, never below 1.
pub fn mip_extent(width: u32, height: u32, k: u32) -> (u32, u32) {
    let shrink = |v: u32| v.checked_shr(k).unwrap_or(0).max(1);
    (shrink(width), shrink(height))
}

pub fn supports_linear_blit(props: &vk::FormatProperties) -> bool {
    props.optimal_tiling_features.contains(
        vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR
            | vk::FormatFeatureFlags::BLIT_SRC
            | vk::FormatFeatureFlags::BLIT_DST,
    )
}

/// No software fallback exists: a format that cannot be linearly blitted is
/// a configuration error.
pub unsafe fn ensure_linear_blit(
    instance: &ash::Instance,
    phys: vk::PhysicalDevice,
    format: vk::Format,
) -> Result<()> {
    let props = instance.get_physical_device_format_properties(phys, format);
    if !supports_linear_blit(&props) {
        return Err(FatalError::UnsupportedBlitFormat {
            format: format!("{format:?}"),
        }
        .into());
    }
    Ok(())
}

/// Records the blit chain for `image`.
///
/// Precondition: every level is in TRANSFER_DST_OPTIMAL and level 0 holds the
/// pixels. Afterwards every level is in SHADER_READ_ONLY_OPTIMAL.
pub unsafe fn generate(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    width: u32,
    height: u32,
    level_count: u32,
) -> Result<()> {
    use vk::ImageLayout as L;
    let color = vk::ImageAspectFlags::COLOR;
    let whole = |old, new| Transition::whole(image, old, new, color);

    for level in 1..level_count {
        let src = level - 1;
        barrier::transition(
            device,
            cmd,
            whole(L::TRANSFER_DST_OPTIMAL, L::TRANSFER_SRC_OPTIMAL).mip(src, 1),
        )?;

        let (sw, sh) = mip_extent(width, height, src);
        let (dw, dh) = mip_extent(width, height, level);
        let blit = vk::ImageBlit {
            src_subresource: vk::ImageSubresourceLayers {
                aspect_mask: color,
                mip_level: src,
                base_array_layer: 0,
                layer_count: 1,
            },
            src_offsets: [
                vk::Offset3D::default(),
                vk::Offset3D {
                    x: sw as i32,
                    y: sh as i32,
                    z: 1,
                },
            ],
            dst_subresource: vk::ImageSubresourceLayers {
                aspect_mask: color,
                mip_level: level,
                base_array_layer: 0,
                layer_count: 1,
            },
            dst_offsets: [
                vk::Offset3D::default(),
                vk::Offset3D {
                    x: dw as i32,
                    y: dh as i32,
                    z: 1,
                },
            ],
        };
        device.cmd_blit_image(
            cmd,
            image,
            L::TRANSFER_SRC_OPTIMAL,
            image,
            L::TRANSFER_DST_OPTIMAL,
            std::slice::from_ref(&blit),
            vk::Filter::LINEAR,
        );

        barrier::transition(
            device,
            cmd,
            whole(L::TRANSFER_SRC_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL).mip(src, 1),
        )?;
    }

    // The last level was only ever written.
    barrier::transition(
        device,
        cmd,
        whole(L::TRANSFER_DST_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL)
            .mip(level_count.saturating_sub(1), 1),
    )?;
    debug!("mip chain recorded: {width}x{height}, {level_count} levels");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_count_from_largest_axis() {
        assert_eq!(mip_levels(512, 512), 10);
        assert_eq!(mip_levels(1024, 1), 11);
        assert_eq!(mip_levels(1, 1), 1);
        assert_eq!(mip_levels(300, 200), 9);
        assert_eq!(mip_levels(0, 0), 1);
    }

    #[test]
    fn square_512_chain_widths() {
        let widths: Vec<u32> = (0..mip_levels(512, 512))
            .map(|k| mip_extent(512, 512, k).0)
            .collect();
        assert_eq!(widths, vec![512, 256, 128, 64, 32, 16, 8, 4, 2, 1]);
    }

    #[test]
    fn non_square_levels_floor_and_clamp() {
        assert_eq!(mip_extent(300, 200, 1), (150, 100));
        assert_eq!(mip_extent(300, 200, 3), (37, 25));
        assert_eq!(mip_extent(300, 200, 8), (1, 1));
        assert_eq!(mip_extent(16, 4, 3), (2, 1));
        assert_eq!(mip_extent(7, 7, 40), (1, 1));
    }

    #[test]
    fn linear_blit_needs_all_three_features() {
        let mut props = vk::FormatProperties {
            optimal_tiling_features: vk::FormatFeatureFlags::BLIT_SRC
                | vk::FormatFeatureFlags::BLIT_DST,
            ..Default::default()
        };
        assert!(!supports_linear_blit(&props));
        props.optimal_tiling_features |= vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR;
        assert!(supports_linear_blit(&props));
    }
}
