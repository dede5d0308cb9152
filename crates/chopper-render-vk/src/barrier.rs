// SPDX-License-Identifier: CEPL-1.0
//! Image layout transitions.
//!
//! Every (old, new, aspect) triple the engine uses is declared once in
//! [`transition_masks`]. Anything else is a programming error and fails with
//! [`FatalError::UnsupportedTransition`] instead of guessing masks.
use anyhow::Result;
use ash::vk;
use chopper_core::FatalError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AspectKind {
    Color,
    Depth,
}

impl AspectKind {
    pub fn of(mask: vk::ImageAspectFlags) -> Self {
        if mask.intersects(vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL) {
            AspectKind::Depth
        } else {
            AspectKind::Color
        }
    }

    fn name(self) -> &'static str {
        match self {
            AspectKind::Color => "color",
            AspectKind::Depth => "depth",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Masks {
    pub src_stage: vk::PipelineStageFlags2,
    pub src_access: vk::AccessFlags2,
    pub dst_stage: vk::PipelineStageFlags2,
    pub dst_access: vk::AccessFlags2,
}

pub fn transition_masks(
    old: vk::ImageLayout,
    new: vk::ImageLayout,
    aspect: AspectKind,
) -> Result<Masks, FatalError> {
    use vk::AccessFlags2 as A;
    use vk::ImageLayout as L;
    use vk::PipelineStageFlags2 as S;

    let masks = |src_stage, src_access, dst_stage, dst_access| Masks {
        src_stage,
        src_access,
        dst_stage,
        dst_access,
    };

    let m = match (old, new, aspect) {
        // Upload target: nothing to wait on.
        (L::UNDEFINED, L::TRANSFER_DST_OPTIMAL, AspectKind::Color) => {
            masks(S::TOP_OF_PIPE, A::NONE, S::TRANSFER, A::TRANSFER_WRITE)
        }
        (L::TRANSFER_DST_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL, AspectKind::Color) => masks(
            S::TRANSFER,
            A::TRANSFER_WRITE,
            S::FRAGMENT_SHADER,
            A::SHADER_READ,
        ),
        // Mip chain: a written level becomes the next blit's source.
        (L::TRANSFER_DST_OPTIMAL, L::TRANSFER_SRC_OPTIMAL, AspectKind::Color) => {
            masks(S::TRANSFER, A::TRANSFER_WRITE, S::TRANSFER, A::TRANSFER_READ)
        }
        (L::TRANSFER_SRC_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL, AspectKind::Color) => masks(
            S::TRANSFER,
            A::TRANSFER_READ,
            S::FRAGMENT_SHADER,
            A::SHADER_READ,
        ),
        (L::UNDEFINED, L::COLOR_ATTACHMENT_OPTIMAL, AspectKind::Color) => masks(
            S::TOP_OF_PIPE,
            A::NONE,
            S::COLOR_ATTACHMENT_OUTPUT,
            A::COLOR_ATTACHMENT_WRITE,
        ),
        (L::COLOR_ATTACHMENT_OPTIMAL, L::PRESENT_SRC_KHR, AspectKind::Color) => masks(
            S::COLOR_ATTACHMENT_OUTPUT,
            A::COLOR_ATTACHMENT_WRITE,
            S::BOTTOM_OF_PIPE,
            A::NONE,
        ),
        (
            L::UNDEFINED,
            L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL | L::DEPTH_ATTACHMENT_OPTIMAL,
            AspectKind::Depth,
        ) => masks(
            S::TOP_OF_PIPE,
            A::NONE,
            S::EARLY_FRAGMENT_TESTS | S::LATE_FRAGMENT_TESTS,
            A::DEPTH_STENCIL_ATTACHMENT_READ | A::DEPTH_STENCIL_ATTACHMENT_WRITE,
        ),
        _ => {
            return Err(FatalError::UnsupportedTransition {
                old: format!("{old:?}"),
                new: format!("{new:?}"),
                aspect: aspect.name(),
            })
        }
    };
    Ok(m)
}

/// One layout change on a contiguous mip range of a single-layer image.
#[derive(Clone, Copy, Debug)]
pub struct Transition {
    pub image: vk::Image,
    pub old: vk::ImageLayout,
    pub new: vk::ImageLayout,
    pub aspect_mask: vk::ImageAspectFlags,
    pub base_mip: u32,
    pub level_count: u32,
}

impl Transition {
    pub fn whole(
        image: vk::Image,
        old: vk::ImageLayout,
        new: vk::ImageLayout,
        aspect_mask: vk::ImageAspectFlags,
    ) -> Self {
        Self {
            image,
            old,
            new,
            aspect_mask,
            base_mip: 0,
            level_count: vk::REMAINING_MIP_LEVELS,
        }
    }

    pub fn mip(self, base_mip: u32, level_count: u32) -> Self {
        Self {
            base_mip,
            level_count,
            ..self
        }
    }

    fn barrier(&self) -> Result<vk::ImageMemoryBarrier2<'static>, FatalError> {
        let m = transition_masks(self.old, self.new, AspectKind::of(self.aspect_mask))?;
        Ok(vk::ImageMemoryBarrier2 {
            s_type: vk::StructureType::IMAGE_MEMORY_BARRIER_2,
            src_stage_mask: m.src_stage,
            src_access_mask: m.src_access,
            dst_stage_mask: m.dst_stage,
            dst_access_mask: m.dst_access,
            old_layout: self.old,
            new_layout: self.new,
            src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            image: self.image,
            subresource_range: vk::ImageSubresourceRange {
                aspect_mask: self.aspect_mask,
                base_mip_level: self.base_mip,
                level_count: self.level_count,
                base_array_layer: 0,
                layer_count: 1,
            },
            ..Default::default()
        })
    }
}

/// Records all `transitions` as one synchronization2 dependency.
/// The table is consulted for every entry before anything is recorded.
pub unsafe fn record(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    transitions: &[Transition],
) -> Result<()> {
    let barriers = transitions
        .iter()
        .map(Transition::barrier)
        .collect::<Result<Vec<_>, _>>()?;
    let dep = vk::DependencyInfo {
        s_type: vk::StructureType::DEPENDENCY_INFO,
        image_memory_barrier_count: barriers.len() as u32,
        p_image_memory_barriers: barriers.as_ptr(),
        ..Default::default()
    };
    device.cmd_pipeline_barrier2(cmd, &dep);
    Ok(())
}

pub unsafe fn transition(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    t: Transition,
) -> Result<()> {
    record(device, cmd, std::slice::from_ref(&t))
}

#[cfg(test)]
mod tests {
    use super::*;
    use vk::AccessFlags2 as A;
    use vk::ImageLayout as L;
    use vk::PipelineStageFlags2 as S;

    #[test]
    fn upload_transitions_match_policy() {
        let m = transition_masks(L::UNDEFINED, L::TRANSFER_DST_OPTIMAL, AspectKind::Color).unwrap();
        assert_eq!(m.src_stage, S::TOP_OF_PIPE);
        assert!(m.src_access.is_empty());
        assert_eq!(m.dst_stage, S::TRANSFER);
        assert_eq!(m.dst_access, A::TRANSFER_WRITE);

        let m = transition_masks(
            L::TRANSFER_DST_OPTIMAL,
            L::SHADER_READ_ONLY_OPTIMAL,
            AspectKind::Color,
        )
        .unwrap();
        assert_eq!((m.src_stage, m.src_access), (S::TRANSFER, A::TRANSFER_WRITE));
        assert_eq!((m.dst_stage, m.dst_access), (S::FRAGMENT_SHADER, A::SHADER_READ));
    }

    #[test]
    fn frame_transitions_match_policy() {
        let m = transition_masks(L::UNDEFINED, L::COLOR_ATTACHMENT_OPTIMAL, AspectKind::Color)
            .unwrap();
        assert_eq!(m.src_stage, S::TOP_OF_PIPE);
        assert_eq!(m.dst_stage, S::COLOR_ATTACHMENT_OUTPUT);
        assert_eq!(m.dst_access, A::COLOR_ATTACHMENT_WRITE);

        let m = transition_masks(L::COLOR_ATTACHMENT_OPTIMAL, L::PRESENT_SRC_KHR, AspectKind::Color)
            .unwrap();
        assert_eq!((m.src_stage, m.src_access), (S::COLOR_ATTACHMENT_OUTPUT, A::COLOR_ATTACHMENT_WRITE));
        assert_eq!(m.dst_stage, S::BOTTOM_OF_PIPE);
        assert!(m.dst_access.is_empty());

        let m = transition_masks(
            L::UNDEFINED,
            L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            AspectKind::Depth,
        )
        .unwrap();
        assert_eq!(m.src_stage, S::TOP_OF_PIPE);
        assert!(m.dst_stage.contains(S::EARLY_FRAGMENT_TESTS));
        assert!(m.dst_access.contains(A::DEPTH_STENCIL_ATTACHMENT_WRITE));
    }

    #[test]
    fn unknown_pairs_fail_loudly() {
        let err = transition_masks(L::UNDEFINED, L::GENERAL, AspectKind::Color).unwrap_err();
        assert!(matches!(err, FatalError::UnsupportedTransition { aspect: "color", .. }));

        // Right layouts, wrong aspect.
        assert!(transition_masks(
            L::UNDEFINED,
            L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            AspectKind::Color
        )
        .is_err());
        assert!(
            transition_masks(L::UNDEFINED, L::COLOR_ATTACHMENT_OPTIMAL, AspectKind::Depth).is_err()
        );
    }

    #[test]
    fn aspect_kind_from_mask() {
        assert_eq!(AspectKind::of(vk::ImageAspectFlags::COLOR), AspectKind::Color);
        assert_eq!(
            AspectKind::of(vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL),
            AspectKind::Depth
        );
    }

    #[test]
    fn unsupported_entry_blocks_the_whole_batch() {
        let ok = Transition::whole(
            vk::Image::null(),
            L::UNDEFINED,
            L::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageAspectFlags::COLOR,
        );
        let bad = Transition { new: L::GENERAL, ..ok };
        assert!(ok.barrier().is_ok());
        assert!(bad.barrier().is_err());
        assert_eq!(ok.mip(3, 1).base_mip, 3);
    }
}
