// SPDX-License-Identifier: CEPL-1.0
//! Frames in flight.
//!
//! K frame slots (fence + command buffer + mapped uniforms) rotate modulo K.
//! Presentation semaphores belong to swapchain images instead, and rotate
//! modulo the image count on an independent counter.
use crate::allocator::{Allocator, GpuBuffer, MemoryIntent};
use crate::context::DeviceContext;
use crate::swapchain::SwapchainManager;
use anyhow::{ensure, Context, Result};
use ash::vk;
use chopper_core::FatalError;
use chopper_render::Presented;
use std::time::Duration;
use tracing::debug;

pub const FRAMES_IN_FLIGHT: usize = 2;

/// Upper bound on any single GPU wait. Exceeding it means the GPU hung.
pub const GPU_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    /// Fence signaled; the host may touch the slot.
    Idle,
    /// Fence reset, command buffer being recorded.
    Recording,
    /// Handed to the queue; owned by the GPU until the fence signals.
    Submitted,
}

/// Counters and per-slot state, free of any Vulkan object.
#[derive(Debug)]
pub struct FrameCursor {
    frame: usize,
    present: usize,
    image_count: usize,
    states: [SlotState; FRAMES_IN_FLIGHT],
}

impl FrameCursor {
    pub fn new(image_count: usize) -> Self {
        Self {
            frame: 0,
            present: 0,
            image_count: image_count.max(1),
            states: [SlotState::Idle; FRAMES_IN_FLIGHT],
        }
    }

    pub fn frame_slot(&self) -> usize {
        self.frame
    }

    pub fn present_slot(&self) -> usize {
        self.present
    }

    pub fn state(&self, slot: usize) -> SlotState {
        self.states[slot]
    }

    /// The current slot's fence has signaled.
    pub fn fence_signaled(&mut self) {
        let s = &mut self.states[self.frame];
        if *s == SlotState::Submitted {
            *s = SlotState::Idle;
        }
    }

    /// Idle -> Recording. Only valid once the fence has been observed signaled.
    pub fn arm(&mut self) -> Result<()> {
        let s = &mut self.states[self.frame];
        ensure!(
            *s == SlotState::Idle,
            "frame slot {} armed while {:?}",
            self.frame,
            s
        );
        *s = SlotState::Recording;
        Ok(())
    }

    pub fn ensure_recording(&self) -> Result<()> {
        let s = self.states[self.frame];
        ensure!(
            s == SlotState::Recording,
            "frame slot {} touched while {:?}",
            self.frame,
            s
        );
        Ok(())
    }

    /// Recording -> Submitted.
    pub fn submitted(&mut self) -> Result<()> {
        self.ensure_recording()?;
        self.states[self.frame] = SlotState::Submitted;
        Ok(())
    }

    /// Both counters step after a present; neither depends on the other.
    pub fn advance(&mut self) {
        self.frame = (self.frame + 1) % FRAMES_IN_FLIGHT;
        self.present = (self.present + 1) % self.image_count;
    }

    /// New swapchain: restart the presentation counter for `image_count` images.
    /// Slot states are kept; the device is idle so fences are all signaled.
    pub fn reset_images(&mut self, image_count: usize) {
        self.image_count = image_count.max(1);
        self.present = 0;
        for s in &mut self.states {
            if *s == SlotState::Submitted {
                *s = SlotState::Idle;
            }
        }
    }
}

pub struct FrameSlot {
    pub fence: vk::Fence,
    pub cmd: vk::CommandBuffer,
    pub uniforms: GpuBuffer,
}

struct PresentSignals {
    image_available: vk::Semaphore,
    render_finished: vk::Semaphore,
}

pub struct FrameSynchronizer {
    device: ash::Device,
    queue: vk::Queue,
    pool: vk::CommandPool,
    slots: Vec<FrameSlot>,
    signals: Vec<PresentSignals>,
    cursor: FrameCursor,
}

unsafe fn create_signals(device: &ash::Device, count: usize) -> Result<Vec<PresentSignals>> {
    let ci = vk::SemaphoreCreateInfo::default();
    (0..count)
        .map(|_| -> Result<PresentSignals> {
            Ok(PresentSignals {
                image_available: device.create_semaphore(&ci, None)?,
                render_finished: device.create_semaphore(&ci, None)?,
            })
        })
        .collect()
}

unsafe fn destroy_signals(device: &ash::Device, signals: &mut Vec<PresentSignals>) {
    for s in signals.drain(..) {
        device.destroy_semaphore(s.image_available, None);
        device.destroy_semaphore(s.render_finished, None);
    }
}

fn timeout_ns() -> u64 {
    GPU_WAIT_TIMEOUT.as_nanos() as u64
}

impl FrameSynchronizer {
    pub fn new(
        ctx: &DeviceContext,
        allocator: &Allocator,
        image_count: usize,
        uniform_size: vk::DeviceSize,
    ) -> Result<Self> {
        let device = ctx.device.clone();
        unsafe {
            let pool_info = vk::CommandPoolCreateInfo {
                s_type: vk::StructureType::COMMAND_POOL_CREATE_INFO,
                queue_family_index: ctx.queue_family,
                flags: vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
                ..Default::default()
            };
            let pool = device
                .create_command_pool(&pool_info, None)
                .context("frame command pool")?;
            // Empty until filled, so Drop can clean up partial construction.
            let mut out = Self {
                device: device.clone(),
                queue: ctx.queue,
                pool,
                slots: Vec::with_capacity(FRAMES_IN_FLIGHT),
                signals: Vec::new(),
                cursor: FrameCursor::new(image_count),
            };

            let alloc_info = vk::CommandBufferAllocateInfo {
                s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
                command_pool: pool,
                level: vk::CommandBufferLevel::PRIMARY,
                command_buffer_count: FRAMES_IN_FLIGHT as u32,
                ..Default::default()
            };
            let cmds = device
                .allocate_command_buffers(&alloc_info)
                .context("frame command buffers")?;

            // Signaled so the first wait on each slot returns immediately.
            let fence_ci = vk::FenceCreateInfo {
                s_type: vk::StructureType::FENCE_CREATE_INFO,
                flags: vk::FenceCreateFlags::SIGNALED,
                ..Default::default()
            };
            for cmd in cmds {
                let uniforms = allocator.create_buffer(
                    uniform_size,
                    vk::BufferUsageFlags::UNIFORM_BUFFER,
                    MemoryIntent::HostSequentialWrite,
                )?;
                let fence = device.create_fence(&fence_ci, None)?;
                out.slots.push(FrameSlot {
                    fence,
                    cmd,
                    uniforms,
                });
            }
            out.signals = create_signals(&device, image_count)?;
            debug!(
                "frame sync: {} slots, {} present signal pairs",
                FRAMES_IN_FLIGHT, image_count
            );
            Ok(out)
        }
    }

    pub fn frame_index(&self) -> usize {
        self.cursor.frame_slot()
    }

    pub fn slots(&self) -> &[FrameSlot] {
        &self.slots
    }

    /// Blocks until the current slot's previous submission completed.
    /// The fence is NOT reset here: an out-of-date acquisition may still
    /// abandon this frame, and the next wait must not deadlock.
    pub fn begin_frame(&mut self) -> Result<()> {
        let fence = self.slots[self.cursor.frame_slot()].fence;
        match unsafe { self.device.wait_for_fences(&[fence], true, timeout_ns()) } {
            Ok(()) => {}
            Err(vk::Result::TIMEOUT) => {
                return Err(FatalError::GpuTimeout {
                    what: "frame fence",
                    timeout_ms: GPU_WAIT_TIMEOUT.as_millis() as u64,
                }
                .into())
            }
            Err(e) => return Err(e).context("vkWaitForFences(frame)"),
        }
        self.cursor.fence_signaled();
        Ok(())
    }

    /// Semaphore the next acquisition signals.
    pub fn image_available(&self) -> vk::Semaphore {
        self.signals[self.cursor.present_slot()].image_available
    }

    /// Commits the current slot to this frame after a successful acquire:
    /// resets its fence and command buffer.
    pub fn arm(&mut self) -> Result<&FrameSlot> {
        self.cursor.arm()?;
        let slot = &self.slots[self.cursor.frame_slot()];
        unsafe {
            self.device
                .reset_fences(&[slot.fence])
                .context("vkResetFences")?;
            self.device
                .reset_command_buffer(slot.cmd, vk::CommandBufferResetFlags::empty())
                .context("vkResetCommandBuffer")?;
        }
        Ok(slot)
    }

    pub fn write_uniforms(&mut self, bytes: &[u8]) -> Result<()> {
        self.cursor.ensure_recording()?;
        self.slots[self.cursor.frame_slot()].uniforms.write(bytes)
    }

    /// Waits on this frame's image-available signal at color output, signals
    /// the image's render-finished semaphore and the slot's fence.
    pub fn submit(&mut self, image_index: u32) -> Result<()> {
        let slot = &self.slots[self.cursor.frame_slot()];
        let wait = self.signals[self.cursor.present_slot()].image_available;
        let signal = self.signals[image_index as usize].render_finished;
        let wait_stage = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;

        let submit = vk::SubmitInfo {
            s_type: vk::StructureType::SUBMIT_INFO,
            wait_semaphore_count: 1,
            p_wait_semaphores: &wait,
            p_wait_dst_stage_mask: &wait_stage,
            command_buffer_count: 1,
            p_command_buffers: &slot.cmd,
            signal_semaphore_count: 1,
            p_signal_semaphores: &signal,
            ..Default::default()
        };
        unsafe {
            self.device
                .queue_submit(self.queue, std::slice::from_ref(&submit), slot.fence)
                .context("vkQueueSubmit")?;
        }
        self.cursor.submitted()
    }

    pub fn present(&mut self, swapchain: &SwapchainManager, image_index: u32) -> Result<Presented> {
        let wait = self.signals[image_index as usize].render_finished;
        let outcome = swapchain.present(self.queue, image_index, wait)?;
        self.cursor.advance();
        Ok(outcome)
    }

    /// Replaces the per-image semaphores after the swapchain was rebuilt.
    /// The caller guarantees the device is idle.
    pub fn rebuild_present_signals(&mut self, image_count: usize) -> Result<()> {
        unsafe {
            destroy_signals(&self.device, &mut self.signals);
            self.signals = create_signals(&self.device, image_count)?;
        }
        self.cursor.reset_images(image_count);
        Ok(())
    }
}

// STRICT TEARDOWN ORDER: wait fences, semaphores, fences, command buffers
// before their pool. Uniform buffers drop with the slots afterwards.
impl Drop for FrameSynchronizer {
    fn drop(&mut self) {
        unsafe {
            let fences: Vec<_> = self.slots.iter().map(|s| s.fence).collect();
            if !fences.is_empty() {
                let _ = self.device.wait_for_fences(&fences, true, timeout_ns());
            }
            destroy_signals(&self.device, &mut self.signals);
            let cmds: Vec<_> = self.slots.iter().map(|s| s.cmd).collect();
            for f in fences {
                self.device.destroy_fence(f, None);
            }
            if !cmds.is_empty() {
                self.device.free_command_buffers(self.pool, &cmds);
            }
            self.device.destroy_command_pool(self.pool, None);
        }
    }
}
