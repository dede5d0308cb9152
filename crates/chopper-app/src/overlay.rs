// SPDX-License-Identifier: CEPL-1.0
use anyhow::Result;
use ash::vk;
use chopper_render_vk::recorder::{OverlayContext, UiOverlay};
use std::cell::Cell;
use std::rc::Rc;

const BAR_HEIGHT: u32 = 6;
const TRACK: [f32; 4] = [0.08, 0.08, 0.10, 1.0];
const FILL: [f32; 4] = [0.20, 0.75, 0.35, 1.0];

/// Shared 0..=1 level the app updates each frame; the overlay reads it while
/// recording.
#[derive(Clone, Default)]
pub struct StatusLevel(Rc<Cell<f32>>);

impl StatusLevel {
    pub fn set(&self, level: f32) {
        self.0.set(level.clamp(0.0, 1.0));
    }

    pub fn get(&self) -> f32 {
        self.0.get()
    }
}

/// Thin bar along the bottom edge: a dark track and a fill proportional to
/// the status level (frame time against a 30 fps budget in the app).
pub struct StatusBar {
    level: StatusLevel,
}

impl StatusBar {
    pub fn new(level: StatusLevel) -> Self {
        Self { level }
    }
}

/// Track and fill rectangles for `extent`; `None` when the window is too
/// short to fit the bar.
pub fn bar_rects(extent: vk::Extent2D, level: f32) -> Option<(vk::Rect2D, vk::Rect2D)> {
    if extent.height <= BAR_HEIGHT || extent.width == 0 {
        return None;
    }
    let y = (extent.height - BAR_HEIGHT) as i32;
    let track = vk::Rect2D {
        offset: vk::Offset2D { x: 0, y },
        extent: vk::Extent2D {
            width: extent.width,
            height: BAR_HEIGHT,
        },
    };
    let fill_width = ((extent.width as f32) * level.clamp(0.0, 1.0)).round() as u32;
    let fill = vk::Rect2D {
        extent: vk::Extent2D {
            width: fill_width.max(1),
            height: BAR_HEIGHT,
        },
        ..track
    };
    Some((track, fill))
}

fn clear(color: [f32; 4]) -> vk::ClearAttachment {
    vk::ClearAttachment {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        color_attachment: 0,
        clear_value: vk::ClearValue {
            color: vk::ClearColorValue { float32: color },
        },
    }
}

impl UiOverlay for StatusBar {
    fn record(&mut self, ctx: &OverlayContext<'_>) -> Result<()> {
        let Some((track, fill)) = bar_rects(ctx.extent, self.level.get()) else {
            return Ok(());
        };
        let rect = |rect| vk::ClearRect {
            rect,
            base_array_layer: 0,
            layer_count: 1,
        };
        unsafe {
            ctx.device
                .cmd_clear_attachments(ctx.command_buffer, &[clear(TRACK)], &[rect(track)]);
            ctx.device
                .cmd_clear_attachments(ctx.command_buffer, &[clear(FILL)], &[rect(fill)]);
        }
        Ok(())
    }
}
