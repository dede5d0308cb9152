// SPDX-License-Identifier: CEPL-1.0
use crate::RenderSize;
use anyhow::Result;
use glam::Mat4;
use tracing::{debug, info};

/// Per-frame data supplied by the caller. View/projection are shared by every
/// object; each entry of `models` produces one indexed draw.
#[derive(Clone, Copy, Debug)]
pub struct FrameInput<'a> {
    pub view: Mat4,
    pub proj: Mat4,
    pub models: &'a [Mat4],
}

/// Outcome of acquiring a swapchain image. Staleness is not an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Acquired {
    Image { index: u32, suboptimal: bool },
    OutOfDate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Presented {
    Ok,
    Suboptimal,
    OutOfDate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameStatus {
    /// Submitted and queued for presentation.
    Presented,
    /// Acquisition reported out-of-date, or the surface could not take a
    /// swapchain yet; nothing was submitted.
    Skipped,
    /// The window is closing; nothing was recreated or submitted.
    Closed,
}

/// The window side of the recreation protocol.
pub trait FramebufferSource {
    fn framebuffer_size(&self) -> RenderSize;
    /// Blocks on the platform event pump until at least one event arrived.
    fn wait_events(&mut self);
    /// A close was requested; no further frames or recreations should run.
    fn is_closing(&self) -> bool {
        false
    }
}

/// The GPU side of one frame, split at the points where the driver has to
/// decide between continuing, skipping, and recreating.
pub trait FrameBackend {
    /// Blocks until the current frame slot's previous submission completed.
    fn begin_frame(&mut self) -> Result<()>;
    fn acquire(&mut self) -> Result<Acquired>;
    fn record_and_submit(&mut self, image_index: u32, input: &FrameInput<'_>) -> Result<()>;
    fn present(&mut self, image_index: u32) -> Result<Presented>;
    /// Waits for the device to go idle and rebuilds every swapchain-sized
    /// object for `size`. Long-lived geometry and textures are untouched.
    /// Returns `false` when the surface reports a zero extent: nothing was
    /// torn down and the caller retries on a later frame.
    fn recreate(&mut self, size: RenderSize) -> Result<bool>;
}

/// Spins on the event pump while the framebuffer is zero-sized (minimized).
/// `None` when the window started closing instead of coming back.
pub fn wait_for_framebuffer<S: FramebufferSource + ?Sized>(source: &mut S) -> Option<RenderSize> {
    let mut size = source.framebuffer_size();
    if size.is_zero() {
        info!("framebuffer is {}x{}; waiting for restore", size.width, size.height);
    }
    while size.is_zero() {
        if source.is_closing() {
            return None;
        }
        source.wait_events();
        size = source.framebuffer_size();
    }
    Some(size)
}

/// Drives [`FrameBackend`] through acquire → record/submit → present and
/// owns the "swapchain is stale" decision.
///
/// STRICT ORDER:
/// - a pending recreation always runs before the next acquisition attempt
/// - an out-of-date acquisition never reaches submit or present
/// - a suboptimal or out-of-date present recreates only after the present
#[derive(Debug, Default)]
pub struct FrameDriver {
    stale: bool,
    presented: u64,
    skipped: u64,
}

impl FrameDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resize notifications and external invalidations land here.
    pub fn mark_stale(&mut self) {
        self.stale = true;
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn presented_frames(&self) -> u64 {
        self.presented
    }

    pub fn skipped_frames(&self) -> u64 {
        self.skipped
    }

    /// Runs the recreation protocol now if one is pending. Returns whether the
    /// swapchain is ready for a frame; `false` leaves it stale.
    pub fn recreate_if_stale<B, S>(&mut self, backend: &mut B, source: &mut S) -> Result<bool>
    where
        B: FrameBackend + ?Sized,
        S: FramebufferSource + ?Sized,
    {
        if !self.stale {
            return Ok(true);
        }
        let Some(size) = wait_for_framebuffer(source) else {
            debug!("window closing; recreation abandoned");
            return Ok(false);
        };
        debug!("recreating swapchain for {}x{}", size.width, size.height);
        if backend.recreate(size)? {
            self.stale = false;
        } else {
            debug!("surface not ready; recreation deferred");
        }
        Ok(!self.stale)
    }

    pub fn draw<B, S>(
        &mut self,
        backend: &mut B,
        source: &mut S,
        input: &FrameInput<'_>,
    ) -> Result<FrameStatus>
    where
        B: FrameBackend + ?Sized,
        S: FramebufferSource + ?Sized,
    {
        if source.is_closing() {
            return Ok(FrameStatus::Closed);
        }
        if !self.recreate_if_stale(backend, source)? {
            if source.is_closing() {
                return Ok(FrameStatus::Closed);
            }
            self.skipped += 1;
            return Ok(FrameStatus::Skipped);
        }

        backend.begin_frame()?;

        let (image_index, acquire_suboptimal) = match backend.acquire()? {
            Acquired::Image { index, suboptimal } => (index, suboptimal),
            Acquired::OutOfDate => {
                debug!("acquire: out of date; skipping frame");
                self.stale = true;
                self.skipped += 1;
                return Ok(FrameStatus::Skipped);
            }
        };

        backend.record_and_submit(image_index, input)?;

        match backend.present(image_index)? {
            Presented::Ok if !acquire_suboptimal => {}
            outcome => {
                debug!(?outcome, acquire_suboptimal, "present: swapchain needs recreation");
                self.stale = true;
            }
        }
        self.presented += 1;
        Ok(FrameStatus::Presented)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Begin,
        Acquire,
        Submit(u32),
        Present(u32),
        Recreate(RenderSize),
    }

    #[derive(Default)]
    struct ScriptedBackend {
        calls: Vec<Call>,
        acquires: VecDeque<Acquired>,
        presents: VecDeque<Presented>,
        /// Outcomes of `recreate`; ready when exhausted.
        recreates: VecDeque<bool>,
        /// Size of the last successful rebuild.
        extent: Option<RenderSize>,
    }

    impl FrameBackend for ScriptedBackend {
        fn begin_frame(&mut self) -> Result<()> {
            self.calls.push(Call::Begin);
            Ok(())
        }
        fn acquire(&mut self) -> Result<Acquired> {
            self.calls.push(Call::Acquire);
            Ok(self.acquires.pop_front().unwrap_or(Acquired::Image {
                index: 0,
                suboptimal: false,
            }))
        }
        fn record_and_submit(&mut self, image_index: u32, _input: &FrameInput<'_>) -> Result<()> {
            self.calls.push(Call::Submit(image_index));
            Ok(())
        }
        fn present(&mut self, image_index: u32) -> Result<Presented> {
            self.calls.push(Call::Present(image_index));
            Ok(self.presents.pop_front().unwrap_or(Presented::Ok))
        }
        fn recreate(&mut self, size: RenderSize) -> Result<bool> {
            self.calls.push(Call::Recreate(size));
            let ready = self.recreates.pop_front().unwrap_or(true);
            if ready {
                self.extent = Some(size);
            }
            Ok(ready)
        }
    }

    /// Replays a sequence of framebuffer sizes, one per event-pump wait.
    struct ScriptedWindow {
        sizes: VecDeque<RenderSize>,
        current: RenderSize,
        waits: usize,
        /// Close is requested once this many waits have happened.
        close_after: Option<usize>,
        closing: bool,
    }

    impl ScriptedWindow {
        fn steady(size: RenderSize) -> Self {
            Self::scripted(size, Vec::new())
        }

        fn scripted(current: RenderSize, sizes: Vec<RenderSize>) -> Self {
            Self {
                sizes: sizes.into(),
                current,
                waits: 0,
                close_after: None,
                closing: false,
            }
        }
    }

    impl FramebufferSource for ScriptedWindow {
        fn framebuffer_size(&self) -> RenderSize {
            self.current
        }
        fn wait_events(&mut self) {
            self.waits += 1;
            if let Some(next) = self.sizes.pop_front() {
                self.current = next;
            }
            if self.close_after == Some(self.waits) {
                self.closing = true;
            }
        }
        fn is_closing(&self) -> bool {
            self.closing
        }
    }

    fn input() -> FrameInput<'static> {
        FrameInput {
            view: Mat4::IDENTITY,
            proj: Mat4::IDENTITY,
            models: &[],
        }
    }

    #[test]
    fn healthy_frame_runs_in_order() {
        let mut backend = ScriptedBackend::default();
        backend.acquires.push_back(Acquired::Image {
            index: 2,
            suboptimal: false,
        });
        let mut window = ScriptedWindow::steady(RenderSize::new(800, 600));
        let mut driver = FrameDriver::new();

        let status = driver.draw(&mut backend, &mut window, &input()).unwrap();

        assert_eq!(status, FrameStatus::Presented);
        assert_eq!(
            backend.calls,
            vec![Call::Begin, Call::Acquire, Call::Submit(2), Call::Present(2)]
        );
        assert!(!driver.is_stale());
    }

    #[test]
    fn out_of_date_acquire_skips_and_recreates_before_next_acquire() {
        let mut backend = ScriptedBackend::default();
        backend.acquires.push_back(Acquired::OutOfDate);
        let mut window = ScriptedWindow::steady(RenderSize::new(640, 480));
        let mut driver = FrameDriver::new();

        let status = driver.draw(&mut backend, &mut window, &input()).unwrap();
        assert_eq!(status, FrameStatus::Skipped);
        assert!(!backend
            .calls
            .iter()
            .any(|c| matches!(c, Call::Submit(_) | Call::Present(_))));

        driver.draw(&mut backend, &mut window, &input()).unwrap();
        let recreate = backend
            .calls
            .iter()
            .position(|c| *c == Call::Recreate(RenderSize::new(640, 480)))
            .expect("recreate ran");
        let second_acquire = backend
            .calls
            .iter()
            .enumerate()
            .filter(|(_, c)| **c == Call::Acquire)
            .nth(1)
            .map(|(i, _)| i)
            .unwrap();
        assert!(recreate < second_acquire);
        assert_eq!(driver.skipped_frames(), 1);
        assert_eq!(driver.presented_frames(), 1);
    }

    #[test]
    fn suboptimal_acquire_still_presents_then_recreates() {
        let mut backend = ScriptedBackend::default();
        backend.acquires.push_back(Acquired::Image {
            index: 1,
            suboptimal: true,
        });
        let mut window = ScriptedWindow::steady(RenderSize::new(320, 200));
        let mut driver = FrameDriver::new();

        let status = driver.draw(&mut backend, &mut window, &input()).unwrap();
        assert_eq!(status, FrameStatus::Presented);
        assert_eq!(backend.calls.last(), Some(&Call::Present(1)));
        assert!(driver.is_stale());
    }

    #[test]
    fn out_of_date_present_marks_stale_after_presenting() {
        let mut backend = ScriptedBackend::default();
        backend.presents.push_back(Presented::OutOfDate);
        let mut window = ScriptedWindow::steady(RenderSize::new(320, 200));
        let mut driver = FrameDriver::new();

        driver.draw(&mut backend, &mut window, &input()).unwrap();
        assert!(driver.is_stale());
        assert!(!backend.calls.iter().any(|c| matches!(c, Call::Recreate(_))));
    }

    #[test]
    fn minimized_window_suspends_recreation_until_restored() {
        let mut backend = ScriptedBackend::default();
        let mut window = ScriptedWindow::scripted(
            RenderSize::new(0, 0),
            vec![
                RenderSize::new(0, 0),
                RenderSize::new(0, 0),
                RenderSize::new(1024, 768),
            ],
        );
        let mut driver = FrameDriver::new();
        driver.mark_stale();

        driver.draw(&mut backend, &mut window, &input()).unwrap();

        assert_eq!(window.waits, 3);
        assert_eq!(backend.calls[0], Call::Recreate(RenderSize::new(1024, 768)));
        assert!(!driver.is_stale());
    }

    #[test]
    fn wait_returns_immediately_for_visible_window() {
        let mut window = ScriptedWindow::steady(RenderSize::new(1, 1));
        assert_eq!(wait_for_framebuffer(&mut window), Some(RenderSize::new(1, 1)));
        assert_eq!(window.waits, 0);
    }

    #[test]
    fn close_while_minimized_never_recreates() {
        let mut backend = ScriptedBackend::default();
        let mut window = ScriptedWindow::scripted(RenderSize::new(0, 0), Vec::new());
        window.close_after = Some(2);
        let mut driver = FrameDriver::new();
        driver.mark_stale();

        let status = driver.draw(&mut backend, &mut window, &input()).unwrap();

        assert_eq!(status, FrameStatus::Closed);
        assert_eq!(window.waits, 2);
        assert!(backend.calls.is_empty());
        assert!(driver.is_stale());
    }

    #[test]
    fn closing_window_short_circuits_draw() {
        let mut backend = ScriptedBackend::default();
        let mut window = ScriptedWindow::steady(RenderSize::new(800, 600));
        window.closing = true;
        let mut driver = FrameDriver::new();

        let status = driver.draw(&mut backend, &mut window, &input()).unwrap();
        assert_eq!(status, FrameStatus::Closed);
        assert!(backend.calls.is_empty());
    }

    #[test]
    fn deferred_recreation_skips_and_stays_stale() {
        let mut backend = ScriptedBackend::default();
        backend.recreates.push_back(false);
        let mut window = ScriptedWindow::steady(RenderSize::new(800, 600));
        let mut driver = FrameDriver::new();
        driver.mark_stale();

        let status = driver.draw(&mut backend, &mut window, &input()).unwrap();
        assert_eq!(status, FrameStatus::Skipped);
        assert_eq!(backend.calls, vec![Call::Recreate(RenderSize::new(800, 600))]);
        assert!(driver.is_stale());

        let status = driver.draw(&mut backend, &mut window, &input()).unwrap();
        assert_eq!(status, FrameStatus::Presented);
        assert!(!driver.is_stale());
    }

    #[test]
    fn pending_resize_is_applied_before_the_frame_is_built() {
        let mut backend = ScriptedBackend::default();
        let mut window = ScriptedWindow::steady(RenderSize::new(1280, 720));
        let mut driver = FrameDriver::new();
        driver.mark_stale();

        assert!(driver.recreate_if_stale(&mut backend, &mut window).unwrap());
        // The caller derives its projection from this extent.
        assert_eq!(backend.extent, Some(RenderSize::new(1280, 720)));

        driver.draw(&mut backend, &mut window, &input()).unwrap();
        assert_eq!(
            backend.calls,
            vec![
                Call::Recreate(RenderSize::new(1280, 720)),
                Call::Begin,
                Call::Acquire,
                Call::Submit(0),
                Call::Present(0),
            ]
        );
    }

    #[test]
    fn one_zero_axis_counts_as_minimized() {
        assert!(RenderSize::new(0, 10).is_zero());
        assert!(RenderSize::new(10, 0).is_zero());
        assert!(!RenderSize::new(10, 10).is_zero());
    }
}
