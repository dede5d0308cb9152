// SPDX-License-Identifier: CEPL-1.0
//! Window/input plumbing. `winit` is re-exported so downstream crates use the
//! same version without naming it themselves.
mod input;
mod resize;

pub use input::InputState;
pub use resize::ResizeQueue;
pub use winit;
