// SPDX-License-Identifier: CEPL-1.0
use crate::config::CameraCfg;
use chopper_platform::winit::keyboard::KeyCode;
use chopper_platform::InputState;
use chopper_render::RenderSize;
use glam::{Mat4, Vec3};

const PITCH_LIMIT: f32 = 89.0;

/// Free-fly camera. Steering (WASD, E/Q, mouse look) is active only while the
/// left button is held, so clicks elsewhere never move the view.
#[derive(Debug, Clone)]
pub struct FlyCamera {
    pub pos: Vec3,
    up: Vec3,
    yaw_deg: f32,
    pitch_deg: f32,
    fov_deg: f32,
    znear: f32,
    zfar: f32,
    speed: f32,
    sensitivity: f32,
}

impl FlyCamera {
    pub fn new(cfg: &CameraCfg) -> Self {
        Self {
            pos: Vec3::new(0.0, 1.0, 3.0),
            up: Vec3::Y,
            // -Z
            yaw_deg: -90.0,
            pitch_deg: 0.0,
            fov_deg: cfg.fov_deg,
            znear: cfg.znear,
            zfar: cfg.zfar,
            speed: cfg.speed.max(0.0),
            sensitivity: cfg.sensitivity.max(0.0),
        }
    }

    pub fn direction(&self) -> Vec3 {
        let (yaw, pitch) = (self.yaw_deg.to_radians(), self.pitch_deg.to_radians());
        Vec3::new(yaw.cos() * pitch.cos(), pitch.sin(), yaw.sin() * pitch.cos()).normalize()
    }

    pub fn pitch_deg(&self) -> f32 {
        self.pitch_deg
    }

    /// Applies `dx`/`dy` in pixels; screen-down is negative pitch.
    pub fn look(&mut self, dx: f32, dy: f32) {
        self.yaw_deg += dx * self.sensitivity;
        self.pitch_deg = (self.pitch_deg - dy * self.sensitivity).clamp(-PITCH_LIMIT, PITCH_LIMIT);
    }

    pub fn update(&mut self, input: &mut InputState, dt: f32) {
        let (dx, dy) = input.take_mouse_delta();
        if !input.is_dragging() {
            return;
        }

        let dir = self.direction();
        let right = dir.cross(self.up).normalize();
        let step = self.speed * dt;
        let axes = [
            (KeyCode::KeyW, dir),
            (KeyCode::KeyS, -dir),
            (KeyCode::KeyD, right),
            (KeyCode::KeyA, -right),
            (KeyCode::KeyE, self.up),
            (KeyCode::KeyQ, -self.up),
        ];
        for (key, axis) in axes {
            if input.is_held(key) {
                self.pos += axis * step;
            }
        }

        self.look(dx, dy);
    }

    pub fn view(&self) -> Mat4 {
        Mat4::look_at_rh(self.pos, self.pos + self.direction(), self.up)
    }

    /// Right-handed, depth 0..1, Y flipped for Vulkan clip space.
    pub fn projection(&self, size: RenderSize) -> Mat4 {
        let mut proj = Mat4::perspective_rh(
            self.fov_deg.to_radians(),
            size.aspect(),
            self.znear,
            self.zfar,
        );
        proj.y_axis.y *= -1.0;
        proj
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec4;

    fn camera() -> FlyCamera {
        FlyCamera::new(&CameraCfg::default())
    }

    #[test]
    fn starts_looking_down_negative_z() {
        let dir = camera().direction();
        assert!((dir - Vec3::NEG_Z).length() < 1e-5);
    }

    #[test]
    fn pitch_is_clamped() {
        let mut cam = camera();
        cam.look(0.0, -10_000.0);
        assert_eq!(cam.pitch_deg(), 89.0);
        cam.look(0.0, 10_000.0);
        assert_eq!(cam.pitch_deg(), -89.0);
    }

    #[test]
    fn keys_move_only_while_dragging() {
        let mut cam = camera();
        let mut input = InputState::new();
        input.press(KeyCode::KeyW);

        cam.update(&mut input, 1.0);
        assert_eq!(cam.pos, Vec3::new(0.0, 1.0, 3.0));

        input.set_dragging(true);
        cam.update(&mut input, 1.0);
        assert!((cam.pos - Vec3::new(0.0, 1.0, 0.5)).length() < 1e-5);
    }

    #[test]
    fn projection_flips_y_for_vulkan() {
        let cam = camera();
        let proj = cam.projection(RenderSize::new(1920, 1080));
        let up = proj * Vec4::new(0.0, 1.0, -1.0, 1.0);
        assert!(up.y / up.w < 0.0);
    }

    #[test]
    fn projection_maps_near_plane_to_zero_depth() {
        let cam = camera();
        let proj = cam.projection(RenderSize::new(800, 600));
        let p = proj * Vec4::new(0.0, 0.0, -0.1, 1.0);
        assert!((p.z / p.w).abs() < 1e-4);
    }
}
