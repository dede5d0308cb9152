// SPDX-License-Identifier: CEPL-1.0
use glam::{Mat4, Quat, Vec3};
use std::f32::consts::TAU;

/// A few copies of the mesh circling the origin, each spinning on its own axis.
#[derive(Debug, Clone)]
pub struct Orbiters {
    count: usize,
    radius: f32,
    /// Radians per second.
    angular_speed: f32,
}

impl Default for Orbiters {
    fn default() -> Self {
        Self {
            count: 5,
            radius: 2.0,
            angular_speed: 0.5,
        }
    }
}

impl Orbiters {
    /// Model matrices at time `t` seconds. The first object sits at the
    /// centre; the rest share the ring.
    pub fn models(&self, t: f32) -> Vec<Mat4> {
        let ring = self.count.saturating_sub(1).max(1) as f32;
        (0..self.count)
            .map(|i| {
                let spin = Quat::from_rotation_y(t * (1.0 + i as f32 * 0.25));
                if i == 0 {
                    return Mat4::from_quat(spin);
                }
                let phase = t * self.angular_speed + (i - 1) as f32 / ring * TAU;
                let pos = Vec3::new(phase.cos() * self.radius, 0.0, phase.sin() * self.radius);
                Mat4::from_scale_rotation_translation(Vec3::splat(0.5), spin, pos)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_matrix_per_object() {
        assert_eq!(Orbiters::default().models(0.0).len(), 5);
    }

    #[test]
    fn ring_objects_stay_on_radius() {
        let orbiters = Orbiters::default();
        for t in [0.0, 1.3, 17.0] {
            for m in &orbiters.models(t)[1..] {
                let p = m.w_axis.truncate();
                assert!((p.length() - 2.0).abs() < 1e-4);
                assert_eq!(p.y, 0.0);
            }
        }
    }

    #[test]
    fn centre_object_does_not_move() {
        let m = Orbiters::default().models(3.0)[0];
        assert_eq!(m.w_axis.truncate(), Vec3::ZERO);
    }
}
