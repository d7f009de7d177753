use nalgebra_glm as glm;
use vulkanalia::prelude::v1_0::*;

use crate::config::{
    CAMERA_SENSITIVITY, CAMERA_SPEED, FAR_PLANE, FIELD_OF_VIEW_DEGREES, NEAR_PLANE,
};

const PITCH_LIMIT: f32 = 89.0;

/// Per-frame shader data. The model matrix travels as a push constant.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct UniformBufferObject {
    pub view: glm::Mat4,
    pub proj: glm::Mat4,
}

impl UniformBufferObject {
    pub fn new(view: glm::Mat4, extent: vk::Extent2D) -> Self {
        Self { view, proj: projection(extent) }
    }
}

/// Perspective projection for `extent` with Y flipped for Vulkan clip space.
pub fn projection(extent: vk::Extent2D) -> glm::Mat4 {
    let aspect = extent.width as f32 / extent.height.max(1) as f32;
    let mut proj = glm::perspective_rh_zo(
        aspect,
        glm::radians(&glm::vec1(FIELD_OF_VIEW_DEGREES))[0],
        NEAR_PLANE,
        FAR_PLANE,
    );
    proj[(1, 1)] *= -1.0;
    proj
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CameraMovement {
    Forward,
    Backward,
    Left,
    Right,
    Up,
    Down,
}

/// First-person camera driven by yaw/pitch mouse look and directional movement.
#[derive(Copy, Clone, Debug)]
pub struct Camera {
    pub position: glm::Vec3,
    front: glm::Vec3,
    up: glm::Vec3,
    right: glm::Vec3,
    yaw: f32,
    pitch: f32,
    speed: f32,
    sensitivity: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self::new(glm::vec3(0.0, 0.0, 3.0), -90.0, 0.0)
    }
}

impl Camera {
    pub fn new(position: glm::Vec3, yaw: f32, pitch: f32) -> Self {
        let mut camera = Self {
            position,
            front: glm::vec3(0.0, 0.0, -1.0),
            up: glm::vec3(0.0, 1.0, 0.0),
            right: glm::vec3(1.0, 0.0, 0.0),
            yaw,
            pitch: pitch.clamp(-PITCH_LIMIT, PITCH_LIMIT),
            speed: CAMERA_SPEED,
            sensitivity: CAMERA_SENSITIVITY,
        };
        camera.update_vectors();
        camera
    }

    pub fn view_matrix(&self) -> glm::Mat4 {
        glm::look_at(&self.position, &(self.position + self.front), &self.up)
    }

    pub fn front(&self) -> glm::Vec3 {
        self.front
    }

    pub fn yaw(&self) -> f32 {
        self.yaw
    }

    pub fn pitch(&self) -> f32 {
        self.pitch
    }

    pub fn process_keyboard(&mut self, direction: CameraMovement, delta_time: f32) {
        let velocity = self.speed * delta_time;
        match direction {
            CameraMovement::Forward => self.position += self.front * velocity,
            CameraMovement::Backward => self.position -= self.front * velocity,
            CameraMovement::Left => self.position -= self.right * velocity,
            CameraMovement::Right => self.position += self.right * velocity,
            CameraMovement::Up => self.position += self.up * velocity,
            CameraMovement::Down => self.position -= self.up * velocity,
        }
    }

    /// Offsets are in screen units; positive `y_offset` looks up.
    pub fn process_mouse_movement(&mut self, x_offset: f32, y_offset: f32) {
        self.yaw += x_offset * self.sensitivity;
        self.pitch += y_offset * self.sensitivity;

        if self.pitch > PITCH_LIMIT {
            self.pitch = PITCH_LIMIT;
        } else if self.pitch < -PITCH_LIMIT {
            self.pitch = -PITCH_LIMIT;
        }
        if self.yaw > 180.0 {
            self.yaw -= 360.0;
        } else if self.yaw < -180.0 {
            self.yaw += 360.0;
        }
        self.update_vectors();
    }

    fn update_vectors(&mut self) {
        let yaw = glm::radians(&glm::vec1(self.yaw))[0];
        let pitch = glm::radians(&glm::vec1(self.pitch))[0];
        let front = glm::vec3(yaw.cos() * pitch.cos(), pitch.sin(), yaw.sin() * pitch.cos());
        self.front = glm::normalize(&front);

        let world_up = glm::vec3(0.0, 1.0, 0.0);
        self.right = glm::normalize(&glm::cross(&self.front, &world_up));
        self.up = glm::normalize(&glm::cross(&self.right, &self.front));
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn default_camera_looks_down_negative_z() {
        let camera = Camera::default();
        assert_relative_eq!(camera.front(), glm::vec3(0.0, 0.0, -1.0), epsilon = 1e-6);
        let eye = camera.view_matrix() * glm::vec4(0.0, 0.0, 3.0, 1.0);
        assert_relative_eq!(eye, glm::vec4(0.0, 0.0, 0.0, 1.0), epsilon = 1e-6);
    }

    #[test]
    fn pitch_is_clamped() {
        let mut camera = Camera::default();
        camera.process_mouse_movement(0.0, 10_000.0);
        assert_relative_eq!(camera.pitch(), 89.0);
        camera.process_mouse_movement(0.0, -20_000.0);
        assert_relative_eq!(camera.pitch(), -89.0);
    }

    #[test]
    fn yaw_wraps_into_half_turn_range() {
        let mut camera = Camera::default();
        camera.process_mouse_movement(-1000.0, 0.0);
        assert!(camera.yaw() >= -180.0 && camera.yaw() <= 180.0);
        assert_relative_eq!(camera.yaw(), 170.0, epsilon = 1e-4);
    }

    #[test]
    fn movement_scales_with_time() {
        let mut camera = Camera::default();
        camera.process_keyboard(CameraMovement::Forward, 0.5);
        assert_relative_eq!(camera.position, glm::vec3(0.0, 0.0, 0.5), epsilon = 1e-5);
        camera.process_keyboard(CameraMovement::Right, 0.2);
        assert_relative_eq!(camera.position, glm::vec3(1.0, 0.0, 0.5), epsilon = 1e-5);
        camera.process_keyboard(CameraMovement::Up, 0.1);
        assert_relative_eq!(camera.position.y, 0.5, epsilon = 1e-5);
    }

    #[test]
    fn projection_flips_y() {
        let proj = projection(vk::Extent2D { width: 1280, height: 720 });
        assert!(proj[(1, 1)] < 0.0);
        // A degenerate height does not divide by zero.
        let proj = projection(vk::Extent2D { width: 1280, height: 0 });
        assert!(proj[(0, 0)].is_finite());
    }
}
