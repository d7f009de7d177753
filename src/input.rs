use std::collections::HashSet;

use winit::event::{ElementState, VirtualKeyCode};

use crate::camera::CameraMovement;

const MOVEMENT_KEYS: [(VirtualKeyCode, CameraMovement); 6] = [
    (VirtualKeyCode::W, CameraMovement::Forward),
    (VirtualKeyCode::S, CameraMovement::Backward),
    (VirtualKeyCode::A, CameraMovement::Left),
    (VirtualKeyCode::D, CameraMovement::Right),
    (VirtualKeyCode::Space, CameraMovement::Up),
    (VirtualKeyCode::LControl, CameraMovement::Down),
];

/// One-shot commands triggered by a key press.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Action {
    ToggleCursorLock,
    TogglePolygonMode,
    AddModel,
    RemoveModel,
    Quit,
}

fn action_for(key: VirtualKeyCode) -> Option<Action> {
    match key {
        VirtualKeyCode::Escape => Some(Action::ToggleCursorLock),
        VirtualKeyCode::Key1 => Some(Action::TogglePolygonMode),
        VirtualKeyCode::N => Some(Action::AddModel),
        VirtualKeyCode::Delete => Some(Action::RemoveModel),
        VirtualKeyCode::Q => Some(Action::Quit),
        _ => None,
    }
}

/// Keyboard and mouse state collected between frames.
#[derive(Clone, Debug, Default)]
pub struct InputState {
    held: HashSet<VirtualKeyCode>,
    mouse_delta: (f64, f64),
    actions: Vec<Action>,
}

impl InputState {
    /// Actions fire on the press edge only; key repeat is ignored.
    pub fn key(&mut self, key: VirtualKeyCode, state: ElementState) {
        match state {
            ElementState::Pressed => {
                if self.held.insert(key) {
                    if let Some(action) = action_for(key) {
                        self.actions.push(action);
                    }
                }
            }
            ElementState::Released => {
                self.held.remove(&key);
            }
        }
    }

    pub fn is_held(&self, key: VirtualKeyCode) -> bool {
        self.held.contains(&key)
    }

    pub fn mouse_moved(&mut self, dx: f64, dy: f64) {
        self.mouse_delta.0 += dx;
        self.mouse_delta.1 += dy;
    }

    /// Mouse motion since the last call, in screen units (y grows downward).
    pub fn take_mouse_delta(&mut self) -> (f32, f32) {
        let (dx, dy) = std::mem::take(&mut self.mouse_delta);
        (dx as f32, dy as f32)
    }

    pub fn take_actions(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.actions)
    }

    pub fn movements(&self) -> impl Iterator<Item = CameraMovement> + '_ {
        MOVEMENT_KEYS
            .iter()
            .filter(|(key, _)| self.is_held(*key))
            .map(|(_, movement)| *movement)
    }

    /// Forgets held keys, e.g. when the window loses focus.
    pub fn release_all(&mut self) {
        self.held.clear();
        self.mouse_delta = (0.0, 0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actions_fire_once_per_press() {
        let mut input = InputState::default();
        input.key(VirtualKeyCode::N, ElementState::Pressed);
        input.key(VirtualKeyCode::N, ElementState::Pressed);
        input.key(VirtualKeyCode::N, ElementState::Released);
        input.key(VirtualKeyCode::N, ElementState::Pressed);
        input.key(VirtualKeyCode::Key1, ElementState::Pressed);
        assert_eq!(
            input.take_actions(),
            vec![Action::AddModel, Action::AddModel, Action::TogglePolygonMode]
        );
        assert!(input.take_actions().is_empty());
    }

    #[test]
    fn q_requests_quit() {
        let mut input = InputState::default();
        input.key(VirtualKeyCode::Q, ElementState::Pressed);
        assert_eq!(input.take_actions(), vec![Action::Quit]);
    }

    #[test]
    fn held_keys_map_to_movement() {
        let mut input = InputState::default();
        input.key(VirtualKeyCode::W, ElementState::Pressed);
        input.key(VirtualKeyCode::Space, ElementState::Pressed);
        input.key(VirtualKeyCode::E, ElementState::Pressed);
        assert!(input.is_held(VirtualKeyCode::E));
        let moves: Vec<_> = input.movements().collect();
        assert_eq!(moves, vec![CameraMovement::Forward, CameraMovement::Up]);

        input.key(VirtualKeyCode::W, ElementState::Released);
        let moves: Vec<_> = input.movements().collect();
        assert_eq!(moves, vec![CameraMovement::Up]);
    }

    #[test]
    fn mouse_motion_accumulates_until_taken() {
        let mut input = InputState::default();
        input.mouse_moved(3.0, -1.0);
        input.mouse_moved(2.0, 4.0);
        assert_eq!(input.take_mouse_delta(), (5.0, 3.0));
        assert_eq!(input.take_mouse_delta(), (0.0, 0.0));
    }

    #[test]
    fn releasing_all_stops_movement() {
        let mut input = InputState::default();
        input.key(VirtualKeyCode::D, ElementState::Pressed);
        input.mouse_moved(1.0, 1.0);
        input.release_all();
        assert_eq!(input.movements().count(), 0);
        assert_eq!(input.take_mouse_delta(), (0.0, 0.0));
    }
}
