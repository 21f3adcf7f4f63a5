use winit::event::{ElementState, MouseButton, MouseScrollDelta, WindowEvent};

use crate::uniforms::MouseUniform;

const ZOOM_STEP: f32 = 1.1;

/// Folds winit pointer events into [`MouseUniform`].
///
/// Positions are in window pixels. `start` is where the left button went
/// down and `delta` how far the pointer has moved since.
#[derive(Debug, Default)]
pub struct MouseTracker {
    pub is_inside_window: bool,
}

impl MouseTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when `event` changed the uniform.
    pub fn handle_mouse_input(&mut self, uniform: &mut MouseUniform, event: &WindowEvent) -> bool {
        match event {
            WindowEvent::CursorMoved { position, .. } => {
                self.move_to(uniform, [position.x as i32, position.y as i32]);
                true
            }
            WindowEvent::MouseInput {
                state,
                button: MouseButton::Left,
                ..
            } => {
                self.press(uniform, *state == ElementState::Pressed);
                true
            }
            WindowEvent::MouseWheel { delta, .. } => {
                let lines = match delta {
                    MouseScrollDelta::LineDelta(_, y) => *y,
                    MouseScrollDelta::PixelDelta(pos) => pos.y as f32 / 100.0,
                };
                self.scroll(uniform, lines);
                true
            }
            WindowEvent::CursorLeft { .. } => {
                self.is_inside_window = false;
                false
            }
            WindowEvent::CursorEntered { .. } => {
                self.is_inside_window = true;
                false
            }
            _ => false,
        }
    }

    fn move_to(&mut self, uniform: &mut MouseUniform, pos: [i32; 2]) {
        uniform.pos = pos;
        if uniform.click == 1 {
            uniform.delta = [pos[0] - uniform.start[0], pos[1] - uniform.start[1]];
        }
    }

    fn press(&mut self, uniform: &mut MouseUniform, pressed: bool) {
        if pressed {
            uniform.click = 1;
            uniform.start = uniform.pos;
            uniform.delta = [0, 0];
        } else {
            uniform.click = 0;
        }
    }

    fn scroll(&mut self, uniform: &mut MouseUniform, lines: f32) {
        uniform.zoom = (uniform.zoom * ZOOM_STEP.powf(lines)).max(f32::MIN_POSITIVE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drag_tracks_start_and_delta() {
        let mut tracker = MouseTracker::new();
        let mut mouse = MouseUniform::default();
        tracker.move_to(&mut mouse, [10, 20]);
        assert_eq!(mouse.delta, [0, 0]);

        tracker.press(&mut mouse, true);
        tracker.move_to(&mut mouse, [15, 12]);
        assert_eq!(mouse.click, 1);
        assert_eq!(mouse.start, [10, 20]);
        assert_eq!(mouse.delta, [5, -8]);

        tracker.press(&mut mouse, false);
        tracker.move_to(&mut mouse, [100, 100]);
        assert_eq!(mouse.click, 0);
        assert_eq!(mouse.delta, [5, -8]);
        assert_eq!(mouse.pos, [100, 100]);
    }

    #[test]
    fn wheel_scales_zoom() {
        let mut tracker = MouseTracker::new();
        let mut mouse = MouseUniform::default();
        tracker.scroll(&mut mouse, 1.0);
        assert!((mouse.zoom - 1.1).abs() < 1e-6);
        tracker.scroll(&mut mouse, -1.0);
        assert!((mouse.zoom - 1.0).abs() < 1e-6);
    }
}
