use winit::event::{ElementState, KeyEvent};
use winit::keyboard::{KeyCode, PhysicalKey};
use winit::window::Window;

use crate::uniforms::KeyboardUniform;

/// Browser-style keycode for `key`, the numbering `keyDown` expects.
pub fn keycode(key: KeyCode) -> Option<u8> {
    use KeyCode::*;
    let letters = [
        KeyA, KeyB, KeyC, KeyD, KeyE, KeyF, KeyG, KeyH, KeyI, KeyJ, KeyK, KeyL, KeyM, KeyN, KeyO,
        KeyP, KeyQ, KeyR, KeyS, KeyT, KeyU, KeyV, KeyW, KeyX, KeyY, KeyZ,
    ];
    let digits = [
        Digit0, Digit1, Digit2, Digit3, Digit4, Digit5, Digit6, Digit7, Digit8, Digit9,
    ];
    let function_keys = [F1, F2, F3, F4, F5, F6, F7, F8, F9, F10, F11, F12];
    if let Some(i) = letters.iter().position(|k| *k == key) {
        return Some(65 + i as u8);
    }
    if let Some(i) = digits.iter().position(|k| *k == key) {
        return Some(48 + i as u8);
    }
    if let Some(i) = function_keys.iter().position(|k| *k == key) {
        return Some(112 + i as u8);
    }
    Some(match key {
        Backspace => 8,
        Tab => 9,
        Enter | NumpadEnter => 13,
        ShiftLeft | ShiftRight => 16,
        ControlLeft | ControlRight => 17,
        AltLeft | AltRight => 18,
        Escape => 27,
        Space => 32,
        PageUp => 33,
        PageDown => 34,
        End => 35,
        Home => 36,
        ArrowLeft => 37,
        ArrowUp => 38,
        ArrowRight => 39,
        ArrowDown => 40,
        Delete => 46,
        _ => return None,
    })
}

pub struct KeyInputHandler {
    is_fullscreen: bool,
}

impl Default for KeyInputHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyInputHandler {
    pub fn new() -> Self {
        Self {
            is_fullscreen: false,
        }
    }

    /// Mirrors the key into `keys`; F11 toggles fullscreen instead.
    pub fn handle_keyboard_input(
        &mut self,
        window: &Window,
        keys: &mut KeyboardUniform,
        event: &KeyEvent,
    ) -> bool {
        let PhysicalKey::Code(code) = event.physical_key else {
            return false;
        };
        let pressed = event.state == ElementState::Pressed;
        if code == KeyCode::F11 {
            if pressed && !event.repeat {
                self.toggle_fullscreen(window);
            }
            return true;
        }
        match keycode(code) {
            Some(keycode) => {
                keys.set(keycode, pressed);
                true
            }
            None => false,
        }
    }

    fn toggle_fullscreen(&mut self, window: &Window) {
        if !self.is_fullscreen {
            window.set_fullscreen(Some(winit::window::Fullscreen::Borderless(None)));
        } else {
            window.set_fullscreen(None);
        }
        self.is_fullscreen = !self.is_fullscreen;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keycodes_follow_browser_numbering() {
        assert_eq!(keycode(KeyCode::KeyA), Some(65));
        assert_eq!(keycode(KeyCode::KeyZ), Some(90));
        assert_eq!(keycode(KeyCode::Digit7), Some(55));
        assert_eq!(keycode(KeyCode::ArrowUp), Some(38));
        assert_eq!(keycode(KeyCode::Space), Some(32));
        assert_eq!(keycode(KeyCode::F2), Some(113));
        assert_eq!(keycode(KeyCode::NumLock), None);
    }
}
