pub trait UniformProvider {
    fn as_bytes(&self) -> &[u8];
}

/// Most custom float uniforms a program can declare.
pub const MAX_CUSTOM_FLOATS: usize = 32;

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct TimeUniform {
    pub frame: u32,
    pub elapsed: f32,
    pub delta: f32,
    pub _padding: u32,
}

impl UniformProvider for TimeUniform {
    fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}

/// Pointer state in screen pixels.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct MouseUniform {
    pub pos: [i32; 2],
    pub zoom: f32,
    pub click: i32,
    pub start: [i32; 2],
    pub delta: [i32; 2],
}

impl Default for MouseUniform {
    fn default() -> Self {
        Self {
            pos: [0, 0],
            zoom: 1.0,
            click: 0,
            start: [0, 0],
            delta: [0, 0],
        }
    }
}

impl UniformProvider for MouseUniform {
    fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}

/// 256 key states, one bit per keycode.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct KeyboardUniform {
    pub keys: [u32; 8],
}

impl KeyboardUniform {
    pub fn set(&mut self, keycode: u8, down: bool) {
        let (word, bit) = (keycode as usize / 32, keycode as u32 % 32);
        if down {
            self.keys[word] |= 1 << bit;
        } else {
            self.keys[word] &= !(1 << bit);
        }
    }

    pub fn is_down(&self, keycode: u8) -> bool {
        self.keys[keycode as usize / 32] & (1 << (keycode as u32 % 32)) != 0
    }

    pub fn clear(&mut self) {
        self.keys = [0; 8];
    }
}

impl UniformProvider for KeyboardUniform {
    fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}

/// Named float parameters exposed to the program as `custom.<name>`.
#[derive(Clone, Debug, PartialEq)]
pub struct CustomUniforms {
    names: Vec<String>,
    values: [f32; MAX_CUSTOM_FLOATS],
}

impl Default for CustomUniforms {
    fn default() -> Self {
        Self {
            names: Vec::new(),
            values: [0.0; MAX_CUSTOM_FLOATS],
        }
    }
}

impl CustomUniforms {
    /// Replaces the declared set; extra names beyond the limit are dropped.
    pub fn define(&mut self, names: &[String], values: &[f32]) {
        if names.len() > MAX_CUSTOM_FLOATS {
            log::warn!(
                "{} custom uniforms requested, keeping the first {}",
                names.len(),
                MAX_CUSTOM_FLOATS
            );
        }
        self.names = names.iter().take(MAX_CUSTOM_FLOATS).cloned().collect();
        self.values = [0.0; MAX_CUSTOM_FLOATS];
        for (slot, value) in self.values.iter_mut().zip(values) {
            *slot = *value;
        }
    }

    /// Returns false when `name` is not declared.
    pub fn set(&mut self, name: &str, value: f32) -> bool {
        match self.names.iter().position(|n| n == name) {
            Some(index) => {
                self.values[index] = value;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, name: &str) -> Option<f32> {
        let index = self.names.iter().position(|n| n == name)?;
        Some(self.values[index])
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// WGSL struct matching the buffer layout.
    pub fn declaration(&self) -> String {
        if self.names.is_empty() {
            return "struct Custom {\n    _dummy: f32,\n}\n".to_string();
        }
        let fields: String = self
            .names
            .iter()
            .map(|name| format!("    {}: f32,\n", name))
            .collect();
        format!("struct Custom {{\n{}}}\n", fields)
    }
}

impl UniformProvider for CustomUniforms {
    fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.values)
    }
}

/// Per-dispatch slot written into the dynamically offset buffer.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct DispatchUniform {
    pub id: u32,
    pub _padding: [u32; 3],
}

impl UniformProvider for DispatchUniform {
    fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_layouts_match_wgsl() {
        assert_eq!(std::mem::size_of::<TimeUniform>(), 16);
        assert_eq!(std::mem::size_of::<MouseUniform>(), 32);
        assert_eq!(std::mem::size_of::<KeyboardUniform>(), 32);
        assert_eq!(CustomUniforms::default().as_bytes().len(), 128);
    }

    #[test]
    fn keyboard_bits() {
        let mut keys = KeyboardUniform::default();
        keys.set(0, true);
        keys.set(65, true);
        keys.set(255, true);
        assert!(keys.is_down(65) && keys.is_down(255) && keys.is_down(0));
        assert_eq!(keys.keys[2], 1 << 1);
        assert_eq!(keys.keys[7], 1 << 31);
        keys.set(65, false);
        assert!(!keys.is_down(65));
    }

    #[test]
    fn custom_values_follow_names() {
        let mut custom = CustomUniforms::default();
        custom.define(&["speed".into(), "scale".into()], &[2.0, 0.5]);
        assert!(custom.set("scale", 4.0));
        assert!(!custom.set("missing", 1.0));
        assert_eq!(custom.get("speed"), Some(2.0));
        assert_eq!(&custom.as_bytes()[4..8], &4.0f32.to_ne_bytes());
        assert_eq!(
            custom.declaration(),
            "struct Custom {\n    speed: f32,\n    scale: f32,\n}\n"
        );
    }
}
