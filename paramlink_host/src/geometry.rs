use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// User-selectable editor size for the resizable plugin family. Serializable
/// so the surrounding application can persist the choice with its settings.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EditorSize {
    Small,
    Medium,
    Large,
}

impl EditorSize {
    pub fn dimensions(self) -> (u32, u32) {
        match self {
            EditorSize::Small => (480, 320),
            EditorSize::Medium => (720, 480),
            EditorSize::Large => (1024, 720),
        }
    }
}

/// Plugin family whose editor size follows the persisted user preference.
/// Every other family resolves to a fixed preset.
const RESIZABLE_FAMILY: &str = "rack";

/// Per-family persisted size choices, injected by the surrounding app.
#[derive(Default, Debug, Clone)]
pub struct SizePrefs {
    by_family: HashMap<String, EditorSize>,
}

impl SizePrefs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, family: &str, size: EditorSize) {
        self.by_family.insert(family.to_string(), size);
    }

    pub fn get(&self, family: &str) -> Option<EditorSize> {
        self.by_family.get(family).copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScreenBounds {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowRect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl WindowRect {
    /// Center the given dimensions on the available screen space. Origins
    /// clamp at zero when the editor is larger than the screen.
    pub fn centered(dims: (u32, u32), screen: ScreenBounds) -> Self {
        let (width, height) = dims;
        let x = (screen.width.saturating_sub(width) / 2) as i32;
        let y = (screen.height.saturating_sub(height) / 2) as i32;
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

/// Family prefix of a plugin id, e.g. `"rack.modular-8"` -> `"rack"`.
fn family(plugin_id: &str) -> &str {
    plugin_id.split('.').next().unwrap_or(plugin_id)
}

/// Deterministic geometry profile for a plugin identity. The `rack` family
/// honors the persisted user preference; everything else is a fixed preset.
pub fn resolve(plugin_id: &str, prefs: &SizePrefs) -> (u32, u32) {
    let family = family(plugin_id);
    let size = if family == RESIZABLE_FAMILY {
        prefs.get(family).unwrap_or(EditorSize::Medium)
    } else {
        match family {
            "analyzer" | "convolver" => EditorSize::Large,
            "gate" | "limiter" | "util" => EditorSize::Small,
            _ => EditorSize::Medium,
        }
    };
    size.dimensions()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_presets_ignore_prefs() {
        let mut prefs = SizePrefs::new();
        prefs.set("analyzer", EditorSize::Small);
        assert_eq!(
            resolve("analyzer.spectrum", &prefs),
            EditorSize::Large.dimensions()
        );
        assert_eq!(resolve("gate.noise", &prefs), EditorSize::Small.dimensions());
        assert_eq!(resolve("eq.para-8", &prefs), EditorSize::Medium.dimensions());
    }

    #[test]
    fn rack_family_honors_persisted_choice() {
        let mut prefs = SizePrefs::new();
        assert_eq!(
            resolve("rack.modular-8", &prefs),
            EditorSize::Medium.dimensions()
        );
        prefs.set("rack", EditorSize::Large);
        assert_eq!(
            resolve("rack.modular-8", &prefs),
            EditorSize::Large.dimensions()
        );
    }

    #[test]
    fn centering_clamps_at_origin() {
        let screen = ScreenBounds {
            width: 1920,
            height: 1080,
        };
        let rect = WindowRect::centered((720, 480), screen);
        assert_eq!((rect.x, rect.y), (600, 300));

        let tiny = ScreenBounds {
            width: 640,
            height: 400,
        };
        let rect = WindowRect::centered((1024, 720), tiny);
        assert_eq!((rect.x, rect.y), (0, 0));
    }
}
