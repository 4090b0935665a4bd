//! Pointer device access used to confine the cursor while locked.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Screen rectangle the cursor is held inside while the gate is locked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct Region {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Nearest point inside the region.
    pub fn clamp(&self, x: i32, y: i32) -> (i32, i32) {
        let right = self.x.saturating_add(self.width.saturating_sub(1) as i32);
        let bottom = self.y.saturating_add(self.height.saturating_sub(1) as i32);
        (x.clamp(self.x, right.max(self.x)), y.clamp(self.y, bottom.max(self.y)))
    }
}

impl Default for Region {
    fn default() -> Self {
        Self {
            x: 0,
            y: 0,
            width: 800,
            height: 600,
        }
    }
}

pub trait PointerDevice: Send + Sync {
    /// Current cursor position, if it can be read.
    fn position(&self) -> Option<(i32, i32)>;

    fn move_to(&self, x: i32, y: i32);
}

/// Pointer device for platforms without cursor control.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPointer;

impl PointerDevice for NoPointer {
    fn position(&self) -> Option<(i32, i32)> {
        None
    }

    fn move_to(&self, _x: i32, _y: i32) {}
}

/// The pointer device for the current platform.
pub fn platform_pointer() -> Arc<dyn PointerDevice> {
    #[cfg(target_os = "windows")]
    {
        Arc::new(crate::platform::windows::CursorPointer)
    }

    #[cfg(not(target_os = "windows"))]
    {
        Arc::new(NoPointer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_keeps_inside_points() {
        let region = Region {
            x: 100,
            y: 50,
            width: 800,
            height: 600,
        };
        assert_eq!(region.clamp(300, 300), (300, 300));
        assert_eq!(region.clamp(0, 0), (100, 50));
        assert_eq!(region.clamp(5000, 5000), (899, 649));
    }

    #[test]
    fn empty_region() {
        let region = Region {
            x: 0,
            y: 0,
            width: 0,
            height: 10,
        };
        assert!(region.is_empty());
        assert_eq!(region.clamp(20, 20), (0, 9));
    }
}
