use windows_sys::Win32::Foundation::POINT;
use windows_sys::Win32::UI::WindowsAndMessaging::{GetCursorPos, SetCursorPos};

use crate::time_limits::PointerDevice;

/// The system cursor, driven through the Win32 cursor API
#[derive(Debug, Default, Clone, Copy)]
pub struct CursorPointer;

impl PointerDevice for CursorPointer {
    fn position(&self) -> Option<(i32, i32)> {
        let mut point = POINT { x: 0, y: 0 };
        // SAFETY: `point` is a valid, writable POINT for the duration of the call.
        let ok = unsafe { GetCursorPos(&mut point) };
        if ok == 0 {
            return None;
        }
        Some((point.x, point.y))
    }

    fn move_to(&self, x: i32, y: i32) {
        // SAFETY: plain value arguments; failure only means the cursor stays put.
        let ok = unsafe { SetCursorPos(x, y) };
        if ok == 0 {
            tracing::debug!("SetCursorPos({}, {}) failed", x, y);
        }
    }
}
