pub mod common;

#[cfg(target_os = "windows")]
pub mod windows;
