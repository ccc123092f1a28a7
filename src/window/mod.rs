pub mod buffer;
pub mod types;

pub use buffer::WindowBuffer;
pub use types::{
    BufferStats, ClosedWindow, LateMessage, LateReason, Window, WindowError, WindowId, WindowRef,
    WindowState,
};
