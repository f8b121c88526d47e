//! macOS backends: screen capture, window control, synthetic input and the
//! global event tap used for recording.

pub mod desktop;
pub mod events;
pub mod input;
pub mod keys;
pub mod script;

pub use desktop::MacDesktop;
pub use events::start_event_tap;
pub use input::MacInput;
