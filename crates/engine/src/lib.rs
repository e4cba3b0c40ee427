//! Capture-engine crate: X11 capture, the shared-memory image pool, the
//! session coordinator, and the `RemoteBridge` forwarder a remote protocol
//! server's worker thread drives.

pub mod display;
pub mod forwarder;
pub mod hooks;
pub mod input;
pub mod keymap;
pub mod mainloop;
pub mod pool;
pub mod scan;
pub mod session;

pub use display::DisplayAdapter;
pub use forwarder::Forwarder;
pub use hooks::HookTracker;
pub use input::InputInjector;
pub use mainloop::{Scheduler, WatchMask};
pub use pool::ImagePool;
pub use session::Session;
