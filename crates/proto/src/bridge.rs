use crate::commands::{CursorCommand, DrawCommand, InitInfo, MonitorsConfig};
use crate::error::BridgeError;
use crate::tokens::ReleaseToken;

/// The callback surface a remote protocol server implementation exposes to
/// the capture engine. Every method here is invoked from the protocol
/// server's own worker thread; none of them may block.
pub trait RemoteBridge: Send {
    /// Install the single memory slot (id 0, full address range). Subsequent
    /// calls are rejected idempotently — returning `Ok(())` without
    /// re-installing, since a second attach is not itself an error condition,
    /// only a no-op.
    fn attach_worker(&mut self) -> Result<(), BridgeError>;

    fn get_init_info(&self) -> InitInfo {
        InitInfo::default()
    }

    /// Pop one draw command, non-blocking. `None` means the draw queue was
    /// empty at the moment of the call.
    fn get_command(&mut self) -> Option<DrawCommand>;

    /// Whether the caller should request a wakeup rather than spin: `false`
    /// if a draw is already waiting, `true` to ask for notification.
    fn req_cmd_notification(&mut self) -> bool;

    fn release_resource(&mut self, token: ReleaseToken);

    fn get_cursor_command(&mut self) -> Option<CursorCommand>;

    fn req_cursor_notification(&mut self) -> bool;

    /// Free the release token addressed by `cookie` (used for monitor-config
    /// commands, which are not drained through `get_command`).
    fn async_complete(&mut self, cookie: u64);

    fn set_compression_level(&mut self, _level: u32) {}

    fn set_mm_time(&mut self, _mm_time: u32) {}

    /// `None` is a capability probe and always succeeds. `Some(cfg)` is a
    /// client-driven resize request; this core does not implement
    /// client-driven resize, so a real config is logged and rejected.
    fn client_monitors_config(&mut self, cfg: Option<&MonitorsConfig>) -> bool {
        cfg.is_none()
    }

    /// Feed one AT scancode fragment from the remote keyboard into the
    /// display server (0xE0-escape state machine, MIN_KEYCODE offset).
    fn kbd_push_key(&mut self, frag: u8);

    /// Poll the display for Caps/Num/Scroll Lock and pack into a bitmask.
    fn kbd_get_leds(&mut self) -> u8;

    /// Absolute pointer motion plus a remapped button-mask diff.
    fn tablet_position(&mut self, x: i16, y: i16, buttons: u8);

    /// Wheel motion as a synthetic button 4/5 click.
    fn tablet_wheel(&mut self, motion: i32, buttons: u8);

    /// A button-mask change with no accompanying motion.
    fn tablet_buttons(&mut self, buttons: u8);
}
