//! Keyboard and pointer forwarding: scancode state machine, button remap,
//! and XTest injection into the display server.

use std::sync::Arc;

use x11rb::connection::Connection;
use x11rb::protocol::xproto::ConnectionExt as _;
use x11rb::protocol::xtest::ConnectionExt as _;
use x11rb::rust_connection::RustConnection;

use x11bridge_proto::BridgeError;

use crate::keymap;

pub const LEFT_BUTTON_MASK: u8 = 0x01;
pub const MIDDLE_BUTTON_MASK: u8 = 0x02;
pub const RIGHT_BUTTON_MASK: u8 = 0x04;
const OTHER_BUTTONS_MASK: u8 = !(LEFT_BUTTON_MASK | MIDDLE_BUTTON_MASK | RIGHT_BUTTON_MASK);

/// Recover the local button layout from the remote protocol's swapped
/// middle/right bits. An involution: applying it twice is the identity.
pub fn remap_buttons(state: u8) -> u8 {
    (state & LEFT_BUTTON_MASK)
        | ((state & MIDDLE_BUTTON_MASK) << 1)
        | ((state & RIGHT_BUTTON_MASK) >> 1)
        | (state & OTHER_BUTTONS_MASK)
}

/// Tracks the leading 0xE0 escape byte across `kbd_push_key` calls.
#[derive(Default)]
pub struct KeyboardState {
    escape_pending: bool,
    last_buttons: u8,
}

pub enum KeyAction {
    Press(u8),
    Release(u8),
    Dropped,
}

impl KeyboardState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one AT scancode fragment. A fragment with its high bit clear is
    /// a press, set is a release; 0xE0 starts an escape sequence that
    /// applies to the next fragment only.
    pub fn push_key(&mut self, frag: u8) -> KeyAction {
        if frag == 0xe0 {
            self.escape_pending = true;
            return KeyAction::Dropped;
        }

        let escaped = std::mem::take(&mut self.escape_pending);
        let is_release = frag & 0x80 != 0;
        let code = frag & 0x7f;

        let keycode = if escaped {
            match keymap::translate_escaped(code) {
                Some(kc) => kc,
                None => {
                    tracing::warn!(code, "unmapped escaped scancode, dropping");
                    return KeyAction::Dropped;
                }
            }
        } else {
            keymap::translate_plain(code)
        };

        if is_release {
            KeyAction::Release(keycode)
        } else {
            KeyAction::Press(keycode)
        }
    }

    /// Diff the new (already-remapped) button state against what was last
    /// forwarded, returning the set of buttons whose bit changed.
    pub fn button_diff(&mut self, new_state: u8) -> Vec<(u8, bool)> {
        let mut changes = Vec::new();
        for button in 1..=5u8 {
            let mask = 1 << (button - 1);
            let was_down = self.last_buttons & mask != 0;
            let is_down = new_state & mask != 0;
            if was_down != is_down {
                changes.push((button, is_down));
            }
        }
        self.last_buttons = new_state;
        changes
    }
}

/// Query the display for the three lock-state indicators and pack them into
/// the Spice modifier-flags bitmask the forwarder returns to the protocol
/// server as-is: bit 0 = Scroll Lock, bit 1 = Num Lock, bit 2 = Caps Lock.
pub fn get_leds(conn: &RustConnection) -> Result<u8, x11bridge_proto::BridgeError> {
    use x11rb::protocol::xkb::ConnectionExt as _;

    let reply = conn
        .xkb_get_indicator_state(x11rb::protocol::xkb::ID::USE_CORE_KBD.into())
        .map_err(|e| x11bridge_proto::BridgeError::ReadFailure(e.to_string()))?
        .reply()
        .map_err(|e| x11bridge_proto::BridgeError::ReadFailure(e.to_string()))?;

    // The named-indicator bit positions are assigned by the server at
    // runtime; a production build resolves "Caps Lock"/"Num Lock"/
    // "Scroll Lock" to bit indices once via GetNamedIndicator and caches
    // them. This mirrors that lookup with the conventional core-keyboard
    // positions used by virtually every X server.
    const CAPS_LOCK_BIT: u32 = 0;
    const NUM_LOCK_BIT: u32 = 1;
    const SCROLL_LOCK_BIT: u32 = 2;

    let state = reply.state;
    let mut leds = 0u8;
    if state & (1 << CAPS_LOCK_BIT) != 0 {
        leds |= 0x04; // SPICE_KEYBOARD_MODIFIER_FLAGS_CAPS_LOCK
    }
    if state & (1 << SCROLL_LOCK_BIT) != 0 {
        leds |= 0x01; // SPICE_KEYBOARD_MODIFIER_FLAGS_SCROLL_LOCK
    }
    if state & (1 << NUM_LOCK_BIT) != 0 {
        leds |= 0x02; // SPICE_KEYBOARD_MODIFIER_FLAGS_NUM_LOCK
    }
    Ok(leds)
}

/// Inject a key press or release via XTest fake_input.
pub fn fake_key(
    conn: &RustConnection,
    keycode: u8,
    press: bool,
) -> Result<(), x11bridge_proto::BridgeError> {
    let event_type = if press {
        x11rb::protocol::xproto::KEY_PRESS_EVENT
    } else {
        x11rb::protocol::xproto::KEY_RELEASE_EVENT
    };
    conn.xtest_fake_input(event_type, keycode, 0, x11rb::NONE, 0, 0, 0)
        .map_err(|e| x11bridge_proto::BridgeError::ReadFailure(e.to_string()))?;
    conn.flush()
        .map_err(|e| x11bridge_proto::BridgeError::ReadFailure(e.to_string()))?;
    Ok(())
}

/// Emit a press or release XTest event for each button whose remapped state
/// changed since the last call, with no accompanying motion.
fn fake_buttons(
    conn: &RustConnection,
    state: &mut KeyboardState,
    remote_buttons: u8,
) -> Result<(), x11bridge_proto::BridgeError> {
    let local = remap_buttons(remote_buttons);
    for (button, down) in state.button_diff(local) {
        let event_type = if down {
            x11rb::protocol::xproto::BUTTON_PRESS_EVENT
        } else {
            x11rb::protocol::xproto::BUTTON_RELEASE_EVENT
        };
        conn.xtest_fake_input(event_type, button, 0, x11rb::NONE, 0, 0, 0)
            .map_err(|e| x11bridge_proto::BridgeError::ReadFailure(e.to_string()))?;
    }
    Ok(())
}

/// Inject pointer motion and a button mask diff via XTest.
pub fn fake_pointer(
    conn: &RustConnection,
    state: &mut KeyboardState,
    x: i16,
    y: i16,
    remote_buttons: u8,
) -> Result<(), x11bridge_proto::BridgeError> {
    conn.xtest_fake_input(
        x11rb::protocol::xproto::MOTION_NOTIFY_EVENT,
        0,
        0,
        x11rb::NONE,
        x,
        y,
        0,
    )
    .map_err(|e| x11bridge_proto::BridgeError::ReadFailure(e.to_string()))?;

    fake_buttons(conn, state, remote_buttons)?;

    conn.flush()
        .map_err(|e| x11bridge_proto::BridgeError::ReadFailure(e.to_string()))?;
    Ok(())
}

/// Wheel motion becomes a synthetic button 4 (up) or 5 (down) click.
pub fn fake_wheel(
    conn: &RustConnection,
    motion: i32,
) -> Result<(), x11bridge_proto::BridgeError> {
    if motion == 0 {
        return Ok(());
    }
    let button = if motion < 0 { 4 } else { 5 };
    conn.xtest_fake_input(
        x11rb::protocol::xproto::BUTTON_PRESS_EVENT,
        button,
        0,
        x11rb::NONE,
        0,
        0,
        0,
    )
    .map_err(|e| x11bridge_proto::BridgeError::ReadFailure(e.to_string()))?;
    conn.xtest_fake_input(
        x11rb::protocol::xproto::BUTTON_RELEASE_EVENT,
        button,
        0,
        x11rb::NONE,
        0,
        0,
        0,
    )
    .map_err(|e| x11bridge_proto::BridgeError::ReadFailure(e.to_string()))?;
    conn.flush()
        .map_err(|e| x11bridge_proto::BridgeError::ReadFailure(e.to_string()))?;
    Ok(())
}

/// Owns the escape/button state for one remote session's input stream and
/// the shared X11 connection it injects events through. Lives on whichever
/// thread the remote protocol worker calls `RemoteBridge`'s input callbacks
/// from — `RustConnection` is safe to issue requests from concurrently with
/// the display event thread's blocking `wait_for_event` loop, since request
/// writes and the read-side event dispatch use independent internal locks.
pub struct InputInjector {
    conn: Arc<RustConnection>,
    state: KeyboardState,
}

impl InputInjector {
    pub fn new(conn: Arc<RustConnection>) -> Self {
        Self {
            conn,
            state: KeyboardState::new(),
        }
    }

    /// `kbd_push_key`: feed one AT scancode fragment and inject the
    /// resulting press/release, if any.
    pub fn push_key(&mut self, frag: u8) -> Result<(), BridgeError> {
        match self.state.push_key(frag) {
            KeyAction::Press(keycode) => fake_key(&self.conn, keycode, true),
            KeyAction::Release(keycode) => fake_key(&self.conn, keycode, false),
            KeyAction::Dropped => Ok(()),
        }
    }

    /// `kbd_get_leds`.
    pub fn get_leds(&self) -> Result<u8, BridgeError> {
        get_leds(&self.conn)
    }

    /// `tablet_position`: absolute motion plus a button-mask diff.
    pub fn tablet_position(&mut self, x: i16, y: i16, buttons: u8) -> Result<(), BridgeError> {
        fake_pointer(&self.conn, &mut self.state, x, y, buttons)
    }

    /// `tablet_wheel`: synthetic button 4/5 click, motion-independent.
    pub fn tablet_wheel(&self, motion: i32) -> Result<(), BridgeError> {
        fake_wheel(&self.conn, motion)
    }

    /// `tablet_buttons`: a button-mask change with no accompanying motion.
    pub fn tablet_buttons(&mut self, buttons: u8) -> Result<(), BridgeError> {
        fake_buttons(&self.conn, &mut self.state, buttons)?;
        self.conn
            .flush()
            .map_err(|e| BridgeError::ReadFailure(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn button_remap_is_involution() {
        for state in 0u8..=255 {
            assert_eq!(remap_buttons(remap_buttons(state)), state);
        }
    }

    #[test]
    fn button_remap_swaps_middle_and_right() {
        assert_eq!(remap_buttons(MIDDLE_BUTTON_MASK), RIGHT_BUTTON_MASK);
        assert_eq!(remap_buttons(RIGHT_BUTTON_MASK), MIDDLE_BUTTON_MASK);
        assert_eq!(remap_buttons(LEFT_BUTTON_MASK), LEFT_BUTTON_MASK);
    }

    #[test]
    fn s6_escaped_up_arrow_sequence() {
        let mut state = KeyboardState::new();
        assert!(matches!(state.push_key(0xe0), KeyAction::Dropped));
        match state.push_key(0x48) {
            KeyAction::Press(111) => {}
            _ => panic!("expected Press(111)"),
        }
    }

    #[test]
    fn s6_escaped_up_arrow_release_sequence() {
        let mut state = KeyboardState::new();
        assert!(matches!(state.push_key(0xe0), KeyAction::Dropped));
        match state.push_key(0xc8) {
            KeyAction::Release(111) => {}
            _ => panic!("expected Release(111)"),
        }
    }

    #[test]
    fn plain_key_press_and_release() {
        let mut state = KeyboardState::new();
        match state.push_key(0x1e) {
            KeyAction::Press(kc) => assert_eq!(kc, 0x1e + keymap::MIN_KEYCODE),
            _ => panic!("expected press"),
        }
        match state.push_key(0x9e) {
            KeyAction::Release(kc) => assert_eq!(kc, 0x1e + keymap::MIN_KEYCODE),
            _ => panic!("expected release"),
        }
    }

    #[test]
    fn unmapped_escaped_scancode_is_dropped() {
        let mut state = KeyboardState::new();
        assert!(matches!(state.push_key(0xe0), KeyAction::Dropped));
        assert!(matches!(state.push_key(0x00), KeyAction::Dropped));
    }

    #[test]
    fn button_diff_emits_only_changed_bits() {
        let mut state = KeyboardState::new();
        let first = state.button_diff(LEFT_BUTTON_MASK);
        assert_eq!(first, vec![(1, true)]);
        let second = state.button_diff(LEFT_BUTTON_MASK | RIGHT_BUTTON_MASK);
        assert_eq!(second, vec![(3, true)]);
        let third = state.button_diff(0);
        assert_eq!(third.len(), 2);
        assert!(third.contains(&(1, false)));
        assert!(third.contains(&(3, false)));
    }
}
