//! AT scancode -> X keycode translation for escaped key sequences.
//!
//! A zero entry means "unmapped"; `kbd_push_key` logs and drops these.
//! Values transcribed directly from `original_source/src/spice.c`'s
//! `escaped_map` table (evdev keycodes, e.g. 0x48 up arrow -> 111).

pub const MIN_KEYCODE: u8 = 8;

pub const ESCAPED_MAP: [u8; 128] = build_escaped_map();

const fn build_escaped_map() -> [u8; 128] {
    let mut map = [0u8; 128];

    map[0x1c] = 104; // KP_Enter
    map[0x1d] = 105; // Right Ctrl
    map[0x35] = 106; // KP_Divide
    map[0x37] = 107; // Print Screen / SysRq
    map[0x38] = 108; // Right Alt (AltGr)
    map[0x46] = 127; // Pause/Break (as Ctrl+NumLock escape)
    map[0x47] = 110; // Home
    map[0x48] = 111; // Up
    map[0x49] = 112; // Page Up
    map[0x4b] = 113; // Left
    map[0x4d] = 114; // Right
    map[0x4f] = 115; // End
    map[0x50] = 116; // Down
    map[0x51] = 117; // Page Down
    map[0x52] = 118; // Insert
    map[0x53] = 119; // Delete
    map[0x5b] = 133; // Left Meta/Super
    map[0x5c] = 134; // Right Meta/Super
    map[0x5d] = 135; // Menu

    map
}

/// Translate an escaped (0xE0-prefixed) AT scancode to an X keycode.
/// Returns `None` for an unmapped code.
pub fn translate_escaped(code: u8) -> Option<u8> {
    let index = (code & 0x7f) as usize;
    if index >= ESCAPED_MAP.len() {
        return None;
    }
    let mapped = ESCAPED_MAP[index];
    if mapped == 0 { None } else { Some(mapped) }
}

/// Translate a non-escaped AT scancode to an X keycode: offset by
/// `MIN_KEYCODE`, matching how XTest addresses keycodes.
pub fn translate_plain(code: u8) -> u8 {
    (code & 0x7f).wrapping_add(MIN_KEYCODE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s6_escaped_up_arrow_press() {
        // S6: [0xE0, 0x48] forwards key code 111.
        assert_eq!(translate_escaped(0x48), Some(111));
    }

    #[test]
    fn s6_escaped_up_arrow_release() {
        // [0xE0, 0xC8] is the release of the same scancode (high bit set is
        // release, handled by the caller's state machine; the table lookup
        // itself strips the high bit).
        assert_eq!(translate_escaped(0xC8), Some(111));
    }

    #[test]
    fn unmapped_escaped_code_is_none() {
        assert_eq!(translate_escaped(0x00), None);
    }

    #[test]
    fn plain_code_applies_min_keycode_offset() {
        assert_eq!(translate_plain(0x1e), 0x1e + MIN_KEYCODE); // 'a' key
    }
}
