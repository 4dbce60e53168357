//! Human-readable names for raw key codes, used in diagnostics only.

/// Name of a raw (untranslated) key or button code.
pub fn key_name(code: u16) -> &'static str {
    match code {
        1 => "ESC",
        2..=11 => "DIGIT",
        12 => "MINUS",
        13 => "EQUAL",
        14 => "BACKSPACE",
        15 => "TAB",
        16..=25 | 30..=38 | 44..=50 => "LETTER",
        26 => "LEFTBRACE",
        27 => "RIGHTBRACE",
        28 => "ENTER",
        29 => "LEFTCTRL",
        39 => "SEMICOLON",
        40 => "APOSTROPHE",
        41 => "GRAVE",
        42 => "LEFTSHIFT",
        43 => "BACKSLASH",
        51 => "COMMA",
        52 => "DOT",
        53 => "SLASH",
        54 => "RIGHTSHIFT",
        55 => "KPASTERISK",
        56 => "LEFTALT",
        57 => "SPACE",
        58 => "CAPSLOCK",
        59..=68 | 87 | 88 => "FUNCTION",
        71..=83 => "KEYPAD",
        96 => "KPENTER",
        97 => "RIGHTCTRL",
        98 => "KPSLASH",
        99 => "SYSRQ",
        100 => "RIGHTALT",
        102 => "HOME",
        103 => "UP",
        104 => "PAGEUP",
        105 => "LEFT",
        106 => "RIGHT",
        107 => "END",
        108 => "DOWN",
        109 => "PAGEDOWN",
        110 => "INSERT",
        111 => "DELETE",
        113 => "MUTE",
        114 => "VOLUMEDOWN",
        115 => "VOLUMEUP",
        125 => "LEFTMETA",
        126 => "RIGHTMETA",
        0x110 => "BTN_LEFT",
        0x111 => "BTN_RIGHT",
        0x112 => "BTN_MIDDLE",
        0x113 => "BTN_SIDE",
        0x114 => "BTN_EXTRA",
        _ => "UNKNOWN",
    }
}
