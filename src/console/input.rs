//! Decoding raw bytes from an SSH PTY channel into key presses.

/// A key press the console reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    Char(char),
    Enter,
    Esc,
    Backspace,
    Tab,
    Up,
    Down,
    PageUp,
    PageDown,
    CtrlC,
}

/// Decode one chunk of client input.
///
/// Escape sequences are assumed not to straddle chunks, which holds for the
/// short sequences terminals send for a single key.  Unrecognised control
/// bytes and CSI sequences are dropped.
pub fn decode(bytes: &[u8]) -> Vec<Key> {
    let text = String::from_utf8_lossy(bytes);
    let mut keys = Vec::new();
    let mut chars = text.chars().peekable();
    let mut prev_cr = false;

    while let Some(c) = chars.next() {
        let was_cr = std::mem::replace(&mut prev_cr, c == '\r');
        match c {
            '\r' => keys.push(Key::Enter),
            '\n' if !was_cr => keys.push(Key::Enter),
            '\n' => {}
            '\t' => keys.push(Key::Tab),
            '\x7f' | '\x08' => keys.push(Key::Backspace),
            '\x03' => keys.push(Key::CtrlC),
            '\x1b' => match chars.peek() {
                Some('[') | Some('O') => {
                    chars.next();
                    // Parameters then one final byte in 0x40..=0x7e.
                    let mut params = String::new();
                    let mut last = None;
                    for c in chars.by_ref() {
                        if ('\x40'..='\x7e').contains(&c) {
                            last = Some(c);
                            break;
                        }
                        params.push(c);
                    }
                    match (params.as_str(), last) {
                        (_, Some('A')) => keys.push(Key::Up),
                        (_, Some('B')) => keys.push(Key::Down),
                        ("5", Some('~')) => keys.push(Key::PageUp),
                        ("6", Some('~')) => keys.push(Key::PageDown),
                        _ => {}
                    }
                }
                _ => keys.push(Key::Esc),
            },
            c if c.is_control() => {}
            c => keys.push(Key::Char(c)),
        }
    }
    keys
}
