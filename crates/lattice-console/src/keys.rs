use crossterm::event::{KeyCode, KeyEvent, KeyEventKind, KeyModifiers};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeyAction {
    Input(String),
    /// Ctrl-C or Ctrl-] ends the local session instead of reaching the remote.
    Detach,
    Ignore,
}

/// Maps a raw-mode key event to the bytes a remote terminal expects.
pub fn translate_key(key: KeyEvent) -> KeyAction {
    if key.kind == KeyEventKind::Release {
        return KeyAction::Ignore;
    }
    let ctrl = key.modifiers.contains(KeyModifiers::CONTROL);
    let alt = key.modifiers.contains(KeyModifiers::ALT);

    let input = match key.code {
        KeyCode::Char(c) if ctrl && matches!(c, 'c' | 'C' | ']' | '5') => return KeyAction::Detach,
        KeyCode::Char('\u{1d}') => return KeyAction::Detach,
        KeyCode::Char(c) if ctrl => match control_byte(c) {
            Some(byte) => char::from(byte).to_string(),
            None => return KeyAction::Ignore,
        },
        KeyCode::Char(c) if alt => format!("\x1b{c}"),
        KeyCode::Char(c) => c.to_string(),
        KeyCode::Enter => "\r".to_string(),
        KeyCode::Tab => "\t".to_string(),
        KeyCode::BackTab => "\x1b[Z".to_string(),
        KeyCode::Backspace => "\x7f".to_string(),
        KeyCode::Esc => "\x1b".to_string(),
        KeyCode::Up => "\x1b[A".to_string(),
        KeyCode::Down => "\x1b[B".to_string(),
        KeyCode::Right => "\x1b[C".to_string(),
        KeyCode::Left => "\x1b[D".to_string(),
        KeyCode::Home => "\x1b[H".to_string(),
        KeyCode::End => "\x1b[F".to_string(),
        KeyCode::Insert => "\x1b[2~".to_string(),
        KeyCode::Delete => "\x1b[3~".to_string(),
        KeyCode::PageUp => "\x1b[5~".to_string(),
        KeyCode::PageDown => "\x1b[6~".to_string(),
        _ => return KeyAction::Ignore,
    };
    KeyAction::Input(input)
}

fn control_byte(c: char) -> Option<u8> {
    match c.to_ascii_lowercase() {
        c @ 'a'..='z' => Some(c as u8 - b'a' + 1),
        '@' | ' ' => Some(0),
        '[' => Some(0x1b),
        '\\' => Some(0x1c),
        '^' => Some(0x1e),
        '_' => Some(0x1f),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(code: KeyCode, modifiers: KeyModifiers) -> KeyEvent {
        KeyEvent::new(code, modifiers)
    }

    #[test]
    fn control_letters_become_c0_bytes() {
        assert_eq!(
            translate_key(key(KeyCode::Char('d'), KeyModifiers::CONTROL)),
            KeyAction::Input("\u{4}".to_string())
        );
        assert_eq!(
            translate_key(key(KeyCode::Char('L'), KeyModifiers::CONTROL)),
            KeyAction::Input("\u{c}".to_string())
        );
    }

    #[test]
    fn detach_keys_never_reach_the_remote() {
        assert_eq!(
            translate_key(key(KeyCode::Char('c'), KeyModifiers::CONTROL)),
            KeyAction::Detach
        );
        assert_eq!(
            translate_key(key(KeyCode::Char(']'), KeyModifiers::CONTROL)),
            KeyAction::Detach
        );
    }

    #[test]
    fn navigation_keys_use_ansi_sequences() {
        assert_eq!(
            translate_key(key(KeyCode::Up, KeyModifiers::NONE)),
            KeyAction::Input("\x1b[A".to_string())
        );
        assert_eq!(
            translate_key(key(KeyCode::Enter, KeyModifiers::NONE)),
            KeyAction::Input("\r".to_string())
        );
        assert_eq!(
            translate_key(key(KeyCode::Char('x'), KeyModifiers::ALT)),
            KeyAction::Input("\x1bx".to_string())
        );
        assert_eq!(translate_key(key(KeyCode::F(5), KeyModifiers::NONE)), KeyAction::Ignore);
    }
}
