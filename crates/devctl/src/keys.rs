use crossterm::{
    event::{Event, EventStream, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    terminal::{disable_raw_mode, enable_raw_mode},
};
use devctl_supervisor::Console;
use futures_util::StreamExt;
use std::{io::IsTerminal, sync::Arc};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    Restart,
    Open,
    Stop,
}

pub fn map_key(key: &KeyEvent) -> Option<KeyAction> {
    if key.kind != KeyEventKind::Press {
        return None;
    }
    match key.code {
        KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => Some(KeyAction::Stop),
        KeyCode::Char('r') | KeyCode::Char('R') => Some(KeyAction::Restart),
        KeyCode::Char('o') | KeyCode::Char('O') => Some(KeyAction::Open),
        KeyCode::Char('q') | KeyCode::Char('Q') => Some(KeyAction::Stop),
        _ => None,
    }
}

/// Operator input: raw-mode keys on a terminal, otherwise only the interrupt signal.
pub enum KeyInput {
    Terminal {
        events: EventStream,
        console: Arc<Console>,
    },
    Signals,
}

impl KeyInput {
    pub fn start(console: Arc<Console>) -> Self {
        if std::io::stdin().is_terminal() {
            match enable_raw_mode() {
                Ok(()) => {
                    console.set_raw_mode(true);
                    return KeyInput::Terminal {
                        events: EventStream::new(),
                        console,
                    };
                }
                Err(err) => warn!(event = "raw_mode_unavailable", error = %err),
            }
        }
        KeyInput::Signals
    }

    pub fn interactive(&self) -> bool {
        matches!(self, KeyInput::Terminal { .. })
    }

    /// Next action. `None` means input is gone and the caller should treat it as a stop.
    pub async fn next(&mut self) -> Option<KeyAction> {
        match self {
            KeyInput::Terminal { events, .. } => loop {
                match events.next().await {
                    Some(Ok(Event::Key(key))) => {
                        if let Some(action) = map_key(&key) {
                            debug!(event = "key_action", action = ?action);
                            return Some(action);
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(event = "key_input_error", error = %err);
                        return None;
                    }
                    None => return None,
                }
            },
            KeyInput::Signals => {
                if let Err(err) = tokio::signal::ctrl_c().await {
                    warn!(event = "signal_error", error = %err);
                }
                Some(KeyAction::Stop)
            }
        }
    }
}

impl Drop for KeyInput {
    fn drop(&mut self) {
        if let KeyInput::Terminal { console, .. } = self {
            let _ = disable_raw_mode();
            console.set_raw_mode(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn press(code: KeyCode, modifiers: KeyModifiers) -> KeyEvent {
        KeyEvent::new(code, modifiers)
    }

    #[test]
    fn maps_operator_keys() {
        assert_eq!(
            map_key(&press(KeyCode::Char('r'), KeyModifiers::NONE)),
            Some(KeyAction::Restart)
        );
        assert_eq!(
            map_key(&press(KeyCode::Char('o'), KeyModifiers::NONE)),
            Some(KeyAction::Open)
        );
        assert_eq!(
            map_key(&press(KeyCode::Char('q'), KeyModifiers::NONE)),
            Some(KeyAction::Stop)
        );
        assert_eq!(
            map_key(&press(KeyCode::Char('c'), KeyModifiers::CONTROL)),
            Some(KeyAction::Stop)
        );
        assert_eq!(map_key(&press(KeyCode::Char('c'), KeyModifiers::NONE)), None);
        assert_eq!(map_key(&press(KeyCode::Enter, KeyModifiers::NONE)), None);
    }

    #[test]
    fn ignores_key_release() {
        let mut key = press(KeyCode::Char('r'), KeyModifiers::NONE);
        key.kind = KeyEventKind::Release;
        assert_eq!(map_key(&key), None);
    }
}
