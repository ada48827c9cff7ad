//! Global hotkey adapter
//!
//! Turns presses of the configured keys into actions for the coordinator.
//! Trigger presses arriving within the debounce interval of the last
//! accepted one are dropped here, before they reach the trigger channel.

use anyhow::{anyhow, Result};
use crate::config::HotkeySettings;
use global_hotkey::{
    hotkey::{Code, HotKey, Modifiers},
    GlobalHotKeyEvent, GlobalHotKeyManager, HotKeyState,
};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const FUNCTION_KEYS: [Code; 12] = [
    Code::F1,
    Code::F2,
    Code::F3,
    Code::F4,
    Code::F5,
    Code::F6,
    Code::F7,
    Code::F8,
    Code::F9,
    Code::F10,
    Code::F11,
    Code::F12,
];

const LETTER_KEYS: [Code; 26] = [
    Code::KeyA,
    Code::KeyB,
    Code::KeyC,
    Code::KeyD,
    Code::KeyE,
    Code::KeyF,
    Code::KeyG,
    Code::KeyH,
    Code::KeyI,
    Code::KeyJ,
    Code::KeyK,
    Code::KeyL,
    Code::KeyM,
    Code::KeyN,
    Code::KeyO,
    Code::KeyP,
    Code::KeyQ,
    Code::KeyR,
    Code::KeyS,
    Code::KeyT,
    Code::KeyU,
    Code::KeyV,
    Code::KeyW,
    Code::KeyX,
    Code::KeyY,
    Code::KeyZ,
];

const DIGIT_KEYS: [Code; 10] = [
    Code::Digit0,
    Code::Digit1,
    Code::Digit2,
    Code::Digit3,
    Code::Digit4,
    Code::Digit5,
    Code::Digit6,
    Code::Digit7,
    Code::Digit8,
    Code::Digit9,
];

/// Parses a key combination like "F12", "Ctrl+Shift+R" or "Alt+Q"
pub fn parse_hotkey(hotkey_str: &str) -> Result<HotKey> {
    let mut modifiers = Modifiers::empty();
    let mut key_code: Option<Code> = None;

    for part in hotkey_str.split('+').map(str::trim) {
        match part.to_ascii_uppercase().as_str() {
            "CTRL" | "CONTROL" => modifiers |= Modifiers::CONTROL,
            "SHIFT" => modifiers |= Modifiers::SHIFT,
            "ALT" | "OPTION" => modifiers |= Modifiers::ALT,
            "SUPER" | "CMD" | "WIN" => modifiers |= Modifiers::SUPER,
            key => {
                if key_code.is_some() {
                    return Err(anyhow!("More than one key in hotkey '{}'", hotkey_str));
                }
                key_code = Some(parse_key_code(key)?);
            }
        }
    }

    let code = key_code.ok_or_else(|| anyhow!("No key in hotkey '{}'", hotkey_str))?;
    Ok(HotKey::new(Some(modifiers), code))
}

/// Function keys, single letters and digits, plus a few named keys.
/// `key` is already upper-case.
fn parse_key_code(key: &str) -> Result<Code> {
    if let Some(n) = key.strip_prefix('F').and_then(|n| n.parse::<usize>().ok()) {
        return n
            .checked_sub(1)
            .and_then(|i| FUNCTION_KEYS.get(i))
            .copied()
            .ok_or_else(|| anyhow!("Unknown function key: {}", key));
    }

    let mut chars = key.chars();
    if let (Some(c), None) = (chars.next(), chars.next()) {
        match c {
            'A'..='Z' => return Ok(LETTER_KEYS[(c as u8 - b'A') as usize]),
            '0'..='9' => return Ok(DIGIT_KEYS[(c as u8 - b'0') as usize]),
            _ => {}
        }
    }

    match key {
        "SPACE" => Ok(Code::Space),
        "ESC" | "ESCAPE" => Ok(Code::Escape),
        "INSERT" => Ok(Code::Insert),
        "PAUSE" => Ok(Code::Pause),
        "PRINTSCREEN" => Ok(Code::PrintScreen),
        _ => Err(anyhow!("Unknown key: {}", key)),
    }
}

/// What a hotkey press asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotkeyAction {
    Trigger,
    Reload,
    Stats,
    Exit,
}

/// Accepts an event only if the previous accepted one is at least
/// `interval` old
#[derive(Debug)]
pub struct Debouncer {
    interval: Duration,
    last: Option<Instant>,
}

impl Debouncer {
    pub fn new(interval: Duration) -> Self {
        Self { interval, last: None }
    }

    pub fn allow(&mut self, now: Instant) -> bool {
        if let Some(last) = self.last {
            if now.saturating_duration_since(last) < self.interval {
                return false;
            }
        }
        self.last = Some(now);
        true
    }
}

/// Registered hotkeys and the trigger debounce
pub struct HotkeyManager {
    manager: GlobalHotKeyManager,
    registered: Vec<(HotKey, HotkeyAction)>,
    debounce: Debouncer,
}

impl HotkeyManager {
    /// Create the manager and register the configured keys. Only the
    /// trigger key is required; the others are dropped with a warning when
    /// they cannot be registered.
    pub fn new(settings: &HotkeySettings) -> Result<Self> {
        let manager = GlobalHotKeyManager::new()
            .map_err(|e| anyhow!("Failed to create hotkey manager: {:?}", e))?;

        let mut this = Self {
            manager,
            registered: Vec::new(),
            debounce: Debouncer::new(Duration::from_millis(settings.debounce_ms)),
        };

        this.register(&settings.trigger, HotkeyAction::Trigger)?;

        let optional = [
            (&settings.exit, HotkeyAction::Exit),
            (&settings.reload, HotkeyAction::Reload),
            (&settings.stats, HotkeyAction::Stats),
        ];
        for (key, action) in optional {
            if let Some(key) = key {
                if let Err(e) = this.register(key, action) {
                    warn!("{:?} hotkey disabled: {}", action, e);
                }
            }
        }

        Ok(this)
    }

    fn register(&mut self, hotkey_str: &str, action: HotkeyAction) -> Result<()> {
        let hotkey = parse_hotkey(hotkey_str)?;
        self.manager
            .register(hotkey)
            .map_err(|e| anyhow!("Failed to register hotkey '{}': {:?}", hotkey_str, e))?;

        self.registered.push((hotkey, action));
        info!("Registered {:?} hotkey: {}", action, hotkey_str);
        Ok(())
    }

    /// Wait up to `timeout` for a press of a registered key
    pub fn poll(&mut self, timeout: Duration) -> Option<HotkeyAction> {
        let event = GlobalHotKeyEvent::receiver().recv_timeout(timeout).ok()?;
        if event.state != HotKeyState::Pressed {
            return None;
        }
        let action = action_for(&self.registered, event.id)?;
        if action == HotkeyAction::Trigger && !self.debounce.allow(Instant::now()) {
            debug!("Trigger within debounce interval ignored");
            return None;
        }
        debug!("Hotkey pressed: {:?}", action);
        Some(action)
    }
}

fn action_for(registered: &[(HotKey, HotkeyAction)], id: u32) -> Option<HotkeyAction> {
    registered
        .iter()
        .find(|(hotkey, _)| hotkey.id() == id)
        .map(|(_, action)| *action)
}

impl Drop for HotkeyManager {
    fn drop(&mut self) {
        for (hotkey, _) in self.registered.drain(..) {
            let _ = self.manager.unregister(hotkey);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_function_keys() {
        assert_eq!(parse_hotkey("F12").unwrap(), HotKey::new(Some(Modifiers::empty()), Code::F12));
        assert_eq!(parse_hotkey("f1").unwrap(), HotKey::new(Some(Modifiers::empty()), Code::F1));
        assert!(parse_hotkey("F0").is_err());
        assert!(parse_hotkey("F13").is_err());
    }

    #[test]
    fn test_parse_with_modifiers() {
        assert_eq!(
            parse_hotkey("Ctrl+Shift+R").unwrap(),
            HotKey::new(Some(Modifiers::CONTROL | Modifiers::SHIFT), Code::KeyR)
        );
        assert_eq!(
            parse_hotkey("ctrl + f11").unwrap(),
            HotKey::new(Some(Modifiers::CONTROL), Code::F11)
        );
        assert_eq!(parse_hotkey("Alt+7").unwrap(), HotKey::new(Some(Modifiers::ALT), Code::Digit7));
    }

    #[test]
    fn test_single_letter_f_is_a_letter() {
        assert_eq!(parse_hotkey("Super+F").unwrap(), HotKey::new(Some(Modifiers::SUPER), Code::KeyF));
    }

    #[test]
    fn test_parse_named_keys() {
        assert_eq!(parse_hotkey("Esc").unwrap(), HotKey::new(Some(Modifiers::empty()), Code::Escape));
        assert_eq!(
            parse_hotkey("Shift+PrintScreen").unwrap(),
            HotKey::new(Some(Modifiers::SHIFT), Code::PrintScreen)
        );
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(parse_hotkey("").is_err());
        assert!(parse_hotkey("InvalidKey").is_err());
        assert!(parse_hotkey("Ctrl+Shift").is_err());
        assert!(parse_hotkey("A+B").is_err());
    }

    #[test]
    fn test_default_settings_parse() {
        let settings = HotkeySettings::default();
        assert!(parse_hotkey(&settings.trigger).is_ok());
        for key in [settings.exit, settings.reload, settings.stats].into_iter().flatten() {
            assert!(parse_hotkey(&key).is_ok(), "{}", key);
        }
    }

    #[test]
    fn test_action_lookup() {
        let trigger = parse_hotkey("F12").unwrap();
        let exit = parse_hotkey("F11").unwrap();
        let reload = parse_hotkey("Ctrl+Shift+R").unwrap();
        let stats = parse_hotkey("Ctrl+Shift+S").unwrap();
        let registered = vec![
            (trigger, HotkeyAction::Trigger),
            (exit, HotkeyAction::Exit),
            (reload, HotkeyAction::Reload),
            (stats, HotkeyAction::Stats),
        ];

        assert_eq!(action_for(&registered, trigger.id()), Some(HotkeyAction::Trigger));
        assert_eq!(action_for(&registered, exit.id()), Some(HotkeyAction::Exit));
        assert_eq!(action_for(&registered, reload.id()), Some(HotkeyAction::Reload));
        assert_eq!(action_for(&registered, stats.id()), Some(HotkeyAction::Stats));
        assert_eq!(action_for(&registered, parse_hotkey("F1").unwrap().id()), None);
    }

    #[test]
    fn test_debounce_drops_quick_repeats() {
        let mut debounce = Debouncer::new(Duration::from_secs(1));
        let start = Instant::now();

        assert!(debounce.allow(start));
        assert!(!debounce.allow(start + Duration::from_millis(300)));
        assert!(!debounce.allow(start + Duration::from_millis(999)));
        assert!(debounce.allow(start + Duration::from_millis(1000)));
        // Measured from the last accepted press, not the last attempt
        assert!(!debounce.allow(start + Duration::from_millis(1500)));
        assert!(debounce.allow(start + Duration::from_millis(2000)));
    }

    #[test]
    fn test_zero_debounce_allows_everything() {
        let mut debounce = Debouncer::new(Duration::ZERO);
        let now = Instant::now();
        assert!(debounce.allow(now));
        assert!(debounce.allow(now));
    }
}
