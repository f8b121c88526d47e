use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Result};
use core_graphics::event::{CGEvent, CGEventTapLocation, CGEventType, CGMouseButton, EventField, ScrollEventUnit};
use core_graphics::event_source::{CGEventSource, CGEventSourceStateID};
use core_graphics::geometry::CGPoint;

use super::{keys, script};
use crate::action_schema::{MouseButton, ScrollDirection};
use crate::executor::{InputBackend, Point};

const SCROLL_LINES: i32 = 5;
const CLICK_GAP: Duration = Duration::from_millis(40);

fn event_source() -> Result<CGEventSource> {
    CGEventSource::new(CGEventSourceStateID::HIDSystemState).map_err(|_| anyhow!("Failed to create CGEventSource"))
}

fn cursor_position() -> Result<CGPoint> {
    let event = CGEvent::new(event_source()?).map_err(|_| anyhow!("Failed to read cursor position"))?;
    Ok(event.location())
}

fn button_events(button: MouseButton) -> (CGEventType, CGEventType, CGMouseButton) {
    match button {
        MouseButton::Left => (CGEventType::LeftMouseDown, CGEventType::LeftMouseUp, CGMouseButton::Left),
        MouseButton::Right => (CGEventType::RightMouseDown, CGEventType::RightMouseUp, CGMouseButton::Right),
        MouseButton::Middle => (CGEventType::OtherMouseDown, CGEventType::OtherMouseUp, CGMouseButton::Center),
    }
}

fn post_mouse(kind: CGEventType, at: CGPoint, button: CGMouseButton, click_state: i64) -> Result<()> {
    let event = CGEvent::new_mouse_event(event_source()?, kind, at, button)
        .map_err(|_| anyhow!("Failed to create mouse event"))?;
    if click_state > 0 {
        event.set_integer_value_field(EventField::MOUSE_EVENT_CLICK_STATE, click_state);
    }
    event.post(CGEventTapLocation::HID);
    Ok(())
}

/// Positions the cursor when a point is given and returns where the gesture lands.
fn aim(at: Option<Point>) -> Result<CGPoint> {
    match at {
        Some((x, y)) => {
            let point = CGPoint::new(x as f64, y as f64);
            post_mouse(CGEventType::MouseMoved, point, CGMouseButton::Left, 0)?;
            Ok(point)
        }
        None => cursor_position(),
    }
}

fn press_sequence(at: CGPoint, button: MouseButton, clicks: u32) -> Result<()> {
    let (down, up, cg_button) = button_events(button);
    for n in 1..=clicks.max(1) {
        post_mouse(down, at, cg_button, n as i64)?;
        post_mouse(up, at, cg_button, n as i64)?;
        thread::sleep(CLICK_GAP);
    }
    Ok(())
}

/// Builds the `System Events` line for one key combination.
fn chord_script(modifiers: &[&str], key: &str) -> Result<(String, Vec<String>)> {
    let using = if modifiers.is_empty() {
        String::new()
    } else {
        format!(" using {{{}}}", modifiers.join(", "))
    };

    if key.chars().count() == 1 {
        Ok((
            format!("tell application \"System Events\" to keystroke (item 1 of argv){}", using),
            vec![key.to_string()],
        ))
    } else {
        let code = keys::code_for_name(key).ok_or_else(|| anyhow!("Unknown key '{}'", key))?;
        Ok((
            format!("tell application \"System Events\" to key code {}{}", code, using),
            Vec::new(),
        ))
    }
}

/// Mouse through Quartz events, keyboard through System Events.
#[derive(Debug, Default)]
pub struct MacInput;

impl MacInput {
    pub fn new() -> Self {
        Self
    }
}

impl InputBackend for MacInput {
    fn move_to(&self, x: i32, y: i32) -> Result<()> {
        aim(Some((x, y))).map(|_| ())
    }

    fn click(&self, at: Option<Point>, button: MouseButton, clicks: u32) -> Result<()> {
        let point = aim(at)?;
        press_sequence(point, button, clicks)
    }

    fn double_click(&self, at: Option<Point>, button: MouseButton) -> Result<()> {
        let point = aim(at)?;
        press_sequence(point, button, 2)
    }

    fn scroll(&self, direction: ScrollDirection, at: Option<Point>) -> Result<()> {
        if at.is_some() {
            aim(at)?;
        }
        let (vertical, horizontal) = match direction {
            ScrollDirection::Up => (SCROLL_LINES, 0),
            ScrollDirection::Down => (-SCROLL_LINES, 0),
            ScrollDirection::Left => (0, SCROLL_LINES),
            ScrollDirection::Right => (0, -SCROLL_LINES),
        };
        let event = CGEvent::new_scroll_event(event_source()?, ScrollEventUnit::LINE, 2, vertical, horizontal, 0)
            .map_err(|_| anyhow!("Failed to create scroll event"))?;
        event.post(CGEventTapLocation::HID);
        Ok(())
    }

    /// Pastes through the clipboard so any Unicode text arrives intact.
    fn type_text(&self, text: &str) -> Result<()> {
        if text.is_empty() {
            return Ok(());
        }
        script::set_clipboard(text)?;
        script::run("tell application \"System Events\" to keystroke \"v\" using command down")?;
        Ok(())
    }

    fn hotkey(&self, keys: &[String]) -> Result<()> {
        let (modifiers, others): (Vec<&String>, Vec<&String>) =
            keys.iter().partition(|k| keys::modifier_clause(k).is_some());
        let clauses: Vec<&str> = modifiers.iter().filter_map(|m| keys::modifier_clause(m)).collect();

        if others.is_empty() {
            // a lone modifier tap
            for clause in &clauses {
                let name = clause.trim_end_matches(" down");
                script::run(&format!(
                    "tell application \"System Events\"\nkey down {}\nkey up {}\nend tell",
                    name, name
                ))?;
            }
            return Ok(());
        }

        for key in others {
            let (line, args) = chord_script(&clauses, key)?;
            let lines = ["on run argv", line.as_str(), "end run"];
            script::run_lines_with_args(&lines, &args)?;
        }
        Ok(())
    }

    fn press_enter(&self) -> Result<()> {
        script::run("tell application \"System Events\" to key code 36")?;
        Ok(())
    }

    fn clear_field(&self) -> Result<()> {
        self.hotkey(&["cmd".to_string(), "a".to_string()])?;
        self.hotkey(&["backspace".to_string()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chord_scripts() {
        let (line, args) = chord_script(&["command down"], "c").unwrap();
        assert_eq!(
            line,
            "tell application \"System Events\" to keystroke (item 1 of argv) using {command down}"
        );
        assert_eq!(args, vec!["c".to_string()]);

        let (line, args) = chord_script(&[], "esc").unwrap();
        assert_eq!(line, "tell application \"System Events\" to key code 53");
        assert!(args.is_empty());

        assert!(chord_script(&[], "hyper").is_err());
    }
}
