use std::thread;
use std::time::Instant;

use core_foundation::runloop::{kCFRunLoopCommonModes, CFRunLoop};
use core_graphics::event::{
    CGEvent, CGEventFlags, CGEventTap, CGEventTapLocation, CGEventTapOptions, CGEventTapPlacement, CGEventType,
};
use log::{error, info, warn};

use super::keys;
use crate::action_schema::{MouseButton, ScrollDirection};
use crate::recorder::{EventSink, InputEvent, Key, RecorderEvent};

// kCGKeyboardEventKeycode, kCGScrollWheelEventDeltaAxis1/2
const KEYCODE_FIELD: u32 = 9;
const SCROLL_AXIS_1_FIELD: u32 = 11;
const SCROLL_AXIS_2_FIELD: u32 = 12;

const MODIFIER_FLAGS: [(CGEventFlags, &str); 4] = [
    (CGEventFlags::CGEventFlagCommand, "cmd"),
    (CGEventFlags::CGEventFlagControl, "ctrl"),
    (CGEventFlags::CGEventFlagAlternate, "alt"),
    (CGEventFlags::CGEventFlagShift, "shift"),
];

/// Listens to global input on a dedicated run-loop thread and forwards it to
/// the recorder. The tap winds down on the first event after the recorder
/// has stopped.
pub fn start_event_tap(sink: EventSink) -> anyhow::Result<()> {
    info!("Starting native event tap");

    thread::spawn(move || {
        let events = vec![
            CGEventType::KeyDown,
            CGEventType::LeftMouseDown,
            CGEventType::RightMouseDown,
            CGEventType::OtherMouseDown,
            CGEventType::MouseMoved,
            CGEventType::ScrollWheel,
        ];

        let tap_result = CGEventTap::new(
            CGEventTapLocation::HID,
            CGEventTapPlacement::HeadInsertEventTap,
            CGEventTapOptions::ListenOnly,
            events,
            move |_proxy, type_, event| {
                let at = Instant::now();
                for input in translate(type_, event) {
                    if !sink.send(RecorderEvent::new(at, input)) {
                        CFRunLoop::get_current().stop();
                        break;
                    }
                }
                Some(event.to_owned())
            },
        );

        match tap_result {
            Ok(tap) => match tap.mach_port.create_runloop_source(0) {
                Ok(source) => {
                    let current_loop = CFRunLoop::get_current();
                    current_loop.add_source(&source, unsafe { kCFRunLoopCommonModes });

                    info!("Event tap loop running");
                    unsafe {
                        CFRunLoopRun();
                    }
                    info!("Event tap loop stopped");
                }
                Err(_) => error!("Failed to create run loop source. Accessibility access might be missing."),
            },
            Err(e) => error!("Failed to create CGEventTap: {:?}", e),
        }
    });

    Ok(())
}

#[link(name = "CoreFoundation", kind = "framework")]
extern "C" {
    fn CFRunLoopRun();
}

fn translate(type_: CGEventType, event: &CGEvent) -> Vec<InputEvent> {
    match type_ {
        CGEventType::KeyDown => translate_key(event),
        CGEventType::LeftMouseDown | CGEventType::RightMouseDown | CGEventType::OtherMouseDown => {
            let button = match type_ {
                CGEventType::LeftMouseDown => MouseButton::Left,
                CGEventType::RightMouseDown => MouseButton::Right,
                _ => MouseButton::Middle,
            };
            let loc = event.location();
            vec![InputEvent::Press {
                x: loc.x,
                y: loc.y,
                button,
            }]
        }
        CGEventType::MouseMoved => {
            let loc = event.location();
            vec![InputEvent::Move { x: loc.x, y: loc.y }]
        }
        CGEventType::ScrollWheel => {
            let dy = event.get_integer_value_field(SCROLL_AXIS_1_FIELD);
            let dx = event.get_integer_value_field(SCROLL_AXIS_2_FIELD);
            let direction = match (dy.signum(), dx.signum()) {
                (1, _) => ScrollDirection::Up,
                (-1, _) => ScrollDirection::Down,
                (_, 1) => ScrollDirection::Left,
                (_, -1) => ScrollDirection::Right,
                _ => return Vec::new(),
            };
            let loc = event.location();
            vec![InputEvent::Scroll {
                x: loc.x,
                y: loc.y,
                direction,
            }]
        }
        _ => Vec::new(),
    }
}

fn translate_key(event: &CGEvent) -> Vec<InputEvent> {
    let code = event.get_integer_value_field(KEYCODE_FIELD);
    let flags = event.get_flags();
    let shifted = flags.contains(CGEventFlags::CGEventFlagShift);

    let key = match code {
        36 | 76 => Key::Enter,
        51 => Key::Backspace,
        _ => match keys::char_for_code(code, shifted) {
            Some(c) => Key::Char(c),
            None => match keys::name_for_code(code) {
                Some(name) => Key::Named(name.to_string()),
                None => {
                    warn!("Ignoring unmapped key code {}", code);
                    return Vec::new();
                }
            },
        },
    };

    // shift is already folded into the character, and shift+enter is still enter
    let keep_shift = !matches!(key, Key::Char(_) | Key::Enter);
    let mut inputs: Vec<InputEvent> = MODIFIER_FLAGS
        .iter()
        .filter(|(flag, name)| flags.contains(*flag) && (keep_shift || *name != "shift"))
        .map(|(_, name)| InputEvent::Key(Key::Modifier(name.to_string())))
        .collect();
    inputs.push(InputEvent::Key(key));
    inputs
}
