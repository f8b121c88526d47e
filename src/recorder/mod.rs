//! Turns live mouse and keyboard input into the action schema, and plays
//! recorded actions back.

pub mod debounce;
pub mod replay;

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::action_schema::{Action, ActionKind, MouseButton, ParamSet, ScrollDirection};
use debounce::{ClickDebouncer, Press, Resolved};

pub use replay::{ReplayReport, Replayer};

const MOVE_THRESHOLD: f64 = 10.0;
const MOVE_INTERVAL: Duration = Duration::from_millis(100);
const DELAY_THRESHOLD: Duration = Duration::from_millis(100);

/// Monotonic time source. Swappable so tests can drive the debounce timer.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Key {
    /// A printable character, already shifted by the OS.
    Char(char),
    Enter,
    Backspace,
    /// `ctrl`, `alt`, `shift`, `cmd`.
    Modifier(String),
    /// Any other named key (`tab`, `esc`, `up`, `f5`, ...).
    Named(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum InputEvent {
    Press { x: f64, y: f64, button: MouseButton },
    Move { x: f64, y: f64 },
    Scroll { x: f64, y: f64, direction: ScrollDirection },
    Key(Key),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecorderEvent {
    pub at: Instant,
    pub input: InputEvent,
}

impl RecorderEvent {
    pub fn new(at: Instant, input: InputEvent) -> Self {
        Self { at, input }
    }
}

fn point(x: f64, y: f64) -> ParamSet {
    ParamSet {
        x: Some(x),
        y: Some(y),
        ..ParamSet::default()
    }
}

fn open_at(p: &Press) -> (String, ParamSet) {
    let params = ParamSet {
        button_type: Some(p.button),
        ..point(p.x, p.y)
    };
    (format!("open at ({}, {})", p.x.round(), p.y.round()), params)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Mutable state of one recording. Only the recorder's consumer thread
/// touches it.
#[derive(Default)]
pub struct RecordingSession {
    actions: Vec<Action>,
    last_action_time: Option<Instant>,
    clicks: ClickDebouncer,
    text: String,
    text_at: Option<Instant>,
    modifiers: Vec<String>,
    last_move: Option<(Instant, f64, f64)>,
    /// Index of the most recently recorded `click`.
    last_click: Option<usize>,
}

impl RecordingSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// When the debounce timer should fire next.
    pub fn deadline(&self) -> Option<Instant> {
        self.clicks.deadline()
    }

    pub fn handle(&mut self, event: RecorderEvent) {
        let at = event.at;
        if let Some(resolved) = self.clicks.expire_before(at) {
            self.emit_click(resolved);
        }

        match event.input {
            InputEvent::Press { x, y, button } => {
                self.flush_keyboard(at);
                self.modifiers.clear();
                if let Some(resolved) = self.clicks.press(Press { at, x, y, button }) {
                    self.emit_click(resolved);
                }
            }
            InputEvent::Move { x, y } => self.record_move(at, x, y),
            InputEvent::Scroll { x, y, direction } => {
                self.flush_keyboard(at);
                let params = ParamSet {
                    direction: Some(direction),
                    ..point(x, y)
                };
                self.push(at, ActionKind::Scroll, format!("scroll {}", direction.as_str()), params);
            }
            InputEvent::Key(key) => self.handle_key(at, key),
        }
    }

    /// Debounce timer callback.
    pub fn tick(&mut self, now: Instant) {
        if let Some(resolved) = self.clicks.expire(now) {
            self.emit_click(resolved);
        }
    }

    /// Flushes everything still pending and closes the recording with `finish`.
    pub fn finish(mut self, now: Instant) -> Vec<Action> {
        if let Some(resolved) = self.clicks.flush() {
            self.emit_click(resolved);
        }
        self.flush_keyboard(now);
        self.flush_modifiers(now);
        self.actions.push(Action::finish());
        self.actions
    }

    fn handle_key(&mut self, at: Instant, key: Key) {
        match key {
            Key::Char(c) => {
                // shift alone just produces the shifted character
                let has_chord = self.modifiers.iter().any(|m| m != "shift");
                if !has_chord {
                    self.modifiers.clear();
                    self.text.push(c);
                    self.text_at = Some(at);
                } else {
                    self.chord(at, c.to_lowercase().to_string());
                }
            }
            Key::Backspace if !self.text.is_empty() => {
                self.text.pop();
            }
            Key::Backspace => self.chord(at, "backspace".to_string()),
            Key::Modifier(name) => {
                if !self.modifiers.contains(&name) {
                    self.modifiers.push(name);
                }
            }
            Key::Named(name) => self.chord(at, name),
            Key::Enter => {
                if self.text.is_empty() && self.modifiers.is_empty() {
                    self.push(at, ActionKind::PressEnter, "press enter", ParamSet::default());
                } else {
                    self.flush_keyboard(at);
                    self.flush_modifiers(at);
                }
            }
        }
    }

    /// Completes a key combination: held modifiers plus `key`.
    fn chord(&mut self, at: Instant, key: String) {
        self.flush_keyboard(at);
        let mut keys = std::mem::take(&mut self.modifiers);
        keys.push(key);
        self.push_hotkey(at, keys);
    }

    fn push_hotkey(&mut self, at: Instant, keys: Vec<String>) {
        let target = format!("hotkey {}", keys.join("+"));
        let params = ParamSet {
            key_sequence: Some(keys),
            ..ParamSet::default()
        };
        self.push(at, ActionKind::Hotkey, target, params);
    }

    fn flush_keyboard(&mut self, at: Instant) {
        if self.text.is_empty() {
            return;
        }
        let text = std::mem::take(&mut self.text);
        let at = self.text_at.take().unwrap_or(at);
        let params = ParamSet {
            text_content: Some(text),
            ..ParamSet::default()
        };
        self.push(at, ActionKind::Input, "type text", params);
    }

    fn flush_modifiers(&mut self, at: Instant) {
        if !self.modifiers.is_empty() {
            let keys = std::mem::take(&mut self.modifiers);
            self.push_hotkey(at, keys);
        }
    }

    fn record_move(&mut self, at: Instant, x: f64, y: f64) {
        if let Some((last_at, last_x, last_y)) = self.last_move {
            let far = (x - last_x).abs() > MOVE_THRESHOLD || (y - last_y).abs() > MOVE_THRESHOLD;
            if !far || at.saturating_duration_since(last_at) < MOVE_INTERVAL {
                return;
            }
        }
        self.last_move = Some((at, x, y));
        let target = format!("move to ({}, {})", x.round(), y.round());
        self.push(at, ActionKind::Move, target, point(x, y));
    }

    fn emit_click(&mut self, resolved: Resolved) {
        match resolved {
            Resolved::Click(p) => {
                let params = ParamSet {
                    button_type: Some(p.button),
                    clicks: Some(1),
                    ..point(p.x, p.y)
                };
                let target = format!("click at ({}, {})", p.x.round(), p.y.round());
                self.append(p.at, ActionKind::Click, target, params);
                self.last_click = Some(self.actions.len() - 1);
            }
            Resolved::Open(p) => {
                let (target, params) = open_at(&p);
                self.append(p.at, ActionKind::Open, target, params);
            }
            Resolved::Promote(p) => {
                let recorded = self
                    .last_click
                    .take()
                    .and_then(|index| self.actions.get_mut(index))
                    .filter(|a| a.action == ActionKind::Click && a.params.point() == Some((p.x, p.y)));
                match recorded {
                    Some(action) => {
                        let (target, params) = open_at(&p);
                        *action = Action::new(ActionKind::Open, target, params);
                        debug!("Recorded click promoted to {}", action.target);
                    }
                    None => {
                        let (target, params) = open_at(&p);
                        self.append(p.at, ActionKind::Open, target, params);
                    }
                }
            }
        }
    }

    /// Appends after releasing any pending click, so actions stay in event order.
    fn push(&mut self, at: Instant, kind: ActionKind, target: impl Into<String>, params: ParamSet) {
        if let Some(resolved) = self.clicks.flush() {
            self.emit_click(resolved);
        }
        self.append(at, kind, target.into(), params);
    }

    fn append(&mut self, at: Instant, kind: ActionKind, target: String, params: ParamSet) {
        if let Some(last) = self.last_action_time {
            let gap = at.saturating_duration_since(last);
            if gap > DELAY_THRESHOLD {
                let params = ParamSet {
                    seconds: Some(round2(gap.as_secs_f64())),
                    ..ParamSet::default()
                };
                self.actions.push(Action::new(ActionKind::Delay, "wait", params));
            }
        }
        debug!("Recorded {} ({})", kind, target);
        self.actions.push(Action::new(kind, target, params));
        self.last_action_time = Some(at.max(self.last_action_time.unwrap_or(at)));
    }
}

enum Command {
    Event(RecorderEvent),
    Stop,
}

/// Cloneable handle the platform listener pushes raw events through.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<Command>,
}

impl EventSink {
    /// `false` once the recorder has stopped.
    pub fn send(&self, event: RecorderEvent) -> bool {
        self.tx.send(Command::Event(event)).is_ok()
    }
}

/// Runs a [`RecordingSession`] on its own consumer thread. Events arrive over
/// a channel; the receive timeout doubles as the debounce timer.
pub struct ActionRecorder {
    tx: mpsc::Sender<Command>,
    worker: JoinHandle<Vec<Action>>,
}

impl ActionRecorder {
    pub fn start(clock: Arc<dyn Clock>) -> (Self, EventSink) {
        let (tx, rx) = mpsc::channel::<Command>();
        info!("Recorder started");

        let worker = thread::spawn(move || {
            let mut session = RecordingSession::new();
            loop {
                let received = match session.deadline() {
                    Some(deadline) => rx.recv_timeout(deadline.saturating_duration_since(clock.now())),
                    None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
                };
                match received {
                    Ok(Command::Event(event)) => session.handle(event),
                    Err(RecvTimeoutError::Timeout) => session.tick(clock.now()),
                    Ok(Command::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            session.finish(clock.now())
        });

        let sink = EventSink { tx: tx.clone() };
        (Self { tx, worker }, sink)
    }

    /// Stops the consumer and returns the finalized actions. Events queued
    /// before the stop are still processed.
    pub fn stop(self) -> Vec<Action> {
        if self.tx.send(Command::Stop).is_err() {
            warn!("Recorder thread already gone");
        }
        match self.worker.join() {
            Ok(actions) => {
                info!("Recorder stopped with {} action(s)", actions.len());
                actions
            }
            Err(_) => {
                warn!("Recorder thread panicked; recording lost");
                vec![Action::finish()]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ManualClock;

    fn press(at: Instant, x: f64, y: f64) -> RecorderEvent {
        RecorderEvent::new(at, InputEvent::Press { x, y, button: MouseButton::Left })
    }

    fn key(at: Instant, key: Key) -> RecorderEvent {
        RecorderEvent::new(at, InputEvent::Key(key))
    }

    fn kinds(actions: &[Action]) -> Vec<ActionKind> {
        actions.iter().map(|a| a.action).collect()
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn double_press_within_half_second_is_one_open() {
        let t0 = Instant::now();
        let mut session = RecordingSession::new();
        session.handle(press(t0, 200.0, 300.0));
        session.handle(press(t0 + ms(500), 200.0, 300.0));
        let actions = session.finish(t0 + ms(600));

        assert_eq!(kinds(&actions), vec![ActionKind::Open, ActionKind::Finish]);
        assert_eq!(actions[0].params.point(), Some((200.0, 300.0)));
        assert_eq!(actions[0].id, Action::NO_ELEMENT);
        assert_eq!(actions[0].target, "open at (200, 300)");
    }

    #[test]
    fn presses_six_tenths_apart_are_two_clicks() {
        let t0 = Instant::now();
        let mut session = RecordingSession::new();
        session.handle(press(t0, 200.0, 300.0));
        session.handle(press(t0 + ms(600), 200.0, 300.0));
        let actions = session.finish(t0 + ms(700));

        assert_eq!(
            kinds(&actions),
            vec![ActionKind::Click, ActionKind::Delay, ActionKind::Click, ActionKind::Finish]
        );
        assert_eq!(actions[1].params.seconds, Some(0.6));
        assert_eq!(actions[0].params.clicks, Some(1));
    }

    #[test]
    fn typing_then_enter_is_one_input() {
        let t0 = Instant::now();
        let mut session = RecordingSession::new();
        for (i, c) in "hi!".chars().enumerate() {
            session.handle(key(t0 + ms(i as u64 * 50), Key::Char(c)));
        }
        session.handle(key(t0 + ms(150), Key::Enter));
        session.handle(key(t0 + ms(190), Key::Enter));
        let actions = session.finish(t0 + ms(300));

        assert_eq!(
            kinds(&actions),
            vec![ActionKind::Input, ActionKind::PressEnter, ActionKind::Finish]
        );
        assert_eq!(actions[0].params.text_content.as_deref(), Some("hi!"));
        assert_eq!(actions[1].target, "press enter");
    }

    #[test]
    fn modifier_chords_become_hotkeys() {
        let t0 = Instant::now();
        let mut session = RecordingSession::new();
        session.handle(key(t0, Key::Char('a')));
        session.handle(key(t0 + ms(10), Key::Modifier("cmd".into())));
        session.handle(key(t0 + ms(20), Key::Char('S')));
        session.handle(key(t0 + ms(30), Key::Modifier("shift".into())));
        session.handle(key(t0 + ms(40), Key::Char('B')));
        session.handle(key(t0 + ms(50), Key::Named("tab".into())));
        let actions = session.finish(t0 + ms(60));

        assert_eq!(
            kinds(&actions),
            vec![
                ActionKind::Input,
                ActionKind::Hotkey,
                ActionKind::Input,
                ActionKind::Hotkey,
                ActionKind::Finish
            ]
        );
        assert_eq!(actions[1].params.key_sequence, Some(vec!["cmd".to_string(), "s".to_string()]));
        assert_eq!(actions[1].target, "hotkey cmd+s");
        assert_eq!(actions[2].params.text_content.as_deref(), Some("B"));
        assert_eq!(actions[3].params.key_sequence, Some(vec!["tab".to_string()]));
    }

    #[test]
    fn enter_flushes_dangling_modifiers() {
        let t0 = Instant::now();
        let mut session = RecordingSession::new();
        session.handle(key(t0, Key::Modifier("ctrl".into())));
        session.handle(key(t0 + ms(10), Key::Enter));
        let actions = session.finish(t0 + ms(20));
        assert_eq!(kinds(&actions), vec![ActionKind::Hotkey, ActionKind::Finish]);
        assert_eq!(actions[0].params.key_sequence, Some(vec!["ctrl".to_string()]));
    }

    #[test]
    fn pending_click_precedes_later_actions() {
        let t0 = Instant::now();
        let mut session = RecordingSession::new();
        session.handle(press(t0, 10.0, 10.0));
        session.handle(RecorderEvent::new(
            t0 + ms(50),
            InputEvent::Scroll { x: 10.0, y: 10.0, direction: ScrollDirection::Down },
        ));
        let actions = session.finish(t0 + ms(60));
        assert_eq!(
            kinds(&actions),
            vec![ActionKind::Click, ActionKind::Scroll, ActionKind::Finish]
        );
        assert_eq!(actions[1].target, "scroll down");
    }

    #[test]
    fn diagonal_presses_fourteen_pixels_apart_stay_clicks() {
        let t0 = Instant::now();
        let mut session = RecordingSession::new();
        session.handle(press(t0, 0.0, 0.0));
        session.handle(press(t0 + ms(200), 10.0, 10.0));
        let actions = session.finish(t0 + ms(300));

        assert_eq!(
            kinds(&actions),
            vec![ActionKind::Click, ActionKind::Delay, ActionKind::Click, ActionKind::Finish]
        );
    }

    #[test]
    fn double_click_around_a_scroll_is_still_one_open() {
        let t0 = Instant::now();
        let mut session = RecordingSession::new();
        session.handle(press(t0, 30.0, 40.0));
        session.handle(RecorderEvent::new(
            t0 + ms(50),
            InputEvent::Scroll { x: 30.0, y: 40.0, direction: ScrollDirection::Up },
        ));
        session.handle(press(t0 + ms(200), 30.0, 40.0));
        let actions = session.finish(t0 + ms(300));

        assert_eq!(
            kinds(&actions),
            vec![ActionKind::Open, ActionKind::Scroll, ActionKind::Finish]
        );
        assert_eq!(actions[0].target, "open at (30, 40)");
        assert_eq!(actions[0].params.point(), Some((30.0, 40.0)));
        assert_eq!(actions[0].params.clicks, None);
    }

    #[test]
    fn small_or_rapid_moves_are_dropped() {
        let t0 = Instant::now();
        let mut session = RecordingSession::new();
        let mv = |at, x, y| RecorderEvent::new(at, InputEvent::Move { x, y });
        session.handle(mv(t0, 0.0, 0.0));
        session.handle(mv(t0 + ms(50), 5.0, 5.0));
        session.handle(mv(t0 + ms(60), 50.0, 50.0));
        session.handle(mv(t0 + ms(260), 50.0, 70.0));
        let actions = session.finish(t0 + ms(300));

        let moves: Vec<_> = actions
            .iter()
            .filter(|a| a.action == ActionKind::Move)
            .map(|a| a.params.point())
            .collect();
        assert_eq!(moves, vec![Some((0.0, 0.0)), Some((50.0, 70.0))]);
    }

    #[test]
    fn recorder_thread_flushes_click_on_timer() {
        let clock = Arc::new(ManualClock::new());
        let (recorder, sink) = ActionRecorder::start(clock.clone());

        let t0 = clock.now();
        assert!(sink.send(press(t0, 1.0, 2.0)));
        // move the virtual clock past the window; the worker wakes on its
        // real-time timeout, sees the manual deadline has passed, and flushes
        clock.advance(ms(600));
        std::thread::sleep(ms(700));
        assert!(sink.send(key(clock.now(), Key::Enter)));

        let actions = recorder.stop();
        assert_eq!(
            kinds(&actions),
            vec![ActionKind::Click, ActionKind::Delay, ActionKind::PressEnter, ActionKind::Finish]
        );
        assert!(!sink.send(press(clock.now(), 0.0, 0.0)));
    }
}
