//! Click versus double-click disambiguation.
//!
//! A double-click reaches us as two presses, so a press is held back until
//! either a second qualifying press turns it into an `open` or the window
//! passes and it is released as a plain `click`.

use std::time::{Duration, Instant};

use crate::action_schema::MouseButton;

pub const DOUBLE_CLICK_WINDOW: Duration = Duration::from_millis(500);
pub const DOUBLE_CLICK_DISTANCE: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Press {
    pub at: Instant,
    pub x: f64,
    pub y: f64,
    pub button: MouseButton,
}

impl Press {
    fn pairs_with(&self, next: &Press) -> bool {
        next.button == self.button
            && next.at.saturating_duration_since(self.at) <= DOUBLE_CLICK_WINDOW
            && (next.x - self.x).hypot(next.y - self.y) < DOUBLE_CLICK_DISTANCE
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Resolved {
    Click(Press),
    Open(Press),
    /// The press was already released as a click before its partner
    /// arrived; that click has to become an open.
    Promote(Press),
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
enum State {
    #[default]
    Idle,
    PendingClick(Press),
}

#[derive(Debug, Default)]
pub struct ClickDebouncer {
    state: State,
    /// Most recent press that has not yet paired, pending or not.
    last_press: Option<Press>,
}

impl ClickDebouncer {
    pub fn new() -> Self {
        Self::default()
    }

    /// When the pending click, if any, turns into a plain click.
    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            State::Idle => None,
            State::PendingClick(p) => Some(p.at + DOUBLE_CLICK_WINDOW),
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.state, State::PendingClick(_))
    }

    /// Feeds one press and returns what it settled. A press pairing with the
    /// previous one yields `Open` while that press is still pending, or
    /// `Promote` once it was released early. Otherwise a pending older press
    /// comes back as a `Click`.
    pub fn press(&mut self, press: Press) -> Option<Resolved> {
        if let Some(prior) = self.last_press.take().filter(|prior| prior.pairs_with(&press)) {
            return match std::mem::take(&mut self.state) {
                State::PendingClick(first) => Some(Resolved::Open(first)),
                State::Idle => Some(Resolved::Promote(prior)),
            };
        }

        self.last_press = Some(press);
        match std::mem::take(&mut self.state) {
            State::PendingClick(first) => {
                self.state = State::PendingClick(press);
                Some(Resolved::Click(first))
            }
            State::Idle => {
                self.state = State::PendingClick(press);
                None
            }
        }
    }

    /// Timer path: releases the pending click once its window is over.
    pub fn expire(&mut self, now: Instant) -> Option<Resolved> {
        match self.deadline() {
            Some(deadline) if now >= deadline => self.flush(),
            _ => None,
        }
    }

    /// Event path: a later event proves no second press came in time.
    pub fn expire_before(&mut self, event_at: Instant) -> Option<Resolved> {
        match self.deadline() {
            Some(deadline) if event_at > deadline => self.flush(),
            _ => None,
        }
    }

    pub fn flush(&mut self) -> Option<Resolved> {
        match std::mem::take(&mut self.state) {
            State::PendingClick(p) => Some(Resolved::Click(p)),
            State::Idle => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn press(base: Instant, ms: u64, x: f64, y: f64) -> Press {
        Press {
            at: base + Duration::from_millis(ms),
            x,
            y,
            button: MouseButton::Left,
        }
    }

    #[test]
    fn second_press_in_window_is_an_open() {
        let t0 = Instant::now();
        let mut d = ClickDebouncer::new();
        assert_eq!(d.press(press(t0, 0, 100.0, 100.0)), None);
        assert_eq!(d.expire_before(t0 + Duration::from_millis(500)), None);
        let resolved = d.press(press(t0, 500, 104.0, 97.0));
        assert!(matches!(resolved, Some(Resolved::Open(p)) if p.x == 100.0));
        assert!(!d.is_pending());
        assert_eq!(d.flush(), None);
    }

    #[test]
    fn slow_second_press_is_two_clicks() {
        let t0 = Instant::now();
        let mut d = ClickDebouncer::new();
        d.press(press(t0, 0, 10.0, 10.0));
        let first = d.expire_before(t0 + Duration::from_millis(600));
        assert!(matches!(first, Some(Resolved::Click(_))));
        assert_eq!(d.press(press(t0, 600, 10.0, 10.0)), None);
        assert!(matches!(d.flush(), Some(Resolved::Click(p)) if p.at == t0 + Duration::from_millis(600)));
    }

    #[test]
    fn far_or_different_button_press_does_not_pair() {
        let t0 = Instant::now();
        let mut d = ClickDebouncer::new();
        d.press(press(t0, 0, 10.0, 10.0));
        assert!(matches!(d.press(press(t0, 100, 40.0, 10.0)), Some(Resolved::Click(_))));

        let mut right = press(t0, 200, 40.0, 10.0);
        right.button = MouseButton::Right;
        assert!(matches!(d.press(right), Some(Resolved::Click(p)) if p.x == 40.0));
        assert!(d.is_pending());
    }

    #[test]
    fn pairing_uses_straight_line_distance() {
        let t0 = Instant::now();
        let mut d = ClickDebouncer::new();
        d.press(press(t0, 0, 0.0, 0.0));
        // 14 px away diagonally even though each axis moved only 10
        assert!(matches!(d.press(press(t0, 200, 10.0, 10.0)), Some(Resolved::Click(_))));

        let mut d = ClickDebouncer::new();
        d.press(press(t0, 0, 0.0, 0.0));
        assert!(matches!(d.press(press(t0, 200, 6.0, 6.0)), Some(Resolved::Open(_))));
    }

    #[test]
    fn partner_of_an_early_released_press_promotes_it() {
        let t0 = Instant::now();
        let mut d = ClickDebouncer::new();
        d.press(press(t0, 0, 50.0, 50.0));
        // some other recorded event forced the click out
        assert!(matches!(d.flush(), Some(Resolved::Click(_))));

        let resolved = d.press(press(t0, 200, 50.0, 50.0));
        assert!(matches!(resolved, Some(Resolved::Promote(p)) if p.at == t0));
        assert!(!d.is_pending());

        // a third press starts over
        assert_eq!(d.press(press(t0, 300, 50.0, 50.0)), None);
        assert!(d.is_pending());
    }

    #[test]
    fn timer_releases_click_at_deadline() {
        let t0 = Instant::now();
        let mut d = ClickDebouncer::new();
        d.press(press(t0, 0, 1.0, 1.0));
        assert_eq!(d.deadline(), Some(t0 + DOUBLE_CLICK_WINDOW));
        assert_eq!(d.expire(t0 + Duration::from_millis(499)), None);
        assert!(matches!(d.expire(t0 + DOUBLE_CLICK_WINDOW), Some(Resolved::Click(_))));
        assert_eq!(d.deadline(), None);
    }
}
