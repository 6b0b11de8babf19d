use std::fmt;
use std::time::{Duration, Instant};

use crate::timing::remaining_dwell;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopState {
    /// The image list is empty.
    #[default]
    Idle,
    /// Dwell timer running.
    Waiting,
    Rendering,
    AwaitingRefresh,
    /// Device is in low-power mode until the next image is due.
    Sleeping,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LoopState::Idle => "idle",
            LoopState::Waiting => "waiting",
            LoopState::Rendering => "rendering",
            LoopState::AwaitingRefresh => "awaiting-refresh",
            LoopState::Sleeping => "sleeping",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub from: LoopState,
    pub to: LoopState,
}

/// Position in the list and display bookkeeping. Owned by the loop alone.
#[derive(Debug, Clone, Default)]
pub struct DisplayState {
    current_index: usize,
    last_display: Option<Instant>,
    device_asleep: bool,
}

impl DisplayState {
    pub fn current_index(&self) -> usize {
        self.current_index
    }

    pub fn last_display(&self) -> Option<Instant> {
        self.last_display
    }

    pub fn device_asleep(&self) -> bool {
        self.device_asleep
    }

    pub fn set_device_asleep(&mut self, asleep: bool) {
        self.device_asleep = asleep;
    }

    /// Keeps the index inside a list of `len` entries. Returns `true` if it was reset.
    pub fn on_snapshot(&mut self, len: usize) -> bool {
        if self.current_index >= len && self.current_index != 0 {
            self.current_index = 0;
            return true;
        }
        false
    }

    /// Moves to the next entry of a list of `len`, wrapping to the first.
    pub fn advance(&mut self, len: usize) {
        let next = self.current_index + 1;
        self.current_index = if next < len { next } else { 0 };
    }

    /// Records a successful refresh. Never moves backwards.
    pub fn mark_displayed(&mut self, at: Instant) {
        self.last_display = Some(match self.last_display {
            Some(previous) if previous > at => previous,
            _ => at,
        });
    }

    /// Time left before the next image is due; zero before the first display.
    pub fn remaining_dwell(&self, dwell: Duration, now: Instant) -> Duration {
        remaining_dwell(self.last_display, dwell, now)
    }
}

#[derive(Debug, Default)]
pub struct SlideshowSM {
    state: LoopState,
}

impl SlideshowSM {

    pub fn current(&self) -> LoopState {
        self.state
    }

    pub fn goto(&mut self, to: LoopState) -> Option<StateChange> {
        if self.state == to {
            return None;
        }
        let change = StateChange {
            from: self.state,
            to,
        };
        self.state = to;
        Some(change)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn n_advances_wrap_to_zero() {
        for len in 1..=5 {
            let mut state = DisplayState::default();
            for _ in 0..len {
                state.advance(len);
            }
            assert_eq!(state.current_index(), 0, "len {len}");
        }
    }

    #[test]
    fn index_resets_only_when_out_of_range() {
        let mut state = DisplayState::default();
        state.advance(5);
        state.advance(5);
        assert!(!state.on_snapshot(3));
        assert_eq!(state.current_index(), 2);
        assert!(state.on_snapshot(2));
        assert_eq!(state.current_index(), 0);
        assert!(!state.on_snapshot(0));
    }

    #[test]
    fn advance_past_a_shrunken_list_wraps_to_zero() {
        let mut state = DisplayState::default();
        state.advance(3);
        state.advance(3);
        state.advance(2);
        assert_eq!(state.current_index(), 0);
        state.advance(0);
        assert_eq!(state.current_index(), 0);
    }

    #[test]
    fn last_display_is_monotonic() {
        let mut state = DisplayState::default();
        let now = Instant::now();
        state.mark_displayed(now + Duration::from_secs(5));
        state.mark_displayed(now);
        assert_eq!(state.last_display(), Some(now + Duration::from_secs(5)));
    }

    #[test]
    fn first_image_is_due_immediately() {
        let state = DisplayState::default();
        assert!(
            state
                .remaining_dwell(Duration::from_secs(60), Instant::now())
                .is_zero()
        );
    }

    #[test]
    fn dwell_measured_from_last_display() {
        let mut state = DisplayState::default();
        let shown = Instant::now();
        state.mark_displayed(shown);
        let dwell = Duration::from_secs(10);
        assert_eq!(
            state.remaining_dwell(dwell, shown + Duration::from_secs(9)),
            Duration::from_secs(1)
        );
        assert!(state.remaining_dwell(dwell, shown + dwell).is_zero());
    }

    #[test]
    fn goto_reports_only_real_changes() {
        let mut sm = SlideshowSM::default();
        assert_eq!(sm.goto(LoopState::Idle), None);
        let change = sm.goto(LoopState::Waiting).unwrap();
        assert_eq!(change.from, LoopState::Idle);
        assert_eq!(change.to, LoopState::Waiting);
        assert_eq!(sm.current(), LoopState::Waiting);
    }
}
