//! Timed key sequences and tap-dance.
//!
//! A sequence advances one step per matching press, with each inter-step gap
//! checked against that step's (min, max) timing window. Two action shapes
//! exist: one terminal action fired on completion, or one action per step
//! fired progressively — a step's action is scheduled to fire after its
//! window closes so a later accepted step can still cancel it (tap-dance).
//!
//! Timestamps are device time units as carried by key events; the key
//! machine owns the scheduled callbacks.

use crate::key_machine::Action;

/// Actions attached to a sequence
pub enum SequenceActions {
    /// One action fired when the last step is accepted
    OnComplete(Action),
    /// One action per step; intermediate steps fire after their window
    /// closes unless a later step cancels them, the final step fires
    /// immediately. Must have as many entries as the sequence has keys.
    PerStep(Vec<Action>),
}

/// A sequence definition: keys, inter-step windows, actions.
///
/// `windows[i]` constrains the gap between accepting step `i` and step
/// `i + 1`, so `windows.len() == keys.len() - 1`.
pub struct SequenceDef {
    pub keys: Vec<String>,
    pub windows: Vec<(u32, u32)>,
    pub actions: SequenceActions,
}

impl SequenceDef {
    pub fn new(keys: &[&str], windows: Vec<(u32, u32)>, actions: SequenceActions) -> Self {
        Self {
            keys: keys.iter().map(|k| k.to_string()).collect(),
            windows,
            actions,
        }
    }

    fn step_action(&self, step: usize) -> Option<Action> {
        match &self.actions {
            SequenceActions::PerStep(actions) => actions.get(step).cloned(),
            SequenceActions::OnComplete(_) => None,
        }
    }

    fn terminal_action(&self) -> Option<Action> {
        match &self.actions {
            SequenceActions::OnComplete(action) => Some(action.clone()),
            SequenceActions::PerStep(actions) => actions.last().cloned(),
        }
    }
}

/// Mutable progress of one sequence
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SequenceState {
    /// Next step index to accept
    pub step: usize,
    /// Timestamp of the last accepted step
    pub last_time: u32,
}

impl SequenceState {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// What one press did to one sequence
pub enum StepOutcome {
    /// The pressed key is not this sequence's current step
    NotThisKey,
    /// Right key, wrong timing; progress unchanged
    WindowMissed,
    /// A non-final step was accepted. `schedule` carries the step's action
    /// and the delay (window max) after which it should fire unless
    /// cancelled by a later step.
    Advanced { schedule: Option<(Action, u32)> },
    /// The final step was accepted; fire now. State has been reset.
    Completed(Action),
}

impl SequenceDef {
    /// Feed one key press into this sequence's state machine.
    ///
    /// The caller cancels any previously scheduled step action on
    /// `Advanced` and `Completed`.
    pub fn on_press(&self, state: &mut SequenceState, key: &str, time: u32) -> StepOutcome {
        if self.keys.get(state.step).map(String::as_str) != Some(key) {
            return StepOutcome::NotThisKey;
        }
        if state.step > 0 {
            // A missing window entry leaves the gap unconstrained
            let (min, max) = self
                .windows
                .get(state.step - 1)
                .copied()
                .unwrap_or((0, u32::MAX));
            let elapsed = time.saturating_sub(state.last_time);
            if elapsed < min || elapsed > max {
                return StepOutcome::WindowMissed;
            }
        }
        let accepted = state.step;
        state.step += 1;
        state.last_time = time;

        if state.step == self.keys.len() {
            state.reset();
            match self.terminal_action() {
                Some(action) => StepOutcome::Completed(action),
                None => StepOutcome::Advanced { schedule: None },
            }
        } else {
            let window_max = self.windows.get(accepted).map_or(u32::MAX, |w| w.1);
            let schedule = self
                .step_action(accepted)
                .map(|action| (action, window_max));
            StepOutcome::Advanced { schedule }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting() -> (Action, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        (Arc::new(move || drop(c.fetch_add(1, Ordering::SeqCst))), count)
    }

    #[test]
    fn three_steps_in_window_complete() {
        let (action, fired) = counting();
        let seq = SequenceDef::new(
            &["1", "2", "3"],
            vec![(0, 300), (0, 300)],
            SequenceActions::OnComplete(action),
        );
        let mut state = SequenceState::default();

        assert!(matches!(
            seq.on_press(&mut state, "1", 1000),
            StepOutcome::Advanced { schedule: None }
        ));
        assert!(matches!(
            seq.on_press(&mut state, "2", 1200),
            StepOutcome::Advanced { schedule: None }
        ));
        match seq.on_press(&mut state, "3", 1400) {
            StepOutcome::Completed(action) => action(),
            _ => panic!("final step should complete"),
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(state, SequenceState::default(), "state resets on completion");
    }

    #[test]
    fn late_step_misses_the_window() {
        let (action, fired) = counting();
        let seq = SequenceDef::new(
            &["1", "2"],
            vec![(0, 300)],
            SequenceActions::OnComplete(action),
        );
        let mut state = SequenceState::default();
        seq.on_press(&mut state, "1", 1000);
        assert!(matches!(
            seq.on_press(&mut state, "2", 1400),
            StepOutcome::WindowMissed
        ));
        assert_eq!(state.step, 1, "a missed window does not advance by itself");
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn too_early_step_misses_a_min_window() {
        let (action, _) = counting();
        let seq = SequenceDef::new(
            &["a", "a"],
            vec![(100, 300)],
            SequenceActions::OnComplete(action),
        );
        let mut state = SequenceState::default();
        seq.on_press(&mut state, "a", 1000);
        assert!(matches!(
            seq.on_press(&mut state, "a", 1050),
            StepOutcome::WindowMissed
        ));
    }

    #[test]
    fn per_step_actions_are_scheduled_with_window_max() {
        let (a1, _) = counting();
        let (a2, _) = counting();
        let seq = SequenceDef::new(
            &["x", "x"],
            vec![(0, 300)],
            SequenceActions::PerStep(vec![a1, a2]),
        );
        let mut state = SequenceState::default();
        match seq.on_press(&mut state, "x", 1000) {
            StepOutcome::Advanced {
                schedule: Some((_, delay)),
            } => assert_eq!(delay, 300),
            _ => panic!("first tap schedules its step action"),
        }
        assert!(matches!(
            seq.on_press(&mut state, "x", 1100),
            StepOutcome::Completed(_)
        ));
    }
}
