//! Keyboard input state machine.
//!
//! Consumes raw key events published by the device, maps them through the
//! model's layout table and classifies each press as Morse input, a chorded
//! combo trigger, a sequence step, or an ordinary key, then synthesizes
//! presses and releases into an [`InputSink`]. Runs as one actor task so
//! the held-key set and sequence state have a single writer; timers (auto
//! repeat, tap-dance windows, Morse character gaps) are tokio sleeps that
//! message the same actor, each individually cancellable and re-armed by
//! aborting the previous one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use polykb_device::KeyEvent;

use crate::combo::{match_combo, ComboDef};
use crate::layout::{is_modifier, shift_rewrite, KeyLayout};
use crate::morse::{MorseAccumulator, MorseSymbol, CHAR_GAP};
use crate::sequence::{SequenceDef, SequenceState, StepOutcome};

/// A zero-argument action attached to a combo or sequence
pub type Action = Arc<dyn Fn() + Send + Sync>;

/// Where synthesized keystrokes go (an OS input-injection layer, a test
/// recorder). Called from the actor task only.
pub trait InputSink: Send {
    fn press(&mut self, key: &str);
    fn release(&mut self, key: &str);
    fn send_char(&mut self, c: char);
}

/// Static configuration of the machine, registered once at startup
pub struct KeyMachineConfig {
    /// The key diverted entirely to Morse handling, if any
    pub morse_key: Option<String>,
    pub combos: Vec<ComboDef>,
    pub sequences: Vec<SequenceDef>,
    /// Delay before the first auto-repeat of a held key
    pub repeat_delay: Duration,
    /// Interval between subsequent auto-repeats
    pub repeat_interval: Duration,
}

impl Default for KeyMachineConfig {
    fn default() -> Self {
        Self {
            morse_key: None,
            combos: Vec::new(),
            sequences: Vec::new(),
            repeat_delay: Duration::from_millis(400),
            repeat_interval: Duration::from_millis(60),
        }
    }
}

/// Logical timers owned by the actor. Re-arming a key aborts the previous
/// pending fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum TimerKey {
    /// Auto-repeat of the current repeat key
    Repeat,
    /// Pending per-step action of sequence `i`
    Sequence(usize),
    /// Morse character-boundary gap
    MorseGap,
}

enum Msg {
    Key(KeyEvent),
    Timer { key: TimerKey, generation: u64 },
}

/// Handle to a running key machine. Dropping it stops the actor.
pub struct KeyMachine {
    tx: mpsc::UnboundedSender<Msg>,
    task: JoinHandle<()>,
}

impl KeyMachine {
    /// Spawn the actor on the current runtime
    pub fn spawn(layout: KeyLayout, config: KeyMachineConfig, sink: Box<dyn InputSink>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = Actor::new(layout, config, sink, tx.clone());
        let task = tokio::spawn(actor.run(rx));
        Self { tx, task }
    }

    /// Feed one raw key event. Silently dropped once the machine stopped.
    pub fn handle_event(&self, event: KeyEvent) {
        let _ = self.tx.send(Msg::Key(event));
    }
}

impl Drop for KeyMachine {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct HeldKey {
    /// Press timestamp in device time units
    time: u32,
    /// The name actually synthesized (after shift rewrites), released as-is
    emitted: String,
}

struct Actor {
    layout: KeyLayout,
    config: KeyMachineConfig,
    sink: Box<dyn InputSink>,
    tx: mpsc::UnboundedSender<Msg>,
    held: HashMap<String, HeldKey>,
    repeat_key: Option<String>,
    seq_states: Vec<SequenceState>,
    /// Scheduled per-step action per sequence, fired by its timer unless a
    /// later step cancels it
    pending_steps: Vec<Option<Action>>,
    morse: MorseAccumulator,
    morse_press: Option<u32>,
    timers: HashMap<TimerKey, JoinHandle<()>>,
    generations: HashMap<TimerKey, u64>,
    next_generation: u64,
}

impl Actor {
    fn new(
        layout: KeyLayout,
        config: KeyMachineConfig,
        sink: Box<dyn InputSink>,
        tx: mpsc::UnboundedSender<Msg>,
    ) -> Self {
        let n = config.sequences.len();
        Self {
            layout,
            config,
            sink,
            tx,
            held: HashMap::new(),
            repeat_key: None,
            seq_states: vec![SequenceState::default(); n],
            pending_steps: (0..n).map(|_| None).collect(),
            morse: MorseAccumulator::default(),
            morse_press: None,
            timers: HashMap::new(),
            generations: HashMap::new(),
            next_generation: 0,
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Msg>) {
        debug!("key machine started ({} keys mapped)", self.layout.len());
        while let Some(msg) = rx.recv().await {
            match msg {
                Msg::Key(event) => self.on_event(event),
                Msg::Timer { key, generation } => {
                    // A fire from before the last re-arm is stale
                    if self.generations.get(&key) == Some(&generation) {
                        self.timers.remove(&key);
                        self.generations.remove(&key);
                        self.on_timer(key);
                    }
                }
            }
        }
        for (_, handle) in self.timers.drain() {
            handle.abort();
        }
        debug!("key machine stopped");
    }

    fn arm_timer(&mut self, key: TimerKey, delay: Duration) {
        self.next_generation += 1;
        let generation = self.next_generation;
        if let Some(old) = self.timers.remove(&key) {
            old.abort();
        }
        self.generations.insert(key, generation);
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Msg::Timer { key, generation });
        });
        self.timers.insert(key, handle);
    }

    fn cancel_timer(&mut self, key: TimerKey) {
        if let Some(handle) = self.timers.remove(&key) {
            handle.abort();
        }
        self.generations.remove(&key);
    }

    fn on_event(&mut self, event: KeyEvent) {
        let Some(name) = self.layout.name(event.row, event.col).map(str::to_string) else {
            warn!("event at unmapped position ({}, {})", event.row, event.col);
            return;
        };
        trace!(
            "{} {} at {}",
            name,
            if event.pressed { "down" } else { "up" },
            event.time
        );
        if event.pressed {
            self.on_press(&name, event.time);
        } else {
            self.on_release(&name, event.time);
        }
    }

    fn on_press(&mut self, name: &str, time: u32) {
        if self.config.morse_key.as_deref() == Some(name) {
            // A press before the gap timer fires keeps the character open
            self.cancel_timer(TimerKey::MorseGap);
            self.morse_press = Some(time);
            return;
        }

        // Synthesize held modifiers plus the key, with shift pairs renamed
        let modifiers: Vec<String> = self
            .held
            .keys()
            .filter(|k| is_modifier(k))
            .cloned()
            .collect();
        let shift_held = modifiers.iter().any(|m| m.contains("shift"));
        let emitted = if shift_held {
            shift_rewrite(name).unwrap_or(name).to_string()
        } else {
            name.to_string()
        };
        for modifier in &modifiers {
            self.sink.press(modifier);
        }
        self.sink.press(&emitted);

        if let Some(combo) = match_combo(&self.config.combos, name, &self.held) {
            debug!("combo {:?} fired", combo.keys);
            (combo.action)();
        }

        self.match_sequences(name, time);

        self.held.insert(
            name.to_string(),
            HeldKey {
                time,
                emitted,
            },
        );
        if self.held.len() == 1 && !is_modifier(name) {
            self.repeat_key = Some(name.to_string());
            self.arm_timer(TimerKey::Repeat, self.config.repeat_delay);
        }
    }

    fn match_sequences(&mut self, name: &str, time: u32) {
        let mut advanced = false;
        for i in 0..self.config.sequences.len() {
            let seq = &self.config.sequences[i];
            match seq.on_press(&mut self.seq_states[i], name, time) {
                StepOutcome::NotThisKey | StepOutcome::WindowMissed => {}
                StepOutcome::Advanced { schedule } => {
                    advanced = true;
                    self.cancel_timer(TimerKey::Sequence(i));
                    self.pending_steps[i] = None;
                    if let Some((action, delay)) = schedule {
                        self.pending_steps[i] = Some(action);
                        self.arm_timer(
                            TimerKey::Sequence(i),
                            Duration::from_millis(delay as u64),
                        );
                    }
                }
                StepOutcome::Completed(action) => {
                    advanced = true;
                    self.cancel_timer(TimerKey::Sequence(i));
                    self.pending_steps[i] = None;
                    debug!("sequence {i} completed");
                    action();
                }
            }
        }
        // A press that advances nothing resets all progress; pending step
        // actions still fire on their timers
        if !advanced {
            for state in &mut self.seq_states {
                state.reset();
            }
        }
    }

    fn on_release(&mut self, name: &str, time: u32) {
        if self.config.morse_key.as_deref() == Some(name) {
            if let Some(press_time) = self.morse_press.take() {
                let duration = time.saturating_sub(press_time);
                let symbol = MorseSymbol::classify(duration);
                self.morse.push(symbol, press_time, time);
                self.sink.send_char(symbol.glyph());
                self.arm_timer(TimerKey::MorseGap, Duration::from_millis(CHAR_GAP as u64));
            }
            return;
        }

        let emitted = match self.held.remove(name) {
            Some(held) => held.emitted,
            None => name.to_string(),
        };
        if self.repeat_key.as_deref() == Some(name) || self.held.is_empty() {
            self.cancel_timer(TimerKey::Repeat);
            self.repeat_key = None;
        }
        self.sink.release(&emitted);
    }

    fn on_timer(&mut self, key: TimerKey) {
        match key {
            TimerKey::Repeat => {
                let Some(repeat) = self.repeat_key.clone() else {
                    return;
                };
                match self.held.get(&repeat) {
                    Some(held) => {
                        let emitted = held.emitted.clone();
                        self.sink.press(&emitted);
                        self.arm_timer(TimerKey::Repeat, self.config.repeat_interval);
                    }
                    None => self.repeat_key = None,
                }
            }
            TimerKey::Sequence(i) => {
                if let Some(action) = self.pending_steps[i].take() {
                    debug!("sequence {i} step action fired on window close");
                    action();
                }
                self.seq_states[i].reset();
            }
            TimerKey::MorseGap => {
                let decoded = self.morse.take_decoded();
                self.sink.send_char(decoded.unwrap_or(' '));
            }
        }
    }
}
