//! Chorded combo definitions and matching.

use std::collections::HashMap;

use crate::key_machine::Action;

/// A chord: every key except the last must be held, the last key is the
/// trigger. Registered once at startup, read-only afterward.
pub struct ComboDef {
    pub keys: Vec<String>,
    pub action: Action,
}

impl ComboDef {
    pub fn new(keys: &[&str], action: Action) -> Self {
        Self {
            keys: keys.iter().map(|k| k.to_string()).collect(),
            action,
        }
    }

    /// Whether `pressed` triggers this combo given the currently held keys
    pub fn matches<V>(&self, pressed: &str, held: &HashMap<String, V>) -> bool {
        let Some((trigger, rest)) = self.keys.split_last() else {
            return false;
        };
        trigger == pressed && rest.iter().all(|k| held.contains_key(k))
    }
}

/// First combo (in definition order) triggered by `pressed`, if any
pub fn match_combo<'a, V>(
    combos: &'a [ComboDef],
    pressed: &str,
    held: &HashMap<String, V>,
) -> Option<&'a ComboDef> {
    combos.iter().find(|c| c.matches(pressed, held))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn noop() -> Action {
        Arc::new(|| {})
    }

    fn held_of(keys: &[&str]) -> HashMap<String, u32> {
        keys.iter().map(|k| (k.to_string(), 0)).collect()
    }

    #[test]
    fn fires_when_trigger_pressed_last() {
        let combo = ComboDef::new(&["left ctrl", "left menu", "space"], noop());
        assert!(combo.matches("space", &held_of(&["left ctrl", "left menu"])));
    }

    #[test]
    fn missing_held_key_does_not_fire() {
        let combo = ComboDef::new(&["left ctrl", "left menu", "space"], noop());
        assert!(!combo.matches("space", &held_of(&["left menu"])));
    }

    #[test]
    fn non_trigger_press_does_not_fire() {
        let combo = ComboDef::new(&["left ctrl", "left menu", "space"], noop());
        // Trigger must be the key pressed now, not merely held
        assert!(!combo.matches("left menu", &held_of(&["left ctrl", "space"])));
    }

    #[test]
    fn first_definition_wins() {
        let combos = vec![
            ComboDef::new(&["left ctrl", "x"], noop()),
            ComboDef::new(&["x"], noop()),
        ];
        let hit = match_combo(&combos, "x", &held_of(&["left ctrl"])).unwrap();
        assert_eq!(hit.keys.len(), 2);
    }
}
