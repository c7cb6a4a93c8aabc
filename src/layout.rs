//! Matrix position → logical key name mapping.
//!
//! Key names are plain lowercase strings as the rest of the input pipeline
//! (combos, sequences, input sinks) sees them: `"a"`, `"space"`,
//! `"left ctrl"`. Unused matrix positions are empty strings in the model
//! tables and map to `None`.

use std::collections::HashMap;

/// Logical key names for one keyboard matrix.
#[derive(Debug, Clone, Default)]
pub struct KeyLayout {
    names: HashMap<(u8, u8), String>,
}

impl KeyLayout {
    /// Build a layout from a row-major name table. Empty names mark unused
    /// positions.
    pub fn from_matrix(matrix: &[&[&str]]) -> Self {
        let mut names = HashMap::new();
        for (row, cols) in matrix.iter().enumerate() {
            for (col, &name) in cols.iter().enumerate() {
                if !name.is_empty() {
                    names.insert((row as u8, col as u8), name.to_string());
                }
            }
        }
        Self { names }
    }

    /// Logical name at a matrix position
    pub fn name(&self, row: u8, col: u8) -> Option<&str> {
        self.names.get(&(row, col)).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Whether a key acts purely as a modifier (never auto-repeats, is
/// synthesized alongside the keys it modifies).
pub fn is_modifier(name: &str) -> bool {
    matches!(
        name,
        "left ctrl"
            | "right ctrl"
            | "left shift"
            | "right shift"
            | "left menu"
            | "right menu"
            | "left windows"
            | "right windows"
    )
}

/// Shifted rendition of a key where the shifted pair has its own name.
///
/// Applied when a shift modifier is held at press time so the injected key
/// matches what the user typed.
pub fn shift_rewrite(name: &str) -> Option<&'static str> {
    let rewritten = match name {
        "-" => "_",
        "=" => "+",
        "[" => "{",
        "]" => "}",
        ";" => ":",
        "'" => "\"",
        "," => "<",
        "." => ">",
        "/" => "?",
        "`" => "~",
        "\\" => "|",
        _ => return None,
    };
    Some(rewritten)
}
