//! Morse element classification and decoding.
//!
//! One designated key on the board acts as a Morse paddle. Press duration
//! classifies each element as dot or dash; a gap of three dot-thresholds
//! after the last release ends the character. The timing side (the gap
//! timer) lives in the key machine; this module is the pure part.

/// Press duration below this many device time units is a dot, at or above
/// it a dash.
pub const DOT_DASH_THRESHOLD: u32 = 150;

/// Character boundary: a gap of this many thresholds after the last release
/// ends the current character.
pub const CHAR_GAP_MULTIPLIER: u32 = 3;

/// Gap after which the accumulated elements decode to one character
pub const CHAR_GAP: u32 = DOT_DASH_THRESHOLD * CHAR_GAP_MULTIPLIER;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MorseSymbol {
    Dot,
    Dash,
}

impl MorseSymbol {
    /// Classify a press duration
    pub fn classify(duration: u32) -> Self {
        if duration < DOT_DASH_THRESHOLD {
            Self::Dot
        } else {
            Self::Dash
        }
    }

    /// The character echoed while typing
    pub fn glyph(self) -> char {
        match self {
            Self::Dot => '.',
            Self::Dash => '-',
        }
    }
}

/// One element as typed: symbol plus its press and release timestamps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MorseElement {
    pub symbol: MorseSymbol,
    pub press_time: u32,
    pub release_time: u32,
}

/// Elements typed since the last decoded character
#[derive(Debug, Clone, Default)]
pub struct MorseAccumulator {
    elements: Vec<MorseElement>,
}

impl MorseAccumulator {
    pub fn push(&mut self, symbol: MorseSymbol, press_time: u32, release_time: u32) {
        self.elements.push(MorseElement {
            symbol,
            press_time,
            release_time,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// The accumulated code as a dot/dash string, e.g. `".-"`
    pub fn code(&self) -> String {
        self.elements.iter().map(|e| e.symbol.glyph()).collect()
    }

    /// Decode and clear. `None` when the code matches no table entry.
    pub fn take_decoded(&mut self) -> Option<char> {
        let decoded = decode(&self.code());
        self.elements.clear();
        decoded
    }
}

/// Decode one dot/dash string to its character. Unknown codes yield `None`.
pub fn decode(code: &str) -> Option<char> {
    let c = match code {
        ".-" => 'a',
        "-..." => 'b',
        "-.-." => 'c',
        "-.." => 'd',
        "." => 'e',
        "..-." => 'f',
        "--." => 'g',
        "...." => 'h',
        ".." => 'i',
        ".---" => 'j',
        "-.-" => 'k',
        ".-.." => 'l',
        "--" => 'm',
        "-." => 'n',
        "---" => 'o',
        ".--." => 'p',
        "--.-" => 'q',
        ".-." => 'r',
        "..." => 's',
        "-" => 't',
        "..-" => 'u',
        "...-" => 'v',
        ".--" => 'w',
        "-..-" => 'x',
        "-.--" => 'y',
        "--.." => 'z',
        ".----" => '1',
        "..---" => '2',
        "...--" => '3',
        "....-" => '4',
        "....." => '5',
        "-...." => '6',
        "--..." => '7',
        "---.." => '8',
        "----." => '9',
        "-----" => '0',
        _ => return None,
    };
    Some(c)
}
