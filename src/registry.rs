//! Static registry of supported keyboard models.
//!
//! Each model is described by one table entry keyed on USB vendor/product
//! id: matrix dimensions and key names, RGB geometry with a pixel-index
//! mapping, and the number of configuration layers the firmware ships.

use crate::layout::KeyLayout;

/// One supported keyboard model
pub struct DeviceModel {
    pub name: &'static str,
    pub vid: u16,
    pub pid: u16,
    pub rows: u8,
    pub cols: u8,
    /// Row-major logical key names; empty strings are unused positions
    pub matrix: &'static [&'static [&'static str]],
    /// RGB buffer geometry
    pub rgb_width: u8,
    pub rgb_height: u8,
    /// Configuration layers the firmware ships with
    pub default_layers: u8,
    /// Matrix position → index into the RGB pixel buffer
    pub pixel_index: fn(row: u8, col: u8) -> usize,
}

impl DeviceModel {
    pub fn layout(&self) -> KeyLayout {
        KeyLayout::from_matrix(self.matrix)
    }

    /// Total pixels in the RGB buffer
    pub fn pixel_count(&self) -> usize {
        self.rgb_width as usize * self.rgb_height as usize
    }
}

/// Row-major pixel order
fn pixel_row_major(row: u8, col: u8) -> usize {
    row as usize * PKB61_COLS + col as usize
}

/// Serpentine pixel order: odd rows run right to left
fn pixel_serpentine(row: u8, col: u8) -> usize {
    let r = row as usize;
    if r % 2 == 0 {
        r * PAD12_COLS + col as usize
    } else {
        r * PAD12_COLS + (PAD12_COLS - 1 - col as usize)
    }
}

const PKB61_COLS: usize = 14;

#[rustfmt::skip]
static PKB61_MATRIX: &[&[&str]] = &[
    &["esc", "1", "2", "3", "4", "5", "6", "7", "8", "9", "0", "-", "=", "backspace"],
    &["tab", "q", "w", "e", "r", "t", "y", "u", "i", "o", "p", "[", "]", "\\"],
    &["caps lock", "a", "s", "d", "f", "g", "h", "j", "k", "l", ";", "'", "enter", ""],
    &["left shift", "z", "x", "c", "v", "b", "n", "m", ",", ".", "/", "right shift", "", ""],
    &["left ctrl", "left windows", "left menu", "space", "", "", "", "", "", "right menu", "fn", "right ctrl", "", ""],
];

const PAD12_COLS: usize = 4;

#[rustfmt::skip]
static PAD12_MATRIX: &[&[&str]] = &[
    &["7", "8", "9", "backspace"],
    &["4", "5", "6", "enter"],
    &["1", "2", "3", "0"],
];

/// All supported models
pub static MODELS: &[DeviceModel] = &[
    DeviceModel {
        name: "PKB-61",
        vid: 0x1209,
        pid: 0x6101,
        rows: 5,
        cols: 14,
        matrix: PKB61_MATRIX,
        rgb_width: 14,
        rgb_height: 5,
        default_layers: 4,
        pixel_index: pixel_row_major,
    },
    DeviceModel {
        name: "PKB-Pad12",
        vid: 0x1209,
        pid: 0x6102,
        rows: 3,
        cols: 4,
        matrix: PAD12_MATRIX,
        rgb_width: 4,
        rgb_height: 3,
        default_layers: 2,
        pixel_index: pixel_serpentine,
    },
];

/// Look up a model by USB ids
pub fn find(vid: u16, pid: u16) -> Option<&'static DeviceModel> {
    MODELS.iter().find(|m| m.vid == vid && m.pid == pid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_by_usb_ids() {
        assert_eq!(find(0x1209, 0x6101).unwrap().name, "PKB-61");
        assert!(find(0xFFFF, 0x0001).is_none());
    }

    #[test]
    fn matrix_dimensions_match_declared_size() {
        for model in MODELS {
            assert_eq!(model.matrix.len(), model.rows as usize, "{}", model.name);
            for row in model.matrix {
                assert_eq!(row.len(), model.cols as usize, "{}", model.name);
            }
        }
    }

    #[test]
    fn pixel_indices_are_in_bounds_and_unique() {
        use std::collections::HashSet;
        for model in MODELS {
            let mut seen = HashSet::new();
            for row in 0..model.rgb_height {
                for col in 0..model.rgb_width {
                    let idx = (model.pixel_index)(row, col);
                    assert!(idx < model.pixel_count(), "{}", model.name);
                    assert!(seen.insert(idx), "{} duplicate pixel {idx}", model.name);
                }
            }
        }
    }

    #[test]
    fn serpentine_reverses_odd_rows() {
        let model = find(0x1209, 0x6102).unwrap();
        assert_eq!((model.pixel_index)(0, 0), 0);
        assert_eq!((model.pixel_index)(1, 0), 7);
        assert_eq!((model.pixel_index)(1, 3), 4);
    }

    #[test]
    fn layouts_expose_combo_modifier_names() {
        let layout = find(0x1209, 0x6101).unwrap().layout();
        assert_eq!(layout.name(4, 0), Some("left ctrl"));
        assert_eq!(layout.name(4, 2), Some("left menu"));
        assert_eq!(layout.name(4, 3), Some("space"));
    }
}
