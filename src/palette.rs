// ============================================================================
// PALETTE + QUANTIZER — nearest-color lookup for imports
// ============================================================================

use std::collections::HashSet;

use crate::color::Color;
use crate::error::SyncError;

/// The place-style colors offered to painters, before sorting and dedup.
const PLACE_COLORS: &[&str] = &[
    "#000000", "#ffffff", "#ff0000", "#ff00ff", "#00ffff", "#0000ff", "#ff4500", "#ffa800",
    "#ffd635", "#ffff00", "#00a368", "#7eed56", "#2450a4", "#3690ea", "#51e9f4", "#811e9f",
    "#b44ac0", "#ff99aa", "#9c6926", "#898d90", "#D4D7D9", "#FFFFFF",
];

/// Decoded palette entry; the channels are cached so quantization never
/// re-parses hex.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PaletteEntry {
    pub color: Color,
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

/// Ordered, deduplicated set of canonical colors.
///
/// Order is fixed at construction and defines the quantizer's tie-break.
#[derive(Clone, Debug)]
pub struct Palette {
    entries: Vec<PaletteEntry>,
}

impl Palette {
    /// Build from colors in the given order, dropping later duplicates.
    pub fn new(colors: impl IntoIterator<Item = Color>) -> Result<Self, SyncError> {
        let mut seen = HashSet::new();
        let entries: Vec<PaletteEntry> = colors
            .into_iter()
            .filter(|c| seen.insert(*c))
            .map(|color| PaletteEntry { color, r: color.r, g: color.g, b: color.b })
            .collect();
        if entries.is_empty() {
            return Err(SyncError::InvalidColor("empty palette".into()));
        }
        Ok(Self { entries })
    }

    /// Parse a list of hex strings; any malformed entry rejects the whole list.
    pub fn from_hex_list<S: AsRef<str>>(colors: &[S]) -> Result<Self, SyncError> {
        let parsed = colors
            .iter()
            .map(|s| Color::from_hex(s.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(parsed)
    }

    /// The default place palette: uppercased, deduplicated, sorted by hex.
    pub fn place() -> Self {
        let mut colors: Vec<Color> = PLACE_COLORS
            .iter()
            .filter_map(|s| Color::from_hex(s).ok())
            .collect();
        colors.sort_by_key(|c| c.to_hex());
        colors.dedup();
        Self {
            entries: colors
                .into_iter()
                .map(|color| PaletteEntry { color, r: color.r, g: color.g, b: color.b })
                .collect(),
        }
    }

    pub fn entries(&self) -> &[PaletteEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, color: Color) -> bool {
        self.entries.iter().any(|e| e.color == color)
    }
}

impl Default for Palette {
    fn default() -> Self {
        Self::place()
    }
}

/// Maps arbitrary RGB to the nearest palette color (brute-force scan).
#[derive(Clone, Debug)]
pub struct ColorQuantizer {
    palette: Palette,
}

impl ColorQuantizer {
    pub fn new(palette: Palette) -> Self {
        Self { palette }
    }

    pub fn palette(&self) -> &Palette {
        &self.palette
    }

    /// Nearest entry by Euclidean RGB distance. Ties go to the earliest
    /// entry: only a strictly smaller distance replaces the current best.
    pub fn nearest(&self, r: u8, g: u8, b: u8) -> Color {
        let mut best = self.palette.entries[0].color;
        let mut best_dist = u32::MAX;
        for entry in &self.palette.entries {
            let dist = entry.color.distance_sq(r, g, b);
            if dist < best_dist {
                best_dist = dist;
                best = entry.color;
                if dist == 0 {
                    break;
                }
            }
        }
        best
    }
}

impl Default for ColorQuantizer {
    fn default() -> Self {
        Self::new(Palette::place())
    }
}
