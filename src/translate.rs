/*
 * This file is part of Casterd.
 *
 * Copyright (C) 2026 Casterd contributors
 *
 * Casterd is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Casterd is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Casterd. If not, see <https://www.gnu.org/licenses/>.
 */

//! Translation from requested signal combinations to valve pins.
//!
//! Standard matrix cases have 15 rows. The row 16 attachments (HMN, KMN
//! and unit shift) each reinterpret a subset of the column signals to
//! reach the 16th row, so a requested combination has to be rewritten
//! before it is mapped onto air pins. Each scheme is a data table here;
//! the translation itself is pure, so identical input always yields the
//! identical pin mask and a punched ribbon replays exactly.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::{CasterError, Result};
use crate::signals::{Combination, Signal};
use crate::valves::{PinMask, ValveMappings};

/// Row 16 addressing modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Row16Mode {
    Off,
    #[serde(alias = "HMN")]
    Hmn,
    #[serde(alias = "KMN")]
    Kmn,
    #[serde(alias = "unit shift", alias = "unit-shift", alias = "unitshift")]
    UnitShift,
}

impl Row16Mode {
    pub const ALL: [Row16Mode; 4] = [
        Row16Mode::Off,
        Row16Mode::Hmn,
        Row16Mode::Kmn,
        Row16Mode::UnitShift,
    ];
}

impl fmt::Display for Row16Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Row16Mode::Off => "off",
            Row16Mode::Hmn => "HMN",
            Row16Mode::Kmn => "KMN",
            Row16Mode::UnitShift => "unit shift",
        };
        write!(f, "{name}")
    }
}

impl FromStr for Row16Mode {
    type Err = CasterError;

    /// Accepts mode names in any case and the legacy numeric indices
    /// 0..=3 used by older configuration files.
    fn from_str(s: &str) -> Result<Self> {
        let folded = s.trim().to_ascii_lowercase().replace(['-', '_'], " ");
        let mode = match folded.as_str() {
            "0" | "off" => Row16Mode::Off,
            "1" | "hmn" => Row16Mode::Hmn,
            "2" | "kmn" => Row16Mode::Kmn,
            "3" | "unit shift" | "unitshift" => Row16Mode::UnitShift,
            _ => return Err(CasterError::UnsupportedRow16Mode(s.trim().to_string())),
        };
        Ok(mode)
    }
}

/// One substitution rule: if the combination carries all signals of the
/// pattern, the extras are added.
type Rule = (&'static [Signal], &'static [Signal]);

struct AttachmentTable {
    rules: &'static [Rule],
    /// Extras for any other column signal.
    other_columns: &'static [Signal],
    /// Extras for a row 16 with no column at all, which sits in the O
    /// position of the diecase.
    bare: &'static [Signal],
}

/// HMN: NI/NL gain H, H gains N, M gains H, N gains M, O gains HMN,
/// remaining columns gain HM.
static HMN: AttachmentTable = AttachmentTable {
    rules: &[
        (&[Signal::N, Signal::I], &[Signal::H]),
        (&[Signal::N, Signal::L], &[Signal::H]),
        (&[Signal::H], &[Signal::N]),
        (&[Signal::M], &[Signal::H]),
        (&[Signal::N], &[Signal::M]),
        (&[Signal::O], &[Signal::H, Signal::M, Signal::N]),
    ],
    other_columns: &[Signal::H, Signal::M],
    bare: &[Signal::O, Signal::H, Signal::M, Signal::N],
};

/// KMN: the same scheme built around K instead of H.
static KMN: AttachmentTable = AttachmentTable {
    rules: &[
        (&[Signal::N, Signal::I], &[Signal::K]),
        (&[Signal::N, Signal::L], &[Signal::K]),
        (&[Signal::K], &[Signal::N]),
        (&[Signal::M], &[Signal::K]),
        (&[Signal::N], &[Signal::M]),
        (&[Signal::O], &[Signal::K, Signal::M, Signal::N]),
    ],
    other_columns: &[Signal::K, Signal::M],
    bare: &[Signal::O, Signal::K, Signal::M, Signal::N],
};

/// Rewrite a combination for the given row 16 mode and collapse the
/// transient O and 15 signals into the combined O15 pin.
pub fn apply_row16(combination: &Combination, mode: Row16Mode) -> Combination {
    let mut combo = combination.clone();
    match mode {
        Row16Mode::Off => {
            // No attachment: the 16th row falls back to row 15.
            if combo.remove(Signal::Row(16)) {
                combo.insert(Signal::Row(15));
            }
        }
        Row16Mode::Hmn => attach(&mut combo, &HMN),
        Row16Mode::Kmn => attach(&mut combo, &KMN),
        Row16Mode::UnitShift => {
            // With the attachment on, the D air pin is reached through EF
            // and the D signal drives the unit-shift piston instead.
            if combo.remove(Signal::D) {
                combo.insert(Signal::E);
                combo.insert(Signal::F);
            }
            if combo.remove(Signal::Row(16)) {
                combo.insert(Signal::D);
            }
        }
    }
    collapse_o15(&mut combo);
    combo
}

fn attach(combo: &mut Combination, table: &AttachmentTable) {
    // Rows 1..15 never trigger the attachment.
    if (1..16).any(|n| combo.contains(Signal::Row(n))) {
        return;
    }
    if !combo.remove(Signal::Row(16)) {
        return;
    }
    for (pattern, extras) in table.rules {
        if combo.contains_all(pattern) {
            for extra in *extras {
                combo.insert(*extra);
            }
            return;
        }
    }
    let extras = if combo.has_column() {
        table.other_columns
    } else {
        table.bare
    };
    for extra in extras {
        combo.insert(*extra);
    }
}

fn collapse_o15(combo: &mut Combination) {
    let mut collapsed = combo.remove(Signal::O);
    collapsed |= combo.remove(Signal::Row(15));
    if collapsed {
        combo.insert(Signal::O15);
    }
}

/// Casting never drives the O15 pin; O15 is the rest position.
pub fn strip_o15(combination: &Combination) -> Combination {
    let mut combo = combination.clone();
    combo.remove(Signal::O15);
    combo
}

/// Punching needs at least two perforations per cycle or the ribbon
/// advance mechanism stalls; O15 fills the gap.
pub fn pad_for_ribbon(combination: &Combination) -> Combination {
    let mut combo = combination.clone();
    if combo.len() < 2 {
        combo.insert(Signal::O15);
    }
    combo
}

/// Maps combinations onto valve pins for one interface.
pub struct SignalTranslator {
    mappings: ValveMappings,
    supported: Vec<Row16Mode>,
}

impl SignalTranslator {
    pub fn new(mappings: ValveMappings, supported: &[Row16Mode]) -> Self {
        Self {
            mappings,
            supported: supported.to_vec(),
        }
    }

    pub fn supports(&self, mode: Row16Mode) -> bool {
        self.supported.contains(&mode)
    }

    /// Row 16 rewrite, gated on the interface's supported modes.
    pub fn substitute(&self, combination: &Combination, mode: Row16Mode) -> Result<Combination> {
        if !self.supports(mode) {
            return Err(CasterError::UnsupportedRow16Mode(mode.to_string()));
        }
        Ok(apply_row16(combination, mode))
    }

    /// Pin mask of an already-substituted combination.
    pub fn mask(&self, combination: &Combination) -> PinMask {
        let mut mask = PinMask::empty();
        for (group, labels) in self.mappings.groups.iter().enumerate() {
            for (bit, signal) in labels.iter().enumerate() {
                if combination.contains(*signal) {
                    mask.set((group * 8 + bit) as u8);
                }
            }
        }
        mask
    }

    /// `resolve(combination, mode)`: substitution, collapse and pin
    /// lookup in one pure step.
    pub fn resolve(&self, combination: &Combination, mode: Row16Mode) -> Result<PinMask> {
        Ok(self.mask(&self.substitute(combination, mode)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn standard_mappings() -> ValveMappings {
        let parse_group = |labels: [&str; 8]| {
            labels.map(|l| l.parse::<Signal>().unwrap())
        };
        ValveMappings {
            groups: [
                parse_group(["N", "M", "L", "K", "J", "I", "H", "G"]),
                parse_group(["F", "S", "E", "D", "0075", "C", "B", "A"]),
                parse_group(["1", "2", "3", "4", "5", "6", "7", "8"]),
                parse_group(["9", "10", "11", "12", "13", "14", "0005", "O15"]),
            ],
        }
    }

    fn translator() -> SignalTranslator {
        SignalTranslator::new(standard_mappings(), &Row16Mode::ALL)
    }

    fn combo(s: &str) -> Combination {
        Combination::parse(s).unwrap()
    }

    /// Expected-value builder: exact labels, so "O15" stays the combined
    /// signal instead of parsing as O + 15.
    fn labels(ls: &[&str]) -> Combination {
        Combination::from_labels(ls).unwrap()
    }

    #[test]
    fn test_off_mode_maps_single_signal_to_its_pin() {
        // valve1 = N,M,L,K,J,I,H,G: N is pin 0.
        let mask = translator().resolve(&combo("N"), Row16Mode::Off).unwrap();
        assert!(mask.contains(0));
        assert_eq!(mask.bits().count_ones(), 1);
    }

    #[test]
    fn test_off_mode_row16_falls_back_to_o15() {
        let t = translator();
        let mask = t.resolve(&combo("16"), Row16Mode::Off).unwrap();
        // 16 -> 15 -> O15, which is valve4 bit 7 = pin 31.
        assert!(mask.contains(31));
        assert_eq!(mask.bits().count_ones(), 1);
    }

    #[test]
    fn test_resolve_is_deterministic_and_pure() {
        let t = translator();
        let input = combo("N I 16");
        let first = t.resolve(&input, Row16Mode::Hmn).unwrap();
        let second = t.resolve(&input, Row16Mode::Hmn).unwrap();
        assert_eq!(first, second);
        // the input combination is untouched
        assert_eq!(input, combo("N I 16"));
    }

    #[test]
    fn test_hmn_substitutions() {
        let cases: &[(&str, &[&str])] = &[
            ("N I 16", &["N", "I", "H"]),
            ("N L 16", &["N", "L", "H"]),
            ("H 16", &["H", "N"]),
            ("M 16", &["M", "H"]),
            ("N 16", &["N", "M"]),
            ("O 16", &["O15", "H", "M", "N"]),
            ("A 16", &["A", "H", "M"]),
            ("16", &["O15", "H", "M", "N"]),
        ];
        for (input, expected) in cases {
            let out = apply_row16(&combo(input), Row16Mode::Hmn);
            assert_eq!(out, labels(expected), "HMN {input}");
        }
    }

    #[test]
    fn test_kmn_substitutions() {
        let cases: &[(&str, &[&str])] = &[
            ("N I 16", &["N", "I", "K"]),
            ("N L 16", &["N", "L", "K"]),
            ("K 16", &["K", "N"]),
            ("M 16", &["M", "K"]),
            ("N 16", &["N", "M"]),
            ("O 16", &["O15", "K", "M", "N"]),
            ("B 16", &["B", "K", "M"]),
        ];
        for (input, expected) in cases {
            let out = apply_row16(&combo(input), Row16Mode::Kmn);
            assert_eq!(out, labels(expected), "KMN {input}");
        }
    }

    #[test]
    fn test_rows_below_16_suppress_attachment() {
        for mode in [Row16Mode::Hmn, Row16Mode::Kmn] {
            let out = apply_row16(&combo("N 3"), mode);
            assert_eq!(out, combo("N 3"));
        }
    }

    #[test]
    fn test_unit_shift_reroutes_d_and_row16() {
        // D column moves to EF
        assert_eq!(
            apply_row16(&combo("D 4"), Row16Mode::UnitShift),
            combo("E F 4")
        );
        // row 16 engages the shift piston through D
        assert_eq!(
            apply_row16(&combo("A 16"), Row16Mode::UnitShift),
            combo("A D")
        );
        // both at once: D rerouted first, then 16 re-adds D
        assert_eq!(
            apply_row16(&combo("D 16"), Row16Mode::UnitShift),
            combo("D E F")
        );
        // unlike HMN/KMN, earlier rows do not disable the reroute
        assert_eq!(
            apply_row16(&combo("D 2"), Row16Mode::UnitShift),
            combo("E F 2")
        );
    }

    #[test]
    fn test_unsupported_mode_is_rejected() {
        let t = SignalTranslator::new(standard_mappings(), &[Row16Mode::Off]);
        let err = t.resolve(&combo("16"), Row16Mode::Hmn).unwrap_err();
        assert_eq!(err.kind(), "unsupported_row16_mode");
    }

    #[test]
    fn test_strip_and_pad_helpers() {
        let stripped = strip_o15(&labels(&["O15", "N"]));
        assert!(stripped.contains(Signal::N));
        assert!(!stripped.contains(Signal::O15));
        assert_eq!(stripped.len(), 1);

        let padded = pad_for_ribbon(&combo("A"));
        assert!(padded.contains(Signal::O15));
        assert_eq!(padded.len(), 2);
        // two or more signals advance the ribbon on their own
        let untouched = pad_for_ribbon(&combo("A 1"));
        assert!(!untouched.contains(Signal::O15));
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("HMN".parse::<Row16Mode>().unwrap(), Row16Mode::Hmn);
        assert_eq!("unit-shift".parse::<Row16Mode>().unwrap(), Row16Mode::UnitShift);
        assert_eq!("3".parse::<Row16Mode>().unwrap(), Row16Mode::UnitShift);
        assert_eq!("0".parse::<Row16Mode>().unwrap(), Row16Mode::Off);
        assert!("hmm".parse::<Row16Mode>().is_err());
    }
}
