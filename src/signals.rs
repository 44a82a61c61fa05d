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

//! The Monotype signal alphabet and signal combinations.
//!
//! A casting or punching cycle is described by a set of signals: the
//! justification wedges 0075 and 0005, the S (justification space) signal,
//! the column signals A..O and the row signals 1..16. O and 15 share a
//! single air pin and collapse into the combined O15 signal before they
//! reach a valve; rows 15 and 16 only exist on the requesting side.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::errors::{CasterError, Result};

/// One Monotype signal. The variant order is the historical display
/// order (0075, S, 0005, columns, rows, O15), which `Ord` relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Signal {
    Wedge0075,
    S,
    Wedge0005,
    A,
    B,
    C,
    D,
    E,
    F,
    G,
    H,
    I,
    J,
    K,
    L,
    M,
    N,
    /// Column O; transient, collapses into O15.
    O,
    /// Row 1..=16; 15 and 16 are transient.
    Row(u8),
    /// Combined O column / row 15 air pin.
    O15,
}

const COLUMNS: [Signal; 15] = [
    Signal::A,
    Signal::B,
    Signal::C,
    Signal::D,
    Signal::E,
    Signal::F,
    Signal::G,
    Signal::H,
    Signal::I,
    Signal::J,
    Signal::K,
    Signal::L,
    Signal::M,
    Signal::N,
    Signal::O,
];

impl Signal {
    /// Row signal constructor; rows run 1..=16.
    pub fn row(number: u8) -> Option<Signal> {
        (1..=16).contains(&number).then_some(Signal::Row(number))
    }

    pub fn is_column(self) -> bool {
        COLUMNS.contains(&self)
    }

    pub fn is_row(self) -> bool {
        matches!(self, Signal::Row(_))
    }

    /// Signals that may appear in a valve group mapping: columns A..N,
    /// rows 1..14, O15, S and the two justification wedges. O, 15 and 16
    /// never reach a valve directly.
    pub fn is_mappable(self) -> bool {
        match self {
            Signal::O | Signal::Row(15) | Signal::Row(16) => false,
            Signal::Row(n) => (1..=14).contains(&n),
            _ => true,
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::Wedge0075 => write!(f, "0075"),
            Signal::Wedge0005 => write!(f, "0005"),
            Signal::S => write!(f, "S"),
            Signal::A => write!(f, "A"),
            Signal::B => write!(f, "B"),
            Signal::C => write!(f, "C"),
            Signal::D => write!(f, "D"),
            Signal::E => write!(f, "E"),
            Signal::F => write!(f, "F"),
            Signal::G => write!(f, "G"),
            Signal::H => write!(f, "H"),
            Signal::I => write!(f, "I"),
            Signal::J => write!(f, "J"),
            Signal::K => write!(f, "K"),
            Signal::L => write!(f, "L"),
            Signal::M => write!(f, "M"),
            Signal::N => write!(f, "N"),
            Signal::O => write!(f, "O"),
            Signal::Row(n) => write!(f, "{}", n),
            Signal::O15 => write!(f, "O15"),
        }
    }
}

impl FromStr for Signal {
    type Err = CasterError;

    fn from_str(s: &str) -> Result<Signal> {
        let label = s.trim().to_ascii_uppercase();
        let sig = match label.as_str() {
            "0075" => Signal::Wedge0075,
            "0005" => Signal::Wedge0005,
            "S" => Signal::S,
            "A" => Signal::A,
            "B" => Signal::B,
            "C" => Signal::C,
            "D" => Signal::D,
            "E" => Signal::E,
            "F" => Signal::F,
            "G" => Signal::G,
            "H" => Signal::H,
            "I" => Signal::I,
            "J" => Signal::J,
            "K" => Signal::K,
            "L" => Signal::L,
            "M" => Signal::M,
            "N" => Signal::N,
            "O" => Signal::O,
            "O15" => Signal::O15,
            other => other
                .parse::<u8>()
                .ok()
                .and_then(Signal::row)
                .ok_or_else(|| CasterError::InvalidSignal(s.trim().to_string()))?,
        };
        Ok(sig)
    }
}

/// A set of signals forming one cycle's input. Iteration order is the
/// display order defined by `Signal`'s `Ord`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Combination(BTreeSet<Signal>);

impl Combination {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a compact combination string such as `"NI 0075"` or `"GS2"`.
    ///
    /// Tokens are consumed greedily, longest first (0005, 0075, rows
    /// 16..1, columns, S); commas and whitespace are separators. Anything
    /// left over is rejected with `InvalidSignal` before it can reach the
    /// hardware.
    pub fn parse(input: &str) -> Result<Self> {
        let mut rest = input.trim().to_ascii_uppercase();
        rest.retain(|c| !matches!(c, ',' | ';' | ' ' | '\t'));

        let mut set = BTreeSet::new();
        for (token, signal) in token_table() {
            if rest.contains(&token) {
                rest = rest.replace(&token, "");
                set.insert(signal);
            }
        }
        if !rest.is_empty() {
            return Err(CasterError::InvalidSignal(rest));
        }
        Ok(Self(set))
    }

    /// Build a combination from individual labels, each of which must be
    /// a complete signal name.
    pub fn from_labels<S: AsRef<str>>(labels: &[S]) -> Result<Self> {
        labels
            .iter()
            .map(|l| l.as_ref().parse::<Signal>())
            .collect::<Result<BTreeSet<_>>>()
            .map(Self)
    }

    pub fn contains(&self, signal: Signal) -> bool {
        self.0.contains(&signal)
    }

    pub fn contains_all(&self, signals: &[Signal]) -> bool {
        signals.iter().all(|s| self.0.contains(s))
    }

    pub fn insert(&mut self, signal: Signal) {
        self.0.insert(signal);
    }

    pub fn remove(&mut self, signal: Signal) -> bool {
        self.0.remove(&signal)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = Signal> + '_ {
        self.0.iter().copied()
    }

    pub fn has_column(&self) -> bool {
        self.iter().any(Signal::is_column)
    }

    /// Display-ordered labels. When N is present it leads, followed by
    /// its companion columns (J, K, L, I) — the conventional way NJ, NK
    /// and similar control combinations are written out.
    pub fn ordered_labels(&self) -> Vec<String> {
        let mut front: Vec<Signal> = Vec::new();
        if self.contains(Signal::N) {
            front.push(Signal::N);
            for companion in [Signal::J, Signal::K, Signal::L, Signal::I] {
                if self.contains(companion) {
                    front.push(companion);
                }
            }
        }
        let mut labels: Vec<String> = front.iter().map(|s| s.to_string()).collect();
        labels.extend(
            self.iter()
                .filter(|s| !front.contains(s))
                .map(|s| s.to_string()),
        );
        labels
    }
}

impl FromIterator<Signal> for Combination {
    fn from_iter<T: IntoIterator<Item = Signal>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for Combination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.ordered_labels().join(" "))
    }
}

fn token_table() -> Vec<(String, Signal)> {
    let mut table = vec![
        ("0005".to_string(), Signal::Wedge0005),
        ("0075".to_string(), Signal::Wedge0075),
    ];
    for n in (1..=16).rev() {
        table.push((n.to_string(), Signal::Row(n)));
    }
    for column in COLUMNS {
        table.push((column.to_string(), column));
    }
    table.push(("S".to_string(), Signal::S));
    table
}
