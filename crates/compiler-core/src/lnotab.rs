//! Line number table.
//!
//! The table is a sequence of `(address delta, line delta)` byte pairs. Each
//! pair closes a run of code: the address delta is the run length in bytes,
//! the line delta (a signed byte) moves the line relative to the previous
//! run. `-128` marks a run with no source line. Runs longer than 254 bytes
//! and line jumps outside `-127..=127` are split over several pairs, and a
//! `(0, 0)` pair is never written.

use alloc::{boxed::Box, vec::Vec};

/// Line delta reserved for "this run has no line".
pub const NO_LINE: i8 = -128;

const MAX_ADDR_DELTA: u32 = 254;
const MAX_LINE_STEP: i64 = 127;

/// Incrementally encodes a line table while code is being emitted.
#[derive(Clone, Debug)]
pub struct LineTableBuilder {
    table: Vec<u8>,
    current_start: u32,
    current_end: u32,
    current_line: Option<u32>,
    prev_line: u32,
}

impl LineTableBuilder {
    #[must_use]
    pub const fn new(first_line: u32) -> Self {
        Self {
            table: Vec::new(),
            current_start: 0,
            current_end: 0,
            current_line: Some(first_line),
            prev_line: first_line,
        }
    }

    /// Adds `bytes` bytes of code to the current run.
    pub const fn add_code(&mut self, bytes: u32) {
        self.current_end += bytes;
    }

    /// Starts a new run for `line`. Line 0 is treated as "keep the current line".
    pub fn next_line(&mut self, line: Option<u32>) {
        if line == Some(0) || line == self.current_line {
            return;
        }
        if self.current_end == self.current_start {
            // nothing emitted under the previous line yet
            self.current_line = line;
            return;
        }
        self.emit_current_line();
        self.current_start = self.current_end;
        if let Some(prev) = self.current_line {
            self.prev_line = prev;
        }
        self.current_line = line;
    }

    #[must_use]
    pub const fn current_line(&self) -> Option<u32> {
        self.current_line
    }

    #[must_use]
    pub fn finish(mut self) -> Box<[u8]> {
        self.emit_current_line();
        self.table.into_boxed_slice()
    }

    fn emit_current_line(&mut self) {
        let mut addr_delta = self.current_end - self.current_start;
        if addr_delta == 0 {
            return;
        }
        let mut line_delta = match self.current_line {
            None => i64::from(NO_LINE),
            Some(line) => {
                let mut delta = i64::from(line) - i64::from(self.prev_line);
                while !(-MAX_LINE_STEP..=MAX_LINE_STEP).contains(&delta) {
                    let step = if delta < 0 {
                        -MAX_LINE_STEP
                    } else {
                        MAX_LINE_STEP
                    };
                    self.push_entry(0, step);
                    delta -= step;
                }
                delta
            }
        };
        while addr_delta > MAX_ADDR_DELTA {
            self.push_entry(MAX_ADDR_DELTA, line_delta);
            line_delta = if self.current_line.is_none() {
                i64::from(NO_LINE)
            } else {
                0
            };
            addr_delta -= MAX_ADDR_DELTA;
        }
        self.push_entry(addr_delta, line_delta);
    }

    fn push_entry(&mut self, addr_delta: u32, line_delta: i64) {
        debug_assert!(addr_delta <= 255);
        debug_assert!((-128..=127).contains(&line_delta));
        debug_assert!(addr_delta != 0 || line_delta != 0);
        self.table.push(addr_delta as u8);
        self.table.push(line_delta as i8 as u8);
    }
}

/// A run of code bytes `start..end` attributed to one line.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LineRange {
    pub start: u32,
    pub end: u32,
    pub line: Option<u32>,
}

/// Raw `(address delta, line delta)` pairs of a table.
pub fn entries(table: &[u8]) -> impl Iterator<Item = (u8, i8)> + '_ {
    table.chunks_exact(2).map(|pair| (pair[0], pair[1] as i8))
}

/// Decodes a table into contiguous ranges starting at offset 0. Adjacent
/// runs with the same line are merged.
#[must_use]
pub fn decode(table: &[u8], first_line: u32) -> Vec<LineRange> {
    let mut ranges: Vec<LineRange> = Vec::new();
    let mut line = i64::from(first_line);
    let mut addr = 0u32;
    for (addr_delta, line_delta) in entries(table) {
        let current = if line_delta == NO_LINE {
            None
        } else {
            line += i64::from(line_delta);
            u32::try_from(line).ok()
        };
        if addr_delta == 0 {
            continue;
        }
        let end = addr + u32::from(addr_delta);
        match ranges.last_mut() {
            Some(last) if last.line == current => last.end = end,
            _ => ranges.push(LineRange {
                start: addr,
                end,
                line: current,
            }),
        }
        addr = end;
    }
    ranges
}

/// Line of the code byte at `offset`, if the table covers it with a line.
#[must_use]
pub fn line_for_offset(table: &[u8], first_line: u32, offset: u32) -> Option<u32> {
    decode(table, first_line)
        .into_iter()
        .find(|r| r.start <= offset && offset < r.end)
        .and_then(|r| r.line)
}

/// Re-encodes `table` after the code it describes has been compacted.
///
/// `map` sends an old byte offset to its new byte offset and must be
/// monotonic; it is also called with the old code length. Runs that map to an
/// empty span are dropped.
#[must_use]
pub fn remap(table: &[u8], first_line: u32, mut map: impl FnMut(u32) -> u32) -> Box<[u8]> {
    let mut builder = LineTableBuilder::new(first_line);
    for range in decode(table, first_line) {
        let start = map(range.start);
        let end = map(range.end);
        if end <= start {
            continue;
        }
        builder.next_line(range.line);
        builder.add_code(end - start);
    }
    builder.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(first_line: u32, runs: &[(Option<u32>, u32)]) -> Box<[u8]> {
        let mut builder = LineTableBuilder::new(first_line);
        for &(line, bytes) in runs {
            builder.next_line(line);
            builder.add_code(bytes);
        }
        builder.finish()
    }

    fn assert_well_formed(table: &[u8]) {
        assert_eq!(table.len() % 2, 0);
        for (addr, line) in entries(table) {
            assert!(addr <= 254, "address delta {addr}");
            assert!(addr != 0 || line != 0, "(0, 0) entry");
        }
    }

    #[test]
    fn test_simple_table() {
        let table = build(1, &[(Some(1), 4), (Some(2), 6), (Some(4), 2)]);
        assert_eq!(&*table, &[4, 0, 6, 1, 2, 2]);
        assert_eq!(
            decode(&table, 1),
            vec![
                LineRange { start: 0, end: 4, line: Some(1) },
                LineRange { start: 4, end: 10, line: Some(2) },
                LineRange { start: 10, end: 12, line: Some(4) },
            ]
        );
    }

    #[test]
    fn test_large_line_jump_is_split() {
        let table = build(1, &[(Some(1), 2), (Some(301), 2), (Some(1), 2)]);
        assert_well_formed(&table);
        let pairs: Vec<_> = entries(&table).collect();
        assert_eq!(pairs, vec![(2, 0), (0, 127), (0, 127), (2, 46), (0, -127), (0, -127), (2, -46)]);
        assert_eq!(line_for_offset(&table, 1, 2), Some(301));
        assert_eq!(line_for_offset(&table, 1, 5), Some(1));
    }

    #[test]
    fn test_long_run_is_split() {
        let table = build(10, &[(Some(12), 600)]);
        assert_well_formed(&table);
        let pairs: Vec<_> = entries(&table).collect();
        assert_eq!(pairs, vec![(254, 2), (254, 0), (92, 0)]);
        assert_eq!(
            decode(&table, 10),
            vec![LineRange { start: 0, end: 600, line: Some(12) }]
        );
    }

    #[test]
    fn test_no_line_runs() {
        let table = build(5, &[(Some(5), 2), (None, 300), (Some(7), 2)]);
        assert_well_formed(&table);
        let pairs: Vec<_> = entries(&table).collect();
        assert_eq!(pairs, vec![(2, 0), (254, NO_LINE), (46, NO_LINE), (2, 2)]);
        assert_eq!(line_for_offset(&table, 5, 100), None);
        assert_eq!(line_for_offset(&table, 5, 303), Some(7));
    }

    #[test]
    fn test_line_zero_keeps_current_line() {
        let table = build(3, &[(Some(3), 2), (Some(0), 2), (Some(4), 2)]);
        assert_eq!(
            decode(&table, 3),
            vec![
                LineRange { start: 0, end: 4, line: Some(3) },
                LineRange { start: 4, end: 6, line: Some(4) },
            ]
        );
    }

    #[test]
    fn test_remap_drops_empty_runs() {
        // lines 1, 2, 3 over units [0, 1), [1, 3), [3, 4); units 1 and 2 are removed
        let table = build(1, &[(Some(1), 2), (Some(2), 4), (Some(3), 2)]);
        let keep = [0u32, 1, 1, 1, 2];
        let remapped = remap(&table, 1, |offset| keep[(offset / 2) as usize] * 2);
        assert_well_formed(&remapped);
        assert_eq!(
            decode(&remapped, 1),
            vec![
                LineRange { start: 0, end: 2, line: Some(1) },
                LineRange { start: 2, end: 4, line: Some(3) },
            ]
        );
    }
}
