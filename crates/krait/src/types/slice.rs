//! Slice objects and CPython index resolution.

use std::fmt;

use crate::exception::{ExcKind, RunResult};

/// A slice with optional start/stop/step, as built by `BUILD_SLICE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Slice {
    pub start: Option<i64>,
    pub stop: Option<i64>,
    pub step: Option<i64>,
}

/// Concrete index walk produced by resolving a slice against a length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ResolvedSlice {
    pub start: i64,
    pub step: i64,
    pub len: usize,
}

impl ResolvedSlice {
    /// Iterates the concrete indices of the resolved slice.
    pub fn indices(self) -> impl Iterator<Item = usize> {
        (0..self.len).map(move |i| {
            usize::try_from(self.start + self.step * i as i64).expect("resolved index in range")
        })
    }
}

impl Slice {
    pub fn new(start: Option<i64>, stop: Option<i64>, step: Option<i64>) -> Self {
        Self { start, stop, step }
    }

    /// Normalises the slice against a sequence length, CPython
    /// `PySlice_GetIndicesEx` semantics: negative indices add the length,
    /// out-of-range bounds clamp towards the direction of travel, and the
    /// result length is `max(0, (stop - start + step -+ 1) / step)`.
    pub fn resolve(self, length: usize) -> RunResult<ResolvedSlice> {
        let length = length as i64;
        let step = self.step.unwrap_or(1);
        if step == 0 {
            return Err(ExcKind::ValueError.err("slice step cannot be zero"));
        }

        let mut start = match self.start {
            None => {
                if step < 0 {
                    length - 1
                } else {
                    0
                }
            }
            Some(mut s) => {
                if s < 0 {
                    s += length;
                }
                if s < 0 {
                    if step < 0 { -1 } else { 0 }
                } else if s >= length {
                    if step < 0 { length - 1 } else { length }
                } else {
                    s
                }
            }
        };
        let stop = match self.stop {
            None => {
                if step < 0 {
                    -1
                } else {
                    length
                }
            }
            Some(mut s) => {
                if s < 0 {
                    s += length;
                }
                if s < 0 {
                    if step < 0 { -1 } else { 0 }
                } else if s >= length {
                    if step < 0 { length - 1 } else { length }
                } else {
                    s
                }
            }
        };

        let len = if (step < 0 && stop >= start) || (step > 0 && start >= stop) {
            0
        } else if step < 0 {
            ((stop - start + 1) / step + 1) as usize
        } else {
            ((stop - start - 1) / step + 1) as usize
        };
        if len == 0 {
            // keep start in range so indices() stays trivially valid
            start = 0;
        }
        Ok(ResolvedSlice { start, step, len })
    }
}

impl fmt::Display for Slice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let part = |v: Option<i64>| v.map_or_else(|| "None".to_owned(), |i| i.to_string());
        write!(
            f,
            "slice({}, {}, {})",
            part(self.start),
            part(self.stop),
            part(self.step)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve(start: Option<i64>, stop: Option<i64>, step: Option<i64>, len: usize) -> Vec<usize> {
        Slice::new(start, stop, step)
            .resolve(len)
            .unwrap()
            .indices()
            .collect()
    }

    #[test]
    fn full_reverse() {
        assert_eq!(resolve(None, None, Some(-1), 4), vec![3, 2, 1, 0]);
    }

    #[test]
    fn every_other() {
        assert_eq!(resolve(None, None, Some(2), 5), vec![0, 2, 4]);
    }

    #[test]
    fn negative_bounds_clamp() {
        assert_eq!(resolve(Some(-2), None, None, 4), vec![2, 3]);
        assert_eq!(resolve(Some(-100), Some(100), None, 3), vec![0, 1, 2]);
        assert_eq!(resolve(Some(2), Some(1), None, 4), Vec::<usize>::new());
    }

    #[test]
    fn zero_step_is_value_error() {
        assert!(Slice::new(None, None, Some(0)).resolve(3).is_err());
    }
}
