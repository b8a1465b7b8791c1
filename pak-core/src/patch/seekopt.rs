//! Patch seek optimization.
//!
//! A patch archive holds only changed files, so reading a run of files in
//! load order may bounce between the patch and the base archive. Pulling
//! small runs of unchanged files into the patch trades size for fewer seeks.

use crate::collect::collector::BuildEntry;
use crate::error::{PakError, Result};
use crate::order::map::NO_ORDER;
use tracing::{debug, info, warn};

pub const DEFAULT_MAX_ADJACENT_ORDER_DIFF: u64 = 128;
const MIN_INCREMENTAL_GAP: u64 = 4 * 1024;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SeekOptMode {
    #[default]
    None,
    OnePass,
    Incremental,
    IncrementalPrimaryOnly,
    IncrementalPrimaryThenSecondary,
}

#[derive(Clone, Debug)]
pub struct SeekOptParams {
    pub mode: SeekOptMode,
    pub max_gap_size: u64,
    pub max_inflation_percent: f64,
    pub max_adjacent_order_diff: u64,
}

impl Default for SeekOptParams {
    fn default() -> Self {
        Self {
            mode: SeekOptMode::None,
            max_gap_size: 0,
            max_inflation_percent: 0.0,
            max_adjacent_order_diff: DEFAULT_MAX_ADJACENT_ORDER_DIFF,
        }
    }
}

impl SeekOptParams {
    pub fn validate(&self) -> Result<()> {
        if self.mode == SeekOptMode::None {
            return Ok(());
        }
        if self.max_gap_size == 0 {
            return Err(PakError::config("seek optimization requires a max gap size above 0"));
        }
        let incremental = !matches!(self.mode, SeekOptMode::OnePass);
        if incremental && self.max_inflation_percent <= 0.0 {
            return Err(PakError::config(
                "incremental seek optimization requires a max inflation percent above 0",
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Iteration {
    Applied,
    OverBudget { size: u64, budget: u64 },
    NoImprovement,
}

/// What an optimization run changed.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SeekOptSummary {
    pub original_size: u64,
    pub final_size: u64,
    pub files_added: usize,
    pub fragmentation_before: f32,
    pub fragmentation_after: f32,
}

/// Candidates in build order with their sizes and `.uasset`/`.uexp`
/// counterpart indices.
pub struct SeekOptimizer<'a> {
    entries: &'a [BuildEntry],
    sizes: &'a [u64],
    pairs: &'a [Option<usize>],
    max_adjacent_order_diff: u64,
}

impl<'a> SeekOptimizer<'a> {
    pub fn new(
        entries: &'a [BuildEntry],
        sizes: &'a [u64],
        pairs: &'a [Option<usize>],
        max_adjacent_order_diff: u64,
    ) -> Self {
        debug_assert_eq!(entries.len(), sizes.len());
        debug_assert_eq!(entries.len(), pairs.len());
        Self {
            entries,
            sizes,
            pairs,
            max_adjacent_order_diff,
        }
    }

    pub fn patch_size(&self, keep: &[bool]) -> u64 {
        keep.iter()
            .zip(self.sizes)
            .filter(|(k, _)| **k)
            .map(|(_, s)| *s)
            .sum()
    }

    /// Share of considered entries that start a new contiguous run.
    pub fn fragmentation(&self, keep: &[bool], consider_secondary: bool) -> f32 {
        let mut prev_order = NO_ORDER;
        let mut prev_bit = false;
        let mut transitions: i64 = 0;
        let mut considered: i64 = 0;
        for (e, &bit) in self.entries.iter().zip(keep) {
            if !consider_secondary && !e.is_primary_order {
                prev_order = NO_ORDER;
                continue;
            }
            let order_diff = e.suggested_order.wrapping_sub(prev_order);
            if order_diff > self.max_adjacent_order_diff || bit != prev_bit {
                transitions += 1;
            }
            considered += 1;
            prev_order = e.suggested_order;
            prev_bit = bit;
        }
        if considered == 0 {
            return 0.0;
        }
        // the first entry always counts as a transition
        100.0 * (transitions - 1) as f32 / considered as f32
    }

    /// Keeps the counterpart of every kept half of a pair.
    fn add_orphaned_files(&self, keep: &mut [bool]) -> usize {
        let mut added = 0;
        for i in 0..keep.len() {
            if let Some(j) = self.pairs[i] {
                if keep[i] != keep[j] {
                    keep[i] = true;
                    keep[j] = true;
                    added += 1;
                }
            }
        }
        added
    }

    fn gap_filling_iteration(
        &self,
        keep: &mut Vec<bool>,
        max_gap: u64,
        force: bool,
        max_patch_size: u64,
        fill_primary: bool,
        fill_secondary: bool,
    ) -> Iteration {
        let mut trial = keep.clone();
        let before = self.fragmentation(&trial, true);

        let mut current_offset = 0u64;
        let mut patch_offset = 0u64;
        let mut gap = 0u64;
        let mut prev_keep = false;
        let mut prev_order = NO_ORDER;
        let mut kept_so_far = 0usize;
        let mut last_keep: Option<usize> = None;
        let mut unbroken = true;
        let mut pulled_in = 0usize;

        for i in 0..self.entries.len() {
            let e = &self.entries[i];
            let kept = trial[i];
            let excluded = (e.is_primary_order && !fill_primary) || (!e.is_primary_order && !fill_secondary);
            if e.suggested_order == NO_ORDER || excluded {
                continue;
            }
            current_offset += self.sizes[i];
            if kept {
                kept_so_far += 1;
                patch_offset = current_offset;
            } else if kept_so_far > 0 {
                gap = current_offset - patch_offset;
            }

            // a jump in load order inside the gap means filling it saves no seek
            if unbroken && e.suggested_order.wrapping_sub(prev_order) > self.max_adjacent_order_diff {
                unbroken = false;
            }

            if kept && !prev_keep && gap > 0 {
                if gap <= max_gap && unbroken {
                    let from = last_keep.map_or(0, |k| k + 1);
                    for slot in &mut trial[from..i] {
                        *slot = true;
                        pulled_in += 1;
                    }
                }
                unbroken = true;
            }
            prev_keep = kept;
            if kept {
                last_keep = Some(i);
            }
            prev_order = e.suggested_order;
        }
        let orphans = self.add_orphaned_files(&mut trial);

        let size = self.patch_size(&trial);
        let label = match (fill_primary, fill_secondary) {
            (true, false) => "[PRIMARY] ",
            (false, true) => "[SECONDARY] ",
            _ => "",
        };
        if size > max_patch_size && !force {
            debug!("seek optimization step {label}gap {}KB failed: patch too big", max_gap / 1024);
            return Iteration::OverBudget {
                size,
                budget: max_patch_size,
            };
        }
        let after = self.fragmentation(&trial, true);
        if after >= before && !force {
            debug!(
                "seek optimization step {label}gap {}KB failed: fragmentation did not improve",
                max_gap / 1024
            );
            return Iteration::NoImprovement;
        }
        debug!(
            pulled_in,
            orphans,
            "seek optimization step {label}gap {}KB succeeded",
            max_gap / 1024
        );
        *keep = trial;
        Iteration::Applied
    }

    /// Doubles the gap from 4 KiB up to `max_gap`; on the first failure one
    /// more try at 75% of that gap, then stop.
    fn incremental(
        &self,
        keep: &mut Vec<bool>,
        max_gap: u64,
        fill_primary: bool,
        fill_secondary: bool,
        max_patch_size: u64,
    ) -> (bool, Option<Iteration>) {
        let mut gap = MIN_INCREMENTAL_GAP;
        let mut success = false;
        let mut last_failure = None;
        while gap <= max_gap {
            match self.gap_filling_iteration(keep, gap, false, max_patch_size, fill_primary, fill_secondary) {
                Iteration::Applied => success = true,
                failed => {
                    last_failure = Some(failed);
                    let retry = (gap as f64 * 0.75) as u64;
                    match self.gap_filling_iteration(
                        keep,
                        retry,
                        false,
                        max_patch_size,
                        fill_primary,
                        fill_secondary,
                    ) {
                        Iteration::Applied => success = true,
                        failed => last_failure = Some(failed),
                    }
                    break;
                }
            }
            gap *= 2;
        }
        (success, last_failure)
    }

    pub fn apply(&self, keep: &mut Vec<bool>, params: &SeekOptParams) -> Result<SeekOptSummary> {
        params.validate()?;
        let original_size = self.patch_size(keep);
        let original_count = keep.iter().filter(|k| **k).count();
        let mut summary = SeekOptSummary {
            original_size,
            fragmentation_before: self.fragmentation(keep, true),
            ..Default::default()
        };
        let primary_before = self.fragmentation(keep, false);
        let max_patch_size =
            (original_size as f64 + original_size as f64 * params.max_inflation_percent * 0.01) as u64;
        let gap = params.max_gap_size;

        let mut outcomes = Vec::new();
        match params.mode {
            SeekOptMode::None => {}
            SeekOptMode::OnePass => {
                self.gap_filling_iteration(keep, gap, true, 0, true, true);
            }
            SeekOptMode::Incremental | SeekOptMode::IncrementalPrimaryOnly => {
                let secondary = params.mode == SeekOptMode::Incremental;
                outcomes.push(self.incremental(keep, gap, true, secondary, max_patch_size));
            }
            SeekOptMode::IncrementalPrimaryThenSecondary => {
                let first_budget =
                    original_size + ((max_patch_size - original_size) as f64 * 0.9) as u64;
                let passes = [
                    (first_budget, true, false),
                    (max_patch_size, false, true),
                    (max_patch_size, true, false),
                ];
                for (budget, primary, secondary) in passes {
                    outcomes.push(self.incremental(keep, gap, primary, secondary, budget));
                }
            }
        }
        for (success, failure) in outcomes {
            if let (false, Some(Iteration::OverBudget { size, budget })) = (success, failure) {
                warn!(error = %PakError::Capacity { size, budget }, "seek optimization pass added nothing");
            }
        }

        summary.final_size = self.patch_size(keep);
        summary.files_added = keep.iter().filter(|k| **k).count() - original_count;
        summary.fragmentation_after = self.fragmentation(keep, true);
        if params.mode != SeekOptMode::None {
            info!(
                original_size,
                final_size = summary.final_size,
                files_added = summary.files_added,
                fragmentation_before = summary.fragmentation_before,
                fragmentation_after = summary.fragmentation_after,
                primary_before,
                primary_after = self.fragmentation(keep, false),
                "patch seek optimization finished"
            );
        }
        Ok(summary)
    }
}
