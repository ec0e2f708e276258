//! Schedules for the matmul-plus-bias kernel and the space they are drawn from.

use crate::common::{DimSize, MatmulDims};
use crate::utils::{is_power_of_two, iter_powers_of_two};

use divrem::DivCeil;
use itertools::iproduct;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;

/// Order of the loops inside a tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
#[serde(rename_all = "lowercase")]
pub enum LoopOrder {
    /// Broadcast `A[i, k]` across a row of `B`; the innermost loop is over `j`.
    Ikj,
    /// Dot products; the innermost loop is the reduction over `k`.
    Ijk,
}

const LOOP_ORDERS: [LoopOrder; 2] = [LoopOrder::Ikj, LoopOrder::Ijk];

/// Loop-transformation and layout decisions for one kernel.
///
/// Tiles have arbitrary sizes up to the extent of their dimension. Tiles
/// touching the end of a dimension are truncated, so tile sizes need not
/// divide the problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Schedule {
    pub tile_m: DimSize,
    pub tile_n: DimSize,
    pub tile_k: DimSize,
    pub loop_order: LoopOrder,
    /// Repack the layout-free `B` into contiguous `tile_n`-wide column panels.
    pub pack_b: bool,
    /// Distribute row tiles of the output over the thread pool.
    pub parallel: bool,
}

impl Schedule {
    /// The untiled, serial schedule: a single tile covering the whole problem.
    pub fn naive(dims: &MatmulDims) -> Self {
        Schedule {
            tile_m: dims.m,
            tile_n: dims.n,
            tile_k: dims.k,
            loop_order: LoopOrder::Ikj,
            pack_b: false,
            parallel: false,
        }
    }

    pub fn is_valid_for(&self, dims: &MatmulDims) -> bool {
        self.tile_m <= dims.m && self.tile_n <= dims.n && self.tile_k <= dims.k
    }

    /// Returns the number of tiles along each of M, N and K, including boundary tiles.
    pub fn steps(&self, dims: &MatmulDims) -> [u32; 3] {
        [
            DivCeil::div_ceil(dims.m.get(), self.tile_m.get()),
            DivCeil::div_ceil(dims.n.get(), self.tile_n.get()),
            DivCeil::div_ceil(dims.k.get(), self.tile_k.get()),
        ]
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tile=({}, {}, {}) order={}",
            self.tile_m,
            self.tile_n,
            self.tile_k,
            match self.loop_order {
                LoopOrder::Ikj => "ikj",
                LoopOrder::Ijk => "ijk",
            }
        )?;
        if self.pack_b {
            f.write_str(" pack_b")?;
        }
        if self.parallel {
            f.write_str(" parallel")?;
        }
        Ok(())
    }
}

/// Yields the ranges covered by tiles of size `tile` over `0..extent`.
///
/// The last range is truncated when `tile` does not divide `extent`.
pub fn tile_ranges(extent: usize, tile: usize) -> impl Iterator<Item = Range<usize>> {
    debug_assert!(tile > 0);
    (0..extent)
        .step_by(tile)
        .map(move |start| start..(start + tile).min(extent))
}

/// All schedules applicable to a problem.
///
/// Schedules are enumerated in mixed-radix order so any schedule can be
/// addressed by an index in `0..len()`.
#[derive(Debug, Clone)]
pub struct ScheduleSpace {
    tiles_m: Vec<DimSize>,
    tiles_n: Vec<DimSize>,
    tiles_k: Vec<DimSize>,
    allow_pack_b: bool,
    allow_parallel: bool,
}

impl ScheduleSpace {
    /// `allow_pack_b` should only be set when `B` is layout-free, and
    /// `allow_parallel` only when more than one thread is available.
    pub fn new(dims: &MatmulDims, allow_pack_b: bool, allow_parallel: bool) -> Self {
        ScheduleSpace {
            tiles_m: tile_candidates(dims.m),
            tiles_n: tile_candidates(dims.n),
            tiles_k: tile_candidates(dims.k),
            allow_pack_b,
            allow_parallel,
        }
    }

    fn pack_b_options(&self) -> usize {
        1 + usize::from(self.allow_pack_b)
    }

    fn parallel_options(&self) -> usize {
        1 + usize::from(self.allow_parallel)
    }

    pub fn len(&self) -> usize {
        self.tiles_m.len()
            * self.tiles_n.len()
            * self.tiles_k.len()
            * LOOP_ORDERS.len()
            * self.pack_b_options()
            * self.parallel_options()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Decodes the schedule at `index`; `None` if `index >= len()`.
    pub fn get(&self, index: usize) -> Option<Schedule> {
        if index >= self.len() {
            return None;
        }
        let mut rest = index;
        let mut digit = |radix: usize| {
            let d = rest % radix;
            rest /= radix;
            d
        };
        let tile_m = self.tiles_m[digit(self.tiles_m.len())];
        let tile_n = self.tiles_n[digit(self.tiles_n.len())];
        let tile_k = self.tiles_k[digit(self.tiles_k.len())];
        let loop_order = LOOP_ORDERS[digit(LOOP_ORDERS.len())];
        let pack_b = digit(self.pack_b_options()) == 1;
        let parallel = digit(self.parallel_options()) == 1;
        Some(Schedule {
            tile_m,
            tile_n,
            tile_k,
            loop_order,
            pack_b,
            parallel,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = Schedule> + '_ {
        let pack_b_choices = [false, true][..self.pack_b_options()].to_vec();
        let parallel_choices = [false, true][..self.parallel_options()].to_vec();
        iproduct!(
            self.tiles_m.iter().copied(),
            self.tiles_n.iter().copied(),
            self.tiles_k.iter().copied(),
            LOOP_ORDERS,
            pack_b_choices,
            parallel_choices
        )
        .map(
            |(tile_m, tile_n, tile_k, loop_order, pack_b, parallel)| Schedule {
                tile_m,
                tile_n,
                tile_k,
                loop_order,
                pack_b,
                parallel,
            },
        )
    }
}

/// Candidate tile sizes for a dimension: powers of two up to `extent`, plus `extent`.
fn tile_candidates(extent: DimSize) -> Vec<DimSize> {
    let mut candidates = iter_powers_of_two(extent.get().into())
        .map(|p| DimSize::new(p as u32).expect("powers of two are non-zero"))
        .collect::<Vec<_>>();
    if !is_power_of_two(extent.get().into()) {
        candidates.push(extent);
    }
    candidates
}
