//! Derived per-size-class ("bin") statistics.
//!
//! jemalloc partitions small allocations into bins; each bin owns slabs of
//! `nregs` regions of `size` bytes. From the live region and slab counts the
//! façade derives how much memory each size class keeps resident and how
//! fragmented its slabs are.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::mallctl;

/// Arena index understood by the stats namespace as "all arenas, merged".
pub(crate) const MALLCTL_ARENAS_ALL: usize = 4096;

/// Fragmentation and residency of one size class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BinStats {
    #[serde(rename = "FragPercent")]
    pub frag_percent: u64,
    #[serde(rename = "Resident")]
    pub resident: u64,
}

/// `100 - floor(100 * curregs / (curslabs * nregs))`, clamped to `[0, 100]`;
/// 0 when either denominator is zero.
pub(crate) fn compute_bin_frag(curregs: u64, curslabs: u64, nregs: u64) -> u64 {
    if curslabs == 0 || nregs == 0 {
        return 0;
    }
    100u64.saturating_sub((100 * curregs) / (curslabs * nregs))
}

/// Bytes kept resident by a bin: `curslabs * nregs * size`.
pub(crate) fn compute_bin_resident(curslabs: u64, nregs: u64, size: u64) -> u64 {
    curslabs * nregs * size
}

/// Collect `{ "bin_<size>": stats }` for every size class, merged across all
/// arenas. Controls that cannot be read count as zero, like the native shim.
pub(crate) fn collect() -> BTreeMap<String, BinStats> {
    let nbins: u32 = mallctl::read("arenas.nbins").unwrap_or(0);

    let mut bins = BTreeMap::new();
    for i in 0..nbins {
        let size: usize = mallctl::read(&format!("arenas.bin.{i}.size")).unwrap_or(0);
        let nregs: u32 = mallctl::read(&format!("arenas.bin.{i}.nregs")).unwrap_or(0);
        let curregs: usize =
            mallctl::read(&format!("stats.arenas.{MALLCTL_ARENAS_ALL}.bins.{i}.curregs"))
                .unwrap_or(0);
        let curslabs: usize =
            mallctl::read(&format!("stats.arenas.{MALLCTL_ARENAS_ALL}.bins.{i}.curslabs"))
                .unwrap_or(0);

        bins.insert(
            format!("bin_{size}"),
            BinStats {
                frag_percent: compute_bin_frag(curregs as u64, curslabs as u64, nregs as u64),
                resident: compute_bin_resident(curslabs as u64, nregs as u64, size as u64),
            },
        );
    }

    bins
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::{compute_bin_frag, compute_bin_resident};

    #[rstest]
    #[case(75, 5, 20, 25)] // 100 - floor(100*75/100)
    #[case(100, 5, 20, 0)] // fully occupied
    #[case(0, 5, 20, 100)] // empty slabs
    #[case(1, 3, 100, 100)] // floor rounds the occupancy term to zero
    #[case(75, 0, 20, 0)] // no slabs
    #[case(75, 5, 0, 0)] // no regions per slab
    #[case(300, 5, 20, 0)] // overfull input clamps instead of wrapping
    fn frag_formula(
        #[case] curregs: u64,
        #[case] curslabs: u64,
        #[case] nregs: u64,
        #[case] expected: u64,
    ) {
        assert_eq!(compute_bin_frag(curregs, curslabs, nregs), expected);
    }

    #[test]
    fn resident_formula() {
        assert_eq!(compute_bin_resident(5, 20, 64), 6400);
        assert_eq!(compute_bin_resident(0, 20, 64), 0);
    }
}
