/// Integer division rounding toward negative infinity.
///
/// # Examples
/// ```
/// # use optiling::utils::div_rtn;
/// assert_eq!(div_rtn(-1, 2), -1);
/// assert_eq!(div_rtn(7, 2), 3);
/// assert_eq!(div_rtn(-4, 2), -2);
/// ```
pub fn div_rtn(x: i64, y: i64) -> i64 {
    debug_assert!(y > 0);
    divrem::DivFloor::div_floor(x, y)
}

/// Ceiling division for non-negative operands. Returns 0 when `y` is not positive.
pub fn ceil_div(x: i64, y: i64) -> i64 {
    if y <= 0 {
        return 0;
    }
    divrem::DivCeil::div_ceil(x, y)
}

/// Rounds `x` up to a multiple of `align`. Returns `x` when `align` is not positive.
pub fn ceil_align(x: i64, align: i64) -> i64 {
    if align <= 0 {
        return x;
    }
    ceil_div(x, align) * align
}

/// Rounds `x` down to a multiple of `align`. Returns `x` when `align` is not positive.
pub fn floor_align(x: i64, align: i64) -> i64 {
    if align <= 0 {
        return x;
    }
    x / align * align
}

/// Largest power of two not exceeding `n`, or 0 for non-positive `n`.
pub const fn prev_power_of_two(n: i64) -> i64 {
    if n <= 0 {
        return 0;
    }
    let highest_bit_set_idx = (i64::BITS - 1) - n.leading_zeros();
    1 << highest_bit_set_idx
}

/// Smallest power of two not less than `n`; 1 for non-positive `n`.
pub const fn next_power_of_two(n: i64) -> i64 {
    if n <= 1 {
        return 1;
    }
    (n as u64).next_power_of_two() as i64
}

pub const fn bit_length(n: u64) -> u32 {
    u64::BITS - n.leading_zeros()
}

/// An even split of `total` units of work over at most `cores` cores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSplit {
    pub used_cores: i64,
    pub block_factor: i64,
    pub block_tail: i64,
}

/// Splits `total` over `min(total, cores)` cores.
///
/// Every core but the last receives `block_factor` units; the last receives
/// `block_tail`, which is in `1..=block_factor`. Returns `None` if `total` or `cores`
/// is not positive.
pub fn split_evenly(total: i64, cores: i64) -> Option<BlockSplit> {
    if total <= 0 || cores <= 0 {
        return None;
    }
    let block_factor = ceil_div(total, total.min(cores));
    let used_cores = ceil_div(total, block_factor);
    let block_tail = total - block_factor * (used_cores - 1);
    Some(BlockSplit {
        used_cores,
        block_factor,
        block_tail,
    })
}

/// Returns the largest value in `lo..=hi` for which `fits` holds, assuming `fits` is
/// monotone (true up to some threshold, false after). Returns `lo` if nothing fits.
pub fn binary_search_max(lo: i64, hi: i64, mut fits: impl FnMut(i64) -> bool) -> i64 {
    let (mut left, mut right) = (lo, hi);
    let mut best = lo;
    while left <= right {
        let mid = left + (right - left) / 2;
        if fits(mid) {
            best = mid;
            left = mid + 1;
        } else {
            right = mid - 1;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_div_rtn_negative_dividend() {
        assert_eq!(div_rtn(-1, 2), -1);
        assert_eq!(div_rtn(-3, 2), -2);
        assert_eq!(div_rtn(0, 5), 0);
    }

    #[test]
    fn test_powers_of_two() {
        assert_eq!(prev_power_of_two(0), 0);
        assert_eq!(prev_power_of_two(1), 1);
        assert_eq!(prev_power_of_two(1000), 512);
        assert_eq!(prev_power_of_two(1024), 1024);
        assert_eq!(next_power_of_two(0), 1);
        assert_eq!(next_power_of_two(17), 32);
        assert_eq!(next_power_of_two(64), 64);
    }

    #[test]
    fn test_alignment() {
        assert_eq!(ceil_align(2560, 32), 2560);
        assert_eq!(ceil_align(33, 32), 64);
        assert_eq!(floor_align(63, 16), 48);
        assert_eq!(ceil_div(10, 0), 0);
    }

    #[test]
    fn test_split_evenly_rejects_empty() {
        assert_eq!(split_evenly(0, 8), None);
        assert_eq!(split_evenly(8, 0), None);
    }

    proptest! {
        #[test]
        fn test_div_rtn_matches_float_floor(x in -10_000i64..10_000, y in 1i64..100) {
            let expected = ((x as f64) / (y as f64)).floor() as i64;
            prop_assert_eq!(div_rtn(x, y), expected);
        }

        #[test]
        fn test_split_evenly_covers_total(total in 1i64..100_000, cores in 1i64..128) {
            let split = split_evenly(total, cores).unwrap();
            prop_assert!(split.used_cores >= 1 && split.used_cores <= cores);
            prop_assert!(split.block_tail >= 1 && split.block_tail <= split.block_factor);
            prop_assert_eq!(
                split.block_factor * (split.used_cores - 1) + split.block_tail,
                total
            );
        }

        #[test]
        fn test_binary_search_max_finds_threshold(threshold in 0i64..1000) {
            let found = binary_search_max(0, 1000, |v| v <= threshold);
            prop_assert_eq!(found, threshold);
        }
    }
}
