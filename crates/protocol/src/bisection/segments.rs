//! The segments module splits a disputed interval into the sub-intervals of a bisection.

use super::StepRange;

/// Returns the number of segments a bisection of `width` steps is split into.
pub fn segment_count(width: u64, fan_out: u64) -> u64 {
    width.min(fan_out)
}

/// Splits `range` into the segments of one bisection round.
///
/// An interval at least as wide as `fan_out` is split into `fan_out` segments whose sizes differ
/// by at most one step, with the larger segments first. A narrower interval is split into unit
/// steps. Every segment is therefore strictly narrower than `range` whenever its width is above
/// one.
///
/// ### Takes
/// - `range`: The interval to split.
/// - `fan_out`: The configured number of segments per bisection. Must be at least 2.
///
/// ### Returns
/// - `Vec<StepRange>`: Contiguous segments covering `range` in ascending order.
pub fn partition(range: StepRange, fan_out: u64) -> Vec<StepRange> {
    let width = range.width();
    let count = segment_count(width, fan_out);
    if count == 0 {
        return Vec::new();
    }

    let base = width / count;
    let remainder = width % count;

    let mut lower = range.lower;
    (0..count)
        .map(|i| {
            let size = base + u64::from(i < remainder);
            let segment = StepRange::new(lower, lower + size);
            lower += size;
            segment
        })
        .collect()
}

/// Returns the maximum number of bisection rounds needed to narrow `total_steps` down to a
/// single step: `⌈log_fan_out(total_steps)⌉`.
pub fn max_rounds(total_steps: u64, fan_out: u64) -> u32 {
    let mut rounds = 0;
    let mut reach: u128 = 1;
    while reach < total_steps as u128 {
        reach *= fan_out as u128;
        rounds += 1;
    }
    rounds
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn partition_is_contiguous_and_balanced() {
        for fan_out in 2..=6u64 {
            for width in 1..=100u64 {
                let range = StepRange::new(7, 7 + width);
                let segments = partition(range, fan_out);

                assert_eq!(segments.len() as u64, segment_count(width, fan_out));
                assert_eq!(segments.first().unwrap().lower, range.lower);
                assert_eq!(segments.last().unwrap().upper, range.upper);
                for pair in segments.windows(2) {
                    assert_eq!(pair[0].upper, pair[1].lower);
                    assert!(pair[0].width() >= pair[1].width());
                    assert!(pair[0].width() - pair[1].width() <= 1);
                }
                if width > 1 {
                    assert!(segments.iter().all(|s| s.width() < width && s.width() > 0));
                }
            }
        }
    }

    #[test]
    fn narrow_intervals_split_into_unit_steps() {
        let segments = partition(StepRange::new(4, 7), 4);
        assert_eq!(
            segments,
            vec![StepRange::new(4, 5), StepRange::new(5, 6), StepRange::new(6, 7)]
        );
    }

    #[test]
    fn uneven_split_front_loads_remainder() {
        let segments = partition(StepRange::new(0, 8), 3);
        assert_eq!(
            segments,
            vec![StepRange::new(0, 3), StepRange::new(3, 6), StepRange::new(6, 8)]
        );
    }

    #[test]
    fn max_rounds_static() {
        assert_eq!(max_rounds(1, 2), 0);
        assert_eq!(max_rounds(2, 2), 1);
        assert_eq!(max_rounds(8, 2), 3);
        assert_eq!(max_rounds(9, 2), 4);
        assert_eq!(max_rounds(8, 3), 2);
        assert_eq!(max_rounds(9, 3), 2);
        assert_eq!(max_rounds(10, 3), 3);
    }
}
