use crate::pipeline::types::Direction;

/// Destination column in the output raster for a frame.
///
/// `Forward` puts the earliest frame at the right edge, `Reverse` at the left
/// edge. Requires `frame_index < frame_count`.
#[inline]
pub fn destination_column(frame_index: usize, frame_count: usize, direction: Direction) -> usize {
    debug_assert!(frame_index < frame_count);
    match direction {
        Direction::Forward => frame_count - frame_index - 1,
        Direction::Reverse => frame_index,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn assert_bijection(frame_count: usize, direction: Direction) {
        let columns: HashSet<usize> = (0..frame_count)
            .map(|i| destination_column(i, frame_count, direction))
            .collect();
        assert_eq!(columns.len(), frame_count, "column collision for {:?}", direction);
        assert!(columns.iter().all(|&c| c < frame_count));
    }

    #[test]
    fn test_destination_column_is_bijection() {
        for frame_count in [1, 2, 7, 100, 1001] {
            assert_bijection(frame_count, Direction::Forward);
            assert_bijection(frame_count, Direction::Reverse);
        }
    }

    #[test]
    fn test_forward_mirrors_reverse() {
        assert_eq!(destination_column(0, 100, Direction::Forward), 99);
        assert_eq!(destination_column(99, 100, Direction::Forward), 0);
        assert_eq!(destination_column(0, 100, Direction::Reverse), 0);
        assert_eq!(destination_column(42, 100, Direction::Reverse), 42);
    }
}
