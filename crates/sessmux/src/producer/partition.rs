//! Partition arithmetic for the event-array thread pool
//!
//! Sessions live in one shared vector; each polling thread owns a
//! contiguous `[offset, offset + count)` window of it. These helpers
//! compute the window sizes for a given session count so the coordinator
//! can re-partition after every registry update.

/// Window sizes for `num_sessions` sessions.
///
/// The number of groups is `ceil(num_sessions / max_events_per_thread)`,
/// floored by `minimum_threads`; sessions are spread as evenly as
/// possible, with the remainder going to the leading groups. Groups may be
/// empty when the minimum thread count exceeds demand.
pub fn polling_group_sizes(
    num_sessions: usize,
    max_events_per_thread: u32,
    minimum_threads: u32,
) -> Vec<usize> {
    let max_per_thread = (max_events_per_thread.max(1)) as usize;
    let minimum_threads = (minimum_threads.max(1)) as usize;

    let groups = num_sessions.div_ceil(max_per_thread).max(minimum_threads);

    let base = num_sessions / groups;
    let remainder = num_sessions % groups;

    (0..groups)
        .map(|index| base + usize::from(index < remainder))
        .collect()
}

/// Starting offsets of the windows described by `sizes`.
pub fn group_offsets(sizes: &[usize]) -> Vec<usize> {
    let mut offsets = Vec::with_capacity(sizes.len());
    let mut offset = 0;

    for size in sizes {
        offsets.push(offset);
        offset += size;
    }

    offsets
}
