//! Parallel processing utilities.

use rayon::prelude::*;

/// Multiplier for number of chunks relative to CPU threads.
/// Over-splitting by 3x keeps workers busy when chunks finish unevenly.
const CHUNKS_PER_THREAD: usize = 3;

/// Compute chunk size for the given length.
#[inline]
fn auto_chunk_size(len: usize) -> usize {
    let num_chunks = rayon::current_num_threads() * CHUNKS_PER_THREAD;
    (len / num_chunks).max(1)
}

/// Split a slice into parallel chunks yielding `(offset, chunk)` pairs.
pub(crate) fn par_chunks_auto<T: Sync>(
    data: &[T],
) -> impl IndexedParallelIterator<Item = (usize, &[T])> {
    let chunk_size = auto_chunk_size(data.len());
    data.par_chunks(chunk_size)
        .enumerate()
        .map(move |(idx, chunk)| (idx * chunk_size, chunk))
}

/// Split a mutable slice into parallel chunks yielding `(offset, chunk)` pairs.
pub(crate) fn par_chunks_mut_auto<T: Send>(
    data: &mut [T],
) -> impl IndexedParallelIterator<Item = (usize, &mut [T])> {
    let chunk_size = auto_chunk_size(data.len());
    data.par_chunks_mut(chunk_size)
        .enumerate()
        .map(move |(idx, chunk)| (idx * chunk_size, chunk))
}

/// Split a mutable slice into row-aligned parallel chunks.
/// Yields `(y_start, chunk)` pairs where each chunk holds complete rows.
pub(crate) fn par_rows_mut_auto<T: Send>(
    data: &mut [T],
    width: usize,
) -> impl IndexedParallelIterator<Item = (usize, &mut [T])> {
    debug_assert!(width > 0);
    let height = data.len() / width;
    let chunk_rows = auto_chunk_size(height);
    data.par_chunks_mut(width * chunk_rows)
        .enumerate()
        .map(move |(idx, chunk)| (idx * chunk_rows, chunk))
}
