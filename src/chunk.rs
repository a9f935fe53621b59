/// Byte offset at which chunk `index` of a file begins.
pub fn chunk_offset(chunk_size: u64, index: u64) -> u64 {
    chunk_size.saturating_mul(index)
}

/// File length implied by a chunkserver reporting `length` defined bytes in chunk `index`.
pub fn implied_file_length(chunk_size: u64, index: u64, length: u64) -> u64 {
    chunk_offset(chunk_size, index).saturating_add(length)
}
