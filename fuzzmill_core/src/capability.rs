//! Detection of optional fuzz target capabilities.
//!
//! There is no query interface for these, so detection scans the target
//! binary for strings that only builds with the capability contain. Callers
//! must treat a negative answer as "use the fallback", never as an error.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// Present in libFuzzer builds recent enough to support multistep merge
/// (merge control files reused across invocations).
pub const MULTISTEP_MERGE_SUPPORT_TOKEN: &[u8] = b"fuzz target overwrites its const input";

const SCAN_CHUNK_SIZE: usize = 64 * 1024;

/// Whether the target supports incremental two-step merge. Missing or
/// unreadable targets report `false`.
pub fn supports_multistep_merge(target_path: &Path) -> bool {
    match File::open(target_path) {
        Ok(file) => search_bytes_in_reader(MULTISTEP_MERGE_SUPPORT_TOKEN, file).unwrap_or_else(|e| {
            tracing::warn!(target = %target_path.display(), error = %e, "failed to scan target for merge support");
            false
        }),
        Err(_) => false,
    }
}

/// Streams `reader` looking for `needle`, keeping enough overlap between
/// chunks to find matches that straddle a chunk boundary.
pub fn search_bytes_in_reader<R: Read>(needle: &[u8], mut reader: R) -> io::Result<bool> {
    if needle.is_empty() {
        return Ok(true);
    }
    let overlap = needle.len() - 1;
    let mut window: Vec<u8> = Vec::with_capacity(SCAN_CHUNK_SIZE + overlap);
    let mut chunk = vec![0u8; SCAN_CHUNK_SIZE];

    loop {
        let read = reader.read(&mut chunk)?;
        if read == 0 {
            return Ok(false);
        }
        window.extend_from_slice(&chunk[..read]);
        if window.windows(needle.len()).any(|w| w == needle) {
            return Ok(true);
        }
        let keep_from = window.len().saturating_sub(overlap);
        window.drain(..keep_from);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::tempdir;

    #[test]
    fn finds_token_across_chunk_boundary() {
        let mut data = vec![0u8; SCAN_CHUNK_SIZE - 5];
        data.extend_from_slice(MULTISTEP_MERGE_SUPPORT_TOKEN);
        data.extend_from_slice(&[1, 2, 3]);
        assert!(search_bytes_in_reader(MULTISTEP_MERGE_SUPPORT_TOKEN, Cursor::new(data)).unwrap());
    }

    #[test]
    fn reports_absent_token() {
        let data = vec![b'a'; SCAN_CHUNK_SIZE * 2 + 17];
        assert!(!search_bytes_in_reader(MULTISTEP_MERGE_SUPPORT_TOKEN, Cursor::new(data)).unwrap());
    }

    #[test]
    fn probes_target_files() {
        let dir = tempdir().unwrap();
        let modern = dir.path().join("modern");
        let legacy = dir.path().join("legacy");
        let mut binary = b"\x7fELF....".to_vec();
        binary.extend_from_slice(MULTISTEP_MERGE_SUPPORT_TOKEN);
        std::fs::write(&modern, binary).unwrap();
        std::fs::write(&legacy, b"\x7fELF no marker").unwrap();

        assert!(supports_multistep_merge(&modern));
        assert!(!supports_multistep_merge(&legacy));
        assert!(!supports_multistep_merge(&dir.path().join("missing")));
    }
}
