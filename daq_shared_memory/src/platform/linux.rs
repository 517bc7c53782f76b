//! Linux shared memory objects under `/dev/shm`

use crate::error::ShmResult;
use crate::layout::CONTROL_BLOCK_SIZE;
use daq::consts::{SEGMENT_NAME_PREFIX, SHM_DIR};
use memmap2::{MmapMut, MmapOptions};
use nix::unistd::getpid;
use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

/// Backing file of the segment with `key`.
pub fn segment_path(key: u32) -> PathBuf {
    Path::new(SHM_DIR).join(format!("{SEGMENT_NAME_PREFIX}{key:08x}"))
}

/// Exclusively create and map a zero-filled segment.
///
/// Returns `Ok(None)` when another process created it first.
pub fn create_segment_mmap(path: &Path, size: usize) -> ShmResult<Option<MmapMut>> {
    let file = match OpenOptions::new()
        .create_new(true)
        .read(true)
        .write(true)
        .mode(0o600) // Owner read/write only
        .open(path)
    {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    file.set_len(size as u64)?;

    // SAFETY: the file was just created by us with the requested length;
    // concurrent modification by peers goes through the atomics in the layout.
    let mmap = unsafe { MmapOptions::new().len(size).map_mut(&file)? };
    Ok(Some(mmap))
}

/// Map an existing segment at its current length.
///
/// Returns `Ok(None)` if the segment does not exist or is too short to hold
/// a control block yet.
pub fn attach_segment_mmap(path: &Path) -> ShmResult<Option<MmapMut>> {
    let file = match OpenOptions::new().read(true).write(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let len = file.metadata()?.len() as usize;
    if len < CONTROL_BLOCK_SIZE {
        return Ok(None);
    }

    // SAFETY: see `create_segment_mmap`; the length is re-checked against the
    // control block before any slot is touched.
    let mmap = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
    Ok(Some(mmap))
}

/// Unlink a segment; peers that already mapped it keep their mapping.
pub fn remove_segment(path: &Path) -> ShmResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Whether a segment object exists for `key`.
pub fn segment_exists(key: u32) -> bool {
    segment_path(key).exists()
}

/// Get current process ID
pub fn get_current_pid() -> u32 {
    getpid().as_raw() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_uses_hex_key() {
        assert_eq!(
            segment_path(0xBEE7).to_str(),
            Some("/dev/shm/daq_shm_0000bee7")
        );
    }

    #[test]
    fn create_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("segment");

        let first = create_segment_mmap(&path, 4096).unwrap();
        assert_eq!(first.map(|m| m.len()), Some(4096));
        assert!(create_segment_mmap(&path, 4096).unwrap().is_none());

        let attached = attach_segment_mmap(&path).unwrap().unwrap();
        assert_eq!(attached.len(), 4096);
        assert!(attached.iter().all(|&b| b == 0));

        remove_segment(&path).unwrap();
        remove_segment(&path).unwrap();
        assert!(attach_segment_mmap(&path).unwrap().is_none());
    }

    #[test]
    fn short_file_is_not_ready() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short");
        std::fs::write(&path, [0u8; 16]).unwrap();
        assert!(attach_segment_mmap(&path).unwrap().is_none());
    }
}
