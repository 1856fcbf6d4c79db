//! Commit points
//!
//! Publication is two-phase:
//! 1. Sync every referenced segment file
//! 2. Write `pending_segments_N` and sync it
//! 3. Rename it to `segments_N`, then refresh `segments.gen`
//!
//! A reader only ever sees a commit whose files are all durable. A failed
//! step leaves at most a `pending_segments_N` behind, which the file
//! deleter removes on the next open.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use tracing::{debug, warn};

use super::file_names::{
    file_name_from_generation, generation_from_segments_file_name, PENDING_SEGMENTS, SEGMENTS,
    SEGMENTS_GEN,
};
use super::segment_info::SegmentCommitInfo;
use crate::codec::{decode_framed, encode_framed};
use crate::error::{IndexError, Result};
use crate::store::Directory;

/// Ordered segment list plus commit metadata
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SegmentInfos {
    /// Generation of the last commit this list was read from or written as
    pub generation: u64,
    /// Bumped on every in-memory change
    pub version: u64,
    /// Next segment name counter
    pub counter: u64,
    pub segments: Vec<SegmentCommitInfo>,
    pub user_data: BTreeMap<String, String>,
}

impl SegmentInfos {
    pub fn new() -> Self {
        Self::default()
    }

    /// `segments_N` for the current generation
    pub fn segments_file_name(&self) -> Option<String> {
        file_name_from_generation(SEGMENTS, self.generation)
    }

    /// Record an in-memory change
    pub fn changed(&mut self) {
        self.version += 1;
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn total_max_doc(&self) -> u64 {
        self.segments.iter().map(|s| s.max_doc() as u64).sum()
    }

    pub fn total_live_docs(&self) -> u64 {
        self.segments.iter().map(|s| s.live_doc_count() as u64).sum()
    }

    pub fn total_size_bytes(&self) -> u64 {
        self.segments.iter().map(|s| s.size_in_bytes).sum()
    }

    pub fn segment(&self, name: &str) -> Option<&SegmentCommitInfo> {
        self.segments.iter().find(|s| s.name() == name)
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.segments.iter().position(|s| s.name() == name)
    }

    /// Files referenced by the segments, optionally with the commit file itself
    pub fn files(&self, include_segments_file: bool) -> BTreeSet<String> {
        let mut files: BTreeSet<String> = self.segments.iter().flat_map(|s| s.files()).collect();
        if include_segments_file {
            files.extend(self.segments_file_name());
        }
        files
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(encode_framed(&bincode::serialize(self)?))
    }

    pub fn from_bytes(data: &[u8], resource: &str) -> Result<Self> {
        let payload = decode_framed(data, resource)?;
        bincode::deserialize(payload).map_err(|e| IndexError::corrupt(resource, e))
    }

    /// Pretty JSON for diagnostics
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| {
            IndexError::Io(io::Error::new(io::ErrorKind::InvalidData, e))
        })
    }

    /// Read a specific commit point
    pub fn read(dir: &dyn Directory, segments_file: &str) -> Result<Self> {
        let generation = generation_from_segments_file_name(segments_file).ok_or_else(|| {
            IndexError::IllegalState(format!("not a commit point file: {}", segments_file))
        })?;
        let data = dir.open_input(segments_file)?;
        let infos = Self::from_bytes(&data, segments_file)?;
        if infos.generation != generation {
            return Err(IndexError::corrupt(
                segments_file,
                format!("file generation {} but body says {}", generation, infos.generation),
            ));
        }
        Ok(infos)
    }

    /// Read the newest intact commit point in `dir`
    ///
    /// A corrupt commit point falls back to the next older generation. The
    /// corruption is only returned when no generation reads cleanly.
    pub fn read_latest(dir: &dyn Directory) -> Result<Self> {
        // A concurrent writer may delete the file between list and open
        let mut attempts = 0;
        'listing: loop {
            let files = dir.list_all()?;
            let generations = commit_generations(&files);
            if generations.is_empty() {
                return Err(IndexError::IndexNotFound(format!(
                    "no segments_N file in {:?}",
                    files
                )));
            }

            let mut corruption = None;
            for generation in generations {
                let name = file_name_from_generation(SEGMENTS, generation)
                    .ok_or_else(|| IndexError::IllegalState("generation 0".to_string()))?;
                match Self::read(dir, &name) {
                    Ok(infos) => {
                        if corruption.is_some() {
                            warn!(file = %name, "fell back to an older commit point");
                        }
                        return Ok(infos);
                    }
                    Err(IndexError::Io(e)) if e.kind() == io::ErrorKind::NotFound && attempts < 3 => {
                        attempts += 1;
                        debug!(file = %name, "commit point vanished while opening; retrying");
                        continue 'listing;
                    }
                    Err(e) if e.is_corruption() => {
                        warn!(file = %name, error = %e, "skipping corrupt commit point");
                        corruption.get_or_insert(e);
                    }
                    Err(e) => return Err(e),
                }
            }
            if let Some(e) = corruption {
                return Err(e);
            }
        }
    }

    /// Phase one: write and sync `pending_segments_<generation>`
    pub(crate) fn write_pending(&mut self, dir: &dyn Directory, generation: u64) -> Result<String> {
        self.generation = generation;
        let pending = file_name_from_generation(PENDING_SEGMENTS, generation)
            .ok_or_else(|| IndexError::IllegalState("generation 0".to_string()))?;
        let bytes = self.to_bytes()?;
        let result = dir
            .write_file(&pending, &bytes)
            .and_then(|_| dir.sync(&[pending.clone()]));
        if let Err(e) = result {
            if dir.file_exists(&pending) {
                // the file deleter removes a leftover on the next open
                if let Err(delete_err) = dir.delete_file(&pending) {
                    warn!(file = %pending, error = %delete_err, "failed to remove pending commit file");
                }
            }
            return Err(e);
        }
        Ok(pending)
    }

    /// Phase two: publish the pending file as `segments_<generation>`
    pub(crate) fn finish_commit(&self, dir: &dyn Directory, pending: &str) -> Result<String> {
        let name = self
            .segments_file_name()
            .ok_or_else(|| IndexError::IllegalState("generation 0".to_string()))?;
        dir.rename(pending, &name)?;

        // The pointer is advisory; readers fall back to listing
        if let Err(e) = write_generation_pointer(dir, self.generation) {
            warn!(generation = self.generation, error = %e, "failed to write segments.gen");
        }
        Ok(name)
    }
}

/// Highest `segments_N` generation among `files`
pub fn last_commit_generation(files: &[String]) -> Option<u64> {
    files
        .iter()
        .filter_map(|f| generation_from_segments_file_name(f))
        .max()
}

/// Every `segments_N` generation among `files`, newest first
fn commit_generations(files: &[String]) -> Vec<u64> {
    let mut generations: Vec<u64> = files
        .iter()
        .filter_map(|f| generation_from_segments_file_name(f))
        .filter(|&g| g > 0)
        .collect();
    generations.sort_unstable_by(|a, b| b.cmp(a));
    generations
}

fn write_generation_pointer(dir: &dyn Directory, generation: u64) -> Result<()> {
    let tmp = format!("{}.tmp", SEGMENTS_GEN);
    if dir.file_exists(&tmp) {
        dir.delete_file(&tmp)?;
    }
    let mut body = Vec::with_capacity(16);
    body.extend_from_slice(&generation.to_le_bytes());
    body.extend_from_slice(&generation.to_le_bytes());
    dir.write_file(&tmp, &encode_framed(&body))?;
    dir.sync(&[tmp.clone()])?;
    dir.rename(&tmp, SEGMENTS_GEN)
}

/// Generation recorded in `segments.gen`, if present and intact
pub fn read_generation_pointer(dir: &dyn Directory) -> Option<u64> {
    let data = dir.open_input(SEGMENTS_GEN).ok()?;
    let body = decode_framed(&data, SEGMENTS_GEN).ok()?;
    if body.len() != 16 || body[..8] != body[8..] {
        return None;
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&body[..8]);
    Some(u64::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::segment_info::SegmentInfo;
    use crate::store::{FaultInjector, FaultOp, RamDirectory};
    use std::sync::Arc;

    fn infos_with(names: &[&str]) -> SegmentInfos {
        let mut infos = SegmentInfos::new();
        for name in names {
            let info = SegmentInfo::new(*name, 10, "c", true)
                .with_files(vec![format!("{}.cfs", name)]);
            infos.segments.push(SegmentCommitInfo::new(info, 100));
        }
        infos.counter = names.len() as u64;
        infos
    }

    #[test]
    fn test_two_phase_publish() {
        let dir = RamDirectory::new();
        let mut infos = infos_with(&["_0", "_1"]);
        infos.user_data.insert("k".to_string(), "v".to_string());

        let pending = infos.write_pending(&dir, 1).unwrap();
        assert_eq!(pending, "pending_segments_1");
        assert!(SegmentInfos::read_latest(&dir).is_err());

        let name = infos.finish_commit(&dir, &pending).unwrap();
        assert_eq!(name, "segments_1");
        assert!(!dir.file_exists(&pending));
        assert_eq!(read_generation_pointer(&dir), Some(1));

        let read = SegmentInfos::read_latest(&dir).unwrap();
        assert_eq!(read.generation, 1);
        assert_eq!(read.len(), 2);
        assert_eq!(read.total_max_doc(), 20);
        assert_eq!(read.user_data.get("k").map(String::as_str), Some("v"));
        assert!(read.files(true).contains("segments_1"));
    }

    #[test]
    fn test_read_latest_picks_highest_generation() {
        let dir = RamDirectory::new();
        let mut first = infos_with(&["_0"]);
        let pending = first.write_pending(&dir, 1).unwrap();
        first.finish_commit(&dir, &pending).unwrap();

        let mut second = infos_with(&["_0", "_1"]);
        let pending = second.write_pending(&dir, 2).unwrap();
        second.finish_commit(&dir, &pending).unwrap();

        assert_eq!(SegmentInfos::read_latest(&dir).unwrap().generation, 2);
        assert_eq!(
            SegmentInfos::read(&dir, "segments_1").unwrap().len(),
            1
        );
    }

    #[test]
    fn test_empty_directory_has_no_index() {
        let dir = RamDirectory::new();
        assert!(matches!(
            SegmentInfos::read_latest(&dir),
            Err(IndexError::IndexNotFound(_))
        ));
    }

    #[test]
    fn test_failed_pending_write_leaves_nothing() {
        let faults = Arc::new(FaultInjector::new());
        let dir = RamDirectory::with_faults(faults.clone());
        faults.fail_times(FaultOp::Sync, "pending_segments", 1);

        let mut infos = infos_with(&["_0"]);
        assert!(infos.write_pending(&dir, 1).is_err());
        assert!(dir.list_all().unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_commit_point() {
        let dir = RamDirectory::new();
        let mut bytes = infos_with(&["_0"]).to_bytes().unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        dir.write_file("segments_1", &bytes).unwrap();

        assert!(SegmentInfos::read_latest(&dir).unwrap_err().is_corruption());
    }

    #[test]
    fn test_corrupt_newest_commit_falls_back() {
        let dir = RamDirectory::new();
        let mut first = infos_with(&["_0"]);
        let pending = first.write_pending(&dir, 1).unwrap();
        first.finish_commit(&dir, &pending).unwrap();

        let mut second = infos_with(&["_0", "_1"]);
        second.generation = 2;
        let mut bytes = second.to_bytes().unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        dir.write_file("segments_2", &bytes).unwrap();

        let read = SegmentInfos::read_latest(&dir).unwrap();
        assert_eq!(read.generation, 1);
        assert_eq!(read.len(), 1);
        assert_eq!(commit_generations(&dir.list_all().unwrap()), vec![2, 1]);
    }

    #[test]
    fn test_failed_cleanup_keeps_the_original_error() {
        let faults = Arc::new(FaultInjector::new());
        let dir = RamDirectory::with_faults(faults.clone());
        faults.fail_times(FaultOp::Sync, "pending_segments", 1);
        faults.fail_times(FaultOp::Delete, "pending_segments", 1);

        let mut infos = infos_with(&["_0"]);
        let err = infos.write_pending(&dir, 1).unwrap_err();
        assert!(err.to_string().contains("Sync"), "{}", err);

        let ops: Vec<FaultOp> = faults.fired().into_iter().map(|(op, _)| op).collect();
        assert_eq!(ops, vec![FaultOp::Sync, FaultOp::Delete]);
        // left for the file deleter
        assert!(dir.file_exists("pending_segments_1"));
    }
}
