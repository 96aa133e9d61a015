//! Root manifest: the authoritative set of persisted segments
//!
//! The manifest names the persisted segment ids of the current root, with
//! their deletion bitmaps, and is rewritten atomically (temp file + fsync +
//! rename + directory fsync) after each introduction that changes the
//! persisted segment set. Startup recovery adopts the files it names and
//! removes the rest.

use std::fs;
use std::io::Write;
use std::path::Path;

use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TrawlError};
use crate::segment::file::{sync_parent_dir, temp_path};
use crate::segment::SegmentId;

use super::snapshot::IndexSnapshot;

/// Manifest file name inside the index directory
pub const MANIFEST_FILE: &str = "trawl.manifest";

/// One persisted segment named by the manifest
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub id: SegmentId,
    pub doc_count: u32,
    /// Serialized deletion bitmap, absent when nothing is deleted
    pub deleted: Option<Vec<u8>>,
}

impl ManifestEntry {
    /// Decode the deletion bitmap carried by this entry
    pub fn deleted_bitmap(&self) -> Result<Option<RoaringBitmap>> {
        match &self.deleted {
            None => Ok(None),
            Some(bytes) => {
                let bitmap = RoaringBitmap::deserialize_from(&bytes[..]).map_err(|e| {
                    TrawlError::Corrupt {
                        path: MANIFEST_FILE.to_string(),
                        detail: format!("undecodable deletion bitmap: {}", e),
                    }
                })?;
                Ok(Some(bitmap))
            }
        }
    }
}

/// The manifest tracks the persisted half of the current root
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    /// Epoch of the snapshot this manifest reflects
    pub epoch: u64,
    /// Next segment id to allocate; ids are never reused across restarts
    pub next_segment_id: u64,
    pub segments: Vec<ManifestEntry>,
}

impl Manifest {
    pub const VERSION: u32 = 1;

    pub fn empty() -> Self {
        Self {
            version: Self::VERSION,
            epoch: 0,
            next_segment_id: 0,
            segments: Vec::new(),
        }
    }

    /// Capture the persisted segments of a snapshot
    pub fn from_snapshot(snapshot: &IndexSnapshot, next_segment_id: u64) -> Result<Self> {
        let mut segments = Vec::new();
        for seg in snapshot.segments() {
            if !seg.segment().is_persisted() {
                continue;
            }
            let deleted = match seg.deleted() {
                None => None,
                Some(bitmap) => {
                    let mut bytes = Vec::new();
                    bitmap
                        .serialize_into(&mut bytes)
                        .map_err(TrawlError::Io)?;
                    Some(bytes)
                }
            };
            segments.push(ManifestEntry {
                id: seg.id(),
                doc_count: seg.full_count(),
                deleted,
            });
        }
        Ok(Self {
            version: Self::VERSION,
            epoch: snapshot.epoch(),
            next_segment_id,
            segments,
        })
    }

    pub fn contains(&self, id: SegmentId) -> bool {
        self.segments.iter().any(|e| e.id == id)
    }
}

/// Write the manifest atomically into `dir`
pub fn write_manifest(dir: &Path, manifest: &Manifest) -> Result<()> {
    let path = dir.join(MANIFEST_FILE);
    let bytes = bincode::serialize(manifest)?;

    let tmp = temp_path(&path);
    {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, &path)?;
    sync_parent_dir(&path)?;
    Ok(())
}

/// Load the manifest from `dir`; absent manifest means a fresh index.
/// A present but undecodable manifest is an invariant violation.
pub fn load_manifest(dir: &Path) -> Result<Option<Manifest>> {
    let path = dir.join(MANIFEST_FILE);
    let bytes = match fs::read(&path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let manifest: Manifest = bincode::deserialize(&bytes).map_err(|_| TrawlError::Corrupt {
        path: path.display().to_string(),
        detail: "undecodable manifest".to_string(),
    })?;
    if manifest.version != Manifest::VERSION {
        return Err(TrawlError::Corrupt {
            path: path.display().to_string(),
            detail: format!("unsupported manifest version {}", manifest.version),
        });
    }
    Ok(Some(manifest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_load_roundtrip() {
        let dir = TempDir::new().unwrap();

        let mut deleted = RoaringBitmap::new();
        deleted.insert(3);
        let mut bytes = Vec::new();
        deleted.serialize_into(&mut bytes).unwrap();

        let manifest = Manifest {
            version: Manifest::VERSION,
            epoch: 7,
            next_segment_id: 12,
            segments: vec![ManifestEntry {
                id: SegmentId::new(4),
                doc_count: 10,
                deleted: Some(bytes),
            }],
        };

        write_manifest(dir.path(), &manifest).unwrap();
        let loaded = load_manifest(dir.path()).unwrap().unwrap();

        assert_eq!(loaded.epoch, 7);
        assert_eq!(loaded.next_segment_id, 12);
        assert_eq!(loaded.segments.len(), 1);
        assert!(loaded.contains(SegmentId::new(4)));

        let bitmap = loaded.segments[0].deleted_bitmap().unwrap().unwrap();
        assert!(bitmap.contains(3));
        assert_eq!(bitmap.len(), 1);
    }

    #[test]
    fn test_missing_manifest() {
        let dir = TempDir::new().unwrap();
        assert!(load_manifest(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_corrupt_manifest() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(MANIFEST_FILE), b"garbage").unwrap();
        assert!(matches!(
            load_manifest(dir.path()),
            Err(TrawlError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_rewrite_replaces_atomically() {
        let dir = TempDir::new().unwrap();

        write_manifest(dir.path(), &Manifest::empty()).unwrap();
        let mut manifest = Manifest::empty();
        manifest.epoch = 3;
        write_manifest(dir.path(), &manifest).unwrap();

        let loaded = load_manifest(dir.path()).unwrap().unwrap();
        assert_eq!(loaded.epoch, 3);
        assert!(!dir.path().join(format!("{}.tmp", MANIFEST_FILE)).exists());
    }
}
