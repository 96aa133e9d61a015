//! Segment file format: write, open, merge
//!
//! One persisted segment is one file in the index directory, named from its
//! segment id. Layout:
//!
//! ```text
//! [postings][field tables][doc ids][stored chunks][footer][footer_len u32][magic u32]
//! ```
//!
//! Field tables carry each field's FST bytes and posting metadata. Stored
//! rows are grouped into chunks of `chunk_factor` documents, each chunk
//! encoded independently. A CRC32 over the four data regions is verified at
//! open; a mismatch reports corruption so the caller can quarantine the
//! file. Writes go through a temp file, fsync, and atomic rename.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TrawlError};

use super::data::SegmentData;
use super::merge::merge_segment_data;
use super::term_dict::TermDictionary;
use super::types::{PostingListMeta, SegmentId};

const MAGIC: u32 = 0x4c57_5254; // "TRWL"
const VERSION: u32 = 1;

/// File name of a persisted segment
pub fn segment_file_name(id: SegmentId) -> String {
    format!("{:012x}.seg", id.0)
}

/// Extension used for segment files
pub const SEGMENT_EXTENSION: &str = "seg";

#[derive(Serialize, Deserialize)]
struct FieldTable {
    name: String,
    fst: Vec<u8>,
    metas: Vec<PostingListMeta>,
}

#[derive(Serialize, Deserialize)]
struct Footer {
    version: u32,
    doc_count: u32,
    postings_len: u64,
    fields_len: u64,
    doc_ids_len: u64,
    stored_len: u64,
    chunk_factor: u32,
    checksum: u32,
}

/// Write a segment to `path`. Returns the content checksum.
pub fn write(data: &SegmentData, path: &Path, chunk_factor: u32) -> Result<u32> {
    let chunk_factor = chunk_factor.max(1);

    let fields: Vec<FieldTable> = data
        .fields()
        .iter()
        .map(|name| {
            let dict = data.dictionary(name).expect("field without dictionary");
            FieldTable {
                name: name.clone(),
                fst: dict.fst_bytes().to_vec(),
                metas: dict.metas().to_vec(),
            }
        })
        .collect();
    let fields_bytes = bincode::serialize(&fields)?;
    let doc_ids_bytes = bincode::serialize(&data.doc_ids_vec())?;

    let chunks: Vec<Vec<u8>> = data
        .stored_rows()
        .chunks(chunk_factor as usize)
        .map(bincode::serialize)
        .collect::<std::result::Result<_, _>>()?;
    let stored_bytes = bincode::serialize(&chunks)?;

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data.postings_bytes());
    hasher.update(&fields_bytes);
    hasher.update(&doc_ids_bytes);
    hasher.update(&stored_bytes);
    let checksum = hasher.finalize();

    let footer = Footer {
        version: VERSION,
        doc_count: data.doc_count(),
        postings_len: data.postings_bytes().len() as u64,
        fields_len: fields_bytes.len() as u64,
        doc_ids_len: doc_ids_bytes.len() as u64,
        stored_len: stored_bytes.len() as u64,
        chunk_factor,
        checksum,
    };
    let footer_bytes = bincode::serialize(&footer)?;

    let tmp_path = temp_path(path);
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(data.postings_bytes())?;
        file.write_all(&fields_bytes)?;
        file.write_all(&doc_ids_bytes)?;
        file.write_all(&stored_bytes)?;
        file.write_all(&footer_bytes)?;
        file.write_all(&(footer_bytes.len() as u32).to_le_bytes())?;
        file.write_all(&MAGIC.to_le_bytes())?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    sync_parent_dir(path)?;

    Ok(checksum)
}

/// Open a segment file, verifying its checksum
pub fn open(path: &Path) -> Result<SegmentData> {
    let bytes = fs::read(path)?;
    let corrupt = |detail: &str| TrawlError::Corrupt {
        path: path.display().to_string(),
        detail: detail.to_string(),
    };

    if bytes.len() < 8 {
        return Err(corrupt("file too short"));
    }

    let magic = u32::from_le_bytes(bytes[bytes.len() - 4..].try_into().unwrap());
    if magic != MAGIC {
        return Err(corrupt("bad magic"));
    }

    let footer_len =
        u32::from_le_bytes(bytes[bytes.len() - 8..bytes.len() - 4].try_into().unwrap()) as usize;
    if footer_len + 8 > bytes.len() {
        return Err(corrupt("bad footer length"));
    }

    let footer_start = bytes.len() - 8 - footer_len;
    let footer: Footer = bincode::deserialize(&bytes[footer_start..footer_start + footer_len])
        .map_err(|_| corrupt("undecodable footer"))?;

    if footer.version != VERSION {
        return Err(corrupt("unsupported version"));
    }

    let total =
        footer.postings_len + footer.fields_len + footer.doc_ids_len + footer.stored_len;
    if total != footer_start as u64 {
        return Err(corrupt("section lengths disagree with file size"));
    }

    let postings_end = footer.postings_len as usize;
    let fields_end = postings_end + footer.fields_len as usize;
    let doc_ids_end = fields_end + footer.doc_ids_len as usize;

    let postings = &bytes[..postings_end];
    let fields_bytes = &bytes[postings_end..fields_end];
    let doc_ids_bytes = &bytes[fields_end..doc_ids_end];
    let stored_bytes = &bytes[doc_ids_end..footer_start];

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(postings);
    hasher.update(fields_bytes);
    hasher.update(doc_ids_bytes);
    hasher.update(stored_bytes);
    if hasher.finalize() != footer.checksum {
        return Err(corrupt("checksum mismatch"));
    }

    let field_tables: Vec<FieldTable> =
        bincode::deserialize(fields_bytes).map_err(|_| corrupt("undecodable field tables"))?;
    let doc_ids: Vec<String> =
        bincode::deserialize(doc_ids_bytes).map_err(|_| corrupt("undecodable doc ids"))?;
    let chunks: Vec<Vec<u8>> =
        bincode::deserialize(stored_bytes).map_err(|_| corrupt("undecodable stored chunks"))?;

    let mut stored: Vec<BTreeMap<String, String>> = Vec::with_capacity(doc_ids.len());
    for chunk in &chunks {
        let rows: Vec<BTreeMap<String, String>> =
            bincode::deserialize(chunk).map_err(|_| corrupt("undecodable stored rows"))?;
        stored.extend(rows);
    }
    if stored.len() != doc_ids.len() {
        return Err(corrupt("stored row count disagrees with doc count"));
    }

    let mut fields = Vec::with_capacity(field_tables.len());
    let mut dicts = HashMap::with_capacity(field_tables.len());
    for table in field_tables {
        let dict = TermDictionary::new(table.fst, table.metas)
            .map_err(|_| corrupt("undecodable term dictionary"))?;
        dicts.insert(table.name.clone(), dict);
        fields.push(table.name);
    }
    fields.sort();

    Ok(SegmentData::assemble(
        footer.doc_count,
        fields,
        dicts,
        postings.to_vec(),
        doc_ids,
        stored,
    ))
}

/// Merge segments into a new file at `path`, dropping deleted documents.
///
/// Returns one translation vector per input segment: entry `i` is the new
/// local docnum of old local `i`, or [`super::types::DROPPED_DOC`].
pub fn merge(
    olds: &[&SegmentData],
    drops: &[Option<&RoaringBitmap>],
    path: &Path,
    chunk_factor: u32,
) -> Result<Vec<Vec<u32>>> {
    let (merged, translations) = merge_segment_data(olds, drops)?;
    write(&merged, path, chunk_factor)?;
    Ok(translations)
}

/// Rename a corrupt segment file aside so recovery can proceed without it
pub fn quarantine(path: &Path) -> Result<PathBuf> {
    let mut target = path.as_os_str().to_owned();
    target.push(".quarantine");
    let target = PathBuf::from(target);
    fs::rename(path, &target)?;
    sync_parent_dir(path)?;
    Ok(target)
}

pub(crate) fn temp_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

pub(crate) fn sync_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        File::open(parent)?.sync_all()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::Analyzer;
    use crate::config::AnalyzerConfig;
    use crate::document::Document;
    use crate::segment::types::DocNo;
    use tempfile::TempDir;

    fn segment(docs: Vec<Document>) -> SegmentData {
        let analyzer = Analyzer::new(&AnalyzerConfig::default());
        SegmentData::from_analyzed(docs.iter().map(|d| analyzer.analyze(d)).collect()).unwrap()
    }

    #[test]
    fn test_segment_file_name() {
        assert_eq!(segment_file_name(SegmentId::new(7)), "000000000007.seg");
        assert_eq!(segment_file_name(SegmentId::new(0xabc)), "000000000abc.seg");
    }

    #[test]
    fn test_write_open_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(segment_file_name(SegmentId::new(1)));

        let data = segment(vec![
            Document::new("a").with_field("body", "rust programming language"),
            Document::new("b").with_field("body", "systems programming"),
        ]);

        write(&data, &path, 1024).unwrap();
        assert!(path.exists());
        assert!(!temp_path(&path).exists());

        let opened = open(&path).unwrap();
        assert_eq!(opened.doc_count(), 2);
        assert_eq!(opened.external_id(DocNo::new(0)), Some("a"));
        assert_eq!(opened.docno_for_id("b"), Some(DocNo::new(1)));

        let dict = opened.dictionary("body").unwrap();
        assert_eq!(dict.get("programming").unwrap().doc_frequency, 2);

        let postings: Vec<_> = opened
            .postings("body", "rust")
            .unwrap()
            .unwrap()
            .collect::<std::io::Result<_>>()
            .unwrap();
        assert_eq!(postings.len(), 1);
        assert_eq!(postings[0].docno, DocNo::new(0));
        assert_eq!(postings[0].norm, 3);

        let row = opened.stored_fields(DocNo::new(1)).unwrap();
        assert_eq!(
            row.get("body").map(|s| s.as_str()),
            Some("systems programming")
        );
    }

    #[test]
    fn test_open_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(segment_file_name(SegmentId::new(2)));
        let data = segment(vec![Document::new("a").with_field("body", "once")]);
        write(&data, &path, 4).unwrap();

        let first = open(&path).unwrap();
        let second = open(&path).unwrap();
        assert_eq!(first.doc_count(), second.doc_count());
        assert_eq!(
            first.external_id(DocNo::new(0)),
            second.external_id(DocNo::new(0))
        );
    }

    #[test]
    fn test_small_chunk_factor() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(segment_file_name(SegmentId::new(3)));

        let docs: Vec<_> = (0..10)
            .map(|i| Document::new(format!("doc{}", i)).with_field("body", format!("text {}", i)))
            .collect();
        write(&segment(docs), &path, 3).unwrap();

        let opened = open(&path).unwrap();
        assert_eq!(opened.doc_count(), 10);
        assert_eq!(opened.external_id(DocNo::new(9)), Some("doc9"));
    }

    #[test]
    fn test_corrupt_detection() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(segment_file_name(SegmentId::new(4)));
        let data = segment(vec![Document::new("a").with_field("body", "payload here")]);
        write(&data, &path, 1024).unwrap();

        // flip a byte in the data region
        let mut bytes = fs::read(&path).unwrap();
        bytes[0] ^= 0xff;
        fs::write(&path, &bytes).unwrap();

        match open(&path) {
            Err(TrawlError::Corrupt { .. }) => {}
            other => panic!("expected corruption error, got {:?}", other.map(|d| d.doc_count())),
        }
    }

    #[test]
    fn test_truncated_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(segment_file_name(SegmentId::new(5)));
        fs::write(&path, b"abc").unwrap();
        assert!(matches!(open(&path), Err(TrawlError::Corrupt { .. })));
    }

    #[test]
    fn test_merge_to_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(segment_file_name(SegmentId::new(9)));

        let a = segment(vec![Document::new("a").with_field("body", "alpha")]);
        let b = segment(vec![Document::new("b").with_field("body", "beta")]);

        let translations = merge(&[&a, &b], &[None, None], &path, 1024).unwrap();
        assert_eq!(translations, vec![vec![0], vec![1]]);

        let opened = open(&path).unwrap();
        assert_eq!(opened.doc_count(), 2);
        assert!(opened.dictionary("body").unwrap().contains("beta"));
    }

    #[test]
    fn test_quarantine() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(segment_file_name(SegmentId::new(6)));
        fs::write(&path, b"junk").unwrap();

        let target = quarantine(&path).unwrap();
        assert!(!path.exists());
        assert!(target.exists());
        assert!(target.to_string_lossy().ends_with(".quarantine"));
    }
}
