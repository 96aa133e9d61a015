//! Combining segments into one, with docnum translation
//!
//! The merged segment contains only documents live at merge time (input
//! deletion bitmaps drop the rest). For every input segment the merge
//! produces a translation vector whose entry `i` is the new local docnum of
//! old local `i`, or [`DROPPED_DOC`] when that document was dropped.

use std::collections::BTreeMap;
use std::io;

use roaring::RoaringBitmap;

use super::data::SegmentData;
use super::postings::PostingsWriter;
use super::term_dict::TermDictionaryBuilder;
use super::types::{DocNo, Posting, PostingListMeta, DROPPED_DOC};

/// Merge segment contents, dropping documents named by `drops`.
///
/// Returns the merged data and one translation vector per input segment,
/// in input order.
pub(crate) fn merge_segment_data(
    olds: &[&SegmentData],
    drops: &[Option<&RoaringBitmap>],
) -> io::Result<(SegmentData, Vec<Vec<u32>>)> {
    debug_assert_eq!(olds.len(), drops.len());

    // Assign new docnums to surviving documents, in segment order then
    // docno order, and carry their ids and stored fields across.
    let mut translations = Vec::with_capacity(olds.len());
    let mut doc_ids = Vec::new();
    let mut stored = Vec::new();
    let mut next_docno = 0u32;

    for (old, drop) in olds.iter().zip(drops.iter()) {
        let mut translation = vec![DROPPED_DOC; old.doc_count() as usize];
        for docno in 0..old.doc_count() {
            if drop.map_or(false, |d| d.contains(docno)) {
                continue;
            }
            translation[docno as usize] = next_docno;
            let old_docno = DocNo::new(docno);
            doc_ids.push(
                old.external_id(old_docno)
                    .ok_or_else(|| {
                        io::Error::new(io::ErrorKind::InvalidData, "docnum without external id")
                    })?
                    .to_string(),
            );
            stored.push(old.stored_fields(old_docno).cloned().unwrap_or_default());
            next_docno += 1;
        }
        translations.push(translation);
    }

    // Sorted union of field names
    let mut fields: Vec<String> = Vec::new();
    for old in olds {
        for field in old.fields() {
            if !fields.contains(field) {
                fields.push(field.clone());
            }
        }
    }
    fields.sort();

    let mut writer = PostingsWriter::new();
    let mut dicts = std::collections::HashMap::with_capacity(fields.len());
    let mut merged_fields = Vec::with_capacity(fields.len());

    for field in fields {
        // term -> posting list sources in input-segment order
        let mut terms: BTreeMap<String, Vec<(usize, PostingListMeta)>> = BTreeMap::new();
        for (old_idx, old) in olds.iter().enumerate() {
            if let Some(dict) = old.dictionary(&field) {
                let mut stream = dict.stream();
                while let Some((term, meta)) = stream.next() {
                    terms.entry(term).or_default().push((old_idx, meta.clone()));
                }
            }
        }

        let mut dict_builder = TermDictionaryBuilder::with_capacity(terms.len());
        for (term, sources) in terms {
            writer.start_posting_list();
            for (old_idx, meta) in sources {
                for posting in olds[old_idx].postings_for_meta(&meta)? {
                    let posting = posting?;
                    let new_docno = translations[old_idx][posting.docno.as_usize()];
                    if new_docno == DROPPED_DOC {
                        continue;
                    }
                    writer.add_posting(&Posting::new(
                        DocNo::new(new_docno),
                        posting.term_frequency,
                        posting.norm,
                        posting.positions,
                    ));
                }
            }
            let meta = writer.finish_posting_list();
            if meta.doc_frequency > 0 {
                dict_builder.add(term, meta);
            }
        }

        let dict = dict_builder.build()?;
        if !dict.is_empty() {
            dicts.insert(field.clone(), dict);
            merged_fields.push(field);
        }
    }

    let merged = SegmentData::assemble(
        next_docno,
        merged_fields,
        dicts,
        writer.into_data(),
        doc_ids,
        stored,
    );

    Ok((merged, translations))
}
