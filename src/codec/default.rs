use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{decode_framed, encode_framed, Codec, SegmentCore, WrittenSegment};
use crate::document::{Document, Term};
use crate::error::{IndexError, Result};
use crate::index::file_names::{
    live_docs_file_name, segment_file_name, COMPOUND_EXTENSION, STORED_FIELDS_EXTENSION,
    TERMS_EXTENSION,
};
use crate::index::segment_info::SegmentInfo;
use crate::store::Directory;

#[derive(Serialize, Deserialize)]
struct CompoundBody {
    docs: Vec<Document>,
    postings: BTreeMap<Term, Vec<u32>>,
}

/// Bincode bodies with a crc32 footer
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultCodec;

impl DefaultCodec {
    pub const NAME: &'static str = "segdex-default-1";

    fn write_one(dir: &dyn Directory, name: &str, payload: &[u8]) -> Result<u64> {
        let framed = encode_framed(payload);
        dir.write_file(name, &framed)?;
        Ok(framed.len() as u64)
    }

    fn check_postings(
        segment: &str,
        docs: &[Document],
        postings: &BTreeMap<Term, Vec<u32>>,
    ) -> Result<()> {
        let max_doc = docs.len() as u32;
        for (term, ids) in postings {
            if ids.iter().any(|&d| d >= max_doc) || ids.windows(2).any(|w| w[0] >= w[1]) {
                return Err(IndexError::corrupt(
                    segment,
                    format!("postings for {} out of order or past max_doc {}", term, max_doc),
                ));
            }
        }
        Ok(())
    }
}

impl Codec for DefaultCodec {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn write_segment(
        &self,
        dir: &dyn Directory,
        segment: &str,
        docs: &[Document],
        use_compound_file: bool,
    ) -> Result<WrittenSegment> {
        let mut postings: BTreeMap<Term, Vec<u32>> = BTreeMap::new();
        for (doc_id, doc) in docs.iter().enumerate() {
            for term in doc.terms() {
                postings.entry(term).or_default().push(doc_id as u32);
            }
        }

        if use_compound_file {
            let name = segment_file_name(segment, COMPOUND_EXTENSION);
            let body = CompoundBody {
                docs: docs.to_vec(),
                postings,
            };
            let size = Self::write_one(dir, &name, &bincode::serialize(&body)?)?;
            return Ok(WrittenSegment {
                files: vec![name],
                size_in_bytes: size,
            });
        }

        let fdt = segment_file_name(segment, STORED_FIELDS_EXTENSION);
        let tim = segment_file_name(segment, TERMS_EXTENSION);
        let mut size = Self::write_one(dir, &fdt, &bincode::serialize(docs)?)?;
        size += Self::write_one(dir, &tim, &bincode::serialize(&postings)?)?;
        Ok(WrittenSegment {
            files: vec![fdt, tim],
            size_in_bytes: size,
        })
    }

    fn read_segment(&self, dir: &dyn Directory, info: &SegmentInfo) -> Result<SegmentCore> {
        let (docs, postings) = if info.use_compound_file {
            let name = segment_file_name(&info.name, COMPOUND_EXTENSION);
            let data = dir.open_input(&name)?;
            let body: CompoundBody = bincode::deserialize(decode_framed(&data, &name)?)
                .map_err(|e| IndexError::corrupt(&name, e))?;
            (body.docs, body.postings)
        } else {
            let fdt = segment_file_name(&info.name, STORED_FIELDS_EXTENSION);
            let tim = segment_file_name(&info.name, TERMS_EXTENSION);
            let fdt_data = dir.open_input(&fdt)?;
            let tim_data = dir.open_input(&tim)?;
            let docs: Vec<Document> = bincode::deserialize(decode_framed(&fdt_data, &fdt)?)
                .map_err(|e| IndexError::corrupt(&fdt, e))?;
            let postings: BTreeMap<Term, Vec<u32>> =
                bincode::deserialize(decode_framed(&tim_data, &tim)?)
                    .map_err(|e| IndexError::corrupt(&tim, e))?;
            (docs, postings)
        };

        if docs.len() as u32 != info.doc_count {
            return Err(IndexError::corrupt(
                &info.name,
                format!(
                    "doc count mismatch: descriptor says {}, segment has {}",
                    info.doc_count,
                    docs.len()
                ),
            ));
        }
        Self::check_postings(&info.name, &docs, &postings)?;
        Ok(SegmentCore::from_parts(info.name.clone(), docs, postings))
    }

    fn write_live_docs(
        &self,
        dir: &dyn Directory,
        segment: &str,
        del_gen: u64,
        deleted: &RoaringBitmap,
    ) -> Result<(String, u64)> {
        let name = live_docs_file_name(segment, del_gen);
        let mut payload = Vec::with_capacity(deleted.serialized_size());
        deleted.serialize_into(&mut payload)?;
        let size = Self::write_one(dir, &name, &payload)?;
        Ok((name, size))
    }

    fn read_live_docs(
        &self,
        dir: &dyn Directory,
        segment: &str,
        del_gen: u64,
        max_doc: u32,
    ) -> Result<RoaringBitmap> {
        let name = live_docs_file_name(segment, del_gen);
        let data = dir.open_input(&name)?;
        let deleted = RoaringBitmap::deserialize_from(decode_framed(&data, &name)?)
            .map_err(|e| IndexError::corrupt(&name, e))?;
        if let Some(max) = deleted.max() {
            if max >= max_doc {
                return Err(IndexError::corrupt(
                    &name,
                    format!("deleted doc {} past max_doc {}", max, max_doc),
                ));
            }
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RamDirectory;

    fn docs() -> Vec<Document> {
        (0..5)
            .map(|i| {
                Document::new()
                    .with_keyword("id", format!("{}", i))
                    .with_text("body", "common words")
            })
            .collect()
    }

    fn info(name: &str, compound: bool) -> SegmentInfo {
        SegmentInfo::new(name, 5, DefaultCodec::NAME, compound)
    }

    #[test]
    fn test_compound_and_split_layouts() {
        let dir = RamDirectory::new();
        let codec = DefaultCodec;

        let written = codec.write_segment(&dir, "_0", &docs(), true).unwrap();
        assert_eq!(written.files, vec!["_0.cfs".to_string()]);
        let written = codec.write_segment(&dir, "_1", &docs(), false).unwrap();
        assert_eq!(written.files, vec!["_1.fdt".to_string(), "_1.tim".to_string()]);
        assert_eq!(
            written.size_in_bytes,
            dir.file_length("_1.fdt").unwrap() + dir.file_length("_1.tim").unwrap()
        );

        for (name, compound) in [("_0", true), ("_1", false)] {
            let core = codec.read_segment(&dir, &info(name, compound)).unwrap();
            assert_eq!(core.max_doc(), 5);
            assert_eq!(core.postings(&Term::new("body", "common")).len(), 5);
            assert_eq!(core.document(3).unwrap().get_str("id"), Some("3"));
        }
    }

    #[test]
    fn test_corrupt_segment_is_reported() {
        let dir = RamDirectory::new();
        let codec = DefaultCodec;
        codec.write_segment(&dir, "_0", &docs(), true).unwrap();

        let mut data = dir.open_input("_0.cfs").unwrap().to_vec();
        let mid = data.len() / 2;
        data[mid] ^= 0x55;
        dir.delete_file("_0.cfs").unwrap();
        dir.write_file("_0.cfs", &data).unwrap();

        let err = codec.read_segment(&dir, &info("_0", true)).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_doc_count_mismatch_is_corruption() {
        let dir = RamDirectory::new();
        let codec = DefaultCodec;
        codec.write_segment(&dir, "_0", &docs(), true).unwrap();

        let wrong = SegmentInfo::new("_0", 7, DefaultCodec::NAME, true);
        assert!(codec.read_segment(&dir, &wrong).unwrap_err().is_corruption());
    }

    #[test]
    fn test_live_docs_generations() {
        let dir = RamDirectory::new();
        let codec = DefaultCodec;
        let mut deleted = RoaringBitmap::new();
        deleted.insert(1);
        deleted.insert(4);

        let (name, _) = codec.write_live_docs(&dir, "_0", 1, &deleted).unwrap();
        assert_eq!(name, "_0_1.del");
        assert_eq!(codec.read_live_docs(&dir, "_0", 1, 5).unwrap(), deleted);
        assert!(codec
            .read_live_docs(&dir, "_0", 1, 3)
            .unwrap_err()
            .is_corruption());
    }
}
