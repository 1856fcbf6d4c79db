//! Segment encoding
//!
//! Every file a codec writes is framed as
//! `magic | format | payload length | payload | crc32(payload)` so torn or
//! bit-flipped files surface as [`IndexError::CorruptIndex`].

mod default;

use roaring::RoaringBitmap;
use std::collections::BTreeMap;
use std::fmt;

use crate::document::{Document, Term};
use crate::error::{IndexError, Result};
use crate::index::segment_info::SegmentInfo;
use crate::store::Directory;

pub use default::DefaultCodec;

pub const CODEC_MAGIC: u32 = 0x3fd7_6c17;
pub const FORMAT_VERSION: u32 = 1;

const HEADER_LEN: usize = 4 + 4 + 8;
const FOOTER_LEN: usize = 4;

/// Wrap `payload` with header and checksum footer
pub fn encode_framed(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len() + FOOTER_LEN);
    out.extend_from_slice(&CODEC_MAGIC.to_le_bytes());
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    out.extend_from_slice(payload);
    out.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
    out
}

/// Validate framing and return the payload
pub fn decode_framed<'a>(data: &'a [u8], resource: &str) -> Result<&'a [u8]> {
    if data.len() < HEADER_LEN + FOOTER_LEN {
        return Err(IndexError::corrupt(resource, "file truncated"));
    }
    let magic = read_u32(&data[0..4]);
    if magic != CODEC_MAGIC {
        return Err(IndexError::corrupt(
            resource,
            format!("codec header mismatch: {:#x}", magic),
        ));
    }
    let format = read_u32(&data[4..8]);
    if format != FORMAT_VERSION {
        return Err(IndexError::corrupt(
            resource,
            format!("unsupported format version {}", format),
        ));
    }
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&data[8..16]);
    let len = u64::from_le_bytes(len_bytes) as usize;
    if data.len() != HEADER_LEN + len + FOOTER_LEN {
        return Err(IndexError::corrupt(
            resource,
            format!(
                "length mismatch: header says {} bytes, file has {}",
                len,
                data.len() - HEADER_LEN - FOOTER_LEN
            ),
        ));
    }
    let payload = &data[HEADER_LEN..HEADER_LEN + len];
    let expected = read_u32(&data[HEADER_LEN + len..]);
    let actual = crc32fast::hash(payload);
    if expected != actual {
        return Err(IndexError::corrupt(
            resource,
            format!("checksum failed: expected {:#x}, got {:#x}", expected, actual),
        ));
    }
    Ok(payload)
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(buf)
}

/// Immutable in-memory view of a segment's documents and postings
#[derive(Debug)]
pub struct SegmentCore {
    name: String,
    docs: Vec<Document>,
    postings: BTreeMap<Term, Vec<u32>>,
}

impl SegmentCore {
    /// Invert `docs` in order; doc ids are positions
    pub fn from_documents(name: impl Into<String>, docs: Vec<Document>) -> Self {
        let mut postings: BTreeMap<Term, Vec<u32>> = BTreeMap::new();
        for (doc_id, doc) in docs.iter().enumerate() {
            for term in doc.terms() {
                postings.entry(term).or_default().push(doc_id as u32);
            }
        }
        Self {
            name: name.into(),
            docs,
            postings,
        }
    }

    pub(crate) fn from_parts(
        name: impl Into<String>,
        docs: Vec<Document>,
        postings: BTreeMap<Term, Vec<u32>>,
    ) -> Self {
        Self {
            name: name.into(),
            docs,
            postings,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_doc(&self) -> u32 {
        self.docs.len() as u32
    }

    pub fn document(&self, doc: u32) -> Option<&Document> {
        self.docs.get(doc as usize)
    }

    pub fn documents(&self) -> &[Document] {
        &self.docs
    }

    /// Sorted doc ids containing `term`, deleted ones included
    pub fn postings(&self, term: &Term) -> &[u32] {
        self.postings.get(term).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Files and size produced by writing one segment
#[derive(Clone, Debug)]
pub struct WrittenSegment {
    pub files: Vec<String>,
    pub size_in_bytes: u64,
}

/// Encodes and decodes segment data in a directory
pub trait Codec: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn write_segment(
        &self,
        dir: &dyn Directory,
        segment: &str,
        docs: &[Document],
        use_compound_file: bool,
    ) -> Result<WrittenSegment>;

    fn read_segment(&self, dir: &dyn Directory, info: &SegmentInfo) -> Result<SegmentCore>;

    /// Persist a deleted-docs bitmap as generation `del_gen`; returns the
    /// file name and its length
    fn write_live_docs(
        &self,
        dir: &dyn Directory,
        segment: &str,
        del_gen: u64,
        deleted: &RoaringBitmap,
    ) -> Result<(String, u64)>;

    fn read_live_docs(
        &self,
        dir: &dyn Directory,
        segment: &str,
        del_gen: u64,
        max_doc: u32,
    ) -> Result<RoaringBitmap>;
}
