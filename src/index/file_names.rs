//! Naming scheme for every file the index writes

/// Prefix of durable commit point files
pub const SEGMENTS: &str = "segments";
/// Prefix of commit point files written but not yet published
pub const PENDING_SEGMENTS: &str = "pending_segments";
/// Pointer to the most recent commit generation
pub const SEGMENTS_GEN: &str = "segments.gen";

pub const COMPOUND_EXTENSION: &str = "cfs";
pub const STORED_FIELDS_EXTENSION: &str = "fdt";
pub const TERMS_EXTENSION: &str = "tim";
pub const LIVE_DOCS_EXTENSION: &str = "del";

const RADIX: u64 = 36;
const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

pub fn to_base36(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % RADIX) as usize]);
        value /= RADIX;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

pub fn parse_base36(s: &str) -> Option<u64> {
    if s.is_empty() {
        return None;
    }
    u64::from_str_radix(s, RADIX as u32).ok()
}

/// `_<counter base36>`
pub fn segment_name(counter: u64) -> String {
    format!("_{}", to_base36(counter))
}

pub fn segment_file_name(segment: &str, extension: &str) -> String {
    format!("{}.{}", segment, extension)
}

/// `<base>_<gen base36>`; generation 0 has no file
pub fn file_name_from_generation(base: &str, generation: u64) -> Option<String> {
    if generation == 0 {
        None
    } else {
        Some(format!("{}_{}", base, to_base36(generation)))
    }
}

/// Generation of a `segments_N` file name
pub fn generation_from_segments_file_name(name: &str) -> Option<u64> {
    name.strip_prefix(SEGMENTS)?
        .strip_prefix('_')
        .and_then(parse_base36)
}

pub fn live_docs_file_name(segment: &str, del_gen: u64) -> String {
    format!(
        "{}_{}.{}",
        segment,
        to_base36(del_gen),
        LIVE_DOCS_EXTENSION
    )
}

/// True for names this index owns and may delete when unreferenced
pub fn is_index_file(name: &str) -> bool {
    name.starts_with('_')
        || generation_from_segments_file_name(name).is_some()
        || name.starts_with(PENDING_SEGMENTS)
        || name == SEGMENTS_GEN
}

/// Segment a file belongs to, e.g. `_a` for `_a_3.del`
pub fn segment_of(file: &str) -> Option<&str> {
    let rest = file.strip_prefix('_')?;
    let end = rest.find(['.', '_']).unwrap_or(rest.len());
    Some(&file[..end + 1])
}
