//! WAL segment descriptors and naming.
//!
//! Segment files are named the way PostgreSQL names them: 24 upper-case hex digits, the timeline
//! followed by the high 32 bits of the segment's start LSN and the segment number within that
//! 4 GiB "log file". Because the fields are fixed-width, sorting names sorts segments in log order.

use std::io::{Read, Write};
use std::sync::Arc;

use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use rewind_id::Lsn;
use serde::{Deserialize, Serialize};

/// The default size of a WAL segment
pub const DEFAULT_SEGMENT_SIZE: u64 = 16 * 1024 * 1024;

const SEGMENT_NAME_LEN: usize = 24;

/// Segment sizes PostgreSQL can be initialised with
pub const SEGMENT_SIZE_RANGE: std::ops::RangeInclusive<u64> =
    (1024 * 1024)..=(1024 * 1024 * 1024);

/// Whether the database could be using segments of `size` bytes: a power of two from 1 MiB to
/// 1 GiB
pub fn is_valid_segment_size(size: u64) -> bool {
    size.is_power_of_two() && SEGMENT_SIZE_RANGE.contains(&size)
}

/// A completed WAL segment waiting to be archived
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalSegment {
    pub name: Arc<str>,
    pub start_lsn: Lsn,
    pub end_lsn: Lsn,
}

impl WalSegment {
    /// Describe the segment named `name`, deriving its LSN range from the name
    pub fn from_name(name: &str, segment_size: u64) -> Option<Self> {
        let (_, start_lsn) = parse_segment_name(name, segment_size)?;
        Some(Self {
            name: name.into(),
            start_lsn,
            end_lsn: Lsn::new(start_lsn.as_u64() + segment_size),
        })
    }
}

/// The file name of the segment on `timeline` containing `lsn`
pub fn segment_name(timeline: u32, lsn: Lsn, segment_size: u64) -> String {
    let segments_per_log = segments_per_log(segment_size);
    let segment_no = lsn.as_u64().checked_div(segment_size).unwrap_or_default();
    format!(
        "{timeline:08X}{:08X}{:08X}",
        segment_no / segments_per_log,
        segment_no % segments_per_log
    )
}

/// Parse a segment file name into its timeline and start LSN
pub fn parse_segment_name(name: &str, segment_size: u64) -> Option<(u32, Lsn)> {
    if name.len() != SEGMENT_NAME_LEN || !name.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let timeline = u32::from_str_radix(&name[0..8], 16).ok()?;
    let log = u64::from_str_radix(&name[8..16], 16).ok()?;
    let seg = u64::from_str_radix(&name[16..24], 16).ok()?;
    if seg >= segments_per_log(segment_size) {
        return None;
    }
    let start = (log * segments_per_log(segment_size) + seg).checked_mul(segment_size)?;
    Some((timeline, Lsn::new(start)))
}

fn segments_per_log(segment_size: u64) -> u64 {
    0x1_0000_0000_u64
        .checked_div(segment_size)
        .unwrap_or_default()
        .max(1)
}

pub(crate) fn compress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 4), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

/// Inflate an archived segment back into the bytes the database wrote
pub fn decompress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len() * 4);
    GzDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}
