#![deny(unsafe_code)]
//! Module for locating and extracting AIME venue data from Apple Immersive
//! Video (`.aivu`) QuickTime files.
//!
//! Apple Immersive Video titles carry venue metadata ("AIME data") as an
//! opaque binary payload inside the container, announced by the officially
//! undocumented `com.apple.quicktime.aime-data` metadata key. The payload is
//! not addressed by any self-describing atom structure; a 24-byte descriptor
//! record near the key encodes its byte range. This crate finds that record
//! by a windowed search anchored on the key, decodes the packed offset and
//! length words, validates the range against the file size and hands back
//! exactly those payload bytes.

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use byteorder::ReadBytesExt;
use fallible_collections::TryReserveError;
use log::debug;

use std::borrow::Cow;
use std::io::Read;
use std::ops::Range;

/// A trait to indicate a type can be infallibly converted to `u64`.
/// This should only be implemented for infallible conversions, so only unsigned types are valid.
trait ToU64 {
    fn to_u64(self) -> u64;
}

/// Statically verify that the platform `usize` can fit within a `u64`.
impl ToU64 for usize {
    fn to_u64(self) -> u64 {
        const _: () = assert!(std::mem::size_of::<usize>() <= std::mem::size_of::<u64>());
        self.try_into().ok().unwrap()
    }
}

#[doc(hidden)]
pub type TryVec<T> = fallible_collections::TryVec<T>;

// To ensure we don't use stdlib allocating types by accident
#[allow(dead_code)]
struct Vec;

/// Metadata key announcing the embedded venue data.
///
/// The key is the one byte sequence known to occur exactly once in an
/// `.aivu` file; it anchors the descriptor search and is not parsed further.
pub const AIME_METADATA_KEY: &[u8] = b"com.apple.quicktime.aime-data";

/// First eight bytes of the descriptor record.
const DESCRIPTOR_PATTERN: &[u8] = &[0x00, 0x00, 0x00, 0x00, 0x88, 0x00, 0x00, 0x00];

/// Size of the descriptor record: six 32-bit big-endian words.
const DESCRIPTOR_SIZE: usize = 24;

/// Bytes searched past the key's start offset for the descriptor pattern.
const FORWARD_WINDOW: usize = 1024;

/// Bytes searched before the key when the forward search finds nothing.
const BACKWARD_WINDOW: usize = 512;

/// The offset and length words are stored left-shifted by 8 bits; the low
/// byte carries no range information.
const PACKED_SHIFT: u32 = 8;

/// Describes extraction failures.
///
/// Every variant is terminal for the invocation: a failure means the file is
/// malformed, unsupported, or too small for the range the descriptor claims.
/// There is no partial-success or retry path.
#[derive(Debug)]
pub enum Error {
    /// The `com.apple.quicktime.aime-data` key is absent from the file.
    KeyNotFound,
    /// No descriptor pattern within the search windows around the key.
    DescriptorNotFound,
    /// The descriptor record would extend past the end of the file.
    DescriptorTruncated,
    /// The decoded offset or length is zero.
    InvalidRange,
    /// The decoded range extends beyond the end of the file.
    RangeOutOfBounds,
    /// Reflect `std::io::ErrorKind::UnexpectedEof` for short data.
    UnexpectedEOF,
    /// Propagate underlying errors from `std::io`.
    Io(std::io::Error),
    /// Out of memory
    OutOfMemory,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            Self::KeyNotFound => "AIME key not found in file",
            Self::DescriptorNotFound => "descriptor pattern not found near metadata key",
            Self::DescriptorTruncated => "descriptor truncated at end of file",
            Self::InvalidRange => "descriptor reported non-positive offset/length",
            Self::RangeOutOfBounds => "descriptor range extends beyond file size",
            Self::UnexpectedEOF => "EOF",
            Self::Io(err) => return err.fmt(f),
            Self::OutOfMemory => "OOM",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof => Self::UnexpectedEOF,
            _ => Self::Io(err),
        }
    }
}

impl From<TryReserveError> for Error {
    fn from(_: TryReserveError) -> Self {
        Self::OutOfMemory
    }
}

/// Result shorthand using our Error enum.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Validated byte range of the AIME payload within the source file.
///
/// Produced by [`decode_descriptor`]; `offset > 0`, `length > 0` and
/// `offset + length` does not exceed the size of the buffer the record was
/// decoded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AimeBounds {
    /// Payload offset from the start of the file.
    pub offset: u64,
    /// Payload size in bytes.
    pub length: u64,
}

impl AimeBounds {
    /// Byte range of the payload within the buffer the bounds were decoded
    /// from. Validation already proved the range fits that buffer, so the
    /// index conversions are lossless.
    pub fn to_range(self) -> Range<usize> {
        self.offset as usize..(self.offset + self.length) as usize
    }
}

/// Offset of the first occurrence of `needle` fully contained in `haystack`.
fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}

/// Offset of the last occurrence of `needle` fully contained in `haystack`.
fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).rposition(|window| window == needle)
}

#[test]
fn pattern_search_first_and_last() {
    let buf = b"..ab..ab..";
    assert_eq!(find(buf, b"ab"), Some(2));
    assert_eq!(rfind(buf, b"ab"), Some(6));
    assert_eq!(find(buf, b"xy"), None);
    assert_eq!(find(b"a", b"ab"), None);
}

/// Locate the start of the 24-byte payload descriptor record.
///
/// The descriptor pattern is not unique within a file, so the search is
/// anchored on the metadata key: forward from the key's start for up to
/// [`FORWARD_WINDOW`] bytes, then backward over the [`BACKWARD_WINDOW`]
/// bytes before the key, taking the rightmost match. The descriptor
/// normally follows the key; the backward pass covers files with the
/// reverse layout.
///
/// The window sizes are observed behavior of shipping `.aivu` files, not
/// derived from any published format.
pub fn find_descriptor(data: &[u8]) -> Result<usize> {
    let key_pos = find(data, AIME_METADATA_KEY).ok_or(Error::KeyNotFound)?;

    let forward_end = data.len().min(key_pos + FORWARD_WINDOW);
    let backward_start = key_pos.saturating_sub(BACKWARD_WINDOW);

    let start = find(&data[key_pos..forward_end], DESCRIPTOR_PATTERN)
        .map(|at| key_pos + at)
        .or_else(|| {
            rfind(&data[backward_start..key_pos], DESCRIPTOR_PATTERN).map(|at| backward_start + at)
        })
        .ok_or(Error::DescriptorNotFound)?;

    if data.len() - start < DESCRIPTOR_SIZE {
        return Err(Error::DescriptorTruncated);
    }
    Ok(start)
}

/// Decode the descriptor record at `start` into payload bounds.
///
/// The record is six 32-bit big-endian words. Words 0 and 1 are header
/// fields with unknown semantics; they are read and ignored, never
/// validated. Words 2..=3 and 4..=5 hold the payload offset and length as
/// two packed 64-bit values, each left-shifted by [`PACKED_SHIFT`] bits.
///
/// `start` is bounds-checked here as well, so the decoder can be driven
/// without [`find_descriptor`].
pub fn decode_descriptor(data: &[u8], start: usize) -> Result<AimeBounds> {
    if start > data.len() || data.len() - start < DESCRIPTOR_SIZE {
        return Err(Error::DescriptorTruncated);
    }
    let mut record = &data[start..start + DESCRIPTOR_SIZE];
    let mut words = [0u32; 6];
    for word in &mut words {
        *word = be_u32(&mut record)?;
    }

    let offset = (u64::from(words[2]) << 32 | u64::from(words[3])) >> PACKED_SHIFT;
    let length = (u64::from(words[4]) << 32 | u64::from(words[5])) >> PACKED_SHIFT;

    if offset == 0 || length == 0 {
        return Err(Error::InvalidRange);
    }
    // At most 56 bits each after the shift, so the sum cannot wrap a u64.
    if offset + length > data.len().to_u64() {
        return Err(Error::RangeOutOfBounds);
    }
    Ok(AimeBounds { offset, length })
}

#[test]
fn decode_rechecks_record_bounds() {
    let buf = [0u8; 30];
    assert!(matches!(decode_descriptor(&buf, 8), Err(Error::DescriptorTruncated)));
    assert!(matches!(decode_descriptor(&buf, 31), Err(Error::DescriptorTruncated)));
    assert!(matches!(decode_descriptor(&buf, usize::MAX), Err(Error::DescriptorTruncated)));
}

/// Locate and decode the AIME payload bounds within a complete `.aivu` file.
///
/// Composes [`find_descriptor`] and [`decode_descriptor`]; the result is
/// validated against `data.len()` and safe to slice with.
pub fn locate_descriptor(data: &[u8]) -> Result<AimeBounds> {
    let start = find_descriptor(data)?;
    decode_descriptor(data, start)
}

/// Read the AIME venue data embedded in an `.aivu` file.
///
/// Reads the source to the end, locates the payload descriptor and returns
/// a copy of the payload bytes. The copy uses fallible allocation since the
/// decoded length is file-controlled.
///
/// For zero-copy access to an already-buffered file, use
/// [`AimeExtractor::from_bytes`].
pub fn read_aime<T: Read>(f: &mut T) -> Result<TryVec<u8>> {
    let mut data = std::vec::Vec::new();
    f.read_to_end(&mut data)?;
    debug!("read {} bytes from source", data.len());

    let bounds = locate_descriptor(&data)?;
    let mut payload = TryVec::new();
    payload.extend_from_slice(&data[bounds.to_range()])?;
    Ok(payload)
}

/// Zero-copy payload view backed by a borrowed or owned byte buffer.
///
/// The extractor records the payload bounds during construction but does
/// **not** copy the payload; [`payload`](Self::payload) borrows from the
/// backing buffer, which stays immutable for the extractor's lifetime.
///
/// # Constructors
///
/// | Method | Lifetime | Zero-copy? |
/// |--------|----------|------------|
/// | [`from_bytes`](Self::from_bytes) | `'data` | Yes — borrows the slice |
/// | [`from_owned`](Self::from_owned) | `'static` | Within the owned buffer |
/// | [`from_reader`](Self::from_reader) | `'static` | Reads all, then owned |
///
/// # Example
///
/// ```no_run
/// use aime_extract::AimeExtractor;
///
/// let bytes = std::fs::read("venue.aivu")?;
/// let extractor = AimeExtractor::from_bytes(&bytes)?;
/// std::fs::write("venue.aime", extractor.payload())?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct AimeExtractor<'data> {
    raw: Cow<'data, [u8]>,
    bounds: AimeBounds,
}

impl<'data> AimeExtractor<'data> {
    /// Locate the payload in a borrowed byte slice (true zero-copy).
    pub fn from_bytes(data: &'data [u8]) -> Result<Self> {
        let bounds = locate_descriptor(data)?;
        Ok(Self { raw: Cow::Borrowed(data), bounds })
    }

    /// Locate the payload in an owned buffer.
    pub fn from_owned(data: std::vec::Vec<u8>) -> Result<AimeExtractor<'static>> {
        let bounds = locate_descriptor(&data)?;
        Ok(AimeExtractor { raw: Cow::Owned(data), bounds })
    }

    /// Locate the payload from a reader (reads all bytes, then owns them).
    pub fn from_reader<R: Read>(reader: &mut R) -> Result<AimeExtractor<'static>> {
        let mut buf = std::vec::Vec::new();
        reader.read_to_end(&mut buf)?;
        debug!("read {} bytes from source", buf.len());
        AimeExtractor::from_owned(buf)
    }

    /// Validated payload bounds within the source file.
    pub const fn bounds(&self) -> AimeBounds {
        self.bounds
    }

    /// The payload bytes, borrowed from the backing buffer.
    pub fn payload(&self) -> &[u8] {
        &self.raw[self.bounds.to_range()]
    }
}

fn be_u32<T: ReadBytesExt>(src: &mut T) -> Result<u32> {
    src.read_u32::<byteorder::BigEndian>().map_err(From::from)
}
