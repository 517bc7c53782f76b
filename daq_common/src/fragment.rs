//! Fragment record format.
//!
//! A fragment is a self-describing record of 64-bit words:
//!
//! ```text
//! word  field
//! 0     word_count: u32 | version: u16 | fragment_type: u8 | metadata_word_count: u8
//! 1     sequence_id: u64
//! 2     fragment_id: u16 | reserved: [u8; 6]
//! 3     timestamp: u64
//! 4..   metadata words, then payload words
//! ```
//!
//! `word_count` counts every word of the record, header included. It is the
//! only field the transport interprets: it tells a scanner how far to skip to
//! reach the next record packed in the same slot. All fields are stored in
//! native byte order; the record never leaves the host.

use crate::consts::WORD_SIZE;
use static_assertions::const_assert_eq;
use std::fmt;
use thiserror::Error;

/// Current fragment header version.
pub const FRAGMENT_HEADER_VERSION: u16 = 1;

/// Highest raw value of the user type range.
pub const LAST_USER_TYPE: u8 = 224;

/// Lowest raw value of the system type range.
pub const FIRST_SYSTEM_TYPE: u8 = 225;

/// Errors produced while decoding fragment records.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FragmentError {
    /// Fewer bytes than a header were supplied.
    #[error("truncated fragment header: {actual} of {expected} bytes")]
    TruncatedHeader {
        /// Header size
        expected: usize,
        /// Bytes available
        actual: usize,
    },

    /// Header declares fewer words than the header itself occupies.
    #[error("fragment word count {word_count} smaller than header ({header_words} words)")]
    WordCountTooSmall {
        /// Declared word count
        word_count: u32,
        /// Header size in words
        header_words: usize,
    },

    /// Body length does not match the header's word count.
    #[error("fragment body is {actual} bytes, header declares {expected}")]
    BodyLengthMismatch {
        /// Declared body size in bytes
        expected: usize,
        /// Supplied body size in bytes
        actual: usize,
    },

    /// Metadata does not fit in the record.
    #[error("fragment metadata of {metadata_words} words exceeds body of {body_words} words")]
    MetadataOverflow {
        /// Declared metadata words
        metadata_words: usize,
        /// Body words
        body_words: usize,
    },

    /// Payload or metadata too large for the header fields.
    #[error("fragment too large: {words} words")]
    TooLarge {
        /// Requested total words
        words: usize,
    },
}

/// Reserved system fragment types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SystemFragmentType {
    /// No more data will follow on this stream.
    EndOfData,
    /// Generic data fragment.
    Data,
    /// One-time initialization data delivered to every reader.
    Init,
    /// End of a run.
    EndOfRun,
    /// End of a subrun.
    EndOfSubrun,
    /// Shutdown request.
    Shutdown,
    /// Placeholder with no payload.
    Empty,
    /// Container of other fragments.
    Container,
    /// Error report.
    Error,
    /// System value without an assigned meaning.
    Reserved(u8),
}

impl SystemFragmentType {
    const fn from_raw(raw: u8) -> Self {
        match raw {
            225 => Self::EndOfData,
            226 => Self::Data,
            227 => Self::Init,
            228 => Self::EndOfRun,
            229 => Self::EndOfSubrun,
            230 => Self::Shutdown,
            231 => Self::Empty,
            232 => Self::Container,
            233 => Self::Error,
            other => Self::Reserved(other),
        }
    }

    const fn raw(self) -> u8 {
        match self {
            Self::EndOfData => 225,
            Self::Data => 226,
            Self::Init => 227,
            Self::EndOfRun => 228,
            Self::EndOfSubrun => 229,
            Self::Shutdown => 230,
            Self::Empty => 231,
            Self::Container => 232,
            Self::Error => 233,
            Self::Reserved(raw) => raw,
        }
    }
}

/// Fragment type: the invalid marker, a user type, or a reserved system type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FragmentType {
    /// Raw value 0.
    Invalid,
    /// Raw values `1..=224`, free for payload formats.
    User(u8),
    /// Raw values `225..=255`.
    System(SystemFragmentType),
}

impl FragmentType {
    /// End-of-data marker.
    pub const END_OF_DATA: Self = Self::System(SystemFragmentType::EndOfData);
    /// Initialization marker.
    pub const INIT: Self = Self::System(SystemFragmentType::Init);
    /// Generic data.
    pub const DATA: Self = Self::System(SystemFragmentType::Data);

    /// Classify a raw type byte.
    pub const fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Invalid,
            1..=LAST_USER_TYPE => Self::User(raw),
            _ => Self::System(SystemFragmentType::from_raw(raw)),
        }
    }

    /// Build a user type, rejecting values outside the user range.
    pub const fn user(raw: u8) -> Option<Self> {
        match raw {
            1..=LAST_USER_TYPE => Some(Self::User(raw)),
            _ => None,
        }
    }

    /// Raw type byte as stored in the header.
    pub const fn raw(self) -> u8 {
        match self {
            Self::Invalid => 0,
            Self::User(raw) => raw,
            Self::System(system) => system.raw(),
        }
    }

    /// Whether this is a reserved system type.
    pub const fn is_system(self) -> bool {
        matches!(self, Self::System(_))
    }

    /// Whether this is a user type.
    pub const fn is_user(self) -> bool {
        matches!(self, Self::User(_))
    }
}

impl fmt::Display for FragmentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invalid => write!(f, "Invalid"),
            Self::User(raw) => write!(f, "User({raw})"),
            Self::System(SystemFragmentType::Reserved(raw)) => write!(f, "System({raw})"),
            Self::System(system) => write!(f, "{system:?}"),
        }
    }
}

/// Selects fragments by type when extracting them from an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeFilter {
    /// Every fragment.
    Any,
    /// Only fragments of this type.
    Only(FragmentType),
}

impl TypeFilter {
    /// Whether `fragment_type` passes the filter.
    pub fn matches(self, fragment_type: FragmentType) -> bool {
        match self {
            Self::Any => true,
            Self::Only(wanted) => wanted == fragment_type,
        }
    }
}

/// Decoded fragment header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    /// Total record length in words, header included.
    pub word_count: u32,
    /// Header format version.
    pub version: u16,
    /// Fragment type.
    pub fragment_type: FragmentType,
    /// Number of metadata words following the header.
    pub metadata_word_count: u8,
    /// Sequence (event) number.
    pub sequence_id: u64,
    /// Fragment source identifier.
    pub fragment_id: u16,
    /// Source timestamp.
    pub timestamp: u64,
}

/// Serialized header size in bytes.
pub const FRAGMENT_HEADER_SIZE: usize = 32;
/// Serialized header size in words.
pub const FRAGMENT_HEADER_WORDS: usize = FRAGMENT_HEADER_SIZE / WORD_SIZE;

const_assert_eq!(FRAGMENT_HEADER_SIZE % WORD_SIZE, 0);

impl FragmentHeader {
    /// Serialize to the native-endian wire form.
    pub fn to_bytes(&self) -> [u8; FRAGMENT_HEADER_SIZE] {
        let mut out = [0u8; FRAGMENT_HEADER_SIZE];
        out[0..4].copy_from_slice(&self.word_count.to_ne_bytes());
        out[4..6].copy_from_slice(&self.version.to_ne_bytes());
        out[6] = self.fragment_type.raw();
        out[7] = self.metadata_word_count;
        out[8..16].copy_from_slice(&self.sequence_id.to_ne_bytes());
        out[16..18].copy_from_slice(&self.fragment_id.to_ne_bytes());
        out[24..32].copy_from_slice(&self.timestamp.to_ne_bytes());
        out
    }

    /// Decode a header from the first [`FRAGMENT_HEADER_SIZE`] bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FragmentError> {
        let Some(bytes) = bytes.get(..FRAGMENT_HEADER_SIZE) else {
            return Err(FragmentError::TruncatedHeader {
                expected: FRAGMENT_HEADER_SIZE,
                actual: bytes.len(),
            });
        };

        let header = Self {
            word_count: u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            version: u16::from_ne_bytes([bytes[4], bytes[5]]),
            fragment_type: FragmentType::from_raw(bytes[6]),
            metadata_word_count: bytes[7],
            sequence_id: u64::from_ne_bytes(word_at(bytes, 8)),
            fragment_id: u16::from_ne_bytes([bytes[16], bytes[17]]),
            timestamp: u64::from_ne_bytes(word_at(bytes, 24)),
        };

        if (header.word_count as usize) < FRAGMENT_HEADER_WORDS {
            return Err(FragmentError::WordCountTooSmall {
                word_count: header.word_count,
                header_words: FRAGMENT_HEADER_WORDS,
            });
        }
        Ok(header)
    }

    /// Total record size in bytes.
    pub fn size_bytes(&self) -> usize {
        self.word_count as usize * WORD_SIZE
    }

    /// Bytes following the header (metadata plus payload).
    pub fn body_bytes(&self) -> usize {
        self.size_bytes() - FRAGMENT_HEADER_SIZE
    }
}

fn word_at(bytes: &[u8], offset: usize) -> [u8; 8] {
    let mut word = [0u8; 8];
    word.copy_from_slice(&bytes[offset..offset + 8]);
    word
}

/// Owned fragment: header plus body (metadata words then payload words).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    header: FragmentHeader,
    body: Vec<u8>,
}

impl Fragment {
    /// Build a fragment; the payload is zero-padded to a whole word.
    pub fn new(
        sequence_id: u64,
        fragment_id: u16,
        fragment_type: FragmentType,
        payload: &[u8],
    ) -> Result<Self, FragmentError> {
        Self::with_metadata(sequence_id, fragment_id, fragment_type, &[], payload)
    }

    /// Build a fragment carrying metadata words ahead of the payload.
    pub fn with_metadata(
        sequence_id: u64,
        fragment_id: u16,
        fragment_type: FragmentType,
        metadata: &[u64],
        payload: &[u8],
    ) -> Result<Self, FragmentError> {
        let payload_words = payload.len().div_ceil(WORD_SIZE);
        let total_words = FRAGMENT_HEADER_WORDS + metadata.len() + payload_words;
        let word_count =
            u32::try_from(total_words).map_err(|_| FragmentError::TooLarge { words: total_words })?;
        let metadata_word_count = u8::try_from(metadata.len()).map_err(|_| {
            FragmentError::TooLarge {
                words: metadata.len(),
            }
        })?;

        let mut body = Vec::with_capacity((metadata.len() + payload_words) * WORD_SIZE);
        for word in metadata {
            body.extend_from_slice(&word.to_ne_bytes());
        }
        body.extend_from_slice(payload);
        body.resize((metadata.len() + payload_words) * WORD_SIZE, 0);

        Ok(Self {
            header: FragmentHeader {
                word_count,
                version: FRAGMENT_HEADER_VERSION,
                fragment_type,
                metadata_word_count,
                sequence_id,
                fragment_id,
                timestamp: 0,
            },
            body,
        })
    }

    /// Rebuild a fragment from a decoded header and its body bytes.
    pub fn from_parts(header: FragmentHeader, body: Vec<u8>) -> Result<Self, FragmentError> {
        if body.len() != header.body_bytes() {
            return Err(FragmentError::BodyLengthMismatch {
                expected: header.body_bytes(),
                actual: body.len(),
            });
        }
        let body_words = body.len() / WORD_SIZE;
        if header.metadata_word_count as usize > body_words {
            return Err(FragmentError::MetadataOverflow {
                metadata_words: header.metadata_word_count as usize,
                body_words,
            });
        }
        Ok(Self { header, body })
    }

    /// Decode a complete record from its wire bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FragmentError> {
        let header = FragmentHeader::from_bytes(bytes)?;
        let end = header.size_bytes();
        let body = bytes
            .get(FRAGMENT_HEADER_SIZE..end)
            .ok_or(FragmentError::BodyLengthMismatch {
                expected: header.body_bytes(),
                actual: bytes.len().saturating_sub(FRAGMENT_HEADER_SIZE),
            })?
            .to_vec();
        Self::from_parts(header, body)
    }

    /// Set the source timestamp.
    pub fn set_timestamp(&mut self, timestamp: u64) {
        self.header.timestamp = timestamp;
    }

    /// Set the sequence id.
    pub fn set_sequence_id(&mut self, sequence_id: u64) {
        self.header.sequence_id = sequence_id;
    }

    /// Header.
    pub fn header(&self) -> &FragmentHeader {
        &self.header
    }

    /// Fragment type.
    pub fn fragment_type(&self) -> FragmentType {
        self.header.fragment_type
    }

    /// Sequence id.
    pub fn sequence_id(&self) -> u64 {
        self.header.sequence_id
    }

    /// Fragment id.
    pub fn fragment_id(&self) -> u16 {
        self.header.fragment_id
    }

    /// Metadata words.
    pub fn metadata(&self) -> Vec<u64> {
        let len = self.header.metadata_word_count as usize * WORD_SIZE;
        self.body[..len]
            .chunks_exact(WORD_SIZE)
            .map(|chunk| u64::from_ne_bytes(word_at(chunk, 0)))
            .collect()
    }

    /// Payload bytes, including word padding.
    pub fn payload(&self) -> &[u8] {
        &self.body[self.header.metadata_word_count as usize * WORD_SIZE..]
    }

    /// Total record size in bytes.
    pub fn size_bytes(&self) -> usize {
        self.header.size_bytes()
    }

    /// Serialize the complete record.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size_bytes());
        out.extend_from_slice(&self.header.to_bytes());
        out.extend_from_slice(&self.body);
        out
    }
}
