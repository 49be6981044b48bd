use bitcoin::consensus::encode;

use crate::macros::impl_error_from;

#[derive(Debug)]
/// Everything that may go wrong while loading, storing or auditing an address manager
pub enum AddrManError {
    /// A serialization or deserialization error occurred
    Encode(encode::Error),

    /// An I/O error occurred in the standard library
    StdIo(std::io::Error),

    /// The stream was written by a format version we don't know about
    UnsupportedVersion(u8),

    /// The secret key has a size other than 32 bytes
    InvalidKeySize(u8),

    /// The tagged bucket count field doesn't make sense, the stream is corrupted
    CorruptedBucketCount(u32),

    /// One of the tables claims more entries than it can possibly hold
    TooManyEntries {
        /// Which table, either `new` or `tried`
        table: &'static str,

        /// How many entries the stream claims
        count: u32,
    },

    /// A bucket references an entry that doesn't exist
    InvalidBucketEntry(u32),

    /// We couldn't parse an ASN map
    InvalidAsMap(String),

    /// We couldn't parse a TOML configuration
    Config(toml::de::Error),

    /// An internal consistency check failed
    Inconsistent(&'static str),
}

impl std::fmt::Display for AddrManError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AddrManError::Encode(err) => write!(f, "Encode error: {err}"),
            AddrManError::StdIo(err) => write!(f, "Io error: {err}"),
            AddrManError::UnsupportedVersion(version) => {
                write!(f, "Unsupported address manager format version {version}")
            }
            AddrManError::InvalidKeySize(size) => {
                write!(f, "Invalid secret key size {size}, expected 32")
            }
            AddrManError::CorruptedBucketCount(count) => {
                write!(f, "Corrupted bucket count field: {count:#x}")
            }
            AddrManError::TooManyEntries { table, count } => {
                write!(f, "Corrupted address manager: {count} entries in the {table} table")
            }
            AddrManError::InvalidBucketEntry(index) => {
                write!(f, "Bucket references an unknown entry {index}")
            }
            AddrManError::InvalidAsMap(err) => write!(f, "Invalid ASN map: {err}"),
            AddrManError::Config(err) => write!(f, "Error deserializing toml file {err}"),
            AddrManError::Inconsistent(what) => {
                write!(f, "Address manager is inconsistent: {what}")
            }
        }
    }
}

impl_error_from!(AddrManError, encode::Error, Encode);
impl_error_from!(AddrManError, std::io::Error, StdIo);
impl_error_from!(AddrManError, toml::de::Error, Config);

impl std::error::Error for AddrManError {}
