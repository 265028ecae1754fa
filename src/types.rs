//! Domain identifiers and records exchanged with the metadata server.
//!
//! Record bodies are opaque here: the layer above owns their meaning and
//! their signatures. This module only knows how to name them and how to
//! move them across the wire.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::MdServerError;

const TLF_ID_LEN: usize = 16;
const BRANCH_ID_LEN: usize = 16;

/// Last byte of a private folder ID.
pub const TLF_ID_SUFFIX: u8 = 0x16;
/// Last byte of a public folder ID.
pub const PUBLIC_TLF_ID_SUFFIX: u8 = 0x17;

/// Identifier of a top-level folder.
///
/// The all-zero value is the null ID and is never a valid folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TlfId([u8; TLF_ID_LEN]);

impl TlfId {
    pub const NULL: TlfId = TlfId([0; TLF_ID_LEN]);

    /// Build an ID from raw bytes, checking the visibility suffix.
    pub fn from_bytes(bytes: [u8; TLF_ID_LEN]) -> Result<Self, MdServerError> {
        match bytes[TLF_ID_LEN - 1] {
            TLF_ID_SUFFIX | PUBLIC_TLF_ID_SUFFIX => Ok(Self(bytes)),
            _ => Err(MdServerError::InvalidTlfId(hex::encode(bytes))),
        }
    }

    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }

    pub fn is_public(&self) -> bool {
        self.0[TLF_ID_LEN - 1] == PUBLIC_TLF_ID_SUFFIX
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl FromStr for TlfId {
    type Err = MdServerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| MdServerError::InvalidTlfId(s.to_string()))?;
        let bytes: [u8; TLF_ID_LEN] = bytes
            .try_into()
            .map_err(|_| MdServerError::InvalidTlfId(s.to_string()))?;
        Self::from_bytes(bytes)
    }
}

impl fmt::Display for TlfId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Identifier of an unmerged branch. The zero value is the master branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BranchId([u8; BRANCH_ID_LEN]);

impl BranchId {
    pub const NULL: BranchId = BranchId([0; BRANCH_ID_LEN]);

    pub fn new(bytes: [u8; BRANCH_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }
}

impl FromStr for BranchId {
    type Err = MdServerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)
            .map_err(|e| MdServerError::BadRequest(format!("Invalid branch ID {}: {}", s, e)))?;
        let bytes: [u8; BRANCH_ID_LEN] = bytes
            .try_into()
            .map_err(|_| MdServerError::BadRequest(format!("Invalid branch ID length: {}", s)))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStatus {
    Merged,
    Unmerged,
}

/// Revision number of a folder's metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct MetadataRevision(pub i64);

impl MetadataRevision {
    /// Used in range requests to mean "no bound".
    pub const UNINITIALIZED: MetadataRevision = MetadataRevision(0);
    pub const INITIAL: MetadataRevision = MetadataRevision(1);

    pub fn number(self) -> i64 {
        self.0
    }
}

/// Serialized folder handle, used to look a folder up before its ID is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlfHandle(pub Vec<u8>);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureInfo {
    pub version: u8,
    pub signature: Vec<u8>,
    pub verifying_key: Vec<u8>,
}

/// A signed metadata block as stored by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootMetadataSigned {
    pub sig_info: SignatureInfo,
    /// Encoded metadata body, opaque to this crate.
    pub md: Vec<u8>,
}

/// User ID.
pub type Uid = String;
/// Device key ID.
pub type Kid = String;

/// Server-held half of a folder crypt key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlfCryptKeyServerHalf {
    pub data: [u8; 32],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlfCryptKeyServerHalfId {
    pub id: Vec<u8>,
}
