//! Request and response records of the metadata protocol.
//!
//! Field names follow the server's camelCase record keys. Byte fields carry
//! msgpack-encoded domain records produced by [`encode`] and read back with
//! [`decode`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::MdServerError;

/// Protocol the server calls back into with pushes.
pub const UPDATE_PROTOCOL: &str = "keybase.1.metadataUpdate";
pub const METADATA_UPDATE: &str = "metadataUpdate";
pub const FOLDER_NEEDS_REKEY: &str = "folderNeedsRekey";

pub const AUTHENTICATE: &str = "keybase.1.metadata.authenticate";
pub const PING: &str = "keybase.1.metadata.ping";
pub const REGISTER_FOR_UPDATES: &str = "keybase.1.metadata.registerForUpdates";
pub const GET_METADATA: &str = "keybase.1.metadata.getMetadata";
pub const PUT_METADATA: &str = "keybase.1.metadata.putMetadata";
pub const PRUNE_BRANCH: &str = "keybase.1.metadata.pruneBranch";
pub const GET_KEY: &str = "keybase.1.metadata.getKey";
pub const PUT_KEYS: &str = "keybase.1.metadata.putKeys";
pub const GET_FOLDERS_FOR_REKEY: &str = "keybase.1.metadata.getFoldersForRekey";

/// `authenticate` returns the ping interval in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticateArg {
    pub signature: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterForUpdatesArg {
    pub folder_id: String,
    pub curr_revision: i64,
}

/// Either `folder_id` or `folder_handle` names the folder; the ID wins.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetMetadataArg {
    #[serde(default)]
    pub folder_id: String,
    #[serde(default)]
    pub folder_handle: Vec<u8>,
    pub branch_id: String,
    pub unmerged: bool,
    pub start_revision: i64,
    pub stop_revision: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataResponse {
    pub folder_id: String,
    #[serde(default)]
    pub md_blocks: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PutMetadataArg {
    pub md_block: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PruneBranchArg {
    pub folder_id: String,
    pub branch_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetKeyArg {
    pub key_half_id: Vec<u8>,
    #[serde(rename = "deviceKID")]
    pub device_kid: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyHalf {
    pub user: String,
    #[serde(rename = "deviceKID")]
    pub device_kid: String,
    pub key: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PutKeysArg {
    pub key_halves: Vec<KeyHalf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetFoldersForRekeyArg {
    #[serde(rename = "deviceKID")]
    pub device_kid: String,
}

/// Body of both server pushes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderPushArg {
    pub folder_id: String,
    #[serde(default)]
    pub revision: i64,
}

/// Encode a domain record into the bytes carried by a request.
pub fn encode<T: Serialize + ?Sized>(record: &T) -> Result<Vec<u8>, MdServerError> {
    rmp_serde::to_vec_named(record).map_err(|e| MdServerError::Codec(e.to_string()))
}

/// Decode a domain record from bytes carried by a response.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, MdServerError> {
    rmp_serde::from_slice(bytes).map_err(|e| MdServerError::Codec(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::to_record;

    #[test]
    fn test_device_kid_keeps_server_spelling() {
        let value = to_record(&GetFoldersForRekeyArg {
            device_kid: "0120ab".into(),
        })
        .unwrap();
        let map = value.as_map().unwrap();
        assert_eq!(map[0].0.as_str(), Some("deviceKID"));
    }

    #[test]
    fn test_push_without_revision_decodes() {
        let value = to_record(&RegisterForUpdatesArg {
            folder_id: "abc".into(),
            curr_revision: 4,
        })
        .unwrap();
        // Same folderId key, extra field ignored, revision defaulted
        let push: FolderPushArg = crate::rpc::from_record(value).unwrap();
        assert_eq!(push.folder_id, "abc");
        assert_eq!(push.revision, 0);
    }

    #[test]
    fn test_garbage_block_is_codec_error() {
        let err = decode::<crate::types::RootMetadataSigned>(&[0xc1]).unwrap_err();
        assert!(matches!(err, MdServerError::Codec(_)));
    }
}
