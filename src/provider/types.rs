//! Wire types for the provider's files / changes endpoints.
//!
//! Field names mirror the provider's camelCase JSON. The descriptor
//! projection requested on every list call is fixed (`FILE_FIELDS`), so these
//! structs are the complete shape the client ever sees.

use serde::{Deserialize, Serialize};

/// Descriptor fields requested on every list call.
pub const FILE_FIELDS: &str =
    "id,name,mimeType,size,parents,modifiedTime,createdTime,md5Checksum,trashed";

/// One remote file descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteFile {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// The provider serializes size as a JSON string; accept both.
    #[serde(default, deserialize_with = "de_opt_i64", skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,
    #[serde(default)]
    pub parents: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5_checksum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trashed: Option<bool>,
}

impl RemoteFile {
    pub fn is_trashed(&self) -> bool {
        self.trashed.unwrap_or(false)
    }
}

/// One page of the files listing.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileList {
    #[serde(default)]
    pub files: Vec<RemoteFile>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

/// One change record: either a removal or an updated descriptor.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    pub file_id: String,
    #[serde(default)]
    pub removed: bool,
    #[serde(default)]
    pub file: Option<RemoteFile>,
}

/// One page of the changes listing. The final page carries
/// `new_start_page_token` instead of `next_page_token`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeList {
    #[serde(default)]
    pub changes: Vec<Change>,
    #[serde(default)]
    pub next_page_token: Option<String>,
    #[serde(default)]
    pub new_start_page_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartPageToken {
    pub start_page_token: String,
}

/// Accept integer-or-string size values.
fn de_opt_i64<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum IntOrStr {
        Int(i64),
        Str(String),
    }
    Ok(match Option::<IntOrStr>::deserialize(deserializer)? {
        Some(IntOrStr::Int(n)) => Some(n),
        Some(IntOrStr::Str(s)) => s.parse().ok(),
        None => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_list_parses_string_sizes() {
        let json = r#"{
            "files": [
                {"id": "f1", "name": "a.txt", "mimeType": "text/plain", "size": "1024"},
                {"id": "f2", "name": "b.txt", "size": 2048}
            ],
            "nextPageToken": "p2"
        }"#;
        let list: FileList = serde_json::from_str(json).expect("parse");
        assert_eq!(list.files[0].size, Some(1024));
        assert_eq!(list.files[1].size, Some(2048));
        assert_eq!(list.next_page_token.as_deref(), Some("p2"));
    }

    #[test]
    fn change_list_final_page() {
        let json = r#"{
            "changes": [
                {"fileId": "f1", "removed": true},
                {"fileId": "f2", "file": {"id": "f2", "name": "b.txt"}}
            ],
            "newStartPageToken": "s9"
        }"#;
        let list: ChangeList = serde_json::from_str(json).expect("parse");
        assert!(list.changes[0].removed);
        assert!(list.changes[1].file.is_some());
        assert!(list.next_page_token.is_none());
        assert_eq!(list.new_start_page_token.as_deref(), Some("s9"));
    }
}
