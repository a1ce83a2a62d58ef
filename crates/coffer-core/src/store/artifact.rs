//! Artifact encoding.
//!
//! A node artifact is a JSON header line followed by the raw content
//! bytes (regular files only; directory entries and symlink targets
//! ride in the header). The integrity MAC over the whole artifact lives
//! in a sibling file, handled by the store.

use crate::error::{FsError, FsResult};
use crate::id::FileId;
use crate::model::{DirEntry, NodeAttr, NodeKind, NodePayload, NodeRecord};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;

/// Artifact encoding version.
const ARTIFACT_FORMAT: u32 = 1;

#[derive(Serialize, Deserialize)]
struct ArtifactHeader {
    format: u32,
    kind: NodeKind,
    attr: NodeAttr,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    xattrs: BTreeMap<String, Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    entries: Option<BTreeMap<String, DirEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target: Option<String>,
}

/// Serializes a record into artifact bytes.
pub fn encode_record(record: &NodeRecord) -> FsResult<Vec<u8>> {
    let (entries, target) = match &record.payload {
        NodePayload::Regular(_) => (None, None),
        NodePayload::Directory(entries) => (Some(entries.clone()), None),
        NodePayload::Symlink(target) => (None, Some(target.clone())),
    };
    let header = ArtifactHeader {
        format: ARTIFACT_FORMAT,
        kind: record.kind,
        attr: record.attr.clone(),
        xattrs: record.xattrs.clone(),
        entries,
        target,
    };
    let mut bytes = serde_json::to_vec(&header).map_err(|e| FsError::Io(io::Error::other(e)))?;
    bytes.push(b'\n');
    if let NodePayload::Regular(content) = &record.payload {
        bytes.extend_from_slice(content);
    }
    Ok(bytes)
}

/// Parses artifact bytes back into a record.
///
/// The identifier is only used for error reporting.
pub fn decode_record(id: &FileId, bytes: &[u8]) -> FsResult<NodeRecord> {
    // The header ends at the first newline; content bytes may contain
    // any byte value, including newlines.
    let split = bytes
        .iter()
        .position(|b| *b == b'\n')
        .ok_or_else(|| FsError::Corruption(format!("node {id}: truncated artifact header")))?;
    let header: ArtifactHeader = serde_json::from_slice(&bytes[..split])
        .map_err(|e| FsError::Corruption(format!("node {id}: malformed artifact header: {e}")))?;
    if header.format != ARTIFACT_FORMAT {
        return Err(FsError::Corruption(format!(
            "node {id}: unknown artifact format {}",
            header.format
        )));
    }
    let payload = match header.kind {
        NodeKind::RegularFile => NodePayload::Regular(bytes[split + 1..].to_vec()),
        NodeKind::Directory => NodePayload::Directory(header.entries.ok_or_else(|| {
            FsError::Corruption(format!("node {id}: directory artifact without entries"))
        })?),
        NodeKind::Symlink => NodePayload::Symlink(header.target.ok_or_else(|| {
            FsError::Corruption(format!("node {id}: symlink artifact without target"))
        })?),
    };
    Ok(NodeRecord {
        kind: header.kind,
        attr: header.attr,
        xattrs: header.xattrs,
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Timespec;

    fn sample_attr() -> NodeAttr {
        NodeAttr {
            mode: 0o100644,
            uid: 1000,
            gid: 1000,
            nlink: 1,
            size: 5,
            atime: Timespec::now(),
            mtime: Timespec::now(),
            ctime: Timespec::now(),
        }
    }

    #[test]
    fn test_regular_round_trip_with_newlines_in_content() {
        let mut record = NodeRecord::empty(NodeKind::RegularFile);
        record.attr = sample_attr();
        record.payload = NodePayload::Regular(b"line1\nline2\n\x00\xffbinary".to_vec());
        record
            .xattrs
            .insert("user.tag".to_string(), vec![1, 2, 3]);

        let id = FileId::random();
        let bytes = encode_record(&record).unwrap();
        let back = decode_record(&id, &bytes).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_directory_round_trip() {
        let mut record = NodeRecord::empty(NodeKind::Directory);
        if let NodePayload::Directory(entries) = &mut record.payload {
            entries.insert(
                "child".to_string(),
                DirEntry {
                    id: FileId::random(),
                    kind: NodeKind::RegularFile,
                },
            );
        }
        let id = FileId::random();
        let bytes = encode_record(&record).unwrap();
        assert_eq!(decode_record(&id, &bytes).unwrap(), record);
    }

    #[test]
    fn test_symlink_round_trip() {
        let mut record = NodeRecord::empty(NodeKind::Symlink);
        record.payload = NodePayload::Symlink("../target with spaces".to_string());
        let id = FileId::random();
        let bytes = encode_record(&record).unwrap();
        assert_eq!(decode_record(&id, &bytes).unwrap(), record);
    }

    #[test]
    fn test_garbage_is_corruption() {
        let id = FileId::random();
        let err = decode_record(&id, b"not json\nrest").unwrap_err();
        assert!(matches!(err, FsError::Corruption(_)));

        // Missing newline terminator.
        let err = decode_record(&id, b"{}").unwrap_err();
        assert!(matches!(err, FsError::Corruption(_)));
    }

    #[test]
    fn test_directory_header_without_entries_is_corruption() {
        // A directory header that lost its entries map must not decode.
        let header = br#"{"format":1,"kind":"directory","attr":{"mode":0,"uid":0,"gid":0,"nlink":0,"size":0,"atime":{"secs":0,"nanos":0},"mtime":{"secs":0,"nanos":0},"ctime":{"secs":0,"nanos":0}}}"#;
        let mut bytes = header.to_vec();
        bytes.push(b'\n');
        let err = decode_record(&FileId::ROOT, &bytes).unwrap_err();
        assert!(matches!(err, FsError::Corruption(_)));
    }
}
