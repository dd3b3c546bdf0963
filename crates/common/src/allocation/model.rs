use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::Secret;
use crate::document::OpenDocument;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocationKind {
    /// Sent by a member, sealed for one of their KeySafes
    Dispatch { keysafe: Uuid },
    /// Dropped into an inbox, sealed for the inbox's KeySafe
    Deposit { inbox: Uuid, keysafe: Uuid },
    /// Sealed under a transfer code and reachable through a token path
    AnonymousTransfer {
        token: String,
        max_unlock_attempts: Option<u32>,
    },
}

impl AllocationKind {
    /// The KeySafe the metadata is sealed for, if any
    pub fn keysafe(&self) -> Option<Uuid> {
        match self {
            AllocationKind::Dispatch { keysafe } => Some(*keysafe),
            AllocationKind::Deposit { keysafe, .. } => Some(*keysafe),
            AllocationKind::AnonymousTransfer { .. } => None,
        }
    }

    pub fn token(&self) -> Option<&str> {
        match self {
            AllocationKind::AnonymousTransfer { token, .. } => Some(token),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AllocationKind::Dispatch { .. } => "dispatch",
            AllocationKind::Deposit { .. } => "deposit",
            AllocationKind::AnonymousTransfer { .. } => "anonymous transfer",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocationState {
    Active,
    Expired,
    Purged,
}

/// A persisted bundle of files plus a sealed metadata document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub id: Uuid,
    pub kind: AllocationKind,
    pub created: DateTime<Utc>,
    pub expires: Option<DateTime<Utc>>,
    pub deleted: Option<DateTime<Utc>>,
    /// The current version of the sealed metadata
    pub document: Option<Uuid>,
    /// The allocation this one was copied from
    pub derived_from: Option<Uuid>,
    pub revision: u64,
}

impl Allocation {
    pub fn new(
        kind: AllocationKind,
        expires: Option<DateTime<Utc>>,
        derived_from: Option<Uuid>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            created: Utc::now(),
            expires,
            deleted: None,
            document: None,
            derived_from,
            revision: 0,
        }
    }

    pub fn state_at(&self, now: DateTime<Utc>) -> AllocationState {
        if self.deleted.is_some() {
            AllocationState::Purged
        } else if self.expires.is_some_and(|expires| expires <= now) {
            AllocationState::Expired
        } else {
            AllocationState::Active
        }
    }

    pub fn state(&self) -> AllocationState {
        self.state_at(Utc::now())
    }

    pub fn is_purged(&self) -> bool {
        self.deleted.is_some()
    }

    /// Move the expiry to `when` unless it already passed by then.
    ///
    /// Returns whether anything changed.
    pub fn expire_at(&mut self, when: DateTime<Utc>) -> bool {
        expire(&mut self.expires, when)
    }
}

/// One file within an allocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationFile {
    pub id: Uuid,
    pub allocation: Uuid,
    /// Shared encrypted body; cleared once the file is deleted
    pub content: Option<Uuid>,
    /// Order within the bundle
    pub position: u32,
    pub download_count: u32,
    pub expires: Option<DateTime<Utc>>,
    pub deleted: Option<DateTime<Utc>>,
    /// The file in the origin allocation this one was copied from
    pub derived_from: Option<Uuid>,
    pub revision: u64,
}

impl AllocationFile {
    pub fn new(
        allocation: Uuid,
        content: Uuid,
        position: u32,
        derived_from: Option<Uuid>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            allocation,
            content: Some(content),
            position,
            download_count: 0,
            expires: None,
            deleted: None,
            derived_from,
            revision: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.deleted.is_none()
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_some_and(|expires| expires <= now)
    }

    pub fn expire_at(&mut self, when: DateTime<Utc>) -> bool {
        expire(&mut self.expires, when)
    }
}

fn expire(expires: &mut Option<DateTime<Utc>>, when: DateTime<Utc>) -> bool {
    match expires {
        Some(current) if *current <= when => false,
        _ => {
            *expires = Some(when);
            true
        }
    }
}

/// Free-form metadata shown to recipients
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Details {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    /// Terms a recipient has to accept before downloading
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agreement: Option<String>,
}

/// Sealed description of one file, including the key to its body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub content: Uuid,
    pub name: String,
    pub mime_type: String,
    pub length: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_downloads: Option<u32>,
    pub key: Secret,
}

/// The body of an allocation's sealed document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationDocument {
    pub details: Details,
    pub bundle: Vec<FileDescriptor>,
}

impl AllocationDocument {
    pub fn descriptor(&self, content: Uuid) -> Option<&FileDescriptor> {
        self.bundle.iter().find(|d| d.content == content)
    }
}

/// A file handed in for a new allocation
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub name: String,
    pub mime_type: String,
    pub data: Bytes,
    pub max_downloads: Option<u32>,
}

impl UploadedFile {
    /// The mime type is guessed from the name.
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let name = name.into();
        let mime_type = mime_guess::from_path(&name)
            .first_or_octet_stream()
            .to_string();
        Self {
            name,
            mime_type,
            data: data.into(),
            max_downloads: None,
        }
    }

    pub fn with_max_downloads(mut self, max_downloads: u32) -> Self {
        self.max_downloads = Some(max_downloads);
        self
    }
}

/// Where the files of a new allocation come from
#[derive(Debug, Clone)]
pub enum FileSource {
    Upload(Vec<UploadedFile>),
    /// Copy the active files of an existing dispatch
    Dispatch(Uuid),
}

/// An allocation together with its unsealed metadata
#[derive(Debug, Clone)]
pub struct UnlockedAllocation {
    pub allocation: Allocation,
    pub document: OpenDocument<AllocationDocument>,
}

impl UnlockedAllocation {
    pub fn details(&self) -> &Details {
        &self.document.body().details
    }

    pub fn bundle(&self) -> &[FileDescriptor] {
        &self.document.body().bundle
    }
}

/// A file together with its unsealed descriptor
#[derive(Debug, Clone)]
pub struct UnlockedFile {
    pub file: AllocationFile,
    pub descriptor: FileDescriptor,
}

/// Decrypted body of a downloaded file
#[derive(Debug, Clone)]
pub struct DownloadedFile {
    /// The file after its download counter was incremented
    pub file: AllocationFile,
    pub descriptor: FileDescriptor,
    pub data: Bytes,
}
