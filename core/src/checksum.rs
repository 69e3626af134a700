use serde::{Deserialize, Serialize};

use md5::{Digest as Md5Digest, Md5};
use sha1::{Digest as Sha1Digest, Sha1};
use sha2::{Digest as Sha2Digest, Sha256};

use crate::error::{CoreError, CoreResult};
use crate::package::DownloadPackage;
use crate::storage::StorageBackend;

const READ_BLOCK: usize = 1024 * 64;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChecksumType {
    Md5,
    Sha1,
    Sha256,
}

impl ChecksumType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChecksumType::Md5 => "md5",
            ChecksumType::Sha1 => "sha1",
            ChecksumType::Sha256 => "sha256",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "md5" => Some(ChecksumType::Md5),
            "sha1" => Some(ChecksumType::Sha1),
            "sha256" => Some(ChecksumType::Sha256),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChecksumRequest {
    pub checksum_type: ChecksumType,
    pub expected_hex: String,
}

enum Hasher {
    Md5(Md5),
    Sha1(Sha1),
    Sha256(Sha256),
}

impl Hasher {
    fn new(checksum_type: ChecksumType) -> Self {
        match checksum_type {
            ChecksumType::Md5 => Hasher::Md5(<Md5 as Md5Digest>::new()),
            ChecksumType::Sha1 => Hasher::Sha1(<Sha1 as Sha1Digest>::new()),
            ChecksumType::Sha256 => Hasher::Sha256(<Sha256 as Sha2Digest>::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Md5(hasher) => Md5Digest::update(hasher, data),
            Hasher::Sha1(hasher) => Sha1Digest::update(hasher, data),
            Hasher::Sha256(hasher) => Sha2Digest::update(hasher, data),
        }
    }

    fn finalize_hex(self) -> String {
        match self {
            Hasher::Md5(hasher) => hex::encode(hasher.finalize()),
            Hasher::Sha1(hasher) => hex::encode(hasher.finalize()),
            Hasher::Sha256(hasher) => hex::encode(hasher.finalize()),
        }
    }
}

/// Hex digest of everything the storage holds.
pub async fn digest_storage(storage: &dyn StorageBackend, checksum_type: ChecksumType) -> CoreResult<String> {
    let len = storage.len().await?;
    let mut hasher = Hasher::new(checksum_type);
    let mut offset = 0u64;
    while offset < len {
        let block = (len - offset).min(READ_BLOCK as u64) as usize;
        let data = storage.read_range(offset, block).await?;
        if data.is_empty() {
            break;
        }
        hasher.update(&data);
        offset += data.len() as u64;
    }
    Ok(hasher.finalize_hex())
}

/// Checks the bytes of a finished package. The package keeps its storage
/// handle for in-memory downloads; file downloads are reopened by path.
pub async fn verify_package(package: &DownloadPackage, req: &ChecksumRequest) -> CoreResult<()> {
    let actual = match (&package.storage, &package.file_name) {
        (Some(storage), _) if !storage.is_disposed() => {
            digest_storage(storage.as_ref(), req.checksum_type).await?
        }
        (_, Some(path)) => {
            let storage = crate::storage::FileStorage::new(path.clone());
            let digest = digest_storage(&storage, req.checksum_type).await;
            storage.dispose().await?;
            digest?
        }
        _ => {
            return Err(CoreError::InvalidState(
                "package has no bytes to verify".to_string(),
            ))
        }
    };
    if actual.eq_ignore_ascii_case(req.expected_hex.trim()) {
        Ok(())
    } else {
        Err(CoreError::Validation(format!(
            "{} mismatch: expected {}, got {}",
            req.checksum_type.as_str(),
            req.expected_hex,
            actual
        )))
    }
}
