//! Binary artifact layer: vocabulary, word maps, and the trained bank.
//!
//! Every artifact is a bincode payload framed by four magic bytes and a
//! format version so stale or foreign files fail loudly instead of
//! deserializing into garbage.

use serde::{de::DeserializeOwned, Serialize};
use spm_core::{TrainedBank, Vocabulary, WordMap};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use thiserror::Error;

/// Errors in artifact persistence
#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Invalid artifact: {0}")]
    InvalidData(String),
    #[error("Version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u32, actual: u32 },
}

/// Result type for artifact operations
pub type ArtifactResult<T> = Result<T, ArtifactError>;

/// Current artifact format version
const FORMAT_VERSION: u32 = 1;

/// Magic bytes for vocabulary artifacts
const VOCABULARY_MAGIC: [u8; 4] = *b"SPMV";
/// Magic bytes for word-map artifacts
const WORDMAP_MAGIC: [u8; 4] = *b"SPMW";
/// Magic bytes for trained-bank artifacts
const BANK_MAGIC: [u8; 4] = *b"SPMB";

fn write_framed<T: Serialize, P: AsRef<Path>>(
    value: &T,
    magic: [u8; 4],
    path: P,
) -> ArtifactResult<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);

    writer.write_all(&magic)?;
    writer.write_all(&FORMAT_VERSION.to_le_bytes())?;

    let data =
        bincode::serialize(value).map_err(|e| ArtifactError::Serialization(e.to_string()))?;
    writer.write_all(&(data.len() as u64).to_le_bytes())?;
    writer.write_all(&data)?;

    writer.flush()?;
    Ok(())
}

fn read_framed<T: DeserializeOwned, P: AsRef<Path>>(magic: [u8; 4], path: P) -> ArtifactResult<T> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    let mut found = [0u8; 4];
    reader.read_exact(&mut found)?;
    if found != magic {
        return Err(ArtifactError::InvalidData(format!(
            "bad magic bytes {:?} (expected {:?})",
            found, magic
        )));
    }

    let mut version_bytes = [0u8; 4];
    reader.read_exact(&mut version_bytes)?;
    let version = u32::from_le_bytes(version_bytes);
    if version != FORMAT_VERSION {
        return Err(ArtifactError::VersionMismatch {
            expected: FORMAT_VERSION,
            actual: version,
        });
    }

    let mut len_bytes = [0u8; 8];
    reader.read_exact(&mut len_bytes)?;
    let len = u64::from_le_bytes(len_bytes) as usize;

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data)?;

    bincode::deserialize(&data).map_err(|e| ArtifactError::Serialization(e.to_string()))
}

/// Persist a vocabulary artifact.
pub fn save_vocabulary<P: AsRef<Path>>(vocabulary: &Vocabulary, path: P) -> ArtifactResult<()> {
    write_framed(vocabulary, VOCABULARY_MAGIC, path)
}

/// Load a vocabulary artifact.
pub fn load_vocabulary<P: AsRef<Path>>(path: P) -> ArtifactResult<Vocabulary> {
    read_framed(VOCABULARY_MAGIC, path)
}

/// Persist one image's word map.
pub fn save_wordmap<P: AsRef<Path>>(map: &WordMap, path: P) -> ArtifactResult<()> {
    write_framed(map, WORDMAP_MAGIC, path)
}

/// Load one image's word map.
pub fn load_wordmap<P: AsRef<Path>>(path: P) -> ArtifactResult<WordMap> {
    read_framed(WORDMAP_MAGIC, path)
}

/// Persist a trained bank.
pub fn save_bank<P: AsRef<Path>>(bank: &TrainedBank, path: P) -> ArtifactResult<()> {
    write_framed(bank, BANK_MAGIC, path)
}

/// Load a trained bank.
pub fn load_bank<P: AsRef<Path>>(path: P) -> ArtifactResult<TrainedBank> {
    read_framed(BANK_MAGIC, path)
}

/// Dump a trained bank as JSON (for inspection, not for loading).
pub fn save_bank_json<P: AsRef<Path>>(bank: &TrainedBank, path: P) -> ArtifactResult<()> {
    let file = File::create(path)?;
    let writer = BufWriter::new(file);
    serde_json::to_writer_pretty(writer, bank)
        .map_err(|e| ArtifactError::Serialization(e.to_string()))
}
