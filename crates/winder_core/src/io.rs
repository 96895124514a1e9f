//! Snapshot persistence with pluggable byte-level codecs.
//!
//! The engines hand a [`Snapshot`] to [`save`] after every accepted
//! refinement step; [`load`] distinguishes a missing snapshot ("start
//! fresh") from a broken one. Codecs only translate between snapshots and
//! bytes, so swapping one for another never changes computed results.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::line::LineResult;
use crate::surface::SurfaceResult;

/// Persisted engine state: one line or one surface run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Snapshot {
    Line(LineResult),
    Surface(SurfaceResult),
}

impl Snapshot {
    pub fn into_line(self) -> Result<LineResult> {
        match self {
            Snapshot::Line(result) => Ok(result),
            Snapshot::Surface(_) => Err(Error::SnapshotCodec(
                "snapshot holds a surface result, not a line result".into(),
            )),
        }
    }

    pub fn into_surface(self) -> Result<SurfaceResult> {
        match self {
            Snapshot::Surface(result) => Ok(result),
            Snapshot::Line(_) => Err(Error::SnapshotCodec(
                "snapshot holds a line result, not a surface result".into(),
            )),
        }
    }
}

/// Byte-level snapshot codec.
pub trait Codec: Send + Sync {
    fn encode(&self, snapshot: &Snapshot) -> Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> Result<Snapshot>;
}

/// Human-readable JSON codec, the default.
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, snapshot: &Snapshot) -> Result<Vec<u8>> {
        serde_json::to_vec(snapshot).map_err(|err| Error::SnapshotCodec(err.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Snapshot> {
        serde_json::from_slice(bytes).map_err(|err| Error::SnapshotCodec(err.to_string()))
    }
}

/// Compact binary codec.
pub struct BincodeCodec;

impl Codec for BincodeCodec {
    fn encode(&self, snapshot: &Snapshot) -> Result<Vec<u8>> {
        bincode::serialize(snapshot).map_err(|err| Error::SnapshotCodec(err.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Snapshot> {
        bincode::deserialize(bytes).map_err(|err| Error::SnapshotCodec(err.to_string()))
    }
}

static BUILTIN_CODECS: Lazy<BTreeMap<&'static str, &'static dyn Codec>> = Lazy::new(|| {
    let mut registry: BTreeMap<&'static str, &'static dyn Codec> = BTreeMap::new();
    registry.insert("json", &JsonCodec);
    registry.insert("bincode", &BincodeCodec);
    registry
});

/// Looks up a builtin codec by name.
pub fn codec(name: &str) -> Result<&'static dyn Codec> {
    BUILTIN_CODECS
        .get(name)
        .copied()
        .ok_or_else(|| Error::UnknownCodec(name.to_string()))
}

/// The codec used when none is specified.
pub fn default_codec() -> &'static dyn Codec {
    &JsonCodec
}

/// Incremental-save destination handed to the engines.
#[derive(Clone, Copy)]
pub struct SaveTo<'a> {
    pub path: &'a Path,
    pub codec: &'a dyn Codec,
}

impl<'a> SaveTo<'a> {
    pub fn new(path: &'a Path) -> Self {
        Self {
            path,
            codec: default_codec(),
        }
    }

    pub fn with_codec(path: &'a Path, codec: &'a dyn Codec) -> Self {
        Self { path, codec }
    }
}

/// Writes a snapshot, replacing any previous one at the path.
pub fn save(path: &Path, codec: &dyn Codec, snapshot: &Snapshot) -> Result<()> {
    let bytes = codec.encode(snapshot)?;
    fs::write(path, bytes)?;
    Ok(())
}

/// Reads a snapshot back. A missing file is reported as
/// [`Error::SnapshotMissing`] so callers can start fresh; any other failure
/// means the restart itself is broken.
pub fn load(path: &Path, codec: &dyn Codec) -> Result<Snapshot> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(Error::SnapshotMissing {
                path: path.to_path_buf(),
            })
        }
        Err(err) => return Err(Error::SnapshotIo(err)),
    };
    codec.decode(&bytes)
}
