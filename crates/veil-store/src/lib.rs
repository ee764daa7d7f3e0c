//! # veil-store
//! RocksDB-backed [`NodeStore`] implementation.

mod rocks;

pub use rocks::RocksStore;

use std::path::{Path, PathBuf};

/// Derive the UTXO image path from the database path:
/// `<path-without-.db>-utxo-image.bin`.
pub fn utxo_image_path(db_path: &Path) -> PathBuf {
    let mut s = db_path.to_path_buf().into_os_string().into_string().unwrap_or_default();
    if let Some(stripped) = s.strip_suffix(".db") {
        s = stripped.to_string();
    }
    PathBuf::from(s + "-utxo-image.bin")
}
