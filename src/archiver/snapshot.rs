//! Compressed raw-HTML snapshots.

use std::io::{Read, Write};

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

/// File name of the snapshot inside an archive's storage prefix.
pub const SNAPSHOT_FILE: &str = "snapshot.html.gz";

/// Storage key of the snapshot for the archive stored under `prefix`.
#[must_use]
pub fn snapshot_key(prefix: &str) -> String {
    format!("{}/{SNAPSHOT_FILE}", prefix.trim_end_matches('/'))
}

/// Gzip the fetched HTML verbatim at maximum compression.
pub fn compress(html: &str) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::best());
    encoder
        .write_all(html.as_bytes())
        .context("Failed to compress snapshot")?;
    encoder.finish().context("Failed to finish snapshot")
}

/// Inverse of [`compress`].
pub fn decompress(bytes: &[u8]) -> Result<String> {
    let mut html = String::new();
    GzDecoder::new(bytes)
        .read_to_string(&mut html)
        .context("Failed to decompress snapshot")?;
    Ok(html)
}
