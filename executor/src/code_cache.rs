//! On-disk cache of generator executables.
//!
//! A version's code blob is a gzip-compressed executable (native binary
//! or interpreter script with a shebang), opaque to the coordinator. It
//! is unpacked to `<base>/<factor>/<version>/factor_generator` once and
//! reused by every unit task of that version.

use std::io::Read;
use std::path::{Path, PathBuf};

use factorkeeper_lib::{ErrorKind, FkResult};
use factorkeeper_metadb::MetaDb;
use flate2::read::GzDecoder;
use tracing::info;

pub const GENERATOR_FILE_NAME: &str = "factor_generator";

#[derive(Debug, Clone)]
pub struct CodeCache {
    base: PathBuf,
}

impl CodeCache {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn generator_path(&self, factor: &str, version: &str) -> PathBuf {
        self.base.join(factor).join(version).join(GENERATOR_FILE_NAME)
    }

    /// Make sure the generator of `(factor, version)` sits on disk and
    /// return its path, fetching the blob from the store if needed.
    pub async fn ensure(&self, store: &MetaDb, factor: &str, version: &str) -> FkResult<PathBuf> {
        let path = self.generator_path(factor, version);
        if path.exists() {
            return Ok(path);
        }

        let blob = store.get_version_code(factor, version).await?;
        self.unpack(&path, &blob)?;
        info!(factor, version, path = %path.display(), "generator code unpacked");
        Ok(path)
    }

    fn unpack(&self, path: &Path, blob: &[u8]) -> FkResult<()> {
        let dir = path
            .parent()
            .ok_or(ErrorKind::FailedToLoadFactorGeneratorModule)?;
        std::fs::create_dir_all(dir).map_err(|_| ErrorKind::FailedToLoadFactorGeneratorModule)?;

        // uploads are gzipped; accept a raw executable too
        let mut decoded = Vec::new();
        let mut decoder = GzDecoder::new(blob);
        let bytes = match decoder.read_to_end(&mut decoded) {
            Ok(_) => decoded,
            Err(_) => blob.to_vec(),
        };

        std::fs::write(path, bytes).map_err(|_| ErrorKind::FailedToLoadFactorGeneratorModule)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
                .map_err(|_| ErrorKind::FailedToLoadFactorGeneratorModule)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    #[test]
    fn test_unpack_gzipped_blob() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CodeCache::new(dir.path());

        let script = b"#!/bin/sh\necho '[]'\n";
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(script).unwrap();
        let blob = encoder.finish().unwrap();

        let path = cache.generator_path("alpha", "v1");
        cache.unpack(&path, &blob).unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), script);
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o111, 0o111);
        }
    }

    #[test]
    fn test_unpack_raw_blob_passthrough() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CodeCache::new(dir.path());

        let script = b"#!/bin/sh\nexit 0\n";
        let path = cache.generator_path("beta", "v2");
        cache.unpack(&path, script).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), script);
    }

    #[test]
    fn test_generator_path_layout() {
        let cache = CodeCache::new("/tmp/generators");
        assert_eq!(
            cache.generator_path("alpha", "v1"),
            PathBuf::from("/tmp/generators/alpha/v1/factor_generator")
        );
    }
}
