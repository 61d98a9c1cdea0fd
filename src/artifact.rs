//! Content-addressed store for captured binaries.
//!
//! A binary is stored as `<digest>.<basename>.binary` where `digest` is the
//! SHA-256 of its bytes in lower-case unpadded base32. Identical content
//! always lands on the same file, so runs dedup without reference counting.
//!
//! Mapping paths are rewritten by basename. Two different binaries with the
//! same basename in one profile can therefore be attributed to the wrong
//! archived copy.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use data_encoding::BASE32_NOPAD;
use log::{debug, info};
use sha2::{Digest, Sha256};

use crate::profile::{basename, Profile};

pub const ARTIFACT_SUFFIX: &str = ".binary";

/// Length of a base32 encoded SHA-256 digest without padding.
pub const DIGEST_LEN: usize = 52;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub digest: String,
    pub basename: String,
    pub path: PathBuf,
    pub size: u64,
}

impl Artifact {
    pub fn file_name(&self) -> String {
        artifact_key(&self.digest, &self.basename)
    }
}

pub fn digest(bytes: &[u8]) -> String {
    BASE32_NOPAD
        .encode(&Sha256::digest(bytes))
        .to_ascii_lowercase()
}

pub fn artifact_key(digest: &str, basename: &str) -> String {
    format!("{digest}.{basename}{ARTIFACT_SUFFIX}")
}

/// Split an artifact file name into its digest and original basename.
pub fn parse_key(file_name: &str) -> Option<(&str, &str)> {
    let stem = file_name.strip_suffix(ARTIFACT_SUFFIX)?;
    let (digest, basename) = stem.split_once('.')?;
    let valid = digest.len() == DIGEST_LEN
        && digest
            .bytes()
            .all(|b| b.is_ascii_lowercase() || (b'2'..=b'7').contains(&b));
    (valid && !basename.is_empty()).then_some((digest, basename))
}

/// Basename of a mapping path with any artifact naming removed.
fn unarchived_basename(path: &str) -> &str {
    let name = basename(path);
    parse_key(name).map_or(name, |(_, base)| base)
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    pub fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(ArtifactStore { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Store `bytes` under their content key. Existing files are left alone.
    pub fn archive(&self, bytes: &[u8], original_basename: &str) -> io::Result<Artifact> {
        let base = basename(original_basename);
        if base.is_empty() || base == "." || base == ".." {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid artifact basename {original_basename:?}"),
            ));
        }
        let digest = digest(bytes);
        let path = self.dir.join(artifact_key(&digest, base));

        if path.exists() {
            debug!("artifact {} already archived", path.display());
        } else {
            let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
            tmp.write_all(bytes)?;
            tmp.as_file()
                .set_permissions(fs::Permissions::from_mode(0o755))?;
            match tmp.persist_noclobber(&path) {
                Ok(_) => info!("archived {} ({} bytes)", path.display(), bytes.len()),
                // Lost a race with another writer of the same content.
                Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.error),
            }
        }

        Ok(Artifact {
            digest,
            basename: base.to_string(),
            path,
            size: bytes.len() as u64,
        })
    }

    pub fn archive_file(&self, path: &Path) -> io::Result<Artifact> {
        let bytes = fs::read(path)?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{} has no usable file name", path.display()),
                )
            })?;
        self.archive(&bytes, name)
    }
}

/// Point every real mapping whose basename is `original_basename` at
/// `archived_path`. Returns the number of mappings changed.
pub fn rewrite_profile(profile: &mut Profile, original_basename: &str, archived_path: &str) -> usize {
    let mut rewritten = 0;
    for mapping in profile.mappings.iter_mut().filter(|m| !m.pseudo) {
        if unarchived_basename(&mapping.path) == original_basename && mapping.path != archived_path {
            debug!("rewriting mapping {} -> {}", mapping.path, archived_path);
            mapping.path = archived_path.to_string();
            rewritten += 1;
        }
    }
    rewritten
}

/// Replace mapping paths that exactly match a key of `paths`.
pub fn rewrite_exact(profile: &mut Profile, paths: &HashMap<String, String>) -> usize {
    let mut rewritten = 0;
    for mapping in profile.mappings.iter_mut().filter(|m| !m.pseudo) {
        if let Some(archived) = paths.get(&mapping.path) {
            mapping.path = archived.clone();
            rewritten += 1;
        }
    }
    rewritten
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{MappingBounds, ProfileBuilder};
    use tempfile::TempDir;

    fn two_mapping_profile() -> Profile {
        let mut builder = ProfileBuilder::new(MappingBounds::FullRange);
        builder.location("main", 0x401000, Some("/tmp/build/myapp"));
        builder.location("start_kernel", 0xffffffff81000000, Some("[kernel.kallsyms]"));
        builder.finish(0)
    }

    #[test]
    fn test_digest_is_deterministic() {
        let a = digest(b"\x7fELF binary");
        assert_eq!(a, digest(b"\x7fELF binary"));
        assert_ne!(a, digest(b"\x7fELF binarz"));
        assert_eq!(a.len(), DIGEST_LEN);
        assert!(!a.contains('='));
        assert_eq!(a, a.to_ascii_lowercase());
    }

    #[test]
    fn test_parse_key() {
        let d = digest(b"x");
        let key = artifact_key(&d, "my.app");
        assert_eq!(parse_key(&key), Some((d.as_str(), "my.app")));
        assert_eq!(parse_key("myapp"), None);
        assert_eq!(parse_key("short.myapp.binary"), None);
        assert_eq!(parse_key(&format!("{d}..binary")), None);
    }

    #[test]
    fn test_archive_writes_executable_once() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        let first = store.archive(b"contents", "myapp").unwrap();
        let second = store.archive(b"contents", "/some/where/myapp").unwrap();
        assert_eq!(first, second);
        assert_eq!(first.size, 8);
        assert_eq!(fs::read(&first.path).unwrap(), b"contents");
        let mode = fs::metadata(&first.path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_rewrite_by_basename_skips_pseudo() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        let artifact = store.archive(b"myapp bytes", "myapp").unwrap();
        let archived = artifact.path.to_string_lossy().into_owned();

        let mut profile = two_mapping_profile();
        assert_eq!(rewrite_profile(&mut profile, "myapp", &archived), 1);
        assert_eq!(profile.mappings[0].path, archived);
        assert_eq!(profile.mappings[1].path, "[kernel.kallsyms]");

        // Already archived names still match by their original basename.
        let moved = format!("/elsewhere/{}", artifact.file_name());
        assert_eq!(rewrite_profile(&mut profile, "myapp", &moved), 1);
        assert_eq!(profile.mappings[0].path, moved);
    }

    #[test]
    fn test_rewrite_exact() {
        let mut profile = two_mapping_profile();
        let paths = HashMap::from([
            ("/tmp/build/myapp".to_string(), "abc.myapp.binary".to_string()),
            ("[kernel.kallsyms]".to_string(), "nope".to_string()),
        ]);
        assert_eq!(rewrite_exact(&mut profile, &paths), 1);
        assert_eq!(profile.mappings[0].path, "abc.myapp.binary");
        assert_eq!(profile.mappings[1].path, "[kernel.kallsyms]");
    }

    #[test]
    fn test_archive_rejects_empty_name() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        assert!(store.archive(b"x", "").is_err());
    }
}
