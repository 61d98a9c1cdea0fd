//! Digest checked file transfer.
//!
//! Fetching goes through the shell: the remote side prints the file as
//! base64, which survives any exec pipe, and its `sha256sum`. Both ends hash
//! independently and any disagreement rejects the bytes. Files are held in
//! memory in full.

use std::fs;
use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use log::debug;

use crate::error::{CaptureError, IntegrityError};
use crate::transport::{quote, Channel};
use crate::utils::sha256_hex;

/// Hex SHA-256 of `remote_path` as reported by the remote `sha256sum`.
pub fn remote_digest(channel: &dyn Channel, remote_path: &str) -> Result<String, CaptureError> {
    let output = channel.run_checked(&format!("sha256sum -- {}", quote(remote_path)?))?;
    let stdout = output.stdout_lossy();
    let digest = stdout.split_whitespace().next().unwrap_or_default();
    if digest.len() != 64 || !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(IntegrityError::MalformedDigest {
            path: remote_path.to_string(),
            output: stdout,
        }
        .into());
    }
    Ok(digest.to_ascii_lowercase())
}

pub fn fetch_verified(channel: &dyn Channel, remote_path: &str) -> Result<Vec<u8>, CaptureError> {
    let expected = remote_digest(channel, remote_path)?;
    let output = channel.run_checked(&format!("base64 < {}", quote(remote_path)?))?;

    let mut encoded = output.stdout;
    encoded.retain(|b| !b.is_ascii_whitespace());
    let bytes = STANDARD
        .decode(&encoded)
        .map_err(|e| IntegrityError::Encoding {
            path: remote_path.to_string(),
            reason: e.to_string(),
        })?;

    let actual = sha256_hex(&bytes);
    if actual != expected {
        return Err(IntegrityError::Mismatch {
            path: remote_path.to_string(),
            remote: expected,
            local: actual,
        }
        .into());
    }
    debug!(
        "fetched {} bytes from {}:{}",
        bytes.len(),
        channel.destination(),
        remote_path
    );
    Ok(bytes)
}

/// Upload `local` and confirm the remote copy hashes to the same digest.
pub fn upload_verified(channel: &dyn Channel, local: &Path, remote_path: &str) -> Result<(), CaptureError> {
    let expected = sha256_hex(&fs::read(local)?);
    channel.upload(local, remote_path)?;
    let actual = remote_digest(channel, remote_path)?;
    if actual != expected {
        return Err(IntegrityError::Mismatch {
            path: remote_path.to_string(),
            remote: actual,
            local: expected,
        }
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::fake::{failed, ok, FakeChannel};
    use tempfile::NamedTempFile;

    const PAYLOAD: &[u8] = b"\x7fELF\x02\x01\x01\0payload";

    fn serving(bytes: &[u8], digest_of: &[u8]) -> FakeChannel {
        // base64 wrapped at 8 columns like coreutils wraps at 76.
        let encoded = STANDARD.encode(bytes);
        let wrapped: Vec<String> = encoded
            .as_bytes()
            .chunks(8)
            .map(|c| String::from_utf8_lossy(c).into_owned())
            .collect();
        FakeChannel::default()
            .respond("sha256sum", ok(&format!("{}  /bin/app\n", sha256_hex(digest_of))))
            .respond("base64", ok(&(wrapped.join("\n") + "\n")))
    }

    #[test]
    fn test_fetch_decodes_wrapped_base64() {
        let channel = serving(PAYLOAD, PAYLOAD);
        assert_eq!(fetch_verified(&channel, "/bin/app").unwrap(), PAYLOAD);
        assert_eq!(
            channel.commands(),
            ["sha256sum -- /bin/app", "base64 < /bin/app"]
        );
    }

    #[test]
    fn test_fetch_rejects_mismatch() {
        let channel = serving(PAYLOAD, b"something else");
        assert!(matches!(
            fetch_verified(&channel, "/bin/app"),
            Err(CaptureError::Integrity(IntegrityError::Mismatch { .. }))
        ));
    }

    #[test]
    fn test_fetch_rejects_malformed_digest() {
        let channel = FakeChannel::default().respond("sha256sum", ok("sha256sum: not found\n"));
        assert!(matches!(
            fetch_verified(&channel, "/bin/app"),
            Err(CaptureError::Integrity(IntegrityError::MalformedDigest { .. }))
        ));
    }

    #[test]
    fn test_fetch_surfaces_remote_failure() {
        let channel = FakeChannel::default().respond("sha256sum", failed(1, "No such file\n"));
        assert!(matches!(
            fetch_verified(&channel, "/missing"),
            Err(CaptureError::Transport(_))
        ));
    }

    #[test]
    fn test_upload_checks_remote_digest() {
        let mut local = NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut local, PAYLOAD).unwrap();

        let good = serving(PAYLOAD, PAYLOAD);
        upload_verified(&good, local.path(), "/remote/app").unwrap();
        assert_eq!(good.uploads.borrow()["/remote/app"], PAYLOAD);

        let bad = serving(PAYLOAD, b"truncated");
        assert!(upload_verified(&bad, local.path(), "/remote/app").is_err());
    }
}
