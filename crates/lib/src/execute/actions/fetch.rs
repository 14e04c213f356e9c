//! `download` operation: fetch a URL and verify it before it lands on disk.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::action::Checksum;
use crate::execute::RunState;
use crate::execute::types::ExecuteError;

/// Downloads `url` to `dest` and verifies it against `checksum`.
///
/// When `dest` is an existing directory or ends with `/`, the file name is derived
/// from the URL. A file already present at the destination that satisfies the
/// checksum is reused (etag checksums always re-download, since there is nothing
/// to compare a local file against).
pub async fn execute_download(
  url: &str,
  dest: &Path,
  checksum: &Checksum,
  state: &RunState,
) -> Result<PathBuf, ExecuteError> {
  let dest = destination(url, dest);
  info!(url = %url, dest = ?dest, "downloading");

  if !matches!(checksum, Checksum::Etag(_))
    && dest.is_file()
    && let Ok(bytes) = fs::read(&dest).await
    && verify_bytes(url, &bytes, checksum, None).is_ok()
  {
    info!(path = ?dest, "using cached download");
    return Ok(dest);
  }

  let (bytes, etag) = tokio::select! {
    fetched = fetch(url) => fetched?,
    _ = state.cancel.cancelled() => return Err(ExecuteError::Cancelled),
  };

  verify_bytes(url, &bytes, checksum, etag.as_deref())?;

  if let Some(parent) = dest.parent() {
    fs::create_dir_all(parent)
      .await
      .map_err(|e| ExecuteError::io("create", parent, e))?;
  }
  let mut file = fs::File::create(&dest)
    .await
    .map_err(|e| ExecuteError::io("create", &dest, e))?;
  file
    .write_all(&bytes)
    .await
    .map_err(|e| ExecuteError::io("write", &dest, e))?;
  file.flush().await.map_err(|e| ExecuteError::io("write", &dest, e))?;

  info!(path = ?dest, size = bytes.len(), "download complete");
  Ok(dest)
}

async fn fetch(url: &str) -> Result<(Vec<u8>, Option<String>), ExecuteError> {
  let failed = |message: String| ExecuteError::FetchFailed {
    url: url.to_string(),
    message,
  };

  let response = reqwest::get(url).await.map_err(|e| failed(e.to_string()))?;
  if !response.status().is_success() {
    return Err(failed(format!("HTTP {}", response.status())));
  }

  let etag = response
    .headers()
    .get(reqwest::header::ETAG)
    .and_then(|v| v.to_str().ok())
    .map(str::to_string);
  debug!(url = %url, etag = ?etag, "response received");

  let bytes = response.bytes().await.map_err(|e| failed(e.to_string()))?;
  Ok((bytes.to_vec(), etag))
}

/// Checks downloaded `bytes` (and the response `etag`, if any) against `checksum`.
pub fn verify_bytes(url: &str, bytes: &[u8], checksum: &Checksum, etag: Option<&str>) -> Result<(), ExecuteError> {
  let actual = match checksum {
    Checksum::Sha256(_) => hex::encode(Sha256::digest(bytes)),
    Checksum::Blake3 { key: None, .. } => blake3::hash(bytes).to_hex().to_string(),
    Checksum::Blake3 { key: Some(key), .. } => {
      let key: [u8; 32] = hex::decode(key)
        .ok()
        .and_then(|k| k.try_into().ok())
        .ok_or_else(|| ExecuteError::InvalidKey(key.clone()))?;
      blake3::keyed_hash(&key, bytes).to_hex().to_string()
    }
    Checksum::Etag(_) => etag.unwrap_or_default().trim_matches('"').to_string(),
  };

  if !actual.eq_ignore_ascii_case(checksum.expected()) {
    return Err(ExecuteError::ChecksumMismatch {
      url: url.to_string(),
      algorithm: checksum.algorithm(),
      expected: checksum.expected().to_string(),
      actual,
    });
  }
  Ok(())
}

fn destination(url: &str, dest: &Path) -> PathBuf {
  if dest.is_dir() || dest.as_os_str().to_string_lossy().ends_with('/') {
    dest.join(url_to_filename(url))
  } else {
    dest.to_path_buf()
  }
}

/// Converts a URL to a safe file name.
///
/// Takes the last path component and sanitizes it, falling back to a hash of the URL.
pub fn url_to_filename(url: &str) -> String {
  if let Some(filename) = url.rsplit('/').next() {
    let filename = filename.split('?').next().unwrap_or(filename);

    let sanitized: String = filename
      .chars()
      .map(|c| {
        if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' {
          c
        } else {
          '_'
        }
      })
      .collect();

    if !sanitized.is_empty() && sanitized != "." && sanitized != ".." {
      return sanitized;
    }
  }

  format!("download_{}", &hex::encode(Sha256::digest(url.as_bytes()))[..16])
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};
  use tokio::net::TcpListener;

  const BODY: &[u8] = b"hello";
  const BODY_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

  /// Serves one HTTP response with `body` and an `ETag` header, then exits.
  async fn serve_once(body: &'static [u8], etag: &'static str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
      let (mut socket, _) = listener.accept().await.unwrap();
      let mut request = [0u8; 4096];
      let _ = socket.read(&mut request).await.unwrap();
      let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nETag: \"{etag}\"\r\nConnection: close\r\n\r\n",
        body.len()
      );
      socket.write_all(header.as_bytes()).await.unwrap();
      socket.write_all(body).await.unwrap();
      socket.shutdown().await.unwrap();
    });
    format!("http://{addr}/files/hello.txt")
  }

  #[tokio::test]
  async fn downloads_and_verifies_sha256() {
    let temp = TempDir::new().unwrap();
    let url = serve_once(BODY, "v1").await;
    let checksum = Checksum::Sha256(BODY_SHA256.to_string());

    let path = execute_download(&url, temp.path(), &checksum, &RunState::default())
      .await
      .unwrap();

    assert_eq!(path, temp.path().join("hello.txt"));
    assert_eq!(std::fs::read(&path).unwrap(), BODY);
  }

  #[tokio::test]
  async fn mismatch_leaves_nothing_behind() {
    let temp = TempDir::new().unwrap();
    let url = serve_once(BODY, "v1").await;
    let checksum = Checksum::Sha256("0".repeat(64));

    let result = execute_download(&url, temp.path(), &checksum, &RunState::default()).await;

    assert!(matches!(result, Err(ExecuteError::ChecksumMismatch { algorithm: "sha256", .. })));
    assert!(!temp.path().join("hello.txt").exists());
  }

  #[tokio::test]
  async fn etag_checksum_uses_response_header() {
    let temp = TempDir::new().unwrap();
    let url = serve_once(BODY, "abc123").await;
    let dest = temp.path().join("named.bin");

    let path = execute_download(&url, &dest, &Checksum::Etag("abc123".to_string()), &RunState::default())
      .await
      .unwrap();
    assert_eq!(path, dest);
  }

  #[tokio::test]
  async fn cached_file_skips_network() {
    let temp = TempDir::new().unwrap();
    let dest = temp.path().join("hello.txt");
    std::fs::write(&dest, BODY).unwrap();

    // Nothing listens on this port.
    let url = "http://127.0.0.1:9/hello.txt";
    let path = execute_download(
      url,
      &dest,
      &Checksum::Sha256(BODY_SHA256.to_string()),
      &RunState::default(),
    )
    .await
    .unwrap();
    assert_eq!(path, dest);
  }

  #[test]
  fn verify_blake3_plain_and_keyed() {
    let plain = blake3::hash(BODY).to_hex().to_string();
    let checksum = Checksum::Blake3 { hex: plain, key: None };
    assert!(verify_bytes("u", BODY, &checksum, None).is_ok());

    let key = [7u8; 32];
    let keyed = blake3::keyed_hash(&key, BODY).to_hex().to_string();
    let checksum = Checksum::Blake3 {
      hex: keyed,
      key: Some(hex::encode(key)),
    };
    assert!(verify_bytes("u", BODY, &checksum, None).is_ok());

    let wrong_key = Checksum::Blake3 {
      hex: "00".repeat(32),
      key: Some("zz".to_string()),
    };
    assert!(matches!(
      verify_bytes("u", BODY, &wrong_key, None),
      Err(ExecuteError::InvalidKey(_))
    ));
  }

  #[test]
  fn verify_etag_without_header_fails() {
    let checksum = Checksum::Etag("abc".to_string());
    assert!(verify_bytes("u", BODY, &checksum, Some("\"abc\"")).is_ok());
    assert!(verify_bytes("u", BODY, &checksum, None).is_err());
  }

  #[test]
  fn url_to_filename_simple() {
    assert_eq!(url_to_filename("https://example.com/file.tar.gz"), "file.tar.gz");
  }

  #[test]
  fn url_to_filename_with_query() {
    assert_eq!(
      url_to_filename("https://example.com/file.tar.gz?token=abc"),
      "file.tar.gz"
    );
  }

  #[test]
  fn url_to_filename_sanitizes_special_chars() {
    assert_eq!(
      url_to_filename("https://example.com/file name.tar.gz"),
      "file_name.tar.gz"
    );
  }

  #[test]
  fn url_to_filename_fallback_for_empty() {
    assert!(url_to_filename("https://example.com/").starts_with("download_"));
  }
}
