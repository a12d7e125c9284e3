//! Download and cache management for the Java tools
//!
//! The identity pipeline needs two jars:
//! - apktool, used to decode and rebuild the apk
//! - uber-apk-signer, used to sign the rebuilt apk
//!
//! Each jar is fetched once from a fixed, versioned release URL and kept in
//! the cache directory under a fixed file name. A cached file is only trusted
//! after an integrity check (jar magic, optional SHA-256), and downloads land
//! in a `.part` file that is renamed into place once complete.

use crate::error::{SideloadError, SideloadResult};
use crate::exec::{args, CommandExecutor};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use std::fs;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Local file header magic shared by zip archives and jars
const JAR_MAGIC: &[u8; 4] = b"PK\x03\x04";

const APKTOOL_URL: &str =
    "https://github.com/iBotPeaches/Apktool/releases/download/v2.7.0/apktool_2.7.0.jar";
const APKSIGNER_URL: &str =
    "https://github.com/patrickfav/uber-apk-signer/releases/download/v1.3.0/uber-apk-signer-1.3.0.jar";

/// Which external tool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    /// apktool (decode + build)
    Decompiler,
    /// uber-apk-signer
    Signer,
}

impl ToolKind {
    pub fn name(&self) -> &'static str {
        match self {
            ToolKind::Decompiler => "decompiler",
            ToolKind::Signer => "signer",
        }
    }

    /// Pinned release this crate was tested against
    pub fn default_source(&self) -> ToolSource {
        match self {
            ToolKind::Decompiler => ToolSource::new(APKTOOL_URL, "apktool.jar"),
            ToolKind::Signer => ToolSource::new(APKSIGNER_URL, "apksigner.jar"),
        }
    }
}

/// Where a tool comes from and where it is cached
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSource {
    /// Versioned download URL
    pub url: String,
    /// File name inside the cache directory
    pub file_name: String,
    /// Expected SHA-256 (or SHA-512) of the jar
    #[serde(default)]
    pub sha256: Option<String>,
}

impl ToolSource {
    pub fn new(url: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            file_name: file_name.into(),
            sha256: None,
        }
    }

    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.sha256 = Some(checksum.into());
        self
    }
}

/// A provisioned tool jar
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolBinary {
    pub kind: ToolKind,
    pub local_path: PathBuf,
    pub remote_source: String,
}

/// Source of remote bytes
pub trait Fetcher {
    /// Fetch the full body at `url`
    fn fetch(&self, url: &str) -> SideloadResult<Vec<u8>>;
}

/// Plain HTTP(S) GET through `ureq`
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpFetcher;

impl Fetcher for HttpFetcher {
    fn fetch(&self, url: &str) -> SideloadResult<Vec<u8>> {
        let response = ureq::get(url).call().map_err(|e| {
            SideloadError::Provisioning(format!("Failed to download {}: {}", url, e))
        })?;

        let mut buffer = Vec::new();
        response
            .into_reader()
            .read_to_end(&mut buffer)
            .map_err(|e| SideloadError::Provisioning(format!("Failed to read response: {}", e)))?;

        debug!("Downloaded {} bytes from {}", buffer.len(), url);
        Ok(buffer)
    }
}

/// Ensures the Java tools exist in a local cache
pub struct ToolProvisioner {
    /// Cache directory for downloaded jars
    cache_dir: PathBuf,
    decompiler: ToolSource,
    signer: ToolSource,
    /// Allow plain HTTP downloads
    allow_insecure: bool,
    fetcher: Box<dyn Fetcher + Send + Sync>,
}

impl ToolProvisioner {
    /// Create a provisioner with the pinned tool releases
    pub fn new(cache_dir: impl AsRef<Path>) -> Self {
        Self {
            cache_dir: cache_dir.as_ref().to_path_buf(),
            decompiler: ToolKind::Decompiler.default_source(),
            signer: ToolKind::Signer.default_source(),
            allow_insecure: false,
            fetcher: Box::new(HttpFetcher),
        }
    }

    /// Override where a tool is downloaded from
    pub fn with_source(mut self, kind: ToolKind, source: ToolSource) -> Self {
        match kind {
            ToolKind::Decompiler => self.decompiler = source,
            ToolKind::Signer => self.signer = source,
        }
        self
    }

    /// Set insecure mode
    pub fn allow_insecure(mut self, allow: bool) -> Self {
        self.allow_insecure = allow;
        self
    }

    /// Replace the network fetcher
    pub fn with_fetcher(mut self, fetcher: impl Fetcher + Send + Sync + 'static) -> Self {
        self.fetcher = Box::new(fetcher);
        self
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn source(&self, kind: ToolKind) -> &ToolSource {
        match kind {
            ToolKind::Decompiler => &self.decompiler,
            ToolKind::Signer => &self.signer,
        }
    }

    /// Cache path for a tool, whether or not it exists yet
    pub fn cache_path(&self, kind: ToolKind) -> PathBuf {
        self.cache_dir.join(&self.source(kind).file_name)
    }

    /// Return the local jar for `kind`, downloading it on first use
    pub fn ensure(&self, kind: ToolKind) -> SideloadResult<ToolBinary> {
        let source = self.source(kind);
        let path = self.cache_path(kind);

        if path.exists() {
            match self.validate_cached(&path, source) {
                Ok(()) => {
                    debug!(
                        target: "sideload::provision",
                        tool = kind.name(),
                        path = %path.display(),
                        "Using cached tool"
                    );
                    return Ok(self.binary(kind, path));
                }
                Err(e) => {
                    warn!(
                        target: "sideload::provision",
                        tool = kind.name(),
                        path = %path.display(),
                        "Discarding cached tool: {}", e
                    );
                    fs::remove_file(&path)?;
                }
            }
        }

        self.validate_url(&source.url)?;

        info!(
            target: "sideload::provision",
            tool = kind.name(),
            url = %source.url,
            "Downloading tool"
        );
        let content = self.fetcher.fetch(&source.url)?;
        self.verify_content(&content, source)?;
        self.save_to_cache(&path, &content)?;

        Ok(self.binary(kind, path))
    }

    // ====================================================================
    // Private methods
    // ====================================================================

    fn binary(&self, kind: ToolKind, local_path: PathBuf) -> ToolBinary {
        ToolBinary {
            kind,
            local_path,
            remote_source: self.source(kind).url.clone(),
        }
    }

    /// Validate URL against security rules
    fn validate_url(&self, url: &str) -> SideloadResult<()> {
        let parsed = url::Url::parse(url)
            .map_err(|e| SideloadError::Provisioning(format!("Invalid URL {}: {}", url, e)))?;

        if !self.allow_insecure && parsed.scheme() != "https" {
            warn!(
                target: "sideload::provision",
                url = %url,
                scheme = %parsed.scheme(),
                "Insecure protocol blocked"
            );
            return Err(SideloadError::Provisioning(format!(
                "Insecure URL scheme ({}), HTTPS required. Set allow_insecure=true to bypass.",
                parsed.scheme()
            )));
        }

        Ok(())
    }

    fn validate_cached(&self, path: &Path, source: &ToolSource) -> SideloadResult<()> {
        let content = fs::read(path)?;
        self.verify_content(&content, source)
    }

    /// Integrity gate for both fresh downloads and cached files
    fn verify_content(&self, content: &[u8], source: &ToolSource) -> SideloadResult<()> {
        if content.is_empty() {
            return Err(SideloadError::Provisioning(format!(
                "{} is empty",
                source.file_name
            )));
        }
        if !content.starts_with(JAR_MAGIC) {
            return Err(SideloadError::Provisioning(format!(
                "{} is not a jar archive",
                source.file_name
            )));
        }
        // A valid header says nothing about a truncated body; the central
        // directory at the end of the archive must also parse.
        zip::ZipArchive::new(Cursor::new(content)).map_err(|e| {
            SideloadError::Provisioning(format!(
                "{} is a damaged jar archive: {}",
                source.file_name, e
            ))
        })?;
        if let Some(expected) = &source.sha256 {
            verify_checksum(content, expected)?;
        }
        Ok(())
    }

    /// Write to a sibling `.part` file, then rename into place
    fn save_to_cache(&self, path: &Path, content: &[u8]) -> SideloadResult<()> {
        fs::create_dir_all(&self.cache_dir)?;
        let mut partial = path.as_os_str().to_owned();
        partial.push(".part");
        let partial = PathBuf::from(partial);

        {
            let mut file = fs::File::create(&partial)?;
            file.write_all(content)?;
            file.sync_all()?;
        }
        fs::rename(&partial, path)?;

        info!("Saved to cache: {} ({} bytes)", path.display(), content.len());
        Ok(())
    }
}

/// Verify a SHA-256 (64 hex chars) or SHA-512 (128 hex chars) checksum
pub fn verify_checksum(content: &[u8], expected: &str) -> SideloadResult<()> {
    let actual = if expected.len() == 64 {
        format!("{:x}", Sha256::digest(content))
    } else if expected.len() == 128 {
        format!("{:x}", Sha512::digest(content))
    } else {
        return Err(SideloadError::Provisioning(format!(
            "Invalid checksum length: {} (expected 64 for SHA256 or 128 for SHA512)",
            expected.len()
        )));
    };

    if !actual.eq_ignore_ascii_case(expected) {
        return Err(SideloadError::Provisioning(format!(
            "Checksum mismatch:\n  Expected: {}\n  Actual:   {}",
            expected, actual
        )));
    }

    Ok(())
}

/// Check that a Java runtime is available, returning its version banner
pub fn check_java(executor: &dyn CommandExecutor, java: &str) -> SideloadResult<String> {
    let output = executor
        .run(java, &args(["-version"]))
        .map_err(|e| SideloadError::Provisioning(format!("Java not found at '{}': {}", java, e)))?;

    if !output.success() {
        return Err(SideloadError::Provisioning(format!(
            "Java version check failed ({}). Please install Java and try again.",
            output.status()
        )));
    }

    // `java -version` prints to stderr
    let banner = output
        .combined()
        .lines()
        .next()
        .unwrap_or_default()
        .to_string();
    Ok(banner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_provisioner_creation() {
        let temp = TempDir::new().unwrap();
        let provisioner = ToolProvisioner::new(temp.path());
        assert_eq!(provisioner.cache_dir(), temp.path());
        assert!(!provisioner.allow_insecure);
        assert_eq!(
            provisioner.cache_path(ToolKind::Signer),
            temp.path().join("apksigner.jar")
        );
    }

    #[test]
    fn test_url_validation_https() {
        let temp = TempDir::new().unwrap();
        let provisioner = ToolProvisioner::new(temp.path());

        assert!(provisioner.validate_url("https://example.com/tool.jar").is_ok());
        assert!(provisioner.validate_url("http://example.com/tool.jar").is_err());
        assert!(provisioner.validate_url("not a url").is_err());
    }

    #[test]
    fn test_url_validation_insecure() {
        let temp = TempDir::new().unwrap();
        let provisioner = ToolProvisioner::new(temp.path()).allow_insecure(true);

        assert!(provisioner.validate_url("http://example.com/tool.jar").is_ok());
    }

    #[test]
    fn test_checksum_sha256() {
        let content = b"hello world";

        let sha256 = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";
        assert!(verify_checksum(content, sha256).is_ok());
        assert!(verify_checksum(content, &sha256.to_uppercase()).is_ok());

        let wrong = "0000000000000000000000000000000000000000000000000000000000000000";
        assert!(verify_checksum(content, wrong).is_err());
        assert!(verify_checksum(content, "abc").is_err());
    }

    fn jar() -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Stored);
        writer.start_file("META-INF/MANIFEST.MF", options).unwrap();
        writer.write_all(b"Manifest-Version: 1.0\n").unwrap();
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn test_verify_content_requires_jar_magic() {
        let temp = TempDir::new().unwrap();
        let provisioner = ToolProvisioner::new(temp.path());
        let source = ToolKind::Decompiler.default_source();

        assert!(provisioner.verify_content(b"", &source).is_err());
        assert!(provisioner.verify_content(b"<html>", &source).is_err());
        assert!(provisioner.verify_content(&jar(), &source).is_ok());
    }

    #[test]
    fn test_verify_content_rejects_truncated_jar() {
        let temp = TempDir::new().unwrap();
        let provisioner = ToolProvisioner::new(temp.path());
        let source = ToolKind::Decompiler.default_source();

        let jar = jar();
        let truncated = &jar[..jar.len() / 2];
        assert!(truncated.starts_with(JAR_MAGIC));
        assert!(provisioner.verify_content(truncated, &source).is_err());
        assert!(provisioner.verify_content(b"PK\x03\x04rest", &source).is_err());
    }
}
