//! Talos boot media acquisition.
//!
//! Boot media comes from the Talos Image Factory. When system extensions are
//! requested and no schematic is pinned, the schematic is registered first;
//! the factory content-addresses it, so registering the same schematic twice
//! yields the same ID.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{BootstrapError, Result};

/// Default schematic ID (vanilla, no extensions).
pub const DEFAULT_SCHEMATIC_ID: &str =
    "376567988ad370138ad8b2698212367b8edcb69b5fd68c80be1f2ec7d603b4ba";

/// Talos Image Factory base URL.
pub const DEFAULT_FACTORY_URL: &str = "https://factory.talos.dev";

/// Boot media settings section of the run configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageSettings {
    /// Image Factory base URL.
    pub factory_url: String,
    /// Pinned schematic ID; registered from `extensions` when unset.
    pub schematic_id: Option<String>,
    /// Official system extensions (e.g. `siderolabs/qemu-guest-agent`).
    pub extensions: Vec<String>,
    /// Extra kernel arguments baked into the media.
    pub extra_kernel_args: Vec<String>,
    /// Platform (`nocloud` for libvirt with cloud-init, `metal` otherwise).
    pub platform: String,
    /// Architecture.
    pub arch: String,
    /// Media format (`iso`, `raw.xz`, `qcow2`).
    pub format: String,
    /// Expected SHA-256 of the media, hex encoded.
    pub sha256: Option<String>,
    /// Directory the media is stored in.
    pub dir: PathBuf,
}

impl Default for ImageSettings {
    fn default() -> Self {
        Self {
            factory_url: DEFAULT_FACTORY_URL.to_string(),
            schematic_id: None,
            extensions: Vec::new(),
            extra_kernel_args: Vec::new(),
            platform: "nocloud".to_string(),
            arch: "amd64".to_string(),
            format: "iso".to_string(),
            sha256: None,
            dir: PathBuf::from("images"),
        }
    }
}

impl ImageSettings {
    /// Local path of the media for a Talos version.
    ///
    /// Independent of the schematic so the provisioner can be pointed at it
    /// even when acquisition is skipped.
    #[must_use]
    pub fn local_path(&self, talos_version: &str) -> PathBuf {
        self.dir.join(format!(
            "talos-{talos_version}-{}-{}.{}",
            self.platform, self.arch, self.format
        ))
    }
}

/// Schematic document accepted by the Image Factory.
#[derive(Debug, Clone, Serialize)]
struct Schematic {
    customization: Customization,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct Customization {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    extra_kernel_args: Vec<String>,
    system_extensions: SystemExtensions,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct SystemExtensions {
    official_extensions: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SchematicResponse {
    id: String,
}

/// Verified boot media on local disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootImage {
    /// Local file path.
    pub path: PathBuf,
    /// Hex SHA-256 of the file.
    pub sha256: String,
    /// Schematic the media was built from.
    pub schematic_id: String,
    /// Whether an existing file was reused.
    pub reused: bool,
}

/// Talos Image Factory client.
#[derive(Clone)]
pub struct ImageFactory {
    client: reqwest::Client,
    base: Url,
}

impl ImageFactory {
    /// Create a factory client.
    ///
    /// # Errors
    ///
    /// Returns an error if the base URL is invalid.
    pub fn new(base_url: &str) -> Result<Self> {
        let base = Url::parse(base_url)
            .map_err(|e| BootstrapError::Config(format!("invalid factory URL '{base_url}': {e}")))?;
        Ok(Self {
            client: reqwest::Client::new(),
            base,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .map_err(|e| BootstrapError::Config(format!("invalid factory path '{path}': {e}")))
    }

    /// Resolve the schematic ID, registering one if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if registration fails.
    pub async fn resolve_schematic(&self, settings: &ImageSettings) -> Result<String> {
        if let Some(id) = &settings.schematic_id {
            return Ok(id.clone());
        }
        if settings.extensions.is_empty() && settings.extra_kernel_args.is_empty() {
            return Ok(DEFAULT_SCHEMATIC_ID.to_string());
        }

        let schematic = Schematic {
            customization: Customization {
                extra_kernel_args: settings.extra_kernel_args.clone(),
                system_extensions: SystemExtensions {
                    official_extensions: settings.extensions.clone(),
                },
            },
        };
        let body = serde_yaml::to_string(&schematic)?;

        info!(extensions = ?settings.extensions, "Registering Image Factory schematic");
        let response: SchematicResponse = self
            .client
            .post(self.endpoint("/schematics")?)
            .body(body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        info!(schematic = %response.id, "Schematic registered");
        Ok(response.id)
    }

    /// Download URL for the media.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL cannot be built.
    pub fn image_url(&self, schematic_id: &str, talos_version: &str, settings: &ImageSettings) -> Result<Url> {
        self.endpoint(&format!(
            "/image/{schematic_id}/{talos_version}/{}-{}.{}",
            settings.platform, settings.arch, settings.format
        ))
    }

    /// Fetch and verify boot media, reusing a verified local copy.
    ///
    /// # Errors
    ///
    /// Returns an error if the download fails or the checksum does not match.
    pub async fn acquire(&self, settings: &ImageSettings, talos_version: &str) -> Result<BootImage> {
        let schematic_id = self.resolve_schematic(settings).await?;
        let path = settings.local_path(talos_version);
        let expected = settings.sha256.as_deref().map(str::to_lowercase);

        if path.exists() {
            let actual = sha256_file(&path).await?;
            match &expected {
                Some(want) if *want == actual => {
                    info!(path = %path.display(), "Reusing verified boot media");
                    return Ok(BootImage {
                        path,
                        sha256: actual,
                        schematic_id,
                        reused: true,
                    });
                }
                Some(_) => {
                    warn!(path = %path.display(), "Existing boot media fails checksum, re-downloading");
                }
                None => {
                    warn!(path = %path.display(), sha256 = %actual, "Reusing boot media without a pinned checksum");
                    return Ok(BootImage {
                        path,
                        sha256: actual,
                        schematic_id,
                        reused: true,
                    });
                }
            }
        }

        let url = self.image_url(&schematic_id, talos_version, settings)?;
        let actual = self.download(&url, &path).await?;

        if let Some(want) = expected {
            if want != actual {
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    warn!(path = %path.display(), "Failed to remove boot media with bad checksum: {e}");
                }
                return Err(BootstrapError::ChecksumMismatch {
                    path: path.display().to_string(),
                    expected: want,
                    actual,
                });
            }
            info!("✅ Checksum verified: {actual}");
        } else {
            warn!(sha256 = %actual, "No checksum pinned; record this value in image.sha256");
        }

        Ok(BootImage {
            path,
            sha256: actual,
            schematic_id,
            reused: false,
        })
    }

    async fn download(&self, url: &Url, dest: &Path) -> Result<String> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        info!(url = %url, "Downloading boot media");
        let mut response = self.client.get(url.clone()).send().await?.error_for_status()?;

        let partial = dest.with_extension("part");
        let mut file = tokio::fs::File::create(&partial).await?;
        let mut hasher = Sha256::new();
        let mut written: u64 = 0;

        while let Some(chunk) = response.chunk().await? {
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        drop(file);

        tokio::fs::rename(&partial, dest).await?;
        debug!(bytes = written, path = %dest.display(), "Download complete");
        Ok(hex::encode(hasher.finalize()))
    }
}

/// Hex SHA-256 of a file.
///
/// # Errors
///
/// Returns an error if the file cannot be read.
pub async fn sha256_file(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1 << 20];

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    const MEDIA: &[u8] = b"talos boot media";

    fn settings(dir: &Path, server: &MockServer) -> ImageSettings {
        ImageSettings {
            factory_url: server.uri(),
            dir: dir.to_path_buf(),
            ..Default::default()
        }
    }

    fn media_sha() -> String {
        hex::encode(Sha256::digest(MEDIA))
    }

    #[test]
    fn test_local_path() {
        let settings = ImageSettings::default();
        assert_eq!(
            settings.local_path("v1.9.5"),
            PathBuf::from("images/talos-v1.9.5-nocloud-amd64.iso")
        );
    }

    #[tokio::test]
    async fn test_sha256_file_spans_multiple_reads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("large.iso");
        let content: Vec<u8> = (0..(3 << 20) + 17).map(|i: u32| (i % 251) as u8).collect();
        std::fs::write(&path, &content).unwrap();

        assert_eq!(sha256_file(&path).await.unwrap(), hex::encode(Sha256::digest(&content)));
    }

    #[tokio::test]
    async fn test_registers_schematic_for_extensions() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/schematics"))
            .and(body_string_contains("siderolabs/qemu-guest-agent"))
            .respond_with(ResponseTemplate::new(201).set_body_string(r#"{"id":"abc123"}"#))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let mut settings = settings(dir.path(), &server);
        settings.extensions = vec!["siderolabs/qemu-guest-agent".to_string()];

        let factory = ImageFactory::new(&server.uri()).unwrap();
        assert_eq!(factory.resolve_schematic(&settings).await.unwrap(), "abc123");
    }

    #[tokio::test]
    async fn test_vanilla_schematic_needs_no_request() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        let factory = ImageFactory::new(&server.uri()).unwrap();

        let id = factory
            .resolve_schematic(&settings(dir.path(), &server))
            .await
            .unwrap();
        assert_eq!(id, DEFAULT_SCHEMATIC_ID);
    }

    #[tokio::test]
    async fn test_download_and_verify() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("/image/{DEFAULT_SCHEMATIC_ID}/v1.9.5/nocloud-amd64.iso")))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(MEDIA))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let mut settings = settings(dir.path(), &server);
        settings.sha256 = Some(media_sha().to_uppercase());

        let factory = ImageFactory::new(&server.uri()).unwrap();
        let image = factory.acquire(&settings, "v1.9.5").await.unwrap();

        assert!(!image.reused);
        assert_eq!(image.sha256, media_sha());
        assert_eq!(std::fs::read(&image.path).unwrap(), MEDIA);

        // Second acquisition reuses the verified file (the mock expects one GET).
        let again = factory.acquire(&settings, "v1.9.5").await.unwrap();
        assert!(again.reused);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(MEDIA))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let mut settings = settings(dir.path(), &server);
        settings.sha256 = Some("00".repeat(32));

        let factory = ImageFactory::new(&server.uri()).unwrap();
        let err = factory.acquire(&settings, "v1.9.5").await.unwrap_err();

        assert!(matches!(err, BootstrapError::ChecksumMismatch { .. }));
        assert!(!settings.local_path("v1.9.5").exists());
    }
}
