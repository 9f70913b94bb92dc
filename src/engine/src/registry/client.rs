//! Docker Registry HTTP API v2 wire client.
//!
//! One client per (registry, repository) pair, carrying a cached bearer
//! token. Blob uploads follow the chunked v2 flow — `POST` to open an
//! upload, `PATCH` the bytes, `PUT` with the digest — and resume from the
//! offset the registry reports when a chunk fails mid-flight. Downloads
//! stream to a `.partial` file that is renamed only after the digest
//! checks out.

use std::path::Path;

use futures_util::StreamExt;
use kubeimage_core::{CancelFlag, EngineConfig, EngineError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tokio::sync::RwLock;
use tracing::debug;

use super::auth::{fetch_token, repository_scope, BearerChallenge, Credentials};

/// Schema-2 manifest media type for cluster images.
pub const MANIFEST_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";
/// Config blob media type: the image JSON.
pub const CONFIG_MEDIA_TYPE: &str = "application/vnd.docker.container.image.v1+json";
/// Accept list for manifest fetches, broad enough for embedded container
/// images that ship OCI manifests or indexes.
pub const MANIFEST_ACCEPT: &str = "application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.oci.image.manifest.v1+json, \
     application/vnd.docker.distribution.manifest.list.v2+json, \
     application/vnd.oci.image.index.v1+json";

/// Bytes per upload chunk.
pub const UPLOAD_CHUNK_SIZE: usize = 5 * 1024 * 1024;

/// A content descriptor in a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub digest: String,
    pub size: u64,
}

/// Schema-2 image manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
}

impl Manifest {
    pub fn new(config: Descriptor, layers: Vec<Descriptor>) -> Self {
        Self {
            schema_version: 2,
            media_type: MANIFEST_MEDIA_TYPE.to_string(),
            config,
            layers,
        }
    }
}

/// v2 client bound to one repository.
pub struct RegistryClient {
    registry: String,
    repository: String,
    base: String,
    http: reqwest::Client,
    credentials: Option<Credentials>,
    token: RwLock<Option<String>>,
    cancel: CancelFlag,
}

impl RegistryClient {
    pub fn new(
        registry: &str,
        repository: &str,
        config: &EngineConfig,
        credentials: Option<Credentials>,
        cancel: CancelFlag,
    ) -> Result<Self> {
        let scheme = if config.insecure_registry { "http" } else { "https" };
        let http = reqwest::Client::builder()
            .timeout(config.registry_timeout())
            .build()
            .map_err(|e| EngineError::Registry {
                registry: registry.to_string(),
                message: format!("failed to build http client: {}", e),
            })?;
        Ok(Self {
            registry: registry.to_string(),
            repository: repository.to_string(),
            base: format!("{}://{}", scheme, registry),
            http,
            credentials,
            token: RwLock::new(None),
            cancel,
        })
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// HEAD a blob; `Some(size)` when present.
    pub async fn blob_stat(&self, digest: &str) -> Result<Option<u64>> {
        let url = format!("{}/v2/{}/blobs/{}", self.base, self.repository, digest);
        let response = self.send(|| self.http.head(&url)).await?;
        match response.status().as_u16() {
            200 => Ok(Some(
                response
                    .content_length()
                    .unwrap_or_default(),
            )),
            404 => Ok(None),
            status => Err(self.err(format!("blob HEAD {} returned {}", digest, status))),
        }
    }

    /// Upload a blob from a spool file, chunked and resumable.
    pub async fn upload_blob_file(&self, path: &Path, digest: &str) -> Result<()> {
        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(|e| self.err(format!("cannot open spool {}: {}", path.display(), e)))?;
        let total = file
            .metadata()
            .await
            .map_err(|e| self.err(format!("cannot stat spool: {}", e)))?
            .len();

        let mut location = self.start_upload().await?;
        let mut offset = 0u64;

        while offset < total {
            self.cancel.check()?;
            let want = UPLOAD_CHUNK_SIZE.min((total - offset) as usize);
            let mut chunk = vec![0u8; want];
            file.read_exact(&mut chunk)
                .await
                .map_err(|e| self.err(format!("spool read failed: {}", e)))?;

            match self.patch_chunk(&location, offset, chunk.clone()).await {
                Ok(next) => {
                    location = next;
                    offset += want as u64;
                }
                Err(first) => {
                    // ask the registry where the upload stands, then retry
                    // the remainder of this chunk once
                    let committed = self.upload_status(&location).await.map_err(|_| first)?;
                    if committed < offset || committed > offset + want as u64 {
                        return Err(self.err(format!(
                            "upload out of sync: registry at byte {}, client at {}",
                            committed, offset
                        )));
                    }
                    let skip = (committed - offset) as usize;
                    location = self
                        .patch_chunk(&location, committed, chunk[skip..].to_vec())
                        .await?;
                    offset += want as u64;
                }
            }
        }

        self.complete_upload(&location, digest).await
    }

    /// Upload a small blob held in memory (the config JSON).
    pub async fn upload_blob_bytes(&self, bytes: &[u8], digest: &str) -> Result<()> {
        let location = self.start_upload().await?;
        let location = self.patch_chunk(&location, 0, bytes.to_vec()).await?;
        self.complete_upload(&location, digest).await
    }

    /// Stream a blob to `dest`, verifying size and digest before the
    /// final rename makes it visible.
    pub async fn get_blob(&self, descriptor: &Descriptor, dest: &Path) -> Result<()> {
        let url = format!(
            "{}/v2/{}/blobs/{}",
            self.base, self.repository, descriptor.digest
        );
        let response = self.send(|| self.http.get(&url)).await?;
        if !response.status().is_success() {
            return Err(self.err(format!(
                "blob GET {} returned {}",
                descriptor.digest,
                response.status()
            )));
        }

        let partial = dest.with_extension("partial");
        let mut file = tokio::fs::File::create(&partial)
            .await
            .map_err(|e| self.err(format!("cannot create {}: {}", partial.display(), e)))?;
        let mut hasher = Sha256::new();
        let mut written = 0u64;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            self.cancel.check()?;
            let data = chunk.map_err(|e| self.err(format!("blob stream failed: {}", e)))?;
            hasher.update(&data);
            written += data.len() as u64;
            tokio::io::AsyncWriteExt::write_all(&mut file, &data)
                .await
                .map_err(|e| self.err(format!("blob write failed: {}", e)))?;
        }
        tokio::io::AsyncWriteExt::flush(&mut file)
            .await
            .map_err(|e| self.err(format!("blob flush failed: {}", e)))?;
        drop(file);

        let actual = format!("sha256:{}", hex::encode(hasher.finalize()));
        if written != descriptor.size || actual != descriptor.digest {
            tokio::fs::remove_file(&partial).await.ok();
            return Err(self.err(format!(
                "blob {} verification failed: got {} ({} bytes)",
                descriptor.digest, actual, written
            )));
        }
        tokio::fs::rename(&partial, dest)
            .await
            .map_err(|e| self.err(format!("cannot finalize blob: {}", e)))?;
        Ok(())
    }

    /// Fetch a blob into memory (config blobs only; layers stream).
    pub async fn get_blob_bytes(&self, descriptor: &Descriptor) -> Result<Vec<u8>> {
        let url = format!(
            "{}/v2/{}/blobs/{}",
            self.base, self.repository, descriptor.digest
        );
        let response = self.send(|| self.http.get(&url)).await?;
        if !response.status().is_success() {
            return Err(self.err(format!(
                "blob GET {} returned {}",
                descriptor.digest,
                response.status()
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| self.err(format!("blob read failed: {}", e)))?
            .to_vec();
        let actual = format!("sha256:{}", crate::digest::sha256_bytes(&bytes));
        if actual != descriptor.digest {
            return Err(self.err(format!(
                "blob {} verification failed: got {}",
                descriptor.digest, actual
            )));
        }
        Ok(bytes)
    }

    /// Fetch a manifest by tag or digest; returns raw bytes, the
    /// distribution digest, and the content type.
    pub async fn get_manifest_raw(&self, reference: &str) -> Result<(Vec<u8>, String, String)> {
        let url = format!(
            "{}/v2/{}/manifests/{}",
            self.base, self.repository, reference
        );
        let response = self
            .send(|| self.http.get(&url).header("Accept", MANIFEST_ACCEPT))
            .await?;
        if response.status().as_u16() == 404 {
            return Err(EngineError::NotFound(format!(
                "manifest {}/{}:{}",
                self.registry, self.repository, reference
            )));
        }
        if !response.status().is_success() {
            return Err(self.err(format!(
                "manifest GET {} returned {}",
                reference,
                response.status()
            )));
        }
        let content_type = response
            .headers()
            .get("Content-Type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or(MANIFEST_MEDIA_TYPE)
            .to_string();
        let header_digest = response
            .headers()
            .get("Docker-Content-Digest")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = response
            .bytes()
            .await
            .map_err(|e| self.err(format!("manifest read failed: {}", e)))?
            .to_vec();
        let digest = header_digest
            .unwrap_or_else(|| format!("sha256:{}", crate::digest::sha256_bytes(&bytes)));
        Ok((bytes, digest, content_type))
    }

    /// Fetch and parse a schema-2 manifest by tag.
    pub async fn get_manifest(&self, tag: &str) -> Result<Manifest> {
        let (bytes, _, _) = self.get_manifest_raw(tag).await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| self.err(format!("manifest for {} did not parse: {}", tag, e)))
    }

    /// PUT a schema-2 manifest at a tag. Returns its digest.
    pub async fn put_manifest(&self, tag: &str, manifest: &Manifest) -> Result<String> {
        let bytes = serde_json::to_vec(manifest)?;
        let url = format!("{}/v2/{}/manifests/{}", self.base, self.repository, tag);
        let body = bytes.clone();
        let response = self
            .send(move || {
                self.http
                    .put(&url)
                    .header("Content-Type", MANIFEST_MEDIA_TYPE)
                    .body(body.clone())
            })
            .await?;
        if !response.status().is_success() {
            return Err(self.err(format!(
                "manifest PUT {} returned {}",
                tag,
                response.status()
            )));
        }
        Ok(format!("sha256:{}", crate::digest::sha256_bytes(&bytes)))
    }

    async fn start_upload(&self) -> Result<String> {
        let url = format!("{}/v2/{}/blobs/uploads/", self.base, self.repository);
        let response = self.send(|| self.http.post(&url)).await?;
        if response.status().as_u16() != 202 {
            return Err(self.err(format!("upload POST returned {}", response.status())));
        }
        self.location_of(&response)
    }

    async fn patch_chunk(&self, location: &str, offset: u64, chunk: Vec<u8>) -> Result<String> {
        let end = offset + chunk.len() as u64;
        let response = self
            .send(move || {
                self.http
                    .patch(location)
                    .header("Content-Type", "application/octet-stream")
                    .header("Content-Range", format!("{}-{}", offset, end.saturating_sub(1)))
                    .body(chunk.clone())
            })
            .await?;
        if !matches!(response.status().as_u16(), 202 | 204) {
            return Err(self.err(format!("upload PATCH returned {}", response.status())));
        }
        self.location_of(&response)
    }

    /// Number of bytes the registry has accepted for an open upload.
    async fn upload_status(&self, location: &str) -> Result<u64> {
        let response = self.send(|| self.http.get(location)).await?;
        if response.status().as_u16() != 204 {
            return Err(self.err(format!("upload status returned {}", response.status())));
        }
        let range = response
            .headers()
            .get("Range")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("0-0");
        let end: u64 = range
            .rsplit('-')
            .next()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        Ok(end.saturating_add(1))
    }

    async fn complete_upload(&self, location: &str, digest: &str) -> Result<()> {
        let sep = if location.contains('?') { '&' } else { '?' };
        let url = format!("{}{}digest={}", location, sep, digest);
        let response = self.send(|| self.http.put(&url)).await?;
        if response.status().as_u16() != 201 {
            return Err(self.err(format!("upload PUT returned {}", response.status())));
        }
        debug!(registry = %self.registry, digest = %digest, "blob committed");
        Ok(())
    }

    /// Send a request, answering one bearer challenge per call.
    async fn send<F>(&self, build: F) -> Result<reqwest::Response>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut request = build();
        if let Some(token) = self.token.read().await.as_deref() {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| self.err(format!("request failed: {}", e)))?;
        if response.status().as_u16() != 401 {
            return Ok(response);
        }

        let challenge = response
            .headers()
            .get("WWW-Authenticate")
            .and_then(|v| v.to_str().ok())
            .and_then(BearerChallenge::parse)
            .ok_or_else(|| self.err("registry denied access without a bearer challenge".to_string()))?;
        let token = fetch_token(
            &self.http,
            &self.registry,
            &challenge,
            &repository_scope(&self.repository),
            self.credentials.as_ref(),
        )
        .await?;
        *self.token.write().await = Some(token.clone());

        build()
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| self.err(format!("request failed after auth: {}", e)))
    }

    fn location_of(&self, response: &reqwest::Response) -> Result<String> {
        let location = response
            .headers()
            .get("Location")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| self.err("registry response carried no Location".to_string()))?;
        if location.starts_with("http://") || location.starts_with("https://") {
            Ok(location.to_string())
        } else {
            Ok(format!("{}{}", self.base, location))
        }
    }

    fn err(&self, message: String) -> EngineError {
        EngineError::Registry {
            registry: self.registry.clone(),
            message,
        }
    }
}
