//! In-memory catalog sources and scripted fetchers for exercising the
//! orchestrator without a network.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use crate::artifact::{self, ArtifactFetcher, FetchError, FetchRequest, FetchedArtifact};
use crate::catalog::{ArtifactKey, Catalog, CatalogEntry, ProductVersion};
use crate::source::{CatalogError, CatalogSource};

/// Build a catalog entry whose checksum and size describe `payload`.
pub fn entry_for(id: &str, version: &str, payload: &[u8]) -> CatalogEntry {
    CatalogEntry {
        key: ArtifactKey::new(id, version),
        name: id.to_owned(),
        description: Some(format!("{id} plugin")),
        download_url: format!("http://upstream.test/plugin/download?pluginId={id}&version={version}"),
        checksum: Some(artifact::checksum_of(payload)),
        size: Some(payload.len() as u64),
        idea_version: BTreeMap::from([("since-build".to_owned(), "203.0".to_owned())]),
    }
}

/// Catalogs served from memory, replaceable between runs.
#[derive(Default)]
pub struct StaticCatalogSource {
    catalogs: Mutex<HashMap<ProductVersion, Result<Vec<CatalogEntry>, CatalogError>>>,
    calls: Mutex<HashMap<ProductVersion, u32>>,
}

impl StaticCatalogSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, version: &str, entries: Vec<CatalogEntry>) {
        self.catalogs
            .lock()
            .unwrap()
            .insert(ProductVersion::new(version), Ok(entries));
    }

    pub fn fail(&self, version: &str, error: CatalogError) {
        self.catalogs
            .lock()
            .unwrap()
            .insert(ProductVersion::new(version), Err(error));
    }

    pub fn calls(&self, version: &str) -> u32 {
        self.calls
            .lock()
            .unwrap()
            .get(&ProductVersion::new(version))
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl CatalogSource for StaticCatalogSource {
    fn label(&self) -> &str {
        "static"
    }

    async fn fetch_catalog(&self, version: &ProductVersion) -> Result<Catalog, CatalogError> {
        *self.calls.lock().unwrap().entry(version.clone()).or_default() += 1;

        let entries = self
            .catalogs
            .lock()
            .unwrap()
            .get(version)
            .cloned()
            .unwrap_or_else(|| Err(CatalogError::Unreachable(format!("no catalog for {version}"))))?;

        Ok(Catalog {
            version: version.clone(),
            entries,
            feedback: Vec::new(),
        })
    }
}

/// What the next attempt for a key should do.
#[derive(Debug, Clone)]
pub enum Step {
    /// Write the registered payload and succeed.
    Deliver,
    Transient,
    Permanent,
    /// Write a payload that fails verification.
    Corrupt,
    /// Sleep before delivering, to trip attempt timeouts.
    Stall(Duration),
}

/// Fetcher that serves registered payloads and follows per-key scripts.
#[derive(Default)]
pub struct ScriptedFetcher {
    payloads: Mutex<HashMap<ArtifactKey, Vec<u8>>>,
    scripts: Mutex<HashMap<ArtifactKey, VecDeque<Step>>>,
    invocations: Mutex<HashMap<ArtifactKey, u32>>,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serve(&self, id: &str, version: &str, payload: &[u8]) {
        self.payloads
            .lock()
            .unwrap()
            .insert(ArtifactKey::new(id, version), payload.to_vec());
    }

    /// Queue steps for the next attempts on a key; later attempts deliver.
    pub fn script(&self, id: &str, version: &str, steps: impl IntoIterator<Item = Step>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(ArtifactKey::new(id, version))
            .or_default()
            .extend(steps);
    }

    pub fn invocations(&self, id: &str, version: &str) -> u32 {
        self.invocations
            .lock()
            .unwrap()
            .get(&ArtifactKey::new(id, version))
            .copied()
            .unwrap_or(0)
    }

    pub fn total_invocations(&self) -> u32 {
        self.invocations.lock().unwrap().values().sum()
    }

    fn stage(
        &self,
        request: &FetchRequest,
        staging: &Path,
        payload: &[u8],
    ) -> Result<FetchedArtifact, FetchError> {
        let mut file = tempfile::Builder::new()
            .prefix(".download-")
            .tempfile_in(staging)
            .map_err(|e| FetchError::Storage(e.to_string()))?;
        file.write_all(payload)
            .map_err(|e| FetchError::Storage(e.to_string()))?;

        let checksum = artifact::checksum_of(payload);
        let size = payload.len() as u64;
        artifact::verify(request, &checksum, size)?;

        Ok(FetchedArtifact {
            key: request.key.clone(),
            staged: file.into_temp_path(),
            file_name: format!("{}-{}.zip", request.key.plugin_id, request.key.version),
            checksum,
            size,
        })
    }
}

#[async_trait::async_trait]
impl ArtifactFetcher for ScriptedFetcher {
    async fn fetch(
        &self,
        request: &FetchRequest,
        staging: &Path,
    ) -> Result<FetchedArtifact, FetchError> {
        *self
            .invocations
            .lock()
            .unwrap()
            .entry(request.key.clone())
            .or_default() += 1;

        let step = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&request.key)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Step::Deliver);

        let payload = self
            .payloads
            .lock()
            .unwrap()
            .get(&request.key)
            .cloned()
            .ok_or_else(|| FetchError::Permanent(format!("HTTP 404 for {}", request.url)))?;

        match step {
            Step::Deliver => self.stage(request, staging, &payload),
            Step::Transient => Err(FetchError::Transient("connection reset".into())),
            Step::Permanent => Err(FetchError::Permanent("HTTP 403 Forbidden".into())),
            Step::Corrupt => {
                let mut corrupted = payload;
                corrupted.push(0);
                self.stage(request, staging, &corrupted)
            }
            Step::Stall(delay) => {
                tokio::time::sleep(delay).await;
                self.stage(request, staging, &payload)
            }
        }
    }
}
