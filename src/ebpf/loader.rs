//! Program bundles on disk
//!
//! A bundle is a directory holding the compiled object, its metadata and
//! the type description of the records it emits:
//!
//! ```text
//! <bundle>/
//!   program.o
//!   metadata.yaml
//!   types.json
//! ```

use super::btf::{KernelTypes, Struct, TypeCatalog};
use super::events::EventFactory;
use super::plan::{compile, CompileWarning, DecodePlan};
use crate::metadata::BundleMetadata;
use crate::{ProbekitError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const PROGRAM_FILE: &str = "program.o";
pub const METADATA_FILE: &str = "metadata.yaml";
pub const TYPES_FILE: &str = "types.json";

/// Everything needed to run a bundle
#[derive(Debug, Clone)]
pub struct ProbeInfo {
    pub object: Bytes,
    pub metadata: BundleMetadata,
    pub types: TypeCatalog,
    pub factory: EventFactory,
}

impl ProbeInfo {
    /// Builds the info and binds the event factory to the members of the
    /// event struct named by the metadata.
    pub fn new(object: Bytes, metadata: BundleMetadata, types: TypeCatalog) -> Result<Self> {
        let name = metadata.event_struct_name()?;
        let event = types
            .find_struct(name)
            .ok_or_else(|| ProbekitError::EventTypeNotFound(name.to_string()))?;
        let factory = EventFactory::new(event.members.iter().map(|m| m.name.clone()));

        Ok(Self {
            object,
            metadata,
            types,
            factory,
        })
    }

    pub fn event_type(&self) -> Result<&Struct> {
        let name = self.metadata.event_struct_name()?;
        self.types
            .find_struct(name)
            .ok_or_else(|| ProbekitError::EventTypeNotFound(name.to_string()))
    }

    pub fn compile_plan(
        &self,
        kernel_types: &dyn KernelTypes,
    ) -> Result<(DecodePlan, Vec<CompileWarning>)> {
        Ok(compile(self.event_type()?, kernel_types, &self.factory))
    }
}

/// Source of program bundles
#[async_trait]
pub trait InfoProvider: Send + Sync {
    async fn probe_info(&self) -> Result<ProbeInfo>;
}

pub struct BundleLoader {
    bundle_dir: PathBuf,
}

impl BundleLoader {
    pub fn new(bundle_dir: PathBuf) -> Self {
        Self { bundle_dir }
    }

    /// Bundle installed under the system bundle directory
    pub fn installed(name: &str) -> Self {
        Self {
            bundle_dir: PathBuf::from("/usr/lib/probekit/bundles").join(name),
        }
    }

    pub fn bundle_dir(&self) -> &Path {
        &self.bundle_dir
    }

    async fn read(&self, file: &str) -> Result<Vec<u8>> {
        let path = self.bundle_dir.join(file);
        debug!("Reading bundle file {}", path.display());

        match tokio::fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(
                ProbekitError::BundleLoadFailed(format!("File not found: {}", path.display())),
            ),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl InfoProvider for BundleLoader {
    async fn probe_info(&self) -> Result<ProbeInfo> {
        let object = self.read(PROGRAM_FILE).await?;
        let metadata = BundleMetadata::from_yaml(&self.read(METADATA_FILE).await?)?;
        let types = TypeCatalog::from_json(&self.read(TYPES_FILE).await?)?;

        let info = ProbeInfo::new(Bytes::from(object), metadata, types)?;
        info!(
            "Loaded bundle {} from {}",
            info.metadata.name,
            self.bundle_dir.display()
        );
        Ok(info)
    }
}
