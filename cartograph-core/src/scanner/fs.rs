use std::path::{Path, PathBuf};

use async_trait::async_trait;
use cartograph_model::{Resource, ResourceKind, SourceConfig};
use tracing::{debug, info};
use walkdir::WalkDir;

use super::{FieldMapper, ResourceSink, Scanner};
use crate::error::ScanError;

pub const FIELD_ROOT_DIRECTORY: &str = "rootDirectory";
pub const FIELD_MACHINE_HOST: &str = "machineHost";

/// Emits the configured root directory followed by every regular file
/// below it, each related to the root.
#[derive(Debug, Clone)]
pub struct FsScanner {
    name: String,
    root_directory: PathBuf,
    fields: Vec<String>,
    schedule: Option<String>,
}

impl FsScanner {
    pub fn new(
        name: impl Into<String>,
        root_directory: impl Into<PathBuf>,
        fields: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            root_directory: root_directory.into(),
            fields,
            schedule: None,
        }
    }

    pub fn from_source(source: &SourceConfig) -> Result<Self, ScanError> {
        let root = source.get("root_directory").ok_or_else(|| {
            ScanError::Config(format!(
                "source '{}' requires root_directory",
                source.name
            ))
        })?;
        let mut scanner =
            Self::new(source.name.clone(), root, source.fields.clone());
        scanner.schedule = source.schedule.clone();
        Ok(scanner)
    }

    fn new_resource(&self, path: &str, version: i32) -> Resource {
        let kind = ResourceKind::FileSystem.as_str();
        Resource::new(
            kind,
            Resource::derive_uuid(kind, path),
            path,
            path,
            self.name.clone(),
            version,
        )
    }
}

fn list_files(root: &Path) -> Result<Vec<PathBuf>, ScanError> {
    // Surface a missing root as an IO error instead of an empty listing.
    if std::fs::metadata(root)?.is_file() {
        return Ok(vec![root.to_path_buf()]);
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|err| {
            ScanError::Io(std::io::Error::other(err.to_string()))
        })?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

fn machine_host() -> String {
    sysinfo::System::host_name().unwrap_or_default()
}

#[async_trait]
impl Scanner for FsScanner {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        ResourceKind::FileSystem.as_str()
    }

    fn schedule(&self) -> Option<&str> {
        self.schedule.as_deref()
    }

    async fn scan(
        &self,
        output: &ResourceSink,
        version: i32,
    ) -> Result<(), ScanError> {
        let root = self.root_directory.clone();
        let files = tokio::task::spawn_blocking(move || list_files(&root))
            .await
            .map_err(|err| ScanError::Task(err.to_string()))??;

        let root_display = self.root_directory.to_string_lossy().into_owned();
        let meta = FieldMapper::new(&self.fields)
            .field(FIELD_ROOT_DIRECTORY, || root_display.clone())
            .field(FIELD_MACHINE_HOST, machine_host)
            .meta_data();

        let mut root = self.new_resource(&root_display, version);
        root.extend_meta_data(&meta);
        output.emit(root.clone()).await?;

        for path in &files {
            let path = path.to_string_lossy();
            let mut file = self.new_resource(&path, version);
            file.add_relation(root.clone());
            file.extend_meta_data(&meta);
            debug!(scanner.name = %self.name, path = %path, "file discovered");
            output.emit(file).await?;
        }

        info!(
            scanner.name = %self.name,
            scanner.kind = self.kind(),
            total_resource_discovered = files.len() + 1,
            "scan completed"
        );
        Ok(())
    }
}
