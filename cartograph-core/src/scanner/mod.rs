//! Source adapters.
//!
//! Every configured source is turned into a [`Scanner`] by the
//! [`registry::ScannerRegistry`]. Scanners stream [`Resource`]s into a
//! bounded [`ResourceSink`]; the processor owns the receiving half.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use cartograph_model::{FIELD_TAGS, MetaDataList, Resource};
use tokio::sync::mpsc;

use crate::error::ScanError;

pub mod aws;
pub mod fs;
pub mod github;
pub mod registry;

pub use registry::ScannerRegistry;

/// Capability every source adapter implements.
///
/// A scanner that fails part way guarantees that every resource it already
/// emitted is complete; it never emits partially built resources.
#[async_trait]
pub trait Scanner: Send + Sync + fmt::Debug {
    /// Configured source name.
    fn name(&self) -> &str;

    /// Kind of the resources this scanner produces.
    fn kind(&self) -> &str;

    /// Schedule expression, when the source has one.
    fn schedule(&self) -> Option<&str>;

    /// Streams discovered resources into `output`, stamping each with
    /// `version`. Blocks while the sink is full.
    async fn scan(
        &self,
        output: &ResourceSink,
        version: i32,
    ) -> Result<(), ScanError>;
}

/// Sending half of the shared discovery stream.
#[derive(Debug, Clone)]
pub struct ResourceSink {
    tx: mpsc::Sender<Resource>,
    emitted: Arc<AtomicU64>,
}

impl ResourceSink {
    pub fn new(tx: mpsc::Sender<Resource>) -> Self {
        Self {
            tx,
            emitted: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Bounded sink paired with its receiver.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Resource>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    pub async fn emit(&self, resource: Resource) -> Result<(), ScanError> {
        self.tx
            .send(resource)
            .await
            .map_err(|_| ScanError::SinkClosed)?;
        self.emitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Resources accepted by this sink and its clones so far.
    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    /// Fresh counter over the same channel, used to count one scanner's
    /// output.
    pub fn scoped(&self) -> Self {
        Self::new(self.tx.clone())
    }
}

/// Picks the metadata entries a source asked for in its `fields` list.
///
/// Values come from lazily evaluated field getters. The `tags` field expands
/// provider tags to `tag_<key>` entries. Empty values are skipped.
pub struct FieldMapper<'a> {
    fields: &'a [String],
    getters: Vec<(&'static str, Box<dyn Fn() -> String + Send + Sync + 'a>)>,
    tags: Option<Box<dyn Fn() -> BTreeMap<String, String> + Send + Sync + 'a>>,
}

impl fmt::Debug for FieldMapper<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldMapper")
            .field("fields", &self.fields)
            .field(
                "getters",
                &self.getters.iter().map(|(k, _)| *k).collect::<Vec<_>>(),
            )
            .field("tags", &self.tags.is_some())
            .finish()
    }
}

impl<'a> FieldMapper<'a> {
    pub fn new(fields: &'a [String]) -> Self {
        Self {
            fields,
            getters: Vec::new(),
            tags: None,
        }
    }

    pub fn field(
        mut self,
        name: &'static str,
        getter: impl Fn() -> String + Send + Sync + 'a,
    ) -> Self {
        self.getters.push((name, Box::new(getter)));
        self
    }

    pub fn tags(
        mut self,
        getter: impl Fn() -> BTreeMap<String, String> + Send + Sync + 'a,
    ) -> Self {
        self.tags = Some(Box::new(getter));
        self
    }

    pub fn meta_data(&self) -> MetaDataList {
        let mut meta = MetaDataList::new();
        for (name, getter) in &self.getters {
            if !self.wants(name) {
                continue;
            }
            let value = getter();
            if !value.is_empty() {
                meta.add(*name, value);
            }
        }

        if let Some(tags) = &self.tags
            && self.wants(FIELD_TAGS)
        {
            for (key, value) in tags() {
                if !value.is_empty() {
                    meta.add(format!("tag_{key}"), value);
                }
            }
        }
        meta
    }

    fn wants(&self, name: &str) -> bool {
        self.fields.iter().any(|f| f == name)
    }
}
