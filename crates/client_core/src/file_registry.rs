//! Per-(project, date) metadata and per-project date listings.
//!
//! Each key keeps the ticket of the fetch that last wrote it. A completing
//! fetch writes only if it was issued after that one, so a slow early fetch
//! can never overwrite the result of a later one.

use std::{collections::HashMap, sync::Arc};

use shared::{
    domain::{FileRecord, RecordMetadata},
    error::GatewayError,
    protocol::{FileUpload, UploadMode},
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::gateway::Gateway;

type MetadataKey = (String, String);

struct Slot<T> {
    written: u64,
    value: T,
}

#[derive(Default)]
struct RegistryState {
    next_ticket: u64,
    /// `None` values are "fetched, nothing there yet".
    metadata: HashMap<MetadataKey, Slot<Option<RecordMetadata>>>,
    dates: HashMap<String, Slot<Vec<String>>>,
}

impl RegistryState {
    fn issue(&mut self) -> u64 {
        self.next_ticket += 1;
        self.next_ticket
    }
}

/// Store `value` under `key` unless a later-issued fetch already wrote it.
/// Returns what the cache holds afterwards.
fn write_if_newer<K, T>(slots: &mut HashMap<K, Slot<T>>, key: K, ticket: u64, value: T) -> T
where
    K: std::hash::Hash + Eq + std::fmt::Debug,
    T: Clone,
{
    match slots.get_mut(&key) {
        Some(slot) if slot.written > ticket => {
            debug!(
                "files: dropping superseded fetch key={key:?} ticket={ticket} written={}",
                slot.written
            );
            slot.value.clone()
        }
        Some(slot) => {
            slot.written = ticket;
            slot.value = value;
            slot.value.clone()
        }
        None => {
            slots.insert(
                key,
                Slot {
                    written: ticket,
                    value: value.clone(),
                },
            );
            value
        }
    }
}

pub struct FileRegistry {
    gateway: Arc<dyn Gateway>,
    state: Mutex<RegistryState>,
}

impl FileRegistry {
    pub fn new(gateway: Arc<dyn Gateway>) -> Self {
        Self {
            gateway,
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// Fetch and cache metadata for one date. `Ok(None)` means the date has no
    /// record yet, which is cached like any other answer.
    pub async fn fetch_metadata(
        &self,
        project: &str,
        date: &str,
    ) -> Result<Option<RecordMetadata>, GatewayError> {
        let ticket = self.state.lock().await.issue();
        let fetched = self.gateway.fetch_metadata(project, date).await?;

        let mut guard = self.state.lock().await;
        let key = (project.to_string(), date.to_string());
        Ok(write_if_newer(&mut guard.metadata, key, ticket, fetched))
    }

    pub async fn list_dates(&self, project: &str) -> Result<Vec<String>, GatewayError> {
        let ticket = self.state.lock().await.issue();
        let fetched = self.gateway.list_dates(project).await?;

        let mut guard = self.state.lock().await;
        Ok(write_if_newer(
            &mut guard.dates,
            project.to_string(),
            ticket,
            fetched,
        ))
    }

    /// Upload (or replace) a file, then refresh the affected listings.
    ///
    /// The server already holds the file once the upload succeeds, so a failed
    /// refresh is logged and the stored record is still returned. The gateway
    /// has published the refresh failure; the caches keep their previous values.
    pub async fn upload(
        &self,
        project: &str,
        date: &str,
        upload: &FileUpload,
        mode: UploadMode,
    ) -> Result<FileRecord, GatewayError> {
        let record = self
            .gateway
            .upload_file(project, date, upload, mode)
            .await?;
        info!(
            "files: stored file_id={} project={project} date={date} mode={mode:?}",
            record.file_id
        );
        if let Err(err) = self.fetch_metadata(project, date).await {
            warn!("files: metadata refresh after upload failed project={project} date={date}: {err}");
        }
        if let Err(err) = self.list_dates(project).await {
            warn!("files: date refresh after upload failed project={project}: {err}");
        }
        Ok(record)
    }

    pub async fn preview(
        &self,
        project: &str,
        date: &str,
        filename: &str,
    ) -> Result<Vec<u8>, GatewayError> {
        self.gateway.preview_file(project, date, filename).await
    }

    pub async fn is_cached(&self, project: &str, date: &str) -> bool {
        let guard = self.state.lock().await;
        guard
            .metadata
            .contains_key(&(project.to_string(), date.to_string()))
    }

    pub async fn cached_metadata(&self, project: &str, date: &str) -> Option<RecordMetadata> {
        let guard = self.state.lock().await;
        guard
            .metadata
            .get(&(project.to_string(), date.to_string()))
            .and_then(|slot| slot.value.clone())
    }

    /// Files of the last fetch for this key; `None` if it was never fetched.
    pub async fn files(&self, project: &str, date: &str) -> Option<Vec<FileRecord>> {
        let guard = self.state.lock().await;
        guard
            .metadata
            .get(&(project.to_string(), date.to_string()))
            .map(|slot| {
                slot.value
                    .as_ref()
                    .map(|metadata| metadata.files.clone())
                    .unwrap_or_default()
            })
    }

    pub async fn cached_dates(&self, project: &str) -> Option<Vec<String>> {
        let guard = self.state.lock().await;
        guard.dates.get(project).map(|slot| slot.value.clone())
    }
}

#[cfg(test)]
#[path = "tests/file_registry_tests.rs"]
mod tests;
