use librarian_core::{
    Delivery, Librarian, LibrarianError, Payload, PlacementRequest, ReservationId, Result,
    TransferResult,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct UploadOptions {
    pub pipeline: String,
    pub store: Option<String>,
    pub prefix: Option<String>,
    pub on_demand: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadOutcome {
    pub source: PathBuf,
    pub name: String,
    pub bytes: u64,
    pub store: Option<String>,
    pub reservation: Option<ReservationId>,
    pub attempts: usize,
    pub url: Option<String>,
    pub error: Option<String>,
}

impl UploadOutcome {
    fn new(source: &Path) -> Self {
        Self {
            source: source.to_path_buf(),
            name: String::new(),
            bytes: 0,
            store: None,
            reservation: None,
            attempts: 0,
            url: None,
            error: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Places every file first, so later placements see earlier reservations,
/// then waits for the deliveries running on the worker pool. Outcomes come
/// back in input order.
pub async fn upload_all(
    librarian: &Librarian,
    files: &[PathBuf],
    options: &UploadOptions,
) -> Vec<UploadOutcome> {
    let mut started: Vec<(UploadOutcome, Option<JoinHandle<Result<TransferResult>>>)> =
        Vec::with_capacity(files.len());

    for file in files {
        let mut outcome = UploadOutcome::new(file);
        match start_upload(librarian, file, options, &mut outcome).await {
            Ok(handle) => started.push((outcome, Some(handle))),
            Err(error) => {
                tracing::warn!("not uploading {}: {}", file.display(), error);
                outcome.error = Some(error.to_string());
                started.push((outcome, None));
            }
        }
    }

    let mut outcomes = Vec::with_capacity(started.len());
    for (mut outcome, handle) in started {
        if let Some(handle) = handle {
            match handle.await {
                Ok(Ok(result)) => {
                    outcome.attempts = result.attempts;
                    outcome.url = result.url;
                }
                Ok(Err(error)) => outcome.error = Some(error.to_string()),
                Err(error) => outcome.error = Some(format!("transfer task failed: {}", error)),
            }
        }
        outcomes.push(outcome);
    }

    outcomes
}

async fn start_upload(
    librarian: &Librarian,
    file: &Path,
    options: &UploadOptions,
    outcome: &mut UploadOutcome,
) -> Result<JoinHandle<Result<TransferResult>>> {
    let name = payload_name(file, options.prefix.as_deref())?;
    let payload = Payload::from_path(file, &name).await?;
    outcome.name = payload.name.clone();
    outcome.bytes = payload.size_bytes;

    let mut request = PlacementRequest::new(payload.size_bytes, options.pipeline.as_str());
    if let Some(store) = &options.store {
        request = request.with_preferred_store(store.clone());
    }

    let placement = librarian.place(&request).await?;
    outcome.store = Some(placement.store.name.clone());
    outcome.reservation = Some(placement.reservation.id);

    Ok(librarian.deliver(placement, Delivery::for_consumer(payload, options.on_demand)))
}

fn payload_name(file: &Path, prefix: Option<&str>) -> Result<String> {
    let file_name = file
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            LibrarianError::InvalidRequest(format!("{} has no usable file name", file.display()))
        })?;

    Ok(match prefix {
        Some(prefix) => format!("{}/{}", prefix.trim_end_matches('/'), file_name),
        None => file_name.to_string(),
    })
}
