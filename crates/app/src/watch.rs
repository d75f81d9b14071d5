use std::path::{Path, PathBuf};
use std::time::Duration;

use labstage_core::StorageLocation;
use tokio::sync::mpsc;

use crate::event::Notification;
use crate::object_store::{is_sidecar, object_for_sidecar, LocalObjectStore};

/// Spawn a notify watcher on `watch_dir` that sends newly created document
/// paths to `tx`. A sidecar arriving forwards the document it describes, so
/// a document written before its metadata is picked up again.
/// Returns the watcher; it must be kept alive for watching to continue.
pub fn spawn_intake_watcher(
    watch_dir: &Path,
    tx: mpsc::Sender<PathBuf>,
) -> notify::Result<impl notify::Watcher> {
    use notify::event::{ModifyKind, RenameMode};
    use notify::{EventKind, RecursiveMode, Watcher};

    let mut watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
        match event {
            Ok(ev) => {
                let arrived = matches!(
                    ev.kind,
                    EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(RenameMode::To))
                );
                if !arrived {
                    return;
                }
                for path in ev.paths {
                    let path = if is_sidecar(&path) {
                        match object_for_sidecar(&path) {
                            Some(object) => object,
                            None => continue,
                        }
                    } else {
                        path
                    };
                    // Runs on the notify thread, outside the runtime.
                    if let Err(e) = tx.blocking_send(path) {
                        tracing::warn!(path = %e.0.display(), "intake queue closed, dropping file event");
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "intake watcher error"),
        }
    })?;

    watcher.watch(watch_dir, RecursiveMode::Recursive)?;
    Ok(watcher)
}

/// Wait for the next path, then keep collecting until `quiet` passes with
/// no new arrivals or `max` paths are held. `None` once the channel closes.
pub async fn collect_batch(
    rx: &mut mpsc::Receiver<PathBuf>,
    quiet: Duration,
    max: usize,
) -> Option<Vec<PathBuf>> {
    let first = rx.recv().await?;
    let mut batch = vec![first];
    while batch.len() < max.max(1) {
        match tokio::time::timeout(quiet, rx.recv()).await {
            Ok(Some(path)) => {
                if !batch.contains(&path) {
                    batch.push(path);
                }
            }
            Ok(None) | Err(_) => break,
        }
    }
    Some(batch)
}

/// Notifications for the files of `bucket` among `paths`; paths outside the
/// bucket directory and directories are dropped.
pub fn notifications_for(store: &LocalObjectStore, bucket: &str, paths: &[PathBuf]) -> Vec<Notification> {
    paths
        .iter()
        .filter(|p| p.is_file())
        .filter_map(|p| store.key_for(bucket, p))
        .map(|key| Notification::new(StorageLocation::new(bucket, key)))
        .collect()
}
