//! One-off repair of completed jobs recorded without a duration.

use std::path::Path;
use std::sync::Arc;

use podforge_core::Job;
use podforge_pipeline::{AudioAssembler, AudioTooling, BlobStore, TempWorkspace};
use tracing::{info, instrument, warn};

use super::store::{JobRecordStore, JobStoreError};

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct BackfillReport {
    pub examined: usize,
    pub updated: usize,
    /// Measured zero seconds or lost a race with another writer.
    pub skipped: usize,
    pub failed: usize,
}

/// Download each `complete` job's artifact, measure it and store the
/// duration. A failure on one job is logged and does not stop the run.
#[instrument(skip_all, err)]
pub async fn backfill_durations(
    store: &dyn JobRecordStore,
    blobs: Arc<dyn BlobStore>,
    tooling: Arc<dyn AudioTooling>,
    workspace_root: &Path,
) -> Result<BackfillReport, JobStoreError> {
    let jobs = store.list_missing_durations().await?;
    let assembler = AudioAssembler::new(tooling);
    let mut report = BackfillReport {
        examined: jobs.len(),
        ..BackfillReport::default()
    };

    for job in jobs {
        match measure(&job, blobs.as_ref(), &assembler, workspace_root).await {
            Ok(0) => {
                warn!(job_id = %job.id, "artifact measured as empty");
                report.skipped += 1;
            }
            Ok(seconds) => {
                if store.set_duration(job.id, seconds).await? {
                    info!(job_id = %job.id, duration_seconds = seconds, "duration backfilled");
                    report.updated += 1;
                } else {
                    report.skipped += 1;
                }
            }
            Err(reason) => {
                warn!(job_id = %job.id, %reason, "duration backfill failed");
                report.failed += 1;
            }
        }
    }

    info!(
        examined = report.examined,
        updated = report.updated,
        skipped = report.skipped,
        failed = report.failed,
        "duration backfill finished"
    );
    Ok(report)
}

async fn measure(
    job: &Job,
    blobs: &dyn BlobStore,
    assembler: &AudioAssembler,
    workspace_root: &Path,
) -> Result<u32, String> {
    let output_ref = job
        .output_ref
        .as_ref()
        .ok_or_else(|| "job has no output reference".to_string())?;
    let workspace =
        TempWorkspace::create(workspace_root, job.id, job.attempts).map_err(|e| e.to_string())?;
    let path = workspace.file("artifact.mp3");

    let measured = match blobs.download_to(output_ref, &path).await {
        Ok(_) => assembler
            .measure_duration(&path)
            .await
            .map_err(|e| e.to_string()),
        Err(err) => Err(format!("download failed: {err}")),
    };
    if let Err(err) = workspace.close().await {
        warn!(job_id = %job.id, error = %err, "failed to remove backfill workspace");
    }
    measured
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::InMemoryJobRecordStore;
    use chrono::Utc;
    use podforge_core::{BlobRef, CompletedJob, JobStatus, OwnerId};
    use podforge_pipeline::testing::{FakeAudioTooling, InMemoryBlobStore};

    async fn completed_job(
        store: &InMemoryJobRecordStore,
        output_ref: BlobRef,
        duration_seconds: u32,
    ) -> Job {
        let job = Job::new(OwnerId::new(), BlobRef::from("mem://doc.pdf"), None);
        store.create(&job).await.unwrap();
        let deadline = Utc::now() + chrono::Duration::minutes(1);
        store.begin_attempt(job.id, 0, deadline).await.unwrap();
        let done = CompletedJob {
            output_ref,
            duration_seconds,
            title: "Tides".to_string(),
        };
        assert!(store.complete(job.id, 0, done).await.unwrap());
        store.get(job.id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn fills_in_missing_durations_only() {
        let store = InMemoryJobRecordStore::new();
        let blobs = Arc::new(InMemoryBlobStore::new());
        let tooling = Arc::new(FakeAudioTooling::new(10));
        let root = tempfile::tempdir().unwrap();

        let artifact = blobs.insert("podcasts/a.mp3", vec![0u8; 1_200]);
        let missing = completed_job(&store, artifact, 0).await;
        let measured = completed_job(&store, BlobRef::from("mem://podcasts/b.mp3"), 42).await;
        let lost = completed_job(&store, BlobRef::from("mem://podcasts/gone.mp3"), 0).await;

        let report = backfill_durations(&store, blobs.clone(), tooling, root.path())
            .await
            .unwrap();
        assert_eq!(
            report,
            BackfillReport {
                examined: 2,
                updated: 1,
                skipped: 0,
                failed: 1,
            }
        );

        let missing = store.get(missing.id).await.unwrap().unwrap();
        assert_eq!(missing.status, JobStatus::Complete);
        assert_eq!(missing.duration_seconds, 120);
        assert_eq!(store.get(measured.id).await.unwrap().unwrap().duration_seconds, 42);
        assert_eq!(store.get(lost.id).await.unwrap().unwrap().duration_seconds, 0);
        assert!(std::fs::read_dir(root.path()).unwrap().next().is_none());
    }
}
