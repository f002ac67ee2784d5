use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use axum::{
    extract::{Path as UrlPath, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::config::PortalConfig;
use crate::harvest::{self, Artifact, ArtifactFormat};
use crate::job::{AdjacencyMode, Job, SubmitParams};
use crate::pipeline::{FailureKind, LogSink, PipelineResult, PipelineRunner, Stage, Transcript};
use crate::sweep::sweep_expired;
use crate::validate::validate;

pub struct AppState {
    pub config: PortalConfig,
    pub jobs_dir: PathBuf,

    // live transcripts of in-flight jobs, observable while the
    // subprocesses are still streaming
    active: RwLock<HashMap<String, Arc<Transcript>>>,
}

impl AppState {
    pub fn new(config: PortalConfig, jobs_dir: PathBuf) -> Self {
        Self {
            config,
            jobs_dir,
            active: RwLock::new(HashMap::new()),
        }
    }
}

// job submission: a file path plus the recognized parameter set
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitRequest {
    pub file_path: String,

    #[serde(default)]
    pub is_point_cloud: bool,

    #[serde(default = "default_max_clusters")]
    pub max_clusters: u32,

    #[serde(default = "default_true")]
    pub use_agglomerative: bool,

    #[serde(default)]
    pub preprocess_mesh: bool,

    // 0=naive, 1=faceMST, 2=ccMST
    #[serde(default = "default_adjacency")]
    pub adjacency_option: u8,

    #[serde(default)]
    pub add_knn_edges: bool,

    #[serde(default = "default_points_per_face")]
    pub points_per_face: u32,
}

fn default_max_clusters() -> u32 {
    20
}

fn default_true() -> bool {
    true
}

fn default_adjacency() -> u8 {
    1
}

fn default_points_per_face() -> u32 {
    1000
}

#[derive(Debug, Error, PartialEq)]
pub enum ParamError {
    #[error("Maximum number of parts must be between 2 and 30, got {0}")]
    MaxClustersRange(u32),

    #[error("Points per face must be between 100 and 2000, got {0}")]
    PointsPerFaceRange(u32),

    #[error("Unknown adjacency option {0}, expected 0, 1 or 2")]
    AdjacencyOption(u8),
}

impl TryFrom<&SubmitRequest> for SubmitParams {
    type Error = ParamError;

    fn try_from(req: &SubmitRequest) -> Result<Self, Self::Error> {
        if !(2..=30).contains(&req.max_clusters) {
            return Err(ParamError::MaxClustersRange(req.max_clusters));
        }
        if !(100..=2000).contains(&req.points_per_face) {
            return Err(ParamError::PointsPerFaceRange(req.points_per_face));
        }
        let adjacency = AdjacencyMode::try_from(req.adjacency_option)
            .map_err(|_| ParamError::AdjacencyOption(req.adjacency_option))?;
        Ok(SubmitParams {
            is_point_cloud: req.is_point_cloud,
            max_clusters: req.max_clusters,
            use_agglomerative: req.use_agglomerative,
            preprocess_mesh: req.preprocess_mesh,
            adjacency,
            add_knn_edges: req.add_knn_edges,
            points_per_face: req.points_per_face,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct ArtifactEntry {
    pub label: String,

    // file name under the job's result tree, usable with the download route
    pub file: String,

    pub path: String,

    pub parts: u32,

    pub format: ArtifactFormat,
}

impl From<&Artifact> for ArtifactEntry {
    fn from(artifact: &Artifact) -> Self {
        Self {
            label: artifact.label(),
            file: artifact.file_name(),
            path: artifact.path.to_string_lossy().into_owned(),
            parts: artifact.parts,
            format: artifact.format,
        }
    }
}

// every outcome is normalized into this shape, nothing crosses the
// boundary unstructured; the first artifact is the implied default
// selection
#[derive(Debug, Serialize)]
pub struct JobReport {
    pub job_id: Option<String>,

    pub status: String,

    pub artifacts: Vec<ArtifactEntry>,

    // auxiliary feature-space projection, when one was produced
    pub pca: Option<String>,

    pub log: String,
}

impl JobReport {
    fn failed(job_id: Option<String>, status: String, transcript: &Transcript) -> Self {
        Self {
            job_id,
            status,
            artifacts: Vec::new(),
            pca: None,
            log: transcript.snapshot(),
        }
    }
}

pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/jobs", post(submit_job).get(list_jobs))
        .route("/api/jobs/{id}/log", get(job_log))
        .route("/api/jobs/{id}/artifacts/{file}", get(download_artifact))
}

async fn submit_job(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SubmitRequest>,
) -> Json<JobReport> {
    Json(process_submission(&state, req).await)
}

async fn list_jobs(State(state): State<Arc<AppState>>) -> Json<Vec<String>> {
    Json(state.active.read().await.keys().cloned().collect())
}

async fn job_log(
    State(state): State<Arc<AppState>>,
    UrlPath(id): UrlPath<String>,
) -> Result<String, StatusCode> {
    match state.active.read().await.get(&id) {
        Some(transcript) => Ok(transcript.snapshot()),
        None => Err(StatusCode::NOT_FOUND),
    }
}

async fn download_artifact(
    State(state): State<Arc<AppState>>,
    UrlPath((id, file)): UrlPath<(String, String)>,
) -> impl IntoResponse {
    // downloads are confined to the job's own output tree
    for segment in [&id, &file] {
        if segment.contains('/') || segment.contains('\\') || segment.contains("..") {
            return StatusCode::NOT_FOUND.into_response();
        }
    }
    let output_dir = state.jobs_dir.join(&id).join("output");
    for candidate in [output_dir.join("ply").join(&file), output_dir.join(&file)] {
        if let Ok(bytes) = tokio::fs::read(&candidate).await {
            return (
                [
                    (header::CONTENT_TYPE, "application/octet-stream".to_string()),
                    (
                        header::CONTENT_DISPOSITION,
                        format!("attachment; filename=\"{file}\""),
                    ),
                ],
                bytes,
            )
                .into_response();
        }
    }
    StatusCode::NOT_FOUND.into_response()
}

// one submission handled start to finish: validate, allocate the
// workspace, sweep, run the pipeline, harvest, reclaim
pub async fn process_submission(state: &AppState, req: SubmitRequest) -> JobReport {
    let transcript = Arc::new(Transcript::new());

    let params = match SubmitParams::try_from(&req) {
        Ok(params) => params,
        Err(e) => {
            transcript.note(&format!("Validation failed: {e}")).await;
            return JobReport::failed(None, format!("Error: {e}"), &transcript);
        }
    };

    let input = Path::new(&req.file_path);
    if let Err(e) = validate(input) {
        transcript.note(&format!("Validation failed: {e}")).await;
        return JobReport::failed(None, format!("Error: {e}"), &transcript);
    }
    transcript.note("File validated successfully").await;

    let job = match Job::create(&state.jobs_dir, input, params) {
        Ok(job) => job,
        Err(e) => {
            transcript.note(&format!("Workspace setup failed: {e}")).await;
            return JobReport::failed(
                None,
                "Error: Failed to set up the job workspace".to_string(),
                &transcript,
            );
        }
    };
    transcript
        .note(&format!("Created job directory: {}", job.id))
        .await;
    transcript
        .note(&format!("Copied input file: {}", job.input_name))
        .await;

    state
        .active
        .write()
        .await
        .insert(job.id.clone(), transcript.clone());
    let report = run_job(state, &job, &transcript).await;
    state.active.write().await.remove(&job.id);
    report
}

async fn run_job(state: &AppState, job: &Job, transcript: &Arc<Transcript>) -> JobReport {
    // reclaim disk from expired workspaces before burning compute
    let removed = sweep_expired(&state.jobs_dir, state.config.expiry());
    if removed > 0 {
        transcript
            .note(&format!("Cleaned up {removed} old job(s)"))
            .await;
    }

    let runner = PipelineRunner::new(&state.config);
    let job_id = Some(job.id.clone());

    match runner.run(job, transcript.as_ref()).await {
        PipelineResult::StageFailure { kind, stage, pca, .. } => {
            let status = match (stage, kind) {
                (Stage::FeatureExtraction, FailureKind::OutOfMemory) => {
                    "Error: GPU out of memory. Try reducing 'Points per face' in advanced options."
                }
                (Stage::FeatureExtraction, FailureKind::Generic) => {
                    "Error: Feature extraction failed"
                }
                (Stage::Clustering, _) => "Error: Clustering failed",
            };
            // the partial workspace stays behind for the sweeper
            JobReport {
                job_id,
                status: status.to_string(),
                artifacts: Vec::new(),
                pca: pca.map(|p| p.to_string_lossy().into_owned()),
                log: transcript.snapshot(),
            }
        }

        PipelineResult::Success { features_dir, pca } => {
            let artifacts = harvest::harvest(job);
            if artifacts.is_empty() {
                transcript
                    .note("Processing completed but no mesh files were generated")
                    .await;
                return JobReport {
                    job_id,
                    status: harvest::EMPTY_RESULT_STATUS.to_string(),
                    artifacts: Vec::new(),
                    pca: pca.map(|p| p.to_string_lossy().into_owned()),
                    log: transcript.snapshot(),
                };
            }

            // the projection must outlive the features dir it was found in
            let pca = pca.map(|p| harvest::preserve_pca(&p, &job.output_dir()));
            runner.finalize(&features_dir).await;

            transcript
                .note(&format!(
                    "Generated {} segmentation result(s){}",
                    artifacts.len(),
                    harvest::format_note(&artifacts)
                ))
                .await;

            JobReport {
                job_id,
                status: harvest::success_status(&artifacts, job.params.max_clusters),
                artifacts: artifacts.iter().map(ArtifactEntry::from).collect(),
                pca: pca.map(|p| p.to_string_lossy().into_owned()),
                log: transcript.snapshot(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn request(file_path: &str) -> SubmitRequest {
        SubmitRequest {
            file_path: file_path.to_string(),
            is_point_cloud: false,
            max_clusters: 20,
            use_agglomerative: true,
            preprocess_mesh: false,
            adjacency_option: 1,
            add_knn_edges: false,
            points_per_face: 1000,
        }
    }

    #[test]
    fn parameter_ranges_are_enforced() {
        let mut req = request("mesh.obj");
        req.max_clusters = 1;
        assert_eq!(
            SubmitParams::try_from(&req),
            Err(ParamError::MaxClustersRange(1))
        );

        let mut req = request("mesh.obj");
        req.max_clusters = 31;
        assert!(SubmitParams::try_from(&req).is_err());

        let mut req = request("mesh.obj");
        req.points_per_face = 99;
        assert_eq!(
            SubmitParams::try_from(&req),
            Err(ParamError::PointsPerFaceRange(99))
        );

        let mut req = request("mesh.obj");
        req.adjacency_option = 7;
        assert_eq!(
            SubmitParams::try_from(&req),
            Err(ParamError::AdjacencyOption(7))
        );

        assert!(SubmitParams::try_from(&request("mesh.obj")).is_ok());
    }

    #[test]
    fn request_defaults_mirror_the_form_defaults() {
        let req: SubmitRequest =
            serde_json::from_str(r#"{"file_path": "mesh.obj"}"#).unwrap();
        assert!(!req.is_point_cloud);
        assert_eq!(req.max_clusters, 20);
        assert!(req.use_agglomerative);
        assert_eq!(req.adjacency_option, 1);
        assert_eq!(req.points_per_face, 1000);
    }

    #[tokio::test]
    async fn rejected_submissions_allocate_no_workspace() {
        let tmp = tempdir().unwrap();
        let jobs_dir = tmp.path().join("jobs");
        std::fs::create_dir_all(&jobs_dir).unwrap();
        let state = AppState::new(PortalConfig::default(), jobs_dir.clone());

        let report = process_submission(&state, request("/no/such/mesh.obj")).await;
        assert!(report.job_id.is_none());
        assert_eq!(report.status, "Error: File does not exist");
        assert!(report.artifacts.is_empty());
        assert!(report.log.contains("Validation failed"));
        assert_eq!(std::fs::read_dir(&jobs_dir).unwrap().count(), 0);

        let mut req = request("/no/such/mesh.obj");
        req.points_per_face = 5000;
        let report = process_submission(&state, req).await;
        assert!(report.status.starts_with("Error: Points per face"));
        assert_eq!(std::fs::read_dir(&jobs_dir).unwrap().count(), 0);
    }
}
