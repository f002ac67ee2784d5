use std::{
    fmt,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Mutex,
};

use async_trait::async_trait;
use chrono::Local;
use log::{info, warn};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
};
use tokio_stream::{wrappers::LinesStream, StreamExt};

use crate::config::PortalConfig;
use crate::harvest;
use crate::job::Job;

// known stage-1 failure signatures that deserve dedicated user guidance
const OOM_SIGNATURES: [&str; 2] = ["CUDA out of memory", "OutOfMemoryError"];

// bound on the diagnostic tail surfaced in failure reports; the full
// transcript still reaches the log sink line by line
const FAILURE_TAIL: usize = 1000;
const OOM_TAIL: usize = 500;

/// Receives pipeline progress: raw subprocess output lines as they
/// arrive, and timestamped orchestration notes. The runner only ever
/// talks to this capability, never to a concrete presentation surface.
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn line(&self, line: &str);

    async fn note(&self, msg: &str);
}

// append-only transcript; cheap to share, observable while a job runs
#[derive(Default)]
pub struct Transcript {
    buf: Mutex<String>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> String {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, String> {
        self.buf.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn push(&self, line: &str) {
        let mut buf = self.lock();
        buf.push_str(line);
        buf.push('\n');
    }
}

#[async_trait]
impl LogSink for Transcript {
    async fn line(&self, line: &str) {
        self.push(line);
    }

    async fn note(&self, msg: &str) {
        let stamped = format!("[{}] {msg}", Local::now().format("%H:%M:%S"));
        info!("{msg}");
        self.push(&stamped);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    FeatureExtraction,
    Clustering,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::FeatureExtraction => write!(f, "feature extraction"),
            Stage::Clustering => write!(f, "clustering"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    // stage-1 output matched a known out-of-memory signature
    OutOfMemory,
    Generic,
}

#[derive(Debug)]
pub enum PipelineResult {
    Success {
        features_dir: PathBuf,
        pca: Option<PathBuf>,
    },

    StageFailure {
        stage: Stage,
        kind: FailureKind,
        tail: String,
        // already discovered if stage 1 had completed
        pca: Option<PathBuf>,
    },
}

// executes the two-stage external pipeline for one job; stages are
// strictly sequential and a failure short-circuits the rest
pub struct PipelineRunner<'a> {
    config: &'a PortalConfig,
}

impl<'a> PipelineRunner<'a> {
    pub fn new(config: &'a PortalConfig) -> Self {
        Self { config }
    }

    pub async fn run(&self, job: &Job, sink: &dyn LogSink) -> PipelineResult {
        let config = self.config;

        // advisory cache clearing, not mutual exclusion
        clear_gpu_memory(config).await;
        sink.note("GPU memory cleared").await;

        sink.note("Starting feature extraction...").await;
        let args = feature_extraction_args(config, job);
        sink.note(&format!(
            "Running: {} {}...",
            config.python_bin,
            args[..4.min(args.len())].join(" ")
        ))
        .await;

        let (success, output) =
            run_command(&config.python_bin, &args, &config.partfield_dir, sink).await;
        if !success {
            if is_out_of_memory(&output) {
                sink.note(&format!(
                    "Feature extraction failed: GPU out of memory\n{}",
                    tail(&output, OOM_TAIL)
                ))
                .await;
                return PipelineResult::StageFailure {
                    stage: Stage::FeatureExtraction,
                    kind: FailureKind::OutOfMemory,
                    tail: tail(&output, OOM_TAIL).to_string(),
                    pca: None,
                };
            }
            sink.note(&format!(
                "Feature extraction failed:\n{}",
                tail(&output, FAILURE_TAIL)
            ))
            .await;
            return PipelineResult::StageFailure {
                stage: Stage::FeatureExtraction,
                kind: FailureKind::Generic,
                tail: tail(&output, FAILURE_TAIL).to_string(),
                pca: None,
            };
        }
        sink.note("Feature extraction completed").await;

        let features_dir = config.features_dir(&job.feature_name());
        let pca = harvest::find_pca(&features_dir);

        sink.note("Starting clustering...").await;
        let args = clustering_args(job, &features_dir);
        sink.note(&format!(
            "Running clustering with max {} clusters...",
            job.params.max_clusters
        ))
        .await;

        let (success, output) =
            run_command(&config.python_bin, &args, &config.partfield_dir, sink).await;
        if !success {
            sink.note(&format!(
                "Clustering failed:\n{}",
                tail(&output, FAILURE_TAIL)
            ))
            .await;
            return PipelineResult::StageFailure {
                stage: Stage::Clustering,
                kind: FailureKind::Generic,
                tail: tail(&output, FAILURE_TAIL).to_string(),
                pca,
            };
        }
        sink.note("Clustering completed").await;

        PipelineResult::Success { features_dir, pca }
    }

    // space/time tradeoff: the large intermediate features are never
    // needed again once the results are collected
    pub async fn finalize(&self, features_dir: &Path) {
        clear_gpu_memory(self.config).await;
        if features_dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(features_dir) {
                warn!(
                    "Failed to remove features dir `{}`: `{e}`",
                    features_dir.display()
                );
            }
        }
    }
}

// spawn, stream combined stdout/stderr to the sink line by line, then
// wait for exit; mirrors the subprocess contract: exit 0 <=> success
pub async fn run_command(
    program: &str,
    args: &[String],
    cwd: &Path,
    sink: &dyn LogSink,
) -> (bool, String) {
    match stream_command(program, args, cwd, sink).await {
        Ok(result) => result,
        Err(e) => (false, format!("Command failed: {e}")),
    }
}

async fn stream_command(
    program: &str,
    args: &[String],
    cwd: &Path,
    sink: &dyn LogSink,
) -> anyhow::Result<(bool, String)> {
    let mut child = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow::Error::msg("stdout was not captured"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow::Error::msg("stderr was not captured"))?;

    let out_lines = LinesStream::new(BufReader::new(stdout).lines());
    let err_lines = LinesStream::new(BufReader::new(stderr).lines());
    let mut merged = out_lines.merge(err_lines);

    let mut combined = String::new();
    while let Some(line) = merged.next().await {
        let line = line?;
        sink.line(&line).await;
        combined.push_str(&line);
        combined.push('\n');
    }

    let status = child.wait().await?;
    Ok((status.success(), combined))
}

// best effort; never propagated, never aborts the enclosing job
pub async fn clear_gpu_memory(config: &PortalConfig) {
    let script =
        "import torch\nif torch.cuda.is_available():\n    torch.cuda.empty_cache()\n    torch.cuda.synchronize()\n";
    let result = Command::new(&config.python_bin)
        .args(["-c", script])
        .current_dir(&config.partfield_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    if let Err(e) = result {
        warn!("GPU cache clear was skipped: `{e}`");
    }
}

pub fn is_out_of_memory(output: &str) -> bool {
    OOM_SIGNATURES.iter().any(|sig| output.contains(sig))
}

// last `limit` bytes of `s`, snapped to a char boundary
pub fn tail(s: &str, limit: usize) -> &str {
    if s.len() <= limit {
        return s;
    }
    let mut start = s.len() - limit;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

fn py_bool(value: bool) -> &'static str {
    if value {
        "True"
    } else {
        "False"
    }
}

// argument contract of the feature-extraction invocation: positional
// config file, then key/value override pairs
pub fn feature_extraction_args(config: &PortalConfig, job: &Job) -> Vec<String> {
    let mut args = vec![
        "partfield_inference.py".to_string(),
        "-c".to_string(),
        config.config_file.clone(),
        "--opts".to_string(),
        "continue_ckpt".to_string(),
        config.checkpoint.clone(),
        "result_name".to_string(),
        job.feature_name(),
        "dataset.data_path".to_string(),
        job.input_dir().to_string_lossy().into_owned(),
        "is_pc".to_string(),
        py_bool(job.params.is_point_cloud).to_string(),
        "n_point_per_face".to_string(),
        job.params.points_per_face.to_string(),
        "dataset.val_num_workers".to_string(),
        config.val_num_workers().to_string(),
        "dataset.val_batch_size".to_string(),
        config.val_batch_size().to_string(),
    ];
    if job.params.preprocess_mesh && !job.params.is_point_cloud {
        args.push("preprocess_mesh".to_string());
        args.push("True".to_string());
    }
    args
}

// the clustering invocation consumes stage 1's features and the job's
// input tree; point clouds skip the mesh-specific graph parameters
pub fn clustering_args(job: &Job, features_dir: &Path) -> Vec<String> {
    let mut args = vec![
        "run_part_clustering.py".to_string(),
        "--root".to_string(),
        features_dir.to_string_lossy().into_owned(),
        "--dump_dir".to_string(),
        job.output_dir().to_string_lossy().into_owned(),
        "--source_dir".to_string(),
        job.input_dir().to_string_lossy().into_owned(),
        "--max_num_clusters".to_string(),
        job.params.max_clusters.to_string(),
        "--is_pc".to_string(),
        py_bool(job.params.is_point_cloud).to_string(),
        "--export_mesh".to_string(),
        "True".to_string(),
    ];
    if !job.params.is_point_cloud {
        args.push("--use_agglo".to_string());
        args.push(py_bool(job.params.use_agglomerative).to_string());
        args.push("--option".to_string());
        args.push(u8::from(job.params.adjacency).to_string());
        args.push("--with_knn".to_string());
        args.push(py_bool(job.params.add_knn_edges).to_string());
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{AdjacencyMode, SubmitParams};
    use chrono::Utc;
    use tempfile::tempdir;

    fn mesh_job(root: &Path) -> Job {
        Job {
            id: "abcd1234".to_string(),
            root: root.to_path_buf(),
            created_at: Utc::now(),
            params: SubmitParams::default(),
            input_name: "bunny.obj".to_string(),
        }
    }

    #[test]
    fn feature_args_follow_the_override_contract() {
        let tmp = tempdir().unwrap();
        let config = PortalConfig::default();
        let job = mesh_job(tmp.path());

        let args = feature_extraction_args(&config, &job);
        assert_eq!(args[0], "partfield_inference.py");
        assert_eq!(&args[1..3], &["-c".to_string(), config.config_file.clone()]);

        let joined = args.join(" ");
        assert!(joined.contains("result_name job_abcd1234"));
        assert!(joined.contains("is_pc False"));
        assert!(joined.contains("n_point_per_face 1000"));
        assert!(joined.contains("dataset.val_num_workers 2"));
        assert!(!joined.contains("preprocess_mesh"));
    }

    #[test]
    fn preprocess_flag_is_mesh_only() {
        let tmp = tempdir().unwrap();
        let config = PortalConfig::default();

        let mut job = mesh_job(tmp.path());
        job.params.preprocess_mesh = true;
        let joined = feature_extraction_args(&config, &job).join(" ");
        assert!(joined.contains("preprocess_mesh True"));

        job.params.is_point_cloud = true;
        let joined = feature_extraction_args(&config, &job).join(" ");
        assert!(!joined.contains("preprocess_mesh"));
        assert!(joined.contains("is_pc True"));
    }

    #[test]
    fn clustering_args_skip_graph_parameters_for_point_clouds() {
        let tmp = tempdir().unwrap();
        let features = tmp.path().join("feat");

        let mut job = mesh_job(tmp.path());
        job.params.adjacency = AdjacencyMode::CcMst;
        job.params.add_knn_edges = true;
        let joined = clustering_args(&job, &features).join(" ");
        assert!(joined.contains("--use_agglo True"));
        assert!(joined.contains("--option 2"));
        assert!(joined.contains("--with_knn True"));
        assert!(joined.contains("--max_num_clusters 20"));

        job.params.is_point_cloud = true;
        let joined = clustering_args(&job, &features).join(" ");
        assert!(!joined.contains("--use_agglo"));
        assert!(!joined.contains("--option"));
        assert!(!joined.contains("--with_knn"));
        assert!(joined.contains("--is_pc True"));
    }

    #[test]
    fn oom_signatures_are_recognized() {
        assert!(is_out_of_memory(
            "RuntimeError: CUDA out of memory. Tried to allocate 2.00 GiB"
        ));
        assert!(is_out_of_memory("torch.cuda.OutOfMemoryError"));
        assert!(!is_out_of_memory("Killed"));
    }

    #[test]
    fn tail_is_bounded_and_boundary_safe() {
        assert_eq!(tail("short", 1000), "short");
        let long = "x".repeat(1500);
        assert_eq!(tail(&long, 1000).len(), 1000);
        // multi-byte content never splits a char
        let uni = "é".repeat(600);
        let t = tail(&uni, 5);
        assert!(t.len() <= 5);
        assert!(t.chars().all(|c| c == 'é'));
    }

    #[tokio::test]
    async fn run_command_streams_merged_output() {
        let tmp = tempdir().unwrap();
        let sink = Transcript::new();
        let args = vec![
            "-c".to_string(),
            "echo visible; echo hidden 1>&2; exit 3".to_string(),
        ];
        let (success, output) = run_command("sh", &args, tmp.path(), &sink).await;
        assert!(!success);
        assert!(output.contains("visible"));
        assert!(output.contains("hidden"));
        let transcript = sink.snapshot();
        assert!(transcript.contains("visible"));
        assert!(transcript.contains("hidden"));
    }

    #[tokio::test]
    async fn run_command_surfaces_spawn_failures_as_generic_failures() {
        let tmp = tempdir().unwrap();
        let sink = Transcript::new();
        let (success, output) =
            run_command("/no/such/binary", &["x".to_string()], tmp.path(), &sink).await;
        assert!(!success);
        assert!(output.starts_with("Command failed:"));
    }

    #[tokio::test]
    async fn transcript_notes_are_timestamped() {
        let sink = Transcript::new();
        sink.note("File validated successfully").await;
        sink.line("raw subprocess line").await;
        let transcript = sink.snapshot();
        assert!(transcript.starts_with('['));
        assert!(transcript.contains("] File validated successfully\n"));
        assert!(transcript.contains("raw subprocess line\n"));
    }
}
