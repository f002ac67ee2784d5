use std::{
    fs,
    io,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

// how the face adjacency graph is built for mesh clustering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
#[serde(rename_all = "snake_case")]
pub enum AdjacencyMode {
    Naive = 0,
    FaceMst = 1,
    CcMst = 2,
}

// immutable snapshot of the submission-time configuration
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitParams {
    pub is_point_cloud: bool,
    // upper bound of the generated segmentations, [2, 30]
    pub max_clusters: u32,
    // agglomerative vs KMeans(mesh only)
    pub use_agglomerative: bool,
    pub preprocess_mesh: bool,
    pub adjacency: AdjacencyMode,
    pub add_knn_edges: bool,
    // sampling budget, the main memory control, [100, 2000]
    pub points_per_face: u32,
}

impl Default for SubmitParams {
    fn default() -> Self {
        Self {
            is_point_cloud: false,
            max_clusters: 20,
            use_agglomerative: true,
            preprocess_mesh: false,
            adjacency: AdjacencyMode::FaceMst,
            add_knn_edges: false,
            points_per_face: 1000,
        }
    }
}

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("Failed to create job directory `{path}`: {source}")]
    CreateDir {
        path: PathBuf,
        source: io::Error,
    },

    #[error("Failed to copy input file into the job workspace: {source}")]
    CopyInput {
        #[source]
        source: io::Error,
    },

    #[error("Input file has no usable name: `{0}`")]
    BadInputName(PathBuf),
}

// maintains the lifecycle context for one submission: an isolated
// directory tree plus the parameter snapshot
#[derive(Debug)]
pub struct Job {
    pub id: String,

    // <jobs_dir>/<id>, owns the input/ and output/ subtrees
    pub root: PathBuf,

    pub created_at: DateTime<Utc>,

    pub params: SubmitParams,

    // original file name of the copied upload
    pub input_name: String,
}

impl Job {
    // allocate a fresh workspace and copy the validated input into it;
    // id uniqueness is the only cross-job safety mechanism, each job
    // owns a disjoint subtree
    pub fn create(
        jobs_dir: &Path,
        input: &Path,
        params: SubmitParams,
    ) -> Result<Job, WorkspaceError> {
        let id = Uuid::new_v4().simple().to_string()[..8].to_string();
        let root = jobs_dir.join(&id);

        let input_dir = root.join("input");
        let output_dir = root.join("output");
        for dir in [&input_dir, &output_dir] {
            fs::create_dir_all(dir).map_err(|e| WorkspaceError::CreateDir {
                path: dir.clone(),
                source: e,
            })?;
        }

        let input_name = input
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| WorkspaceError::BadInputName(input.to_path_buf()))?;
        fs::copy(input, input_dir.join(&input_name))
            .map_err(|e| WorkspaceError::CopyInput { source: e })?;

        Ok(Job {
            id,
            root,
            created_at: Utc::now(),
            params,
            input_name,
        })
    }

    pub fn input_dir(&self) -> PathBuf {
        self.root.join("input")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.root.join("output")
    }

    // job-scoped result name handed to the inference stage
    pub fn feature_name(&self) -> String {
        format!("job_{}", self.id)
    }
}
