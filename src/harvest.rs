use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use log::warn;
use serde::Serialize;

use crate::job::Job;

// clustering dumps results into this subtree of the job's output dir
const RESULT_SUBDIR: &str = "ply";

const PCA_PREFIX: &str = "feat_pca_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactFormat {
    // .ply carrying mesh topology
    Mesh,
    // .obj, emitted when UV maps were preserved
    MeshUv,
    // .ply holding raw points
    PointCloud,
}

impl ArtifactFormat {
    fn classify(path: &Path, is_point_cloud: bool) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_lowercase();
        match ext.as_str() {
            "obj" => Some(Self::MeshUv),
            "ply" if is_point_cloud => Some(Self::PointCloud),
            "ply" => Some(Self::Mesh),
            _ => None,
        }
    }

    pub fn preserves_uv(&self) -> bool {
        matches!(self, Self::MeshUv)
    }
}

// one produced segmentation at a specific part count
#[derive(Debug, Clone)]
pub struct Artifact {
    pub path: PathBuf,

    pub format: ArtifactFormat,

    // parsed from the `{uid}_{view}_{count}.<ext>` convention;
    // names outside the convention sort first with key 0
    pub parts: u32,

    // the raw trailing token, kept for the human label
    part_token: String,
}

impl Artifact {
    fn from_path(path: PathBuf, is_point_cloud: bool) -> Option<Self> {
        let format = ArtifactFormat::classify(&path, is_point_cloud)?;
        let token = part_token(&path);
        Some(Self {
            parts: token.parse().unwrap_or(0),
            part_token: token,
            path,
            format,
        })
    }

    pub fn label(&self) -> String {
        let format_suffix = if self.format.preserves_uv() { " (UV)" } else { "" };
        format!("{} parts{format_suffix}", self.part_token)
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

fn part_token(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    stem.rsplit('_').next().unwrap_or(&stem).to_string()
}

// discover produced artifacts: scan the result subtree, order by part
// count ascending, and collapse same-count variants preferring the
// UV-preserving format
pub fn harvest(job: &Job) -> Vec<Artifact> {
    let result_dir = job.output_dir().join(RESULT_SUBDIR);
    let entries = match fs::read_dir(&result_dir) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };

    let mut by_count: BTreeMap<(u32, String), Artifact> = BTreeMap::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(artifact) = Artifact::from_path(path, job.params.is_point_cloud) else {
            continue;
        };
        let key = (artifact.parts, artifact.part_token.clone());
        match by_count.get(&key) {
            Some(existing) if existing.format.preserves_uv() || !artifact.format.preserves_uv() => {}
            _ => {
                by_count.insert(key, artifact);
            }
        }
    }
    by_count.into_values().collect()
}

// at most one auxiliary feature-space projection is produced alongside
// the features, independent of the clustering stage
pub fn find_pca(features_dir: &Path) -> Option<PathBuf> {
    let entries = fs::read_dir(features_dir).ok()?;
    entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(PCA_PREFIX) && n.ends_with(".ply"))
                .unwrap_or(false)
        })
        .min()
}

// the features dir is deleted right after harvesting, so the projection
// is moved into the job's output tree to stay downloadable
pub fn preserve_pca(pca: &Path, output_dir: &Path) -> PathBuf {
    let Some(name) = pca.file_name() else {
        return pca.to_path_buf();
    };
    let dest = output_dir.join(name);
    match fs::copy(pca, &dest) {
        Ok(_) => dest,
        Err(e) => {
            warn!("Failed to preserve `{}`: `{e}`", pca.display());
            pca.to_path_buf()
        }
    }
}

// annotation carried by the status and the closing log note when any
// result kept its UV maps
pub fn format_note(artifacts: &[Artifact]) -> &'static str {
    if artifacts.iter().any(|a| a.format.preserves_uv()) {
        " (with UV maps)"
    } else {
        ""
    }
}

pub fn success_status(artifacts: &[Artifact], max_clusters: u32) -> String {
    format!(
        "Success! Generated {} segmentation(s) with 2 to {} parts{}",
        artifacts.len(),
        max_clusters,
        format_note(artifacts)
    )
}

pub const EMPTY_RESULT_STATUS: &str = "Warning: No output files generated";
