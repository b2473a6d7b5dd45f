//! Scene dataset tooling.
//!
//! Builds JSONL training manifests from raw scene captures and verifies
//! existing manifests. A scene directory holds one JSON scene description
//! plus an `rgb/` folder of view images; the manifest stores the per-view
//! image paths, the templated problem string, and the simplified scene graph
//! as the answer.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::errors::{CoreError, CoreResult};
use crate::reward::{SceneEdge, SceneGraph};

/// Image extensions recognized inside `rgb/` folders.
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "png"];

/// Columns every manifest record must carry.
pub const MANIFEST_COLUMNS: &[&str] = &["images", "problem", "answer"];

const PREVIEW_CHARS: usize = 200;
const INSPECT_SAMPLE_FILES: usize = 5;

/// One manifest record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneRecord {
    /// Per-view image paths for the scene
    pub images: Vec<String>,
    /// Templated problem shown to the model
    pub problem: String,
    /// Simplified scene graph as compact JSON
    pub answer: String,
}

// =============================================================================
// Scene Discovery and Loading
// =============================================================================

/// Recursively find scene directories under the given base folders.
///
/// A scene directory contains at least one `*.json` scene file and an `rgb/`
/// subdirectory with images. Unreadable folders are skipped with a warning.
pub fn discover_scenes(base_folders: &[PathBuf]) -> Vec<PathBuf> {
    let mut scenes = Vec::new();
    for base in base_folders {
        if !base.is_dir() {
            warn!("scene folder not found: {}", base.display());
            continue;
        }
        let before = scenes.len();
        collect_scene_dirs(base, &mut scenes);
        info!(
            "found {} scenes in {}",
            scenes.len() - before,
            base.display()
        );
    }
    scenes.sort();
    scenes
}

fn collect_scene_dirs(dir: &Path, out: &mut Vec<PathBuf>) {
    if is_scene_dir(dir) {
        out.push(dir.to_path_buf());
    }
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            warn!("cannot read {}: {}", dir.display(), err);
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_scene_dirs(&path, out);
        }
    }
}

fn is_scene_dir(dir: &Path) -> bool {
    let has_json = fs::read_dir(dir)
        .map(|entries| {
            entries
                .flatten()
                .any(|e| e.path().is_file() && has_extension(&e.path(), "json"))
        })
        .unwrap_or(false);
    has_json && !list_images(&dir.join("rgb")).is_empty()
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension()
        .map(|e| e.to_string_lossy().eq_ignore_ascii_case(ext))
        .unwrap_or(false)
}

fn list_images(rgb_dir: &Path) -> Vec<PathBuf> {
    let mut images: Vec<PathBuf> = fs::read_dir(rgb_dir)
        .map(|entries| {
            entries
                .flatten()
                .map(|e| e.path())
                .filter(|p| {
                    p.is_file() && IMAGE_EXTENSIONS.iter().any(|ext| has_extension(p, ext))
                })
                .collect()
        })
        .unwrap_or_default();
    images.sort();
    images
}

/// Load a scene directory: the first JSON file (sorted) plus the sorted
/// image listing.
///
/// A scene file holding an array yields its first element.
pub fn load_scene(scene_dir: &Path) -> CoreResult<(Value, Vec<PathBuf>)> {
    let mut json_files: Vec<PathBuf> = fs::read_dir(scene_dir)
        .map_err(|e| {
            CoreError::dataset(format!("cannot read scene {}: {}", scene_dir.display(), e))
        })?
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_file() && has_extension(p, "json"))
        .collect();
    json_files.sort();

    let json_file = json_files.first().ok_or_else(|| {
        CoreError::dataset(format!("no JSON file in {}", scene_dir.display()))
    })?;

    let raw = fs::read_to_string(json_file).map_err(|e| {
        CoreError::dataset(format!("cannot read {}: {}", json_file.display(), e))
    })?;
    let parsed: Value = serde_json::from_str(&raw).map_err(|e| {
        CoreError::dataset(format!("invalid scene JSON {}: {}", json_file.display(), e))
    })?;
    let scene = match parsed {
        Value::Array(items) => items.into_iter().next().ok_or_else(|| {
            CoreError::dataset(format!("empty scene list in {}", json_file.display()))
        })?,
        other => other,
    };

    let images = list_images(&scene_dir.join("rgb"));
    if images.is_empty() {
        return Err(CoreError::dataset(format!(
            "no images in {}",
            scene_dir.join("rgb").display()
        )));
    }

    Ok((scene, images))
}

// =============================================================================
// Graph Simplification
// =============================================================================

/// Map node ids to display names, numbering duplicated labels.
///
/// Unique labels stay bare; duplicates get numeric suffixes in node order
/// (`lamp1`, `lamp2`).
pub fn label_mapping(nodes: &[Value]) -> HashMap<String, String> {
    let mut label_counts: HashMap<String, usize> = HashMap::new();
    for node in nodes {
        let label = node_label(node);
        *label_counts.entry(label).or_insert(0) += 1;
    }

    let mut current_counts: HashMap<String, usize> = HashMap::new();
    let mut mapping = HashMap::new();
    for node in nodes {
        let label = node_label(node);
        let node_id = node
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let mapped = if label_counts[&label] > 1 {
            let count = current_counts.entry(label.clone()).or_insert(0);
            *count += 1;
            format!("{}{}", label, count)
        } else {
            label
        };
        mapping.insert(node_id, mapped);
    }

    mapping
}

fn node_label(node: &Value) -> String {
    node.get("label")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string()
}

/// Normalize a raw functional relationship to its dataset form.
pub fn normalize_functional_relationship(raw: &str) -> String {
    match raw {
        "open or close" | "openorclose" => "openorclose".to_string(),
        "provide power" | "providepower" => "providepower".to_string(),
        other => other.to_string(),
    }
}

/// Simplify a raw scene JSON into the target [`SceneGraph`].
pub fn simplify_scene(scene: &Value) -> SceneGraph {
    let str_field = |name: &str| {
        scene
            .get(name)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };

    let raw_nodes = scene
        .get("nodes")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let mapping = label_mapping(&raw_nodes);

    // Mapped names in node order
    let nodes: Vec<String> = raw_nodes
        .iter()
        .map(|node| {
            let id = node.get("id").and_then(Value::as_str).unwrap_or_default();
            mapping.get(id).cloned().unwrap_or_else(|| node_label(node))
        })
        .collect();

    let mapped_object = |edge: &Value, key: &str| {
        let id = edge
            .get(key)
            .and_then(|o| o.get("id"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        mapping
            .get(id)
            .cloned()
            .unwrap_or_else(|| "unknown".to_string())
    };

    let edges: Vec<SceneEdge> = scene
        .get("edges")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .map(|edge| SceneEdge {
                    functional_relationship: normalize_functional_relationship(
                        edge.get("functional_relationship")
                            .and_then(Value::as_str)
                            .unwrap_or_default(),
                    ),
                    object1: mapped_object(edge, "object1"),
                    object2: mapped_object(edge, "object2"),
                    spatial_relations: edge
                        .get("spatial_relations")
                        .and_then(Value::as_array)
                        .map(|rels| {
                            rels.iter()
                                .filter_map(Value::as_str)
                                .map(str::to_string)
                                .collect()
                        })
                        .unwrap_or_default(),
                    is_touching: edge
                        .get("is_touching")
                        .and_then(Value::as_bool)
                        .unwrap_or(false),
                })
                .collect()
        })
        .unwrap_or_default();

    SceneGraph {
        task_instruction: str_field("task_instruction"),
        nodes,
        edges,
        action_type: str_field("action_type"),
        function_type: str_field("function_type"),
    }
}

/// Build one manifest record from a scene directory.
pub fn build_record(scene_dir: &Path) -> CoreResult<SceneRecord> {
    let (scene, images) = load_scene(scene_dir)?;
    let graph = simplify_scene(&scene);
    let answer = serde_json::to_string(&graph)?;

    Ok(SceneRecord {
        images: images
            .iter()
            .map(|p| p.to_string_lossy().to_string())
            .collect(),
        problem: format!("<image>Task instruction: {}", graph.task_instruction),
        answer,
    })
}

// =============================================================================
// Split and Manifest Writing
// =============================================================================

/// Deterministic shuffle and ratio split.
///
/// At least one record always lands on the train side when any exist.
pub fn split_records(
    mut records: Vec<SceneRecord>,
    train_ratio: f64,
    seed: u64,
) -> (Vec<SceneRecord>, Vec<SceneRecord>) {
    if records.is_empty() {
        return (Vec::new(), Vec::new());
    }

    let mut rng = StdRng::seed_from_u64(seed);
    records.shuffle(&mut rng);

    let ratio = train_ratio.clamp(0.0, 1.0);
    let train_count = ((records.len() as f64) * ratio).round() as usize;
    let train_count = train_count.max(1).min(records.len());

    let val = records.split_off(train_count);
    (records, val)
}

/// Write records as JSONL.
pub fn write_manifest(records: &[SceneRecord], path: &Path) -> CoreResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut out = fs::File::create(path)?;
    for record in records {
        let line = serde_json::to_string(record)?;
        writeln!(out, "{}", line)?;
    }
    Ok(())
}

/// Summary of one manifest build run.
#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub scanned: usize,
    pub built: usize,
    pub skipped: usize,
    pub train: usize,
    pub val: usize,
    pub train_manifest: String,
    pub val_manifest: String,
}

/// Discover, simplify, split, and write `train.jsonl` / `val.jsonl`.
///
/// Scenes that fail to load are skipped with a warning rather than aborting
/// the whole build.
pub fn build_manifests(
    base_folders: &[PathBuf],
    out_dir: &Path,
    train_ratio: f64,
    seed: u64,
    max_scenes: Option<usize>,
) -> CoreResult<BuildReport> {
    let mut scenes = discover_scenes(base_folders);
    if let Some(max) = max_scenes {
        scenes.truncate(max);
    }
    if scenes.is_empty() {
        return Err(CoreError::dataset(
            "no scene directories found under the given folders".to_string(),
        ));
    }

    let scanned = scenes.len();
    let mut records = Vec::with_capacity(scanned);
    let mut skipped = 0usize;
    for scene_dir in &scenes {
        match build_record(scene_dir) {
            Ok(record) => records.push(record),
            Err(err) => {
                warn!("skipping {}: {}", scene_dir.display(), err);
                skipped += 1;
            }
        }
    }
    if records.is_empty() {
        return Err(CoreError::dataset(format!(
            "all {} scenes failed to load",
            scanned
        )));
    }

    let built = records.len();
    let (train, val) = split_records(records, train_ratio, seed);
    info!("dataset split: {} train, {} val", train.len(), val.len());

    let train_manifest = out_dir.join("train.jsonl");
    let val_manifest = out_dir.join("val.jsonl");
    write_manifest(&train, &train_manifest)?;
    write_manifest(&val, &val_manifest)?;

    Ok(BuildReport {
        scanned,
        built,
        skipped,
        train: train.len(),
        val: val.len(),
        train_manifest: train_manifest.to_string_lossy().to_string(),
        val_manifest: val_manifest.to_string_lossy().to_string(),
    })
}

// =============================================================================
// Manifest Verification
// =============================================================================

/// Result of verifying one manifest file.
#[derive(Debug, Clone, Serialize)]
pub struct ManifestReport {
    pub records: usize,
    /// `line N: missing column 'x'` style findings
    pub column_errors: Vec<String>,
    /// Referenced image paths that do not exist
    pub missing_images: Vec<String>,
    /// Truncated preview of the first record
    pub preview: Option<String>,
}

impl ManifestReport {
    pub fn is_clean(&self) -> bool {
        self.column_errors.is_empty() && self.missing_images.is_empty()
    }
}

/// Verify a JSONL manifest: expected columns per record, referenced images
/// exist, and a preview of the first record.
pub fn check_manifest(path: &Path) -> CoreResult<ManifestReport> {
    let raw = fs::read_to_string(path)
        .map_err(|e| CoreError::dataset(format!("cannot read manifest {}: {}", path.display(), e)))?;

    let mut records = 0usize;
    let mut column_errors = Vec::new();
    let mut missing_images = Vec::new();
    let mut preview = None;

    for (idx, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record: Value = serde_json::from_str(line).map_err(|e| {
            CoreError::dataset(format!("line {}: invalid JSON: {}", idx + 1, e))
        })?;
        records += 1;

        for column in MANIFEST_COLUMNS {
            if record.get(column).is_none() {
                column_errors.push(format!("line {}: missing column '{}'", idx + 1, column));
            }
        }

        if let Some(images) = record.get("images").and_then(Value::as_array) {
            for image in images.iter().filter_map(Value::as_str) {
                if !Path::new(image).exists() {
                    missing_images.push(image.to_string());
                }
            }
        }

        if preview.is_none() {
            let problem = record.get("problem").and_then(Value::as_str).unwrap_or("");
            let answer = record.get("answer").and_then(Value::as_str).unwrap_or("");
            preview = Some(format!(
                "problem: {} | answer: {}",
                truncate(problem, PREVIEW_CHARS / 2),
                truncate(answer, PREVIEW_CHARS)
            ));
        }
    }

    Ok(ManifestReport {
        records,
        column_errors,
        missing_images,
        preview,
    })
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let prefix: String = s.chars().take(max_chars).collect();
        format!("{}...", prefix)
    }
}

// =============================================================================
// Raw Tree Inspection
// =============================================================================

/// Summary of one scene JSON file.
#[derive(Debug, Clone, Serialize)]
pub struct SceneFileSummary {
    pub path: String,
    pub has_rgb: bool,
    pub rgb_files: usize,
    /// Top-level keys of the scene object (or of the first list element)
    pub keys: Vec<String>,
    pub list_len: Option<usize>,
    pub task_preview: Option<String>,
}

/// Result of inspecting a raw scene tree.
#[derive(Debug, Clone, Serialize)]
pub struct InspectReport {
    pub json_files: usize,
    pub samples: Vec<SceneFileSummary>,
    /// Directory layout patterns: first three path components of each
    /// scene file's parent, relative to the root
    pub patterns: Vec<String>,
}

/// Walk a raw scene tree and report its structure.
pub fn inspect_tree(root: &Path) -> CoreResult<InspectReport> {
    if !root.is_dir() {
        return Err(CoreError::dataset(format!(
            "path not found: {}",
            root.display()
        )));
    }

    let mut json_files = Vec::new();
    collect_json_files(root, &mut json_files);
    json_files.sort();

    let samples = json_files
        .iter()
        .take(INSPECT_SAMPLE_FILES)
        .map(|file| summarize_scene_file(file))
        .collect();

    let mut patterns = BTreeSet::new();
    for file in &json_files {
        let rel = file
            .parent()
            .and_then(|p| p.strip_prefix(root).ok())
            .unwrap_or_else(|| Path::new(""));
        let components: Vec<String> = rel
            .components()
            .take(3)
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect();
        if !components.is_empty() {
            patterns.insert(components.join("/"));
        }
    }

    Ok(InspectReport {
        json_files: json_files.len(),
        samples,
        patterns: patterns.into_iter().collect(),
    })
}

fn collect_json_files(dir: &Path, out: &mut Vec<PathBuf>) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            warn!("cannot read {}: {}", dir.display(), err);
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_json_files(&path, out);
        } else if has_extension(&path, "json") {
            out.push(path);
        }
    }
}

fn summarize_scene_file(file: &Path) -> SceneFileSummary {
    let rgb_dir = file.parent().unwrap_or_else(|| Path::new("")).join("rgb");
    let rgb_files = list_images(&rgb_dir).len();

    let mut keys = Vec::new();
    let mut list_len = None;
    let mut task_preview = None;
    if let Ok(raw) = fs::read_to_string(file) {
        if let Ok(parsed) = serde_json::from_str::<Value>(&raw) {
            let object = match &parsed {
                Value::Array(items) => {
                    list_len = Some(items.len());
                    items.first().cloned()
                }
                other => Some(other.clone()),
            };
            if let Some(Value::Object(map)) = object {
                keys = map.keys().cloned().collect();
                task_preview = map
                    .get("task_instruction")
                    .and_then(Value::as_str)
                    .map(|t| truncate(t, 100));
            }
        }
    }

    SceneFileSummary {
        path: file.to_string_lossy().to_string(),
        has_rgb: rgb_dir.is_dir(),
        rgb_files,
        keys,
        list_len,
        task_preview,
    }
}
