//! Scene-graph reward scoring.
//!
//! Batch scorer for the scene-graph generation task: answer extraction,
//! format validation, graph similarity, tiered accuracy, and a soft length
//! penalty. The overall score combines the three signals with the weights
//! carried in [`RewardKwargs`].

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::RewardKwargs;

/// Action types the dataset labels with.
pub const VALID_ACTION_TYPES: &[&str] =
    &["press", "rotate", "pull", "open", "push", "close", "insert"];

/// Normalized functional relationships between scene objects.
pub const VALID_FUNCTIONAL_RELATIONSHIPS: &[&str] =
    &["openorclose", "adjust", "control", "providepower", "activate"];

/// Spatial relations an edge may carry.
pub const VALID_SPATIAL_RELATIONS: &[&str] = &[
    "left_of",
    "right_of",
    "in_front_of",
    "behind",
    "higher_than",
    "lower_than",
    "close",
    "far",
    "touching",
];

static ANSWER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)Answer\s*:\s*(\{.*\})").unwrap());
static ANSWER_OPEN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"Answer\s*:\s*\{").unwrap());

/// An edge between two scene objects.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SceneEdge {
    pub functional_relationship: String,
    pub object1: String,
    pub object2: String,
    #[serde(default)]
    pub spatial_relations: Vec<String>,
    #[serde(default)]
    pub is_touching: bool,
}

/// Simplified scene graph: the target structure the model is trained to emit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SceneGraph {
    pub task_instruction: String,
    pub nodes: Vec<String>,
    pub edges: Vec<SceneEdge>,
    pub action_type: String,
    pub function_type: String,
}

impl SceneGraph {
    /// Lenient construction from untyped JSON.
    ///
    /// Missing or wrongly typed fields fall back to defaults so similarity
    /// scoring can still compare whatever structure is present.
    pub fn from_value(value: &Value) -> Self {
        let str_field = |name: &str| {
            value
                .get(name)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let nodes = value
            .get("nodes")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let edges = value
            .get("edges")
            .and_then(Value::as_array)
            .map(|arr| arr.iter().map(edge_from_value).collect())
            .unwrap_or_default();
        Self {
            task_instruction: str_field("task_instruction"),
            nodes,
            edges,
            action_type: str_field("action_type"),
            function_type: str_field("function_type"),
        }
    }
}

fn edge_from_value(value: &Value) -> SceneEdge {
    let str_field = |name: &str| {
        value
            .get(name)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    SceneEdge {
        functional_relationship: str_field("functional_relationship"),
        object1: str_field("object1"),
        object2: str_field("object2"),
        spatial_relations: value
            .get("spatial_relations")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
        is_touching: value
            .get("is_touching")
            .and_then(Value::as_bool)
            .unwrap_or(false),
    }
}

/// Extract the JSON object following the `Answer:` marker in a response.
pub fn extract_answer(response: &str) -> Option<Value> {
    let captures = ANSWER_RE.captures(response)?;
    let raw = captures.get(1)?.as_str().trim();
    serde_json::from_str(raw).ok()
}

/// Check that a response follows the expected answer format.
///
/// 1.0 iff the answer parses as JSON and every structural and enum
/// constraint holds, 0.0 otherwise.
pub fn format_reward(response: &str) -> f64 {
    if !ANSWER_OPEN_RE.is_match(response) {
        return 0.0;
    }
    let answer = match extract_answer(response) {
        Some(answer) => answer,
        None => return 0.0,
    };
    if is_valid_graph_value(&answer) {
        1.0
    } else {
        0.0
    }
}

fn is_valid_graph_value(answer: &Value) -> bool {
    let obj = match answer.as_object() {
        Some(obj) => obj,
        None => return false,
    };

    for field in [
        "task_instruction",
        "nodes",
        "edges",
        "action_type",
        "function_type",
    ] {
        if !obj.contains_key(field) {
            return false;
        }
    }

    if !obj["nodes"].is_array() || !obj["edges"].is_array() || !obj["task_instruction"].is_string()
    {
        return false;
    }

    match obj["action_type"].as_str() {
        Some(action) if VALID_ACTION_TYPES.contains(&action) => {}
        _ => return false,
    }

    for edge in obj["edges"].as_array().unwrap() {
        let edge_obj = match edge.as_object() {
            Some(edge_obj) => edge_obj,
            None => return false,
        };

        for field in [
            "functional_relationship",
            "object1",
            "object2",
            "spatial_relations",
            "is_touching",
        ] {
            if !edge_obj.contains_key(field) {
                return false;
            }
        }

        match edge_obj["functional_relationship"].as_str() {
            Some(rel) if VALID_FUNCTIONAL_RELATIONSHIPS.contains(&rel) => {}
            _ => return false,
        }

        let spatial = match edge_obj["spatial_relations"].as_array() {
            Some(spatial) => spatial,
            None => return false,
        };
        for rel in spatial {
            match rel.as_str() {
                Some(rel) if VALID_SPATIAL_RELATIONS.contains(&rel) => {}
                _ => return false,
            }
        }

        if !edge_obj["is_touching"].is_boolean() {
            return false;
        }
    }

    true
}

/// Similarity between two edges: four equally weighted components.
pub fn edge_similarity(pred: &SceneEdge, gt: &SceneEdge) -> f64 {
    let mut score = 0.0;
    let mut components = 0usize;

    // Object matching (bidirectional)
    components += 1;
    let pred_pair = unordered_pair(&pred.object1, &pred.object2);
    let gt_pair = unordered_pair(&gt.object1, &gt.object2);
    if pred_pair == gt_pair {
        score += 1.0;
    }

    components += 1;
    if pred.functional_relationship == gt.functional_relationship {
        score += 1.0;
    }

    // Spatial relations: intersection over union penalizes both missing
    // and extra relations
    components += 1;
    if !gt.spatial_relations.is_empty() {
        score += jaccard(&pred.spatial_relations, &gt.spatial_relations);
    }

    components += 1;
    if pred.is_touching == gt.is_touching {
        score += 1.0;
    }

    score / components as f64
}

fn unordered_pair<'a>(a: &'a str, b: &'a str) -> (&'a str, &'a str) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

fn jaccard(pred: &[String], gt: &[String]) -> f64 {
    let pred: std::collections::HashSet<&str> = pred.iter().map(String::as_str).collect();
    let gt: std::collections::HashSet<&str> = gt.iter().map(String::as_str).collect();
    let union = pred.union(&gt).count();
    if union == 0 {
        return 0.0;
    }
    pred.intersection(&gt).count() as f64 / union as f64
}

/// Similarity between predicted and ground-truth graphs: five equally
/// weighted components, with extra predicted edges penalized.
pub fn graph_similarity(pred: &SceneGraph, gt: &SceneGraph) -> f64 {
    let mut total = 0.0;
    let mut components = 0usize;

    components += 1;
    if pred.task_instruction == gt.task_instruction {
        total += 1.0;
    }

    components += 1;
    if pred.action_type == gt.action_type {
        total += 1.0;
    }

    components += 1;
    if pred.function_type == gt.function_type {
        total += 1.0;
    }

    components += 1;
    if !gt.nodes.is_empty() {
        total += jaccard(&pred.nodes, &gt.nodes);
    }

    components += 1;
    if !gt.edges.is_empty() {
        let mut edge_score = 0.0;
        for gt_edge in &gt.edges {
            let best = pred
                .edges
                .iter()
                .map(|pred_edge| edge_similarity(pred_edge, gt_edge))
                .fold(0.0, f64::max);
            edge_score += best;
        }
        edge_score /= gt.edges.len() as f64;

        if pred.edges.len() > gt.edges.len() {
            let penalty = (pred.edges.len() - gt.edges.len()) as f64 * 0.1;
            edge_score = (edge_score - penalty).max(0.0);
        }

        total += edge_score;
    }

    total / components as f64
}

/// Tiered accuracy reward from graph similarity.
///
/// -0.5 when the answer or ground truth fails to parse, 0.0 when format
/// validation fails, otherwise a similarity tier.
pub fn accuracy_reward(response: &str, ground_truth: &str) -> f64 {
    let gt_value: Value = match serde_json::from_str(ground_truth.trim()) {
        Ok(value) => value,
        Err(_) => return -0.5,
    };

    let pred_value = match extract_answer(response) {
        Some(value) => value,
        None => return -0.5,
    };

    if format_reward(response) == 0.0 {
        return 0.0;
    }

    let pred = SceneGraph::from_value(&pred_value);
    let gt = SceneGraph::from_value(&gt_value);
    let similarity = graph_similarity(&pred, &gt);

    if similarity >= 0.98 {
        1.0
    } else if similarity >= 0.85 {
        0.8
    } else if similarity >= 0.7 {
        0.5
    } else if similarity >= 0.5 {
        0.2
    } else if similarity >= 0.3 {
        0.0
    } else {
        -0.5
    }
}

/// Soft length penalty for overly long responses.
///
/// 0 up to `max - buffer`, linear down to -1.0 at `max`, -1.0 beyond.
pub fn overlong_punishment(
    response_length: usize,
    max_response_length: u32,
    overlong_buffer_length: u32,
) -> f64 {
    let response_length = response_length as i64;
    let max = max_response_length as i64;
    let buffer = overlong_buffer_length as i64;
    let expected = max - buffer;
    if response_length <= expected {
        0.0
    } else if response_length <= max {
        (expected - response_length) as f64 / buffer as f64
    } else {
        -1.0
    }
}

/// One response/ground-truth pair to score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardInput {
    pub response: String,
    pub ground_truth: String,
}

/// Component scores for one response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardScore {
    pub overall: f64,
    pub format: f64,
    pub accuracy: f64,
    pub overlong: f64,
    /// Accuracy mapped to [0, 1] for online filtering
    pub accuracy_normalized: f64,
}

/// Score a batch of responses.
pub fn compute_score(inputs: &[RewardInput], kwargs: &RewardKwargs) -> Vec<RewardScore> {
    inputs
        .iter()
        .map(|input| {
            let format = format_reward(&input.response);
            let accuracy = accuracy_reward(&input.response, &input.ground_truth);
            let overlong = overlong_punishment(
                input.response.chars().count(),
                kwargs.max_response_length,
                kwargs.overlong_buffer_length,
            );
            let overall = kwargs.format_weight * format
                + (1.0 - kwargs.format_weight) * accuracy
                + overlong * kwargs.overlong_penalty_factor;
            RewardScore {
                overall,
                format,
                accuracy,
                overlong,
                accuracy_normalized: 0.5 * (accuracy + 1.0),
            }
        })
        .collect()
}
