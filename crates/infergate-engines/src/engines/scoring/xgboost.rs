//! XGBoost JSON boosters (`Booster.save_model("model.json")`)

use super::{argmax_rows, check_features, feature_matrix, scores_payload, sigmoid, softmax_rows};
use crate::engine::{Model, ModelHandle};
use async_trait::async_trait;
use infergate_core::{Error, Payload, Result, TensorData};
use ndarray::{Array1, Array2, ArrayView1};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
struct ModelFile {
    learner: Learner,
}

#[derive(Debug, Deserialize)]
struct Learner {
    gradient_booster: Booster,
    learner_model_param: LearnerParam,
    objective: ObjectiveSpec,
}

#[derive(Debug, Deserialize)]
struct Booster {
    name: String,
    #[serde(default)]
    model: Option<TreeEnsemble>,
    /// dart wraps a gbtree
    #[serde(default)]
    gbtree: Option<Box<Booster>>,
    #[serde(default)]
    weight_drop: Vec<f64>,
}

#[derive(Debug, Deserialize)]
struct TreeEnsemble {
    trees: Vec<TreeSpec>,
    #[serde(default)]
    tree_info: Vec<usize>,
}

#[derive(Debug, Deserialize)]
struct TreeSpec {
    left_children: Vec<i64>,
    right_children: Vec<i64>,
    split_indices: Vec<i64>,
    split_conditions: Vec<f64>,
    #[serde(deserialize_with = "flags")]
    default_left: Vec<bool>,
    #[serde(default)]
    split_type: Vec<i64>,
}

#[derive(Debug, Deserialize)]
struct LearnerParam {
    #[serde(deserialize_with = "number")]
    base_score: f64,
    #[serde(default, deserialize_with = "optional_number")]
    num_class: Option<f64>,
    #[serde(default, deserialize_with = "optional_number")]
    num_feature: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ObjectiveSpec {
    name: String,
}

/// XGBoost stores most numbers as strings, sometimes bracketed (`"[5E-1]"`)
fn parse_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s
            .trim()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .split(',')
            .next()
            .and_then(|first| first.trim().parse().ok()),
        _ => None,
    }
}

fn number<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<f64, D::Error> {
    let value = Value::deserialize(deserializer)?;
    parse_number(&value)
        .ok_or_else(|| serde::de::Error::custom(format!("expected a number, got {}", value)))
}

fn optional_number<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<f64>, D::Error> {
    number(deserializer).map(Some)
}

fn flags<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Vec<bool>, D::Error> {
    let values = Vec::<Value>::deserialize(deserializer)?;
    Ok(values
        .iter()
        .map(|v| v.as_bool().unwrap_or_else(|| v.as_i64().unwrap_or(0) != 0))
        .collect())
}

/// How margins become predictions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Objective {
    Logistic,
    Exp,
    Hinge,
    Softprob,
    Softmax,
    Identity,
}

impl Objective {
    fn parse(name: &str) -> Self {
        match name {
            "binary:logistic" | "reg:logistic" => Self::Logistic,
            "count:poisson" | "reg:gamma" | "reg:tweedie" => Self::Exp,
            "binary:hinge" => Self::Hinge,
            "multi:softprob" => Self::Softprob,
            "multi:softmax" => Self::Softmax,
            _ => Self::Identity,
        }
    }
}

/// Base score in margin space
fn base_margin(objective: &str, base_score: f64) -> f64 {
    match objective {
        "binary:logistic" | "reg:logistic" | "binary:logitraw" => -(1.0 / base_score - 1.0).ln(),
        "count:poisson" | "reg:gamma" | "reg:tweedie" => base_score.ln(),
        _ => base_score,
    }
}

#[derive(Debug, Clone)]
struct Tree {
    left: Vec<i64>,
    right: Vec<i64>,
    feature: Vec<usize>,
    condition: Vec<f64>,
    default_left: Vec<bool>,
}

impl Tree {
    fn from_spec(index: usize, spec: TreeSpec) -> Result<Self> {
        let nodes = spec.left_children.len();
        let invalid = |msg: String| Error::model(format!("tree {}: {}", index, msg));

        if nodes == 0 {
            return Err(invalid("no nodes".to_string()));
        }
        if spec.right_children.len() != nodes
            || spec.split_indices.len() != nodes
            || spec.split_conditions.len() != nodes
            || spec.default_left.len() != nodes
        {
            return Err(invalid("node arrays differ in length".to_string()));
        }
        if spec.split_type.iter().any(|&t| t != 0) {
            return Err(invalid("categorical splits are not supported".to_string()));
        }

        for node in 0..nodes {
            let (left, right) = (spec.left_children[node], spec.right_children[node]);
            if left < 0 {
                continue;
            }
            // children always follow their parent
            let valid = |child: i64| child > node as i64 && (child as usize) < nodes;
            if !valid(left) || !valid(right) || spec.split_indices[node] < 0 {
                return Err(invalid(format!("node {} has invalid children", node)));
            }
        }

        Ok(Self {
            left: spec.left_children,
            right: spec.right_children,
            feature: spec.split_indices.iter().map(|&i| i.max(0) as usize).collect(),
            condition: spec.split_conditions,
            default_left: spec.default_left,
        })
    }

    fn leaf(&self, row: ArrayView1<f64>) -> f64 {
        let mut node = 0usize;
        loop {
            let left = self.left[node];
            if left < 0 {
                return self.condition[node];
            }
            let value = row.get(self.feature[node]).copied().unwrap_or(f64::NAN);
            let go_left = if value.is_nan() {
                self.default_left[node]
            } else {
                (value as f32) < (self.condition[node] as f32)
            };
            node = (if go_left { left } else { self.right[node] }) as usize;
        }
    }
}

/// A gbtree (or dart) booster
#[derive(Debug, Clone)]
pub struct XgbModel {
    trees: Vec<Tree>,
    groups: Vec<usize>,
    weights: Option<Vec<f64>>,
    num_class: usize,
    num_feature: Option<usize>,
    base_margin: f64,
    objective: Objective,
    objective_name: String,
}

/// Registry loader
pub fn load(path: &Path) -> Result<ModelHandle> {
    Ok(Arc::new(XgbModel::from_file(path)?))
}

impl XgbModel {
    pub fn from_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Self::from_slice(&bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let file: ModelFile = serde_json::from_slice(bytes)
            .map_err(|e| Error::model(format!("not an XGBoost JSON model: {}", e)))?;
        let learner = file.learner;

        let booster_name = learner.gradient_booster.name.clone();
        let (ensemble, weights) = match booster_name.as_str() {
            "gbtree" => (learner.gradient_booster.model, None),
            "dart" => {
                let booster = learner.gradient_booster;
                let inner = booster
                    .gbtree
                    .ok_or_else(|| Error::model("dart booster without a gbtree"))?;
                (inner.model, Some(booster.weight_drop))
            }
            other => return Err(Error::model(format!("unsupported booster '{}'", other))),
        };
        let ensemble = ensemble.ok_or_else(|| Error::model("booster has no trees"))?;

        let num_class = learner
            .learner_model_param
            .num_class
            .map(|n| n as usize)
            .unwrap_or(0)
            .max(1);
        let groups = if ensemble.tree_info.is_empty() {
            vec![0; ensemble.trees.len()]
        } else {
            ensemble.tree_info
        };
        if groups.len() != ensemble.trees.len() || groups.iter().any(|&g| g >= num_class) {
            return Err(Error::model("`tree_info` does not match the trees"));
        }
        if let Some(weights) = &weights {
            if weights.len() != ensemble.trees.len() {
                return Err(Error::model("dart weights do not match the trees"));
            }
        }

        let trees = ensemble
            .trees
            .into_iter()
            .enumerate()
            .map(|(i, spec)| Tree::from_spec(i, spec))
            .collect::<Result<Vec<_>>>()?;

        let objective_name = learner.objective.name;
        Ok(Self {
            trees,
            groups,
            weights,
            num_class,
            num_feature: learner
                .learner_model_param
                .num_feature
                .map(|n| n as usize)
                .filter(|&n| n > 0),
            base_margin: base_margin(&objective_name, learner.learner_model_param.base_score),
            objective: Objective::parse(&objective_name),
            objective_name,
        })
    }

    pub fn num_trees(&self) -> usize {
        self.trees.len()
    }

    /// Raw margins, one column per class
    pub fn margins(&self, x: &Array2<f64>) -> Result<Array2<f64>> {
        if let Some(expected) = self.num_feature {
            check_features(x, expected)?;
        }

        let mut margins = Array2::from_elem((x.nrows(), self.num_class), self.base_margin);
        for (i, tree) in self.trees.iter().enumerate() {
            let group = self.groups[i];
            let weight = self.weights.as_ref().map_or(1.0, |w| w[i]);
            for (r, row) in x.rows().into_iter().enumerate() {
                margins[[r, group]] += weight * tree.leaf(row);
            }
        }
        Ok(margins)
    }

    pub fn predict_matrix(&self, x: &Array2<f64>) -> Result<Payload> {
        let mut margins = self.margins(x)?;

        Ok(match self.objective {
            Objective::Logistic => scores_payload(margins.mapv(sigmoid)),
            Objective::Exp => scores_payload(margins.mapv(f64::exp)),
            Objective::Hinge => scores_payload(margins.mapv(|m| if m > 0.0 { 1.0 } else { 0.0 })),
            Objective::Softprob => {
                softmax_rows(&mut margins);
                scores_payload(margins)
            }
            Objective::Softmax => {
                let classes: Array1<f64> =
                    argmax_rows(&margins).into_iter().map(|c| c as f64).collect();
                Payload::Array(TensorData::Float64(classes.into_dyn()))
            }
            Objective::Identity => scores_payload(margins),
        })
    }
}

#[async_trait]
impl Model for XgbModel {
    async fn predict(&self, data: Payload) -> Result<Payload> {
        self.predict_matrix(&feature_matrix(&data)?)
    }

    fn describe(&self) -> String {
        format!("xgboost:{} ({} trees)", self.objective_name, self.trees.len())
    }
}
