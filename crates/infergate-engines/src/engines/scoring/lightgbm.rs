//! LightGBM text boosters (`Booster.save_model("model.txt")`)

use super::{check_features, feature_matrix, scores_payload, sigmoid, softmax_rows};
use crate::engine::{Model, ModelHandle};
use async_trait::async_trait;
use infergate_core::{Error, Payload, Result};
use ndarray::{Array2, ArrayView1};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

/// Values this close to zero count as zero for zero-as-missing splits
const ZERO_THRESHOLD: f64 = 1e-35;

const DEFAULT_LEFT_MASK: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MissingType {
    None,
    Zero,
    NaN,
}

#[derive(Debug, Clone)]
struct Tree {
    leaf_value: Vec<f64>,
    split_feature: Vec<usize>,
    threshold: Vec<f64>,
    decision_type: Vec<u8>,
    left_child: Vec<i64>,
    right_child: Vec<i64>,
}

fn field<T: FromStr>(block: &HashMap<&str, &str>, key: &str, tree: usize) -> Result<Vec<T>> {
    let raw = block
        .get(key)
        .ok_or_else(|| Error::model(format!("tree {} is missing `{}`", tree, key)))?;
    raw.split_whitespace()
        .map(|item| {
            item.parse()
                .map_err(|_| Error::model(format!("tree {}: bad `{}` value '{}'", tree, key, item)))
        })
        .collect()
}

impl Tree {
    fn parse(index: usize, block: &HashMap<&str, &str>) -> Result<Self> {
        let invalid = |msg: String| Error::model(format!("tree {}: {}", index, msg));

        let num_leaves = field::<usize>(block, "num_leaves", index)?
            .first()
            .copied()
            .ok_or_else(|| invalid("empty `num_leaves`".to_string()))?;
        let num_cat: usize = block.get("num_cat").and_then(|v| v.trim().parse().ok()).unwrap_or(0);
        if num_cat > 0 {
            return Err(invalid("categorical splits are not supported".to_string()));
        }
        if block.get("is_linear").map(|v| v.trim()) == Some("1") {
            return Err(invalid("linear trees are not supported".to_string()));
        }

        let leaf_value: Vec<f64> = field(block, "leaf_value", index)?;
        if num_leaves <= 1 {
            if leaf_value.is_empty() {
                return Err(invalid("no leaf values".to_string()));
            }
            return Ok(Self {
                leaf_value,
                split_feature: Vec::new(),
                threshold: Vec::new(),
                decision_type: Vec::new(),
                left_child: Vec::new(),
                right_child: Vec::new(),
            });
        }

        let tree = Self {
            leaf_value,
            split_feature: field(block, "split_feature", index)?,
            threshold: field(block, "threshold", index)?,
            decision_type: field(block, "decision_type", index)?,
            left_child: field(block, "left_child", index)?,
            right_child: field(block, "right_child", index)?,
        };

        let internal = num_leaves - 1;
        if tree.leaf_value.len() != num_leaves
            || tree.split_feature.len() != internal
            || tree.threshold.len() != internal
            || tree.decision_type.len() != internal
            || tree.left_child.len() != internal
            || tree.right_child.len() != internal
        {
            return Err(invalid("node arrays do not match `num_leaves`".to_string()));
        }

        // internal children follow their parent; leaves are encoded as !index
        let valid = |node: usize, child: i64| {
            if child >= 0 {
                child as usize > node && (child as usize) < internal
            } else {
                ((!child) as usize) < num_leaves
            }
        };
        for node in 0..internal {
            if !valid(node, tree.left_child[node]) || !valid(node, tree.right_child[node]) {
                return Err(invalid(format!("node {} has invalid children", node)));
            }
        }

        Ok(tree)
    }

    fn go_left(&self, node: usize, value: f64) -> bool {
        let decision = self.decision_type[node];
        let default_left = decision & DEFAULT_LEFT_MASK != 0;
        let missing = match (decision >> 2) & 3 {
            1 => MissingType::Zero,
            2 => MissingType::NaN,
            _ => MissingType::None,
        };

        let mut value = value;
        if value.is_nan() && missing != MissingType::NaN {
            value = 0.0;
        }
        if (missing == MissingType::Zero && value.abs() <= ZERO_THRESHOLD)
            || (missing == MissingType::NaN && value.is_nan())
        {
            return default_left;
        }
        value <= self.threshold[node]
    }

    fn leaf(&self, row: ArrayView1<f64>) -> f64 {
        if self.split_feature.is_empty() {
            return self.leaf_value[0];
        }

        let mut node: i64 = 0;
        while node >= 0 {
            let n = node as usize;
            let value = row.get(self.split_feature[n]).copied().unwrap_or(f64::NAN);
            node = if self.go_left(n, value) {
                self.left_child[n]
            } else {
                self.right_child[n]
            };
        }
        self.leaf_value[(!node) as usize]
    }
}

/// How raw scores become predictions
#[derive(Debug, Clone, PartialEq)]
enum Objective {
    Sigmoid(f64),
    Softmax,
    OneVsRest(f64),
    Exp,
    Identity,
}

impl Objective {
    fn parse(spec: &str) -> Self {
        let mut parts = spec.split_whitespace();
        let name = parts.next().unwrap_or_default();
        let params: HashMap<&str, &str> = parts.filter_map(|p| p.split_once(':')).collect();
        let sigmoid = params
            .get("sigmoid")
            .and_then(|v| v.parse().ok())
            .unwrap_or(1.0);

        match name {
            "binary" => Self::Sigmoid(sigmoid),
            "cross_entropy" | "xentropy" => Self::Sigmoid(1.0),
            "multiclass" | "softmax" => Self::Softmax,
            "multiclassova" | "multiclass_ova" | "ova" | "ovr" => Self::OneVsRest(sigmoid),
            "poisson" | "gamma" | "tweedie" => Self::Exp,
            _ => Self::Identity,
        }
    }
}

/// A numerical-split LightGBM booster
#[derive(Debug, Clone)]
pub struct LgbmModel {
    trees: Vec<Tree>,
    trees_per_iteration: usize,
    num_features: Option<usize>,
    objective: Objective,
    objective_spec: String,
    average_output: bool,
}

/// Registry loader
pub fn load(path: &Path) -> Result<ModelHandle> {
    Ok(Arc::new(LgbmModel::from_file(path)?))
}

impl LgbmModel {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut header: HashMap<&str, &str> = HashMap::new();
        let mut flags: Vec<&str> = Vec::new();
        let mut blocks: Vec<HashMap<&str, &str>> = Vec::new();

        for line in text.lines().map(str::trim) {
            if line == "end of trees" {
                break;
            }
            if line.is_empty() {
                continue;
            }
            match line.split_once('=') {
                Some(("Tree", _)) => blocks.push(HashMap::new()),
                Some((key, value)) => match blocks.last_mut() {
                    Some(block) => {
                        block.insert(key, value);
                    }
                    None => {
                        header.insert(key, value);
                    }
                },
                None if blocks.is_empty() => flags.push(line),
                None => {}
            }
        }

        if !flags.contains(&"tree") && header.is_empty() {
            return Err(Error::model("not a LightGBM text model"));
        }
        if blocks.is_empty() {
            return Err(Error::model("model has no trees"));
        }

        let number = |key: &str| header.get(key).and_then(|v| v.trim().parse::<usize>().ok());
        let trees_per_iteration = number("num_tree_per_iteration")
            .or_else(|| number("num_class"))
            .unwrap_or(1)
            .max(1);

        let trees = blocks
            .iter()
            .enumerate()
            .map(|(i, block)| Tree::parse(i, block))
            .collect::<Result<Vec<_>>>()?;

        let objective_spec = header.get("objective").copied().unwrap_or("regression").to_string();
        Ok(Self {
            trees,
            trees_per_iteration,
            num_features: number("max_feature_idx").map(|max| max + 1),
            objective: Objective::parse(&objective_spec),
            objective_spec,
            average_output: flags.contains(&"average_output"),
        })
    }

    pub fn num_trees(&self) -> usize {
        self.trees.len()
    }

    /// Raw scores, one column per class
    pub fn raw_scores(&self, x: &Array2<f64>) -> Result<Array2<f64>> {
        if let Some(expected) = self.num_features {
            check_features(x, expected)?;
        }

        let k = self.trees_per_iteration;
        let mut scores = Array2::zeros((x.nrows(), k));
        for (i, tree) in self.trees.iter().enumerate() {
            for (r, row) in x.rows().into_iter().enumerate() {
                scores[[r, i % k]] += tree.leaf(row);
            }
        }

        if self.average_output {
            let iterations = (self.trees.len() / k).max(1) as f64;
            scores.mapv_inplace(|s| s / iterations);
        }
        Ok(scores)
    }

    pub fn predict_matrix(&self, x: &Array2<f64>) -> Result<Payload> {
        let mut scores = self.raw_scores(x)?;

        match self.objective {
            Objective::Sigmoid(k) | Objective::OneVsRest(k) => {
                scores.mapv_inplace(|s| sigmoid(k * s))
            }
            Objective::Softmax => softmax_rows(&mut scores),
            Objective::Exp => scores.mapv_inplace(f64::exp),
            Objective::Identity => {}
        }
        Ok(scores_payload(scores))
    }
}

#[async_trait]
impl Model for LgbmModel {
    async fn predict(&self, data: Payload) -> Result<Payload> {
        self.predict_matrix(&feature_matrix(&data)?)
    }

    fn describe(&self) -> String {
        format!("lightgbm:{} ({} trees)", self.objective_spec, self.trees.len())
    }
}
