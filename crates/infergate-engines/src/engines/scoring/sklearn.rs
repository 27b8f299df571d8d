//! Linear estimators exported from scikit-learn
//!
//! The export is a JSON object holding the fitted attributes:
//!
//! ```json
//! {
//!   "estimator": "LogisticRegression",
//!   "coef": [[0.5, -1.2]],
//!   "intercept": [0.1],
//!   "classes": [0, 1]
//! }
//! ```
//!
//! Without `classes` the model is a regressor.

use super::{check_features, f64_array, feature_matrix, scores_payload};
use crate::engine::{Model, ModelHandle};
use async_trait::async_trait;
use infergate_core::{Error, Payload, Result};
use ndarray::{Array1, Array2, Axis};
use serde::Deserialize;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
struct LinearExport {
    #[serde(default)]
    estimator: Option<String>,
    coef: Value,
    #[serde(default)]
    intercept: Option<Value>,
    #[serde(default)]
    classes: Option<Vec<Value>>,
}

/// A fitted linear model
#[derive(Debug, Clone)]
pub struct LinearModel {
    estimator: String,
    /// One row per target (or per class)
    coef: Array2<f64>,
    intercept: Array1<f64>,
    classes: Option<Vec<Value>>,
}

/// Registry loader
pub fn load(path: &Path) -> Result<ModelHandle> {
    Ok(Arc::new(LinearModel::from_file(path)?))
}

impl LinearModel {
    pub fn from_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Self::from_slice(&bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let export: LinearExport = serde_json::from_slice(bytes)
            .map_err(|e| Error::model(format!("not a linear model export: {}", e)))?;

        let coef = f64_array(&export.coef)?;
        let coef = match coef.ndim() {
            1 => {
                let n = coef.len();
                coef.into_shape_with_order((1, n))
            }
            _ => coef.into_dimensionality(),
        }
        .map_err(|e| Error::model(format!("`coef` must be a vector or matrix: {}", e)))?;

        let targets = coef.nrows();
        let intercept = match &export.intercept {
            None => Array1::zeros(targets),
            Some(value) => {
                let values: Vec<f64> = f64_array(value)?.iter().copied().collect();
                match values.len() {
                    1 => Array1::from_elem(targets, values[0]),
                    n if n == targets => Array1::from_vec(values),
                    n => {
                        return Err(Error::model(format!(
                            "`intercept` has {} values for {} targets",
                            n, targets
                        )))
                    }
                }
            }
        };

        if let Some(classes) = &export.classes {
            let expected = if classes.len() == 2 { 1 } else { classes.len() };
            if classes.len() < 2 || targets != expected {
                return Err(Error::model(format!(
                    "{} classes do not match {} coefficient rows",
                    classes.len(),
                    targets
                )));
            }
        }

        Ok(Self {
            estimator: export.estimator.unwrap_or_else(|| "linear".to_string()),
            coef,
            intercept,
            classes: export.classes,
        })
    }

    pub fn n_features(&self) -> usize {
        self.coef.ncols()
    }

    pub fn is_classifier(&self) -> bool {
        self.classes.is_some()
    }

    /// `X · coefᵀ + intercept`, one column per target
    pub fn decision_function(&self, x: &Array2<f64>) -> Result<Array2<f64>> {
        check_features(x, self.n_features())?;
        Ok(x.dot(&self.coef.t()) + &self.intercept)
    }

    fn predict_matrix(&self, x: &Array2<f64>) -> Result<Payload> {
        let decision = self.decision_function(x)?;

        let Some(classes) = &self.classes else {
            return Ok(scores_payload(decision));
        };

        let labels = if decision.ncols() == 1 {
            decision
                .index_axis(Axis(1), 0)
                .iter()
                .map(|&d| classes[usize::from(d > 0.0)].clone())
                .collect()
        } else {
            super::argmax_rows(&decision)
                .into_iter()
                .map(|i| classes[i].clone())
                .collect()
        };
        Ok(Payload::Json(Value::Array(labels)))
    }
}

#[async_trait]
impl Model for LinearModel {
    async fn predict(&self, data: Payload) -> Result<Payload> {
        self.predict_matrix(&feature_matrix(&data)?)
    }

    fn describe(&self) -> String {
        format!("sklearn:{}", self.estimator)
    }
}
