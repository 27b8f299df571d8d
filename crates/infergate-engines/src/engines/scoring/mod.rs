//! In-process scoring library backends
//!
//! `sklearn`, `xgboost` and `lightgbm` share one contract: use the model a
//! plugin's load hook produced, or else load the endpoint's model file in
//! the library's native format, and return `predict` unchanged.

pub mod lightgbm;
pub mod sklearn;
pub mod xgboost;

use crate::engine::{Engine, EngineContext, EngineFuture, ModelHandle};
use async_trait::async_trait;
use infergate_core::{ElementType, EngineKind, Error, Payload, Result, StatsSink, TensorData};
use ndarray::{Array2, ArrayD};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Reads a model file into a handle
pub type NativeLoader = fn(&Path) -> Result<ModelHandle>;

/// Engine scoring requests with a loaded model
pub struct ScoringEngine {
    kind: EngineKind,
    model: ModelHandle,
}

impl ScoringEngine {
    pub fn with_model(kind: EngineKind, model: ModelHandle) -> Self {
        Self { kind, model }
    }

    /// Use the plugin's model, or load the endpoint's model file with `loader`
    pub async fn load(ctx: EngineContext, kind: EngineKind, loader: NativeLoader) -> Result<Self> {
        if let Some(model) = ctx.model {
            debug!("Using plugin-provided model {} for {}", model.describe(), kind);
            return Ok(Self::with_model(kind, model));
        }

        let model_id = ctx.endpoint.require_model_id()?;
        let path = ctx.models.local_model_path(model_id).await?;

        let model = {
            let path = path.clone();
            tokio::task::spawn_blocking(move || loader(&path))
                .await
                .map_err(|e| Error::internal(format!("model load task failed: {}", e)))??
        };

        info!("Loaded {} model '{}' from {}", kind, model_id, path.display());
        Ok(Self::with_model(kind, model))
    }

    pub fn model(&self) -> &ModelHandle {
        &self.model
    }
}

#[async_trait]
impl Engine for ScoringEngine {
    async fn process(&self, data: Payload, _stats: &StatsSink) -> Result<Payload> {
        self.model.predict(data).await
    }

    fn kind(&self) -> EngineKind {
        self.kind.clone()
    }
}

fn construct(ctx: EngineContext, kind: EngineKind, loader: NativeLoader) -> EngineFuture {
    Box::pin(async move {
        Ok(Arc::new(ScoringEngine::load(ctx, kind, loader).await?) as Arc<dyn Engine>)
    })
}

pub fn construct_sklearn(ctx: EngineContext) -> EngineFuture {
    construct(ctx, EngineKind::Sklearn, sklearn::load)
}

pub fn construct_xgboost(ctx: EngineContext) -> EngineFuture {
    construct(ctx, EngineKind::XgBoost, xgboost::load)
}

pub fn construct_lightgbm(ctx: EngineContext) -> EngineFuture {
    construct(ctx, EngineKind::LightGbm, lightgbm::load)
}

/// JSON numbers (or nested arrays of them) as an `f64` array
pub(crate) fn f64_array(value: &Value) -> Result<ArrayD<f64>> {
    match TensorData::from_json(ElementType::Float64, value)? {
        TensorData::Float64(array) => Ok(array),
        other => Err(Error::internal(format!(
            "expected float64 data, got {}",
            other.element_type()
        ))),
    }
}

/// Request data as a row-major feature matrix; a flat row is one sample
pub fn feature_matrix(data: &Payload) -> Result<Array2<f64>> {
    let array = match data.to_tensor(ElementType::Float64)? {
        TensorData::Float64(array) => array,
        other => {
            return Err(Error::internal(format!(
                "expected float64 data, got {}",
                other.element_type()
            )))
        }
    };

    let shape_error =
        |e: ndarray::ShapeError| Error::invalid_payload(format!("bad feature matrix: {}", e));
    match array.ndim() {
        0 | 1 => {
            let len = array.len();
            array.into_shape_with_order((1, len)).map_err(shape_error)
        }
        2 => array.into_dimensionality().map_err(shape_error),
        ndim => Err(Error::invalid_payload(format!(
            "expected a row or a matrix of features, got {} dimensions",
            ndim
        ))),
    }
}

pub(crate) fn check_features(x: &Array2<f64>, expected: usize) -> Result<()> {
    if x.ncols() != expected {
        return Err(Error::invalid_payload(format!(
            "expected {} features, got {}",
            expected,
            x.ncols()
        )));
    }
    Ok(())
}

pub(crate) fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

pub(crate) fn softmax_rows(scores: &mut Array2<f64>) {
    for mut row in scores.rows_mut() {
        let max = row.fold(f64::NEG_INFINITY, |acc, &v| acc.max(v));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|v| v / sum);
    }
}

pub(crate) fn argmax_rows(scores: &Array2<f64>) -> Vec<usize> {
    scores
        .rows()
        .into_iter()
        .map(|row| {
            row.iter()
                .enumerate()
                .fold((0, f64::NEG_INFINITY), |best, (i, &v)| {
                    if v > best.1 {
                        (i, v)
                    } else {
                        best
                    }
                })
                .0
        })
        .collect()
}

/// One column becomes a flat array, several stay a matrix
pub(crate) fn scores_payload(scores: Array2<f64>) -> Payload {
    if scores.ncols() == 1 {
        Payload::Array(TensorData::Float64(scores.column(0).to_owned().into_dyn()))
    } else {
        Payload::Array(TensorData::Float64(scores.into_dyn()))
    }
}
