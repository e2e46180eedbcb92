//! # Forecast Models and Rollout
//!
//! A [`ForecastModel`] turns one [`Batch`] into a prediction one lead time
//! ahead. [`rollout`] feeds each prediction back as the newest history step,
//! producing a finite sequence of forecasts:
//!
//! ```text
//! input  [t-1, t]      -> predict t+1
//! input  [t, t+1]      -> predict t+2
//! ...
//! ```
//!
//! The pretrained network itself is an external collaborator that plugs in
//! through the trait; [`PersistenceModel`] is the built-in baseline.

use crate::batch::{Batch, Metadata};
use chrono::Duration;
use log::{debug, info};
use ndarray::{Axis, ShapeError, concatenate};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Model '{model}' failed: {reason}")]
    Prediction { model: String, reason: String },

    #[error("Prediction is missing variable '{0}'")]
    MissingVariable(String),

    #[error("Cannot append prediction to history: {0}")]
    Shape(#[from] ShapeError),

    #[error("Batch has no timestamp")]
    MissingTime,
}

pub type ModelResult<T> = Result<T, ModelError>;

pub trait ForecastModel {
    fn name(&self) -> &str;

    /// Time between an input's current step and the predicted step
    fn lead_time(&self) -> Duration;

    /// Predicts the state one lead time after `batch`'s current step.
    ///
    /// The returned batch has a time axis of length one.
    fn predict(&self, batch: &Batch) -> ModelResult<Batch>;
}

/// Predicts that nothing changes: the current step is returned as the forecast.
#[derive(Debug, Clone)]
pub struct PersistenceModel {
    lead_time: Duration,
}

impl PersistenceModel {
    pub fn new(lead_time: Duration) -> Self {
        Self { lead_time }
    }
}

impl Default for PersistenceModel {
    fn default() -> Self {
        Self::new(Duration::hours(6))
    }
}

impl ForecastModel for PersistenceModel {
    fn name(&self) -> &str {
        "persistence"
    }

    fn lead_time(&self) -> Duration {
        self.lead_time
    }

    fn predict(&self, batch: &Batch) -> ModelResult<Batch> {
        let mut prediction = batch.tail(1);
        prediction.metadata = advance(&batch.metadata, self.lead_time)?;
        Ok(prediction)
    }
}

/// Lazily evaluated forecast sequence returned by [`rollout`].
///
/// Yields at most `steps` predictions; the first error is yielded and ends
/// the sequence.
pub struct Rollout<'a, M: ForecastModel + ?Sized> {
    model: &'a M,
    input: Option<Batch>,
    remaining: usize,
    step: usize,
}

pub fn rollout<M: ForecastModel + ?Sized>(model: &M, batch: Batch, steps: usize) -> Rollout<'_, M> {
    info!("Rolling out {} for {} steps", model.name(), steps);
    Rollout {
        model,
        input: Some(batch),
        remaining: steps,
        step: 0,
    }
}

impl<M: ForecastModel + ?Sized> Iterator for Rollout<'_, M> {
    type Item = ModelResult<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let input = self.input.take()?;
        self.remaining -= 1;
        self.step += 1;

        let result = self.model.predict(&input).and_then(|mut prediction| {
            prediction.metadata = advance(&input.metadata, self.model.lead_time())?;
            prediction.static_vars = input.static_vars.clone();
            if self.remaining > 0 {
                self.input = Some(append_prediction(&input, &prediction)?);
            }
            Ok(prediction)
        });

        match &result {
            Ok(prediction) => debug!("Rollout step {} at {:?}", self.step, prediction.time()),
            Err(_) => self.remaining = 0,
        }
        Some(result)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining))
    }
}

/// Next model input: the history minus its oldest step, then the prediction.
fn append_prediction(input: &Batch, prediction: &Batch) -> ModelResult<Batch> {
    let keep = input.history_len().saturating_sub(prediction.history_len()).max(1);
    let history = input.tail(keep);

    let mut surf_vars = BTreeMap::new();
    for (key, past) in &history.surf_vars {
        let next = prediction
            .surf_vars
            .get(key)
            .ok_or_else(|| ModelError::MissingVariable(key.clone()))?;
        surf_vars.insert(key.clone(), concatenate(Axis(1), &[past.view(), next.view()])?);
    }

    let mut atmos_vars = BTreeMap::new();
    for (key, past) in &history.atmos_vars {
        let next = prediction
            .atmos_vars
            .get(key)
            .ok_or_else(|| ModelError::MissingVariable(key.clone()))?;
        atmos_vars.insert(key.clone(), concatenate(Axis(1), &[past.view(), next.view()])?);
    }

    Ok(Batch {
        surf_vars,
        static_vars: input.static_vars.clone(),
        atmos_vars,
        metadata: prediction.metadata.clone(),
    })
}

fn advance(metadata: &Metadata, lead_time: Duration) -> ModelResult<Metadata> {
    if metadata.time.is_empty() {
        return Err(ModelError::MissingTime);
    }
    Ok(Metadata {
        time: metadata.time.iter().map(|t| *t + lead_time).collect(),
        ..metadata.clone()
    })
}
