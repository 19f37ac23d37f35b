//! Explicit feedback on recalled records.
//!
//! Feedback moves a record's importance by `sign(label) · weight · step`,
//! clamped to `[0, 1]` inside one SQL update. `useful` feedback also nudges
//! the record's activation.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;

use crate::error::{MemoryError, Result};
use crate::memory::activation::ActivationEngine;
use crate::memory::store::RecordStore;
use crate::memory::types::{validate_unit, FeedbackLabel, Scope};

#[derive(Debug, Clone, Copy)]
pub struct FeedbackParams {
    /// Importance change for weight 1.0.
    pub step: f64,
    /// Activation added per unit of `useful` weight.
    pub activation_boost: f64,
}

impl Default for FeedbackParams {
    fn default() -> Self {
        Self {
            step: 0.1,
            activation_boost: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedbackOutcome {
    pub id: String,
    pub label: FeedbackLabel,
    pub previous_importance: f64,
    pub importance: f64,
    /// Activation after the nudge; `None` when the label does not nudge.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activation: Option<f64>,
}

pub struct RecallScorer {
    store: Arc<RecordStore>,
    activation: Arc<ActivationEngine>,
    params: FeedbackParams,
}

impl RecallScorer {
    pub fn new(store: Arc<RecordStore>, activation: Arc<ActivationEngine>, params: FeedbackParams) -> Self {
        Self {
            store,
            activation,
            params,
        }
    }

    pub fn apply_feedback(
        &self,
        owner: &str,
        scope: Scope,
        key: &str,
        label: FeedbackLabel,
        weight: f64,
    ) -> Result<FeedbackOutcome> {
        validate_unit("weight", weight)?;
        let record = self
            .store
            .get(owner, scope, key)?
            .ok_or_else(|| MemoryError::not_found(format!("{owner}/{scope}/{key}")))?;

        let delta = label.sign() * weight * self.params.step;
        let details = serde_json::json!({
            "label": label.as_str(),
            "weight": weight,
            "delta": delta,
        });
        let updated = self.store.adjust_importance(&record.id, delta, &details)?;

        let activation = match label {
            FeedbackLabel::Useful => Some(self.activation.nudge(
                owner,
                &record.id,
                weight * self.params.activation_boost,
                Utc::now(),
            )),
            FeedbackLabel::Irrelevant | FeedbackLabel::Outdated => None,
        };

        tracing::debug!(
            id = %record.id,
            label = label.as_str(),
            from = record.importance,
            to = updated.importance,
            "feedback applied"
        );

        Ok(FeedbackOutcome {
            id: record.id,
            label,
            previous_importance: record.importance,
            importance: updated.importance,
            activation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::store::{NewRecord, StoreLimits};

    fn scorer() -> (RecallScorer, Arc<RecordStore>) {
        let store = Arc::new(RecordStore::open_in_memory(StoreLimits::default()).unwrap());
        let scorer = RecallScorer::new(
            Arc::clone(&store),
            Arc::new(ActivationEngine::default()),
            FeedbackParams::default(),
        );
        (scorer, store)
    }

    #[test]
    fn useful_raises_importance_and_activation() {
        let (scorer, store) = scorer();
        store.put(NewRecord::new("u", Scope::Persistent, "k", "v")).unwrap();

        let outcome = scorer
            .apply_feedback("u", Scope::Persistent, "k", FeedbackLabel::Useful, 1.0)
            .unwrap();
        assert!((outcome.importance - 0.6).abs() < 1e-9);
        assert!((outcome.activation.unwrap() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn negative_labels_lower_importance() {
        let (scorer, store) = scorer();
        store.put(NewRecord::new("u", Scope::Persistent, "k", "v")).unwrap();

        let outcome = scorer
            .apply_feedback("u", Scope::Persistent, "k", FeedbackLabel::Outdated, 0.5)
            .unwrap();
        assert!((outcome.importance - 0.45).abs() < 1e-9);
        assert!(outcome.activation.is_none());
    }

    #[test]
    fn weight_out_of_range_is_rejected() {
        let (scorer, store) = scorer();
        store.put(NewRecord::new("u", Scope::Persistent, "k", "v")).unwrap();
        let err = scorer
            .apply_feedback("u", Scope::Persistent, "k", FeedbackLabel::Useful, 1.5)
            .unwrap_err();
        assert!(matches!(err, MemoryError::Validation(_)));
    }

    #[test]
    fn unknown_key_is_not_found() {
        let (scorer, _store) = scorer();
        let err = scorer
            .apply_feedback("u", Scope::Persistent, "nope", FeedbackLabel::Useful, 0.5)
            .unwrap_err();
        assert!(matches!(err, MemoryError::NotFound(_)));
    }

    #[test]
    fn importance_never_leaves_unit_interval() {
        let (scorer, store) = scorer();
        store.put(NewRecord::new("u", Scope::Persistent, "k", "v")).unwrap();
        for _ in 0..30 {
            scorer
                .apply_feedback("u", Scope::Persistent, "k", FeedbackLabel::Useful, 1.0)
                .unwrap();
        }
        let record = store.get("u", Scope::Persistent, "k").unwrap().unwrap();
        assert_eq!(record.importance, 1.0);
    }
}
