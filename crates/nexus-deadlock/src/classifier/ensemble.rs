//! Inference for tree-ensemble models exported as JSON.
//!
//! ```json
//! {
//!   "mode": "sum_logit",
//!   "base_score": 0.0,
//!   "threshold": 0.5,
//!   "trees": [
//!     [
//!       {"split": {"feature": "lock_requested", "threshold": 0.5, "left": 1, "right": 2}},
//!       {"leaf": -2.0},
//!       {"leaf": 1.5}
//!     ]
//!   ]
//! }
//! ```
//!
//! Each tree is a flat node list rooted at index 0. A split sends the sample
//! left when `feature < threshold`; booleans read as 0.0 / 1.0. Child indices
//! must point forward, which rules out loops.

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{AnomalyClassifier, TxnFeatures};
use crate::error::{ClassifierError, ClassifierResult};

/// Feature a split node tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitFeature {
    /// `lock_held` as 0.0 or 1.0.
    LockHeld,
    /// `lock_requested` as 0.0 or 1.0.
    LockRequested,
    /// `time_interval_secs`.
    TimeIntervalSecs,
}

impl SplitFeature {
    fn value(self, features: &TxnFeatures) -> f64 {
        match self {
            SplitFeature::LockHeld => f64::from(u8::from(features.lock_held)),
            SplitFeature::LockRequested => f64::from(u8::from(features.lock_requested)),
            SplitFeature::TimeIntervalSecs => features.time_interval_secs,
        }
    }
}

/// One node of a decision tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TreeNode {
    /// Internal node.
    Split {
        /// Feature to test.
        feature: SplitFeature,
        /// Go left when the feature is below this value.
        threshold: f64,
        /// Index of the left child.
        left: usize,
        /// Index of the right child.
        right: usize,
    },
    /// Terminal node with the tree's output.
    Leaf(f64),
}

/// How tree outputs combine into a prediction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    /// Gradient boosting: `sigmoid(base_score + sum(leaves)) >= threshold`.
    #[default]
    SumLogit,
    /// Random forest: the share of trees whose leaf is at least 0.5 must
    /// reach `threshold`.
    Vote,
}

fn default_threshold() -> f64 {
    0.5
}

/// A validated tree-ensemble classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeEnsemble {
    trees: Vec<Vec<TreeNode>>,
    #[serde(default)]
    base_score: f64,
    #[serde(default = "default_threshold")]
    threshold: f64,
    #[serde(default)]
    mode: Aggregation,
}

impl TreeEnsemble {
    /// Creates an ensemble and validates it.
    pub fn new(trees: Vec<Vec<TreeNode>>, mode: Aggregation) -> ClassifierResult<Self> {
        let ensemble = Self {
            trees,
            base_score: 0.0,
            threshold: default_threshold(),
            mode,
        };
        ensemble.validate()?;
        Ok(ensemble)
    }

    /// Sets the initial score added before the sigmoid.
    pub fn with_base_score(mut self, base_score: f64) -> ClassifierResult<Self> {
        self.base_score = base_score;
        self.validate()?;
        Ok(self)
    }

    /// Sets the decision threshold.
    pub fn with_threshold(mut self, threshold: f64) -> ClassifierResult<Self> {
        self.threshold = threshold;
        self.validate()?;
        Ok(self)
    }

    /// Parses and validates a JSON model.
    pub fn from_json(json: &str) -> ClassifierResult<Self> {
        let ensemble: Self = serde_json::from_str(json)?;
        ensemble.validate()?;
        Ok(ensemble)
    }

    /// Loads and validates a JSON model file.
    pub fn from_file(path: &Path) -> ClassifierResult<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Returns the number of trees.
    pub fn tree_count(&self) -> usize {
        self.trees.len()
    }

    /// Returns the aggregation mode.
    pub fn mode(&self) -> Aggregation {
        self.mode
    }

    /// Returns the raw ensemble score: the probability for `SumLogit`, the
    /// positive vote share for `Vote`.
    pub fn score(&self, features: &TxnFeatures) -> ClassifierResult<f64> {
        if !features.time_interval_secs.is_finite() {
            return Err(ClassifierError::unavailable("non-finite time interval"));
        }

        let mut leaves = Vec::with_capacity(self.trees.len());
        for tree in &self.trees {
            leaves.push(Self::evaluate_tree(tree, features)?);
        }

        let score = match self.mode {
            Aggregation::SumLogit => {
                let logit = self.base_score + leaves.iter().sum::<f64>();
                1.0 / (1.0 + (-logit).exp())
            }
            Aggregation::Vote => {
                let votes = leaves.iter().filter(|&&leaf| leaf >= 0.5).count();
                votes as f64 / leaves.len() as f64
            }
        };
        Ok(score)
    }

    fn evaluate_tree(tree: &[TreeNode], features: &TxnFeatures) -> ClassifierResult<f64> {
        let mut index = 0;
        loop {
            match tree.get(index) {
                Some(TreeNode::Leaf(value)) => return Ok(*value),
                Some(TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                }) => {
                    index = if feature.value(features) < *threshold {
                        *left
                    } else {
                        *right
                    };
                }
                None => {
                    return Err(ClassifierError::unavailable(format!(
                        "node {} out of range",
                        index
                    )))
                }
            }
        }
    }

    fn validate(&self) -> ClassifierResult<()> {
        if self.trees.is_empty() {
            return Err(ClassifierError::invalid_model("ensemble has no trees"));
        }
        if !self.base_score.is_finite() {
            return Err(ClassifierError::invalid_model("base_score must be finite"));
        }
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(ClassifierError::invalid_model(
                "threshold must be between 0 and 1",
            ));
        }

        for (t, tree) in self.trees.iter().enumerate() {
            if tree.is_empty() {
                return Err(ClassifierError::invalid_model(format!(
                    "tree {} has no nodes",
                    t
                )));
            }
            for (i, node) in tree.iter().enumerate() {
                match node {
                    TreeNode::Leaf(value) if !value.is_finite() => {
                        return Err(ClassifierError::invalid_model(format!(
                            "tree {} node {}: leaf value must be finite",
                            t, i
                        )));
                    }
                    TreeNode::Leaf(_) => {}
                    TreeNode::Split {
                        threshold,
                        left,
                        right,
                        ..
                    } => {
                        if !threshold.is_finite() {
                            return Err(ClassifierError::invalid_model(format!(
                                "tree {} node {}: split threshold must be finite",
                                t, i
                            )));
                        }
                        for child in [*left, *right] {
                            if child <= i || child >= tree.len() {
                                return Err(ClassifierError::invalid_model(format!(
                                    "tree {} node {}: child {} must point forward within the tree",
                                    t, i, child
                                )));
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

impl AnomalyClassifier for TreeEnsemble {
    fn predict(&self, features: &TxnFeatures) -> ClassifierResult<bool> {
        Ok(self.score(features)? >= self.threshold)
    }

    fn name(&self) -> &str {
        "tree-ensemble"
    }
}
