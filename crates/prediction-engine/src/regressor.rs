//! Per-country regressors.
//!
//! Trained artifacts are opaque; the engine depends only on "produces a
//! scalar delta from a fixed-length feature vector". The tagged variant
//! picks the implementation per artifact kind at load time.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Regressor {
    GradientBoosted(GradientBoostedTrees),
    Linear(LinearModel),
}

impl Regressor {
    pub fn predict(&self, features: &[f64]) -> f64 {
        match self {
            Regressor::GradientBoosted(model) => model.predict(features),
            Regressor::Linear(model) => model.predict(features),
        }
    }

    /// Structural check against the bundle's feature count; loading refuses
    /// malformed trees so prediction never has to.
    pub fn validate(&self, n_features: usize) -> Result<(), String> {
        match self {
            Regressor::GradientBoosted(model) => model.validate(n_features),
            Regressor::Linear(model) => model.validate(n_features),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearModel {
    pub intercept: f64,
    pub coefficients: Vec<f64>,
}

impl LinearModel {
    pub fn predict(&self, features: &[f64]) -> f64 {
        self.intercept
            + self
                .coefficients
                .iter()
                .zip(features)
                .map(|(c, x)| c * x)
                .sum::<f64>()
    }

    fn validate(&self, n_features: usize) -> Result<(), String> {
        if self.coefficients.len() != n_features {
            return Err(format!(
                "linear model has {} coefficients, bundle has {n_features} features",
                self.coefficients.len()
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradientBoostedTrees {
    pub base_score: f64,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    pub trees: Vec<DecisionTree>,
}

fn default_learning_rate() -> f64 {
    1.0
}

impl GradientBoostedTrees {
    pub fn predict(&self, features: &[f64]) -> f64 {
        let boosted: f64 = self.trees.iter().map(|tree| tree.evaluate(features)).sum();
        self.base_score + self.learning_rate * boosted
    }

    fn validate(&self, n_features: usize) -> Result<(), String> {
        for (t, tree) in self.trees.iter().enumerate() {
            tree.validate(n_features)
                .map_err(|e| format!("tree {t}: {e}"))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionTree {
    pub nodes: Vec<TreeNode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TreeNode {
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    Leaf {
        value: f64,
    },
}

impl DecisionTree {
    /// Walk from the root. Validation guarantees child indices point
    /// forward, so the walk terminates.
    fn evaluate(&self, features: &[f64]) -> f64 {
        let mut index = 0;
        loop {
            match &self.nodes[index] {
                TreeNode::Leaf { value } => return *value,
                TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    index = if features[*feature] <= *threshold {
                        *left
                    } else {
                        *right
                    };
                }
            }
        }
    }

    fn validate(&self, n_features: usize) -> Result<(), String> {
        if self.nodes.is_empty() {
            return Err("empty tree".to_string());
        }
        for (i, node) in self.nodes.iter().enumerate() {
            if let TreeNode::Split {
                feature,
                left,
                right,
                ..
            } = node
            {
                if *feature >= n_features {
                    return Err(format!("node {i} splits on feature {feature}"));
                }
                // Children must point forward to rule out cycles.
                if *left <= i || *right <= i || *left >= self.nodes.len() || *right >= self.nodes.len()
                {
                    return Err(format!("node {i} has invalid children {left}/{right}"));
                }
            }
        }
        Ok(())
    }
}
