//! Class index → clinical label convention.
//!
//! The specialist was trained from one directory per class, enumerated in
//! alphabetical order, so the output vector is ordered `["DR", "No_DR"]`:
//!
//! | index | class   | label                      |
//! |-------|---------|----------------------------|
//! | 0     | `DR`    | [`RetinaLabel::Positive`]  |
//! | 1     | `No_DR` | [`RetinaLabel::Negative`]  |
//!
//! Getting this backwards silently flips the medical meaning of every
//! result, so the mapping is built from class names and checked against the
//! model's own class list when one ships next to the model file.

use serde::{Deserialize, Serialize};

use super::ClassifierError;

pub const POSITIVE_CLASS: &str = "DR";
pub const NEGATIVE_CLASS: &str = "No_DR";

/// Clinical meaning of a classifier output
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum RetinaLabel {
    /// Diabetic retinopathy detected
    #[serde(rename = "DR_DETECTADA")]
    Positive,
    /// No diabetic retinopathy
    #[serde(rename = "NO_DR")]
    Negative,
}

impl RetinaLabel {
    /// Wire status string
    pub fn status(self) -> &'static str {
        match self {
            RetinaLabel::Positive => "DR_DETECTADA",
            RetinaLabel::Negative => "NO_DR",
        }
    }

    pub fn from_status(status: &str) -> Option<Self> {
        match status {
            "DR_DETECTADA" => Some(RetinaLabel::Positive),
            "NO_DR" => Some(RetinaLabel::Negative),
            _ => None,
        }
    }

    /// Recognize a training class directory name
    fn from_class_name(name: &str) -> Option<Self> {
        let key: String = name
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect();
        match key.as_str() {
            "dr" | "drdetectada" => Some(RetinaLabel::Positive),
            "nodr" => Some(RetinaLabel::Negative),
            _ => None,
        }
    }
}

impl std::fmt::Display for RetinaLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.status())
    }
}

/// Ordered class list of the loaded model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelMapping {
    classes: Vec<(String, RetinaLabel)>,
}

impl Default for LabelMapping {
    fn default() -> Self {
        Self {
            classes: vec![
                (POSITIVE_CLASS.to_string(), RetinaLabel::Positive),
                (NEGATIVE_CLASS.to_string(), RetinaLabel::Negative),
            ],
        }
    }
}

impl LabelMapping {
    /// Build the mapping from class names in model output order.
    ///
    /// Exactly two names are accepted, one per label.
    pub fn from_class_names<S: AsRef<str>>(names: &[S]) -> Result<Self, ClassifierError> {
        if names.len() != 2 {
            return Err(ClassifierError::LabelMismatch(format!(
                "binary specialist needs exactly 2 classes, got {}",
                names.len()
            )));
        }

        let mut classes = Vec::with_capacity(2);
        for name in names {
            let name = name.as_ref();
            let label = RetinaLabel::from_class_name(name).ok_or_else(|| {
                ClassifierError::LabelMismatch(format!("unrecognized class name '{name}'"))
            })?;
            if classes.iter().any(|(_, l)| *l == label) {
                return Err(ClassifierError::LabelMismatch(format!(
                    "class '{name}' maps to {label} twice"
                )));
            }
            classes.push((name.to_string(), label));
        }
        Ok(Self { classes })
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn label_for(&self, index: usize) -> Option<RetinaLabel> {
        self.classes.get(index).map(|(_, label)| *label)
    }

    pub fn index_of(&self, label: RetinaLabel) -> Option<usize> {
        self.classes.iter().position(|(_, l)| *l == label)
    }

    pub fn class_names(&self) -> impl Iterator<Item = &str> {
        self.classes.iter().map(|(name, _)| name.as_str())
    }

    /// Verify the model reports the same ordering as this mapping
    pub fn check_model_classes(&self, model_classes: &[String]) -> Result<(), ClassifierError> {
        let reported = Self::from_class_names(model_classes)?;
        let ours: Vec<RetinaLabel> = self.classes.iter().map(|(_, l)| *l).collect();
        let theirs: Vec<RetinaLabel> = reported.classes.iter().map(|(_, l)| *l).collect();
        if ours != theirs {
            return Err(ClassifierError::LabelMismatch(format!(
                "configured order {:?} disagrees with model order {:?}",
                self.class_names().collect::<Vec<_>>(),
                model_classes
            )));
        }
        Ok(())
    }
}
