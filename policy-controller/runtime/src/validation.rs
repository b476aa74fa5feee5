//! Validates converted policies before they are enforced.
//!
//! Validation runs in three stages over the whole batch. The syntactic stage
//! checks each rendered document against a schema for its kind. Only when it
//! finds nothing do the referential stage (do the objects the policy refers
//! to exist?) and the property stage (does the policy describe what the
//! selected pods actually do?) run.

mod property;
mod referential;
mod syntactic;

pub use self::syntactic::SchemaRegistry;

use crate::{core::StructuredPolicy, SharedCluster};
use std::{fmt, sync::Arc};
use tracing::{debug, info};

#[derive(Clone)]
pub struct Validator {
    cluster: SharedCluster,
    schemas: Arc<SchemaRegistry>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    Syntactic,
    Referential,
    Property,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{stage} check of {policy} failed: {message}")]
pub struct ValidationError {
    pub stage: Stage,
    pub policy: String,
    pub message: String,
}

/// Errors found by each stage. The referential and property stages are
/// empty when the syntactic stage failed.
#[derive(Clone, Debug, Default)]
pub struct Report {
    pub syntactic: Vec<ValidationError>,
    pub referential: Vec<ValidationError>,
    pub property: Vec<ValidationError>,
}

// === impl Validator ===

impl Validator {
    pub fn new(cluster: SharedCluster) -> Self {
        Self {
            cluster,
            schemas: Arc::new(SchemaRegistry::new()),
        }
    }

    pub async fn validate(&self, policies: &[StructuredPolicy]) -> Report {
        let syntactic = syntactic::validate(&self.schemas, policies);
        if !syntactic.is_empty() {
            info!(errors = syntactic.len(), "Policies failed syntactic validation");
            return Report {
                syntactic,
                ..Default::default()
            };
        }

        let (referential, property) = futures::join!(
            referential::validate(&*self.cluster, policies),
            property::validate(&*self.cluster, policies),
        );
        let report = Report {
            syntactic,
            referential,
            property,
        };
        debug!(?report, "Validated policies");
        report
    }
}

// === impl Report ===

impl Report {
    pub fn is_clean(&self) -> bool {
        self.syntactic.is_empty() && self.referential.is_empty() && self.property.is_empty()
    }

    pub fn into_errors(self) -> Vec<ValidationError> {
        let Self {
            mut syntactic,
            referential,
            property,
        } = self;
        syntactic.extend(referential);
        syntactic.extend(property);
        syntactic
    }
}

// === impl Stage ===

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Syntactic => "syntactic",
            Self::Referential => "referential",
            Self::Property => "property",
        }
    }

    fn error(self, policy: &StructuredPolicy, message: impl Into<String>) -> ValidationError {
        ValidationError {
            stage: self,
            policy: policy.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
