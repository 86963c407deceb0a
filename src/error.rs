/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* File: src/error.rs
*
* This file defines the error taxonomy shared by every stage of the plugin
* pipeline. Lower layers never translate errors into status; they only return
* one of these variants and let the reconciler decide what the user sees.
*
* SPDX-License-Identifier: Apache-2.0 */

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("fetch {source_ref}: {message}")]
    Fetch { source_ref: String, message: String },

    #[error("no find in pathes {searched:?} and no repo specified for {name}")]
    NotFound { name: String, searched: Vec<String> },

    #[error("unsupported source {0}")]
    UnsupportedSource(String),

    #[error("render {kind}: {message}")]
    Render { kind: String, message: String },

    #[error("dependency {namespace}/{name} :{reason}")]
    Dependency {
        namespace: String,
        name: String,
        reason: String,
    },

    #[error("values reference: {0}")]
    ValuesReference(String),

    #[error("invalid values: {0}")]
    Values(#[from] crate::values::strvals::ParseError),

    #[error("{0}")]
    Sync(String),

    #[error("missing field {0}")]
    MissingField(&'static str),

    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("finalizer error: {0}")]
    Finalizer(#[source] Box<kube::runtime::finalizer::Error<Error>>),

    #[error("Git operation failed: {0}")]
    GitError(#[from] git2::Error),

    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("An unexpected error occurred: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Dependency errors are an expected, retryable condition and never turn
    /// into a Failed phase.
    pub fn is_dependency(&self) -> bool {
        matches!(self, Error::Dependency { .. })
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Error::KubeError(kube::Error::Api(resp)) => resp.code == 404,
            Error::NotFound { .. } => true,
            _ => false,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::KubeError(kube::Error::Api(resp)) if resp.code == 409)
    }

    pub(crate) fn fetch(source_ref: impl Into<String>, message: impl ToString) -> Self {
        Error::Fetch {
            source_ref: source_ref.into(),
            message: message.to_string(),
        }
    }

    pub(crate) fn render(kind: impl ToString, message: impl ToString) -> Self {
        Error::Render {
            kind: kind.to_string(),
            message: message.to_string(),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dependency_message_matches_status_format() {
        let err = Error::Dependency {
            namespace: "kubegems".into(),
            name: "monitoring".into(),
            reason: "not installed".into(),
        };
        assert!(err.is_dependency());
        assert_eq!(err.to_string(), "dependency kubegems/monitoring :not installed");
    }

    #[test]
    fn not_found_is_detected_for_local_lookups() {
        let err = Error::NotFound {
            name: "nginx".into(),
            searched: vec!["/plugins".into()],
        };
        assert!(err.is_not_found());
        assert!(!err.is_dependency());
    }
}
