//! Label selector parsing and evaluation, backed by [`kube::core::Selector`]

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::core::{Selector, SelectorExt};

use crate::error::{Error, Result};

/// Selector matching exactly the given labels
pub fn from_labels<'a>(labels: impl IntoIterator<Item = (&'a str, &'a str)>) -> LabelSelector {
    LabelSelector {
        match_labels: Some(
            labels
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        ),
        match_expressions: None,
    }
}

/// Parse a selector, rejecting unknown operators and `In`/`NotIn` without values
pub fn parse(selector: &LabelSelector) -> Result<Selector> {
    Selector::try_from(selector.clone())
        .map_err(|e| Error::ValidationError(format!("invalid label selector: {}", e)))
}

/// Evaluate a selector against an object's labels.
/// An empty selector matches everything, an invalid one matches nothing.
pub fn matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    parse(selector).is_ok_and(|s| s.matches(labels))
}
