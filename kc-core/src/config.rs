use std::sync::OnceLock;

use regex::Regex;

use crate::constants::*;
use crate::errors::*;

err_impl! {EnvironmentError,
    #[error("environment id {0:?} must match ^[a-z0-9]([-a-z0-9]*[a-z0-9])?$")]
    InvalidEnvironmentId(String),
}

// Process-wide deployment identity, immutable after configuration.  The env
// id suffixes resource names (unless no_append) and isolates label selectors
// so several deployments can share a namespace.
#[derive(Clone, Debug)]
pub struct Environment {
    pub id: String,
    pub label: String,
    pub namespace: String,
    pub no_append: bool,
}

impl Environment {
    pub fn new(id: &str, namespace: &str, no_append: bool) -> anyhow::Result<Environment> {
        static LABEL_REGEX: OnceLock<Regex> = OnceLock::new();
        let re = LABEL_REGEX.get_or_init(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").unwrap());
        if !re.is_match(id) {
            bail!(EnvironmentError::invalid_environment_id(id));
        }
        Ok(Environment {
            id: id.into(),
            label: DEFAULT_ENVIRONMENT_LABEL_KEY.into(),
            namespace: namespace.into(),
            no_append,
        })
    }
}
