mod helpers;
mod runner_test;

use kc_core::compose::ComposeFile;
use kc_core::config::Environment;
use kc_core::prelude::*;

pub(crate) fn test_env() -> Environment {
    Environment::new(TEST_ENV_ID, TEST_NAMESPACE, false).unwrap()
}

pub(crate) fn parse_compose(text: &str) -> ComposeFile {
    ComposeFile::parse(text).unwrap()
}
