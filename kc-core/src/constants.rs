// Well-known labels and annotations
pub const APP_LABEL_KEY: &str = "app";
pub const DEFAULT_ENVIRONMENT_LABEL_KEY: &str = "env";

// The annotation added to every resource we create, so that resources can be
// mapped back to their docker compose service.
pub const SERVICE_ANNOTATION_KEY: &str = "kube-compose/service";

// Env vars
pub const ENV_VAR_PREFIX: &str = "KUBECOMPOSE_";
pub const NAMESPACE_ENV_VAR: &str = "KUBECOMPOSE_NAMESPACE";
pub const ENV_ID_ENV_VAR: &str = "KUBECOMPOSE_ENVID";
pub const LOG_LEVEL_ENV_VAR: &str = "KUBECOMPOSE_LOGLEVEL";
pub const REGISTRY_USER_ENV_VAR: &str = "KUBECOMPOSE_REGISTRY_USER";
pub const REGISTRY_PASS_ENV_VAR: &str = "KUBECOMPOSE_REGISTRY_PASS";

// Defaults
pub const DEFAULT_REGISTRY_USER: &str = "unused";
pub const DEFAULT_VOLUME_INIT_BASE_IMAGE: &str = "ubuntu:latest";
pub const DEFAULT_TAIL_LINES: i64 = 10;

#[cfg(any(test, feature = "testutils"))]
mod test_constants {
    pub const TEST_ENV_ID: &str = "test-env";
    pub const TEST_NAMESPACE: &str = "test-namespace";
}

#[cfg(any(test, feature = "testutils"))]
pub use test_constants::*;
