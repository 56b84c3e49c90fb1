use std::time::Duration;

use bollard::secret::HealthConfig;
use kc_core::compose::{
    Healthcheck,
    HEALTHCHECK_COMMAND_NONE,
    HEALTHCHECK_COMMAND_SHELL,
    HEALTHCHECK_DEFAULT_INTERVAL,
    HEALTHCHECK_DEFAULT_RETRIES,
    HEALTHCHECK_DEFAULT_TIMEOUT,
};
use kc_core::prelude::*;

// A healthcheck a service inherits from its image's HEALTHCHECK instruction.
// The daemon reports durations in nanoseconds and leaves fields out entirely
// when the Dockerfile did not set them, which is what the Options encode.
pub fn healthcheck_from_image(config: &HealthConfig) -> Option<Healthcheck> {
    let test = config.test.as_ref()?;
    let sentinel = test.first()?;
    if sentinel == HEALTHCHECK_COMMAND_NONE {
        return None;
    }
    Some(Healthcheck {
        is_shell: sentinel == HEALTHCHECK_COMMAND_SHELL,
        test: test[1..].to_vec(),
        interval: config
            .interval
            .map_or(HEALTHCHECK_DEFAULT_INTERVAL, |ns| Duration::from_nanos(ns.max(0) as u64)),
        timeout: config
            .timeout
            .map_or(HEALTHCHECK_DEFAULT_TIMEOUT, |ns| Duration::from_nanos(ns.max(0) as u64)),
        retries: config.retries.map_or(HEALTHCHECK_DEFAULT_RETRIES, |r| r.max(0) as u64),
    })
}

// Translates a healthcheck into a readiness probe.
//
// InitialDelaySeconds must always be zero so we start the healthcheck
// immediately.  Irrespective of Docker's StartPeriod we should set this to
// zero; if this was a liveness probe we would have to set it to StartPeriod.
pub fn readiness_probe(healthcheck: &Healthcheck) -> corev1::Probe {
    let mut command = Vec::with_capacity(healthcheck.test.len() + 2);
    if healthcheck.is_shell {
        // The shell is hardcoded by docker to be /bin/sh.
        command.push("/bin/sh".to_string());
        command.push("-c".to_string());
    }
    command.extend(healthcheck.test.iter().cloned());

    corev1::Probe {
        exec: Some(corev1::ExecAction { command: Some(command) }),
        initial_delay_seconds: Some(0),
        period_seconds: Some(whole_seconds(healthcheck.interval)),
        timeout_seconds: Some(whole_seconds(healthcheck.timeout)),
        failure_threshold: Some(i32::try_from(healthcheck.retries).unwrap_or(i32::MAX)),
        ..Default::default()
    }
}

// Banker's rounding, so 2.5s and 3.5s land on 2 and 4 rather than both
// drifting up.
fn whole_seconds(duration: Duration) -> i32 {
    let seconds = duration.as_secs_f64().round_ties_even();
    if seconds >= i32::MAX as f64 {
        i32::MAX
    } else {
        seconds as i32
    }
}
