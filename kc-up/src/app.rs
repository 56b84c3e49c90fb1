use std::collections::BTreeMap;

use kc_core::compose::{
    ComposeFile,
    ServiceHealthiness,
};
use kc_core::config::Environment;
use kc_core::errors::*;
use kc_core::k8s::k8s_name;

err_impl! {SchedulerError,
    #[error("the depends_on graph contains a cycle involving service: {0}")]
    DependencyCycle(String),
}

// The lifecycle of a single app.  The ordering is load-bearing: dependency
// conditions are expressed as comparisons against this progression, with
// Failed excluded explicitly (it sorts last but satisfies nothing).
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum AppState {
    Pending,
    ImageAcquiring,
    ImageAcquired,
    PodCreated,
    PodStarted,
    PodReady,
    PodCompleted,
    Failed,
}

impl AppState {
    pub fn is_terminal(self) -> bool {
        matches!(self, AppState::PodCompleted | AppState::Failed)
    }

    pub fn satisfies(self, condition: ServiceHealthiness) -> bool {
        if self == AppState::Failed {
            return false;
        }
        match condition {
            ServiceHealthiness::Started => self >= AppState::PodStarted,
            ServiceHealthiness::Healthy => self >= AppState::PodReady,
            ServiceHealthiness::CompletedSuccessfully => self == AppState::PodCompleted,
        }
    }

    pub fn display(self) -> &'static str {
        match self {
            AppState::Pending => "pending",
            AppState::ImageAcquiring => "acquiring image",
            AppState::ImageAcquired => "image acquired",
            AppState::PodCreated => "pod created",
            AppState::PodStarted => "running",
            AppState::PodReady => "ready",
            AppState::PodCompleted => "completed",
            AppState::Failed => "failed",
        }
    }
}

// The runtime record for one compose service.  Apps are stored in an arena
// indexed in the same order as ComposeFile::services(); the dependency graph
// is adjacency lists of arena indices, so there are no reference cycles to
// fight the borrow checker over.
#[derive(Debug)]
pub struct App {
    pub service_index: usize,
    pub name: String,
    pub pod_name: String,
    pub state: AppState,
    pub pod_image: Option<String>,
    pub cluster_ip: Option<String>,
    pub ready: bool,
    pub error: Option<String>,
    pub tailing_logs: bool,
    pub depends_on: Vec<(usize, ServiceHealthiness)>,
}

#[derive(Debug)]
pub struct AppMap {
    apps: Vec<App>,
    index: BTreeMap<String, usize>,
}

impl AppMap {
    // Builds the arena and validates that depends_on is acyclic; dependency
    // references are known to resolve because the compose loader checked.
    pub fn new(compose: &ComposeFile, env: &Environment) -> anyhow::Result<AppMap> {
        let mut index = BTreeMap::new();
        for (i, service) in compose.services().iter().enumerate() {
            index.insert(service.name.clone(), i);
        }

        let mut apps = vec![];
        for (i, service) in compose.services().iter().enumerate() {
            let depends_on = service
                .depends_on
                .iter()
                .map(|(name, condition)| (index[name], *condition))
                .collect();
            apps.push(App {
                service_index: i,
                name: service.name.clone(),
                pod_name: k8s_name(env, service),
                state: AppState::Pending,
                pod_image: None,
                cluster_ip: None,
                ready: false,
                error: None,
                tailing_logs: false,
                depends_on,
            });
        }

        let map = AppMap { apps, index };
        map.check_acyclic()?;
        Ok(map)
    }

    pub fn len(&self) -> usize {
        self.apps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }

    pub fn get(&self, i: usize) -> &App {
        &self.apps[i]
    }

    pub fn get_mut(&mut self, i: usize) -> &mut App {
        &mut self.apps[i]
    }

    pub fn iter(&self) -> impl Iterator<Item = &App> {
        self.apps.iter()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// True when every depends_on condition of app `i` is currently satisfied.
    pub fn gates_open(&self, i: usize) -> bool {
        self.apps[i].depends_on.iter().all(|&(dep, condition)| self.apps[dep].state.satisfies(condition))
    }

    // True when some gate of app `i` can never open again: the dependency is
    // terminal without satisfying the condition.  Such apps are failed
    // instead of left waiting forever.
    pub fn gates_blocked(&self, i: usize) -> bool {
        self.apps[i].depends_on.iter().any(|&(dep, condition)| {
            self.apps[dep].state.is_terminal() && !self.apps[dep].state.satisfies(condition)
        })
    }

    // The reason surfaced to the progress reporter when an app leaves
    // Pending, e.g. "all depends_on conditions satisfied (db: ready)".
    pub fn create_pod_reason(&self, i: usize) -> String {
        let conditions: Vec<String> = self.apps[i]
            .depends_on
            .iter()
            .map(|&(dep, condition)| {
                let word = match condition {
                    ServiceHealthiness::Started => "running",
                    ServiceHealthiness::Healthy => "ready",
                    ServiceHealthiness::CompletedSuccessfully => "completed",
                };
                format!("{}: {}", self.apps[dep].name, word)
            })
            .collect();
        format!("all depends_on conditions satisfied ({})", conditions.join(", "))
    }

    fn check_acyclic(&self) -> EmptyResult {
        #[derive(Clone, Copy, Eq, PartialEq)]
        enum Mark {
            New,
            Visiting,
            Done,
        }

        fn visit(apps: &[App], marks: &mut [Mark], i: usize) -> EmptyResult {
            match marks[i] {
                Mark::Done => return Ok(()),
                Mark::Visiting => bail!(SchedulerError::dependency_cycle(&apps[i].name)),
                Mark::New => {},
            }
            marks[i] = Mark::Visiting;
            for &(dep, _) in &apps[i].depends_on {
                visit(apps, marks, dep)?;
            }
            marks[i] = Mark::Done;
            Ok(())
        }

        let mut marks = vec![Mark::New; self.apps.len()];
        for i in 0..self.apps.len() {
            visit(&self.apps, &mut marks, i)?;
        }
        Ok(())
    }
}

/// Advances an app's state given the observed pod phase and readiness.
pub fn state_for_observed_pod(current: AppState, phase: Option<&str>, ready: bool) -> AppState {
    if current == AppState::Failed {
        return current;
    }
    match phase {
        Some("Failed") => AppState::Failed,
        Some("Succeeded") => AppState::PodCompleted,
        Some("Running") => {
            let observed = if ready { AppState::PodReady } else { AppState::PodStarted };
            current.max(observed)
        },
        Some("Pending") => current.max(AppState::PodCreated),
        _ => current,
    }
}
