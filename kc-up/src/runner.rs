use std::sync::Arc;
use std::time::Duration;

use bollard::auth::DockerCredentials;
use bollard::image::RemoveImageOptions;
use bollard::secret::ImageSummary;
use bollard::Docker;
use futures::{
    AsyncBufReadExt,
    StreamExt,
    TryStreamExt,
};
use kc_core::compose::{
    ComposeFile,
    Service,
};
use kc_core::config::Environment;
use kc_core::docker::{
    parse_image_ref,
    parse_userinfo,
    ImageRef,
};
use kc_core::errors::*;
use kc_core::fs::Filesystem;
use kc_core::k8s::{
    label_selector,
    owned_service_name,
    verify_owned_resource,
    KubernetesError,
};
use kc_core::prelude::*;
use kube::api::{
    Api,
    ListParams,
    LogParams,
    PostParams,
};
use kube::runtime::watcher::{
    watcher,
    Config as WatcherConfig,
    Event,
};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::*;

use crate::app::{
    state_for_observed_pod,
    AppMap,
    AppState,
};
use crate::healthcheck::readiness_probe;
use crate::images::{
    inspect_image,
    list_local_images,
    pull_image,
    push_image,
    resolve_local_image_id,
    userinfo_from_image,
};
use crate::objects::{
    build_pod,
    build_service,
    host_alias,
    PodAssembly,
};
use crate::progress::Reporter;
use crate::volume::{
    build_volume_init_image,
    resolve_bind_volume_host_path,
};

const REPORTER_REFRESH_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Clone, Debug, Default)]
pub struct Options {
    pub detach: bool,
    pub skip_push: bool,
    pub skip_host_aliases: bool,
    pub run_as_user: bool,
    pub tail_lines: i64,
    pub registry_user: String,
    pub registry_pass: String,
}

// What an image worker hands back to the reconciler once the resolve,
// volume-init build, and push work for an app is done.
#[derive(Debug, Default)]
pub(crate) struct ImageOutcome {
    pub(crate) pod_image: String,
    pub(crate) inherited_healthcheck: Option<kc_core::compose::Healthcheck>,
    pub(crate) run_as: Option<(i64, Option<i64>)>,
    pub(crate) volume_init_image: Option<String>,
    pub(crate) built_image_ids: Vec<String>,
}

pub(crate) enum WorkerEvent {
    Progress { app: usize, line: String },
    ImageReady { app: usize, outcome: Box<ImageOutcome> },
    ImageFailed { app: usize, error: String },
    LogLine { app: usize, line: String },
}

// Everything an image worker needs, owned, so the worker task borrows
// nothing from the reconciler.
struct ImageWorkOrder {
    app: usize,
    service: Service,
    docker: Docker,
    fs: Arc<dyn Filesystem>,
    local_images: Arc<Vec<ImageSummary>>,
    volume_init_base_image: String,
    registry: Option<String>,
    namespace: String,
    skip_push: bool,
    run_as_user: bool,
    credentials: Option<DockerCredentials>,
}

pub(crate) struct UpRunner {
    compose: Arc<ComposeFile>,
    env: Environment,
    opts: Options,
    docker: Docker,
    client: kube::Client,
    fs: Arc<dyn Filesystem>,
    reporter: Box<dyn Reporter>,
    apps: AppMap,
    outcomes: Vec<Option<ImageOutcome>>,
    local_images: Arc<Vec<ImageSummary>>,
    worker_tx: mpsc::UnboundedSender<WorkerEvent>,
    workers: JoinSet<()>,
    cleanup_images: Vec<String>,
}

// Runs the reconciler to completion: adopt owned resources, watch pods and
// services, acquire images as dependency gates open, create pods, and wait
// for every app to reach its exit condition.
pub async fn run(
    compose: ComposeFile,
    env: Environment,
    opts: Options,
    docker: Docker,
    client: kube::Client,
    fs: Arc<dyn Filesystem>,
    reporter: Box<dyn Reporter>,
) -> EmptyResult {
    let apps = AppMap::new(&compose, &env)?;
    let app_count = apps.len();
    let (worker_tx, mut worker_rx) = mpsc::unbounded_channel();

    let mut runner = UpRunner {
        compose: Arc::new(compose),
        env,
        opts,
        docker,
        client,
        fs,
        reporter,
        apps,
        outcomes: (0..app_count).map(|_| None).collect(),
        local_images: Arc::new(vec![]),
        worker_tx,
        workers: JoinSet::new(),
        cleanup_images: vec![],
    };

    let result = runner.run_inner(&mut worker_rx).await;
    runner.workers.shutdown().await;
    runner.cleanup().await;
    runner.reporter.refresh();

    result?;
    if let Some(failed) = runner.apps.iter().find(|a| a.state == AppState::Failed) {
        bail!(
            "app {} failed: {}",
            failed.name,
            failed.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

impl UpRunner {
    async fn run_inner(&mut self, worker_rx: &mut mpsc::UnboundedReceiver<WorkerEvent>) -> EmptyResult {
        for app in self.apps.iter() {
            self.reporter.set_status(&app.name, AppState::Pending.display());
        }
        self.local_images = Arc::new(list_local_images(&self.docker).await?);

        let pods_api: Api<corev1::Pod> = Api::namespaced(self.client.clone(), &self.env.namespace);
        let services_api: Api<corev1::Service> =
            Api::namespaced(self.client.clone(), &self.env.namespace);

        self.adopt_existing(&pods_api, &services_api).await?;
        self.create_services(&services_api).await?;

        let watch_config = WatcherConfig::default().labels(&label_selector(&self.env));
        let mut pod_stream = watcher(pods_api.clone(), watch_config.clone()).boxed();
        let mut service_stream = watcher(services_api.clone(), watch_config).boxed();
        let mut refresh = tokio::time::interval(REPORTER_REFRESH_INTERVAL);

        self.evaluate(&pods_api).await?;
        while !self.done() {
            tokio::select! {
                maybe_event = pod_stream.next() => match maybe_event {
                    Some(Ok(event)) => self.handle_pod_event(event)?,
                    Some(Err(err)) => warn!("pod watch error: {err}"),
                    None => bail!("the pod watch stream ended unexpectedly"),
                },
                maybe_event = service_stream.next() => match maybe_event {
                    Some(Ok(event)) => self.handle_service_event(event)?,
                    Some(Err(err)) => warn!("service watch error: {err}"),
                    None => bail!("the service watch stream ended unexpectedly"),
                },
                Some(event) = worker_rx.recv() => self.handle_worker_event(event),
                _ = refresh.tick() => self.reporter.refresh(),
            }
            self.evaluate(&pods_api).await?;
        }
        Ok(())
    }

    // Step 2 of the reconciler: list resources matching our selector and
    // adopt the owned ones into the app records.  Anything matching the
    // selector that we would not have created aborts the run.
    pub(crate) async fn adopt_existing(
        &mut self,
        pods_api: &Api<corev1::Pod>,
        services_api: &Api<corev1::Service>,
    ) -> EmptyResult {
        let params = ListParams::default().labels(&label_selector(&self.env));
        for pod in pods_api.list(&params).await? {
            self.observe_pod_object(&pod)?;
        }
        for service in services_api.list(&params).await? {
            self.observe_service_object(&service)?;
        }
        Ok(())
    }

    // Services carry no dependency gates, so they are all created up front;
    // their ClusterIPs feed the host aliases of pods created later.
    pub(crate) async fn create_services(&mut self, services_api: &Api<corev1::Service>) -> EmptyResult {
        for i in 0..self.apps.len() {
            let service = self.service_for(i);
            if service.ports.is_empty() || self.apps.get(i).cluster_ip.is_some() {
                continue;
            }
            let object = build_service(&self.env, &service);
            match services_api.create(&PostParams::default(), &object).await {
                Ok(created) => {
                    info!("created service {}", created.name_any());
                    self.observe_service_object(&created)?;
                },
                Err(kube::Error::Api(response)) if response.code == 409 => {
                    let existing = services_api.get(&self.apps.get(i).pod_name).await?;
                    verify_owned_resource(&self.apps.get(i).name, &existing.metadata)?;
                    self.observe_service_object(&existing)?;
                },
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    // Re-evaluates every app after an event: fail apps whose gates can never
    // open, kick off image acquisition for newly eligible apps, create pods
    // for apps whose image work is done, and start log tails.
    async fn evaluate(&mut self, pods_api: &Api<corev1::Pod>) -> EmptyResult {
        for i in 0..self.apps.len() {
            match self.apps.get(i).state {
                AppState::Pending if self.apps.gates_blocked(i) => {
                    self.fail_app(i, "a depends_on condition can never be satisfied");
                },
                AppState::Pending if self.apps.gates_open(i) => self.start_image_worker(i),
                AppState::ImageAcquired if self.apps.gates_open(i) => {
                    self.create_pod(i, pods_api).await?;
                },
                AppState::ImageAcquired if self.apps.gates_blocked(i) => {
                    self.fail_app(i, "a depends_on condition can never be satisfied");
                },
                _ => {},
            }

            let app = self.apps.get(i);
            if !self.opts.detach
                && !app.state.is_terminal()
                && app.state >= AppState::PodStarted
                && !app.tailing_logs
            {
                self.start_log_tail(i, pods_api);
            }
        }
        Ok(())
    }

    fn done(&self) -> bool {
        if self.opts.detach {
            self.apps.iter().all(|a| a.state >= AppState::PodStarted)
        } else {
            self.apps.iter().all(|a| a.state.is_terminal())
        }
    }

    fn service_for(&self, i: usize) -> Service {
        self.compose.services()[self.apps.get(i).service_index].clone()
    }

    fn fail_app(&mut self, i: usize, message: &str) {
        let app = self.apps.get_mut(i);
        if app.state.is_terminal() {
            return;
        }
        app.state = AppState::Failed;
        app.error = Some(message.to_string());
        let name = app.name.clone();
        self.reporter.set_status(&name, &format!("failed: {message}"));
    }

    fn start_image_worker(&mut self, i: usize) {
        let reason = self.apps.create_pod_reason(i);
        let app = self.apps.get_mut(i);
        app.state = AppState::ImageAcquiring;
        let name = app.name.clone();
        self.reporter.set_status(&name, &reason);

        let order = ImageWorkOrder {
            app: i,
            service: self.service_for(i),
            docker: self.docker.clone(),
            fs: self.fs.clone(),
            local_images: self.local_images.clone(),
            volume_init_base_image: self
                .compose
                .volume_init_base_image
                .clone()
                .unwrap_or_else(|| DEFAULT_VOLUME_INIT_BASE_IMAGE.to_string()),
            registry: self.compose.push_images.as_ref().map(|p| p.docker_registry.clone()),
            namespace: self.env.namespace.clone(),
            skip_push: self.opts.skip_push,
            run_as_user: self.opts.run_as_user,
            credentials: self.credentials(),
        };
        let tx = self.worker_tx.clone();
        self.workers.spawn(async move {
            let app = order.app;
            let message = match acquire_image(order, &tx).await {
                Ok(outcome) => WorkerEvent::ImageReady { app, outcome: Box::new(outcome) },
                Err(err) => WorkerEvent::ImageFailed { app, error: format!("{err:#}") },
            };
            let _ = tx.send(message);
        });
    }

    fn credentials(&self) -> Option<DockerCredentials> {
        if self.opts.registry_user.is_empty() && self.opts.registry_pass.is_empty() {
            return None;
        }
        Some(DockerCredentials {
            username: Some(self.opts.registry_user.clone()),
            password: Some(self.opts.registry_pass.clone()),
            ..Default::default()
        })
    }

    pub(crate) fn handle_worker_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Progress { app, line } => {
                let name = self.apps.get(app).name.clone();
                self.reporter.set_status(&name, &line);
            },
            WorkerEvent::ImageReady { app, outcome } => {
                self.cleanup_images.extend(outcome.built_image_ids.iter().cloned());
                if self.apps.get(app).state != AppState::ImageAcquiring {
                    return;
                }
                let pod_image = outcome.pod_image.clone();
                self.outcomes[app] = Some(*outcome);
                let record = self.apps.get_mut(app);
                record.pod_image = Some(pod_image);
                record.state = AppState::ImageAcquired;
                let name = record.name.clone();
                self.reporter.set_status(&name, AppState::ImageAcquired.display());
            },
            WorkerEvent::ImageFailed { app, error } => self.fail_app(app, &error),
            WorkerEvent::LogLine { app, line } => {
                let name = self.apps.get(app).name.clone();
                self.reporter.log_line(&name, &line);
            },
        }
    }

    // Creates the pod for an app whose image work is done.  Creation is
    // idempotent: on a name conflict the existing pod is adopted when it
    // carries our annotation, and the run aborts when it does not.
    pub(crate) async fn create_pod(&mut self, i: usize, pods_api: &Api<corev1::Pod>) -> EmptyResult {
        let service = self.service_for(i);
        let Some(outcome) = self.outcomes[i].take() else {
            bail!("no image outcome recorded for app {}", self.apps.get(i).name);
        };

        let healthcheck = if service.healthcheck_disabled {
            None
        } else {
            service.healthcheck.clone().or(outcome.inherited_healthcheck)
        };

        let mut host_aliases = vec![];
        if !self.opts.skip_host_aliases {
            for sibling in self.apps.iter() {
                if let Some(ip) = &sibling.cluster_ip {
                    let escaped = &self.compose.services()[sibling.service_index].name_escaped;
                    host_aliases.push(host_alias(ip, &sibling.name, escaped));
                }
            }
        }

        let assembly = PodAssembly {
            image: outcome.pod_image,
            readiness_probe: healthcheck.as_ref().map(readiness_probe),
            host_aliases,
            run_as: outcome.run_as,
            volume_init_image: outcome.volume_init_image,
        };
        let pod = build_pod(&self.env, &service, &assembly);

        match pods_api.create(&PostParams::default(), &pod).await {
            Ok(created) => {
                let app = self.apps.get_mut(i);
                app.state = AppState::PodCreated;
                let name = app.name.clone();
                self.reporter.set_status(&name, AppState::PodCreated.display());
                self.observe_pod_object(&created)?;
            },
            Err(kube::Error::Api(response)) if response.code == 409 => {
                let existing = pods_api.get(&self.apps.get(i).pod_name).await?;
                verify_owned_resource(&self.apps.get(i).name, &existing.metadata)?;
                self.apps.get_mut(i).state = AppState::PodCreated;
                self.observe_pod_object(&existing)?;
            },
            Err(err) => return Err(err.into()),
        }
        Ok(())
    }

    pub(crate) fn handle_pod_event(&mut self, event: Event<corev1::Pod>) -> EmptyResult {
        match event {
            Event::Applied(pod) => self.observe_pod_object(&pod)?,
            Event::Deleted(pod) => {
                if let Some(i) = self.app_for_meta(&pod.metadata)? {
                    self.fail_app(i, "pod was deleted externally");
                }
            },
            Event::Restarted(pods) => {
                for pod in &pods {
                    self.observe_pod_object(pod)?;
                }
            },
        }
        Ok(())
    }

    pub(crate) fn handle_service_event(&mut self, event: Event<corev1::Service>) -> EmptyResult {
        match event {
            Event::Applied(service) => self.observe_service_object(&service)?,
            Event::Deleted(service) => {
                warn!("service {} was deleted externally", service.name_any());
            },
            Event::Restarted(services) => {
                for service in &services {
                    self.observe_service_object(service)?;
                }
            },
        }
        Ok(())
    }

    // Maps a watched resource back to its app via the ownership annotation.
    // A resource that matches our selector but is not annotated as ours
    // means the environment was modified externally, which is fatal.
    fn app_for_meta(&self, meta: &metav1::ObjectMeta) -> anyhow::Result<Option<usize>> {
        let resource_name = meta.name.as_deref().unwrap_or("<unnamed>");
        let Some(service_name) = owned_service_name(meta) else {
            bail!(KubernetesError::modified_externally(resource_name));
        };
        let Some(i) = self.apps.index_of(service_name) else {
            bail!(KubernetesError::modified_externally(resource_name));
        };
        Ok(Some(i))
    }

    fn observe_pod_object(&mut self, pod: &corev1::Pod) -> EmptyResult {
        let Some(i) = self.app_for_meta(&pod.metadata)? else {
            return Ok(());
        };
        verify_owned_resource(&self.apps.get(i).name, &pod.metadata)?;

        let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());
        let ready = pod_ready(pod);
        let app = self.apps.get_mut(i);
        let next = state_for_observed_pod(app.state, phase, ready);
        if next != app.state {
            app.state = next;
            app.ready = ready;
            if next == AppState::Failed {
                app.error = Some("pod failed".into());
            }
            let name = app.name.clone();
            self.reporter.set_status(&name, next.display());
        }
        Ok(())
    }

    fn observe_service_object(&mut self, service: &corev1::Service) -> EmptyResult {
        let Some(i) = self.app_for_meta(&service.metadata)? else {
            return Ok(());
        };
        verify_owned_resource(&self.apps.get(i).name, &service.metadata)?;

        let cluster_ip = service
            .spec
            .as_ref()
            .and_then(|s| s.cluster_ip.clone())
            .filter(|ip| !ip.is_empty() && ip != "None");
        self.apps.get_mut(i).cluster_ip = cluster_ip;
        Ok(())
    }

    fn start_log_tail(&mut self, i: usize, pods_api: &Api<corev1::Pod>) {
        let app = self.apps.get_mut(i);
        app.tailing_logs = true;
        let pod_name = app.pod_name.clone();
        let api = pods_api.clone();
        let tx = self.worker_tx.clone();
        let params = LogParams {
            follow: true,
            tail_lines: Some(self.opts.tail_lines),
            ..Default::default()
        };
        self.workers.spawn(async move {
            let reader = match api.log_stream(&pod_name, &params).await {
                Ok(reader) => reader,
                Err(err) => {
                    warn!("could not tail logs of pod {pod_name}: {err}");
                    return;
                },
            };
            let mut lines = reader.lines();
            loop {
                match lines.try_next().await {
                    Ok(Some(line)) => {
                        let _ = tx.send(WorkerEvent::LogLine { app: i, line });
                    },
                    Ok(None) => break,
                    Err(err) => {
                        debug!("log stream for pod {pod_name} closed: {err}");
                        break;
                    },
                }
            }
        });
    }

    /// Best-effort removal of the volume-init images built for this run.
    async fn cleanup(&mut self) {
        for image in &self.cleanup_images {
            let options = RemoveImageOptions { force: true, ..Default::default() };
            if let Err(err) = self.docker.remove_image(image, Some(options), None).await {
                warn!("could not remove volume-init image {image}: {err}");
            }
        }
    }
}

#[cfg(test)]
impl UpRunner {
    // Tests drive the reconciler's methods directly against a fake
    // apiserver; the docker handle is lazily connected and never touched.
    pub(crate) fn new_from_parts(
        compose: ComposeFile,
        env: Environment,
        opts: Options,
        client: kube::Client,
        reporter: Box<dyn Reporter>,
    ) -> (UpRunner, mpsc::UnboundedReceiver<WorkerEvent>) {
        let apps = AppMap::new(&compose, &env).unwrap();
        let app_count = apps.len();
        let (worker_tx, worker_rx) = mpsc::unbounded_channel();
        let runner = UpRunner {
            compose: Arc::new(compose),
            env,
            opts,
            docker: Docker::connect_with_local_defaults().unwrap(),
            client,
            fs: Arc::new(kc_core::fs::InMemoryFilesystem::new()),
            reporter,
            apps,
            outcomes: (0..app_count).map(|_| None).collect(),
            local_images: Arc::new(vec![]),
            worker_tx,
            workers: JoinSet::new(),
            cleanup_images: vec![],
        };
        (runner, worker_rx)
    }

    pub(crate) fn app(&self, name: &str) -> &crate::app::App {
        self.apps.get(self.apps.index_of(name).unwrap())
    }

    pub(crate) fn app_mut(&mut self, name: &str) -> &mut crate::app::App {
        self.apps.get_mut(self.apps.index_of(name).unwrap())
    }
}

pub(crate) fn pod_ready(pod: &corev1::Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions.iter().any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

// The image pipeline for one app, run on a worker task: resolve the image
// locally, pull on a miss, inspect for the inherited healthcheck and user,
// build the volume-init image for bind mounts, and push everything that has
// to be remote-addressable.
async fn acquire_image(
    order: ImageWorkOrder,
    tx: &mpsc::UnboundedSender<WorkerEvent>,
) -> anyhow::Result<ImageOutcome> {
    let service = &order.service;
    let app = order.app;
    let progress = |line: String| {
        let _ = tx.send(WorkerEvent::Progress { app, line });
    };

    let image_name = service
        .image
        .clone()
        .ok_or_else(|| anyhow!("service {} has no image to deploy", service.name))?;
    let image_ref = parse_image_ref(&image_name)?;
    let (image_id, _repo_digest) = match resolve_local_image_id(&image_ref, &order.local_images) {
        Some((id, repo_digest)) => (id, repo_digest),
        None => {
            let ImageRef::Named(named) = &image_ref else {
                bail!("image {image_name} is not present in the local daemon");
            };
            let (id, repo_digest) = pull_image(&order.docker, named, order.credentials.clone(), progress).await?;
            (id, Some(repo_digest))
        },
    };

    let (inherited_healthcheck, image_user) = inspect_image(&order.docker, &image_id).await?;

    let run_as = if order.run_as_user {
        match service.user.clone().or(image_user) {
            Some(spec) => {
                let mut userinfo = parse_userinfo(&spec);
                userinfo_from_image(&order.docker, &image_id, &mut userinfo).await?;
                let uid = userinfo
                    .uid
                    .ok_or_else(|| anyhow!("could not resolve user {:?}", userinfo.user))?;
                Some((uid, userinfo.gid))
            },
            None => None,
        }
    } else {
        None
    };

    let mut built_image_ids = vec![];
    let bind_mounts = service.bind_mounts();
    let volume_init_local = if bind_mounts.is_empty() {
        None
    } else {
        let mut host_paths = vec![];
        for mapping in &bind_mounts {
            let Some(host_path) = &mapping.host_path else { continue };
            host_paths.push(resolve_bind_volume_host_path(order.fs.as_ref(), host_path)?);
        }
        let id = build_volume_init_image(
            &order.docker,
            order.fs.as_ref(),
            &host_paths,
            &order.volume_init_base_image,
        )
        .await?;
        built_image_ids.push(id.clone());
        Some(id)
    };

    let progress = |line: String| {
        let _ = tx.send(WorkerEvent::Progress { app, line });
    };
    let (pod_image, volume_init_image) = match (&order.registry, order.skip_push) {
        (Some(registry), false) => {
            let target = format!("{}/{}/{}", registry, order.namespace, service.name_escaped);
            let pushed =
                push_image(&order.docker, &image_id, &target, order.credentials.clone(), progress)
                    .await?;
            let volume_init = match &volume_init_local {
                Some(local) => {
                    let progress = |line: String| {
                        let _ = tx.send(WorkerEvent::Progress { app, line });
                    };
                    Some(
                        push_image(
                            &order.docker,
                            local,
                            &format!("{target}-init"),
                            order.credentials.clone(),
                            progress,
                        )
                        .await?,
                    )
                },
                None => None,
            };
            (pushed, volume_init)
        },
        // --skip-push assumes the images were previously pushed to the
        // same targets.
        (Some(registry), true) => {
            let target = format!("{}/{}/{}", registry, order.namespace, service.name_escaped);
            let volume_init = volume_init_local.as_ref().map(|_| format!("{target}-init:latest"));
            (format!("{target}:latest"), volume_init)
        },
        // Without a configured registry the cluster pulls the compose
        // reference itself; locally built volume-init images only work
        // when the cluster nodes share the daemon.
        (None, _) => (image_name.clone(), volume_init_local.clone()),
    };

    Ok(ImageOutcome {
        pod_image,
        inherited_healthcheck,
        run_as,
        volume_init_image,
        built_image_ids,
    })
}
