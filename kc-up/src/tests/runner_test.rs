use httpmock::prelude::*;
use kc_core::k8s::is_openshift_shaped;
use kc_core::prelude::*;
use kube::api::Api;
use kube::runtime::watcher::Event;
use serde_json::json;

use super::helpers::*;
use super::{
    parse_compose,
    test_env,
};
use crate::app::AppState;
use crate::objects::{
    build_pod,
    build_service,
    PodAssembly,
};
use crate::progress::TracingReporter;
use crate::runner::{
    pod_ready,
    ImageOutcome,
    Options,
    UpRunner,
    WorkerEvent,
};

const WEB_SERVICE: &str = "services:\n  web:\n    image: nginx\n    ports:\n      - 8080\n";

const PODS_PATH: &str = "/api/v1/namespaces/test-namespace/pods";
const SERVICES_PATH: &str = "/api/v1/namespaces/test-namespace/services";

fn new_runner(client: kube::Client) -> UpRunner {
    let (runner, _worker_rx) = UpRunner::new_from_parts(
        parse_compose(WEB_SERVICE),
        test_env(),
        Options::default(),
        client,
        Box::new(TracingReporter),
    );
    runner
}

fn owned_pod(phase: &str, ready: bool) -> corev1::Pod {
    let compose = parse_compose(WEB_SERVICE);
    let service = compose.get("web").unwrap();
    let mut pod =
        build_pod(&test_env(), service, &PodAssembly { image: "nginx".into(), ..Default::default() });
    pod.status = Some(corev1::PodStatus {
        phase: Some(phase.into()),
        conditions: Some(vec![corev1::PodCondition {
            type_: "Ready".into(),
            status: if ready { "True" } else { "False" }.into(),
            ..Default::default()
        }]),
        ..Default::default()
    });
    pod
}

fn owned_service(cluster_ip: &str) -> corev1::Service {
    let compose = parse_compose(WEB_SERVICE);
    let mut service = build_service(&test_env(), compose.get("web").unwrap());
    service.spec.get_or_insert_with(Default::default).cluster_ip = Some(cluster_ip.into());
    service
}

fn pod_with_condition(type_: &str, status: &str) -> corev1::Pod {
    corev1::Pod {
        status: Some(corev1::PodStatus {
            conditions: Some(vec![corev1::PodCondition {
                type_: type_.into(),
                status: status.into(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[test]
fn test_pod_ready() {
    assert!(pod_ready(&pod_with_condition("Ready", "True")));
    assert!(!pod_ready(&pod_with_condition("Ready", "False")));
    assert!(!pod_ready(&pod_with_condition("PodScheduled", "True")));
    assert!(!pod_ready(&corev1::Pod::default()));
}

#[tokio::test]
async fn test_adopt_existing_adopts_owned_resources() {
    let (mut fake, client) = make_fake_apiserver();
    let pod = owned_pod("Running", true);
    fake.handle(move |when, then| {
        when.method(GET).path(PODS_PATH);
        then.status(200).json_body(list_of("PodList", &[pod.clone()]));
    });
    let service = owned_service("10.96.0.1");
    fake.handle(move |when, then| {
        when.method(GET).path(SERVICES_PATH);
        then.status(200).json_body(list_of("ServiceList", &[service.clone()]));
    });

    let mut runner = new_runner(client.clone());
    let pods_api: Api<corev1::Pod> = Api::namespaced(client.clone(), TEST_NAMESPACE);
    let services_api: Api<corev1::Service> = Api::namespaced(client, TEST_NAMESPACE);
    runner.adopt_existing(&pods_api, &services_api).await.unwrap();

    assert_eq!(runner.app("web").state, AppState::PodReady);
    assert_eq!(runner.app("web").cluster_ip.as_deref(), Some("10.96.0.1"));
    fake.assert();
}

#[tokio::test]
async fn test_adopt_existing_aborts_on_foreign_pod() {
    let (mut fake, client) = make_fake_apiserver();
    let mut pod = owned_pod("Running", false);
    pod.metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(SERVICE_ANNOTATION_KEY.into(), "stranger".into());
    fake.handle(move |when, then| {
        when.method(GET).path(PODS_PATH);
        then.status(200).json_body(list_of("PodList", &[pod.clone()]));
    });

    let mut runner = new_runner(client.clone());
    let pods_api: Api<corev1::Pod> = Api::namespaced(client.clone(), TEST_NAMESPACE);
    let services_api: Api<corev1::Service> = Api::namespaced(client, TEST_NAMESPACE);
    let err = runner.adopt_existing(&pods_api, &services_api).await.unwrap_err();
    assert!(err.to_string().contains("modified by an external process"), "{err}");
}

#[tokio::test]
async fn test_create_services_records_cluster_ip() {
    let (mut fake, client) = make_fake_apiserver();
    let body = serde_json::to_value(owned_service("10.96.0.7")).unwrap();
    fake.handle(move |when, then| {
        when.method(POST).path(SERVICES_PATH);
        then.status(201).json_body(body.clone());
    });

    let mut runner = new_runner(client.clone());
    let services_api: Api<corev1::Service> = Api::namespaced(client, TEST_NAMESPACE);
    runner.create_services(&services_api).await.unwrap();

    assert_eq!(runner.app("web").cluster_ip.as_deref(), Some("10.96.0.7"));
    fake.assert();
}

#[tokio::test]
async fn test_create_services_adopts_conflicting_service() {
    let (mut fake, client) = make_fake_apiserver();
    fake.handle(move |when, then| {
        when.method(POST).path(SERVICES_PATH);
        then.status(409).json_body(status_conflict());
    });
    let body = serde_json::to_value(owned_service("10.96.0.9")).unwrap();
    fake.handle(move |when, then| {
        when.method(GET).path(format!("{SERVICES_PATH}/web-test-env"));
        then.status(200).json_body(body.clone());
    });

    let mut runner = new_runner(client.clone());
    let services_api: Api<corev1::Service> = Api::namespaced(client, TEST_NAMESPACE);
    runner.create_services(&services_api).await.unwrap();

    assert_eq!(runner.app("web").cluster_ip.as_deref(), Some("10.96.0.9"));
    fake.assert();
}

#[tokio::test]
async fn test_create_services_conflict_with_foreign_service_aborts() {
    let (mut fake, client) = make_fake_apiserver();
    fake.handle(move |when, then| {
        when.method(POST).path(SERVICES_PATH);
        then.status(409).json_body(status_conflict());
    });
    let mut foreign = owned_service("10.96.0.9");
    foreign
        .metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(SERVICE_ANNOTATION_KEY.into(), "stranger".into());
    let body = serde_json::to_value(foreign).unwrap();
    fake.handle(move |when, then| {
        when.method(GET).path(format!("{SERVICES_PATH}/web-test-env"));
        then.status(200).json_body(body.clone());
    });

    let mut runner = new_runner(client.clone());
    let services_api: Api<corev1::Service> = Api::namespaced(client, TEST_NAMESPACE);
    let err = runner.create_services(&services_api).await.unwrap_err();
    assert!(err.to_string().contains("modified by an external process"), "{err}");
}

#[tokio::test]
async fn test_create_pod_after_image_acquired() {
    let (mut fake, client) = make_fake_apiserver();
    let body = serde_json::to_value(owned_pod("Pending", false)).unwrap();
    fake.handle(move |when, then| {
        when.method(POST).path(PODS_PATH);
        then.status(201).json_body(body.clone());
    });

    let mut runner = new_runner(client.clone());
    runner.app_mut("web").state = AppState::ImageAcquiring;
    runner.handle_worker_event(WorkerEvent::ImageReady {
        app: 0,
        outcome: Box::new(ImageOutcome { pod_image: "nginx:latest".into(), ..Default::default() }),
    });
    assert_eq!(runner.app("web").state, AppState::ImageAcquired);
    assert_eq!(runner.app("web").pod_image.as_deref(), Some("nginx:latest"));

    let pods_api: Api<corev1::Pod> = Api::namespaced(client, TEST_NAMESPACE);
    runner.create_pod(0, &pods_api).await.unwrap();
    assert_eq!(runner.app("web").state, AppState::PodCreated);
    fake.assert();
}

#[tokio::test]
async fn test_create_pod_conflict_adopts_matching_pod() {
    let (mut fake, client) = make_fake_apiserver();
    fake.handle(move |when, then| {
        when.method(POST).path(PODS_PATH);
        then.status(409).json_body(status_conflict());
    });
    let body = serde_json::to_value(owned_pod("Running", false)).unwrap();
    fake.handle(move |when, then| {
        when.method(GET).path(format!("{PODS_PATH}/web-test-env"));
        then.status(200).json_body(body.clone());
    });

    let mut runner = new_runner(client.clone());
    runner.app_mut("web").state = AppState::ImageAcquiring;
    runner.handle_worker_event(WorkerEvent::ImageReady {
        app: 0,
        outcome: Box::new(ImageOutcome { pod_image: "nginx:latest".into(), ..Default::default() }),
    });

    let pods_api: Api<corev1::Pod> = Api::namespaced(client, TEST_NAMESPACE);
    runner.create_pod(0, &pods_api).await.unwrap();
    assert_eq!(runner.app("web").state, AppState::PodStarted);
    fake.assert();
}

#[tokio::test]
async fn test_create_pod_conflict_with_foreign_pod_aborts() {
    let (mut fake, client) = make_fake_apiserver();
    fake.handle(move |when, then| {
        when.method(POST).path(PODS_PATH);
        then.status(409).json_body(status_conflict());
    });
    let mut foreign = owned_pod("Running", false);
    foreign.metadata.annotations = None;
    let body = serde_json::to_value(foreign).unwrap();
    fake.handle(move |when, then| {
        when.method(GET).path(format!("{PODS_PATH}/web-test-env"));
        then.status(200).json_body(body.clone());
    });

    let mut runner = new_runner(client.clone());
    runner.app_mut("web").state = AppState::ImageAcquiring;
    runner.handle_worker_event(WorkerEvent::ImageReady {
        app: 0,
        outcome: Box::new(ImageOutcome { pod_image: "nginx:latest".into(), ..Default::default() }),
    });

    let pods_api: Api<corev1::Pod> = Api::namespaced(client, TEST_NAMESPACE);
    let err = runner.create_pod(0, &pods_api).await.unwrap_err();
    assert!(err.to_string().contains("modified by an external process"), "{err}");
}

#[tokio::test]
async fn test_pod_events_advance_the_state_machine() {
    let (_fake, client) = make_fake_apiserver();
    let mut runner = new_runner(client);
    runner.app_mut("web").state = AppState::PodCreated;

    runner.handle_pod_event(Event::Applied(owned_pod("Running", false))).unwrap();
    assert_eq!(runner.app("web").state, AppState::PodStarted);

    runner.handle_pod_event(Event::Applied(owned_pod("Running", true))).unwrap();
    assert_eq!(runner.app("web").state, AppState::PodReady);

    runner.handle_pod_event(Event::Applied(owned_pod("Succeeded", false))).unwrap();
    assert_eq!(runner.app("web").state, AppState::PodCompleted);
}

#[tokio::test]
async fn test_deleted_pod_fails_the_app() {
    let (_fake, client) = make_fake_apiserver();
    let mut runner = new_runner(client);
    runner.app_mut("web").state = AppState::PodStarted;

    runner.handle_pod_event(Event::Deleted(owned_pod("Running", false))).unwrap();
    assert_eq!(runner.app("web").state, AppState::Failed);
    assert!(runner.app("web").error.as_deref().unwrap().contains("deleted externally"));
}

#[tokio::test]
async fn test_unannotated_pod_event_aborts_the_run() {
    let (_fake, client) = make_fake_apiserver();
    let mut runner = new_runner(client);

    let mut pod = owned_pod("Running", false);
    pod.metadata.annotations = None;
    let err = runner.handle_pod_event(Event::Applied(pod)).unwrap_err();
    assert!(err.to_string().contains("modified by an external process"), "{err}");
}

#[tokio::test]
async fn test_service_events_update_cluster_ips() {
    let (_fake, client) = make_fake_apiserver();
    let mut runner = new_runner(client);

    runner.handle_service_event(Event::Applied(owned_service("10.96.0.3"))).unwrap();
    assert_eq!(runner.app("web").cluster_ip.as_deref(), Some("10.96.0.3"));
}

fn api_group_list(names: &[&str]) -> serde_json::Value {
    json!({
        "kind": "APIGroupList",
        "apiVersion": "v1",
        "groups": names
            .iter()
            .map(|name| {
                json!({
                    "name": name,
                    "versions": [{"groupVersion": format!("{name}/v1"), "version": "v1"}],
                    "preferredVersion": {"groupVersion": format!("{name}/v1"), "version": "v1"},
                })
            })
            .collect::<Vec<_>>(),
    })
}

#[tokio::test]
async fn test_is_openshift_shaped() {
    let (mut fake, client) = make_fake_apiserver();
    fake.handle(|when, then| {
        when.method(GET).path("/apis");
        then.status(200)
            .json_body(api_group_list(&["route.openshift.io", "config.openshift.io", "apps"]));
    });
    assert!(is_openshift_shaped(&client).await.unwrap());
    fake.assert();
}

#[tokio::test]
async fn test_is_openshift_shaped_plain_cluster() {
    let (mut fake, client) = make_fake_apiserver();
    fake.handle(|when, then| {
        when.method(GET).path("/apis");
        then.status(200).json_body(api_group_list(&["apps", "batch", "networking.k8s.io"]));
    });
    assert!(!is_openshift_shaped(&client).await.unwrap());
    fake.assert();
}
