use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kc_core::compose::{
    RestartPolicy,
    Service,
};
use kc_core::config::Environment;
use kc_core::k8s::{
    common_labels,
    init_object_meta,
};
use kc_core::prelude::*;

pub const VOLUME_INIT_CONTAINER_NAME: &str = "volume-init";

// Everything the pod builder needs beyond the service definition itself;
// gathered by the reconciler once the image work for the app is done.
#[derive(Debug, Default)]
pub struct PodAssembly {
    pub image: String,
    pub readiness_probe: Option<corev1::Probe>,
    pub host_aliases: Vec<corev1::HostAlias>,
    pub run_as: Option<(i64, Option<i64>)>,
    pub volume_init_image: Option<String>,
}

pub fn restart_policy_for(service: &Service) -> &'static str {
    match service.restart {
        Some(RestartPolicy::Always) => "Always",
        Some(RestartPolicy::OnFailure) => "OnFailure",
        Some(RestartPolicy::No) | None => "Never",
    }
}

// Expands the compose environment list into pod env vars.  Entries without a
// value inherit from the process environment at translation time; entries
// absent there too are dropped, like docker-compose drops them.
pub fn expand_environment(service: &Service) -> Vec<corev1::EnvVar> {
    service
        .environment
        .iter()
        .filter_map(|entry| {
            let value = match &entry.value {
                Some(value) => Some(value.stringified()),
                None => std::env::var(&entry.name).ok(),
            }?;
            Some(corev1::EnvVar { name: entry.name.clone(), value: Some(value), value_from: None })
        })
        .collect()
}

pub fn build_pod(env: &Environment, service: &Service, assembly: &PodAssembly) -> corev1::Pod {
    let mut metadata = metav1::ObjectMeta::default();
    init_object_meta(env, service, &mut metadata);

    let mut volumes = vec![];
    let mut volume_mounts = vec![];
    let mut init_containers = None;
    if let Some(volume_init_image) = &assembly.volume_init_image {
        let mut init_mounts = vec![];
        for (i, mapping) in service.bind_mounts().iter().enumerate() {
            let volume_name = format!("vol{}", i + 1);
            volumes.push(corev1::Volume {
                name: volume_name.clone(),
                empty_dir: Some(Default::default()),
                ..Default::default()
            });
            // The init container copies the embedded host content to
            // /mnt/vol<i>/root; the app container mounts that subtree.
            init_mounts.push(corev1::VolumeMount {
                name: volume_name.clone(),
                mount_path: format!("/mnt/vol{}", i + 1),
                ..Default::default()
            });
            volume_mounts.push(corev1::VolumeMount {
                name: volume_name,
                mount_path: mapping.container_path.clone(),
                sub_path: Some("root".into()),
                read_only: Some(mapping.mode.as_deref() == Some("ro")),
                ..Default::default()
            });
        }
        init_containers = Some(vec![corev1::Container {
            name: VOLUME_INIT_CONTAINER_NAME.into(),
            image: Some(volume_init_image.clone()),
            volume_mounts: Some(init_mounts),
            ..Default::default()
        }]);
    }

    let security_context = assembly.run_as.map(|(uid, gid)| corev1::PodSecurityContext {
        run_as_user: Some(uid),
        run_as_group: gid,
        ..Default::default()
    });

    let container = corev1::Container {
        name: service.name_escaped.clone(),
        image: Some(assembly.image.clone()),
        // docker's entrypoint/command pair maps onto command/args.
        command: service.entrypoint.clone(),
        args: service.command.clone(),
        env: Some(expand_environment(service)),
        ports: Some(
            service
                .ports
                .iter()
                .map(|p| corev1::ContainerPort {
                    container_port: p.port,
                    protocol: Some(p.protocol.to_uppercase()),
                    ..Default::default()
                })
                .collect(),
        ),
        readiness_probe: assembly.readiness_probe.clone(),
        volume_mounts: if volume_mounts.is_empty() { None } else { Some(volume_mounts) },
        working_dir: service.working_dir.clone(),
        ..Default::default()
    };

    corev1::Pod {
        metadata,
        spec: Some(corev1::PodSpec {
            containers: vec![container],
            init_containers,
            host_aliases: if assembly.host_aliases.is_empty() {
                None
            } else {
                Some(assembly.host_aliases.clone())
            },
            restart_policy: Some(restart_policy_for(service).into()),
            security_context,
            volumes: if volumes.is_empty() { None } else { Some(volumes) },
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn build_service(env: &Environment, service: &Service) -> corev1::Service {
    let mut metadata = metav1::ObjectMeta::default();
    init_object_meta(env, service, &mut metadata);

    let ports = service
        .ports
        .iter()
        .map(|p| corev1::ServicePort {
            name: Some(format!("{}{}", p.protocol, p.port)),
            port: p.port,
            protocol: Some(p.protocol.to_uppercase()),
            target_port: Some(IntOrString::Int(p.port)),
            ..Default::default()
        })
        .collect();

    corev1::Service {
        metadata,
        spec: Some(corev1::ServiceSpec {
            ports: Some(ports),
            selector: Some(selector_labels(env, service)),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn selector_labels(env: &Environment, service: &Service) -> BTreeMap<String, String> {
    common_labels(env, service)
}

/// One host alias per sibling with a known ClusterIP, so pods can resolve
/// both the original compose name and the escaped name.
pub fn host_alias(cluster_ip: &str, original_name: &str, escaped_name: &str) -> corev1::HostAlias {
    let mut hostnames = vec![original_name.to_string()];
    if escaped_name != original_name {
        hostnames.push(escaped_name.to_string());
    }
    corev1::HostAlias { hostnames: Some(hostnames), ip: Some(cluster_ip.to_string()) }
}
