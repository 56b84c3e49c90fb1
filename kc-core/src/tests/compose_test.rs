use std::time::Duration;

use rstest::*;

use crate::compose::*;

fn service(yaml_body: &str) -> Service {
    let text = format!("services:\n  app:\n{yaml_body}");
    ComposeFile::parse(&text).unwrap().get("app").unwrap().clone()
}

#[test]
fn test_environment_numeric_decode() {
    let svc = service(
        "    image: x\n    environment:\n      INT: 42\n      FLOAT: 1.5\n      BIG_INT: \
         9.223372036854775e18\n      BIG_FLOAT: 9.3e18\n      NEGATIVE: -7\n",
    );
    let values: Vec<(&str, Option<&EnvironmentValue>)> =
        svc.environment.iter().map(|e| (e.name.as_str(), e.value.as_ref())).collect();
    assert_eq!(values[0], ("INT", Some(&EnvironmentValue::Int64(42))));
    assert_eq!(values[1], ("FLOAT", Some(&EnvironmentValue::Float(1.5))));
    assert_eq!(values[2], ("BIG_INT", Some(&EnvironmentValue::Int64(9223372036854774784))));
    assert_eq!(values[3], ("BIG_FLOAT", Some(&EnvironmentValue::Float(9.3e18))));
    assert_eq!(values[4], ("NEGATIVE", Some(&EnvironmentValue::Int64(-7))));
}

#[test]
fn test_environment_map_and_list_agree() {
    let from_map = service("    image: x\n    environment:\n      A: \"1\"\n      B: x\n      C:\n");
    let from_list = service("    image: x\n    environment:\n      - A=1\n      - B=x\n      - C\n");
    assert_eq!(from_map.environment, from_list.environment);
    assert_eq!(from_map.environment[2], EnvVar { name: "C".into(), value: None });
}

#[test]
fn test_environment_preserves_insertion_order() {
    let svc = service("    image: x\n    environment:\n      ZED: \"1\"\n      ALPHA: \"2\"\n");
    let names: Vec<&str> = svc.environment.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["ZED", "ALPHA"]);
}

#[test]
fn test_depends_on_list_form() {
    let text = "services:\n  a:\n    image: x\n    depends_on:\n      - b\n      - c\n  b:\n    image: \
                x\n  c:\n    image: x\n";
    let file = ComposeFile::parse(text).unwrap();
    let a = file.get("a").unwrap();
    assert_eq!(a.depends_on.get("b"), Some(&ServiceHealthiness::Started));
    assert_eq!(a.depends_on.get("c"), Some(&ServiceHealthiness::Started));
}

#[test]
fn test_depends_on_map_form() {
    let text = "services:\n  a:\n    image: x\n    depends_on:\n      b:\n        condition: \
                service_healthy\n      c:\n        condition: service_completed_successfully\n  b:\n    \
                image: x\n  c:\n    image: x\n";
    let file = ComposeFile::parse(text).unwrap();
    let a = file.get("a").unwrap();
    assert_eq!(a.depends_on.get("b"), Some(&ServiceHealthiness::Healthy));
    assert_eq!(a.depends_on.get("c"), Some(&ServiceHealthiness::CompletedSuccessfully));
}

#[test]
fn test_depends_on_duplicate_list_entries() {
    let text = "services:\n  a:\n    image: x\n    depends_on:\n      - b\n      - b\n  b:\n    image: x\n";
    let err = ComposeFile::parse(text).unwrap_err();
    assert!(err.to_string().contains("duplicate"), "{err}");
}

#[test]
fn test_depends_on_invalid_condition() {
    let text = "services:\n  a:\n    image: x\n    depends_on:\n      b:\n        condition: \
                service_wished_well\n  b:\n    image: x\n";
    let err = ComposeFile::parse(text).unwrap_err();
    assert!(err.to_string().contains("invalid condition"), "{err}");
}

#[test]
fn test_depends_on_unknown_service() {
    let text = "services:\n  a:\n    image: x\n    depends_on:\n      - ghost\n";
    let err = ComposeFile::parse(text).unwrap_err();
    assert!(err.to_string().contains("undefined service"), "{err}");
}

#[test]
fn test_healthcheck_string_test_is_shell_form() {
    let svc = service("    image: x\n    healthcheck:\n      test: curl -f http://localhost\n");
    let hc = svc.healthcheck.unwrap();
    assert!(hc.is_shell);
    assert_eq!(hc.test, vec!["curl -f http://localhost"]);
    assert_eq!(hc.interval, Duration::from_secs(30));
    assert_eq!(hc.timeout, Duration::from_secs(30));
    assert_eq!(hc.retries, 3);
}

#[test]
fn test_healthcheck_cmd_exec_form() {
    let svc = service(
        "    image: x\n    healthcheck:\n      test: [\"CMD\", \"pg_isready\", \"-U\", \"postgres\"]\n      \
         interval: 1m30s\n      timeout: 2s\n      retries: 5\n",
    );
    let hc = svc.healthcheck.unwrap();
    assert!(!hc.is_shell);
    assert_eq!(hc.test, vec!["pg_isready", "-U", "postgres"]);
    assert_eq!(hc.interval, Duration::from_secs(90));
    assert_eq!(hc.timeout, Duration::from_secs(2));
    assert_eq!(hc.retries, 5);
}

#[test]
fn test_healthcheck_cmd_shell_form() {
    let svc = service("    image: x\n    healthcheck:\n      test: [\"CMD-SHELL\", \"exit 0\"]\n");
    let hc = svc.healthcheck.unwrap();
    assert!(hc.is_shell);
    assert_eq!(hc.test, vec!["exit 0"]);
}

#[rstest]
#[case::none_sentinel("    image: x\n    healthcheck:\n      test: [\"NONE\"]\n")]
#[case::disable_flag("    image: x\n    healthcheck:\n      disable: true\n")]
fn test_healthcheck_disabled(#[case] body: &str) {
    let svc = service(body);
    assert!(svc.healthcheck.is_none());
    assert!(svc.healthcheck_disabled);
}

#[test]
fn test_healthcheck_unknown_sentinel() {
    let text = "services:\n  a:\n    image: x\n    healthcheck:\n      test: [\"RUN\", \"x\"]\n";
    assert!(ComposeFile::parse(text).is_err());
}

#[test]
fn test_ports_int_and_string_forms() {
    let svc = service(
        "    image: x\n    ports:\n      - 8080\n      - \"5432:5432\"\n      - \"127.0.0.1:2222:22\"\n      \
         - \"53:53/udp\"\n",
    );
    let ports: Vec<(i32, &str)> = svc.ports.iter().map(|p| (p.port, p.protocol.as_str())).collect();
    assert_eq!(ports, vec![(8080, "tcp"), (5432, "tcp"), (22, "tcp"), (53, "udp")]);
}

#[rstest]
#[case::not_a_number("      - \"eighty\"\n")]
#[case::bad_protocol("      - \"53:53/icmp\"\n")]
#[case::out_of_range("      - 70000\n")]
fn test_ports_invalid(#[case] port_line: &str) {
    let text = format!("services:\n  a:\n    image: x\n    ports:\n{port_line}");
    assert!(ComposeFile::parse(&text).is_err());
}

#[test]
fn test_volumes_short_syntax() {
    let svc = service(
        "    image: x\n    volumes:\n      - /data:/var/lib/data:ro\n      - ./conf:/etc/conf\n      - \
         named-vol:/cache\n      - /anon\n",
    );
    assert_eq!(
        svc.volumes[0],
        PathMapping {
            host_path: Some("/data".into()),
            container_path: "/var/lib/data".into(),
            mode: Some("ro".into()),
        }
    );
    assert_eq!(svc.volumes[1].host_path.as_deref(), Some("./conf"));
    assert_eq!(svc.volumes[2].host_path, None);
    assert_eq!(svc.volumes[3], PathMapping { host_path: None, container_path: "/anon".into(), mode: None });
    assert_eq!(svc.bind_mounts().len(), 2);
}

#[test]
fn test_volumes_bad_mode() {
    let text = "services:\n  a:\n    image: x\n    volumes:\n      - /data:/data:rx\n";
    let err = ComposeFile::parse(text).unwrap_err();
    assert!(err.to_string().contains("volume mode"), "{err}");
}

#[rstest]
#[case::no("no", Some(RestartPolicy::No))]
#[case::always("always", Some(RestartPolicy::Always))]
#[case::on_failure("on-failure", Some(RestartPolicy::OnFailure))]
fn test_restart_policy(#[case] value: &str, #[case] expected: Option<RestartPolicy>) {
    let svc = service(&format!("    image: x\n    restart: {value}\n"));
    assert_eq!(svc.restart, expected);
}

#[test]
fn test_restart_policy_invalid() {
    let text = "services:\n  a:\n    image: x\n    restart: sometimes\n";
    assert!(ComposeFile::parse(text).is_err());
}

#[test]
fn test_command_string_form_runs_under_shell() {
    let svc = service("    image: x\n    command: echo hello\n");
    assert_eq!(svc.command.unwrap(), vec!["/bin/sh", "-c", "echo hello"]);
}

#[test]
fn test_extends_same_file() {
    let text = "services:\n  base:\n    image: base-image\n    environment:\n      A: \"1\"\n      B: \
                \"2\"\n    user: app\n  child:\n    extends: base\n    environment:\n      B: \"3\"\n      \
                C: \"4\"\n";
    let file = ComposeFile::parse(text).unwrap();
    let child = file.get("child").unwrap();
    assert_eq!(child.image.as_deref(), Some("base-image"));
    assert_eq!(child.user.as_deref(), Some("app"));
    let pairs: Vec<(&str, String)> = child
        .environment
        .iter()
        .map(|e| (e.name.as_str(), e.value.as_ref().unwrap().stringified()))
        .collect();
    assert_eq!(pairs, vec![("A", "1".into()), ("B", "3".into()), ("C", "4".into())]);
}

#[test]
fn test_extends_does_not_inherit_depends_on() {
    let text = "services:\n  base:\n    image: x\n    depends_on:\n      - dep\n  child:\n    extends:\n      \
                service: base\n  dep:\n    image: x\n";
    let file = ComposeFile::parse(text).unwrap();
    assert!(file.get("child").unwrap().depends_on.is_empty());
}

#[test]
fn test_extends_unknown_service() {
    let text = "services:\n  child:\n    extends: nope\n";
    let err = ComposeFile::parse(text).unwrap_err();
    assert!(err.to_string().contains("extends"), "{err}");
}

#[test]
fn test_x_kube_compose_extension() {
    let text = "services:\n  a:\n    image: x\nx-kube-compose:\n  push_images:\n    docker_registry: \
                registry.example.com:5000\n  volume_init_base_image: ubuntu:20.04\n";
    let file = ComposeFile::parse(text).unwrap();
    assert_eq!(file.push_images.as_ref().unwrap().docker_registry, "registry.example.com:5000");
    assert_eq!(file.volume_init_base_image.as_deref(), Some("ubuntu:20.04"));
}

#[rstest]
#[case::seconds("30s", Duration::from_secs(30))]
#[case::minutes_and_seconds("1m30s", Duration::from_secs(90))]
#[case::hours("1h", Duration::from_secs(3600))]
#[case::millis("500ms", Duration::from_millis(500))]
#[case::fractional("2.5s", Duration::from_millis(2500))]
fn test_parse_compose_duration(#[case] input: &str, #[case] expected: Duration) {
    assert_eq!(parse_compose_duration(input).unwrap(), expected);
}

#[rstest]
#[case::missing_unit("5")]
#[case::unknown_unit("5parsecs")]
#[case::empty("")]
fn test_parse_compose_duration_invalid(#[case] input: &str) {
    assert!(parse_compose_duration(input).is_err());
}
