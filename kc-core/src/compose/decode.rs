use std::collections::BTreeMap;
use std::fmt;

use serde::de::{
    Deserializer,
    MapAccess,
    SeqAccess,
    Visitor,
};
use serde::Deserialize;

// Raw serde model for a docker-compose v2.1 file.  Every polymorphic field
// gets its own variant type here; turning these into the normalised model is
// the job of compose/mod.rs.  Unknown keys are ignored on purpose, we only
// consume the subset of the schema we translate.

#[derive(Debug, Default, Deserialize)]
pub(super) struct RawComposeFile {
    #[allow(dead_code)]
    pub(super) version: Option<String>,
    #[serde(default)]
    pub(super) services: BTreeMap<String, RawService>,
    #[serde(default, rename = "x-kube-compose")]
    pub(super) x_kube_compose: Option<RawKubeComposeExt>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub(super) struct RawService {
    pub(super) build: Option<RawBuild>,
    pub(super) command: Option<StringOrList>,
    pub(super) depends_on: Option<RawDependsOn>,
    pub(super) entrypoint: Option<StringOrList>,
    pub(super) environment: Option<RawEnvironment>,
    pub(super) extends: Option<RawExtends>,
    pub(super) healthcheck: Option<RawHealthcheck>,
    pub(super) image: Option<String>,
    pub(super) ports: Option<Vec<RawPort>>,
    pub(super) restart: Option<String>,
    pub(super) user: Option<String>,
    pub(super) volumes: Option<Vec<String>>,
    pub(super) working_dir: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub(super) enum RawBuild {
    Context(String),
    Full {
        context: String,
        dockerfile: Option<String>,
    },
}

#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub(super) enum StringOrList {
    List(Vec<String>),
    String(String),
}

// `depends_on` is either a plain list of service names (all of which get the
// service_started condition) or a map of name -> {condition}.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub(super) enum RawDependsOn {
    List(Vec<String>),
    Map(BTreeMap<String, RawDependsOnEntry>),
}

#[derive(Clone, Debug, Deserialize)]
pub(super) struct RawDependsOnEntry {
    pub(super) condition: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub(super) enum RawExtends {
    Service(String),
    Full {
        file: Option<String>,
        service: String,
    },
}

#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub(super) enum RawPort {
    Int(i64),
    String(String),
}

#[derive(Clone, Debug, Default, Deserialize)]
pub(super) struct RawHealthcheck {
    pub(super) disable: Option<bool>,
    pub(super) interval: Option<String>,
    pub(super) retries: Option<u64>,
    pub(super) test: Option<RawHealthcheckTest>,
    pub(super) timeout: Option<String>,
}

// A bare string is an implicit CMD-SHELL test.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub(super) enum RawHealthcheckTest {
    Command(Vec<String>),
    Shell(String),
}

#[derive(Clone, Debug, Default, Deserialize)]
pub(super) struct RawKubeComposeExt {
    pub(super) push_images: Option<RawPushImages>,
    pub(super) volume_init_base_image: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub(super) struct RawPushImages {
    pub(super) docker_registry: String,
}

// A scalar environment value; the int64-vs-float64 split happens during
// normalisation so that the numeric rule lives in exactly one place.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub(super) enum RawEnvScalar {
    Number(f64),
    String(String),
}

// `environment` is either a list of KEY[=VAL] strings or a map of scalars.
// The map form needs a hand-written visitor because entry order is
// significant and serde's untagged machinery would lose it in a BTreeMap.
#[derive(Clone, Debug, Default)]
pub(super) struct RawEnvironment(pub(super) Vec<(String, Option<RawEnvScalar>)>);

impl<'de> Deserialize<'de> for RawEnvironment {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct EnvironmentVisitor;

        impl<'de> Visitor<'de> for EnvironmentVisitor {
            type Value = RawEnvironment;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a sequence of KEY[=VAL] strings or a map of scalar values")
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let mut values = vec![];
                while let Some(entry) = seq.next_element::<String>()? {
                    match entry.split_once('=') {
                        Some((name, value)) => {
                            values.push((name.into(), Some(RawEnvScalar::String(value.into()))));
                        },
                        None => values.push((entry, None)),
                    }
                }
                Ok(RawEnvironment(values))
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut values = vec![];
                while let Some(entry) = map.next_entry::<String, Option<RawEnvScalar>>()? {
                    values.push(entry);
                }
                Ok(RawEnvironment(values))
            }
        }

        deserializer.deserialize_any(EnvironmentVisitor)
    }
}
