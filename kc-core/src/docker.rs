use std::sync::OnceLock;

pub use oci_distribution::Reference;
use regex::Regex;

use crate::errors::*;

const DOCKER_HUB_REGISTRY: &str = "docker.io";
const DOCKER_HUB_LIBRARY_PREFIX: &str = "library/";

err_impl! {DockerError,
    #[error("invalid image reference: {0:?}")]
    InvalidImageRef(String),

    #[error("malformed passwd/group file line: {0:?}")]
    MalformedUserDatabase(String),
}

// An image reference is either a bare content digest (an image ID, which only
// the local daemon can resolve) or a named reference that may additionally
// carry a tag and/or digest.  Partial image IDs are not accepted.
#[derive(Clone, Debug)]
pub enum ImageRef {
    Digest(String),
    Named(Reference),
}

pub fn parse_image_ref(value: &str) -> anyhow::Result<ImageRef> {
    static BARE_DIGEST_REGEX: OnceLock<Regex> = OnceLock::new();
    let bare_digest = BARE_DIGEST_REGEX.get_or_init(|| Regex::new(r"^sha256:[0-9a-f]{64}$").unwrap());
    if bare_digest.is_match(value) {
        return Ok(ImageRef::Digest(value.into()));
    }
    let named: Reference = value.parse().map_err(|_| DockerError::invalid_image_ref(value))?;
    Ok(ImageRef::Named(named))
}

// The familiar (short) form of a named reference, the way `docker images`
// prints repositories: the default registry and the library/ prefix of
// official images are dropped.
pub fn familiar_name(named: &Reference) -> String {
    let repository = named.repository();
    if named.registry().is_empty() || named.registry() == DOCKER_HUB_REGISTRY {
        repository.strip_prefix(DOCKER_HUB_LIBRARY_PREFIX).unwrap_or(repository).into()
    } else {
        format!("{}/{}", named.registry(), repository)
    }
}

/// Scans free-form daemon output for a sha256 content digest.
pub fn find_digest(text: &str) -> Option<String> {
    digest_regex().find(text).map(|m| m.as_str().into())
}

fn digest_regex() -> &'static Regex {
    static DIGEST_REGEX: OnceLock<Regex> = OnceLock::new();
    DIGEST_REGEX.get_or_init(|| Regex::new(r"sha256:[0-9a-f]{64}").unwrap())
}

// The user/group a compose service asks to run as.  Numeric parts resolve
// immediately; named parts need the image's passwd/group databases.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Userinfo {
    pub user: String,
    pub group: String,
    pub uid: Option<i64>,
    pub gid: Option<i64>,
}

pub fn parse_userinfo(value: &str) -> Userinfo {
    let (user, group) = match value.split_once(':') {
        Some((user, group)) => (user, group),
        None => (value, ""),
    };
    Userinfo {
        user: user.into(),
        group: group.into(),
        uid: user.parse().ok(),
        gid: group.parse().ok(),
    }
}

/// Looks a user up in passwd(5) content (name:password:UID:GID:GECOS:dir:shell).
pub fn find_uid_by_name_in_passwd(passwd: &str, name: &str) -> anyhow::Result<Option<i64>> {
    find_id_in_database(passwd, name, 7)
}

/// Looks a group up in group(5) content (name:password:GID:members); the
/// layout differs from passwd so the two lookups are separate.
pub fn find_gid_by_name_in_group(group: &str, name: &str) -> anyhow::Result<Option<i64>> {
    find_id_in_database(group, name, 4)
}

fn find_id_in_database(content: &str, name: &str, field_count: usize) -> anyhow::Result<Option<i64>> {
    for line in content.lines() {
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(':').collect();
        if fields.first() != Some(&name) {
            continue;
        }
        if fields.len() != field_count {
            bail!(DockerError::malformed_user_database(line));
        }
        // Both formats keep the numeric id in the third field.
        let id = fields[2].parse::<i64>().map_err(|_| DockerError::malformed_user_database(line))?;
        return Ok(Some(id));
    }
    Ok(None)
}
