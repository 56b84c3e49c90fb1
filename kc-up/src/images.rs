use std::collections::HashMap;
use std::io::Read;

use bollard::auth::DockerCredentials;
use bollard::container::{
    Config,
    DownloadFromContainerOptions,
    RemoveContainerOptions,
};
use bollard::image::{
    CreateImageOptions,
    ListImagesOptions,
    PushImageOptions,
    TagImageOptions,
};
use bollard::secret::ImageSummary;
use bollard::Docker;
use futures::StreamExt;
use kc_core::compose::Healthcheck;
use kc_core::docker::{
    familiar_name,
    find_digest,
    find_gid_by_name_in_group,
    find_uid_by_name_in_passwd,
    ImageRef,
    Reference,
    Userinfo,
};
use kc_core::errors::*;
use tracing::*;

use crate::healthcheck::healthcheck_from_image;

err_impl! {ImageError,
    #[error("could not resolve image {0} after pulling it")]
    UnresolvedAfterPull(String),

    #[error("could not determine the digest of the pulled image {0}")]
    PullDigestMissing(String),

    #[error("push of image {0} did not report a digest")]
    PushDigestMissing(String),

    #[error("could not copy {0:?} out of the image")]
    FileNotInImage(String),
}

pub async fn list_local_images(docker: &Docker) -> anyhow::Result<Vec<ImageSummary>> {
    Ok(docker
        .list_images(Some(ListImagesOptions::<String> { all: false, ..Default::default() }))
        .await?)
}

// Resolves an image id against a cached image list (like the output of
// "docker images").  The reference is never a partial image id, so a bare
// digest either names a local image outright or misses.
pub fn resolve_local_image_id(
    image_ref: &ImageRef,
    local_images: &[ImageSummary],
) -> Option<(String, Option<String>)> {
    match image_ref {
        ImageRef::Digest(digest) => {
            local_images.iter().any(|s| &s.id == digest).then(|| (digest.clone(), None))
        },
        ImageRef::Named(named) => {
            let familiar = familiar_name(named);
            if let Some(digest) = named.digest() {
                // The daemon reports RepoDigests as a familiar name with a digest.
                let repo_digest = format!("{familiar}@{digest}");
                for summary in local_images {
                    if summary.repo_digests.iter().any(|d| d == &repo_digest) {
                        return Some((summary.id.clone(), Some(repo_digest)));
                    }
                }
            }
            resolve_local_image_id_tag(named, &familiar, local_images).map(|id| (id, None))
        },
    }
}

fn resolve_local_image_id_tag(
    named: &Reference,
    familiar: &str,
    local_images: &[ImageSummary],
) -> Option<String> {
    let tag = named
        .tag()
        .map(str::to_string)
        .or_else(|| named.digest().is_none().then(|| "latest".to_string()))?;
    let repo_tag = format!("{familiar}:{tag}");
    local_images
        .iter()
        .find(|s| s.repo_tags.iter().any(|t| t == &repo_tag))
        .map(|s| s.id.clone())
}

// Pulls the image and recovers (image id, repo digest) by re-querying the
// daemon for the familiar@digest line, which is exactly the information the
// pull leaves behind.
pub async fn pull_image(
    docker: &Docker,
    named: &Reference,
    credentials: Option<DockerCredentials>,
    mut on_progress: impl FnMut(String),
) -> anyhow::Result<(String, String)> {
    let familiar = familiar_name(named);
    let from_image = match (named.digest(), named.tag()) {
        (Some(digest), _) => format!("{familiar}@{digest}"),
        (None, Some(tag)) => format!("{familiar}:{tag}"),
        (None, None) => format!("{familiar}:latest"),
    };

    let options = CreateImageOptions { from_image: from_image.clone(), ..Default::default() };
    let mut stream = docker.create_image(Some(options), None, credentials);
    let mut digest = named.digest().map(str::to_string);
    while let Some(frame) = stream.next().await {
        let info = frame?;
        if let Some(error) = info.error {
            bail!("error while pulling image {from_image}: {error}");
        }
        if let Some(status) = info.status {
            if digest.is_none() {
                digest = find_digest(&status);
            }
            on_progress(status);
        }
    }
    let digest = digest.ok_or_else(|| ImageError::pull_digest_missing(&from_image))?;

    resolve_local_image_after_pull(docker, named, &digest)
        .await?
        .ok_or_else(|| ImageError::unresolved_after_pull(&from_image))
}

/// Resolves an image by repository and digest, the information available
/// right after a pull completes.
pub async fn resolve_local_image_after_pull(
    docker: &Docker,
    named: &Reference,
    digest: &str,
) -> anyhow::Result<Option<(String, String)>> {
    let familiar = familiar_name(named);
    let filters = HashMap::from([("reference".to_string(), vec![familiar.clone()])]);
    let summaries = docker
        .list_images(Some(ListImagesOptions { all: false, filters, ..Default::default() }))
        .await?;

    let repo_digest = format!("{familiar}@{digest}");
    for summary in summaries {
        if summary.repo_digests.iter().any(|d| d == &repo_digest) {
            return Ok(Some((summary.id, repo_digest)));
        }
    }
    Ok(None)
}

// Tags the resolved local image with the registry-qualified target and
// pushes it, decoding the daemon's progress frames as they stream by.  The
// pushed digest comes out of the final status frames; a push that never
// reports one is an error.
pub async fn push_image(
    docker: &Docker,
    local_image: &str,
    target_repo: &str,
    credentials: Option<DockerCredentials>,
    mut on_progress: impl FnMut(String),
) -> anyhow::Result<String> {
    docker
        .tag_image(local_image, Some(TagImageOptions { repo: target_repo, tag: "latest" }))
        .await?;

    let mut stream =
        docker.push_image(target_repo, Some(PushImageOptions { tag: "latest" }), credentials);
    let mut digest = None;
    while let Some(frame) = stream.next().await {
        let info = frame?;
        if let Some(error) = info.error {
            bail!("error while pushing image {target_repo}: {error}");
        }
        if let Some(status) = info.status {
            if let Some(found) = find_digest(&status) {
                digest = Some(found);
            }
            on_progress(status);
        }
    }

    let digest = digest.ok_or_else(|| ImageError::push_digest_missing(target_repo))?;
    Ok(format!("{target_repo}@{digest}"))
}

/// The image-inherited healthcheck and default user, from `docker inspect`.
pub async fn inspect_image(
    docker: &Docker,
    image: &str,
) -> anyhow::Result<(Option<Healthcheck>, Option<String>)> {
    let inspect = docker.inspect_image(image).await?;
    let config = inspect.config;
    let healthcheck =
        config.as_ref().and_then(|c| c.healthcheck.as_ref()).and_then(healthcheck_from_image);
    let user = config.and_then(|c| c.user).filter(|u| !u.is_empty());
    Ok((healthcheck, user))
}

// Resolves named user/group parts by reading /etc/passwd and /etc/group out
// of the image.  The files are extracted by creating a throwaway container
// and copying them out; the container never runs.
pub async fn userinfo_from_image(
    docker: &Docker,
    image: &str,
    userinfo: &mut Userinfo,
) -> EmptyResult {
    if userinfo.uid.is_some() && (userinfo.gid.is_some() || userinfo.group.is_empty()) {
        return Ok(());
    }

    let config = Config {
        image: Some(image.to_string()),
        entrypoint: Some(vec!["sh".to_string()]),
        working_dir: Some("/".to_string()),
        ..Default::default()
    };
    let container = docker.create_container::<String, String>(None, config).await?;
    let result = userinfo_from_container(docker, &container.id, userinfo).await;
    if let Err(err) = docker
        .remove_container(&container.id, Some(RemoveContainerOptions { force: true, ..Default::default() }))
        .await
    {
        warn!("could not remove the userinfo scratch container: {err}");
    }
    result
}

async fn userinfo_from_container(
    docker: &Docker,
    container_id: &str,
    userinfo: &mut Userinfo,
) -> EmptyResult {
    if userinfo.uid.is_none() {
        let passwd = read_container_file(docker, container_id, "/etc/passwd").await?;
        let uid = find_uid_by_name_in_passwd(&passwd, &userinfo.user)?.ok_or_else(|| {
            anyhow!("unable to find user {}: no matching entries in passwd file", userinfo.user)
        })?;
        userinfo.uid = Some(uid);
    }
    if userinfo.gid.is_none() && !userinfo.group.is_empty() {
        let group = read_container_file(docker, container_id, "/etc/group").await?;
        let gid = find_gid_by_name_in_group(&group, &userinfo.group)?.ok_or_else(|| {
            anyhow!("unable to find group {}: no matching entries in group file", userinfo.group)
        })?;
        userinfo.gid = Some(gid);
    }
    Ok(())
}

async fn read_container_file(
    docker: &Docker,
    container_id: &str,
    path: &str,
) -> anyhow::Result<String> {
    let mut stream =
        docker.download_from_container(container_id, Some(DownloadFromContainerOptions { path }));
    let mut bytes = vec![];
    while let Some(chunk) = stream.next().await {
        bytes.extend_from_slice(&chunk?);
    }

    // The daemon hands the file back as a tar stream.
    let mut archive = tar::Archive::new(bytes.as_slice());
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.header().entry_type() == tar::EntryType::Regular {
            let mut content = String::new();
            entry.read_to_string(&mut content)?;
            return Ok(content);
        }
    }
    bail!(ImageError::file_not_in_image(path))
}
