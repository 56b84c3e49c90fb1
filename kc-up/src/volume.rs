use std::collections::HashMap;
use std::io::{
    self,
    Write,
};
use std::path::{
    Component,
    Path,
    PathBuf,
};

use bollard::image::BuildImageOptions;
use bollard::secret::ImageId;
use bollard::Docker;
use bytes::Bytes;
use futures::StreamExt;
use kc_core::docker::find_digest;
use kc_core::errors::*;
use kc_core::fs::{
    FileType,
    Filesystem,
    Metadata,
};
use tracing::*;

err_impl! {VolumeError,
    #[error("target of symlink {0:?} is outside the bind volume")]
    SymlinkOutsideBindVolume(String),

    #[error("file {0:?} is neither a symlink, a directory nor a regular file")]
    IrregularFile(String),

    #[error("could not parse an image id from the docker build output stream")]
    NoImageIdInBuildOutput(String),
}

// Synthesises the Dockerfile for the volume-init image: one COPY per bind
// mount (trailing slashes iff the host path is a directory) and an
// entrypoint that seeds every pod-mounted volume at startup.
fn volume_init_dockerfile(is_dir: &[bool]) -> String {
    let mut dockerfile = String::from("ARG BASE_IMAGE\nFROM ${BASE_IMAGE}\n");
    for (i, is_dir) in is_dir.iter().enumerate() {
        let slash = if *is_dir { "/" } else { "" };
        dockerfile.push_str(&format!("COPY data{n}{slash} /app/data/vol{n}{slash}\n", n = i + 1));
    }
    dockerfile.push_str("ENTRYPOINT [\"bash\", \"-c\", \"");
    for i in 1..=is_dir.len() {
        if i > 1 {
            dockerfile.push_str(" && ");
        }
        dockerfile.push_str(&format!("cp -ar /app/data/vol{i} /mnt/vol{i}/root"));
    }
    dockerfile.push_str("\"]\n");
    dockerfile
}

// Walks one bind-mount host tree and appends it to the build context under
// the name `rename_to`.  Symlinks survive only when their (lexically
// resolved) target stays inside the bind root; they are rewritten to
// relative in-tar targets so the image is self-contained.
struct TarHelper<'a, W: Write> {
    tar: &'a mut tar::Builder<W>,
    fs: &'a dyn Filesystem,
    root: &'a Path,
    rename_to: &'a str,
}

impl<W: Write> TarHelper<'_, W> {
    fn run(&mut self, host: &Path, name_in_tar: &str) -> anyhow::Result<bool> {
        let meta = self.fs.symlink_metadata(host)?;
        self.run_recursive(&meta, host, name_in_tar)?;
        Ok(meta.file_type == FileType::Directory)
    }

    fn run_recursive(&mut self, meta: &Metadata, host: &Path, name_in_tar: &str) -> EmptyResult {
        match meta.file_type {
            FileType::Symlink => self.run_symlink(host, name_in_tar),
            FileType::Directory => self.run_directory(meta, host, name_in_tar),
            FileType::Regular => self.run_regular(meta, host, name_in_tar),
            FileType::Other => bail!(VolumeError::irregular_file(&host.display().to_string())),
        }
    }

    fn run_regular(&mut self, meta: &Metadata, host: &Path, name_in_tar: &str) -> EmptyResult {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_mode(meta.mode);
        header.set_size(meta.size);
        let reader = self.fs.open(host)?;
        self.tar.append_data(&mut header, name_in_tar, reader)?;
        Ok(())
    }

    fn run_directory(&mut self, meta: &Metadata, host: &Path, name_in_tar: &str) -> EmptyResult {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Directory);
        header.set_mode(meta.mode);
        header.set_size(0);
        self.tar.append_data(&mut header, format!("{name_in_tar}/"), io::empty())?;

        for entry in self.fs.read_dir(host)? {
            let child = host.join(&entry);
            let child_meta = self.fs.symlink_metadata(&child)?;
            self.run_recursive(&child_meta, &child, &format!("{name_in_tar}/{entry}"))?;
        }
        Ok(())
    }

    fn run_symlink(&mut self, host: &Path, name_in_tar: &str) -> EmptyResult {
        let link = self.fs.read_link(host)?;
        let resolved = if link.is_absolute() {
            lexical_clean(&link)
        } else {
            lexical_clean(&host.parent().unwrap_or(Path::new("/")).join(link))
        };
        // Rewrite the target to a path relative to the link's directory
        // inside the tar; both paths are cleaned and slash-separated.
        let Ok(suffix) = resolved.strip_prefix(self.root) else {
            bail!(VolumeError::symlink_outside_bind_volume(&host.display().to_string()));
        };
        let target_in_tar = if suffix.as_os_str().is_empty() {
            self.rename_to.to_string()
        } else {
            format!("{}/{}", self.rename_to, slash_path(suffix))
        };
        let link_dir = match name_in_tar.rsplit_once('/') {
            Some((dir, _)) => dir,
            None => "",
        };
        let relative_target = relative_slash_path(link_dir, &target_in_tar);

        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Symlink);
        header.set_mode(0o777);
        header.set_size(0);
        header.set_link_name(&relative_target)?;
        self.tar.append_data(&mut header, name_in_tar, io::empty())?;
        Ok(())
    }
}

/// Builds the in-memory tar build context for the volume-init image.
pub fn build_volume_init_context(fs: &dyn Filesystem, bind_paths: &[PathBuf]) -> anyhow::Result<Vec<u8>> {
    let mut tar = tar::Builder::new(Vec::new());
    let mut is_dir = vec![];
    for (i, host_path) in bind_paths.iter().enumerate() {
        let rename_to = format!("data{}", i + 1);
        let mut helper = TarHelper { tar: &mut tar, fs, root: host_path, rename_to: &rename_to };
        is_dir.push(helper.run(host_path, &rename_to)?);
    }

    let dockerfile = volume_init_dockerfile(&is_dir);
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_mode(0o644);
    header.set_size(dockerfile.len() as u64);
    tar.append_data(&mut header, "Dockerfile", dockerfile.as_bytes())?;
    Ok(tar.into_inner()?)
}

// Builds the volume-init image and returns its id.  The build runs with
// SuppressOutput so the JSON stream only carries the final image id, but the
// raw stream is collected anyway so a parse failure can surface what the
// daemon actually said.
pub async fn build_volume_init_image(
    docker: &Docker,
    fs: &dyn Filesystem,
    bind_paths: &[PathBuf],
    base_image: &str,
) -> anyhow::Result<String> {
    let context = build_volume_init_context(fs, bind_paths)?;
    let options = BuildImageOptions {
        dockerfile: "Dockerfile".to_string(),
        q: true,
        rm: true,
        buildargs: HashMap::from([("BASE_IMAGE".to_string(), base_image.to_string())]),
        ..Default::default()
    };

    let mut stream = docker.build_image(options, None, Some(Bytes::from(context)));
    let mut image_id = None;
    let mut raw_output = String::new();
    while let Some(frame) = stream.next().await {
        let info = frame?;
        if let Some(error) = info.error {
            bail!("volume-init image build failed: {error}");
        }
        if let Some(ImageId { id: Some(id) }) = info.aux {
            image_id = Some(id);
        }
        if let Some(chunk) = info.stream {
            if let Some(digest) = find_digest(&chunk) {
                image_id = Some(digest);
            }
            raw_output.push_str(&chunk);
        }
    }

    image_id.ok_or_else(|| {
        warn!("ImageBuild() JSON response: {raw_output}");
        VolumeError::no_image_id_in_build_output(&raw_output)
    })
}

// Canonicalises a bind-mount host path the way docker-compose treats it:
// walk the path segment by segment resolving symlinks, and create the
// directory if some suffix of it does not exist yet.
pub fn resolve_bind_volume_host_path(fs: &dyn Filesystem, name: &str) -> anyhow::Result<PathBuf> {
    let absolute = lexical_clean(&fs.absolutize(Path::new(name))?);
    let components: Vec<Component> = absolute.components().collect();
    let mut result = PathBuf::new();
    for (i, component) in components.iter().enumerate() {
        result.push(component);
        if matches!(component, Component::RootDir | Component::Prefix(_)) {
            continue;
        }
        match fs.eval_symlinks(&result) {
            Ok(resolved) => result = resolved,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                for rest in &components[i + 1..] {
                    result.push(rest);
                }
                fs.create_dir_all(&result)?;
                return Ok(result);
            },
            Err(err) => return Err(err.into()),
        }
    }
    Ok(result)
}

fn lexical_clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            },
            Component::CurDir => {},
            other => out.push(other),
        }
    }
    out
}

fn slash_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn relative_slash_path(from_dir: &str, to: &str) -> String {
    let from: Vec<&str> = from_dir.split('/').filter(|s| !s.is_empty()).collect();
    let to_parts: Vec<&str> = to.split('/').filter(|s| !s.is_empty()).collect();
    let common = from.iter().zip(to_parts.iter()).take_while(|(a, b)| a == b).count();

    let mut parts: Vec<&str> = vec![".."; from.len() - common];
    parts.extend(&to_parts[common..]);
    if parts.is_empty() {
        ".".to_string()
    } else {
        parts.join("/")
    }
}
