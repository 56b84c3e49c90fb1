use std::io::{
    self,
    Read,
};
use std::path::{
    Path,
    PathBuf,
};

// Everything the volume-init builder needs to know about an inode, without
// handing it a live std::fs::Metadata (which cannot be faked in tests).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FileType {
    Regular,
    Directory,
    Symlink,
    Other,
}

#[derive(Clone, Debug)]
pub struct Metadata {
    pub file_type: FileType,
    pub mode: u32,
    pub size: u64,
}

// Filesystem is an abstraction of the host file system so that code walking
// bind-mount trees can be tested against an in-memory substitute.  It is an
// explicit collaborator: components that need it take it as a parameter.
pub trait Filesystem: Send + Sync {
    fn absolutize(&self, path: &Path) -> io::Result<PathBuf>;
    fn symlink_metadata(&self, path: &Path) -> io::Result<Metadata>;
    fn open(&self, path: &Path) -> io::Result<Box<dyn Read + Send + '_>>;
    fn read_link(&self, path: &Path) -> io::Result<PathBuf>;

    /// Directory entry names, sorted, without their leading path.
    fn read_dir(&self, path: &Path) -> io::Result<Vec<String>>;

    /// Resolve every symlink in `path`, failing with `NotFound` if any
    /// component does not exist.
    fn eval_symlinks(&self, path: &Path) -> io::Result<PathBuf>;
    fn create_dir_all(&self, path: &Path) -> io::Result<()>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct OsFilesystem;

impl Filesystem for OsFilesystem {
    fn absolutize(&self, path: &Path) -> io::Result<PathBuf> {
        std::path::absolute(path)
    }

    fn symlink_metadata(&self, path: &Path) -> io::Result<Metadata> {
        let meta = std::fs::symlink_metadata(path)?;
        let file_type = if meta.file_type().is_symlink() {
            FileType::Symlink
        } else if meta.is_dir() {
            FileType::Directory
        } else if meta.is_file() {
            FileType::Regular
        } else {
            FileType::Other
        };
        Ok(Metadata { file_type, mode: unix_mode(&meta), size: meta.len() })
    }

    fn open(&self, path: &Path) -> io::Result<Box<dyn Read + Send + '_>> {
        Ok(Box::new(std::fs::File::open(path)?))
    }

    fn read_link(&self, path: &Path) -> io::Result<PathBuf> {
        std::fs::read_link(path)
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<String>> {
        let mut entries = vec![];
        for entry in std::fs::read_dir(path)? {
            entries.push(entry?.file_name().to_string_lossy().into_owned());
        }
        entries.sort();
        Ok(entries)
    }

    fn eval_symlinks(&self, path: &Path) -> io::Result<PathBuf> {
        std::fs::canonicalize(path)
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        std::fs::create_dir_all(path)
    }
}

#[cfg(unix)]
fn unix_mode(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::MetadataExt;
    meta.mode() & 0o7777
}

#[cfg(not(unix))]
fn unix_mode(_meta: &std::fs::Metadata) -> u32 {
    0o644
}

#[cfg(any(test, feature = "testutils"))]
pub use in_memory::InMemoryFilesystem;

#[cfg(any(test, feature = "testutils"))]
mod in_memory {
    use std::collections::BTreeMap;
    use std::io::ErrorKind;
    use std::sync::Mutex;

    use super::*;

    #[derive(Clone, Debug)]
    enum Node {
        Dir,
        File { content: Vec<u8>, mode: u32 },
        Symlink(PathBuf),
        Other,
    }

    /// An in-memory Filesystem for tests.  Paths are stored cleaned and
    /// absolute; parent directories must be added explicitly.
    #[derive(Debug, Default)]
    pub struct InMemoryFilesystem {
        nodes: Mutex<BTreeMap<PathBuf, Node>>,
    }

    impl InMemoryFilesystem {
        pub fn new() -> InMemoryFilesystem {
            let fs = InMemoryFilesystem::default();
            fs.nodes.lock().unwrap().insert(PathBuf::from("/"), Node::Dir);
            fs
        }

        pub fn add_dir(&self, path: &str) -> &Self {
            self.nodes.lock().unwrap().insert(path.into(), Node::Dir);
            self
        }

        pub fn add_file(&self, path: &str, content: &[u8]) -> &Self {
            self.nodes.lock().unwrap().insert(path.into(), Node::File { content: content.into(), mode: 0o644 });
            self
        }

        pub fn add_symlink(&self, path: &str, target: &str) -> &Self {
            self.nodes.lock().unwrap().insert(path.into(), Node::Symlink(target.into()));
            self
        }

        pub fn add_other(&self, path: &str) -> &Self {
            self.nodes.lock().unwrap().insert(path.into(), Node::Other);
            self
        }

        fn get(&self, path: &Path) -> io::Result<Node> {
            self.nodes
                .lock()
                .unwrap()
                .get(path)
                .cloned()
                .ok_or_else(|| io::Error::new(ErrorKind::NotFound, format!("{}", path.display())))
        }
    }

    impl Filesystem for InMemoryFilesystem {
        fn absolutize(&self, path: &Path) -> io::Result<PathBuf> {
            if path.is_absolute() {
                Ok(path.into())
            } else {
                Ok(Path::new("/").join(path))
            }
        }

        fn symlink_metadata(&self, path: &Path) -> io::Result<Metadata> {
            let (file_type, mode, size) = match self.get(path)? {
                Node::Dir => (FileType::Directory, 0o755, 0),
                Node::File { content, mode } => (FileType::Regular, mode, content.len() as u64),
                Node::Symlink(_) => (FileType::Symlink, 0o777, 0),
                Node::Other => (FileType::Other, 0o644, 0),
            };
            Ok(Metadata { file_type, mode, size })
        }

        fn open(&self, path: &Path) -> io::Result<Box<dyn Read + Send + '_>> {
            match self.get(path)? {
                Node::File { content, .. } => Ok(Box::new(io::Cursor::new(content))),
                _ => Err(io::Error::new(ErrorKind::InvalidInput, "not a regular file")),
            }
        }

        fn read_link(&self, path: &Path) -> io::Result<PathBuf> {
            match self.get(path)? {
                Node::Symlink(target) => Ok(target),
                _ => Err(io::Error::new(ErrorKind::InvalidInput, "not a symlink")),
            }
        }

        fn read_dir(&self, path: &Path) -> io::Result<Vec<String>> {
            self.get(path)?;
            let mut entries: Vec<String> = self
                .nodes
                .lock()
                .unwrap()
                .keys()
                .filter(|p| p.parent() == Some(path))
                .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
                .collect();
            entries.sort();
            Ok(entries)
        }

        fn eval_symlinks(&self, path: &Path) -> io::Result<PathBuf> {
            let mut current: PathBuf = path.into();
            for _ in 0..40 {
                match self.get(&current)? {
                    Node::Symlink(target) => {
                        current = if target.is_absolute() {
                            target
                        } else {
                            current.parent().unwrap_or(Path::new("/")).join(target)
                        };
                    },
                    _ => return Ok(current),
                }
            }
            Err(io::Error::new(ErrorKind::InvalidInput, "too many levels of symbolic links"))
        }

        fn create_dir_all(&self, path: &Path) -> io::Result<()> {
            let mut nodes = self.nodes.lock().unwrap();
            let mut current = PathBuf::new();
            for component in path.components() {
                current.push(component);
                nodes.entry(current.clone()).or_insert(Node::Dir);
            }
            Ok(())
        }
    }
}
