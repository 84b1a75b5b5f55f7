//! File drop shared with the processing service.
//!
//! Uploads are two-phase (`<name>.filepart`, then rename) so the service
//! never picks up a partial archive. Downloads are destructive: the remote
//! copy is removed once it has been fetched.

mod local;
mod sftp;

use std::{
    fmt, io,
    path::{Path, PathBuf},
    time::Duration,
};

pub use local::LocalDropFs;

const PART_SUFFIX: &str = ".filepart";
const SUBDIRS: [&str; 2] = ["batches", "results"];

/// Per-job login for the drop. Issued by the service, never persisted.
#[derive(Clone, PartialEq, Eq)]
pub struct TransferCredentials {
    pub host: String,
    pub username: String,
    pub password: String,
    /// Directory the session works in, relative to the login root.
    pub base_dir: String,
}

impl fmt::Debug for TransferCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferCredentials")
            .field("host", &self.host)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("base_dir", &self.base_dir)
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("Cannot connect to transfer server {target}: {message}")]
    Connect { target: String, message: String },
    #[error("Cannot find remote directory {path}: {message}")]
    RemoteDir { path: String, message: String },
    #[error("Cannot write file {name}: {message}")]
    Put { name: String, message: String },
    #[error("Cannot rename file {name}: {message}")]
    Rename { name: String, message: String },
    #[error("Cannot read file {name}: {message}")]
    Get { name: String, message: String },
    #[error("Transfer session is closed")]
    Closed,
}

impl TransferError {
    /// Every transfer failure shares the service's file-drop error code.
    pub fn code(&self) -> i32 {
        -5
    }
}

/// Primitive operations a drop backend provides. Paths are `/`-separated
/// and relative to the login root.
pub trait RemoteFs: Send {
    fn exists(&mut self, path: &str) -> io::Result<bool>;
    fn mkdir(&mut self, path: &str) -> io::Result<()>;
    fn remove(&mut self, path: &str) -> io::Result<()>;
    fn upload(&mut self, local: &Path, remote: &str) -> io::Result<()>;
    fn download(&mut self, remote: &str, local: &Path) -> io::Result<()>;
    fn rename(&mut self, from: &str, to: &str) -> io::Result<()>;
    fn list(&mut self, dir: &str) -> io::Result<Vec<String>>;
    fn disconnect(&mut self);
}

/// How sessions reach the drop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    Sftp {
        port: u16,
        connect_timeout: Duration,
        /// Bound on each blocking SFTP operation.
        session_timeout: Duration,
    },
    /// A mounted directory standing in for the login root.
    LocalDrop { root: PathBuf },
}

impl Default for Transport {
    fn default() -> Self {
        Self::Sftp {
            port: 22,
            connect_timeout: Duration::from_millis(3000),
            session_timeout: Duration::from_secs(300),
        }
    }
}

impl Transport {
    pub fn open(&self, credentials: &TransferCredentials) -> Result<TransferSession, TransferError> {
        let fs: Box<dyn RemoteFs> = match self {
            Self::Sftp {
                port,
                connect_timeout,
                session_timeout,
            } => Box::new(sftp::connect(credentials, *port, *connect_timeout, *session_timeout)?),
            Self::LocalDrop { root } => Box::new(LocalDropFs::open(root).map_err(|err| {
                TransferError::Connect {
                    target: root.display().to_string(),
                    message: err.to_string(),
                }
            })?),
        };
        tracing::info!(user = %credentials.username, host = %credentials.host, "transfer session opened");
        Ok(TransferSession::new(fs))
    }
}

/// An open session, bound to one working directory after
/// [`TransferSession::ensure_remote_dir`].
pub struct TransferSession {
    fs: Box<dyn RemoteFs>,
    dir: Option<String>,
    closed: bool,
}

impl TransferSession {
    pub fn new(fs: Box<dyn RemoteFs>) -> Self {
        Self {
            fs,
            dir: None,
            closed: false,
        }
    }

    /// Work in `path`, creating it with its `batches` and `results`
    /// subdirectories when absent.
    pub fn ensure_remote_dir(&mut self, path: &str) -> Result<(), TransferError> {
        self.check_open()?;
        let path = path.trim_matches('/').to_string();
        let dir_error = |err: io::Error| TransferError::RemoteDir {
            path: path.clone(),
            message: err.to_string(),
        };
        if !self.fs.exists(&path).map_err(dir_error)? {
            tracing::debug!(path = %path, "creating remote directory");
            create_all(self.fs.as_mut(), &path).map_err(dir_error)?;
            for sub in SUBDIRS {
                self.fs.mkdir(&join(&path, sub)).map_err(dir_error)?;
            }
        }
        self.dir = Some(path);
        Ok(())
    }

    /// Upload `local_path` under its file name. The final name appears only
    /// after the full content has been written.
    pub fn put(&mut self, local_path: &Path) -> Result<(), TransferError> {
        self.check_open()?;
        let name = file_name(local_path);
        let target = self.remote_path(&name)?;
        let part = format!("{target}{PART_SUFFIX}");
        tracing::info!(file = %name, dir = self.dir.as_deref().unwrap_or(""), "transmit");

        // Stale leftovers from an interrupted attempt; absence is fine.
        let _ = self.fs.remove(&target);
        let _ = self.fs.remove(&part);

        if let Err(err) = self.fs.upload(local_path, &part) {
            let _ = self.fs.remove(&part);
            return Err(TransferError::Put {
                name,
                message: err.to_string(),
            });
        }
        if let Err(err) = self.fs.rename(&part, &target) {
            let _ = self.fs.remove(&part);
            return Err(TransferError::Rename {
                name,
                message: err.to_string(),
            });
        }
        Ok(())
    }

    /// Download `remote_name` to `local_path`, then delete the remote copy.
    pub fn get(&mut self, remote_name: &str, local_path: &Path) -> Result<(), TransferError> {
        self.check_open()?;
        let source = self.remote_path(remote_name)?;
        tracing::info!(file = remote_name, "retrieve");
        self.fs
            .download(&source, local_path)
            .map_err(|err| TransferError::Get {
                name: remote_name.to_string(),
                message: err.to_string(),
            })?;
        if let Err(err) = self.fs.remove(&source) {
            tracing::warn!(file = remote_name, error = %err, "retrieved file left on server");
        }
        Ok(())
    }

    /// Names in the working directory.
    pub fn list(&mut self) -> Result<Vec<String>, TransferError> {
        self.check_open()?;
        let dir = self.dir.clone().unwrap_or_default();
        self.fs.list(&dir).map_err(|err| TransferError::RemoteDir {
            path: dir,
            message: err.to_string(),
        })
    }

    pub fn close(&mut self) {
        if !self.closed {
            self.fs.disconnect();
            self.closed = true;
            tracing::debug!("transfer session closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn check_open(&self) -> Result<(), TransferError> {
        if self.closed {
            Err(TransferError::Closed)
        } else {
            Ok(())
        }
    }

    fn remote_path(&self, name: &str) -> Result<String, TransferError> {
        let dir = self.dir.as_deref().ok_or_else(|| TransferError::RemoteDir {
            path: String::new(),
            message: "no remote directory selected".into(),
        })?;
        Ok(join(dir, name))
    }
}

impl Drop for TransferSession {
    fn drop(&mut self) {
        self.close();
    }
}

fn create_all(fs: &mut dyn RemoteFs, path: &str) -> io::Result<()> {
    let mut current = String::new();
    for part in path.split('/').filter(|part| !part.is_empty()) {
        current = join(&current, part);
        if !fs.exists(&current)? {
            fs.mkdir(&current)?;
        }
    }
    Ok(())
}

fn join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{dir}/{name}")
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}
