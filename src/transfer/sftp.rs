//! SFTP backend over libssh2, password authentication only.

use std::{
    fs::File,
    io,
    net::{TcpStream, ToSocketAddrs},
    path::Path,
    time::Duration,
};

use ssh2::{ErrorCode, Session, Sftp};

use crate::http_client::{RetryConfig, retry_with_backoff};

use super::{RemoteFs, TransferCredentials, TransferError};

// libssh2 status for a missing remote path.
const SFTP_NO_SUCH_FILE: i32 = 2;

const CONNECT_RETRY: RetryConfig = RetryConfig {
    max_attempts: 3,
    base_delay: Duration::from_millis(500),
    max_delay: Duration::from_secs(4),
};

pub(super) struct SftpFs {
    session: Session,
    sftp: Sftp,
}

enum ConnectFailure {
    /// Worth another attempt: DNS, refused, timed out.
    Network(String),
    /// Handshake or login rejected; retrying will not help.
    Rejected(String),
}

pub(super) fn connect(
    credentials: &TransferCredentials,
    port: u16,
    connect_timeout: Duration,
    session_timeout: Duration,
) -> Result<SftpFs, TransferError> {
    let target = format!("{}@{}:{port}", credentials.username, credentials.host);
    retry_with_backoff(
        CONNECT_RETRY,
        || connect_once(credentials, port, connect_timeout, session_timeout),
        |failure| matches!(failure, ConnectFailure::Network(_)),
    )
    .map_err(|failure| {
        let message = match failure {
            ConnectFailure::Network(message) | ConnectFailure::Rejected(message) => message,
        };
        tracing::warn!(target = %target, error = %message, "transfer connect failed");
        TransferError::Connect { target, message }
    })
}

fn connect_once(
    credentials: &TransferCredentials,
    port: u16,
    connect_timeout: Duration,
    session_timeout: Duration,
) -> Result<SftpFs, ConnectFailure> {
    let addr = (credentials.host.as_str(), port)
        .to_socket_addrs()
        .map_err(|err| ConnectFailure::Network(err.to_string()))?
        .next()
        .ok_or_else(|| ConnectFailure::Network(format!("no address for {}", credentials.host)))?;
    let tcp = TcpStream::connect_timeout(&addr, connect_timeout)
        .map_err(|err| ConnectFailure::Network(err.to_string()))?;

    let rejected = |err: ssh2::Error| ConnectFailure::Rejected(err.to_string());
    let mut session = Session::new().map_err(rejected)?;
    session.set_tcp_stream(tcp);
    session.set_timeout(u32::try_from(session_timeout.as_millis()).unwrap_or(u32::MAX));
    session.handshake().map_err(rejected)?;
    if let Some((key, _)) = session.host_key() {
        tracing::debug!(host = %credentials.host, key_len = key.len(), "host key accepted");
    }
    session
        .userauth_password(&credentials.username, &credentials.password)
        .map_err(rejected)?;
    if !session.authenticated() {
        return Err(ConnectFailure::Rejected("authentication failed".into()));
    }
    let sftp = session.sftp().map_err(rejected)?;
    Ok(SftpFs { session, sftp })
}

impl RemoteFs for SftpFs {
    fn exists(&mut self, path: &str) -> io::Result<bool> {
        match self.sftp.stat(Path::new(path)) {
            Ok(_) => Ok(true),
            Err(err) if err.code() == ErrorCode::SFTP(SFTP_NO_SUCH_FILE) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    fn mkdir(&mut self, path: &str) -> io::Result<()> {
        Ok(self.sftp.mkdir(Path::new(path), 0o755)?)
    }

    fn remove(&mut self, path: &str) -> io::Result<()> {
        Ok(self.sftp.unlink(Path::new(path))?)
    }

    fn upload(&mut self, local: &Path, remote: &str) -> io::Result<()> {
        let mut source = File::open(local)?;
        let mut dest = self.sftp.create(Path::new(remote))?;
        io::copy(&mut source, &mut dest)?;
        Ok(())
    }

    fn download(&mut self, remote: &str, local: &Path) -> io::Result<()> {
        let mut source = self.sftp.open(Path::new(remote))?;
        let mut dest = File::create(local)?;
        if let Err(err) = io::copy(&mut source, &mut dest) {
            drop(dest);
            let _ = std::fs::remove_file(local);
            return Err(err);
        }
        Ok(())
    }

    fn rename(&mut self, from: &str, to: &str) -> io::Result<()> {
        Ok(self.sftp.rename(Path::new(from), Path::new(to), None)?)
    }

    fn list(&mut self, dir: &str) -> io::Result<Vec<String>> {
        let dir = if dir.is_empty() { "." } else { dir };
        let mut names: Vec<String> = self
            .sftp
            .readdir(Path::new(dir))?
            .into_iter()
            .filter_map(|(path, _)| path.file_name().map(|name| name.to_string_lossy().into_owned()))
            .collect();
        names.sort();
        Ok(names)
    }

    fn disconnect(&mut self) {
        let _ = self.session.disconnect(None, "job transfer complete", None);
    }
}
