use std::{
    fs, io,
    path::{Component, Path, PathBuf},
};

use super::RemoteFs;

/// Drop backend over a locally mounted directory.
#[derive(Debug, Clone)]
pub struct LocalDropFs {
    root: PathBuf,
}

impl LocalDropFs {
    pub fn open(root: &Path) -> io::Result<Self> {
        if !root.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("drop directory {} does not exist", root.display()),
            ));
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn resolve(&self, path: &str) -> io::Result<PathBuf> {
        let relative = Path::new(path);
        if relative
            .components()
            .any(|part| !matches!(part, Component::Normal(_) | Component::CurDir))
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("path escapes drop directory: {path}"),
            ));
        }
        Ok(self.root.join(relative))
    }
}

impl RemoteFs for LocalDropFs {
    fn exists(&mut self, path: &str) -> io::Result<bool> {
        Ok(self.resolve(path)?.exists())
    }

    fn mkdir(&mut self, path: &str) -> io::Result<()> {
        fs::create_dir(self.resolve(path)?)
    }

    fn remove(&mut self, path: &str) -> io::Result<()> {
        fs::remove_file(self.resolve(path)?)
    }

    fn upload(&mut self, local: &Path, remote: &str) -> io::Result<()> {
        fs::copy(local, self.resolve(remote)?).map(|_| ())
    }

    fn download(&mut self, remote: &str, local: &Path) -> io::Result<()> {
        fs::copy(self.resolve(remote)?, local).map(|_| ())
    }

    fn rename(&mut self, from: &str, to: &str) -> io::Result<()> {
        fs::rename(self.resolve(from)?, self.resolve(to)?)
    }

    fn list(&mut self, dir: &str) -> io::Result<Vec<String>> {
        let mut names = fs::read_dir(self.resolve(dir)?)?
            .map(|entry| entry.map(|entry| entry.file_name().to_string_lossy().into_owned()))
            .collect::<io::Result<Vec<_>>>()?;
        names.sort();
        Ok(names)
    }

    fn disconnect(&mut self) {}
}
