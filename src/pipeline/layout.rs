//! Where persisted frames land on disk

use std::fmt;
use std::path::{Path, PathBuf};

/// Sortable timestamp naming one run of the program
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(String);

impl SessionId {
    pub const FORMAT: &'static str = "%Y%m%dT%H%M%S";

    pub fn now() -> Self {
        Self(chrono::Local::now().format(Self::FORMAT).to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// `<root>/<session>/Scene_<batch>/cam_<serial>.raw`
#[derive(Debug, Clone)]
pub struct OutputLayout {
    root: PathBuf,
    session: SessionId,
}

impl OutputLayout {
    pub fn new(root: impl Into<PathBuf>, session: SessionId) -> Self {
        Self {
            root: root.into(),
            session,
        }
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    pub fn session_dir(&self) -> PathBuf {
        self.root.join(self.session.as_str())
    }

    pub fn frame_path(&self, batch: u32, serial: &str) -> PathBuf {
        self.session_dir()
            .join(format!("Scene_{:03}", batch))
            .join(format!("cam_{}.raw", serial))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}
