//! Capture what gets appended to a remote file while work happens

use std::sync::Arc;

use tracing::debug;

use crate::error::ExecError;
use crate::session::{Session, quote};

/// Records a file's size on creation and returns everything written after it
///
/// ```no_run
/// # use std::sync::Arc;
/// # use hostbroker_exec::{LocalSession, Session, TailFile};
/// # async fn example() -> Result<(), hostbroker_exec::ExecError> {
/// let session: Arc<dyn Session> = Arc::new(LocalSession::new());
/// let tail = TailFile::start(session.clone(), "/var/log/messages").await?;
/// session.run_with_timeout("systemctl restart sshd", std::time::Duration::from_secs(30)).await?;
/// let appended = tail.finish().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct TailFile {
    session: Arc<dyn Session>,
    path: String,
    offset: u64,
}

impl TailFile {
    /// Remember the current size of `path` (0 if it does not exist yet)
    ///
    /// # Errors
    /// Returns `ExecError` if the size query cannot be run
    pub async fn start(
        session: Arc<dyn Session>,
        path: impl Into<String>,
    ) -> Result<Self, ExecError> {
        let path = path.into();
        let result = session
            .run(&format!("stat -c %s {} 2>/dev/null || echo 0", quote(&path)?))
            .await?;
        let offset = result.stdout.trim().parse().unwrap_or(0);
        debug!(path = %path, offset, "tailing file");
        Ok(Self {
            session,
            path,
            offset,
        })
    }

    /// Path being tailed
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Content appended since `start`
    ///
    /// # Errors
    /// Returns `ExecError` if the file cannot be read
    pub async fn finish(self) -> Result<String, ExecError> {
        let result = self
            .session
            .run(&format!("tail -c +{} {}", self.offset + 1, quote(&self.path)?))
            .await?
            .into_checked()?;
        Ok(result.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalSession;

    #[tokio::test]
    async fn test_tail_returns_appended_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "old line\n").unwrap();
        let path = path.to_str().unwrap().to_string();

        let session: Arc<dyn Session> = Arc::new(LocalSession::new());
        let tail = TailFile::start(session.clone(), path.clone())
            .await
            .unwrap();
        session
            .run(&format!("echo 'new line' >> {path}"))
            .await
            .unwrap();

        assert_eq!(tail.finish().await.unwrap(), "new line\n");
    }

    #[tokio::test]
    async fn test_tail_file_created_later() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("later.log");
        let path = path.to_str().unwrap().to_string();

        let session: Arc<dyn Session> = Arc::new(LocalSession::new());
        let tail = TailFile::start(session.clone(), path.clone())
            .await
            .unwrap();
        session.run(&format!("echo first > {path}")).await.unwrap();

        assert_eq!(tail.finish().await.unwrap(), "first\n");
    }
}
