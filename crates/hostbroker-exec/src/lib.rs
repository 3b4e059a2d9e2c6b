//! hostbroker-exec: Session abstraction for provisioned hosts
//!
//! Provides the `Session` capability and its transports: SSH, local processes
//! and container exec.

pub mod container;
pub mod error;
pub mod keys;
pub mod local;
pub mod result;
pub mod session;
pub mod ssh;
pub mod tail;

pub use container::{ContainerRuntime, ContainerSession, ContainerSessionFactory};
pub use error::ExecError;
pub use local::LocalSession;
pub use result::{CommandResult, ConnectionInfo};
pub use session::{InteractiveShell, Session, SessionFactory, quote};
pub use ssh::{SshSession, SshSessionFactory};
pub use tail::TailFile;
