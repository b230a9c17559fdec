use std::fs::File;
use std::os::fd::AsRawFd;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use nix::sched::{CloneFlags, setns, unshare};

use crate::{NetError, Result};

/// Directory of named network namespaces (iproute2 convention).
pub const NETNS_RUN_DIR: &str = "/var/run/netns";

const SELF_NS_NET: &str = "/proc/thread-self/ns/net";

/// An open network namespace file descriptor plus its kernel identity.
#[derive(Debug)]
pub struct NetnsFd {
    file: File,
    inode: u64,
}

impl NetnsFd {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                NetError::NotFound(format!("net namespace {}", path.display()))
            }
            _ => NetError::Io(e),
        })?;
        let inode = file.metadata()?.ino();
        Ok(NetnsFd { file, inode })
    }

    /// Open a named namespace under `/var/run/netns`.
    pub fn open_name(name: &str) -> Result<Self> {
        Self::open(&PathBuf::from(NETNS_RUN_DIR).join(name))
    }

    /// The namespace the calling thread currently runs in.
    pub fn current() -> Result<Self> {
        Self::open(Path::new(SELF_NS_NET))
    }

    /// Namespace inode number, the registry key.
    pub fn inode(&self) -> u64 {
        self.inode
    }

    /// Switch the calling thread into this namespace.
    pub fn set_ns(&self) -> Result<()> {
        setns(&self.file, CloneFlags::CLONE_NEWNET)?;
        Ok(())
    }

    pub fn raw_fd(&self) -> i32 {
        self.file.as_raw_fd()
    }

    pub fn try_clone(&self) -> Result<Self> {
        Ok(NetnsFd {
            file: self.file.try_clone()?,
            inode: self.inode,
        })
    }
}

/// Detach the calling thread into a fresh network namespace and return a
/// handle to it. The caller is responsible for switching back.
pub fn unshare_net() -> Result<NetnsFd> {
    unshare(CloneFlags::CLONE_NEWNET)?;
    NetnsFd::current()
}

/// Run `f` on a blocking thread switched into `target`, restoring the
/// thread's original namespace afterwards. The restore must not fail:
/// blocking-pool threads are reused and must never keep running in a
/// foreign namespace.
pub async fn run_in_netns<T, F>(target: NetnsFd, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let saved = NetnsFd::current()?;
        target.set_ns()?;
        let result = f();
        saved
            .set_ns()
            .expect("failed to restore the thread's network namespace");
        result
    })
    .await
    .map_err(|e| NetError::Unknown(format!("namespace task failed: {e}")))?
}

/// Run `f` on a blocking thread inside a brand-new network namespace and
/// return its fd together with the closure result.
pub async fn run_in_new_netns<T, F>(f: F) -> Result<(NetnsFd, T)>
where
    F: FnOnce(&NetnsFd) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let saved = NetnsFd::current()?;
        let result = unshare_net().and_then(|ns| f(&ns).map(|value| (ns, value)));
        saved
            .set_ns()
            .expect("failed to restore the thread's network namespace");
        result
    })
    .await
    .map_err(|e| NetError::Unknown(format!("namespace task failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_namespace_has_identity() {
        let ns = NetnsFd::current().unwrap();
        assert_ne!(ns.inode(), 0);
        let again = NetnsFd::current().unwrap();
        assert_eq!(ns.inode(), again.inode());
    }

    #[test]
    fn missing_named_namespace_is_not_found() {
        let err = NetnsFd::open_name("ctnet-test-does-not-exist").unwrap_err();
        assert!(matches!(err, NetError::NotFound(_)));
    }

    #[test]
    fn clone_preserves_inode() {
        let ns = NetnsFd::current().unwrap();
        assert_eq!(ns.try_clone().unwrap().inode(), ns.inode());
    }
}
