pub mod bitmap;
pub mod config;
pub mod container;
pub mod device;
pub mod net;
pub mod netcfg;
pub mod netlink;
pub mod netns;
pub mod registry;
pub mod sysctl;
pub mod worker;

pub use config::NetworkConfig;
pub use container::{ContainerNet, ContainerTree, NetStatus};
pub use net::Network;
pub use netcfg::NetCfg;
pub use registry::NetRegistry;
pub use worker::NetWorker;

/// Rate assigned to devices whose link speed cannot be determined,
/// and to every device inside a container-managed namespace, in bytes/s.
pub const NET_MAX_RATE: u64 = 2_000_000_000;

/// Class priority used when the container priority map yields nothing.
pub const NET_DEFAULT_PRIO: u64 = 3;

pub const ROOT_TC_MAJOR: u16 = 1;
pub const ROOT_TC_MINOR: u16 = 0;
pub const ROOT_CONTAINER_ID: u16 = 1;
pub const DEFAULT_TC_MINOR: u16 = 2;
pub const LEGACY_CONTAINER_ID: u16 = 3;
pub const DEFAULT_TC_MAJOR: u16 = 2;
pub const CONTAINER_TC_MINOR: u16 = 0;

/// Pack a 32-bit kernel TC handle from its major and minor halves.
pub const fn tc_handle(major: u16, minor: u16) -> u32 {
    ((major as u32) << 16) | minor as u32
}

pub const fn tc_major(handle: u32) -> u16 {
    (handle >> 16) as u16
}

pub const fn tc_minor(handle: u32) -> u16 {
    (handle & 0xffff) as u16
}

#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Resource not available: {0}")]
    ResourceNotAvailable(String),

    #[error("Netlink error ({errno}): {msg}")]
    Netlink { errno: i32, msg: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Unknown(String),
}

impl From<rtnetlink::Error> for NetError {
    fn from(e: rtnetlink::Error) -> Self {
        match e {
            rtnetlink::Error::NetlinkError(err) => NetError::Netlink {
                errno: -err.raw_code(),
                msg: format!("{err:?}"),
            },
            other => NetError::Unknown(other.to_string()),
        }
    }
}

impl From<nix::errno::Errno> for NetError {
    fn from(e: nix::errno::Errno) -> Self {
        NetError::Unknown(e.to_string())
    }
}

impl Clone for NetError {
    fn clone(&self) -> Self {
        match self {
            NetError::InvalidValue(s) => NetError::InvalidValue(s.clone()),
            NetError::ResourceNotAvailable(s) => NetError::ResourceNotAvailable(s.clone()),
            NetError::Netlink { errno, msg } => NetError::Netlink {
                errno: *errno,
                msg: msg.clone(),
            },
            NetError::NotFound(s) => NetError::NotFound(s.clone()),
            NetError::Io(e) => NetError::Io(std::io::Error::new(e.kind(), e.to_string())),
            NetError::Unknown(s) => NetError::Unknown(s.clone()),
        }
    }
}

impl NetError {
    /// True for kernel "object does not exist" rejections, which teardown
    /// paths tolerate.
    pub fn is_enoent(&self) -> bool {
        matches!(self, NetError::Netlink { errno, .. } if *errno == libc::ENOENT)
    }
}

pub type Result<T> = std::result::Result<T, NetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tc_handle_packs_major_minor() {
        assert_eq!(tc_handle(1, 0), 0x0001_0000);
        assert_eq!(tc_handle(1, 2), 0x0001_0002);
        assert_eq!(tc_major(tc_handle(0x8001, 0x42)), 0x8001);
        assert_eq!(tc_minor(tc_handle(0x8001, 0x42)), 0x42);
    }

    #[test]
    fn enoent_detection() {
        let e = NetError::Netlink {
            errno: libc::ENOENT,
            msg: "No such file or directory".into(),
        };
        assert!(e.is_enoent());
        assert!(!NetError::NotFound("eth0".into()).is_enoent());
    }
}
