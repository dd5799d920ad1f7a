//! Container runtime access: the black-box seam between the agent and the
//! node's container runtime.
//!
//! The engine needs exactly two capabilities from the runtime: finding the
//! running container that has a given host path mounted, and executing a
//! command inside a container. Everything else stays behind this trait.

use std::borrow::Borrow;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

pub mod containerd;
mod error;

pub use error::{Error, Result};

/// The maximum allowed length for a [`ContainerID`].
const CONTAINER_ID_MAX_LEN: usize = 255;

/// A validated container identifier.
///
/// # Examples
///
/// ```
/// # use uinput_agent::runtime::ContainerID;
/// let raw_id = "abc123abc123abc123abc123abc123abc123abc123abc123abc123abc123abcd";
/// let container_id = ContainerID::new(raw_id).unwrap();
/// assert_eq!(container_id.as_ref(), raw_id);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerID(Arc<str>);

impl ContainerID {
    /// Creates a new `ContainerID` from the given raw id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidContainerID`] if the input is empty or longer
    /// than [`CONTAINER_ID_MAX_LEN`].
    pub fn new(src: impl AsRef<str>) -> Result<Self> {
        let src = src.as_ref();
        if src.is_empty() || src.len() > CONTAINER_ID_MAX_LEN {
            return Err(Error::InvalidContainerID(src.to_owned()));
        }

        Ok(Self(src.into()))
    }
}

impl AsRef<str> for ContainerID {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for ContainerID {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Black-box facilities of the node's container runtime.
#[async_trait::async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Returns the running container that has `source` as a mount source,
    /// if any.
    async fn find_container_with_mount(&self, source: &Path) -> Result<Option<ContainerID>>;

    /// Runs `argv` inside the container. The exit status is not collected.
    async fn exec(&self, container: &ContainerID, argv: &[String]) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_id_rejects_empty() {
        assert!(ContainerID::new("").is_err());
    }

    #[test]
    fn test_container_id_rejects_oversized() {
        let raw = "a".repeat(CONTAINER_ID_MAX_LEN + 1);
        assert!(ContainerID::new(raw).is_err());
    }

    #[test]
    fn test_container_id_borrows_as_str() {
        let id = ContainerID::new("abc123").unwrap();
        assert_eq!(id.to_string(), "abc123");
        assert_eq!(Borrow::<str>::borrow(&id), "abc123");
    }
}
