//! Node version gate. Executors announce their version at registration;
//! the coordinator rejects anything older than [`MIN_WORKER_VERSION`].

use std::fmt;
use std::str::FromStr;

use crate::error::ErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

pub const CURRENT_VERSION: NodeVersion = NodeVersion {
    major: 0,
    minor: 2,
    patch: 0,
};

pub const MIN_WORKER_VERSION: NodeVersion = NodeVersion {
    major: 0,
    minor: 2,
    patch: 0,
};

impl NodeVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl FromStr for NodeVersion {
    type Err = ErrorKind;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let mut parts = raw.trim().splitn(3, '.');
        let mut next = || {
            parts
                .next()
                .and_then(|part| part.parse::<u32>().ok())
                .ok_or(ErrorKind::ParameterMissingOrInvalid)
        };
        Ok(Self {
            major: next()?,
            minor: next()?,
            patch: next()?,
        })
    }
}

impl fmt::Display for NodeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let version: NodeVersion = "1.2.3".parse().unwrap();
        assert_eq!(version, NodeVersion::new(1, 2, 3));
        assert_eq!(version.to_string(), "1.2.3");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("1.2".parse::<NodeVersion>().is_err());
        assert!("a.b.c".parse::<NodeVersion>().is_err());
        assert!("".parse::<NodeVersion>().is_err());
    }

    #[test]
    fn test_ordering() {
        let old: NodeVersion = "0.1.9".parse().unwrap();
        let new: NodeVersion = "0.2.0".parse().unwrap();
        assert!(old < new);
        assert!(new >= MIN_WORKER_VERSION);
        assert!(CURRENT_VERSION >= MIN_WORKER_VERSION);
    }
}
