//! Target platform model.
//!
//! A cluster image is indexed by the platform it was built for. The
//! canonical string form is `os/arch` or `os/arch/variant`, e.g.
//! `linux/amd64` or `linux/arm/v7`.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Platform an image targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Platform {
    pub os: String,
    pub arch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Platform {
    /// Host platform, with the architecture normalised to registry names
    /// (`x86_64` → `amd64`, `aarch64` → `arm64`).
    pub fn host() -> Self {
        let arch = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            other => other,
        };
        Platform {
            os: std::env::consts::OS.to_string(),
            arch: arch.to_string(),
            variant: None,
        }
    }

    /// Parse `os/arch` or `os/arch/variant`.
    pub fn parse(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [os, arch] if !os.is_empty() && !arch.is_empty() => Ok(Platform {
                os: os.to_string(),
                arch: arch.to_string(),
                variant: None,
            }),
            [os, arch, variant] if !os.is_empty() && !arch.is_empty() && !variant.is_empty() => {
                Ok(Platform {
                    os: os.to_string(),
                    arch: arch.to_string(),
                    variant: Some(variant.to_string()),
                })
            }
            _ => Err(EngineError::Parse {
                line: 0,
                message: format!("invalid platform '{}': expected os/arch[/variant]", s),
            }),
        }
    }

    /// Filesystem-safe form used for ref index directories,
    /// e.g. `linux_amd64` or `linux_arm_v7`.
    pub fn dir_name(&self) -> String {
        match &self.variant {
            Some(v) => format!("{}_{}_{}", self.os, self.arch, v),
            None => format!("{}_{}", self.os, self.arch),
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.variant {
            Some(v) => write!(f, "{}/{}/{}", self.os, self.arch, v),
            None => write!(f, "{}/{}", self.os, self.arch),
        }
    }
}

impl Default for Platform {
    fn default() -> Self {
        Self::host()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_os_arch() {
        let p = Platform::parse("linux/amd64").unwrap();
        assert_eq!(p.os, "linux");
        assert_eq!(p.arch, "amd64");
        assert_eq!(p.variant, None);
    }

    #[test]
    fn test_parse_with_variant() {
        let p = Platform::parse("linux/arm/v7").unwrap();
        assert_eq!(p.variant, Some("v7".to_string()));
        assert_eq!(p.to_string(), "linux/arm/v7");
    }

    #[test]
    fn test_parse_invalid() {
        assert!(Platform::parse("linux").is_err());
        assert!(Platform::parse("linux/").is_err());
        assert!(Platform::parse("linux/amd64/v8/extra").is_err());
        assert!(Platform::parse("").is_err());
    }

    #[test]
    fn test_dir_name() {
        assert_eq!(
            Platform::parse("linux/amd64").unwrap().dir_name(),
            "linux_amd64"
        );
        assert_eq!(
            Platform::parse("linux/arm/v6").unwrap().dir_name(),
            "linux_arm_v6"
        );
    }

    #[test]
    fn test_host_arch_normalised() {
        let p = Platform::host();
        assert_ne!(p.arch, "x86_64");
        assert_ne!(p.arch, "aarch64");
    }

    #[test]
    fn test_serde_roundtrip() {
        let p = Platform::parse("linux/arm64").unwrap();
        let json = serde_json::to_string(&p).unwrap();
        assert!(!json.contains("variant"));
        let back: Platform = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
    }
}
