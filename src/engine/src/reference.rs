//! Cluster-image name parsing.
//!
//! Parses references like `registry.example.com:5000/infra/k8s:v1.22` into
//! registry, repository, and tag. Unqualified names resolve against the
//! configured default registry and namespace; resolution is case-sensitive.

use kubeimage_core::{EngineError, NameDefaults, Result};

const DEFAULT_TAG: &str = "latest";

/// Parsed cluster-image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry hostname, possibly with a port.
    pub registry: String,
    /// Repository path under the registry.
    pub repository: String,
    /// Tag; `latest` when the input named none.
    pub tag: String,
}

impl ImageReference {
    /// Parse a reference, filling in registry/namespace/tag defaults.
    pub fn parse(reference: &str, defaults: &NameDefaults) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(EngineError::NotFound("empty image reference".to_string()));
        }

        // Tag splits on the last colon after the last slash; a colon before
        // a slash belongs to a registry port.
        let (name, tag) = match reference.rsplit_once(':') {
            Some((name, tag)) if !tag.contains('/') && !name.is_empty() => {
                (name, tag.to_string())
            }
            _ => (reference, DEFAULT_TAG.to_string()),
        };
        if tag.is_empty() {
            return Err(EngineError::NotFound(format!(
                "empty tag in reference '{}'",
                reference
            )));
        }

        // A first component with a dot, a colon, or `localhost` is a
        // registry hostname; anything else is a repository path.
        let (registry, repository) = match name.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                if rest.is_empty() {
                    return Err(EngineError::NotFound(format!(
                        "empty repository in reference '{}'",
                        reference
                    )));
                }
                (first.to_string(), rest.to_string())
            }
            Some(_) => (defaults.registry.clone(), name.to_string()),
            None => (
                defaults.registry.clone(),
                format!("{}/{}", defaults.namespace, name),
            ),
        };

        Ok(ImageReference {
            registry,
            repository,
            tag,
        })
    }

    /// Fully qualified name without the tag, used as the ref-index key.
    pub fn name(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}:{}", self.registry, self.repository, self.tag)
    }
}
