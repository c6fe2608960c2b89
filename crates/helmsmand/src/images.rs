//! Static image repository backed by the `[[images]]` config table.

use std::collections::{HashMap, HashSet};

use sha2::{Digest, Sha256};

use helmsman_core::config::ImageConfig;
use helmsman_rollout::{AdapterFuture, ImageRepository};

pub struct StaticImageRepository {
    /// `(workload, branch)` → known tags.
    tags: HashMap<(String, String), HashSet<String>>,
}

impl StaticImageRepository {
    pub fn from_config(images: &[ImageConfig]) -> Self {
        let mut tags: HashMap<(String, String), HashSet<String>> = HashMap::new();
        for image in images {
            tags.entry((image.workload.clone(), image.branch.clone()))
                .or_default()
                .extend(image.tags.iter().cloned());
        }
        Self { tags }
    }

    fn lookup(&self, workload: &str, branch: &str, tag: &str) -> Option<String> {
        let known = self.tags.get(&(workload.to_string(), branch.to_string()))?;
        known
            .contains(tag)
            .then(|| format!("sha256:{}", pseudo_digest(workload, branch, tag)))
    }
}

/// Stable stand-in for a registry manifest digest.
fn pseudo_digest(workload: &str, branch: &str, tag: &str) -> String {
    hex::encode(Sha256::digest(format!("{workload}@{branch}:{tag}").as_bytes()))
}

impl ImageRepository for StaticImageRepository {
    fn resolve_tag<'a>(
        &'a self,
        workload: &'a str,
        branch: &'a str,
        tag: &'a str,
    ) -> AdapterFuture<'a, Option<String>> {
        let digest = self.lookup(workload, branch, tag);
        Box::pin(async move { Ok(digest) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> StaticImageRepository {
        StaticImageRepository::from_config(&[
            ImageConfig {
                workload: "api".to_string(),
                branch: "main".to_string(),
                tags: vec!["v41".to_string(), "v42".to_string()],
            },
            ImageConfig {
                workload: "api".to_string(),
                branch: "main".to_string(),
                tags: vec!["v43".to_string()],
            },
        ])
    }

    #[tokio::test]
    async fn known_tags_resolve_to_stable_digest() {
        let repo = repo();
        let first = repo.resolve_tag("api", "main", "v42").await.unwrap().unwrap();
        let again = repo.resolve_tag("api", "main", "v42").await.unwrap().unwrap();
        assert_eq!(first, again);
        assert!(first.starts_with("sha256:"));
        assert_eq!(first.len(), "sha256:".len() + 64);

        let other = repo.resolve_tag("api", "main", "v43").await.unwrap().unwrap();
        assert_ne!(first, other);
    }

    #[tokio::test]
    async fn unknown_pairs_are_none() {
        let repo = repo();
        assert!(repo.resolve_tag("api", "main", "v99").await.unwrap().is_none());
        assert!(repo.resolve_tag("api", "release", "v42").await.unwrap().is_none());
        assert!(repo.resolve_tag("web", "main", "v42").await.unwrap().is_none());
    }
}
