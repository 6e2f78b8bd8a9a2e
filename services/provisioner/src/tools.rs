//! Tools catalogue: resolves agent binaries compatible with a machine.
//!
//! An empty result is a permanent condition from the provisioner's point
//! of view: polling will not make tools appear, an operator has to
//! publish them.

use async_trait::async_trait;
use thiserror::Error;

use crate::constraints::Constraints;

/// One published agent build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tools {
    /// Version string, e.g. `2.1.0`.
    pub version: String,
    /// Platform series the build targets.
    pub series: String,
    /// CPU architecture the build targets.
    pub arch: String,
    /// Where the binary can be fetched from.
    pub url: String,
}

/// A set of candidate tools, best match first.
pub type ToolsList = Vec<Tools>;

/// Errors from tools resolution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ToolsError {
    /// Nothing in the catalogue matches the machine.
    #[error("no matching tools available")]
    NotFound,
}

/// Source of agent binaries.
#[async_trait]
pub trait ToolsCatalogue: Send + Sync {
    /// Finds tools compatible with the given series and constraints.
    /// Returns [`ToolsError::NotFound`] rather than an empty list.
    async fn find_tools(&self, series: &str, cons: &Constraints)
        -> Result<ToolsList, ToolsError>;
}

/// In-memory catalogue for tests and the local backend.
#[derive(Debug, Default)]
pub struct SimpleCatalogue {
    entries: Vec<Tools>,
}

impl SimpleCatalogue {
    /// Creates an empty catalogue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a catalogue pre-populated with the given builds.
    #[must_use]
    pub fn with_tools(entries: Vec<Tools>) -> Self {
        Self { entries }
    }

    /// Publishes one build.
    pub fn add(&mut self, tools: Tools) {
        self.entries.push(tools);
    }
}

#[async_trait]
impl ToolsCatalogue for SimpleCatalogue {
    async fn find_tools(
        &self,
        series: &str,
        cons: &Constraints,
    ) -> Result<ToolsList, ToolsError> {
        let matches: ToolsList = self
            .entries
            .iter()
            .filter(|t| t.series == series)
            .filter(|t| cons.arch.as_deref().is_none_or(|arch| t.arch == arch))
            .cloned()
            .collect();
        if matches.is_empty() {
            return Err(ToolsError::NotFound);
        }
        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalogue() -> SimpleCatalogue {
        SimpleCatalogue::with_tools(vec![
            Tools {
                version: "2.1.0".into(),
                series: "noble".into(),
                arch: "amd64".into(),
                url: "https://tools.test/2.1.0-noble-amd64.tgz".into(),
            },
            Tools {
                version: "2.1.0".into(),
                series: "noble".into(),
                arch: "arm64".into(),
                url: "https://tools.test/2.1.0-noble-arm64.tgz".into(),
            },
        ])
    }

    #[tokio::test]
    async fn filters_by_series_and_arch() {
        let cat = catalogue();
        let cons: Constraints = "arch=amd64".parse().unwrap();
        let found = cat.find_tools("noble", &cons).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].arch, "amd64");

        // No arch preference matches every build for the series.
        let all = cat.find_tools("noble", &Constraints::default()).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn missing_series_is_not_found() {
        let cat = catalogue();
        let err = cat
            .find_tools("raring", &Constraints::default())
            .await
            .unwrap_err();
        assert_eq!(err, ToolsError::NotFound);
        assert_eq!(err.to_string(), "no matching tools available");
    }
}
