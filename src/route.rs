use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::config::{ProjectConfig, RegionEntry};
use crate::error::ConfigError;

/// Stable identity of a registered endpoint: method plus path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RouteKey {
    pub method: String,
    pub path: String,
}

impl RouteKey {
    pub fn new(method: &str, path: &str) -> Self {
        Self {
            method: method.trim().to_ascii_uppercase(),
            path: path.trim().to_string(),
        }
    }

    /// Parse the `METHOD /path` form used in config files and traces.
    pub fn parse(text: &str) -> Option<Self> {
        let (method, path) = text.trim().split_once(char::is_whitespace)?;
        let path = path.trim();
        if method.is_empty() || path.is_empty() {
            return None;
        }
        Some(Self::new(method, path))
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.path)
    }
}

/// 1-based inclusive line range inside a project-relative file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SourceRegion {
    pub file: PathBuf,
    pub start_line: usize,
    pub end_line: usize,
}

impl SourceRegion {
    fn from_entry(entry: &RegionEntry) -> Self {
        Self {
            file: entry.file.clone(),
            start_line: entry.lines[0],
            end_line: entry.lines[1],
        }
    }
}

impl fmt::Display for SourceRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}-{}",
            self.file.display(),
            self.start_line,
            self.end_line
        )
    }
}

/// One registered endpoint and the source regions that implement it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteDescriptor {
    pub key: RouteKey,

    /// Handler body.
    pub handler: SourceRegion,

    /// Request schema holding the validation constraints, when declared apart from the handler.
    pub schema: Option<SourceRegion>,
}

/// Helper code reachable from the listed routes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SharedRegion {
    pub region: SourceRegion,
    pub used_by: BTreeSet<RouteKey>,
}

/// Read-only snapshot of the route registry taken once per analysis pass.
#[derive(Debug, Clone, Default)]
pub struct RouteRegistry {
    routes: Vec<RouteDescriptor>,
    shared: Vec<SharedRegion>,
}

impl RouteRegistry {
    /// Take a snapshot of the routes declared in the project config.
    ///
    /// Routes come back sorted by key so every later stage sees the same order.
    pub fn snapshot(config: &ProjectConfig) -> Result<Self, ConfigError> {
        let mut routes = Vec::with_capacity(config.routes.len());
        let mut seen = BTreeSet::new();

        for entry in &config.routes {
            let key = RouteKey::new(&entry.method, &entry.path);
            if key.method.is_empty() || key.path.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "route entry with empty method or path: {:?} {:?}",
                    entry.method, entry.path
                )));
            }
            if !seen.insert(key.clone()) {
                return Err(ConfigError::DuplicateRoute(key.to_string()));
            }

            routes.push(RouteDescriptor {
                key,
                handler: SourceRegion::from_entry(&entry.handler),
                schema: entry.schema.as_ref().map(SourceRegion::from_entry),
            });
        }

        routes.sort_by(|a, b| a.key.cmp(&b.key));

        let mut shared = Vec::with_capacity(config.shared.len());
        for entry in &config.shared {
            let mut used_by = BTreeSet::new();
            for name in &entry.used_by {
                let key = RouteKey::parse(name).ok_or_else(|| {
                    ConfigError::Invalid(format!("shared region route {name:?} is not `METHOD /path`"))
                })?;
                if !seen.contains(&key) {
                    return Err(ConfigError::UnknownRoute(key.to_string()));
                }
                used_by.insert(key);
            }

            shared.push(SharedRegion {
                region: SourceRegion {
                    file: entry.file.clone(),
                    start_line: entry.lines[0],
                    end_line: entry.lines[1],
                },
                used_by,
            });
        }

        shared.sort_by(|a, b| a.region.cmp(&b.region));

        Ok(Self { routes, shared })
    }

    pub fn routes(&self) -> &[RouteDescriptor] {
        &self.routes
    }

    pub fn shared(&self) -> &[SharedRegion] {
        &self.shared
    }
}
