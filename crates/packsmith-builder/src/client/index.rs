use std::cmp::Ordering;

use async_trait::async_trait;
use packsmith_common::{PackError, PackResult};
use packsmith_image::ImageReference;
use serde::Deserialize;

use super::PackageLookup;

/// One line of a registry index file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
struct IndexEntry {
    ns: String,
    name: String,
    version: String,
    #[serde(default)]
    yanked: bool,
    addr: String,
}

/// [`PackageLookup`] over a buildpack registry index served over HTTP.
///
/// The index holds one file per package, named `<ns>_<name>` and sharded by
/// the package name; each line is one JSON-encoded version entry.
pub struct RegistryIndex {
    http: reqwest::Client,
}

impl RegistryIndex {
    /// Lookup sharing `http` with the rest of the process.
    #[must_use]
    pub const fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    async fn fetch(&self, url: &str, id: &str) -> PackResult<String> {
        let response = self.http.get(url).send().await.map_err(transport_error)?;
        match response.status() {
            s if s.is_success() => response.text().await.map_err(transport_error),
            reqwest::StatusCode::NOT_FOUND => Err(PackError::ImageNotFound {
                reference: format!("urn:cnb:registry:{id}"),
            }),
            reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN => {
                Err(PackError::Unauthorized {
                    registry: url.to_string(),
                })
            }
            s => Err(PackError::Registry {
                status: s.as_u16(),
                message: format!("fetching registry index entry for {id}"),
            }),
        }
    }
}

#[async_trait]
impl PackageLookup for RegistryIndex {
    async fn lookup(
        &self,
        registry_url: &str,
        id: &str,
        version: Option<&str>,
    ) -> PackResult<ImageReference> {
        let (ns, name) = id.split_once('/').ok_or_else(|| PackError::InvalidReference {
            reference: id.to_string(),
            reason: "registry ids have the form <namespace>/<name>".to_string(),
        })?;

        let url = format!(
            "{}/{}",
            registry_url.trim_end_matches('/'),
            index_path(ns, name)
        );
        tracing::debug!(id, url = %url, "Looking up registry package");

        let body = self.fetch(&url, id).await?;
        let entries = body
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(serde_json::from_str::<IndexEntry>)
            .collect::<Result<Vec<_>, _>>()?;

        let entry = select(&entries, ns, name, version)?;
        tracing::debug!(id, version = %entry.version, addr = %entry.addr, "Registry package found");
        ImageReference::parse(&entry.addr)
    }
}

/// Index file path for a package.
fn index_path(ns: &str, name: &str) -> String {
    let file = format!("{ns}_{name}");
    match name.len() {
        1 => format!("1/{file}"),
        2 => format!("2/{file}"),
        3 => format!("3/{}/{file}", name.get(..2).unwrap_or(name)),
        _ => format!(
            "{}/{}/{file}",
            name.get(..2).unwrap_or(name),
            name.get(2..4).unwrap_or(name)
        ),
    }
}

fn select<'a>(
    entries: &'a [IndexEntry],
    ns: &str,
    name: &str,
    version: Option<&str>,
) -> PackResult<&'a IndexEntry> {
    let id = format!("{ns}/{name}");
    let mut candidates = entries.iter().filter(|e| e.ns == ns && e.name == name);

    let found = match version {
        Some(version) => {
            let entry = candidates.find(|e| e.version == version);
            if let Some(entry) = entry.filter(|e| e.yanked) {
                return Err(PackError::ImageNotFound {
                    reference: format!("urn:cnb:registry:{id}@{} (yanked)", entry.version),
                });
            }
            entry
        }
        None => candidates
            .filter(|e| !e.yanked)
            .max_by(|a, b| compare_versions(&a.version, &b.version)),
    };

    found.ok_or_else(|| PackError::ImageNotFound {
        reference: format!(
            "urn:cnb:registry:{id}{}",
            version.map(|v| format!("@{v}")).unwrap_or_default()
        ),
    })
}

/// Compare dotted versions numerically where both components are numbers.
pub(super) fn compare_versions(a: &str, b: &str) -> Ordering {
    let mut left = a.split(['.', '-', '+']);
    let mut right = b.split(['.', '-', '+']);
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (Some(_), None) => return Ordering::Greater,
            (None, Some(_)) => return Ordering::Less,
            (Some(l), Some(r)) => {
                let ordering = match (l.parse::<u64>(), r.parse::<u64>()) {
                    (Ok(l), Ok(r)) => l.cmp(&r),
                    _ => l.cmp(r),
                };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
        }
    }
}

fn transport_error(err: reqwest::Error) -> PackError {
    if err.is_timeout() {
        PackError::Timeout {
            operation: "registry index lookup".to_string(),
        }
    } else {
        PackError::Network {
            message: err.to_string(),
        }
    }
}
