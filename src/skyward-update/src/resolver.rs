//! Choosing which patch brings an installed version to the newest one.

use crate::error::{UpdateError, UpdateResult};
use crate::manifest::{ServerManifest, VersionChoice};
use crate::version::VersionComparator;

/// The version choice selected for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedPatch {
    /// Index into `ServerManifest::choices`.
    pub index: usize,
    /// The choice is the full catch-all patch rather than a delta.
    pub catch_all: bool,
}

impl ResolvedPatch {
    pub fn choice<'a>(&self, manifest: &'a ServerManifest) -> Option<&'a VersionChoice> {
        manifest.choices.get(self.index)
    }
}

/// Pick the delta matching `installed`, falling back to the catch-all.
pub fn resolve(
    manifest: &ServerManifest,
    installed: &str,
    cmp: &VersionComparator,
) -> UpdateResult<ResolvedPatch> {
    let catch_all = manifest.catch_all_index(cmp);

    let exact = manifest
        .choices
        .iter()
        .enumerate()
        .find(|(i, c)| Some(*i) != catch_all && cmp.equal(&c.version, installed))
        .map(|(i, _)| i);

    match (exact, catch_all) {
        (Some(index), _) => Ok(ResolvedPatch {
            index,
            catch_all: false,
        }),
        (None, Some(index)) => {
            tracing::debug!("No delta from {}, using catch-all", installed);
            Ok(ResolvedPatch {
                index,
                catch_all: true,
            })
        }
        (None, None) => Err(UpdateError::NoUpdatePathToNewest {
            installed: installed.to_string(),
            latest: manifest.new_version.clone(),
        }),
    }
}

/// Changelog shown for `resolved`.
///
/// A catch-all shows its own text. A delta chain shows the resolved entry and
/// every later delta, each headed by the version it leads to.
pub fn changelog(
    manifest: &ServerManifest,
    resolved: &ResolvedPatch,
    cmp: &VersionComparator,
) -> String {
    if resolved.catch_all {
        return resolved
            .choice(manifest)
            .map(|c| c.changes.clone())
            .unwrap_or_default();
    }

    let catch_all = manifest.catch_all_index(cmp);
    let chain: Vec<&VersionChoice> = manifest
        .choices
        .iter()
        .enumerate()
        .skip(resolved.index)
        .filter(|(i, _)| Some(*i) != catch_all)
        .map(|(_, c)| c)
        .collect();

    chain
        .iter()
        .enumerate()
        .filter(|(_, c)| !c.changes.is_empty())
        .map(|(i, c)| {
            let target = chain
                .get(i + 1)
                .map(|next| next.version.as_str())
                .unwrap_or(&manifest.new_version);
            format!("{target}:\n{}", c.changes)
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn choice(version: &str, changes: &str) -> VersionChoice {
        VersionChoice {
            changes: changes.to_string(),
            ..VersionChoice::new(version)
        }
    }

    fn manifest(with_catch_all: bool) -> ServerManifest {
        let mut choices = vec![
            choice("1.0", "Faster startup"),
            choice("1.1", "Fixed crash on exit"),
            choice("1.2", "New icon"),
        ];
        if with_catch_all {
            choices.push(choice("1.3", "Everything up to 1.3"));
        }
        ServerManifest {
            new_version: "1.3".to_string(),
            choices,
            ..Default::default()
        }
    }

    #[test]
    fn test_exact_delta_is_preferred() {
        let cmp = VersionComparator::default();
        let resolved = resolve(&manifest(true), "1.1.0", &cmp).unwrap();
        assert_eq!(
            resolved,
            ResolvedPatch {
                index: 1,
                catch_all: false
            }
        );
    }

    #[test]
    fn test_unknown_version_uses_catch_all() {
        let cmp = VersionComparator::default();
        let resolved = resolve(&manifest(true), "0.9", &cmp).unwrap();
        assert_eq!(
            resolved,
            ResolvedPatch {
                index: 3,
                catch_all: true
            }
        );
    }

    #[test]
    fn test_no_path_without_catch_all() {
        let cmp = VersionComparator::default();
        match resolve(&manifest(false), "0.9", &cmp) {
            Err(UpdateError::NoUpdatePathToNewest { installed, latest }) => {
                assert_eq!(installed, "0.9");
                assert_eq!(latest, "1.3");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_changelog_of_delta_chain() {
        let cmp = VersionComparator::default();
        let m = manifest(true);
        let resolved = resolve(&m, "1.1", &cmp).unwrap();
        assert_eq!(
            changelog(&m, &resolved, &cmp),
            "1.2:\nFixed crash on exit\n\n1.3:\nNew icon"
        );
    }

    #[test]
    fn test_changelog_of_catch_all() {
        let cmp = VersionComparator::default();
        let m = manifest(true);
        let resolved = resolve(&m, "0.1", &cmp).unwrap();
        assert_eq!(changelog(&m, &resolved, &cmp), "Everything up to 1.3");
    }

    #[test]
    fn test_changelog_without_catch_all_ends_at_new_version() {
        let cmp = VersionComparator::default();
        let m = manifest(false);
        let resolved = resolve(&m, "1.2", &cmp).unwrap();
        assert_eq!(changelog(&m, &resolved, &cmp), "1.3:\nNew icon");
    }
}
