//! Discovery filters: user allow/deny lists and per-server library exclusions

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::model::{RawEpisodeEvent, is_system_user};

/// User allow/deny lists (case-sensitive names, as the media server reports them)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserFilter {
    pub allow: Vec<String>,
    pub deny: Vec<String>,
}

impl UserFilter {
    /// Build from comma-separated lists
    pub fn from_lists(allow: &str, deny: &str) -> Self {
        Self {
            allow: split_names(allow),
            deny: split_names(deny),
        }
    }

    /// Events without a real user (system actors) are never filtered out
    pub fn permits(&self, user: Option<&str>) -> bool {
        let Some(user) = user.map(str::trim).filter(|u| !u.is_empty()) else {
            return true;
        };
        if is_system_user(user) {
            return true;
        }
        if !self.allow.is_empty() && !self.allow.iter().any(|a| a == user) {
            return false;
        }
        !self.deny.iter().any(|d| d == user)
    }
}

fn split_names(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// `server_name:library_name_or_id` exclusion rule, stored lower-cased
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryExclusionRule {
    pub server: String,
    pub library: String,
}

impl LibraryExclusionRule {
    /// Parse one rule per line; malformed lines are logged and skipped
    pub fn parse_lines(raw: &str) -> Vec<Self> {
        let mut rules = Vec::new();
        for line in raw.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let Some((server, library)) = line.split_once(':') else {
                warn!(
                    job = "catchup",
                    rule = %line,
                    "Ignoring library exclusion rule without 'server:library' form"
                );
                continue;
            };
            let library = library.trim().to_lowercase();
            if library.is_empty() {
                continue;
            }
            rules.push(Self {
                server: server.trim().to_lowercase(),
                library,
            });
        }
        rules
    }

    pub fn applies_to(&self, server: &str) -> bool {
        self.server == server.trim().to_lowercase()
    }
}

/// A library folder as listed by the media server
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryFolder {
    pub id: String,
    pub name: String,
    pub paths: Vec<String>,
}

/// Path prefixes excluded for one server, resolved from the rules
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExcludedLibraries {
    pub names: Vec<String>,
    prefixes: Vec<String>,
}

impl ExcludedLibraries {
    pub fn resolve(rules: &[LibraryExclusionRule], server: &str, folders: &[LibraryFolder]) -> Self {
        let tokens: Vec<&str> = rules
            .iter()
            .filter(|r| r.applies_to(server))
            .map(|r| r.library.as_str())
            .collect();
        if tokens.is_empty() {
            return Self::default();
        }

        let mut resolved = Self::default();
        for folder in folders {
            let id = folder.id.trim().to_lowercase();
            let name = folder.name.trim().to_lowercase();
            if !tokens.contains(&id.as_str()) && !tokens.contains(&name.as_str()) {
                continue;
            }
            if !folder.name.is_empty() {
                resolved.names.push(folder.name.clone());
            }
            resolved.prefixes.extend(
                folder
                    .paths
                    .iter()
                    .map(|p| normalize_path(p))
                    .filter(|p| !p.is_empty()),
            );
        }
        resolved.names.sort();
        resolved.names.dedup();
        resolved
    }

    pub fn is_empty(&self) -> bool {
        self.prefixes.is_empty()
    }

    /// Items without a path are never excluded
    pub fn excludes(&self, event: &RawEpisodeEvent) -> bool {
        let Some(path) = event.path.as_deref().map(normalize_path).filter(|p| !p.is_empty()) else {
            return false;
        };
        self.prefixes.iter().any(|base| path.starts_with(base.as_str()))
    }
}

fn normalize_path(raw: &str) -> String {
    raw.replace('\\', "/")
        .to_lowercase()
        .trim_end_matches('/')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catchup::model::RECENTLY_ADDED_USER;

    #[test]
    fn test_user_filter_allow_and_deny() {
        let filter = UserFilter::from_lists("alice, bob", "bob");
        assert!(filter.permits(Some("alice")));
        assert!(!filter.permits(Some("bob")));
        assert!(!filter.permits(Some("carol")));
        assert!(filter.permits(None));
        assert!(filter.permits(Some(RECENTLY_ADDED_USER)));
        for alias in ["system", "recent_added", "RecentlyAdded", "__system__"] {
            assert!(filter.permits(Some(alias)), "{alias} should pass the allow list");
        }
    }

    #[test]
    fn test_empty_user_filter_permits_everyone() {
        let filter = UserFilter::default();
        assert!(filter.permits(Some("anyone")));
    }

    #[test]
    fn test_parse_exclusion_rules_skips_malformed_lines() {
        let rules = LibraryExclusionRule::parse_lines("Home:Kids\nbroken line\n\nHome: \nOffice:ABC123");
        assert_eq!(
            rules,
            vec![
                LibraryExclusionRule {
                    server: "home".into(),
                    library: "kids".into()
                },
                LibraryExclusionRule {
                    server: "office".into(),
                    library: "abc123".into()
                },
            ]
        );
    }

    #[test]
    fn test_excluded_libraries_match_by_name_or_id() {
        let rules = LibraryExclusionRule::parse_lines("home:kids\nhome:lib-2");
        let folders = vec![
            LibraryFolder {
                id: "lib-1".into(),
                name: "Kids".into(),
                paths: vec!["D:\\Media\\Kids\\".into()],
            },
            LibraryFolder {
                id: "lib-2".into(),
                name: "Anime".into(),
                paths: vec!["/mnt/anime".into()],
            },
            LibraryFolder {
                id: "lib-3".into(),
                name: "Shows".into(),
                paths: vec!["/mnt/shows".into()],
            },
        ];
        let excluded = ExcludedLibraries::resolve(&rules, "Home", &folders);
        assert_eq!(excluded.names, vec!["Anime".to_string(), "Kids".to_string()]);

        let event = |path: &str| RawEpisodeEvent {
            path: Some(path.to_string()),
            ..Default::default()
        };
        assert!(excluded.excludes(&event("d:/media/kids/Show/S01E01.mkv")));
        assert!(excluded.excludes(&event("/mnt/Anime/x.mkv")));
        assert!(!excluded.excludes(&event("/mnt/shows/x.mkv")));
        assert!(!excluded.excludes(&RawEpisodeEvent::default()));

        let other_server = ExcludedLibraries::resolve(&rules, "office", &folders);
        assert!(other_server.is_empty());
    }
}
