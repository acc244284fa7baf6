use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;

use serde::Serialize;

use crate::error::{Error, Result};

/// Organizational level a metric is rolled up to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Repo,
    Project,
    Community,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Repo => "repo",
            Level::Project => "project",
            Level::Community => "community",
        }
    }
}

impl FromStr for Level {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "repo" => Ok(Level::Repo),
            "project" => Ok(Level::Project),
            "community" => Ok(Level::Community),
            other => Err(Error::Config(format!(
                "unknown level '{other}', expected repo, project or community"
            ))),
        }
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One project of the community: source label -> repository identifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectGroup {
    pub name: String,
    pub sources: Vec<(String, Vec<String>)>,
}

impl ProjectGroup {
    pub fn has_source(&self, label: &str) -> bool {
        self.sources.iter().any(|(l, _)| l == label)
    }

    /// The source list `filter` selects for this project: the explicit
    /// source, else the index source when this project has that label, else
    /// every list.
    fn selected_source<'a>(&self, filter: &'a ScopeFilter) -> Option<&'a str> {
        filter.source.as_deref().or_else(|| {
            filter
                .index_source
                .as_deref()
                .filter(|label| self.has_source(label))
        })
    }

    /// Repositories of this project under `filter`, deduplicated.
    fn repos(&self, filter: &ScopeFilter) -> Vec<String> {
        let source = self.selected_source(filter);
        let lists = self
            .sources
            .iter()
            .filter(|(label, _)| source.map_or(true, |s| s == label.as_str()))
            .flat_map(|(_, repos)| repos.iter());
        dedup(lists)
    }
}

/// The community -> project -> repository hierarchy, loaded once per run.
///
/// The file format is a JSON object keyed by project name; each project maps
/// a source label (e.g. `gitee`, `github`) to a list of repository
/// identifiers. The whole document forms one community. Key order is kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupingDocument {
    projects: Vec<ProjectGroup>,
}

impl GroupingDocument {
    pub fn from_json(text: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| Error::Config(format!("grouping document is not valid JSON: {e}")))?;
        Self::from_value(&value)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read grouping document {}: {e}", path.display()))
        })?;
        Self::from_json(&text)
    }

    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        let top = value
            .as_object()
            .ok_or_else(|| Error::Config("grouping document must be a JSON object".into()))?;

        let mut projects = Vec::with_capacity(top.len());
        for (name, sources_value) in top {
            let sources_obj = sources_value.as_object().ok_or_else(|| {
                Error::Config(format!("project '{name}' must map source labels to repository lists"))
            })?;
            let mut sources = Vec::with_capacity(sources_obj.len());
            for (label, repos_value) in sources_obj {
                let repos = repos_value
                    .as_array()
                    .ok_or_else(|| {
                        Error::Config(format!("'{name}.{label}' must be a list of repositories"))
                    })?
                    .iter()
                    .map(|r| {
                        r.as_str().map(str::to_string).ok_or_else(|| {
                            Error::Config(format!("'{name}.{label}' contains a non-string entry"))
                        })
                    })
                    .collect::<Result<Vec<String>>>()?;
                sources.push((label.clone(), repos));
            }
            projects.push(ProjectGroup {
                name: name.clone(),
                sources,
            });
        }
        Ok(Self { projects })
    }

    pub fn projects(&self) -> &[ProjectGroup] {
        &self.projects
    }

    pub fn project_names(&self) -> Vec<String> {
        self.projects.iter().map(|p| p.name.clone()).collect()
    }
}

/// Narrows which part of the grouping document a run covers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeFilter {
    /// Identifier given to the community-level scope.
    pub community: String,
    /// Only this project (repo and project levels).
    pub project: Option<String>,
    /// Only this source list within each project.
    pub source: Option<String>,
    /// Source label implied by the queried index (`gitee` for
    /// `gitee_issues`). Picks that list in projects that have it when
    /// `source` is unset.
    pub index_source: Option<String>,
}

impl ScopeFilter {
    /// The label an index name starts with, up to the first `_`.
    pub fn source_of_index(index: &str) -> Option<String> {
        index
            .split('_')
            .next()
            .filter(|label| !label.is_empty())
            .map(str::to_string)
    }
}

/// A unit of aggregation: one identifier and the repositories it covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Scope {
    pub identifier: String,
    pub level: Level,
    /// Projects the repositories were drawn from.
    pub projects: Vec<String>,
    pub repos: Vec<String>,
}

/// Resolve the ordered (identifier, repository set) pairs for `level`.
///
/// Repository sets are deduplicated at every level, first occurrence wins.
pub fn resolve(level: Level, document: &GroupingDocument, filter: &ScopeFilter) -> Result<Vec<Scope>> {
    let selected: Vec<&ProjectGroup> = document
        .projects
        .iter()
        .filter(|p| filter.project.as_deref().map_or(true, |name| name == p.name))
        .collect();

    if let Some(name) = &filter.project {
        if selected.is_empty() {
            return Err(Error::Config(format!(
                "project '{name}' not found in grouping document"
            )));
        }
    }

    let scopes = match level {
        Level::Repo => {
            let mut seen = HashSet::new();
            let mut scopes = Vec::new();
            for project in &selected {
                for repo in project.repos(filter) {
                    if seen.insert(repo.clone()) {
                        scopes.push(Scope {
                            identifier: repo.clone(),
                            level,
                            projects: vec![project.name.clone()],
                            repos: vec![repo],
                        });
                    }
                }
            }
            scopes
        }
        Level::Project => selected
            .iter()
            .map(|project| Scope {
                identifier: project.name.clone(),
                level,
                projects: vec![project.name.clone()],
                repos: project.repos(filter),
            })
            .collect(),
        Level::Community => {
            if filter.community.trim().is_empty() {
                return Err(Error::Config(
                    "community level requires a community name".into(),
                ));
            }
            if let Some(name) = &filter.project {
                log::warn!("Ignoring project '{name}': community scopes span every project");
            }
            let all: Vec<String> = document
                .projects
                .iter()
                .flat_map(|p| p.repos(filter))
                .collect();
            let repos = dedup(all.iter());
            vec![Scope {
                identifier: filter.community.clone(),
                level,
                projects: document.project_names(),
                repos,
            }]
        }
    };

    log::debug!("resolved {} {level} scope(s)", scopes.len());
    Ok(scopes)
}

fn dedup<'a>(items: impl Iterator<Item = &'a String>) -> Vec<String> {
    let mut seen: HashSet<&'a str> = HashSet::new();
    let mut out = Vec::new();
    for item in items {
        if seen.insert(item.as_str()) {
            out.push(item.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(json: &str) -> GroupingDocument {
        GroupingDocument::from_json(json).unwrap()
    }

    fn filter(community: &str) -> ScopeFilter {
        ScopeFilter {
            community: community.to_string(),
            ..Default::default()
        }
    }

    const TWO_PROJECTS: &str = r#"{
        "issue": {"gitee": ["repoA", "repoB"], "github": ["repoC"]},
        "pr": {"gitee": ["repoB", "repoD"]}
    }"#;

    #[test]
    fn test_parse_level() {
        assert_eq!("repo".parse::<Level>().unwrap(), Level::Repo);
        assert_eq!("Project".parse::<Level>().unwrap(), Level::Project);
        assert_eq!(" community ".parse::<Level>().unwrap(), Level::Community);
        assert!(matches!("org".parse::<Level>(), Err(Error::Config(_))));
    }

    #[test]
    fn test_malformed_documents_are_config_errors() {
        for bad in [
            "not json",
            "[]",
            r#"{"p": ["repoA"]}"#,
            r#"{"p": {"gitee": "repoA"}}"#,
            r#"{"p": {"gitee": [1, 2]}}"#,
        ] {
            assert!(
                matches!(GroupingDocument::from_json(bad), Err(Error::Config(_))),
                "{bad}"
            );
        }
    }

    #[test]
    fn test_repo_level_one_scope_per_repo() {
        let scopes = resolve(Level::Repo, &doc(TWO_PROJECTS), &filter("acme")).unwrap();
        let ids: Vec<&str> = scopes.iter().map(|s| s.identifier.as_str()).collect();
        assert_eq!(ids, vec!["repoA", "repoB", "repoC", "repoD"]);
        for scope in &scopes {
            assert_eq!(scope.repos, vec![scope.identifier.clone()]);
            assert_eq!(scope.level, Level::Repo);
        }
    }

    #[test]
    fn test_project_level_preserves_file_order() {
        let scopes = resolve(Level::Project, &doc(TWO_PROJECTS), &filter("acme")).unwrap();
        assert_eq!(scopes.len(), 2);
        assert_eq!(scopes[0].identifier, "issue");
        assert_eq!(scopes[0].repos, vec!["repoA", "repoB", "repoC"]);
        assert_eq!(scopes[1].identifier, "pr");
        assert_eq!(scopes[1].repos, vec!["repoB", "repoD"]);
    }

    #[test]
    fn test_community_level_union_without_duplicates() {
        let scopes = resolve(Level::Community, &doc(TWO_PROJECTS), &filter("acme")).unwrap();
        assert_eq!(scopes.len(), 1);
        assert_eq!(scopes[0].identifier, "acme");
        // repoB appears under both projects but only once here
        assert_eq!(scopes[0].repos, vec!["repoA", "repoB", "repoC", "repoD"]);
        assert_eq!(scopes[0].projects, vec!["issue", "pr"]);
    }

    #[test]
    fn test_community_level_requires_name() {
        assert!(matches!(
            resolve(Level::Community, &doc(TWO_PROJECTS), &filter("")),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_source_filter() {
        let f = ScopeFilter {
            community: "acme".into(),
            source: Some("github".into()),
            ..Default::default()
        };
        let scopes = resolve(Level::Project, &doc(TWO_PROJECTS), &f).unwrap();
        assert_eq!(scopes[0].repos, vec!["repoC"]);
        assert!(scopes[1].repos.is_empty());
    }

    #[test]
    fn test_index_source_picks_matching_list() {
        let f = ScopeFilter {
            community: "acme".into(),
            index_source: ScopeFilter::source_of_index("gitee_issues"),
            ..Default::default()
        };
        assert_eq!(f.index_source.as_deref(), Some("gitee"));
        let document = doc(
            r#"{
            "issue": {"gitee": ["repoA"], "github": ["repoC"]},
            "mirror": {"github": ["repoE"]}
        }"#,
        );

        let scopes = resolve(Level::Repo, &document, &f).unwrap();
        let ids: Vec<&str> = scopes.iter().map(|s| s.identifier.as_str()).collect();
        // "mirror" has no gitee list, so all of its lists count
        assert_eq!(ids, vec!["repoA", "repoE"]);

        // an explicit source wins
        let explicit = ScopeFilter {
            source: Some("github".into()),
            ..f.clone()
        };
        let scopes = resolve(Level::Project, &document, &explicit).unwrap();
        assert_eq!(scopes[0].repos, vec!["repoC"]);

        let community = resolve(Level::Community, &document, &f).unwrap();
        assert_eq!(community[0].repos, vec!["repoA", "repoE"]);
    }

    #[test]
    fn test_source_of_index() {
        assert_eq!(ScopeFilter::source_of_index("gitee_issues").as_deref(), Some("gitee"));
        assert_eq!(ScopeFilter::source_of_index("issues").as_deref(), Some("issues"));
        assert_eq!(ScopeFilter::source_of_index("_issues"), None);
    }

    #[test]
    fn test_project_filter() {
        let f = ScopeFilter {
            community: "acme".into(),
            project: Some("pr".into()),
            ..Default::default()
        };
        let scopes = resolve(Level::Repo, &doc(TWO_PROJECTS), &f).unwrap();
        let ids: Vec<&str> = scopes.iter().map(|s| s.identifier.as_str()).collect();
        assert_eq!(ids, vec!["repoB", "repoD"]);

        let missing = ScopeFilter {
            project: Some("nope".into()),
            ..f
        };
        assert!(matches!(
            resolve(Level::Project, &doc(TWO_PROJECTS), &missing),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_empty_project_yields_empty_repo_set() {
        let scopes = resolve(Level::Project, &doc(r#"{"empty": {"gitee": []}}"#), &filter("acme"))
            .unwrap();
        assert_eq!(scopes.len(), 1);
        assert!(scopes[0].repos.is_empty());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("repos.json");
        std::fs::write(&path, r#"{"acme": {"issue": ["repoA", "repoB"]}}"#).unwrap();
        let loaded = GroupingDocument::load(&path).unwrap();
        assert_eq!(loaded.project_names(), vec!["acme"]);

        assert!(matches!(
            GroupingDocument::load(dir.path().join("missing.json")),
            Err(Error::Config(_))
        ));
    }
}
