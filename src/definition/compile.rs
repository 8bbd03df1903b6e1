//! Link compilation: every link is classified once, before any fetch.

use std::fmt;

use super::{GraphDefinition, Link};
use crate::error::{GraphError, Result};
use crate::traversal::path::PathExpr;
use crate::traversal::query::{ParamsTemplate, QueryMode};

/// What evaluating a link does
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkKind {
    /// Re-tag held resources as the target type; no query
    PassThrough,
    /// Issue the template verbatim whenever a source resource is held
    Static { template: ParamsTemplate },
    /// Resolve `path` on each source resource and substitute into `template`
    Search {
        path: PathExpr,
        template: ParamsTemplate,
        mode: QueryMode,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledLink {
    /// Position in the definition's link list
    pub index: usize,
    pub source_type: String,
    pub target_type: String,
    pub kind: LinkKind,
}

impl CompiledLink {
    fn compile(index: usize, link: &Link) -> Result<Self> {
        let source_type = link.source_type.trim();
        let target_type = link.target_type.trim();
        if source_type.is_empty() || target_type.is_empty() {
            return Err(GraphError::Configuration(format!(
                "link {} needs both a source and a target type",
                index
            )));
        }

        let kind = match (link.path.as_deref(), link.params.as_deref()) {
            (None, None) => LinkKind::PassThrough,
            (Some(path), None) => {
                return Err(GraphError::Configuration(format!(
                    "link {} ({} -> {}) has path '{}' but no params template",
                    index, source_type, target_type, path
                )));
            }
            (path, Some(params)) => {
                let template = ParamsTemplate::parse(params)?;
                match (template.token(), path) {
                    (None, _) => LinkKind::Static { template },
                    (Some(token), path) => {
                        let path = match path {
                            Some(path) if token == "path" || token == path.trim() => path,
                            Some(path) => {
                                return Err(GraphError::Configuration(format!(
                                    "link {}: token {{{}}} does not match path '{}'",
                                    index, token, path
                                )));
                            }
                            None if token == "path" => {
                                return Err(GraphError::Configuration(format!(
                                    "link {}: params use {{path}} but the link has no path",
                                    index
                                )));
                            }
                            // the token names the path itself, e.g. {Group.id}
                            None => token,
                        };
                        let path = PathExpr::parse(path)?;
                        if path.type_tag() != source_type {
                            return Err(GraphError::Configuration(format!(
                                "link {}: path '{}' does not start at source type {}",
                                index, path, source_type
                            )));
                        }
                        let mode = QueryMode::for_template(&template, link.batch);
                        LinkKind::Search { path, template, mode }
                    }
                }
            }
        };

        Ok(Self {
            index,
            source_type: source_type.to_string(),
            target_type: target_type.to_string(),
            kind,
        })
    }

    pub fn is_pass_through(&self) -> bool {
        matches!(self.kind, LinkKind::PassThrough)
    }
}

impl fmt::Display for CompiledLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {} -> {}", self.index, self.source_type, self.target_type)
    }
}

/// A validated, ready-to-run graph
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledGraph {
    pub id: String,
    pub links: Vec<CompiledLink>,
}

impl CompiledGraph {
    /// Validate every link; the first broken one aborts with a configuration error.
    pub fn compile(definition: &GraphDefinition) -> Result<Self> {
        let links = definition
            .link
            .iter()
            .enumerate()
            .map(|(index, link)| CompiledLink::compile(index, link))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            id: definition.id.clone(),
            links,
        })
    }

    /// Links leaving `resource_type`, in definition order
    pub fn links_from<'a>(&'a self, resource_type: &'a str) -> impl Iterator<Item = &'a CompiledLink> + 'a {
        self.links.iter().filter(move |l| l.source_type == resource_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile_one(link: Link) -> Result<CompiledLink> {
        CompiledGraph::compile(&GraphDefinition::new("g", vec![link])).map(|g| g.links[0].clone())
    }

    #[test]
    fn test_pass_through() {
        let link = compile_one(Link::new("Specimen", "Group")).unwrap();
        assert!(link.is_pass_through());
    }

    #[test]
    fn test_static_template() {
        let link = compile_one(Link::new("Patient", "Specimen").with_params("subject=Patient/42")).unwrap();
        assert!(matches!(link.kind, LinkKind::Static { .. }));
    }

    #[test]
    fn test_search_with_path_token() {
        let link = compile_one(
            Link::new("Specimen", "Patient")
                .with_path("Specimen.subject.reference")
                .with_params("_id={path}"),
        )
        .unwrap();
        match link.kind {
            LinkKind::Search { path, mode, .. } => {
                assert_eq!(path.as_str(), "Specimen.subject.reference");
                assert_eq!(mode, QueryMode::Batch);
            }
            other => panic!("unexpected kind {:?}", other),
        }
    }

    #[test]
    fn test_token_names_path() {
        let link = compile_one(Link::new("Group", "DocumentReference").with_params("subject={Group.id}")).unwrap();
        match link.kind {
            LinkKind::Search { path, mode, .. } => {
                assert_eq!(path.as_str(), "Group.id");
                assert_eq!(mode, QueryMode::Expand);
            }
            other => panic!("unexpected kind {:?}", other),
        }
    }

    #[test]
    fn test_batch_override() {
        let link = compile_one(
            Link::new("Group", "DocumentReference")
                .with_params("subject={Group.id}")
                .with_batch(true),
        )
        .unwrap();
        assert!(matches!(link.kind, LinkKind::Search { mode: QueryMode::Batch, .. }));
    }

    #[test]
    fn test_configuration_errors() {
        let cases = vec![
            Link::new("Patient", "Specimen").with_path("Patient.id"),
            Link::new("Patient", "Specimen").with_params("subject={path}"),
            Link::new("Patient", "Specimen").with_path("Specimen.id").with_params("subject={path}"),
            Link::new("Patient", "Specimen").with_path("Patient.id").with_params("subject={Group.id}"),
            Link::new("Patient", "Specimen").with_path("Patient.id").with_params("a={path}&b={path}"),
            Link::new("", "Specimen"),
        ];
        for link in cases {
            let err = compile_one(link.clone()).unwrap_err();
            assert!(matches!(err, GraphError::Configuration(_)), "{:?} -> {:?}", link, err);
        }
    }

    #[test]
    fn test_links_from_keeps_order() {
        let graph = CompiledGraph::compile(&GraphDefinition::new(
            "g",
            vec![
                Link::new("Patient", "Specimen").with_path("Patient.id").with_params("subject={path}"),
                Link::new("Specimen", "Group"),
                Link::new("Patient", "Condition").with_path("Patient.id").with_params("subject={path}"),
            ],
        ))
        .unwrap();
        let targets: Vec<_> = graph.links_from("Patient").map(|l| l.target_type.as_str()).collect();
        assert_eq!(targets, vec!["Specimen", "Condition"]);
    }
}
