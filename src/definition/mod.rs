//! GraphDefinition documents: serde model, loading and link compilation.
//!
//! Link field names follow both the distilled form (`sourceType` /
//! `targetType`) and FHIR R5 (`sourceId` / `targetId`).

mod compile;

pub use compile::{CompiledGraph, CompiledLink, LinkKind};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

use crate::error::{GraphError, Result};
use crate::fhir::{ResourceRef, SearchApi};

/// Definitions compiled into the binary, as `(file name, contents)`
const BUNDLED: &[(&str, &str)] = &[
    (
        "research-study-graph.yaml",
        include_str!("../../graph-definitions/research-study-graph.yaml"),
    ),
    (
        "patient-survival-graph.json",
        include_str!("../../graph-definitions/patient-survival-graph.json"),
    ),
];

/// A named traversal specification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphDefinition {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub link: Vec<Link>,
}

/// One directed rule from a source type to a target type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Link {
    #[serde(alias = "sourceId")]
    pub source_type: String,
    #[serde(alias = "targetId")]
    pub target_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<String>,
    /// Force batch (`true`) or per-value (`false`) queries instead of the
    /// template-shape default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Link {
    pub fn new(source_type: &str, target_type: &str) -> Self {
        Self {
            source_type: source_type.to_string(),
            target_type: target_type.to_string(),
            path: None,
            params: None,
            batch: None,
            description: None,
        }
    }

    pub fn with_path(mut self, path: &str) -> Self {
        self.path = Some(path.to_string());
        self
    }

    pub fn with_params(mut self, params: &str) -> Self {
        self.params = Some(params.to_string());
        self
    }

    pub fn with_batch(mut self, batch: bool) -> Self {
        self.batch = Some(batch);
        self
    }
}

impl GraphDefinition {
    pub fn new(id: &str, link: Vec<Link>) -> Self {
        Self {
            id: id.to_string(),
            name: None,
            status: None,
            description: None,
            link,
        }
    }

    pub fn from_yaml_str(s: &str) -> Result<Self> {
        Ok(serde_yaml_ng::from_str(s)?)
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn from_json_value(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    /// Parse `content` as YAML or JSON, chosen by the extension of `name`
    fn from_named_str(name: &Path, content: &str) -> Result<Self> {
        match name.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml_str(content),
            _ => Self::from_json_str(content),
        }
    }

    /// Load a `.yaml`/`.yml` or JSON definition file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let definition = Self::from_named_str(path, &content)?;
        log::debug!(
            "Loaded GraphDefinition {} ({} links) from {}",
            definition.id,
            definition.link.len(),
            path.display()
        );
        Ok(definition)
    }

    /// Source type of the first link; the natural start type of the graph
    pub fn start_type(&self) -> Option<&str> {
        self.link.first().map(|l| l.source_type.as_str())
    }
}

/// Every definition shipped with the crate, in file-name order
pub fn bundled() -> Result<Vec<GraphDefinition>> {
    let mut named: Vec<_> = BUNDLED.to_vec();
    named.sort();
    named
        .into_iter()
        .map(|(name, content)| {
            GraphDefinition::from_named_str(Path::new(name), content)
                .map_err(|e| GraphError::InvalidInput(format!("bundled definition {} is broken: {}", name, e)))
        })
        .collect()
}

/// Find a definition by an existing file path, then by bundled id, then by
/// id on the server.
pub async fn resolve(reference: &str, api: &dyn SearchApi) -> Result<GraphDefinition> {
    let path = Path::new(reference);
    if path.is_file() {
        return GraphDefinition::load(path);
    }
    if let Some(definition) = bundled()?.into_iter().find(|d| d.id == reference) {
        log::debug!("Using bundled GraphDefinition {}", reference);
        return Ok(definition);
    }
    log::debug!("GraphDefinition {} is not a file or bundled, asking the server", reference);
    fetch(api, reference).await
}

/// Read `GraphDefinition/{id}` from the server
pub async fn fetch(api: &dyn SearchApi, id: &str) -> Result<GraphDefinition> {
    let document = api.read(&ResourceRef::new("GraphDefinition", id)).await?;
    GraphDefinition::from_json_value(document).map_err(|e| {
        GraphError::InvalidInput(format!("GraphDefinition/{} is not a usable definition: {}", id, e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fhir::InMemorySearchApi;
    use serde_json::json;
    use tempfile::TempDir;

    const YAML: &str = r#"
resourceType: GraphDefinition
id: patient-specimen-graph
name: patient_specimen_graph
status: active
description: Patients of a study, their specimens and documents.
link:
  - sourceId: ResearchStudy
    targetId: Patient
    path: ResearchStudy.id
    params: _has:ResearchSubject:subject:study={path}&_revinclude=Group:member&_count=1000&_total=accurate
  - sourceType: Patient
    targetType: Specimen
    path: Patient.id
    params: subject={path}
  - sourceType: Specimen
    targetType: Group
"#;

    #[test]
    fn test_from_yaml_accepts_both_field_spellings() {
        let def = GraphDefinition::from_yaml_str(YAML).unwrap();
        assert_eq!(def.id, "patient-specimen-graph");
        assert_eq!(def.status.as_deref(), Some("active"));
        assert_eq!(def.link.len(), 3);
        assert_eq!(def.link[0].source_type, "ResearchStudy");
        assert_eq!(def.link[0].target_type, "Patient");
        assert_eq!(def.link[1].source_type, "Patient");
        assert!(def.link[2].path.is_none() && def.link[2].params.is_none());
        assert_eq!(def.start_type(), Some("ResearchStudy"));
    }

    #[test]
    fn test_load_json_and_yaml_files() {
        let temp_dir = TempDir::new().unwrap();
        let yaml_path = temp_dir.path().join("graph.yaml");
        std::fs::write(&yaml_path, YAML).unwrap();
        let from_yaml = GraphDefinition::load(&yaml_path).unwrap();

        let json_path = temp_dir.path().join("graph.json");
        std::fs::write(&json_path, serde_json::to_string(&from_yaml).unwrap()).unwrap();
        let from_json = GraphDefinition::load(&json_path).unwrap();

        assert_eq!(from_yaml, from_json);
    }

    #[test]
    fn test_bundled_definitions_compile() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("graph-definitions");
        let mut count = 0;
        for entry in std::fs::read_dir(&dir).unwrap() {
            let path = entry.unwrap().path();
            let def = GraphDefinition::load(&path).unwrap();
            assert!(
                CompiledGraph::compile(&def).is_ok(),
                "{} does not compile",
                path.display()
            );
            count += 1;
        }
        assert!(count > 0);
    }

    #[test]
    fn test_bundled_matches_definition_directory() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("graph-definitions");
        let mut on_disk: Vec<String> = std::fs::read_dir(&dir)
            .unwrap()
            .map(|e| GraphDefinition::load(&e.unwrap().path()).unwrap().id)
            .collect();
        on_disk.sort();

        let mut ids: Vec<String> = bundled().unwrap().into_iter().map(|d| d.id).collect();
        ids.sort();
        assert_eq!(ids, on_disk);
        assert!(ids.contains(&"research-study-graph".to_string()));
    }

    #[tokio::test]
    async fn test_resolve_prefers_file_then_bundled_then_server() {
        let api = InMemorySearchApi::new();
        api.add_resource(json!({
            "resourceType": "GraphDefinition",
            "id": "research-study-graph",
            "link": []
        }));
        api.add_resource(json!({
            "resourceType": "GraphDefinition",
            "id": "server-only",
            "link": [{"sourceId": "Patient", "targetId": "Specimen", "path": "Patient.id", "params": "subject={path}"}]
        }));

        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("graph.yaml");
        std::fs::write(&file, YAML).unwrap();
        let from_file = resolve(file.to_str().unwrap(), &api).await.unwrap();
        assert_eq!(from_file.id, "patient-specimen-graph");

        // the bundled copy wins over the server's
        let bundled_def = resolve("research-study-graph", &api).await.unwrap();
        assert!(!bundled_def.link.is_empty());

        let from_server = resolve("server-only", &api).await.unwrap();
        assert_eq!(from_server.link.len(), 1);
        assert_eq!(api.issued_queries(), vec!["GraphDefinition/server-only"]);

        assert!(resolve("nowhere", &api).await.is_err());
    }

    #[tokio::test]
    async fn test_fetch_from_server() {
        let api = InMemorySearchApi::new();
        api.add_resource(json!({
            "resourceType": "GraphDefinition",
            "id": "g1",
            "status": "active",
            "link": [{"sourceId": "Patient", "targetId": "Specimen", "path": "Patient.id", "params": "subject={path}"}]
        }));
        let def = fetch(&api, "g1").await.unwrap();
        assert_eq!(def.link.len(), 1);

        let missing = fetch(&api, "nope").await.unwrap_err();
        assert!(matches!(missing, GraphError::Fetch(_)));
    }
}
