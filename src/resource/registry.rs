//! Resource Registry - Build the table of resource declarations
//!
//! Declarations come from Rust builders or from YAML/JSON documents in the
//! configured spec directories. The registry is built once at startup,
//! hooks are bound by name at that point, and the result is shared
//! read-only afterwards.

use super::{BoundHooks, ResourceSpec};
use crate::error::{EngineError, Result};
use crate::hooks::{HookChain, ResourceHooks};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, OnceLock};

static REGISTRY: OnceLock<Arc<Registry>> = OnceLock::new();

/// Install the process-wide registry (only the first call succeeds)
pub fn init_registry(registry: Registry) -> Result<Arc<Registry>> {
    let registry = Arc::new(registry);
    REGISTRY
        .set(registry.clone())
        .map_err(|_| EngineError::Registry("registry already initialized".to_string()))?;
    Ok(registry)
}

/// Get the process-wide registry, if initialized
pub fn get_registry() -> Option<Arc<Registry>> {
    REGISTRY.get().cloned()
}

/// Format of a declaration document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Yaml,
    Json,
}

impl Format {
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "yaml" | "yml" => Some(Self::Yaml),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Immutable table of resource declarations indexed by name
#[derive(Debug, Default)]
pub struct Registry {
    resources: BTreeMap<String, ResourceSpec>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn get(&self, name: &str) -> Result<&ResourceSpec> {
        self.resources
            .get(name)
            .ok_or_else(|| EngineError::UnknownResource(name.to_string()))
    }

    /// All resource names, sorted
    pub fn names(&self) -> Vec<&str> {
        self.resources.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

/// Collects declarations and named hook implementations
#[derive(Default)]
pub struct RegistryBuilder {
    specs: Vec<ResourceSpec>,
    named: HashMap<String, Arc<dyn ResourceHooks>>,
}

impl RegistryBuilder {
    /// Register a hook implementation that declarations can refer to by name
    pub fn hook(mut self, name: &str, hooks: Arc<dyn ResourceHooks>) -> Self {
        self.named.insert(name.to_string(), hooks);
        self
    }

    pub fn resource(mut self, spec: ResourceSpec) -> Self {
        self.specs.push(spec);
        self
    }

    /// Parse one document holding a declaration or a list of declarations
    pub fn load_str(mut self, content: &str, format: Format) -> Result<Self> {
        let specs: Vec<ResourceSpec> = match format {
            Format::Json => {
                let doc: serde_json::Value = serde_json::from_str(content)?;
                if doc.is_array() {
                    serde_json::from_value(doc)?
                } else {
                    vec![serde_json::from_value(doc)?]
                }
            }
            Format::Yaml => {
                let doc: serde_yaml::Value = serde_yaml::from_str(content)
                    .map_err(|e| EngineError::Registry(e.to_string()))?;
                let parsed = if doc.is_sequence() {
                    serde_yaml::from_value(doc)
                } else {
                    serde_yaml::from_value(doc).map(|spec| vec![spec])
                };
                parsed.map_err(|e| EngineError::Registry(e.to_string()))?
            }
        };
        self.specs.extend(specs);
        Ok(self)
    }

    pub fn load_file(self, path: &Path) -> Result<Self> {
        let Some(format) = Format::from_path(path) else {
            return Err(EngineError::Registry(format!(
                "{}: unsupported declaration format",
                path.display()
            )));
        };
        let content = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Registry(format!("{}: {}", path.display(), e)))?;
        tracing::debug!("Loading resource declarations from {}", path.display());
        self.load_str(&content, format).map_err(|e| match e {
            EngineError::Registry(msg) => EngineError::Registry(format!("{}: {}", path.display(), msg)),
            EngineError::Json(err) => EngineError::Registry(format!("{}: {}", path.display(), err)),
            other => other,
        })
    }

    /// Load every `*.yaml`, `*.yml` and `*.json` file of a directory
    pub fn load_dir(mut self, dir: &Path) -> Result<Self> {
        let entries = std::fs::read_dir(dir)
            .map_err(|e| EngineError::Registry(format!("{}: {}", dir.display(), e)))?;
        let mut paths: Vec<_> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && Format::from_path(p).is_some())
            .collect();
        paths.sort();
        for path in paths {
            self = self.load_file(&path)?;
        }
        Ok(self)
    }

    /// Bind hooks, check every declaration and freeze the table
    pub fn build(self) -> Result<Registry> {
        let mut resources = BTreeMap::new();
        for mut spec in self.specs {
            let mut hooks: Vec<Arc<dyn ResourceHooks>> = Vec::new();
            if let Some(BoundHooks(direct)) = spec.bound.take() {
                hooks.push(direct);
            }
            for decl in &spec.hooks {
                hooks.push(decl.bind(&self.named)?);
            }
            spec.bound = match hooks.len() {
                0 => None,
                1 => hooks.pop().map(BoundHooks),
                _ => Some(BoundHooks(Arc::new(HookChain::new(hooks)))),
            };

            spec.check()?;
            if resources.contains_key(&spec.name) {
                return Err(EngineError::Registry(format!(
                    "resource '{}' declared twice",
                    spec.name
                )));
            }
            resources.insert(spec.name.clone(), spec);
        }
        tracing::debug!("Registry built with {} resources", resources.len());
        Ok(Registry { resources })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Attribute;

    const DOC: &str = r#"
- name: script
  base_uri: /deviceManagement/deviceManagementScripts
  attributes:
    - name: id
      type: string
      mode: read_only
    - name: display_name
      type: string
- name: enrollment
  base_uri: /deviceManagement/deviceEnrollmentConfigurations
  attributes:
    - name: id
      type: string
    - name: display_name
      type: string
    - name: priority
      type: int
  hooks:
    - kind: default_entity
      name_attribute: display_name
      sentinel: Default
      default_id_pattern: "_Default"
"#;

    #[test]
    fn test_load_yaml_list() {
        let registry = Registry::builder()
            .load_str(DOC, Format::Yaml)
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(registry.names(), vec!["enrollment", "script"]);
        assert!(registry.get("script").unwrap().hooks().is_none());
        assert_eq!(
            registry.get("enrollment").unwrap().hooks().unwrap().name(),
            "default_entity"
        );
        assert!(matches!(
            registry.get("nope"),
            Err(EngineError::UnknownResource(_))
        ));
    }

    #[test]
    fn test_load_single_json() {
        let json = r#"{"name": "tag", "base_uri": "/roleScopeTags",
            "attributes": [{"name": "id", "type": "string"}]}"#;
        let registry = Registry::builder().load_str(json, Format::Json).unwrap().build().unwrap();
        assert_eq!(registry.get("tag").unwrap().id_attribute, "id");
    }

    #[test]
    fn test_duplicate_resource_rejected() {
        let spec = ResourceSpec::new("x", "/x").attribute(Attribute::string("id"));
        let err = Registry::builder()
            .resource(spec.clone())
            .resource(spec)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("declared twice"));
    }

    #[test]
    fn test_missing_id_attribute_rejected() {
        let err = Registry::builder()
            .resource(ResourceSpec::new("x", "/x"))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("id attribute"));
    }

    #[test]
    fn test_load_dir() {
        let dir = std::env::temp_dir().join(format!("graphrecon-registry-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("a.yaml"), DOC).unwrap();
        std::fs::write(dir.join("notes.txt"), "ignored").unwrap();
        let registry = Registry::builder().load_dir(&dir).unwrap().build().unwrap();
        assert_eq!(registry.len(), 2);
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
