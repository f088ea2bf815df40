//! Decoding multi-document manifest files

use kube::api::DynamicObject;
use kube::core::GroupVersionKind;

use crate::kube_utils::parse_api_version;
use crate::{Error, Result};

/// One decoded manifest document
#[derive(Clone, Debug)]
pub struct ResourceDocument {
    /// Group/version/kind from `apiVersion` and `kind`
    pub gvk: GroupVersionKind,
    /// `metadata.name`
    pub name: String,
    /// `metadata.namespace`, if set
    pub namespace: Option<String>,
    /// Full body
    pub object: DynamicObject,
}

impl ResourceDocument {
    /// Build from a decoded JSON body
    pub fn from_value(source: &str, value: serde_json::Value) -> Result<Self> {
        let field = |name: &str| {
            value
                .get(name)
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        let api_version =
            field("apiVersion").ok_or_else(|| Error::manifest(source, "document has no apiVersion"))?;
        let kind = field("kind").ok_or_else(|| Error::manifest(source, "document has no kind"))?;

        let object: DynamicObject = serde_json::from_value(value).map_err(|e| {
            Error::manifest(source, format!("{} is not a valid object: {}", kind, e))
        })?;
        let name = object
            .metadata
            .name
            .clone()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| Error::manifest(source, format!("{} has no metadata.name", kind)))?;
        let namespace = object
            .metadata
            .namespace
            .clone()
            .filter(|ns| !ns.is_empty());

        let (group, version) = parse_api_version(&api_version);
        Ok(Self {
            gvk: GroupVersionKind::gvk(&group, &version, &kind),
            name,
            namespace,
            object,
        })
    }
}

/// Lazily decode every non-empty document in `content`.
///
/// `source` names the file in errors. Documents are split at `---` markers
/// and each is decoded only when the iterator reaches it, so a broken
/// document late in a file does not stop the earlier ones from being
/// processed.
pub fn documents<'a>(source: &'a str, content: &'a str) -> DocumentStream<'a> {
    DocumentStream {
        source,
        rest: Some(content),
    }
}

/// Iterator returned by [`documents`]
#[derive(Clone, Debug)]
pub struct DocumentStream<'a> {
    source: &'a str,
    rest: Option<&'a str>,
}

impl<'a> DocumentStream<'a> {
    /// Cut the next raw document off the remaining text
    fn next_chunk(&mut self) -> Option<&'a str> {
        let rest = self.rest?;
        let mut offset = 0;
        for line in rest.split_inclusive('\n') {
            let end = offset + line.len();
            if is_separator(line) {
                self.rest = Some(&rest[end..]);
                return Some(&rest[..offset]);
            }
            offset = end;
        }
        self.rest = None;
        Some(rest)
    }
}

fn is_separator(line: &str) -> bool {
    let line = line.trim_end();
    line == "---" || line == "..." || line.starts_with("--- #")
}

impl Iterator for DocumentStream<'_> {
    type Item = Result<ResourceDocument>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let chunk = self.next_chunk()?;
            match serde_yaml::from_str::<serde_json::Value>(chunk) {
                Ok(serde_json::Value::Null) => continue,
                Ok(value) => return Some(ResourceDocument::from_value(self.source, value)),
                Err(e) => {
                    return Some(Err(Error::manifest(
                        self.source,
                        format!("invalid YAML: {}", e),
                    )))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MULTI: &str = r#"
apiVersion: v1
kind: Namespace
metadata:
  name: apps
---
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
  namespace: apps
spec:
  replicas: 2
---
# trailing comment only
"#;

    #[test]
    fn decodes_documents_and_skips_empty_ones() {
        let docs: Vec<_> = documents("multi.yaml", MULTI)
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(docs.len(), 2);

        assert_eq!(docs[0].gvk.group, "");
        assert_eq!(docs[0].gvk.kind, "Namespace");
        assert_eq!(docs[0].namespace, None);

        assert_eq!(docs[1].gvk.group, "apps");
        assert_eq!(docs[1].gvk.version, "v1");
        assert_eq!(docs[1].name, "web");
        assert_eq!(docs[1].namespace.as_deref(), Some("apps"));
        assert_eq!(docs[1].object.data["spec"]["replicas"], 2);
    }

    #[test]
    fn missing_name_is_a_manifest_error() {
        let mut docs = documents("bad.yaml", "apiVersion: v1\nkind: ConfigMap\nmetadata: {}\n");
        match docs.next() {
            Some(Err(Error::Manifest { path, message })) => {
                assert_eq!(path, "bad.yaml");
                assert!(message.contains("metadata.name"));
            }
            other => panic!("expected manifest error, got {:?}", other),
        }
    }

    #[test]
    fn missing_kind_is_a_manifest_error() {
        let mut docs = documents("bad.yaml", "apiVersion: v1\nmetadata:\n  name: x\n");
        assert!(matches!(docs.next(), Some(Err(Error::Manifest { .. }))));
    }

    #[test]
    fn decoding_is_lazy() {
        let content = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: ok\n---\nkind: [\n";
        let mut docs = documents("partial.yaml", content);
        let first = docs.next().unwrap().unwrap();
        assert_eq!(first.name, "ok");
        assert!(docs.next().unwrap().is_err());
    }
}
