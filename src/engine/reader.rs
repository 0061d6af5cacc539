//! Read Assembly Engine
//!
//! Builds the primary query for one entity or a collection, fans out the
//! supplemental requests a resource declares, and splices everything into
//! a single wire value. Listings are lazy streams that follow
//! `@odata.nextLink`; a fresh call re-issues the query.

use crate::diagnostics::{Diagnostic, Diagnostics};
use crate::error::{EngineError, Result};
use crate::graph::{join_uri, GraphClient};
use crate::resource::{ResourceSpec, SupplementalRead};
use crate::schema::{camel_case, DISCRIMINANT_FIELD};
use base64::Engine as _;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Upper bound on concurrent supplemental requests for one entity
pub const MAX_SUPPLEMENTAL_CONCURRENCY: usize = 4;

/// One equality condition on a wire field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub value: Value,
}

impl Condition {
    fn to_odata(&self) -> String {
        if self.field == DISCRIMINANT_FIELD {
            if let Value::String(s) = &self.value {
                return format!("isof('{}')", s.trim_start_matches('#').replace('\'', "''"));
            }
        }
        match &self.value {
            Value::String(s) => format!("{} eq '{}'", self.field, s.replace('\'', "''")),
            other => format!("{} eq {}", self.field, other),
        }
    }

    fn matches(&self, item: &Value) -> bool {
        let actual = item.get(&self.field).unwrap_or(&Value::Null);
        match (actual, &self.value) {
            (Value::String(a), Value::String(b)) if self.field == DISCRIMINANT_FIELD => {
                a.trim_start_matches('#') == b.trim_start_matches('#')
            }
            (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
            (a, b) => a == b,
        }
    }
}

/// Conjunction of equality conditions over wire field names
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub conditions: Vec<Condition>,
}

impl Filter {
    pub fn eq(field: &str, value: impl Into<Value>) -> Self {
        Self::default().and(field, value)
    }

    pub fn and(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition {
            field: field.to_string(),
            value: value.into(),
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Render as an OData `$filter` expression
    pub fn to_odata(&self) -> String {
        self.conditions
            .iter()
            .map(Condition::to_odata)
            .collect::<Vec<_>>()
            .join(" and ")
    }

    /// Client-side evaluation against a wire item
    pub fn matches(&self, item: &Value) -> bool {
        self.conditions.iter().all(|c| c.matches(item))
    }

    /// Parse `field=value`; values that parse as JSON keep their type.
    /// Snake_case field names are converted to their wire form.
    pub fn parse_condition(s: &str) -> Result<Condition> {
        let Some((field, raw)) = s.split_once('=') else {
            return Err(EngineError::validation("filter", format!("expected field=value, got '{}'", s)));
        };
        let field = field.trim();
        if field.is_empty() {
            return Err(EngineError::validation("filter", "empty field name"));
        }
        let field = if field.starts_with('@') {
            field.to_string()
        } else {
            camel_case(field)
        };
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        Ok(Condition { field, value })
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_odata())
    }
}

/// One page of a collection response
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub items: Vec<Value>,
    pub next_link: Option<String>,
}

impl Page {
    pub fn from_response(mut response: Value) -> Result<Self> {
        let items = match response.get_mut("value").map(Value::take) {
            Some(Value::Array(items)) => items,
            Some(Value::Null) | None => Vec::new(),
            Some(_) => {
                return Err(EngineError::Transport(
                    "collection response 'value' is not an array".to_string(),
                ))
            }
        };
        let next_link = response
            .get("@odata.nextLink")
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(Self { items, next_link })
    }
}

/// Append OData query parameters to a path
pub fn query_uri(path: &str, params: &[(&str, String)]) -> String {
    if params.is_empty() {
        return path.to_string();
    }
    let query_parts: Vec<String> = params
        .iter()
        .map(|(key, value)| format!("{}={}", key, urlencoding::encode(value)))
        .collect();
    let separator = if path.contains('?') { '&' } else { '?' };
    format!("{}{}{}", path, separator, query_parts.join("&"))
}

/// GET one entity with its expansions and supplemental sub-resources
pub async fn read_one(client: &GraphClient, spec: &ResourceSpec, entity_uri: &str) -> Result<Value> {
    let mut params = Vec::new();
    if !spec.read.expand.is_empty() {
        params.push(("$expand", spec.read.expand.join(",")));
    }
    if !spec.read.select.is_empty() {
        params.push(("$select", spec.read.select.join(",")));
    }

    let mut entity = client.get(&query_uri(entity_uri, &params)).await?;
    if spec.read.supplemental.is_empty() {
        return Ok(entity);
    }

    let Some(map) = entity.as_object_mut() else {
        return Err(EngineError::Transport(format!(
            "{}: expected a JSON object",
            entity_uri
        )));
    };

    let fetched: Vec<(String, Value)> = stream::iter(
        spec.read
            .supplemental
            .iter()
            .map(|read| fetch_supplemental(client, spec, entity_uri, read)),
    )
    .buffered(MAX_SUPPLEMENTAL_CONCURRENCY)
    .try_collect()
    .await?;

    for (key, value) in fetched {
        map.insert(key, value);
    }
    Ok(entity)
}

async fn fetch_supplemental(
    client: &GraphClient,
    spec: &ResourceSpec,
    entity_uri: &str,
    read: &SupplementalRead,
) -> Result<(String, Value)> {
    let attr = spec.find(&read.attribute);
    let key = attr
        .map(|a| a.wire_key().into_owned())
        .unwrap_or_else(|| camel_case(&read.attribute));
    let uri = join_uri(entity_uri, &read.uri_suffix);

    let fetched = if read.binary {
        client.get_bytes(&uri).await.map(|bytes| {
            Value::String(base64::engine::general_purpose::STANDARD.encode(bytes))
        })
    } else {
        let collection = attr.map_or(false, |a| a.kind.element().is_some());
        client.get(&uri).await.map(|mut body| {
            if collection && body.get("value").is_some() {
                body["value"].take()
            } else {
                body
            }
        })
    };

    match fetched {
        Ok(value) => Ok((key, value)),
        Err(e) if read.optional && e.is_not_found() => {
            tracing::debug!("Optional supplemental {} not found", uri);
            Ok((key, Value::Null))
        }
        Err(e) => Err(e),
    }
}

/// Lazily list a collection as raw wire items.
///
/// Server-side `$filter`/`$top` are only sent when the resource declares
/// support; otherwise the full listing is filtered client-side.
pub fn list_raw<'a>(
    client: &'a GraphClient,
    spec: &'a ResourceSpec,
    collection_uri: &str,
    filter: Option<Filter>,
) -> BoxStream<'a, Result<Value>> {
    let support = spec.read.filter;
    let filter = filter.filter(|f| !f.is_empty());

    let mut params = Vec::new();
    if !spec.read.expand.is_empty() {
        params.push(("$expand", spec.read.expand.join(",")));
    }
    if let (true, Some(filter)) = (support.server_side, &filter) {
        params.push(("$filter", filter.to_odata()));
    }
    if let (true, Some(size)) = (support.paging, support.page_size) {
        params.push(("$top", size.to_string()));
    }

    let first = Some(query_uri(collection_uri, &params));
    let pages = stream::try_unfold(first, move |next| async move {
        let Some(url) = next else {
            return Ok::<_, EngineError>(None);
        };
        let page = Page::from_response(client.get(&url).await?)?;
        tracing::debug!("Fetched page of {} items", page.items.len());
        Ok(Some((page.items, page.next_link)))
    });

    let items = pages
        .map_ok(|items| stream::iter(items.into_iter().map(Ok)))
        .try_flatten();

    match filter {
        Some(filter) if !support.server_side => items
            .try_filter(move |item| futures::future::ready(filter.matches(item)))
            .boxed(),
        _ => items.boxed(),
    }
}

/// One entry of a mapped listing
#[derive(Debug, Clone)]
pub enum ListingEntry {
    Item { value: Value, diagnostics: Diagnostics },
    /// The item could not be mapped and was left out
    Skipped(Diagnostic),
}

/// Drain a listing, keeping mapped items and gathering every warning
pub async fn collect_listing(
    mut listing: BoxStream<'_, Result<ListingEntry>>,
) -> Result<(Vec<Value>, Diagnostics)> {
    let mut items = Vec::new();
    let mut diags = Diagnostics::new();
    while let Some(entry) = listing.try_next().await? {
        match entry {
            ListingEntry::Item { value, diagnostics } => {
                items.push(value);
                diags.extend(diagnostics);
            }
            ListingEntry::Skipped(diag) => diags.add(diag),
        }
    }
    Ok((items, diags))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filter_to_odata() {
        let filter = Filter::eq(DISCRIMINANT_FIELD, "#microsoft.graph.windowsConfig")
            .and("priority", 0)
            .and("displayName", "O'Brien");
        assert_eq!(
            filter.to_odata(),
            "isof('microsoft.graph.windowsConfig') and priority eq 0 and displayName eq 'O''Brien'"
        );
    }

    #[test]
    fn test_filter_matches_client_side() {
        let filter = Filter::eq(DISCRIMINANT_FIELD, "microsoft.graph.windowsConfig").and("priority", 0);
        assert!(filter.matches(&json!({"@odata.type": "#microsoft.graph.windowsConfig", "priority": 0})));
        assert!(!filter.matches(&json!({"@odata.type": "#microsoft.graph.windowsConfig", "priority": 1})));
        assert!(!filter.matches(&json!({"priority": 0})));
        assert!(Filter::default().matches(&json!({})));
    }

    #[test]
    fn test_parse_condition() {
        let c = Filter::parse_condition("display_name=Default").unwrap();
        assert_eq!(c.field, "displayName");
        assert_eq!(c.value, json!("Default"));
        let c = Filter::parse_condition("priority=0").unwrap();
        assert_eq!(c.value, json!(0));
        let c = Filter::parse_condition("@odata.type=#x").unwrap();
        assert_eq!(c.field, "@odata.type");
        assert!(Filter::parse_condition("nothing").is_err());
    }

    #[test]
    fn test_page_from_response() {
        let page = Page::from_response(json!({
            "value": [{"id": "1"}, {"id": "2"}],
            "@odata.nextLink": "https://example.com/next"
        }))
        .unwrap();
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.next_link.as_deref(), Some("https://example.com/next"));

        let page = Page::from_response(json!({})).unwrap();
        assert!(page.items.is_empty() && page.next_link.is_none());
        assert!(Page::from_response(json!({"value": 3})).is_err());
    }

    #[test]
    fn test_query_uri() {
        let uri = query_uri(
            "/deviceManagement/scripts",
            &[("$expand", "assignments".to_string()), ("$filter", "priority eq 0".to_string())],
        );
        assert_eq!(
            uri,
            "/deviceManagement/scripts?$expand=assignments&$filter=priority%20eq%200"
        );
        assert_eq!(query_uri("/x?a=1", &[("$top", "5".into())]), "/x?a=1&$top=5");
        assert_eq!(query_uri("/x", &[]), "/x");
    }
}
