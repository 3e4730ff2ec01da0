use log::error;
use serde_json::{Map, Value as JsonValue};

use crate::model::Task;
use crate::scheduler::provider::TaskProvider;

/// Collect the flattened upstream context for `task`.
///
/// Dependency entries are visited in declaration order; for each name the
/// latest resolved instance by creation time wins (id tuple breaks ties),
/// and its context keys are flattened to `"{name}.{key}"`. The returned
/// order is the documented iteration order for wildcard substitution:
/// upstream blocks in declaration order, keys sorted within a block.
pub(crate) fn collect_upstream_context(
    provider: &TaskProvider,
    task: &Task,
) -> Vec<(String, JsonValue)> {
    let mut flat: Vec<(String, JsonValue)> = Vec::new();

    for dep in &task.depends_on {
        let latest = provider
            .upstream_tasks(&task.id)
            .iter()
            .filter(|id| id.name == dep.name)
            .filter_map(|id| provider.get_task(id))
            .max_by(|a, b| {
                a.created_at
                    .cmp(&b.created_at)
                    .then_with(|| a.id.cmp(&b.id))
            });
        let Some(upstream) = latest else { continue };

        for (key, value) in &upstream.context {
            let flat_key = format!("{}.{}", upstream.id.name, key);
            if let Some(existing) = flat.iter_mut().find(|(k, _)| *k == flat_key) {
                existing.1 = value.clone();
            } else {
                flat.push((flat_key, value.clone()));
            }
        }
    }

    flat
}

/// Rewrite `properties`, substituting `${name.key}` and `${*.key}`
/// placeholders from the flattened upstream context.
///
/// A `${*.key}` wildcard matches any upstream; with several matches the last
/// one in flat-map order wins. A placeholder with no match becomes JSON null
/// (the key is retained) and is reported at error level. After substitution
/// every `name.key` entry is injected under its bare `key` unless a property
/// with that name already survived.
pub(crate) fn interpolate_properties(
    properties: &Map<String, JsonValue>,
    flat: &[(String, JsonValue)],
) -> Map<String, JsonValue> {
    let mut interpolated = Map::new();

    for (key, value) in properties {
        match placeholder(value) {
            Some(reference) => {
                if let Some(resolved) = lookup(flat, reference) {
                    interpolated.insert(key.clone(), resolved);
                } else {
                    error!(
                        "No upstream context value found for '{reference}', \
                         setting property '{key}' to null"
                    );
                    interpolated.insert(key.clone(), JsonValue::Null);
                }
            }
            None => {
                interpolated.insert(key.clone(), value.clone());
            }
        }
    }

    for (flat_key, value) in flat {
        let bare = bare_key(flat_key);
        if !interpolated.contains_key(bare) {
            interpolated.insert(bare.to_string(), value.clone());
        }
    }

    interpolated
}

/// The `X` of a `"${X}"` property value, if the value has that shape.
fn placeholder(value: &JsonValue) -> Option<&str> {
    let text = value.as_str()?;
    let inner = text.strip_prefix("${")?.strip_suffix('}')?;
    (!inner.is_empty()).then_some(inner)
}

fn lookup(flat: &[(String, JsonValue)], reference: &str) -> Option<JsonValue> {
    if let Some((_, value)) = flat.iter().rev().find(|(key, _)| key == reference) {
        return Some(value.clone());
    }
    if let Some(wanted) = reference.strip_prefix("*.") {
        if !wanted.is_empty() {
            // last match by flat-map iteration order wins
            return flat
                .iter()
                .rev()
                .find(|(key, _)| bare_key(key) == wanted)
                .map(|(_, value)| value.clone());
        }
    }
    None
}

fn bare_key(flat_key: &str) -> &str {
    match flat_key.split_once('.') {
        Some((_, rest)) => rest,
        None => flat_key,
    }
}
