//! `dataTo` expansion, spec.md §4.E.1. Each `DataToEntry` turns the source
//! secret's keys into a set of remote `DataEntry` values through conversion,
//! regex matching, and a chain of rewrites, scoped to the stores its own
//! `storeRef` resolves to.

use std::collections::{BTreeMap, HashSet};

use regex::Regex;

use crate::api::v1alpha1::push_secret::{DataEntry, DataToEntry, Rewrite};
use crate::client_manager::{resolve_store_ref, ActiveStore};
use crate::conversion::apply_key_conversion;
use crate::util::errors::{Error, StdError};

/// A `DataEntry` produced either directly by `spec.data` (`target_stores:
/// None`, applies to every active store) or expanded from a `dataTo` entry
/// (`target_stores: Some(identities)`, applies only to stores whose
/// `ActiveStore::identity()` is in the set).
#[derive(Clone, Debug)]
pub struct ExpandedEntry {
    pub entry: DataEntry,
    pub target_stores: Option<HashSet<String>>,
}

impl ExpandedEntry {
    pub fn applies_to(&self, store: &ActiveStore) -> bool {
        match &self.target_stores {
            None => true,
            Some(identities) => identities.contains(&store.identity()),
        }
    }
}

/// Expands every `dataTo` entry against `source_data`, then merges in the
/// explicit `data` entries (which override a `dataTo`-derived entry sharing
/// the same `sourceKey`), and validates `(remoteKey, property)` uniqueness
/// across the merged set (spec.md §4.E steps 9-10).
pub async fn expand_and_merge(
    kube_client: &kube::Client,
    namespace: &str,
    source_data: &BTreeMap<String, Vec<u8>>,
    explicit: &[DataEntry],
    data_to: &[DataToEntry],
) -> Result<Vec<ExpandedEntry>, Error> {
    let mut from_data_to = Vec::new();
    let mut seen_remote_keys: HashSet<String> = HashSet::new();

    for entry in data_to {
        let targets = resolve_store_ref(kube_client, &entry.store_ref, namespace)
            .await?
            .iter()
            .map(ActiveStore::identity)
            .collect::<HashSet<_>>();

        for data_entry in expand_one(source_data, entry)? {
            if data_entry.remote_key.is_empty() {
                return Err(Error::StdError(StdError::InvalidArgument(
                    "dataTo rewrite produced an empty remote key".to_string(),
                )));
            }
            if !seen_remote_keys.insert(data_entry.remote_key.clone()) {
                return Err(Error::StdError(StdError::DuplicateRemoteKey(format!(
                    "duplicate remote key {:?} across dataTo entries",
                    data_entry.remote_key
                ))));
            }
            from_data_to.push(ExpandedEntry { entry: data_entry, target_stores: Some(targets.clone()) });
        }
    }

    let mut by_source_key: BTreeMap<String, ExpandedEntry> =
        from_data_to.into_iter().map(|e| (e.entry.source_key.clone(), e)).collect();
    for e in explicit {
        by_source_key.insert(e.source_key.clone(), ExpandedEntry { entry: e.clone(), target_stores: None });
    }

    let merged: Vec<ExpandedEntry> = by_source_key.into_values().collect();

    let mut seen_remote_property: HashSet<(String, String)> = HashSet::new();
    for e in &merged {
        let key = (e.entry.remote_key.clone(), e.entry.property.clone().unwrap_or_default());
        if !seen_remote_property.insert(key) {
            return Err(Error::StdError(StdError::DuplicateRemoteKey(format!(
                "duplicate remote key {:?} (property {:?}) in merged data entries",
                e.entry.remote_key, e.entry.property
            ))));
        }
    }

    Ok(merged)
}

/// Runs one `dataTo` entry's conversion/match/rewrite chain over
/// `source_data`, returning the entries it produces. Remote-key uniqueness
/// across entries is the caller's job (it needs cross-entry state).
fn expand_one(source_data: &BTreeMap<String, Vec<u8>>, entry: &DataToEntry) -> Result<Vec<DataEntry>, Error> {
    let mut converted_to_original: BTreeMap<String, String> = BTreeMap::new();
    for key in source_data.keys() {
        converted_to_original.insert(apply_key_conversion(key, entry.conversion_strategy.as_deref()), key.clone());
    }

    let converted: BTreeMap<String, Vec<u8>> = source_data
        .iter()
        .map(|(k, v)| (apply_key_conversion(k, entry.conversion_strategy.as_deref()), v.clone()))
        .collect();

    let matched: BTreeMap<String, Vec<u8>> = match entry.match_.as_ref().and_then(|m| m.regex.as_deref()) {
        Some(pattern) => {
            let re = Regex::new(pattern)
                .map_err(|e| Error::StdError(StdError::InvalidArgument(format!("invalid dataTo match regex {pattern:?}: {e}"))))?;
            converted.into_iter().filter(|(k, _)| re.is_match(k)).collect()
        }
        None => converted,
    };

    let mut rewritten = matched.clone();
    for rewrite in &entry.rewrites {
        rewritten = apply_rewrite(rewritten, rewrite)?;
    }

    // Recovers the original source key for a rewritten entry by matching on
    // value: rewrites only ever touch keys, so the pre-rewrite `matched` map
    // still has a 1:1 value correspondence with `converted_to_original`.
    let mut value_to_converted_keys: BTreeMap<Vec<u8>, Vec<String>> = BTreeMap::new();
    for (k, v) in &matched {
        value_to_converted_keys.entry(v.clone()).or_default().push(k.clone());
    }

    let mut out = Vec::new();
    for (remote_key, value) in &rewritten {
        let Some(converted_keys) = value_to_converted_keys.get(value) else { continue };
        for converted_key in converted_keys {
            let Some(original_key) = converted_to_original.get(converted_key) else { continue };
            out.push(DataEntry {
                source_key: original_key.clone(),
                remote_key: remote_key.clone(),
                property: None,
                metadata: entry.metadata.clone(),
                conversion_strategy: entry.conversion_strategy.clone(),
            });
        }
    }
    Ok(out)
}

fn apply_rewrite(input: BTreeMap<String, Vec<u8>>, rewrite: &Rewrite) -> Result<BTreeMap<String, Vec<u8>>, Error> {
    match rewrite {
        Rewrite::Regexp(r) => {
            let re = Regex::new(&r.source)
                .map_err(|e| Error::StdError(StdError::InvalidArgument(format!("invalid rewrite regex {:?}: {e}", r.source))))?;
            Ok(input.into_iter().map(|(k, v)| (re.replace_all(&k, r.target.as_str()).into_owned(), v)).collect())
        }
        // `.value` is the only binding this mini-template supports; the
        // full secret-template engine (spec.md §1, external collaborator)
        // is a different surface from this per-key rewrite.
        Rewrite::Transform(t) => Ok(input
            .into_iter()
            .map(|(_, v)| {
                let value_str = String::from_utf8_lossy(&v);
                let new_key = t.template.replace("{{ .value }}", &value_str).replace("{{.value}}", &value_str);
                (new_key, v)
            })
            .collect()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::v1alpha1::push_secret::{MatchSelector, RegexRewrite, StoreKind, StoreRef};

    fn store_ref() -> StoreRef {
        StoreRef { name: Some("vault".to_string()), kind: StoreKind::NamespaceStore, label_selector: None }
    }

    #[test]
    fn regex_match_then_rewrite_produces_expected_keys() {
        let mut source = BTreeMap::new();
        source.insert("database.host".to_string(), b"db.internal".to_vec());
        source.insert("database.port".to_string(), b"5432".to_vec());
        source.insert("unrelated".to_string(), b"x".to_vec());

        let entry = DataToEntry {
            store_ref: store_ref(),
            match_: Some(MatchSelector { regex: Some(r"^database\.".to_string()) }),
            rewrites: vec![Rewrite::Regexp(RegexRewrite { source: r"\.".to_string(), target: "/".to_string() })],
            conversion_strategy: None,
            metadata: None,
        };

        let mut out = expand_one(&source, &entry).unwrap();
        out.sort_by(|a, b| a.remote_key.cmp(&b.remote_key));
        let remote_keys: Vec<&str> = out.iter().map(|e| e.remote_key.as_str()).collect();
        assert_eq!(remote_keys, vec!["database/host", "database/port"]);
    }

    #[test]
    fn empty_rewrite_result_is_rejected_by_caller() {
        let mut source = BTreeMap::new();
        source.insert("k".to_string(), b"v".to_vec());
        let entry = DataToEntry {
            store_ref: store_ref(),
            match_: None,
            rewrites: vec![Rewrite::Regexp(RegexRewrite { source: "k".to_string(), target: "".to_string() })],
            conversion_strategy: None,
            metadata: None,
        };
        let out = expand_one(&source, &entry).unwrap();
        assert_eq!(out[0].remote_key, "");
    }
}
