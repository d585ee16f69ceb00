//! Reference graph parsing and edge maintenance. Manifest content
//! parsing is limited to the fields needed for references, labels, and
//! layer history timestamps, per the stated non-goal on full image
//! manifest content parsing.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
    #[serde(default)]
    pub variant: Option<String>,
}

impl Platform {
    pub fn matches_filter(&self, filter: &[Platform]) -> bool {
        filter.is_empty() || filter.iter().any(|p| p == self)
    }
}

#[derive(Debug, Clone)]
pub struct BlobReference {
    pub digest: String,
    pub size: i64,
    pub media_type: String,
}

#[derive(Debug, Clone)]
pub struct ManifestReference {
    pub digest: String,
    pub size: i64,
    pub media_type: String,
    pub platform: Option<Platform>,
}

#[derive(Debug, Clone)]
pub struct ParsedManifest {
    pub media_type: String,
    pub self_size: i64,
    pub is_list: bool,
    pub blob_refs: Vec<BlobReference>,
    pub manifest_refs: Vec<ManifestReference>,
    pub own_labels: Option<Value>,
}

const OCI_MANIFEST_LIST_MEDIA_TYPES: &[&str] =
    &["application/vnd.docker.distribution.manifest.list.v2+json", "application/vnd.oci.image.index.v1+json"];

/// Parses raw manifest bytes into the blob/manifest reference lists the
/// ingestion processor needs. Detects list-vs-single-image shape from the
/// JSON structure, falling back to declared `mediaType` when present.
pub fn parse_manifest(contents: &[u8]) -> Result<ParsedManifest, String> {
    let value: Value = serde_json::from_slice(contents).map_err(|e| format!("invalid JSON: {e}"))?;
    let self_size = contents.len() as i64;

    let declared_media_type = value.get("mediaType").and_then(|v| v.as_str()).map(|s| s.to_string());

    if let Some(manifests) = value.get("manifests").and_then(|v| v.as_array()) {
        let mut manifest_refs = Vec::with_capacity(manifests.len());
        for entry in manifests {
            let digest = entry
                .get("digest")
                .and_then(|v| v.as_str())
                .ok_or("manifest list entry missing digest")?
                .to_string();
            let size = entry.get("size").and_then(|v| v.as_i64()).unwrap_or(0);
            let media_type = entry.get("mediaType").and_then(|v| v.as_str()).unwrap_or("").to_string();
            let platform = entry
                .get("platform")
                .map(|p| serde_json::from_value::<Platform>(p.clone()))
                .transpose()
                .map_err(|e| format!("invalid platform descriptor: {e}"))?;
            manifest_refs.push(ManifestReference { digest, size, media_type, platform });
        }

        let media_type = declared_media_type.unwrap_or_else(|| OCI_MANIFEST_LIST_MEDIA_TYPES[1].to_string());
        return Ok(ParsedManifest {
            media_type,
            self_size,
            is_list: true,
            blob_refs: Vec::new(),
            manifest_refs,
            own_labels: None,
        });
    }

    // Single-image manifest: a config descriptor plus a list of layers.
    let mut blob_refs = Vec::new();
    if let Some(config) = value.get("config") {
        blob_refs.push(descriptor_to_blob_ref(config)?);
    }
    for layer in value.get("layers").and_then(|v| v.as_array()).into_iter().flatten() {
        blob_refs.push(descriptor_to_blob_ref(layer)?);
    }

    let media_type =
        declared_media_type.unwrap_or_else(|| "application/vnd.oci.image.manifest.v1+json".to_string());

    Ok(ParsedManifest { media_type, self_size, is_list: false, blob_refs, manifest_refs: Vec::new(), own_labels: None })
}

fn descriptor_to_blob_ref(descriptor: &Value) -> Result<BlobReference, String> {
    let digest = descriptor.get("digest").and_then(|v| v.as_str()).ok_or("descriptor missing digest")?.to_string();
    let size = descriptor.get("size").and_then(|v| v.as_i64()).unwrap_or(0);
    let media_type = descriptor.get("mediaType").and_then(|v| v.as_str()).unwrap_or("").to_string();
    Ok(BlobReference { digest, size, media_type })
}

/// `size_bytes = self + Σ(blob_ref.size) + Σ(child.size_bytes)`.
pub fn compute_total_size(self_size: i64, blob_refs: &[BlobReference], child_sizes: &[i64]) -> i64 {
    self_size + blob_refs.iter().map(|b| b.size).sum::<i64>() + child_sizes.iter().sum::<i64>()
}

/// Labels for a single-image manifest come from the image-config blob
/// directly; for a list, retain only keys every child has with an
/// identical value (keyed intersection).
pub fn intersect_child_labels(children: &[Option<Value>]) -> Option<Value> {
    let mut children_labels = Vec::new();
    for child in children {
        let labels = child.as_ref()?.as_object()?.clone();
        children_labels.push(labels);
    }
    let first = children_labels.first()?;
    let mut keys: HashSet<String> = first.keys().cloned().collect();
    for labels in &children_labels[1..] {
        keys.retain(|k| labels.get(k).is_some());
    }

    let mut result = serde_json::Map::new();
    for key in keys {
        let value = &first[&key];
        if children_labels.iter().all(|labels| labels.get(&key) == Some(value)) {
            result.insert(key, value.clone());
        }
    }
    Some(Value::Object(result))
}

/// `(min_layer_created_at, max_layer_created_at)`, excluding any layer
/// timestamped at Unix epoch 0.
pub fn layer_timestamp_range(timestamps: &[i64]) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
    let filtered: Vec<i64> = timestamps.iter().copied().filter(|&t| t != 0).collect();
    if filtered.is_empty() {
        return (None, None);
    }
    let min = *filtered.iter().min().unwrap();
    let max = *filtered.iter().max().unwrap();
    (Utc.timestamp_opt(min, 0).single(), Utc.timestamp_opt(max, 0).single())
}

/// Idempotent edge-set maintenance: compute `(to_insert, to_delete)` so
/// that applying them to `existing` yields exactly `target`, no matter
/// what shape `existing` started in.
pub fn diff_edges<T: Eq + std::hash::Hash + Clone>(existing: &[T], target: &[T]) -> (Vec<T>, Vec<T>) {
    let existing_set: HashSet<&T> = existing.iter().collect();
    let target_set: HashSet<&T> = target.iter().collect();

    let to_insert = target.iter().filter(|e| !existing_set.contains(e)).cloned().collect();
    let to_delete = existing.iter().filter(|e| !target_set.contains(e)).cloned().collect();
    (to_insert, to_delete)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_image_manifest_blob_refs() {
        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "config": {"mediaType": "application/vnd.oci.image.config.v1+json", "digest": "sha256:cfg", "size": 10},
            "layers": [{"mediaType": "application/vnd.oci.image.layer.v1.tar", "digest": "sha256:layer1", "size": 20}],
        });
        let bytes = serde_json::to_vec(&manifest).unwrap();
        let parsed = parse_manifest(&bytes).unwrap();
        assert!(!parsed.is_list);
        assert_eq!(parsed.blob_refs.len(), 2);
        assert_eq!(parsed.blob_refs[0].digest, "sha256:cfg");
    }

    #[test]
    fn parses_manifest_list_with_platforms() {
        let list = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.index.v1+json",
            "manifests": [
                {"mediaType": "application/vnd.oci.image.manifest.v1+json", "digest": "sha256:amd64", "size": 100,
                 "platform": {"os": "linux", "architecture": "amd64"}},
                {"mediaType": "application/vnd.oci.image.manifest.v1+json", "digest": "sha256:arm64", "size": 100,
                 "platform": {"os": "linux", "architecture": "arm64"}},
            ],
        });
        let bytes = serde_json::to_vec(&list).unwrap();
        let parsed = parse_manifest(&bytes).unwrap();
        assert!(parsed.is_list);
        assert_eq!(parsed.manifest_refs.len(), 2);
    }

    #[test]
    fn platform_filter_empty_allows_everything() {
        let p = Platform { os: "linux".into(), architecture: "amd64".into(), variant: None };
        assert!(p.matches_filter(&[]));
    }

    #[test]
    fn platform_filter_restricts_to_listed_triples() {
        let p = Platform { os: "linux".into(), architecture: "arm64".into(), variant: None };
        let filter = vec![Platform { os: "linux".into(), architecture: "amd64".into(), variant: None }];
        assert!(!p.matches_filter(&filter));
    }

    #[test]
    fn total_size_sums_self_blobs_and_children() {
        let blob_refs = vec![BlobReference { digest: "d1".into(), size: 10, media_type: "x".into() }];
        let total = compute_total_size(5, &blob_refs, &[20, 30]);
        assert_eq!(total, 65);
    }

    #[test]
    fn label_intersection_keeps_only_identical_shared_keys() {
        let a = Some(serde_json::json!({"org.example.a": "1", "org.example.b": "2"}));
        let b = Some(serde_json::json!({"org.example.a": "1", "org.example.b": "3"}));
        let merged = intersect_child_labels(&[a, b]).unwrap();
        assert_eq!(merged, serde_json::json!({"org.example.a": "1"}));
    }

    #[test]
    fn layer_timestamps_exclude_epoch_zero() {
        let (min, max) = layer_timestamp_range(&[0, 100, 200, 0]);
        assert_eq!(min.unwrap().timestamp(), 100);
        assert_eq!(max.unwrap().timestamp(), 200);
    }

    #[test]
    fn layer_timestamps_all_zero_yields_none() {
        let (min, max) = layer_timestamp_range(&[0, 0]);
        assert!(min.is_none());
        assert!(max.is_none());
    }

    #[test]
    fn diff_edges_computes_insert_and_delete_sets() {
        let existing = vec!["a", "b", "c"];
        let target = vec!["b", "c", "d"];
        let (insert, delete) = diff_edges(&existing, &target);
        assert_eq!(insert, vec!["d"]);
        assert_eq!(delete, vec!["a"]);
    }

    #[test]
    fn diff_edges_is_idempotent_when_already_in_target_shape() {
        let existing = vec!["a", "b"];
        let target = vec!["a", "b"];
        let (insert, delete) = diff_edges(&existing, &target);
        assert!(insert.is_empty());
        assert!(delete.is_empty());
    }
}
