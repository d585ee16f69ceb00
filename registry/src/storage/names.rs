//! Storage layout name-builders: lossless string
//! round trips between logical identifiers and StorageDriver object names.

/// `_blobs/<id[0:2]>/<id[2:4]>/<id[4:]>`
pub fn blob_object_name(storage_id: &str) -> String {
    let (a, rest) = storage_id.split_at(storage_id.len().min(2));
    let (b, c) = rest.split_at(rest.len().min(2));
    format!("_blobs/{a}/{b}/{c}")
}

pub fn parse_blob_object_name(object_name: &str) -> Option<String> {
    let rest = object_name.strip_prefix("_blobs/")?;
    let mut parts = rest.splitn(3, '/');
    let a = parts.next()?;
    let b = parts.next()?;
    let c = parts.next()?;
    Some(format!("{a}{b}{c}"))
}

/// `_chunks/<id[0:2]>/<id[2:4]>/<id[4:]>/<chunk_number as 10-digit zero-padded>`
pub fn chunk_object_name(storage_id: &str, chunk_number: u64) -> String {
    let (a, rest) = storage_id.split_at(storage_id.len().min(2));
    let (b, c) = rest.split_at(rest.len().min(2));
    format!("_chunks/{a}/{b}/{c}/{chunk_number:010}")
}

pub fn parse_chunk_object_name(object_name: &str) -> Option<(String, u64)> {
    let rest = object_name.strip_prefix("_chunks/")?;
    let mut parts = rest.splitn(4, '/');
    let a = parts.next()?;
    let b = parts.next()?;
    let c = parts.next()?;
    let n = parts.next()?;
    if n.len() != 10 {
        return None;
    }
    let chunk_number: u64 = n.parse().ok()?;
    Some((format!("{a}{b}{c}"), chunk_number))
}

/// `<repo>/_manifests/<digest>`
pub fn manifest_object_name(repo: &str, digest: &str) -> String {
    format!("{repo}/_manifests/{digest}")
}

pub fn parse_manifest_object_name(object_name: &str) -> Option<(String, String)> {
    let (repo, rest) = object_name.rsplit_once("/_manifests/")?;
    Some((repo.to_string(), rest.to_string()))
}

/// `<repo>/_trivyreports/<digest>/<format>`
pub fn scan_report_object_name(repo: &str, digest: &str, format: &str) -> String {
    format!("{repo}/_trivyreports/{digest}/{format}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_object_name_round_trips() {
        let id = "abcdef0123456789";
        let name = blob_object_name(id);
        assert_eq!(name, "_blobs/ab/cd/ef0123456789");
        assert_eq!(parse_blob_object_name(&name).unwrap(), id);
    }

    #[test]
    fn chunk_object_name_round_trips() {
        let id = "abcdef0123456789";
        let name = chunk_object_name(id, 42);
        assert_eq!(name, "_chunks/ab/cd/ef0123456789/0000000042");
        let (parsed_id, parsed_n) = parse_chunk_object_name(&name).unwrap();
        assert_eq!(parsed_id, id);
        assert_eq!(parsed_n, 42);
    }

    #[test]
    fn manifest_object_name_round_trips() {
        let repo = "test1/foo";
        let digest = "sha256:abc";
        let name = manifest_object_name(repo, digest);
        assert_eq!(name, "test1/foo/_manifests/sha256:abc");
        let (r, d) = parse_manifest_object_name(&name).unwrap();
        assert_eq!(r, repo);
        assert_eq!(d, digest);
    }

    #[test]
    fn scan_report_object_name_builds_expected_path() {
        let name = scan_report_object_name("test1/foo", "sha256:abc", "json");
        assert_eq!(name, "test1/foo/_trivyreports/sha256:abc/json");
    }
}
