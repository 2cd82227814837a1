//! Partition transfer wire format.
//!
//! A transfer is a sequence of frames in partition-scan order (sites, then
//! buckets, then keys, all sorted), closed by a `done` frame carrying the
//! row count. Each frame is `u32 BE length | JSON body`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tidepool_core::{Partition, SitePool};
use tidepool_model::{error, DbError, SiblingSet};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransferFrame {
    Row {
        site_id: String,
        bucket: String,
        key: String,
        siblings: SiblingSet,
    },
    Done {
        rows: u64,
    },
}

pub fn encode_frames(frames: &[TransferFrame]) -> Result<Vec<u8>, DbError> {
    let mut out = Vec::new();
    for frame in frames {
        let body = serde_json::to_vec(frame).map_err(|_| error::E_STORAGE)?;
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(&body);
    }
    Ok(out)
}

/// Decode a framed stream, verifying the closing `done` count.
pub fn decode_frames(mut raw: &[u8]) -> Result<Vec<TransferFrame>, DbError> {
    let mut frames = Vec::new();
    while !raw.is_empty() {
        if raw.len() < 4 {
            return Err(error::E_CORRUPTED);
        }
        let len = u32::from_be_bytes(raw[..4].try_into().map_err(|_| error::E_CORRUPTED)?) as usize;
        raw = &raw[4..];
        if raw.len() < len {
            return Err(error::E_CORRUPTED);
        }
        let frame: TransferFrame =
            serde_json::from_slice(&raw[..len]).map_err(|_| error::E_CORRUPTED)?;
        raw = &raw[len..];
        frames.push(frame);
    }

    match frames.last() {
        Some(TransferFrame::Done { rows }) => {
            if *rows != (frames.len() as u64 - 1) {
                return Err(error::E_CORRUPTED);
            }
        }
        _ => return Err(error::E_CORRUPTED),
    }
    Ok(frames)
}

/// Scan a partition into frames. The caller locks writes first so the scan
/// is a consistent snapshot.
pub fn snapshot_partition(partition: &Partition) -> Result<Vec<TransferFrame>, DbError> {
    let mut frames = Vec::new();
    let sites = partition.sites();

    for site_id in sites.site_ids() {
        let site = match sites.acquire(&site_id) {
            Some(site) => site,
            None => continue,
        };
        for bucket_name in site.bucket_names() {
            let bucket = match site.bucket(&bucket_name) {
                Some(bucket) => bucket,
                None => continue,
            };
            // The root merkle node covers every stored row
            let mut rows = bucket.get_sync_children(1)?;
            rows.sort_by(|a, b| a.key.cmp(&b.key));
            for row in rows {
                frames.push(TransferFrame::Row {
                    site_id: site_id.clone(),
                    bucket: bucket_name.clone(),
                    key: row.key,
                    siblings: row.siblings,
                });
            }
        }
        sites.release(&site_id);
    }

    frames.push(TransferFrame::Done { rows: frames.len() as u64 });
    Ok(frames)
}

/// Merge a transfer stream into a local partition, creating sites on
/// demand.
pub fn apply_frames(partition: &Partition, frames: &[TransferFrame]) -> Result<u64, DbError> {
    // Group rows per (site, bucket) so each bucket takes one merge batch
    let mut grouped: HashMap<(String, String), HashMap<String, SiblingSet>> = HashMap::new();
    let mut rows = 0u64;

    for frame in frames {
        match frame {
            TransferFrame::Row { site_id, bucket, key, siblings } => {
                rows += 1;
                grouped
                    .entry((site_id.clone(), bucket.clone()))
                    .or_default()
                    .insert(key.clone(), siblings.clone());
            }
            TransferFrame::Done { rows: expected } => {
                if *expected != rows {
                    return Err(error::E_CORRUPTED);
                }
            }
        }
    }

    let sites = partition.sites();
    for ((site_id, bucket_name), patch) in grouped {
        sites.add(&site_id);
        let site = sites.acquire(&site_id).ok_or(error::E_NO_SUCH_SITE)?;
        let bucket = site.bucket(&bucket_name).ok_or(error::E_NO_SUCH_BUCKET)?;
        let result = bucket.merge(&patch);
        sites.release(&site_id);
        result?;
    }

    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tidepool_core::{CloudSitePool, SiteFactory};
    use tidepool_model::UpdateBatch;
    use tidepool_storage::MemoryStorageDriver;

    fn partition(number: u64, node: &str) -> Partition {
        let storage = Arc::new(MemoryStorageDriver::new());
        let pool = CloudSitePool::new(SiteFactory::new(storage, 4, node));
        Partition::new(number, Arc::new(pool))
    }

    fn put(partition: &Partition, site: &str, bucket: &str, key: &str, value: &[u8]) {
        partition.sites().add(site);
        let s = partition.sites().acquire(site).unwrap();
        s.bucket(bucket)
            .unwrap()
            .batch(&UpdateBatch::new().put(key, value.to_vec(), ""))
            .unwrap();
        partition.sites().release(site);
    }

    #[test]
    fn frames_round_trip() {
        let source = partition(3, "node-a");
        put(&source, "site1", "default", "k1", b"v1");
        put(&source, "site1", "lww", "k2", b"v2");
        put(&source, "site2", "default", "k3", b"v3");

        let frames = snapshot_partition(&source).unwrap();
        assert_eq!(frames.len(), 4); // 3 rows + done

        let encoded = encode_frames(&frames).unwrap();
        let decoded = decode_frames(&encoded).unwrap();
        assert_eq!(decoded, frames);
    }

    #[test]
    fn truncated_stream_is_corrupt() {
        let source = partition(0, "node-a");
        put(&source, "site1", "default", "k", b"v");
        let encoded = encode_frames(&snapshot_partition(&source).unwrap()).unwrap();

        assert_eq!(decode_frames(&encoded[..encoded.len() - 1]).err(), Some(error::E_CORRUPTED));
        assert_eq!(decode_frames(&encoded[..3]).err(), Some(error::E_CORRUPTED));

        // A stream missing its done frame is also rejected
        let rows_only = encode_frames(&[TransferFrame::Row {
            site_id: "s".into(),
            bucket: "default".into(),
            key: "k".into(),
            siblings: SiblingSet::new(),
        }])
        .unwrap();
        assert_eq!(decode_frames(&rows_only).err(), Some(error::E_CORRUPTED));
    }

    #[test]
    fn apply_recreates_content_on_destination() {
        let source = partition(5, "node-a");
        put(&source, "site1", "default", "k1", b"v1");
        put(&source, "site1", "default", "k2", b"v2");

        source.lock_writes();
        let frames = snapshot_partition(&source).unwrap();

        let destination = partition(5, "node-b");
        let rows = apply_frames(&destination, &frames).unwrap();
        assert_eq!(rows, 2);

        let site = destination.sites().acquire("site1").unwrap();
        let bucket = site.bucket("default").unwrap();
        let got = bucket.get(&["k1".to_string(), "k2".to_string()]).unwrap();
        assert_eq!(got[0].live_values(), vec![b"v1".as_slice()]);
        assert_eq!(got[1].live_values(), vec![b"v2".as_slice()]);

        // Same contents, same merkle roots
        let source_site = source.sites().acquire("site1").unwrap();
        assert_eq!(
            source_site.bucket("default").unwrap().merkle_root_hash().unwrap(),
            bucket.merkle_root_hash().unwrap()
        );
    }

    #[test]
    fn apply_is_idempotent() {
        let source = partition(0, "node-a");
        put(&source, "site1", "default", "k", b"v");
        let frames = snapshot_partition(&source).unwrap();

        let destination = partition(0, "node-b");
        apply_frames(&destination, &frames).unwrap();
        apply_frames(&destination, &frames).unwrap();

        let site = destination.sites().acquire("site1").unwrap();
        let got = site.bucket("default").unwrap().get(&["k".to_string()]).unwrap();
        assert_eq!(got[0].size(), 1);
    }
}
