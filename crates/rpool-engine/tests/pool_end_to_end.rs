//! End-to-end pool behavior against in-memory remotes.

use bytes::Bytes;
use rpool_core::config::{BalancingStrategy, RedundancyMode};
use rpool_core::{PoolConfig, PoolError};
use rpool_engine::{PoolEngine, VerifyStatus};
use rpool_storage::{BlobClient, MemoryClient};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

struct Pool {
    client: Arc<MemoryClient>,
    engine: PoolEngine,
    tmp: tempfile::TempDir,
}

fn build_pool(remotes: &[&str], mutate: impl FnOnce(&mut PoolConfig)) -> Pool {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = PoolConfig {
        remotes: remotes.iter().map(|s| s.to_string()).collect(),
        chunk_size: 100,
        cache_dir: Some(tmp.path().join("manifest-cache")),
        chunk_cache_dir: tmp.path().join("chunk-cache"),
        temp_dir: tmp.path().join("tmp"),
        ..Default::default()
    };
    mutate(&mut config);
    let client = Arc::new(MemoryClient::new(config.remotes.iter().cloned()));
    let engine = PoolEngine::new(config, client.clone()).unwrap();
    Pool {
        client,
        engine,
        tmp,
    }
}

async fn write_local(dir: &Path, name: &str, data: &[u8]) -> std::path::PathBuf {
    let path = dir.join(name);
    tokio::fs::write(&path, data).await.unwrap();
    path
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[tokio::test]
async fn upload_places_chunks_least_used_and_reassembles() {
    let pool = build_pool(&["a", "b", "c"], |_| {});
    let data = payload(250);
    let local = write_local(pool.tmp.path(), "file.bin", &data).await;

    let manifest = pool
        .engine
        .upload(&local, "/media/file.bin", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(manifest.file_path, "/media/file.bin");
    assert_eq!(manifest.chunk_count, 3);
    let sizes: Vec<u64> = manifest.chunks.iter().map(|c| c.size).collect();
    assert_eq!(sizes, vec![100, 100, 50]);
    let offsets: Vec<u64> = manifest.chunks.iter().map(|c| c.offset).collect();
    assert_eq!(offsets, vec![0, 100, 200]);
    // least-used with equal usage breaks ties by name
    let placements: Vec<&str> = manifest.chunks.iter().map(|c| c.remote.as_str()).collect();
    assert_eq!(placements, vec!["a", "b", "c"]);

    let out = pool.tmp.path().join("out.bin");
    pool.engine
        .download("/media/file.bin", &out, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(tokio::fs::read(&out).await.unwrap(), data);

    let listed = pool.engine.ls("/media").await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].chunk_count, 3);
    assert_eq!(listed[0].size, 250);
    assert_eq!(listed[0].remotes, vec!["a", "b", "c"]);
}

#[tokio::test]
async fn range_reads_match_local_slices() {
    let pool = build_pool(&["a", "b"], |c| c.chunk_size = 128);
    let data = payload(1000);
    let local = write_local(pool.tmp.path(), "f.bin", &data).await;
    pool.engine
        .upload(&local, "/f.bin", &CancellationToken::new())
        .await
        .unwrap();

    for (offset, length) in [
        (0u64, 1000u64),
        (0, 1),
        (999, 1),
        (127, 2),
        (128, 128),
        (250, 500),
        (64, 900),
    ] {
        let got = pool
            .engine
            .download_range("/f.bin", offset, length)
            .await
            .unwrap();
        let want = &data[offset as usize..(offset + length) as usize];
        assert_eq!(&got[..], want, "range {offset}+{length}");
    }
}

#[tokio::test]
async fn delete_removes_every_object_everywhere() {
    let pool = build_pool(&["a", "b", "c"], |c| {
        c.redundancy_mode = RedundancyMode::Replication;
        c.replication_factor = 2;
    });
    let data = payload(250);
    let local = write_local(pool.tmp.path(), "f.bin", &data).await;
    pool.engine
        .upload(&local, "/f.bin", &CancellationToken::new())
        .await
        .unwrap();

    pool.engine.delete("/f.bin").await.unwrap();

    for remote in ["a", "b", "c"] {
        assert_eq!(
            pool.client.object_count(remote),
            0,
            "remote {remote} should be empty"
        );
    }
    assert!(pool.engine.load_manifest("/f.bin").await.unwrap().is_none());
    assert!(matches!(
        pool.engine.delete("/f.bin").await,
        Err(PoolError::NotFound(_))
    ));
}

#[tokio::test]
async fn verify_and_repair_round_trip() {
    let pool = build_pool(&["a", "b"], |_| {});
    let data = payload(90);
    let local = write_local(pool.tmp.path(), "f.bin", &data).await;
    let manifest = pool
        .engine
        .upload(&local, "/f.bin", &CancellationToken::new())
        .await
        .unwrap();

    let chunk = &manifest.chunks[0];
    pool.client.delete(&chunk.remote, &chunk.path).await.unwrap();

    let result = pool.engine.verifier().verify("/f.bin", false).await.unwrap();
    assert_eq!(result.status, VerifyStatus::MissingChunks);
    assert_eq!(result.missing_chunks, vec![0]);

    let repaired = pool.engine.verifier().repair("/f.bin", &local).await.unwrap();
    assert_eq!(repaired.status, VerifyStatus::Ok);

    let out = pool.tmp.path().join("out.bin");
    pool.engine
        .download("/f.bin", &out, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(tokio::fs::read(&out).await.unwrap(), data);
}

#[tokio::test]
async fn parity_survives_single_chunk_loss() {
    let pool = build_pool(&["a", "b", "c", "d"], |c| {
        c.redundancy_mode = RedundancyMode::Parity;
        c.parity_data_shards = 3;
        c.parity_shards = 1;
    });
    let data = payload(300);
    let local = write_local(pool.tmp.path(), "f.bin", &data).await;
    let manifest = pool
        .engine
        .upload(&local, "/f.bin", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(manifest.chunk_count, 3);
    assert_eq!(manifest.parity_chunks.len(), 1);
    // data landed on a, b, c so the parity shard goes to d
    assert_eq!(manifest.parity_chunks[0].remote, "d");

    let victim = &manifest.chunks[1];
    pool.client.delete(&victim.remote, &victim.path).await.unwrap();

    let health = pool.engine.redundancy().check_health("/f.bin").await.unwrap();
    assert_eq!(health.missing_chunks, 1);
    assert!(health.is_recoverable);

    let outcome = pool
        .engine
        .redundancy()
        .rebuild("/f.bin", &CancellationToken::new())
        .await
        .unwrap();
    assert!(outcome.ok());

    let out = pool.tmp.path().join("out.bin");
    pool.engine
        .download("/f.bin", &out, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(tokio::fs::read(&out).await.unwrap(), data);
}

#[tokio::test]
async fn replication_keeps_reads_alive_after_primary_loss() {
    let pool = build_pool(&["a", "b", "c"], |c| {
        c.redundancy_mode = RedundancyMode::Replication;
        c.replication_factor = 2;
    });
    let data = payload(250);
    let local = write_local(pool.tmp.path(), "f.bin", &data).await;
    let manifest = pool
        .engine
        .upload(&local, "/f.bin", &CancellationToken::new())
        .await
        .unwrap();
    assert!(manifest.chunks.iter().all(|c| c.replicas.len() == 1));

    // drop every primary copy; replicas must carry the download
    for chunk in &manifest.chunks {
        pool.client.delete(&chunk.remote, &chunk.path).await.unwrap();
    }
    let out = pool.tmp.path().join("out.bin");
    pool.engine
        .download("/f.bin", &out, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(tokio::fs::read(&out).await.unwrap(), data);

    let health = pool.engine.redundancy().check_health("/f.bin").await.unwrap();
    assert_eq!(health.degraded_chunks, 3);
    assert!(health.is_recoverable);
}

#[tokio::test]
async fn compression_round_trips_including_ranges() {
    let pool = build_pool(&["a", "b"], |c| c.enable_compression = true);
    // highly compressible payload
    let data = vec![42u8; 500];
    let local = write_local(pool.tmp.path(), "f.bin", &data).await;
    let manifest = pool
        .engine
        .upload(&local, "/f.bin", &CancellationToken::new())
        .await
        .unwrap();
    assert!(manifest.chunks.iter().all(|c| c.compressed));
    assert!(manifest.chunks[0].stored_len() < manifest.chunks[0].size);

    let out = pool.tmp.path().join("out.bin");
    pool.engine
        .download("/f.bin", &out, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(tokio::fs::read(&out).await.unwrap(), data);

    let range = pool.engine.download_range("/f.bin", 150, 200).await.unwrap();
    assert_eq!(&range[..], &data[150..350]);
}

#[tokio::test]
async fn orphan_scan_finds_only_unreferenced_objects() {
    let pool = build_pool(&["a", "b"], |_| {});
    let data = payload(250);
    let local = write_local(pool.tmp.path(), "f.bin", &data).await;
    pool.engine
        .upload(&local, "/f.bin", &CancellationToken::new())
        .await
        .unwrap();

    pool.client
        .upload(
            "b",
            "rclonepool_data/zombie.chunk.000",
            Bytes::from_static(b"zzz"),
        )
        .await
        .unwrap();

    let orphans = pool.engine.verifier().find_orphans().await.unwrap();
    assert_eq!(orphans.len(), 1);
    assert_eq!(orphans[0].remote, "b");
    assert_eq!(orphans[0].path, "rclonepool_data/zombie.chunk.000");

    assert_eq!(pool.engine.verifier().delete_orphans(&orphans).await, 1);
    assert!(pool.engine.verifier().find_orphans().await.unwrap().is_empty());
    // the real file is untouched
    let result = pool.engine.verifier().verify("/f.bin", false).await.unwrap();
    assert_eq!(result.status, VerifyStatus::Ok);
}

#[tokio::test]
async fn manifest_survives_one_remote_going_dark() {
    let pool = build_pool(&["a", "b"], |_| {});
    let data = payload(120);
    let local = write_local(pool.tmp.path(), "f.bin", &data).await;
    pool.engine
        .upload(&local, "/f.bin", &CancellationToken::new())
        .await
        .unwrap();

    pool.engine.manifest_store().cache().clear();
    pool.client.set_offline("a", true);

    let manifest = pool.engine.load_manifest("/f.bin").await.unwrap();
    assert!(manifest.is_some(), "manifest readable from surviving remote");
}

#[tokio::test]
async fn identical_reupload_is_skipped() {
    let pool = build_pool(&["a", "b"], |_| {});
    let data = payload(250);
    let local = write_local(pool.tmp.path(), "f.bin", &data).await;

    let first = pool
        .engine
        .upload(&local, "/f.bin", &CancellationToken::new())
        .await
        .unwrap();
    let second = pool
        .engine
        .upload(&local, "/f.bin", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(first.created_at, second.created_at, "second upload reused manifest");
    assert_eq!(pool.engine.counters().snapshot().uploads, 1);
}

#[tokio::test]
async fn rename_preserves_content() {
    let pool = build_pool(&["a", "b"], |_| {});
    let data = payload(250);
    let local = write_local(pool.tmp.path(), "f.bin", &data).await;
    pool.engine
        .upload(&local, "/old/f.bin", &CancellationToken::new())
        .await
        .unwrap();

    pool.engine.rename("/old/f.bin", "/new/g.bin").await.unwrap();

    assert!(pool.engine.load_manifest("/old/f.bin").await.unwrap().is_none());
    let out = pool.tmp.path().join("out.bin");
    pool.engine
        .download("/new/g.bin", &out, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(tokio::fs::read(&out).await.unwrap(), data);
}

#[tokio::test]
async fn parallel_upload_preserves_layout() {
    let pool = build_pool(&["a", "b", "c"], |c| {
        c.parallel_uploads = true;
        c.parallel_downloads = true;
        c.max_parallel_workers = 3;
    });
    let data = payload(1024);
    let local = write_local(pool.tmp.path(), "f.bin", &data).await;
    let manifest = pool
        .engine
        .upload(&local, "/f.bin", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(manifest.chunk_count, 11);
    let mut offset = 0u64;
    for (i, chunk) in manifest.chunks.iter().enumerate() {
        assert_eq!(chunk.index as usize, i);
        assert_eq!(chunk.offset, offset);
        offset += chunk.size;
    }
    assert_eq!(offset, 1024);

    let out = pool.tmp.path().join("out.bin");
    pool.engine
        .download("/f.bin", &out, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(tokio::fs::read(&out).await.unwrap(), data);
}

#[tokio::test]
async fn upload_missing_local_file_fails_clean() {
    let pool = build_pool(&["a"], |_| {});
    let err = pool
        .engine
        .upload(
            Path::new("/nonexistent/file.bin"),
            "/f.bin",
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    // nothing leaked onto the remote
    assert_eq!(pool.client.object_count("a"), 0);
}

#[tokio::test]
async fn stats_aggregate_pool_totals() {
    let pool = build_pool(&["a", "b"], |_| {});
    let data = payload(250);
    let local = write_local(pool.tmp.path(), "f.bin", &data).await;
    pool.engine
        .upload(&local, "/f.bin", &CancellationToken::new())
        .await
        .unwrap();

    let stats = pool.engine.stats().await.unwrap();
    assert_eq!(stats.files, 1);
    assert_eq!(stats.total_size, 250);
    assert_eq!(stats.chunks, 3);
    assert_eq!(stats.remotes, 2);
    assert!(stats.used_space > 0);
}

#[tokio::test]
async fn round_robin_strategy_cycles_over_uploads() {
    let pool = build_pool(&["a", "b", "c"], |c| {
        c.balancing_strategy = BalancingStrategy::RoundRobin;
    });
    let data = payload(900);
    let local = write_local(pool.tmp.path(), "f.bin", &data).await;
    let manifest = pool
        .engine
        .upload(&local, "/f.bin", &CancellationToken::new())
        .await
        .unwrap();
    let placements: Vec<&str> = manifest.chunks.iter().map(|c| c.remote.as_str()).collect();
    assert_eq!(
        placements,
        vec!["a", "b", "c", "a", "b", "c", "a", "b", "c"]
    );
}
