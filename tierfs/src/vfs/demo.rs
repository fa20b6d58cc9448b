//! 端到端示例：写入跨 block 的数据，刷新到元数据服务，再用全新的 inode 缓存读回校验。

use super::adaptor::ObjectDataPath;
use super::cache::InodeCache;
use crate::cadapter::client::{ObjectBackend, ObjectClient};
use crate::cadapter::localfs::LocalFsBackend;
use crate::cadapter::s3::S3Backend;
use crate::chuck::disk_cache::{DiskCacheManager, DiskCacheType};
use crate::chuck::store::TieredBlockStore;
use crate::config::{BackendConfig, Config};
use crate::daemon::worker::FlushDriver;
use crate::meta::{InMemoryMetaClient, MetaClient};
use anyhow::{Context, anyhow, ensure};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DemoReport {
    pub inode_id: u64,
    pub bytes: usize,
    pub descriptors: usize,
    pub disk_cache_bytes: u64,
}

/// 本地目录下的默认配置：对象写到 `dir/objects`，磁盘缓存在 `dir/cache`。
pub fn local_config<P: AsRef<Path>>(dir: P) -> Config {
    let dir = dir.as_ref();
    let mut cfg = Config::default();
    cfg.object_store.backend = BackendConfig::Local {
        root: dir.join("objects"),
    };
    cfg.disk_cache.cache_type = DiskCacheType::ReadWrite;
    cfg.disk_cache.cache_dir = dir.join("cache");
    cfg
}

/// 按配置选择对象存储后端并运行示例。
pub async fn e2e_demo(cfg: &Config) -> anyhow::Result<DemoReport> {
    let store_cfg = &cfg.object_store;
    match &store_cfg.backend {
        BackendConfig::Local { root } => {
            let client = ObjectClient::with_limits(
                LocalFsBackend::new(root),
                store_cfg.throttle,
                store_cfg.max_async_request_inflight_bytes,
            );
            run(cfg, client).await
        }
        BackendConfig::S3 {
            bucket,
            endpoint,
            region,
        } => {
            let backend = S3Backend::new(
                bucket.clone(),
                endpoint.as_deref(),
                region,
                store_cfg.s3_config(),
            )
            .await
            .map_err(|e| anyhow!(e))
            .context("create s3 backend")?;
            let client = ObjectClient::with_limits(
                backend,
                store_cfg.throttle,
                store_cfg.max_async_request_inflight_bytes,
            );
            let res = run(cfg, client).await;
            crate::cadapter::s3::shutdown_sdk().await;
            res
        }
    }
}

async fn run<B: ObjectBackend + 'static>(
    cfg: &Config,
    client: ObjectClient<B>,
) -> anyhow::Result<DemoReport> {
    cfg.validate().context("invalid config")?;
    let meta = Arc::new(InMemoryMetaClient::new());
    let disk = match cfg.disk_cache.cache_type {
        DiskCacheType::Disable => None,
        _ => Some(
            DiskCacheManager::init(cfg.disk_cache.clone(), client.clone())
                .await
                .context("init disk cache")?,
        ),
    };
    let store = Arc::new(TieredBlockStore::new(client, disk.clone()));
    let cache = Arc::new(InodeCache::new(
        cfg.fs_id,
        cfg.inode_cache.capacity,
        meta.clone(),
    ));
    let driver = FlushDriver::new(
        cache.clone(),
        Duration::from_secs(cfg.inode_cache.flush_interval_secs),
    );
    let stop = driver.cancel_token();
    let driver = driver.spawn();

    // 从半个 block 起写入 1.5 个 block 的数据
    let layout = cfg.layout;
    let half = layout.block_size / 2;
    let len = (layout.block_size + half) as usize;
    let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();

    let dp = ObjectDataPath::new(layout, cache.clone(), store.clone());
    let ino = dp.create_file(0o644).await?;
    dp.write(ino, half, &data).await?;
    let report = dp.fs_sync().await?;
    info!("demo: wrote {len} bytes to inode {ino}, {} records flushed", report.flushed);

    // 全新缓存：从元数据服务重新加载描述符
    let fresh = Arc::new(InodeCache::new(cfg.fs_id, cfg.inode_cache.capacity, meta.clone()));
    let reader = ObjectDataPath::new(layout, fresh, store.clone());
    let out = reader.read(ino, half, len).await?;
    ensure!(out == data, "data mismatch after reload");

    let inode = meta.get_inode(cfg.fs_id, ino).await?;
    let disk_cache_bytes = disk.as_ref().map(|d| d.used_bytes()).unwrap_or(0);

    stop.cancel();
    driver.await.context("flush driver")?;
    if let Some(d) = &disk {
        d.shutdown().await?;
    }
    Ok(DemoReport {
        inode_id: ino,
        bytes: len,
        descriptors: inode.chunks.descriptor_count(),
        disk_cache_bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chuck::chunk::ChunkLayout;

    #[tokio::test]
    async fn test_e2e_localfs_demo() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = local_config(dir.path());
        cfg.layout = ChunkLayout::new(64 * 1024, 16 * 1024);
        cfg.disk_cache.check_fs_usage = false;
        let report = e2e_demo(&cfg).await.expect("e2e demo should succeed");
        assert_eq!(report.bytes, 24 * 1024);
        assert_eq!(report.descriptors, 2);
        assert_eq!(report.disk_cache_bytes, 24 * 1024);
        // 关闭后写缓存已全部上传
        assert!(dir.path().join("objects").read_dir().unwrap().next().is_some());
    }

    #[tokio::test]
    async fn test_demo_without_disk_cache() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = local_config(dir.path());
        cfg.layout = ChunkLayout::new(64 * 1024, 16 * 1024);
        cfg.disk_cache.cache_type = DiskCacheType::Disable;
        let report = e2e_demo(&cfg).await.unwrap();
        assert_eq!(report.disk_cache_bytes, 0);
    }
}
