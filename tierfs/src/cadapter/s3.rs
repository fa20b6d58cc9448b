//! S3 适配器：基于 aws-sdk-s3，支持大对象分段上传、范围读取、基础重试与 MD5 校验。
//!
//! SDK 配置是进程级状态：由 [`init_sdk`] 加载一次并缓存，[`shutdown_sdk`] 释放；
//! 两者都是幂等的，由应用装配层负责调用。

use crate::cadapter::client::{BackendError, ObjectBackend};
use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::ProvideErrorMetadata;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use std::sync::{Arc, LazyLock};
use tokio::{
    io::AsyncReadExt,
    sync::{Mutex, Semaphore},
    time::{Duration, sleep},
};
use tracing::{debug, info, warn};

static SDK: LazyLock<Mutex<Option<SdkConfig>>> = LazyLock::new(|| Mutex::new(None));

/// Load the process-wide SDK configuration once; later calls return the cached one.
pub async fn init_sdk(endpoint: Option<&str>, region: &str) -> SdkConfig {
    let mut sdk = SDK.lock().await;
    if let Some(conf) = sdk.as_ref() {
        return conf.clone();
    }
    let mut loader = aws_config::ConfigLoader::default()
        .behavior_version(aws_config::BehaviorVersion::latest())
        .credentials_provider(aws_config::environment::EnvironmentVariableCredentialsProvider::new())
        .region(aws_config::Region::new(region.to_string()));
    if let Some(url) = endpoint {
        loader = loader.endpoint_url(url);
    }
    let conf = loader.load().await;
    info!("s3 sdk initialized (region {region})");
    *sdk = Some(conf.clone());
    conf
}

/// Drop the process-wide SDK configuration. Clients built earlier keep working.
pub async fn shutdown_sdk() {
    if SDK.lock().await.take().is_some() {
        info!("s3 sdk shut down");
    }
}

/// S3 后端配置选项
#[derive(Debug, Clone)]
pub struct S3Config {
    /// 分段大小（字节），建议 8-64MiB
    pub part_size: usize,
    /// 最大并发分段上传数
    pub max_concurrency: usize,
    /// 最大重试次数
    pub max_retries: u32,
    /// 初始重试延迟（毫秒）
    pub initial_retry_delay_ms: u64,
    /// 单次请求超时
    pub timeout: Duration,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            part_size: 8 * 1024 * 1024, // 8MB
            max_concurrency: 8,
            max_retries: 3,
            initial_retry_delay_ms: 100,
            timeout: Duration::from_secs(30),
        }
    }
}

pub struct S3Backend {
    client: Client,
    bucket: String,
    config: S3Config,
}

impl S3Backend {
    pub async fn new(
        bucket: impl Into<String>,
        endpoint: Option<&str>,
        region: &str,
        config: S3Config,
    ) -> Result<Self, BackendError> {
        let sdk = init_sdk(endpoint, region).await;
        let s3_conf = aws_sdk_s3::config::Builder::from(&sdk)
            .force_path_style(true)
            .build();
        Ok(Self {
            client: Client::from_conf(s3_conf),
            bucket: bucket.into(),
            config,
        })
    }

    fn md5_base64(data: &[u8]) -> String {
        let sum = md5::compute(data);
        B64.encode(sum.0)
    }

    async fn execute_with_retry<T, F, Fut, E>(
        &self,
        operation: F,
        operation_name: &'static str,
    ) -> Result<T, BackendError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::fmt::Display + std::fmt::Debug + Send + Sync + 'static,
    {
        let mut attempt = 0;
        let max_retries = self.config.max_retries;
        loop {
            attempt += 1;
            let res = match tokio::time::timeout(self.config.timeout, operation()).await {
                Ok(res) => res.map_err(|e| e.to_string()),
                Err(_) => Err(format!("timed out after {:?}", self.config.timeout)),
            };
            match res {
                Ok(result) => return Ok(result),
                Err(e) => {
                    if attempt > max_retries {
                        return Err(Box::new(std::io::Error::other(format!(
                            "{operation_name} failed after {max_retries} retries: {e}"
                        ))));
                    }
                    let delay_ms = self.config.initial_retry_delay_ms * 2u64.pow(attempt - 1);
                    warn!("{operation_name} attempt {attempt} failed: {e}, retry in {delay_ms}ms");
                    sleep(Duration::from_millis(delay_ms)).await;
                }
            }
        }
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Vec<u8>,
        semaphore: Arc<Semaphore>,
    ) -> Result<(i32, Option<String>), BackendError> {
        let _permit = semaphore.acquire().await?;
        let checksum = Self::md5_base64(&data);

        let operation = || async {
            self.client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .content_md5(checksum.clone())
                .body(data.clone().into())
                .send()
                .await
        };

        self.execute_with_retry(operation, "upload_part")
            .await
            .map(|resp| (part_number, resp.e_tag().map(|s| s.to_string())))
    }

    async fn put_multipart(&self, key: &str, data: &[u8]) -> Result<(), BackendError> {
        let create = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await?;
        let upload_id = create
            .upload_id()
            .ok_or_else(|| std::io::Error::other("multipart upload without upload id"))?
            .to_string();
        let sem = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));

        // 并发上传各分片，并发度由 semaphore 限制
        let parts = data
            .chunks(self.config.part_size)
            .enumerate()
            .map(|(i, chunk)| {
                self.upload_part(key, &upload_id, i as i32 + 1, chunk.to_vec(), sem.clone())
            });

        let results = match futures::future::try_join_all(parts).await {
            Ok(v) => v,
            Err(e) => {
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!("abort multipart upload of {key} failed: {abort_err}");
                }
                return Err(e);
            }
        };

        let completed_parts = results
            .into_iter()
            .map(|(pn, etag)| {
                aws_sdk_s3::types::CompletedPart::builder()
                    .part_number(pn)
                    .set_e_tag(etag)
                    .build()
            })
            .collect::<Vec<_>>();

        let completed = aws_sdk_s3::types::CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed)
            .send()
            .await?;
        debug!("multipart upload of {key} done ({} bytes)", data.len());
        Ok(())
    }
}

#[async_trait]
impl ObjectBackend for S3Backend {
    async fn put_object(&self, key: &str, data: &[u8]) -> Result<(), BackendError> {
        // 小对象直接 put_object；大对象走 multipart。
        if data.len() > self.config.part_size {
            return self.put_multipart(key, data).await;
        }
        let checksum = Self::md5_base64(data);
        let operation = || async {
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(key)
                .body(data.to_owned().into())
                .content_md5(checksum.clone())
                .send()
                .await
        };
        self.execute_with_retry(operation, "put_object").await?;
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;
        match resp {
            Ok(o) => {
                let mut body = o.body.into_async_read();
                let mut buf = Vec::new();
                body.read_to_end(&mut buf).await?;
                Ok(Some(buf))
            }
            Err(e) if e.as_service_error().is_some_and(|se| se.is_no_such_key()) => Ok(None),
            Err(e) => Err(Box::new(e)),
        }
    }

    async fn get_object_range(
        &self,
        key: &str,
        offset: u64,
        len: usize,
    ) -> Result<Option<Vec<u8>>, BackendError> {
        if len == 0 {
            return Ok(Some(Vec::new()));
        }
        let range = format!("bytes={}-{}", offset, offset + len as u64 - 1);
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .range(range)
            .send()
            .await;
        match resp {
            Ok(o) => {
                let mut body = o.body.into_async_read();
                let mut buf = Vec::with_capacity(len);
                body.read_to_end(&mut buf).await?;
                Ok(Some(buf))
            }
            Err(e) if e.as_service_error().is_some_and(|se| se.is_no_such_key()) => Ok(None),
            // 起点越过对象末尾
            Err(e) if e.as_service_error().and_then(|se| se.code()) == Some("InvalidRange") => {
                Ok(Some(Vec::new()))
            }
            Err(e) => Err(Box::new(e)),
        }
    }

    async fn delete_object(&self, key: &str) -> Result<(), BackendError> {
        let operation = || async {
            self.client
                .delete_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
        };
        self.execute_with_retry(operation, "delete_object").await?;
        Ok(())
    }
}
