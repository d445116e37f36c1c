//! 插件替换协调器
//!
//! 提供插件生命周期的核心流程：
//! - install_or_replace: 上传安装，已存在时执行 停止 → 写入 → 激活 → 启动/回滚
//! - delete: 删除未被使用的插件
//! - reload: 从原文件重新加载插件
//! - load_existing: 启动时扫描插件目录
//!
//! 同一插件 ID 的操作串行执行，不同 ID 之间互不阻塞。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;

use super::instances::{InstanceError, InstanceManager};
use super::registry::ArtifactRegistry;
use super::store::{derive_replacement_name, list_blobs, ArtifactStore, TrashReason};
use super::types::{
    Accepted, Artifact, ArtifactError, ArtifactMeta, ArtifactStatus, Deleted, InstallOutcome,
    InstanceId, ProgressCallback, ReplaceProgress,
};
use super::validator::{digest_bytes, digest_file, ArtifactValidator, ZipArtifactValidator};
use crate::config::DepotConfig;
use crate::logger::{self, LogStore, SharedLogStore};

/// 插件替换协调器
pub struct ArtifactCoordinator {
    /// 注册表
    registry: Arc<ArtifactRegistry>,
    /// 文件存储
    store: ArtifactStore,
    /// 校验器
    validator: Arc<dyn ArtifactValidator>,
    /// 实例管理器
    instances: Arc<dyn InstanceManager>,
    /// 按插件 ID 的操作锁
    locks: DashMap<String, Arc<Mutex<()>>>,
    /// 只读加载目录
    load_dirs: Vec<PathBuf>,
    /// 生命周期事件日志
    journal: SharedLogStore,
}

impl ArtifactCoordinator {
    /// 创建协调器
    pub fn new(
        store: ArtifactStore,
        validator: Arc<dyn ArtifactValidator>,
        instances: Arc<dyn InstanceManager>,
    ) -> Self {
        Self {
            registry: Arc::new(ArtifactRegistry::new()),
            store,
            validator,
            instances,
            locks: DashMap::new(),
            load_dirs: Vec::new(),
            journal: logger::shared(LogStore::new()),
        }
    }

    /// 从配置创建协调器（默认 ZIP 校验器）
    pub fn from_config(
        config: &DepotConfig,
        instances: Arc<dyn InstanceManager>,
    ) -> Result<Self, ArtifactError> {
        config.validate()?;
        let store = ArtifactStore::open(
            config.directories.upload.clone(),
            config.directories.trash_policy(),
            config.artifact_extension.clone(),
        )?;

        Ok(Self::new(store, Arc::new(ZipArtifactValidator::new()), instances)
            .with_load_dirs(config.directories.load.clone())
            .with_journal(logger::shared(LogStore::with_config(&config.logging))))
    }

    /// 设置只读加载目录
    pub fn with_load_dirs(mut self, load_dirs: Vec<PathBuf>) -> Self {
        self.load_dirs = load_dirs;
        self
    }

    /// 设置事件日志
    pub fn with_journal(mut self, journal: SharedLogStore) -> Self {
        self.journal = journal;
        self
    }

    pub fn registry(&self) -> Arc<ArtifactRegistry> {
        self.registry.clone()
    }

    pub fn journal(&self) -> SharedLogStore {
        self.journal.clone()
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// 上传插件
    ///
    /// 流程: 校验元数据 → 按 ID 加锁 → 新安装 / 替换
    pub async fn install_or_replace(
        &self,
        bytes: &[u8],
        progress: &dyn ProgressCallback,
    ) -> Result<Accepted, ArtifactError> {
        let result = self.install_or_replace_inner(bytes, progress).await;
        if let Err(e) = &result {
            progress.on_progress(ReplaceProgress::failed(e.to_string()));
        }
        result
    }

    async fn install_or_replace_inner(
        &self,
        bytes: &[u8],
        progress: &dyn ProgressCallback,
    ) -> Result<Accepted, ArtifactError> {
        // 阶段 1: 校验元数据，失败时不做任何修改
        progress.on_progress(ReplaceProgress::validating("验证插件包..."));
        let meta = self.validator.verify_meta(bytes)?;
        let digest = digest_bytes(bytes);

        let lock = self.lock_for(&meta.id);
        let _guard = lock.lock().await;

        match self.registry.lookup(&meta.id) {
            None => self.install_fresh(&meta, bytes, &digest, progress).await,
            Some(current) if !current.supports_replacement => {
                tracing::warn!("[ARTIFACT] 插件 {} 来自只读目录，拒绝替换", current.id);
                Err(ArtifactError::Unsupported(current.id))
            }
            Some(current) => self.replace(current, &meta, bytes, &digest, progress).await,
        }
    }

    /// 新安装：写入 → 解析 → 注册
    async fn install_fresh(
        &self,
        meta: &ArtifactMeta,
        bytes: &[u8],
        digest: &str,
        progress: &dyn ProgressCallback,
    ) -> Result<Accepted, ArtifactError> {
        progress.on_progress(ReplaceProgress::persisting("写入插件文件..."));
        let location = self.store.persist(&self.store.fresh_location(meta), bytes)?;

        progress.on_progress(ReplaceProgress::activating("加载插件..."));
        let manifest = match self.validator.load_definition(&location) {
            Ok(manifest) => manifest,
            Err(e) => {
                tracing::warn!("[ARTIFACT] 插件 {} v{} 加载失败: {}", meta.id, meta.version, e);
                self.record("warn", &format!("安装 {} v{} 失败: {}", meta.id, meta.version, e)).await;
                self.store.trash(&location, TrashReason::Error);
                return Err(e);
            }
        };

        let artifact = self
            .registry
            .register(Artifact::new(manifest, location, digest));

        tracing::info!(
            "[ARTIFACT] 已安装插件 {} v{} ({})",
            artifact.id,
            artifact.version,
            artifact.location.display()
        );
        self.record("info", &format!("安装 {} v{}", artifact.id, artifact.version)).await;
        progress.on_progress(ReplaceProgress::complete(format!(
            "插件 {} v{} 安装成功",
            artifact.id, artifact.version
        )));

        Ok(Accepted {
            outcome: InstallOutcome::Installed,
            previous_version: None,
            artifact,
        })
    }

    /// 替换已有插件
    async fn replace(
        &self,
        current: Artifact,
        meta: &ArtifactMeta,
        bytes: &[u8],
        digest: &str,
        progress: &dyn ProgressCallback,
    ) -> Result<Accepted, ArtifactError> {
        // 阶段 2: 写入新文件，失败时实例不受影响
        progress.on_progress(ReplaceProgress::persisting("写入插件文件..."));
        let candidate = derive_replacement_name(&current.location, &current.version, &meta.version);
        let new_location = self.store.persist(&candidate, bytes)?;

        // 阶段 3: 停止实例
        progress.on_progress(ReplaceProgress::stopping(format!(
            "停止 {} 个实例...",
            current.instances.len()
        )));
        if let Err(e) = self.instances.stop_instances(&current).await {
            tracing::error!("[ARTIFACT] 停止插件 {} 的实例失败: {}", current.id, e);
            if let Err(start_err) = self.instances.start_instances(&current).await {
                tracing::error!("[ARTIFACT] 重启插件 {} 的实例失败: {}", current.id, start_err);
            }
            self.store.trash(&new_location, TrashReason::Error);
            self.record("error", &format!("替换 {} 失败，无法停止实例: {}", current.id, e)).await;
            return Err(instance_failure(&current.id, e));
        }

        // 阶段 4: 激活新版本
        progress.on_progress(ReplaceProgress::activating("加载新版本..."));
        let manifest = match self.validator.load_definition(&new_location) {
            Ok(manifest) => manifest,
            Err(e) => return Err(self.roll_back(&current, &new_location, e, progress).await),
        };

        let stored = self
            .registry
            .register(current.rebind(manifest, new_location, digest));

        // 阶段 5: 启动实例，然后回收旧文件
        progress.on_progress(ReplaceProgress::starting("启动实例..."));
        let started = self.instances.start_instances(&stored).await;
        self.store.trash(&current.location, TrashReason::Update);

        tracing::info!(
            "[ARTIFACT] 插件 {} 已从 v{} 替换为 v{}",
            stored.id,
            current.version,
            stored.version
        );
        self.record(
            "info",
            &format!("替换 {} v{} -> v{}", stored.id, current.version, stored.version),
        ).await;

        if let Err(e) = started {
            tracing::error!("[ARTIFACT] 启动插件 {} 的实例失败: {}", stored.id, e);
            self.record("error", &format!("替换 {} 后启动实例失败: {}", stored.id, e)).await;
            return Err(instance_failure(&stored.id, e));
        }

        progress.on_progress(ReplaceProgress::complete(format!(
            "插件 {} 已更新到 v{}",
            stored.id, stored.version
        )));

        Ok(Accepted {
            outcome: InstallOutcome::Replaced,
            previous_version: Some(current.version),
            artifact: stored,
        })
    }

    /// 回退到旧版本并重启实例，返回最终要报告的错误
    ///
    /// 新文件保留在磁盘上
    async fn roll_back(
        &self,
        current: &Artifact,
        new_location: &Path,
        error: ArtifactError,
        progress: &dyn ProgressCallback,
    ) -> ArtifactError {
        tracing::warn!(
            "[ARTIFACT] 插件 {} 新版本 {} 加载失败，回退到 v{}: {}",
            current.id,
            new_location.display(),
            current.version,
            error
        );
        progress.on_progress(ReplaceProgress::reverting(format!(
            "回退到 v{}...",
            current.version
        )));

        let restored = match self.validator.load_definition(&current.location) {
            Ok(manifest) => {
                let digest = self.digest_or(&current.location, &current.digest);
                let restored = self
                    .registry
                    .register(current.rebind(manifest, current.location.clone(), &digest));
                self.record(
                    "warn",
                    &format!("替换 {} 失败，已回退到 v{}: {}", current.id, current.version, error),
                ).await;
                restored
            }
            Err(undo_err) => {
                let reason = format!("回退后旧版本无法加载: {}", undo_err);
                tracing::error!("[ARTIFACT] 插件 {} {}", current.id, reason);
                self.record("error", &format!("插件 {} 进入降级状态: {}", current.id, reason)).await;
                self.registry
                    .mark_degraded(&current.id, reason.clone())
                    .unwrap_or_else(|| {
                        let mut degraded = current.clone();
                        degraded.status = ArtifactStatus::Degraded { reason };
                        degraded
                    })
            }
        };

        progress.on_progress(ReplaceProgress::restarting("重启实例..."));
        match self.instances.start_instances(&restored).await {
            Ok(()) => error,
            Err(e) => {
                tracing::error!("[ARTIFACT] 回退后重启插件 {} 的实例失败: {}", current.id, e);
                error.with_note(format!("回退后重启实例失败: {}", e))
            }
        }
    }

    /// 删除插件
    pub async fn delete(&self, id: &str) -> Result<Deleted, ArtifactError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let current = self
            .registry
            .lookup(id)
            .ok_or_else(|| ArtifactError::NotFound(id.to_string()))?;
        if current.is_in_use() {
            return Err(ArtifactError::InUse {
                id: id.to_string(),
                instances: current.instances.len(),
            });
        }
        if !current.supports_replacement {
            return Err(ArtifactError::Unsupported(id.to_string()));
        }

        let removed = self.registry.unregister(id)?;
        let trashed_to = self.store.trash(&removed.location, TrashReason::Delete);

        tracing::info!("[ARTIFACT] 已删除插件 {} v{}", removed.id, removed.version);
        self.record("info", &format!("删除 {} v{}", removed.id, removed.version)).await;

        Ok(Deleted {
            id: removed.id,
            trashed_to,
        })
    }

    /// 从原文件重新加载插件
    ///
    /// 加载失败时标记为降级，实例保持停止
    pub async fn reload(&self, id: &str) -> Result<Artifact, ArtifactError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let current = self
            .registry
            .lookup(id)
            .ok_or_else(|| ArtifactError::NotFound(id.to_string()))?;

        if let Err(e) = self.instances.stop_instances(&current).await {
            tracing::error!("[ARTIFACT] 重载前停止插件 {} 的实例失败: {}", id, e);
            if let Err(start_err) = self.instances.start_instances(&current).await {
                tracing::error!("[ARTIFACT] 重启插件 {} 的实例失败: {}", id, start_err);
            }
            return Err(instance_failure(id, e));
        }

        let manifest = match self.validator.load_definition(&current.location) {
            Ok(manifest) => manifest,
            Err(e) => {
                tracing::error!("[ARTIFACT] 重载插件 {} 失败: {}", id, e);
                self.registry.mark_degraded(id, format!("重载失败: {}", e));
                self.record("error", &format!("重载 {} 失败，进入降级状态: {}", id, e)).await;
                return Err(e);
            }
        };

        let digest = self.digest_or(&current.location, &current.digest);
        let stored = self
            .registry
            .register(current.rebind(manifest, current.location.clone(), &digest));

        self.instances
            .start_instances(&stored)
            .await
            .map_err(|e| instance_failure(id, e))?;

        tracing::info!("[ARTIFACT] 已重载插件 {} v{}", stored.id, stored.version);
        self.record("info", &format!("重载 {} v{}", stored.id, stored.version)).await;
        Ok(stored)
    }

    /// 查询插件
    pub fn get(&self, id: &str) -> Result<Artifact, ArtifactError> {
        self.registry
            .lookup(id)
            .ok_or_else(|| ArtifactError::NotFound(id.to_string()))
    }

    /// 列出所有插件（按 ID 排序）
    pub fn list(&self) -> Vec<Artifact> {
        let mut artifacts = self.registry.enumerate();
        artifacts.sort_by(|a, b| a.id.cmp(&b.id));
        artifacts
    }

    /// 绑定实例
    pub fn attach_instance(&self, id: &str, instance: InstanceId) -> Result<(), ArtifactError> {
        self.registry.bind_instance(id, instance)
    }

    /// 解绑实例
    pub fn detach_instance(&self, id: &str, instance: &InstanceId) -> Result<bool, ArtifactError> {
        self.registry.unbind_instance(id, instance)
    }

    /// 启动插件的全部实例
    pub async fn start_instances(&self, id: &str) -> Result<(), ArtifactError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let artifact = self.get(id)?;
        if let ArtifactStatus::Degraded { reason } = &artifact.status {
            return Err(ArtifactError::invalid(format!(
                "插件 {} 处于降级状态: {}",
                id, reason
            )));
        }
        self.instances
            .start_instances(&artifact)
            .await
            .map_err(|e| instance_failure(id, e))
    }

    /// 停止插件的全部实例
    pub async fn stop_instances(&self, id: &str) -> Result<(), ArtifactError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let artifact = self.get(id)?;
        self.instances
            .stop_instances(&artifact)
            .await
            .map_err(|e| instance_failure(id, e))
    }

    /// 启动时扫描插件目录
    ///
    /// 上传目录中无效或 ID 冲突的文件会被回收，只读目录中的问题只记录日志。
    /// 已注册的文件保持不变，可重复调用。返回本次注册的插件。
    pub fn load_existing(&self) -> Result<Vec<Artifact>, ArtifactError> {
        let mut loaded = Vec::new();

        for blob in self.store.blobs()? {
            if let Some(artifact) = self.load_blob(&blob, true) {
                loaded.push(artifact);
            }
        }

        for dir in &self.load_dirs {
            for blob in list_blobs(dir, self.store.extension())? {
                if let Some(artifact) = self.load_blob(&blob, false) {
                    loaded.push(artifact);
                }
            }
        }

        tracing::info!("[ARTIFACT] 启动扫描完成，加载 {} 个插件", loaded.len());
        Ok(loaded)
    }

    fn load_blob(&self, blob: &Path, replaceable: bool) -> Option<Artifact> {
        // 已注册的文件（之前扫描或上传过）保持原样
        if let Some(current) = self
            .registry
            .enumerate()
            .into_iter()
            .find(|artifact| artifact.location == blob)
        {
            tracing::debug!(
                "[ARTIFACT] {} 已作为插件 {} 注册，跳过",
                blob.display(),
                current.id
            );
            return None;
        }

        let manifest = match self.validator.load_definition(blob) {
            Ok(manifest) => manifest,
            Err(e) => {
                tracing::warn!("[ARTIFACT] 无法加载 {}: {}", blob.display(), e);
                if replaceable {
                    self.store.trash(blob, TrashReason::Error);
                }
                return None;
            }
        };

        if let Some(existing) = self.registry.lookup(&manifest.id) {
            tracing::warn!(
                "[ARTIFACT] {} 与已加载的插件 {} ({}) ID 冲突",
                blob.display(),
                existing.id,
                existing.location.display()
            );
            if replaceable {
                self.store.trash(blob, TrashReason::Conflict);
            }
            return None;
        }

        let digest = self.digest_or(blob, "");
        let artifact = self.registry.register(
            Artifact::new(manifest, blob.to_path_buf(), digest).with_replacement(replaceable),
        );
        tracing::debug!(
            "[ARTIFACT] 已加载插件 {} v{} ({})",
            artifact.id,
            artifact.version,
            blob.display()
        );
        Some(artifact)
    }

    fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        self.locks.entry(id.to_string()).or_default().clone()
    }

    fn digest_or(&self, location: &Path, fallback: &str) -> String {
        digest_file(location).unwrap_or_else(|e| {
            tracing::warn!("[ARTIFACT] 无法计算 {} 的摘要: {}", location.display(), e);
            fallback.to_string()
        })
    }

    async fn record(&self, level: &str, message: &str) {
        self.journal.write().await.add(level, message);
    }
}

fn instance_failure(id: &str, error: InstanceError) -> ArtifactError {
    ArtifactError::InstanceFailure {
        id: id.to_string(),
        message: error.to_string(),
    }
}
