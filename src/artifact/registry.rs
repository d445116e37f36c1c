//! 插件注册表
//!
//! 进程内 "当前安装了哪些插件" 的唯一来源：插件 ID → 当前激活的插件及其实例集合。
//! 所有修改同步生效，随后的查询立即可见。

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::types::{Artifact, ArtifactError, ArtifactStatus, InstanceId};

/// 插件注册表
#[derive(Default)]
pub struct ArtifactRegistry {
    entries: DashMap<String, Artifact>,
}

impl ArtifactRegistry {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// 查询插件
    pub fn lookup(&self, id: &str) -> Option<Artifact> {
        self.entries.get(id).map(|entry| entry.value().clone())
    }

    /// 当前所有插件的快照（顺序无意义）
    pub fn enumerate(&self) -> Vec<Artifact> {
        self.entries
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// 注册或替换插件
    ///
    /// 已有条目时沿用其实例集合和安装时间，返回最终保存的插件
    pub fn register(&self, artifact: Artifact) -> Artifact {
        match self.entries.entry(artifact.id.clone()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get();
                let mut artifact = artifact;
                artifact.instances = current.instances.clone();
                artifact.installed_at = current.installed_at;
                occupied.insert(artifact.clone());
                artifact
            }
            Entry::Vacant(vacant) => {
                vacant.insert(artifact.clone());
                artifact
            }
        }
    }

    /// 注销插件
    ///
    /// 仍有实例时返回 InUse，不做任何修改
    pub fn unregister(&self, id: &str) -> Result<Artifact, ArtifactError> {
        if let Some((_, removed)) = self.entries.remove_if(id, |_, artifact| !artifact.is_in_use()) {
            return Ok(removed);
        }
        match self.entries.get(id) {
            Some(entry) => Err(ArtifactError::InUse {
                id: id.to_string(),
                instances: entry.instances.len(),
            }),
            None => Err(ArtifactError::NotFound(id.to_string())),
        }
    }

    /// 绑定实例
    pub fn bind_instance(&self, id: &str, instance: InstanceId) -> Result<(), ArtifactError> {
        let mut entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| ArtifactError::NotFound(id.to_string()))?;
        entry.instances.insert(instance);
        Ok(())
    }

    /// 解绑实例，返回实例是否原本存在
    pub fn unbind_instance(&self, id: &str, instance: &InstanceId) -> Result<bool, ArtifactError> {
        let mut entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| ArtifactError::NotFound(id.to_string()))?;
        Ok(entry.instances.remove(instance))
    }

    /// 标记为降级状态，返回标记后的插件
    pub fn mark_degraded(&self, id: &str, reason: impl Into<String>) -> Option<Artifact> {
        let mut entry = self.entries.get_mut(id)?;
        entry.status = ArtifactStatus::Degraded {
            reason: reason.into(),
        };
        Some(entry.value().clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::manifest::ArtifactManifest;
    use std::path::PathBuf;

    fn artifact(id: &str, version: &str) -> Artifact {
        Artifact::new(
            ArtifactManifest::minimal(id, version),
            PathBuf::from(format!("{}-v{}.zip", id, version)),
            "digest",
        )
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = ArtifactRegistry::new();
        assert!(registry.lookup("demo").is_none());

        registry.register(artifact("demo", "1.0"));
        let found = registry.lookup("demo").unwrap();
        assert_eq!(found.version, "1.0");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_register_preserves_instances() {
        let registry = ArtifactRegistry::new();
        let original = registry.register(artifact("demo", "1.0"));
        registry
            .bind_instance("demo", InstanceId::new("bot-a"))
            .unwrap();
        registry
            .bind_instance("demo", InstanceId::new("bot-b"))
            .unwrap();

        // 新条目不带实例，注册后应沿用旧实例
        let stored = registry.register(artifact("demo", "2.0"));
        assert_eq!(stored.version, "2.0");
        assert_eq!(stored.instances.len(), 2);
        assert_eq!(stored.installed_at, original.installed_at);
        assert_eq!(registry.lookup("demo").unwrap().instances.len(), 2);
    }

    #[test]
    fn test_unregister_in_use() {
        let registry = ArtifactRegistry::new();
        registry.register(artifact("demo", "1.0"));
        registry
            .bind_instance("demo", InstanceId::new("bot-a"))
            .unwrap();

        match registry.unregister("demo") {
            Err(ArtifactError::InUse { id, instances }) => {
                assert_eq!(id, "demo");
                assert_eq!(instances, 1);
            }
            other => panic!("期望 InUse 错误，实际: {:?}", other.map(|a| a.id)),
        }
        assert!(registry.contains("demo"));

        assert!(registry
            .unbind_instance("demo", &InstanceId::new("bot-a"))
            .unwrap());
        let removed = registry.unregister("demo").unwrap();
        assert_eq!(removed.id, "demo");
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unregister_not_found() {
        let registry = ArtifactRegistry::new();
        assert!(matches!(
            registry.unregister("missing"),
            Err(ArtifactError::NotFound(id)) if id == "missing"
        ));
    }

    #[test]
    fn test_bind_instance_unknown_artifact() {
        let registry = ArtifactRegistry::new();
        let result = registry.bind_instance("missing", InstanceId::generate());
        assert!(matches!(result, Err(ArtifactError::NotFound(_))));
    }

    #[test]
    fn test_mark_degraded() {
        let registry = ArtifactRegistry::new();
        registry.register(artifact("demo", "1.0"));
        let marked = registry.mark_degraded("demo", "旧版本无法加载").unwrap();
        assert!(marked.status.is_degraded());
        assert!(registry.lookup("demo").unwrap().status.is_degraded());

        // 重新注册恢复正常
        registry.register(artifact("demo", "1.0"));
        assert_eq!(registry.lookup("demo").unwrap().status, ArtifactStatus::Active);

        assert!(registry.mark_degraded("missing", "x").is_none());
    }

    #[test]
    fn test_enumerate_snapshot() {
        let registry = ArtifactRegistry::new();
        registry.register(artifact("a", "1.0"));
        registry.register(artifact("b", "1.0"));
        let mut ids: Vec<String> = registry.enumerate().into_iter().map(|a| a.id).collect();
        ids.sort();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }
}
