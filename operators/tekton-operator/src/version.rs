//! 插件版本解析模块
//!
//! 把插件请求的版本解析为具体的发布标签：显式指定的版本必须存在于发布目录中，
//! 未指定时取目录中按发布版本排序最大的一个。

use std::collections::BTreeMap;
use std::sync::Arc;
use tekton_common::{Error, ReleaseVersion, Result};
use tracing::debug;

/// 插件发布目录
pub trait ReleaseCatalog: Send + Sync {
    /// 插件的全部已发布版本
    fn releases(&self, addon: &str) -> Vec<ReleaseVersion>;
}

/// 静态发布目录，内容来自 Operator 配置
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    releases: BTreeMap<String, Vec<ReleaseVersion>>,
}

impl StaticCatalog {
    /// 由插件名到版本标签列表的映射构建目录
    pub fn new(entries: BTreeMap<String, Vec<String>>) -> Result<Self> {
        let mut releases = BTreeMap::new();
        for (addon, tags) in entries {
            let mut versions = tags
                .iter()
                .map(|tag| tag.parse::<ReleaseVersion>())
                .collect::<Result<Vec<_>>>()?;
            versions.sort();
            versions.dedup();
            releases.insert(addon, versions);
        }
        Ok(Self { releases })
    }
}

impl ReleaseCatalog for StaticCatalog {
    fn releases(&self, addon: &str) -> Vec<ReleaseVersion> {
        self.releases.get(addon).cloned().unwrap_or_default()
    }
}

/// 版本解析器
#[derive(Clone)]
pub struct VersionResolver {
    catalog: Arc<dyn ReleaseCatalog>,
}

impl VersionResolver {
    pub fn new(catalog: Arc<dyn ReleaseCatalog>) -> Self {
        Self { catalog }
    }

    /// 解析插件版本
    ///
    /// 对同一目录和同一请求，结果总是相同。
    pub fn resolve(&self, addon: &str, requested: Option<&str>) -> Result<String> {
        let releases = self.catalog.releases(addon);

        let resolved = match requested.map(str::trim).filter(|v| !v.is_empty()) {
            Some(requested) => releases
                .iter()
                .find(|v| v.tag() == requested)
                .map(|v| v.tag().to_string())
                .ok_or_else(|| Error::VersionNotFound {
                    addon: addon.to_string(),
                    version: requested.to_string(),
                })?,
            None => releases
                .iter()
                .max()
                .map(|v| v.tag().to_string())
                .ok_or_else(|| Error::NoVersionsAvailable(addon.to_string()))?,
        };

        debug!(addon = %addon, requested = ?requested, resolved = %resolved, "解析插件版本");
        Ok(resolved)
    }
}
