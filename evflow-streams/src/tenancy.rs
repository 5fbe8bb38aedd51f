//! 租户列表
//!
use crate::ids::TenantId;

/// 当前运行时服务的全部租户（租户管理不在本系统范围内）
pub trait Tenants: Send + Sync {
    fn all(&self) -> Vec<TenantId>;
}

/// 固定租户列表
#[derive(Debug, Clone, Default)]
pub struct StaticTenants(Vec<TenantId>);

impl StaticTenants {
    pub fn new(tenants: impl IntoIterator<Item = TenantId>) -> Self {
        Self(tenants.into_iter().collect())
    }
}

impl Tenants for StaticTenants {
    fn all(&self) -> Vec<TenantId> {
        self.0.clone()
    }
}
