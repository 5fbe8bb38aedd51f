//! 执行上下文（ExecutionContext）
//!
//! 随连接参数与每个请求一起传递，标识调用所属的微服务、租户与链路。
//! 引擎以其运行的租户覆写上下文中的 `tenant`。
//!
use crate::ids::{MicroserviceId, TenantId};
use bon::Builder;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Builder, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionContext {
    microservice: MicroserviceId,
    tenant: TenantId,
    /// 关联 ID，缺省时新生成
    #[builder(default = Uuid::new_v4())]
    correlation_id: Uuid,
    #[builder(default = "development".to_string(), into)]
    environment: String,
}

impl ExecutionContext {
    pub fn microservice(&self) -> MicroserviceId {
        self.microservice
    }

    pub fn tenant(&self) -> TenantId {
        self.tenant
    }

    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// 同一上下文切换到另一个租户
    pub fn for_tenant(&self, tenant: TenantId) -> Self {
        Self {
            tenant,
            ..self.clone()
        }
    }
}
