//! evflow 过程宏
//!
//! 目前只提供 `#[identifier]`：为单字段 tuple struct 形式的标识符类型
//! （如 `struct TenantId(Uuid);`、`struct PartitionId(String);`）补齐派生与常用转换。
//!
use proc_macro::TokenStream;

mod derives;
mod identifier;

/// 标识符宏
///
/// - 合并/追加派生：Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord,
///   serde::Serialize, serde::Deserialize（已有的派生会被保留且去重）
/// - 生成 `const fn new`、`value()`、`Display`、`FromStr`、`AsRef` 与双向 `From`
/// - 参数：`#[identifier(debug = false)]` 关闭 `Debug` 派生，便于手写脱敏实现
#[proc_macro_attribute]
pub fn identifier(attr: TokenStream, item: TokenStream) -> TokenStream {
    identifier::expand(attr, item)
}
