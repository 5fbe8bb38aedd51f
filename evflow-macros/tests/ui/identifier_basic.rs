use evflow_macros::identifier;
use std::collections::BTreeSet;
use uuid::Uuid;

#[identifier]
#[derive(Copy)]
struct TenantId(Uuid);

#[identifier]
struct PartitionId(String);

const DEVELOPMENT: TenantId = TenantId::new(Uuid::nil());

fn main() {
    let raw = Uuid::new_v4();
    let tenant = TenantId::new(raw);
    let copied = tenant;
    assert_eq!(tenant, copied);
    assert_eq!(tenant.to_string(), raw.to_string());
    assert_eq!(*tenant.value(), raw);
    assert_eq!(DEVELOPMENT, TenantId::default());

    let parsed: TenantId = raw.to_string().parse().unwrap();
    assert_eq!(parsed, tenant);
    let back: Uuid = parsed.into();
    assert_eq!(back, raw);

    let partition = PartitionId::from("order-1".to_string());
    assert_eq!(partition.as_ref(), "order-1");
    assert_eq!(format!("{partition:?}"), "PartitionId(\"order-1\")");

    let json = serde_json::to_string(&partition).unwrap();
    assert_eq!(json, "\"order-1\"");
    let restored: PartitionId = serde_json::from_str(&json).unwrap();
    assert_eq!(restored, partition);

    let ordered: BTreeSet<PartitionId> = ["b", "a"].iter().map(|s| PartitionId::new(s.to_string())).collect();
    assert_eq!(ordered.iter().next().map(|p| p.value().as_str()), Some("a"));
}
