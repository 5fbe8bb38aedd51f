use evflow_macros::identifier;

#[identifier(debug = false)]
struct SecretId(String);

impl std::fmt::Debug for SecretId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretId(..)")
    }
}

fn main() {
    let id = SecretId::new("very-secret".into());
    assert_eq!(format!("{id:?}"), "SecretId(..)");
    assert_eq!(id.to_string(), "very-secret");
}
