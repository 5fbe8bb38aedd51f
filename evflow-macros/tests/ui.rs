#[test]
fn identifier_expansions_compile_and_behave() {
    let t = trybuild::TestCases::new();
    t.pass("tests/ui/identifier_basic.rs");
    t.pass("tests/ui/identifier_without_debug.rs");
}
