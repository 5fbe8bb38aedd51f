use quote::ToTokens;
use std::collections::HashSet;
use syn::punctuated::Punctuated;
use syn::{Attribute, Path, Token};

/// 待合并的派生集合，以末段名称去重（`Serialize` 与 `serde::Serialize` 视为同一项）
pub(crate) struct DeriveSet {
    seen: HashSet<String>,
    paths: Vec<Path>,
}

impl DeriveSet {
    pub(crate) fn new(required: impl IntoIterator<Item = Path>) -> Self {
        let mut set = Self {
            seen: HashSet::new(),
            paths: Vec::new(),
        };
        for p in required {
            set.push(p);
        }
        set
    }

    fn push(&mut self, path: Path) {
        let key = path
            .segments
            .last()
            .map(|s| s.ident.to_string())
            .unwrap_or_else(|| path.to_token_stream().to_string());
        if self.seen.insert(key) {
            self.paths.push(path);
        }
    }

    /// 吸收条目上已有的 `#[derive(...)]`，返回合并后的属性列表（derive 置于最前）
    pub(crate) fn merge_into(mut self, attrs: &[Attribute]) -> Vec<Attribute> {
        let mut others = Vec::with_capacity(attrs.len());
        for attr in attrs {
            if !attr.path().is_ident("derive") {
                others.push(attr.clone());
                continue;
            }
            if let Ok(list) = attr.parse_args_with(Punctuated::<Path, Token![,]>::parse_terminated)
            {
                for p in list {
                    self.push(p);
                }
            }
        }

        let paths = self.paths;
        let derive: Attribute = syn::parse_quote!(#[derive(#(#paths),*)]);
        std::iter::once(derive).chain(others).collect()
    }
}
