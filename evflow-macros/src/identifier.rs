use crate::derives::DeriveSet;
use proc_macro::TokenStream;
use quote::quote;
use syn::punctuated::Punctuated;
use syn::spanned::Spanned;
use syn::{Item, Result, Token, parse::Parse, parse::ParseStream, parse_macro_input};

pub(crate) fn expand(attr: TokenStream, item: TokenStream) -> TokenStream {
    let cfg = parse_macro_input!(attr as IdentifierAttrConfig);
    let input = parse_macro_input!(item as Item);

    let mut st = match input {
        Item::Struct(s) => s,
        other => {
            return syn::Error::new(other.span(), "#[identifier] only on struct")
                .to_compile_error()
                .into();
        }
    };

    let inner_ty = match &st.fields {
        syn::Fields::Unnamed(f) if f.unnamed.len() == 1 => f.unnamed[0].ty.clone(),
        syn::Fields::Unnamed(f) => {
            return syn::Error::new(
                f.span(),
                "#[identifier] requires a tuple struct with exactly one field",
            )
            .to_compile_error()
            .into();
        }
        _ => {
            return syn::Error::new(
                st.span(),
                "#[identifier] supports only tuple struct, e.g., struct TenantId(Uuid);",
            )
            .to_compile_error()
            .into();
        }
    };

    let mut required: Vec<syn::Path> = vec![
        syn::parse_quote!(Clone),
        syn::parse_quote!(Default),
        syn::parse_quote!(PartialEq),
        syn::parse_quote!(Eq),
        syn::parse_quote!(Hash),
        syn::parse_quote!(PartialOrd),
        syn::parse_quote!(Ord),
        syn::parse_quote!(serde::Serialize),
        syn::parse_quote!(serde::Deserialize),
    ];
    if cfg.derive_debug {
        required.insert(1, syn::parse_quote!(Debug));
    }
    st.attrs = DeriveSet::new(required).merge_into(&st.attrs);

    let ident = &st.ident;
    let (impl_generics, ty_generics, where_clause) = st.generics.split_for_impl();

    let out = quote! {
        #st

        impl #impl_generics #ident #ty_generics #where_clause {
            pub const fn new(value: #inner_ty) -> Self { Self(value) }

            pub fn value(&self) -> &#inner_ty { &self.0 }
        }

        impl #impl_generics ::std::str::FromStr for #ident #ty_generics #where_clause
        where #inner_ty: ::std::str::FromStr
        {
            type Err = <#inner_ty as ::std::str::FromStr>::Err;
            fn from_str(s: &str) -> ::std::result::Result<Self, Self::Err> {
                ::std::result::Result::Ok(Self(s.parse()?))
            }
        }

        impl #impl_generics ::std::fmt::Display for #ident #ty_generics #where_clause
        where #inner_ty: ::std::fmt::Display
        {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                ::std::fmt::Display::fmt(&self.0, f)
            }
        }

        impl #impl_generics ::core::convert::AsRef<#inner_ty> for #ident #ty_generics #where_clause {
            fn as_ref(&self) -> &#inner_ty { &self.0 }
        }

        impl #impl_generics ::core::convert::From<#inner_ty> for #ident #ty_generics #where_clause {
            fn from(value: #inner_ty) -> Self { Self(value) }
        }

        impl #impl_generics ::core::convert::From<#ident #ty_generics> for #inner_ty #where_clause {
            fn from(value: #ident #ty_generics) -> Self { value.0 }
        }
    };

    TokenStream::from(out)
}

struct IdentifierAttrConfig {
    derive_debug: bool,
}

impl Parse for IdentifierAttrConfig {
    fn parse(input: ParseStream) -> Result<Self> {
        let mut derive_debug: Option<bool> = None;

        let pairs: Punctuated<syn::MetaNameValue, Token![,]> =
            Punctuated::parse_terminated(input)?;
        for kv in pairs {
            if !kv.path.is_ident("debug") {
                return Err(syn::Error::new(
                    kv.path.span(),
                    "unknown key in attribute; expected 'debug'",
                ));
            }
            if derive_debug.is_some() {
                return Err(syn::Error::new(
                    kv.path.span(),
                    "duplicate key 'debug' in attribute",
                ));
            }
            match kv.value {
                syn::Expr::Lit(syn::ExprLit {
                    lit: syn::Lit::Bool(b),
                    ..
                }) => derive_debug = Some(b.value()),
                other => {
                    return Err(syn::Error::new(
                        other.span(),
                        "expected boolean literal for 'debug'",
                    ));
                }
            }
        }

        Ok(Self {
            derive_debug: derive_debug.unwrap_or(true),
        })
    }
}
