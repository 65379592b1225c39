//! Derive support for layered configuration structs.
//!
//! `#[derive(LayeredConfig)]` generates, for a struct of `Option<T>` fields:
//! * `Overlay`: field-wise merge where the top layer wins.
//! * `ApplyDefaults`: fills empty fields from `#[layered(default = ...)]`.
//! * `TryFrom<Args> for Target` when `#[layered(try_into = "Target")]` is set,
//!   unwrapping defaulted fields and rejecting missing required ones.

use proc_macro::TokenStream;
use quote::{quote, quote_spanned};
use syn::spanned::Spanned;
use syn::{
    Attribute, Data, DeriveInput, Expr, ExprLit, Field, Fields, Lit, Meta, Type,
    parse_macro_input,
};

#[proc_macro_derive(LayeredConfig, attributes(layered))]
pub fn derive_layered_config(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    if let Err(e) = validate_attributes(&input.data) {
        return e.into_compile_error().into();
    }

    let struct_name = input.ident;
    let overlay_logic = overlay_body(&input.data);
    let defaults_logic = defaults_body(&input.data);

    let target = input.attrs.iter().find_map(|attr| match layered_meta(attr)? {
        Meta::NameValue(nv) if nv.path.is_ident("try_into") => match nv.value {
            Expr::Lit(ExprLit {
                lit: Lit::Str(s), ..
            }) => s.parse::<syn::Path>().ok(),
            _ => None,
        },
        _ => None,
    });

    let try_from_impl = match target {
        Some(target) => {
            let mapping = try_from_body(&input.data);
            quote! {
                #[automatically_derived]
                impl TryFrom<#struct_name> for #target {
                    type Error = crate::error::NfsVolError;

                    fn try_from(args: #struct_name) -> Result<Self, Self::Error> {
                        let args = <#struct_name as crate::config::ApplyDefaults>::apply_defaults(args);
                        Ok(Self {
                            #mapping
                        })
                    }
                }
            }
        }
        None => quote! {},
    };

    let expanded = quote! {
        #[automatically_derived]
        impl crate::config::Overlay for #struct_name {
            fn overlay(self, top: Self) -> Self {
                #overlay_logic
            }
        }

        #[automatically_derived]
        impl crate::config::ApplyDefaults for #struct_name {
            fn apply_defaults(self) -> Self {
                #defaults_logic
            }
        }

        #try_from_impl
    };

    TokenStream::from(expanded)
}

/// Parses `#[layered(...)]` into its single inner meta item.
fn layered_meta(attr: &Attribute) -> Option<Meta> {
    if !attr.path().is_ident("layered") {
        return None;
    }
    attr.parse_args::<Meta>().ok()
}

fn has_layered_flag(field: &Field, flag: &str) -> bool {
    field
        .attrs
        .iter()
        .filter_map(layered_meta)
        .any(|m| matches!(m, Meta::Path(p) if p.is_ident(flag)))
}

fn layered_default(field: &Field) -> Option<Expr> {
    field
        .attrs
        .iter()
        .filter_map(layered_meta)
        .find_map(|m| match m {
            Meta::NameValue(nv) if nv.path.is_ident("default") => Some(nv.value),
            _ => None,
        })
}

fn named_fields(data: &Data) -> Option<&syn::FieldsNamed> {
    match data {
        Data::Struct(s) => match &s.fields {
            Fields::Named(named) => Some(named),
            _ => None,
        },
        _ => None,
    }
}

fn overlay_body(data: &Data) -> proc_macro2::TokenStream {
    let Data::Struct(struct_data) = data else {
        panic!("#[derive(LayeredConfig)] only works on structs");
    };
    match &struct_data.fields {
        Fields::Named(fields) => {
            let merged = fields.named.iter().map(|f| {
                let name = &f.ident;
                quote_spanned! {f.span()=>
                    #name: self.#name.overlay(top.#name)
                }
            });
            quote! { Self { #(#merged),* } }
        }
        Fields::Unnamed(fields) => {
            let merged = fields.unnamed.iter().enumerate().map(|(i, f)| {
                let index = syn::Index::from(i);
                quote_spanned! {f.span()=>
                    self.#index.overlay(top.#index)
                }
            });
            quote! { Self( #(#merged),* ) }
        }
        Fields::Unit => quote! { Self },
    }
}

fn defaults_body(data: &Data) -> proc_macro2::TokenStream {
    let Some(fields) = named_fields(data) else {
        return quote! { self };
    };

    let filled = fields.named.iter().map(|f| {
        let name = &f.ident;
        match layered_default(f) {
            // String literals go through FromStr so paths, enums and numbers
            // can all be written the way a user would type them.
            Some(expr @ Expr::Lit(ExprLit {
                lit: Lit::Str(_), ..
            })) => quote_spanned! {f.span()=>
                #name: self.#name.or_else(|| Some(
                    #expr.parse().expect(concat!("nfsvol: invalid default value for field '", stringify!(#name), "'"))
                ))
            },
            Some(expr) => quote_spanned! {f.span()=>
                #name: self.#name.or_else(|| {
                    #[allow(clippy::useless_conversion)]
                    Some((#expr).into())
                })
            },
            None => quote_spanned! {f.span()=> #name: self.#name },
        }
    });
    quote! { Self { #(#filled),* } }
}

fn try_from_body(data: &Data) -> proc_macro2::TokenStream {
    let Some(fields) = named_fields(data) else {
        return quote! {};
    };

    let mapped = fields.named.iter().filter_map(|f| {
        let name = &f.ident;

        if has_layered_flag(f, "skip") {
            return None;
        }

        let is_option = match &f.ty {
            Type::Path(tp) => tp
                .path
                .segments
                .last()
                .is_some_and(|s| s.ident == "Option"),
            _ => false,
        };

        if !is_option {
            let flattened = ["command", "clap", "arg", "serde"]
                .iter()
                .any(|key| has_attribute(&f.attrs, key, "flatten"));
            let conversion = if flattened || has_layered_flag(f, "try_into") {
                quote!(.try_into()?)
            } else {
                quote!()
            };
            return Some(quote_spanned! {f.span()=>
                #name: args.#name #conversion
            });
        }

        if has_layered_flag(f, "optional") {
            Some(quote_spanned! {f.span()=>
                #name: args.#name
            })
        } else if layered_default(f).is_some() {
            Some(quote_spanned! {f.span()=>
                #name: args.#name.expect(concat!("nfsvol: default missing for ", stringify!(#name)))
            })
        } else {
            let msg = format!(
                "missing required configuration field: {}",
                name.as_ref().map(|n| n.to_string()).unwrap_or_default()
            );
            Some(quote_spanned! {f.span()=>
                #name: args.#name.ok_or_else(|| crate::config::ConfigError::Validation(#msg.into()))?
            })
        }
    });
    quote! { #(#mapped),* }
}

fn validate_attributes(data: &Data) -> syn::Result<()> {
    let Some(fields) = named_fields(data) else {
        return Ok(());
    };

    for field in &fields.named {
        let clap_flatten = ["command", "clap", "arg"]
            .iter()
            .any(|k| has_attribute(&field.attrs, k, "flatten"));
        let serde_flatten = has_attribute(&field.attrs, "serde", "flatten");

        if !has_layered_flag(field, "allow_mismatched_flatten") && clap_flatten != serde_flatten {
            return Err(syn::Error::new(
                field.span(),
                "nfsvol: `flatten` must be set on both clap and serde.\n\
                 Add the missing attribute or use #[layered(allow_mismatched_flatten)].",
            ));
        }

        // A clap default is applied before the config file is read and would
        // shadow it.
        let clap_default = ["clap", "arg"].iter().any(|k| {
            has_attribute(&field.attrs, k, "default_value")
                || has_attribute(&field.attrs, k, "default_value_t")
        });
        if clap_default {
            return Err(syn::Error::new(
                field.span(),
                "nfsvol: do not use clap `default_value`; use #[layered(default = ...)] instead.",
            ));
        }
    }
    Ok(())
}

fn has_attribute(attrs: &[Attribute], path_ident: &str, nested_ident: &str) -> bool {
    attrs.iter().any(|attr| {
        if !attr.path().is_ident(path_ident) {
            return false;
        }
        let mut found = false;
        let _ = attr.parse_nested_meta(|meta| {
            if meta.path.is_ident(nested_ident) {
                found = true;
            }
            // Skip over `= value` so later items are still visited.
            if meta.input.peek(syn::Token![=]) {
                let _: Expr = meta.value()?.parse()?;
            }
            Ok(())
        });
        found
    })
}
