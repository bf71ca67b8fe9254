//! A derive macro for the `Event` trait in the `cqrs-core` crate.
use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, Data, DeriveInput, Fields, Lit, Meta};

/// Per-variant (or container-level) `#[event(version = .., source = ..)]`
/// overrides collected while walking the derive input.
#[derive(Default, Clone)]
struct EventAttrs {
    version: Option<u16>,
    source: Option<String>,
}

fn parse_event_attrs(attrs: &[syn::Attribute]) -> EventAttrs {
    let mut out = EventAttrs::default();
    for attr in attrs {
        if !attr.path().is_ident("event") {
            continue;
        }
        let Meta::List(list) = &attr.meta else {
            continue;
        };
        let _ = list.parse_nested_meta(|meta| {
            if meta.path.is_ident("version") {
                let value = meta.value()?;
                let lit: Lit = value.parse()?;
                if let Lit::Int(i) = lit {
                    out.version = Some(i.base10_parse()?);
                }
            } else if meta.path.is_ident("source") {
                let value = meta.value()?;
                let lit: Lit = value.parse()?;
                if let Lit::Str(s) = lit {
                    out.source = Some(s.value());
                }
            }
            Ok(())
        });
    }
    out
}

/// Derives the `Event` trait for an enum.
///
/// The variant name becomes `event_type()`. The schema version and
/// CloudEvents source default to `1` and `"urn:cqrs-core:event"`
/// respectively, and can be overridden at the container level or per
/// variant with `#[event(version = N, source = "urn:...")]` — a per-variant
/// attribute takes precedence over the container-level one.
#[proc_macro_derive(Event, attributes(event))]
pub fn event_derive(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let name = &input.ident;

    let container_attrs = parse_event_attrs(&input.attrs);

    let variants = match &input.data {
        Data::Enum(data) => &data.variants,
        _ => panic!("Event derive macro can only be used on enums"),
    };

    let event_type_arms = variants.iter().map(|variant| {
        let variant_name = &variant.ident;
        let fields = match &variant.fields {
            Fields::Named(_) => quote! { { .. } },
            Fields::Unnamed(_) => quote! { (..) },
            Fields::Unit => quote! {},
        };
        quote! {
            #name::#variant_name #fields => stringify!(#variant_name)
        }
    });

    let version_arms = variants.iter().map(|variant| {
        let variant_name = &variant.ident;
        let fields = match &variant.fields {
            Fields::Named(_) => quote! { { .. } },
            Fields::Unnamed(_) => quote! { (..) },
            Fields::Unit => quote! {},
        };
        let variant_attrs = parse_event_attrs(&variant.attrs);
        let version = variant_attrs.version.or(container_attrs.version).unwrap_or(1);
        quote! {
            #name::#variant_name #fields => #version
        }
    });

    let source_arms = variants.iter().map(|variant| {
        let variant_name = &variant.ident;
        let fields = match &variant.fields {
            Fields::Named(_) => quote! { { .. } },
            Fields::Unnamed(_) => quote! { (..) },
            Fields::Unit => quote! {},
        };
        let variant_attrs = parse_event_attrs(&variant.attrs);
        let source = variant_attrs
            .source
            .or_else(|| container_attrs.source.clone())
            .unwrap_or_else(|| "urn:cqrs-core:event".to_string());
        quote! {
            #name::#variant_name #fields => #source
        }
    });

    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let expanded = quote! {
        impl #impl_generics cqrs_core::Event for #name #ty_generics #where_clause {
            fn event_type(&self) -> &'static str {
                match self {
                    #(#event_type_arms),*
                }
            }

            fn event_version(&self) -> u16 {
                match self {
                    #(#version_arms),*
                }
            }

            fn event_source(&self) -> &'static str {
                match self {
                    #(#source_arms),*
                }
            }
        }
    };

    TokenStream::from(expanded)
}
