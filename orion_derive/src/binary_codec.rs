//! Expansion of `#[derive(BinaryCodec)]`.
//!
//! Fields are written in declaration order. Enums are prefixed with a `u8`
//! tag equal to the variant's position, so reordering variants changes the
//! wire format. Explicit discriminants and unions are rejected.

use proc_macro::TokenStream;
use proc_macro2::{Ident, TokenStream as TokenStream2};
use quote::{format_ident, quote};
use syn::{Data, DeriveInput, Fields, parse_macro_input};

pub fn expand(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    match expand_input(&input) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

fn expand_input(input: &DeriveInput) -> syn::Result<TokenStream2> {
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let (encode_body, decode_body) = match &input.data {
        Data::Struct(data) => {
            let shape = Shape::of(&data.fields);
            let pattern = &shape.pattern;
            let writes = shape.writes();
            let build = &shape.build;
            (
                quote! {
                    let Self #pattern = self;
                    #writes
                },
                quote! { Ok(Self #build) },
            )
        }
        Data::Enum(data) => {
            if data.variants.len() > usize::from(u8::MAX) + 1 {
                return Err(syn::Error::new_spanned(
                    name,
                    "BinaryCodec enums are limited to 256 variants",
                ));
            }

            let mut encode_arms = Vec::with_capacity(data.variants.len());
            let mut decode_arms = Vec::with_capacity(data.variants.len());
            for (tag, variant) in data.variants.iter().enumerate() {
                if let Some((_, expr)) = &variant.discriminant {
                    return Err(syn::Error::new_spanned(
                        expr,
                        "BinaryCodec assigns tags by position; remove the explicit discriminant",
                    ));
                }
                let tag = tag as u8;
                let ident = &variant.ident;
                let shape = Shape::of(&variant.fields);
                let pattern = &shape.pattern;
                let writes = shape.writes();
                let build = &shape.build;

                encode_arms.push(quote! {
                    Self::#ident #pattern => {
                        crate::types::encoding::Encode::encode(&#tag, out);
                        #writes
                    }
                });
                decode_arms.push(quote! {
                    #tag => Ok(Self::#ident #build),
                });
            }

            (
                quote! {
                    match self {
                        #(#encode_arms)*
                    }
                },
                quote! {
                    let tag: u8 = crate::types::encoding::Decode::decode(input)?;
                    match tag {
                        #(#decode_arms)*
                        other => Err(crate::types::encoding::DecodeError::UnknownTag(other)),
                    }
                },
            )
        }
        Data::Union(_) => {
            return Err(syn::Error::new_spanned(
                input,
                "BinaryCodec cannot be derived for unions",
            ));
        }
    };

    Ok(quote! {
        impl #impl_generics crate::types::encoding::Encode for #name #ty_generics #where_clause {
            #[allow(unused_variables)]
            fn encode<S: crate::types::encoding::EncodeSink>(&self, out: &mut S) {
                #encode_body
            }
        }

        impl #impl_generics crate::types::encoding::Decode for #name #ty_generics #where_clause {
            #[allow(unused_variables)]
            fn decode(
                input: &mut &[u8],
            ) -> ::std::result::Result<Self, crate::types::encoding::DecodeError> {
                #decode_body
            }
        }
    })
}

/// Binding pattern and constructor for one set of fields.
struct Shape {
    bindings: Vec<Ident>,
    pattern: TokenStream2,
    build: TokenStream2,
}

impl Shape {
    fn of(fields: &Fields) -> Self {
        let read = quote! { crate::types::encoding::Decode::decode(input)? };
        match fields {
            Fields::Named(named) => {
                let bindings: Vec<Ident> = named
                    .named
                    .iter()
                    .filter_map(|field| field.ident.clone())
                    .collect();
                let reads = bindings.iter().map(|_| &read);
                Shape {
                    pattern: quote! { { #(#bindings),* } },
                    build: quote! { { #(#bindings: #reads),* } },
                    bindings,
                }
            }
            Fields::Unnamed(unnamed) => {
                let bindings: Vec<Ident> = (0..unnamed.unnamed.len())
                    .map(|i| format_ident!("field_{}", i))
                    .collect();
                let reads = bindings.iter().map(|_| &read);
                Shape {
                    pattern: quote! { ( #(#bindings),* ) },
                    build: quote! { ( #(#reads),* ) },
                    bindings,
                }
            }
            Fields::Unit => Shape {
                bindings: Vec::new(),
                pattern: TokenStream2::new(),
                build: TokenStream2::new(),
            },
        }
    }

    fn writes(&self) -> TokenStream2 {
        let bindings = &self.bindings;
        quote! {
            #(crate::types::encoding::Encode::encode(#bindings, out);)*
        }
    }
}
