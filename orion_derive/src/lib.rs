//! Derive macros for the orion node crate.
//!
//! Provides `#[derive(BinaryCodec)]`, which implements the crate's canonical
//! `Encode` and `Decode` traits field by field.

mod binary_codec;

use proc_macro::TokenStream;

/// Implements `Encode` and `Decode` for structs and enums.
#[proc_macro_derive(BinaryCodec)]
pub fn derive_binary_codec(input: TokenStream) -> TokenStream {
    binary_codec::expand(input)
}
