// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The `#[test]` attribute re-exported by `test_with_tracing`.

use quote::quote;
use syn::parse_macro_input;
use syn::spanned::Spanned;
use syn::Error;
use syn::ItemFn;

/// Marks a test that installs the `tracing` test subscriber before running.
///
/// Otherwise behaves like the built-in `#[test]`, including `Result` return
/// types and attributes such as `#[should_panic]`.
#[proc_macro_attribute]
pub fn test(
    _attr: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    let item = parse_macro_input!(item as ItemFn);
    expand(item)
        .unwrap_or_else(|err| err.to_compile_error())
        .into()
}

fn expand(item: ItemFn) -> syn::Result<proc_macro2::TokenStream> {
    if let Some(asyncness) = &item.sig.asyncness {
        return Err(Error::new(asyncness.span(), "tests must be synchronous"));
    }
    if !item.sig.inputs.is_empty() {
        return Err(Error::new(
            item.sig.inputs.span(),
            "tests take no arguments",
        ));
    }

    let name = &item.sig.ident;
    let output = &item.sig.output;
    let attrs = &item.attrs;

    Ok(quote! {
        #[::core::prelude::v1::test]
        #(#attrs)*
        fn #name() #output {
            #item
            ::test_with_tracing::init();
            #name()
        }
    })
}
