// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Test attribute macro for `test_with_tracing` crate.

use quote::quote;
use syn::Error;
use syn::ItemFn;
use syn::parse_macro_input;
use syn::spanned::Spanned;

/// Attribute macro on tests that have tracing output.
///
/// This attribute macro acts just like the `#[test]` attribute except that it
/// first initializes the `tracing` crate, and runs the body inside a `test`
/// span carrying the test's name.
#[proc_macro_attribute]
pub fn test(
    _attr: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    let item = parse_macro_input!(item as ItemFn);
    make_test(item)
        .unwrap_or_else(|err| err.to_compile_error())
        .into()
}

fn make_test(item: ItemFn) -> syn::Result<proc_macro2::TokenStream> {
    if item.sig.asyncness.is_some() {
        return Err(Error::new(
            item.sig.fn_token.span(),
            "test function must not be async; drive the future inside the test",
        ));
    }
    if !item.sig.inputs.is_empty() {
        return Err(Error::new(item.sig.inputs.span(), "expected 0 arguments"));
    }

    let name = &item.sig.ident;
    let test_name = name.to_string();
    let return_type = &item.sig.output;
    let attrs = &item.attrs;

    Ok(quote! {
        #[::core::prelude::v1::test]
        #(#attrs)*
        fn #name() #return_type {
            #item
            ::test_with_tracing::run(#test_name, #name)
        }
    })
}
