//! Test attributes that fail a test once it runs past a deadline instead of
//! letting it hang the whole suite.
//!
//! ```ignore
//! #[test_timeout::timeout]
//! fn sync_case() { /* ... */ }
//!
//! #[test_timeout::tokio_timeout_test(10)]
//! async fn async_case() { /* ... */ }
//! ```
//!
//! The optional argument is the deadline in seconds (default 60).

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt};

const DEFAULT_DEADLINE_SECS: u64 = 60;

#[derive(Clone, Copy)]
enum Flavor {
    Sync,
    Tokio,
}

/// Deadline for a synchronous `#[test]`.
#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let function = parse_macro_input!(item as ItemFn);
    expand(attr, function, Flavor::Sync)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

/// Deadline for an `async` test, driven on a current-thread Tokio runtime.
/// Replaces `#[tokio::test]`; a stray one on the same function is dropped.
#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let function = parse_macro_input!(item as ItemFn);
    expand(attr, function, Flavor::Tokio)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

fn expand(attr: TokenStream, function: ItemFn, flavor: Flavor) -> syn::Result<TokenStream2> {
    let deadline = deadline_secs(attr)?;
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = function;

    let body = match (flavor, sig.asyncness.take()) {
        (Flavor::Sync, None) => quote! { (|| #block)() },
        (Flavor::Tokio, Some(_)) => quote! {
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to build Tokio runtime")
                .block_on(async move {
                    tokio::time::timeout(__deadline, async move #block)
                        .await
                        .expect("test timed out")
                })
        },
        (Flavor::Sync, Some(_)) => {
            return Err(syn::Error::new_spanned(
                &sig.ident,
                "`timeout` expects a synchronous test; use `tokio_timeout_test` for async tests",
            ))
        }
        (Flavor::Tokio, None) => {
            return Err(syn::Error::new_spanned(
                &sig.ident,
                "`tokio_timeout_test` can only be applied to async functions",
            ))
        }
    };

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_test_marker(attr))
        .collect();

    Ok(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let __deadline = ::std::time::Duration::from_secs(#deadline);
            let (__report, __outcome) = ::std::sync::mpsc::channel();
            ::std::thread::spawn(move || {
                let result = ::std::panic::catch_unwind(::std::panic::AssertUnwindSafe(|| {
                    #body;
                }));
                let _ = __report.send(result);
            });
            match __outcome.recv_timeout(__deadline) {
                Ok(Ok(())) => {}
                Ok(Err(payload)) => ::std::panic::resume_unwind(payload),
                Err(::std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("test timed out after {}s", #deadline)
                }
                Err(::std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread exited without reporting a result")
                }
            }
        }
    })
}

fn deadline_secs(attr: TokenStream) -> syn::Result<u64> {
    if attr.is_empty() {
        return Ok(DEFAULT_DEADLINE_SECS);
    }
    let literal: LitInt = syn::parse(attr)?;
    let secs: u64 = literal.base10_parse()?;
    if secs == 0 {
        return Err(syn::Error::new_spanned(
            literal,
            "timeout must be greater than zero",
        ));
    }
    Ok(secs)
}

/// `#[test]` or `#[tokio::test]`, both of which the generated code replaces.
fn is_test_marker(attr: &Attribute) -> bool {
    let path = attr.path();
    if path.is_ident("test") {
        return true;
    }
    let mut segments = path.segments.iter().map(|segment| &segment.ident);
    matches!(
        (segments.next(), segments.next(), segments.next()),
        (Some(first), Some(second), None) if first == "tokio" && second == "test"
    )
}
