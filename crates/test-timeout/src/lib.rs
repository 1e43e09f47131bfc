//! Test attributes that fail a test instead of letting it hang.
//!
//! `#[timeout]` wraps synchronous tests, `#[tokio_timeout_test]` wraps async
//! ones in a current-thread runtime. Both accept an optional limit in seconds
//! (default 60). The async form also accepts `paused`, which starts the
//! runtime with a paused clock so timer-driven code advances instantly.

use proc_macro2::TokenStream;
use quote::quote;
use syn::{
    parse::Parser, punctuated::Punctuated, Attribute, Expr, ExprLit, ItemFn, Lit, Token,
};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

struct TimeoutArgs {
    secs: u64,
    paused: bool,
}

fn parse_args(attr: TokenStream) -> syn::Result<TimeoutArgs> {
    let mut args = TimeoutArgs {
        secs: DEFAULT_TIMEOUT_SECS,
        paused: false,
    };

    let parser = Punctuated::<Expr, Token![,]>::parse_terminated;
    for expr in parser.parse2(attr)? {
        match &expr {
            Expr::Lit(ExprLit {
                lit: Lit::Int(lit), ..
            }) => {
                let secs: u64 = lit.base10_parse()?;
                if secs == 0 {
                    return Err(syn::Error::new_spanned(
                        lit,
                        "timeout must be greater than zero",
                    ));
                }
                args.secs = secs;
            }
            Expr::Path(path) if path.path.is_ident("paused") => args.paused = true,
            other => {
                return Err(syn::Error::new_spanned(
                    other,
                    "expected a timeout in seconds or `paused`",
                ))
            }
        }
    }

    Ok(args)
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(
    attr: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    expand_async(attr.into(), item.into())
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

#[proc_macro_attribute]
pub fn timeout(
    attr: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    expand_sync(attr.into(), item.into())
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

fn expand_async(attr: TokenStream, item: TokenStream) -> syn::Result<TokenStream> {
    let args = parse_args(attr)?;
    let mut test: ItemFn = syn::parse2(item)?;
    if test.sig.asyncness.is_none() {
        return Err(syn::Error::new_spanned(
            &test.sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        ));
    }
    test.sig.asyncness = None;

    let block = &test.block;
    // `start_paused` needs tokio's test-util feature, so only emit it on request.
    let clock = if args.paused {
        quote! { .start_paused(true) }
    } else {
        quote! {}
    };
    let limit = args.secs;
    let body = quote! {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            #clock
            .build()
            .expect("failed to build Tokio runtime");
        runtime.block_on(async {
            tokio::time::timeout(std::time::Duration::from_secs(#limit), async move #block)
                .await
                .expect("test timed out");
        });
    };
    Ok(watchdog(&test, args.secs, body))
}

fn expand_sync(attr: TokenStream, item: TokenStream) -> syn::Result<TokenStream> {
    let args = parse_args(attr)?;
    let test: ItemFn = syn::parse2(item)?;
    if test.sig.asyncness.is_some() {
        return Err(syn::Error::new_spanned(
            &test.sig.ident,
            "timeout expects a synchronous test; use tokio_timeout_test for async tests",
        ));
    }
    if args.paused {
        return Err(syn::Error::new_spanned(
            &test.sig.ident,
            "`paused` only applies to tokio_timeout_test",
        ));
    }

    let block = &test.block;
    Ok(watchdog(&test, args.secs, quote! { #block }))
}

/// Emits a `#[test]` that runs `body` on its own thread and fails once
/// `secs` pass without a result. Panics inside `body` are re-raised.
fn watchdog(test: &ItemFn, secs: u64, body: TokenStream) -> TokenStream {
    let attrs = test.attrs.iter().filter(|attr| !is_test_attribute(attr));
    let vis = &test.vis;
    let sig = &test.sig;

    quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let limit = std::time::Duration::from_secs(#secs);
            let (report, outcome) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let _ = report.send(std::panic::catch_unwind(
                    std::panic::AssertUnwindSafe(|| { #body }),
                ));
            });
            match outcome.recv_timeout(limit) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("test exceeded {}s", #secs)
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread exited without reporting")
                }
            }
        }
    }
}

/// Drops `#[test]` and `#[tokio::test]` so the generated `#[test]` is the only one.
fn is_test_attribute(attr: &Attribute) -> bool {
    let segments: Vec<String> = attr
        .path()
        .segments
        .iter()
        .map(|segment| segment.ident.to_string())
        .collect();
    matches!(
        segments.iter().map(String::as_str).collect::<Vec<_>>().as_slice(),
        ["test"] | ["tokio", "test"]
    )
}
