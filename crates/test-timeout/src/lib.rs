use proc_macro::TokenStream;
use quote::quote;
use syn::parse::Parser;
use syn::punctuated::Punctuated;
use syn::{Attribute, Expr, ExprLit, ItemFn, Lit, Token};

struct TestOptions {
    timeout_secs: u64,
    paused: bool,
}

impl Default for TestOptions {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            paused: false,
        }
    }
}

fn parse_options(attr: TokenStream) -> syn::Result<TestOptions> {
    let mut options = TestOptions::default();
    if attr.is_empty() {
        return Ok(options);
    }
    let parser = Punctuated::<Expr, Token![,]>::parse_terminated;
    for expr in parser.parse(attr)? {
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
                options.timeout_secs = secs;
            }
            Expr::Path(path) if path.path.is_ident("paused") => {
                options.paused = true;
            }
            other => {
                return Err(syn::Error::new_spanned(
                    other,
                    "expected a timeout in seconds or `paused`",
                ));
            }
        }
    }
    Ok(options)
}

/// Runs an async test on a current-thread Tokio runtime with a wall-clock
/// timeout.
///
/// `#[tokio_timeout_test(paused)]` starts the runtime with paused time so
/// timers advance deterministically; `#[tokio_timeout_test(10)]` overrides the
/// default 60 second budget. Both can be combined.
#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let options = match parse_options(attr) {
        Ok(options) => options,
        Err(err) => return err.to_compile_error().into(),
    };

    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = match syn::parse::<ItemFn>(item) {
        Ok(item) => item,
        Err(err) => return err.to_compile_error().into(),
    };

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }

    sig.asyncness = None;

    let filtered_attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_tokio_test_attribute(attr))
        .collect();

    let timeout = options.timeout_secs;
    let pause_clock = if options.paused {
        quote! { builder.start_paused(true); }
    } else {
        quote! {}
    };

    TokenStream::from(quote! {
        #[test]
        #(#filtered_attrs)*
        #vis #sig {
            let timeout_duration = std::time::Duration::from_secs(#timeout);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    let mut builder = tokio::runtime::Builder::new_current_thread();
                    builder.enable_all();
                    #pause_clock
                    let runtime = builder.build().expect("failed to build Tokio runtime");
                    runtime.block_on(async {
                        tokio::time::timeout(timeout_duration, async move #block)
                            .await
                            .expect("test timed out");
                    });
                }));
                let _ = sender.send(result);
            });
            match receiver.recv_timeout(timeout_duration + std::time::Duration::from_secs(1)) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread failed before reporting result")
                }
            }
        }
    })
}

fn is_tokio_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!(
        (segments.next(), segments.next(), segments.next()),
        (Some(first), Some(second), None)
            if first.ident == "tokio" && second.ident == "test"
    )
}
