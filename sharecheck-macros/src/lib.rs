//! Proc macros for the sharecheck acceptance harness
//!
//! Provides the `#[sharecheck::test]` attribute macro for live-cluster tests.

use proc_macro::TokenStream;
use quote::quote;
use syn::{FnArg, ItemFn, Pat, PatType, ReturnType};

/// Attribute macro for live-cluster share tests.
///
/// Sets up logging, reads `HarnessConfig` from the `SMBOP_TEST_*`
/// environment and injects the process-wide `TestClient` as `tc` (and the
/// configuration as `config`, when the function asks for it).
///
/// # Example
///
/// ```ignore
/// use sharecheck::{catalog, HarnessConfig, ScenarioRunner, SmbClientPod, TestClient};
///
/// #[sharecheck::test]
/// #[ignore] // Requires real cluster
/// async fn smbshare_suite(tc: &TestClient, config: HarnessConfig) {
///     let probe = SmbClientPod::new(tc, &config.namespace, &config.smbclient_pod);
///     ScenarioRunner::new(tc, &probe, &config)
///         .run_all(&catalog::smbshare_scenarios())
///         .await
///         .assert_passed();
/// }
/// ```
///
/// # With Result Return Type
///
/// ```ignore
/// #[sharecheck::test]
/// async fn test_with_result(tc: &TestClient) -> Result<(), Box<dyn std::error::Error>> {
///     let pods = tc.list_pods("default", &LabelSelector::for_service("tshare1")).await?;
///     Ok(())
/// }
/// ```
///
/// # What it does
///
/// 1. Initialize tracing output
/// 2. Load the configuration and connect the shared client
/// 3. Run the test body, catching panics and errors
/// 4. On failure: print namespace diagnostics, then fail the test
#[proc_macro_attribute]
pub fn test(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let input_fn = syn::parse_macro_input!(item as ItemFn);
    test_impl(&input_fn).into()
}

/// Check if a function has a parameter with the given name
fn has_param(input_fn: &ItemFn, name: &str) -> bool {
    input_fn.sig.inputs.iter().any(|arg| {
        if let FnArg::Typed(PatType { pat, .. }) = arg {
            if let Pat::Ident(ident) = pat.as_ref() {
                return ident.ident == name;
            }
        }
        false
    })
}

/// Inner implementation that works with `proc_macro2` types for testability
fn test_impl(input_fn: &ItemFn) -> proc_macro2::TokenStream {
    let fn_name = &input_fn.sig.ident;
    let fn_block = &input_fn.block;
    let fn_vis = &input_fn.vis;
    let fn_attrs = &input_fn.attrs;

    let wants_tc = has_param(input_fn, "tc");
    let wants_config = has_param(input_fn, "config");

    if !wants_tc && !wants_config {
        // Nothing to inject - just wrap with tokio::test
        return quote! {
            #(#fn_attrs)*
            #[tokio::test]
            #fn_vis async fn #fn_name() {
                ::sharecheck::telemetry::init_logging();
                #fn_block
            }
        };
    }

    let test_execution = match &input_fn.sig.output {
        ReturnType::Type(_, ty) => quote! {
            let result: #ty = (async #fn_block).await;
            result.map_err(|e| format!("{}", e))
        },
        ReturnType::Default => quote! {
            (async #fn_block).await;
            Ok::<(), String>(())
        },
    };

    quote! {
        #(#fn_attrs)*
        #[tokio::test]
        #fn_vis async fn #fn_name() {
            use ::sharecheck::__private::FutureExt;
            use ::std::panic::AssertUnwindSafe;

            ::sharecheck::telemetry::init_logging();
            let config = ::sharecheck::HarnessConfig::from_env()
                .unwrap_or_else(|e| panic!("Invalid harness configuration: {}", e));
            let tc: &'static ::sharecheck::TestClient = ::sharecheck::TestClient::shared(&config)
                .await
                .unwrap_or_else(|e| panic!("Failed to create test client: {}", e));
            let namespace = config.namespace.clone();

            // Run test and catch any panics
            let result = AssertUnwindSafe(async {
                #[allow(unused_variables)]
                let config = config.clone();
                #test_execution
            })
            .catch_unwind()
            .await;

            if !matches!(result, Ok(Ok(()))) {
                let diag = ::sharecheck::Diagnostics::collect(
                    tc,
                    &namespace,
                    &::sharecheck::LabelSelector::new(),
                    &[],
                )
                .await;
                eprintln!("{}", diag);
            }

            match result {
                Ok(Ok(())) => {}
                Ok(Err(message)) => panic!("{}", message),
                Err(panic_info) => ::std::panic::resume_unwind(panic_info),
            }
        }
    }
}
