use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;

/// Marks a test as requiring a live backend, such as a running Redis.
///
/// # Usage
/// ```ignore
/// #[live_test(redis)]
/// async fn test_name() {
///     // test body
/// }
/// ```
///
/// The test only runs when the environment variable `REDIS_LIVE_TESTS=true` is set.
/// All live tests are marked with `#[ignore]` by default.
#[proc_macro_attribute]
pub fn live_test(args: TokenStream, input: TokenStream) -> TokenStream {
    let backend = args.to_string().trim().to_string();

    let input_str = input.to_string();
    let fn_name = extract_function_name(&input_str);

    let env_var = format!("{}_LIVE_TESTS", backend.to_uppercase());
    let test_ident = quote::format_ident!("live_{}_{}", backend, fn_name);

    let is_async = input_str.trim_start().starts_with("async ");
    let async_token = if is_async { quote!(async) } else { quote!() };

    let body_start = input_str.find('{').unwrap_or(0);
    let body = &input_str[body_start..];
    let body_tokens: TokenStream2 = body.parse().unwrap_or_else(|_| quote!({}));

    let output = quote! {
        #[tokio::test]
        #[ignore]
        #async_token fn #test_ident() {
            if std::env::var(#env_var).unwrap_or_default() != "true" {
                eprintln!(
                    "Skipping {} live test '{}' - set {}=true to run",
                    #backend,
                    #fn_name,
                    #env_var
                );
                return;
            }

            eprintln!("Running live {} test: {}", #backend, #fn_name);

            #body_tokens
        }
    };

    TokenStream::from(output)
}

/// Extracts the function name without a full syntax tree parse.
fn extract_function_name(input: &str) -> String {
    if let Some(fn_pos) = input.find("fn ") {
        let after_fn = &input[fn_pos + 3..];
        let name_end = after_fn
            .find(|c: char| !c.is_alphanumeric() && c != '_')
            .unwrap_or(after_fn.len());
        after_fn[..name_end].to_string()
    } else {
        "unknown".to_string()
    }
}
