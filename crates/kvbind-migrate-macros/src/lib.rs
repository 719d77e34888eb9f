//! Proc macros for `kvbind-migrate`.
//!
//! - **`#[migration]`**: attribute macro that wraps a migration function into
//!   a `MigrationStep` implementation.

use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, punctuated::Punctuated, token::Comma, ItemFn, Meta};

/// Attribute macro that wraps a migration function into a `MigrationStep`.
///
/// The function takes the upgrade transaction and returns
/// `Result<(), E>` where `E` converts into `BoxError`. It may be `async`.
///
/// # Attributes
///
/// - `version = N`: **Required.** The version this step brings the store to.
/// - `name = "..."`: Optional. Label for logs; defaults to the function name.
///
/// # Generated Code
///
/// Creates a struct `{FnName}Migration` that implements `MigrationStep`,
/// and a `register_{fn_name}` function that returns it boxed for
/// `MigrationEngine::register`.
///
/// # Example
///
/// ```ignore
/// use kvbind_migrate::{migration, BoxError, UpgradeTransaction};
///
/// #[migration(version = 2)]
/// async fn create_readers(txn: &mut UpgradeTransaction) -> Result<(), BoxError> {
///     txn.create_collection("readers")?;
///     Ok(())
/// }
/// // Generates: CreateReadersMigration struct + impl MigrationStep
/// // Generates: fn register_create_readers() -> Box<dyn MigrationStep>
/// ```
#[proc_macro_attribute]
pub fn migration(attr: TokenStream, item: TokenStream) -> TokenStream {
    let input = parse_macro_input!(item as ItemFn);
    let args = parse_macro_input!(attr with Punctuated::<Meta, Comma>::parse_terminated);

    let mut version: Option<u32> = None;
    let mut name: Option<String> = None;

    for meta in &args {
        let Meta::NameValue(nv) = meta else {
            return syn::Error::new_spanned(meta, "expected `key = value`")
                .to_compile_error()
                .into();
        };
        let key = nv
            .path
            .get_ident()
            .map(|i| i.to_string())
            .unwrap_or_default();
        match (key.as_str(), &nv.value) {
            (
                "version",
                syn::Expr::Lit(syn::ExprLit {
                    lit: syn::Lit::Int(lit),
                    ..
                }),
            ) => match lit.base10_parse::<u32>() {
                Ok(0) | Err(_) => {
                    return syn::Error::new_spanned(lit, "`version` must be a positive u32")
                        .to_compile_error()
                        .into();
                }
                Ok(v) => version = Some(v),
            },
            (
                "name",
                syn::Expr::Lit(syn::ExprLit {
                    lit: syn::Lit::Str(lit),
                    ..
                }),
            ) => name = Some(lit.value()),
            ("version" | "name", value) => {
                return syn::Error::new_spanned(value, format!("unexpected value for `{key}`"))
                    .to_compile_error()
                    .into();
            }
            _ => {
                return syn::Error::new_spanned(&nv.path, format!("unknown attribute `{key}`"))
                    .to_compile_error()
                    .into();
            }
        }
    }

    let version = match version {
        Some(v) => v,
        None => {
            return syn::Error::new(
                proc_macro2::Span::call_site(),
                "missing required attribute `version`",
            )
            .to_compile_error()
            .into();
        }
    };

    if input.sig.inputs.len() != 1 {
        return syn::Error::new_spanned(
            &input.sig,
            "migration function must take exactly one argument: the upgrade transaction",
        )
        .to_compile_error()
        .into();
    }
    if matches!(input.sig.output, syn::ReturnType::Default) {
        return syn::Error::new_spanned(&input.sig, "migration function must return a Result")
            .to_compile_error()
            .into();
    }

    let fn_name = &input.sig.ident;
    let step_name = name.unwrap_or_else(|| fn_name.to_string());

    let call = if input.sig.asyncness.is_some() {
        quote! { #fn_name(txn).await }
    } else {
        quote! { #fn_name(txn) }
    };

    // snake_case -> PascalCase + "Migration"
    let struct_name = {
        let name = fn_name.to_string();
        let pascal: String = name
            .split('_')
            .map(|part| {
                let mut chars = part.chars();
                match chars.next() {
                    Some(c) => c.to_uppercase().collect::<String>() + chars.as_str(),
                    None => String::new(),
                }
            })
            .collect();
        syn::Ident::new(&format!("{pascal}Migration"), fn_name.span())
    };

    let register_fn = syn::Ident::new(&format!("register_{fn_name}"), fn_name.span());

    let expanded = quote! {
        #input

        /// Auto-generated migration step struct.
        pub struct #struct_name;

        #[::kvbind_migrate::async_trait]
        impl ::kvbind_migrate::MigrationStep for #struct_name {
            fn version(&self) -> u32 {
                #version
            }

            fn name(&self) -> &str {
                #step_name
            }

            async fn apply(
                &self,
                txn: &mut ::kvbind_migrate::UpgradeTransaction,
            ) -> ::core::result::Result<(), ::kvbind_migrate::BoxError> {
                #call.map_err(::core::convert::Into::into)
            }
        }

        /// Register this migration step for use with `MigrationEngine`.
        pub fn #register_fn() -> ::std::boxed::Box<dyn ::kvbind_migrate::MigrationStep> {
            ::std::boxed::Box::new(#struct_name)
        }
    };

    expanded.into()
}
