use proc_macro::TokenStream;
use proc_macro2::{Span, TokenStream as TokenStream2};
use quote::{format_ident, quote};
use syn::{DeriveInput, Error, Result, parse_macro_input};

const EFFECTS: [&str; 3] = ["Pure", "Observe", "Mutate"];

/// Implements `tool_effects::Effectful` from an `#[effect(Pure|Observe|Mutate)]` attribute.
#[proc_macro_derive(Effectful, attributes(effect))]
pub fn derive_effectful(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    expand(&input)
        .unwrap_or_else(Error::into_compile_error)
        .into()
}

fn expand(input: &DeriveInput) -> Result<TokenStream2> {
    let variant = effect_variant(input)?;
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    Ok(quote! {
        impl #impl_generics tool_effects::Effectful for #name #ty_generics #where_clause {
            fn effect(&self) -> tool_effects::Effect {
                tool_effects::Effect::#variant
            }
        }
    })
}

/// Exactly one `#[effect(..)]` holding exactly one known class.
fn effect_variant(input: &DeriveInput) -> Result<syn::Ident> {
    let mut variant: Option<syn::Ident> = None;

    for attr in input.attrs.iter().filter(|a| a.path().is_ident("effect")) {
        if variant.is_some() {
            return Err(Error::new_spanned(attr, "duplicate #[effect(...)] attribute"));
        }
        attr.parse_nested_meta(|meta| {
            if variant.is_some() {
                return Err(meta.error("expected a single effect class"));
            }
            let ident = meta
                .path
                .get_ident()
                .ok_or_else(|| meta.error("expected Pure, Observe, or Mutate"))?;
            let name = ident.to_string();
            if !EFFECTS.contains(&name.as_str()) {
                return Err(meta.error(format!(
                    "unsupported effect `{name}`; expected {}",
                    EFFECTS.join(", ")
                )));
            }
            variant = Some(format_ident!("{}", name, span = ident.span()));
            Ok(())
        })?;
    }

    variant.ok_or_else(|| Error::new(Span::call_site(), "missing #[effect(...)] attribute"))
}
