//! Derives the soft-switch enumeration boilerplate for device-page handlers.
//!
//! A device that wants to publish its state through the soft-switch provider
//! interface would otherwise hand-write a `soft_switches()` method that lists
//! every named address it owns. `#[derive(SoftSwitches)]` generates that
//! method from `#[switch(..)]` attributes on the struct's boolean fields.

use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, Data, DeriveInput, Fields, LitInt, LitStr};

struct SwitchAttr {
    addr: LitInt,
    name: LitStr,
    desc: LitStr,
}

fn parse_switch_attr(attrs: &[syn::Attribute]) -> Option<SwitchAttr> {
    for attr in attrs {
        if !attr.path().is_ident("switch") {
            continue;
        }
        let mut addr = None;
        let mut name = None;
        let mut desc = None;
        let _ = attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("addr") {
                addr = Some(meta.value()?.parse::<LitInt>()?);
            } else if meta.path.is_ident("name") {
                name = Some(meta.value()?.parse::<LitStr>()?);
            } else if meta.path.is_ident("desc") {
                desc = Some(meta.value()?.parse::<LitStr>()?);
            }
            Ok(())
        });
        if let (Some(addr), Some(name), Some(desc)) = (addr, name, desc) {
            return Some(SwitchAttr { addr, name, desc });
        }
    }
    None
}

/// Generates `fn soft_switches(&self) -> Vec<(&'static str, u32, bool, &'static str)>`
/// from `#[switch(addr = .., name = .., desc = ..)]`-annotated boolean fields.
#[proc_macro_derive(SoftSwitches, attributes(switch))]
pub fn derive_soft_switches(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let ident = &input.ident;

    let Data::Struct(data) = &input.data else {
        panic!("SoftSwitches can only be derived for structs");
    };
    let Fields::Named(fields) = &data.fields else {
        panic!("SoftSwitches requires named fields");
    };

    let entries = fields.named.iter().filter_map(|field| {
        let switch = parse_switch_attr(&field.attrs)?;
        let field_ident = field.ident.as_ref().expect("named field");
        let SwitchAttr { addr, name, desc } = switch;
        Some(quote! {
            (#name, #addr, self.#field_ident, #desc)
        })
    });

    let expanded = quote! {
        impl #ident {
            /// Ordered `(symbolic_name, virtual_address, boolean_state, description)` tuples,
            /// in declaration order, for every field this type publishes as a soft switch.
            pub fn soft_switches(&self) -> ::std::vec::Vec<(&'static str, u32, bool, &'static str)> {
                ::std::vec![
                    #( #entries ),*
                ]
            }
        }
    };

    expanded.into()
}
