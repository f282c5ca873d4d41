// Copyright 2024 Wladimir Palant
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use proc_macro2::{Span, TokenStream};
use quote::quote;
use syn::visit::Visit;
use syn::{
    Data, DataStruct, DeriveInput, Error, Field, Fields, FieldsNamed, GenericParam, Ident,
    Lifetime, LifetimeParam, Type, WhereClause,
};

pub(crate) fn get_fields(ty: &DeriveInput) -> Option<&FieldsNamed> {
    if let Data::Struct(DataStruct {
        fields: Fields::Named(fields),
        ..
    }) = &ty.data
    {
        Some(fields)
    } else {
        None
    }
}

pub(crate) fn get_fields_mut(ty: &mut DeriveInput) -> Option<&mut FieldsNamed> {
    if let Data::Struct(DataStruct {
        fields: Fields::Named(fields),
        ..
    }) = &mut ty.data
    {
        Some(fields)
    } else {
        None
    }
}

fn generic_names(ty: &DeriveInput) -> (Vec<Lifetime>, Vec<Ident>) {
    ty.generics.params.iter().fold(
        (Vec::new(), Vec::new()),
        |(mut lifetimes, mut idents), param| {
            match param {
                GenericParam::Lifetime(param) => lifetimes.push(param.lifetime.clone()),
                GenericParam::Type(param) => idents.push(param.ident.clone()),
                GenericParam::Const(param) => idents.push(param.ident.clone()),
            };
            (lifetimes, idents)
        },
    )
}

fn contains_generic(ty: &Type, lifetimes: &[Lifetime], idents: &[Ident]) -> bool {
    struct Visitor<'a> {
        result: bool,
        lifetimes: &'a [Lifetime],
        idents: &'a [Ident],
    }

    impl<'ast> Visit<'ast> for Visitor<'_> {
        fn visit_ident(&mut self, ident: &'ast Ident) {
            if self.idents.contains(ident) {
                self.result = true;
            }
        }

        fn visit_lifetime(&mut self, lifetime: &'ast Lifetime) {
            if self.lifetimes.contains(lifetime) {
                self.result = true;
            }
        }
    }

    let mut visitor = Visitor {
        result: false,
        lifetimes,
        idents,
    };
    visitor.visit_type(ty);
    visitor.result
}

fn strip_generic_value(param: &GenericParam) -> GenericParam {
    match param {
        GenericParam::Lifetime(p) => GenericParam::Lifetime(LifetimeParam::new(p.lifetime.clone())),
        GenericParam::Type(p) => GenericParam::Type(p.ident.clone().into()),
        GenericParam::Const(p) => GenericParam::Type(p.ident.clone().into()),
    }
}

/// Type name with its generic parameters but without bounds, e.g. `Conf<'a, T>`
pub(crate) fn type_name_short(ty: &DeriveInput) -> TokenStream {
    let name = &ty.ident;
    let (lifetimes, idents) = generic_names(ty);
    quote! {
        #name <#(#lifetimes,)* #(#idents,)*>
    }
}

/// Picks a name for the deserializer lifetime that doesn’t clash with the type’s own lifetimes.
fn find_de(ty: &DeriveInput) -> Lifetime {
    let mut de = Lifetime::new("'de", Span::call_site());
    let mut i = 1;
    while ty
        .generics
        .params
        .iter()
        .any(|param| matches!(param, GenericParam::Lifetime(param) if param.lifetime == de))
    {
        i += 1;
        de = Lifetime::new(&format!("'de{i}"), Span::call_site());
    }
    de
}

/// Returns the deserializer lifetime along with the generic parameters of the type prefixed by
/// it, once with bounds and once without.
pub(crate) fn generics_with_de(ty: &DeriveInput) -> (Lifetime, TokenStream, TokenStream) {
    let de = find_de(ty);

    let mut generics = ty.generics.params.clone();
    generics.insert(0, GenericParam::Lifetime(LifetimeParam::new(de.clone())));

    let mut generics_short = generics.clone();
    for param in generics_short.iter_mut() {
        *param = strip_generic_value(param);
    }

    (de, quote! {#generics}, quote! {#generics_short})
}

/// Produces the type’s where clause, extended by a bound for each field type depending on
/// generic parameters.
pub(crate) fn where_clause<F>(
    ty: &DeriveInput,
    fields: &FieldsNamed,
    field_bound: F,
) -> Result<WhereClause, Error>
where
    F: Fn(&Field) -> TokenStream,
{
    let mut where_clause = match &ty.generics.where_clause {
        Some(where_clause) => where_clause.clone(),
        None => syn::parse2(quote! {where})?,
    };

    let (lifetimes, idents) = generic_names(ty);
    for field in &fields.named {
        let field_type = &field.ty;
        if contains_generic(field_type, &lifetimes, &idents) {
            let bound = field_bound(field);
            where_clause
                .predicates
                .push(syn::parse2(quote! {#field_type: #bound})?);
        }
    }

    Ok(where_clause)
}
