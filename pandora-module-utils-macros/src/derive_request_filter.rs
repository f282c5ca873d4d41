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

use proc_macro::TokenStream;
use quote::{format_ident, quote};
use syn::{Data, DeriveInput, Error, Fields, Ident, Type};

/// Replaces the type of each field by an associated type of its `RequestFilter` implementation.
fn map_field_types(input: &mut DeriveInput, associated: &Ident) -> Result<(), Error> {
    if let Data::Struct(struct_) = &mut input.data {
        if let Fields::Named(fields) = &mut struct_.fields {
            for field in fields.named.iter_mut() {
                let ty = &field.ty;
                field.ty =
                    syn::parse2(quote!(<#ty as ::pandora_module_utils::RequestFilter>::#associated))?;
            }
        }
    }
    Ok(())
}

pub(crate) fn derive_request_filter(input: TokenStream) -> Result<TokenStream, Error> {
    let input: DeriveInput = syn::parse(input)?;

    let fields = match &input.data {
        Data::Struct(struct_) => {
            if let Fields::Named(fields) = &struct_.fields {
                fields
            } else {
                return Err(Error::new_spanned(
                    &struct_.fields,
                    "RequestFilter can only be derived for named fields",
                ));
            }
        }
        Data::Enum(enum_) => {
            return Err(Error::new_spanned(
                enum_.enum_token,
                "RequestFilter can only be derived for struct",
            ));
        }
        Data::Union(union_) => {
            return Err(Error::new_spanned(
                union_.union_token,
                "RequestFilter can only be derived for struct",
            ));
        }
    };

    if !input.generics.params.is_empty() {
        return Err(Error::new_spanned(
            &input.generics,
            "RequestFilter cannot be derived for generic structs",
        ));
    }

    let struct_name = &input.ident;

    // Produce merged handler configuration
    let mut conf = input.clone();
    conf.ident = format_ident!("{struct_name}Conf");
    conf.attrs.clear();
    map_field_types(&mut conf, &format_ident!("Conf"))?;
    let conf_name = &conf.ident;

    // Produce merged context
    let mut ctx = input.clone();
    ctx.ident = format_ident!("{struct_name}CTX");
    ctx.attrs.clear();
    map_field_types(&mut ctx, &format_ident!("CTX"))?;
    let ctx_name = &ctx.ident;

    let (field_names, field_types): (Vec<&Ident>, Vec<&Type>) = fields
        .named
        .iter()
        .filter_map(|field| field.ident.as_ref().map(|name| (name, &field.ty)))
        .unzip();

    Ok(quote! {
        #[::pandora_module_utils::merge_conf]
        #conf

        #ctx

        impl ::std::convert::TryFrom<#conf_name> for #struct_name {
            type Error = ::std::boxed::Box<::pandora_module_utils::pingora::Error>;

            fn try_from(conf: #conf_name) -> ::std::result::Result<Self, Self::Error> {
                #(
                    let #field_names = <#field_types>::try_from(conf.#field_names)?;
                )*
                ::std::result::Result::Ok(Self {
                    #( #field_names, )*
                })
            }
        }

        #[::pandora_module_utils::async_trait::async_trait]
        impl ::pandora_module_utils::RequestFilter for #struct_name {
            type Conf = #conf_name;
            type CTX = #ctx_name;

            fn new_ctx() -> Self::CTX {
                Self::CTX {
                    #( #field_names: <#field_types as ::pandora_module_utils::RequestFilter>::new_ctx(), )*
                }
            }

            async fn early_request_filter(
                &self,
                _session: &mut impl ::pandora_module_utils::pingora::SessionWrapper,
                _ctx: &mut Self::CTX,
            ) -> ::std::result::Result<(), ::std::boxed::Box<::pandora_module_utils::pingora::Error>> {
                #(
                    self.#field_names.early_request_filter(_session, &mut _ctx.#field_names).await?;
                )*
                ::std::result::Result::Ok(())
            }

            async fn request_filter(
                &self,
                _session: &mut impl ::pandora_module_utils::pingora::SessionWrapper,
                _ctx: &mut Self::CTX,
            ) -> ::std::result::Result<
                ::pandora_module_utils::RequestFilterResult,
                ::std::boxed::Box<::pandora_module_utils::pingora::Error>,
            > {
                #(
                    let result = self.#field_names.request_filter(_session, &mut _ctx.#field_names).await?;
                    if result != ::pandora_module_utils::RequestFilterResult::Unhandled {
                        return ::std::result::Result::Ok(result);
                    }
                )*
                ::std::result::Result::Ok(::pandora_module_utils::RequestFilterResult::Unhandled)
            }

            async fn upstream_peer(
                &self,
                _session: &mut impl ::pandora_module_utils::pingora::SessionWrapper,
                _ctx: &mut Self::CTX,
            ) -> ::std::result::Result<
                ::std::option::Option<::std::boxed::Box<::pandora_module_utils::pingora::HttpPeer>>,
                ::std::boxed::Box<::pandora_module_utils::pingora::Error>,
            > {
                #(
                    let result = self.#field_names.upstream_peer(_session, &mut _ctx.#field_names).await?;
                    if result.is_some() {
                        return ::std::result::Result::Ok(result);
                    }
                )*
                ::std::result::Result::Ok(::std::option::Option::None)
            }

            fn response_filter(
                &self,
                _session: &mut impl ::pandora_module_utils::pingora::SessionWrapper,
                _response: &mut ::pandora_module_utils::pingora::ResponseHeader,
                mut _ctx: ::std::option::Option<&mut Self::CTX>,
            ) {
                #(
                    self.#field_names.response_filter(
                        _session,
                        _response,
                        _ctx.as_mut().map(|ctx| &mut ctx.#field_names),
                    );
                )*
            }

            async fn logging(
                &self,
                _session: &mut impl ::pandora_module_utils::pingora::SessionWrapper,
                _e: ::std::option::Option<&::pandora_module_utils::pingora::Error>,
                _ctx: &mut Self::CTX,
            ) {
                #(
                    self.#field_names.logging(_session, _e, &mut _ctx.#field_names).await;
                )*
            }
        }
    }
    .into())
}
