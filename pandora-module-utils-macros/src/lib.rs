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

//! # Macros for pandora-module-utils crate
//!
//! You normally shouldn’t use this crate directly but the `pandora-module-utils` crate instead.

mod derive_deserialize_map;
mod derive_request_filter;
mod merge_conf;
mod merge_opt;
mod utils;

use proc_macro::TokenStream;

/// This attribute macro merges the command-line arguments from all structs identified as field of
/// the current struct. The result will implement `clap::Parser` and `Debug` automatically. All
/// field types are required to implement `clap::Args` and `Debug`.
///
/// ```rust
/// use clap::Parser;
/// use pandora_module_utils::merge_opt;
/// use startup_module::StartupOpt;
///
/// #[derive(Debug, clap::Args)]
/// struct MyAppOpt {
///     /// Use to make the server roll over
///     #[clap(long)]
///     roll_over: bool,
/// }
///
/// /// Starts my great application.
/// #[merge_opt]
/// struct Opt {
///     app: MyAppOpt,
///     startup: StartupOpt,
/// }
///
/// let opt = Opt::parse_from(["app", "--roll-over", "--listen", "127.0.0.1:8080"]);
/// assert!(opt.app.roll_over);
/// assert_eq!(opt.startup.listen, Some(vec!["127.0.0.1:8080".into()]));
/// ```
#[proc_macro_attribute]
pub fn merge_opt(_args: TokenStream, input: TokenStream) -> TokenStream {
    merge_opt::merge_opt(input).unwrap_or_else(|err| err.into_compile_error().into())
}

/// This attribute macro merges the configuration settings from all structs identified as field of
/// the current struct. It’s essentially a shortcut for deriving `Debug`, `Default` and
/// `DeserializeMap` traits, the latter with all fields flattened. All field types are required to
/// implement `Debug`, `Default` and `DeserializeMap`.
///
/// ```rust
/// use pandora_module_utils::{merge_conf, DeserializeMap, FromYaml};
/// use startup_module::StartupConf;
///
/// #[derive(Debug, Default, Clone, PartialEq, Eq, DeserializeMap)]
/// struct MyAppConf {
///     /// If `true`, the server will roll over
///     roll_over: bool,
/// }
///
/// #[merge_conf]
/// struct Conf {
///     app: MyAppConf,
///     startup: StartupConf,
/// }
///
/// let conf = Conf::from_yaml(r#"
///     roll_over: true
///     listen: [127.0.0.1:8080]
/// "#).unwrap();
/// assert!(conf.app.roll_over);
/// assert_eq!(*conf.startup.listen, vec!["127.0.0.1:8080".into()]);
///
/// assert!(Conf::from_yaml(r#"
///     roll_over: true
///     unknown_field: flagged
/// "#).is_err());
/// ```
#[proc_macro_attribute]
pub fn merge_conf(_attr: TokenStream, input: TokenStream) -> TokenStream {
    merge_conf::merge_conf(input).unwrap_or_else(|err| err.into_compile_error().into())
}

/// This macro will automatically implement `RequestFilter` by chaining the handlers identified
/// in the struct’s fields.
///
/// Each handler has to implement `RequestFilter` trait. The handlers will be called in the order
/// in which they are listed:
///
/// * `early_request_filter` and `logging` run for all handlers.
/// * `request_filter` stops at the first handler returning `RequestFilterResult::ResponseSent` or
///   `RequestFilterResult::Handled`.
/// * `upstream_peer` stops at the first handler producing a peer.
/// * `response_filter` runs for all handlers.
///
/// The configuration and context for the struct will be implemented implicitly. These will have
/// the configuration/context of the respective handler in a field with the same name as the
/// handler in this struct. Unknown fields in the merged configuration cause an error during
/// deserialization.
#[proc_macro_derive(RequestFilter)]
pub fn derive_request_filter(input: TokenStream) -> TokenStream {
    derive_request_filter::derive_request_filter(input)
        .unwrap_or_else(|err| err.into_compile_error().into())
}

/// This macro will automatically implement `DeserializeMap`, `serde::Deserialize` and
/// `serde::DeserializeSeed` traits for a structure.
///
/// Unlike Serde’s usual deserialization, this approach is optimized for configuration files. It
/// allows an efficient implementation of the `flatten` attribute without intermediate storage.
/// Unknown fields are flagged automatically, effectively implying `deny_unknown_fields` attribute
/// which Serde does not support in combination with `flatten`. Merging multiple configurations
/// into a single data structure on the fly is also supported.
///
/// The structure has to implement `Default` which will be used as initial value for
/// `serde::Deserialize`. The following field attributes are supported, striving for
/// compatibility with the corresponding [Serde field attributes](https://serde.rs/field-attrs.html):
///
/// * `#[pandora(rename = "name")]` or `#[pandora(rename(deserialize = "name"))]`
///
///   Deserialize this field with the given name instead of its Rust name.
/// * `#[pandora(alias = "name")]`
///
///   Deserialize this field from the given name or from its Rust name. May be repeated.
/// * `#[pandora(flatten)]`
///
///   Flatten the contents of this field into the container it is defined in. Flattened fields
///   have to implement `DeserializeMap` and `Default`.
/// * `#[pandora(skip)]` or `#[pandora(skip_deserializing)]`
///
///   Skip this field when deserializing, always use the default value instead.
/// * `#[pandora(deserialize_with = "path")]`
///
///   Deserialize this field using a function callable as
///   `fn<'de, D>(D) -> Result<T, D::Error> where D: serde::Deserializer<'de>`.
/// * `#[pandora(with = "module")]`
///
///   Same as `deserialize_with` but `$module::deserialize` will be used as the function.
///
/// Unknown fields will cause a deserialization error, missing fields will be left at their initial
/// value.
///
/// ```rust
/// use pandora_module_utils::{DeserializeMap, FromYaml};
///
/// #[derive(Debug, Default, Clone, PartialEq, Eq, DeserializeMap)]
/// struct Conf {
///     value1: u32,
///     #[pandora(rename = "Value2")]
///     value2: String,
///     #[pandora(skip)]
///     value3: Option<bool>,
/// }
///
/// let conf = Conf::from_yaml(r#"
///     value1: 12
///     Value2: "Hi!"
/// "#).unwrap();
///
/// assert_eq!(conf.value1, 12);
/// assert_eq!(conf.value2, String::from("Hi!"));
/// assert!(conf.value3.is_none());
/// ```
#[proc_macro_derive(DeserializeMap, attributes(pandora))]
pub fn derive_deserialize_map(input: TokenStream) -> TokenStream {
    derive_deserialize_map::derive_deserialize_map(input)
        .unwrap_or_else(|err| err.into_compile_error().into())
}
