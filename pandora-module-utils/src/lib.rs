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

//! # Module helpers
//!
//! This crate contains the infrastructure shared by Pandora Web Server modules: the
//! [`RequestFilter`] trait implemented by handlers, configuration loading via [`FromYaml`] and
//! [`DeserializeMap`], as well as the macros merging command line options, configurations and
//! handlers of multiple modules.

// Makes `::pandora_module_utils` paths generated by macros work within this crate as well
extern crate self as pandora_module_utils;

mod deserialize;
pub mod pingora;

use async_trait::async_trait;
use log::trace;
use serde::de::DeserializeSeed;
use std::fmt::Debug;
use std::path::Path;

pub use deserialize::{DeserializeMap, MapVisitor, OneOrMany, ServerConfVisitor};
pub use pandora_module_utils_macros::{merge_conf, merge_opt, DeserializeMap, RequestFilter};

#[doc(hidden)]
pub use deserialize::_private;

pub use async_trait;
pub use clap;
pub use serde;

use crate::pingora::{Error, ErrorType, HttpPeer, ResponseHeader, SessionWrapper};

/// Request filter result indicating how the current request should be processed further
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum RequestFilterResult {
    /// Response has been sent, no further processing should happen. Other Pingora phases should
    /// not be triggered.
    ResponseSent,

    /// Request has been handled and further request filters should not run. Response hasn’t been
    /// sent however, next Pingora phase should deal with that.
    Handled,

    /// Request filter could not handle this request, next request filter should run if it exists.
    #[default]
    Unhandled,
}

/// Trait to be implemented by request filters.
#[async_trait]
pub trait RequestFilter {
    /// Configuration type of this handler.
    type Conf;

    /// Per-request state of this handler, see [`pingora::ProxyHttp::CTX`]
    type CTX;

    /// Creates a new sate object, see [`pingora::ProxyHttp::new_ctx`]
    fn new_ctx() -> Self::CTX;

    /// Handler to run during Pingora’s `early_request_filter` state, see
    /// [`pingora::ProxyHttp::early_request_filter`].
    async fn early_request_filter(
        &self,
        _session: &mut impl SessionWrapper,
        _ctx: &mut Self::CTX,
    ) -> Result<(), Box<Error>>
    where
        Self::CTX: Send,
    {
        Ok(())
    }

    /// Handler to run during Pingora’s `request_filter` state, see
    /// [`pingora::ProxyHttp::request_filter`]. This uses a different return type to account
    /// for the existence of multiple request filters.
    async fn request_filter(
        &self,
        session: &mut impl SessionWrapper,
        ctx: &mut Self::CTX,
    ) -> Result<RequestFilterResult, Box<Error>>;

    /// Handler to run during Pingora’s `upstream_peer` state, see
    /// [`pingora::ProxyHttp::upstream_peer`]. Returning `None` lets the next handler choose the
    /// peer.
    async fn upstream_peer(
        &self,
        _session: &mut impl SessionWrapper,
        _ctx: &mut Self::CTX,
    ) -> Result<Option<Box<HttpPeer>>, Box<Error>>
    where
        Self::CTX: Send,
    {
        Ok(None)
    }

    /// Called for every response before it is sent, both for upstream responses and responses
    /// produced by handlers. The context is only available for upstream responses.
    fn response_filter(
        &self,
        _session: &mut impl SessionWrapper,
        _response: &mut ResponseHeader,
        _ctx: Option<&mut Self::CTX>,
    ) {
    }

    /// Handler to run during Pingora’s `logging` state, see [`pingora::ProxyHttp::logging`].
    async fn logging(
        &self,
        _session: &mut impl SessionWrapper,
        _e: Option<&Error>,
        _ctx: &mut Self::CTX,
    ) where
        Self::CTX: Send,
    {
    }
}

/// Trait for configuration structures that can be loaded from YAML files. This trait has a blanket
/// implementation for any structure implementing [`serde::de::DeserializeSeed`], configurations
/// loaded later are merged into the existing ones.
pub trait FromYaml {
    /// Loads configuration from a YAML string.
    fn from_yaml(yaml: &str) -> Result<Self, Box<Error>>
    where
        Self: Sized;

    /// Merges configuration from a YAML string into the current configuration.
    fn merge_from_yaml(self, yaml: &str) -> Result<Self, Box<Error>>
    where
        Self: Sized;

    /// Loads configuration from a YAML file.
    fn load_from_yaml(path: impl AsRef<Path>) -> Result<Self, Box<Error>>
    where
        Self: Sized;

    /// Merges configuration from a YAML file into the current configuration.
    fn merge_load_from_yaml(self, path: impl AsRef<Path>) -> Result<Self, Box<Error>>
    where
        Self: Sized;

    /// Loads configuration from multiple YAML files. File names can contain wildcards, all
    /// matching files are loaded in alphabetical order.
    fn load_from_files<I>(files: I) -> Result<Self, Box<Error>>
    where
        Self: Sized,
        I: IntoIterator,
        I::Item: AsRef<str>;
}

impl<D> FromYaml for D
where
    D: for<'de> DeserializeSeed<'de, Value = D> + Default + Debug,
{
    fn from_yaml(yaml: &str) -> Result<Self, Box<Error>> {
        Self::default().merge_from_yaml(yaml)
    }

    fn merge_from_yaml(self, yaml: &str) -> Result<Self, Box<Error>> {
        let deserializer = serde_yaml::Deserializer::from_str(yaml);
        let conf = self.deserialize(deserializer).map_err(|err| {
            Error::because(
                ErrorType::ReadError,
                "failed parsing configuration",
                err,
            )
        })?;
        trace!("Merged configuration: {conf:#?}");
        Ok(conf)
    }

    fn load_from_yaml(path: impl AsRef<Path>) -> Result<Self, Box<Error>> {
        Self::default().merge_load_from_yaml(path)
    }

    fn merge_load_from_yaml(self, path: impl AsRef<Path>) -> Result<Self, Box<Error>> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|err| {
            Error::because(
                ErrorType::FileReadError,
                format!("failed reading configuration file {}", path.display()),
                err,
            )
        })?;
        self.merge_from_yaml(&yaml)
            .map_err(|err| err.more_context(format!("in {}", path.display())))
    }

    fn load_from_files<I>(files: I) -> Result<Self, Box<Error>>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let mut conf = Self::default();
        for pattern in files {
            let pattern = pattern.as_ref();
            let paths = glob::glob(pattern).map_err(|err| {
                Error::because(
                    ErrorType::FileOpenError,
                    format!("invalid configuration file pattern {pattern}"),
                    err,
                )
            })?;

            let mut matched = false;
            for path in paths {
                let path = path.map_err(|err| {
                    Error::because(
                        ErrorType::FileOpenError,
                        "failed accessing configuration file",
                        err,
                    )
                })?;
                conf = conf.merge_load_from_yaml(path)?;
                matched = true;
            }

            if !matched {
                return Err(Error::explain(
                    ErrorType::FileOpenError,
                    format!("no configuration files matching {pattern}"),
                ));
            }
        }
        Ok(conf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;
    use std::path::PathBuf;
    use test_log::test;

    #[derive(Debug, Default, PartialEq, Eq, DeserializeMap)]
    struct Conf {
        name: String,
        values: Vec<u32>,
    }

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "pandora-module-utils-{name}-{}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn load_from_files_merges_in_order() {
        let dir = temp_dir("merge");
        fs::write(dir.join("1-first.yaml"), "name: first\nvalues: [1]\n").unwrap();
        fs::write(dir.join("2-second.yaml"), "name: second\nvalues: [2, 3]\n").unwrap();

        let pattern = dir.join("*.yaml");
        let conf = Conf::load_from_files([pattern.to_string_lossy()]).unwrap();
        assert_eq!(
            conf,
            Conf {
                name: "second".to_owned(),
                values: vec![1, 2, 3],
            }
        );

        let conf = Conf::load_from_files(Vec::<String>::new()).unwrap();
        assert_eq!(conf, Conf::default());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn load_errors() {
        let dir = temp_dir("errors");
        fs::write(dir.join("broken.yaml"), "name: [unterminated\n").unwrap();

        let missing = dir.join("missing.yaml");
        assert!(Conf::load_from_files([missing.to_string_lossy()]).is_err());
        assert!(Conf::load_from_yaml(&missing).is_err());

        let err = Conf::load_from_yaml(dir.join("broken.yaml")).unwrap_err();
        assert!(err.to_string().contains("broken.yaml"));

        let _ = fs::remove_dir_all(&dir);
    }
}
