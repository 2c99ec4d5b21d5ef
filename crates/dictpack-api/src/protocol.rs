use dictpack_core::CatalogError;
use serde::{Deserialize, Serialize};

use crate::registry::DEFAULT_CLIENT_ID;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolVersion {
    V1,
    V2,
}

impl ProtocolVersion {
    /// `"2"` selects V2; anything else, including no tag, is V1.
    #[must_use]
    pub fn from_query(tag: Option<&str>) -> Self {
        match tag {
            Some("2") => Self::V2,
            _ => Self::V1,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::V1 => "1",
            Self::V2 => "2",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "route", rename_all = "snake_case")]
pub enum CatalogRoute {
    WholeList { client_id: String },
    Metadata { client_id: String },
    /// V1 reuses this shape for payload requests, with the segment naming a word-list id.
    DictInfo { client_id: String, locale: String },
    Datafile { client_id: String, word_list_id: String },
}

impl CatalogRoute {
    /// Parse a request path (without leading slash) under `version`'s path grammar.
    ///
    /// # Errors
    /// Returns `CatalogError::Unsupported` for paths matching neither grammar.
    pub fn parse(version: ProtocolVersion, path: &str) -> Result<Self, CatalogError> {
        let path = path.trim_start_matches('/');
        match version {
            ProtocolVersion::V1 => parse_v1(path),
            ProtocolVersion::V2 => parse_v2(path),
        }
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        match self {
            Self::WholeList { client_id }
            | Self::Metadata { client_id }
            | Self::DictInfo { client_id, .. }
            | Self::Datafile { client_id, .. } => client_id,
        }
    }

    /// Word-list id addressed by a payload request (open or delete).
    #[must_use]
    pub fn payload_id(&self, version: ProtocolVersion) -> Option<&str> {
        match (version, self) {
            (ProtocolVersion::V1, Self::DictInfo { locale, .. }) => Some(locale),
            (ProtocolVersion::V2, Self::Datafile { word_list_id, .. }) => Some(word_list_id),
            _ => None,
        }
    }
}

fn parse_v1(path: &str) -> Result<CatalogRoute, CatalogError> {
    let client_id = DEFAULT_CLIENT_ID.to_string();
    match path {
        "" => Err(unsupported(ProtocolVersion::V1, path)),
        "list" => Ok(CatalogRoute::WholeList { client_id }),
        other if !other.contains('/') => {
            Ok(CatalogRoute::DictInfo { client_id, locale: other.to_string() })
        }
        other => Err(unsupported(ProtocolVersion::V1, other)),
    }
}

fn parse_v2(path: &str) -> Result<CatalogRoute, CatalogError> {
    let mut parts = path.splitn(3, '/');
    let client_id = parts.next().unwrap_or_default().to_string();
    let kind = parts.next();
    let rest = parts.next();

    match (kind, rest) {
        (Some("metadata"), None) => Ok(CatalogRoute::Metadata { client_id }),
        (Some("list"), None) => Ok(CatalogRoute::WholeList { client_id }),
        (Some("dict"), Some(locale)) if !locale.is_empty() => {
            Ok(CatalogRoute::DictInfo { client_id, locale: locale.to_string() })
        }
        (Some("datafile"), Some(word_list_id)) if !word_list_id.is_empty() => {
            Ok(CatalogRoute::Datafile { client_id, word_list_id: word_list_id.to_string() })
        }
        _ => Err(unsupported(ProtocolVersion::V2, path)),
    }
}

fn unsupported(version: ProtocolVersion, path: &str) -> CatalogError {
    CatalogError::Unsupported(format!("protocol {} has no route for {path:?}", version.as_str()))
}
