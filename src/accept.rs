//! Accept header negotiation.
//!
//! Clients select an API version and response format through a vendor media
//! type such as `application/vnd.api.v2+json`. The standards tree (`vnd`) and
//! subtype (`api`) are fixed by configuration; the version and format are read
//! from the header or fall back to configured defaults.

use axum::http::{header, HeaderMap};
use regex::Regex;
use serde::Serialize;

use crate::error::{GatewayError, Result};

/// A negotiated vendor media type. `version` and `format` are never empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MediaType {
    pub identity: String,
    pub subtype: String,
    pub version: String,
    pub format: String,
}

impl MediaType {
    pub fn essence(&self) -> String {
        format!(
            "application/{}.{}.{}+{}",
            self.identity, self.subtype, self.version, self.format
        )
    }
}

/// Outcome of parsing an Accept header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Negotiation {
    /// The header matched the vendor grammar.
    Parsed(MediaType),
    /// The header was absent or did not match; defaults apply.
    Defaulted(MediaType),
    /// The header did not match and strict matching is enabled.
    Rejected,
}

impl Negotiation {
    pub fn into_result(self) -> Result<MediaType> {
        match self {
            Negotiation::Parsed(media_type) | Negotiation::Defaulted(media_type) => Ok(media_type),
            Negotiation::Rejected => Err(GatewayError::MalformedAccept),
        }
    }

    pub fn is_defaulted(&self) -> bool {
        matches!(self, Negotiation::Defaulted(_))
    }
}

#[derive(Debug, Clone)]
pub struct AcceptParser {
    identity: String,
    subtype: String,
    version: String,
    format: String,
    pattern: Regex,
}

impl AcceptParser {
    pub fn new(identity: &str, subtype: &str, version: &str, format: &str) -> Result<Self> {
        // Entries may be part of a comma separated list and carry parameters.
        let pattern = format!(
            r"(?:^|[\s,])(?i:application)/{}\.({})\.([A-Za-z0-9]+(?:[.\-][A-Za-z0-9]+)*)(?:\+([A-Za-z0-9]+))?(?:$|[\s,;])",
            regex::escape(identity),
            regex::escape(subtype),
        );
        let pattern = Regex::new(&pattern).map_err(|e| {
            GatewayError::Configuration(format!("Invalid Accept header pattern: {}", e))
        })?;

        Ok(Self {
            identity: identity.to_string(),
            subtype: subtype.to_string(),
            version: version.to_string(),
            format: format.to_string(),
            pattern,
        })
    }

    /// Parse a raw Accept header value.
    pub fn parse(&self, accept: Option<&str>, strict: bool) -> Negotiation {
        let captures = accept
            .filter(|value| !value.trim().is_empty())
            .and_then(|value| self.pattern.captures(value));

        match captures {
            Some(captures) => Negotiation::Parsed(MediaType {
                identity: self.identity.clone(),
                subtype: captures[1].to_string(),
                version: captures[2].to_string(),
                format: captures
                    .get(3)
                    .map_or_else(|| self.format.clone(), |m| m.as_str().to_string()),
            }),
            None if strict => Negotiation::Rejected,
            None => Negotiation::Defaulted(self.defaults()),
        }
    }

    /// Parse every Accept header present on a request.
    pub fn parse_headers(&self, headers: &HeaderMap, strict: bool) -> Negotiation {
        let values: Vec<&str> = headers
            .get_all(header::ACCEPT)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .collect();

        if values.is_empty() {
            return self.parse(None, strict);
        }

        self.parse(Some(&values.join(", ")), strict)
    }

    pub fn defaults(&self) -> MediaType {
        MediaType {
            identity: self.identity.clone(),
            subtype: self.subtype.clone(),
            version: self.version.clone(),
            format: self.format.clone(),
        }
    }
}
