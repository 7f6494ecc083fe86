use std::collections::HashMap;

use axum::http::HeaderValue;

use crate::error::{GatewayError, Result};

/// Maps negotiated response formats to `Content-Type` values.
#[derive(Debug, Clone, Default)]
pub struct FormatRegistry {
    formats: HashMap<String, HeaderValue>,
}

impl FormatRegistry {
    /// An empty registry. Every format is rejected until registered.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry with the json and jsonp formats.
    pub fn with_defaults() -> Self {
        Self::empty()
            .register("json", HeaderValue::from_static("application/json"))
            .register("jsonp", HeaderValue::from_static("application/javascript"))
    }

    pub fn register(mut self, format: &str, content_type: HeaderValue) -> Self {
        self.formats.insert(format.to_ascii_lowercase(), content_type);
        self
    }

    pub fn content_type(&self, format: &str) -> Result<&HeaderValue> {
        self.formats
            .get(&format.to_ascii_lowercase())
            .ok_or_else(|| GatewayError::NotAcceptable(format.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_formats() {
        let formats = FormatRegistry::with_defaults();
        assert_eq!(formats.content_type("json").unwrap(), "application/json");
        assert_eq!(formats.content_type("JSONP").unwrap(), "application/javascript");
    }

    #[test]
    fn test_unknown_format_is_not_acceptable() {
        let formats = FormatRegistry::with_defaults();
        assert!(matches!(
            formats.content_type("xml"),
            Err(GatewayError::NotAcceptable(format)) if format == "xml"
        ));
    }

    #[test]
    fn test_register_custom_format() {
        let formats = FormatRegistry::empty()
            .register("xml", HeaderValue::from_static("application/xml"));
        assert_eq!(formats.content_type("xml").unwrap(), "application/xml");
        assert!(formats.content_type("json").is_err());
    }
}
