//! Response parsing for structured and image output

use serde::de::DeserializeOwned;

use super::ProviderError;

/// Image MIME types accepted from the provider
pub const ALLOWED_IMAGE_MIME_TYPES: [&str; 3] = ["image/png", "image/jpeg", "image/webp"];

/// Longest raw excerpt carried in an `Unparseable` error
const EXCERPT_LIMIT: usize = 200;

/// Decode structured output: bare JSON first, then the first fenced code block
pub fn parse_structured<T: DeserializeOwned>(raw: &str) -> Result<T, ProviderError> {
    let direct_err = match serde_json::from_str::<T>(raw.trim()) {
        Ok(value) => return Ok(value),
        Err(e) => e,
    };

    if let Some(block) = extract_fenced_block(raw) {
        match serde_json::from_str::<T>(block) {
            Ok(value) => return Ok(value),
            Err(e) => {
                return Err(ProviderError::Unparseable(format!(
                    "fenced block is not valid JSON ({}): {}",
                    e,
                    excerpt(raw)
                )))
            }
        }
    }

    Err(ProviderError::Unparseable(format!("{}: {}", direct_err, excerpt(raw))))
}

/// Contents of the first ``` fenced block, with any language tag removed
pub fn extract_fenced_block(raw: &str) -> Option<&str> {
    let open = raw.find("```")?;
    let after_fence = &raw[open + 3..];

    // The language tag (if any) runs to the end of the opening line
    let body_start = match after_fence.find('\n') {
        Some(newline) if after_fence[..newline].trim().chars().all(|c| c.is_ascii_alphanumeric()) => {
            newline + 1
        }
        _ => 0,
    };
    let body = &after_fence[body_start..];
    let close = body.find("```")?;
    let inner = body[..close].trim();

    if inner.is_empty() {
        None
    } else {
        Some(inner)
    }
}

/// Lowercase MIME type without parameters (`image/PNG; x=y` → `image/png`)
pub fn normalize_mime_type(mime_type: &str) -> String {
    mime_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

fn excerpt(raw: &str) -> String {
    let trimmed = raw.trim();
    match trimmed.char_indices().nth(EXCERPT_LIMIT) {
        Some((cut, _)) => format!("{}…", &trimmed[..cut]),
        None => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Setting {
        location: String,
        time_of_day: String,
    }

    fn expected() -> Setting {
        Setting {
            location: "harbor".to_string(),
            time_of_day: "dusk".to_string(),
        }
    }

    #[test]
    fn test_bare_and_fenced_parse_to_same_value() {
        let bare = r#"{"location": "harbor", "time_of_day": "dusk"}"#;
        let fenced = "Here is the setting:\n```json\n{\"location\": \"harbor\", \"time_of_day\": \"dusk\"}\n```\nEnjoy.";

        assert_eq!(parse_structured::<Setting>(bare).unwrap(), expected());
        assert_eq!(parse_structured::<Setting>(fenced).unwrap(), expected());
    }

    #[test]
    fn test_untagged_fence() {
        let fenced = "```\n{\"location\": \"harbor\", \"time_of_day\": \"dusk\"}\n```";
        assert_eq!(parse_structured::<Setting>(fenced).unwrap(), expected());
    }

    #[test]
    fn test_neither_is_unparseable() {
        let err = parse_structured::<Setting>("The scene is at a harbor at dusk.").unwrap_err();
        assert!(matches!(err, ProviderError::Unparseable(_)));
    }

    #[test]
    fn test_broken_fenced_json_is_unparseable() {
        let err = parse_structured::<Setting>("```json\n{\"location\": \n```").unwrap_err();
        assert!(matches!(err, ProviderError::Unparseable(_)));
    }

    #[test]
    fn test_wrong_shape_is_unparseable() {
        let err = parse_structured::<Setting>(r#"{"place": "harbor"}"#).unwrap_err();
        assert!(matches!(err, ProviderError::Unparseable(_)));
    }

    #[test]
    fn test_extract_single_line_fence() {
        assert_eq!(extract_fenced_block("```{\"a\":1}```"), Some("{\"a\":1}"));
        assert_eq!(extract_fenced_block("no fence here"), None);
        assert_eq!(extract_fenced_block("```json\n```"), None);
    }

    #[test]
    fn test_normalize_mime_type() {
        assert_eq!(normalize_mime_type("Image/PNG"), "image/png");
        assert_eq!(normalize_mime_type("image/webp; charset=binary"), "image/webp");
    }

    #[test]
    fn test_excerpt_truncates_long_output() {
        let long = "x".repeat(500);
        let err = parse_structured::<Setting>(&long).unwrap_err();
        match err {
            ProviderError::Unparseable(message) => assert!(message.len() < 400),
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
