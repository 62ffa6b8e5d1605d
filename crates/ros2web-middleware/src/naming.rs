//! Topic and service name validation.
//!
//! Names follow the ROS 2 graph rules: tokens of ASCII alphanumerics and
//! underscores separated by `/`, optionally absolute (leading `/`) or
//! private (leading `~`).

use ros2web_types::BridgeError;

fn invalid(name: &str, reason: impl Into<String>) -> BridgeError {
    BridgeError::InvalidName {
        name: name.to_string(),
        reason: reason.into(),
    }
}

/// Validate a relative or absolute topic (or service) name.
pub fn validate_topic_name(name: &str) -> Result<(), BridgeError> {
    if name.is_empty() {
        return Err(invalid(name, "must not be empty"));
    }

    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '/' | '~')))
    {
        return Err(invalid(name, format!("contains invalid character {bad:?}")));
    }

    if let Some(pos) = name.rfind('~') {
        if pos != 0 {
            return Err(invalid(name, "'~' is only allowed at the start"));
        }
        if name.len() > 1 && !name[1..].starts_with('/') {
            return Err(invalid(name, "'~' must be followed by '/'"));
        }
    }

    if name.contains("//") {
        return Err(invalid(name, "must not contain repeated '/'"));
    }

    if name.ends_with('/') {
        return Err(invalid(name, "must not end with '/'"));
    }

    if name
        .split('/')
        .any(|token| token.starts_with(|c: char| c.is_ascii_digit()))
    {
        return Err(invalid(name, "tokens must not start with a digit"));
    }

    Ok(())
}

/// Validate a fully qualified (absolute) topic name.
pub fn validate_full_topic_name(name: &str) -> Result<(), BridgeError> {
    validate_topic_name(name)?;
    if !name.starts_with('/') {
        return Err(invalid(name, "must be absolute"));
    }
    Ok(())
}

/// Expand `name` against the root namespace of the node called `node_name`.
///
/// `chatter` and `/chatter` expand to the same name; `~/state` expands into
/// the node's private namespace.
pub fn expand_topic_name(name: &str, node_name: &str) -> String {
    if let Some(rest) = name.strip_prefix('~') {
        format!("/{node_name}{rest}")
    } else if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_relative_absolute_and_private_names() {
        for name in ["chatter", "/chatter", "/robot1/cmd_vel", "~/state", "~", "a_1/b_2"] {
            assert!(validate_topic_name(name).is_ok(), "{name} should be valid");
        }
    }

    #[test]
    fn rejects_empty_name() {
        assert!(matches!(
            validate_topic_name(""),
            Err(BridgeError::InvalidName { .. })
        ));
    }

    #[test]
    fn rejects_quotes_and_unicode() {
        assert!(validate_topic_name("'single_quoted'").is_err());
        assert!(validate_topic_name("\"double_quoted\"").is_err());
        assert!(validate_topic_name("\u{8bdd}\u{9898}").is_err());
    }

    #[test]
    fn rejects_structural_mistakes() {
        assert!(validate_topic_name("/a//b").is_err());
        assert!(validate_topic_name("/a/").is_err());
        assert!(validate_topic_name("/").is_err());
        assert!(validate_topic_name("/1st").is_err());
        assert!(validate_topic_name("a~b").is_err());
        assert!(validate_topic_name("~state").is_err());
    }

    #[test]
    fn full_names_must_be_absolute() {
        assert!(validate_full_topic_name("/chatter").is_ok());
        let err = validate_full_topic_name("chatter").unwrap_err();
        assert!(err.to_string().contains("absolute"));
    }

    #[test]
    fn expansion_roots_relative_names() {
        assert_eq!(expand_topic_name("chatter", "bridge"), "/chatter");
        assert_eq!(expand_topic_name("/chatter", "bridge"), "/chatter");
        assert_eq!(expand_topic_name("~/state", "bridge"), "/bridge/state");
    }
}
