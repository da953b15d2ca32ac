/// Base content type of a native gRPC message stream.
pub const CONTENT_TYPE_GRPC: &str = "application/grpc";

/// Base content type of a gRPC-Web message stream (trailers in the body).
pub const CONTENT_TYPE_GRPC_WEB: &str = "application/grpc-web";

/// Splits a content type at the first `+` into its base type and optional
/// subtype, e.g. `application/grpc+proto` into `("application/grpc",
/// Some("proto"))`.
pub fn split_content_type(content_type: &str) -> (&str, Option<&str>) {
    match content_type.split_once('+') {
        Some((base, subtype)) => (base, Some(subtype)),
        None => (content_type, None),
    }
}

/// True if the base content type is exactly `application/grpc`.
pub fn is_grpc_content_type(content_type: &str) -> bool {
    split_content_type(content_type).0 == CONTENT_TYPE_GRPC
}

/// True if the base content type is exactly `application/grpc-web`.
pub fn is_grpc_web_content_type(content_type: &str) -> bool {
    split_content_type(content_type).0 == CONTENT_TYPE_GRPC_WEB
}

/// Rewrites `application/grpc[+x]` to `application/grpc-web[+x]`. Returns
/// `None` when the input is not a gRPC content type.
pub fn grpc_to_web_content_type(content_type: &str) -> Option<String> {
    let (base, subtype) = split_content_type(content_type);
    if base != CONTENT_TYPE_GRPC {
        return None;
    }
    Some(with_subtype(CONTENT_TYPE_GRPC_WEB, subtype))
}

/// Rewrites `application/grpc-web[+x]` to `application/grpc[+x]`. Returns
/// `None` when the input is not a gRPC-Web content type.
pub fn web_to_grpc_content_type(content_type: &str) -> Option<String> {
    let (base, subtype) = split_content_type(content_type);
    if base != CONTENT_TYPE_GRPC_WEB {
        return None;
    }
    Some(with_subtype(CONTENT_TYPE_GRPC, subtype))
}

fn with_subtype(base: &str, subtype: Option<&str>) -> String {
    match subtype {
        Some(subtype) => format!("{base}+{subtype}"),
        None => base.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_with_and_without_subtype() {
        assert_eq!(
            split_content_type("application/grpc+proto"),
            ("application/grpc", Some("proto"))
        );
        assert_eq!(
            split_content_type("application/grpc"),
            ("application/grpc", None)
        );
    }

    #[test]
    fn rewrites_preserve_subtype() {
        assert_eq!(
            grpc_to_web_content_type("application/grpc+proto").as_deref(),
            Some("application/grpc-web+proto")
        );
        assert_eq!(
            web_to_grpc_content_type("application/grpc-web").as_deref(),
            Some("application/grpc")
        );
    }

    #[test]
    fn grpc_web_is_not_grpc() {
        // The base-type comparison must be exact, not a prefix match.
        assert!(!is_grpc_content_type("application/grpc-web"));
        assert!(is_grpc_content_type("application/grpc+thrift"));
        assert!(grpc_to_web_content_type("text/html").is_none());
        assert!(web_to_grpc_content_type("application/grpc").is_none());
    }
}
