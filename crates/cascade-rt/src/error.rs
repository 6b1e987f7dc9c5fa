use serde_json::{json, Value};

pub fn error_body(message: &str) -> Value {
    json!({ "error": message })
}

pub fn not_found() -> Value {
    error_body("Not Found")
}

pub fn internal_error() -> Value {
    error_body("internal error")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_shape() {
        assert_eq!(not_found().to_string(), r#"{"error":"Not Found"}"#);
        assert_eq!(
            error_body("db open failed").to_string(),
            r#"{"error":"db open failed"}"#
        );
    }
}
