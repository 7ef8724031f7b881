/// Generate a random build ID: "b-" followed by 16 hex chars.
///
/// Uses a UUIDv4 for entropy (already a workspace dependency elsewhere),
/// truncated and hex-encoded rather than exposed as a UUID directly so the
/// id reads like the rest of imgforge's short, prefixed identifiers.
pub fn generate_build_id() -> String {
    let id = uuid::Uuid::new_v4();
    let bytes = id.as_bytes();
    format!(
        "b-{}",
        bytes[..8]
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<String>()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_build_id_shape() {
        let id = generate_build_id();
        assert!(id.starts_with("b-"));
        assert_eq!(id.len(), "b-".len() + 16);
        assert!(id[2..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_generate_build_id_unique() {
        let a = generate_build_id();
        let b = generate_build_id();
        assert_ne!(a, b);
    }
}
