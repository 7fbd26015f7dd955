use crate::model::NodeKind;
use blake3::Hasher;

/// Compute a stable node ID from content only (NO LOCATIONS).
///
/// The id is derived from:
/// - `kind`: code element vs test case
/// - `name`: the element name as reported by the parser
/// - `file_path`: the workspace-relative path, already normalized
///
/// Line numbers are deliberately absent so that the same logical element keeps
/// its id across re-parses, which is what lets history and learned policy stay
/// attached to it.
///
/// # Format
///
/// `sikg_{16_hex_chars}`: the first 64 bits of the blake3 hash.
pub fn compute_node_id(kind: NodeKind, name: &str, file_path: &str) -> String {
    let mut hasher = Hasher::new();

    hasher.update(kind.as_str().as_bytes());
    hasher.update(b"\x00");
    hasher.update(name.as_bytes());
    hasher.update(b"\x00");
    hasher.update(file_path.as_bytes());

    let hash = hasher.finalize();
    format!("sikg_{}", &hash.to_hex()[..16])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_deterministic() {
        let id1 = compute_node_id(NodeKind::CodeElement, "Parser::parse", "src/parser.rs");
        let id2 = compute_node_id(NodeKind::CodeElement, "Parser::parse", "src/parser.rs");
        assert_eq!(id1, id2);
    }

    #[test]
    fn test_node_id_changes_with_kind() {
        let code = compute_node_id(NodeKind::CodeElement, "parse", "src/parser.rs");
        let test = compute_node_id(NodeKind::TestCase, "parse", "src/parser.rs");
        assert_ne!(code, test, "Ids should differ when kind changes");
    }

    #[test]
    fn test_node_id_changes_with_path() {
        let a = compute_node_id(NodeKind::CodeElement, "parse", "src/a.rs");
        let b = compute_node_id(NodeKind::CodeElement, "parse", "src/b.rs");
        assert_ne!(a, b);
    }

    #[test]
    fn test_separator_prevents_collisions() {
        // "ab" + "c" must not hash like "a" + "bc"
        let a = compute_node_id(NodeKind::CodeElement, "ab", "c");
        let b = compute_node_id(NodeKind::CodeElement, "a", "bc");
        assert_ne!(a, b);
    }

    #[test]
    fn test_equivalent_paths_share_id() {
        let a = crate::model::Node::new(NodeKind::TestCase, "test_login", "./tests\\auth.rs");
        let b = crate::model::Node::new(NodeKind::TestCase, "test_login", "tests/auth.rs");
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn test_node_id_format() {
        let id = compute_node_id(NodeKind::CodeElement, "main", "src/main.rs");
        assert!(id.starts_with("sikg_"));
        assert_eq!(id.len(), 21, "ID should be 'sikg_' + 16 hex chars");
        assert!(id[5..].chars().all(|c| c.is_ascii_hexdigit()));
    }
}
