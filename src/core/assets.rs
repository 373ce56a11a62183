// Embedded default templates used by `asd init`.
// All include_str! paths are relative to this file.

pub const TEMPLATE_CONSTITUTION: &str = include_str!("../../assets/constitution.yaml");
pub const TEMPLATE_BOXSPEC: &str = include_str!("../../assets/boxspec.json");

pub fn get_template(name: &str) -> Option<&'static str> {
    match name {
        "constitution.yaml" => Some(TEMPLATE_CONSTITUTION),
        "boxspec.json" => Some(TEMPLATE_BOXSPEC),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_templates_resolve_and_are_nonempty() {
        for name in ["constitution.yaml", "boxspec.json"] {
            let content = get_template(name).expect("template should exist");
            assert!(!content.trim().is_empty());
        }
        assert!(get_template("missing.md").is_none());
    }

    #[test]
    fn test_boxspec_template_is_valid_json() {
        let value: serde_json::Value =
            serde_json::from_str(TEMPLATE_BOXSPEC).expect("valid json");
        assert_eq!(value["knowledgeBase"]["dir"], "AutoSnippet");
    }
}
