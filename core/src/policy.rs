//! Static policy validation of submitted code.
//!
//! Two passes before any sandbox is provisioned: parse, then walk the syntax
//! tree rejecting disallowed imports, denied identifiers/attributes, and a
//! closed blocklist of free-function calls. For container-backed execution
//! the walk is advisory (the OS layer enforces isolation) and can be relaxed
//! by policy; for the subprocess backend it is the sole barrier and always
//! runs in full.

use tree_sitter::Node;
use tree_sitter::Parser;
use tree_sitter::Tree;

use crate::config::Policy;
use crate::error::ExecuteErr;
use crate::error::Result;

pub struct PolicyValidator {
    policy: Policy,
}

impl PolicyValidator {
    pub fn new(policy: Policy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Validate with full strictness. This is what the coordinator runs for
    /// every submission.
    pub fn validate(&self, code: &str) -> Result<()> {
        self.validate_inner(code, false)
    }

    /// Validate for a container-backed execution: when the policy marks the
    /// container set as relaxed, only imports are checked.
    pub fn validate_for_container(&self, code: &str) -> Result<()> {
        self.validate_inner(code, self.policy.container_relaxed)
    }

    fn validate_inner(&self, code: &str, relaxed: bool) -> Result<()> {
        let Some(tree) = parse_python(code) else {
            return Err(ExecuteErr::InvalidSyntax {
                line: 0,
                column: 0,
                message: "code could not be parsed".to_string(),
            });
        };

        if tree.root_node().has_error() {
            return Err(syntax_error(&tree));
        }

        self.walk(tree.root_node(), code, relaxed)
    }

    fn walk(&self, node: Node, src: &str, relaxed: bool) -> Result<()> {
        match node.kind() {
            "import_statement" => self.check_import_statement(node, src)?,
            "import_from_statement" => self.check_import_from(node, src)?,
            "call" if !relaxed => self.check_call(node, src)?,
            "attribute" if !relaxed => self.check_attribute(node, src)?,
            "identifier" if !relaxed => self.check_identifier(node, src)?,
            _ => {}
        }

        let mut cursor = node.walk();
        for child in node.named_children(&mut cursor) {
            self.walk(child, src, relaxed)?;
        }
        Ok(())
    }

    /// `import a.b, c as d` — every imported module's top-level name must be
    /// on the allow list.
    fn check_import_statement(&self, node: Node, src: &str) -> Result<()> {
        let mut cursor = node.walk();
        for child in node.named_children(&mut cursor) {
            let dotted = match child.kind() {
                "dotted_name" => Some(child),
                "aliased_import" => child.child_by_field_name("name"),
                _ => None,
            };
            if let Some(dotted) = dotted {
                self.check_module_allowed(dotted, src)?;
            }
        }
        Ok(())
    }

    /// `from a.b import c` — the source module's top-level name must be on
    /// the allow list. Relative imports have no module to check.
    fn check_import_from(&self, node: Node, src: &str) -> Result<()> {
        if let Some(module) = node.child_by_field_name("module_name")
            && module.kind() == "dotted_name"
        {
            self.check_module_allowed(module, src)?;
        }
        Ok(())
    }

    fn check_module_allowed(&self, dotted_name: Node, src: &str) -> Result<()> {
        let text = node_text(dotted_name, src);
        let top_level = text.split('.').next().unwrap_or(text);
        if !self.policy.allowed_imports.contains(top_level) {
            return Err(ExecuteErr::PolicyViolation(format!(
                "import of `{text}` is not allowed"
            )));
        }
        Ok(())
    }

    fn check_call(&self, node: Node, src: &str) -> Result<()> {
        if let Some(function) = node.child_by_field_name("function")
            && function.kind() == "identifier"
        {
            let name = node_text(function, src);
            if self.policy.blocked_calls.contains(name) {
                return Err(ExecuteErr::PolicyViolation(format!(
                    "call to `{name}` is not allowed"
                )));
            }
        }
        Ok(())
    }

    fn check_attribute(&self, node: Node, src: &str) -> Result<()> {
        if let Some(attribute) = node.child_by_field_name("attribute") {
            let name = node_text(attribute, src);
            if self.policy.denied_tokens.contains(name) {
                return Err(ExecuteErr::PolicyViolation(format!(
                    "attribute `{name}` is denied"
                )));
            }
        }
        Ok(())
    }

    fn check_identifier(&self, node: Node, src: &str) -> Result<()> {
        let name = node_text(node, src);
        if self.policy.denied_tokens.contains(name) {
            return Err(ExecuteErr::PolicyViolation(format!(
                "reference to `{name}` is denied"
            )));
        }
        Ok(())
    }
}

fn parse_python(code: &str) -> Option<Tree> {
    let lang = tree_sitter_python::LANGUAGE.into();
    let mut parser = Parser::new();
    #[expect(clippy::expect_used)]
    parser.set_language(&lang).expect("load python grammar");
    parser.parse(code, None)
}

fn node_text<'a>(node: Node, src: &'a str) -> &'a str {
    node.utf8_text(src.as_bytes()).unwrap_or_default()
}

/// Locate the first error or missing node and report its position, 1-based.
fn syntax_error(tree: &Tree) -> ExecuteErr {
    fn find_error(node: Node) -> Option<(usize, usize, String)> {
        if node.is_error() {
            let pos = node.start_position();
            return Some((pos.row + 1, pos.column, "invalid syntax".to_string()));
        }
        if node.is_missing() {
            let pos = node.start_position();
            return Some((pos.row + 1, pos.column, format!("missing {}", node.kind())));
        }
        let mut cursor = node.walk();
        for child in node.children(&mut cursor) {
            if let Some(found) = find_error(child) {
                return Some(found);
            }
        }
        None
    }

    let (line, column, message) = find_error(tree.root_node())
        .unwrap_or((0, 0, "invalid syntax".to_string()));
    ExecuteErr::InvalidSyntax {
        line,
        column,
        message,
    }
}
