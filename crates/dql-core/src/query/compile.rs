//! Query script compilation.
//!
//! A query script is Python whose last top-level statement is a bare
//! expression evaluating to the dataset to keep. Compilation rewrites that
//! expression into a call of the result hook, which saves the value and
//! reports its name back to the runner.

use tree_sitter::{Node, Parser};

use crate::errors::{CatalogError, CatalogResult};

/// Name the result hook is bound to inside the compiled script.
pub const RETURN_HOOK_ALIAS: &str = "__dql_return__";

/// Statement kinds that look like expressions but bind or mutate instead.
const NON_EXPRESSION_KINDS: &[&str] = &["assignment", "augmented_assignment"];

fn compile_error(message: impl Into<String>) -> CatalogError {
    CatalogError::QueryScriptCompile(message.into())
}

/// Last top-level statement, skipping trailing comments.
fn last_statement<'t>(root: &Node<'t>) -> Option<Node<'t>> {
    let mut cursor = root.walk();
    let last = root
        .named_children(&mut cursor)
        .filter(|n| n.kind() != "comment")
        .last();
    last
}

/// Rewrite `script` so its final expression is passed to `hook_module`'s
/// `return_ds`.
pub fn compile_query_script(script: &str, hook_module: &str) -> CatalogResult<String> {
    let mut parser = Parser::new();
    parser
        .set_language(&tree_sitter_python::LANGUAGE.into())
        .map_err(|e| compile_error(format!("Failed to load Python grammar: {e}")))?;
    let tree = parser
        .parse(script.as_bytes(), None)
        .ok_or_else(|| compile_error("Failed to parse query script"))?;
    let root = tree.root_node();
    if root.has_error() {
        let at = first_error(&root).map_or(0, |n| n.start_position().row + 1);
        return Err(compile_error(format!("Syntax error in query script at line {at}")));
    }

    let stmt = last_statement(&root).ok_or_else(|| compile_error("Query script is empty"))?;
    if stmt.kind() != "expression_statement" {
        return Err(compile_error(format!(
            "Last line in a script must be an expression, found {}",
            stmt.kind()
        )));
    }
    let mut cursor = stmt.walk();
    let parts: Vec<Node<'_>> = stmt.named_children(&mut cursor).collect();
    if let Some(kind) = parts
        .iter()
        .map(|n| n.kind())
        .find(|k| NON_EXPRESSION_KINDS.contains(k))
    {
        return Err(compile_error(format!(
            "Last line in a script must be an expression, found {kind}"
        )));
    }

    let expr = &script[stmt.start_byte()..stmt.end_byte()];
    // `a, b` is a tuple, not two arguments.
    let arg = if parts.len() > 1 {
        format!("({expr})")
    } else {
        expr.to_string()
    };
    // A trailing `;` terminates the rewritten statement too.
    let tail_start = match stmt.next_sibling() {
        Some(next) if next.kind() == ";" => next.end_byte(),
        _ => stmt.end_byte(),
    };
    Ok(format!(
        "{head}from {hook_module} import return_ds as {RETURN_HOOK_ALIAS}\n{RETURN_HOOK_ALIAS}({arg})\n{tail}",
        head = &script[..stmt.start_byte()],
        tail = &script[tail_start..],
    ))
}

fn first_error<'t>(node: &Node<'t>) -> Option<Node<'t>> {
    if node.is_error() || node.is_missing() {
        return Some(*node);
    }
    let mut cursor = node.walk();
    let children: Vec<Node<'t>> = node.children(&mut cursor).collect();
    children
        .iter()
        .filter(|c| c.has_error())
        .find_map(|c| first_error(c))
}
