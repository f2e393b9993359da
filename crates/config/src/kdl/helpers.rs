//! Small accessors over KDL nodes.
//!
//! Options are written as child nodes with a single argument, e.g.
//! `email "admin@example.com"` inside an `acme { ... }` block.

use kdl::{KdlNode, KdlValue};

/// Find the first child node with the given name
pub fn get_child<'a>(node: &'a KdlNode, name: &str) -> Option<&'a KdlNode> {
    node.children()?
        .nodes()
        .iter()
        .find(|child| child.name().value() == name)
}

/// Positional (unnamed) arguments of a node
pub fn positional_args(node: &KdlNode) -> Vec<&KdlValue> {
    node.entries()
        .iter()
        .filter(|entry| entry.name().is_none())
        .map(|entry| entry.value())
        .collect()
}

/// First positional argument as a string
pub fn get_first_arg_string(node: &KdlNode) -> Option<String> {
    positional_args(node)
        .first()
        .and_then(|v| v.as_string())
        .map(str::to_string)
}

/// All positional arguments that are strings
pub fn get_string_args(node: &KdlNode) -> Vec<String> {
    positional_args(node)
        .into_iter()
        .filter_map(|v| v.as_string())
        .map(str::to_string)
        .collect()
}

/// String value of a child option
pub fn get_string_entry(node: &KdlNode, name: &str) -> Option<String> {
    get_child(node, name).and_then(get_first_arg_string)
}

/// Integer value of a child option
pub fn get_int_entry(node: &KdlNode, name: &str) -> Option<i64> {
    let child = get_child(node, name)?;
    let value = *positional_args(child).first()?;
    value.as_integer().and_then(|v| i64::try_from(v).ok())
}

/// Boolean value of a child option
pub fn get_bool_entry(node: &KdlNode, name: &str) -> Option<bool> {
    let child = get_child(node, name)?;
    let value = *positional_args(child).first()?;
    value.as_bool()
}

/// Render a value for error messages
pub fn display_value(value: &KdlValue) -> String {
    match value.as_string() {
        Some(s) => s.to_string(),
        None => value.to_string(),
    }
}
