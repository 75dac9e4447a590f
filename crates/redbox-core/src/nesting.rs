//! Structural tag-nesting checks over a node path.
//!
//! Content-independent: only the tag names along the path are inspected.
//! The rule set is the subset of the HTML content model that browsers repair
//! during parsing, which is exactly when server markup and the client tree
//! stop lining up.

use serde::{Deserialize, Serialize};

use crate::signals::NodePath;

const BLOCK_IN_PARAGRAPH: &[&str] = &[
    "address",
    "article",
    "aside",
    "blockquote",
    "details",
    "dialog",
    "div",
    "dl",
    "fieldset",
    "figcaption",
    "figure",
    "footer",
    "form",
    "h1",
    "h2",
    "h3",
    "h4",
    "h5",
    "h6",
    "header",
    "hgroup",
    "hr",
    "main",
    "menu",
    "nav",
    "ol",
    "p",
    "pre",
    "section",
    "table",
    "ul",
];

const INTERACTIVE_IN_BUTTON: &[&str] = &["a", "button", "input", "select", "textarea"];

/// A tag-nesting rule violation found on a path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NestingViolation {
    pub parent: String,
    pub child: String,
    /// Index of `child` within the path's tag list.
    pub depth: usize,
    pub reason: String,
}

/// Return the first nesting violation along `path`, if any.
#[must_use]
pub fn check_path(path: &NodePath) -> Option<NestingViolation> {
    check_tags(&path.tag_names())
}

/// Same as [`check_path`] over a plain tag list (root first).
#[must_use]
pub fn check_tags(tags: &[String]) -> Option<NestingViolation> {
    for (depth, child) in tags.iter().enumerate() {
        let ancestors = &tags[..depth];
        let parent = ancestors.last();
        if let Some(reason) = violation_for(child, parent.map(String::as_str), ancestors) {
            return Some(NestingViolation {
                parent: parent.cloned().unwrap_or_default(),
                child: child.clone(),
                depth,
                reason,
            });
        }
    }
    None
}

fn violation_for(child: &str, parent: Option<&str>, ancestors: &[String]) -> Option<String> {
    let has_ancestor = |tag: &str| ancestors.iter().any(|a| a == tag);

    if BLOCK_IN_PARAGRAPH.contains(&child) && has_ancestor("p") {
        return Some(format!("<{child}> cannot be a descendant of <p>"));
    }
    if child == "a" && has_ancestor("a") {
        return Some("<a> cannot be a descendant of <a>".to_string());
    }
    if INTERACTIVE_IN_BUTTON.contains(&child) && has_ancestor("button") {
        return Some(format!("<{child}> cannot be a descendant of <button>"));
    }
    if child == "form" && has_ancestor("form") {
        return Some("<form> cannot be a descendant of <form>".to_string());
    }

    match child {
        "li" => match parent {
            Some("ul" | "ol" | "menu") | None => None,
            Some(other) => Some(format!("<li> cannot be a child of <{other}>")),
        },
        "tr" if parent == Some("table") => {
            Some("<tr> cannot be a child of <table>; wrap rows in <tbody>".to_string())
        }
        "td" | "th" => match parent {
            Some("tr") | None => None,
            Some(other) => Some(format!("<{child}> cannot be a child of <{other}>")),
        },
        "option" => match parent {
            Some("select" | "datalist" | "optgroup") | None => None,
            Some(other) => Some(format!("<option> cannot be a child of <{other}>")),
        },
        "html" if parent.is_some() => Some("<html> cannot be nested".to_string()),
        "head" | "body" => match parent {
            Some("html") | None => None,
            Some(other) => Some(format!("<{child}> cannot be a child of <{other}>")),
        },
        _ => None,
    }
}
