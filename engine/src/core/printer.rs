//! Canonical printer: AST back to markup text.
//!
//! Parsing the printed form yields an AST equal to the original
//! (idempotence under re-parse). The printer also owns the `\<`/`\>`
//! escaping shared with the result formatter.

use std::fmt::Write;

use crate::core::ast::{CommandBlock, CommandSequence, ContainerBlock, GroupCommands};
use crate::core::token::Tag;

/// Escape unprotected angle brackets so the text survives re-lexing as
/// opaque content.
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '<' => out.push_str("\\<"),
            '>' => out.push_str("\\>"),
            _ => out.push(ch),
        }
    }
    out
}

/// Render a parsed sequence in canonical form.
pub fn print_sequence(sequence: &CommandSequence) -> String {
    let mut out = String::new();
    for (index, block) in sequence.blocks.iter().enumerate() {
        if index > 0 {
            out.push('\n');
        }
        print_block(block, &mut out);
        out.push('\n');
    }
    out
}

fn print_block(block: &CommandBlock, out: &mut String) {
    match block {
        CommandBlock::Bash { content } => print_leaf(Tag::Bash, content, out),
        CommandBlock::Python { content } => print_leaf(Tag::Python, content, out),
        CommandBlock::Container(container) => print_container(container, out),
    }
}

fn print_leaf(tag: Tag, content: &str, out: &mut String) {
    let _ = write!(out, "<{0}>{1}</{0}>", tag.as_str(), escape(content));
}

fn print_container(container: &ContainerBlock, out: &mut String) {
    let kind = container.kind.as_str();
    let _ = write!(out, "<{kind}");
    for (name, value) in &container.attributes {
        let _ = write!(out, " {name}=\"{value}\"");
    }
    out.push_str(">\n");

    for group in &container.groups {
        let _ = writeln!(out, "<description>{}</description>", escape(&group.description));
        match &group.commands {
            GroupCommands::Raw(content) => {
                let _ = writeln!(out, "<commands>{}</commands>", escape(content));
            }
            GroupCommands::Block(block) => {
                print_block(block, out);
                out.push('\n');
            }
        }
        if !group.dependencies.is_empty() {
            let refs: Vec<String> = group
                .dependencies
                .iter()
                .map(ToString::to_string)
                .collect();
            let _ = writeln!(out, "<dependencies>{}</dependencies>", refs.join(", "));
        }
    }

    let _ = write!(out, "</{kind}>");
}
