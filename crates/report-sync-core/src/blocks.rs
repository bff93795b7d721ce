//! Markdown to content-block rendering and structural validation.
//!
//! The renderer is deliberately small: headings, list items, quotes,
//! dividers, fenced code, pipe tables and paragraphs. Inline markup is kept
//! as literal text.

use serde_json::{json, Value};

/// Maximum characters in one rich-text run accepted by the remote.
pub const MAX_RICH_TEXT_CHARS: usize = 2000;

/// One content block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Block {
    Heading { level: u8, text: String },
    Paragraph(String),
    Bulleted(String),
    Numbered(String),
    Quote(String),
    Code { language: String, text: String },
    Divider,
    Table {
        table_width: usize,
        has_column_header: bool,
        rows: Vec<Vec<String>>,
    },
}

impl Block {
    /// Remote block object for a create request.
    pub fn to_json(&self) -> Value {
        match self {
            Block::Heading { level, text } => {
                let kind = match level {
                    1 => "heading_1",
                    2 => "heading_2",
                    _ => "heading_3",
                };
                text_block(kind, text)
            }
            Block::Paragraph(text) => text_block("paragraph", text),
            Block::Bulleted(text) => text_block("bulleted_list_item", text),
            Block::Numbered(text) => text_block("numbered_list_item", text),
            Block::Quote(text) => text_block("quote", text),
            Block::Code { language, text } => json!({
                "object": "block",
                "type": "code",
                "code": {
                    "rich_text": rich_text(text),
                    "language": if language.is_empty() { "plain text" } else { language.as_str() },
                }
            }),
            Block::Divider => json!({ "object": "block", "type": "divider", "divider": {} }),
            Block::Table {
                table_width,
                has_column_header,
                rows,
            } => {
                let children: Vec<Value> = rows
                    .iter()
                    .map(|row| {
                        let cells: Vec<Value> =
                            row.iter().map(|cell| Value::Array(rich_text(cell))).collect();
                        json!({
                            "object": "block",
                            "type": "table_row",
                            "table_row": { "cells": cells }
                        })
                    })
                    .collect();
                json!({
                    "object": "block",
                    "type": "table",
                    "table": {
                        "table_width": table_width,
                        "has_column_header": has_column_header,
                        "has_row_header": false,
                        "children": children,
                    }
                })
            }
        }
    }
}

fn text_block(kind: &str, text: &str) -> Value {
    json!({
        "object": "block",
        "type": kind,
        kind: { "rich_text": rich_text(text) }
    })
}

/// Split text into rich-text runs that respect the per-run length limit.
pub fn rich_text(text: &str) -> Vec<Value> {
    if text.is_empty() {
        return Vec::new();
    }
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(MAX_RICH_TEXT_CHARS)
        .map(|chunk| {
            let content: String = chunk.iter().collect();
            json!({ "type": "text", "text": { "content": content } })
        })
        .collect()
}

/// Render a Markdown body into blocks.
pub fn render_markdown(body: &str) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut paragraph: Vec<&str> = Vec::new();
    let lines: Vec<&str> = body.lines().collect();
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i];
        let trimmed = line.trim();

        if trimmed.is_empty() {
            flush_paragraph(&mut paragraph, &mut blocks);
            i += 1;
            continue;
        }

        if let Some(language) = trimmed.strip_prefix("```") {
            flush_paragraph(&mut paragraph, &mut blocks);
            let mut code = Vec::new();
            i += 1;
            while i < lines.len() && !lines[i].trim_start().starts_with("```") {
                code.push(lines[i]);
                i += 1;
            }
            blocks.push(Block::Code {
                language: language.trim().to_lowercase(),
                text: code.join("\n"),
            });
            i += 1;
            continue;
        }

        if trimmed.starts_with('|') {
            flush_paragraph(&mut paragraph, &mut blocks);
            let mut table_lines = Vec::new();
            while i < lines.len() && lines[i].trim().starts_with('|') {
                table_lines.push(lines[i].trim());
                i += 1;
            }
            blocks.push(parse_table(&table_lines));
            continue;
        }

        if matches!(trimmed, "---" | "***" | "___") {
            flush_paragraph(&mut paragraph, &mut blocks);
            blocks.push(Block::Divider);
            i += 1;
            continue;
        }

        if let Some(block) = parse_line_block(trimmed) {
            flush_paragraph(&mut paragraph, &mut blocks);
            blocks.push(block);
        } else {
            paragraph.push(trimmed);
        }
        i += 1;
    }

    flush_paragraph(&mut paragraph, &mut blocks);
    blocks
}

fn flush_paragraph(paragraph: &mut Vec<&str>, blocks: &mut Vec<Block>) {
    if !paragraph.is_empty() {
        blocks.push(Block::Paragraph(paragraph.join("\n")));
        paragraph.clear();
    }
}

fn parse_line_block(line: &str) -> Option<Block> {
    let hashes = line.chars().take_while(|c| *c == '#').count();
    if hashes > 0 && line[hashes..].starts_with(' ') {
        return Some(Block::Heading {
            level: hashes.min(3) as u8,
            text: line[hashes..].trim().to_string(),
        });
    }

    for marker in ["- ", "* ", "+ "] {
        if let Some(text) = line.strip_prefix(marker) {
            return Some(Block::Bulleted(text.trim().to_string()));
        }
    }

    let digits = line.chars().take_while(char::is_ascii_digit).count();
    if digits > 0 {
        if let Some(text) = line[digits..].strip_prefix(". ") {
            return Some(Block::Numbered(text.trim().to_string()));
        }
    }

    if let Some(text) = line.strip_prefix('>') {
        return Some(Block::Quote(text.trim().to_string()));
    }

    None
}

fn split_cells(line: &str) -> Vec<String> {
    let inner = line.trim().trim_start_matches('|');
    let inner = inner.strip_suffix('|').unwrap_or(inner);
    inner.split('|').map(|c| c.trim().to_string()).collect()
}

fn is_separator_row(cells: &[String]) -> bool {
    !cells.is_empty()
        && cells.iter().all(|c| {
            let c = c.trim_matches(':');
            !c.is_empty() && c.chars().all(|ch| ch == '-')
        })
}

fn parse_table(lines: &[&str]) -> Block {
    let mut rows = Vec::new();
    let mut has_column_header = false;

    for (index, line) in lines.iter().enumerate() {
        let cells = split_cells(line);
        if is_separator_row(&cells) {
            if index == 1 {
                has_column_header = true;
            }
            continue;
        }
        rows.push(cells);
    }

    // The header row declares the width
    let table_width = rows.first().map(Vec::len).unwrap_or(0);
    Block::Table {
        table_width,
        has_column_header,
        rows,
    }
}

/// Report structural problems the remote would reject.
///
/// Rows below the header are numbered from 0.
pub fn validate_blocks(blocks: &[Block]) -> Vec<String> {
    let mut errors = Vec::new();
    for block in blocks {
        if let Block::Table {
            table_width, rows, ..
        } = block
        {
            let Some((header, body)) = rows.split_first().filter(|_| *table_width > 0) else {
                errors.push("Table has no cells".to_string());
                continue;
            };
            if header.len() != *table_width {
                errors.push(format!(
                    "Table header has {} cells but table_width is {}",
                    header.len(),
                    table_width
                ));
            }
            for (index, row) in body.iter().enumerate() {
                if row.len() != *table_width {
                    errors.push(format!(
                        "Table row {} has {} cells but table_width is {}",
                        index,
                        row.len(),
                        table_width
                    ));
                }
            }
        }
    }
    errors
}

/// Pad short table rows and cut long ones so every row matches its width.
pub fn normalize_tables(blocks: &mut [Block]) -> usize {
    let mut fixed = 0;
    for block in blocks.iter_mut() {
        if let Block::Table {
            table_width, rows, ..
        } = block
        {
            for row in rows.iter_mut() {
                if row.len() != *table_width {
                    row.resize(*table_width, String::new());
                    fixed += 1;
                }
            }
        }
    }
    fixed
}
