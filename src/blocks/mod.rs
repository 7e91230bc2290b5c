//! AST-based partitioning of a source file into checksummed blocks.
//!
//! Every function or method body yields one `function` block; the whole
//! file, with each of those bodies elided, yields the `module` block. A
//! body edit therefore perturbs exactly one function checksum, while a
//! signature, attribute, or top-level edit perturbs the module checksum.
//!
//! Files the parser rejects degrade to a single block covering the whole
//! file, checksummed over the raw bytes, and are flagged unparseable so
//! any change to them invalidates every dependent test.

pub mod canonical;

use memchr::memchr_iter;
use proc_macro2::LineColumn;
use serde::{Deserialize, Serialize};

/// Whether a block is the file skeleton or one function body.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockKind {
    Module,
    Function,
}

/// A contiguous line range of a source file sharing one checksum.
/// Lines are 1-based and inclusive.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub start_line: u32,
    pub end_line: u32,
    pub kind: BlockKind,
    /// Dotted path from the file top level for function blocks
    /// (`cache.Tree.insert`); empty for the module block.
    pub qualified_name: String,
    pub checksum: u32,
}

/// The ordered blocks of one parsed source file: the module block first,
/// then function blocks in textual order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceModule {
    pub blocks: Vec<Block>,
    pub unparseable: bool,
}

impl SourceModule {
    /// Partition `text` into blocks. Never fails: files `syn` cannot
    /// parse degrade to a single whole-file block.
    pub fn extract(text: &str) -> SourceModule {
        let total_lines = text.lines().count().max(1) as u32;
        let file = match syn::parse_file(text) {
            Ok(file) => file,
            Err(err) => {
                tracing::debug!(error = %err, "degrading unparseable file to whole-file block");
                return SourceModule {
                    blocks: vec![Block {
                        start_line: 1,
                        end_line: total_lines,
                        kind: BlockKind::Module,
                        qualified_name: String::new(),
                        checksum: canonical::crc32(text.as_bytes()),
                    }],
                    unparseable: true,
                };
            }
        };

        let mut sites = Vec::new();
        let mut path = Vec::new();
        collect_fn_sites(&file.items, &mut path, &mut sites);

        let index = LineIndex::new(text);
        let mut sites: Vec<(usize, usize, FnSite)> = sites
            .into_iter()
            .map(|site| {
                let open_end = index.byte_offset(text, site.open_end);
                let close_start = index.byte_offset(text, site.close_start);
                (open_end, close_start, site)
            })
            .collect();
        sites.sort_by_key(|(open_end, _, _)| *open_end);

        // Module skeleton: body interiors swapped for a placeholder that
        // carries the function's name. Braces and signatures stay, so a
        // signature edit moves the module checksum and a body edit does not.
        let mut skeleton = String::with_capacity(text.len());
        let mut cursor = 0usize;
        for (open_end, close_start, site) in &sites {
            skeleton.push_str(&text[cursor..*open_end]);
            skeleton.push_str(&format!(" {} ", site.qualified_name));
            cursor = *close_start;
        }
        skeleton.push_str(&text[cursor..]);

        let mut blocks = Vec::with_capacity(sites.len() + 1);
        blocks.push(Block {
            start_line: 1,
            end_line: total_lines,
            kind: BlockKind::Module,
            qualified_name: String::new(),
            checksum: canonical::checksum(&skeleton),
        });
        for (_, _, site) in &sites {
            let start_line = site.open.line as u32;
            let end_line = site.close.line as u32;
            let body_text = index.line_range(text, start_line, end_line);
            blocks.push(Block {
                start_line,
                end_line,
                kind: BlockKind::Function,
                qualified_name: site.qualified_name.clone(),
                checksum: canonical::checksum(body_text),
            });
        }
        SourceModule {
            blocks,
            unparseable: false,
        }
    }

    /// The file skeleton block. Always present, always first.
    pub fn module_block(&self) -> &Block {
        &self.blocks[0]
    }

    /// Function blocks in textual order.
    pub fn function_blocks(&self) -> &[Block] {
        &self.blocks[1..]
    }

    /// All block checksums of the file, sorted and deduplicated: the
    /// "current" side of the match predicate.
    pub fn checksums(&self) -> Vec<u32> {
        let mut sums: Vec<u32> = self.blocks.iter().map(|b| b.checksum).collect();
        sums.sort_unstable();
        sums.dedup();
        sums
    }
}

struct FnSite {
    qualified_name: String,
    /// Position of the body `{`.
    open: LineColumn,
    /// Position just after the body `{`.
    open_end: LineColumn,
    /// Position of the body `}`.
    close: LineColumn,
    close_start: LineColumn,
}

impl FnSite {
    fn new(path: &[String], name: String, brace: &syn::token::Brace) -> FnSite {
        let qualified_name = if path.is_empty() {
            name
        } else {
            format!("{}.{}", path.join("."), name)
        };
        FnSite {
            qualified_name,
            open: brace.span.open().start(),
            open_end: brace.span.open().end(),
            close: brace.span.close().end(),
            close_start: brace.span.close().start(),
        }
    }
}

/// Walk items without entering function bodies, so nested functions stay
/// part of their enclosing block and blocks never overlap.
fn collect_fn_sites(items: &[syn::Item], path: &mut Vec<String>, out: &mut Vec<FnSite>) {
    for item in items {
        match item {
            syn::Item::Fn(f) => {
                out.push(FnSite::new(path, f.sig.ident.to_string(), &f.block.brace_token));
            }
            syn::Item::Mod(m) => {
                if let Some((_, nested)) = &m.content {
                    path.push(m.ident.to_string());
                    collect_fn_sites(nested, path, out);
                    path.pop();
                }
            }
            syn::Item::Impl(imp) => {
                path.push(type_ident(&imp.self_ty));
                for inner in &imp.items {
                    if let syn::ImplItem::Fn(m) = inner {
                        out.push(FnSite::new(path, m.sig.ident.to_string(), &m.block.brace_token));
                    }
                }
                path.pop();
            }
            syn::Item::Trait(t) => {
                path.push(t.ident.to_string());
                for inner in &t.items {
                    if let syn::TraitItem::Fn(m) = inner
                        && let Some(body) = &m.default
                    {
                        out.push(FnSite::new(path, m.sig.ident.to_string(), &body.brace_token));
                    }
                }
                path.pop();
            }
            _ => {}
        }
    }
}

/// Last path segment of an impl target type, `impl` when the type has no
/// usable name (trait objects, tuples).
fn type_ident(ty: &syn::Type) -> String {
    match ty {
        syn::Type::Path(p) => p
            .path
            .segments
            .last()
            .map(|seg| seg.ident.to_string())
            .unwrap_or_else(|| "impl".to_string()),
        syn::Type::Reference(r) => type_ident(&r.elem),
        _ => "impl".to_string(),
    }
}

/// Byte offsets of 1-based line starts, for translating parser
/// line/column positions into byte ranges of the original text.
struct LineIndex {
    starts: Vec<usize>,
}

impl LineIndex {
    fn new(text: &str) -> LineIndex {
        let mut starts = vec![0];
        starts.extend(memchr_iter(b'\n', text.as_bytes()).map(|pos| pos + 1));
        LineIndex { starts }
    }

    /// Byte offset of a parser position. Columns count UTF-8 characters.
    fn byte_offset(&self, text: &str, pos: LineColumn) -> usize {
        let base = match self.starts.get(pos.line - 1) {
            Some(base) => *base,
            None => return text.len(),
        };
        let line_end = self.starts.get(pos.line).copied().unwrap_or(text.len());
        let width: usize = text[base..line_end]
            .chars()
            .take(pos.column)
            .map(|c| c.len_utf8())
            .sum();
        base + width
    }

    /// Text of the inclusive 1-based line range.
    fn line_range<'a>(&self, text: &'a str, start_line: u32, end_line: u32) -> &'a str {
        let start = self
            .starts
            .get(start_line as usize - 1)
            .copied()
            .unwrap_or(text.len());
        let end = self.starts.get(end_line as usize).copied().unwrap_or(text.len());
        &text[start..end]
    }
}
