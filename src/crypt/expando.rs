//-
// Copyright (c) 2020, Jason Lingle
//
// This file is part of Mailcrypt.
//
// Mailcrypt is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Mailcrypt is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for
// more details.
//
// You should have received a copy of the GNU General Public License along with
// Mailcrypt. If not, see <http://www.gnu.org/licenses/>.

//! Command templates.
//!
//! A template is literal text with `%x` placeholders. `%-10x` pads the value
//! to ten columns (left-justified with `-`), `%.5x` truncates it, `%%` is a
//! literal percent sign, and `%?x?then&else?` renders `then` if `x` has a
//! non-empty value and `else` (which may be omitted with its `&`) otherwise.
//! Branches may themselves contain placeholders.
//!
//! Templates are compiled once and can then be rendered any number of times.

use std::iter::Peekable;
use std::str::Chars;

#[derive(Clone, Debug, PartialEq, Eq)]
enum Node {
    Literal(String),
    Var {
        name: char,
        left: bool,
        width: usize,
        precision: Option<usize>,
    },
    Cond {
        name: char,
        then: Vec<Node>,
        otherwise: Vec<Node>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Template {
    nodes: Vec<Node>,
}

fn push_literal(nodes: &mut Vec<Node>, c: char) {
    if let Some(Node::Literal(ref mut s)) = nodes.last_mut() {
        s.push(c);
    } else {
        nodes.push(Node::Literal(c.to_string()));
    }
}

fn read_number(chars: &mut Peekable<Chars<'_>>) -> Option<usize> {
    let mut n: Option<usize> = None;
    while let Some(d) = chars.peek().and_then(|c| c.to_digit(10)) {
        chars.next();
        n = Some(n.unwrap_or(0).saturating_mul(10).saturating_add(d as usize));
    }
    n
}

/// Parse until end of input or one of `stops`, returning the terminator.
fn parse_seq(
    chars: &mut Peekable<Chars<'_>>,
    stops: &[char],
) -> (Vec<Node>, Option<char>) {
    let mut nodes = Vec::new();
    while let Some(c) = chars.next() {
        if stops.contains(&c) {
            return (nodes, Some(c));
        }
        if '%' != c {
            push_literal(&mut nodes, c);
            continue;
        }

        match chars.peek().copied() {
            None => push_literal(&mut nodes, '%'),
            Some('%') => {
                chars.next();
                push_literal(&mut nodes, '%');
            }
            Some('?') => {
                chars.next();
                let name = match chars.next() {
                    Some(n) => n,
                    None => break,
                };
                // The `?` after the name
                chars.next();
                let (then, term) = parse_seq(chars, &['&', '?']);
                let otherwise = if Some('&') == term {
                    parse_seq(chars, &['?']).0
                } else {
                    vec![]
                };
                nodes.push(Node::Cond {
                    name,
                    then,
                    otherwise,
                });
            }
            Some(_) => {
                let left = if Some(&'-') == chars.peek() {
                    chars.next();
                    true
                } else {
                    false
                };
                let width = read_number(chars).unwrap_or(0);
                let precision = if Some(&'.') == chars.peek() {
                    chars.next();
                    Some(read_number(chars).unwrap_or(0))
                } else {
                    None
                };
                match chars.next() {
                    Some(name) => nodes.push(Node::Var {
                        name,
                        left,
                        width,
                        precision,
                    }),
                    None => push_literal(&mut nodes, '%'),
                }
            }
        }
    }
    (nodes, None)
}

fn render_nodes(
    nodes: &[Node],
    vars: &dyn Fn(char) -> Option<String>,
    out: &mut String,
) {
    for node in nodes {
        match *node {
            Node::Literal(ref s) => out.push_str(s),
            Node::Var {
                name,
                left,
                width,
                precision,
            } => {
                let mut value = vars(name).unwrap_or_default();
                if let Some(max) = precision {
                    if let Some((ix, _)) = value.char_indices().nth(max) {
                        value.truncate(ix);
                    }
                }
                let pad = width.saturating_sub(value.chars().count());
                if left {
                    out.push_str(&value);
                    out.extend(std::iter::repeat(' ').take(pad));
                } else {
                    out.extend(std::iter::repeat(' ').take(pad));
                    out.push_str(&value);
                }
            }
            Node::Cond {
                name,
                ref then,
                ref otherwise,
            } => {
                if vars(name).map_or(false, |v| !v.is_empty()) {
                    render_nodes(then, vars, out);
                } else {
                    render_nodes(otherwise, vars, out);
                }
            }
        }
    }
}

impl Template {
    pub fn compile(src: &str) -> Self {
        Template {
            nodes: parse_seq(&mut src.chars().peekable(), &[]).0,
        }
    }

    /// Render with `vars` supplying the value of each placeholder. Unknown
    /// placeholders render as empty.
    pub fn render(&self, vars: &dyn Fn(char) -> Option<String>) -> String {
        let mut out = String::new();
        render_nodes(&self.nodes, vars, &mut out);
        out
    }

    /// Render with values from a fixed table.
    pub fn render_with(&self, table: &[(char, &str)]) -> String {
        self.render(&|c| {
            table
                .iter()
                .find(|&&(name, _)| name == c)
                .map(|&(_, v)| v.to_owned())
        })
    }
}

/// Quote `s` for safe inclusion in a `sh` command line.
pub fn quote_filename(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn placeholders() {
        let t = Template::compile("gpg --verify %s %f");
        assert_eq!(
            "gpg --verify 'a.asc' 'a'",
            t.render_with(&[('s', "'a.asc'"), ('f', "'a'")])
        );
        assert_eq!("100%", Template::compile("100%%").render_with(&[]));
        assert_eq!("x%", Template::compile("x%").render_with(&[]));
    }

    #[test]
    fn conditionals() {
        let t = Template::compile("gpg %?p?--passphrase-fd 0? %?a?-u %a&-n?");
        assert_eq!(
            "gpg --passphrase-fd 0 -u KEY",
            t.render_with(&[('p', "1"), ('a', "KEY")])
        );
        assert_eq!("gpg  -n", t.render_with(&[('p', "")]));
    }

    #[test]
    fn padding_and_precision() {
        let t = Template::compile("[%4n][%-6a][%.3s]");
        assert_eq!(
            "[   1][ab    ][xyz]",
            t.render_with(&[('n', "1"), ('a', "ab"), ('s', "xyzzy")])
        );
    }

    #[test]
    fn quoting() {
        assert_eq!("'it'\\''s'", quote_filename("it's"));
        assert_eq!("'/tmp/a b'", quote_filename("/tmp/a b"));
    }

    proptest! {
        #[test]
        fn renderer_never_panics(s in "\\PC*") {
            Template::compile(&s).render(&|c| Some(c.to_string()));
        }

        #[test]
        fn plain_text_is_verbatim(s in "[^%]*") {
            prop_assert_eq!(&s, &Template::compile(&s).render_with(&[]));
        }
    }
}
