//! Makefile-style dependency files, as written by `gcc -MMD -MF`.
//!
//! Only the subset compilers emit is understood: one or more rules of the
//! form "target...: dep...", with backslash-newline continuations and
//! backslash-escaped spaces.

use anyhow::bail;

#[derive(Debug, Default, PartialEq)]
pub struct Deps {
    pub targets: Vec<String>,
    /// Prerequisites of every rule, in file order.
    pub deps: Vec<String>,
}

struct Scanner<'a> {
    buf: &'a [u8],
    ofs: usize,
}

impl<'a> Scanner<'a> {
    fn peek(&self) -> Option<u8> {
        self.buf.get(self.ofs).copied()
    }

    fn peek_at(&self, n: usize) -> Option<u8> {
        self.buf.get(self.ofs + n).copied()
    }
}

fn is_space(c: Option<u8>) -> bool {
    matches!(c, None | Some(b' ' | b'\t' | b'\n' | b'\r'))
}

/// Skip spaces and backslashed newlines.
fn skip_spaces(scanner: &mut Scanner) {
    loop {
        match (scanner.peek(), scanner.peek_at(1), scanner.peek_at(2)) {
            (Some(b' ' | b'\t'), _, _) => scanner.ofs += 1,
            (Some(b'\\'), Some(b'\n'), _) => scanner.ofs += 2,
            (Some(b'\\'), Some(b'\r'), Some(b'\n')) => scanner.ofs += 3,
            _ => break,
        }
    }
}

/// Skip whole blank lines between rules.
fn skip_blank(scanner: &mut Scanner) {
    loop {
        skip_spaces(scanner);
        match scanner.peek() {
            Some(b'\n' | b'\r') => scanner.ofs += 1,
            _ => break,
        }
    }
}

fn read_path(scanner: &mut Scanner) -> anyhow::Result<Option<String>> {
    skip_spaces(scanner);
    let mut path = Vec::new();
    loop {
        match scanner.peek() {
            None | Some(b' ' | b'\t' | b'\n' | b'\r') => break,
            // A colon ends a target only when followed by a space; otherwise
            // it is part of a path, as in "c:/sdk/include".
            Some(b':') if is_space(scanner.peek_at(1)) => break,
            Some(b'\\') => match scanner.peek_at(1) {
                Some(c @ (b' ' | b'#')) => {
                    path.push(c);
                    scanner.ofs += 2;
                }
                Some(b'\n' | b'\r') => break,
                _ => {
                    path.push(b'\\');
                    scanner.ofs += 1;
                }
            },
            Some(b'$') if scanner.peek_at(1) == Some(b'$') => {
                path.push(b'$');
                scanner.ofs += 2;
            }
            Some(c) => {
                path.push(c);
                scanner.ofs += 1;
            }
        }
    }
    if path.is_empty() {
        return Ok(None);
    }
    Ok(Some(String::from_utf8(path)?))
}

pub fn parse(buf: &[u8]) -> anyhow::Result<Deps> {
    let mut scanner = Scanner { buf, ofs: 0 };
    let mut deps = Deps::default();
    loop {
        skip_blank(&mut scanner);
        if scanner.peek().is_none() {
            break;
        }
        let before = deps.targets.len();
        while let Some(target) = read_path(&mut scanner)? {
            deps.targets.push(target);
        }
        if deps.targets.len() == before {
            bail!("expected file at offset {}", scanner.ofs);
        }
        if scanner.peek() != Some(b':') {
            bail!("expected ':' at offset {}", scanner.ofs);
        }
        scanner.ofs += 1;
        while let Some(dep) = read_path(&mut scanner)? {
            deps.deps.push(dep);
        }
        match scanner.peek() {
            None | Some(b'\n' | b'\r') => {}
            Some(c) => bail!("unexpected {:?} at offset {}", c as char, scanner.ofs),
        }
    }
    if deps.targets.is_empty() {
        bail!("no rules");
    }
    Ok(deps)
}
